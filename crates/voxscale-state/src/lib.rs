//! voxscale-state: data model and embedded state store.
//!
//! Backed by [redb](https://docs.rs/redb). Holds everything the control
//! loop publishes for operators (the ScalingTarget feed, health events,
//! queue snapshots, fleet state) and the inputs reported from outside
//! the loop (active-job signals, manual overrides).
//!
//! # Architecture
//!
//! Values are JSON-serialized into `&[u8]` columns. Feed tables use
//! `{owner}:{epoch:020}` keys so a prefix range scanned in reverse yields
//! newest-first results without a secondary index.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared between the control loop and the API server.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
