//! voxscale-fleet: the fleet controller.
//!
//! Reconciles the worker fleet toward the latest `ScalingTarget`:
//! scale-out is immediate (bounded by the provider's step limit), scale-in
//! waits for the fleet to go idle and for the scale-in cooldown, and the
//! oldest unprotected instances are terminated first.
//!
//! # Architecture
//!
//! ```text
//! ScalingTarget ──► FleetController::apply ──► FleetApi (HTTP / simulated)
//!                        │        ▲
//!                        │        └── ActiveJobTracker (store-backed, TTL)
//!                        ▼
//!                  HealthEvent (FleetChanged, CapacityShortfall, ...)
//!                        │
//!                        ▼
//!                  FallbackSupervisor ──► FallbackConsumer (CPU mock / HTTP)
//! ```
//!
//! The controller is the only writer of `FleetState`.

pub mod api;
pub mod controller;
pub mod error;
pub mod fallback;
pub mod http;
pub mod jobs;
pub mod simulated;

pub use api::{FleetApi, InstanceEvent, InstanceLifecycle, WorkerInstance};
pub use controller::{ControllerSettings, FleetController};
pub use error::{FleetError, FleetResult};
pub use fallback::{
    CpuMockConsumer, DrainFn, FallbackConsumer, FallbackSupervisor, HttpFallbackSwitch,
};
pub use jobs::ActiveJobTracker;
pub use simulated::SimulatedFleet;
