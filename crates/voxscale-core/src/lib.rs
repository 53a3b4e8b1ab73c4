//! voxscale-core: configuration and time helpers shared by every crate.
//!
//! - [`config`]: the `voxscale.toml` control-loop configuration.
//! - [`duration`]: human duration strings ("60s", "5m", "500ms", "2h30m").
//! - [`schedule`]: scheduled capacity windows driven by cron recurrences.
//! - [`http`]: JSON-over-HTTP client used by collaborator adapters.

pub mod config;
pub mod duration;
pub mod http;
pub mod schedule;

pub use config::{ConfigError, ControlConfig};
pub use duration::parse_duration;
pub use schedule::{ScheduledCapacity, ScheduledWindow, WindowSet};
