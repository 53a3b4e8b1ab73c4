//! voxscale-monitor: the backlog monitor.
//!
//! Samples queue depth and oldest-message age on every tick, keeps a
//! rolling window of time-to-first-audio telemetry, and tracks how long
//! the queue source has been unreachable.
//!
//! Collaborators sit behind the async [`QueueSource`] and
//! [`TelemetrySource`] traits; [`http`] holds the JSON adapters and
//! [`source`] the in-memory implementations used by `voxscaled simulate`
//! and the tests.

pub mod error;
pub mod http;
pub mod latency;
pub mod monitor;
pub mod source;

pub use error::{MonitorError, MonitorResult};
pub use latency::{LatencyAggregate, LatencyWindow, recommended_visibility_timeout};
pub use monitor::{BacklogMonitor, MonitorSettings, Observation, StalenessTracker};
pub use source::{InMemoryQueue, InMemoryTelemetry, QueueReading, QueueSource, TelemetrySource};
