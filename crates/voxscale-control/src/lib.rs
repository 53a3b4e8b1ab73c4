//! voxscale-control: the control loop.
//!
//! ```text
//!            ┌──────────────────── tick (sample_interval) ───────────────────┐
//!            ▼                                                               │
//! BacklogMonitor::observe ──► DecisionEngine::decide ──► FleetController::apply
//!      (queue ∥ telemetry)          │                          │
//!                                   ▼                          ▼
//!                            ScalingTarget feed          HealthEvent bus ──► FallbackSupervisor
//! ```
//!
//! One [`ControlLoop`] per fleet. The loop owns the monitor, the engine,
//! and the controller; everything it decides is written to the
//! [`StateStore`](voxscale_state::StateStore) so the operator API can
//! serve it.

pub mod bus;
pub mod control;

pub use bus::EventBus;
pub use control::{Collaborators, ControlLoop, CycleReport, fallback_consumer};
