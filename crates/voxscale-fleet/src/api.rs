//! The worker fleet collaborator.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::FleetResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceLifecycle {
    Pending,
    InService,
    Terminating,
}

/// One worker as reported by the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerInstance {
    pub id: String,
    pub lifecycle: InstanceLifecycle,
    #[serde(default = "default_healthy")]
    pub healthy: bool,
    /// Launch time, when the provider reports it.
    #[serde(default)]
    pub launched_at: Option<u64>,
    /// Protected from scale-in.
    #[serde(default)]
    pub protected: bool,
}

fn default_healthy() -> bool {
    true
}

impl WorkerInstance {
    /// Serving work right now.
    pub fn is_serving(&self) -> bool {
        self.lifecycle == InstanceLifecycle::InService && self.healthy
    }
}

/// Lifecycle notices pushed by the provider outside of `apply`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InstanceEvent {
    Terminated { instance_id: String },
    SpotInterruption { instance_id: String },
}

impl InstanceEvent {
    pub fn instance_id(&self) -> &str {
        match self {
            InstanceEvent::Terminated { instance_id }
            | InstanceEvent::SpotInterruption { instance_id } => instance_id,
        }
    }
}

/// An autoscaling group of GPU workers.
#[async_trait]
pub trait FleetApi: Send + Sync {
    /// Ask the provider to run `desired` instances. On scale-in the
    /// provider picks which instances to stop.
    async fn set_desired_capacity(&self, desired: u32) -> FleetResult<()>;

    async fn list_instances(&self) -> FleetResult<Vec<WorkerInstance>>;

    /// Toggle scale-in protection for one instance.
    async fn protect(&self, instance_id: &str, protected: bool) -> FleetResult<()>;

    /// Terminate one instance and decrement desired capacity by one.
    async fn terminate(&self, instance_id: &str) -> FleetResult<()>;

    /// Lifecycle notices since the previous call.
    async fn drain_events(&self) -> FleetResult<Vec<InstanceEvent>> {
        Ok(Vec::new())
    }
}
