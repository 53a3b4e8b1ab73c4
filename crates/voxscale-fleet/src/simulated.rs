//! In-memory worker fleet for `voxscaled simulate` and tests.

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tracing::debug;

use crate::api::{FleetApi, InstanceEvent, InstanceLifecycle, WorkerInstance};
use crate::error::{FleetError, FleetResult};

#[derive(Debug, Default)]
struct Inner {
    instances: Vec<WorkerInstance>,
    next_id: u64,
    clock: u64,
    /// Largest capacity the provider grants.
    quota: Option<u32>,
    /// New instances stay `Pending` until promoted.
    hold_pending: bool,
    /// Report no launch times.
    hide_launch_times: bool,
    unavailable: bool,
    events: Vec<InstanceEvent>,
    desired_calls: Vec<u32>,
}

impl Inner {
    fn live(&self) -> impl Iterator<Item = &WorkerInstance> {
        self.instances
            .iter()
            .filter(|i| i.lifecycle != InstanceLifecycle::Terminating)
    }

    fn launch(&mut self) {
        self.next_id += 1;
        let lifecycle = if self.hold_pending {
            InstanceLifecycle::Pending
        } else {
            InstanceLifecycle::InService
        };
        self.instances.push(WorkerInstance {
            id: format!("i-{:04}", self.next_id),
            lifecycle,
            healthy: true,
            launched_at: Some(self.clock),
            protected: false,
        });
    }

    fn check_available(&self) -> FleetResult<()> {
        if self.unavailable {
            return Err(FleetError::Unavailable("simulated outage".to_string()));
        }
        Ok(())
    }
}

/// Scriptable fleet. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct SimulatedFleet {
    inner: Arc<Mutex<Inner>>,
}

impl SimulatedFleet {
    /// A fleet already running `capacity` in-service instances.
    pub fn new(capacity: u32) -> Self {
        let fleet = Self::default();
        {
            let mut inner = fleet.lock();
            for _ in 0..capacity {
                inner.launch();
            }
        }
        fleet
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A poisoned lock only means a test panicked mid-update.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Launch time stamped on new instances.
    pub fn set_clock(&self, now: u64) {
        self.lock().clock = now;
    }

    pub fn set_quota(&self, quota: Option<u32>) {
        self.lock().quota = quota;
    }

    pub fn set_hold_pending(&self, hold: bool) {
        self.lock().hold_pending = hold;
    }

    pub fn set_hide_launch_times(&self, hide: bool) {
        self.lock().hide_launch_times = hide;
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    /// Move every pending instance into service.
    pub fn promote_pending(&self) {
        for instance in self.lock().instances.iter_mut() {
            if instance.lifecycle == InstanceLifecycle::Pending {
                instance.lifecycle = InstanceLifecycle::InService;
            }
        }
    }

    /// Reclaim a spot instance. The provider keeps desired capacity and
    /// reports the interruption on the next `drain_events`.
    pub fn interrupt(&self, instance_id: &str) -> bool {
        let mut inner = self.lock();
        let Some(instance) = inner.instances.iter_mut().find(|i| i.id == instance_id) else {
            return false;
        };
        instance.lifecycle = InstanceLifecycle::Terminating;
        inner.events.push(InstanceEvent::SpotInterruption {
            instance_id: instance_id.to_string(),
        });
        true
    }

    /// Instances not yet terminating.
    pub fn live_count(&self) -> u32 {
        self.lock().live().count() as u32
    }

    /// Every `set_desired_capacity` argument so far.
    pub fn desired_calls(&self) -> Vec<u32> {
        self.lock().desired_calls.clone()
    }

    pub fn instance(&self, instance_id: &str) -> Option<WorkerInstance> {
        self.lock()
            .instances
            .iter()
            .find(|i| i.id == instance_id)
            .cloned()
    }
}

#[async_trait]
impl FleetApi for SimulatedFleet {
    async fn set_desired_capacity(&self, desired: u32) -> FleetResult<()> {
        let mut inner = self.lock();
        inner.check_available()?;
        if let Some(quota) = inner.quota
            && desired > quota
        {
            return Err(FleetError::ApplyRejected(format!(
                "desired {desired} exceeds quota {quota}"
            )));
        }
        inner.desired_calls.push(desired);

        let live = inner.live().count() as u32;
        for _ in live..desired {
            inner.launch();
        }
        if desired < live {
            // Provider default: newest unprotected instances go first.
            let mut excess = live - desired;
            for instance in inner.instances.iter_mut().rev() {
                if excess == 0 {
                    break;
                }
                if instance.lifecycle != InstanceLifecycle::Terminating && !instance.protected {
                    instance.lifecycle = InstanceLifecycle::Terminating;
                    excess -= 1;
                }
            }
        }
        debug!(desired, "simulated fleet resized");
        Ok(())
    }

    async fn list_instances(&self) -> FleetResult<Vec<WorkerInstance>> {
        let inner = self.lock();
        inner.check_available()?;
        let hide = inner.hide_launch_times;
        Ok(inner
            .instances
            .iter()
            .map(|i| WorkerInstance {
                launched_at: if hide { None } else { i.launched_at },
                ..i.clone()
            })
            .collect())
    }

    async fn protect(&self, instance_id: &str, protected: bool) -> FleetResult<()> {
        let mut inner = self.lock();
        inner.check_available()?;
        let instance = inner
            .instances
            .iter_mut()
            .find(|i| i.id == instance_id)
            .ok_or_else(|| FleetError::InstanceNotFound(instance_id.to_string()))?;
        instance.protected = protected;
        Ok(())
    }

    async fn terminate(&self, instance_id: &str) -> FleetResult<()> {
        let mut inner = self.lock();
        inner.check_available()?;
        let instance = inner
            .instances
            .iter_mut()
            .find(|i| i.id == instance_id && i.lifecycle != InstanceLifecycle::Terminating)
            .ok_or_else(|| FleetError::InstanceNotFound(instance_id.to_string()))?;
        if instance.protected {
            return Err(FleetError::ApplyRejected(format!(
                "instance {instance_id} is protected from scale-in"
            )));
        }
        instance.lifecycle = InstanceLifecycle::Terminating;
        Ok(())
    }

    async fn drain_events(&self) -> FleetResult<Vec<InstanceEvent>> {
        let mut inner = self.lock();
        inner.check_available()?;
        Ok(std::mem::take(&mut inner.events))
    }
}
