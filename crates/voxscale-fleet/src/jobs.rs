//! Active-job aggregation across the fleet.
//!
//! Workers report their in-flight render count through the operator API;
//! reports land in the state store. A report older than the TTL is
//! treated as absent so a crashed worker cannot pin the fleet forever.

use std::collections::HashSet;
use std::time::Duration;

use tracing::debug;

use voxscale_state::{ActiveJobSignal, StateStore, WorkerId};

use crate::error::FleetResult;

#[derive(Clone)]
pub struct ActiveJobTracker {
    store: StateStore,
    ttl: Duration,
}

impl ActiveJobTracker {
    pub fn new(store: StateStore, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    pub fn report(&self, signal: &ActiveJobSignal) -> FleetResult<()> {
        self.store.put_active_job(signal)?;
        Ok(())
    }

    /// Reports still inside the TTL at `now`.
    pub fn fresh(&self, now: u64) -> FleetResult<Vec<ActiveJobSignal>> {
        let ttl = self.ttl.as_secs();
        Ok(self
            .store
            .list_active_jobs()?
            .into_iter()
            .filter(|s| now.saturating_sub(s.reported_at) < ttl)
            .collect())
    }

    /// Sum of fresh active render counts.
    pub fn aggregate(&self, now: u64) -> FleetResult<u32> {
        Ok(self
            .fresh(now)?
            .iter()
            .fold(0u32, |acc, s| acc.saturating_add(s.active_render_count)))
    }

    /// Workers with at least one fresh active render.
    pub fn busy_workers(&self, now: u64) -> FleetResult<HashSet<WorkerId>> {
        Ok(self
            .fresh(now)?
            .into_iter()
            .filter(|s| s.active_render_count > 0)
            .map(|s| s.worker_id)
            .collect())
    }

    /// Delete expired reports. Returns how many were removed.
    pub fn prune(&self, now: u64) -> FleetResult<u32> {
        let ttl = self.ttl.as_secs();
        let mut removed = 0;
        for signal in self.store.list_active_jobs()? {
            if now.saturating_sub(signal.reported_at) >= ttl
                && self.store.delete_active_job(&signal.worker_id)?
            {
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(removed, "expired active-job reports pruned");
        }
        Ok(removed)
    }
}
