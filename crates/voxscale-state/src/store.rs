//! StateStore: redb-backed persistence for the control loop.
//!
//! Provides typed operations over the ScalingTarget feed, health events,
//! queue snapshots, fleet state, active-job signals, and manual overrides.
//! All values are JSON-serialized into redb's `&[u8]` value columns. The
//! store supports both on-disk and in-memory backends (the latter for
//! testing).

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

type Table = TableDefinition<'static, &'static str, &'static [u8]>;

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
    /// Next health-event sequence number.
    event_seq: Arc<AtomicU64>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self::init(db)?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self::init(db)?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    fn init(db: Database) -> StateResult<Self> {
        let store = Self {
            db: Arc::new(db),
            event_seq: Arc::new(AtomicU64::new(0)),
        };
        store.ensure_tables()?;
        let next = store.last_event_seq()?.map_or(0, |seq| seq + 1);
        store.event_seq.store(next, Ordering::SeqCst);
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        for table in [
            TARGETS,
            EVENTS,
            SNAPSHOTS,
            FLEETS,
            ACTIVE_JOBS,
            OVERRIDES,
            STATUS,
        ] {
            txn.open_table(table).map_err(map_err!(Table))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn last_event_seq(&self) -> StateResult<Option<u64>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(EVENTS).map_err(map_err!(Table))?;
        match table.last().map_err(map_err!(Read))? {
            Some((key, _)) => Ok(key.value().parse::<u64>().ok()),
            None => Ok(None),
        }
    }

    // ── Generic helpers ────────────────────────────────────────────

    fn put<T: Serialize>(&self, table: Table, key: &str, value: &T) -> StateResult<()> {
        let value = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut t = txn.open_table(table).map_err(map_err!(Table))?;
            t.insert(key, value.as_slice()).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn get<T: DeserializeOwned>(&self, table: Table, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let t = txn.open_table(table).map_err(map_err!(Table))?;
        match t.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let value = serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    fn delete(&self, table: Table, key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut t = txn.open_table(table).map_err(map_err!(Table))?;
            existed = t.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    fn list_all<T: DeserializeOwned>(&self, table: Table) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let t = txn.open_table(table).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in t.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            results.push(serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?);
        }
        Ok(results)
    }

    /// Newest-first scan of keys starting with `{owner}:`.
    fn list_newest<T: DeserializeOwned>(
        &self,
        table: Table,
        owner: &str,
        limit: usize,
    ) -> StateResult<Vec<T>> {
        // ';' sorts right after ':', closing the prefix range.
        let start = format!("{owner}:");
        let end = format!("{owner};");
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let t = txn.open_table(table).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in t
            .range(start.as_str()..end.as_str())
            .map_err(map_err!(Read))?
            .rev()
        {
            if results.len() >= limit {
                break;
            }
            let (_, value) = entry.map_err(map_err!(Read))?;
            results.push(serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?);
        }
        Ok(results)
    }

    /// Delete all but the newest `keep` keys in `[start, end)`.
    fn prune_range(&self, table: Table, start: &str, end: &str, keep: usize) -> StateResult<u32> {
        let keys: Vec<String> = {
            let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
            let t = txn.open_table(table).map_err(map_err!(Table))?;
            let mut keys = Vec::new();
            for entry in t.range(start..end).map_err(map_err!(Read))?.rev().skip(keep) {
                let (key, _) = entry.map_err(map_err!(Read))?;
                keys.push(key.value().to_string());
            }
            keys
        };

        if keys.is_empty() {
            return Ok(0);
        }

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut t = txn.open_table(table).map_err(map_err!(Table))?;
            for key in &keys {
                t.remove(key.as_str()).map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(keys.len() as u32)
    }

    // ── Scaling targets ────────────────────────────────────────────

    /// Append a target to the feed.
    pub fn put_target(&self, target: &ScalingTarget) -> StateResult<()> {
        let key = target.table_key();
        self.put(TARGETS, &key, target)?;
        debug!(%key, desired = target.desired_capacity, "scaling target stored");
        Ok(())
    }

    /// Most recent target for a fleet.
    pub fn latest_target(&self, fleet: &str) -> StateResult<Option<ScalingTarget>> {
        Ok(self.list_targets(fleet, 1)?.into_iter().next())
    }

    /// Recent targets for a fleet, newest first.
    pub fn list_targets(&self, fleet: &str, limit: usize) -> StateResult<Vec<ScalingTarget>> {
        self.list_newest(TARGETS, fleet, limit)
    }

    // ── Health events ──────────────────────────────────────────────

    /// Append a health event. Returns its sequence number.
    pub fn append_event(&self, event: &HealthEvent) -> StateResult<u64> {
        let seq = self.event_seq.fetch_add(1, Ordering::SeqCst);
        self.put(EVENTS, &format!("{seq:020}"), event)?;
        debug!(seq, kind = event.kind.name(), "health event stored");
        Ok(seq)
    }

    /// Recent health events, newest first.
    pub fn list_events(&self, limit: usize) -> StateResult<Vec<HealthEvent>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(EVENTS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))?.rev() {
            if results.len() >= limit {
                break;
            }
            let (_, value) = entry.map_err(map_err!(Read))?;
            results.push(serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?);
        }
        Ok(results)
    }

    // ── Queue snapshots ────────────────────────────────────────────

    pub fn put_snapshot(&self, snapshot: &QueueSnapshot) -> StateResult<()> {
        self.put(SNAPSHOTS, &snapshot.table_key(), snapshot)
    }

    /// Recent snapshots for a queue, newest first.
    pub fn list_snapshots(&self, queue: &str, limit: usize) -> StateResult<Vec<QueueSnapshot>> {
        self.list_newest(SNAPSHOTS, queue, limit)
    }

    // ── Fleet state ────────────────────────────────────────────────

    pub fn put_fleet_state(&self, state: &FleetState) -> StateResult<()> {
        self.put(FLEETS, &state.fleet, state)
    }

    pub fn get_fleet_state(&self, fleet: &str) -> StateResult<Option<FleetState>> {
        self.get(FLEETS, fleet)
    }

    // ── Active jobs ────────────────────────────────────────────────

    /// Insert or replace a worker's active-job report.
    pub fn put_active_job(&self, signal: &ActiveJobSignal) -> StateResult<()> {
        self.put(ACTIVE_JOBS, &signal.worker_id, signal)
    }

    pub fn list_active_jobs(&self) -> StateResult<Vec<ActiveJobSignal>> {
        self.list_all(ACTIVE_JOBS)
    }

    pub fn delete_active_job(&self, worker_id: &str) -> StateResult<bool> {
        self.delete(ACTIVE_JOBS, worker_id)
    }

    // ── Manual overrides ───────────────────────────────────────────

    pub fn put_override(&self, fleet: &str, manual: &ManualOverride) -> StateResult<()> {
        self.put(OVERRIDES, fleet, manual)?;
        debug!(%fleet, desired = manual.desired, "manual override stored");
        Ok(())
    }

    pub fn get_override(&self, fleet: &str) -> StateResult<Option<ManualOverride>> {
        self.get(OVERRIDES, fleet)
    }

    /// Remove a fleet's override. Returns true if one existed.
    pub fn clear_override(&self, fleet: &str) -> StateResult<bool> {
        self.delete(OVERRIDES, fleet)
    }

    // ── Status ─────────────────────────────────────────────────────

    pub fn put_status(&self, status: &ControlStatus) -> StateResult<()> {
        self.put(STATUS, &status.fleet, status)
    }

    pub fn get_status(&self, fleet: &str) -> StateResult<Option<ControlStatus>> {
        self.get(STATUS, fleet)
    }

    // ── Retention ──────────────────────────────────────────────────

    /// Trim the target, snapshot, and event feeds to the newest `keep`
    /// entries each. Returns the number of entries removed.
    pub fn prune_feeds(&self, fleet: &str, queue: &str, keep: usize) -> StateResult<u32> {
        let mut removed = self.prune_range(
            TARGETS,
            &format!("{fleet}:"),
            &format!("{fleet};"),
            keep,
        )?;
        removed += self.prune_range(
            SNAPSHOTS,
            &format!("{queue}:"),
            &format!("{queue};"),
            keep,
        )?;
        // Sequence keys are all digits; ':' sorts after '9'.
        removed += self.prune_range(EVENTS, "", ":", keep)?;
        if removed > 0 {
            debug!(removed, keep, "feeds pruned");
        }
        Ok(removed)
    }
}
