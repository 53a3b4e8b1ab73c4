//! redb table definitions for the voxscale state store.
//!
//! Every table uses `&str` keys and `&[u8]` values (JSON-serialized types).

use redb::TableDefinition;

/// ScalingTarget feed keyed by `{fleet}:{computed_at:020}`.
pub const TARGETS: TableDefinition<&str, &[u8]> = TableDefinition::new("targets");

/// Health events keyed by a zero-padded sequence number.
pub const EVENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("events");

/// Queue snapshots keyed by `{queue}:{sampled_at:020}`.
pub const SNAPSHOTS: TableDefinition<&str, &[u8]> = TableDefinition::new("snapshots");

/// Latest fleet state keyed by fleet name.
pub const FLEETS: TableDefinition<&str, &[u8]> = TableDefinition::new("fleets");

/// Active-job reports keyed by worker id.
pub const ACTIVE_JOBS: TableDefinition<&str, &[u8]> = TableDefinition::new("active_jobs");

/// Manual capacity overrides keyed by fleet name.
pub const OVERRIDES: TableDefinition<&str, &[u8]> = TableDefinition::new("overrides");

/// Latest control status keyed by fleet name.
pub const STATUS: TableDefinition<&str, &[u8]> = TableDefinition::new("status");
