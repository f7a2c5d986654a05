//! Local state persistence for the control plane.
//!
//! This module provides SQLite-based storage for:
//! - Routing records (active and deleted)
//! - The append-only health sample stream
//! - The zone snapshot (replaced wholesale)
//! - A diagnostic copy of the last topology snapshot
//! - The append-only audit log
//!
//! Each table is independently queryable with the `sqlite3` shell for
//! diagnostics.

mod store;

pub use store::{
    AuditEntry, HealthSample, NewRoute, RouteFilter, RouteStatus, RoutingRecord, SampleState,
    StateStore, StateStoreError, StoredTopology, TargetKind, Zone, ZoneSnapshot,
};
