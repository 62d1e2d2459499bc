//! Snapshot bindings (spec §3 "Snapshot binding", §4.C `vg_add_snapshot`).

use crate::uuid::Uuid;

#[derive(Debug, Clone)]
pub struct SnapshotBinding {
    pub id: Uuid,
    pub origin: Uuid,
    pub cow: Uuid,
    pub chunk_size: u64,
    pub persistent: bool,
    pub extents: u64,
}
