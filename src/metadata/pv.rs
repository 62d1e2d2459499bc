//! Physical Volume (spec §3 "Physical Volume (PV)").

use bitflags::bitflags;

use crate::error::{CoreError, CoreResult};
use crate::uuid::Uuid;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PvStatus: u32 {
        const ALLOCATABLE = 1 << 0;
        const EXPORTED    = 1 << 1;
    }
}

/// Reserved prefix for label/metadata, equivalent to the original's
/// `PE_ALIGN` default (1 MiB, expressed in 512-byte sectors).
pub const MIN_PE_START_SECTORS: u64 = (1024 * 1024) / 512;

#[derive(Debug, Clone)]
pub struct PhysicalVolume {
    pub id: Uuid,
    /// Opaque handle into the block cache's device-id registry (§3 "Device
    /// identifier (DI)"); `None` for a PV that has not been opened yet.
    pub device_id: Option<u32>,
    pub size_sectors: u64,
    pub pe_start: u64,
    pub pe_size: u64,
    pub pe_count: u64,
    pub pe_alloc_count: u64,
    pub status: PvStatus,
    pub vg_name: Option<String>,
    pub tags: Vec<String>,
}

impl PhysicalVolume {
    /// `pv_create`: a bare PV not yet attached to any VG.
    pub fn create(id: Uuid, size_sectors: u64, extent_size: u64) -> Self {
        let pe_start = MIN_PE_START_SECTORS.max(extent_size.max(1));
        let pe_count = (size_sectors.saturating_sub(pe_start)) / extent_size.max(1);
        PhysicalVolume {
            id,
            device_id: None,
            size_sectors,
            pe_start,
            pe_size: extent_size,
            pe_count,
            pe_alloc_count: 0,
            status: PvStatus::ALLOCATABLE,
            vg_name: None,
            tags: Vec::new(),
        }
    }

    pub fn is_orphan(&self) -> bool {
        self.vg_name.is_none()
    }

    pub fn free_extents(&self) -> u64 {
        self.pe_count - self.pe_alloc_count
    }

    /// `pv_remove`: destroys the PV. Requires no allocated extents (spec §3
    /// PV lifecycle), mirroring `metadata.c`'s guard before wiping a PV's
    /// label.
    pub fn pv_remove(self) -> CoreResult<()> {
        if self.pe_alloc_count > 0 {
            return Err(Box::new(CoreError::invalid_argument(format!(
                "PV {} still has {} allocated extent(s)",
                self.id, self.pe_alloc_count
            ))));
        }
        Ok(())
    }
}
