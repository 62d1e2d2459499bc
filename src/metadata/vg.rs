//! Volume Group (spec §3 "Volume Group (VG)", §4.C "LV operations").

use std::collections::HashMap;

use bitflags::bitflags;
use log::{error, info, warn};

use crate::error::{CoreError, CoreResult};
use crate::uuid::Uuid;

use super::lv::{LogicalVolume, LvStatus};
use super::pv::PhysicalVolume;
use super::segment::{Area, Segment, SegmentType};
use super::snapshot::SnapshotBinding;

/// Strips everything up to and including the last `/`, mirroring
/// `find_lv_in_vg`'s `strrchr(lv_name, '/')` (spec §4.C).
fn last_path_component(name: &str) -> &str {
    match name.rfind('/') {
        Some(pos) => &name[pos + 1..],
        None => name,
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VgStatus: u32 {
        const EXPORTED   = 1 << 0;
        const RESIZEABLE = 1 << 1;
        const PARTIAL    = 1 << 2;
        const SHARED     = 1 << 3;
        const CLUSTERED  = 1 << 4;
        const PVMOVE     = 1 << 5;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PrStatus: u32 {
        const REQUIRE = 1 << 0;
        const PTPL    = 1 << 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockType {
    None,
    Dlm,
    Sanlock,
    Idm,
    Clvm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocPolicy {
    Normal,
    Contiguous,
    Cling,
    Anywhere,
}

/// The name reserved for the orphan-PV projection (spec §4.C "Orphan VG").
pub const ORPHAN_VG_NAME: &str = "#orphans";

pub struct LvCreateParams {
    pub name: String,
    pub extents: u64,
    pub seg_type: SegmentType,
    pub stripe_size: Option<u64>,
}

pub struct VolumeGroup {
    pub id: Uuid,
    pub name: String,
    pub seqno: u64,
    pub extent_size: u64,
    pub max_lv: u32,
    pub max_pv: u32,
    pub alloc_policy: AllocPolicy,
    pub status: VgStatus,
    pub lock_type: LockType,
    pub lock_args: Option<String>,
    pub system_id: Option<String>,
    pub pvs: Vec<PhysicalVolume>,
    pub lvs: Vec<LogicalVolume>,
    pub snapshots: Vec<SnapshotBinding>,
    pub tags: Vec<String>,
    pub sanlock_lv: Option<Uuid>,
    pub pending_free_lvs: Vec<Uuid>,
    pub pr: PrStatus,
}

impl VolumeGroup {
    pub fn new(name: impl Into<String>, extent_size: u64) -> Self {
        VolumeGroup {
            id: Uuid::generate(),
            name: name.into(),
            seqno: 0,
            extent_size,
            max_lv: 0,
            max_pv: 0,
            alloc_policy: AllocPolicy::Normal,
            status: VgStatus::RESIZEABLE,
            lock_type: LockType::None,
            lock_args: None,
            system_id: None,
            pvs: Vec::new(),
            lvs: Vec::new(),
            snapshots: Vec::new(),
            tags: Vec::new(),
            sanlock_lv: None,
            pending_free_lvs: Vec::new(),
            pr: PrStatus::empty(),
        }
    }

    pub fn extent_count(&self) -> u64 {
        self.pvs.iter().map(|p| p.pe_count).sum()
    }

    pub fn free_count(&self) -> u64 {
        self.pvs.iter().map(|p| p.free_extents()).sum()
    }

    pub fn allocated_extents(&self) -> u64 {
        self.lvs.iter().map(|lv| lv.le_count).sum()
    }

    /// Spec §3 VG invariants: `sum(pv.pe_count) == extent_count`,
    /// `free_count + sum(lv.extents) == extent_count`.
    pub fn check_invariants(&self) -> Result<(), String> {
        let allocated: u64 = self.pvs.iter().map(|p| p.pe_alloc_count).sum();
        if self.free_count() + allocated != self.extent_count() {
            return Err("free_count + allocated != extent_count".into());
        }
        if self.free_count() + self.allocated_extents() != self.extent_count() {
            return Err("free_count + sum(lv extents) != extent_count".into());
        }
        Ok(())
    }

    pub fn is_partial(&self) -> bool {
        self.status.contains(VgStatus::PARTIAL)
    }

    /// `vg_extend`: attaches PVs to the VG (spec §4.C LV operations /
    /// `metadata.c`'s `_add_pv_to_vg`). Fails if the VG is already at
    /// `max_pv`.
    pub fn extend(&mut self, mut pv: PhysicalVolume) -> CoreResult<()> {
        if pv.vg_name.is_some() {
            return Err(Box::new(CoreError::invalid_argument(format!(
                "PV {} is already in VG {:?}",
                pv.id, pv.vg_name
            ))));
        }
        if self.max_pv != 0 && self.pvs.len() as u32 >= self.max_pv {
            return Err(Box::new(CoreError::invalid_argument(format!(
                "VG {} already holds the maximum {} PV(s)",
                self.name, self.max_pv
            ))));
        }
        pv.vg_name = Some(self.name.clone());
        info!("vg {}: extended with pv {}", self.name, pv.id);
        self.pvs.push(pv);
        Ok(())
    }

    /// `vg_reduce`: detaches a PV; fails if it still has allocated extents.
    pub fn reduce(&mut self, pv_id: Uuid) -> CoreResult<PhysicalVolume> {
        let pos = self
            .pvs
            .iter()
            .position(|p| p.id == pv_id)
            .ok_or_else(|| CoreError::invalid_argument(format!("PV {} not in VG {}", pv_id, self.name)))?;
        if self.pvs[pos].pe_alloc_count > 0 {
            return Err(Box::new(CoreError::invalid_argument(format!(
                "PV {} still has {} allocated extent(s)",
                pv_id, self.pvs[pos].pe_alloc_count
            ))));
        }
        let mut pv = self.pvs.remove(pos);
        pv.vg_name = None;
        Ok(pv)
    }

    /// `vg_remove`: destroys the VG. Requires no attached LVs (spec §3 VG
    /// lifecycle), mirroring `metadata.c`'s guard before releasing a VG's
    /// MDAs.
    pub fn vg_remove(&self) -> CoreResult<()> {
        if !self.lvs.is_empty() {
            return Err(Box::new(CoreError::invalid_argument(format!(
                "VG {} still has {} attached LV(s)",
                self.name,
                self.lvs.len()
            ))));
        }
        Ok(())
    }

    /// `find_lv`: exact match on the last `/`-separated path component
    /// (spec §4.C), mirroring `find_lv_in_vg`'s `strrchr(lv_name, '/')`.
    pub fn find_lv(&self, name: &str) -> Option<&LogicalVolume> {
        let name = last_path_component(name);
        self.lvs.iter().find(|lv| last_path_component(&lv.name) == name)
    }

    pub fn find_lv_mut(&mut self, name: &str) -> Option<&mut LogicalVolume> {
        let name = last_path_component(name);
        self.lvs.iter_mut().find(|lv| last_path_component(&lv.name) == name)
    }

    fn is_reserved_name(name: &str) -> bool {
        matches!(name, "lvmlock" | "pvmove0") || name.starts_with("snapshot")
    }

    /// `lv_create_single`: allocates a name (must not collide), computes the
    /// extent layout, allocates PV extents per the allocation policy, links
    /// segments (spec §4.C). Contiguous allocation is the only policy
    /// implemented beyond "first fit"; others degrade to it with a warning.
    pub fn lv_create_single(&mut self, lp: LvCreateParams) -> CoreResult<Uuid> {
        if self.find_lv(&lp.name).is_some() || Self::is_reserved_name(&lp.name) {
            return Err(Box::new(CoreError::invalid_argument(format!(
                "name '{}' is already in use or reserved",
                lp.name
            ))));
        }
        if self.max_lv != 0 && self.lvs.len() as u32 >= self.max_lv {
            return Err(Box::new(CoreError::invalid_argument(format!(
                "VG {} already holds the maximum {} LV(s)",
                self.name, self.max_lv
            ))));
        }
        if lp.extents == 0 {
            return Err(Box::new(CoreError::invalid_argument("lv_create_single: extents must be > 0")));
        }
        if self.free_count() < lp.extents {
            return Err(Box::new(CoreError::invalid_argument(format!(
                "not enough free extents: need {}, have {}",
                lp.extents, self.free_count()
            ))));
        }
        if self.alloc_policy != AllocPolicy::Contiguous && self.alloc_policy != AllocPolicy::Normal {
            warn!(
                "vg {}: allocation policy {:?} not fully modeled, falling back to first-fit",
                self.name, self.alloc_policy
            );
        }

        let areas = self.allocate_areas(lp.extents)?;
        let mut lv = LogicalVolume::new(self.id, lp.name);
        lv.le_count = lp.extents;
        lv.segments.push(Segment {
            le_start: 0,
            length: lp.extents,
            seg_type: lp.seg_type,
            stripe_size: lp.stripe_size,
            chunk_size: None,
            areas,
        });
        lv.validate_segments()
            .map_err(|e| CoreError::invalid_argument(format!("segment layout invalid: {}", e)))?;
        let id = lv.id;
        self.lvs.push(lv);
        Ok(id)
    }

    /// First-fit allocator across PVs in registration order.
    fn allocate_areas(&mut self, extents: u64) -> CoreResult<Vec<Area>> {
        let mut remaining = extents;
        let mut areas = Vec::new();
        for pv in &mut self.pvs {
            if remaining == 0 {
                break;
            }
            if !pv.status.contains(super::pv::PvStatus::ALLOCATABLE) {
                continue;
            }
            let free = pv.free_extents();
            if free == 0 {
                continue;
            }
            let take = free.min(remaining);
            areas.push(Area::Physical {
                pv: pv.id,
                pe: pv.pe_alloc_count,
            });
            pv.pe_alloc_count += take;
            remaining -= take;
        }
        if remaining != 0 {
            return Err(Box::new(CoreError::out_of_memory(format!(
                "{} extent(s) could not be allocated",
                remaining
            ))));
        }
        Ok(areas)
    }

    /// `lv_remove`: refuses if the LV is an active snapshot origin or
    /// otherwise held (spec §4.C). Lock-daemon cross-host activity checks
    /// are the caller's responsibility via the lock client.
    pub fn lv_remove(&mut self, lv_id: Uuid) -> CoreResult<()> {
        if self.snapshots.iter().any(|s| s.origin == lv_id) {
            return Err(Box::new(CoreError::invalid_argument(
                "cannot remove an LV that is the origin of an active snapshot",
            )));
        }
        let pos = self
            .lvs
            .iter()
            .position(|lv| lv.id == lv_id)
            .ok_or_else(|| CoreError::invalid_argument(format!("LV {} not found", lv_id)))?;
        let lv = self.lvs.remove(pos);
        for pv in &mut self.pvs {
            let freed: u64 = lv
                .segments
                .iter()
                .flat_map(|s| &s.areas)
                .filter_map(|a| match a {
                    Area::Physical { pv: id, .. } if *id == pv.id => Some(1u64),
                    _ => None,
                })
                .sum();
            pv.pe_alloc_count = pv.pe_alloc_count.saturating_sub(freed);
        }
        info!("vg {}: removed lv {} ({})", self.name, lv.name, lv.id);
        Ok(())
    }

    /// `vg_add_snapshot` (spec §4.C): rejects if `cow` is already a COW,
    /// hides `cow`, appends the binding.
    pub fn add_snapshot(
        &mut self,
        origin: Uuid,
        cow: Uuid,
        chunk_size: u64,
        extents: u64,
        persistent: bool,
        id: Option<Uuid>,
    ) -> CoreResult<Uuid> {
        if self.snapshots.iter().any(|s| s.cow == cow) {
            return Err(Box::new(CoreError::invalid_argument(format!(
                "LV {} is already a snapshot COW",
                cow
            ))));
        }
        if self.find_lv_by_id(origin).is_none() || self.find_lv_by_id(cow).is_none() {
            return Err(Box::new(CoreError::invalid_argument("origin/cow LV not found in this VG")));
        }
        if let Some(cow_lv) = self.lvs.iter_mut().find(|lv| lv.id == cow) {
            cow_lv.status.remove(LvStatus::VISIBLE);
        }
        let snap_id = id.unwrap_or_else(Uuid::generate);
        self.snapshots.push(SnapshotBinding {
            id: snap_id,
            origin,
            cow,
            chunk_size,
            persistent,
            extents,
        });
        Ok(snap_id)
    }

    pub fn find_lv_by_id(&self, id: Uuid) -> Option<&LogicalVolume> {
        self.lvs.iter().find(|lv| lv.id == id)
    }

    /// Projects orphan PVs (not attached to any VG) as a synthetic VG named
    /// `#orphans` (spec §4.C "Orphan VG").
    pub fn orphan_projection(orphans: Vec<PhysicalVolume>) -> Self {
        let mut vg = VolumeGroup::new(ORPHAN_VG_NAME, 0);
        for pv in orphans {
            if !pv.is_orphan() {
                error!("orphan_projection: pv {} unexpectedly has a vg_name", pv.id);
                continue;
            }
            vg.pvs.push(pv);
        }
        vg
    }
}

/// Groups VGs by name for a label-cache-style lookup (spec §4.C `vg_read`
/// step 1, "Resolve the VG's format from the label cache").
#[derive(Default)]
pub struct VgDirectory {
    by_name: HashMap<String, VolumeGroup>,
}

impl VgDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, vg: VolumeGroup) {
        self.by_name.insert(vg.name.clone(), vg);
    }

    pub fn get(&self, name: &str) -> Option<&VolumeGroup> {
        self.by_name.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut VolumeGroup> {
        self.by_name.get_mut(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<VolumeGroup> {
        self.by_name.remove(name)
    }
}
