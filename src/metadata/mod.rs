//! In-memory PV/VG/LV/segment/snapshot graph and the metadata transaction
//! engine (spec §4.C).

pub mod archive;
pub mod lv;
pub mod mda;
pub mod pv;
pub mod segment;
pub mod snapshot;
pub mod vg;

use log::warn;

use crate::error::{CoreError, CoreResult};

use mda::{vg_commit_all, vg_read_all, MetadataArea};
use vg::VolumeGroup;

/// `vg_read(name, consistent)` (spec §4.C "Read and repair"): reads every
/// MDA, picks the highest-seqno copy, and — if the caller asked for
/// consistent (write-holder) semantics and the copies disagreed — repairs
/// by rewriting the winning copy everywhere. Repair is refused for
/// `PARTIAL_VG`. Returns the metadata text that should be parsed by the
/// caller (parsing/building the in-memory `VolumeGroup` from it is outside
/// this module's scope, matching spec §1's exclusion of the text-format
/// parser).
pub fn vg_read(
    vg: &mut VolumeGroup,
    mdas: &mut [Box<dyn MetadataArea>],
    consistent: bool,
    serialize: impl Fn(&VolumeGroup) -> String,
) -> CoreResult<mda::VgReadResult> {
    let result = vg_read_all(mdas)?;

    if vg.status.contains(vg::VgStatus::PVMOVE) {
        return Err(Box::new(CoreError::invalid_argument(
            "vg has an interrupted pvmove; run pvmove recovery before proceeding",
        )));
    }

    if result.inconsistent && consistent {
        if vg.is_partial() {
            return Err(Box::new(CoreError::invalid_argument(
                "vg is partial, refusing to repair inconsistent metadata",
            )));
        }
        if let Some(winning) = &result.metadata {
            if winning.seqno > vg.seqno {
                vg.seqno = winning.seqno - 1; // vg_commit_all bumps by one.
            }
        }
        warn!("vg {}: metadata copies disagreed, repairing all mdas", vg.name);
        vg_commit_all(vg, mdas, serialize)?;
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::mda::{InMemoryMda, StagedMetadata};
    use super::*;

    fn serialize(vg: &VolumeGroup) -> String {
        format!("seqno={}", vg.seqno)
    }

    #[test]
    fn commit_succeeding_on_first_mda_advances_seqno() {
        let mut vg = VolumeGroup::new("testvg", 4096);
        let mut mdas: Vec<Box<dyn MetadataArea>> = vec![Box::new(InMemoryMda::new()), Box::new(InMemoryMda::new())];
        vg_commit_all(&mut vg, &mut mdas, serialize).unwrap();
        assert_eq!(vg.seqno, 1);
    }

    #[test]
    fn commit_is_durable_if_only_one_mda_succeeds() {
        let mut vg = VolumeGroup::new("testvg", 4096);
        let mut failing = InMemoryMda::new();
        failing.fail_commit = true;
        let mut mdas: Vec<Box<dyn MetadataArea>> = vec![Box::new(InMemoryMda::new()), Box::new(failing)];
        assert!(vg_commit_all(&mut vg, &mut mdas, serialize).is_ok());
        assert_eq!(vg.seqno, 1);
    }

    #[test]
    fn read_observes_highest_seqno_and_flags_disagreement() {
        let mut a = InMemoryMda::new();
        a.vg_write(StagedMetadata { seqno: 1, body: "a".into() }).unwrap();
        a.vg_commit().unwrap();
        let mut b = InMemoryMda::new();
        b.vg_write(StagedMetadata { seqno: 2, body: "b".into() }).unwrap();
        b.vg_commit().unwrap();

        let mut vg = VolumeGroup::new("testvg", 4096);
        vg.seqno = 1;
        let mut mdas: Vec<Box<dyn MetadataArea>> = vec![Box::new(a), Box::new(b)];
        let result = vg_read(&mut vg, &mut mdas, true, serialize).unwrap();
        assert!(result.inconsistent);
        assert_eq!(result.metadata.unwrap().seqno, 2);
    }

    #[test]
    fn vg_invariants_hold_after_extend_and_lv_create() {
        use super::pv::PhysicalVolume;
        use super::vg::LvCreateParams;
        use crate::uuid::Uuid;
        use super::segment::SegmentType;

        let mut vg = VolumeGroup::new("testvg", 8192);
        let pv = PhysicalVolume::create(Uuid::generate(), 1_000_000, 8192);
        vg.extend(pv).unwrap();
        assert!(vg.check_invariants().is_ok());

        let free = vg.free_count();
        vg.lv_create_single(LvCreateParams {
            name: "data".into(),
            extents: free / 2,
            seg_type: SegmentType::Linear,
            stripe_size: None,
        })
        .unwrap();
        assert!(vg.check_invariants().is_ok());
        assert_eq!(vg.find_lv("data").unwrap().le_count, free / 2);
    }

    #[test]
    fn find_lv_matches_on_last_path_component() {
        use super::pv::PhysicalVolume;
        use super::vg::LvCreateParams;
        use crate::uuid::Uuid;
        use super::segment::SegmentType;

        let mut vg = VolumeGroup::new("testvg", 8192);
        let pv = PhysicalVolume::create(Uuid::generate(), 1_000_000, 8192);
        vg.extend(pv).unwrap();
        let free = vg.free_count();
        vg.lv_create_single(LvCreateParams {
            name: "data".into(),
            extents: free / 2,
            seg_type: SegmentType::Linear,
            stripe_size: None,
        })
        .unwrap();

        assert!(vg.find_lv("testvg/data").is_some());
        assert!(vg.find_lv_mut("/dev/testvg/data").is_some());
    }

    #[test]
    fn vg_remove_rejects_a_vg_with_attached_lvs() {
        use super::pv::PhysicalVolume;
        use super::vg::LvCreateParams;
        use crate::uuid::Uuid;
        use super::segment::SegmentType;

        let mut vg = VolumeGroup::new("testvg", 8192);
        let pv = PhysicalVolume::create(Uuid::generate(), 1_000_000, 8192);
        vg.extend(pv).unwrap();
        assert!(vg.vg_remove().is_ok());

        let free = vg.free_count();
        vg.lv_create_single(LvCreateParams {
            name: "data".into(),
            extents: free / 2,
            seg_type: SegmentType::Linear,
            stripe_size: None,
        })
        .unwrap();
        assert!(vg.vg_remove().is_err());
    }

    #[test]
    fn pv_remove_rejects_a_pv_with_allocated_extents() {
        use super::pv::PhysicalVolume;
        use crate::uuid::Uuid;

        let mut pv = PhysicalVolume::create(Uuid::generate(), 1_000_000, 8192);
        assert!(pv.clone().pv_remove().is_ok());

        pv.pe_alloc_count = 1;
        assert!(pv.pv_remove().is_err());
    }
}
