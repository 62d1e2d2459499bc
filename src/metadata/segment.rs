//! LV segments and their areas (spec §3 "Segment").

use crate::uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentType {
    Linear,
    Striped,
    Mirrored,
    Snapshot,
}

/// An allocation backing one stripe of a segment: either a chunk of a PV's
/// extents, or (for mirror images / stacked LVs) a chunk of a child LV's
/// logical extents.
#[derive(Debug, Clone, Copy)]
pub enum Area {
    Physical { pv: Uuid, pe: u64 },
    Logical { child_lv: Uuid, le: u64 },
}

#[derive(Debug, Clone)]
pub struct Segment {
    pub le_start: u64,
    pub length: u64,
    pub seg_type: SegmentType,
    pub stripe_size: Option<u64>,
    pub chunk_size: Option<u64>,
    pub areas: Vec<Area>,
}

impl Segment {
    pub fn le_end(&self) -> u64 {
        self.le_start + self.length
    }

    /// Invariants from spec §3: striped segments need >=2 areas and a
    /// power-of-two stripe size; snapshot segments need a chunk size.
    pub fn validate(&self) -> Result<(), String> {
        match self.seg_type {
            SegmentType::Striped => {
                if self.areas.len() < 2 {
                    return Err("striped segment needs at least 2 areas".into());
                }
                match self.stripe_size {
                    Some(s) if s > 0 && (s & (s - 1)) == 0 => {}
                    _ => return Err("striped segment needs a power-of-two stripe_size".into()),
                }
            }
            SegmentType::Snapshot => {
                if self.chunk_size.is_none() {
                    return Err("snapshot segment needs a chunk_size".into());
                }
            }
            SegmentType::Linear | SegmentType::Mirrored => {}
        }
        Ok(())
    }
}
