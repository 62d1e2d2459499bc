//! Logical Volume (spec §3 "Logical Volume (LV)").

use bitflags::bitflags;

use crate::uuid::Uuid;

use super::segment::Segment;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct LvStatus: u32 {
        const READ               = 1 << 0;
        const WRITE              = 1 << 1;
        const VISIBLE            = 1 << 2;
        const FIXED_MINOR        = 1 << 3;
        const ACTIVATE_EXCL      = 1 << 4;
        const PARTIAL            = 1 << 5;
        const LOCKD_SANLOCK_LV   = 1 << 6;
    }
}

#[derive(Debug, Clone)]
pub struct LogicalVolume {
    pub vg_id: Uuid,
    pub id: Uuid,
    pub name: String,
    pub status: LvStatus,
    pub le_count: u64,
    pub segments: Vec<Segment>,
    pub lock_args: Option<String>,
    pub read_ahead: Option<u32>,
    pub major: Option<u32>,
    pub minor: Option<u32>,
    pub tags: Vec<String>,
}

impl LogicalVolume {
    pub fn new(vg_id: Uuid, name: impl Into<String>) -> Self {
        LogicalVolume {
            vg_id,
            id: Uuid::generate(),
            name: name.into(),
            status: LvStatus::READ | LvStatus::WRITE | LvStatus::VISIBLE,
            le_count: 0,
            segments: Vec::new(),
            lock_args: None,
            read_ahead: None,
            major: None,
            minor: None,
            tags: Vec::new(),
        }
    }

    /// Segments must be contiguous, non-overlapping, start at `le == 0`, and
    /// fully cover `[0, le_count)` (spec §3 invariant).
    pub fn validate_segments(&self) -> Result<(), String> {
        let mut expected = 0u64;
        for seg in &self.segments {
            if seg.le_start != expected {
                return Err(format!(
                    "segment gap/overlap: expected le_start {}, got {}",
                    expected, seg.le_start
                ));
            }
            seg.validate()?;
            expected = seg.le_end();
        }
        if expected != self.le_count {
            return Err(format!(
                "segments cover [0, {}) but le_count is {}",
                expected, self.le_count
            ));
        }
        Ok(())
    }

    pub fn find_seg_by_le(&self, le: u64) -> Option<&Segment> {
        self.segments.iter().find(|s| le >= s.le_start && le < s.le_end())
    }

    pub fn is_visible(&self) -> bool {
        self.status.contains(LvStatus::VISIBLE)
    }
}
