//! Sanlock lvmlock-LV bootstrap sizing and free-lease allocation (spec
//! §4.D "For `lock_type = sanlock` only"), grounded in
//! `examples/original_source/lib/locking/lvmlockd-sanlock.c`'s
//! `lm_create_lockspace_sanlock`/`lm_find_free_lock` and the lvmlock-LV
//! sizing table.

use log::info;

use crate::error::{CoreError, CoreResult};

/// 4K-sector sizing per `sanlock_align_size`; 512-byte sectors always use
/// 256 MiB regardless of align_size.
fn base_size_mib_4k(align_size_mib: u32) -> CoreResult<u64> {
    match align_size_mib {
        1 => Ok(256),
        2 => Ok(512),
        4 => Ok(1024),
        8 => Ok(1024),
        other => Err(Box::new(CoreError::invalid_argument(format!(
            "sanlock_align_size must be one of {{1,2,4,8}} MiB, got {}",
            other
        )))),
    }
}

/// Valid `host_id` upper bound for a given `sanlock_align_size` and sector
/// size (spec §4.D: "1->250, 2->500, 4->1000, 8->2000 for 4K; else 1-2000").
pub fn max_host_id(align_size_mib: u32, sector_size: u32) -> CoreResult<u32> {
    if sector_size == 4096 {
        match align_size_mib {
            1 => Ok(250),
            2 => Ok(500),
            4 => Ok(1000),
            8 => Ok(2000),
            other => Err(Box::new(CoreError::invalid_argument(format!(
                "sanlock_align_size must be one of {{1,2,4,8}} MiB, got {}",
                other
            )))),
        }
    } else {
        Ok(2000)
    }
}

pub fn validate_host_id(host_id: u32, align_size_mib: u32, sector_size: u32) -> CoreResult<()> {
    let max = max_host_id(align_size_mib, sector_size)?;
    if host_id == 0 || host_id > max {
        return Err(Box::new(CoreError::invalid_argument(format!(
            "host_id {} out of range [1, {}] for align_size {} MiB / sector {}",
            host_id, max, align_size_mib, sector_size
        ))));
    }
    Ok(())
}

/// Rounds `mib` up to the next multiple of 8 (spec §4.D: lvmlock is
/// "rounded up to a multiple of 8 MiB").
fn round_up_8(mib: u64) -> u64 {
    (mib + 7) / 8 * 8
}

/// Size in MiB for creating `lvmlock` fresh on a new sanlock VG.
pub fn initial_lvmlock_size_mib(sector_size: u32, align_size_mib: u32) -> CoreResult<u64> {
    let base = if sector_size == 4096 {
        base_size_mib_4k(align_size_mib)?
    } else {
        256
    };
    Ok(round_up_8(base))
}

/// Size in MiB to grow `lvmlock` to when converting an existing VG to
/// sanlock: base size plus 1 MiB per existing LV (512-byte sectors) or 8
/// MiB per existing LV (4K sectors).
pub fn conversion_lvmlock_size_mib(sector_size: u32, align_size_mib: u32, existing_lv_count: u64) -> CoreResult<u64> {
    let base = initial_lvmlock_size_mib(sector_size, align_size_mib)?;
    let per_lv = if sector_size == 4096 { 8 } else { 1 };
    Ok(round_up_8(base + per_lv * existing_lv_count))
}

/// Result of a `find_free_lock` attempt against the lock daemon (spec
/// §4.D "Before LV create").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreeLockOutcome {
    Found { slot: u64 },
    NeedsExtend,
}

const EMSGSIZE: i32 = -90;
/// Default `sanlock_lv_extend` (spec §4.D).
pub const DEFAULT_LV_EXTEND_MIB: u64 = 256;
const ZERO_CHUNK_MIB: u64 = 1;

/// Queries the daemon (via `probe`) for a free lease slot. On `-EMSGSIZE`
/// the caller must extend `lvmlock` by `extend_mib`, zero the new tail in
/// 1 MiB chunks (via `zero_chunk`), and retry — this function performs
/// that whole cycle once and returns the outcome, leaving the retry loop
/// to the caller so it can refresh other hosts' view of the new size in
/// between.
pub fn find_free_lock(
    probe: impl Fn() -> Result<u64, i32>,
    mut extend: impl FnMut(u64) -> CoreResult<()>,
    mut zero_chunk: impl FnMut(u64, u64) -> CoreResult<()>,
    current_size_mib: u64,
    extend_mib: u64,
) -> CoreResult<FreeLockOutcome> {
    match probe() {
        Ok(slot) => Ok(FreeLockOutcome::Found { slot }),
        Err(EMSGSIZE) => {
            info!(
                "lvmlock lease table full at {} MiB, extending by {} MiB",
                current_size_mib, extend_mib
            );
            extend(extend_mib)?;
            let mut offset = current_size_mib;
            let end = current_size_mib + extend_mib;
            while offset < end {
                zero_chunk(offset, ZERO_CHUNK_MIB)?;
                offset += ZERO_CHUNK_MIB;
            }
            Ok(FreeLockOutcome::NeedsExtend)
        }
        Err(code) => Err(Box::new(CoreError::lock_denied(format!(
            "find_free_lock failed with code {}",
            code
        )))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_size_matches_the_spec_table() {
        assert_eq!(initial_lvmlock_size_mib(512, 1).unwrap(), 256);
        assert_eq!(initial_lvmlock_size_mib(4096, 1).unwrap(), 256);
        assert_eq!(initial_lvmlock_size_mib(4096, 2).unwrap(), 512);
        assert_eq!(initial_lvmlock_size_mib(4096, 4).unwrap(), 1024);
        assert_eq!(initial_lvmlock_size_mib(4096, 8).unwrap(), 1024);
    }

    #[test]
    fn conversion_size_adds_per_lv_overhead_and_rounds_to_8() {
        // 256 + 1*3 = 259 -> rounds up to 264
        assert_eq!(conversion_lvmlock_size_mib(512, 1, 3).unwrap(), 264);
        // 256 + 8*3 = 280, already a multiple of 8
        assert_eq!(conversion_lvmlock_size_mib(4096, 1, 3).unwrap(), 280);
    }

    #[test]
    fn host_id_range_depends_on_align_size_and_sector_size() {
        assert_eq!(max_host_id(1, 4096).unwrap(), 250);
        assert_eq!(max_host_id(8, 4096).unwrap(), 2000);
        assert_eq!(max_host_id(1, 512).unwrap(), 2000);
        assert!(validate_host_id(250, 1, 4096).is_ok());
        assert!(validate_host_id(251, 1, 4096).is_err());
        assert!(validate_host_id(0, 1, 4096).is_err());
    }

    #[test]
    fn find_free_lock_extends_and_zeroes_on_emsgsize() {
        let mut extended_by = None;
        let mut zeroed = Vec::new();
        let outcome = find_free_lock(
            || Err(EMSGSIZE),
            |mib| {
                extended_by = Some(mib);
                Ok(())
            },
            |offset, len| {
                zeroed.push((offset, len));
                Ok(())
            },
            256,
            256,
        )
        .unwrap();
        assert_eq!(outcome, FreeLockOutcome::NeedsExtend);
        assert_eq!(extended_by, Some(256));
        assert_eq!(zeroed.len(), 256);
        assert_eq!(zeroed[0], (256, 1));
    }

    #[test]
    fn find_free_lock_returns_slot_on_success() {
        let outcome = find_free_lock(|| Ok(7), |_| Ok(()), |_, _| Ok(()), 256, 256).unwrap();
        assert_eq!(outcome, FreeLockOutcome::Found { slot: 7 });
    }
}
