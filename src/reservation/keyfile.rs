//! Key-file persistence (spec §4.E "Key policy", §6 "Key file"): a
//! `/var/lib/lvm/persist_key_<vg>` text file caching the derived PR key,
//! revalidated against the current `host_id` on every use.

use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, warn};

use crate::error::{CoreError, CoreResult};

const KEY_FILE_DIR: &str = "/var/lib/lvm";

pub fn key_file_path(vg_name: &str) -> PathBuf {
    Path::new(KEY_FILE_DIR).join(format!("persist_key_{}", vg_name))
}

/// Reads the cached key, skipping `#`-prefixed comment lines. Returns
/// `Ok(None)` if the file doesn't exist yet.
pub fn read_key_file(path: &Path) -> CoreResult<Option<u64>> {
    let contents = match fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(Box::new(CoreError::io(e.to_string()))),
    };
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let hex = line.strip_prefix("0x").unwrap_or(line);
        let key = u64::from_str_radix(hex, 16)
            .map_err(|_| CoreError::protocol_mismatch(format!("key file {} has invalid hex line {:?}", path.display(), line)))?;
        return Ok(Some(key));
    }
    Ok(None)
}

/// Writes `key` as `0x<hex>\n`, preceded by a comment line naming the VG.
/// Best-effort per spec §4.E "Start protocol" step 6 — callers should log
/// failures but not abort the start protocol on them.
pub fn write_key_file(path: &Path, vg_name: &str, key: u64) -> CoreResult<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).map_err(|e| CoreError::io(e.to_string()))?;
    }
    let contents = format!("# persist key for vg {}\n0x{:016x}\n", vg_name, key);
    fs::write(path, contents).map_err(|e| Box::new(CoreError::io(e.to_string())) as Box<dyn std::error::Error>)?;
    debug!("wrote persist key file {}", path.display());
    Ok(())
}

/// Lower 16 bits of a host-identity-derived key are the `host_id` (spec §3
/// PR key layout).
fn embedded_host_id(key: u64) -> u16 {
    (key & 0xFFFF) as u16
}

/// Revalidates a cached key against the currently configured `host_id`.
/// A mismatch invalidates the cache (spec §4.E: "mismatching host_id
/// triggers invalidation"). Keys with no embedded host_id semantics
/// (explicit user-supplied keys) are out of scope for this check and
/// should not be passed through this path.
pub fn revalidate(cached: u64, expected_host_id: u16) -> bool {
    let matches = embedded_host_id(cached) == expected_host_id;
    if !matches {
        warn!(
            "persist key file host_id {} does not match configured host_id {}, invalidating",
            embedded_host_id(cached),
            expected_host_id
        );
    }
    matches
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn round_trips_through_the_filesystem() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("persist_key_myvg");
        write_key_file(&path, "myvg", 0x1000000800042).unwrap();
        let read = read_key_file(&path).unwrap();
        assert_eq!(read, Some(0x1000000800042));
    }

    #[test]
    fn missing_file_reads_as_none() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("does-not-exist");
        assert_eq!(read_key_file(&path).unwrap(), None);
    }

    #[test]
    fn comment_lines_are_skipped() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("persist_key_myvg");
        fs::write(&path, "# a comment\n0x2a\n").unwrap();
        assert_eq!(read_key_file(&path).unwrap(), Some(0x2a));
    }

    #[test]
    fn revalidate_detects_host_id_mismatch() {
        let key = crate::reservation::key::from_host_identity(42, 8).unwrap();
        assert!(revalidate(key, 42));
        assert!(!revalidate(key, 43));
    }
}
