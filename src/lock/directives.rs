//! LV lock redirection rules (spec §4.D "LV lock directives"), grounded in
//! `examples/original_source/lib/locking/lvmlockd.c`'s `lockd_lv`/
//! `_lockd_lv_name` dispatch, which decides per LV-type whether a request
//! is redirected to another LV, forced to no-lock, or has shared access
//! disallowed.

use super::protocol::LockMode;

/// The kind of LV a lock request targets, as far as redirection cares.
/// Mirrors the subset of `lv_types`/segment roles the daemon switches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LvRole {
    Plain,
    ThinPool,
    ThinVolume,
    VdoPool,
    VdoVolume,
    CachePool,
    CacheVolume,
    SnapshotCow,
    Mirror,
    Raid,
    ExternalOrigin,
    PoolMetadata,
    PoolData,
    MirrorLog,
    MirrorImage,
    RaidImage,
    RaidMetadata,
    PoolMetadataSpare,
    LvmlockLv,
}

/// What `lockd_lv` decides to do with a request for a given LV role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    /// Lock the LV itself under its own name.
    Direct,
    /// Redirect the request to a different LV's lock (thin pool, VDO pool,
    /// cache pool/volume, snapshot origin).
    RedirectTo(String),
    /// No lock is taken at all.
    NoLock,
}

/// Per-batch memoization for thin-pool redirection (spec §4.D: "Memoized
/// flags on the pool... prevent repeated requests for a batch").
#[derive(Debug, Default)]
pub struct ThinPoolLockState {
    locked: bool,
    unlocked: bool,
}

impl ThinPoolLockState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns whether the pool's EX lock still needs to be acquired for
    /// this batch of thin-volume operations.
    pub fn needs_lock(&self) -> bool {
        !self.locked
    }

    pub fn mark_locked(&mut self) {
        self.locked = true;
    }

    pub fn mark_unlocked(&mut self) {
        self.unlocked = true;
        self.locked = false;
    }
}

/// Decides how to handle a lock request for an LV of the given `role`.
/// `container` is the name of the thin pool / VDO pool / cache pool / main
/// LV / snapshot origin this LV belongs to, when relevant.
pub fn directive(role: LvRole, container: Option<&str>) -> Directive {
    match role {
        LvRole::ThinVolume => Directive::RedirectTo(
            container.expect("thin volume must carry its pool's name").to_string(),
        ),
        LvRole::VdoVolume => Directive::RedirectTo(
            container.expect("vdo volume must carry its pool's name").to_string(),
        ),
        LvRole::CachePool | LvRole::CacheVolume => Directive::RedirectTo(
            container.expect("cache pool/volume must carry the main LV's name").to_string(),
        ),
        LvRole::SnapshotCow => Directive::RedirectTo(
            container.expect("snapshot cow must carry the origin's name").to_string(),
        ),
        LvRole::PoolMetadata
        | LvRole::PoolData
        | LvRole::MirrorLog
        | LvRole::MirrorImage
        | LvRole::RaidImage
        | LvRole::RaidMetadata
        | LvRole::PoolMetadataSpare
        | LvRole::LvmlockLv => Directive::NoLock,
        LvRole::Plain | LvRole::ThinPool | LvRole::VdoPool | LvRole::Mirror | LvRole::Raid | LvRole::ExternalOrigin => {
            Directive::Direct
        }
    }
}

/// Shared (SH) activation is disallowed for these roles (spec §4.D
/// `MODE_NO_SH`): the request must escalate to EX.
pub fn disallows_shared(role: LvRole) -> bool {
    matches!(
        role,
        LvRole::Mirror
            | LvRole::Raid
            | LvRole::ThinPool
            | LvRole::ThinVolume
            | LvRole::VdoPool
            | LvRole::VdoVolume
            | LvRole::CachePool
            | LvRole::CacheVolume
            | LvRole::ExternalOrigin
    )
}

/// `lvresize`-on-a-mounted-clustered-filesystem special case (spec §4.D):
/// when the LV is mounted gfs2/ocfs2 (per `/etc/mtab`), SH is acceptable in
/// place of EX for the resize, followed by a cluster-wide refresh.
pub fn mounted_cluster_fs(mtab: &str, device_path: &str) -> Option<&'static str> {
    for line in mtab.lines() {
        let mut fields = line.split_whitespace();
        let dev = fields.next()?;
        let _mountpoint = fields.next();
        let fstype = fields.next();
        if dev == device_path {
            return match fstype {
                Some("gfs2") => Some("gfs2"),
                Some("ocfs2") => Some("ocfs2"),
                _ => None,
            };
        }
    }
    None
}

/// Resolves the mode to actually request for an `lvresize` given whether
/// the target device is a mounted cluster filesystem.
pub fn lvresize_mode(is_cluster_fs_mounted: bool) -> LockMode {
    if is_cluster_fs_mounted {
        LockMode::Cr
    } else {
        LockMode::Ex
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thin_volume_redirects_to_its_pool() {
        let d = directive(LvRole::ThinVolume, Some("pool0"));
        assert_eq!(d, Directive::RedirectTo("pool0".to_string()));
    }

    #[test]
    fn pool_metadata_gets_no_lock() {
        assert_eq!(directive(LvRole::PoolMetadata, None), Directive::NoLock);
        assert_eq!(directive(LvRole::LvmlockLv, None), Directive::NoLock);
    }

    #[test]
    fn plain_lv_locks_directly() {
        assert_eq!(directive(LvRole::Plain, None), Directive::Direct);
    }

    #[test]
    fn thin_pool_disallows_shared_but_plain_lv_does_not() {
        assert!(disallows_shared(LvRole::ThinPool));
        assert!(!disallows_shared(LvRole::Plain));
    }

    #[test]
    fn thin_pool_lock_state_memoizes_across_a_batch() {
        let mut state = ThinPoolLockState::new();
        assert!(state.needs_lock());
        state.mark_locked();
        assert!(!state.needs_lock());
        state.mark_unlocked();
        assert!(state.needs_lock());
    }

    #[test]
    fn mounted_cluster_fs_detected_from_mtab() {
        let mtab = "/dev/vg0/lv0 /mnt/lv0 gfs2 rw,relatime 0 0\n/dev/vg0/lv1 /mnt/lv1 ext4 rw 0 0\n";
        assert_eq!(mounted_cluster_fs(mtab, "/dev/vg0/lv0"), Some("gfs2"));
        assert_eq!(mounted_cluster_fs(mtab, "/dev/vg0/lv1"), None);
    }

    #[test]
    fn lvresize_mode_prefers_shared_on_cluster_fs() {
        assert_eq!(lvresize_mode(true), LockMode::Cr);
        assert_eq!(lvresize_mode(false), LockMode::Ex);
    }
}
