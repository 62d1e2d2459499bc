//! Metadata Area abstraction (spec §3 "Metadata Area (MDA)") and the
//! write/commit/revert transaction protocol (spec §4.C "Transaction
//! protocol", §8 "VG monotone seqno" / "Metadata consistency").

use log::{error, info, warn};

use crate::error::{CoreError, CoreResult};

use super::vg::VolumeGroup;

/// A single serialized copy of a VG's metadata, as staged through
/// `vg_write` and not yet durable until `vg_commit`.
#[derive(Debug, Clone)]
pub struct StagedMetadata {
    pub seqno: u64,
    pub body: String,
}

/// An on-disk (or in-memory, for tests) slot capable of storing one
/// metadata copy. Mirrors the verbs `metadata.c`/`import.c`/`export.c`
/// expose per MDA: `vg_read`, `vg_write`, `vg_commit`, `vg_revert`,
/// `vg_remove`.
pub trait MetadataArea {
    /// Reads the currently-committed copy, if any.
    fn vg_read(&self) -> CoreResult<Option<StagedMetadata>>;

    /// Stages a new copy without making it visible to readers yet.
    fn vg_write(&mut self, staged: StagedMetadata) -> CoreResult<()>;

    /// Makes the most recently staged copy visible and durable.
    fn vg_commit(&mut self) -> CoreResult<()>;

    /// Discards a staged-but-uncommitted write.
    fn vg_revert(&mut self) -> CoreResult<()>;

    /// Wipes this MDA's copy entirely (VG removal).
    fn vg_remove(&mut self) -> CoreResult<()>;
}

/// An in-process MDA used for tests and as the reference implementation;
/// a real deployment would back this with cache-backed block I/O through
/// [`crate::cache::Cache`] instead.
#[derive(Default)]
pub struct InMemoryMda {
    committed: Option<StagedMetadata>,
    staged: Option<StagedMetadata>,
    /// When true, `vg_commit` fails — used to exercise the "commit fails on
    /// one MDA but not another" scenario (spec §8 scenario 7).
    pub fail_commit: bool,
}

impl InMemoryMda {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MetadataArea for InMemoryMda {
    fn vg_read(&self) -> CoreResult<Option<StagedMetadata>> {
        Ok(self.committed.clone())
    }

    fn vg_write(&mut self, staged: StagedMetadata) -> CoreResult<()> {
        self.staged = Some(staged);
        Ok(())
    }

    fn vg_commit(&mut self) -> CoreResult<()> {
        if self.fail_commit {
            return Err(Box::new(CoreError::io("simulated commit failure")));
        }
        let Some(staged) = self.staged.take() else {
            return Err(Box::new(CoreError::invalid_argument("vg_commit with no staged write")));
        };
        self.committed = Some(staged);
        Ok(())
    }

    fn vg_revert(&mut self) -> CoreResult<()> {
        self.staged = None;
        Ok(())
    }

    fn vg_remove(&mut self) -> CoreResult<()> {
        self.committed = None;
        self.staged = None;
        Ok(())
    }
}

/// Runs the three-phase write protocol across every MDA attached to a VG
/// (spec §4.C "Transaction protocol" step 1-2): bumps `seqno`, writes to
/// every MDA in order, reverting already-written MDAs on any failure.
/// Commit is "single-commit durable": success requires only the first MDA
/// to commit, the rest are attempted for redundancy and failures are
/// logged, not fatal.
pub fn vg_commit_all(vg: &mut VolumeGroup, mdas: &mut [Box<dyn MetadataArea>], serialize: impl Fn(&VolumeGroup) -> String) -> CoreResult<()> {
    if vg.is_partial() {
        return Err(Box::new(CoreError::invalid_argument(
            "refusing to write metadata for a partial VG",
        )));
    }
    let new_seqno = vg.seqno + 1;
    let body = serialize(vg);
    let staged = StagedMetadata { seqno: new_seqno, body };

    let mut written = 0;
    for mda in mdas.iter_mut() {
        if let Err(e) = mda.vg_write(staged.clone()) {
            error!("vg {}: vg_write failed on an mda: {}", vg.name, e);
            for mda in mdas[..written].iter_mut().rev() {
                let _ = mda.vg_revert();
            }
            return Err(e);
        }
        written += 1;
    }

    let mut any_committed = false;
    for (i, mda) in mdas.iter_mut().enumerate() {
        match mda.vg_commit() {
            Ok(()) => {
                any_committed = true;
                if i == 0 {
                    info!("vg {}: committed seqno {} on the first mda", vg.name, new_seqno);
                }
            }
            Err(e) => warn!("vg {}: mda {} failed to commit: {}", vg.name, i, e),
        }
    }

    if !any_committed {
        return Err(Box::new(CoreError::io("no mda accepted the commit")));
    }
    vg.seqno = new_seqno;
    Ok(())
}

/// Abandons a staged write across every MDA (spec §4.C step 3).
pub fn vg_revert_all(mdas: &mut [Box<dyn MetadataArea>]) {
    for mda in mdas.iter_mut() {
        let _ = mda.vg_revert();
    }
}

/// Outcome of `vg_read` across several MDAs (spec §4.C "Read and repair").
pub struct VgReadResult {
    pub metadata: Option<StagedMetadata>,
    pub inconsistent: bool,
}

/// Reads every MDA, picks the highest-seqno copy, and flags inconsistency
/// if copies disagree or some failed to read (spec §4.C `vg_read` steps
/// 2-3). Repair (rewriting the winning copy everywhere) is left to the
/// caller via [`vg_commit_all`], since repair additionally requires the
/// write-holder lock and a `PARTIAL_VG` check the caller already has.
pub fn vg_read_all(mdas: &[Box<dyn MetadataArea>]) -> CoreResult<VgReadResult> {
    let mut best: Option<StagedMetadata> = None;
    let mut saw_failure = false;
    let mut saw_disagreement = false;

    for mda in mdas {
        match mda.vg_read() {
            Ok(Some(copy)) => match &best {
                Some(current) => {
                    if current.seqno != copy.seqno || current.body != copy.body {
                        saw_disagreement = true;
                    }
                    if copy.seqno > current.seqno {
                        best = Some(copy);
                    }
                }
                None => best = Some(copy),
            },
            Ok(None) => {}
            Err(_) => saw_failure = true,
        }
    }

    Ok(VgReadResult {
        metadata: best,
        inconsistent: saw_failure || saw_disagreement,
    })
}
