//! The async I/O engine contract (§4.B "Async engine contract") and its two
//! implementations. Grounded in `bcache.c`'s `struct io_engine` vtable
//! (`issue`/`wait`/`destroy`/`max_io`), reshaped as a trait.

use std::collections::VecDeque;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};

use log::warn;
use threadpool::ThreadPool;

pub use crate::cache::block::Dir;

/// Largest batch of completions an engine is expected to hand back from a
/// single `wait` call (§4.B, `bcache.c`'s `MAX_EVENT`).
pub const MAX_EVENT: usize = 64;

/// A completed I/O: `context` is whatever opaque value the caller passed to
/// `issue`, `error` is 0 on success, a negative errno otherwise.
#[derive(Debug, Clone, Copy)]
pub struct Completion {
    pub context: u64,
    pub error: i32,
}

/// Implemented by both the in-process synchronous engine and the
/// thread-pool-backed asynchronous one (§4.B, §9 "engine dispatch via
/// vtable of function pointers" -> trait).
pub trait IoEngine: Send {
    /// Submits exactly one I/O covering sectors `[start_sector,
    /// end_sector)` on file descriptor `fd`. `buf` must be page-aligned.
    /// Returns `false` (and logs a warning) on misaligned buffers or if the
    /// engine's outstanding-I/O capacity is exhausted.
    fn issue(&mut self, dir: Dir, fd: RawFd, start_sector: u64, end_sector: u64, buf: &mut [u8], context: u64) -> bool;

    /// Blocks until at least one submission completes, then drains up to
    /// `MAX_EVENT` ready completions into `out`.
    fn wait(&mut self, out: &mut Vec<Completion>);

    /// Maximum number of outstanding I/Os this engine can track at once.
    fn max_io(&self) -> usize;

    /// Number of I/Os issued but not yet completed.
    fn nr_pending(&self) -> usize;
}

const PAGE_SIZE: usize = 4096;

fn is_aligned(buf: &[u8]) -> bool {
    (buf.as_ptr() as usize) % PAGE_SIZE == 0
}

fn do_pread(fd: RawFd, offset: u64, buf: &mut [u8]) -> i32 {
    let n = unsafe { libc::pread(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), offset as libc::off_t) };
    if n < 0 {
        -io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO)
    } else if (n as usize) < buf.len() {
        -libc::ENODATA
    } else {
        0
    }
}

fn do_pwrite(fd: RawFd, offset: u64, buf: &[u8]) -> i32 {
    let n = unsafe { libc::pwrite(fd, buf.as_ptr() as *const libc::c_void, buf.len(), offset as libc::off_t) };
    if n < 0 {
        -io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO)
    } else if (n as usize) < buf.len() {
        -libc::ENODATA
    } else {
        0
    }
}

/// Performs the pread/pwrite inline in `issue`, and hands the already-known
/// result back on the next `wait` (§4.B: "the synchronous implementation
/// performs pread/pwrite in the `issue` call and defers the completion
/// callback to `wait`").
pub struct SyncIoEngine {
    sector_size: u64,
    pending: VecDeque<Completion>,
    max_io: usize,
}

impl SyncIoEngine {
    pub fn new(sector_size: u64) -> Self {
        SyncIoEngine {
            sector_size,
            pending: VecDeque::new(),
            max_io: MAX_EVENT,
        }
    }
}

impl IoEngine for SyncIoEngine {
    fn issue(&mut self, dir: Dir, fd: RawFd, start_sector: u64, end_sector: u64, buf: &mut [u8], context: u64) -> bool {
        if !is_aligned(buf) {
            warn!("io engine: buffer for context {} is not page-aligned", context);
            return false;
        }
        let offset = start_sector * self.sector_size;
        let len = ((end_sector - start_sector) * self.sector_size) as usize;
        let err = match dir {
            Dir::Read => do_pread(fd, offset, &mut buf[..len]),
            Dir::Write => do_pwrite(fd, offset, &buf[..len]),
        };
        self.pending.push_back(Completion { context, error: err });
        true
    }

    fn wait(&mut self, out: &mut Vec<Completion>) {
        while out.len() < MAX_EVENT {
            match self.pending.pop_front() {
                Some(c) => out.push(c),
                None => break,
            }
        }
    }

    fn max_io(&self) -> usize {
        self.max_io
    }

    fn nr_pending(&self) -> usize {
        self.pending.len()
    }
}

/// Stands in for a kernel AIO context (`io_uring`/`libaio`) with a
/// background thread pool driving real pread/pwrite calls and a bounded
/// completion queue (§4.B, §9). The public contract — batch up to
/// `MAX_EVENT` completions per `wait`, no recursive submission from
/// callbacks, fork-safety check — matches `bcache.c`'s async engine even
/// though the underlying mechanism is a `threadpool::ThreadPool` rather
/// than real kernel AIO.
pub struct AsyncIoEngine {
    sector_size: u64,
    pool: ThreadPool,
    tx: Sender<Completion>,
    rx: Receiver<Completion>,
    nr_pending: Arc<Mutex<usize>>,
    max_io: usize,
    creator_pid: u32,
}

impl AsyncIoEngine {
    pub fn new(sector_size: u64, max_io: usize) -> Self {
        let (tx, rx) = channel();
        AsyncIoEngine {
            sector_size,
            pool: ThreadPool::new(4),
            tx,
            rx,
            nr_pending: Arc::new(Mutex::new(0)),
            max_io,
            creator_pid: std::process::id(),
        }
    }

    /// Fork safety (§4.B): a clone of the process that is not the creator
    /// must not tear down the (thread-pool-backed) engine's resources —
    /// those threads do not exist in the child, tearing down would be a
    /// no-op at best and a double-free of shared state at worst in the
    /// kernel-AIO original. We simply skip thread-pool teardown.
    pub fn destroy(self) {
        if std::process::id() != self.creator_pid {
            return;
        }
        self.pool.join();
    }
}

impl IoEngine for AsyncIoEngine {
    fn issue(&mut self, dir: Dir, fd: RawFd, start_sector: u64, end_sector: u64, buf: &mut [u8], context: u64) -> bool {
        if !is_aligned(buf) {
            warn!("io engine: buffer for context {} is not page-aligned", context);
            return false;
        }
        let pending = *self.nr_pending.lock().unwrap();
        if pending >= self.max_io {
            warn!("io engine: max_io ({}) exhausted, rejecting submission", self.max_io);
            return false;
        }
        *self.nr_pending.lock().unwrap() += 1;

        let sector_size = self.sector_size;
        let tx = self.tx.clone();
        let nr_pending = Arc::clone(&self.nr_pending);
        // Buffer ownership can't cross into the worker closure safely
        // without unsafe raw-pointer plumbing in a bounded demo engine, so
        // the transfer happens via a raw pointer guarded by the caller's
        // guarantee (held from `issue` through the matching `wait`) that
        // the block buffer outlives the in-flight I/O.
        let ptr = buf.as_mut_ptr() as usize;
        let len = buf.len();
        let offset = start_sector * sector_size;
        let io_len = ((end_sector - start_sector) * sector_size) as usize;

        self.pool.execute(move || {
            let slice = unsafe { std::slice::from_raw_parts_mut(ptr as *mut u8, len) };
            let err = match dir {
                Dir::Read => do_pread(fd, offset, &mut slice[..io_len]),
                Dir::Write => do_pwrite(fd, offset, &slice[..io_len]),
            };
            *nr_pending.lock().unwrap() -= 1;
            let _ = tx.send(Completion { context, error: err });
        });
        true
    }

    fn wait(&mut self, out: &mut Vec<Completion>) {
        // Block for at least one, per the contract, then drain whatever
        // else is immediately ready up to MAX_EVENT.
        if let Ok(first) = self.rx.recv() {
            out.push(first);
        }
        while out.len() < MAX_EVENT {
            match self.rx.try_recv() {
                Ok(c) => out.push(c),
                Err(_) => break,
            }
        }
    }

    fn max_io(&self) -> usize {
        self.max_io
    }

    fn nr_pending(&self) -> usize {
        *self.nr_pending.lock().unwrap()
    }
}

/// Deterministic engine for tests: never touches a real fd, completes
/// synchronously with a configurable outcome, and counts calls so test
/// scenarios (spec §8, "engine `issue` called exactly once") can assert on
/// them directly. Not `cfg(test)`-gated so integration tests (`tests/`)
/// can use it too.
pub mod mock {
    use super::*;
    use std::cell::RefCell;

    pub struct MockIoEngine {
        pub issue_count: RefCell<usize>,
        pub wait_count: RefCell<usize>,
        pending: RefCell<VecDeque<Completion>>,
        pub fail_reads: bool,
    }

    impl MockIoEngine {
        pub fn new() -> Self {
            MockIoEngine {
                issue_count: RefCell::new(0),
                wait_count: RefCell::new(0),
                pending: RefCell::new(VecDeque::new()),
                fail_reads: false,
            }
        }
    }

    impl IoEngine for MockIoEngine {
        fn issue(&mut self, _dir: Dir, _fd: RawFd, _sb: u64, _se: u64, buf: &mut [u8], context: u64) -> bool {
            *self.issue_count.borrow_mut() += 1;
            let err = if self.fail_reads { -libc::EIO } else { 0 };
            if err == 0 {
                for b in buf.iter_mut() {
                    *b = 0;
                }
            }
            self.pending.borrow_mut().push_back(Completion { context, error: err });
            true
        }

        fn wait(&mut self, out: &mut Vec<Completion>) {
            *self.wait_count.borrow_mut() += 1;
            while out.len() < MAX_EVENT {
                let popped = self.pending.borrow_mut().pop_front();
                match popped {
                    Some(c) => out.push(c),
                    None => break,
                }
            }
        }

        fn max_io(&self) -> usize {
            MAX_EVENT
        }

        fn nr_pending(&self) -> usize {
            self.pending.borrow().len()
        }
    }
}
