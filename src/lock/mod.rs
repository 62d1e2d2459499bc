//! Distributed lock client (spec §4.D): wire protocol, request/retry/adopt
//! state machine, sanlock lvmlock-LV bootstrap, and LV lock directives.

pub mod client;
pub mod directives;
pub mod protocol;
pub mod sanlock;

pub use client::{LockClient, LockTransport, RequestOutcome, UnixSocketTransport};
pub use protocol::{LockMode, LockReply, LockRequest, LockScope, RequestOpts, ResultFlags, VgLockType};
