//! Request/retry/adopt state machine for the lock daemon client (spec
//! §4.D "Retry / timeout / cancel"), grounded in
//! `examples/original_source/lib/locking/lvmlockd.c`'s `_lockd_request`
//! retry loop and the per-error-code handling tables around lines
//! 1800-2600 of that file.

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::thread::sleep;
use std::time::Duration;

use log::{info, warn};

use crate::error::{CoreError, CoreResult};

use super::protocol::{LockMode, LockReply, LockRequest, RequestOpts, ResultFlags};

// Fatal/transient codes from spec §4.D's table, expressed as negative
// markers (not real errno numbers, since this crate never calls into a
// real lock daemon kernel path).
pub const E_AGAIN: i32 = -11;
pub const E_IOTIMEOUT: i32 = -210;
pub const E_NOLS: i32 = -211;
pub const E_STARTING: i32 = -212;
pub const E_EXIST: i32 = -17;
pub const E_REMOVED: i32 = -213;
pub const E_VGKILLED: i32 = -214;
pub const E_LOCKIO: i32 = -215;
pub const E_LOCKREPAIR: i32 = -216;
pub const E_ADOPT_NONE: i32 = -217;
pub const E_ADOPT_RETRY: i32 = -218;
pub const E_ORPHAN: i32 = -219;
pub const E_LMERR: i32 = -220;

/// Abstracts the wire transport so the client can be tested without a real
/// daemon socket (spec §9: vtable dispatch -> trait). Implementations
/// receive the already-encoded request record and return the raw reply
/// record; [`LockClient`] handles typed encode/decode on either side.
pub trait LockTransport {
    fn send_request(&mut self, encoded: &str) -> CoreResult<String>;
}

pub struct UnixSocketTransport {
    stream: UnixStream,
}

impl UnixSocketTransport {
    pub fn connect(path: &str) -> CoreResult<Self> {
        let stream = UnixStream::connect(path).map_err(|e| CoreError::io(e.to_string()))?;
        Ok(UnixSocketTransport { stream })
    }
}

impl LockTransport for UnixSocketTransport {
    fn send_request(&mut self, encoded: &str) -> CoreResult<String> {
        self.stream
            .write_all(encoded.as_bytes())
            .map_err(|e| CoreError::io(e.to_string()))?;
        self.stream.write_all(b"\n\n").map_err(|e| CoreError::io(e.to_string()))?;
        let mut buf = String::new();
        self.stream.read_to_string(&mut buf).map_err(|e| CoreError::io(e.to_string()))?;
        Ok(buf)
    }
}

/// A deterministic in-process transport for tests: a queue of canned
/// replies, each re-encoded to the wire format so the client's normal
/// decode path is exercised too.
pub struct MockTransport {
    pub replies: std::collections::VecDeque<LockReply>,
    pub sent: Vec<String>,
}

impl MockTransport {
    pub fn new() -> Self {
        MockTransport {
            replies: std::collections::VecDeque::new(),
            sent: Vec::new(),
        }
    }

    pub fn push_reply(&mut self, op_result: i32, flags: ResultFlags) {
        self.replies.push_back(LockReply {
            op_result,
            result_flags: flags,
            ..Default::default()
        });
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

fn encode_reply(reply: &LockReply) -> String {
    let mut out = format!("response=OK\nop_result={}\n", reply.op_result);
    if !reply.result_flags.is_empty() {
        let mut tokens = Vec::new();
        for (flag, name) in [
            (ResultFlags::NO_LOCKSPACES, "NO_LOCKSPACES"),
            (ResultFlags::NO_GL_LS, "NO_GL_LS"),
            (ResultFlags::NO_LM, "NO_LM"),
            (ResultFlags::DUP_GL_LS, "DUP_GL_LS"),
            (ResultFlags::WARN_GL_REMOVED, "WARN_GL_REMOVED"),
            (ResultFlags::SH_EXISTS, "SH_EXISTS"),
        ] {
            if reply.result_flags.contains(flag) {
                tokens.push(name);
            }
        }
        out.push_str(&format!("result_flags={}\n", tokens.join(",")));
    }
    if let Some(id) = reply.owner_host_id {
        out.push_str(&format!("owner_host_id={}\n", id));
    }
    if let Some(name) = &reply.owner_name {
        out.push_str(&format!("owner_name={}\n", name));
    }
    out
}

impl LockTransport for MockTransport {
    fn send_request(&mut self, encoded: &str) -> CoreResult<String> {
        self.sent.push(encoded.to_string());
        let reply = self
            .replies
            .pop_front()
            .ok_or_else(|| CoreError::protocol_mismatch("no canned reply queued"))?;
        Ok(encode_reply(&reply))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    Granted,
    GrantedWithWarning,
}

pub struct LockClient<T: LockTransport> {
    transport: T,
    pub retries: u32,
    pub readonly: bool,
    /// Tracks whether a sanlock bootstrap shortcut has already been used
    /// for the global lock (spec §4.D `-ENOLS` handling).
    sanlock_vg_cached: bool,
}

impl<T: LockTransport> LockClient<T> {
    pub fn new(transport: T, retries: u32) -> Self {
        LockClient {
            transport,
            retries,
            readonly: false,
            sanlock_vg_cached: false,
        }
    }

    pub fn mark_sanlock_vg_cached(&mut self) {
        self.sanlock_vg_cached = true;
    }

    /// Sends `req`, applying the retry/timeout/error-code handling from
    /// spec §4.D. Returns the granted outcome or a `CoreError` for a
    /// failure the caller must surface.
    pub fn request(&mut self, req: &LockRequest) -> CoreResult<RequestOutcome> {
        if self.readonly && req.mode == LockMode::Ex {
            return Err(Box::new(CoreError::lock_denied(
                "readonly mode rejects any request that would result in EX",
            )));
        }

        let is_shared = matches!(req.mode, LockMode::Nl | LockMode::Cr | LockMode::Pr);
        let mut attempt = 0;
        loop {
            let raw = self.transport.send_request(&req.encode())?;
            let reply = LockReply::decode(&raw)?;
            match reply.op_result {
                0 => return Ok(RequestOutcome::Granted),
                E_AGAIN | E_IOTIMEOUT => {
                    if attempt < self.retries {
                        if reply.op_result == E_IOTIMEOUT {
                            warn!("lock daemon i/o timeout, retrying ({}/{})", attempt + 1, self.retries);
                        } else if let Some(holder) = &reply.owner_name {
                            info!("lock contended by {}, retrying ({}/{})", holder, attempt + 1, self.retries);
                        }
                        attempt += 1;
                        sleep(Duration::from_secs(1));
                        continue;
                    }
                    return Err(Box::new(CoreError::lock_denied("retry budget exhausted")));
                }
                E_NOLS => {
                    let bootstrap_ok = reply.result_flags.contains(ResultFlags::NO_GL_LS)
                        && reply.result_flags.contains(ResultFlags::NO_LOCKSPACES)
                        && !self.sanlock_vg_cached;
                    if bootstrap_ok {
                        return Ok(RequestOutcome::GrantedWithWarning);
                    }
                    return Err(Box::new(CoreError::lock_denied("no lockspace found (ENOLS)")));
                }
                E_STARTING => {
                    if is_shared {
                        warn!("lockspace starting, permitting shared access without the lock");
                        return Ok(RequestOutcome::GrantedWithWarning);
                    }
                    return Err(Box::new(CoreError::lock_denied("lockspace starting, exclusive request failed")));
                }
                E_EXIST => {
                    if reply.result_flags.contains(ResultFlags::SH_EXISTS)
                        && req.lv_name.is_some()
                        && !req.opts.contains(RequestOpts::SH_EXISTS_OK)
                    {
                        return Err(Box::new(CoreError::lock_denied("SH_EXISTS without SH_EXISTS_OK")));
                    }
                    return Ok(RequestOutcome::Granted);
                }
                E_REMOVED => {
                    warn!("vg removed, treating as success");
                    return Ok(RequestOutcome::GrantedWithWarning);
                }
                E_VGKILLED | E_LOCKIO => {
                    if is_shared {
                        warn!("sanlock lease i/o failed, proceeding for shared access");
                        return Ok(RequestOutcome::GrantedWithWarning);
                    }
                    return Err(Box::new(CoreError::lock_denied("sanlock lease i/o failed")));
                }
                E_LOCKREPAIR => {
                    if is_shared {
                        warn!("sanlock lease needs repair, proceeding for shared access");
                        return Ok(RequestOutcome::GrantedWithWarning);
                    }
                    return Err(Box::new(CoreError::lock_denied(
                        "sanlock lease needs repair; retry with --lockopt repair",
                    )));
                }
                E_ADOPT_NONE | E_ADOPT_RETRY | E_ORPHAN => {
                    if is_shared {
                        warn!("adopt-mode outcome {}, permitting shared access", reply.op_result);
                        return Ok(RequestOutcome::GrantedWithWarning);
                    }
                    return Err(Box::new(CoreError::lock_denied("adopt-mode outcome failed an exclusive request")));
                }
                E_LMERR => {
                    if is_shared {
                        warn!("lock manager internal error, proceeding for shared access");
                        return Ok(RequestOutcome::GrantedWithWarning);
                    }
                    return Err(Box::new(CoreError::lock_denied("lock manager internal error")));
                }
                other => {
                    return Err(Box::new(CoreError::protocol_mismatch(format!(
                        "unrecognized op_result {}",
                        other
                    ))));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn immediate_grant_succeeds() {
        let mut transport = MockTransport::new();
        transport.push_reply(0, ResultFlags::empty());
        let mut client = LockClient::new(transport, 3);
        let req = LockRequest::new("lock_vg", "myvg", LockMode::Ex);
        assert_eq!(client.request(&req).unwrap(), RequestOutcome::Granted);
    }

    #[test]
    fn agrees_after_one_retry() {
        let mut transport = MockTransport::new();
        transport.push_reply(E_AGAIN, ResultFlags::empty());
        transport.push_reply(0, ResultFlags::empty());
        let mut client = LockClient::new(transport, 3);
        let req = LockRequest::new("lock_vg", "myvg", LockMode::Pr);
        assert_eq!(client.request(&req).unwrap(), RequestOutcome::Granted);
    }

    #[test]
    fn exhausting_retries_on_agains_fails() {
        let mut transport = MockTransport::new();
        for _ in 0..5 {
            transport.push_reply(E_AGAIN, ResultFlags::empty());
        }
        let mut client = LockClient::new(transport, 2);
        let req = LockRequest::new("lock_vg", "myvg", LockMode::Pr);
        assert!(client.request(&req).is_err());
    }

    #[test]
    fn readonly_rejects_exclusive_requests() {
        let transport = MockTransport::new();
        let mut client = LockClient::new(transport, 3);
        client.readonly = true;
        let req = LockRequest::new("lock_vg", "myvg", LockMode::Ex);
        assert!(client.request(&req).is_err());
    }

    #[test]
    fn enols_with_bootstrap_flags_grants_with_warning() {
        let mut transport = MockTransport::new();
        transport.push_reply(E_NOLS, ResultFlags::NO_GL_LS | ResultFlags::NO_LOCKSPACES);
        let mut client = LockClient::new(transport, 3);
        let req = LockRequest::new("lock_gl", "myvg", LockMode::Ex);
        assert_eq!(client.request(&req).unwrap(), RequestOutcome::GrantedWithWarning);
    }

    #[test]
    fn enols_without_bootstrap_flags_is_denied() {
        let mut transport = MockTransport::new();
        transport.push_reply(E_NOLS, ResultFlags::empty());
        let mut client = LockClient::new(transport, 3);
        let req = LockRequest::new("lock_gl", "myvg", LockMode::Ex);
        assert!(client.request(&req).is_err());
    }

    #[test]
    fn estarting_permits_shared_but_fails_exclusive() {
        let mut transport = MockTransport::new();
        transport.push_reply(E_STARTING, ResultFlags::empty());
        let mut client = LockClient::new(transport, 3);
        let req = LockRequest::new("lock_vg", "myvg", LockMode::Cr);
        assert_eq!(client.request(&req).unwrap(), RequestOutcome::GrantedWithWarning);

        let mut transport = MockTransport::new();
        transport.push_reply(E_STARTING, ResultFlags::empty());
        let mut client = LockClient::new(transport, 3);
        let req = LockRequest::new("lock_vg", "myvg", LockMode::Ex);
        assert!(client.request(&req).is_err());
    }
}
