//! Wire protocol with the external lock daemon (spec §6 "Lock daemon wire
//! format", §4.D "Request protocol"): newline-framed key=value records, one
//! request, one reply. Grounded in
//! `examples/original_source/lib/locking/lvmlockd.c`'s request-building and
//! `result_flags` parsing (`_flags_str_to_lockd_flags`).

use std::collections::HashMap;
use std::fmt;

use bitflags::bitflags;

use crate::error::{CoreError, CoreResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockScope {
    Global,
    Vg,
    Lv,
}

/// Six lock modes with the compatibility matrix from spec §4.D. `Na`/`Un`
/// are wire-level "no mode"/"unlock" tokens, not part of the matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Nl,
    Cr,
    Cw,
    Pr,
    Pw,
    Ex,
}

impl LockMode {
    pub fn wire_token(self) -> &'static str {
        match self {
            LockMode::Nl => "nl",
            LockMode::Cr => "cr",
            LockMode::Cw => "cw",
            LockMode::Pr => "pr",
            LockMode::Pw => "pw",
            LockMode::Ex => "ex",
        }
    }

    /// The matrix in spec §4.D: `self` is compatible with `other` if both
    /// can be held simultaneously by different holders.
    pub fn compatible_with(self, other: LockMode) -> bool {
        use LockMode::*;
        let rank = |m: LockMode| match m {
            Nl => 0,
            Cr => 1,
            Cw => 2,
            Pr => 3,
            Pw => 4,
            Ex => 5,
        };
        // The matrix is symmetric and its upper triangle (by rank) is
        // monotonically "more restrictive", matching spec §4.D's table.
        const MATRIX: [[bool; 6]; 6] = [
            [true, true, true, true, true, true],
            [true, true, true, true, true, false],
            [true, true, true, false, false, false],
            [true, true, false, true, false, false],
            [true, true, false, false, false, false],
            [true, false, false, false, false, false],
        ];
        MATRIX[rank(self)][rank(other)]
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct RequestOpts: u32 {
        const ADOPT       = 1 << 0;
        const ADOPT_ONLY  = 1 << 1;
        const NODELAY     = 1 << 2;
        const REPAIR      = 1 << 3;
        const PERSISTENT  = 1 << 4;
        const FORCE       = 1 << 5;
        const SH_EXISTS_OK = 1 << 6;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ResultFlags: u32 {
        const NO_LOCKSPACES  = 1 << 0;
        const NO_GL_LS       = 1 << 1;
        const NO_LM          = 1 << 2;
        const DUP_GL_LS      = 1 << 3;
        const WARN_GL_REMOVED = 1 << 4;
        const SH_EXISTS      = 1 << 5;
    }
}

impl ResultFlags {
    /// Parses the comma-separated token list in the `result_flags` reply
    /// field (`lvmlockd.c`'s `_flags_str_to_lockd_flags`).
    pub fn parse(s: &str) -> Self {
        let mut flags = ResultFlags::empty();
        for tok in s.split(',') {
            match tok.trim() {
                "NO_LOCKSPACES" => flags |= ResultFlags::NO_LOCKSPACES,
                "NO_GL_LS" => flags |= ResultFlags::NO_GL_LS,
                "NO_LM" => flags |= ResultFlags::NO_LM,
                "DUP_GL_LS" => flags |= ResultFlags::DUP_GL_LS,
                "WARN_GL_REMOVED" => flags |= ResultFlags::WARN_GL_REMOVED,
                "SH_EXISTS" => flags |= ResultFlags::SH_EXISTS,
                _ => {}
            }
        }
        flags
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VgLockType {
    None,
    Dlm,
    Sanlock,
    Idm,
    Clvm,
}

impl fmt::Display for VgLockType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            VgLockType::None => "none",
            VgLockType::Dlm => "dlm",
            VgLockType::Sanlock => "sanlock",
            VgLockType::Idm => "idm",
            VgLockType::Clvm => "clvm",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone)]
pub struct LockRequest {
    pub cmd: String,
    pub pid: u32,
    pub mode: LockMode,
    pub opts: RequestOpts,
    pub vg_name: String,
    pub vg_lock_type: VgLockType,
    pub vg_lock_args: Option<String>,
    pub lv_name: Option<String>,
    pub lv_uuid: Option<String>,
    pub lv_lock_args: Option<String>,
    /// idm-mode VGs carry the PV paths backing the VG or LV.
    pub path_args: Vec<String>,
}

impl LockRequest {
    pub fn new(cmd: impl Into<String>, vg_name: impl Into<String>, mode: LockMode) -> Self {
        LockRequest {
            cmd: cmd.into(),
            pid: std::process::id(),
            mode,
            opts: RequestOpts::empty(),
            vg_name: vg_name.into(),
            vg_lock_type: VgLockType::None,
            vg_lock_args: None,
            lv_name: None,
            lv_uuid: None,
            lv_lock_args: None,
            path_args: Vec::new(),
        }
    }

    /// Encodes as newline-framed `key=value` pairs, one record.
    pub fn encode(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("cmd={}\n", self.cmd));
        out.push_str(&format!("pid={}\n", self.pid));
        out.push_str(&format!("mode={}\n", self.mode.wire_token()));
        out.push_str(&format!("vg_name={}\n", self.vg_name));
        out.push_str(&format!("vg_lock_type={}\n", self.vg_lock_type));
        if let Some(args) = &self.vg_lock_args {
            out.push_str(&format!("vg_lock_args={}\n", args));
        }
        if let Some(name) = &self.lv_name {
            out.push_str(&format!("lv_name={}\n", name));
        }
        if let Some(uuid) = &self.lv_uuid {
            out.push_str(&format!("lv_uuid={}\n", uuid));
        }
        if let Some(args) = &self.lv_lock_args {
            out.push_str(&format!("lv_lock_args={}\n", args));
        }
        if !self.path_args.is_empty() {
            out.push_str(&format!("path_num={}\n", self.path_args.len()));
            for (i, p) in self.path_args.iter().enumerate() {
                out.push_str(&format!("path[{}]={}\n", i, p));
            }
        }
        out
    }
}

#[derive(Debug, Clone, Default)]
pub struct LockReply {
    pub op_result: i32,
    pub result_flags: ResultFlags,
    pub owner_host_id: Option<u32>,
    pub owner_generation: Option<u64>,
    pub owner_name: Option<String>,
    pub vg_lock_args: Option<String>,
    pub lv_lock_args: Option<String>,
    pub prev_generation: Option<u64>,
}

impl LockReply {
    /// Decodes a reply record. Requires a `response=OK` line and an
    /// `op_result`; anything else is a protocol mismatch (spec §7).
    pub fn decode(s: &str) -> CoreResult<Self> {
        let mut fields: HashMap<&str, &str> = HashMap::new();
        for line in s.lines() {
            if let Some((k, v)) = line.split_once('=') {
                fields.insert(k, v);
            }
        }
        if fields.get("response") != Some(&"OK") {
            return Err(Box::new(CoreError::protocol_mismatch(
                "lock daemon reply missing response=OK",
            )));
        }
        let op_result = fields
            .get("op_result")
            .ok_or_else(|| CoreError::protocol_mismatch("lock daemon reply missing op_result"))?
            .parse::<i32>()
            .map_err(|_| CoreError::protocol_mismatch("op_result is not an integer"))?;

        Ok(LockReply {
            op_result,
            result_flags: fields.get("result_flags").map(|s| ResultFlags::parse(s)).unwrap_or_default(),
            owner_host_id: fields.get("owner_host_id").and_then(|s| s.parse().ok()),
            owner_generation: fields.get("owner_generation").and_then(|s| s.parse().ok()),
            owner_name: fields.get("owner_name").map(|s| s.to_string()),
            vg_lock_args: fields.get("vg_lock_args").map(|s| s.to_string()),
            lv_lock_args: fields.get("lv_lock_args").map(|s| s.to_string()),
            prev_generation: fields.get("prev_generation").and_then(|s| s.parse().ok()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compatibility_matrix_matches_the_spec_table() {
        assert!(LockMode::Nl.compatible_with(LockMode::Ex));
        assert!(LockMode::Cr.compatible_with(LockMode::Cr));
        assert!(!LockMode::Cr.compatible_with(LockMode::Ex));
        assert!(LockMode::Pr.compatible_with(LockMode::Cr));
        assert!(!LockMode::Pr.compatible_with(LockMode::Cw));
        assert!(!LockMode::Ex.compatible_with(LockMode::Ex));
    }

    #[test]
    fn request_encodes_as_key_value_lines() {
        let req = LockRequest::new("lock_vg", "myvg", LockMode::Ex);
        let encoded = req.encode();
        assert!(encoded.contains("cmd=lock_vg\n"));
        assert!(encoded.contains("mode=ex\n"));
        assert!(encoded.contains("vg_name=myvg\n"));
    }

    #[test]
    fn reply_parses_result_flags_and_owner_fields() {
        let raw = "response=OK\nop_result=-16\nresult_flags=NO_GL_LS,DUP_GL_LS\nowner_host_id=3\n";
        let reply = LockReply::decode(raw).unwrap();
        assert_eq!(reply.op_result, -16);
        assert!(reply.result_flags.contains(ResultFlags::NO_GL_LS));
        assert!(reply.result_flags.contains(ResultFlags::DUP_GL_LS));
        assert_eq!(reply.owner_host_id, Some(3));
    }

    #[test]
    fn reply_without_response_ok_is_a_protocol_mismatch() {
        assert!(LockReply::decode("op_result=0\n").is_err());
    }
}
