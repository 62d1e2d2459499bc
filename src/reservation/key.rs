//! Key derivation and the PR key bit layout (spec §3 "PR key", §4.E "Key
//! policy" / "Generation coupling"), grounded in
//! `examples/original_source/lib/device/persist.c`'s key-derivation order
//! and `lib/locking/lvmlockd-sanlock.c`'s generation lookup.

use crate::error::{CoreError, CoreResult};

/// Upper byte tag for a host-identity-derived key (spec §3 "PR key").
const KEY_TAG: u64 = 0x10;

/// Builds a PR key from host identity: upper byte `0x10`, middle 24 bits
/// generation, lower 16 bits `host_id`.
pub fn from_host_identity(host_id: u16, generation: u32) -> CoreResult<u64> {
    if generation > 0x00FF_FFFF {
        return Err(Box::new(CoreError::invalid_argument(format!(
            "sanlock generation {} does not fit in 24 bits",
            generation
        ))));
    }
    Ok((KEY_TAG << 40) | ((generation as u64) << 16) | host_id as u64)
}

/// Parses a user-supplied `local_pr_key`: hex digits only, non-empty, at
/// most 16 hex digits (fits in a u64).
pub fn parse_explicit_key(s: &str) -> CoreResult<u64> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    if s.is_empty() {
        return Err(Box::new(CoreError::invalid_argument("local_pr_key must not be empty")));
    }
    if s.len() > 16 {
        return Err(Box::new(CoreError::invalid_argument(format!(
            "local_pr_key '{}' is longer than 16 hex digits",
            s
        ))));
    }
    if !s.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(Box::new(CoreError::invalid_argument(format!(
            "local_pr_key '{}' contains non-hex characters",
            s
        ))));
    }
    u64::from_str_radix(s, 16).map_err(|e| Box::new(CoreError::invalid_argument(e.to_string())) as Box<dyn std::error::Error>)
}

/// The three-step derivation order from spec §4.E "Key policy".
#[derive(Debug, Clone)]
pub enum KeySource {
    Explicit { hex: String },
    SanlockGeneration { host_id: u16, generation: u32 },
    HostIdOnly { host_id: u16 },
}

pub fn derive_key(
    local_pr_key: Option<&str>,
    local_host_id: Option<u16>,
    vg_is_sanlock: bool,
    current_generation: impl FnOnce() -> CoreResult<u32>,
) -> CoreResult<(u64, KeySource)> {
    if let Some(hex) = local_pr_key {
        let key = parse_explicit_key(hex)?;
        return Ok((key, KeySource::Explicit { hex: hex.to_string() }));
    }
    if let Some(host_id) = local_host_id {
        if vg_is_sanlock {
            let generation = current_generation()?;
            let key = from_host_identity(host_id, generation)?;
            return Ok((key, KeySource::SanlockGeneration { host_id, generation }));
        }
        let key = from_host_identity(host_id, 0)?;
        return Ok((key, KeySource::HostIdOnly { host_id }));
    }
    Err(Box::new(CoreError::invalid_argument(
        "no local_pr_key and no local_host_id: cannot derive a PR key",
    )))
}

/// Rewrites `key` to embed generation `previous_generation + 1` (spec
/// §4.E "Generation coupling"). A no-op if the key already encodes that
/// generation.
pub fn rewrite_generation(key: u64, host_id: u16, previous_generation: u32) -> CoreResult<u64> {
    let new_generation = previous_generation
        .checked_add(1)
        .ok_or_else(|| CoreError::invalid_argument("sanlock generation overflow"))?;
    let candidate = from_host_identity(host_id, new_generation)?;
    if candidate == key {
        return Ok(key);
    }
    Ok(candidate)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_identity_key_matches_the_worked_example() {
        // spec worked example: host_id=42, previous generation=7 -> new
        // generation 8 -> key 0x1000000800042.
        let key = from_host_identity(42, 8).unwrap();
        assert_eq!(key, 0x1000000800042);
    }

    #[test]
    fn explicit_key_rejects_empty_too_long_and_non_hex() {
        assert!(parse_explicit_key("").is_err());
        assert!(parse_explicit_key("0123456789abcdef0").is_err());
        assert!(parse_explicit_key("zz").is_err());
        assert_eq!(parse_explicit_key("0x2a").unwrap(), 0x2a);
    }

    #[test]
    fn derive_key_prefers_explicit_over_sanlock_over_host_id_alone() {
        let (key, source) = derive_key(Some("0xabc"), Some(42), true, || Ok(7)).unwrap();
        assert_eq!(key, 0xabc);
        assert!(matches!(source, KeySource::Explicit { .. }));

        let (key, source) = derive_key(None, Some(42), true, || Ok(7)).unwrap();
        assert_eq!(key, from_host_identity(42, 7).unwrap());
        assert!(matches!(source, KeySource::SanlockGeneration { .. }));

        let (key, source) = derive_key(None, Some(42), false, || Ok(7)).unwrap();
        assert_eq!(key, from_host_identity(42, 0).unwrap());
        assert!(matches!(source, KeySource::HostIdOnly { .. }));
    }

    #[test]
    fn rewrite_generation_is_idempotent_when_already_current() {
        let key = from_host_identity(42, 8).unwrap();
        assert_eq!(rewrite_generation(key, 42, 7).unwrap(), key);
    }

    #[test]
    fn rewrite_generation_advances_from_a_stale_key() {
        let stale = from_host_identity(42, 3).unwrap();
        let fresh = rewrite_generation(stale, 42, 7).unwrap();
        assert_eq!(fresh, from_host_identity(42, 8).unwrap());
    }
}
