//! 128-bit identifiers for PVs, VGs, LVs and snapshots (spec §3 ID space).
//!
//! Encoded in text as 32 base-62 digits grouped `6-4-4-4-4-4-6`. Two UUIDs
//! compare equal iff their 128 bits are equal.

use std::fmt;

use rand::rngs::OsRng;
use rand::RngCore;

const BASE62_ALPHABET: &[u8; 62] =
    b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";
const GROUP_SIZES: [usize; 7] = [6, 4, 4, 4, 4, 4, 6];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Uuid(u128);

impl Uuid {
    /// Generates a fresh UUID from a cryptographic RNG.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 16];
        OsRng.fill_bytes(&mut bytes);
        Uuid(u128::from_be_bytes(bytes))
    }

    pub const fn from_u128(v: u128) -> Self {
        Uuid(v)
    }

    pub const fn as_u128(&self) -> u128 {
        self.0
    }

    /// Renders as 32 base-62 digits grouped `6-4-4-4-4-4-6`, most significant
    /// digit first.
    pub fn to_grouped_string(&self) -> String {
        let mut digits = [0u8; 32];
        let mut n = self.0;
        for slot in digits.iter_mut().rev() {
            *slot = BASE62_ALPHABET[(n % 62) as usize];
            n /= 62;
        }
        let mut out = String::with_capacity(32 + GROUP_SIZES.len() - 1);
        let mut pos = 0;
        for (i, &size) in GROUP_SIZES.iter().enumerate() {
            if i > 0 {
                out.push('-');
            }
            out.push_str(std::str::from_utf8(&digits[pos..pos + size]).unwrap());
            pos += size;
        }
        out
    }

    /// Parses the `6-4-4-4-4-4-6` grouped form (dashes optional, but if
    /// present they must land on the group boundaries).
    pub fn parse(s: &str) -> Result<Self, crate::error::CoreError> {
        let mut digits = String::with_capacity(32);
        for part in s.split('-') {
            digits.push_str(part);
        }
        if digits.len() != 32 {
            return Err(crate::error::CoreError::invalid_argument(format!(
                "malformed UUID {:?}: expected 32 base-62 digits",
                s
            )));
        }
        let mut value: u128 = 0;
        for c in digits.bytes() {
            let digit = BASE62_ALPHABET
                .iter()
                .position(|&b| b == c)
                .ok_or_else(|| {
                    crate::error::CoreError::invalid_argument(format!(
                        "malformed UUID {:?}: invalid base-62 digit {:?}",
                        s, c as char
                    ))
                })?;
            value = value
                .checked_mul(62)
                .and_then(|v| v.checked_add(digit as u128))
                .ok_or_else(|| {
                    crate::error::CoreError::invalid_argument(format!(
                        "malformed UUID {:?}: overflows 128 bits",
                        s
                    ))
                })?;
        }
        Ok(Uuid(value))
    }
}

impl fmt::Display for Uuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_grouped_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_text() {
        let id = Uuid::generate();
        let text = id.to_grouped_string();
        assert_eq!(Uuid::parse(&text).unwrap(), id);
    }

    #[test]
    fn grouping_matches_6_4_4_4_4_4_6() {
        let id = Uuid::from_u128(0);
        let text = id.to_grouped_string();
        let groups: Vec<&str> = text.split('-').collect();
        assert_eq!(
            groups.iter().map(|g| g.len()).collect::<Vec<_>>(),
            vec![6, 4, 4, 4, 4, 4, 6]
        );
    }

    #[test]
    fn distinct_uuids_are_unequal() {
        assert_ne!(Uuid::generate(), Uuid::generate());
    }

    #[test]
    fn rejects_malformed_text() {
        assert!(Uuid::parse("too-short").is_err());
        assert!(Uuid::parse(&"!".repeat(32)).is_err());
    }
}
