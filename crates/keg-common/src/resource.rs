//! Memory quantity parsing.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{KegError, KegResult};

/// A memory ceiling in bytes.
///
/// Parsed with the same suffix rules the kernel applies to
/// `memory.limit_in_bytes`: an optional `k`, `m`, `g` or `t` suffix
/// (either case) multiplies by a power of 1024.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MemoryLimit(u64);

impl MemoryLimit {
    /// Create a limit from a byte count.
    #[must_use]
    pub const fn from_bytes(bytes: u64) -> Self {
        Self(bytes)
    }

    /// The limit in bytes.
    #[must_use]
    pub const fn bytes(self) -> u64 {
        self.0
    }

    /// Parse a memory quantity such as `100m`, `512K`, `1g` or `4096`.
    ///
    /// # Errors
    ///
    /// Returns [`KegError::InvalidMemory`] when the number is missing,
    /// malformed, zero or overflows.
    pub fn parse(s: &str) -> KegResult<Self> {
        let s = s.trim();
        let invalid = || KegError::InvalidMemory {
            value: s.to_string(),
        };

        let (digits, shift) = match s.char_indices().last() {
            Some((idx, c)) if c.is_ascii_alphabetic() => {
                let shift = match c.to_ascii_lowercase() {
                    'k' => 10,
                    'm' => 20,
                    'g' => 30,
                    't' => 40,
                    _ => return Err(invalid()),
                };
                (&s[..idx], shift)
            }
            Some(_) => (s, 0),
            None => return Err(invalid()),
        };

        let value: u64 = digits.parse().map_err(|_| invalid())?;
        if value == 0 {
            return Err(invalid());
        }
        value
            .checked_mul(1u64 << shift)
            .map(Self)
            .ok_or_else(invalid)
    }
}

impl fmt::Display for MemoryLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MemoryLimit {
    type Err = KegError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
