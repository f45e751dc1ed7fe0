//! Container ID generation.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// A container ID: the hex SHA-256 digest of a random UUID.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContainerId(String);

impl ContainerId {
    /// Length of a generated ID in hex characters.
    pub const LENGTH: usize = 64;

    /// Generate a new random container ID.
    #[must_use]
    pub fn generate() -> Self {
        let token = uuid::Uuid::new_v4();
        let digest = Sha256::digest(token.as_bytes());
        Self(hex::encode(digest))
    }

    /// Wrap an existing ID string.
    #[must_use]
    pub fn from_string(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the container ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns a short version of the ID (first 12 characters).
    #[must_use]
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for ContainerId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
