//! Cache key identifying a resource plus its transform.

use serde::{Deserialize, Serialize};

/// Opaque key for a resource + transform combination.
///
/// The source identity is length-prefixed so that no pair of
/// `(source, transform)` values can encode to the same string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey(String);

impl CacheKey {
    /// Creates a key for an untransformed source.
    #[must_use]
    pub fn for_source(source: &str) -> Self {
        Self(format!("{}:{source}", source.len()))
    }

    /// Creates a key for a source with an optional transform identifier.
    #[must_use]
    pub fn new(source: &str, transform: Option<&str>) -> Self {
        match transform {
            Some(id) => Self(format!("{}:{source}|{id}", source.len())),
            None => Self::for_source(source),
        }
    }

    /// Wraps an already-encoded key, e.g. one read back from the disk index.
    #[must_use]
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Returns the encoded key.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns a file-system safe name derived from the key.
    #[must_use]
    pub fn file_name(&self) -> String {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(self.0.as_bytes());
        let result = hasher.finalize();
        hex::encode(&result[..16])
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for CacheKey {
    fn from(source: &str) -> Self {
        Self::for_source(source)
    }
}
