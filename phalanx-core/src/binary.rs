//! Binary identity of the current process.
//!
//! Masters and workers are required to run byte-identical executables; the
//! spawn handshake compares content digests to enforce it. The digest is
//! computed once per process and cached.

use std::{fmt, path::PathBuf, sync::OnceLock};

use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// MD5 content digest of an executable file.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BinaryDigest(pub [u8; 16]);

impl fmt::Display for BinaryDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for BinaryDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BinaryDigest({})", hex::encode(self.0))
    }
}

impl BinaryDigest {
    /// Digest of an arbitrary byte string.
    pub fn of(bytes: &[u8]) -> Self {
        let mut hasher = Md5::new();
        hasher.update(bytes);
        Self(hasher.finalize().into())
    }
}

/// Absolute filesystem path of the currently running executable.
pub fn locate() -> Result<PathBuf> {
    std::env::current_exe().map_err(Error::BinaryNotLocatable)
}

/// Content digest of the currently running executable.
///
/// Computed on first call and cached for the process lifetime; the running
/// binary does not change underneath us.
pub fn digest() -> Result<BinaryDigest> {
    static CACHE: OnceLock<BinaryDigest> = OnceLock::new();

    if let Some(digest) = CACHE.get() {
        return Ok(*digest);
    }
    let path = locate()?;
    let bytes = std::fs::read(&path).map_err(Error::BinaryReadFailed)?;
    Ok(*CACHE.get_or_init(|| BinaryDigest::of(&bytes)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_is_stable() {
        let first = digest().unwrap();
        let second = digest().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn digest_reflects_content() {
        let a = BinaryDigest::of(b"one");
        let b = BinaryDigest::of(b"two");
        assert_ne!(a, b);
        assert_eq!(a, BinaryDigest::of(b"one"));
    }

    #[test]
    fn display_is_hex() {
        let digest = BinaryDigest([0xab; 16]);
        assert_eq!(digest.to_string(), "ab".repeat(16));
    }
}
