//! SHA-256 content verification.
//!
//! Layers are addressed by the digest of their tar stream; the same
//! helpers verify stored layers before they are applied.

use std::io::{Read, Write};
use std::path::Path;

use berth_common::error::{BerthError, Result};
use berth_common::types::Sha256Hash;
use sha2::{Digest, Sha256};

/// Computes the SHA-256 hash of a file.
///
/// # Errors
///
/// Returns an error if the file cannot be read.
pub fn hash_file(path: &Path) -> Result<Sha256Hash> {
    tracing::debug!(path = %path.display(), "computing SHA-256 hash");
    let mut file = std::fs::File::open(path).map_err(|e| BerthError::io(path, e))?;
    hash_reader(&mut file).map_err(|e| BerthError::io(path, e))
}

/// Computes the SHA-256 hash of everything readable from `reader`.
///
/// # Errors
///
/// Returns the underlying I/O error if reading fails.
pub fn hash_reader(reader: &mut impl Read) -> std::io::Result<Sha256Hash> {
    let mut hasher = Sha256::new();
    let _ = std::io::copy(reader, &mut hasher)?;
    Ok(Sha256Hash::from_hasher(hasher))
}

/// Validates that a file matches the expected SHA-256 hash.
///
/// # Errors
///
/// Returns `BerthError::HashMismatch` if the hashes do not match.
pub fn validate_hash(path: &Path, expected: &Sha256Hash) -> Result<()> {
    tracing::debug!(path = %path.display(), "validating SHA-256 hash");
    let actual = hash_file(path)?;
    if &actual != expected {
        return Err(BerthError::HashMismatch {
            resource: path.display().to_string(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        });
    }
    Ok(())
}

/// Writer adapter that hashes and counts every byte passed through it.
#[derive(Debug)]
pub struct HashingWriter<W> {
    inner: W,
    hasher: Sha256,
    written: u64,
}

impl<W: Write> HashingWriter<W> {
    /// Wraps `inner`.
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            written: 0,
        }
    }

    /// Returns the inner writer, the digest, and the byte count.
    pub fn finish(self) -> (W, Sha256Hash, u64) {
        (self.inner, Sha256Hash::from_hasher(self.hasher), self.written)
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}
