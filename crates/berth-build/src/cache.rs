//! Step cache keys.
//!
//! A key chains the parent step's key with the instruction text and the
//! digests of the step's inputs, so changing any earlier step invalidates
//! every later one.

use berth_common::types::Sha256Hash;
use sha2::{Digest, Sha256};

/// Computes the cache key of a step.
#[must_use]
pub fn step_key(parent: Option<&Sha256Hash>, instruction: &str, inputs: &[Sha256Hash]) -> Sha256Hash {
    let mut hasher = Sha256::new();
    hasher.update(parent.map_or("", Sha256Hash::as_hex).as_bytes());
    hasher.update([0]);
    hasher.update(instruction.as_bytes());
    for input in inputs {
        hasher.update([0]);
        hasher.update(input.as_hex().as_bytes());
    }
    Sha256Hash::from_hasher(hasher)
}
