//! SHA-256 helpers shared by context assembly, the base-hash gate, and run
//! identifiers. All hashes are over raw bytes and rendered lowercase hex.

use std::path::Path;

use sha2::{Digest, Sha256};

use crate::error::Result;

/// SHA-256 of the empty byte string; the sentinel hash for absent files.
pub const EMPTY_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

/// SHA-256 of a byte slice as lowercase hex.
pub fn sha256_hex(bytes: &[u8]) -> String {
   hex::encode(Sha256::digest(bytes))
}

/// Hash of a file's current content. Absent paths hash as empty bytes, so a
/// proposal creating a new file carries the empty-string sentinel.
pub fn hash_file_or_empty(path: &Path) -> Result<String> {
   if path.is_file() {
      let bytes = std::fs::read(path)?;
      Ok(sha256_hex(&bytes))
   } else {
      Ok(EMPTY_SHA256.to_string())
   }
}

/// Whether a string is a plausible SHA-256 hex digest.
pub fn is_sha256_hex(s: &str) -> bool {
   s.len() == 64 && s.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
}
