//! Canonical serialization, atomic file writes, and the on-disk artifact
//! layout for one run.
//!
//! Every JSON artifact goes through the same canonical form (sorted keys,
//! trailing newline) and the same atomic write primitive (sibling temp file,
//! fsync, rename), so a killed process never leaves a half-written record.

use std::{
   fs,
   io::Write,
   path::{Path, PathBuf},
};

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::{
   error::{ForemanError, Result},
   types::WorkOrder,
};

/// Length of a run identifier in hex characters.
pub const RUN_ID_LEN: usize = 16;

/// Serialize a value to canonical JSON: UTF-8, keys sorted at every level,
/// trailing newline. Any byte sequence fed to a hash goes through here.
pub fn canonical_json<T: Serialize>(value: &T) -> Result<String> {
   // Round-tripping through Value sorts object keys (serde_json's map is
   // ordered by key), where direct struct serialization would emit fields
   // in declaration order.
   let value = serde_json::to_value(value)?;
   let mut out = serde_json::to_string(&value)?;
   out.push('\n');
   Ok(out)
}

fn fsync_parent_dir(path: &Path) {
   if let Some(parent) = path.parent()
      && let Ok(dir) = fs::File::open(parent)
   {
      let _ = dir.sync_all();
   }
}

/// Write bytes atomically: sibling temp file in the same directory, fsync,
/// rename over the target.
pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
   let file_name = path
      .file_name()
      .and_then(|n| n.to_str())
      .ok_or_else(|| ForemanError::Other(format!("invalid artifact path: {}", path.display())))?;
   let tmp = path.with_file_name(format!("{file_name}.tmp"));

   {
      let mut f = fs::File::create(&tmp).map_err(|e| {
         ForemanError::Other(format!("failed to create temp file {}: {e}", tmp.display()))
      })?;
      if let Err(e) = f.write_all(bytes) {
         drop(f);
         let _ = fs::remove_file(&tmp);
         return Err(ForemanError::Other(format!(
            "failed to write temp file {}: {e}",
            tmp.display()
         )));
      }
      f.sync_all().ok();
   }

   if let Err(e) = fs::rename(&tmp, path) {
      let _ = fs::remove_file(&tmp);
      return Err(ForemanError::Other(format!(
         "failed to rename {} to {}: {e}",
         tmp.display(),
         path.display()
      )));
   }

   fsync_parent_dir(path);
   Ok(())
}

/// Atomically write a value as canonical JSON.
pub fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
   let json = canonical_json(value)?;
   atomic_write_bytes(path, json.as_bytes())
}

/// Atomically write plain text.
pub fn atomic_write_text(path: &Path, text: &str) -> Result<()> {
   atomic_write_bytes(path, text.as_bytes())
}

/// Deterministic run identifier: SHA-256 of the canonical work order
/// followed by the baseline commit, truncated to 16 hex characters. The same
/// work order against the same baseline always lands in the same artifact
/// directory.
pub fn run_id(work_order: &WorkOrder, baseline_commit: &str) -> Result<String> {
   let canonical = canonical_json(work_order)?;
   let mut hasher = Sha256::new();
   hasher.update(canonical.as_bytes());
   hasher.update(baseline_commit.as_bytes());
   let digest = hex::encode(hasher.finalize());
   Ok(digest[..RUN_ID_LEN].to_string())
}

/// Filesystem layout of one run's artifacts under `<out>/<run_id>/`.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
   run_dir: PathBuf,
}

impl ArtifactStore {
   /// Create the run directory (and parents) under the output root.
   pub fn create(out_root: &Path, run_id: &str) -> Result<Self> {
      let run_dir = out_root.join(run_id);
      fs::create_dir_all(&run_dir).map_err(|e| {
         ForemanError::Other(format!("failed to create {}: {e}", run_dir.display()))
      })?;
      Ok(Self { run_dir })
   }

   pub fn run_dir(&self) -> &Path {
      &self.run_dir
   }

   pub fn run_summary_path(&self) -> PathBuf {
      self.run_dir.join("run_summary.json")
   }

   pub fn work_order_path(&self) -> PathBuf {
      self.run_dir.join("work_order.json")
   }

   pub fn run_meta_path(&self) -> PathBuf {
      self.run_dir.join("run.json")
   }

   /// Directory for one attempt's artifacts, created on first use.
   pub fn attempt_dir(&self, attempt_index: u32) -> Result<PathBuf> {
      let dir = self.run_dir.join(format!("attempt_{attempt_index}"));
      fs::create_dir_all(&dir)
         .map_err(|e| ForemanError::Other(format!("failed to create {}: {e}", dir.display())))?;
      Ok(dir)
   }
}
