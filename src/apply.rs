//! TR stage: apply a validated proposal to the working tree, or refuse it
//! without touching a single byte.
//!
//! The batch invariant is the heart of this stage: every base-hash check
//! completes before any write begins. A proposal whose file A matches and
//! file B is stale leaves A untouched on disk.

use std::path::{Path, PathBuf};

use serde_json::json;

use crate::{
   artifacts::{atomic_write_bytes, atomic_write_json},
   config::FactoryConfig,
   error::Result,
   hashing, propose,
   types::{FailureBrief, FailureStage, WorkOrder, WriteProposal},
   validation,
};

/// Result of the apply stage.
pub struct ApplyOutcome {
   pub write_ok:      bool,
   pub touched_files: Vec<String>,
   pub brief:         Option<FailureBrief>,
}

impl ApplyOutcome {
   fn rejected(brief: FailureBrief) -> Self {
      Self { write_ok: false, touched_files: Vec::new(), brief: Some(brief) }
   }
}

/// Apply every write in the proposal, or none of them.
pub fn run_apply(
   proposal: &WriteProposal,
   wo: &WorkOrder,
   repo_root: &Path,
   _config: &FactoryConfig,
   attempt_dir: &Path,
) -> Result<ApplyOutcome> {
   let outcome = apply_batch(proposal, wo, repo_root, attempt_dir)?;

   let errors: Vec<String> = outcome
      .brief
      .as_ref()
      .map(|b| vec![b.primary_error_excerpt.clone()])
      .unwrap_or_default();
   atomic_write_json(
      &attempt_dir.join("write_result.json"),
      &json!({
         "write_ok": outcome.write_ok,
         "touched_files": outcome.touched_files,
         "errors": errors,
      }),
   )?;

   Ok(outcome)
}

fn apply_batch(
   proposal: &WriteProposal,
   wo: &WorkOrder,
   repo_root: &Path,
   attempt_dir: &Path,
) -> Result<ApplyOutcome> {
   let reminder = propose::constraints_reminder(wo);

   // 1. Duplicate targets.
   let mut seen = std::collections::HashSet::new();
   let duplicates: Vec<&str> = proposal
      .writes
      .iter()
      .filter(|w| !seen.insert(w.path.as_str()))
      .map(|w| w.path.as_str())
      .collect();
   if !duplicates.is_empty() {
      let brief = FailureBrief::new(
         FailureStage::WriteScopeViolation,
         format!("duplicate write targets: {}", duplicates.join(", ")),
         reminder,
      );
      propose::write_brief(attempt_dir, &brief)?;
      return Ok(ApplyOutcome::rejected(brief));
   }

   // 2. Scope: every target must be an allowed file.
   let out_of_scope: Vec<&str> = proposal
      .writes
      .iter()
      .filter(|w| !wo.allowed_files.contains(&w.path))
      .map(|w| w.path.as_str())
      .collect();
   if !out_of_scope.is_empty() {
      let brief = FailureBrief::new(
         FailureStage::WriteScopeViolation,
         format!("writes outside allowed_files: {}", out_of_scope.join(", ")),
         reminder,
      );
      propose::write_brief(attempt_dir, &brief)?;
      return Ok(ApplyOutcome::rejected(brief));
   }

   // 3. Path safety: each target must resolve inside the repository root.
   let mut targets: Vec<PathBuf> = Vec::with_capacity(proposal.writes.len());
   for write in &proposal.writes {
      match validation::resolve_in_repo(repo_root, &write.path) {
         Ok(target) => targets.push(target),
         Err(e) => {
            let brief =
               FailureBrief::new(FailureStage::WriteScopeViolation, e.to_string(), reminder);
            propose::write_brief(attempt_dir, &brief)?;
            return Ok(ApplyOutcome::rejected(brief));
         },
      }
   }

   // 4. Batch base-hash check. Every hash is verified before any byte is
   // written; a single mismatch rejects the whole batch untouched.
   let mut stale = Vec::new();
   for (write, target) in proposal.writes.iter().zip(&targets) {
      let actual = hashing::hash_file_or_empty(target)?;
      if actual != write.base_sha256 {
         stale.push(format!(
            "{}: base_sha256 {} does not match current content {actual}",
            write.path, write.base_sha256
         ));
      }
   }
   if !stale.is_empty() {
      let brief = FailureBrief::new(FailureStage::StaleContext, stale.join("\n"), reminder);
      propose::write_brief(attempt_dir, &brief)?;
      return Ok(ApplyOutcome::rejected(brief));
   }

   // 5. Apply, atomically per file. A failure here leaves the tree in an
   // indeterminate mid-batch state; the stage is non-retryable and Finalize
   // resets to baseline.
   let mut touched = Vec::with_capacity(proposal.writes.len());
   for (write, target) in proposal.writes.iter().zip(&targets) {
      if let Some(parent) = target.parent()
         && let Err(e) = std::fs::create_dir_all(parent)
      {
         let brief = FailureBrief::new(
            FailureStage::WriteFailed,
            format!("cannot create parent directory for '{}': {e}", write.path),
            reminder,
         );
         propose::write_brief(attempt_dir, &brief)?;
         return Ok(ApplyOutcome { write_ok: false, touched_files: touched, brief: Some(brief) });
      }

      if let Err(e) = atomic_write_bytes(target, write.content.as_bytes()) {
         let brief = FailureBrief::new(
            FailureStage::WriteFailed,
            format!("write of '{}' failed: {e}", write.path),
            reminder,
         );
         propose::write_brief(attempt_dir, &brief)?;
         return Ok(ApplyOutcome { write_ok: false, touched_files: touched, brief: Some(brief) });
      }

      touched.push(write.path.clone());
   }

   Ok(ApplyOutcome { write_ok: true, touched_files: touched, brief: None })
}
