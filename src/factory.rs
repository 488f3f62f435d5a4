//! The factory state machine: SE -> TR -> PO -> Finalize, bounded by the
//! attempt budget, with transactional rollback on every failure path.
//!
//! Nodes are plain functions; routing is a match over the presence of a
//! proposal and the failure brief's stage. The factory owns all mutable
//! per-run state. Collaborators (workspace, LLM client, config, artifact
//! store) are passed in explicitly.

use std::path::{Path, PathBuf};

use serde_json::json;

use crate::{
   api::LlmClient,
   apply::{self, ApplyOutcome},
   artifacts::{ArtifactStore, atomic_write_json},
   config::FactoryConfig,
   error::Result,
   propose::{self, ProposeOutcome},
   style,
   types::{
      AttemptRecord, CommandOutcome, FailureBrief, RunSummary, Verdict, WorkOrder, WriteProposal,
   },
   verify,
   workspace::Workspace,
};

/// Whether a finished failing attempt earns another try.
fn should_retry(brief: &FailureBrief, attempt_index: u32, max_attempts: u32) -> bool {
   brief.stage.is_retryable() && attempt_index < max_attempts
}

/// Per-attempt state, reset between attempts by Finalize.
#[derive(Default)]
struct AttemptState {
   proposal:           Option<WriteProposal>,
   proposal_path:      Option<String>,
   touched_files:      Vec<String>,
   write_ok:           bool,
   verify_results:     Vec<CommandOutcome>,
   acceptance_results: Vec<CommandOutcome>,
   failure_brief:      Option<FailureBrief>,
}

/// What Finalize decided.
enum FinalizeDecision {
   Done(Verdict),
   Retry(FailureBrief),
}

/// Executes one work order to completion.
pub struct Factory<'a> {
   work_order:    &'a WorkOrder,
   workspace:     &'a Workspace,
   llm:           &'a dyn LlmClient,
   config:        &'a FactoryConfig,
   store:         &'a ArtifactStore,
   run_id:        String,
   baseline:      String,
   honor_exempt:  bool,
   push_branch:   Option<String>,
   started_at:    String,
   quiet:         bool,
   attempts:      Vec<AttemptRecord>,
   attempt_index: u32,
   tree_hash:     Option<String>,
}

impl<'a> Factory<'a> {
   #[allow(clippy::too_many_arguments, reason = "explicit collaborators over a builder")]
   pub fn new(
      work_order: &'a WorkOrder,
      workspace: &'a Workspace,
      llm: &'a dyn LlmClient,
      config: &'a FactoryConfig,
      store: &'a ArtifactStore,
      run_id: String,
      baseline: String,
      honor_exempt: bool,
      push_branch: Option<String>,
      quiet: bool,
   ) -> Self {
      Self {
         work_order,
         workspace,
         llm,
         config,
         store,
         run_id,
         baseline,
         honor_exempt,
         push_branch,
         started_at: chrono::Utc::now().to_rfc3339(),
         quiet,
         attempts: Vec::new(),
         attempt_index: 1,
         tree_hash: None,
      }
   }

   fn progress(&self, msg: &str) {
      if !self.quiet {
         eprintln!("{} {msg}", style::info(style::icons::ARROW));
      }
   }

   /// Drive the state machine until a verdict. `Err` means a harness fault,
   /// which the caller turns into the emergency path.
   pub fn run(&mut self) -> Result<RunSummary> {
      atomic_write_json(&self.store.work_order_path(), self.work_order)?;
      atomic_write_json(
         &self.store.run_meta_path(),
         &json!({
            "run_id": self.run_id,
            "work_order_id": self.work_order.id,
            "baseline_commit": self.baseline,
            "llm_model": self.config.llm_model,
            "max_attempts": self.config.max_attempts,
            "started_at": self.started_at,
         }),
      )?;

      let mut previous_brief: Option<FailureBrief> = None;

      loop {
         let attempt_dir = self.store.attempt_dir(self.attempt_index)?;
         self.progress(&format!(
            "attempt {}/{} for work order {}",
            self.attempt_index, self.config.max_attempts, self.work_order.id
         ));

         let mut state = AttemptState::default();

         // SE: propose.
         match propose::run_propose(
            self.work_order,
            self.workspace.root(),
            previous_brief.as_ref(),
            self.llm,
            self.config,
            &attempt_dir,
         )? {
            ProposeOutcome::Proposal(proposal) => {
               state.proposal_path =
                  Some(attempt_dir.join("proposed_writes.json").display().to_string());
               state.proposal = Some(proposal);
            },
            ProposeOutcome::Failed(brief) => state.failure_brief = Some(brief),
         }

         // TR: apply, only when a proposal exists.
         if let Some(ref proposal) = state.proposal {
            let ApplyOutcome { write_ok, touched_files, brief } = apply::run_apply(
               proposal,
               self.work_order,
               self.workspace.root(),
               self.config,
               &attempt_dir,
            )?;
            state.write_ok = write_ok;
            state.touched_files = touched_files;
            state.failure_brief = brief;
         }

         // PO: verify, only when writes were applied.
         if state.write_ok && state.failure_brief.is_none() {
            let outcome = verify::run_verify(
               self.work_order,
               self.workspace.root(),
               self.config,
               &attempt_dir,
               self.honor_exempt,
            )?;
            state.verify_results = outcome.verify_results;
            state.acceptance_results = outcome.acceptance_results;
            state.failure_brief = outcome.brief;
         }

         match self.finalize(&attempt_dir, state)? {
            FinalizeDecision::Done(verdict) => {
               let summary = self.build_summary(verdict, None, false);
               atomic_write_json(&self.store.run_summary_path(), &summary)?;
               return Ok(summary);
            },
            FinalizeDecision::Retry(brief) => {
               previous_brief = Some(brief);
            },
         }
      }
   }

   /// Record the attempt, roll back or commit, and route.
   fn finalize(&mut self, attempt_dir: &Path, state: AttemptState) -> Result<FinalizeDecision> {
      let mut record = AttemptRecord {
         attempt_index:      self.attempt_index,
         baseline_commit:    self.baseline.clone(),
         proposal_path:      state.proposal_path,
         touched_files:      state.touched_files,
         write_ok:           state.write_ok,
         verify_results:     state.verify_results,
         acceptance_results: state.acceptance_results,
         failure_brief:      state.failure_brief,
         repo_drift:         Vec::new(),
      };

      let decision = if let Some(brief) = record.failure_brief.clone() {
         self.progress(&format!("attempt {} failed at {}", self.attempt_index, brief.stage));
         // Canonical brief record; stages already wrote it ahead.
         propose::write_brief(attempt_dir, &brief)?;
         // Reset to baseline on every failure path. Before any writes this
         // is a no-op, invoked anyway for idempotency.
         self.workspace.rollback(&self.baseline)?;

         if should_retry(&brief, self.attempt_index, self.config.max_attempts) {
            FinalizeDecision::Retry(brief)
         } else {
            FinalizeDecision::Done(Verdict::Fail)
         }
      } else {
         record.repo_drift = self.workspace.detect_drift(&record.touched_files)?;
         self.tree_hash = Some(self.workspace.tree_hash(&record.touched_files)?);

         let message =
            format!("work-order {}: attempt {}", self.work_order.id, self.attempt_index);
         self.workspace.scoped_commit(&record.touched_files, &message)?;
         self.workspace.clean_untracked()?;

         if let Some(ref branch) = self.push_branch {
            if let Err(e) = self.workspace.push(&self.config.push_remote, branch) {
               // Push failure never changes the verdict.
               style::warn(&format!("push to {}/{branch} failed: {e}", self.config.push_remote));
            }
         }
         self.progress(&format!("attempt {} passed", self.attempt_index));
         FinalizeDecision::Done(Verdict::Pass)
      };

      self.attempts.push(record);
      self.attempt_index += 1;

      // Snapshot the summary after every attempt so a killed process still
      // leaves a readable record.
      if matches!(decision, FinalizeDecision::Retry(_)) {
         let snapshot = self.build_summary(Verdict::Fail, None, false);
         atomic_write_json(&self.store.run_summary_path(), &snapshot)?;
      }

      Ok(decision)
   }

   fn build_summary(
      &self,
      verdict: Verdict,
      error: Option<String>,
      rollback_failed: bool,
   ) -> RunSummary {
      RunSummary {
         run_id: self.run_id.clone(),
         work_order_id: self.work_order.id.clone(),
         verdict,
         total_attempts: self.attempts.len() as u32,
         baseline_commit: self.baseline.clone(),
         repo_tree_hash_after: if verdict == Verdict::Pass { self.tree_hash.clone() } else { None },
         config: self.config.clone(),
         attempts: self.attempts.clone(),
         error,
         rollback_failed,
         started_at: self.started_at.clone(),
         finished_at: chrono::Utc::now().to_rfc3339(),
      }
   }
}

// === Emergency path ===

/// Everything the last-resort handler needs, captured before the run starts
/// so the handler itself cannot fail to assemble it.
#[derive(Debug, Clone)]
pub struct EmergencySeed {
   pub repo_root:       PathBuf,
   pub baseline_commit: String,
   pub run_id:          String,
   pub work_order_id:   String,
   pub config:          FactoryConfig,
   pub summary_path:    PathBuf,
   pub started_at:      String,
}

/// Last-resort cleanup: roll the tree back to baseline and write an ERROR
/// summary. Runs on interrupts and on internal faults; must never panic or
/// raise, so every step swallows its own errors and reports through the
/// `rollback_failed` flag instead.
pub fn emergency_finalize(seed: &EmergencySeed, error: &str) {
   let workspace = Workspace::new(&seed.repo_root);
   let rollback_failed = workspace.rollback(&seed.baseline_commit).is_err();

   // Prefer amending the snapshot the factory already wrote; fall back to a
   // minimal record when none exists yet.
   let mut summary = std::fs::read_to_string(&seed.summary_path)
      .ok()
      .and_then(|s| serde_json::from_str::<RunSummary>(&s).ok())
      .unwrap_or_else(|| RunSummary {
         run_id:               seed.run_id.clone(),
         work_order_id:        seed.work_order_id.clone(),
         verdict:              Verdict::Error,
         total_attempts:       0,
         baseline_commit:      seed.baseline_commit.clone(),
         repo_tree_hash_after: None,
         config:               seed.config.clone(),
         attempts:             Vec::new(),
         error:                None,
         rollback_failed:      false,
         started_at:           seed.started_at.clone(),
         finished_at:          String::new(),
      });

   summary.verdict = Verdict::Error;
   summary.error = Some(error.to_string());
   summary.rollback_failed = rollback_failed;
   summary.repo_tree_hash_after = None;
   summary.finished_at = chrono::Utc::now().to_rfc3339();

   if atomic_write_json(&seed.summary_path, &summary).is_err() {
      // Atomic write needs a live parent directory; as the very last resort
      // try a plain write so *some* record survives.
      if let Ok(json) = serde_json::to_string(&summary) {
         let _ = std::fs::write(&seed.summary_path, json);
      }
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::types::FailureStage;

   fn brief(stage: FailureStage) -> FailureBrief {
      FailureBrief::new(stage, "excerpt", "reminder")
   }

   #[test]
   fn test_retry_routing_by_stage() {
      assert!(should_retry(&brief(FailureStage::LlmOutputInvalid), 1, 5));
      assert!(should_retry(&brief(FailureStage::StaleContext), 1, 5));
      assert!(should_retry(&brief(FailureStage::VerifyFailed), 1, 5));
      assert!(should_retry(&brief(FailureStage::AcceptanceFailed), 1, 5));
      assert!(should_retry(&brief(FailureStage::Exception), 1, 5));
      assert!(should_retry(&brief(FailureStage::WriteScopeViolation), 1, 5));
   }

   #[test]
   fn test_non_retryable_stages_terminate() {
      assert!(!should_retry(&brief(FailureStage::Preflight), 1, 5));
      assert!(!should_retry(&brief(FailureStage::WriteFailed), 1, 5));
   }

   #[test]
   fn test_attempt_budget_bounds_retries() {
      assert!(should_retry(&brief(FailureStage::VerifyFailed), 4, 5));
      assert!(!should_retry(&brief(FailureStage::VerifyFailed), 5, 5));
      assert!(!should_retry(&brief(FailureStage::VerifyFailed), 6, 5));
   }

   #[test]
   fn test_emergency_finalize_without_prior_summary() {
      let repo = tempfile::tempdir().unwrap();
      let out = tempfile::tempdir().unwrap();
      // Not a git repo: rollback fails, and that must be reported, not
      // raised.
      let seed = EmergencySeed {
         repo_root:       repo.path().to_path_buf(),
         baseline_commit: "0000000000000000000000000000000000000000".to_string(),
         run_id:          "deadbeefdeadbeef".to_string(),
         work_order_id:   "wo-x".to_string(),
         config:          FactoryConfig::default(),
         summary_path:    out.path().join("run_summary.json"),
         started_at:      "2026-01-01T00:00:00Z".to_string(),
      };

      emergency_finalize(&seed, "synthetic fault");

      let summary: RunSummary =
         serde_json::from_str(&std::fs::read_to_string(&seed.summary_path).unwrap()).unwrap();
      assert_eq!(summary.verdict, Verdict::Error);
      assert_eq!(summary.error.as_deref(), Some("synthetic fault"));
      assert!(summary.rollback_failed);
      assert_eq!(summary.total_attempts, 0);
   }
}
