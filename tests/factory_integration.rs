//! End-to-end scenarios: a real temp git repository, a scripted LLM, and the
//! full propose/apply/verify/finalize machine.

use std::{collections::VecDeque, path::Path, process::Command};

use foreman::{
   artifacts::{self, ArtifactStore},
   config::FactoryConfig,
   error::{ForemanError, Result},
   factory::{EmergencySeed, Factory, emergency_finalize},
   hashing,
   types::{CommandLine, Condition, ConditionKind, FailureStage, RunSummary, Verdict, WorkOrder},
   workspace::Workspace,
};
use indexmap::IndexSet;
use parking_lot::Mutex;
use tempfile::TempDir;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// LLM stand-in that replays a fixed sequence of replies and records every
/// prompt it was given.
struct ScriptedLlm {
   replies: Mutex<VecDeque<std::result::Result<String, String>>>,
   prompts: Mutex<Vec<String>>,
}

impl ScriptedLlm {
   fn new(replies: Vec<std::result::Result<String, String>>) -> Self {
      Self { replies: Mutex::new(replies.into_iter().collect()), prompts: Mutex::new(Vec::new()) }
   }

   fn prompts(&self) -> Vec<String> {
      self.prompts.lock().clone()
   }
}

impl foreman::api::LlmClient for ScriptedLlm {
   fn complete(&self, prompt: &str) -> Result<String> {
      self.prompts.lock().push(prompt.to_string());
      match self.replies.lock().pop_front() {
         Some(Ok(reply)) => Ok(reply),
         Some(Err(message)) => Err(ForemanError::Other(message)),
         None => Err(ForemanError::Other("script exhausted".to_string())),
      }
   }
}

fn git(dir: &Path, args: &[&str]) -> String {
   let out = Command::new("git").args(args).current_dir(dir).output().unwrap();
   assert!(out.status.success(), "git {args:?}: {}", String::from_utf8_lossy(&out.stderr));
   String::from_utf8_lossy(&out.stdout).to_string()
}

fn init_repo() -> TempDir {
   let dir = TempDir::new().unwrap();
   git(dir.path(), &["init", "-b", "main"]);
   git(dir.path(), &["config", "user.email", "test@test.com"]);
   git(dir.path(), &["config", "user.name", "Test User"]);
   std::fs::write(dir.path().join("seed.txt"), "seed\n").unwrap();
   git(dir.path(), &["add", "."]);
   git(dir.path(), &["commit", "-m", "initial"]);
   dir
}

fn commit_count(dir: &Path) -> usize {
   git(dir, &["rev-list", "--count", "HEAD"]).trim().parse().unwrap()
}

fn head(dir: &Path) -> String {
   git(dir, &["rev-parse", "HEAD"]).trim().to_string()
}

fn hermetic_config(max_attempts: u32) -> FactoryConfig {
   FactoryConfig {
      max_attempts,
      command_timeout_secs: 30,
      verify_fallback: vec!["true".to_string()],
      verify_exempt_check: vec!["true".to_string()],
      push_enabled: false,
      ..Default::default()
   }
}

fn hello_work_order() -> WorkOrder {
   WorkOrder {
      id: "wo-hello".to_string(),
      title: "create greeting".to_string(),
      intent: "write a greeting file".to_string(),
      preconditions: vec![],
      postconditions: vec![Condition {
         kind: ConditionKind::FileExists,
         path: "hello.txt".to_string(),
      }],
      allowed_files: IndexSet::from(["hello.txt".to_string()]),
      forbidden: String::new(),
      acceptance_commands: vec![CommandLine::Line("test -f hello.txt".to_string())],
      context_files: vec![],
      notes: String::new(),
      verify_exempt: false,
      provenance: None,
   }
}

fn hello_proposal() -> String {
   format!(
      r#"{{"summary":"create","writes":[{{"path":"hello.txt","base_sha256":"{}","content":"hi\n"}}]}}"#,
      hashing::EMPTY_SHA256
   )
}

/// Run the factory against a repo with the given scripted replies.
fn run_factory(
   repo: &TempDir,
   wo: &WorkOrder,
   config: &FactoryConfig,
   llm: &ScriptedLlm,
) -> (TempDir, RunSummary) {
   let out = TempDir::new().unwrap();
   let workspace = Workspace::new(repo.path());
   let baseline = workspace.baseline_commit().unwrap();
   let run_id = artifacts::run_id(wo, &baseline).unwrap();
   let store = ArtifactStore::create(out.path(), &run_id).unwrap();

   let mut machine = Factory::new(
      wo, &workspace, llm, config, &store, run_id, baseline, false, None, true,
   );
   let summary = machine.run().unwrap();
   (out, summary)
}

fn run_dir(out: &TempDir, summary: &RunSummary) -> std::path::PathBuf {
   out.path().join(&summary.run_id)
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[test]
fn pass_on_first_attempt_commits_scoped_changes() {
   let repo = init_repo();
   let baseline = head(repo.path());
   let wo = hello_work_order();
   let llm = ScriptedLlm::new(vec![Ok(hello_proposal())]);

   let (out, summary) = run_factory(&repo, &wo, &hermetic_config(5), &llm);

   assert_eq!(summary.verdict, Verdict::Pass);
   assert_eq!(summary.total_attempts, 1);
   assert_eq!(summary.attempts.len(), 1);
   assert!(summary.attempts[0].failure_brief.is_none());
   assert!(summary.attempts[0].write_ok);
   assert_eq!(summary.attempts[0].touched_files, vec!["hello.txt"]);
   assert!(summary.repo_tree_hash_after.is_some());

   // Exactly one commit on top of the baseline, containing only hello.txt.
   assert_eq!(commit_count(repo.path()), 2);
   assert_eq!(git(repo.path(), &["rev-parse", "HEAD^"]).trim(), baseline);
   let changed = git(repo.path(), &["show", "--name-only", "--format=", "HEAD"]);
   assert_eq!(changed.trim(), "hello.txt");
   let msg = git(repo.path(), &["log", "-1", "--pretty=%s"]);
   assert_eq!(msg.trim(), "work-order wo-hello: attempt 1");

   // Tree clean; the file is committed, not floating.
   assert!(git(repo.path(), &["status", "--porcelain"]).is_empty());
   assert_eq!(std::fs::read_to_string(repo.path().join("hello.txt")).unwrap(), "hi\n");

   // Artifacts.
   let dir = run_dir(&out, &summary);
   assert!(dir.join("work_order.json").exists());
   assert!(dir.join("run.json").exists());
   let on_disk: RunSummary =
      serde_json::from_str(&std::fs::read_to_string(dir.join("run_summary.json")).unwrap())
         .unwrap();
   assert_eq!(on_disk.verdict, Verdict::Pass);
   assert!(dir.join("attempt_1/se_prompt.txt").exists());
   assert!(dir.join("attempt_1/proposed_writes.json").exists());
   assert!(dir.join("attempt_1/write_result.json").exists());
   assert!(dir.join("attempt_1/verify_result.json").exists());
   assert!(dir.join("attempt_1/acceptance_result.json").exists());
}

#[test]
fn invalid_llm_output_retries_then_passes() {
   let repo = init_repo();
   let wo = hello_work_order();
   let llm = ScriptedLlm::new(vec![Ok("not json".to_string()), Ok(hello_proposal())]);

   let (out, summary) = run_factory(&repo, &wo, &hermetic_config(2), &llm);

   assert_eq!(summary.verdict, Verdict::Pass);
   assert_eq!(summary.attempts.len(), 2);
   let first = summary.attempts[0].failure_brief.as_ref().unwrap();
   assert_eq!(first.stage, FailureStage::LlmOutputInvalid);
   assert!(summary.attempts[1].failure_brief.is_none());

   // The retry prompt carries the previous brief, every field of it.
   let prompts = llm.prompts();
   assert_eq!(prompts.len(), 2);
   assert!(prompts[1].contains("Previous attempt failed"));
   assert!(prompts[1].contains("llm_output_invalid"));
   assert!(prompts[1].contains(&first.primary_error_excerpt));
   assert!(prompts[1].contains(&first.constraints_reminder));

   let dir = run_dir(&out, &summary);
   assert!(dir.join("attempt_1/raw_llm_response.json").exists());
   assert!(dir.join("attempt_1/failure_brief.json").exists());
   assert!(dir.join("attempt_2/proposed_writes.json").exists());
}

#[test]
fn acceptance_failure_rolls_back_to_baseline() {
   let repo = init_repo();
   let baseline = head(repo.path());
   let mut wo = hello_work_order();
   wo.postconditions.clear();
   wo.acceptance_commands = vec![CommandLine::Line("test -f never-created.txt".to_string())];
   let llm = ScriptedLlm::new(vec![Ok(hello_proposal())]);

   let (out, summary) = run_factory(&repo, &wo, &hermetic_config(1), &llm);

   assert_eq!(summary.verdict, Verdict::Fail);
   let brief = summary.attempts[0].failure_brief.as_ref().unwrap();
   assert_eq!(brief.stage, FailureStage::AcceptanceFailed);
   assert_eq!(brief.command.as_deref(), Some("test -f never-created.txt"));
   assert_eq!(brief.exit_code, Some(1));

   // Repository byte-identical to baseline: no commit, no leftover writes.
   assert_eq!(head(repo.path()), baseline);
   assert_eq!(commit_count(repo.path()), 1);
   assert!(!repo.path().join("hello.txt").exists());
   assert_eq!(std::fs::read_to_string(repo.path().join("seed.txt")).unwrap(), "seed\n");
   assert!(git(repo.path(), &["status", "--porcelain"]).is_empty());

   let dir = run_dir(&out, &summary);
   assert!(dir.join("run_summary.json").exists());
   assert!(dir.join("attempt_1/failure_brief.json").exists());
}

#[test]
fn stale_hash_on_one_file_leaves_other_untouched() {
   let repo = init_repo();
   std::fs::write(repo.path().join("a.txt"), "current a\n").unwrap();
   std::fs::write(repo.path().join("b.txt"), "current b\n").unwrap();
   git(repo.path(), &["add", "."]);
   git(repo.path(), &["commit", "-m", "add a and b"]);
   let baseline = head(repo.path());

   let mut wo = hello_work_order();
   wo.id = "wo-stale".to_string();
   wo.postconditions.clear();
   wo.allowed_files = IndexSet::from(["a.txt".to_string(), "b.txt".to_string()]);

   let good = hashing::sha256_hex(b"current a\n");
   let stale = hashing::sha256_hex(b"some old b\n");
   let proposal = format!(
      r#"{{"summary":"edit both","writes":[
         {{"path":"a.txt","base_sha256":"{good}","content":"new a\n"}},
         {{"path":"b.txt","base_sha256":"{stale}","content":"new b\n"}}
      ]}}"#
   );
   let llm = ScriptedLlm::new(vec![Ok(proposal)]);

   let (_out, summary) = run_factory(&repo, &wo, &hermetic_config(1), &llm);

   assert_eq!(summary.verdict, Verdict::Fail);
   let brief = summary.attempts[0].failure_brief.as_ref().unwrap();
   assert_eq!(brief.stage, FailureStage::StaleContext);

   // The matching file was not written: multi-file atomicity of the gate.
   assert_eq!(std::fs::read_to_string(repo.path().join("a.txt")).unwrap(), "current a\n");
   assert_eq!(std::fs::read_to_string(repo.path().join("b.txt")).unwrap(), "current b\n");
   assert_eq!(head(repo.path()), baseline);
   assert!(git(repo.path(), &["status", "--porcelain"]).is_empty());
}

#[test]
fn preflight_violation_never_invokes_llm_and_never_retries() {
   let repo = init_repo();
   let baseline = head(repo.path());
   let mut wo = hello_work_order();
   wo.preconditions =
      vec![Condition { kind: ConditionKind::FileExists, path: "missing.txt".to_string() }];
   let llm = ScriptedLlm::new(vec![Ok(hello_proposal())]);

   // max_attempts > 1: the non-retryable stage must still stop after one.
   let (out, summary) = run_factory(&repo, &wo, &hermetic_config(3), &llm);

   assert_eq!(summary.verdict, Verdict::Fail);
   assert_eq!(summary.attempts.len(), 1);
   let brief = summary.attempts[0].failure_brief.as_ref().unwrap();
   assert_eq!(brief.stage, FailureStage::Preflight);
   assert!(brief.primary_error_excerpt.starts_with("PLANNER-CONTRACT BUG"));

   assert!(llm.prompts().is_empty(), "LLM must never be invoked");
   let dir = run_dir(&out, &summary);
   assert!(!dir.join("attempt_1/se_prompt.txt").exists(), "no prompt artifact");
   assert!(dir.join("attempt_1/failure_brief.json").exists());

   assert_eq!(head(repo.path()), baseline);
   assert!(git(repo.path(), &["status", "--porcelain"]).is_empty());
}

#[test]
fn emergency_finalize_cleans_repo_and_writes_error_summary() {
   let repo = init_repo();
   let baseline = head(repo.path());

   // Simulate a crash mid-attempt: writes landed, nothing finalized.
   std::fs::write(repo.path().join("half-written.txt"), "partial\n").unwrap();
   std::fs::write(repo.path().join("seed.txt"), "mutated\n").unwrap();

   let out = TempDir::new().unwrap();
   let seed = EmergencySeed {
      repo_root:       repo.path().to_path_buf(),
      baseline_commit: baseline.clone(),
      run_id:          "feedfacefeedface".to_string(),
      work_order_id:   "wo-crash".to_string(),
      config:          hermetic_config(5),
      summary_path:    out.path().join("run_summary.json"),
      started_at:      "2026-01-01T00:00:00Z".to_string(),
   };

   emergency_finalize(&seed, "synthetic mid-run exception");

   // Repo restored byte-identical to baseline.
   assert_eq!(head(repo.path()), baseline);
   assert!(!repo.path().join("half-written.txt").exists());
   assert_eq!(std::fs::read_to_string(repo.path().join("seed.txt")).unwrap(), "seed\n");
   assert!(git(repo.path(), &["status", "--porcelain"]).is_empty());

   // ERROR summary present despite no factory run.
   let summary: RunSummary =
      serde_json::from_str(&std::fs::read_to_string(&seed.summary_path).unwrap()).unwrap();
   assert_eq!(summary.verdict, Verdict::Error);
   assert_eq!(summary.error.as_deref(), Some("synthetic mid-run exception"));
   assert!(!summary.rollback_failed);
}

#[test]
fn retries_exhausted_yields_fail_with_clean_tree() {
   let repo = init_repo();
   let baseline = head(repo.path());
   let mut wo = hello_work_order();
   wo.postconditions.clear();
   wo.acceptance_commands = vec![CommandLine::Line("false".to_string())];
   // Same failing proposal on both attempts.
   let llm = ScriptedLlm::new(vec![Ok(hello_proposal()), Ok(hello_proposal())]);

   let (_out, summary) = run_factory(&repo, &wo, &hermetic_config(2), &llm);

   assert_eq!(summary.verdict, Verdict::Fail);
   assert_eq!(summary.attempts.len(), 2);
   for attempt in &summary.attempts {
      assert_eq!(
         attempt.failure_brief.as_ref().unwrap().stage,
         FailureStage::AcceptanceFailed
      );
   }
   assert_eq!(head(repo.path()), baseline);
   assert!(git(repo.path(), &["status", "--porcelain"]).is_empty());
}

#[test]
fn run_id_is_stable_across_runs() {
   let wo = hello_work_order();
   let a = artifacts::run_id(&wo, "c0ffee").unwrap();
   let b = artifacts::run_id(&wo, "c0ffee").unwrap();
   assert_eq!(a, b);
   assert_eq!(a.len(), 16);
}
