use std::{fmt, path::PathBuf};

use clap::{Parser, Subcommand};
use indexmap::IndexSet;
use serde::{Deserialize, Serialize};

use crate::error::{ForemanError, Result};

/// Hard cap on diagnostic excerpts carried in briefs and command outcomes.
pub const EXCERPT_LIMIT: usize = 2000;

// === Work order ===

/// Kind of a filesystem condition checked before or after an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionKind {
   FileExists,
   FileAbsent,
}

impl fmt::Display for ConditionKind {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      match self {
         Self::FileExists => write!(f, "file_exists"),
         Self::FileAbsent => write!(f, "file_absent"),
      }
   }
}

/// A single pre- or postcondition on a repository path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
   pub kind: ConditionKind,
   pub path: String,
}

/// Planner-side provenance, consulted by the verify-exempt trust policy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Provenance {
   #[serde(default)]
   pub planner_run_id: Option<String>,
   #[serde(default)]
   pub bootstrap:      bool,
}

/// One acceptance command: either a plain command line (split on whitespace,
/// shell metacharacters rejected) or an explicit argv whose arguments are
/// passed through literally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CommandLine {
   Line(String),
   Argv(Vec<String>),
}

/// Characters that would change meaning under a shell. Commands are never run
/// through a shell, so a plain command line containing any of these is a
/// contract error rather than something to quote around.
const SHELL_METACHARS: &[char] = &[
   '|', '&', ';', '<', '>', '(', ')', '$', '`', '\\', '"', '\'', '*', '?', '[', ']', '{', '}',
   '~', '#', '!', '\n',
];

impl CommandLine {
   /// Resolve to an argv vector without any shell interpretation.
   pub fn to_argv(&self) -> Result<Vec<String>> {
      match self {
         Self::Argv(argv) => {
            if argv.is_empty() {
               return Err(ForemanError::CommandLineError {
                  command: String::new(),
                  reason:  "empty argv".to_string(),
               });
            }
            Ok(argv.clone())
         },
         Self::Line(line) => {
            if line.trim().is_empty() {
               return Err(ForemanError::CommandLineError {
                  command: line.clone(),
                  reason:  "empty command".to_string(),
               });
            }
            if let Some(bad) = line.chars().find(|c| SHELL_METACHARS.contains(c)) {
               return Err(ForemanError::CommandLineError {
                  command: line.clone(),
                  reason:  format!("shell metacharacter '{bad}' not allowed"),
               });
            }
            Ok(line.split_whitespace().map(ToString::to_string).collect())
         },
      }
   }

   /// Human-readable rendering for briefs and logs.
   pub fn display(&self) -> String {
      match self {
         Self::Line(line) => line.clone(),
         Self::Argv(argv) => argv.join(" "),
      }
   }
}

/// The declarative contract the factory executes: what an LLM may write,
/// what must hold before and after, and what commands must pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkOrder {
   pub id: String,

   #[serde(default)]
   pub title: String,

   #[serde(default)]
   pub intent: String,

   #[serde(default)]
   pub preconditions: Vec<Condition>,

   #[serde(default)]
   pub postconditions: Vec<Condition>,

   /// Relative paths the LLM is permitted to write. Order is preserved;
   /// duplicates collapse on deserialization.
   pub allowed_files: IndexSet<String>,

   /// Free-text prohibitions surfaced verbatim in the prompt.
   #[serde(default)]
   pub forbidden: String,

   pub acceptance_commands: Vec<CommandLine>,

   /// Read-only files embedded in the prompt; may extend beyond
   /// `allowed_files`.
   #[serde(default)]
   pub context_files: Vec<String>,

   #[serde(default)]
   pub notes: String,

   /// Replace global verify with the lightweight check (trust policy applies).
   #[serde(default)]
   pub verify_exempt: bool,

   #[serde(default)]
   pub provenance: Option<Provenance>,
}

impl WorkOrder {
   /// Load a work order from a JSON document on disk. Validation is a
   /// separate step (`validation::validate_work_order`).
   pub fn from_file(path: &std::path::Path) -> Result<Self> {
      let contents = std::fs::read_to_string(path).map_err(|e| {
         ForemanError::WorkOrderError(format!("failed to read {}: {e}", path.display()))
      })?;
      serde_json::from_str(&contents).map_err(|e| {
         ForemanError::WorkOrderError(format!("failed to parse {}: {e}", path.display()))
      })
   }
}

// === Proposal ===

/// A single file the LLM proposes to write, with the hash of the content it
/// believes it is replacing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileWrite {
   pub path:        String,
   pub base_sha256: String,
   pub content:     String,
}

/// Validated LLM output: a summary plus a non-empty ordered batch of writes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteProposal {
   pub summary: String,
   pub writes:  Vec<FileWrite>,
}

// === Failure brief ===

/// Where in the pipeline an attempt failed. Drives retry routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
   Preflight,
   Exception,
   LlmOutputInvalid,
   WriteScopeViolation,
   StaleContext,
   WriteFailed,
   VerifyFailed,
   AcceptanceFailed,
}

impl FailureStage {
   /// Whether another LLM attempt could plausibly repair this failure.
   /// A broken plan cannot be fixed by the LLM, and a mid-batch write
   /// failure leaves the tree in a state no proposal was generated against.
   pub const fn is_retryable(self) -> bool {
      !matches!(self, Self::Preflight | Self::WriteFailed)
   }

   pub const fn as_str(self) -> &'static str {
      match self {
         Self::Preflight => "preflight",
         Self::Exception => "exception",
         Self::LlmOutputInvalid => "llm_output_invalid",
         Self::WriteScopeViolation => "write_scope_violation",
         Self::StaleContext => "stale_context",
         Self::WriteFailed => "write_failed",
         Self::VerifyFailed => "verify_failed",
         Self::AcceptanceFailed => "acceptance_failed",
      }
   }
}

impl fmt::Display for FailureStage {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      write!(f, "{}", self.as_str())
   }
}

/// Bounded diagnostic for every non-PASS outcome. Seeds the next retry
/// prompt, so everything in here must stay small and textual.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureBrief {
   pub stage: FailureStage,

   #[serde(default, skip_serializing_if = "Option::is_none")]
   pub command: Option<String>,

   #[serde(default, skip_serializing_if = "Option::is_none")]
   pub exit_code: Option<i32>,

   pub primary_error_excerpt: String,

   pub constraints_reminder: String,
}

impl FailureBrief {
   /// Build a brief, truncating the excerpt to the hard cap.
   pub fn new(stage: FailureStage, excerpt: impl Into<String>, reminder: impl Into<String>) -> Self {
      Self {
         stage,
         command: None,
         exit_code: None,
         primary_error_excerpt: truncate_excerpt(&excerpt.into()),
         constraints_reminder: reminder.into(),
      }
   }

   pub fn with_command(mut self, command: impl Into<String>, exit_code: i32) -> Self {
      self.command = Some(command.into());
      self.exit_code = Some(exit_code);
      self
   }
}

/// Truncate a diagnostic to `EXCERPT_LIMIT` characters, keeping the tail --
/// the end of a build log is where the actual error lives.
pub fn truncate_excerpt(s: &str) -> String {
   let count = s.chars().count();
   if count <= EXCERPT_LIMIT {
      return s.to_string();
   }
   let tail: String = s.chars().skip(count - EXCERPT_LIMIT).collect();
   tail
}

// === Command execution record ===

/// Result of one sandboxed subprocess execution. Timeouts and OS-level
/// refusals are lifted into the `-1` exit sentinel rather than errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandOutcome {
   pub argv: Vec<String>,

   pub exit_code: i32,

   pub duration_ms: u64,

   pub stdout_path: String,

   pub stderr_path: String,

   pub stdout_excerpt: String,

   pub stderr_excerpt: String,

   #[serde(default)]
   pub stdout_truncated: bool,

   #[serde(default)]
   pub stderr_truncated: bool,

   #[serde(default)]
   pub timed_out: bool,
}

impl CommandOutcome {
   pub const fn success(&self) -> bool {
      self.exit_code == 0
   }
}

// === Attempt record / run summary ===

/// Immutable record of one attempt, appended by Finalize.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptRecord {
   pub attempt_index: u32,

   pub baseline_commit: String,

   #[serde(default, skip_serializing_if = "Option::is_none")]
   pub proposal_path: Option<String>,

   #[serde(default)]
   pub touched_files: Vec<String>,

   #[serde(default)]
   pub write_ok: bool,

   #[serde(default)]
   pub verify_results: Vec<CommandOutcome>,

   #[serde(default)]
   pub acceptance_results: Vec<CommandOutcome>,

   #[serde(default, skip_serializing_if = "Option::is_none")]
   pub failure_brief: Option<FailureBrief>,

   #[serde(default)]
   pub repo_drift: Vec<String>,
}

/// Final verdict of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Verdict {
   Pass,
   Fail,
   Error,
}

impl fmt::Display for Verdict {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      match self {
         Self::Pass => write!(f, "PASS"),
         Self::Fail => write!(f, "FAIL"),
         Self::Error => write!(f, "ERROR"),
      }
   }
}

/// The canonical post-mortem record, persisted after every attempt and on
/// every termination path including interrupts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
   pub run_id: String,

   pub work_order_id: String,

   pub verdict: Verdict,

   pub total_attempts: u32,

   pub baseline_commit: String,

   /// Tree hash of the touched files only, present on PASS.
   #[serde(default, skip_serializing_if = "Option::is_none")]
   pub repo_tree_hash_after: Option<String>,

   pub config: crate::config::FactoryConfig,

   pub attempts: Vec<AttemptRecord>,

   #[serde(default, skip_serializing_if = "Option::is_none")]
   pub error: Option<String>,

   #[serde(default)]
   pub rollback_failed: bool,

   pub started_at: String,

   pub finished_at: String,
}

// === CLI ===

#[derive(Parser, Debug)]
#[command(name = "foreman", version, about = "Drive an LLM through a contract-bound work order", long_about = None)]
pub struct Cli {
   #[command(subcommand)]
   pub command: CliCommand,
}

#[derive(Subcommand, Debug)]
pub enum CliCommand {
   /// Execute one work order against a repository
   Run(RunArgs),
}

#[derive(clap::Args, Debug, Clone, Default)]
pub struct RunArgs {
   /// Path to the target git repository
   #[arg(long)]
   pub repo: PathBuf,

   /// Path to the work order JSON document
   #[arg(long)]
   pub work_order: PathBuf,

   /// Model name for LLM calls
   #[arg(long)]
   pub llm_model: Option<String>,

   /// Maximum attempts before giving up (must be at least 1)
   #[arg(long, default_value_t = 5, value_parser = clap::value_parser!(u32).range(1..))]
   pub max_attempts: u32,

   /// Sampling temperature for LLM calls
   #[arg(long)]
   pub llm_temperature: Option<f32>,

   /// Per-command timeout for verification and acceptance subprocesses
   #[arg(long)]
   pub timeout_seconds: Option<u64>,

   /// Working branch to commit to
   #[arg(long)]
   pub branch: Option<String>,

   /// Create the working branch at the baseline commit
   #[arg(long, requires = "branch", conflicts_with = "reuse_branch")]
   pub create_branch: bool,

   /// Reuse an existing working branch
   #[arg(long, requires = "branch")]
   pub reuse_branch: bool,

   /// Skip the push after a successful commit
   #[arg(long)]
   pub no_push: bool,

   /// Honor verify_exempt on the work order regardless of provenance
   #[arg(long)]
   pub allow_verify_exempt: bool,

   /// Directory for run artifacts (default: system temp dir)
   #[arg(long, visible_alias = "artifacts-dir")]
   pub out: Option<PathBuf>,

   /// Path to a config file (default: ~/.config/foreman/config.toml)
   #[arg(long)]
   pub config: Option<PathBuf>,

   /// Increase log verbosity
   #[arg(long, short = 'v', action = clap::ArgAction::Count)]
   pub verbose: u8,

   /// Suppress progress output on stderr
   #[arg(long, short = 'q', conflicts_with = "verbose")]
   pub quiet: bool,
}
