//! SE stage: turn a work order (plus any previous failure) into a validated
//! write proposal, or a failure brief.
//!
//! This stage never mutates the repository. It gates on preconditions,
//! assembles read-only context, prompts the LLM once, and parses the reply
//! against the proposal schema.

use std::{fmt::Write as _, path::Path};

use serde_json::json;

use crate::{
   api::LlmClient,
   artifacts::{atomic_write_json, atomic_write_text},
   config::FactoryConfig,
   error::Result,
   hashing,
   types::{ConditionKind, FailureBrief, FailureStage, WorkOrder, WriteProposal},
   validation,
};

/// Result of the propose stage: either a validated proposal or the brief
/// that explains why there is none.
pub enum ProposeOutcome {
   Proposal(WriteProposal),
   Failed(FailureBrief),
}

/// One context file as embedded in the prompt.
struct ContextEntry {
   path:      String,
   sha256:    String,
   content:   String,
   truncated: bool,
}

/// Run the propose stage for one attempt. Artifacts land in `attempt_dir`;
/// any brief is persisted there eagerly (write-ahead) so a kill between
/// stages still leaves a diagnosable record.
pub fn run_propose(
   wo: &WorkOrder,
   repo_root: &Path,
   previous_brief: Option<&FailureBrief>,
   llm: &dyn LlmClient,
   config: &FactoryConfig,
   attempt_dir: &Path,
) -> Result<ProposeOutcome> {
   // Precondition gate runs before any LLM work. A violated precondition is
   // a planner bug: no amount of LLM effort can repair a broken plan, so
   // the stage is non-retryable and no prompt artifact is produced.
   let violations = check_preconditions(wo, repo_root);
   if !violations.is_empty() {
      let excerpt = format!("PLANNER-CONTRACT BUG: {}", violations.join("; "));
      let brief = FailureBrief::new(FailureStage::Preflight, excerpt, constraints_reminder(wo));
      write_brief(attempt_dir, &brief)?;
      return Ok(ProposeOutcome::Failed(brief));
   }

   let context = assemble_context(wo, repo_root, config)?;
   let prompt = build_prompt(wo, &context, previous_brief);
   atomic_write_text(&attempt_dir.join("se_prompt.txt"), &prompt)?;

   let raw = match llm.complete(&prompt) {
      Ok(raw) => raw,
      Err(e) => {
         let brief =
            FailureBrief::new(FailureStage::Exception, e.to_string(), constraints_reminder(wo));
         write_brief(attempt_dir, &brief)?;
         return Ok(ProposeOutcome::Failed(brief));
      },
   };

   match parse_proposal(&raw, config) {
      Ok(proposal) => {
         atomic_write_json(&attempt_dir.join("proposed_writes.json"), &proposal)?;
         Ok(ProposeOutcome::Proposal(proposal))
      },
      Err(e) => {
         // Preserve the raw reply for post-mortems; the brief only carries
         // the bounded parse error.
         atomic_write_json(&attempt_dir.join("raw_llm_response.json"), &json!({ "response": raw }))?;
         let brief = FailureBrief::new(
            FailureStage::LlmOutputInvalid,
            e.to_string(),
            constraints_reminder(wo),
         );
         write_brief(attempt_dir, &brief)?;
         Ok(ProposeOutcome::Failed(brief))
      },
   }
}

/// Persist a brief eagerly; Finalize later overwrites with the canonical
/// record.
pub fn write_brief(attempt_dir: &Path, brief: &FailureBrief) -> Result<()> {
   atomic_write_json(&attempt_dir.join("failure_brief.json"), brief)
}

/// Check every precondition against the filesystem; returns violations.
fn check_preconditions(wo: &WorkOrder, repo_root: &Path) -> Vec<String> {
   let mut violations = Vec::new();
   for cond in &wo.preconditions {
      let path = repo_root.join(&cond.path);
      match cond.kind {
         ConditionKind::FileExists => {
            if !path.is_file() {
               violations.push(format!("precondition file_exists('{}') violated", cond.path));
            }
         },
         ConditionKind::FileAbsent => {
            if path.exists() {
               violations.push(format!("precondition file_absent('{}') violated", cond.path));
            }
         },
      }
   }
   violations
}

/// The standing constraints echoed into every brief, so a retry prompt
/// always restates the contract.
pub fn constraints_reminder(wo: &WorkOrder) -> String {
   let allowed: Vec<&str> = wo.allowed_files.iter().map(String::as_str).collect();
   let mut reminder = format!(
      "Write only these files: {}. Reply with one JSON object {{\"summary\", \"writes\"}}; \
       each write needs path, base_sha256 of the current content, and the full new content.",
      allowed.join(", ")
   );
   if !wo.forbidden.is_empty() {
      let _ = write!(reminder, " Forbidden: {}", wo.forbidden);
   }
   reminder
}

/// Cut a string at a byte budget without splitting a UTF-8 character.
fn truncate_to_bytes(s: &str, max_bytes: usize) -> &str {
   if s.len() <= max_bytes {
      return s;
   }
   let mut end = max_bytes;
   while end > 0 && !s.is_char_boundary(end) {
      end -= 1;
   }
   &s[..end]
}

/// Read the context files in declared order under the total byte budget.
/// Hashes always cover the full current content; only the embedded text is
/// truncated, deterministically at the budget boundary.
fn assemble_context(
   wo: &WorkOrder,
   repo_root: &Path,
   config: &FactoryConfig,
) -> Result<Vec<ContextEntry>> {
   let mut entries = Vec::new();
   let mut remaining = config.max_context_bytes;

   for rel in &wo.context_files {
      let path = repo_root.join(rel);
      let bytes = if path.is_file() { std::fs::read(&path)? } else { Vec::new() };
      let sha256 = hashing::sha256_hex(&bytes);

      let full = String::from_utf8_lossy(&bytes);
      let cut = truncate_to_bytes(&full, remaining);
      let truncated = cut.len() < full.len();
      remaining = remaining.saturating_sub(cut.len());

      entries.push(ContextEntry {
         path: rel.clone(),
         sha256,
         content: cut.to_string(),
         truncated,
      });
   }

   Ok(entries)
}

/// Render a previous failure brief for the retry prompt. Every field is
/// included so the LLM sees the whole diagnostic.
fn render_failure_brief(brief: &FailureBrief) -> String {
   let mut out = String::new();
   let _ = writeln!(out, "stage: {}", brief.stage);
   if let Some(ref command) = brief.command {
      let _ = writeln!(out, "command: {command}");
   }
   if let Some(exit_code) = brief.exit_code {
      let _ = writeln!(out, "exit_code: {exit_code}");
   }
   let _ = writeln!(out, "error excerpt:\n{}", brief.primary_error_excerpt);
   let _ = writeln!(out, "constraints: {}", brief.constraints_reminder);
   out
}

/// Build the SE prompt. Section order is part of the contract: identity,
/// allowed files, prohibitions, notes, context, previous failure, then the
/// required output schema.
fn build_prompt(
   wo: &WorkOrder,
   context: &[ContextEntry],
   previous_brief: Option<&FailureBrief>,
) -> String {
   let mut p = String::new();

   let _ = writeln!(p, "# Work order {}", wo.id);
   if !wo.title.is_empty() {
      let _ = writeln!(p, "Title: {}", wo.title);
   }
   if !wo.intent.is_empty() {
      let _ = writeln!(p, "Intent: {}", wo.intent);
   }

   let _ = writeln!(p, "\n## Files you may write");
   for path in &wo.allowed_files {
      let _ = writeln!(p, "- {path}");
   }
   let _ = writeln!(p, "Writing any other path fails the attempt.");

   if !wo.forbidden.is_empty() {
      let _ = writeln!(p, "\n## Forbidden");
      let _ = writeln!(p, "{}", wo.forbidden);
   }

   if !wo.notes.is_empty() {
      let _ = writeln!(p, "\n## Notes");
      let _ = writeln!(p, "{}", wo.notes);
   }

   if !context.is_empty() {
      let _ = writeln!(p, "\n## Current file contents");
      let _ = writeln!(
         p,
         "For each file below, sha256 is the hash of its current content; use it as the \
          base_sha256 when you rewrite that file. Absent or new files hash as {}.",
         hashing::EMPTY_SHA256
      );
      for entry in context {
         let _ = writeln!(p, "\n### {} (sha256: {})", entry.path, entry.sha256);
         let _ = writeln!(p, "```");
         let _ = writeln!(p, "{}", entry.content);
         if entry.truncated {
            let _ = writeln!(p, "[... truncated at context budget ...]");
         }
         let _ = writeln!(p, "```");
      }
   }

   if let Some(brief) = previous_brief {
      let _ = writeln!(p, "\n## Previous attempt failed");
      let _ = writeln!(p, "{}", render_failure_brief(brief));
      let _ = writeln!(p, "Produce a corrected proposal.");
   }

   let _ = writeln!(p, "\n## Required output");
   let _ = writeln!(
      p,
      "Reply with exactly one JSON object, no prose, of the form:\n\
       {{\"summary\": \"<one line>\", \"writes\": [{{\"path\": \"<relative path>\", \
       \"base_sha256\": \"<sha-256 of the content you are replacing>\", \
       \"content\": \"<full new file content>\"}}]}}"
   );

   p
}

/// Strip an optional markdown code fence around the reply.
fn strip_code_fences(raw: &str) -> &str {
   let trimmed = raw.trim();
   let Some(rest) = trimmed.strip_prefix("```") else {
      return trimmed;
   };
   // Drop the info string ("json", "JSON", ...) on the opening fence line.
   let rest = match rest.find('\n') {
      Some(idx) => &rest[idx + 1..],
      None => rest,
   };
   rest.strip_suffix("```").map_or(rest, str::trim).trim()
}

/// Parse and validate the LLM reply into a proposal.
fn parse_proposal(raw: &str, config: &FactoryConfig) -> Result<WriteProposal> {
   let body = strip_code_fences(raw);
   let proposal: WriteProposal = serde_json::from_str(body)?;
   validation::validate_proposal(&proposal, config)?;
   Ok(proposal)
}
