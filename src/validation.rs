//! Contract validation for externally supplied data: work orders from the
//! planner, proposals from the LLM, and every path either one names.
//!
//! Paths are the recurring attack surface. A string-level prefix check is
//! not enough, so filesystem writes additionally go through
//! [`resolve_in_repo`], which compares canonicalized ancestors.

use std::path::{Component, Path, PathBuf};

use crate::{
   config::FactoryConfig,
   error::{ForemanError, Result},
   hashing,
   types::{ConditionKind, WorkOrder, WriteProposal},
};

/// Glob characters refused in contract paths.
const GLOB_CHARS: &[char] = &['*', '?', '[', ']', '{', '}'];

/// Check that a contract path is a safe, normalized relative path.
pub fn check_rel_path(path: &str) -> Result<()> {
   let reject = |reason: &str| {
      Err(ForemanError::UnsafePath { path: path.to_string(), reason: reason.to_string() })
   };

   if path.is_empty() {
      return reject("empty path");
   }
   if path.chars().any(char::is_control) {
      return reject("control character in path");
   }
   if path.contains(GLOB_CHARS) {
      return reject("glob character in path");
   }
   if path.contains('\\') {
      return reject("backslash in path");
   }
   if path.starts_with('-') {
      return reject("leading dash");
   }

   let p = Path::new(path);
   if p.is_absolute() {
      return reject("absolute path");
   }

   for component in p.components() {
      match component {
         Component::Normal(_) => {},
         Component::ParentDir => return reject("parent-directory traversal"),
         Component::CurDir => return reject("redundant '.' segment"),
         _ => return reject("non-relative component"),
      }
   }

   Ok(())
}

/// Resolve a contract path against the repository root and confirm it lands
/// inside it, following symlinks on every existing ancestor. Returns the
/// absolute (non-canonical) target path.
pub fn resolve_in_repo(repo_root: &Path, rel: &str) -> Result<PathBuf> {
   check_rel_path(rel)?;

   let canonical_root = repo_root.canonicalize().map_err(|e| ForemanError::UnsafePath {
      path:   rel.to_string(),
      reason: format!("repo root {} not resolvable: {e}", repo_root.display()),
   })?;

   let target = canonical_root.join(rel);

   // Canonicalize the deepest existing ancestor; everything below it cannot
   // contain a symlink yet.
   let mut probe = target.clone();
   while !probe.exists() {
      match probe.parent() {
         Some(parent) => probe = parent.to_path_buf(),
         None => {
            return Err(ForemanError::UnsafePath {
               path:   rel.to_string(),
               reason: "no existing ancestor".to_string(),
            });
         },
      }
   }

   let real = probe.canonicalize().map_err(|e| ForemanError::UnsafePath {
      path:   rel.to_string(),
      reason: format!("cannot resolve {}: {e}", probe.display()),
   })?;

   if !real.starts_with(&canonical_root) {
      return Err(ForemanError::UnsafePath {
         path:   rel.to_string(),
         reason: format!("resolves outside repository root ({})", real.display()),
      });
   }

   Ok(target)
}

/// Validate a work order against the contract invariants. Runs once at load
/// time; the factory only ever sees validated orders.
pub fn validate_work_order(wo: &WorkOrder, config: &FactoryConfig) -> Result<()> {
   if wo.id.trim().is_empty() {
      return Err(ForemanError::WorkOrderError("work order id is empty".to_string()));
   }

   for path in &wo.allowed_files {
      check_rel_path(path)?;
   }
   for cond in &wo.preconditions {
      check_rel_path(&cond.path)?;
   }
   for cond in &wo.postconditions {
      check_rel_path(&cond.path)?;
      if cond.kind != ConditionKind::FileExists {
         return Err(ForemanError::WorkOrderError(format!(
            "postcondition on '{}' must be file_exists",
            cond.path
         )));
      }
      if !wo.allowed_files.contains(&cond.path) {
         return Err(ForemanError::WorkOrderError(format!(
            "postcondition path '{}' is not in allowed_files",
            cond.path
         )));
      }
   }
   for path in &wo.context_files {
      check_rel_path(path)?;
   }
   if wo.context_files.len() > config.max_context_files {
      return Err(ForemanError::WorkOrderError(format!(
         "{} context files exceed the limit of {}",
         wo.context_files.len(),
         config.max_context_files
      )));
   }

   if wo.acceptance_commands.is_empty() {
      return Err(ForemanError::WorkOrderError("acceptance_commands is empty".to_string()));
   }
   for cmd in &wo.acceptance_commands {
      cmd.to_argv()?;
   }

   Ok(())
}

/// Validate a parsed proposal: shape, path safety, hash format, and size
/// limits. Scope and duplicate checks are the applier's responsibility.
pub fn validate_proposal(proposal: &WriteProposal, config: &FactoryConfig) -> Result<()> {
   if proposal.writes.is_empty() {
      return Err(ForemanError::ProposalError("proposal contains no writes".to_string()));
   }

   let mut total_bytes = 0usize;
   for write in &proposal.writes {
      check_rel_path(&write.path)?;

      if !hashing::is_sha256_hex(&write.base_sha256) {
         return Err(ForemanError::ProposalError(format!(
            "base_sha256 for '{}' is not a lowercase sha-256 hex digest",
            write.path
         )));
      }

      let len = write.content.len();
      if len > config.max_file_bytes {
         return Err(ForemanError::ProposalError(format!(
            "content for '{}' is {len} bytes, exceeding the per-file limit of {}",
            write.path, config.max_file_bytes
         )));
      }
      total_bytes += len;
   }

   if total_bytes > config.max_proposal_bytes {
      return Err(ForemanError::ProposalError(format!(
         "proposal totals {total_bytes} bytes, exceeding the batch limit of {}",
         config.max_proposal_bytes
      )));
   }

   Ok(())
}

#[cfg(test)]
mod tests {
   use indexmap::IndexSet;

   use super::*;
   use crate::{
      hashing::EMPTY_SHA256,
      types::{CommandLine, Condition, FileWrite},
   };

   fn base_work_order() -> WorkOrder {
      WorkOrder {
         id: "wo-1".to_string(),
         title: String::new(),
         intent: String::new(),
         preconditions: vec![],
         postconditions: vec![],
         allowed_files: IndexSet::from(["src/lib.rs".to_string()]),
         forbidden: String::new(),
         acceptance_commands: vec![CommandLine::Line("cargo check".to_string())],
         context_files: vec![],
         notes: String::new(),
         verify_exempt: false,
         provenance: None,
      }
   }

   fn write(path: &str, content: &str) -> FileWrite {
      FileWrite {
         path:        path.to_string(),
         base_sha256: EMPTY_SHA256.to_string(),
         content:     content.to_string(),
      }
   }

   #[test]
   fn test_rel_path_accepts_normal_paths() {
      assert!(check_rel_path("hello.txt").is_ok());
      assert!(check_rel_path("src/deep/nested/mod.rs").is_ok());
   }

   #[test]
   fn test_rel_path_rejects_traversal() {
      assert!(check_rel_path("../etc/passwd").is_err());
      assert!(check_rel_path("src/../../evil").is_err());
      assert!(check_rel_path("./src/lib.rs").is_err());
   }

   #[test]
   fn test_rel_path_rejects_absolute() {
      assert!(check_rel_path("/etc/passwd").is_err());
   }

   #[test]
   fn test_rel_path_rejects_glob_and_control() {
      assert!(check_rel_path("src/*.rs").is_err());
      assert!(check_rel_path("file?.txt").is_err());
      assert!(check_rel_path("a[b].txt").is_err());
      assert!(check_rel_path("bad\0path").is_err());
      assert!(check_rel_path("bad\npath").is_err());
   }

   #[test]
   fn test_rel_path_rejects_dash_backslash_empty() {
      assert!(check_rel_path("-rf").is_err());
      assert!(check_rel_path("a\\b.txt").is_err());
      assert!(check_rel_path("").is_err());
   }

   #[test]
   fn test_resolve_in_repo_contains_new_file() {
      let dir = tempfile::tempdir().unwrap();
      let target = resolve_in_repo(dir.path(), "sub/new.txt").unwrap();
      assert!(target.ends_with("sub/new.txt"));
   }

   #[cfg(unix)]
   #[test]
   fn test_resolve_in_repo_rejects_symlink_escape() {
      let outside = tempfile::tempdir().unwrap();
      let repo = tempfile::tempdir().unwrap();
      std::os::unix::fs::symlink(outside.path(), repo.path().join("link")).unwrap();
      assert!(resolve_in_repo(repo.path(), "link/evil.txt").is_err());
   }

   #[test]
   fn test_work_order_postcondition_must_be_allowed() {
      let config = FactoryConfig::default();
      let mut wo = base_work_order();
      wo.postconditions =
         vec![Condition { kind: ConditionKind::FileExists, path: "other.txt".to_string() }];
      assert!(validate_work_order(&wo, &config).is_err());

      wo.postconditions =
         vec![Condition { kind: ConditionKind::FileExists, path: "src/lib.rs".to_string() }];
      assert!(validate_work_order(&wo, &config).is_ok());
   }

   #[test]
   fn test_work_order_postcondition_kind_restricted() {
      let config = FactoryConfig::default();
      let mut wo = base_work_order();
      wo.postconditions =
         vec![Condition { kind: ConditionKind::FileAbsent, path: "src/lib.rs".to_string() }];
      assert!(validate_work_order(&wo, &config).is_err());
   }

   #[test]
   fn test_work_order_requires_acceptance_commands() {
      let config = FactoryConfig::default();
      let mut wo = base_work_order();
      wo.acceptance_commands = vec![];
      assert!(validate_work_order(&wo, &config).is_err());
   }

   #[test]
   fn test_work_order_context_file_limit() {
      let config = FactoryConfig::default();
      let mut wo = base_work_order();
      wo.context_files = (0..=config.max_context_files).map(|i| format!("f{i}.txt")).collect();
      assert!(validate_work_order(&wo, &config).is_err());
      wo.context_files.pop();
      assert!(validate_work_order(&wo, &config).is_ok());
   }

   #[test]
   fn test_work_order_rejects_metacharacter_command() {
      let config = FactoryConfig::default();
      let mut wo = base_work_order();
      wo.acceptance_commands = vec![CommandLine::Line("make && make install".to_string())];
      assert!(validate_work_order(&wo, &config).is_err());
   }

   #[test]
   fn test_proposal_rejects_empty_writes() {
      let config = FactoryConfig::default();
      let proposal = WriteProposal { summary: "s".to_string(), writes: vec![] };
      assert!(validate_proposal(&proposal, &config).is_err());
   }

   #[test]
   fn test_proposal_per_file_limit_boundary() {
      let config = FactoryConfig::default();
      let at_limit = "x".repeat(config.max_file_bytes);
      let proposal =
         WriteProposal { summary: "s".to_string(), writes: vec![write("a.txt", &at_limit)] };
      assert!(validate_proposal(&proposal, &config).is_ok());

      let over = "x".repeat(config.max_file_bytes + 1);
      let proposal =
         WriteProposal { summary: "s".to_string(), writes: vec![write("a.txt", &over)] };
      assert!(validate_proposal(&proposal, &config).is_err());
   }

   #[test]
   fn test_proposal_total_limit() {
      let config = FactoryConfig::default();
      let chunk = "x".repeat(config.max_file_bytes);
      // Three 200 KiB files exceed the 500 KiB batch cap.
      let proposal = WriteProposal {
         summary: "s".to_string(),
         writes:  vec![write("a.txt", &chunk), write("b.txt", &chunk), write("c.txt", &chunk)],
      };
      assert!(validate_proposal(&proposal, &config).is_err());
   }

   #[test]
   fn test_proposal_rejects_bad_hash() {
      let config = FactoryConfig::default();
      let mut w = write("a.txt", "hi");
      w.base_sha256 = "not-a-hash".to_string();
      let proposal = WriteProposal { summary: "s".to_string(), writes: vec![w] };
      assert!(validate_proposal(&proposal, &config).is_err());
   }

   #[test]
   fn test_proposal_rejects_unsafe_path() {
      let config = FactoryConfig::default();
      let proposal =
         WriteProposal { summary: "s".to_string(), writes: vec![write("../escape.txt", "hi")] };
      assert!(validate_proposal(&proposal, &config).is_err());
   }
}
