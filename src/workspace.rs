//! Git operations for the factory.
//!
//! The workspace controller is the only component that mutates the working
//! tree outside of proposal writes: branch setup, rollback, the scoped
//! commit, and cleanup all happen here, shelling out to the `git` binary.

use std::{
   path::{Path, PathBuf},
   process::{Command, Output},
};

use crate::error::{ForemanError, Result};

/// Branch setup mode for `ensure_working_branch`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchMode {
   /// Create a fresh branch at the baseline; fail if it already exists.
   Create,
   /// Check out an existing branch, creating it at the baseline if absent.
   Reuse,
}

/// Whether a branch name is refused as a commit target.
pub fn is_protected_branch(name: &str, protected: &[String]) -> bool {
   protected.iter().any(|p| p == name)
}

/// Handle on one git repository's working tree.
#[derive(Debug, Clone)]
pub struct Workspace {
   root: PathBuf,
}

impl Workspace {
   pub fn new(root: impl Into<PathBuf>) -> Self {
      Self { root: root.into() }
   }

   pub fn root(&self) -> &Path {
      &self.root
   }

   fn git(&self, args: &[&str]) -> Result<Output> {
      self.git_with_env(args, &[])
   }

   fn git_with_env(&self, args: &[&str], envs: &[(&str, &str)]) -> Result<Output> {
      let mut cmd = Command::new("git");
      cmd.args(args)
         .current_dir(&self.root)
         .env("GIT_TERMINAL_PROMPT", "0");
      for (key, value) in envs {
         cmd.env(key, value);
      }
      cmd.output()
         .map_err(|e| ForemanError::GitError(format!("Failed to run git {}: {e}", args.join(" "))))
   }

   /// Run git and require success; returns stdout.
   fn git_ok(&self, args: &[&str]) -> Result<String> {
      let output = self.git(args)?;
      if !output.status.success() {
         let stderr = String::from_utf8_lossy(&output.stderr);
         return Err(ForemanError::GitError(format!("git {} failed: {stderr}", args.join(" "))));
      }
      Ok(String::from_utf8_lossy(&output.stdout).to_string())
   }

   // === Preflight predicates ===

   pub fn is_git_repo(&self) -> bool {
      self
         .git(&["rev-parse", "--git-dir"])
         .map(|o| o.status.success())
         .unwrap_or(false)
   }

   pub fn has_commits(&self) -> bool {
      self
         .git(&["rev-parse", "--verify", "HEAD"])
         .map(|o| o.status.success())
         .unwrap_or(false)
   }

   /// Check if the working tree is clean (no staged, unstaged, or untracked
   /// changes).
   pub fn is_clean(&self) -> Result<bool> {
      let output = self.git(&["status", "--porcelain"])?;
      if !output.status.success() {
         let stderr = String::from_utf8_lossy(&output.stderr);
         return Err(ForemanError::GitError(format!("git status failed: {stderr}")));
      }
      Ok(output.stdout.is_empty())
   }

   /// Current HEAD commit hash.
   pub fn baseline_commit(&self) -> Result<String> {
      Ok(self.git_ok(&["rev-parse", "HEAD"])?.trim().to_string())
   }

   /// Current branch name (`HEAD` when detached).
   pub fn current_branch(&self) -> Result<String> {
      Ok(self.git_ok(&["rev-parse", "--abbrev-ref", "HEAD"])?.trim().to_string())
   }

   // === Setup ===

   /// Set repo-local identity so commits succeed without global config.
   pub fn ensure_identity(&self, name: &str, email: &str) -> Result<()> {
      let has_email = self
         .git(&["config", "user.email"])
         .map(|o| o.status.success() && !o.stdout.is_empty())
         .unwrap_or(false);
      if !has_email {
         self.git_ok(&["config", "user.email", email])?;
         self.git_ok(&["config", "user.name", name])?;
      }
      Ok(())
   }

   /// Check out the working branch rooted at the baseline commit.
   pub fn ensure_working_branch(&self, name: &str, baseline: &str, mode: BranchMode) -> Result<()> {
      let exists = self
         .git(&["rev-parse", "--verify", &format!("refs/heads/{name}")])
         .map(|o| o.status.success())
         .unwrap_or(false);

      match mode {
         BranchMode::Create => {
            if exists {
               return Err(ForemanError::GitError(format!(
                  "branch '{name}' already exists (use reuse mode)"
               )));
            }
            self.git_ok(&["checkout", "-b", name, baseline])?;
         },
         BranchMode::Reuse => {
            if exists {
               self.git_ok(&["checkout", name])?;
            } else {
               self.git_ok(&["checkout", "-b", name, baseline])?;
            }
         },
      }
      Ok(())
   }

   // === Recovery ===

   /// Hard reset to the baseline and remove every untracked file, including
   /// gitignored ones. Idempotent; safe to call when nothing was written.
   pub fn rollback(&self, baseline: &str) -> Result<()> {
      self.git_ok(&["reset", "--hard", baseline])?;
      self.clean_untracked()
   }

   /// Remove untracked and gitignored files (verification droppings).
   pub fn clean_untracked(&self) -> Result<()> {
      self.git_ok(&["clean", "-fdx"])?;
      Ok(())
   }

   // === Commit path ===

   /// Stage exactly the given paths and commit. Returns false when git
   /// reports nothing to commit, which is tolerated.
   pub fn scoped_commit(&self, paths: &[String], message: &str) -> Result<bool> {
      let mut add_args = vec!["add", "-f", "--"];
      add_args.extend(paths.iter().map(String::as_str));
      self.git_ok(&add_args)?;

      let output = self.git(&["commit", "-m", message])?;
      if output.status.success() {
         return Ok(true);
      }

      let stdout = String::from_utf8_lossy(&output.stdout);
      let stderr = String::from_utf8_lossy(&output.stderr);
      // "nothing to commit" lands on stdout or stderr depending on version.
      if stdout.contains("nothing to commit") || stderr.contains("nothing to commit") {
         return Ok(false);
      }

      Err(ForemanError::GitError(format!(
         "git commit failed:\nstderr: {stderr}\nstdout: {stdout}"
      )))
   }

   /// Paths modified or untracked that are outside the touched set.
   pub fn detect_drift(&self, touched: &[String]) -> Result<Vec<String>> {
      let output = self.git_ok(&["status", "--porcelain"])?;
      let mut drift = Vec::new();
      for line in output.lines() {
         if line.len() < 4 {
            continue;
         }
         let entry = &line[3..];
         // Renames are reported as "old -> new"; the new path is the drift.
         let path = entry.rsplit(" -> ").next().unwrap_or(entry).trim();
         if !path.is_empty() && !touched.iter().any(|t| t == path) {
            drift.push(path.to_string());
         }
      }
      Ok(drift)
   }

   /// Deterministic tree hash over just the given paths, computed by staging
   /// them into a scratch index and asking git for the tree object id.
   pub fn tree_hash(&self, paths: &[String]) -> Result<String> {
      let git_dir = self.git_ok(&["rev-parse", "--git-dir"])?;
      let scratch = self.root.join(git_dir.trim()).join("foreman_scratch_index");
      let _ = std::fs::remove_file(&scratch);

      let scratch_str = scratch.display().to_string();
      let envs: [(&str, &str); 1] = [("GIT_INDEX_FILE", scratch_str.as_str())];

      let mut add_args = vec!["add", "-f", "--"];
      add_args.extend(paths.iter().map(String::as_str));
      let add_output = self.git_with_env(&add_args, &envs)?;
      if !add_output.status.success() {
         let _ = std::fs::remove_file(&scratch);
         let stderr = String::from_utf8_lossy(&add_output.stderr);
         return Err(ForemanError::GitError(format!("scratch-index add failed: {stderr}")));
      }

      let tree_output = self.git_with_env(&["write-tree"], &envs)?;
      let _ = std::fs::remove_file(&scratch);
      if !tree_output.status.success() {
         let stderr = String::from_utf8_lossy(&tree_output.stderr);
         return Err(ForemanError::GitError(format!("git write-tree failed: {stderr}")));
      }

      Ok(String::from_utf8_lossy(&tree_output.stdout).trim().to_string())
   }

   /// Push the branch with upstream tracking. Callers treat failure as a
   /// report, not a verdict change.
   pub fn push(&self, remote: &str, branch: &str) -> Result<()> {
      self.git_ok(&["push", "-u", remote, branch])?;
      Ok(())
   }
}
