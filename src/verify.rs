//! PO stage: decide PASS or FAIL for an applied proposal.
//!
//! Ordering is contractual: global verification must pass before any
//! postcondition or acceptance command runs, and acceptance commands run in
//! declared order, stopping at the first failure.

use std::{path::Path, time::Duration};

use serde_json::json;

use crate::{
   artifacts::atomic_write_json,
   config::FactoryConfig,
   error::Result,
   propose, runner,
   types::{CommandLine, CommandOutcome, FailureBrief, FailureStage, WorkOrder, truncate_excerpt},
};

/// Result of the verify stage.
pub struct VerifyOutcome {
   pub verify_results:     Vec<CommandOutcome>,
   pub acceptance_results: Vec<CommandOutcome>,
   pub brief:              Option<FailureBrief>,
}

/// Run global verification, the postcondition gate, and acceptance commands.
pub fn run_verify(
   wo: &WorkOrder,
   repo_root: &Path,
   config: &FactoryConfig,
   attempt_dir: &Path,
   honor_exempt: bool,
) -> Result<VerifyOutcome> {
   let reminder = propose::constraints_reminder(wo);
   let timeout = Duration::from_secs(config.command_timeout_secs);

   // === Global verification ===

   let plan = verify_plan(wo, repo_root, config, honor_exempt)?;
   let mut verify_results = Vec::new();
   for (k, argv) in plan.iter().enumerate() {
      let outcome = runner::run_command(
         argv,
         repo_root,
         timeout,
         &attempt_dir.join(format!("verify_{k}_stdout.txt")),
         &attempt_dir.join(format!("verify_{k}_stderr.txt")),
      )?;
      let ok = outcome.success();
      verify_results.push(outcome);

      if !ok {
         let failed = verify_results.last().expect("just pushed");
         let brief = FailureBrief::new(
            FailureStage::VerifyFailed,
            combined_excerpt(failed),
            reminder,
         )
         .with_command(argv.join(" "), failed.exit_code);
         propose::write_brief(attempt_dir, &brief)?;
         atomic_write_json(
            &attempt_dir.join("verify_result.json"),
            &json!({ "ok": false, "results": verify_results }),
         )?;
         return Ok(VerifyOutcome {
            verify_results,
            acceptance_results: Vec::new(),
            brief: Some(brief),
         });
      }
   }
   atomic_write_json(
      &attempt_dir.join("verify_result.json"),
      &json!({ "ok": true, "results": verify_results }),
   )?;

   // === Postcondition gate ===

   for cond in &wo.postconditions {
      if !repo_root.join(&cond.path).is_file() {
         let brief = FailureBrief::new(
            FailureStage::AcceptanceFailed,
            format!("postcondition file_exists('{}') not satisfied after writes", cond.path),
            reminder,
         );
         propose::write_brief(attempt_dir, &brief)?;
         atomic_write_json(
            &attempt_dir.join("acceptance_result.json"),
            &json!({ "ok": false, "results": [] }),
         )?;
         return Ok(VerifyOutcome {
            verify_results,
            acceptance_results: Vec::new(),
            brief: Some(brief),
         });
      }
   }

   // === Acceptance commands ===

   let mut acceptance_results = Vec::new();
   for (k, cmd) in wo.acceptance_commands.iter().enumerate() {
      let argv = cmd.to_argv()?;
      let outcome = runner::run_command(
         &argv,
         repo_root,
         timeout,
         &attempt_dir.join(format!("acceptance_{k}_stdout.txt")),
         &attempt_dir.join(format!("acceptance_{k}_stderr.txt")),
      )?;
      let ok = outcome.success();
      acceptance_results.push(outcome);

      if !ok {
         let failed = acceptance_results.last().expect("just pushed");
         let brief = FailureBrief::new(
            FailureStage::AcceptanceFailed,
            combined_excerpt(failed),
            reminder,
         )
         .with_command(cmd.display(), failed.exit_code);
         propose::write_brief(attempt_dir, &brief)?;
         atomic_write_json(
            &attempt_dir.join("acceptance_result.json"),
            &json!({ "ok": false, "results": acceptance_results }),
         )?;
         return Ok(VerifyOutcome { verify_results, acceptance_results, brief: Some(brief) });
      }
   }

   atomic_write_json(
      &attempt_dir.join("acceptance_result.json"),
      &json!({ "ok": true, "results": acceptance_results }),
   )?;
   Ok(VerifyOutcome { verify_results, acceptance_results, brief: None })
}

/// Which commands constitute global verification for this work order.
fn verify_plan(
   wo: &WorkOrder,
   repo_root: &Path,
   config: &FactoryConfig,
   honor_exempt: bool,
) -> Result<Vec<Vec<String>>> {
   if wo.verify_exempt && honor_exempt {
      return config
         .verify_exempt_check
         .iter()
         .map(|line| CommandLine::Line(line.clone()).to_argv())
         .collect();
   }

   let script = repo_root.join(&config.verify_script);
   if script.is_file() {
      return Ok(vec![vec!["bash".to_string(), config.verify_script.clone()]]);
   }

   config
      .verify_fallback
      .iter()
      .map(|line| CommandLine::Line(line.clone()).to_argv())
      .collect()
}

/// Tail of stderr and stdout, stderr first -- that is where the signal is.
fn combined_excerpt(outcome: &CommandOutcome) -> String {
   truncate_excerpt(&format!("{}\n{}", outcome.stderr_excerpt, outcome.stdout_excerpt))
}
