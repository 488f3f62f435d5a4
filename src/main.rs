use std::{path::PathBuf, sync::Arc};

use clap::Parser;
use foreman::{
   api::HttpLlmClient,
   artifacts::{self, ArtifactStore},
   config::FactoryConfig,
   error::{ForemanError, Result},
   factory::{EmergencySeed, Factory, emergency_finalize},
   style, validation,
   types::{Cli, CliCommand, RunArgs, RunSummary, Verdict, WorkOrder},
   workspace::{BranchMode, Workspace, is_protected_branch},
};
use parking_lot::Mutex;

/// Whether the verify-exempt flag on a work order is actually honored:
/// trusted bootstrap provenance, or an explicit operator override.
fn exempt_honored(wo: &WorkOrder, allow_flag: bool) -> bool {
   if !wo.verify_exempt {
      return false;
   }
   allow_flag || wo.provenance.as_ref().is_some_and(|p| p.bootstrap)
}

/// Everything assembled before the state machine starts.
struct RunContext {
   work_order:   WorkOrder,
   workspace:    Workspace,
   config:       FactoryConfig,
   store:        ArtifactStore,
   run_id:       String,
   baseline:     String,
   honor_exempt: bool,
   push_branch:  Option<String>,
   seed:         EmergencySeed,
}

fn prepare(args: &RunArgs) -> Result<RunContext> {
   let mut config = if let Some(ref path) = args.config {
      FactoryConfig::from_file(path)?
   } else {
      FactoryConfig::load()?
   };
   config.apply_cli_overrides(args);

   let work_order = WorkOrder::from_file(&args.work_order)?;
   validation::validate_work_order(&work_order, &config)?;

   let workspace = Workspace::new(&args.repo);
   if !workspace.is_git_repo() {
      return Err(ForemanError::PreflightError(format!(
         "{} is not a git repository",
         args.repo.display()
      )));
   }
   if !workspace.has_commits() {
      return Err(ForemanError::PreflightError("repository has no commits".to_string()));
   }
   if !workspace.is_clean()? {
      return Err(ForemanError::PreflightError(
         "working tree is not clean; commit or stash first".to_string(),
      ));
   }

   let baseline = workspace.baseline_commit()?;

   let target_branch = match args.branch {
      Some(ref name) => name.clone(),
      None => workspace.current_branch()?,
   };
   if is_protected_branch(&target_branch, &config.protected_branches) {
      return Err(ForemanError::PreflightError(format!(
         "refusing to commit to protected branch '{target_branch}'"
      )));
   }
   if let Some(ref name) = args.branch {
      let mode = if args.create_branch { BranchMode::Create } else { BranchMode::Reuse };
      workspace.ensure_working_branch(name, &baseline, mode)?;
   }
   workspace.ensure_identity(&config.commit_user_name, &config.commit_user_email)?;

   let honor_exempt = exempt_honored(&work_order, args.allow_verify_exempt);
   if work_order.verify_exempt && !honor_exempt {
      style::warn(
         "work order requests verify_exempt but provenance is untrusted; running full verify",
      );
   }

   let out_root: PathBuf = args
      .out
      .clone()
      .unwrap_or_else(|| std::env::temp_dir().join("foreman"));
   let run_id = artifacts::run_id(&work_order, &baseline)?;
   let store = ArtifactStore::create(&out_root, &run_id)?;

   let seed = EmergencySeed {
      repo_root:       args.repo.clone(),
      baseline_commit: baseline.clone(),
      run_id:          run_id.clone(),
      work_order_id:   work_order.id.clone(),
      config:          config.clone(),
      summary_path:    store.run_summary_path(),
      started_at:      chrono::Utc::now().to_rfc3339(),
   };

   let push_branch = config.push_enabled.then(|| target_branch.clone());

   Ok(RunContext {
      work_order,
      workspace,
      config,
      store,
      run_id,
      baseline,
      honor_exempt,
      push_branch,
      seed,
   })
}

/// Human-readable failure rendering on stderr.
fn report_failure(summary: &RunSummary) {
   let Some(brief) = summary.attempts.last().and_then(|a| a.failure_brief.as_ref()) else {
      return;
   };
   eprintln!("{} failing stage: {}", style::error(style::icons::ERROR), brief.stage);
   if let Some(ref command) = brief.command {
      let code = brief.exit_code.map_or(String::new(), |c| format!(" (exit {c})"));
      eprintln!("  command: {}{code}", style::dim(command));
   }
   if !brief.primary_error_excerpt.is_empty() {
      eprintln!("{}", brief.primary_error_excerpt);
   }
}

fn print_verdict(verdict: Verdict, summary_path: &std::path::Path) {
   // Stays machine-parseable: no styling on stdout.
   println!("Verdict: {verdict}");
   println!("{}", summary_path.display());
}

fn run(args: &RunArgs) -> i32 {
   let ctx = match prepare(args) {
      Ok(ctx) => ctx,
      Err(e) => {
         eprintln!("{} {e}", style::error(style::icons::ERROR));
         return 2;
      },
   };

   if args.verbose > 0 {
      eprintln!("run id: {}", ctx.run_id);
      eprintln!("baseline: {}", ctx.baseline);
      eprintln!("model: {} (temp {})", ctx.config.llm_model, ctx.config.temperature);
      eprintln!("artifacts: {}", ctx.store.run_dir().display());
   }

   // Last-resort interrupt handler: roll back, persist an ERROR summary,
   // exit 130. After a normal finish it only exits.
   let finished = Arc::new(Mutex::new(false));
   {
      let finished = Arc::clone(&finished);
      let seed = ctx.seed.clone();
      let summary_path = ctx.store.run_summary_path();
      if let Err(e) = ctrlc::set_handler(move || {
         if !*finished.lock() {
            eprintln!("\ninterrupted; rolling back to baseline");
            emergency_finalize(&seed, "interrupted (SIGINT)");
            print_verdict(Verdict::Error, &summary_path);
         }
         std::process::exit(130);
      }) {
         style::warn(&format!("could not install interrupt handler: {e}"));
      }
   }

   let llm = HttpLlmClient::new(&ctx.config);
   let mut machine = Factory::new(
      &ctx.work_order,
      &ctx.workspace,
      &llm,
      &ctx.config,
      &ctx.store,
      ctx.run_id.clone(),
      ctx.baseline.clone(),
      ctx.honor_exempt,
      ctx.push_branch.clone(),
      args.quiet,
   );

   let code = match machine.run() {
      Ok(summary) => {
         if summary.verdict != Verdict::Pass {
            report_failure(&summary);
         }
         print_verdict(summary.verdict, &ctx.store.run_summary_path());
         match summary.verdict {
            Verdict::Pass => 0,
            Verdict::Fail => 1,
            Verdict::Error => 2,
         }
      },
      Err(e) => {
         eprintln!("{} internal error: {e}", style::error(style::icons::ERROR));
         emergency_finalize(&ctx.seed, &e.to_string());
         print_verdict(Verdict::Error, &ctx.store.run_summary_path());
         2
      },
   };

   *finished.lock() = true;
   code
}

fn main() {
   dotenvy::dotenv().ok();
   let cli = Cli::parse();
   let CliCommand::Run(args) = cli.command;
   std::process::exit(run(&args));
}
