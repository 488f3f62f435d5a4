//! Sandboxed subprocess execution.
//!
//! Commands run without any shell, with a scrubbed environment, a hard
//! wall-clock deadline, and output streamed to capture files. A command's
//! own failure -- non-zero exit, timeout, missing executable, permission
//! refusal -- is data, not an error: it comes back as a [`CommandOutcome`]
//! with the `-1` sentinel where no real exit code exists.

use std::{
   fs::{File, OpenOptions},
   io::{Read, Seek, SeekFrom, Write},
   path::Path,
   process::{Command, Stdio},
   time::{Duration, Instant},
};

use crate::{
   error::{ForemanError, Result},
   types::{CommandOutcome, EXCERPT_LIMIT},
};

/// Variables inherited from the operator's environment. Everything else is
/// dropped.
const ENV_ALLOWLIST: &[&str] = &["PATH", "HOME", "LANG", "LC_ALL", "TMPDIR"];

const FALLBACK_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// Poll interval while waiting on a child process.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Build the sandboxed child environment: allowlisted inherited variables
/// plus suppressions for the usual sources of nondeterministic droppings
/// (bytecode files, test-runner caches) that rollback would otherwise sweep.
pub fn sandbox_env() -> Vec<(String, String)> {
   let mut env: Vec<(String, String)> = ENV_ALLOWLIST
      .iter()
      .filter_map(|key| std::env::var(key).ok().map(|value| ((*key).to_string(), value)))
      .collect();

   if !env.iter().any(|(k, _)| k == "PATH") {
      env.push(("PATH".to_string(), FALLBACK_PATH.to_string()));
   }

   env.push(("PYTHONDONTWRITEBYTECODE".to_string(), "1".to_string()));
   env.push(("PYTEST_ADDOPTS".to_string(), "-p no:cacheprovider".to_string()));
   env.push(("GIT_TERMINAL_PROMPT".to_string(), "0".to_string()));
   env.push(("NO_COLOR".to_string(), "1".to_string()));
   env
}

/// Execute an argv in `cwd` with output captured to the given files.
///
/// Returns `Err` only for harness-side faults (capture files unwritable);
/// every command-side failure is encoded in the outcome.
pub fn run_command(
   argv: &[String],
   cwd: &Path,
   timeout: Duration,
   stdout_path: &Path,
   stderr_path: &Path,
) -> Result<CommandOutcome> {
   if argv.is_empty() {
      return Err(ForemanError::Other("empty argv".to_string()));
   }

   let start = Instant::now();

   let stdout_file = File::create(stdout_path)
      .map_err(|e| ForemanError::Other(format!("cannot create {}: {e}", stdout_path.display())))?;
   let stderr_file = File::create(stderr_path)
      .map_err(|e| ForemanError::Other(format!("cannot create {}: {e}", stderr_path.display())))?;

   let mut command = Command::new(&argv[0]);
   command
      .args(&argv[1..])
      .current_dir(cwd)
      .env_clear()
      .envs(sandbox_env())
      .stdin(Stdio::null())
      .stdout(Stdio::from(stdout_file))
      .stderr(Stdio::from(stderr_file));

   let mut child = match command.spawn() {
      Ok(child) => child,
      Err(e) => {
         // Missing executable, permission denied, and friends: lifted into
         // the sentinel outcome so the verdict machinery can classify it.
         append_line(stderr_path, &format!("failed to start {}: {e}", argv[0]));
         return Ok(finish_outcome(argv, -1, false, start, stdout_path, stderr_path));
      },
   };

   let deadline = start + timeout;
   loop {
      match child.try_wait() {
         Ok(Some(status)) => {
            let exit_code = status.code().unwrap_or(-1);
            return Ok(finish_outcome(argv, exit_code, false, start, stdout_path, stderr_path));
         },
         Ok(None) => {
            if Instant::now() >= deadline {
               let _ = child.kill();
               let _ = child.wait();
               append_line(
                  stderr_path,
                  &format!("{} timed out after {}s", argv[0], timeout.as_secs()),
               );
               return Ok(finish_outcome(argv, -1, true, start, stdout_path, stderr_path));
            }
            std::thread::sleep(POLL_INTERVAL);
         },
         Err(e) => {
            let _ = child.kill();
            let _ = child.wait();
            append_line(stderr_path, &format!("failed to poll {}: {e}", argv[0]));
            return Ok(finish_outcome(argv, -1, false, start, stdout_path, stderr_path));
         },
      }
   }
}

fn finish_outcome(
   argv: &[String],
   exit_code: i32,
   timed_out: bool,
   start: Instant,
   stdout_path: &Path,
   stderr_path: &Path,
) -> CommandOutcome {
   let (stdout_excerpt, stdout_truncated) = read_excerpt(stdout_path);
   let (stderr_excerpt, stderr_truncated) = read_excerpt(stderr_path);

   CommandOutcome {
      argv: argv.to_vec(),
      exit_code,
      duration_ms: start.elapsed().as_millis() as u64,
      stdout_path: stdout_path.display().to_string(),
      stderr_path: stderr_path.display().to_string(),
      stdout_excerpt,
      stderr_excerpt,
      stdout_truncated,
      stderr_truncated,
      timed_out,
   }
}

fn append_line(path: &Path, line: &str) {
   if let Ok(mut f) = OpenOptions::new().create(true).append(true).open(path) {
      let _ = writeln!(f, "{line}");
   }
}

/// Tail of a capture file, capped at `EXCERPT_LIMIT` characters. The end of
/// the stream is where the actual error lives.
fn read_excerpt(path: &Path) -> (String, bool) {
   let Ok(mut file) = File::open(path) else {
      return (String::new(), false);
   };
   let len = file.metadata().map(|m| m.len()).unwrap_or(0);

   // Over-read in bytes so multi-byte boundaries still yield enough chars.
   let window = (EXCERPT_LIMIT * 4) as u64;
   let seek_to = len.saturating_sub(window);
   if seek_to > 0 && file.seek(SeekFrom::Start(seek_to)).is_err() {
      return (String::new(), false);
   }

   let mut buf = Vec::new();
   if file.read_to_end(&mut buf).is_err() {
      return (String::new(), false);
   }

   let text = String::from_utf8_lossy(&buf);
   let count = text.chars().count();
   if seek_to == 0 && count <= EXCERPT_LIMIT {
      return (text.into_owned(), false);
   }
   let tail: String = text.chars().skip(count.saturating_sub(EXCERPT_LIMIT)).collect();
   (tail, true)
}
