use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{
   error::{ForemanError, Result},
   types::RunArgs,
};

/// Tunable limits and endpoints for one factory run. Loaded from TOML,
/// overridden by environment, then by CLI flags; the effective values are
/// recorded verbatim in `run_summary.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FactoryConfig {
   /// OpenAI-compatible chat completions endpoint.
   pub api_base_url: String,

   /// Optional API key (overridden by `FOREMAN_API_KEY` env var).
   #[serde(skip_serializing)]
   pub api_key: Option<String>,

   pub llm_model: String,

   pub temperature: f32,

   /// HTTP request timeout in seconds
   pub request_timeout_secs: u64,

   /// HTTP connection timeout in seconds
   pub connect_timeout_secs: u64,

   /// Transport-level retries per LLM call
   pub max_retries: u32,

   pub initial_backoff_ms: u64,

   /// Attempts of the full propose/apply/verify cycle per work order
   pub max_attempts: u32,

   /// Wall-clock budget per verification or acceptance subprocess
   pub command_timeout_secs: u64,

   pub max_file_bytes:     usize,
   pub max_proposal_bytes: usize,
   pub max_context_bytes:  usize,
   pub max_context_files:  usize,

   /// Branches the factory refuses to commit to.
   pub protected_branches: Vec<String>,

   /// Repository-relative verify entry point, used when present.
   pub verify_script: String,

   /// Fallback verification commands when no verify script exists.
   pub verify_fallback: Vec<String>,

   /// Lightweight check substituted for global verify under verify_exempt.
   pub verify_exempt_check: Vec<String>,

   pub push_remote: String,

   pub push_enabled: bool,

   pub commit_user_name:  String,
   pub commit_user_email: String,
}

impl Default for FactoryConfig {
   fn default() -> Self {
      Self {
         api_base_url:         "http://localhost:4000".to_string(),
         api_key:              None,
         llm_model:            "claude-sonnet-4.5".to_string(),
         temperature:          0.0,
         request_timeout_secs: 300,
         connect_timeout_secs: 30,
         max_retries:          3,
         initial_backoff_ms:   1000,
         max_attempts:         5,
         command_timeout_secs: 600,
         max_file_bytes:       200 * 1024,
         max_proposal_bytes:   500 * 1024,
         max_context_bytes:    200 * 1024,
         max_context_files:    10,
         protected_branches:   vec!["main".to_string(), "master".to_string()],
         verify_script:        "scripts/verify.sh".to_string(),
         verify_fallback:      vec![
            "python3 -m compileall -q .".to_string(),
            "python3 -m pytest -q".to_string(),
         ],
         verify_exempt_check:  vec!["python3 -m compileall -q .".to_string()],
         push_remote:          "origin".to_string(),
         push_enabled:         true,
         commit_user_name:     "foreman".to_string(),
         commit_user_email:    "foreman@localhost".to_string(),
      }
   }
}

impl FactoryConfig {
   /// Load config from the default location, falling back to defaults when
   /// no file exists. Environment variables override file values:
   /// - `FOREMAN_CONFIG` overrides the config path
   /// - `FOREMAN_API_URL` overrides `api_base_url`
   /// - `FOREMAN_API_KEY` overrides `api_key`
   pub fn load() -> Result<Self> {
      let config_path = if let Ok(custom_path) = std::env::var("FOREMAN_CONFIG") {
         PathBuf::from(custom_path)
      } else {
         Self::default_config_path().unwrap_or_else(|_| PathBuf::new())
      };

      let mut config = if config_path.exists() {
         Self::from_file(&config_path)?
      } else {
         Self::default()
      };

      Self::apply_env_overrides(&mut config);
      Ok(config)
   }

   /// Load config from a specific file.
   pub fn from_file(path: &Path) -> Result<Self> {
      let contents = std::fs::read_to_string(path)
         .map_err(|e| ForemanError::Other(format!("Failed to read config: {e}")))?;
      let mut config: Self = toml::from_str(&contents)
         .map_err(|e| ForemanError::Other(format!("Failed to parse config: {e}")))?;

      Self::apply_env_overrides(&mut config);
      Ok(config)
   }

   fn apply_env_overrides(config: &mut Self) {
      if let Ok(api_url) = std::env::var("FOREMAN_API_URL") {
         config.api_base_url = api_url;
      }

      if let Ok(api_key) = std::env::var("FOREMAN_API_KEY") {
         config.api_key = Some(api_key);
      }
   }

   /// Apply CLI flag overrides. Flags win over file and environment.
   pub fn apply_cli_overrides(&mut self, args: &RunArgs) {
      if let Some(ref model) = args.llm_model {
         self.llm_model = model.clone();
      }
      if let Some(temp) = args.llm_temperature {
         if (0.0..=1.0).contains(&temp) {
            self.temperature = temp;
         } else {
            eprintln!(
               "Warning: Temperature {} out of range [0.0, 1.0], using {}",
               temp, self.temperature
            );
         }
      }
      if let Some(secs) = args.timeout_seconds {
         self.command_timeout_secs = secs;
      }
      self.max_attempts = args.max_attempts;
      if args.no_push {
         self.push_enabled = false;
      }
   }

   /// Default config path (tries HOME, then USERPROFILE).
   pub fn default_config_path() -> Result<PathBuf> {
      if let Ok(home) = std::env::var("HOME") {
         return Ok(PathBuf::from(home).join(".config/foreman/config.toml"));
      }

      if let Ok(home) = std::env::var("USERPROFILE") {
         return Ok(PathBuf::from(home).join(".config/foreman/config.toml"));
      }

      Err(ForemanError::Other("No home directory found (tried HOME and USERPROFILE)".to_string()))
   }
}
