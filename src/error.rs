use thiserror::Error;

#[derive(Debug, Error)]
pub enum ForemanError {
   #[error("Git command failed: {0}")]
   GitError(String),

   #[error("API request failed (HTTP {status}): {body}")]
   ApiError { status: u16, body: String },

   #[error("API call failed after {retries} retries: {source}")]
   ApiRetryExhausted {
      retries: u32,
      #[source]
      source:  Box<Self>,
   },

   #[error("Invalid work order: {0}")]
   WorkOrderError(String),

   #[error("Unsafe path '{path}': {reason}")]
   UnsafePath { path: String, reason: String },

   #[error("Invalid proposal: {0}")]
   ProposalError(String),

   #[error("Invalid command line '{command}': {reason}")]
   CommandLineError { command: String, reason: String },

   #[error("Preflight check failed: {0}")]
   PreflightError(String),

   #[error("IO error: {0}")]
   IoError(#[from] std::io::Error),

   #[error("JSON error: {0}")]
   JsonError(#[from] serde_json::Error),

   #[error("HTTP error: {0}")]
   HttpError(#[from] reqwest::Error),

   #[error("{0}")]
   Other(String),
}

pub type Result<T> = std::result::Result<T, ForemanError>;
