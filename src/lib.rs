//! Deterministic execution harness for LLM-driven repository changes.
//!
//! One work order in, one verdict out: the factory drives an LLM through a
//! bounded retry loop until the order's contract is satisfied and committed
//! to a working branch, or retries are exhausted and the repository is
//! returned byte-identical to its baseline.
pub mod api;
pub mod apply;
pub mod artifacts;
pub mod config;
pub mod error;
pub mod factory;
pub mod hashing;
pub mod propose;
pub mod runner;
pub mod style;
pub mod types;
pub mod validation;
pub mod verify;
pub mod workspace;

// Re-export commonly used types
pub use config::FactoryConfig;
pub use error::{ForemanError, Result};
pub use factory::Factory;
pub use types::{FailureBrief, FailureStage, RunSummary, Verdict, WorkOrder, WriteProposal};
