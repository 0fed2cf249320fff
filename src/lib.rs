//! homebox library
//!
//! Dependency-ordered, resumable setup steps for one workstation at a time.
//! The binary in `main.rs` is a thin layer over [`Orchestrator`].

pub mod cli;
pub mod command_runner;
pub mod config_file;
pub mod error;
pub mod executor;
pub mod orchestrator;
pub mod planner;
pub mod process_guard;
pub mod registry;
pub mod report;
pub mod state_store;
pub mod types;
pub mod verifier;

// Re-export main types for convenience
pub use command_runner::{CommandOutput, run_command};
pub use config_file::StepsFile;
pub use error::{GraphError, HomeboxError};
pub use executor::{Executor, StepOutcome};
pub use orchestrator::{Orchestrator, SessionOptions, SessionOutcome, SessionReport};
pub use planner::{BlockedChain, Plan, PlanRequest, Planner};
pub use process_guard::{AbortFlag, ChildRegistry, CommandProcessGroup, ProcessGuard};
pub use registry::{CommandSpec, Step, StepGraph};
pub use state_store::{StateStore, StepRecord, Transition};
pub use types::{FailureKind, StepStatus};
pub use verifier::{Verification, Verifier};
