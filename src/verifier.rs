//! Postcondition checks.
//!
//! A step without a verification command is trusted once its action exits
//! successfully. A step with one is only complete when the check passes; the
//! action's own exit status is necessary but not sufficient.

use crate::command_runner::run_command;
use crate::registry::Step;
use tracing::{debug, info};

/// Result of a postcondition check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verification {
    Verified,
    Unverified(String),
}

impl Verification {
    pub fn is_verified(&self) -> bool {
        matches!(self, Self::Verified)
    }
}

/// Runs a step's verification command under the step's timeout.
#[derive(Debug, Clone, Copy, Default)]
pub struct Verifier;

impl Verifier {
    pub fn new() -> Self {
        Self
    }

    /// Check the postcondition of `step`
    pub fn check(&self, step: &Step) -> Verification {
        let Some(check) = &step.verify else {
            debug!("{}: no verification, trusting action", step.name);
            return Verification::Verified;
        };

        let output = match run_command(check, step.timeout) {
            Ok(output) => output,
            Err(e) => return Verification::Unverified(format!("{:#}", e)),
        };

        match output.ensure_success(&format!("verification '{}'", check.display_line())) {
            Ok(()) => {
                info!("{}: verified", step.name);
                Verification::Verified
            }
            Err(e) => {
                info!("{}: not verified: {}", step.name, e);
                Verification::Unverified(e.to_string())
            }
        }
    }
}
