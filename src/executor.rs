//! Step Executor
//!
//! Runs one step to a terminal outcome and persists every transition on the
//! way there:
//!
//! ```text
//! Running(1) ─ action fails ─┬─ retries left ─ backoff ─ Running(2) ─ ...
//!            │               └─ exhausted ─ Failed(action|timeout)
//!            └─ action ok ─ verify ─┬─ Verified ─ Succeeded
//!                                   └─ Unverified ─ Failed(verification)
//! ```
//!
//! Verification failures are never retried: a wrong postcondition after a
//! successful action points at the step definition, not at flakiness.

use crate::command_runner::run_command;
use crate::error::Result;
use crate::registry::Step;
use crate::state_store::{StateStore, Transition};
use crate::types::FailureKind;
use crate::verifier::{Verification, Verifier};
use std::time::Duration;
use tracing::{error, info, warn};

/// Default pause between attempts of a failing action
pub const DEFAULT_BACKOFF: Duration = Duration::from_secs(2);

/// Terminal outcome of running one step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Succeeded {
        attempts: u32,
    },
    Failed {
        kind: FailureKind,
        attempts: u32,
        reason: String,
    },
}

impl StepOutcome {
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Succeeded { attempts } | Self::Failed { attempts, .. } => *attempts,
        }
    }
}

/// Runs steps for one host, recording transitions through the state store.
#[derive(Debug, Clone, Copy)]
pub struct Executor<'a> {
    store: &'a StateStore,
    host: &'a str,
    verifier: Verifier,
    backoff: Duration,
}

impl<'a> Executor<'a> {
    pub fn new(store: &'a StateStore, host: &'a str) -> Self {
        Self {
            store,
            host,
            verifier: Verifier::new(),
            backoff: DEFAULT_BACKOFF,
        }
    }

    /// Fixed pause between attempts
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Run `step` to a terminal outcome.
    ///
    /// # Errors
    ///
    /// Only persistence failures; step failures are an `Ok(StepOutcome::Failed)`.
    pub fn run(&self, step: &Step) -> Result<StepOutcome> {
        let max_attempts = step.retries.saturating_add(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            self.store
                .record(self.host, &step.name, Transition::Running { attempt })?;
            info!("[{}] attempt {}/{}", step.name, attempt, max_attempts);

            let what = format!("action '{}'", step.action.display_line());
            let (kind, reason) = match run_command(&step.action, step.timeout) {
                Ok(output) => match output.ensure_success(&what) {
                    Ok(()) => return self.verify(step, attempt),
                    Err(e) if output.timed_out => (FailureKind::Timeout, e.to_string()),
                    Err(e) => (FailureKind::Action, e.to_string()),
                },
                Err(e) => (FailureKind::Action, format!("{:#}", e)),
            };

            if kind.is_retryable() && attempt < max_attempts {
                warn!(
                    "[{}] attempt {}/{} failed: {}; retrying in {:?}",
                    step.name, attempt, max_attempts, reason, self.backoff
                );
                std::thread::sleep(self.backoff);
                continue;
            }

            error!("[{}] failed after {} attempt(s): {}", step.name, attempt, reason);
            return self.fail(step, kind, attempt, reason);
        }
    }

    fn verify(&self, step: &Step, attempt: u32) -> Result<StepOutcome> {
        match self.verifier.check(step) {
            Verification::Verified => {
                self.store
                    .record(self.host, &step.name, Transition::Succeeded)?;
                info!("[{}] succeeded", step.name);
                Ok(StepOutcome::Succeeded { attempts: attempt })
            }
            Verification::Unverified(reason) => {
                error!("[{}] action succeeded but verification failed: {}", step.name, reason);
                self.fail(step, FailureKind::Verification, attempt, reason)
            }
        }
    }

    fn fail(
        &self,
        step: &Step,
        kind: FailureKind,
        attempts: u32,
        reason: String,
    ) -> Result<StepOutcome> {
        self.store.record(
            self.host,
            &step.name,
            Transition::Failed {
                kind,
                reason: reason.clone(),
            },
        )?;
        Ok(StepOutcome::Failed {
            kind,
            attempts,
            reason,
        })
    }
}
