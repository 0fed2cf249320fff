//! Session driver.
//!
//! One session brings one host as far forward as its records allow:
//!
//! 1. load the host's records (interrupted `Running` steps become `Failed`)
//! 2. bookkeeping: `Pending` records for unseen steps, role gating, retry set
//! 3. loop: plan, run the ready batch on the worker pool, re-read, repeat
//!
//! The loop ends when the Planner reports `Done` or `Blocked`, or when the
//! abort flag is raised. Steps of one batch run concurrently on at most
//! `jobs` scoped threads pulling from a shared queue; the next batch is only
//! planned after every worker has returned.

use crate::error::{EXIT_BLOCKED, EXIT_OK, HomeboxError, Result};
use crate::executor::{DEFAULT_BACKOFF, Executor, StepOutcome};
use crate::planner::{BlockedChain, Plan, PlanRequest, Planner};
use crate::process_guard::AbortFlag;
use crate::registry::{Step, StepGraph};
use crate::state_store::{StateStore, StepRecord, Transition};
use crate::types::StepStatus;
use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, mpsc};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Default size of the worker pool
pub const DEFAULT_JOBS: usize = 4;

/// Knobs for one session
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Restrict the session to these steps and their dependencies
    pub only: Vec<String>,
    /// Treat every failed step in scope as retryable
    pub retry_failed: bool,
    /// Maximum number of steps running at once
    pub jobs: usize,
    /// Pause between attempts of a failing action
    pub backoff: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            only: Vec::new(),
            retry_failed: false,
            jobs: DEFAULT_JOBS,
            backoff: DEFAULT_BACKOFF,
        }
    }
}

/// How a session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    /// Nothing left to run in scope
    Completed,
    /// Pending steps wait on failures that need a human
    Blocked(Vec<BlockedChain>),
    /// Stopped admitting steps after `signal`
    Aborted { signal: i32 },
}

/// A step that ended the session `Failed`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureSummary {
    pub step: String,
    pub attempts: u32,
    pub reason: String,
}

/// Everything a session did, for reporting and exit codes
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub host: String,
    pub outcome: SessionOutcome,
    /// Steps run this session, in completion order
    pub executed: Vec<(String, StepOutcome)>,
    /// In-scope steps whose record is `Failed` at the end
    pub failures: Vec<FailureSummary>,
    pub records: BTreeMap<String, StepRecord>,
}

impl SessionReport {
    pub fn exit_code(&self) -> i32 {
        match self.outcome {
            SessionOutcome::Aborted { signal } => 128 + signal,
            SessionOutcome::Blocked(_) => EXIT_BLOCKED,
            SessionOutcome::Completed if !self.failures.is_empty() => EXIT_BLOCKED,
            SessionOutcome::Completed => EXIT_OK,
        }
    }
}

/// What `run --dry-run` would do
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Preview {
    pub host: String,
    /// Steps that would be recorded `Skipped` for lacking roles
    pub skipped: Vec<String>,
    /// Batches in admission order
    pub waves: Vec<Vec<String>>,
    pub blocked: Option<Vec<BlockedChain>>,
}

/// One line of `status`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusRow {
    pub step: String,
    pub record: Option<StepRecord>,
    /// False for records of steps no longer in the graph
    pub in_graph: bool,
}

/// Session-start bookkeeping, computed before anything is written
#[derive(Debug, Default)]
struct Bookkeeping {
    transitions: Vec<(String, Transition)>,
    request: PlanRequest,
}

/// Owns the step graph and the state store for the lifetime of the process.
#[derive(Debug)]
pub struct Orchestrator {
    graph: StepGraph,
    store: StateStore,
    abort: AbortFlag,
}

impl Orchestrator {
    pub fn new(graph: StepGraph, store: StateStore, abort: AbortFlag) -> Self {
        Self { graph, store, abort }
    }

    pub fn graph(&self) -> &StepGraph {
        &self.graph
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Run one session for `host` whose declared roles are `roles`.
    ///
    /// # Errors
    ///
    /// `UnknownStep` for a bad `--only` name, store failures. Step failures
    /// and blocked chains are part of the report, not errors.
    pub fn run_session(
        &self,
        host: &str,
        roles: &BTreeSet<String>,
        options: &SessionOptions,
    ) -> Result<SessionReport> {
        let scope = self.scope(options)?;
        let records = self.store.load(host)?;

        let Bookkeeping {
            transitions,
            mut request,
        } = self.bookkeeping(&records, roles, scope, options.retry_failed);
        for (name, transition) in transitions {
            debug!("{}: session start {:?}", name, transition);
            self.store.record(host, &name, transition)?;
        }
        if !request.retry.is_empty() {
            info!(
                "Retrying failed step(s): {}",
                request.retry.iter().cloned().collect::<Vec<_>>().join(", ")
            );
        }

        let mut executed = Vec::new();
        let outcome = loop {
            if let Some(signal) = self.abort.signal() {
                warn!("Session aborted; not admitting further steps");
                break SessionOutcome::Aborted { signal };
            }
            let records = self.store.records(host)?;
            match Planner::next(&self.graph, &records, &request) {
                Plan::Ready(steps) => {
                    info!(
                        "Running {} step(s): {}",
                        steps.len(),
                        steps.iter().map(|s| s.name.as_str()).collect::<Vec<_>>().join(", ")
                    );
                    for (name, outcome) in self.run_batch(host, &steps, options)? {
                        request.retry.remove(&name);
                        executed.push((name, outcome));
                    }
                }
                Plan::Done => break SessionOutcome::Completed,
                Plan::Blocked(chains) => {
                    for chain in &chains {
                        warn!("{}", chain);
                    }
                    break SessionOutcome::Blocked(chains);
                }
            }
        };

        let records = self.store.records(host)?;
        let failures = self
            .graph
            .order()
            .filter(|step| request.in_scope(&step.name))
            .filter_map(|step| {
                let record = records.get(&step.name)?;
                (record.status == StepStatus::Failed).then(|| FailureSummary {
                    step: step.name.clone(),
                    attempts: record.attempts,
                    reason: record.last_error.clone().unwrap_or_default(),
                })
            })
            .collect();

        Ok(SessionReport {
            host: host.to_string(),
            outcome,
            executed,
            failures,
            records,
        })
    }

    /// Plan a session for `host` without running or recording anything
    pub fn preview(
        &self,
        host: &str,
        roles: &BTreeSet<String>,
        options: &SessionOptions,
    ) -> Result<Preview> {
        let scope = self.scope(options)?;
        let mut records = self.store.peek(host)?;

        let Bookkeeping {
            transitions,
            request,
        } = self.bookkeeping(&records, roles, scope, options.retry_failed);
        let now = Utc::now();
        let mut skipped = Vec::new();
        for (name, transition) in &transitions {
            if matches!(transition, Transition::Skipped { .. }) {
                skipped.push(name.clone());
            }
            transition.apply(records.entry(name.clone()).or_default(), now);
        }

        let (waves, blocked) = Planner::preview(&self.graph, &records, &request);
        Ok(Preview {
            host: host.to_string(),
            skipped,
            waves,
            blocked,
        })
    }

    /// Every step in graph order plus orphaned records
    pub fn status(&self, host: &str) -> Result<Vec<StatusRow>> {
        let mut records = self.store.records(host)?;
        let mut rows: Vec<StatusRow> = self
            .graph
            .order()
            .map(|step| StatusRow {
                step: step.name.clone(),
                record: records.remove(&step.name),
                in_graph: true,
            })
            .collect();
        rows.extend(records.into_iter().map(|(step, record)| StatusRow {
            step,
            record: Some(record),
            in_graph: false,
        }));
        Ok(rows)
    }

    /// Return the named records to `Pending`.
    ///
    /// All names are checked before anything is written.
    pub fn reset<S: AsRef<str>>(&self, host: &str, steps: &[S]) -> Result<()> {
        for name in steps {
            self.graph.lookup(name.as_ref())?;
        }
        for name in steps {
            self.store.reset(host, name.as_ref())?;
        }
        Ok(())
    }

    fn scope(&self, options: &SessionOptions) -> Result<Option<BTreeSet<String>>> {
        if options.only.is_empty() {
            return Ok(None);
        }
        self.graph.closure(&options.only).map(Some)
    }

    fn bookkeeping(
        &self,
        records: &BTreeMap<String, StepRecord>,
        roles: &BTreeSet<String>,
        scope: Option<BTreeSet<String>>,
        retry_failed: bool,
    ) -> Bookkeeping {
        let mut book = Bookkeeping {
            transitions: Vec::new(),
            request: PlanRequest {
                scope,
                retry: BTreeSet::new(),
            },
        };

        for step in self.graph.order() {
            if !book.request.in_scope(&step.name) {
                continue;
            }
            let record = records.get(&step.name);
            let status = record.map(|r| r.status);

            if !step.applies_to(roles) {
                if matches!(status, None | Some(StepStatus::Pending | StepStatus::Failed)) {
                    book.transitions.push((
                        step.name.clone(),
                        Transition::Skipped {
                            reason: missing_roles(step, roles),
                        },
                    ));
                }
                continue;
            }

            match record {
                None => book.transitions.push((step.name.clone(), Transition::Pending)),
                Some(r) if r.status == StepStatus::Skipped => {
                    book.transitions.push((step.name.clone(), Transition::Pending));
                }
                Some(r)
                    if r.status == StepStatus::Failed && (retry_failed || r.was_interrupted()) =>
                {
                    book.request.retry.insert(step.name.clone());
                }
                Some(_) => {}
            }
        }
        book
    }

    fn run_batch(
        &self,
        host: &str,
        steps: &[&Step],
        options: &SessionOptions,
    ) -> Result<Vec<(String, StepOutcome)>> {
        let executor = Executor::new(&self.store, host).with_backoff(options.backoff);
        let workers = options.jobs.max(1).min(steps.len());
        let queue = Mutex::new(steps.iter().copied().collect::<VecDeque<&Step>>());
        let halt = AtomicBool::new(false);
        let (tx, rx) = mpsc::channel();

        std::thread::scope(|scope| {
            for worker in 0..workers {
                let tx = tx.clone();
                let queue = &queue;
                let halt = &halt;
                let abort = &self.abort;
                scope.spawn(move || {
                    loop {
                        if abort.is_aborted() || halt.load(Ordering::SeqCst) {
                            break;
                        }
                        let next = match queue.lock() {
                            Ok(mut queue) => queue.pop_front(),
                            Err(_) => None,
                        };
                        let Some(step) = next else {
                            break;
                        };
                        debug!("worker {} picked {}", worker, step.name);
                        let result = executor.run(step);
                        if result.is_err() {
                            halt.store(true, Ordering::SeqCst);
                        }
                        if tx.send((step.name.clone(), result)).is_err() {
                            break;
                        }
                    }
                });
            }
        });
        drop(tx);

        let mut finished = Vec::with_capacity(steps.len());
        let mut fatal: Option<HomeboxError> = None;
        for (name, result) in rx {
            match result {
                Ok(outcome) => finished.push((name, outcome)),
                Err(e) => {
                    error!("{}: state store failure: {}", name, e);
                    fatal.get_or_insert(e);
                }
            }
        }
        match fatal {
            Some(e) => Err(e),
            None => Ok(finished),
        }
    }
}

fn missing_roles(step: &Step, roles: &BTreeSet<String>) -> String {
    let missing: Vec<&str> = step
        .roles
        .difference(roles)
        .map(String::as_str)
        .collect();
    format!("host lacks role(s): {}", missing.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::CommandSpec;
    use tempfile::TempDir;

    fn orchestrator(steps: Vec<Step>) -> (TempDir, Orchestrator) {
        let dir = TempDir::new().unwrap();
        let graph = StepGraph::load(steps).unwrap();
        let store = StateStore::open(dir.path().join("state")).unwrap();
        (dir, Orchestrator::new(graph, store, AbortFlag::new()))
    }

    fn quick() -> SessionOptions {
        SessionOptions {
            backoff: Duration::from_millis(10),
            ..SessionOptions::default()
        }
    }

    fn ok(name: &str) -> Step {
        Step::new(name, CommandSpec::new("true"))
    }

    #[test]
    fn test_linear_chain_completes() {
        let (_dir, orch) = orchestrator(vec![
            ok("a"),
            ok("b").depends_on(["a"]),
            ok("c").depends_on(["b"]),
        ]);
        let report = orch.run_session("h", &BTreeSet::new(), &quick()).unwrap();
        assert_eq!(report.outcome, SessionOutcome::Completed);
        assert_eq!(report.exit_code(), EXIT_OK);
        let order: Vec<&str> = report.executed.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_failed_leaf_exits_one_without_blocking() {
        let (_dir, orch) = orchestrator(vec![ok("a"), Step::new("b", CommandSpec::new("false"))]);
        let report = orch.run_session("h", &BTreeSet::new(), &quick()).unwrap();
        assert_eq!(report.outcome, SessionOutcome::Completed);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].step, "b");
        assert_eq!(report.failures[0].attempts, 1);
        assert_eq!(report.exit_code(), EXIT_BLOCKED);
    }

    #[test]
    fn test_roles_gate_to_skipped_and_back() {
        let (_dir, orch) = orchestrator(vec![
            ok("base"),
            ok("gpu-driver").roles(["nvidia"]),
            ok("desktop").depends_on(["gpu-driver"]),
        ]);
        let report = orch.run_session("h", &BTreeSet::new(), &quick()).unwrap();
        assert_eq!(report.outcome, SessionOutcome::Completed);
        assert_eq!(report.records["gpu-driver"].status, StepStatus::Skipped);
        assert!(report.records["gpu-driver"]
            .last_error
            .as_deref()
            .unwrap()
            .contains("nvidia"));
        assert_eq!(report.records["desktop"].status, StepStatus::Succeeded);

        let roles: BTreeSet<String> = ["nvidia".to_string()].into();
        let report = orch.run_session("h", &roles, &quick()).unwrap();
        let ran: Vec<&str> = report.executed.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(ran, vec!["gpu-driver"]);
        assert_eq!(report.records["gpu-driver"].status, StepStatus::Succeeded);
    }

    #[test]
    fn test_only_restricts_to_closure() {
        let (_dir, orch) = orchestrator(vec![ok("a"), ok("b").depends_on(["a"]), ok("c")]);
        let options = SessionOptions {
            only: vec!["b".to_string()],
            ..quick()
        };
        let report = orch.run_session("h", &BTreeSet::new(), &options).unwrap();
        let mut ran: Vec<&str> = report.executed.iter().map(|(n, _)| n.as_str()).collect();
        ran.sort();
        assert_eq!(ran, vec!["a", "b"]);
        assert!(!report.records.contains_key("c"));
    }

    #[test]
    fn test_only_unknown_step_is_rejected() {
        let (_dir, orch) = orchestrator(vec![ok("a")]);
        let options = SessionOptions {
            only: vec!["nope".to_string()],
            ..quick()
        };
        let err = orch.run_session("h", &BTreeSet::new(), &options).unwrap_err();
        assert!(matches!(err, HomeboxError::UnknownStep(ref n) if n == "nope"));
    }

    #[test]
    fn test_aborted_before_start_runs_nothing() {
        let (_dir, orch) = orchestrator(vec![ok("a")]);
        orch.abort.abort();
        let report = orch.run_session("h", &BTreeSet::new(), &quick()).unwrap();
        assert_eq!(report.outcome, SessionOutcome::Aborted { signal: 2 });
        assert_eq!(report.exit_code(), 130);
        assert!(report.executed.is_empty());
        assert_eq!(report.records["a"].status, StepStatus::Pending);
    }

    #[test]
    fn test_abort_mid_batch_finishes_running_step_only() {
        let dir = TempDir::new().unwrap();
        let marker = dir.path().join("a.started");
        let slow = Step::new(
            "a",
            CommandSpec::shell(format!("touch {}; sleep 0.5", marker.display())),
        );
        let graph = StepGraph::load(vec![slow, ok("b")]).unwrap();
        let store = StateStore::open(dir.path().join("state")).unwrap();
        let orch = Orchestrator::new(graph, store, AbortFlag::new());

        let abort = orch.abort.clone();
        let raiser = std::thread::spawn(move || {
            let deadline = std::time::Instant::now() + Duration::from_secs(5);
            while !marker.exists() && std::time::Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(10));
            }
            abort.abort_with(nix::libc::SIGTERM);
        });

        let options = SessionOptions { jobs: 1, ..quick() };
        let report = orch.run_session("h", &BTreeSet::new(), &options).unwrap();
        raiser.join().unwrap();

        assert_eq!(report.outcome, SessionOutcome::Aborted { signal: nix::libc::SIGTERM });
        assert_eq!(report.exit_code(), 143);
        assert_eq!(report.executed.len(), 1);
        assert_eq!(report.records["a"].status, StepStatus::Succeeded);
        assert_eq!(report.records["b"].status, StepStatus::Pending);
    }

    #[test]
    fn test_preview_writes_nothing() {
        let (dir, orch) = orchestrator(vec![ok("a"), ok("b"), ok("c").depends_on(["a", "b"])]);
        let preview = orch.preview("h", &BTreeSet::new(), &quick()).unwrap();
        assert_eq!(
            preview.waves,
            vec![vec!["a".to_string(), "b".to_string()], vec!["c".to_string()]]
        );
        assert!(preview.blocked.is_none());
        assert!(!dir.path().join("state/h.json").exists());
    }

    #[test]
    fn test_status_lists_orphans_last() {
        let (_dir, orch) = orchestrator(vec![ok("a")]);
        orch.store()
            .record("h", "retired", Transition::Succeeded)
            .unwrap();
        let rows = orch.status("h").unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].step, "a");
        assert!(rows[0].record.is_none());
        assert!(rows[0].in_graph);
        assert_eq!(rows[1].step, "retired");
        assert!(!rows[1].in_graph);
    }

    #[test]
    fn test_reset_checks_every_name_first() {
        let (_dir, orch) = orchestrator(vec![ok("a")]);
        orch.run_session("h", &BTreeSet::new(), &quick()).unwrap();
        let err = orch.reset("h", &["a", "zz"]).unwrap_err();
        assert!(matches!(err, HomeboxError::UnknownStep(_)));
        assert_eq!(orch.store().records("h").unwrap()["a"].status, StepStatus::Succeeded);

        orch.reset("h", &["a"]).unwrap();
        assert_eq!(orch.store().records("h").unwrap()["a"].status, StepStatus::Pending);
    }
}
