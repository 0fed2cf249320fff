//! Planner
//!
//! Decides which steps may run next, given the graph and the persisted
//! records. The planner never mutates records; the orchestrator re-reads them
//! after every batch and asks again, so a dependent is only admitted once its
//! dependencies' transitions are on disk.
//!
//! # Readiness
//!
//! A step is ready iff it is in scope, it is `Pending` (no record counts as
//! `Pending`) or `Failed` and explicitly marked retryable, and every
//! dependency is `Succeeded` or `Skipped`. Ready steps come back in
//! topological order with name tie-breaks, so re-runs are reproducible.
//!
//! # Blocking
//!
//! When nothing is ready but pending steps remain, each stuck step is
//! reported with the chain of unmet dependencies that leads to a terminal
//! failure (`E blocked by D blocked by B`).

use crate::registry::{Step, StepGraph};
use crate::state_store::StepRecord;
use crate::types::StepStatus;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;

/// Which steps a planning pass may consider.
#[derive(Debug, Clone, Default)]
pub struct PlanRequest {
    /// Restrict planning to these names; `None` means the whole graph
    pub scope: Option<BTreeSet<String>>,
    /// `Failed` steps that may be attempted again
    pub retry: BTreeSet<String>,
}

impl PlanRequest {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn in_scope(&self, name: &str) -> bool {
        self.scope.as_ref().is_none_or(|s| s.contains(name))
    }
}

/// A stuck step and the unmet-dependency chain behind it.
///
/// `path[0]` is the stuck step, the last element the terminal failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockedChain {
    pub path: Vec<String>,
}

impl BlockedChain {
    /// The step that cannot become ready
    pub fn step(&self) -> &str {
        self.path.first().map(String::as_str).unwrap_or_default()
    }

    /// The failed step at the root of the chain
    pub fn root(&self) -> &str {
        self.path.last().map(String::as_str).unwrap_or_default()
    }
}

impl fmt::Display for BlockedChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path.join(" blocked by "))
    }
}

/// Result of one planning pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Plan<'g> {
    /// Steps that may run now, in topological order
    Ready(Vec<&'g Step>),
    /// Nothing left to run in scope
    Done,
    /// Pending steps remain but none can become ready
    Blocked(Vec<BlockedChain>),
}

/// Stateless planning over a graph and a record snapshot.
#[derive(Debug, Clone, Copy, Default)]
pub struct Planner;

impl Planner {
    /// Compute the next set of ready steps.
    pub fn next<'g>(
        graph: &'g StepGraph,
        records: &BTreeMap<String, StepRecord>,
        request: &PlanRequest,
    ) -> Plan<'g> {
        let mut ready = Vec::new();
        let mut stuck = Vec::new();

        for step in graph.order() {
            if !request.in_scope(&step.name) || !is_candidate(&step.name, records, request) {
                continue;
            }
            let deps_met = step
                .depends_on
                .iter()
                .all(|dep| status_of(dep, records).satisfies_dependents());
            if deps_met {
                ready.push(step);
            } else {
                stuck.push(step);
            }
        }

        if !ready.is_empty() {
            return Plan::Ready(ready);
        }
        if stuck.is_empty() {
            return Plan::Done;
        }

        let chains = stuck
            .iter()
            .filter_map(|step| blocking_chain(graph, records, request, step))
            .collect();
        Plan::Blocked(chains)
    }

    /// Simulate a run in which every admitted step succeeds and return the
    /// waves the planner would admit, in order.
    pub fn preview(
        graph: &StepGraph,
        records: &BTreeMap<String, StepRecord>,
        request: &PlanRequest,
    ) -> (Vec<Vec<String>>, Option<Vec<BlockedChain>>) {
        let mut simulated = records.clone();
        let mut request = request.clone();
        let mut waves = Vec::new();

        loop {
            match Self::next(graph, &simulated, &request) {
                Plan::Ready(steps) => {
                    let names: Vec<String> = steps.iter().map(|s| s.name.clone()).collect();
                    for name in &names {
                        request.retry.remove(name);
                        simulated.insert(
                            name.clone(),
                            StepRecord {
                                status: StepStatus::Succeeded,
                                ..StepRecord::default()
                            },
                        );
                    }
                    waves.push(names);
                }
                Plan::Done => return (waves, None),
                Plan::Blocked(chains) => return (waves, Some(chains)),
            }
        }
    }
}

fn status_of(name: &str, records: &BTreeMap<String, StepRecord>) -> StepStatus {
    records.get(name).map(|r| r.status).unwrap_or_default()
}

/// Pending, or failed and explicitly retryable
fn is_candidate(name: &str, records: &BTreeMap<String, StepRecord>, request: &PlanRequest) -> bool {
    match status_of(name, records) {
        StepStatus::Pending => true,
        StepStatus::Failed => request.retry.contains(name),
        StepStatus::Running | StepStatus::Succeeded | StepStatus::Skipped => false,
    }
}

/// Breadth-first walk over unmet dependencies from `step` to the nearest
/// step that will not complete on its own (failed and not retryable, or
/// otherwise non-candidate). Returns the shortest such chain.
fn blocking_chain(
    graph: &StepGraph,
    records: &BTreeMap<String, StepRecord>,
    request: &PlanRequest,
    step: &Step,
) -> Option<BlockedChain> {
    let mut parent: BTreeMap<&str, &str> = BTreeMap::new();
    let mut queue: VecDeque<&str> = VecDeque::from([step.name.as_str()]);
    let mut fallback: Option<&str> = None;

    while let Some(current) = queue.pop_front() {
        let Ok(node) = graph.lookup(current) else {
            continue;
        };
        for dep in &node.depends_on {
            let dep = dep.as_str();
            if status_of(dep, records).satisfies_dependents() || parent.contains_key(dep) {
                continue;
            }
            parent.insert(dep, current);
            let pending_in_scope = request.in_scope(dep) && is_candidate(dep, records, request);
            if !pending_in_scope {
                if status_of(dep, records) == StepStatus::Failed {
                    return Some(build_chain(&parent, step.name.as_str(), dep));
                }
                fallback.get_or_insert(dep);
                continue;
            }
            queue.push_back(dep);
        }
    }

    fallback.map(|end| build_chain(&parent, step.name.as_str(), end))
}

fn build_chain(parent: &BTreeMap<&str, &str>, start: &str, end: &str) -> BlockedChain {
    let mut path = vec![end.to_string()];
    let mut cursor = end;
    while cursor != start {
        match parent.get(cursor) {
            Some(prev) => {
                path.push(prev.to_string());
                cursor = prev;
            }
            None => break,
        }
    }
    path.reverse();
    BlockedChain { path }
}
