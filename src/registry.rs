//! Step Registry
//!
//! Holds the catalog of named steps and the dependency graph between them.
//! Loading validates the graph once; after that a [`StepGraph`] is immutable
//! for the lifetime of a session.
//!
//! # Validation
//!
//! - Names are non-empty and unique
//! - Every dependency resolves to a known step (dangling references fail fast)
//! - No cycles: depth-first traversal with three-colour marking, a back edge to
//!   a node still on the stack is a cycle and its path is reported

use crate::error::{GraphError, HomeboxError, Result};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use std::time::Duration;

/// An external command: program, arguments, working directory, environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    /// Exit codes that count as success (defaults to `[0]`)
    pub success_codes: Vec<i32>,
    /// Written to the command's stdin; stdin is closed when `None`
    pub stdin: Option<String>,
}

impl CommandSpec {
    /// Command with no arguments that succeeds on exit code 0
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: BTreeMap::new(),
            success_codes: vec![0],
            stdin: None,
        }
    }

    /// Shorthand for `sh -c <script>`
    pub fn shell(script: impl Into<String>) -> Self {
        Self::new("sh").arg("-c").arg(script)
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn success_codes(mut self, codes: Vec<i32>) -> Self {
        self.success_codes = codes;
        self
    }

    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    /// Returns true if `code` is one of the accepted exit codes
    pub fn accepts(&self, code: i32) -> bool {
        self.success_codes.contains(&code)
    }

    /// One-line rendering for logs
    pub fn display_line(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }
}

/// One named, idempotent unit of setup work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub name: String,
    /// Steps that must be `Succeeded` or `Skipped` first, in declared order
    pub depends_on: Vec<String>,
    pub action: CommandSpec,
    /// Secondary postcondition check; when present only its result counts
    pub verify: Option<CommandSpec>,
    pub timeout: Duration,
    /// Extra attempts after the first failed one
    pub retries: u32,
    /// Host roles required for the step to apply (empty = every host)
    pub roles: BTreeSet<String>,
}

impl Step {
    /// Default timeout for steps built in code
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(600);

    pub fn new(name: impl Into<String>, action: CommandSpec) -> Self {
        Self {
            name: name.into(),
            depends_on: Vec::new(),
            action,
            verify: None,
            timeout: Self::DEFAULT_TIMEOUT,
            retries: 0,
            roles: BTreeSet::new(),
        }
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on.extend(deps.into_iter().map(Into::into));
        self
    }

    pub fn verify(mut self, check: CommandSpec) -> Self {
        self.verify = Some(check);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.roles.extend(roles.into_iter().map(Into::into));
        self
    }

    /// Returns true if a host with `host_roles` should run this step
    pub fn applies_to(&self, host_roles: &BTreeSet<String>) -> bool {
        self.roles.is_subset(host_roles)
    }
}

/// The dependency-validated collection of steps for a session.
#[derive(Debug, Clone)]
pub struct StepGraph {
    steps: BTreeMap<String, Step>,
    /// Direct dependents of each step, sorted by name
    dependents: BTreeMap<String, Vec<String>>,
    /// Topological order, ties broken by step name
    order: Vec<String>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    White,
    Grey,
    Black,
}

impl StepGraph {
    /// Validate `steps` and build the graph.
    ///
    /// # Errors
    ///
    /// `InvalidGraph` on an empty or duplicate name, a dangling dependency,
    /// or a cycle.
    pub fn load(steps: impl IntoIterator<Item = Step>) -> Result<Self> {
        let mut by_name = BTreeMap::new();
        for (index, step) in steps.into_iter().enumerate() {
            if step.name.trim().is_empty() {
                return Err(GraphError::EmptyName { index }.into());
            }
            if by_name.contains_key(&step.name) {
                return Err(GraphError::DuplicateStep { name: step.name }.into());
            }
            by_name.insert(step.name.clone(), step);
        }

        for step in by_name.values() {
            for dep in &step.depends_on {
                if !by_name.contains_key(dep) {
                    return Err(GraphError::DanglingDependency {
                        step: step.name.clone(),
                        dependency: dep.clone(),
                    }
                    .into());
                }
            }
        }

        if let Some(path) = find_cycle(&by_name) {
            return Err(GraphError::Cycle { path }.into());
        }

        let mut dependents: BTreeMap<String, Vec<String>> =
            by_name.keys().map(|k| (k.clone(), Vec::new())).collect();
        for step in by_name.values() {
            for dep in &step.depends_on {
                if let Some(list) = dependents.get_mut(dep) {
                    if !list.contains(&step.name) {
                        list.push(step.name.clone());
                    }
                }
            }
        }
        for list in dependents.values_mut() {
            list.sort();
        }

        let order = topological_order(&by_name, &dependents);
        tracing::debug!("Loaded step graph with {} steps", order.len());

        Ok(Self {
            steps: by_name,
            dependents,
            order,
        })
    }

    /// Look up a step by name
    pub fn lookup(&self, name: &str) -> Result<&Step> {
        self.steps
            .get(name)
            .ok_or_else(|| HomeboxError::unknown_step(name))
    }

    /// Steps in topological order, ties broken by name
    pub fn order(&self) -> impl Iterator<Item = &Step> {
        self.order.iter().filter_map(|name| self.steps.get(name))
    }

    /// Names in topological order
    pub fn names(&self) -> &[String] {
        &self.order
    }

    /// Direct dependents of `name`, sorted by name
    pub fn dependents(&self, name: &str) -> &[String] {
        self.dependents.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// The named steps plus all their transitive dependencies.
    ///
    /// # Errors
    ///
    /// `UnknownStep` for the first name not in the graph.
    pub fn closure<S: AsRef<str>>(&self, names: &[S]) -> Result<BTreeSet<String>> {
        let mut out = BTreeSet::new();
        let mut stack: Vec<&str> = Vec::new();
        for name in names {
            let step = self.lookup(name.as_ref())?;
            stack.push(&step.name);
        }
        while let Some(name) = stack.pop() {
            if !out.insert(name.to_string()) {
                continue;
            }
            if let Some(step) = self.steps.get(name) {
                stack.extend(step.depends_on.iter().map(String::as_str));
            }
        }
        Ok(out)
    }
}

/// Depth-first search with white/grey/black marking. Returns the first cycle
/// found as a closed path (`a -> b -> a`).
fn find_cycle(steps: &BTreeMap<String, Step>) -> Option<Vec<String>> {
    let mut marks: HashMap<&str, Mark> = steps.keys().map(|k| (k.as_str(), Mark::White)).collect();
    let mut stack: Vec<&str> = Vec::new();

    for name in steps.keys() {
        if marks.get(name.as_str()) == Some(&Mark::White) {
            if let Some(cycle) = visit(name, steps, &mut marks, &mut stack) {
                return Some(cycle);
            }
        }
    }
    None
}

fn visit<'a>(
    name: &'a str,
    steps: &'a BTreeMap<String, Step>,
    marks: &mut HashMap<&'a str, Mark>,
    stack: &mut Vec<&'a str>,
) -> Option<Vec<String>> {
    marks.insert(name, Mark::Grey);
    stack.push(name);

    if let Some(step) = steps.get(name) {
        for dep in &step.depends_on {
            match marks.get(dep.as_str()).copied().unwrap_or(Mark::Black) {
                Mark::Grey => {
                    // Back edge: the cycle is the stack suffix starting at `dep`
                    let start = stack.iter().position(|n| *n == dep.as_str()).unwrap_or(0);
                    let mut path: Vec<String> =
                        stack[start..].iter().map(|s| s.to_string()).collect();
                    path.push(dep.clone());
                    return Some(path);
                }
                Mark::White => {
                    if let Some(cycle) = visit(dep, steps, marks, stack) {
                        return Some(cycle);
                    }
                }
                Mark::Black => {}
            }
        }
    }

    stack.pop();
    marks.insert(name, Mark::Black);
    None
}

/// Kahn's algorithm with a name-ordered frontier so the result is reproducible.
fn topological_order(
    steps: &BTreeMap<String, Step>,
    dependents: &BTreeMap<String, Vec<String>>,
) -> Vec<String> {
    let mut in_degree: BTreeMap<&str, usize> = steps
        .values()
        .map(|s| {
            let unique: BTreeSet<&String> = s.depends_on.iter().collect();
            (s.name.as_str(), unique.len())
        })
        .collect();
    let mut frontier: BTreeSet<&str> = in_degree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(n, _)| *n)
        .collect();

    let mut order = Vec::with_capacity(steps.len());
    while let Some(name) = frontier.pop_first() {
        order.push(name.to_string());
        for child in dependents.get(name).into_iter().flatten() {
            if let Some(d) = in_degree.get_mut(child.as_str()) {
                *d -= 1;
                if *d == 0 {
                    frontier.insert(child.as_str());
                }
            }
        }
    }
    order
}
