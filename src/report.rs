//! Human-readable rendering of sessions, previews and status tables.
//!
//! Everything returns a `String`; the binary decides where it goes.

use crate::executor::StepOutcome;
use crate::orchestrator::{Preview, SessionOutcome, SessionReport, StatusRow};
use crate::planner::BlockedChain;
use crate::registry::StepGraph;
use crate::types::StepStatus;
use chrono::{DateTime, Local, Utc};
use nix::sys::signal::Signal;
use std::fmt::Write;

fn timestamp(at: Option<DateTime<Utc>>) -> String {
    at.map(|t| t.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string())
}

fn push_chains(out: &mut String, chains: &[BlockedChain]) {
    for chain in chains {
        let _ = writeln!(out, "  {}", chain);
    }
}

/// Per-step table for `status`
pub fn render_status(host: &str, rows: &[StatusRow]) -> String {
    let width = rows.iter().map(|r| r.step.len()).max().unwrap_or(0);
    let mut out = String::new();
    let _ = writeln!(out, "Host: {}", host);

    for row in rows {
        let Some(record) = &row.record else {
            let _ = writeln!(
                out,
                "{} {:<width$}  {}",
                StepStatus::Pending.marker(),
                row.step,
                StepStatus::Pending
            );
            continue;
        };

        let mut line = format!(
            "{} {:<width$}  {:<9}  attempts {}  started {}  finished {}",
            record.status.marker(),
            row.step,
            record.status.to_string(),
            record.attempts,
            timestamp(record.started_at),
            timestamp(record.finished_at)
        );
        if !row.in_graph {
            line.push_str("  (orphaned: not in steps file)");
        }
        let _ = writeln!(out, "{}", line);
        if let Some(reason) = &record.last_error {
            let _ = writeln!(out, "    {}", reason);
        }
    }
    out
}

/// End-of-session summary
pub fn render_session(report: &SessionReport) -> String {
    let mut out = String::new();
    for (name, outcome) in &report.executed {
        match outcome {
            StepOutcome::Succeeded { attempts } => {
                let _ = writeln!(out, "✓ {} ({} attempt(s))", name, attempts);
            }
            StepOutcome::Failed { kind, attempts, .. } => {
                let _ = writeln!(out, "✗ {} ({} after {} attempt(s))", name, kind, attempts);
            }
        }
    }

    if !report.failures.is_empty() {
        let _ = writeln!(out, "\nFailed steps:");
        for failure in &report.failures {
            let _ = writeln!(
                out,
                "  {} (attempts: {}): {}",
                failure.step, failure.attempts, failure.reason
            );
        }
    }

    match &report.outcome {
        SessionOutcome::Completed if report.failures.is_empty() => {
            let _ = writeln!(out, "\n✓ Host {}: all steps complete", report.host);
        }
        SessionOutcome::Completed => {
            let _ = writeln!(
                out,
                "\n✗ Host {}: finished with {} failed step(s)",
                report.host,
                report.failures.len()
            );
        }
        SessionOutcome::Blocked(chains) => {
            let _ = writeln!(out, "\n✗ Host {}: blocked", report.host);
            push_chains(&mut out, chains);
            let _ = writeln!(
                out,
                "Fix the failed step(s), then run again (add --retry-failed to attempt them)."
            );
        }
        SessionOutcome::Aborted { signal } => {
            let name = Signal::try_from(*signal).map(Signal::as_str).unwrap_or("signal");
            let _ = writeln!(
                out,
                "\n✗ Host {}: aborted by {}; the next run resumes from here",
                report.host, name
            );
        }
    }
    out
}

/// Planned batches for `run --dry-run`
pub fn render_preview(preview: &Preview) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Host: {} (dry run)", preview.host);
    for name in &preview.skipped {
        let _ = writeln!(out, "- {} would be skipped", name);
    }
    if preview.waves.is_empty() {
        let _ = writeln!(out, "Nothing to run");
    }
    for (i, wave) in preview.waves.iter().enumerate() {
        let _ = writeln!(out, "Batch {}: {}", i + 1, wave.join(", "));
    }
    if let Some(chains) = &preview.blocked {
        let _ = writeln!(out, "Would then be blocked:");
        push_chains(&mut out, chains);
    }
    out
}

/// Topological order for `validate`
pub fn render_order(graph: &StepGraph) -> String {
    let mut out = String::new();
    for (i, step) in graph.order().enumerate() {
        if step.depends_on.is_empty() {
            let _ = writeln!(out, "{:>3}. {}", i + 1, step.name);
        } else {
            let _ = writeln!(
                out,
                "{:>3}. {} (after {})",
                i + 1,
                step.name,
                step.depends_on.join(", ")
            );
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::FailureSummary;
    use crate::registry::{CommandSpec, Step};
    use crate::state_store::StepRecord;
    use crate::types::FailureKind;
    use std::collections::BTreeMap;

    #[test]
    fn test_status_marks_orphans_and_reasons() {
        let started = Utc::now();
        let rows = vec![
            StatusRow {
                step: "a".to_string(),
                record: Some(StepRecord {
                    status: StepStatus::Failed,
                    attempts: 3,
                    started_at: Some(started),
                    last_error: Some("action 'false' failed (exit code 1)".to_string()),
                    failure: Some(FailureKind::Action),
                    ..StepRecord::default()
                }),
                in_graph: true,
            },
            StatusRow {
                step: "b".to_string(),
                record: None,
                in_graph: true,
            },
            StatusRow {
                step: "old".to_string(),
                record: Some(StepRecord::default()),
                in_graph: false,
            },
        ];
        let text = render_status("vimes", &rows);
        assert!(text.starts_with("Host: vimes\n"));
        assert!(text.contains("✗ a    failed"));
        let expected = format!("attempts 3  started {}  finished -", timestamp(Some(started)));
        assert!(text.contains(&expected), "{text}");
        assert!(text.contains("    action 'false' failed (exit code 1)"));
        assert!(text.contains("· b    pending"));
        assert!(text.contains("orphaned"));
    }

    #[test]
    fn test_session_blocked_lists_chains() {
        let report = SessionReport {
            host: "vimes".to_string(),
            outcome: SessionOutcome::Blocked(vec![BlockedChain {
                path: vec!["e".into(), "d".into(), "b".into()],
            }]),
            executed: vec![(
                "b".to_string(),
                StepOutcome::Failed {
                    kind: FailureKind::Verification,
                    attempts: 1,
                    reason: "bad symlink".to_string(),
                },
            )],
            failures: vec![FailureSummary {
                step: "b".to_string(),
                attempts: 1,
                reason: "bad symlink".to_string(),
            }],
            records: BTreeMap::new(),
        };
        let text = render_session(&report);
        assert!(text.contains("✗ b (verification after 1 attempt(s))"));
        assert!(text.contains("b (attempts: 1): bad symlink"));
        assert!(text.contains("e blocked by d blocked by b"));
    }

    #[test]
    fn test_session_aborted_names_signal() {
        let report = SessionReport {
            host: "vimes".to_string(),
            outcome: SessionOutcome::Aborted { signal: 15 },
            executed: Vec::new(),
            failures: Vec::new(),
            records: BTreeMap::new(),
        };
        let text = render_session(&report);
        assert!(text.contains("Host vimes: aborted by SIGTERM"), "{text}");
    }

    #[test]
    fn test_preview_batches() {
        let preview = Preview {
            host: "h".to_string(),
            skipped: vec!["gpu".to_string()],
            waves: vec![vec!["a".to_string(), "b".to_string()], vec!["c".to_string()]],
            blocked: None,
        };
        let text = render_preview(&preview);
        assert!(text.contains("- gpu would be skipped"));
        assert!(text.contains("Batch 1: a, b\nBatch 2: c\n"));
    }

    #[test]
    fn test_order_lists_dependencies() {
        let graph = StepGraph::load(vec![
            Step::new("b", CommandSpec::new("true")).depends_on(["a"]),
            Step::new("a", CommandSpec::new("true")),
        ])
        .unwrap();
        assert_eq!(render_order(&graph), "  1. a\n  2. b (after a)\n");
    }
}
