//! Rendering of run summaries for the terminal.

use std::fmt::Write as _;

use anyhow::{Context, Result};

use sprintsync_core::report::{Counts, Summary};

const RULE_WIDTH: usize = 56;

fn row(out: &mut String, name: &str, counts: &Counts) {
    let _ = writeln!(
        out,
        "{:<16} {:>8} {:>8} {:>8} {:>12}",
        name, counts.created, counts.already_exists, counts.failed, counts.not_attempted
    );
}

fn header(out: &mut String, first: &str) {
    let _ = writeln!(
        out,
        "{:<16} {:>8} {:>8} {:>8} {:>12}",
        first, "CREATED", "EXISTS", "FAILED", "NOT TRIED"
    );
    let _ = writeln!(out, "{}", "-".repeat(RULE_WIDTH));
}

/// Human-readable summary table.
pub fn render_table(summary: &Summary) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Run: {}", summary.run_id);
    out.push('\n');

    header(&mut out, "KIND");
    for (kind, counts) in &summary.by_kind {
        row(&mut out, &kind.to_string(), counts);
    }
    let _ = writeln!(out, "{}", "-".repeat(RULE_WIDTH));
    row(&mut out, "total", &summary.totals);
    out.push('\n');

    header(&mut out, "SPRINT");
    if summary.shared.total() > 0 {
        row(&mut out, "shared", &summary.shared);
    }
    for (sprint, counts) in &summary.by_sprint {
        row(&mut out, &format!("sprint {sprint}"), counts);
    }

    if !summary.failures.is_empty() {
        let _ = writeln!(out, "\nFailures:");
        for failure in &summary.failures {
            let _ = writeln!(
                out,
                "  - {} ({} attempt{}): {}",
                failure.key,
                failure.attempts,
                if failure.attempts == 1 { "" } else { "s" },
                failure.reason
            );
        }
    }

    if !summary.not_attempted.is_empty() {
        let _ = writeln!(out, "\nNot attempted:");
        for key in &summary.not_attempted {
            let _ = writeln!(out, "  - {key}");
        }
    }

    let links = &summary.links;
    if links.updated + links.unchanged + links.failed > 0 {
        let _ = writeln!(
            out,
            "\nLinks: {} updated, {} unchanged, {} failed",
            links.updated, links.unchanged, links.failed
        );
        for failure in &summary.link_failures {
            let _ = writeln!(out, "  - {}: {}", failure.key, failure.reason);
        }
    }

    match &summary.aborted {
        Some(reason) => {
            let _ = writeln!(out, "\nAborted: {reason}");
        }
        None if summary.totals.failed == 0 && summary.totals.not_attempted == 0 => {
            let _ = writeln!(out, "\nAll resources in sync.");
        }
        None => {}
    }
    out
}

pub fn render_json(summary: &Summary) -> Result<String> {
    serde_json::to_string_pretty(summary).context("failed to serialize summary")
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use sprintsync_core::report::{Failure, LinkCounts};
    use sprintsync_core::sync::AbortReason;
    use sprintsync_core::tracker::{ResourceKey, ResourceKind};

    use super::*;

    fn summary() -> Summary {
        let counts = Counts {
            created: 3,
            already_exists: 1,
            failed: 1,
            not_attempted: 0,
        };
        Summary {
            run_id: "run-1".into(),
            totals: counts,
            by_kind: BTreeMap::from([(ResourceKind::Issue, counts)]),
            by_sprint: BTreeMap::from([(0, counts)]),
            shared: Counts::default(),
            failures: vec![Failure {
                key: ResourceKey::issue("[0.1] Setup"),
                reason: "tracker error: boom".into(),
                attempts: 2,
            }],
            not_attempted: vec![],
            links: LinkCounts::default(),
            link_failures: vec![],
            aborted: None,
        }
    }

    #[test]
    fn table_lists_counts_and_failures() {
        let table = render_table(&summary());
        assert!(table.contains("Run: run-1"));
        assert!(table.contains("issue"), "{table}");
        assert!(table.contains("sprint 0"), "{table}");
        assert!(table.contains("issue:[0.1] Setup (2 attempts): tracker error: boom"), "{table}");
        assert!(!table.contains("shared"));
        assert!(!table.contains("All resources in sync"));
    }

    #[test]
    fn table_reports_abort_reason() {
        let mut s = summary();
        s.aborted = Some(AbortReason::Cancelled);
        assert!(render_table(&s).contains("Aborted: cancelled"));
    }

    #[test]
    fn clean_run_says_in_sync() {
        let mut s = summary();
        s.totals.failed = 0;
        s.failures.clear();
        assert!(render_table(&s).contains("All resources in sync."));
    }

    #[test]
    fn json_is_machine_readable() {
        let json: serde_json::Value = serde_json::from_str(&render_json(&summary()).unwrap()).unwrap();
        assert_eq!(json["run_id"], "run-1");
        assert_eq!(json["totals"]["created"], 3);
        assert_eq!(json["failures"][0]["attempts"], 2);
    }
}
