//! `sprintsync check` command: parse and resolve a plan without touching the
//! tracker.

use std::fmt::Write as _;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;

use sprintsync_core::plan::{NodeId, ParseWarning, Sprint};
use sprintsync_core::{DependencyGraph, Plan, parse, resolve};

#[derive(Serialize)]
struct CheckOutput<'a> {
    title: &'a str,
    fingerprint: String,
    sprints: &'a [Sprint],
    order: &'a [NodeId],
    levels: Vec<Vec<NodeId>>,
    warnings: &'a [ParseWarning],
}

fn join(ids: impl IntoIterator<Item = NodeId>) -> String {
    let ids: Vec<String> = ids.into_iter().map(|id| id.to_string()).collect();
    if ids.is_empty() {
        "-".to_string()
    } else {
        ids.join(", ")
    }
}

/// Plain-text outline of a validated plan.
pub fn render_check(plan: &Plan, graph: &DependencyGraph) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Plan: {}", plan.title);
    let _ = writeln!(
        out,
        "Sprints: {}  Tasks: {}  Fingerprint: {}",
        plan.sprints.len(),
        plan.task_count(),
        &plan.fingerprint()[..12]
    );

    for sprint in &plan.sprints {
        out.push('\n');
        match &sprint.duration {
            Some(duration) => {
                let _ = writeln!(out, "Sprint {}: {} ({duration})", sprint.number, sprint.name);
            }
            None => {
                let _ = writeln!(out, "Sprint {}: {}", sprint.number, sprint.name);
            }
        }
        for task in &sprint.tasks {
            let _ = writeln!(
                out,
                "  {:<6} {:<40} depends on: {}",
                task.id.to_string(),
                task.name,
                join(task.depends_on.iter().copied())
            );
        }
        let _ = writeln!(
            out,
            "  {:<6} {:<40} depends on: {}",
            sprint.gate.id.to_string(),
            format!("Gate ({} requirements)", sprint.gate.requirements.len()),
            join(sprint.gate.depends_on.iter().copied())
        );
    }

    let order: Vec<String> = graph.order().iter().map(|id| id.to_string()).collect();
    let _ = writeln!(out, "\nOrder: {}", order.join(" -> "));

    if !plan.warnings.is_empty() {
        let _ = writeln!(out, "\nWarnings:");
        for warning in &plan.warnings {
            let _ = writeln!(out, "  - {warning}");
        }
    }
    out
}

/// Run the check command. Returns the process exit code.
pub fn run_check(path: &Path, json: bool) -> Result<i32> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read plan file {}", path.display()))?;

    let plan = match parse(&text) {
        Ok(plan) => plan,
        Err(e) => {
            eprintln!("{}: {e}", path.display());
            return Ok(1);
        }
    };
    let graph = match resolve(&plan) {
        Ok(graph) => graph,
        Err(e) => {
            eprintln!("{}: {e}", path.display());
            return Ok(1);
        }
    };
    tracing::debug!(sprints = plan.sprints.len(), nodes = graph.len(), "plan validated");

    if json {
        let output = CheckOutput {
            title: &plan.title,
            fingerprint: plan.fingerprint(),
            sprints: &plan.sprints,
            order: graph.order(),
            levels: graph.levels(),
            warnings: &plan.warnings,
        };
        println!(
            "{}",
            serde_json::to_string_pretty(&output).context("failed to serialize plan")?
        );
    } else {
        print!("{}", render_check(&plan, &graph));
    }
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PLAN: &str = "\
# Launch

## Sprint 0: Foundation (Week 1)
1. **Create repository** - layout
2. **Set up CI**

### Gate
- [ ] reviewed

## Sprint 1: Core
### Task 1.1: Engine
Build it.
";

    #[test]
    fn outline_lists_nodes_and_order() {
        let plan = parse(PLAN).unwrap();
        let graph = resolve(&plan).unwrap();
        let text = render_check(&plan, &graph);

        assert!(text.starts_with("Plan: Launch\n"), "{text}");
        assert!(text.contains("Sprints: 2  Tasks: 3"), "{text}");
        assert!(text.contains("Create repository"), "{text}");
        assert!(text.contains("Order: 0.1 -> 0.2 -> 0.G -> 1.1 -> 1.G"), "{text}");
        assert!(text.contains("Warnings:"), "{text}");
    }

    #[test]
    fn missing_file_is_an_error() {
        let err = run_check(Path::new("/nonexistent/plan.md"), false).unwrap_err();
        assert!(err.to_string().contains("failed to read plan file"));
    }

    #[test]
    fn invalid_plan_exits_with_one() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("plan.md");
        std::fs::write(&path, "# Nothing here\n").unwrap();
        assert_eq!(run_check(&path, false).unwrap(), 1);
    }

    #[test]
    fn valid_plan_exits_with_zero() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("plan.md");
        std::fs::write(&path, PLAN).unwrap();
        assert_eq!(run_check(&path, true).unwrap(), 0);
    }
}
