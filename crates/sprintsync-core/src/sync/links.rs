//! Issue body rendering and cross-reference resolution.
//!
//! Issues are first created with plain-text references (`Task 0.1`) because
//! a dependency's issue number is not known until it exists. The finishing
//! pass re-renders each issue created in the run with `#<number>` links for
//! every referenced node the ledger knows, and updates the issue when the
//! body changed.

use std::fmt::Write as _;

use crate::plan::{NodeId, NodeRef, Plan};
use crate::tracker::RemoteId;

/// How a referenced node is rendered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reference {
    Unresolved,
    Issue(RemoteId),
}

fn node_label(plan: &Plan, id: NodeId) -> String {
    match plan.node(id) {
        Some(NodeRef::Task(_, task)) => format!("Task {}: {}", task.id, task.name),
        Some(NodeRef::Gate(sprint)) => format!("Sprint {} Gate", sprint.number),
        None => format!("Node {id}"),
    }
}

fn render_reference(plan: &Plan, id: NodeId, reference: &Reference) -> String {
    match reference {
        Reference::Unresolved => node_label(plan, id),
        Reference::Issue(number) => format!("#{number} {}", node_label(plan, id)),
    }
}

/// Render the markdown body for a task or gate issue.
pub fn render_issue_body(
    plan: &Plan,
    node: NodeRef<'_>,
    resolve: impl Fn(NodeId) -> Reference,
) -> String {
    let mut body = String::new();
    let sprint = node.sprint();

    match node {
        NodeRef::Task(_, task) => {
            if !task.description.is_empty() {
                let _ = writeln!(body, "{}\n", task.description);
            }
            section(&mut body, "Steps", task.steps.iter().enumerate(), |(i, step)| {
                format!("{}. {step}", i + 1)
            });
            section(&mut body, "Acceptance Criteria", task.acceptance_criteria.iter(), |c| {
                format!("- [ ] {c}")
            });
        }
        NodeRef::Gate(_) => {
            let _ = writeln!(
                body,
                "Completion gate for Sprint {}: {}.\n",
                sprint.number, sprint.name
            );
            section(&mut body, "Gate Requirements", sprint.gate.requirements.iter(), |r| {
                format!("- [ ] {r}")
            });
            section(
                &mut body,
                "Sprint Acceptance Criteria",
                sprint.acceptance_criteria.iter(),
                |c| format!("- [ ] {c}"),
            );
        }
    }

    section(&mut body, "Depends On", node.depends_on().iter(), |id| {
        format!("- {}", render_reference(plan, *id, &resolve(*id)))
    });
    section(&mut body, "Blocks", node.blocks().iter(), |id| {
        format!("- {}", render_reference(plan, *id, &resolve(*id)))
    });

    let _ = writeln!(body, "---");
    if let NodeRef::Task(_, task) = node {
        if let Some(agent) = &task.agent {
            let _ = writeln!(body, "Agent: `{agent}`");
        }
        if let Some(skill) = &task.skill {
            let _ = writeln!(body, "Skill: `{skill}`");
        }
    }
    let _ = write!(body, "Plan node: {}", node.id());
    body
}

fn section<I, F>(body: &mut String, title: &str, items: I, render: F)
where
    I: Iterator,
    F: Fn(I::Item) -> String,
{
    let mut items = items.peekable();
    if items.peek().is_none() {
        return;
    }
    let _ = writeln!(body, "## {title}");
    for item in items {
        let _ = writeln!(body, "{}", render(item));
    }
    body.push('\n');
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::parse;

    const PLAN: &str = "\
# Plan
## Sprint 0: Foundation
1. **Setup repo** - create the layout
   - init git
   Agent: devops
   **Acceptance Criteria:**
   - [ ] builds
2. **Add CI**
### Gate
- [ ] reviewed
";

    #[test]
    fn unresolved_body_uses_plain_references() {
        let plan = parse(PLAN).unwrap();
        let node = plan.node(NodeId::task(0, 2)).unwrap();
        let body = render_issue_body(&plan, node, |_| Reference::Unresolved);
        assert!(body.contains("## Depends On\n- Task 0.1: Setup repo\n"), "{body}");
        assert!(body.contains("## Blocks\n- Sprint 0 Gate\n"), "{body}");
        assert!(body.ends_with("Plan node: 0.2"));
    }

    #[test]
    fn resolved_body_links_issue_numbers() {
        let plan = parse(PLAN).unwrap();
        let node = plan.node(NodeId::task(0, 2)).unwrap();
        let body = render_issue_body(&plan, node, |id| {
            if id == NodeId::task(0, 1) {
                Reference::Issue(RemoteId::from("12"))
            } else {
                Reference::Unresolved
            }
        });
        assert!(body.contains("- #12 Task 0.1: Setup repo\n"), "{body}");
        assert!(body.contains("- Sprint 0 Gate\n"), "{body}");
    }

    #[test]
    fn task_body_lists_details_and_metadata() {
        let plan = parse(PLAN).unwrap();
        let node = plan.node(NodeId::task(0, 1)).unwrap();
        let body = render_issue_body(&plan, node, |_| Reference::Unresolved);
        assert!(body.starts_with("create the layout\n\n"), "{body}");
        assert!(body.contains("## Steps\n1. init git\n"), "{body}");
        assert!(body.contains("## Acceptance Criteria\n- [ ] builds\n"), "{body}");
        assert!(body.contains("Agent: `devops`"), "{body}");
        assert!(!body.contains("## Depends On"), "{body}");
    }

    #[test]
    fn gate_body_lists_requirements() {
        let plan = parse(PLAN).unwrap();
        let node = plan.node(NodeId::gate(0)).unwrap();
        let body = render_issue_body(&plan, node, |_| Reference::Unresolved);
        assert!(body.contains("## Gate Requirements\n- [ ] reviewed\n"), "{body}");
        assert!(body.contains("- Task 0.1: Setup repo\n- Task 0.2: Add CI\n"), "{body}");
        assert!(body.ends_with("Plan node: 0.G"));
    }
}
