//! Parsing and resolution of whole plan documents.

use sprintsync_core::plan::{NodeId, Violation};
use sprintsync_core::{parse, resolve};
use sprintsync_test_utils::{TWO_SPRINT_PLAN, generated_plan, generated_plan_text};

#[test]
fn fixture_plan_resolves_into_a_single_chain() {
    let plan = parse(TWO_SPRINT_PLAN).unwrap();
    let graph = resolve(&plan).unwrap();

    assert_eq!(
        graph.order(),
        &[
            NodeId::task(0, 1),
            NodeId::task(0, 2),
            NodeId::gate(0),
            NodeId::task(1, 1),
            NodeId::gate(1),
        ]
    );
    assert_eq!(plan.terminal(), Some(NodeId::gate(1)));
}

#[test]
fn generated_plans_order_every_node_after_its_dependencies() {
    let plan = generated_plan(6, 4);
    let graph = resolve(&plan).unwrap();
    assert_eq!(graph.len(), 6 * 5);

    for node in plan.nodes() {
        let at = graph.position(node.id()).unwrap();
        for dep in node.depends_on() {
            assert!(graph.position(*dep).unwrap() < at, "{dep} before {}", node.id());
        }
    }
}

#[test]
fn parsing_is_deterministic() {
    let text = generated_plan_text(3, 2);
    let a = parse(&text).unwrap();
    let b = parse(&text).unwrap();
    assert_eq!(a, b);
    assert_eq!(a.fingerprint(), b.fingerprint());
}

#[test]
fn gap_in_sprint_numbers_is_rejected() {
    let text = "# Plan\n\n## Sprint 0: A\n1. **One** - x\n\n## Sprint 2: C\n1. **Two** - y\n";
    let err = parse(text).unwrap_err();
    assert!(err.contains(&Violation::MissingSprint(1)), "{err}");
}
