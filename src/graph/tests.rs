//! Tests for graph loading, validation and scheduling

use super::*;
use crate::models::{JoinPolicy, NodeStatus, Phase, WorkflowNode};

fn chain() -> WorkflowGraph {
    WorkflowGraph::new("wf", "a")
        .with_node(WorkflowNode::task("a", Phase::Analysis))
        .with_node(WorkflowNode::task("b", Phase::Plan))
        .with_node(WorkflowNode::task("c", Phase::Impl))
        .with_edge("a", "b")
        .with_edge("b", "c")
}

#[test]
fn test_validate_simple_chain() {
    let index = validate(&chain()).unwrap();
    assert_eq!(index.order, vec!["a", "b", "c"]);
    assert_eq!(index.predecessors_of("c"), ["b".to_string()]);
    assert_eq!(index.successors_of("a"), ["b".to_string()]);
}

#[test]
fn test_validate_empty_graph() {
    let graph = WorkflowGraph::new("wf", "a");
    assert_eq!(validate(&graph).unwrap_err(), GraphError::Empty);
}

#[test]
fn test_validate_duplicate_node() {
    let graph = chain().with_node(WorkflowNode::task("b", Phase::Test));
    assert_eq!(
        validate(&graph).unwrap_err(),
        GraphError::DuplicateNode("b".into())
    );
}

#[test]
fn test_validate_missing_entry() {
    let mut graph = chain();
    graph.entry = "zzz".into();
    assert_eq!(
        validate(&graph).unwrap_err(),
        GraphError::MissingEntry("zzz".into())
    );
}

#[test]
fn test_validate_entry_with_predecessor() {
    let mut graph = chain();
    graph.entry = "b".into();
    assert!(matches!(
        validate(&graph).unwrap_err(),
        GraphError::EntryHasPredecessors { count: 1, .. }
    ));
}

#[test]
fn test_validate_dangling_edge() {
    let graph = chain().with_edge("c", "ghost");
    match validate(&graph).unwrap_err() {
        GraphError::DanglingEdge { missing, .. } => assert_eq!(missing, "ghost"),
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test]
fn test_validate_task_fan_in_rejected() {
    let graph = WorkflowGraph::new("wf", "a")
        .with_node(WorkflowNode::task("a", Phase::Analysis))
        .with_node(WorkflowNode::task("b", Phase::Analysis))
        .with_node(WorkflowNode::task("c", Phase::Plan))
        .with_edge("a", "c")
        .with_edge("b", "c");
    assert!(matches!(
        validate(&graph).unwrap_err(),
        GraphError::TaskFanIn { count: 2, .. }
    ));
}

#[test]
fn test_validate_detects_cycle() {
    let graph = WorkflowGraph::new("wf", "a")
        .with_node(WorkflowNode::task("a", Phase::Analysis))
        .with_node(WorkflowNode::task("b", Phase::Plan))
        .with_node(WorkflowNode::task("c", Phase::Impl))
        .with_node(WorkflowNode::join("d", Phase::Impl))
        .with_edge("a", "d")
        .with_edge("c", "d")
        .with_edge("d", "b")
        .with_edge("b", "c");

    match validate(&graph).unwrap_err() {
        GraphError::Cycle { path } => {
            assert_eq!(path.first(), path.last());
            assert_eq!(path.len(), 4);
            assert!(path.contains(&"b".to_string()));
            assert!(path.contains(&"c".to_string()));
            assert!(path.contains(&"d".to_string()));
            // Reported in edge direction: every step is an edge of the graph
            for step in path.windows(2) {
                assert!(
                    graph
                        .edges
                        .iter()
                        .any(|e| e.from == step[0] && e.to == step[1]),
                    "{} -> {} is not an edge",
                    step[0],
                    step[1]
                );
            }
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test]
fn test_validate_self_loop() {
    let graph = chain().with_edge("c", "c");
    assert_eq!(
        validate(&graph).unwrap_err(),
        GraphError::SelfLoop("c".into())
    );
}

#[test]
fn test_topological_sort_keeps_declaration_order() {
    let graph = WorkflowGraph::new("wf", "root")
        .with_node(WorkflowNode::task("root", Phase::Analysis))
        .with_node(WorkflowNode::task("z", Phase::Impl))
        .with_node(WorkflowNode::task("y", Phase::Impl))
        .with_node(WorkflowNode::join("merge", Phase::Review))
        .with_edge("root", "z")
        .with_edge("root", "y")
        .with_edge("z", "merge")
        .with_edge("y", "merge");

    let index = validate(&graph).unwrap();
    assert_eq!(
        topological_sort(&index).unwrap(),
        vec!["root", "z", "y", "merge"]
    );

    let levels = compute_levels(&index).unwrap();
    assert_eq!(levels["root"], 0);
    assert_eq!(levels["y"], 1);
    assert_eq!(levels["merge"], 2);
}

#[test]
fn test_parse_yaml_graph_with_defaults() {
    let yaml = r#"
id: wf-1
entry: analyze
nodes:
  - id: analyze
    phase: analysis
  - id: build
    phase: impl
    label: Build it
    timeoutMs: 5000
    payload:
      prompt: "write the code"
edges:
  - from: analyze
    to: build
defaults:
  gatePolicy: never
"#;
    let graph = parse_graph(yaml).unwrap();
    assert_eq!(graph.version, "1");
    assert_eq!(graph.nodes[1].timeout_ms, Some(5000));
    assert_eq!(graph.nodes[1].payload["prompt"], "write the code");
    assert!(!graph.nodes[1].requires_gate(&graph.defaults));
    validate(&graph).unwrap();
}

#[test]
fn test_parse_json_graph() {
    let json = r#"{"id":"wf","entry":"a","nodes":[{"id":"a","phase":"plan","kind":"task"}]}"#;
    let graph = parse_graph(json).unwrap();
    assert_eq!(graph.nodes.len(), 1);
    assert!(graph.edges.is_empty());
}

#[test]
fn test_parse_invalid_graph() {
    assert!(matches!(
        parse_graph("nodes: [").unwrap_err(),
        GraphError::Parse(_)
    ));
}

#[test]
fn test_load_graph_from_file() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("graph.yaml");
    std::fs::write(
        &path,
        "id: wf\nentry: a\nnodes:\n  - id: a\n    phase: analysis\n",
    )
    .unwrap();
    let graph = load_graph(&path).unwrap();
    assert_eq!(graph.id, "wf");
}

#[test]
fn test_gate_derived_from_phase() {
    let defaults = crate::models::GraphDefaults::default();
    assert!(!WorkflowNode::task("a", Phase::Analysis).requires_gate(&defaults));
    assert!(!WorkflowNode::task("a", Phase::Plan).requires_gate(&defaults));
    assert!(WorkflowNode::task("a", Phase::Impl).requires_gate(&defaults));
    assert!(WorkflowNode::task("a", Phase::Test).requires_gate(&defaults));
    assert!(WorkflowNode::task("a", Phase::Review).requires_gate(&defaults));
    assert!(!WorkflowNode::task("a", Phase::Review)
        .with_gate(false)
        .requires_gate(&defaults));
}

fn preds(entries: &[(&str, NodeStatus)]) -> Vec<(String, NodeStatus)> {
    entries.iter().map(|(id, s)| (id.to_string(), *s)).collect()
}

#[test]
fn test_join_waits_for_every_source() {
    let join = WorkflowNode::join("j", Phase::Review);
    assert_eq!(
        evaluate_readiness(
            &join,
            &preds(&[("a", NodeStatus::Completed), ("b", NodeStatus::Running)])
        ),
        Readiness::Waiting
    );
    assert_eq!(
        evaluate_readiness(
            &join,
            &preds(&[("a", NodeStatus::Completed), ("b", NodeStatus::Completed)])
        ),
        Readiness::Ready { partial: false }
    );
}

#[test]
fn test_join_fails_fast() {
    let join = WorkflowNode::join("j", Phase::Review);
    let readiness = evaluate_readiness(
        &join,
        &preds(&[("a", NodeStatus::Failed), ("b", NodeStatus::Running)]),
    );
    assert!(matches!(readiness, Readiness::Fail { reason } if reason.contains('a')));
}

#[test]
fn test_best_effort_join_proceeds_partial() {
    let join = WorkflowNode::join("j", Phase::Review).with_join_policy(JoinPolicy::BestEffort);
    assert_eq!(
        evaluate_readiness(
            &join,
            &preds(&[("a", NodeStatus::Failed), ("b", NodeStatus::Running)])
        ),
        Readiness::Waiting
    );
    assert_eq!(
        evaluate_readiness(
            &join,
            &preds(&[("a", NodeStatus::Failed), ("b", NodeStatus::Completed)])
        ),
        Readiness::Ready { partial: true }
    );
    assert!(matches!(
        evaluate_readiness(
            &join,
            &preds(&[("a", NodeStatus::Failed), ("b", NodeStatus::Failed)])
        ),
        Readiness::Fail { .. }
    ));
}

#[test]
fn test_task_waits_on_failed_predecessor() {
    let task = WorkflowNode::task("t", Phase::Impl);
    assert_eq!(
        evaluate_readiness(&task, &preds(&[("a", NodeStatus::Failed)])),
        Readiness::Waiting
    );
}
