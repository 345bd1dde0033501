//! Integration tests for graph execution and the progress projection
//!
//! The executor publishes to a bus; the tracker is fed by draining a
//! subscription, the same way the session's projection actor consumes it.

use std::collections::BTreeSet;
use std::time::Duration;

use warden::events::{EventBus, Subscription};
use warden::executor::{Executor, NodeOutcome};
use warden::models::{
    GatePolicy, GraphDefaults, JoinPolicy, NodeStatus, Phase, WorkflowGraph, WorkflowNode,
};
use warden::progress::{Direction, PersistedSnapshot, ProgressTracker};
use warden::EngineError;

struct Harness {
    executor: Executor,
    events: Subscription,
    tracker: ProgressTracker,
}

impl Harness {
    fn start(graph: WorkflowGraph) -> Self {
        let bus = EventBus::default();
        let events = bus.subscribe();
        let executor = Executor::start(graph, bus).expect("graph should start");
        let mut harness = Self {
            executor,
            events,
            tracker: ProgressTracker::new(),
        };
        harness.sync();
        harness
    }

    fn sync(&mut self) {
        for event in self.events.drain() {
            self.tracker.on_event(&event);
        }
    }

    fn run(&mut self, node_id: &str) {
        self.executor.begin(node_id).unwrap();
        self.executor.advance(node_id, NodeOutcome::Completed).unwrap();
        self.sync();
    }

    fn status(&self, node_id: &str) -> NodeStatus {
        self.executor.state(node_id).unwrap().status
    }
}

fn no_gates() -> GraphDefaults {
    GraphDefaults {
        timeout_ms: None,
        gate_policy: GatePolicy::Never,
    }
}

/// analyze -> {frontend, backend, docs} -> merge (join) -> ship
fn fan_out(join: JoinPolicy) -> WorkflowGraph {
    WorkflowGraph::new("release", "analyze")
        .with_node(WorkflowNode::task("analyze", Phase::Analysis))
        .with_node(WorkflowNode::task("frontend", Phase::Impl))
        .with_node(WorkflowNode::task("backend", Phase::Impl))
        .with_node(WorkflowNode::task("docs", Phase::Impl))
        .with_node(WorkflowNode::join("merge", Phase::Review).with_join_policy(join))
        .with_node(WorkflowNode::task("ship", Phase::Review))
        .with_edge("analyze", "frontend")
        .with_edge("analyze", "backend")
        .with_edge("analyze", "docs")
        .with_edge("frontend", "merge")
        .with_edge("backend", "merge")
        .with_edge("docs", "merge")
        .with_edge("merge", "ship")
        .with_defaults(no_gates())
}

#[test]
fn test_ready_set_is_exactly_the_roots() {
    let graph = WorkflowGraph::new("wf", "a")
        .with_node(WorkflowNode::task("a", Phase::Analysis))
        .with_node(WorkflowNode::task("lint", Phase::Analysis))
        .with_node(WorkflowNode::task("b", Phase::Plan))
        .with_node(WorkflowNode::join("j", Phase::Review))
        .with_edge("a", "b")
        .with_edge("b", "j")
        .with_edge("lint", "j")
        .with_defaults(no_gates());

    let harness = Harness::start(graph);
    let ready: BTreeSet<String> = harness.executor.ready_nodes().into_iter().collect();
    assert_eq!(ready, BTreeSet::from(["a".to_string(), "lint".to_string()]));
    assert_eq!(harness.status("b"), NodeStatus::Pending);
    assert_eq!(harness.status("j"), NodeStatus::Pending);
}

#[test]
fn test_invalid_graph_rejected_at_start() {
    let graph = WorkflowGraph::new("wf", "a")
        .with_node(WorkflowNode::task("a", Phase::Analysis))
        .with_edge("a", "ghost");
    let err = Executor::start(graph, EventBus::default()).unwrap_err();
    assert!(matches!(err, EngineError::GraphInvalid(_)));
}

#[test]
fn test_join_waits_for_all_sources() {
    let mut harness = Harness::start(fan_out(JoinPolicy::All));
    harness.run("analyze");
    harness.run("frontend");
    harness.run("backend");
    assert_eq!(harness.status("merge"), NodeStatus::Pending);

    harness.run("docs");
    assert_eq!(harness.status("merge"), NodeStatus::Ready);
    harness.run("merge");
    harness.run("ship");

    assert!(harness.executor.is_settled());
    let snapshot = harness.tracker.status(Some("release")).unwrap();
    assert_eq!(snapshot.summary.completed, 6);
}

#[test]
fn test_join_fails_when_a_source_fails() {
    let mut harness = Harness::start(fan_out(JoinPolicy::All));
    harness.run("analyze");
    harness.executor.begin("backend").unwrap();
    harness
        .executor
        .advance(
            "backend",
            NodeOutcome::Failed {
                reason: "compile error".into(),
            },
        )
        .unwrap();
    harness.sync();

    assert_eq!(harness.status("merge"), NodeStatus::Failed);
    // tasks behind a failed join stay pending and count as unreached
    assert_eq!(harness.status("ship"), NodeStatus::Pending);
    let merge = harness.tracker.node_state("merge").unwrap();
    assert!(merge.failure_reason.as_deref().unwrap().contains("backend"));
}

#[test]
fn test_best_effort_join_proceeds_with_partial_inputs() {
    let mut harness = Harness::start(fan_out(JoinPolicy::BestEffort));
    harness.run("analyze");
    harness.run("frontend");
    harness.run("backend");
    harness.executor.begin("docs").unwrap();
    harness
        .executor
        .advance("docs", NodeOutcome::Failed { reason: "spellcheck".into() })
        .unwrap();
    harness.sync();

    assert_eq!(harness.status("merge"), NodeStatus::Ready);
    assert!(harness.executor.state("merge").unwrap().partial);
}

#[test]
fn test_blockers_most_recent_first() {
    let graph = WorkflowGraph::new("wf", "a")
        .with_node(WorkflowNode::task("a", Phase::Analysis))
        .with_node(WorkflowNode::task("b", Phase::Analysis))
        .with_node(WorkflowNode::task("c", Phase::Analysis))
        .with_defaults(no_gates());
    let mut harness = Harness::start(graph);

    for id in ["a", "b", "c"] {
        harness.executor.begin(id).unwrap();
    }
    for (id, tool) in [("a", "unblock_node"), ("b", "recall_fixes"), ("c", "unblock_node")] {
        harness
            .executor
            .advance(
                id,
                NodeOutcome::Blocked {
                    reason: format!("{id} needs help"),
                    next_tool_calls: vec![tool.to_string()],
                },
            )
            .unwrap();
        std::thread::sleep(Duration::from_millis(5));
    }
    harness.sync();

    let report = harness.tracker.blockers().unwrap();
    let order: Vec<&str> = report.blockers.iter().map(|b| b.node_id.as_str()).collect();
    let priorities: Vec<usize> = report.blockers.iter().map(|b| b.priority).collect();
    assert_eq!(order, vec!["c", "b", "a"]);
    assert_eq!(priorities, vec![1, 2, 3]);
    assert_eq!(
        report.summary,
        "3 blocked nodes; suggested next tool calls: unblock_node, recall_fixes"
    );
}

#[test]
fn test_status_is_idempotent() {
    let mut harness = Harness::start(fan_out(JoinPolicy::All));
    harness.run("analyze");

    let first = serde_json::to_string(&harness.tracker.status(None).unwrap()).unwrap();
    let second = serde_json::to_string(&harness.tracker.status(None).unwrap()).unwrap();
    assert_eq!(first, second);
}

#[test]
fn test_status_rejects_other_workflow() {
    let harness = Harness::start(fan_out(JoinPolicy::All));
    let err = harness.tracker.status(Some("nightly")).unwrap_err();
    assert!(matches!(err, EngineError::WorkflowMismatch { .. }));
}

#[test]
fn test_diagram_tracks_progress() {
    let graph = WorkflowGraph::new("wf", "A")
        .with_node(WorkflowNode::task("A", Phase::Analysis))
        .with_node(WorkflowNode::task("B", Phase::Plan))
        .with_node(WorkflowNode::task("C", Phase::Plan))
        .with_edge("A", "B")
        .with_edge("B", "C")
        .with_defaults(no_gates());
    let mut harness = Harness::start(graph);
    let before = harness.tracker.diagram(Direction::LR, false).unwrap();

    harness.run("A");
    harness.executor.begin("B").unwrap();
    harness.sync();
    let after = harness.tracker.diagram(Direction::LR, false).unwrap();

    let line = |diagram: &str, id: &str| {
        diagram
            .lines()
            .find(|l| l.trim_start().starts_with(&format!("{id}[")))
            .unwrap()
            .to_string()
    };
    assert_ne!(line(&before, "A"), line(&after, "A"));
    assert_ne!(line(&before, "B"), line(&after, "B"));
    assert_eq!(line(&before, "C"), line(&after, "C"));
    assert!(after.contains("A --> B"));
    assert!(after.contains("B --> C"));
}

#[test]
fn test_gate_flow_through_projection() {
    let graph = WorkflowGraph::new("wf", "plan")
        .with_node(WorkflowNode::task("plan", Phase::Plan))
        .with_node(WorkflowNode::task("build", Phase::Impl))
        .with_edge("plan", "build");
    let mut harness = Harness::start(graph);
    harness.run("plan");
    assert_eq!(harness.status("build"), NodeStatus::AwaitingGate);

    harness.executor.reject_gate("build", "needs design review").unwrap();
    harness.sync();
    let report = harness.tracker.blockers().unwrap();
    assert_eq!(report.blockers[0].node_id, "build");
    assert!(report.blockers[0].reason.contains("needs design review"));
    assert!(matches!(
        harness.executor.begin("build").unwrap_err(),
        EngineError::GateRejected { .. }
    ));

    harness.executor.approve_gate("build").unwrap();
    harness.sync();
    assert_eq!(harness.status("build"), NodeStatus::Running);
    assert!(harness.tracker.blockers().unwrap().blockers.is_empty());
}

#[test]
fn test_cancel_halts_and_keeps_projection() {
    let mut harness = Harness::start(fan_out(JoinPolicy::All));
    harness.run("analyze");
    harness.executor.begin("frontend").unwrap();

    let blocked = harness.executor.cancel().unwrap();
    harness.sync();
    assert_eq!(blocked, vec!["frontend"]);
    assert!(matches!(
        harness.executor.begin("backend").unwrap_err(),
        EngineError::Halted(_)
    ));

    let snapshot = harness.tracker.status(None).unwrap();
    assert_eq!(snapshot.summary.completed, 1);
    assert_eq!(
        snapshot.node_states["frontend"].blocked_reason.as_deref(),
        Some("cancelled")
    );
}

#[test]
fn test_snapshot_resume_after_restart() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("state").join("snapshot.json");

    let mut harness = Harness::start(fan_out(JoinPolicy::All));
    harness.run("analyze");
    harness.run("frontend");
    harness.tracker.to_persisted().unwrap().save(&path).unwrap();

    // A fresh process picks up where the first left off
    let snapshot = PersistedSnapshot::load(&path).unwrap();
    let mut tracker = ProgressTracker::new();
    tracker.restore(snapshot.clone()).unwrap();
    let bus = EventBus::default();
    bus.advance_seq_to(snapshot.seq);
    let mut events = bus.subscribe();
    let mut executor = Executor::restore(snapshot.graph, snapshot.node_states, bus).unwrap();

    assert_eq!(executor.state("frontend").unwrap().status, NodeStatus::Completed);
    executor.begin("backend").unwrap();
    for event in events.drain() {
        assert!(event.seq > snapshot.seq);
        tracker.on_event(&event);
    }
    assert_eq!(
        tracker.node_state("backend").unwrap().status,
        NodeStatus::Running
    );

    // The original projection has moved on; an older snapshot is stale
    harness.run("backend");
    let mut stale = harness.tracker.to_persisted().unwrap();
    stale.seq = 1;
    assert!(matches!(
        harness.tracker.restore(stale).unwrap_err(),
        EngineError::StaleSnapshot { .. }
    ));
}
