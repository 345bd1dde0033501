//! Tests for executor state transitions

use super::*;
use crate::events::{Event, Subscription};
use crate::models::{ErrorReport, GatePolicy, GraphDefaults, JoinPolicy, Phase, WorkflowNode};
use chrono::Duration;

fn ungated(graph: WorkflowGraph) -> WorkflowGraph {
    graph.with_defaults(GraphDefaults {
        timeout_ms: None,
        gate_policy: GatePolicy::Never,
    })
}

/// a -> b -> c, no gates
fn chain() -> WorkflowGraph {
    ungated(
        WorkflowGraph::new("wf", "a")
            .with_node(WorkflowNode::task("a", Phase::Analysis))
            .with_node(WorkflowNode::task("b", Phase::Impl))
            .with_node(WorkflowNode::task("c", Phase::Test))
            .with_edge("a", "b")
            .with_edge("b", "c"),
    )
}

/// root fans out to x, y, z which meet at join j
fn diamond(policy: JoinPolicy) -> WorkflowGraph {
    ungated(
        WorkflowGraph::new("wf", "root")
            .with_node(WorkflowNode::task("root", Phase::Analysis))
            .with_node(WorkflowNode::task("x", Phase::Impl))
            .with_node(WorkflowNode::task("y", Phase::Impl))
            .with_node(WorkflowNode::task("z", Phase::Impl))
            .with_node(WorkflowNode::join("j", Phase::Review).with_join_policy(policy))
            .with_edge("root", "x")
            .with_edge("root", "y")
            .with_edge("root", "z")
            .with_edge("x", "j")
            .with_edge("y", "j")
            .with_edge("z", "j"),
    )
}

fn start(graph: WorkflowGraph) -> (Executor, Subscription) {
    let bus = EventBus::new(256);
    let sub = bus.subscribe();
    let executor = Executor::start(graph, bus).unwrap();
    (executor, sub)
}

fn run(executor: &mut Executor, id: &str) {
    executor.begin(id).unwrap();
    executor.advance(id, NodeOutcome::Completed).unwrap();
}

fn names(events: &[Event]) -> Vec<(String, Option<String>)> {
    events
        .iter()
        .map(|e| (e.name().to_string(), e.node_id().map(String::from)))
        .collect()
}

fn status(executor: &Executor, id: &str) -> NodeStatus {
    executor.state(id).unwrap().status
}

#[test]
fn test_start_readies_in_degree_zero_nodes() {
    let graph = ungated(
        WorkflowGraph::new("wf", "a")
            .with_node(WorkflowNode::task("a", Phase::Analysis))
            .with_node(WorkflowNode::task("b", Phase::Plan))
            .with_node(WorkflowNode::task("side", Phase::Plan))
            .with_edge("a", "b"),
    );
    let (executor, mut sub) = start(graph);

    assert_eq!(executor.ready_nodes(), vec!["a", "side"]);
    assert_eq!(status(&executor, "b"), NodeStatus::Pending);

    let events = sub.drain();
    assert_eq!(events[0].name(), "workflow:started");
    let ready: Vec<_> = events
        .iter()
        .filter(|e| e.name() == "node:ready")
        .filter_map(|e| e.node_id())
        .collect();
    assert_eq!(ready, vec!["a", "side"]);
}

#[test]
fn test_start_rejects_invalid_graph() {
    let graph = chain().with_edge("c", "a");
    let err = Executor::start(graph, EventBus::default()).unwrap_err();
    assert!(matches!(err, EngineError::GraphInvalid(_)));
}

#[test]
fn test_advance_walks_chain_to_completion() {
    let (mut executor, mut sub) = start(chain());
    run(&mut executor, "a");
    assert_eq!(executor.ready_nodes(), vec!["b"]);
    run(&mut executor, "b");
    run(&mut executor, "c");

    assert!(executor.is_settled());
    let events = sub.drain();
    let last = events.last().unwrap();
    assert!(matches!(
        &last.kind,
        EventKind::WorkflowCompleted { completed: 3, failed: 0, unreached: 0, .. }
    ));
}

#[test]
fn test_events_for_node_are_causally_ordered() {
    let (mut executor, mut sub) = start(chain());
    run(&mut executor, "a");

    let events = names(&sub.drain());
    let of_a: Vec<_> = events
        .iter()
        .filter(|(_, id)| id.as_deref() == Some("a"))
        .map(|(name, _)| name.as_str())
        .collect();
    assert_eq!(of_a, vec!["node:ready", "node:started", "node:completed"]);
}

#[test]
fn test_begin_requires_ready() {
    let (mut executor, _sub) = start(chain());
    let err = executor.begin("b").unwrap_err();
    assert!(matches!(
        err,
        EngineError::InvalidTransition { from: NodeStatus::Pending, to: NodeStatus::Running, .. }
    ));
    assert!(matches!(
        executor.begin("nope").unwrap_err(),
        EngineError::UnknownNode(_)
    ));
}

#[test]
fn test_terminal_outcome_is_assigned_once() {
    let (mut executor, _sub) = start(chain());
    run(&mut executor, "a");
    let err = executor.advance("a", NodeOutcome::Completed).unwrap_err();
    assert!(matches!(err, EngineError::InvalidTransition { .. }));
    let err = executor
        .advance("a", NodeOutcome::Failed { reason: "late".into() })
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidTransition { .. }));
}

#[test]
fn test_join_waits_for_all_sources() {
    let (mut executor, _sub) = start(diamond(JoinPolicy::All));
    run(&mut executor, "root");
    assert_eq!(executor.ready_nodes(), vec!["x", "y", "z"]);

    run(&mut executor, "x");
    run(&mut executor, "y");
    assert_eq!(status(&executor, "j"), NodeStatus::Pending);

    run(&mut executor, "z");
    assert_eq!(status(&executor, "j"), NodeStatus::Ready);
}

#[test]
fn test_join_fails_fast_on_failed_source() {
    let (mut executor, mut sub) = start(diamond(JoinPolicy::All));
    run(&mut executor, "root");
    executor.begin("x").unwrap();
    executor
        .advance("x", NodeOutcome::Failed { reason: "compile error".into() })
        .unwrap();

    let state = executor.state("j").unwrap();
    assert_eq!(state.status, NodeStatus::Failed);
    assert!(state.failure_reason.as_deref().unwrap().contains('x'));

    let failed: Vec<_> = sub
        .drain()
        .into_iter()
        .filter(|e| e.name() == "node:failed")
        .filter_map(|e| e.node_id().map(String::from))
        .collect();
    assert_eq!(failed, vec!["x", "j"]);
    // y and z keep running independently
    assert!(!executor.is_settled());
}

#[test]
fn test_best_effort_join_waits_then_runs_partial() {
    let (mut executor, _sub) = start(diamond(JoinPolicy::BestEffort));
    run(&mut executor, "root");
    executor.begin("x").unwrap();
    executor
        .advance("x", NodeOutcome::Failed { reason: "flaky".into() })
        .unwrap();
    assert_eq!(status(&executor, "j"), NodeStatus::Pending);

    run(&mut executor, "y");
    run(&mut executor, "z");
    let state = executor.state("j").unwrap();
    assert_eq!(state.status, NodeStatus::Ready);
    assert!(state.partial);
}

#[test]
fn test_failed_join_cascades_to_downstream_join() {
    let graph = ungated(
        WorkflowGraph::new("wf", "a")
            .with_node(WorkflowNode::task("a", Phase::Analysis))
            .with_node(WorkflowNode::task("b", Phase::Analysis))
            .with_node(WorkflowNode::join("j1", Phase::Plan))
            .with_node(WorkflowNode::task("c", Phase::Plan))
            .with_node(WorkflowNode::join("j2", Phase::Review))
            .with_edge("a", "j1")
            .with_edge("b", "j1")
            .with_edge("j1", "j2")
            .with_edge("c", "j2"),
    );
    let (mut executor, _sub) = start(graph);
    executor.begin("a").unwrap();
    executor
        .advance("a", NodeOutcome::Failed { reason: "boom".into() })
        .unwrap();

    assert_eq!(status(&executor, "j1"), NodeStatus::Failed);
    assert_eq!(status(&executor, "j2"), NodeStatus::Failed);
}

#[test]
fn test_task_after_failed_predecessor_stays_pending() {
    let (mut executor, mut sub) = start(chain());
    executor.begin("a").unwrap();
    executor
        .advance("a", NodeOutcome::Failed { reason: "nope".into() })
        .unwrap();

    assert_eq!(status(&executor, "b"), NodeStatus::Pending);
    assert!(executor.is_settled());
    let last = sub.drain().pop().unwrap();
    assert!(matches!(
        last.kind,
        EventKind::WorkflowCompleted { completed: 0, failed: 1, unreached: 2, .. }
    ));
}

#[test]
fn test_blocked_outcome_carries_reason_and_tool_calls() {
    let (mut executor, _sub) = start(chain());
    executor.begin("a").unwrap();
    executor
        .advance(
            "a",
            NodeOutcome::Blocked {
                reason: "   ".into(),
                next_tool_calls: vec![],
            },
        )
        .unwrap();

    let state = executor.state("a").unwrap();
    assert_eq!(state.status, NodeStatus::Blocked);
    assert_eq!(state.blocked_reason.as_deref(), Some("blocked by agent"));
    assert!(!state.next_tool_calls.is_empty());
    assert!(state.blocked_at.is_some());
}

#[test]
fn test_gated_node_waits_for_approval() {
    let graph = WorkflowGraph::new("wf", "plan")
        .with_node(WorkflowNode::task("plan", Phase::Plan))
        .with_node(WorkflowNode::task("build", Phase::Impl))
        .with_edge("plan", "build");
    let (mut executor, _sub) = start(graph);
    run(&mut executor, "plan");

    assert_eq!(status(&executor, "build"), NodeStatus::AwaitingGate);
    assert!(executor.begin("build").is_err());

    assert_eq!(executor.approve_gate("build").unwrap(), gates::GateDecision::Approved);
    assert_eq!(status(&executor, "build"), NodeStatus::Running);
}

#[test]
fn test_gate_rejection_blocks_then_reapproval_resumes() {
    let graph = WorkflowGraph::new("wf", "build")
        .with_node(WorkflowNode::task("build", Phase::Impl));
    let (mut executor, mut sub) = start(graph);

    executor.reject_gate("build", "needs review").unwrap();
    let state = executor.state("build").unwrap();
    assert_eq!(state.status, NodeStatus::Blocked);
    assert_eq!(state.blocked_reason.as_deref(), Some("gate rejected: needs review"));

    assert!(matches!(
        executor.unblock("build").unwrap_err(),
        EngineError::GateRejected { .. }
    ));
    assert!(matches!(
        executor.begin("build").unwrap_err(),
        EngineError::GateRejected { .. }
    ));

    executor.approve_gate("build").unwrap();
    assert_eq!(status(&executor, "build"), NodeStatus::Running);

    let tail: Vec<_> = names(&sub.drain())
        .into_iter()
        .rev()
        .take(2)
        .map(|(n, _)| n)
        .collect();
    assert_eq!(tail, vec!["node:started", "node:unblocked"]);
}

#[test]
fn test_reject_without_reason_uses_plain_text() {
    let graph = WorkflowGraph::new("wf", "t").with_node(WorkflowNode::task("t", Phase::Test));
    let (mut executor, _sub) = start(graph);
    executor.reject_gate("t", "").unwrap();
    assert_eq!(
        executor.state("t").unwrap().blocked_reason.as_deref(),
        Some("gate rejected")
    );
}

#[test]
fn test_timeout_sweep_blocks_running_and_gated_nodes() {
    let graph = WorkflowGraph::new("wf", "a")
        .with_node(WorkflowNode::task("a", Phase::Analysis).with_timeout_ms(1_000))
        .with_node(WorkflowNode::task("g", Phase::Review).with_timeout_ms(1_000))
        .with_node(WorkflowNode::task("slow", Phase::Plan));
    let (mut executor, _sub) = start(graph);
    executor.begin("a").unwrap();
    executor.begin("slow").unwrap();

    let now = Utc::now();
    assert!(executor.timeout_sweep(now).unwrap().is_empty());

    let later = now + Duration::seconds(5);
    assert_eq!(executor.timeout_sweep(later).unwrap(), vec!["a", "g"]);
    assert_eq!(
        executor.state("a").unwrap().blocked_reason.as_deref(),
        Some("timeout")
    );
    assert_eq!(
        executor.state("g").unwrap().blocked_reason.as_deref(),
        Some("gate timeout")
    );
    // no timeout configured anywhere
    assert_eq!(status(&executor, "slow"), NodeStatus::Running);
}

#[test]
fn test_engine_default_timeout_applies() {
    let (mut executor, _sub) = start(chain());
    executor.set_default_timeout_ms(Some(10));
    executor.begin("a").unwrap();
    let blocked = executor
        .timeout_sweep(Utc::now() + Duration::seconds(1))
        .unwrap();
    assert_eq!(blocked, vec!["a"]);
}

#[test]
fn test_cancel_blocks_active_nodes_and_halts() {
    let graph = WorkflowGraph::new("wf", "a")
        .with_node(WorkflowNode::task("a", Phase::Analysis))
        .with_node(WorkflowNode::task("g", Phase::Impl))
        .with_node(WorkflowNode::task("after", Phase::Plan))
        .with_edge("a", "after");
    let (mut executor, mut sub) = start(graph);
    executor.begin("a").unwrap();

    assert_eq!(executor.cancel().unwrap(), vec!["a", "g"]);
    assert!(executor.is_halted());
    assert_eq!(
        executor.state("a").unwrap().blocked_reason.as_deref(),
        Some("cancelled")
    );
    assert!(matches!(
        executor.advance("a", NodeOutcome::Completed).unwrap_err(),
        EngineError::Halted(_)
    ));
    assert!(executor.cancel().unwrap().is_empty());
    assert_eq!(sub.drain().last().unwrap().name(), "workflow:cancelled");
}

#[test]
fn test_remediation_hold_and_resolution() {
    let (mut executor, mut sub) = start(chain());
    executor.begin("a").unwrap();
    let hold = executor
        .hold_for_remediation("a", ErrorReport::new("ModuleNotFound", "no serde"))
        .unwrap();
    assert_eq!(executor.state("a").unwrap().hold_seq, Some(hold));

    let state = executor.state("a").unwrap();
    assert_eq!(
        state.blocked_reason.as_deref(),
        Some("auto-fix in progress: ModuleNotFound: no serde")
    );
    let blocked = sub
        .drain()
        .into_iter()
        .find(|e| e.name() == "node:blocked")
        .unwrap();
    match blocked.kind {
        EventKind::NodeBlocked { error: Some(err), .. } => {
            assert_eq!(err.task_id.as_deref(), Some("a"))
        }
        other => panic!("unexpected event: {other:?}"),
    }

    assert!(executor
        .resolve_remediation("a", hold, recovery::RemediationOutcome::Resolved)
        .unwrap());
    assert_eq!(status(&executor, "a"), NodeStatus::Ready);
    assert_eq!(executor.state("a").unwrap().hold_seq, None);

    // no longer held: a second outcome is ignored
    assert!(!executor
        .resolve_remediation(
            "a",
            hold,
            recovery::RemediationOutcome::Exhausted { message: "x".into() }
        )
        .unwrap());
}

#[test]
fn test_outcome_for_released_hold_ignored() {
    let (mut executor, _sub) = start(chain());
    executor.begin("a").unwrap();
    let first = executor
        .hold_for_remediation("a", ErrorReport::new("First", "first failure"))
        .unwrap();
    executor.unblock("a").unwrap();
    executor.begin("a").unwrap();
    let second = executor
        .hold_for_remediation("a", ErrorReport::new("Second", "second failure"))
        .unwrap();
    assert!(second > first);
    assert!(!executor.is_held("a", first));

    // The loop for the first error finishing late must not touch the new hold
    assert!(!executor
        .resolve_remediation(
            "a",
            first,
            recovery::RemediationOutcome::Exhausted {
                message: "First: first failure".into(),
            },
        )
        .unwrap());
    let state = executor.state("a").unwrap();
    assert_eq!(state.status, NodeStatus::Blocked);
    assert_eq!(state.hold_seq, Some(second));

    assert!(executor
        .resolve_remediation("a", second, recovery::RemediationOutcome::Resolved)
        .unwrap());
    assert_eq!(status(&executor, "a"), NodeStatus::Ready);
}

#[test]
fn test_exhausted_remediation_fails_node() {
    let (mut executor, _sub) = start(chain());
    executor.begin("a").unwrap();
    let hold = executor
        .hold_for_remediation("a", ErrorReport::new("E", "bad"))
        .unwrap();
    executor
        .resolve_remediation(
            "a",
            hold,
            recovery::RemediationOutcome::Exhausted {
                message: "E: bad".into(),
            },
        )
        .unwrap();

    let state = executor.state("a").unwrap();
    assert_eq!(state.status, NodeStatus::Failed);
    assert_eq!(state.failure_reason.as_deref(), Some("E: bad"));
}

#[test]
fn test_restore_resumes_from_states() {
    let (mut executor, _sub) = start(chain());
    run(&mut executor, "a");
    let states = executor.states().clone();

    let bus = EventBus::default();
    let mut restored = Executor::restore(chain(), states, bus).unwrap();
    assert_eq!(restored.ready_nodes(), vec!["b"]);
    run(&mut restored, "b");
    assert_eq!(restored.ready_nodes(), vec!["c"]);
}

#[test]
fn test_restore_rejects_unknown_node() {
    let mut states = IndexMap::new();
    states.insert("ghost".to_string(), NodeState::pending());
    let err = Executor::restore(chain(), states, EventBus::default()).unwrap_err();
    assert!(matches!(err, EngineError::UnknownNode(id) if id == "ghost"));
}
