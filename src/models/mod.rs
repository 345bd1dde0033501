pub mod constants;
pub mod fix;
pub mod node_state;
pub mod workflow;

pub use fix::{
    ErrorReport, FinalError, FixAttempt, FixLoopRequest, FixLoopResult, FixLoopStats,
    FixLoopStatus, FixRecord, FixResult, FixSource, FixType, ProposedFix,
};
pub use node_state::{BlockCause, NodeState, NodeStatus};
pub use workflow::{
    GatePolicy, GraphDefaults, JoinPolicy, NodeKind, Phase, WorkflowEdge, WorkflowGraph,
    WorkflowNode,
};
