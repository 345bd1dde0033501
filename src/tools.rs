//! Request/response tool surface for an agent client.
//!
//! One JSON request in, one JSON response out. Arguments sit beside the
//! tool name:
//!
//! ```json
//! {"tool": "approve_gate", "nodeId": "build"}
//! {"ok": true, "result": {"decision": "approved"}}
//! ```
//!
//! [`serve`] carries the protocol over a line stream. `start_fix_loop` runs
//! on its own task there, so its response can arrive after responses to
//! later requests; every streamed response names its tool.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::PathBuf;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::error::EngineError;
use crate::executor::{GateDecision, NodeOutcome};
use crate::memory::RecallQuery;
use crate::models::{ErrorReport, FixLoopRequest, FixLoopResult, FixRecord};
use crate::progress::Direction;
use crate::session::Session;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusArgs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagramArgs {
    #[serde(default = "default_direction")]
    pub direction: String,
    #[serde(default)]
    pub show_gate_badges: bool,
}

fn default_direction() -> String {
    "TD".to_string()
}

impl Default for DiagramArgs {
    fn default() -> Self {
        Self {
            direction: default_direction(),
            show_gate_badges: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeArgs {
    pub node_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdvanceArgs {
    pub node_id: String,
    #[serde(flatten)]
    pub outcome: NodeOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportErrorArgs {
    pub node_id: String,
    #[serde(flatten)]
    pub error: ErrorReport,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectGateArgs {
    pub node_id: String,
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotArgs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

/// Tool invocation, `{"tool": <name>, ...args}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "tool", rename_all = "snake_case")]
pub enum ToolRequest {
    Status(StatusArgs),
    Blockers,
    Diagram(DiagramArgs),
    Clear,
    StartFixLoop(FixLoopRequest),
    CancelFixLoop,
    RecallFixes(RecallQuery),
    StoreFix(FixRecord),
    FixLoopStatus,
    Begin(NodeArgs),
    Advance(AdvanceArgs),
    ReportError(ReportErrorArgs),
    ApproveGate(NodeArgs),
    RejectGate(RejectGateArgs),
    UnblockNode(NodeArgs),
    CancelWorkflow,
    SaveSnapshot(SnapshotArgs),
}

impl ToolRequest {
    pub fn name(&self) -> &'static str {
        match self {
            ToolRequest::Status(_) => "status",
            ToolRequest::Blockers => "blockers",
            ToolRequest::Diagram(_) => "diagram",
            ToolRequest::Clear => "clear",
            ToolRequest::StartFixLoop(_) => "start_fix_loop",
            ToolRequest::CancelFixLoop => "cancel_fix_loop",
            ToolRequest::RecallFixes(_) => "recall_fixes",
            ToolRequest::StoreFix(_) => "store_fix",
            ToolRequest::FixLoopStatus => "fix_loop_status",
            ToolRequest::Begin(_) => "begin",
            ToolRequest::Advance(_) => "advance",
            ToolRequest::ReportError(_) => "report_error",
            ToolRequest::ApproveGate(_) => "approve_gate",
            ToolRequest::RejectGate(_) => "reject_gate",
            ToolRequest::UnblockNode(_) => "unblock_node",
            ToolRequest::CancelWorkflow => "cancel_workflow",
            ToolRequest::SaveSnapshot(_) => "save_snapshot",
        }
    }
}

/// Tool response envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolResponse {
    pub fn success(result: Value) -> Self {
        Self {
            tool: None,
            ok: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            tool: None,
            ok: false,
            result: None,
            error: Some(error.into()),
        }
    }

    pub fn for_tool(mut self, tool: &str) -> Self {
        self.tool = Some(tool.to_string());
        self
    }
}

fn to_value<T: Serialize>(value: &T) -> Result<Value, EngineError> {
    serde_json::to_value(value).map_err(|e| EngineError::Storage(e.into()))
}

fn decision(decision: GateDecision) -> Value {
    match decision {
        GateDecision::Approved => json!({"decision": "approved"}),
        GateDecision::Reapproved => json!({"decision": "reapproved"}),
        GateDecision::Rejected { reason } => json!({"decision": "rejected", "reason": reason}),
    }
}

fn fix_loop_value(result: &FixLoopResult) -> Result<Value, EngineError> {
    let mut value = to_value(result)?;
    if let (Some(error), Some(map)) = (result.error(), value.as_object_mut()) {
        map.insert("error".to_string(), Value::String(error.to_string()));
    }
    Ok(value)
}

fn parse_request(line: &str) -> Result<ToolRequest, ToolResponse> {
    serde_json::from_str::<ToolRequest>(line)
        .map_err(|e| ToolResponse::failure(format!("invalid tool request: {e}")))
}

/// Parse one request line and dispatch it
pub async fn handle_line(session: &Session, line: &str) -> ToolResponse {
    match parse_request(line) {
        Ok(request) => dispatch(session, request).await,
        Err(response) => response,
    }
}

/// Answer line-delimited requests from `reader` until it closes.
///
/// Requests are handled in arrival order. A `start_fix_loop` claims the loop
/// before the next line is read, then runs on its own task, so a following
/// `cancel_fix_loop` always reaches it. Loops still running at end of input
/// are awaited and their responses written before this returns.
pub async fn serve<R, W>(session: &Session, reader: R, writer: W) -> anyhow::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let writer = tokio::spawn(write_responses(rx, writer));
    let mut loops = JoinSet::new();

    let mut lines = reader.lines();
    while let Some(line) = lines.next_line().await.context("Failed to read request")? {
        if line.trim().is_empty() {
            continue;
        }
        let response = match parse_request(&line) {
            Ok(ToolRequest::StartFixLoop(request)) => match session.spawn_fix_loop(request) {
                Ok(handle) => {
                    let tx = tx.clone();
                    loops.spawn(async move {
                        let response = match handle.await {
                            Ok(result) => match fix_loop_value(&result) {
                                Ok(value) => ToolResponse::success(value),
                                Err(e) => ToolResponse::failure(e.to_string()),
                            },
                            Err(e) => ToolResponse::failure(format!("fix loop task failed: {e}")),
                        };
                        let _ = tx.send(response.for_tool("start_fix_loop"));
                    });
                    continue;
                }
                Err(e) => ToolResponse::failure(e.to_string()).for_tool("start_fix_loop"),
            },
            Ok(request) => {
                let name = request.name();
                dispatch(session, request).await.for_tool(name)
            }
            Err(response) => response,
        };
        if tx.send(response).is_err() {
            warn!("response writer stopped; no longer reading requests");
            break;
        }
        while loops.try_join_next().is_some() {}
    }

    if !loops.is_empty() {
        debug!(running = loops.len(), "input closed; waiting for fix loops");
    }
    while loops.join_next().await.is_some() {}
    drop(tx);
    writer.await.context("Response writer panicked")?
}

async fn write_responses<W: AsyncWrite + Unpin>(
    mut responses: mpsc::UnboundedReceiver<ToolResponse>,
    mut writer: W,
) -> anyhow::Result<()> {
    while let Some(response) = responses.recv().await {
        let mut json = serde_json::to_string(&response).context("Failed to serialize response")?;
        json.push('\n');
        writer
            .write_all(json.as_bytes())
            .await
            .context("Failed to write response")?;
        writer.flush().await.context("Failed to flush response")?;
    }
    Ok(())
}

/// Run a tool against the session
pub async fn dispatch(session: &Session, request: ToolRequest) -> ToolResponse {
    let name = request.name();
    match run(session, request).await {
        Ok(result) => ToolResponse::success(result),
        Err(e) => {
            debug!(tool = name, error = %e, "tool failed");
            ToolResponse::failure(e.to_string())
        }
    }
}

async fn run(session: &Session, request: ToolRequest) -> Result<Value, EngineError> {
    match request {
        ToolRequest::Status(args) => to_value(&session.status(args.workflow_id.as_deref()).await?),
        ToolRequest::Blockers => to_value(&session.blockers().await?),
        ToolRequest::Diagram(args) => {
            let direction: Direction = args
                .direction
                .parse()
                .map_err(|e: anyhow::Error| EngineError::InvalidArgument(e.to_string()))?;
            let text = session.diagram(direction, args.show_gate_badges).await?;
            Ok(json!({ "diagram": text }))
        }
        ToolRequest::Clear => {
            session.clear().await;
            Ok(json!({ "cleared": true }))
        }
        ToolRequest::StartFixLoop(request) => {
            fix_loop_value(&session.start_fix_loop(request).await?)
        }
        ToolRequest::CancelFixLoop => Ok(json!({ "cancelled": session.cancel_fix_loop() })),
        ToolRequest::RecallFixes(query) => to_value(&session.recall_fixes(&query)),
        ToolRequest::StoreFix(record) => to_value(&session.store_fix(record)?),
        ToolRequest::FixLoopStatus => to_value(&session.fix_loop_status()),
        ToolRequest::Begin(args) => {
            session.begin(&args.node_id)?;
            Ok(json!({ "nodeId": args.node_id, "status": "running" }))
        }
        ToolRequest::Advance(args) => {
            session.advance(&args.node_id, args.outcome)?;
            Ok(json!({ "nodeId": args.node_id }))
        }
        ToolRequest::ReportError(args) => {
            session.report_error(&args.node_id, args.error)?;
            Ok(json!({ "nodeId": args.node_id, "autoFix": session.config().engine.auto_fix }))
        }
        ToolRequest::ApproveGate(args) => Ok(decision(session.approve_gate(&args.node_id)?)),
        ToolRequest::RejectGate(args) => {
            Ok(decision(session.reject_gate(&args.node_id, &args.reason)?))
        }
        ToolRequest::UnblockNode(args) => {
            session.unblock_node(&args.node_id)?;
            Ok(json!({ "nodeId": args.node_id, "status": "ready" }))
        }
        ToolRequest::CancelWorkflow => Ok(json!({ "blocked": session.cancel_workflow()? })),
        ToolRequest::SaveSnapshot(args) => {
            let path = session.save_snapshot(args.path.as_deref()).await?;
            Ok(json!({ "path": path.display().to_string() }))
        }
    }
}
