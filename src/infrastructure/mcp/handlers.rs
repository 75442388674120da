//! MCP tool handlers.
//!
//! Agents report through these tools; every call becomes a task-queue
//! mutation which persists, gossips, and wakes the dispatcher.

use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use crate::domain::models::{BoardMessage, NodeId};
use crate::mesh::wire::{BoardPost, Message};
use crate::mesh::{GossipEngine, LamportClock};
use crate::services::agent_registry::AgentRegistry;
use crate::services::replication::Replicator;
use crate::services::task_queue::TaskQueue;

use super::types::{
    AgentReadyParams, BoardPostParams, JsonRpcRequest, JsonRpcResponse, TaskCompleteParams,
    TaskFailedParams, TaskNeedsInputParams, TaskProgressParams, INTERNAL_ERROR, INVALID_PARAMS,
    METHOD_NOT_FOUND,
};

/// Shared state for the MCP server.
#[derive(Clone)]
pub struct McpState {
    pub node_id: NodeId,
    pub clock: Arc<LamportClock>,
    pub queue: Arc<TaskQueue>,
    pub registry: Arc<AgentRegistry>,
    pub replicator: Arc<Replicator>,
    pub gossip: Arc<GossipEngine>,
}

pub async fn handle_rpc(
    State(state): State<McpState>,
    Json(request): Json<JsonRpcRequest>,
) -> JsonRpcResponse {
    debug!(method = %request.method, "mcp request");
    let id = request.id.clone();

    match request.method.as_str() {
        "initialize" => handle_initialize(id),
        "tools/list" => handle_list_tools(id),
        "tools/call" => handle_tool_call(state, request).await,
        _ => JsonRpcResponse::error(id, METHOD_NOT_FOUND, format!("Method not found: {}", request.method)),
    }
}

fn handle_initialize(id: Option<Value>) -> JsonRpcResponse {
    JsonRpcResponse::success(
        id,
        json!({
            "protocolVersion": "2024-11-05",
            "capabilities": { "tools": {} },
            "serverInfo": { "name": "voidlux-swarm", "version": env!("CARGO_PKG_VERSION") }
        }),
    )
}

fn handle_list_tools(id: Option<Value>) -> JsonRpcResponse {
    JsonRpcResponse::success(
        id,
        json!({
            "tools": [
                {
                    "name": "task_complete",
                    "description": "Report a task as finished, with its result",
                    "inputSchema": {
                        "type": "object",
                        "properties": {
                            "task_id": { "type": "string" },
                            "result": { "type": "string" }
                        },
                        "required": ["task_id"]
                    }
                },
                {
                    "name": "task_failed",
                    "description": "Report a task as failed",
                    "inputSchema": {
                        "type": "object",
                        "properties": {
                            "task_id": { "type": "string" },
                            "error": { "type": "string" }
                        },
                        "required": ["task_id", "error"]
                    }
                },
                {
                    "name": "task_progress",
                    "description": "Report progress on a running task",
                    "inputSchema": {
                        "type": "object",
                        "properties": {
                            "task_id": { "type": "string" },
                            "progress": { "type": "string" }
                        },
                        "required": ["task_id", "progress"]
                    }
                },
                {
                    "name": "task_needs_input",
                    "description": "Pause a task pending a human answer",
                    "inputSchema": {
                        "type": "object",
                        "properties": {
                            "task_id": { "type": "string" },
                            "question": { "type": "string" }
                        },
                        "required": ["task_id"]
                    }
                },
                {
                    "name": "agent_ready",
                    "description": "Announce that an agent session is up and idle",
                    "inputSchema": {
                        "type": "object",
                        "properties": {
                            "agent_name": { "type": "string" }
                        },
                        "required": ["agent_name"]
                    }
                },
                {
                    "name": "board_post",
                    "description": "Post a message to the swarm message board",
                    "inputSchema": {
                        "type": "object",
                        "properties": {
                            "agent_name": { "type": "string" },
                            "topic": { "type": "string" },
                            "body": { "type": "string" }
                        },
                        "required": ["agent_name", "topic", "body"]
                    }
                }
            ]
        }),
    )
}

async fn handle_tool_call(state: McpState, request: JsonRpcRequest) -> JsonRpcResponse {
    let id = request.id.clone();
    let Some(params) = request.params else {
        return JsonRpcResponse::error(id, INVALID_PARAMS, "missing params");
    };
    let tool = params.get("name").and_then(Value::as_str).unwrap_or_default().to_string();
    let arguments = params.get("arguments").cloned().unwrap_or(json!({}));

    let outcome = match tool.as_str() {
        "task_complete" => tool_task_complete(&state, arguments).await,
        "task_failed" => tool_task_failed(&state, arguments).await,
        "task_progress" => tool_task_progress(&state, arguments).await,
        "task_needs_input" => tool_task_needs_input(&state, arguments).await,
        "agent_ready" => tool_agent_ready(&state, arguments).await,
        "board_post" => tool_board_post(&state, arguments).await,
        other => Err(format!("unknown tool: {other}")),
    };

    match outcome {
        Ok(result) => JsonRpcResponse::success(
            id,
            json!({ "content": [{ "type": "text", "text": result.to_string() }] }),
        ),
        Err(message) => JsonRpcResponse::error(id, INTERNAL_ERROR, message),
    }
}

fn parse_task_id(raw: &str) -> Result<Uuid, String> {
    Uuid::parse_str(raw).map_err(|_| format!("invalid task_id: {raw}"))
}

async fn tool_task_complete(state: &McpState, args: Value) -> Result<Value, String> {
    let params: TaskCompleteParams = serde_json::from_value(args).map_err(|e| e.to_string())?;
    let task_id = parse_task_id(&params.task_id)?;
    let task = state
        .queue
        .complete(task_id, params.result)
        .await
        .map_err(|e| e.to_string())?;
    Ok(json!({ "task_id": task.id, "status": task.status.as_str() }))
}

async fn tool_task_failed(state: &McpState, args: Value) -> Result<Value, String> {
    let params: TaskFailedParams = serde_json::from_value(args).map_err(|e| e.to_string())?;
    let task_id = parse_task_id(&params.task_id)?;
    let task = state.queue.fail(task_id, params.error).await.map_err(|e| e.to_string())?;
    Ok(json!({ "task_id": task.id, "status": task.status.as_str() }))
}

async fn tool_task_progress(state: &McpState, args: Value) -> Result<Value, String> {
    let params: TaskProgressParams = serde_json::from_value(args).map_err(|e| e.to_string())?;
    let task_id = parse_task_id(&params.task_id)?;
    let task = state
        .queue
        .progress(task_id, params.progress)
        .await
        .map_err(|e| e.to_string())?;
    Ok(json!({ "task_id": task.id, "status": task.status.as_str() }))
}

async fn tool_task_needs_input(state: &McpState, args: Value) -> Result<Value, String> {
    let params: TaskNeedsInputParams = serde_json::from_value(args).map_err(|e| e.to_string())?;
    let task_id = parse_task_id(&params.task_id)?;
    let task = state
        .queue
        .needs_input(task_id, params.question)
        .await
        .map_err(|e| e.to_string())?;
    Ok(json!({ "task_id": task.id, "status": task.status.as_str() }))
}

async fn tool_agent_ready(state: &McpState, args: Value) -> Result<Value, String> {
    let params: AgentReadyParams = serde_json::from_value(args).map_err(|e| e.to_string())?;
    let agent = state
        .registry
        .mark_ready(&params.agent_name)
        .await
        .map_err(|e| e.to_string())?;
    Ok(json!({ "agent_id": agent.id, "status": agent.status.as_str() }))
}

async fn tool_board_post(state: &McpState, args: Value) -> Result<Value, String> {
    let params: BoardPostParams = serde_json::from_value(args).map_err(|e| e.to_string())?;
    let mut message = BoardMessage::new(
        state.node_id.clone(),
        params.agent_name,
        params.topic,
        params.body,
    );
    message.lamport_ts = state.clock.tick();
    state
        .replicator
        .apply_board(&message)
        .await
        .map_err(|e| e.to_string())?;
    state
        .gossip
        .publish(Message::BoardPost(BoardPost {
            message_id: Uuid::new_v4(),
            message: message.clone(),
        }))
        .await;
    Ok(json!({ "message_id": message.id }))
}
