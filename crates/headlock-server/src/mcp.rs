//! MCP tools exposing the agent side of the coordinator

use std::sync::Arc;

use async_trait::async_trait;
use axum::Json;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use headlock_core::{ContinueRequest, Coordinator, EnterRequest, WaitOutcome};
use headlock_mcp::protocol::{JsonRpcError, JsonRpcResponse};
use headlock_mcp::{McpHandler, McpTool};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::state::{AppState, wait_options};

pub const ENTER_TOOL: &str = "headlock-enter_headlock";
pub const CONTINUE_TOOL: &str = "headlock-continue_headlock";

/// Returned on `initialize` so agents know to loop
pub const INSTRUCTIONS: &str = "\
Headlock hands control of your work to a human operator. It is a loop:

1. Call `headlock-enter_headlock` (optionally with `context`). The call blocks until the operator sends the first instruction.
2. Carry out the instruction you receive.
3. Call `headlock-continue_headlock` with the `session_id` from step 1 and a `context` summarizing what you did. It blocks until the next instruction.
4. Repeat steps 2 and 3 until a result has `should_terminate: true`, then stop.";

/// Tool handler backed by the coordinator
pub struct HeadlockTools {
    coordinator: Arc<Coordinator>,
    shutdown: CancellationToken,
}

impl HeadlockTools {
    pub fn new(coordinator: Arc<Coordinator>, shutdown: CancellationToken) -> Self {
        Self {
            coordinator,
            shutdown,
        }
    }

    async fn enter(&self, arguments: Value) -> Result<WaitOutcome, String> {
        let request: EnterRequest = parse_arguments(arguments)?;
        self.coordinator
            .enter(
                request.session_id,
                request.context,
                wait_options(&self.shutdown, None),
            )
            .await
            .map_err(|e| e.to_string())
    }

    async fn continue_session(&self, arguments: Value) -> Result<WaitOutcome, String> {
        let request: ContinueRequest = parse_arguments(arguments)?;
        self.coordinator
            .continue_session(
                &request.session_id,
                request.context,
                wait_options(&self.shutdown, None),
            )
            .await
            .map_err(|e| e.to_string())
    }
}

fn parse_arguments<T: serde::de::DeserializeOwned>(arguments: Value) -> Result<T, String> {
    // Clients send `{}` or nothing at all for argument-less calls
    let arguments = if arguments.is_null() { json!({}) } else { arguments };
    serde_json::from_value(arguments).map_err(|e| format!("Invalid arguments: {}", e))
}

#[async_trait]
impl McpHandler for HeadlockTools {
    async fn list_tools(&self) -> Vec<McpTool> {
        vec![
            McpTool::new(
                ENTER_TOOL,
                "Enter headlock mode and block until the operator sends the first instruction. \
                 Returns { session_id, instruction, should_terminate }. Afterwards loop on \
                 headlock-continue_headlock until should_terminate is true.",
                json!({
                    "type": "object",
                    "properties": {
                        "session_id": {
                            "type": "string",
                            "description": "Session to enter; a new id is generated when omitted"
                        },
                        "context": {
                            "type": "string",
                            "description": "What you are ready to do"
                        }
                    },
                    "required": []
                }),
            ),
            McpTool::new(
                CONTINUE_TOOL,
                "Report the result of the last instruction and block until the next one. \
                 Keep calling this until should_terminate is true.",
                json!({
                    "type": "object",
                    "properties": {
                        "session_id": {
                            "type": "string",
                            "description": "Session id returned by headlock-enter_headlock"
                        },
                        "context": {
                            "type": "string",
                            "description": "Summary of the completed instruction"
                        }
                    },
                    "required": ["session_id"]
                }),
            ),
        ]
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, String> {
        let outcome = match name {
            ENTER_TOOL => self.enter(arguments).await?,
            CONTINUE_TOOL => self.continue_session(arguments).await?,
            other => return Err(format!("Unknown tool: {}", other)),
        };

        let reply = outcome.into_result().map_err(|e| e.to_string())?;
        serde_json::to_value(reply).map_err(|e| e.to_string())
    }
}

/// POST /mcp - one JSON-RPC message per request
pub async fn handle(State(state): State<AppState>, body: Bytes) -> Response {
    let message: Value = match serde_json::from_slice(&body) {
        Ok(message) => message,
        Err(e) => {
            debug!(error = %e, "Unparseable MCP body");
            let response = JsonRpcResponse::error(None, JsonRpcError::parse_error());
            return (StatusCode::BAD_REQUEST, Json(response)).into_response();
        }
    };

    match state.mcp.handle_message(message).await {
        Some(response) => Json(response).into_response(),
        None => StatusCode::ACCEPTED.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use headlock_core::{Scope, SessionEventKind};

    fn tools() -> (Arc<Coordinator>, Arc<HeadlockTools>) {
        let coordinator = Arc::new(Coordinator::default());
        let tools = Arc::new(HeadlockTools::new(
            coordinator.clone(),
            CancellationToken::new(),
        ));
        (coordinator, tools)
    }

    #[tokio::test]
    async fn test_lists_both_tools() {
        let (_, tools) = tools();
        let names: Vec<_> = tools.list_tools().await.into_iter().map(|t| t.name).collect();
        assert_eq!(names, vec![ENTER_TOOL, CONTINUE_TOOL]);
    }

    #[tokio::test]
    async fn test_enter_tool_round_trip() {
        let (coordinator, tools) = tools();
        let mut events = coordinator.subscribe(Scope::Session("m1".to_string()));

        let agent = {
            let tools = tools.clone();
            tokio::spawn(async move {
                tools
                    .call_tool(ENTER_TOOL, json!({"session_id": "m1", "context": "hi"}))
                    .await
            })
        };

        let entered = events.recv().await.unwrap();
        assert_eq!(entered.kind, SessionEventKind::Entered);
        coordinator.instruct("m1", "list files").unwrap();

        let result = agent.await.unwrap().unwrap();
        assert_eq!(result["session_id"], "m1");
        assert_eq!(result["instruction"], "list files");
        assert_eq!(result["should_terminate"], false);
    }

    #[tokio::test]
    async fn test_continue_requires_session_id() {
        let (_, tools) = tools();
        let err = tools
            .call_tool(CONTINUE_TOOL, json!({"context": "done"}))
            .await
            .unwrap_err();
        assert!(err.starts_with("Invalid arguments"));
    }

    #[tokio::test]
    async fn test_unknown_fields_rejected() {
        let (_, tools) = tools();
        let err = tools
            .call_tool(ENTER_TOOL, json!({"sessionId": "x"}))
            .await
            .unwrap_err();
        assert!(err.contains("sessionId"));
    }

    #[tokio::test]
    async fn test_unknown_tool() {
        let (_, tools) = tools();
        let err = tools.call_tool("other", json!({})).await.unwrap_err();
        assert_eq!(err, "Unknown tool: other");
    }
}
