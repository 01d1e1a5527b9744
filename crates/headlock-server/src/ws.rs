//! WebSocket feeds for controllers
//!
//! `/ws` streams every session, `/ws/{session_id}` a single one. Both accept
//! `instruct` and `tap_out` commands from the client.

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use headlock_core::{Scope, SessionEvent, SessionFilter, SessionId, SessionSummary};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::state::AppState;

/// Messages sent to the client
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    InitialState {
        sessions: Vec<SessionSummary>,
    },
    SessionState {
        session_id: SessionId,
        session: Option<SessionSummary>,
    },
    SessionUpdate {
        event: SessionEvent,
    },
    Ack {
        message: &'static str,
        session: SessionSummary,
    },
    Error {
        code: String,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<SessionId>,
    },
}

/// Commands accepted from the client
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Instruct {
        session_id: Option<SessionId>,
        instruction: String,
    },
    TapOut {
        session_id: Option<SessionId>,
    },
}

/// GET /ws
pub async fn global_socket(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, Scope::Global))
}

/// GET /ws/{session_id}
pub async fn session_socket(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, Scope::Session(session_id)))
}

async fn handle_socket(socket: WebSocket, state: AppState, scope: Scope) {
    info!(scope = ?scope, "WebSocket connected");

    // Subscribe before the snapshot so nothing falls between the two
    let mut events = state.coordinator.subscribe(scope.clone());
    let (mut ws_tx, mut ws_rx) = socket.split();

    if send(&mut ws_tx, &snapshot(&state, &scope)).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                if send(&mut ws_tx, &ServerMessage::SessionUpdate { event }).await.is_err() {
                    debug!("WebSocket send failed, client disconnected");
                    break;
                }
            }
            incoming = ws_rx.next() => {
                let text = match incoming {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket error");
                        break;
                    }
                };

                let reply = handle_client_message(&state, &scope, text.as_str());
                if send(&mut ws_tx, &reply).await.is_err() {
                    break;
                }
            }
            _ = state.shutdown.cancelled() => break,
        }
    }

    info!(scope = ?scope, "WebSocket closed");
}

fn snapshot(state: &AppState, scope: &Scope) -> ServerMessage {
    match scope {
        Scope::Global => ServerMessage::InitialState {
            sessions: state.coordinator.list_sessions(SessionFilter::all()).to_vec(),
        },
        Scope::Session(id) => ServerMessage::SessionState {
            session_id: id.clone(),
            session: state.coordinator.get_session(id).ok(),
        },
    }
}

/// Apply one client command and build the reply
pub(crate) fn handle_client_message(state: &AppState, scope: &Scope, text: &str) -> ServerMessage {
    let message: ClientMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(e) => {
            warn!(error = %e, "Failed to parse client message");
            return ServerMessage::Error {
                code: "parse_error".to_string(),
                message: e.to_string(),
                session_id: None,
            };
        }
    };

    let (session_id, result) = match message {
        ClientMessage::Instruct {
            session_id,
            instruction,
        } => {
            let Some(id) = target(scope, session_id) else {
                return missing_session_id();
            };
            let result = state
                .instruct(&id, instruction)
                .map(|session| ("Instruction sent", session));
            (id, result)
        }
        ClientMessage::TapOut { session_id } => {
            let Some(id) = target(scope, session_id) else {
                return missing_session_id();
            };
            let result = state
                .coordinator
                .tap_out(&id)
                .map(|session| ("Tap out signal sent", session));
            (id, result)
        }
    };

    match result {
        Ok((message, session)) => ServerMessage::Ack { message, session },
        Err(e) => ServerMessage::Error {
            code: e.code().to_string(),
            message: e.to_string(),
            session_id: Some(session_id),
        },
    }
}

/// Explicit id wins; a per-session socket falls back to its own session
fn target(scope: &Scope, session_id: Option<SessionId>) -> Option<SessionId> {
    match scope {
        Scope::Session(own) => Some(session_id.unwrap_or_else(|| own.clone())),
        Scope::Global => session_id,
    }
}

fn missing_session_id() -> ServerMessage {
    ServerMessage::Error {
        code: "bad_request".to_string(),
        message: "session_id is required on the global socket".to_string(),
        session_id: None,
    }
}

async fn send(ws_tx: &mut SplitSink<WebSocket, Message>, message: &ServerMessage) -> Result<(), ()> {
    let json = match serde_json::to_string(message) {
        Ok(json) => json,
        Err(e) => {
            warn!(error = %e, "Failed to serialize message");
            return Ok(());
        }
    };
    ws_tx.send(Message::Text(json.into())).await.map_err(|_| ())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use headlock_core::{Coordinator, SessionEventKind, SessionState, WaitOptions};
    use tokio_util::sync::CancellationToken;

    fn state() -> AppState {
        AppState::new(Arc::new(Coordinator::default()), CancellationToken::new())
    }

    #[test]
    fn test_snapshot_of_unknown_session() {
        let state = state();
        let message = snapshot(&state, &Scope::Session("none".to_string()));
        let value = serde_json::to_value(&message).unwrap();

        assert_eq!(value["type"], "session_state");
        assert_eq!(value["session_id"], "none");
        assert!(value["session"].is_null());
    }

    #[test]
    fn test_global_socket_needs_session_id() {
        let state = state();
        let reply = handle_client_message(&state, &Scope::Global, r#"{"type": "tap_out"}"#);
        assert!(matches!(reply, ServerMessage::Error { ref code, .. } if code == "bad_request"));
    }

    #[test]
    fn test_malformed_command() {
        let state = state();
        let reply = handle_client_message(&state, &Scope::Global, "not json");
        assert!(matches!(reply, ServerMessage::Error { ref code, .. } if code == "parse_error"));
    }

    #[tokio::test]
    async fn test_instruct_over_session_socket() {
        let state = state();
        let coordinator = state.coordinator.clone();
        let mut events = coordinator.subscribe(Scope::Session("w1".to_string()));

        let agent = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                coordinator
                    .enter(Some("w1".to_string()), None, WaitOptions::new())
                    .await
            })
        };
        assert_eq!(events.recv().await.unwrap().kind, SessionEventKind::Entered);

        let scope = Scope::Session("w1".to_string());
        let reply = handle_client_message(
            &state,
            &scope,
            r#"{"type": "instruct", "instruction": "deploy"}"#,
        );
        match reply {
            ServerMessage::Ack { session, .. } => assert_eq!(session.state, SessionState::Processing),
            other => panic!("unexpected reply: {:?}", other),
        }

        let reply = agent.await.unwrap().unwrap().into_result().unwrap();
        assert_eq!(reply.instruction.as_deref(), Some("deploy"));

        // Nobody is waiting any more
        let reply = handle_client_message(
            &state,
            &scope,
            r#"{"type": "instruct", "instruction": "again"}"#,
        );
        assert!(matches!(reply, ServerMessage::Error { ref code, .. } if code == "not_waiting"));
    }
}
