//! Session types for the agent/controller rendezvous
//!
//! These types define the session entity, its state machine and the wire
//! payloads shared by every transport (HTTP, WebSocket, MCP).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::slot::{Delivery, RendezvousSlot};
use crate::error::{Error, Result};

/// Unique identifier for a session
pub type SessionId = String;

/// Lifecycle state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SessionState {
    /// Agent is waiting for an instruction
    Waiting,
    /// Agent is carrying out an instruction
    Processing,
    /// Session was closed administratively
    Completed,
    /// Controller tapped out
    Terminated,
}

impl SessionState {
    /// Terminal states accept no further instructions or waits
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Completed | SessionState::Terminated)
    }

    /// Whether the state machine permits moving from `self` to `to`
    pub fn can_transition_to(self, to: SessionState) -> bool {
        use SessionState::{Completed, Processing, Terminated, Waiting};
        match (self, to) {
            (Completed | Terminated, _) => false,
            (Waiting, Waiting | Processing | Terminated | Completed) => true,
            (Processing, Waiting | Terminated | Completed) => true,
            (Processing, Processing) => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Waiting => "WAITING",
            SessionState::Processing => "PROCESSING",
            SessionState::Completed => "COMPLETED",
            SessionState::Terminated => "TERMINATED",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SessionState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "WAITING" => Ok(SessionState::Waiting),
            "PROCESSING" => Ok(SessionState::Processing),
            "COMPLETED" => Ok(SessionState::Completed),
            "TERMINATED" => Ok(SessionState::Terminated),
            other => Err(Error::Config(format!("Unknown session state: {}", other))),
        }
    }
}

/// One coordination cycle between an agent and a controller.
///
/// Fields are only mutated through the coordinator, under the session lock.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    state: SessionState,
    last_context: Option<String>,
    last_instruction: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    should_terminate: bool,
    evicted: bool,
    slot: RendezvousSlot,
}

impl Session {
    /// A freshly entered session, not yet armed
    pub fn new(id: impl Into<SessionId>, context: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            state: SessionState::Waiting,
            last_context: context,
            last_instruction: None,
            created_at: now,
            updated_at: now,
            should_terminate: false,
            evicted: false,
            slot: RendezvousSlot::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn last_context(&self) -> Option<&str> {
        self.last_context.as_deref()
    }

    pub fn last_instruction(&self) -> Option<&str> {
        self.last_instruction.as_deref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn should_terminate(&self) -> bool {
        self.should_terminate
    }

    pub fn waiter_generation(&self) -> u64 {
        self.slot.generation()
    }

    /// Whether an agent is currently suspended on this session
    pub fn is_armed(&self) -> bool {
        self.slot.is_armed()
    }

    /// True until the first wait has been armed
    pub(crate) fn is_pristine(&self) -> bool {
        self.state == SessionState::Waiting && self.slot.generation() == 0
    }

    /// Owned, read-only snapshot
    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id.clone(),
            state: self.state,
            last_context: self.last_context.clone(),
            last_instruction: self.last_instruction.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }

    /// Move to `to`, enforcing the transition table
    pub(crate) fn transition(&mut self, to: SessionState, operation: &'static str) -> Result<()> {
        if !self.state.can_transition_to(to) {
            return Err(self.invalid(operation));
        }
        self.state = to;
        self.touch();
        Ok(())
    }

    pub(crate) fn invalid(&self, operation: &'static str) -> Error {
        Error::InvalidTransition {
            session_id: self.id.clone(),
            state: self.state,
            operation,
        }
    }

    pub(crate) fn record_context(&mut self, context: Option<String>) {
        if context.is_some() {
            self.last_context = context;
            self.touch();
        }
    }

    pub(crate) fn record_instruction(&mut self, instruction: String) {
        self.last_instruction = Some(instruction);
        self.touch();
    }

    pub(crate) fn mark_terminate(&mut self) {
        self.should_terminate = true;
    }

    /// Whether the session has been taken out of the registry
    pub fn is_evicted(&self) -> bool {
        self.evicted
    }

    /// Fails with `NotFound` once the session has left the registry
    pub(crate) fn ensure_registered(&self) -> Result<()> {
        if self.evicted {
            return Err(Error::NotFound(self.id.clone()));
        }
        Ok(())
    }

    /// Detach from the registry and cancel any waiter
    pub(crate) fn evict(&mut self) {
        self.evicted = true;
        self.slot.close();
    }

    pub(crate) fn slot_mut(&mut self) -> &mut RendezvousSlot {
        &mut self.slot
    }

    // Timestamps never move backwards, even if the wall clock does
    fn touch(&mut self) {
        let now = Utc::now();
        if now > self.updated_at {
            self.updated_at = now;
        }
    }
}

/// Read-only session payload for queries and events
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionSummary {
    pub id: SessionId,
    pub state: SessionState,
    pub last_context: Option<String>,
    pub last_instruction: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Result handed back to the agent by `enter`/`continue`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentReply {
    pub session_id: SessionId,
    pub instruction: Option<String>,
    pub should_terminate: bool,
}

impl AgentReply {
    pub fn new(session_id: impl Into<SessionId>, delivery: Delivery) -> Self {
        Self {
            session_id: session_id.into(),
            instruction: delivery.instruction,
            should_terminate: delivery.should_terminate,
        }
    }
}

/// How a suspended `enter`/`continue` call ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome {
    Delivered(AgentReply),
    TimedOut { session_id: SessionId },
    Cancelled { session_id: SessionId },
}

impl WaitOutcome {
    pub fn session_id(&self) -> &str {
        match self {
            WaitOutcome::Delivered(reply) => &reply.session_id,
            WaitOutcome::TimedOut { session_id } | WaitOutcome::Cancelled { session_id } => {
                session_id
            }
        }
    }

    pub fn is_delivered(&self) -> bool {
        matches!(self, WaitOutcome::Delivered(_))
    }

    /// Fold timeouts and cancellations into the error taxonomy
    pub fn into_result(self) -> Result<AgentReply> {
        match self {
            WaitOutcome::Delivered(reply) => Ok(reply),
            WaitOutcome::TimedOut { session_id } => Err(Error::TimedOut(session_id)),
            WaitOutcome::Cancelled { session_id } => Err(Error::Cancelled(session_id)),
        }
    }
}

/// Per-call wait settings for `enter`/`continue`/`reattach`
#[derive(Debug, Clone, Default)]
pub struct WaitOptions {
    /// Overrides the coordinator default; `None` falls back to it
    pub timeout: Option<Duration>,
    /// Cancelled by the transport when the caller goes away
    pub cancel: Option<CancellationToken>,
}

impl WaitOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// Agent request to enter headlock
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EnterRequest {
    #[serde(default)]
    pub session_id: Option<SessionId>,
    #[serde(default)]
    pub context: Option<String>,
}

/// Agent request to report a result and wait again
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ContinueRequest {
    pub session_id: SessionId,
    #[serde(default)]
    pub context: Option<String>,
}

/// Agent request to re-attach to a waiting session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReattachRequest {
    pub session_id: SessionId,
}

/// Controller request carrying an instruction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InstructRequest {
    pub instruction: String,
}

/// Filter for session listings
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionFilter {
    pub state: Option<SessionState>,
}

impl SessionFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn state(state: SessionState) -> Self {
        Self { state: Some(state) }
    }

    pub fn waiting() -> Self {
        Self::state(SessionState::Waiting)
    }

    pub fn matches(&self, state: SessionState) -> bool {
        self.state.is_none_or(|wanted| wanted == state)
    }
}
