//! Shared application state for the server.

use std::sync::Arc;
use std::time::Duration;

use headlock_core::{Coordinator, SessionSummary, WaitOptions};
use headlock_mcp::McpServer;
use tokio_util::sync::CancellationToken;

use crate::mcp::{HeadlockTools, INSTRUCTIONS};

/// Shared state accessible from all request handlers.
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<Coordinator>,
    pub mcp: Arc<McpServer<HeadlockTools>>,
    /// Cancelled on shutdown; releases every held-open agent request
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(coordinator: Arc<Coordinator>, shutdown: CancellationToken) -> Self {
        let tools = Arc::new(HeadlockTools::new(coordinator.clone(), shutdown.clone()));
        let mcp = McpServer::new(tools)
            .with_name("headlock")
            .with_instructions(INSTRUCTIONS);

        Self {
            coordinator,
            mcp: Arc::new(mcp),
            shutdown,
        }
    }

    /// Wait settings for an agent request
    pub fn wait_options(&self, timeout_secs: Option<u64>) -> WaitOptions {
        wait_options(&self.shutdown, timeout_secs)
    }

    /// Deliver an instruction and report the session as it now stands
    pub fn instruct(&self, session_id: &str, instruction: String) -> headlock_core::Result<SessionSummary> {
        let prior = self.coordinator.instruct(session_id, instruction)?;
        Ok(self.current_or(session_id, prior))
    }

    // Removed right after delivery; report what we delivered to
    fn current_or(&self, session_id: &str, fallback: SessionSummary) -> SessionSummary {
        self.coordinator.get_session(session_id).unwrap_or(fallback)
    }
}

pub(crate) fn wait_options(shutdown: &CancellationToken, timeout_secs: Option<u64>) -> WaitOptions {
    let options = WaitOptions::new().with_cancel(shutdown.child_token());
    match timeout_secs {
        Some(secs) => options.with_timeout(Duration::from_secs(secs)),
        None => options,
    }
}
