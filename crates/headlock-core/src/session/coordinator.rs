//! Coordinator: the operations agents and controllers call
//!
//! Agent side: [`Coordinator::enter`], [`Coordinator::continue_session`] and
//! [`Coordinator::reattach`] arm the session's rendezvous slot and suspend
//! until it is fulfilled, times out or is cancelled.
//!
//! Controller side: [`Coordinator::instruct`] and [`Coordinator::tap_out`]
//! fulfil the slot and return immediately.
//!
//! Locking: registry → session → broadcaster. Events are published while the
//! session lock is held so each session's events leave in transition order.
//! No lock is held across an await.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot::error::RecvError;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::events::{EventBroadcaster, Scope, SessionEvent, SessionEventKind, Subscription};
use super::registry::{SessionHandle, SessionList, SessionRegistry};
use super::slot::{Delivery, WaitHandle};
use super::types::{
    AgentReply, Session, SessionFilter, SessionId, SessionState, SessionSummary, WaitOptions,
    WaitOutcome,
};
use crate::error::{Error, Result};

/// Constructor parameters for a [`Coordinator`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorConfig {
    /// Applied when a call does not set its own timeout; `None` waits forever
    pub default_wait_timeout: Option<Duration>,
    /// Upper bound on registered sessions
    pub max_sessions: Option<usize>,
    /// Buffer size of each event channel
    pub event_capacity: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            default_wait_timeout: None,
            max_sessions: None,
            event_capacity: super::events::DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl CoordinatorConfig {
    pub fn with_default_wait_timeout(mut self, timeout: Duration) -> Self {
        self.default_wait_timeout = Some(timeout);
        self
    }

    pub fn with_max_sessions(mut self, max: usize) -> Self {
        self.max_sessions = Some(max);
        self
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }
}

/// Session counts by state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStats {
    pub total: usize,
    pub waiting: usize,
    pub processing: usize,
    pub completed: usize,
    pub terminated: usize,
}

/// Facade composing the registry, rendezvous slots and event broadcaster
pub struct Coordinator {
    registry: SessionRegistry,
    events: EventBroadcaster,
    config: CoordinatorConfig,
}

impl Coordinator {
    pub fn new(config: CoordinatorConfig) -> Self {
        Self {
            registry: SessionRegistry::new(config.max_sessions),
            events: EventBroadcaster::new(config.event_capacity),
            config,
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Observe state changes for `scope`
    pub fn subscribe(&self, scope: Scope) -> Subscription {
        self.events.subscribe(scope)
    }

    // ------------------------------------------------------------------
    // Agent side
    // ------------------------------------------------------------------

    /// Enter headlock and wait for the first instruction.
    ///
    /// An omitted or empty `session_id` gets a fresh UUID. A finished session
    /// with the same id is replaced by a new one; a live one is rejected.
    pub async fn enter(
        &self,
        session_id: Option<SessionId>,
        context: Option<String>,
        options: WaitOptions,
    ) -> Result<WaitOutcome> {
        let id = session_id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let (cell, wait) = loop {
            match self.arm_for_entry(&id, context.clone()) {
                // Removed between lookup and lock; the next pass creates a new entry
                Err(Error::NotFound(_)) => continue,
                result => break result?,
            }
        };
        Ok(self.wait(cell, wait, options).await)
    }

    fn arm_for_entry(&self, id: &str, context: Option<String>) -> Result<(SessionHandle, WaitHandle)> {
        let (mut cell, created) = self.registry.get_or_create(id)?;

        if !created && cell.lock().state().is_terminal() {
            cell = match self.registry.replace_finished(id) {
                Ok((fresh, _)) => fresh,
                // Evicted in between; start over with a new entry
                Err(Error::NotFound(_)) => self.registry.get_or_create(id)?.0,
                Err(e) => return Err(e),
            };
        }

        let mut session = cell.lock();
        session.ensure_registered()?;
        if !session.is_pristine() {
            return Err(if session.is_armed() {
                Error::AlreadyWaiting(id.to_string())
            } else if session.state().is_terminal() {
                session.invalid("enter")
            } else {
                Error::AlreadyActive(id.to_string())
            });
        }

        session.record_context(context);
        let wait = self.arm(&mut session, SessionEventKind::Entered, "enter")?;
        info!(session_id = %id, "Agent entered headlock");
        drop(session);

        Ok((cell, wait))
    }

    /// Report a finished task and wait for the next instruction.
    ///
    /// Also re-arms a `WAITING` session whose previous wait timed out or was
    /// cancelled.
    pub async fn continue_session(
        &self,
        session_id: &str,
        context: Option<String>,
        options: WaitOptions,
    ) -> Result<WaitOutcome> {
        let cell = self.registry.get(session_id)?;
        let wait = self.arm_for_continue(&cell, context)?;
        Ok(self.wait(cell, wait, options).await)
    }

    fn arm_for_continue(&self, cell: &SessionHandle, context: Option<String>) -> Result<WaitHandle> {
        let mut session = cell.lock();
        session.ensure_registered()?;
        match session.state() {
            SessionState::Processing => {}
            SessionState::Waiting if session.is_armed() => {
                return Err(Error::AlreadyWaiting(cell.id().to_string()));
            }
            SessionState::Waiting => {
                debug!(session_id = %cell.id(), "Re-arming idle waiting session");
            }
            SessionState::Completed | SessionState::Terminated => {
                return Err(session.invalid("continue"));
            }
        }

        session.record_context(context);
        self.arm(&mut session, SessionEventKind::Continued, "continue")
    }

    /// Re-attach to a `WAITING` session after a timeout or disconnect
    pub async fn reattach(&self, session_id: &str, options: WaitOptions) -> Result<WaitOutcome> {
        let cell = self.registry.get(session_id)?;
        let wait = self.arm_for_reattach(&cell)?;
        Ok(self.wait(cell, wait, options).await)
    }

    fn arm_for_reattach(&self, cell: &SessionHandle) -> Result<WaitHandle> {
        let mut session = cell.lock();
        session.ensure_registered()?;
        if session.state() != SessionState::Waiting {
            return Err(session.invalid("reattach"));
        }
        if session.is_armed() {
            return Err(Error::AlreadyWaiting(cell.id().to_string()));
        }
        self.arm(&mut session, SessionEventKind::Reattached, "reattach")
    }

    fn arm(
        &self,
        session: &mut Session,
        kind: SessionEventKind,
        operation: &'static str,
    ) -> Result<WaitHandle> {
        let wait = session
            .slot_mut()
            .arm()
            .map_err(|_| Error::AlreadyWaiting(session.id().to_string()))?;
        session.transition(SessionState::Waiting, operation)?;
        self.publish(session, kind);
        Ok(wait)
    }

    async fn wait(&self, cell: SessionHandle, mut handle: WaitHandle, options: WaitOptions) -> WaitOutcome {
        let session_id = cell.id().to_string();
        let generation = handle.generation();
        let timeout = options.timeout.or(self.config.default_wait_timeout);
        let cancel = options.cancel.unwrap_or_default();

        let mut guard = DisarmGuard {
            cell: cell.clone(),
            generation,
            armed: true,
        };

        let woken = tokio::select! {
            biased;
            result = handle.receiver() => Woken::Delivered(result),
            _ = cancel.cancelled() => Woken::Cancelled,
            _ = expire(timeout) => Woken::TimedOut,
        };
        guard.armed = false;
        let timed_out = matches!(woken, Woken::TimedOut);

        match woken {
            Woken::Delivered(Ok(delivery)) => {
                debug!(session_id = %session_id, generation, "Delivered to agent");
                WaitOutcome::Delivered(AgentReply::new(session_id, delivery))
            }
            Woken::Delivered(Err(_)) => {
                debug!(session_id = %session_id, generation, "Slot closed under waiter");
                WaitOutcome::Cancelled { session_id }
            }
            Woken::TimedOut | Woken::Cancelled => {
                let disarmed = cell.lock().slot_mut().disarm(generation);
                if !disarmed {
                    // A fulfil landed between wake-up and disarm; hand it over
                    if let Ok(delivery) = handle.receiver().try_recv() {
                        return WaitOutcome::Delivered(AgentReply::new(session_id, delivery));
                    }
                }

                if timed_out {
                    info!(session_id = %session_id, generation, "Agent wait timed out");
                    WaitOutcome::TimedOut { session_id }
                } else {
                    info!(session_id = %session_id, generation, "Agent wait cancelled");
                    WaitOutcome::Cancelled { session_id }
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Controller side
    // ------------------------------------------------------------------

    /// Deliver an instruction to the waiting agent.
    ///
    /// Returns the session as it was before the instruction.
    pub fn instruct(&self, session_id: &str, instruction: impl Into<String>) -> Result<SessionSummary> {
        let cell = self.registry.get(session_id)?;
        let mut session = cell.lock();
        self.deliver(&mut session, instruction.into())
    }

    fn deliver(&self, session: &mut Session, instruction: String) -> Result<SessionSummary> {
        session.ensure_registered()?;
        if session.state().is_terminal() {
            return Err(session.invalid("instruct"));
        }
        if session.state() != SessionState::Waiting {
            return Err(Error::NotWaiting(session.id().to_string()));
        }

        let prior = session.summary();
        session
            .slot_mut()
            .fulfil(Delivery::instruction(instruction.clone()))
            .map_err(|_| Error::NotWaiting(session.id().to_string()))?;

        session.record_instruction(instruction);
        session.transition(SessionState::Processing, "instruct")?;
        self.publish(session, SessionEventKind::Instructed);
        info!(session_id = %session.id(), "Instruction delivered");

        Ok(prior)
    }

    /// Terminate the session, releasing a waiting agent with `should_terminate`
    pub fn tap_out(&self, session_id: &str) -> Result<SessionSummary> {
        let cell = self.registry.get(session_id)?;
        let mut session = cell.lock();
        session.ensure_registered()?;

        if session.state().is_terminal() {
            return Err(session.invalid("tap out"));
        }

        let released = session.slot_mut().fulfil(Delivery::terminate()).is_ok();
        session.mark_terminate();
        session.transition(SessionState::Terminated, "tap out")?;
        self.publish(&session, SessionEventKind::TappedOut);
        info!(session_id = %session_id, released, "Session tapped out");

        Ok(session.summary())
    }

    // ------------------------------------------------------------------
    // Administration
    // ------------------------------------------------------------------

    /// Close the session as completed
    pub fn complete(&self, session_id: &str) -> Result<SessionSummary> {
        let cell = self.registry.get(session_id)?;
        let mut session = cell.lock();
        session.ensure_registered()?;

        if session.state().is_terminal() {
            return Err(session.invalid("complete"));
        }

        let released = session.slot_mut().fulfil(Delivery::terminate()).is_ok();
        session.transition(SessionState::Completed, "complete")?;
        self.publish(&session, SessionEventKind::Completed);
        info!(session_id = %session_id, released, "Session completed");

        Ok(session.summary())
    }

    /// Evict a session; a suspended agent observes `Cancelled`
    pub fn remove(&self, session_id: &str) -> Result<SessionSummary> {
        let cell = self.registry.remove(session_id)?;
        let mut session = cell.lock();
        session.evict();

        let summary = session.summary();
        self.publish_removed(summary.clone());
        info!(session_id = %session_id, "Session removed");
        Ok(summary)
    }

    /// Tap out sessions that have sat in `PROCESSING` longer than `max_age`
    pub fn expire_processing(&self, max_age: Duration) -> Vec<SessionId> {
        let Some(cutoff) = cutoff(max_age) else {
            return Vec::new();
        };

        let mut expired = Vec::new();
        for cell in self.registry.list(SessionFilter::all()).handles() {
            let mut session = cell.lock();
            if session.is_evicted()
                || session.state() != SessionState::Processing
                || session.updated_at() >= cutoff
            {
                continue;
            }

            session.mark_terminate();
            if session.transition(SessionState::Terminated, "expire").is_ok() {
                self.publish(&session, SessionEventKind::Expired);
                warn!(session_id = %cell.id(), "Processing timeout, session terminated");
                expired.push(cell.id().to_string());
            }
        }
        expired
    }

    /// Drop finished sessions last updated more than `retention` ago
    pub fn evict_finished(&self, retention: Duration) -> Vec<SessionId> {
        let Some(cutoff) = cutoff(retention) else {
            return Vec::new();
        };

        let stale: Vec<(SessionHandle, SessionSummary)> = self
            .registry
            .list(SessionFilter::all())
            .handles()
            .iter()
            .filter_map(|cell| {
                let session = cell.lock();
                (session.state().is_terminal() && session.updated_at() < cutoff)
                    .then(|| (cell.clone(), session.summary()))
            })
            .collect();

        let mut evicted = Vec::new();
        for (cell, summary) in stale {
            if self.registry.remove_exact(cell.id(), &cell) {
                cell.lock().evict();
                info!(session_id = %cell.id(), "Evicted finished session");
                self.publish_removed(summary);
                evicted.push(cell.id().to_string());
            }
        }
        evicted
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn get_session(&self, session_id: &str) -> Result<SessionSummary> {
        Ok(self.registry.get(session_id)?.summary())
    }

    pub fn list_sessions(&self, filter: SessionFilter) -> SessionList {
        self.registry.list(filter)
    }

    pub fn stats(&self) -> SessionStats {
        let mut stats = SessionStats::default();
        for summary in self.registry.list(SessionFilter::all()).iter() {
            stats.total += 1;
            match summary.state {
                SessionState::Waiting => stats.waiting += 1,
                SessionState::Processing => stats.processing += 1,
                SessionState::Completed => stats.completed += 1,
                SessionState::Terminated => stats.terminated += 1,
            }
        }
        stats
    }

    fn publish(&self, session: &Session, kind: SessionEventKind) {
        self.events.publish(SessionEvent::new(kind, session.summary()));
    }

    fn publish_removed(&self, summary: SessionSummary) {
        let mut event = SessionEvent::new(SessionEventKind::Removed, summary);
        event.timestamp = event.timestamp.max(Utc::now());
        self.events.publish(event);
    }
}

impl Default for Coordinator {
    fn default() -> Self {
        Self::new(CoordinatorConfig::default())
    }
}

enum Woken {
    Delivered(std::result::Result<Delivery, RecvError>),
    TimedOut,
    Cancelled,
}

/// Disarms the slot if the waiting future is dropped mid-wait
struct DisarmGuard {
    cell: SessionHandle,
    generation: u64,
    armed: bool,
}

impl Drop for DisarmGuard {
    fn drop(&mut self) {
        if self.armed && self.cell.lock().slot_mut().disarm(self.generation) {
            debug!(session_id = %self.cell.id(), generation = self.generation, "Waiter dropped, slot disarmed");
        }
    }
}

async fn expire(timeout: Option<Duration>) {
    match timeout {
        Some(duration) => tokio::time::sleep(duration).await,
        None => std::future::pending().await,
    }
}

fn cutoff(age: Duration) -> Option<DateTime<Utc>> {
    let age = chrono::Duration::from_std(age).ok()?;
    Utc::now().checked_sub_signed(age)
}
