//! Event broadcaster
//!
//! Fans session state changes out to observers, globally and per session.
//! Publishing never blocks: each scope is a bounded `tokio::sync::broadcast`
//! channel, so a slow subscriber lags and skips ahead instead of holding up
//! the coordinator.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::warn;

use super::types::{SessionId, SessionState, SessionSummary};

/// Default per-scope channel capacity
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Operation that produced an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionEventKind {
    Entered,
    Continued,
    Reattached,
    Instructed,
    TappedOut,
    Completed,
    Expired,
    Removed,
}

/// A state change, detached from the live session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionEvent {
    pub session_id: SessionId,
    pub kind: SessionEventKind,
    pub state: SessionState,
    pub timestamp: DateTime<Utc>,
    pub summary: SessionSummary,
}

impl SessionEvent {
    pub fn new(kind: SessionEventKind, summary: SessionSummary) -> Self {
        Self {
            session_id: summary.id.clone(),
            kind,
            state: summary.state,
            timestamp: summary.updated_at,
            summary,
        }
    }
}

/// Which events a subscription receives
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Scope {
    Global,
    Session(SessionId),
}

type SessionChannels = Arc<RwLock<HashMap<SessionId, broadcast::Sender<SessionEvent>>>>;

/// Global and per-session event fanout
pub struct EventBroadcaster {
    global: broadcast::Sender<SessionEvent>,
    sessions: SessionChannels,
    capacity: usize,
}

impl EventBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (global, _) = broadcast::channel(capacity);
        Self {
            global,
            sessions: Arc::new(RwLock::new(HashMap::new())),
            capacity,
        }
    }

    /// Deliver `event` to every subscriber of its scopes.
    ///
    /// Send errors only mean nobody is listening and are discarded.
    pub fn publish(&self, event: SessionEvent) {
        if let Some(tx) = self.sessions.read().get(&event.session_id) {
            let _ = tx.send(event.clone());
        }
        let _ = self.global.send(event);
    }

    /// Attach a new subscriber to `scope`
    pub fn subscribe(&self, scope: Scope) -> Subscription {
        let rx = match &scope {
            Scope::Global => self.global.subscribe(),
            Scope::Session(id) => {
                let mut sessions = self.sessions.write();
                sessions
                    .entry(id.clone())
                    .or_insert_with(|| broadcast::channel(self.capacity).0)
                    .subscribe()
            }
        };

        Subscription {
            scope,
            rx: Some(rx),
            sessions: Arc::clone(&self.sessions),
        }
    }

    /// Number of live subscribers for `scope`
    pub fn subscriber_count(&self, scope: &Scope) -> usize {
        match scope {
            Scope::Global => self.global.receiver_count(),
            Scope::Session(id) => self
                .sessions
                .read()
                .get(id)
                .map_or(0, |tx| tx.receiver_count()),
        }
    }
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

/// Receiving end of a subscription; unsubscribes on drop
pub struct Subscription {
    scope: Scope,
    rx: Option<broadcast::Receiver<SessionEvent>>,
    sessions: SessionChannels,
}

impl Subscription {
    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    /// Next event, or `None` once the broadcaster is gone.
    ///
    /// Events missed while lagging are skipped.
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        let rx = self.rx.as_mut()?;
        loop {
            match rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, scope = ?self.scope, "Subscriber lagged, events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking receive, for polling consumers
    pub fn try_recv(&mut self) -> Option<SessionEvent> {
        let rx = self.rx.as_mut()?;
        loop {
            match rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        // Release our receiver before checking whether the channel is unused
        drop(self.rx.take());

        if let Scope::Session(id) = &self.scope {
            let mut sessions = self.sessions.write();
            if sessions.get(id).is_some_and(|tx| tx.receiver_count() == 0) {
                sessions.remove(id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(id: &str, state: SessionState) -> SessionSummary {
        let now = Utc::now();
        SessionSummary {
            id: id.to_string(),
            state,
            last_context: None,
            last_instruction: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn event(id: &str, kind: SessionEventKind, state: SessionState) -> SessionEvent {
        SessionEvent::new(kind, summary(id, state))
    }

    #[test]
    fn test_publish_without_subscribers() {
        let broadcaster = EventBroadcaster::default();
        broadcaster.publish(event("s1", SessionEventKind::Entered, SessionState::Waiting));
    }

    #[tokio::test]
    async fn test_scoped_delivery() {
        let broadcaster = EventBroadcaster::default();
        let mut global = broadcaster.subscribe(Scope::Global);
        let mut s1 = broadcaster.subscribe(Scope::Session("s1".to_string()));

        broadcaster.publish(event("s2", SessionEventKind::Entered, SessionState::Waiting));
        broadcaster.publish(event("s1", SessionEventKind::Entered, SessionState::Waiting));

        assert_eq!(global.recv().await.unwrap().session_id, "s2");
        assert_eq!(global.recv().await.unwrap().session_id, "s1");

        let only = s1.recv().await.unwrap();
        assert_eq!(only.session_id, "s1");
        assert!(s1.try_recv().is_none());
    }

    #[test]
    fn test_events_arrive_in_order() {
        let broadcaster = EventBroadcaster::default();
        let mut sub = broadcaster.subscribe(Scope::Session("s1".to_string()));

        let kinds = [
            SessionEventKind::Entered,
            SessionEventKind::Instructed,
            SessionEventKind::Continued,
            SessionEventKind::TappedOut,
        ];
        for kind in kinds {
            broadcaster.publish(event("s1", kind, SessionState::Waiting));
        }

        let received: Vec<_> = std::iter::from_fn(|| sub.try_recv()).map(|e| e.kind).collect();
        assert_eq!(received, kinds);
    }

    #[test]
    fn test_drop_releases_session_channel() {
        let broadcaster = EventBroadcaster::default();
        let scope = Scope::Session("s1".to_string());

        let first = broadcaster.subscribe(scope.clone());
        let second = broadcaster.subscribe(scope.clone());
        assert_eq!(broadcaster.subscriber_count(&scope), 2);

        drop(first);
        assert_eq!(broadcaster.subscriber_count(&scope), 1);
        drop(second);
        assert_eq!(broadcaster.subscriber_count(&scope), 0);
        assert!(broadcaster.sessions.read().is_empty());
    }

    #[test]
    fn test_lagging_subscriber_does_not_block_publisher() {
        let broadcaster = EventBroadcaster::new(2);
        let mut sub = broadcaster.subscribe(Scope::Global);

        for _ in 0..10 {
            broadcaster.publish(event("s1", SessionEventKind::Entered, SessionState::Waiting));
        }

        // Only the newest events survive
        let received: Vec<_> = std::iter::from_fn(|| sub.try_recv()).collect();
        assert_eq!(received.len(), 2);
    }
}
