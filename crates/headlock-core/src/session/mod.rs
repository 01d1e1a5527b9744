//! Session module - agent/controller rendezvous
//!
//! Key components:
//!
//! - `Session`: the state machine for one coordination cycle
//! - `RendezvousSlot`: single-waiter handoff from controller to agent
//! - `SessionRegistry`: concurrent id → session map
//! - `EventBroadcaster`: live state-change fanout
//! - `Coordinator`: the facade every transport calls
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                        Coordinator                        │
//! │                                                           │
//! │  enter / continue ──▶ ┌─────────────────────────────┐     │
//! │  (agent, suspends)    │ SessionRegistry             │     │
//! │                       │  s1 -> Mutex<Session{slot}> │     │
//! │  instruct / tap_out ─▶│  s2 -> Mutex<Session{slot}> │     │
//! │  (controller)         └──────────────┬──────────────┘     │
//! │                                      ▼                    │
//! │                       EventBroadcaster (global, per id) ──────▶ subscribers
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example Usage
//!
//! ```ignore
//! use headlock_core::session::{Coordinator, CoordinatorConfig, WaitOptions};
//!
//! let coordinator = Arc::new(Coordinator::new(CoordinatorConfig::default()));
//!
//! // Agent: suspends until the controller answers
//! let outcome = coordinator
//!     .enter(Some("s1".into()), Some("ready".into()), WaitOptions::new())
//!     .await?;
//!
//! // Controller, from another task:
//! coordinator.instruct("s1", "run the tests")?;
//! ```

mod coordinator;
mod events;
mod registry;
mod slot;
mod types;

pub use coordinator::{Coordinator, CoordinatorConfig, SessionStats};
pub use events::{
    DEFAULT_EVENT_CAPACITY, EventBroadcaster, Scope, SessionEvent, SessionEventKind, Subscription,
};
pub use registry::{SessionCell, SessionHandle, SessionList, SessionRegistry};
pub use slot::{Delivery, RendezvousSlot, SlotError, WaitHandle};
pub use types::{
    AgentReply, ContinueRequest, EnterRequest, InstructRequest, ReattachRequest, Session,
    SessionFilter, SessionId, SessionState, SessionSummary, WaitOptions, WaitOutcome,
};
