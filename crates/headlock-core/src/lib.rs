//! Headlock Core - Agent/controller session rendezvous
//!
//! This crate provides the core functionality for the Headlock server:
//! - Session state machine
//! - Single-slot rendezvous between a waiting agent and a controller
//! - Concurrent session registry
//! - Live event fanout to observers
//! - Configuration

pub mod config;
pub mod error;
pub mod session;

pub use config::{Config, ConfigManager, GeneralConfig, ServerConfig, SessionsConfig};
pub use error::{Error, Result};

pub use session::{
    AgentReply, ContinueRequest, Coordinator, CoordinatorConfig, Delivery, EnterRequest,
    InstructRequest, ReattachRequest, Scope, SessionEvent, SessionEventKind, SessionFilter,
    SessionId, SessionState, SessionStats, SessionSummary, Subscription, WaitOptions, WaitOutcome,
};
