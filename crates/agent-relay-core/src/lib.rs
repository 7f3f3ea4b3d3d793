//! Data model and collaborator traits for the session execution relay.
//!
//! This crate provides the fundamental building blocks:
//! - `Event` / `EventKind` - One unit of run progress with its sequence number
//! - `Session` / `SessionStatus` - A task-execution context and its lifecycle
//! - `EventLog` - Trait for durable, ordered, append-only event storage
//! - `ExecutorBridge` - Trait for the external producer of progress events

pub mod event;
pub mod session;
pub mod traits;

pub use event::{ChatMessage, Event, EventKind, Role};
pub use session::{Session, SessionFilter, SessionStatus};
pub use traits::{BridgeError, EventLog, EventStream, ExecutorBridge, SessionId, StoreError};
