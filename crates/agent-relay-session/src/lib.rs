//! Session orchestration for the execution relay.
//!
//! Provides:
//! - `SessionRegistry` - Session lifecycle and run serialization
//! - `SessionRelay` - Per-session ordering/durability/broadcast authority
//! - Storage backends implementing `EventLog` (memory, file)

pub mod registry;
pub mod relay;
pub mod storage;

pub use registry::{RegistryError, SessionRegistry};
pub use relay::{Attachment, RelayConfig, SessionRelay, Subscription};
