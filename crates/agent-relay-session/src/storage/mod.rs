//! Event log storage backends.

pub mod file;
pub mod memory;

pub use file::FileEventLog;
pub use memory::MemoryEventLog;
