// Incremental build orchestration and virtual file synchronization.
// Pure, synchronous state: no I/O happens below this module.

pub mod consumer;
pub mod events;
pub mod files;
pub mod preview;
pub mod protocol;
pub mod session;
pub mod tasks;
