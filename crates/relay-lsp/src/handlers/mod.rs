//! Editor-protocol handlers.
//!
//! Handlers translate `tower-lsp` calls into relay events. They never touch
//! relay state directly.

mod commands;
mod completion;
mod sync;

pub use commands::{execute_command, STATUS_COMMAND};
pub use completion::completion;
pub use sync::{did_change, did_close, did_open};
