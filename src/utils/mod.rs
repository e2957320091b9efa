//! Utility modules for ReceiveIt
//!
//! Shared helpers for retrying kernel interactions and running external tools.

pub mod cmd;
pub mod retry;

pub use retry::Backoff;
