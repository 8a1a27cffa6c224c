//! I/O adapters for warden commands.

pub mod config;
pub mod git;
pub mod health;
pub mod history;
pub mod notify;
pub mod process;
pub mod state;
pub mod supervisor;
pub mod test_gate;
