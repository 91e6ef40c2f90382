#![forbid(unsafe_code)]

//! Supervision of interactive AI coding-agent CLIs.
//!
//! A worker claims sessions from a store, runs one agent process per
//! session through a protocol [`adapter`], streams normalized events on a
//! [`bus`], routes human control messages and tool approvals back to the
//! process, and decides after every exit whether the session is resumable.

pub mod adapter;
pub mod approval;
pub mod bus;
pub mod config;
pub mod errors;
pub mod logsink;
pub mod models;
pub mod persistence;
pub mod queue;
pub mod supervisor;
pub mod worker;

pub use config::GlobalConfig;
pub use errors::{AppError, Result};
