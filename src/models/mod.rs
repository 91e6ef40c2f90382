//! Domain model module declarations.

pub mod control;
pub mod event;
pub mod execution;
pub mod session;
