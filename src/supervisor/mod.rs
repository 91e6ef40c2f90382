//! Session supervision: the per-session run loop, exit resolution, and
//! startup reconciliation of orphaned records.

pub mod exit;
pub mod reconciler;
pub mod session;

pub use exit::{compute_exit_resolution, ExitContext, ExitResolution, Restart};
pub use reconciler::{reconcile, ProcessProbe, ReconcileReport, SignalProbe};
pub use session::{route_cold_message, RunOutcome, SessionSupervisor, StartRequest, SupervisorDeps};
