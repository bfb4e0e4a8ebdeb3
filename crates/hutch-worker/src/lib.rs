//! Per-tenant worker daemon.
//!
//! One worker runs per tenant, as that tenant's OS user, and owns every
//! tenant-side resource: PTY terminal sessions, workspace directories, and
//! the plan documents inside them. The supervisor talks to it over a Unix
//! socket using the `hutch-proto` frame protocol.

pub mod server;
pub mod terminal;
pub mod workspace;

pub use server::{WorkerState, run, socket_path_or_default};
pub use terminal::{TerminalConfig, TerminalManager};
pub use workspace::WorkspaceStore;
