//! hutchd: the supervisor side of the hutch execution environment.
//!
//! Owns tenant identities (OS accounts), the lifecycle of per-tenant
//! worker processes, token-gated file transfers, and the HTTP surface.
//! Everything tenant-side (terminals, workspaces) lives in the worker and
//! is reached over the `hutch-proto` socket protocol.

pub mod api;
pub mod config;
pub mod error;
pub mod ipc;
pub mod launcher;
pub mod registry;
pub mod supervisor;
pub mod transfer;

pub use config::AppConfig;
pub use error::{ApiError, ApiResult};
pub use registry::{Registry, TenantIdentity};
pub use supervisor::Supervisor;
pub use transfer::TransferBroker;
