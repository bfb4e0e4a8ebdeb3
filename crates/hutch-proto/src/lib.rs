//! Wire protocol between hutchd (supervisor) and hutch-worker daemons.
//!
//! The protocol is newline-delimited JSON over a per-tenant Unix socket.
//! Every request carries a client-assigned `id`; every response echoes it.
//! Responses may arrive out of order relative to a pipelined batch - the
//! client correlates strictly by `id`, never by arrival order.
//!
//! The operation set is a closed tagged enum: adding an operation is a
//! compile-time-visible change, and an op the worker cannot parse yields a
//! structured `unknown_method` error rather than a transport failure.

use serde::{Deserialize, Serialize};

pub mod workspace;

pub use workspace::{PlanDocument, Task, TaskStatus, WorkspaceInfo, WorkspaceStatus};

/// Request frame: envelope around one operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestFrame {
    /// Client-assigned correlation id, echoed verbatim in the response.
    pub id: u64,
    /// The operation to perform.
    pub op: WorkerRequest,
}

/// Response frame: either a result or a structured error, tagged by `id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseFrame {
    /// Correlation id from the originating request.
    pub id: u64,
    #[serde(flatten)]
    pub body: ResponseBody,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseBody {
    Ok(WorkerResponse),
    Err(WireError),
}

/// Operations hutchd can ask a worker to perform.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerRequest {
    /// Handshake / health check.
    Ping,

    /// Graceful shutdown: kill all terminals, unlink the socket, exit.
    Shutdown,

    // ========================================================================
    // Terminal operations
    // ========================================================================
    /// Run a command in a (possibly new) PTY-backed terminal.
    Execute(ExecuteRequest),

    /// Read a slice of a terminal's output ring without side effects.
    ReadOutput(ReadOutputRequest),

    /// Send raw bytes to a terminal's PTY (interactive/REPL input).
    WriteTerminal(WriteTerminalRequest),

    /// Enumerate live terminal sessions.
    ListTerminals,

    /// Terminate a terminal and reclaim its session.
    KillTerminal(KillTerminalRequest),

    // ========================================================================
    // Workspace operations
    // ========================================================================
    /// List workspaces under the tenant's workspaces root.
    ListWorkspaces,

    /// Create a workspace: empty git repo or clone of a remote.
    CreateWorkspace(CreateWorkspaceRequest),

    /// Delete a workspace (never `default`, never unconfirmed).
    DeleteWorkspace(DeleteWorkspaceRequest),

    /// Live git status plus plan/tasks for one workspace.
    WorkspaceStatus(WorkspaceStatusRequest),

    /// Partial update of a workspace's plan document.
    SetWorkspacePlan(SetWorkspacePlanRequest),
}

/// Worker results, one variant per request that returns data.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerResponse {
    Pong,
    ShuttingDown,

    Executed(ExecuteResponse),
    OutputSlice(ReadOutputResponse),
    TerminalWritten(WriteTerminalResponse),
    TerminalList(TerminalListResponse),
    TerminalKilled(TerminalKilledResponse),

    WorkspaceList(WorkspaceListResponse),
    WorkspaceCreated(WorkspaceInfo),
    WorkspaceDeleted(WorkspaceDeletedResponse),
    WorkspaceStatus(WorkspaceStatus),
    PlanUpdated(PlanDocument),
}

// ============================================================================
// Terminal request/response types
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteRequest {
    /// Existing terminal to reuse; a fresh one is allocated when omitted or
    /// unknown.
    #[serde(default)]
    pub terminal_id: Option<String>,
    /// Workspace the terminal is rooted in.
    pub workspace: String,
    /// Shell command. Empty means "just attach" (the shell still cds into
    /// the workspace root).
    pub command: String,
    /// Outer bound on waiting for output to settle, in milliseconds.
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteResponse {
    pub terminal_id: String,
    /// Output produced by this command (bytes arriving after submission).
    pub output: String,
    /// Authoritative working directory of the shell after the command,
    /// read from the side-channel marker file, not parsed from output.
    pub cwd: String,
    /// `cwd` relative to the workspace root, when still inside it.
    #[serde(default)]
    pub cwd_relative_to_workspace: Option<String>,
    /// True when the settle window was cut short by `timeout_ms`.
    pub timed_out: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadOutputRequest {
    pub terminal_id: String,
    /// Absolute offset into the terminal's output stream.
    pub offset: u64,
    /// Max bytes to return; the worker caps this regardless.
    #[serde(default)]
    pub length: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadOutputResponse {
    pub terminal_id: String,
    pub output: String,
    /// Absolute offset the returned slice starts at. May be greater than the
    /// requested offset if the ring has already dropped older bytes.
    pub offset: u64,
    /// Total bytes ever produced by this terminal.
    pub total_length: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteTerminalRequest {
    pub terminal_id: String,
    /// Raw bytes for the PTY. Not newline-terminated implicitly.
    pub input: String,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteTerminalResponse {
    pub terminal_id: String,
    /// Output produced after the write settled.
    pub output: String,
    pub timed_out: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminalInfo {
    pub terminal_id: String,
    pub workspace: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    /// Total bytes ever produced.
    pub output_length: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminalListResponse {
    pub terminals: Vec<TerminalInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KillTerminalRequest {
    pub terminal_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminalKilledResponse {
    pub terminal_id: String,
}

// ============================================================================
// Workspace request/response types
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateWorkspaceRequest {
    pub name: String,
    /// Remote to clone; an empty git repo is initialized when omitted.
    #[serde(default)]
    pub git_url: Option<String>,
    /// Initial (or checked-out) branch.
    #[serde(default)]
    pub branch: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteWorkspaceRequest {
    pub name: String,
    /// Explicit confirmation; deletes are rejected without it.
    #[serde(default)]
    pub confirm: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceDeletedResponse {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceStatusRequest {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceListResponse {
    pub workspaces: Vec<WorkspaceInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetWorkspacePlanRequest {
    pub name: String,
    /// New plan text; `None` leaves the stored plan untouched.
    #[serde(default)]
    pub plan: Option<String>,
    /// New task list; `None` leaves the stored tasks untouched.
    #[serde(default)]
    pub tasks: Option<Vec<Task>>,
}

// ============================================================================
// Errors
// ============================================================================

/// Structured error carried on the wire and surfaced to RPC callers.
#[derive(Debug, Clone, Serialize, Deserialize, thiserror::Error)]
#[error("{code:?}: {message}")]
pub struct WireError {
    pub code: ErrorCode,
    pub message: String,
}

impl WireError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Validation, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Conflict, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message)
    }
}

/// Error taxonomy shared by the IPC layer and the RPC facade.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Malformed identifier or path traversal attempt. Rejected before any
    /// filesystem side effect.
    Validation,
    /// Unknown terminal id, workspace, or token.
    NotFound,
    /// Workspace already exists / protected workspace delete.
    Conflict,
    /// Upload exceeds configured size or extension policy.
    ResourceExhausted,
    /// Worker process died mid-call. Safe to retry: the supervisor spawns a
    /// fresh worker on the next dispatch.
    TransientWorker,
    /// OS account creation failed. Not retryable without operator action.
    FatalProvisioning,
    /// The worker did not recognize the operation (version skew).
    UnknownMethod,
    /// Anything else.
    Internal,
}

/// Best-effort extraction of the frame id from a line the worker could not
/// fully parse, so the `unknown_method` error can still be correlated.
pub fn frame_id_of(line: &str) -> Option<u64> {
    let value: serde_json::Value = serde_json::from_str(line).ok()?;
    value.get("id")?.as_u64()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_frame_round_trip() {
        let frame = RequestFrame {
            id: 7,
            op: WorkerRequest::Execute(ExecuteRequest {
                terminal_id: None,
                workspace: "default".into(),
                command: "pwd".into(),
                timeout_ms: 5000,
            }),
        };

        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains("\"id\":7"));
        assert!(json.contains("execute"));

        let parsed: RequestFrame = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.id, 7);
        match parsed.op {
            WorkerRequest::Execute(r) => {
                assert_eq!(r.workspace, "default");
                assert_eq!(r.command, "pwd");
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn response_frame_ok_and_err() {
        let ok = ResponseFrame {
            id: 3,
            body: ResponseBody::Ok(WorkerResponse::Pong),
        };
        let json = serde_json::to_string(&ok).unwrap();
        assert!(json.contains("\"ok\""));
        let parsed: ResponseFrame = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.id, 3);
        assert!(matches!(parsed.body, ResponseBody::Ok(WorkerResponse::Pong)));

        let err = ResponseFrame {
            id: 4,
            body: ResponseBody::Err(WireError::not_found("no terminal t-9")),
        };
        let json = serde_json::to_string(&err).unwrap();
        let parsed: ResponseFrame = serde_json::from_str(&json).unwrap();
        match parsed.body {
            ResponseBody::Err(e) => {
                assert_eq!(e.code, ErrorCode::NotFound);
                assert!(e.message.contains("t-9"));
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn frame_id_survives_unknown_op() {
        // A frame from a newer hutchd with an op this worker doesn't know.
        let line = r#"{"id":42,"op":{"type":"defragment_moon_base","params":{}}}"#;
        assert!(serde_json::from_str::<RequestFrame>(line).is_err());
        assert_eq!(frame_id_of(line), Some(42));
    }

    #[test]
    fn frame_id_of_garbage_is_none() {
        assert_eq!(frame_id_of("not json"), None);
        assert_eq!(frame_id_of("{}"), None);
    }

    #[test]
    fn error_code_wire_names() {
        let json = serde_json::to_string(&ErrorCode::TransientWorker).unwrap();
        assert_eq!(json, "\"transient_worker\"");
        let json = serde_json::to_string(&ErrorCode::UnknownMethod).unwrap();
        assert_eq!(json, "\"unknown_method\"");
    }
}
