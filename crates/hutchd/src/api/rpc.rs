//! Private RPC endpoint: `POST /rpc` with `{tenant, method, params}`.
//!
//! The method set is a closed match; adding a method means touching this
//! dispatch and the worker protocol in the same change. Parameter
//! validation happens here, before any account or socket work, so a
//! malformed request never provisions anything.

use std::time::Duration;

use axum::extract::State;
use axum::response::Json;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;

use hutch_guard::{DEFAULT_WORKSPACE, validate_terminal_id, validate_workspace_name};
use hutch_proto::{
    CreateWorkspaceRequest, DeleteWorkspaceRequest, ErrorCode, ExecuteRequest, KillTerminalRequest,
    ReadOutputRequest, SetWorkspacePlanRequest, Task, WireError, WorkerRequest, WorkerResponse,
    WorkspaceStatusRequest, WriteTerminalRequest,
};

use crate::error::{ApiError, ApiResult};

use super::AppState;

/// Outer bound on RPC-initiated worker calls that carry no timeout of
/// their own.
const DEFAULT_DEADLINE: Duration = Duration::from_secs(30);
/// Margin added on top of a caller-supplied `timeout_ms` so the worker's
/// own settle logic decides, not the IPC layer.
const DEADLINE_MARGIN: Duration = Duration::from_secs(15);

const DEFAULT_EXECUTE_TIMEOUT_MS: u64 = 30_000;

#[derive(Debug, Deserialize)]
pub struct RpcRequest {
    pub tenant: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Deserialize)]
struct ExecuteParams {
    #[serde(default)]
    terminal_id: Option<String>,
    #[serde(default)]
    workspace: Option<String>,
    #[serde(default)]
    command: String,
    #[serde(default)]
    timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ReadOutputParams {
    terminal_id: String,
    #[serde(default)]
    offset: u64,
    #[serde(default)]
    length: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct WriteTerminalParams {
    terminal_id: String,
    input: String,
    #[serde(default)]
    timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct TerminalIdParams {
    terminal_id: String,
}

#[derive(Debug, Deserialize)]
struct CreateWorkspaceParams {
    name: String,
    #[serde(default)]
    git_url: Option<String>,
    #[serde(default)]
    branch: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DeleteWorkspaceParams {
    name: String,
    #[serde(default)]
    confirm: bool,
}

#[derive(Debug, Deserialize)]
struct WorkspaceNameParams {
    name: String,
}

#[derive(Debug, Deserialize)]
struct SetPlanParams {
    name: String,
    #[serde(default)]
    plan: Option<String>,
    #[serde(default)]
    tasks: Option<Vec<Task>>,
}

#[derive(Debug, Deserialize)]
struct UploadSessionParams {
    #[serde(default)]
    workspace: Option<String>,
    #[serde(default)]
    target_directory: Option<String>,
    #[serde(default)]
    expires_in_minutes: Option<u64>,
    #[serde(default)]
    max_size_mb: Option<u64>,
    #[serde(default)]
    allowed_extensions: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct DownloadLinkParams {
    #[serde(default)]
    workspace: Option<String>,
    path: String,
    #[serde(default)]
    expires_in_minutes: Option<u64>,
}

fn parse_params<T: serde::de::DeserializeOwned>(method: &str, params: &Value) -> ApiResult<T> {
    let params = if params.is_null() {
        Value::Object(serde_json::Map::new())
    } else {
        params.clone()
    };
    serde_json::from_value(params)
        .map_err(|e| ApiError::validation(format!("invalid params for '{method}': {e}")))
}

fn workspace_or_default(workspace: Option<String>) -> ApiResult<String> {
    let workspace = workspace.unwrap_or_else(|| DEFAULT_WORKSPACE.to_string());
    validate_workspace_name(&workspace)?;
    Ok(workspace)
}

/// Strip the protocol enum tag: RPC callers see plain result objects.
fn result_json(resp: WorkerResponse) -> ApiResult<Value> {
    let value = match resp {
        WorkerResponse::Pong => json!({ "alive": true }),
        WorkerResponse::ShuttingDown => json!({ "stopped": true }),
        WorkerResponse::Executed(r) => serde_json::to_value(r)?,
        WorkerResponse::OutputSlice(r) => serde_json::to_value(r)?,
        WorkerResponse::TerminalWritten(r) => serde_json::to_value(r)?,
        WorkerResponse::TerminalList(r) => serde_json::to_value(r)?,
        WorkerResponse::TerminalKilled(r) => serde_json::to_value(r)?,
        WorkerResponse::WorkspaceList(r) => serde_json::to_value(r)?,
        WorkerResponse::WorkspaceCreated(r) => serde_json::to_value(r)?,
        WorkerResponse::WorkspaceDeleted(r) => serde_json::to_value(r)?,
        WorkerResponse::WorkspaceStatus(r) => serde_json::to_value(r)?,
        WorkerResponse::PlanUpdated(r) => serde_json::to_value(r)?,
    };
    Ok(value)
}

impl From<serde_json::Error> for ApiError {
    fn from(e: serde_json::Error) -> Self {
        ApiError::Internal(anyhow::anyhow!("encode result: {e}"))
    }
}

pub async fn handle_rpc(
    State(state): State<AppState>,
    Json(request): Json<RpcRequest>,
) -> ApiResult<Json<Value>> {
    debug!(tenant = request.tenant, method = request.method, "rpc");
    let result = dispatch_method(&state, &request).await?;
    Ok(Json(json!({ "result": result })))
}

async fn dispatch_method(state: &AppState, request: &RpcRequest) -> ApiResult<Value> {
    let tenant = &request.tenant;
    let params = &request.params;

    match request.method.as_str() {
        "execute_command" => {
            let p: ExecuteParams = parse_params(&request.method, params)?;
            let workspace = workspace_or_default(p.workspace)?;
            if let Some(id) = &p.terminal_id {
                validate_terminal_id(id)?;
            }
            let timeout_ms = p.timeout_ms.unwrap_or(DEFAULT_EXECUTE_TIMEOUT_MS);
            let deadline = Duration::from_millis(timeout_ms) + DEADLINE_MARGIN;
            let resp = state
                .supervisor
                .dispatch(
                    tenant,
                    WorkerRequest::Execute(ExecuteRequest {
                        terminal_id: p.terminal_id,
                        workspace,
                        command: p.command,
                        timeout_ms,
                    }),
                    deadline,
                )
                .await?;
            result_json(resp)
        }
        "read_terminal_output" => {
            let p: ReadOutputParams = parse_params(&request.method, params)?;
            validate_terminal_id(&p.terminal_id)?;
            let resp = state
                .supervisor
                .dispatch(
                    tenant,
                    WorkerRequest::ReadOutput(ReadOutputRequest {
                        terminal_id: p.terminal_id,
                        offset: p.offset,
                        length: p.length,
                    }),
                    DEFAULT_DEADLINE,
                )
                .await?;
            result_json(resp)
        }
        "write_terminal" => {
            let p: WriteTerminalParams = parse_params(&request.method, params)?;
            validate_terminal_id(&p.terminal_id)?;
            let timeout_ms = p.timeout_ms.unwrap_or(DEFAULT_EXECUTE_TIMEOUT_MS);
            let deadline = Duration::from_millis(timeout_ms) + DEADLINE_MARGIN;
            let resp = state
                .supervisor
                .dispatch(
                    tenant,
                    WorkerRequest::WriteTerminal(WriteTerminalRequest {
                        terminal_id: p.terminal_id,
                        input: p.input,
                        timeout_ms,
                    }),
                    deadline,
                )
                .await?;
            result_json(resp)
        }
        "list_terminals" => {
            let resp = state
                .supervisor
                .dispatch(tenant, WorkerRequest::ListTerminals, DEFAULT_DEADLINE)
                .await?;
            result_json(resp)
        }
        "kill_terminal" => {
            let p: TerminalIdParams = parse_params(&request.method, params)?;
            validate_terminal_id(&p.terminal_id)?;
            let resp = state
                .supervisor
                .dispatch(
                    tenant,
                    WorkerRequest::KillTerminal(KillTerminalRequest {
                        terminal_id: p.terminal_id,
                    }),
                    DEFAULT_DEADLINE,
                )
                .await?;
            result_json(resp)
        }
        "list_workspaces" => {
            let resp = state
                .supervisor
                .dispatch(tenant, WorkerRequest::ListWorkspaces, DEFAULT_DEADLINE)
                .await?;
            result_json(resp)
        }
        "create_workspace" => {
            let p: CreateWorkspaceParams = parse_params(&request.method, params)?;
            validate_workspace_name(&p.name)?;
            let resp = state
                .supervisor
                .dispatch(
                    tenant,
                    WorkerRequest::CreateWorkspace(CreateWorkspaceRequest {
                        name: p.name,
                        git_url: p.git_url,
                        branch: p.branch,
                    }),
                    DEFAULT_DEADLINE,
                )
                .await?;
            result_json(resp)
        }
        "delete_workspace" => {
            let p: DeleteWorkspaceParams = parse_params(&request.method, params)?;
            validate_workspace_name(&p.name)?;
            let resp = state
                .supervisor
                .dispatch(
                    tenant,
                    WorkerRequest::DeleteWorkspace(DeleteWorkspaceRequest {
                        name: p.name,
                        confirm: p.confirm,
                    }),
                    DEFAULT_DEADLINE,
                )
                .await?;
            result_json(resp)
        }
        "get_workspace_status" => {
            let p: WorkspaceNameParams = parse_params(&request.method, params)?;
            validate_workspace_name(&p.name)?;
            let resp = state
                .supervisor
                .dispatch(
                    tenant,
                    WorkerRequest::WorkspaceStatus(WorkspaceStatusRequest { name: p.name }),
                    DEFAULT_DEADLINE,
                )
                .await?;
            result_json(resp)
        }
        "set_workspace_plan" => {
            let p: SetPlanParams = parse_params(&request.method, params)?;
            validate_workspace_name(&p.name)?;
            let resp = state
                .supervisor
                .dispatch(
                    tenant,
                    WorkerRequest::SetWorkspacePlan(SetWorkspacePlanRequest {
                        name: p.name,
                        plan: p.plan,
                        tasks: p.tasks,
                    }),
                    DEFAULT_DEADLINE,
                )
                .await?;
            result_json(resp)
        }
        "create_upload_session" => {
            let p: UploadSessionParams = parse_params(&request.method, params)?;
            let workspace = workspace_or_default(p.workspace)?;
            let grant = state
                .broker
                .create_upload_session(
                    tenant,
                    &workspace,
                    p.target_directory.as_deref(),
                    p.expires_in_minutes,
                    p.max_size_mb,
                    p.allowed_extensions,
                )
                .await?;
            Ok(serde_json::to_value(grant)?)
        }
        "create_download_link" => {
            let p: DownloadLinkParams = parse_params(&request.method, params)?;
            let workspace = workspace_or_default(p.workspace)?;
            let grant = state
                .broker
                .create_download_link(tenant, &workspace, &p.path, p.expires_in_minutes)
                .await?;
            Ok(serde_json::to_value(grant)?)
        }
        "reset_worker" => {
            state.supervisor.reset(tenant).await?;
            Ok(json!({ "reset": true }))
        }
        other => Err(ApiError::Wire(WireError::new(
            ErrorCode::UnknownMethod,
            format!("unknown method '{other}'"),
        ))),
    }
}
