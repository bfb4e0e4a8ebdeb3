//! Unix socket server: newline-delimited JSON frames, one response per
//! request, correlated by id.
//!
//! Requests are dispatched concurrently so a kill_terminal can land while
//! an execute on the same connection is still settling. Responses are
//! written as each operation finishes, so they may be out of order
//! relative to a pipelined batch.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{Mutex, broadcast};

use hutch_proto::{
    RequestFrame, ResponseBody, ResponseFrame, WireError, WorkerRequest, WorkerResponse,
    frame_id_of,
};

use crate::terminal::TerminalManager;
use crate::workspace::WorkspaceStore;

pub struct WorkerState {
    pub terminals: TerminalManager,
    pub workspaces: WorkspaceStore,
    shutdown_tx: broadcast::Sender<()>,
}

impl WorkerState {
    pub fn new(terminals: TerminalManager, workspaces: WorkspaceStore) -> Arc<Self> {
        let (shutdown_tx, _) = broadcast::channel(1);
        Arc::new(Self {
            terminals,
            workspaces,
            shutdown_tx,
        })
    }

    async fn dispatch(&self, op: WorkerRequest) -> Result<WorkerResponse, WireError> {
        match op {
            WorkerRequest::Ping => Ok(WorkerResponse::Pong),
            WorkerRequest::Shutdown => {
                info!("shutdown requested");
                self.terminals.kill_all();
                let _ = self.shutdown_tx.send(());
                Ok(WorkerResponse::ShuttingDown)
            }

            WorkerRequest::Execute(req) => {
                self.terminals.execute(&req).await.map(WorkerResponse::Executed)
            }
            WorkerRequest::ReadOutput(req) => {
                self.terminals.read_output(&req).map(WorkerResponse::OutputSlice)
            }
            WorkerRequest::WriteTerminal(req) => self
                .terminals
                .write(&req)
                .await
                .map(WorkerResponse::TerminalWritten),
            WorkerRequest::ListTerminals => Ok(WorkerResponse::TerminalList(self.terminals.list())),
            WorkerRequest::KillTerminal(req) => {
                self.terminals.kill(&req).map(WorkerResponse::TerminalKilled)
            }

            WorkerRequest::ListWorkspaces => self
                .workspaces
                .list()
                .await
                .map(WorkerResponse::WorkspaceList),
            WorkerRequest::CreateWorkspace(req) => self
                .workspaces
                .create(&req)
                .await
                .map(WorkerResponse::WorkspaceCreated),
            WorkerRequest::DeleteWorkspace(req) => self
                .workspaces
                .delete(&req)
                .await
                .map(WorkerResponse::WorkspaceDeleted),
            WorkerRequest::WorkspaceStatus(req) => self
                .workspaces
                .status(&req)
                .await
                .map(WorkerResponse::WorkspaceStatus),
            WorkerRequest::SetWorkspacePlan(req) => self
                .workspaces
                .set_plan(&req)
                .await
                .map(WorkerResponse::PlanUpdated),
        }
    }
}

async fn write_frame(
    writer: &Mutex<tokio::net::unix::OwnedWriteHalf>,
    frame: &ResponseFrame,
) {
    let mut line = match serde_json::to_string(frame) {
        Ok(json) => json,
        Err(e) => {
            error!("failed to encode response frame: {e}");
            return;
        }
    };
    line.push('\n');
    let mut writer = writer.lock().await;
    if let Err(e) = writer.write_all(line.as_bytes()).await {
        debug!("client went away mid-response: {e}");
    }
}

async fn handle_connection(state: Arc<WorkerState>, stream: UnixStream) {
    let (read_half, write_half) = stream.into_split();
    let writer = Arc::new(Mutex::new(write_half));
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();

    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                debug!("connection read error: {e}");
                break;
            }
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let frame: RequestFrame = match serde_json::from_str(trimmed) {
            Ok(frame) => frame,
            Err(e) => {
                // An op this build doesn't know, or garbage. Correlate if
                // we can so the caller gets a structured error instead of
                // a dead request.
                match frame_id_of(trimmed) {
                    Some(id) => {
                        warn!("unparseable op in frame {id}: {e}");
                        write_frame(
                            &writer,
                            &ResponseFrame {
                                id,
                                body: ResponseBody::Err(WireError::new(
                                    hutch_proto::ErrorCode::UnknownMethod,
                                    format!("unrecognized operation: {e}"),
                                )),
                            },
                        )
                        .await;
                    }
                    None => warn!("discarding uncorrelatable frame: {e}"),
                }
                continue;
            }
        };

        let state = Arc::clone(&state);
        let writer = Arc::clone(&writer);
        tokio::spawn(async move {
            let id = frame.id;
            let body = match state.dispatch(frame.op).await {
                Ok(resp) => ResponseBody::Ok(resp),
                Err(err) => ResponseBody::Err(err),
            };
            write_frame(&writer, &ResponseFrame { id, body }).await;
        });
    }
}

pub async fn run(state: Arc<WorkerState>, socket_path: &Path) -> Result<()> {
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    if socket_path.exists() {
        std::fs::remove_file(socket_path)
            .with_context(|| format!("failed to remove stale socket {}", socket_path.display()))?;
    }

    let listener = UnixListener::bind(socket_path)
        .with_context(|| format!("failed to bind {}", socket_path.display()))?;
    info!("listening on {}", socket_path.display());

    let mut shutdown_rx = state.shutdown_tx.subscribe();
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("failed to install SIGTERM handler")?;

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _)) => {
                        tokio::spawn(handle_connection(Arc::clone(&state), stream));
                    }
                    Err(e) => {
                        error!("accept failed: {e}");
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                info!("shutting down on request");
                break;
            }
            _ = sigterm.recv() => {
                info!("shutting down on SIGTERM");
                state.terminals.kill_all();
                break;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down on interrupt");
                state.terminals.kill_all();
                break;
            }
        }
    }

    if let Err(e) = std::fs::remove_file(socket_path) {
        debug!("socket cleanup: {e}");
    }
    Ok(())
}

/// Resolve the listening socket path: explicit flag, then the user's
/// runtime directory, then a dotfile under the home directory.
pub fn socket_path_or_default(explicit: Option<PathBuf>, home: &Path) -> PathBuf {
    if let Some(path) = explicit {
        return path;
    }
    if let Ok(runtime) = std::env::var("XDG_RUNTIME_DIR") {
        return PathBuf::from(runtime).join("hutch").join("worker.sock");
    }
    home.join(".hutch").join("worker.sock")
}

#[cfg(test)]
mod tests {
    use super::*;
    use hutch_proto::{ErrorCode, ExecuteRequest};
    use tokio::io::AsyncReadExt;

    fn test_state(dir: &tempfile::TempDir) -> Arc<WorkerState> {
        let root = dir.path().join("workspaces");
        std::fs::create_dir_all(root.join("default")).unwrap();
        let cfg = crate::terminal::TerminalConfig::new(root.clone(), dir.path().join("state"));
        WorkerState::new(
            TerminalManager::new(cfg),
            WorkspaceStore::new(root),
        )
    }

    async fn roundtrip(state: Arc<WorkerState>, frames: &[RequestFrame]) -> Vec<ResponseFrame> {
        let (client, server) = UnixStream::pair().unwrap();
        tokio::spawn(handle_connection(state, server));

        let (read_half, mut write_half) = client.into_split();
        for frame in frames {
            let mut line = serde_json::to_string(frame).unwrap();
            line.push('\n');
            write_half.write_all(line.as_bytes()).await.unwrap();
        }

        let mut reader = BufReader::new(read_half);
        let mut responses = Vec::new();
        let mut line = String::new();
        while responses.len() < frames.len() {
            line.clear();
            let n = tokio::time::timeout(
                std::time::Duration::from_secs(15),
                reader.read_line(&mut line),
            )
            .await
            .expect("response timed out")
            .unwrap();
            if n == 0 {
                break;
            }
            responses.push(serde_json::from_str(line.trim()).unwrap());
        }
        responses
    }

    #[tokio::test]
    async fn ping_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir);
        let responses = roundtrip(
            state,
            &[RequestFrame {
                id: 1,
                op: WorkerRequest::Ping,
            }],
        )
        .await;
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].id, 1);
        assert!(matches!(
            responses[0].body,
            ResponseBody::Ok(WorkerResponse::Pong)
        ));
    }

    #[tokio::test]
    async fn unknown_op_yields_correlated_error() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir);
        let (client, server) = UnixStream::pair().unwrap();
        tokio::spawn(handle_connection(state, server));

        let (read_half, mut write_half) = client.into_split();
        write_half
            .write_all(b"{\"id\":9,\"op\":{\"type\":\"not_a_real_op\"}}\n")
            .await
            .unwrap();

        let mut reader = BufReader::new(read_half);
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        let frame: ResponseFrame = serde_json::from_str(line.trim()).unwrap();
        assert_eq!(frame.id, 9);
        match frame.body {
            ResponseBody::Err(e) => assert_eq!(e.code, ErrorCode::UnknownMethod),
            _ => panic!("expected error"),
        }
    }

    #[tokio::test]
    async fn responses_correlate_by_id_not_order() {
        if !Path::new("/bin/bash").exists() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir);
        // A slow execute pipelined before a ping: the ping must not wait
        // for the execute to settle.
        let responses = roundtrip(
            state,
            &[
                RequestFrame {
                    id: 100,
                    op: WorkerRequest::Execute(ExecuteRequest {
                        terminal_id: None,
                        workspace: "default".into(),
                        command: "sleep 2".into(),
                        timeout_ms: 8_000,
                    }),
                },
                RequestFrame {
                    id: 101,
                    op: WorkerRequest::Ping,
                },
            ],
        )
        .await;
        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0].id, 101, "ping should finish first");
        assert_eq!(responses[1].id, 100);
    }

    #[tokio::test]
    async fn garbage_without_id_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir);
        let (client, server) = UnixStream::pair().unwrap();
        tokio::spawn(handle_connection(state, server));

        let (mut read_half, mut write_half) = client.into_split();
        write_half.write_all(b"this is not json\n").await.unwrap();
        write_half.shutdown().await.unwrap();

        // Connection stays usable until EOF; no response is produced.
        let mut buf = Vec::new();
        read_half.read_to_end(&mut buf).await.unwrap();
        assert!(buf.is_empty());
    }
}
