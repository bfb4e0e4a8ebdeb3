//! PTY-backed terminal sessions.
//!
//! Each session is a long-lived interactive shell on a PTY. Commands are
//! submitted as input lines; output is captured into a bounded ring with
//! absolute offsets, so callers can poll incrementally without the worker
//! retaining unbounded history. The shell's working directory survives
//! between commands and is reported via a marker file the shell writes
//! after every command, never by parsing terminal output.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use portable_pty::{Child, CommandBuilder, MasterPty, PtySize, native_pty_system};
use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

use hutch_guard::{validate_terminal_id, validate_workspace_name};
use hutch_proto::{
    ExecuteRequest, ExecuteResponse, KillTerminalRequest, ReadOutputRequest, ReadOutputResponse,
    TerminalInfo, TerminalKilledResponse, TerminalListResponse, WireError, WriteTerminalRequest,
    WriteTerminalResponse,
};

const PTY_ROWS: u16 = 40;
const PTY_COLS: u16 = 120;
const READER_CHUNK: usize = 8192;

#[derive(Debug, Clone)]
pub struct TerminalConfig {
    /// Directory containing one subdirectory per workspace.
    pub workspaces_root: PathBuf,
    /// Worker-private state directory (cwd marker files).
    pub state_dir: PathBuf,
    /// Quiescence window: output is considered settled after this many
    /// milliseconds without new bytes.
    pub settle_ms: u64,
    /// Ring capacity per terminal. Older bytes are dropped past this.
    pub ring_capacity: usize,
    /// Upper bound on bytes returned by a single output read.
    pub read_cap: u64,
    pub shell: String,
}

impl TerminalConfig {
    pub fn new(workspaces_root: PathBuf, state_dir: PathBuf) -> Self {
        Self {
            workspaces_root,
            state_dir,
            settle_ms: 200,
            ring_capacity: 1024 * 1024,
            read_cap: 256 * 1024,
            shell: "/bin/bash".to_string(),
        }
    }
}

/// Bounded output buffer addressed by absolute stream offsets.
///
/// `start` is the absolute offset of the oldest retained byte, so
/// `start + buf.len()` is the total number of bytes ever produced.
struct OutputRing {
    buf: Vec<u8>,
    capacity: usize,
    start: u64,
}

impl OutputRing {
    fn new(capacity: usize) -> Self {
        Self {
            buf: Vec::new(),
            capacity,
            start: 0,
        }
    }

    fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
        if self.buf.len() > self.capacity {
            let drop = self.buf.len() - self.capacity;
            self.buf.drain(..drop);
            self.start += drop as u64;
        }
    }

    fn total(&self) -> u64 {
        self.start + self.buf.len() as u64
    }

    /// Slice starting at `offset`, clamped to what the ring still holds.
    /// Returns the bytes and the absolute offset they actually start at.
    fn slice(&self, offset: u64, max_len: usize) -> (Vec<u8>, u64) {
        let effective = offset.clamp(self.start, self.total());
        let idx = (effective - self.start) as usize;
        let end = idx.saturating_add(max_len).min(self.buf.len());
        (self.buf[idx..end].to_vec(), effective)
    }
}

/// State shared between the blocking PTY reader thread and async callers.
struct Shared {
    ring: StdMutex<OutputRing>,
    activity: Notify,
    closed: AtomicBool,
}

impl Shared {
    fn total(&self) -> u64 {
        self.ring.lock().unwrap_or_else(|e| e.into_inner()).total()
    }
}

pub struct TerminalSession {
    pub id: String,
    pub workspace: String,
    workspace_path: PathBuf,
    created_at: DateTime<Utc>,
    shared: Arc<Shared>,
    writer: StdMutex<Box<dyn Write + Send>>,
    child: StdMutex<Box<dyn Child + Send + Sync>>,
    // Dropping the master tears the PTY down, so it lives as long as the
    // session. The mutex only exists to make the session Sync.
    _master: StdMutex<Box<dyn MasterPty + Send>>,
    marker: PathBuf,
}

impl TerminalSession {
    fn submit(&self, bytes: &[u8]) -> Result<(), WireError> {
        let mut writer = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        writer
            .write_all(bytes)
            .and_then(|_| writer.flush())
            .map_err(|e| WireError::internal(format!("terminal write failed: {e}")))
    }

    fn close(&self) {
        {
            let mut child = self.child.lock().unwrap_or_else(|e| e.into_inner());
            if let Err(e) = child.kill() {
                debug!("kill terminal {}: {}", self.id, e);
            }
            let _ = child.try_wait();
        }
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.activity.notify_waiters();
        let _ = std::fs::remove_file(&self.marker);
    }
}

pub struct TerminalManager {
    cfg: TerminalConfig,
    sessions: StdMutex<HashMap<String, Arc<TerminalSession>>>,
}

impl TerminalManager {
    pub fn new(cfg: TerminalConfig) -> Self {
        Self {
            cfg,
            sessions: StdMutex::new(HashMap::new()),
        }
    }

    fn marker_path(&self, terminal_id: &str) -> PathBuf {
        self.cfg
            .state_dir
            .join("terminals")
            .join(format!("{terminal_id}.cwd"))
    }

    fn get(&self, id: &str) -> Option<Arc<TerminalSession>> {
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }

    fn workspace_path(&self, name: &str) -> Result<PathBuf, WireError> {
        validate_workspace_name(name).map_err(|e| WireError::validation(e.to_string()))?;
        let path = self.cfg.workspaces_root.join(name);
        if !path.is_dir() {
            return Err(WireError::not_found(format!("workspace '{name}' not found")));
        }
        Ok(path)
    }

    fn spawn_session(&self, id: String, workspace: String) -> Result<Arc<TerminalSession>, WireError> {
        let workspace_path = self.cfg.workspaces_root.join(&workspace);
        let marker = self.marker_path(&id);
        if let Some(parent) = marker.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| WireError::internal(format!("create state dir: {e}")))?;
        }

        let pty = native_pty_system();
        let pair = pty
            .openpty(PtySize {
                rows: PTY_ROWS,
                cols: PTY_COLS,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| WireError::internal(format!("openpty: {e}")))?;

        let mut cmd = CommandBuilder::new(&self.cfg.shell);
        if self.cfg.shell.ends_with("bash") {
            cmd.arg("--noprofile");
            cmd.arg("--norc");
        }
        cmd.cwd(&workspace_path);
        cmd.env("TERM", "dumb");

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| WireError::internal(format!("spawn shell: {e}")))?;
        drop(pair.slave);

        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| WireError::internal(format!("clone pty reader: {e}")))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| WireError::internal(format!("take pty writer: {e}")))?;

        let shared = Arc::new(Shared {
            ring: StdMutex::new(OutputRing::new(self.cfg.ring_capacity)),
            activity: Notify::new(),
            closed: AtomicBool::new(false),
        });

        let reader_shared = Arc::clone(&shared);
        let reader_id = id.clone();
        std::thread::spawn(move || {
            let mut chunk = [0u8; READER_CHUNK];
            loop {
                match reader.read(&mut chunk) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        reader_shared
                            .ring
                            .lock()
                            .unwrap_or_else(|e| e.into_inner())
                            .push(&chunk[..n]);
                        reader_shared.activity.notify_waiters();
                    }
                }
            }
            debug!("terminal {reader_id}: pty reader finished");
            reader_shared.closed.store(true, Ordering::SeqCst);
            reader_shared.activity.notify_waiters();
        });

        let session = Arc::new(TerminalSession {
            id: id.clone(),
            workspace,
            workspace_path: workspace_path.clone(),
            created_at: Utc::now(),
            shared,
            writer: StdMutex::new(writer),
            child: StdMutex::new(child),
            _master: StdMutex::new(pair.master),
            marker: marker.clone(),
        });

        // Silence PTY echo and prompts so command output stays clean, and
        // seed the cwd marker with the workspace root.
        session.submit(b"stty -echo 2>/dev/null; PS1=''; PS2=''; unset PROMPT_COMMAND\n")?;
        std::fs::write(&marker, workspace_path.to_string_lossy().as_bytes())
            .map_err(|e| WireError::internal(format!("write cwd marker: {e}")))?;

        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.clone(), Arc::clone(&session));
        info!("terminal {id} started in {}", workspace_path.display());
        Ok(session)
    }

    /// Wait until no output has arrived for a full quiescence window or the
    /// deadline passes, whichever comes first.
    async fn settle(&self, shared: &Shared, deadline: Instant) -> bool {
        let settle = Duration::from_millis(self.cfg.settle_ms);
        let mut seen = shared.total();
        loop {
            if shared.closed.load(Ordering::SeqCst) {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            let window = settle.min(deadline - now);
            match tokio::time::timeout(window, shared.activity.notified()).await {
                Ok(()) => continue,
                Err(_) => {
                    let total = shared.total();
                    if total != seen {
                        // Bytes landed without a wakeup we observed.
                        seen = total;
                        continue;
                    }
                    // Quiet for the whole window. Only a truncated window
                    // (deadline closer than the settle interval) counts as
                    // a timeout.
                    return window < settle;
                }
            }
        }
    }

    pub async fn execute(&self, req: &ExecuteRequest) -> Result<ExecuteResponse, WireError> {
        let workspace_path = self.workspace_path(&req.workspace)?;

        let session = match &req.terminal_id {
            Some(id) => {
                validate_terminal_id(id).map_err(|e| WireError::validation(e.to_string()))?;
                match self.get(id) {
                    Some(s) if !s.shared.closed.load(Ordering::SeqCst) => {
                        if s.workspace != req.workspace {
                            return Err(WireError::validation(format!(
                                "terminal '{id}' belongs to workspace '{}'",
                                s.workspace
                            )));
                        }
                        s
                    }
                    _ => self.spawn_session(id.clone(), req.workspace.clone())?,
                }
            }
            None => {
                let id = format!("t-{}", &Uuid::new_v4().simple().to_string()[..12]);
                self.spawn_session(id, req.workspace.clone())?
            }
        };

        let baseline = session.shared.total();
        let deadline = Instant::now() + Duration::from_millis(req.timeout_ms.max(1));

        let mut submission = format!("cd '{}' 2>/dev/null\n", workspace_path.display());
        if !req.command.trim().is_empty() {
            submission.push_str(&req.command);
            submission.push('\n');
        }
        submission.push_str(&format!(
            "printf '%s' \"$PWD\" > '{}'\n",
            session.marker.display()
        ));
        session.submit(submission.as_bytes())?;

        let timed_out = self.settle(&session.shared, deadline).await;

        let output = {
            let ring = session.shared.ring.lock().unwrap_or_else(|e| e.into_inner());
            let (bytes, _) = ring.slice(baseline, usize::MAX);
            String::from_utf8_lossy(&bytes).into_owned()
        };

        let cwd = match tokio::fs::read_to_string(&session.marker).await {
            Ok(s) if !s.trim().is_empty() => s.trim().to_string(),
            _ => session.workspace_path.to_string_lossy().into_owned(),
        };
        let cwd_relative_to_workspace = Path::new(&cwd)
            .strip_prefix(&session.workspace_path)
            .ok()
            .map(|rel| {
                let rel = rel.to_string_lossy();
                if rel.is_empty() {
                    ".".to_string()
                } else {
                    rel.into_owned()
                }
            });

        Ok(ExecuteResponse {
            terminal_id: session.id.clone(),
            output,
            cwd,
            cwd_relative_to_workspace,
            timed_out,
        })
    }

    pub async fn write(&self, req: &WriteTerminalRequest) -> Result<WriteTerminalResponse, WireError> {
        validate_terminal_id(&req.terminal_id)
            .map_err(|e| WireError::validation(e.to_string()))?;
        let session = self
            .get(&req.terminal_id)
            .ok_or_else(|| WireError::not_found(format!("terminal '{}' not found", req.terminal_id)))?;

        let baseline = session.shared.total();
        let deadline = Instant::now() + Duration::from_millis(req.timeout_ms.max(1));
        session.submit(req.input.as_bytes())?;
        let timed_out = self.settle(&session.shared, deadline).await;

        let output = {
            let ring = session.shared.ring.lock().unwrap_or_else(|e| e.into_inner());
            let (bytes, _) = ring.slice(baseline, usize::MAX);
            String::from_utf8_lossy(&bytes).into_owned()
        };

        Ok(WriteTerminalResponse {
            terminal_id: req.terminal_id.clone(),
            output,
            timed_out,
        })
    }

    pub fn read_output(&self, req: &ReadOutputRequest) -> Result<ReadOutputResponse, WireError> {
        validate_terminal_id(&req.terminal_id)
            .map_err(|e| WireError::validation(e.to_string()))?;
        let session = self
            .get(&req.terminal_id)
            .ok_or_else(|| WireError::not_found(format!("terminal '{}' not found", req.terminal_id)))?;

        let max_len = req
            .length
            .unwrap_or(self.cfg.read_cap)
            .min(self.cfg.read_cap) as usize;
        let ring = session.shared.ring.lock().unwrap_or_else(|e| e.into_inner());
        let (bytes, offset) = ring.slice(req.offset, max_len);
        Ok(ReadOutputResponse {
            terminal_id: req.terminal_id.clone(),
            output: String::from_utf8_lossy(&bytes).into_owned(),
            offset,
            total_length: ring.total(),
        })
    }

    pub fn list(&self) -> TerminalListResponse {
        let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        let mut terminals: Vec<TerminalInfo> = sessions
            .values()
            .map(|s| TerminalInfo {
                terminal_id: s.id.clone(),
                workspace: s.workspace.clone(),
                created_at: s.created_at,
                output_length: s.shared.total(),
            })
            .collect();
        terminals.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        TerminalListResponse { terminals }
    }

    /// Kill a terminal. Any in-flight execute on the same session observes
    /// the closed flag and resolves with whatever output was captured.
    pub fn kill(&self, req: &KillTerminalRequest) -> Result<TerminalKilledResponse, WireError> {
        validate_terminal_id(&req.terminal_id)
            .map_err(|e| WireError::validation(e.to_string()))?;
        let session = self
            .sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&req.terminal_id)
            .ok_or_else(|| WireError::not_found(format!("terminal '{}' not found", req.terminal_id)))?;
        session.close();
        info!("terminal {} killed", req.terminal_id);
        Ok(TerminalKilledResponse {
            terminal_id: req.terminal_id.clone(),
        })
    }

    pub fn kill_all(&self) {
        let sessions: Vec<Arc<TerminalSession>> = {
            let mut map = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
            map.drain().map(|(_, s)| s).collect()
        };
        if !sessions.is_empty() {
            warn!("killing {} terminal(s) on shutdown", sessions.len());
        }
        for session in sessions {
            session.close();
        }
    }
}
