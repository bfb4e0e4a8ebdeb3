//! Per-tenant worker lifecycle.
//!
//! Each tenant has at most one worker process. The state machine is
//! `NoWorker -> Starting -> Ready <-> Idle -> Terminating -> NoWorker`;
//! creation is single-flight behind a per-tenant async mutex, while calls
//! themselves run outside that lock so tenants never serialize each other
//! and a tenant's own calls pipeline freely on the channel.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use hutch_proto::{ErrorCode, WorkerRequest, WorkerResponse};

use crate::config::SupervisorConfig;
use crate::error::{ApiError, ApiResult};
use crate::ipc::WorkerChannel;
use crate::launcher::WorkerLauncher;
use crate::registry::{Registry, TenantIdentity};

const HANDSHAKE_DEADLINE: Duration = Duration::from_secs(2);
const CONNECT_RETRY: Duration = Duration::from_millis(100);
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    NoWorker,
    Starting,
    Ready,
    Idle,
    Terminating,
}

struct Runtime {
    channel: Arc<WorkerChannel>,
    child: tokio::process::Child,
}

struct SlotInner {
    state: WorkerState,
    runtime: Option<Runtime>,
}

struct TenantSlot {
    inner: Mutex<SlotInner>,
    last_activity: StdMutex<Instant>,
}

impl TenantSlot {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(SlotInner {
                state: WorkerState::NoWorker,
                runtime: None,
            }),
            last_activity: StdMutex::new(Instant::now()),
        })
    }

    fn touch(&self) {
        *self.last_activity.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_activity
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .elapsed()
    }
}

pub struct Supervisor {
    slots: DashMap<String, Arc<TenantSlot>>,
    launcher: Box<dyn WorkerLauncher>,
    registry: Arc<Registry>,
    cfg: SupervisorConfig,
}

impl Supervisor {
    pub fn new(
        registry: Arc<Registry>,
        launcher: Box<dyn WorkerLauncher>,
        cfg: SupervisorConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            slots: DashMap::new(),
            launcher,
            registry,
            cfg,
        })
    }

    fn slot(&self, tenant: &str) -> Arc<TenantSlot> {
        self.slots
            .entry(tenant.to_string())
            .or_insert_with(TenantSlot::new)
            .clone()
    }

    /// Forward one operation to the tenant's worker, provisioning the
    /// tenant and starting a worker as needed. `deadline` must exceed any
    /// `timeout_ms` inside the operation so the worker's own settle logic
    /// is never cut short from outside.
    pub async fn dispatch(
        &self,
        tenant: &str,
        op: WorkerRequest,
        deadline: Duration,
    ) -> ApiResult<WorkerResponse> {
        let identity = self.registry.ensure_tenant(tenant).await?;
        let slot = self.slot(tenant);
        slot.touch();

        let channel = self.ensure_worker(&identity, &slot).await?;
        let result = channel.call(op, deadline).await;
        slot.touch();
        match result {
            Ok(resp) => Ok(resp),
            Err(e) if e.code == ErrorCode::TransientWorker => {
                self.note_worker_lost(&slot, &channel).await;
                warn!(tenant, "worker lost mid-call: {}", e.message);
                Err(e.into())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Single-flight get-or-start. Holding the slot lock across spawn and
    /// handshake means concurrent first requests wait for one worker
    /// instead of racing to start several.
    async fn ensure_worker(
        &self,
        identity: &TenantIdentity,
        slot: &TenantSlot,
    ) -> ApiResult<Arc<WorkerChannel>> {
        let mut inner = slot.inner.lock().await;

        let state = inner.state;
        if let Some(runtime) = &mut inner.runtime {
            let alive = runtime.child.try_wait().map(|s| s.is_none()).unwrap_or(false);
            if alive && !runtime.channel.is_closed() && state != WorkerState::Terminating {
                let channel = Arc::clone(&runtime.channel);
                inner.state = WorkerState::Ready;
                return Ok(channel);
            }
        }

        // A request landing during Terminating (or on a dead worker) gets
        // a fresh process, never the dying one.
        inner.state = WorkerState::Starting;
        inner.runtime = None;
        info!(tenant = identity.tenant, "starting worker");

        let socket = identity.socket_path();
        let child = match self.launcher.spawn(identity, &socket) {
            Ok(child) => child,
            Err(e) => {
                inner.state = WorkerState::NoWorker;
                return Err(ApiError::fatal_provisioning(format!(
                    "failed to spawn worker for '{}': {e:#}",
                    identity.tenant
                )));
            }
        };

        let deadline = Instant::now() + Duration::from_millis(self.cfg.spawn_wait_ms);
        let channel = loop {
            if let Ok(channel) = WorkerChannel::connect(&socket).await {
                match channel.call(WorkerRequest::Ping, HANDSHAKE_DEADLINE).await {
                    Ok(WorkerResponse::Pong) => break channel,
                    Ok(other) => {
                        debug!(tenant = identity.tenant, "unexpected handshake reply: {other:?}")
                    }
                    Err(e) => debug!(tenant = identity.tenant, "handshake failed: {}", e.message),
                }
            }
            if Instant::now() >= deadline {
                inner.state = WorkerState::NoWorker;
                // `child` is dropped here; kill_on_drop reaps it.
                return Err(ApiError::fatal_provisioning(format!(
                    "worker for '{}' did not come up within {}ms",
                    identity.tenant, self.cfg.spawn_wait_ms
                )));
            }
            tokio::time::sleep(CONNECT_RETRY).await;
        };

        inner.runtime = Some(Runtime {
            channel: Arc::clone(&channel),
            child,
        });
        inner.state = WorkerState::Ready;
        info!(tenant = identity.tenant, "worker ready");
        Ok(channel)
    }

    /// Reset state after a channel failure, but only if the failed channel
    /// is still the current one; a replacement started meanwhile stays.
    async fn note_worker_lost(&self, slot: &TenantSlot, failed: &Arc<WorkerChannel>) {
        let mut inner = slot.inner.lock().await;
        if let Some(runtime) = &inner.runtime {
            if Arc::ptr_eq(&runtime.channel, failed) {
                inner.runtime = None;
                inner.state = WorkerState::NoWorker;
            }
        }
    }

    /// Explicit teardown of a tenant's worker. Succeeds when no worker is
    /// running.
    pub async fn reset(&self, tenant: &str) -> ApiResult<()> {
        let Some(slot) = self.slots.get(tenant).map(|s| s.clone()) else {
            return Ok(());
        };
        self.teardown(tenant, &slot).await;
        Ok(())
    }

    async fn teardown(&self, tenant: &str, slot: &TenantSlot) {
        let runtime = {
            let mut inner = slot.inner.lock().await;
            inner.state = WorkerState::Terminating;
            inner.runtime.take()
        };
        if let Some(mut runtime) = runtime {
            info!(tenant, "stopping worker");
            let _ = runtime
                .channel
                .call(WorkerRequest::Shutdown, SHUTDOWN_DEADLINE)
                .await;
            if let Err(e) = runtime.child.kill().await {
                debug!(tenant, "worker kill: {e}");
            }
        }
        let mut inner = slot.inner.lock().await;
        // A request may have started a replacement while we were killing
        // the old process; leave it alone.
        if inner.runtime.is_none() && inner.state == WorkerState::Terminating {
            inner.state = WorkerState::NoWorker;
        }
    }

    /// One idle pass: Ready workers quiet past the idle timeout become
    /// Idle; Idle ones are torn down. A request between passes flips the
    /// worker back to Ready via dispatch.
    pub async fn sweep(&self) {
        let idle_timeout = Duration::from_secs(self.cfg.idle_timeout_secs);
        let slots: Vec<(String, Arc<TenantSlot>)> = self
            .slots
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        for (tenant, slot) in slots {
            if slot.idle_for() < idle_timeout {
                continue;
            }
            let state = { slot.inner.lock().await.state };
            match state {
                WorkerState::Ready => {
                    let mut inner = slot.inner.lock().await;
                    if inner.state == WorkerState::Ready {
                        inner.state = WorkerState::Idle;
                        debug!(tenant, "worker idle");
                    }
                }
                WorkerState::Idle => {
                    info!(tenant, "reaping idle worker");
                    self.teardown(&tenant, &slot).await;
                }
                _ => {}
            }
        }
    }

    pub async fn run_sweeper(self: Arc<Self>) {
        let interval = Duration::from_secs(self.cfg.sweep_interval_secs.max(1));
        loop {
            tokio::time::sleep(interval).await;
            self.sweep().await;
        }
    }

    pub async fn states(&self) -> Vec<(String, WorkerState)> {
        let mut out = Vec::new();
        for entry in self.slots.iter() {
            let state = entry.value().inner.lock().await.state;
            out.push((entry.key().clone(), state));
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    pub async fn shutdown_all(&self) {
        let slots: Vec<(String, Arc<TenantSlot>)> = self
            .slots
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        for (tenant, slot) in slots {
            self.teardown(&tenant, &slot).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UsersConfig;
    use anyhow::Result;
    use std::path::Path;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::UnixListener;

    use hutch_proto::{RequestFrame, ResponseBody, ResponseFrame};

    /// Stands in for a real worker: holds a `sleep` child as the process
    /// and answers Pong to everything on the socket.
    struct MockLauncher;

    impl WorkerLauncher for MockLauncher {
        fn spawn(&self, _identity: &TenantIdentity, socket: &Path) -> Result<tokio::process::Child> {
            let socket = socket.to_path_buf();
            tokio::spawn(async move {
                let _ = std::fs::remove_file(&socket);
                let listener = UnixListener::bind(&socket).unwrap();
                loop {
                    let Ok((stream, _)) = listener.accept().await else {
                        break;
                    };
                    tokio::spawn(async move {
                        let (read_half, mut write_half) = stream.into_split();
                        let mut reader = BufReader::new(read_half);
                        let mut line = String::new();
                        loop {
                            line.clear();
                            if reader.read_line(&mut line).await.unwrap_or(0) == 0 {
                                break;
                            }
                            let frame: RequestFrame =
                                serde_json::from_str(line.trim()).unwrap();
                            let resp = ResponseFrame {
                                id: frame.id,
                                body: ResponseBody::Ok(WorkerResponse::Pong),
                            };
                            let mut out = serde_json::to_string(&resp).unwrap();
                            out.push('\n');
                            if write_half.write_all(out.as_bytes()).await.is_err() {
                                break;
                            }
                        }
                    });
                }
            });
            Ok(tokio::process::Command::new("sleep")
                .arg("600")
                .kill_on_drop(true)
                .spawn()?)
        }
    }

    fn test_supervisor(dir: &Path, idle_secs: u64) -> Arc<Supervisor> {
        let registry =
            Arc::new(Registry::open(UsersConfig::default(), dir.to_path_buf()).unwrap());
        let cfg = SupervisorConfig {
            idle_timeout_secs: idle_secs,
            ..Default::default()
        };
        Supervisor::new(registry, Box::new(MockLauncher), cfg)
    }

    #[tokio::test]
    async fn dispatch_starts_worker_and_forwards() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = test_supervisor(dir.path(), 900);

        let resp = supervisor
            .dispatch("a@example.com", WorkerRequest::Ping, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(matches!(resp, WorkerResponse::Pong));

        let states = supervisor.states().await;
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].1, WorkerState::Ready);
    }

    #[tokio::test]
    async fn worker_is_reused_across_calls() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = test_supervisor(dir.path(), 900);

        supervisor
            .dispatch("a@example.com", WorkerRequest::Ping, Duration::from_secs(5))
            .await
            .unwrap();
        supervisor
            .dispatch("a@example.com", WorkerRequest::Ping, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(supervisor.states().await.len(), 1);
    }

    #[tokio::test]
    async fn reset_tears_worker_down() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = test_supervisor(dir.path(), 900);

        supervisor
            .dispatch("a@example.com", WorkerRequest::Ping, Duration::from_secs(5))
            .await
            .unwrap();
        supervisor.reset("a@example.com").await.unwrap();
        let states = supervisor.states().await;
        assert_eq!(states[0].1, WorkerState::NoWorker);

        // Resetting a tenant without a worker is fine.
        supervisor.reset("nobody@example.com").await.unwrap();
    }

    #[tokio::test]
    async fn sweep_marks_idle_then_reaps() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = test_supervisor(dir.path(), 0);

        supervisor
            .dispatch("a@example.com", WorkerRequest::Ping, Duration::from_secs(5))
            .await
            .unwrap();

        supervisor.sweep().await;
        assert_eq!(supervisor.states().await[0].1, WorkerState::Idle);

        supervisor.sweep().await;
        assert_eq!(supervisor.states().await[0].1, WorkerState::NoWorker);

        // Next dispatch starts a fresh worker.
        let resp = supervisor
            .dispatch("a@example.com", WorkerRequest::Ping, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(matches!(resp, WorkerResponse::Pong));
    }
}
