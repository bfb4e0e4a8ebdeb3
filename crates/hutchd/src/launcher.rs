//! Spawning worker processes as tenant identities.
//!
//! The supervisor only knows the `WorkerLauncher` trait; the privileged
//! implementation shells `runuser`/`sudo`, and the same-user one backs
//! development mode and tests.

use std::path::Path;

use anyhow::{Context, Result, bail};
use tokio::process::{Child, Command};

use crate::registry::TenantIdentity;

pub trait WorkerLauncher: Send + Sync {
    fn spawn(&self, identity: &TenantIdentity, socket: &Path) -> Result<Child>;
}

fn worker_args(identity: &TenantIdentity, socket: &Path) -> Vec<String> {
    vec![
        "--socket".to_string(),
        socket.to_string_lossy().into_owned(),
        "--workspaces-dir".to_string(),
        identity.workspaces_dir().to_string_lossy().into_owned(),
        "--state-dir".to_string(),
        identity.state_dir().to_string_lossy().into_owned(),
    ]
}

/// Runs the worker as the tenant's OS user: `runuser -u` when hutchd is
/// root, `sudo -n -u` otherwise.
pub struct TenantUserLauncher {
    pub worker_binary: String,
    pub use_sudo: bool,
}

impl WorkerLauncher for TenantUserLauncher {
    fn spawn(&self, identity: &TenantIdentity, socket: &Path) -> Result<Child> {
        let args = worker_args(identity, socket);
        let mut cmd = if unsafe { libc::geteuid() } == 0 {
            let mut cmd = Command::new("runuser");
            cmd.args(["-u", &identity.username, "--", &self.worker_binary]);
            cmd
        } else if self.use_sudo {
            let mut cmd = Command::new("sudo");
            cmd.args(["-n", "-u", &identity.username, "--", &self.worker_binary]);
            cmd
        } else {
            bail!(
                "spawning worker for '{}' requires root or users.use_sudo = true",
                identity.username
            );
        };
        cmd.args(&args)
            .current_dir(&identity.home)
            .env("HOME", &identity.home)
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn worker for '{}'", identity.username))
    }
}

/// Development-mode launcher: the worker runs as the current user with the
/// tenant's dev home.
pub struct SameUserLauncher {
    pub worker_binary: String,
}

impl WorkerLauncher for SameUserLauncher {
    fn spawn(&self, identity: &TenantIdentity, socket: &Path) -> Result<Child> {
        Command::new(&self.worker_binary)
            .args(worker_args(identity, socket))
            .current_dir(&identity.home)
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn worker '{}'", self.worker_binary))
    }
}
