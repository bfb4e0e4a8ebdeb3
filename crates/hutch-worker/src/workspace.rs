//! Workspace operations: directories under the tenant's workspaces root,
//! each a git repository, each carrying an optional plan document under
//! `.hutch/plan.json`.
//!
//! Git state is read by shelling out to `git`. Nothing here caches: every
//! status call reflects the repository at call time.

use std::path::{Path, PathBuf};

use log::{info, warn};
use tokio::process::Command;

use hutch_guard::{DEFAULT_WORKSPACE, WORKSPACE_META_DIR, validate_workspace_name};
use hutch_proto::workspace::FileList;
use hutch_proto::{
    CreateWorkspaceRequest, DeleteWorkspaceRequest, PlanDocument, SetWorkspacePlanRequest,
    WireError, WorkspaceDeletedResponse, WorkspaceInfo, WorkspaceListResponse, WorkspaceStatus,
    WorkspaceStatusRequest,
};

const PLAN_FILE: &str = "plan.json";
const FILE_LIST_CAP: usize = 100;

pub struct WorkspaceStore {
    root: PathBuf,
}

impl WorkspaceStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_of(&self, name: &str) -> Result<PathBuf, WireError> {
        validate_workspace_name(name).map_err(|e| WireError::validation(e.to_string()))?;
        Ok(self.root.join(name))
    }

    fn existing_path(&self, name: &str) -> Result<PathBuf, WireError> {
        let path = self.path_of(name)?;
        if !path.is_dir() {
            return Err(WireError::not_found(format!("workspace '{name}' not found")));
        }
        Ok(path)
    }

    async fn git(&self, dir: &Path, args: &[&str]) -> Result<String, WireError> {
        let output = Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .await
            .map_err(|e| WireError::internal(format!("failed to run git: {e}")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(WireError::internal(format!(
                "git {} failed: {}",
                args.first().copied().unwrap_or(""),
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Best-effort variant for fields that are optional in a status reply.
    async fn git_opt(&self, dir: &Path, args: &[&str]) -> Option<String> {
        match self.git(dir, args).await {
            Ok(out) => Some(out.trim().to_string()).filter(|s| !s.is_empty()),
            Err(_) => None,
        }
    }

    pub async fn list(&self) -> Result<WorkspaceListResponse, WireError> {
        let mut workspaces = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(e) => e,
            // Root not provisioned yet means no workspaces, not a failure.
            Err(_) => return Ok(WorkspaceListResponse { workspaces }),
        };
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| WireError::internal(format!("read workspaces dir: {e}")))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') || validate_workspace_name(&name).is_err() {
                continue;
            }
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let branch = self.git_opt(&path, &["symbolic-ref", "--short", "HEAD"]).await;
            workspaces.push(WorkspaceInfo {
                name,
                path: path.to_string_lossy().into_owned(),
                branch,
            });
        }
        workspaces.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(WorkspaceListResponse { workspaces })
    }

    pub async fn create(&self, req: &CreateWorkspaceRequest) -> Result<WorkspaceInfo, WireError> {
        let path = self.path_of(&req.name)?;
        if path.exists() {
            return Err(WireError::conflict(format!(
                "workspace '{}' already exists",
                req.name
            )));
        }
        if let Some(branch) = &req.branch {
            validate_ref_arg(branch, "branch")?;
        }
        if let Some(url) = &req.git_url {
            validate_ref_arg(url, "git url")?;
        }

        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| WireError::internal(format!("create workspaces root: {e}")))?;

        let result = match &req.git_url {
            Some(url) => {
                let path_str = path.to_string_lossy().into_owned();
                let mut args = vec!["clone"];
                if let Some(branch) = &req.branch {
                    args.push("--branch");
                    args.push(branch);
                }
                args.push(url);
                args.push(&path_str);
                self.git(&self.root, &args).await.map(|_| ())
            }
            None => {
                let branch = req.branch.as_deref().unwrap_or("main");
                match tokio::fs::create_dir(&path).await {
                    Ok(()) => self
                        .git(&path, &["init", "--initial-branch", branch])
                        .await
                        .map(|_| ()),
                    Err(e) => Err(WireError::internal(format!("create workspace dir: {e}"))),
                }
            }
        };

        if let Err(e) = result {
            // Leave no partial workspace behind.
            let _ = tokio::fs::remove_dir_all(&path).await;
            warn!("workspace '{}' creation failed: {}", req.name, e.message);
            return Err(e);
        }

        let branch = self.git_opt(&path, &["symbolic-ref", "--short", "HEAD"]).await;
        info!("workspace '{}' created at {}", req.name, path.display());
        Ok(WorkspaceInfo {
            name: req.name.clone(),
            path: path.to_string_lossy().into_owned(),
            branch,
        })
    }

    pub async fn delete(
        &self,
        req: &DeleteWorkspaceRequest,
    ) -> Result<WorkspaceDeletedResponse, WireError> {
        if req.name == DEFAULT_WORKSPACE {
            return Err(WireError::conflict(format!(
                "the '{DEFAULT_WORKSPACE}' workspace cannot be deleted"
            )));
        }
        if !req.confirm {
            return Err(WireError::conflict(format!(
                "deleting '{}' requires explicit confirmation",
                req.name
            )));
        }
        let path = self.existing_path(&req.name)?;
        tokio::fs::remove_dir_all(&path)
            .await
            .map_err(|e| WireError::internal(format!("delete workspace: {e}")))?;
        info!("workspace '{}' deleted", req.name);
        Ok(WorkspaceDeletedResponse {
            name: req.name.clone(),
        })
    }

    pub async fn status(&self, req: &WorkspaceStatusRequest) -> Result<WorkspaceStatus, WireError> {
        let path = self.existing_path(&req.name)?;

        let branch = match self.git_opt(&path, &["symbolic-ref", "--short", "HEAD"]).await {
            Some(b) => b,
            // Detached HEAD still has a commit to name.
            None => self
                .git_opt(&path, &["rev-parse", "--short", "HEAD"])
                .await
                .map(|c| format!("detached@{c}"))
                .unwrap_or_else(|| "unknown".to_string()),
        };

        let porcelain = self.git_opt(&path, &["status", "--porcelain"]).await;
        let (staged, unstaged, untracked) =
            parse_porcelain(porcelain.as_deref().unwrap_or_default());
        let dirty = !staged.is_empty() || !unstaged.is_empty() || !untracked.is_empty();

        let remote_url = self.git_opt(&path, &["remote", "get-url", "origin"]).await;
        let (ahead, behind) = match self
            .git_opt(&path, &["rev-list", "--left-right", "--count", "HEAD...@{upstream}"])
            .await
        {
            Some(counts) => parse_ahead_behind(&counts),
            None => (None, None),
        };

        let plan = self.load_plan(&path).await?;

        Ok(WorkspaceStatus {
            name: req.name.clone(),
            branch,
            dirty,
            remote_url,
            staged: FileList::capped(staged, FILE_LIST_CAP),
            unstaged: FileList::capped(unstaged, FILE_LIST_CAP),
            untracked: FileList::capped(untracked, FILE_LIST_CAP),
            ahead,
            behind,
            plan: plan.plan,
            tasks: plan.tasks,
        })
    }

    pub async fn set_plan(&self, req: &SetWorkspacePlanRequest) -> Result<PlanDocument, WireError> {
        let path = self.existing_path(&req.name)?;
        let mut doc = self.load_plan(&path).await?;
        doc.merge(req.plan.clone(), req.tasks.clone());
        self.save_plan(&path, &doc).await?;
        Ok(doc)
    }

    fn plan_path(workspace: &Path) -> PathBuf {
        workspace.join(WORKSPACE_META_DIR).join(PLAN_FILE)
    }

    async fn load_plan(&self, workspace: &Path) -> Result<PlanDocument, WireError> {
        match tokio::fs::read_to_string(Self::plan_path(workspace)).await {
            Ok(contents) => serde_json::from_str(&contents)
                .map_err(|e| WireError::internal(format!("corrupt plan file: {e}"))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(PlanDocument::default()),
            Err(e) => Err(WireError::internal(format!("read plan file: {e}"))),
        }
    }

    async fn save_plan(&self, workspace: &Path, doc: &PlanDocument) -> Result<(), WireError> {
        let path = Self::plan_path(workspace);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| WireError::internal(format!("create plan dir: {e}")))?;
        }
        let json = serde_json::to_string_pretty(doc)
            .map_err(|e| WireError::internal(format!("encode plan: {e}")))?;
        // Write-then-rename so readers never see a half-written plan.
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| WireError::internal(format!("write plan file: {e}")))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| WireError::internal(format!("commit plan file: {e}")))?;
        Ok(())
    }
}

/// Reject values that would be parsed as git options.
fn validate_ref_arg(value: &str, what: &str) -> Result<(), WireError> {
    if value.is_empty()
        || value.starts_with('-')
        || value.chars().any(|c| c.is_whitespace() || c.is_control())
    {
        return Err(WireError::validation(format!("invalid {what}: '{value}'")));
    }
    Ok(())
}

/// Split `git status --porcelain` output into staged, unstaged, and
/// untracked paths. A path can appear in both staged and unstaged when it
/// has index changes and further worktree changes on top.
fn parse_porcelain(output: &str) -> (Vec<String>, Vec<String>, Vec<String>) {
    let mut staged = Vec::new();
    let mut unstaged = Vec::new();
    let mut untracked = Vec::new();
    for line in output.lines() {
        if line.len() < 4 {
            continue;
        }
        let index = line.as_bytes()[0] as char;
        let worktree = line.as_bytes()[1] as char;
        let rest = &line[3..];
        // Renames list both sides; the current name is on the right.
        let path = match rest.split_once(" -> ") {
            Some((_, new)) => new,
            None => rest,
        };
        let path = path.trim_matches('"').to_string();
        if index == '?' && worktree == '?' {
            untracked.push(path);
            continue;
        }
        if index != ' ' && index != '?' {
            staged.push(path.clone());
        }
        if worktree != ' ' && worktree != '?' {
            unstaged.push(path);
        }
    }
    (staged, unstaged, untracked)
}

/// Parse `git rev-list --left-right --count HEAD...@{upstream}` output,
/// which is "<ahead>\t<behind>".
fn parse_ahead_behind(counts: &str) -> (Option<u32>, Option<u32>) {
    let mut parts = counts.split_whitespace();
    let ahead = parts.next().and_then(|s| s.parse().ok());
    let behind = parts.next().and_then(|s| s.parse().ok());
    (ahead, behind)
}
