//! Workspace data types shared between the worker and the supervisor.

use serde::{Deserialize, Serialize};

/// Summary of a workspace directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceInfo {
    pub name: String,
    /// Absolute path inside the tenant's home.
    pub path: String,
    /// Current branch, if the git metadata is readable.
    #[serde(default)]
    pub branch: Option<String>,
}

/// Lifecycle of one task in a workspace plan.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    InProgress,
    Done,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Task {
    pub title: String,
    /// Defaults to `pending` when the caller omits it.
    #[serde(default)]
    pub status: TaskStatus,
}

/// Plan document persisted as `.hutch/plan.json` inside a workspace.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlanDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<String>,
    #[serde(default)]
    pub tasks: Vec<Task>,
}

impl PlanDocument {
    /// Merge a partial update into this document. `None` fields keep their
    /// stored value; only provided fields are replaced.
    pub fn merge(&mut self, plan: Option<String>, tasks: Option<Vec<Task>>) {
        if let Some(plan) = plan {
            self.plan = Some(plan);
        }
        if let Some(tasks) = tasks {
            self.tasks = tasks;
        }
    }
}

/// One category of changed files in a status response, capped in size.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileList {
    /// Paths, at most the configured cap.
    pub files: Vec<String>,
    /// Total number of files in this category (may exceed `files.len()`).
    pub total: usize,
    /// True when `files` was capped. The full list is only reachable via a
    /// direct shell command in the terminal.
    pub truncated: bool,
}

impl FileList {
    pub fn capped(mut files: Vec<String>, cap: usize) -> Self {
        let total = files.len();
        let truncated = total > cap;
        files.truncate(cap);
        Self {
            files,
            total,
            truncated,
        }
    }
}

/// Live git status of a workspace plus its plan document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceStatus {
    pub name: String,
    pub branch: String,
    pub dirty: bool,
    #[serde(default)]
    pub remote_url: Option<String>,
    pub staged: FileList,
    pub unstaged: FileList,
    pub untracked: FileList,
    /// Commits ahead of upstream; `None` when no upstream is configured.
    #[serde(default)]
    pub ahead: Option<u32>,
    #[serde(default)]
    pub behind: Option<u32>,
    #[serde(default)]
    pub plan: Option<String>,
    #[serde(default)]
    pub tasks: Vec<Task>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_status_defaults_to_pending() {
        let task: Task = serde_json::from_str(r#"{"title":"write docs"}"#).unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
    }

    #[test]
    fn task_status_wire_names() {
        let task = Task {
            title: "t".into(),
            status: TaskStatus::InProgress,
        };
        let json = serde_json::to_string(&task).unwrap();
        assert!(json.contains("in_progress"));
    }

    #[test]
    fn plan_merge_partial_updates() {
        let mut doc = PlanDocument {
            plan: Some("ship v1".into()),
            tasks: vec![Task {
                title: "a".into(),
                status: TaskStatus::Done,
            }],
        };

        // Tasks-only update keeps the plan.
        doc.merge(
            None,
            Some(vec![Task {
                title: "b".into(),
                status: TaskStatus::Pending,
            }]),
        );
        assert_eq!(doc.plan.as_deref(), Some("ship v1"));
        assert_eq!(doc.tasks[0].title, "b");

        // Plan-only update keeps the tasks.
        doc.merge(Some("ship v2".into()), None);
        assert_eq!(doc.plan.as_deref(), Some("ship v2"));
        assert_eq!(doc.tasks[0].title, "b");
    }

    #[test]
    fn file_list_capping() {
        let files: Vec<String> = (0..10).map(|i| format!("f{i}")).collect();
        let list = FileList::capped(files, 3);
        assert_eq!(list.files.len(), 3);
        assert_eq!(list.total, 10);
        assert!(list.truncated);

        let list = FileList::capped(vec!["a".into()], 3);
        assert!(!list.truncated);
        assert_eq!(list.total, 1);
    }
}
