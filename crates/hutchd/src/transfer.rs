//! Token-gated file transfer broker.
//!
//! Tokens are minted over the private RPC surface and redeemed on the
//! public one, with no other authentication: an unguessable token plus a
//! deadline is the whole contract. Transfers bypass workers entirely;
//! hutchd streams bytes itself and hands ownership to the tenant
//! afterwards, so uploads and downloads work even while a worker is down.

use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use hutch_guard::{resolve_under, sanitize_filename, validate_workspace_name};

use crate::config::TransferConfig;
use crate::error::{ApiError, ApiResult};
use crate::registry::Registry;

const TOKEN_LEN: usize = 32;
/// Ceiling on caller-supplied link lifetimes: one week.
const MAX_EXPIRY_MINUTES: u64 = 7 * 24 * 60;
const TOKEN_ALPHABET: [char; 62] = [
    '0', '1', '2', '3', '4', '5', '6', '7', '8', '9', 'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h', 'i',
    'j', 'k', 'l', 'm', 'n', 'o', 'p', 'q', 'r', 's', 't', 'u', 'v', 'w', 'x', 'y', 'z', 'A', 'B',
    'C', 'D', 'E', 'F', 'G', 'H', 'I', 'J', 'K', 'L', 'M', 'N', 'O', 'P', 'Q', 'R', 'S', 'T', 'U',
    'V', 'W', 'X', 'Y', 'Z',
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    Active,
    /// Reserved by a redemption in progress; a second claim loses.
    InFlight,
    Completed,
    Expired,
}

#[derive(Debug)]
pub enum TransferKind {
    Upload {
        dest_dir: PathBuf,
        max_size: u64,
        /// Lowercased extensions without dots; empty means any.
        allowed_extensions: Vec<String>,
    },
    Download { file: PathBuf },
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadedFile {
    pub filename: String,
    pub size: u64,
    pub path: String,
}

#[derive(Debug)]
pub struct TransferSession {
    pub token: String,
    pub tenant: String,
    pub workspace: String,
    pub kind: TransferKind,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    status: StdMutex<TransferStatus>,
    result: StdMutex<Option<UploadedFile>>,
}

impl TransferSession {
    fn new(tenant: &str, workspace: &str, kind: TransferKind, expires_at: DateTime<Utc>) -> Self {
        Self {
            token: mint_token(),
            tenant: tenant.to_string(),
            workspace: workspace.to_string(),
            kind,
            created_at: Utc::now(),
            expires_at,
            status: StdMutex::new(TransferStatus::Active),
            result: StdMutex::new(None),
        }
    }

    pub fn status(&self) -> TransferStatus {
        *self.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Take the token for a redemption in progress. Exactly one of several
    /// concurrent claimants wins.
    pub fn reserve(&self) -> bool {
        let mut status = self.status.lock().unwrap_or_else(|e| e.into_inner());
        if *status == TransferStatus::Active {
            *status = TransferStatus::InFlight;
            true
        } else {
            false
        }
    }

    /// Hand back a reservation after an aborted redemption so the token is
    /// claimable again until expiry.
    pub fn release(&self) {
        let mut status = self.status.lock().unwrap_or_else(|e| e.into_inner());
        if *status == TransferStatus::InFlight {
            *status = TransferStatus::Active;
        }
    }

    /// Close the token after a successful transfer. Returns false when it
    /// was already closed (a concurrent redemption won).
    pub fn mark_completed_if_open(&self) -> bool {
        let mut status = self.status.lock().unwrap_or_else(|e| e.into_inner());
        match *status {
            TransferStatus::Active | TransferStatus::InFlight => {
                *status = TransferStatus::Completed;
                true
            }
            _ => false,
        }
    }

    pub fn uploaded(&self) -> Option<UploadedFile> {
        self.result.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

fn mint_token() -> String {
    nanoid::nanoid!(TOKEN_LEN, &TOKEN_ALPHABET)
}

#[derive(Debug, Serialize)]
pub struct UploadGrant {
    pub token: String,
    pub upload_url: String,
    pub expires_at: DateTime<Utc>,
    pub max_size_bytes: u64,
}

#[derive(Debug, Serialize)]
pub struct DownloadGrant {
    pub token: String,
    pub download_url: String,
    pub expires_at: DateTime<Utc>,
    pub filename: String,
}

pub struct TransferBroker {
    cfg: TransferConfig,
    registry: Arc<Registry>,
    public_base_url: String,
    sessions: DashMap<String, Arc<TransferSession>>,
}

impl TransferBroker {
    pub fn new(cfg: TransferConfig, registry: Arc<Registry>, public_base_url: String) -> Arc<Self> {
        Arc::new(Self {
            cfg,
            registry,
            public_base_url: public_base_url.trim_end_matches('/').to_string(),
            sessions: DashMap::new(),
        })
    }

    /// Lifetimes come straight from RPC params, so bound them before any
    /// arithmetic; `chrono::Duration::minutes` panics past `i64::MAX` ms.
    fn expiry(&self, minutes: Option<u64>) -> ApiResult<DateTime<Utc>> {
        let minutes = minutes.unwrap_or(self.cfg.default_expiry_minutes);
        if minutes == 0 || minutes > MAX_EXPIRY_MINUTES {
            return Err(ApiError::validation(format!(
                "expires_in_minutes must be between 1 and {MAX_EXPIRY_MINUTES}"
            )));
        }
        Ok(Utc::now() + ChronoDuration::minutes(minutes as i64))
    }

    async fn workspace_dir(&self, tenant: &str, workspace: &str) -> ApiResult<PathBuf> {
        validate_workspace_name(workspace)?;
        let identity = self.registry.ensure_tenant(tenant).await?;
        let ws_dir = identity.workspaces_dir().join(workspace);
        if !ws_dir.is_dir() {
            return Err(ApiError::not_found(format!(
                "workspace '{workspace}' not found"
            )));
        }
        Ok(ws_dir)
    }

    pub async fn create_upload_session(
        &self,
        tenant: &str,
        workspace: &str,
        target_directory: Option<&str>,
        expires_in_minutes: Option<u64>,
        max_size_mb: Option<u64>,
        allowed_extensions: Option<Vec<String>>,
    ) -> ApiResult<UploadGrant> {
        let expires_at = self.expiry(expires_in_minutes)?;
        let ws_dir = self.workspace_dir(tenant, workspace).await?;
        let dest_dir = match target_directory {
            Some(rel) if !rel.is_empty() && rel != "." => resolve_under(&ws_dir, rel)?,
            _ => ws_dir,
        };

        let hard_cap = self.cfg.max_upload_mb.saturating_mul(1024 * 1024);
        let max_size = max_size_mb
            .map(|mb| mb.saturating_mul(1024 * 1024))
            .unwrap_or(hard_cap)
            .min(hard_cap);
        let allowed_extensions = allowed_extensions
            .unwrap_or_default()
            .into_iter()
            .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
            .collect();

        let session = Arc::new(TransferSession::new(
            tenant,
            workspace,
            TransferKind::Upload {
                dest_dir,
                max_size,
                allowed_extensions,
            },
            expires_at,
        ));
        let token = session.token.clone();
        self.sessions.insert(token.clone(), session);
        info!(tenant, workspace, "upload session created");

        Ok(UploadGrant {
            upload_url: format!("{}/upload/{token}", self.public_base_url),
            token,
            expires_at,
            max_size_bytes: max_size,
        })
    }

    pub async fn create_download_link(
        &self,
        tenant: &str,
        workspace: &str,
        relative_path: &str,
        expires_in_minutes: Option<u64>,
    ) -> ApiResult<DownloadGrant> {
        let expires_at = self.expiry(expires_in_minutes)?;
        let ws_dir = self.workspace_dir(tenant, workspace).await?;
        let file = resolve_under(&ws_dir, relative_path)?;
        if !file.is_file() {
            return Err(ApiError::not_found(format!(
                "file '{relative_path}' not found in workspace '{workspace}'"
            )));
        }
        let filename = file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "download".to_string());

        let session = Arc::new(TransferSession::new(
            tenant,
            workspace,
            TransferKind::Download { file },
            expires_at,
        ));
        let token = session.token.clone();
        self.sessions.insert(token.clone(), session);
        info!(tenant, workspace, relative_path, "download link created");

        Ok(DownloadGrant {
            download_url: format!("{}/download/{token}", self.public_base_url),
            token,
            expires_at,
            filename,
        })
    }

    /// Look up a token for redemption. Expiry is checked lazily here, on
    /// every access; the background sweep only reclaims memory. Unknown,
    /// expired, and used tokens are indistinguishable to the caller.
    pub fn claim(&self, token: &str) -> ApiResult<Arc<TransferSession>> {
        let rejected = || ApiError::not_found("unknown, expired, or used transfer token");
        let session = self
            .sessions
            .get(token)
            .map(|e| e.value().clone())
            .ok_or_else(rejected)?;

        let mut status = session.status.lock().unwrap_or_else(|e| e.into_inner());
        match *status {
            TransferStatus::Active if Utc::now() > session.expires_at => {
                *status = TransferStatus::Expired;
                debug!(token, "transfer token expired on access");
                Err(rejected())
            }
            TransferStatus::Active => {
                drop(status);
                Ok(session)
            }
            _ => Err(rejected()),
        }
    }

    /// Stream an upload body into the session's destination. Size is
    /// enforced per chunk so an oversized body stops early, and the file
    /// only appears under its real name after a complete stream.
    pub async fn accept_upload<S, E>(
        &self,
        session: &TransferSession,
        filename: &str,
        mut body: S,
    ) -> ApiResult<UploadedFile>
    where
        S: futures::Stream<Item = Result<bytes::Bytes, E>> + Unpin,
        E: std::fmt::Display,
    {
        use futures::StreamExt;

        let TransferKind::Upload {
            dest_dir,
            max_size,
            allowed_extensions,
        } = &session.kind
        else {
            return Err(ApiError::validation("token is not an upload token"));
        };

        let filename = sanitize_filename(filename)
            .ok_or_else(|| ApiError::validation(format!("unusable filename '{filename}'")))?;
        if !allowed_extensions.is_empty() {
            let ext = std::path::Path::new(&filename)
                .extension()
                .map(|e| e.to_string_lossy().to_ascii_lowercase())
                .unwrap_or_default();
            if !allowed_extensions.contains(&ext) {
                return Err(ApiError::resource_exhausted(format!(
                    "extension '{ext}' is not allowed for this upload"
                )));
            }
        }

        tokio::fs::create_dir_all(dest_dir)
            .await
            .map_err(|e| ApiError::Internal(anyhow::anyhow!("create upload dir: {e}")))?;

        // Temp file sits next to the destination so the final rename is
        // atomic on the same filesystem.
        let tmp_path = dest_dir.join(format!(".{}.{}.part", filename, session.token));
        let mut tmp = tokio::fs::File::create(&tmp_path)
            .await
            .map_err(|e| ApiError::Internal(anyhow::anyhow!("create temp file: {e}")))?;

        let mut written: u64 = 0;
        let stream_result: ApiResult<()> = loop {
            let Some(chunk) = body.next().await else {
                break Ok(());
            };
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => break Err(ApiError::Internal(anyhow::anyhow!("upload stream: {e}"))),
            };
            written += chunk.len() as u64;
            if written > *max_size {
                break Err(ApiError::resource_exhausted(format!(
                    "upload exceeds the {max_size} byte limit"
                )));
            }
            if let Err(e) = tmp.write_all(&chunk).await {
                break Err(ApiError::Internal(anyhow::anyhow!("write upload: {e}")));
            }
        };
        let stream_result = match stream_result {
            Ok(()) => tmp
                .flush()
                .await
                .map_err(|e| ApiError::Internal(anyhow::anyhow!("flush upload: {e}"))),
            Err(e) => Err(e),
        };
        drop(tmp);
        if let Err(e) = stream_result {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(e);
        }

        // Close the token and publish the file in one step; a concurrent
        // second redemption of the same token loses and cleans up. The
        // rename is synchronous so the guard never crosses an await.
        let final_path = dest_dir.join(&filename);
        let finalized = {
            let mut status = session.status.lock().unwrap_or_else(|e| e.into_inner());
            match *status {
                TransferStatus::Active | TransferStatus::InFlight => {
                    match std::fs::rename(&tmp_path, &final_path) {
                        Ok(()) => {
                            *status = TransferStatus::Completed;
                            Ok(())
                        }
                        Err(e) => Err(ApiError::Internal(anyhow::anyhow!("finalize upload: {e}"))),
                    }
                }
                _ => Err(ApiError::not_found("transfer token already used")),
            }
        };
        if let Err(e) = finalized {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(e);
        }

        let identity = self.registry.ensure_tenant(&session.tenant).await?;
        if let Err(e) = self.registry.chown_to(&identity, &final_path).await {
            warn!(tenant = session.tenant, error = %format!("{e:#}"), "chown of upload failed");
        }

        let uploaded = UploadedFile {
            filename: filename.clone(),
            size: written,
            path: final_path.to_string_lossy().into_owned(),
        };
        *session.result.lock().unwrap_or_else(|e| e.into_inner()) = Some(uploaded.clone());
        info!(
            tenant = session.tenant,
            workspace = session.workspace,
            filename,
            size = written,
            "upload completed"
        );
        Ok(uploaded)
    }

    /// Reclaim finished and expired sessions. Correctness does not depend
    /// on this; `claim` re-checks expiry every time.
    pub fn sweep(&self) {
        let now = Utc::now();
        self.sessions.retain(|_, session| {
            matches!(
                session.status(),
                TransferStatus::Active | TransferStatus::InFlight
            ) && now <= session.expires_at
        });
    }

    pub async fn run_sweeper(self: Arc<Self>) {
        let interval = std::time::Duration::from_secs(self.cfg.sweep_interval_secs.max(1));
        loop {
            tokio::time::sleep(interval).await;
            self.sweep();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UsersConfig;

    fn test_broker(dir: &std::path::Path) -> (Arc<TransferBroker>, Arc<Registry>) {
        let registry =
            Arc::new(Registry::open(UsersConfig::default(), dir.to_path_buf()).unwrap());
        let broker = TransferBroker::new(
            TransferConfig::default(),
            Arc::clone(&registry),
            "http://localhost:7761".to_string(),
        );
        (broker, registry)
    }

    fn body_of(data: &[u8]) -> impl futures::Stream<Item = Result<bytes::Bytes, String>> + Unpin {
        futures::stream::iter(vec![Ok(bytes::Bytes::copy_from_slice(data))])
    }

    #[tokio::test]
    async fn upload_lands_in_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let (broker, _) = test_broker(dir.path());

        let grant = broker
            .create_upload_session("u@example.com", "default", None, None, None, None)
            .await
            .unwrap();
        assert!(grant.upload_url.contains(&grant.token));

        let session = broker.claim(&grant.token).unwrap();
        let uploaded = broker
            .accept_upload(&session, "data.txt", body_of(b"hello"))
            .await
            .unwrap();
        assert_eq!(uploaded.filename, "data.txt");
        assert_eq!(uploaded.size, 5);
        assert_eq!(std::fs::read(&uploaded.path).unwrap(), b"hello");
        assert!(session.uploaded().is_some());

        // Completed token is permanently rejected.
        assert!(broker.claim(&grant.token).is_err());
    }

    #[tokio::test]
    async fn upload_size_cap_short_circuits() {
        let dir = tempfile::tempdir().unwrap();
        let (broker, registry) = test_broker(dir.path());

        let grant = broker
            .create_upload_session("u@example.com", "default", None, None, Some(0), None)
            .await
            .unwrap();
        // 0 MB cap: any byte is too many.
        let session = broker.claim(&grant.token).unwrap();
        let err = broker
            .accept_upload(&session, "big.bin", body_of(b"xx"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), hutch_proto::ErrorCode::ResourceExhausted);

        // Failed upload leaves no partial file behind.
        let identity = registry.lookup("u@example.com").await.unwrap();
        let ws = identity.workspaces_dir().join("default");
        let leftovers: Vec<_> = std::fs::read_dir(&ws)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains("part"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn upload_respects_extension_allowlist() {
        let dir = tempfile::tempdir().unwrap();
        let (broker, _) = test_broker(dir.path());

        let grant = broker
            .create_upload_session(
                "u@example.com",
                "default",
                None,
                None,
                None,
                Some(vec!["txt".into(), ".CSV".into()]),
            )
            .await
            .unwrap();

        let session = broker.claim(&grant.token).unwrap();
        let err = broker
            .accept_upload(&session, "payload.exe", body_of(b"mz"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), hutch_proto::ErrorCode::ResourceExhausted);

        // Allowlist comparison is case-insensitive and dot-agnostic; the
        // rejected attempt did not consume the token.
        let session = broker.claim(&grant.token).unwrap();
        broker
            .accept_upload(&session, "table.csv", body_of(b"a,b"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn upload_rejects_traversal_target() {
        let dir = tempfile::tempdir().unwrap();
        let (broker, _) = test_broker(dir.path());

        let err = broker
            .create_upload_session(
                "u@example.com",
                "default",
                Some("../../etc"),
                None,
                None,
                None,
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), hutch_proto::ErrorCode::Validation);
    }

    #[tokio::test]
    async fn upload_into_subdirectory() {
        let dir = tempfile::tempdir().unwrap();
        let (broker, registry) = test_broker(dir.path());

        let grant = broker
            .create_upload_session("u@example.com", "default", Some("incoming/docs"), None, None, None)
            .await
            .unwrap();
        let session = broker.claim(&grant.token).unwrap();
        let uploaded = broker
            .accept_upload(&session, "a.txt", body_of(b"1"))
            .await
            .unwrap();

        let identity = registry.lookup("u@example.com").await.unwrap();
        let expected = identity
            .workspaces_dir()
            .join("default")
            .join("incoming")
            .join("docs")
            .join("a.txt");
        assert_eq!(PathBuf::from(&uploaded.path), expected);
        assert!(expected.is_file());
    }

    #[tokio::test]
    async fn download_link_requires_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let (broker, registry) = test_broker(dir.path());

        let identity = registry.ensure_tenant("u@example.com").await.unwrap();
        let ws = identity.workspaces_dir().join("default");
        std::fs::write(ws.join("report.pdf"), b"%PDF").unwrap();

        let err = broker
            .create_download_link("u@example.com", "default", "missing.pdf", None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), hutch_proto::ErrorCode::NotFound);

        let grant = broker
            .create_download_link("u@example.com", "default", "report.pdf", None)
            .await
            .unwrap();
        assert_eq!(grant.filename, "report.pdf");

        let session = broker.claim(&grant.token).unwrap();
        // Clean end-of-stream closes the token; until then a retry is
        // still possible.
        assert_eq!(session.status(), TransferStatus::Active);
        assert!(broker.claim(&grant.token).is_ok());
        assert!(session.mark_completed_if_open());
        assert!(broker.claim(&grant.token).is_err());
    }

    #[tokio::test]
    async fn download_reservation_admits_one_redemption() {
        let dir = tempfile::tempdir().unwrap();
        let (broker, registry) = test_broker(dir.path());

        let identity = registry.ensure_tenant("u@example.com").await.unwrap();
        std::fs::write(
            identity.workspaces_dir().join("default").join("out.bin"),
            b"data",
        )
        .unwrap();
        let grant = broker
            .create_download_link("u@example.com", "default", "out.bin", None)
            .await
            .unwrap();

        // Two claimants race: only one reservation wins, and the loser's
        // claim is rejected outright.
        let winner = broker.claim(&grant.token).unwrap();
        assert!(winner.reserve());
        assert!(!winner.reserve());
        assert!(broker.claim(&grant.token).is_err());

        // An aborted redemption hands the token back.
        winner.release();
        let retry = broker.claim(&grant.token).unwrap();
        assert!(retry.reserve());

        // Clean completion closes it permanently; release is a no-op then.
        assert!(retry.mark_completed_if_open());
        retry.release();
        assert_eq!(retry.status(), TransferStatus::Completed);
        assert!(broker.claim(&grant.token).is_err());
    }

    #[tokio::test]
    async fn lifetime_bounds_are_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let (broker, _) = test_broker(dir.path());

        for bad in [0, u64::MAX, MAX_EXPIRY_MINUTES + 1] {
            let err = broker
                .create_upload_session("u@example.com", "default", None, Some(bad), None, None)
                .await
                .unwrap_err();
            assert_eq!(err.code(), hutch_proto::ErrorCode::Validation, "minutes={bad}");
        }

        let err = broker
            .create_download_link("u@example.com", "default", "x", Some(u64::MAX))
            .await
            .unwrap_err();
        assert_eq!(err.code(), hutch_proto::ErrorCode::Validation);

        let grant = broker
            .create_upload_session(
                "u@example.com",
                "default",
                None,
                Some(MAX_EXPIRY_MINUTES),
                None,
                None,
            )
            .await
            .unwrap();
        assert!(grant.expires_at > Utc::now());
    }

    #[tokio::test]
    async fn oversized_size_cap_saturates_to_config_limit() {
        let dir = tempfile::tempdir().unwrap();
        let (broker, _) = test_broker(dir.path());

        let grant = broker
            .create_upload_session(
                "u@example.com",
                "default",
                None,
                None,
                Some(u64::MAX),
                None,
            )
            .await
            .unwrap();
        let hard_cap = TransferConfig::default().max_upload_mb * 1024 * 1024;
        assert_eq!(grant.max_size_bytes, hard_cap);
    }

    #[tokio::test]
    async fn upload_future_is_send() {
        fn require_send<T: Send>(v: T) -> T {
            v
        }

        let dir = tempfile::tempdir().unwrap();
        let (broker, _) = test_broker(dir.path());
        let grant = broker
            .create_upload_session("u@example.com", "default", None, None, None, None)
            .await
            .unwrap();
        let session = broker.claim(&grant.token).unwrap();

        // accept_upload runs inside spawned HTTP tasks, so its future must
        // stay Send end to end.
        let uploaded = require_send(broker.accept_upload(&session, "s.txt", body_of(b"ok")))
            .await
            .unwrap();
        assert_eq!(uploaded.size, 2);
    }

    #[tokio::test]
    async fn expired_tokens_reject_lazily_and_sweep_reclaims() {
        let dir = tempfile::tempdir().unwrap();
        let (broker, _) = test_broker(dir.path());

        // Plant a session whose deadline is already in the past; no sweep
        // has run, so only the lazy check in claim() can catch it.
        let mut session = TransferSession::new(
            "u@example.com",
            "default",
            TransferKind::Upload {
                dest_dir: dir.path().to_path_buf(),
                max_size: 1024,
                allowed_extensions: Vec::new(),
            },
            Utc::now() - ChronoDuration::minutes(5),
        );
        session.created_at = Utc::now() - ChronoDuration::minutes(20);
        let token = session.token.clone();
        broker.sessions.insert(token.clone(), Arc::new(session));

        let err = broker.claim(&token).unwrap_err();
        assert_eq!(err.code(), hutch_proto::ErrorCode::NotFound);

        broker.sweep();
        assert!(broker.sessions.get(&token).is_none());
    }

    #[test]
    fn tokens_are_long_and_url_safe() {
        let token = mint_token();
        assert_eq!(token.len(), TOKEN_LEN);
        assert!(token.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(mint_token(), mint_token());
    }
}
