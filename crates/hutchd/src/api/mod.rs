//! HTTP surface.
//!
//! Two routers on two bind addresses: the private one carries the RPC
//! endpoint for the trusted frontend, the public one carries only
//! token-gated transfer routes and the health probe. Nothing on the public
//! router touches a resource without a minted token.

pub mod rpc;

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::Router;
use axum::body::Body;
use axum::extract::{DefaultBodyLimit, Multipart, Path, State};
use axum::http::header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE};
use axum::http::{HeaderMap, HeaderValue};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use bytes::Bytes;
use futures::Stream;
use serde_json::json;
use tokio_util::io::ReaderStream;
use tower_http::trace::TraceLayer;

use crate::error::{ApiError, ApiResult};
use crate::registry::Registry;
use crate::supervisor::Supervisor;
use crate::transfer::{TransferBroker, TransferKind, TransferSession};

#[derive(Clone)]
pub struct AppState {
    pub supervisor: Arc<Supervisor>,
    pub registry: Arc<Registry>,
    pub broker: Arc<TransferBroker>,
}

/// Private router: RPC only. Bind this to a loopback or internal address.
pub fn rpc_router(state: AppState) -> Router {
    Router::new()
        .route("/rpc", post(rpc::handle_rpc))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Public router: token-gated transfers and the health probe.
pub fn public_router(state: AppState) -> Router {
    Router::new()
        .route(
            "/upload/{token}",
            post(handle_upload).layer(DefaultBodyLimit::disable()),
        )
        .route("/download/{token}", get(handle_download))
        .route("/health", get(handle_health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn handle_health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let workers = state.supervisor.states().await;
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "tenants": state.registry.tenant_count().await,
        "workers": workers.len(),
    }))
}

async fn handle_upload(
    State(state): State<AppState>,
    Path(token): Path<String>,
    mut multipart: Multipart,
) -> ApiResult<Json<serde_json::Value>> {
    let session = state.broker.claim(&token)?;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::validation(format!("malformed multipart body: {e}")))?
    {
        let Some(filename) = field.file_name().map(str::to_string) else {
            continue;
        };

        // Adapt the multipart field into the chunk stream the broker
        // consumes.
        let stream = Box::pin(futures::stream::unfold(field, |mut field| async move {
            match field.chunk().await {
                Ok(Some(chunk)) => Some((Ok(chunk), field)),
                Ok(None) => None,
                Err(e) => Some((Err(e.to_string()), field)),
            }
        }));

        let uploaded = state.broker.accept_upload(&session, &filename, stream).await?;
        return Ok(Json(json!({
            "status": "completed",
            "file": uploaded,
        })));
    }

    Err(ApiError::validation("multipart body contains no file part"))
}

/// Wraps the file stream so the token closes exactly on clean end of
/// stream; an aborted download releases its reservation and stays
/// claimable until expiry.
struct TrackedDownload {
    inner: ReaderStream<tokio::fs::File>,
    session: Arc<TransferSession>,
}

impl Stream for TrackedDownload {
    type Item = Result<Bytes, std::io::Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_next(cx) {
            Poll::Ready(None) => {
                this.session.mark_completed_if_open();
                Poll::Ready(None)
            }
            other => other,
        }
    }
}

impl Drop for TrackedDownload {
    fn drop(&mut self) {
        // No-op after clean completion; hands an interrupted download back.
        self.session.release();
    }
}

async fn handle_download(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> ApiResult<Response> {
    let session = state.broker.claim(&token)?;
    let TransferKind::Download { file } = &session.kind else {
        return Err(ApiError::validation("token is not a download token"));
    };
    if !session.reserve() {
        // A concurrent redemption took the token between claim and here.
        return Err(ApiError::not_found("unknown, expired, or used transfer token"));
    }

    let handle = match tokio::fs::File::open(file).await {
        Ok(handle) => handle,
        Err(e) => {
            session.release();
            return Err(ApiError::not_found(format!("download source unavailable: {e}")));
        }
    };
    let length = handle.metadata().await.ok().map(|m| m.len());

    let filename = file
        .file_name()
        .map(|n| n.to_string_lossy().replace('"', ""))
        .unwrap_or_else(|| "download".to_string());
    let mime = mime_guess::from_path(file).first_or_octet_stream();

    let mut headers = HeaderMap::new();
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_str(mime.as_ref())
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );
    headers.insert(
        CONTENT_DISPOSITION,
        HeaderValue::from_str(&format!("attachment; filename=\"{filename}\""))
            .unwrap_or_else(|_| HeaderValue::from_static("attachment")),
    );
    if let Some(length) = length {
        headers.insert(CONTENT_LENGTH, HeaderValue::from(length));
    }

    let stream = TrackedDownload {
        inner: ReaderStream::new(handle),
        session: Arc::clone(&session),
    };
    Ok((headers, Body::from_stream(stream)).into_response())
}
