//! Client side of the worker IPC protocol.
//!
//! One persistent connection per worker. Calls are written as `{id, op}`
//! frames; a background read task routes `{id, ok|err}` frames to the
//! matching in-flight call via a pending map of oneshot channels, so
//! pipelined calls resolve independently of response order.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::net::unix::OwnedWriteHalf;
use tokio::sync::{Mutex, oneshot};
use tracing::{debug, warn};

use hutch_proto::{
    ErrorCode, RequestFrame, ResponseBody, ResponseFrame, WireError, WorkerRequest, WorkerResponse,
};

fn channel_lost(context: &str) -> WireError {
    WireError::new(
        ErrorCode::TransientWorker,
        format!("worker connection lost ({context}); retry will start a fresh worker"),
    )
}

pub struct WorkerChannel {
    next_id: AtomicU64,
    closed: AtomicBool,
    pending: Mutex<HashMap<u64, oneshot::Sender<ResponseBody>>>,
    writer: Mutex<OwnedWriteHalf>,
}

impl WorkerChannel {
    pub async fn connect(socket: &Path) -> std::io::Result<Arc<Self>> {
        let stream = UnixStream::connect(socket).await?;
        let (read_half, write_half) = stream.into_split();

        let channel = Arc::new(Self {
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            pending: Mutex::new(HashMap::new()),
            writer: Mutex::new(write_half),
        });

        let reader_channel = Arc::clone(&channel);
        tokio::spawn(async move {
            let mut reader = BufReader::new(read_half);
            let mut line = String::new();
            loop {
                line.clear();
                match reader.read_line(&mut line).await {
                    Ok(0) => break,
                    Ok(_) => {}
                    Err(e) => {
                        debug!("worker channel read error: {e}");
                        break;
                    }
                }
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let frame: ResponseFrame = match serde_json::from_str(trimmed) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!("discarding malformed worker response: {e}");
                        continue;
                    }
                };
                let sender = reader_channel.pending.lock().await.remove(&frame.id);
                match sender {
                    Some(tx) => {
                        let _ = tx.send(frame.body);
                    }
                    None => debug!("response for unknown or abandoned call id {}", frame.id),
                }
            }
            reader_channel.mark_closed("stream ended").await;
        });

        Ok(channel)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn mark_closed(&self, context: &str) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // Fail everything still in flight; retries go to a fresh worker.
        let pending: Vec<oneshot::Sender<ResponseBody>> = {
            let mut map = self.pending.lock().await;
            map.drain().map(|(_, tx)| tx).collect()
        };
        if !pending.is_empty() {
            debug!("failing {} in-flight call(s): {context}", pending.len());
        }
        for tx in pending {
            let _ = tx.send(ResponseBody::Err(channel_lost(context)));
        }
    }

    /// Issue one call and wait for its response, up to `deadline`. The
    /// deadline is an outer safety bound; operations with their own
    /// `timeout_ms` get it passed through plus a margin by the caller.
    pub async fn call(
        &self,
        op: WorkerRequest,
        deadline: Duration,
    ) -> Result<WorkerResponse, WireError> {
        if self.is_closed() {
            return Err(channel_lost("already closed"));
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);
        // The read task may have drained the pending map between the first
        // check and the insert.
        if self.is_closed() {
            self.pending.lock().await.remove(&id);
            return Err(channel_lost("already closed"));
        }

        let frame = RequestFrame { id, op };
        let mut line = serde_json::to_string(&frame)
            .map_err(|e| WireError::internal(format!("encode request: {e}")))?;
        line.push('\n');

        {
            let mut writer = self.writer.lock().await;
            if let Err(e) = writer.write_all(line.as_bytes()).await {
                self.pending.lock().await.remove(&id);
                self.mark_closed("write failed").await;
                return Err(channel_lost(&format!("write failed: {e}")));
            }
        }

        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(ResponseBody::Ok(resp))) => Ok(resp),
            Ok(Ok(ResponseBody::Err(err))) => Err(err),
            Ok(Err(_)) => Err(channel_lost("connection closed mid-call")),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(WireError::new(
                    ErrorCode::TransientWorker,
                    format!("worker call {id} did not respond within {deadline:?}"),
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::UnixListener;

    /// Minimal scripted worker: answers every parseable frame with Pong,
    /// out of order for pairs, and ignores one specific id to exercise the
    /// call timeout.
    async fn scripted_worker(listener: UnixListener) {
        let (stream, _) = listener.accept().await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        let mut line = String::new();
        let mut held: Option<u64> = None;
        loop {
            line.clear();
            if reader.read_line(&mut line).await.unwrap_or(0) == 0 {
                break;
            }
            let frame: RequestFrame = serde_json::from_str(line.trim()).unwrap();
            if frame.id == 999 {
                continue; // never answer
            }
            // Hold every other response back to force reordering.
            match held.take() {
                None => held = Some(frame.id),
                Some(earlier) => {
                    for id in [frame.id, earlier] {
                        let resp = ResponseFrame {
                            id,
                            body: ResponseBody::Ok(WorkerResponse::Pong),
                        };
                        let mut out = serde_json::to_string(&resp).unwrap();
                        out.push('\n');
                        write_half.write_all(out.as_bytes()).await.unwrap();
                    }
                }
            }
        }
    }

    #[tokio::test]
    async fn correlates_out_of_order_responses() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("w.sock");
        let listener = UnixListener::bind(&socket).unwrap();
        tokio::spawn(scripted_worker(listener));

        let channel = WorkerChannel::connect(&socket).await.unwrap();
        let a = channel.call(WorkerRequest::Ping, Duration::from_secs(5));
        let b = channel.call(WorkerRequest::Ping, Duration::from_secs(5));
        let (a, b) = tokio::join!(a, b);
        assert!(matches!(a.unwrap(), WorkerResponse::Pong));
        assert!(matches!(b.unwrap(), WorkerResponse::Pong));
    }

    #[tokio::test]
    async fn closed_channel_fails_in_flight_calls() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("w.sock");
        let listener = UnixListener::bind(&socket).unwrap();
        // Accept and immediately drop the connection.
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            drop(stream);
        });

        let channel = WorkerChannel::connect(&socket).await.unwrap();
        let err = channel
            .call(WorkerRequest::Ping, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::TransientWorker);
        assert!(channel.is_closed());

        let err = channel
            .call(WorkerRequest::Ping, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::TransientWorker);
    }
}
