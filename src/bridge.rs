//! Per-connection bridge between a streaming HTTP client and one upstream
//! subprocess
//!
//! Each connection moves through a fixed sequence: authenticate, rate-check,
//! spawn, forward the initial payload, stream output lines as SSE events,
//! clean up. Rejections happen before anything is spawned or registered.
//! Cleanup (terminate the subprocess, drop the registry entry) runs exactly
//! once on every exit path: upstream end-of-stream, client disconnect,
//! server shutdown, or an internal error.

use crate::auth::{extract_token, AuthDecision};
use crate::error::{json_error_response, BridgeErrorCode, EventBody, StreamError};
use crate::limiter::source_key;
use crate::registry::{ConnectionRegistry, Session};
use crate::server::BridgeContext;
use crate::supervisor::ProcessSupervisor;
use http_body_util::{BodyExt, StreamBody};
use hyper::body::{Bytes, Frame, Incoming};
use hyper::{Request, Response, StatusCode};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info};
use uuid::Uuid;

/// SSE frames in flight; capacity 1 keeps at most a single buffered line
type EventSender = mpsc::Sender<Result<Frame<Bytes>, std::io::Error>>;

/// How a streaming phase ended, cleanup pending in every case
enum SessionEnd {
    /// Upstream closed its output
    Eof,
    /// Client went away
    Cancelled,
    /// Process-wide shutdown requested
    ShuttingDown,
}

/// Handle one POST to the SSE endpoint end-to-end
pub async fn open_stream(
    req: Request<Incoming>,
    ctx: Arc<BridgeContext>,
    client_addr: SocketAddr,
) -> Result<Response<EventBody>, hyper::Error> {
    // Authenticating
    let token = extract_token(req.headers());
    let identity = match ctx.credentials.authenticate(token.as_deref()) {
        AuthDecision::Allowed { identity } => identity,
        AuthDecision::Denied => {
            debug!(addr = %client_addr, "Rejected request with invalid credentials");
            return Ok(json_error_response(
                BridgeErrorCode::Unauthorized,
                "Unauthorized",
            ));
        }
    };

    // RateChecking
    let source = source_key(req.headers(), client_addr);
    if !ctx.limiter.allow(&source) {
        debug!(source, "Rejected request over quota");
        return Ok(json_error_response(
            BridgeErrorCode::RateLimited,
            "Too many requests",
        ));
    }

    // The request body becomes the upstream's first input line; collect it
    // before spawning so a broken client costs no process
    let initial = req.into_body().collect().await?.to_bytes();

    // Spawning
    let session_id = Uuid::new_v4();
    let supervisor = match ProcessSupervisor::spawn(
        &ctx.upstream.command,
        &ctx.upstream.args,
        session_id,
    ) {
        Ok(supervisor) => supervisor,
        Err(e) => {
            error!(
                session_id = %session_id,
                command = %ctx.upstream.command,
                error = %e,
                "Failed to spawn upstream process"
            );
            return Ok(json_error_response(
                BridgeErrorCode::UpstreamSpawnFailed,
                "Upstream unavailable",
            ));
        }
    };

    ctx.registry.register(Session::new(
        session_id,
        client_addr,
        identity.clone(),
        supervisor.pid(),
    ));
    info!(
        session_id = %session_id,
        addr = %client_addr,
        identity = ?identity,
        "Streaming connection established"
    );

    let (tx, rx) = mpsc::channel(1);
    let guard = SessionGuard {
        supervisor: Some(supervisor),
        registry: Arc::clone(&ctx.registry),
        session_id,
        grace: ctx.upstream.shutdown_grace_period(),
    };
    let shutdown_rx = ctx.shutdown_rx.clone();

    tokio::spawn(pump_session(guard, initial, tx, shutdown_rx));

    let stream =
        futures::stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|f| (f, rx)) });

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(hyper::header::CONTENT_TYPE, "text/event-stream")
        .header(hyper::header::CACHE_CONTROL, "no-cache")
        .body(BodyExt::boxed(StreamBody::new(stream)))
        .expect("valid response with static headers"))
}

/// Drive one session through forwarding, streaming, and cleanup
async fn pump_session(
    mut guard: SessionGuard,
    initial: Bytes,
    tx: EventSender,
    shutdown_rx: watch::Receiver<bool>,
) {
    let session_id = guard.session_id;

    match run_session(guard.supervisor_mut(), &initial, &tx, shutdown_rx).await {
        Ok(SessionEnd::Eof) => {
            info!(session_id = %session_id, "Upstream closed its output");
        }
        Ok(SessionEnd::Cancelled) => {
            info!(session_id = %session_id, "Client disconnected");
        }
        Ok(SessionEnd::ShuttingDown) => {
            info!(session_id = %session_id, "Shutting down streaming connection");
        }
        Err(e) => {
            error!(session_id = %session_id, error = %e, "Streaming error");
            send_error_event(&tx, &e).await;
        }
    }

    guard.finish().await;
}

/// Forward the initial payload, then relay output lines until a terminal
/// condition
///
/// The initial write completes (or fails) before the first read, so the
/// upstream's echo of its own input can never race the feed.
async fn run_session(
    supervisor: &mut ProcessSupervisor,
    initial: &[u8],
    tx: &EventSender,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<SessionEnd, StreamError> {
    // ForwardingInitialPayload
    if !initial.is_empty() {
        supervisor
            .write_initial(initial)
            .await
            .map_err(StreamError::Forward)?;
    }

    // Streaming
    loop {
        tokio::select! {
            _ = tx.closed() => return Ok(SessionEnd::Cancelled),
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    return Ok(SessionEnd::ShuttingDown);
                }
            }
            line = supervisor.next_line() => match line.map_err(StreamError::Read)? {
                Some(line) => {
                    let data = line.trim();
                    if data.is_empty() {
                        continue;
                    }
                    if tx.send(Ok(Frame::data(sse_event(data)))).await.is_err() {
                        return Ok(SessionEnd::Cancelled);
                    }
                }
                None => return Ok(SessionEnd::Eof),
            }
        }
    }
}

/// Frame one line as a server-sent event, payload verbatim
fn sse_event(data: &str) -> Bytes {
    Bytes::from(format!("data: {}\n\n", data))
}

/// Emit the terminal error event, best effort: the client may be gone
async fn send_error_event(tx: &EventSender, err: &StreamError) {
    let payload = serde_json::json!({
        "jsonrpc": "2.0",
        "error": {
            "code": -32603,
            "message": format!("Internal error: {}", err),
        }
    });
    let _ = tx
        .send(Ok(Frame::data(sse_event(&payload.to_string()))))
        .await;
}

/// Owns the supervisor and the registry entry for one session
///
/// The normal path calls `finish` (terminate, then unregister). If the task
/// unwinds instead, `Drop` hands the supervisor to a detached task so the
/// same termination sequence still runs; no exit path leaks a process.
struct SessionGuard {
    supervisor: Option<ProcessSupervisor>,
    registry: Arc<ConnectionRegistry>,
    session_id: Uuid,
    grace: Duration,
}

impl SessionGuard {
    fn supervisor_mut(&mut self) -> &mut ProcessSupervisor {
        self.supervisor
            .as_mut()
            .expect("supervisor present until cleanup")
    }

    /// CleaningUp: terminate the upstream and drop the registry entry
    async fn finish(mut self) {
        if let Some(mut supervisor) = self.supervisor.take() {
            supervisor.terminate(self.grace).await;
        }
        self.registry.unregister(self.session_id);
        debug!(session_id = %self.session_id, "Session cleaned up");
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let Some(mut supervisor) = self.supervisor.take() else {
            return;
        };
        let registry = Arc::clone(&self.registry);
        let session_id = self.session_id;
        let grace = self.grace;
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                supervisor.terminate(grace).await;
                registry.unregister(session_id);
            });
        }
    }
}
