//! HTTP surface for the bridge
//!
//! One accept loop; one spawned task per client connection; routing to the
//! static endpoints and the SSE bridge endpoint.

use crate::auth::CredentialRegistry;
use crate::bridge;
use crate::config::UpstreamConfig;
use crate::error::{json_error_response, BridgeErrorCode, EventBody};
use crate::limiter::RateLimiter;
use crate::registry::ConnectionRegistry;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info};

/// Version information for the bridge
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Path of the streaming endpoint
pub const SSE_ENDPOINT: &str = "/mcp/v1/sse";

/// Shared collaborators injected into every connection task
pub struct BridgeContext {
    /// Upstream command spawned per connection
    pub upstream: UpstreamConfig,
    /// Static token -> identity lookup
    pub credentials: CredentialRegistry,
    /// Per-source sliding-window limiter
    pub limiter: RateLimiter,
    /// Table of in-flight connections
    pub registry: Arc<ConnectionRegistry>,
    /// Process-wide shutdown signal, propagated into streaming loops
    pub shutdown_rx: watch::Receiver<bool>,
}

/// The bridge's HTTP server
pub struct BridgeServer {
    bind_addr: SocketAddr,
    context: Arc<BridgeContext>,
    shutdown_rx: watch::Receiver<bool>,
}

impl BridgeServer {
    pub fn new(bind_addr: SocketAddr, context: Arc<BridgeContext>) -> Self {
        let shutdown_rx = context.shutdown_rx.clone();
        Self {
            bind_addr,
            context,
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "Bridge server listening");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let context = Arc::clone(&self.context);
                            tokio::spawn(async move {
                                if let Err(e) = serve_connection(stream, addr, context).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Bridge server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_connection<S>(
    stream: S,
    addr: SocketAddr,
    context: Arc<BridgeContext>,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let ctx = Arc::clone(&context);
        async move { handle_request(req, ctx, addr).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    req: Request<Incoming>,
    context: Arc<BridgeContext>,
    client_addr: SocketAddr,
) -> Result<Response<EventBody>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    debug!(%method, %path, addr = %client_addr, "Incoming request");

    match (method, path.as_str()) {
        (Method::GET, "/") => Ok(json_response(StatusCode::OK, info_body())),
        (Method::GET, "/health") => Ok(json_response(
            StatusCode::OK,
            serde_json::json!({"status": "healthy"}).to_string(),
        )),
        (Method::POST, SSE_ENDPOINT) => bridge::open_stream(req, context, client_addr).await,
        _ => Ok(json_error_response(BridgeErrorCode::NotFound, "Not found")),
    }
}

/// Static info payload served on the root endpoint
fn info_body() -> String {
    serde_json::json!({
        "name": PKG_NAME,
        "version": VERSION,
        "protocol": "sse",
        "endpoint": SSE_ENDPOINT,
    })
    .to_string()
}

/// Helper to create a JSON response - infallible with valid StatusCode
fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<EventBody> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(body.into()).map_err(|never| match never {}).boxed())
        .expect("valid response with StatusCode enum and static header")
}
