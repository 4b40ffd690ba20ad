//! HTTP server that serves an application behind the rate limiter.

use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::error::Result;
use crate::middleware::RateLimitLayer;
use crate::ratelimit::RateLimiter;

/// HTTP server for a rate limited application.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    /// The application with the rate limit layer applied
    router: Router,
}

impl HttpServer {
    /// Create a server that limits every route of `app`.
    pub fn new(addr: SocketAddr, rate_limiter: Arc<RateLimiter>, app: Router) -> Self {
        Self {
            addr,
            router: app.layer(RateLimitLayer::new(rate_limiter)),
        }
    }

    /// Create a server for the built-in status application.
    pub fn with_default_app(addr: SocketAddr, rate_limiter: Arc<RateLimiter>) -> Self {
        Self::new(addr, rate_limiter, default_app())
    }

    /// Start the HTTP server with graceful shutdown.
    ///
    /// The server will shut down when the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.addr).await?;
        self.serve_listener(listener, signal).await
    }

    /// Serve on an already bound listener.
    pub async fn serve_listener<F>(self, listener: TcpListener, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "Starting rate limited HTTP server");

        axum::serve(
            listener,
            self.router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .await
        .map_err(|e| {
            error!(error = %e, "HTTP server failed");
            e.into()
        })
    }
}

/// Minimal application answering `GET /` with a status document.
pub fn default_app() -> Router {
    Router::new().route("/", get(status))
}

async fn status() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}
