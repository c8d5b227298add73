//! HTTP health and readiness endpoints for operational monitoring.
//!
//! # Endpoints
//!
//! - `GET /health` - Liveness check (always 200 while the process runs)
//! - `GET /ready` - Readiness check (503 until the broker has joined the
//!   cluster and sees a metadata leader)
//! - `GET /metrics` - Prometheus metrics in text format
//!
//! # Usage
//!
//! ```rust,no_run
//! use jockey::server::health::HealthServer;
//! use std::sync::Arc;
//! use std::sync::atomic::AtomicBool;
//!
//! #[tokio::main]
//! async fn main() {
//!     let ready = Arc::new(AtomicBool::new(true));
//!     let server = HealthServer::new("0.0.0.0:8080", ready, 1).await.unwrap();
//!     server.run().await.unwrap();
//! }
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};

/// Lightweight HTTP server for health endpoints.
pub struct HealthServer {
    listener: TcpListener,
    /// Set by the broker once it is registered and a metadata leader is known.
    ready: Arc<AtomicBool>,
    shutdown_tx: broadcast::Sender<()>,
    broker_id: i32,
}

impl HealthServer {
    pub async fn new(addr: &str, ready: Arc<AtomicBool>, broker_id: i32) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::IoError(e.kind()))?;

        let (shutdown_tx, _) = broadcast::channel(1);

        info!(addr = %addr, "Health server listening");

        Ok(Self {
            listener,
            ready,
            shutdown_tx,
            broker_id,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .map_err(|e| Error::IoError(e.kind()))
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        info!("Health server shutdown signal sent");
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// Serve HTTP requests until shutdown.
    pub async fn run(&self) -> Result<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Health server shutting down");
                    return Ok(());
                }
                accept_result = self.listener.accept() => {
                    match accept_result {
                        Ok((mut stream, addr)) => {
                            debug!(client_addr = %addr, "Health check connection");

                            let ready = self.ready.clone();
                            let broker_id = self.broker_id;

                            tokio::spawn(async move {
                                let mut buf = [0u8; 1024];
                                match stream.read(&mut buf).await {
                                    Ok(n) if n > 0 => {
                                        let request = String::from_utf8_lossy(&buf[..n]);
                                        let response = handle_request(&request, &ready, broker_id);
                                        if let Err(e) = stream.write_all(response.as_bytes()).await {
                                            debug!(error = ?e, "Failed to write health response");
                                        }
                                    }
                                    Ok(_) => debug!("Empty request received"),
                                    Err(e) => debug!(error = ?e, "Failed to read health request"),
                                }
                            });
                        }
                        Err(e) => {
                            warn!(error = ?e, "Failed to accept health check connection");
                        }
                    }
                }
            }
        }
    }
}

fn handle_request(request: &str, ready: &AtomicBool, broker_id: i32) -> String {
    let path = request
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .unwrap_or("/");

    match path {
        "/health" | "/healthz" => text_response(
            "200 OK",
            &format!("status: healthy\nbroker_id: {broker_id}\n"),
        ),
        "/ready" | "/readyz" => {
            if ready.load(Ordering::SeqCst) {
                text_response(
                    "200 OK",
                    &format!("status: ready\nbroker_id: {broker_id}\n"),
                )
            } else {
                text_response(
                    "503 Service Unavailable",
                    &format!("status: not_ready\nbroker_id: {broker_id}\n"),
                )
            }
        }
        "/metrics" => metrics_response(),
        _ => text_response(
            "404 Not Found",
            "Available endpoints:\n- /health\n- /ready\n- /metrics\n",
        ),
    }
}

fn text_response(status: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 {status}\r\n\
         Content-Type: text/plain\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n\
         {body}",
        body.len()
    )
}

fn metrics_response() -> String {
    match crate::cluster::metrics::encode_metrics() {
        Ok(body) => format!(
            "HTTP/1.1 200 OK\r\n\
             Content-Type: text/plain; version=0.0.4; charset=utf-8\r\n\
             Content-Length: {}\r\n\
             Connection: close\r\n\
             \r\n\
             {body}",
            body.len()
        ),
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            text_response("500 Internal Server Error", "error: failed to encode metrics\n")
        }
    }
}
