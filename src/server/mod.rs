//! Kafka-compatible protocol server.
//!
//! [`KafkaServer`] accepts TCP connections, enforces the connection limits
//! of [`ServerConfig`] and hands every connection to a task that decodes
//! requests and calls into a [`Handler`].
//!
//! # Example
//! ```rust,no_run
//! use jockey::cluster::ServerConfig;
//! use jockey::server::{Handler, KafkaServer};
//!
//! struct NoTopics;
//!
//! impl Handler for NoTopics {}
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = ServerConfig {
//!         listen_addr: "127.0.0.1:9092".to_string(),
//!         ..ServerConfig::default()
//!     };
//!     let server = KafkaServer::new(&config, NoTopics).await.unwrap();
//!     server.run().await.unwrap();
//! }
//! ```

mod connection;
mod handler;
pub mod health;
pub mod request;
pub mod response;
pub mod versions;

pub use connection::{ClientConnection, ConnectionLimits};
pub use handler::{Handler, RequestContext};

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::{RwLock, broadcast};

use crate::cluster::ServerConfig;
use crate::cluster::metrics;
use crate::error::{Error, Result};

/// A Kafka-compatible TCP server with graceful shutdown support.
pub struct KafkaServer<H: Handler> {
    listener: TcpListener,
    handler: Arc<H>,
    shutdown_tx: broadcast::Sender<()>,
    active_connections: Arc<AtomicUsize>,
    connections_per_ip: Arc<RwLock<HashMap<IpAddr, usize>>>,
    max_connections_per_ip: usize,
    /// Zero means unlimited.
    max_total_connections: usize,
    limits: ConnectionLimits,
}

impl<H: Handler + 'static> KafkaServer<H> {
    /// Bind the listener described by `config`.
    pub async fn new(config: &ServerConfig, handler: H) -> Result<Self> {
        Self::with_handler(config, Arc::new(handler)).await
    }

    /// Bind the listener with a handler shared with other components.
    pub async fn with_handler(config: &ServerConfig, handler: Arc<H>) -> Result<Self> {
        let listener = TcpListener::bind(&config.listen_addr)
            .await
            .map_err(|e| Error::IoError(e.kind()))?;

        let (shutdown_tx, _) = broadcast::channel(1);

        tracing::info!(
            addr = %config.listen_addr,
            max_per_ip = config.max_connections_per_ip,
            max_total = config.max_total_connections,
            "Kafka server listening"
        );

        Ok(Self {
            listener,
            handler,
            shutdown_tx,
            active_connections: Arc::new(AtomicUsize::new(0)),
            connections_per_ip: Arc::new(RwLock::new(HashMap::new())),
            max_connections_per_ip: config.max_connections_per_ip,
            max_total_connections: config.max_total_connections,
            limits: ConnectionLimits::from(config),
        })
    }

    /// Get the local address the server is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .map_err(|e| Error::IoError(e.kind()))
    }

    /// Get the number of active connections.
    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::SeqCst)
    }

    /// Stop accepting new connections. Open connections keep being served.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        tracing::info!("Shutdown signal sent");
    }

    /// Stop accepting and wait up to `timeout` for open connections to close.
    ///
    /// Returns `true` if all connections drained within the timeout.
    pub async fn shutdown_and_wait(&self, timeout: Duration) -> bool {
        self.shutdown();

        let start = std::time::Instant::now();
        let check_interval = Duration::from_millis(100);

        while start.elapsed() < timeout {
            let active = self.active_connections.load(Ordering::SeqCst);
            if active == 0 {
                tracing::info!("All connections drained");
                return true;
            }
            tracing::debug!(
                active_connections = active,
                "Waiting for connections to drain"
            );
            tokio::time::sleep(check_interval).await;
        }

        let remaining = self.active_connections.load(Ordering::SeqCst);
        tracing::warn!(
            remaining_connections = remaining,
            "Shutdown timeout, connections still active"
        );
        false
    }

    /// Accept connections until [`shutdown`](Self::shutdown) is called.
    pub async fn run(&self) -> Result<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    tracing::info!("Server shutting down, no longer accepting connections");
                    return Ok(());
                }
                accept_result = self.listener.accept() => {
                    let (stream, addr) = match accept_result {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            tracing::warn!(error = %e, "Failed to accept connection");
                            continue;
                        }
                    };
                    let ip = addr.ip();

                    if self.max_total_connections > 0 {
                        let current_total = self.active_connections.load(Ordering::SeqCst);
                        if current_total >= self.max_total_connections {
                            tracing::warn!(
                                client_ip = %ip,
                                current_connections = current_total,
                                max_connections = self.max_total_connections,
                                "Rejecting connection - global limit exceeded"
                            );
                            metrics::record_connection("rejected_total_limit");
                            drop(stream);
                            continue;
                        }
                    }

                    {
                        let mut counts = self.connections_per_ip.write().await;
                        let count = counts.entry(ip).or_insert(0);
                        if *count >= self.max_connections_per_ip {
                            tracing::warn!(
                                client_ip = %ip,
                                current_connections = *count,
                                max_connections = self.max_connections_per_ip,
                                "Rejecting connection - per-IP limit exceeded"
                            );
                            metrics::record_connection("rejected_ip_limit");
                            drop(stream);
                            continue;
                        }
                        *count += 1;
                    }

                    tracing::debug!(client_addr = %addr, "Accepted connection");
                    metrics::record_connection("accepted");

                    let handler = self.handler.clone();
                    let active_connections = self.active_connections.clone();
                    let connections_per_ip = self.connections_per_ip.clone();
                    let limits = self.limits;

                    active_connections.fetch_add(1, Ordering::SeqCst);

                    tokio::spawn(async move {
                        let mut conn = ClientConnection::new(stream, addr, limits);
                        if let Err(e) = conn.handle_requests(handler).await {
                            tracing::debug!(client_addr = %addr, error = %e, "Connection closed with error");
                        }
                        active_connections.fetch_sub(1, Ordering::SeqCst);

                        let mut counts = connections_per_ip.write().await;
                        if let Some(count) = counts.get_mut(&ip) {
                            *count = count.saturating_sub(1);
                            if *count == 0 {
                                counts.remove(&ip);
                            }
                        }
                    });
                }
            }
        }
    }

    /// Serve a single connection on the current task (useful for testing).
    pub async fn accept_one(&self) -> Result<()> {
        let (stream, addr) = self
            .listener
            .accept()
            .await
            .map_err(|e| Error::IoError(e.kind()))?;

        tracing::debug!(client_addr = %addr, "Accepted connection");

        let mut conn = ClientConnection::new(stream, addr, self.limits);
        conn.handle_requests(self.handler.clone()).await
    }
}
