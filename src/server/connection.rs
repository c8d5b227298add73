//! Client connection handling for the Kafka listener.
//!
//! A connection reads one size-prefixed frame at a time, dispatches it to the
//! [`Handler`] and writes the answer before reading the next frame, so
//! responses leave in request order. A malformed frame or an undecodable
//! header closes the connection; a request whose body does not decode is
//! answered with `InvalidRequest` and the connection stays open.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::cluster::ServerConfig;
use crate::cluster::metrics;
use crate::error::{Error, KafkaCode, Result};

use super::handler::{Handler, RequestContext};
use super::request::{ApiKey, Request};
use super::response::{ApiVersionsResponseData, ErrorResponseData, Response, VersionedEncode};
use super::versions;

/// Per-connection limits taken from [`ServerConfig`].
#[derive(Debug, Clone, Copy)]
pub struct ConnectionLimits {
    pub max_message_size: usize,
    pub read_timeout: Duration,
    pub handler_timeout: Duration,
}

impl From<&ServerConfig> for ConnectionLimits {
    fn from(config: &ServerConfig) -> Self {
        Self {
            max_message_size: config.max_message_size,
            read_timeout: config.request_read_timeout,
            handler_timeout: config.request_handler_timeout,
        }
    }
}

impl Default for ConnectionLimits {
    fn default() -> Self {
        Self::from(&ServerConfig::default())
    }
}

#[inline]
fn encode_response<R: VersionedEncode>(
    correlation_id: i32,
    resp: &R,
    version: i16,
) -> Result<Vec<u8>> {
    Response::new(correlation_id, resp, version)?.encode_with_size()
}

/// ApiVersions always answers with the classic response header, even for
/// the flexible v3 body, so clients can read it before negotiating.
fn encode_api_versions(
    correlation_id: i32,
    api_version: i16,
    resp: &ApiVersionsResponseData,
) -> Result<Vec<u8>> {
    encode_response(correlation_id, resp, api_version)
}

/// Parse one request frame, run its handler and encode the answer.
///
/// Returns `Ok(None)` when the request expects no response (produce with
/// `acks = 0`).
pub(crate) async fn dispatch_request<H: Handler>(
    handler: &H,
    data: Bytes,
    client_addr: SocketAddr,
) -> Result<Option<Vec<u8>>> {
    let start = Instant::now();

    let request = match Request::parse(data) {
        Ok(r) => r,
        Err(e) => {
            tracing::warn!(client = %client_addr, error = %e, "Failed to parse request");
            metrics::record_request("Unknown", "parse_error", start.elapsed().as_secs_f64());
            return Err(e);
        }
    };
    let header = request.header();
    let correlation_id = header.correlation_id;
    let api_version = header.api_version;
    let api_name = header.api_key.as_str();

    let ctx = RequestContext {
        client_addr,
        api_version,
        client_id: header.client_id.clone(),
        request_id: uuid::Uuid::new_v4(),
    };

    tracing::debug!(
        request_id = %ctx.request_id,
        api_key = ?header.api_key,
        api_version,
        client = %client_addr,
        correlation_id,
        "Handling request"
    );

    let result = match request {
        Request::ApiVersions(_, req) => {
            let response = handler.handle_api_versions(&ctx, req).await;
            encode_api_versions(correlation_id, api_version, &response).map(Some)
        }
        Request::Metadata(_, req) => {
            let response = handler.handle_metadata(&ctx, req).await;
            encode_response(correlation_id, &response, api_version).map(Some)
        }
        Request::Produce(_, req) => {
            let acks = req.acks;
            let response = handler.handle_produce(&ctx, req).await;
            if acks == 0 {
                Ok(None)
            } else {
                encode_response(correlation_id, &response, api_version).map(Some)
            }
        }
        Request::Fetch(_, req) => {
            let response = handler.handle_fetch(&ctx, req).await;
            encode_response(correlation_id, &response, api_version).map(Some)
        }
        Request::ListOffsets(_, req) => {
            let response = handler.handle_list_offsets(&ctx, req).await;
            encode_response(correlation_id, &response, api_version).map(Some)
        }
        Request::CreateTopics(_, req) => {
            let response = handler.handle_create_topics(&ctx, req).await;
            encode_response(correlation_id, &response, api_version).map(Some)
        }
        Request::DeleteTopics(_, req) => {
            let response = handler.handle_delete_topics(&ctx, req).await;
            encode_response(correlation_id, &response, api_version).map(Some)
        }
        Request::Unsupported(h, _) if h.api_key == ApiKey::ApiVersions => {
            // Answer in the v0 layout so any client can read the list and retry.
            tracing::debug!(api_version, "Unsupported ApiVersions version");
            let response = ApiVersionsResponseData {
                error_code: KafkaCode::UnsupportedVersion,
                api_keys: versions::default_api_versions(),
                throttle_time_ms: 0,
            };
            encode_api_versions(correlation_id, 0, &response).map(Some)
        }
        Request::Unsupported(h, body) => {
            tracing::debug!(api_key = ?h.api_key, api_version, "Unsupported request");
            let response = handler.handle_unsupported(&ctx, h.api_key, body).await;
            encode_response(correlation_id, &response, api_version).map(Some)
        }
        Request::Malformed(h) => {
            tracing::warn!(
                client = %client_addr,
                api_key = ?h.api_key,
                api_version,
                correlation_id,
                "Malformed request body"
            );
            metrics::record_request(api_name, "parse_error", start.elapsed().as_secs_f64());
            let response = ErrorResponseData {
                error_code: KafkaCode::InvalidRequest,
            };
            return encode_response(correlation_id, &response, api_version).map(Some);
        }
    };

    let status = if result.is_ok() { "success" } else { "error" };
    metrics::record_request(api_name, status, start.elapsed().as_secs_f64());

    result
}

/// A client connection to the Kafka listener.
pub struct ClientConnection {
    stream: TcpStream,
    addr: SocketAddr,
    limits: ConnectionLimits,
}

impl ClientConnection {
    pub fn new(stream: TcpStream, addr: SocketAddr, limits: ConnectionLimits) -> Self {
        Self {
            stream,
            addr,
            limits,
        }
    }

    /// Handle requests from this connection until closed.
    pub async fn handle_requests<H: Handler>(&mut self, handler: Arc<H>) -> Result<()> {
        metrics::ACTIVE_CONNECTIONS.inc();
        let result = self.handle_requests_inner(handler).await;
        metrics::ACTIVE_CONNECTIONS.dec();
        metrics::record_connection("closed");
        result
    }

    async fn handle_requests_inner<H: Handler>(&mut self, handler: Arc<H>) -> Result<()> {
        loop {
            let read_result = match timeout(self.limits.read_timeout, self.read_request()).await {
                Ok(result) => result,
                Err(_) => {
                    tracing::debug!(
                        client = %self.addr,
                        timeout_secs = self.limits.read_timeout.as_secs(),
                        "Idle connection timed out"
                    );
                    return Ok(());
                }
            };

            let data = match read_result {
                Ok(data) => data,
                Err(Error::MissingData(_)) => {
                    tracing::debug!("Client {} disconnected", self.addr);
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(client = %self.addr, error = %e, "Closing connection");
                    return Err(e);
                }
            };

            let dispatched = timeout(
                self.limits.handler_timeout,
                dispatch_request(handler.as_ref(), data, self.addr),
            )
            .await;

            match dispatched {
                Ok(Ok(Some(response))) => self.write_response(&response).await?,
                Ok(Ok(None)) => {}
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    tracing::error!(
                        client = %self.addr,
                        timeout_secs = self.limits.handler_timeout.as_secs(),
                        "Request handler timeout - closing connection"
                    );
                    return Err(Error::MissingData("Request handler timeout".to_owned()));
                }
            }
        }
    }

    /// Read a single request frame.
    ///
    /// A clean EOF before the size prefix is reported as `MissingData`.
    async fn read_request(&mut self) -> Result<Bytes> {
        let size = match self.stream.read_i32().await {
            Ok(size) => size,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(Error::MissingData("Connection closed".to_owned()));
            }
            Err(e) => return Err(Error::IoError(e.kind())),
        };

        if size < 0 || size as usize > self.limits.max_message_size {
            return Err(Error::InvalidFrameSize(size as i64));
        }

        tracing::trace!("Reading {} bytes from {}", size, self.addr);

        let mut data = vec![0u8; size as usize];
        self.stream
            .read_exact(&mut data)
            .await
            .map_err(|e| Error::IoError(e.kind()))?;

        Ok(Bytes::from(data))
    }

    async fn write_response(&mut self, response: &[u8]) -> Result<()> {
        tracing::trace!(client = %self.addr, response_len = response.len(), "Writing response");
        self.stream
            .write_all(response)
            .await
            .map_err(|e| Error::IoError(e.kind()))
    }
}
