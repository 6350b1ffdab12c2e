//! Connection management.

use crate::error::ClientError;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use txnsvc_protocol::message::{HelloParams, HelloResult, Operation, Request, Response};
use txnsvc_protocol::{Decoder, Encoder, PROTOCOL_VERSION};

/// Default read buffer size (8 KiB).
pub const DEFAULT_READ_BUFFER_SIZE: usize = 8 * 1024;

/// Minimum read buffer size (1 KiB).
pub const MIN_READ_BUFFER_SIZE: usize = 1024;

/// Maximum read buffer size (1 MiB).
pub const MAX_READ_BUFFER_SIZE: usize = 1024 * 1024;

type PendingMap = Arc<Mutex<HashMap<String, oneshot::Sender<Response>>>>;

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Server address.
    pub addr: SocketAddr,
    /// Connection timeout.
    pub connect_timeout: Duration,
    /// Deadline for each call. Sent to the server with the request, which
    /// abandons the call when it expires.
    pub request_timeout: Duration,
    /// Client name for HELLO.
    pub client_name: Option<String>,
    /// Read buffer size for socket reads.
    pub read_buffer_size: usize,
}

impl ConnectionConfig {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            client_name: None,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
        }
    }

    pub fn with_client_name(mut self, name: impl Into<String>) -> Self {
        self.client_name = Some(name.into());
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size.clamp(MIN_READ_BUFFER_SIZE, MAX_READ_BUFFER_SIZE);
        self
    }
}

/// A connection to a txnsvc server.
///
/// Requests may be issued concurrently from many tasks; a background task
/// started by [`Connection::connect`] routes each response to its caller by
/// request id.
pub struct Connection {
    config: ConnectionConfig,
    /// Write half of the stream (for sending requests).
    writer: Mutex<Option<OwnedWriteHalf>>,
    /// Pending requests waiting for responses.
    pending: PendingMap,
    /// Next request ID.
    next_id: AtomicU64,
    /// Is the connection established?
    connected: Arc<AtomicBool>,
    /// Background task reading responses.
    read_task: Mutex<Option<JoinHandle<()>>>,
    /// Server answer to HELLO.
    server: Mutex<Option<HelloResult>>,
}

impl Connection {
    /// Creates a new connection (not yet connected).
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            config,
            writer: Mutex::new(None),
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            connected: Arc::new(AtomicBool::new(false)),
            read_task: Mutex::new(None),
            server: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Connects to the server, performs the HELLO handshake and starts the
    /// background read loop.
    pub async fn connect(&self) -> Result<(), ClientError> {
        tracing::debug!("Connecting to {}...", self.config.addr);

        let tcp_stream = tokio::time::timeout(
            self.config.connect_timeout,
            TcpStream::connect(self.config.addr),
        )
        .await
        .map_err(|_| {
            tracing::debug!("Connection timeout");
            ClientError::Timeout
        })?
        .map_err(|e| {
            tracing::debug!("Connection failed: {}", e);
            ClientError::Io(e)
        })?;

        // Requests are small; don't wait to coalesce them.
        tcp_stream.set_nodelay(true).ok();

        let (mut reader, writer) = tcp_stream.into_split();
        *self.writer.lock().await = Some(writer);

        let mut decoder = Decoder::new();
        tracing::debug!("Starting protocol handshake...");
        let hello = self.handshake(&mut reader, &mut decoder).await?;
        tracing::debug!(
            "Handshake complete: {} {} (session {})",
            hello.server_name,
            hello.server_version,
            hello.session_id
        );
        *self.server.lock().await = Some(hello);

        // Mark as connected only after successful handshake
        self.connected.store(true, Ordering::SeqCst);

        let task = tokio::spawn(read_loop(
            reader,
            decoder,
            self.config.read_buffer_size,
            self.pending.clone(),
            self.connected.clone(),
        ));
        if let Some(old) = self.read_task.lock().await.replace(task) {
            old.abort();
        }

        Ok(())
    }

    /// Performs the HELLO handshake.
    /// This reads the response directly from the stream since the read loop isn't running yet.
    async fn handshake(
        &self,
        reader: &mut OwnedReadHalf,
        decoder: &mut Decoder,
    ) -> Result<HelloResult, ClientError> {
        let hello = HelloParams {
            protocol_version: PROTOCOL_VERSION,
            client_name: self.config.client_name.clone(),
        };

        let id = self.next_id.fetch_add(1, Ordering::SeqCst).to_string();
        let request = Request::new(&id, Operation::Hello).with_params(serde_json::to_value(hello)?);
        self.write_request(&request).await?;

        let read = async {
            let mut buf = vec![0u8; self.config.read_buffer_size];
            loop {
                if let Some(response) = decoder.decode_response()? {
                    return Ok::<Response, ClientError>(response);
                }
                let n = reader.read(&mut buf).await?;
                if n == 0 {
                    tracing::debug!("Connection closed during handshake");
                    return Err(ClientError::ConnectionClosed);
                }
                decoder.extend(&buf[..n]);
            }
        };
        let response = tokio::time::timeout(self.config.request_timeout, read)
            .await
            .map_err(|_| ClientError::Timeout)??;

        let result = ClientError::check(response)?;
        Ok(serde_json::from_value(result)?)
    }

    async fn write_request(&self, request: &Request) -> Result<(), ClientError> {
        let encoded = Encoder::encode_request(request)?;
        let mut writer_guard = self.writer.lock().await;
        let writer = writer_guard.as_mut().ok_or(ClientError::NotConnected)?;
        writer.write_all(&encoded).await?;
        tracing::debug!(
            "Request id={} sent ({} bytes)",
            request.id,
            encoded.len()
        );
        Ok(())
    }

    /// Sends a request and waits for its response.
    ///
    /// The configured request timeout travels with the request as its
    /// deadline; the wait here is bounded by the same timeout.
    pub async fn request(
        &self,
        op: Operation,
        params: serde_json::Value,
    ) -> Result<Response, ClientError> {
        if !self.connected.load(Ordering::SeqCst) {
            tracing::debug!("request() called but not connected");
            return Err(ClientError::NotConnected);
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst).to_string();
        let timeout = self.config.request_timeout;
        let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        tracing::debug!("Sending request id={} op={:?}", id, op);
        let request = Request::new(&id, op)
            .with_params(params)
            .with_timeout_ms(timeout_ms);

        // Create response channel
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id.clone(), tx);

        if let Err(e) = self.write_request(&request).await {
            self.pending.lock().await.remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => {
                tracing::debug!("Request id={} got response", id);
                Ok(response)
            }
            Ok(Err(_)) => {
                tracing::debug!("Request id={} channel closed", id);
                Err(ClientError::ConnectionClosed)
            }
            Err(_) => {
                tracing::debug!("Request id={} timed out", id);
                self.pending.lock().await.remove(&id);
                Err(ClientError::Timeout)
            }
        }
    }

    /// Returns whether the connection is established.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Returns the server's answer to HELLO, once connected.
    pub async fn server_info(&self) -> Option<HelloResult> {
        self.server.lock().await.clone()
    }

    /// Closes the connection, saying BYE first when still connected.
    pub async fn close(&self) -> Result<(), ClientError> {
        tracing::debug!("Closing connection...");

        if self.is_connected() {
            if let Err(e) = self.request(Operation::Bye, serde_json::json!({})).await {
                tracing::debug!("BYE failed: {}", e);
            }
        }

        // Mark as disconnected first to stop any new requests
        self.connected.store(false, Ordering::SeqCst);

        if let Some(mut writer) = self.writer.lock().await.take() {
            tracing::debug!("Shutting down writer");
            let _ = writer.shutdown().await;
        }

        if let Some(task) = self.read_task.lock().await.take() {
            task.abort();
        }

        // Cancel any pending requests
        let mut pending = self.pending.lock().await;
        tracing::debug!("Clearing {} pending requests", pending.len());
        pending.clear();

        tracing::debug!("Connection closed");
        Ok(())
    }

    /// Returns the number of pending requests.
    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }
}

/// Reads and dispatches responses until the stream ends.
async fn read_loop(
    mut reader: OwnedReadHalf,
    mut decoder: Decoder,
    buffer_size: usize,
    pending: PendingMap,
    connected: Arc<AtomicBool>,
) {
    let result = dispatch_responses(&mut reader, &mut decoder, buffer_size, &pending).await;
    match result {
        Ok(()) => tracing::debug!("read_loop: connection closed"),
        Err(e) => tracing::debug!("read_loop: {}", e),
    }

    connected.store(false, Ordering::SeqCst);
    // Dropping the senders wakes every waiter with ConnectionClosed.
    pending.lock().await.clear();
}

async fn dispatch_responses(
    reader: &mut OwnedReadHalf,
    decoder: &mut Decoder,
    buffer_size: usize,
    pending: &PendingMap,
) -> Result<(), ClientError> {
    let mut buf = vec![0u8; buffer_size];

    loop {
        // Responses can arrive in the same read as the handshake reply.
        while let Some(response) = decoder.decode_response()? {
            let id = response.id.clone();
            tracing::debug!("read_loop: dispatching response id={}", id);
            match pending.lock().await.remove(&id) {
                Some(tx) => {
                    let _ = tx.send(response);
                }
                None => tracing::debug!("read_loop: no pending request for id={}", id),
            }
        }

        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        tracing::debug!("read_loop: received {} bytes", n);
        decoder.extend(&buf[..n]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = ConnectionConfig::new("127.0.0.1:50051".parse().unwrap());
        assert_eq!(config.read_buffer_size, DEFAULT_READ_BUFFER_SIZE);
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.request_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_config_buffer_clamping() {
        let config =
            ConnectionConfig::new("127.0.0.1:50051".parse().unwrap()).with_read_buffer_size(100);
        assert_eq!(config.read_buffer_size, MIN_READ_BUFFER_SIZE);

        let config = ConnectionConfig::new("127.0.0.1:50051".parse().unwrap())
            .with_read_buffer_size(10 * 1024 * 1024);
        assert_eq!(config.read_buffer_size, MAX_READ_BUFFER_SIZE);
    }

    #[tokio::test]
    async fn test_request_before_connect() {
        let conn = Connection::new(ConnectionConfig::new("127.0.0.1:50051".parse().unwrap()));
        let result = conn.request(Operation::Ping, serde_json::json!({})).await;
        assert!(matches!(result, Err(ClientError::NotConnected)));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Bind then drop to get a port nothing listens on.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let conn = Connection::new(ConnectionConfig::new(addr));
        assert!(conn.connect().await.is_err());
        assert!(!conn.is_connected());
    }
}
