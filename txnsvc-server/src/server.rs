//! TCP server implementation.

use crate::error::ServerError;
use crate::handler::RequestHandler;
use crate::metrics::Metrics;
use crate::session::{Session, SessionState};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use txnsvc_protocol::message::{Request, Response, ResponseError};
use txnsvc_protocol::{Decoder, Encoder, ErrorCode, ProtocolError, DEFAULT_PORT};
use txnsvc_store::TransactionStore;

/// Server configuration.
#[derive(Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Idle connection timeout.
    pub idle_timeout: Duration,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Maximum calls in progress on one connection. Reading stops while the
    /// limit is reached.
    pub max_in_flight: usize,
    /// Metrics instance (if metrics are enabled).
    pub metrics: Option<Arc<Metrics>>,
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("bind_addr", &self.bind_addr)
            .field("idle_timeout", &self.idle_timeout)
            .field("max_connections", &self.max_connections)
            .field("max_in_flight", &self.max_in_flight)
            .field("metrics_enabled", &self.metrics.is_some())
            .finish()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            idle_timeout: Duration::from_secs(300),
            max_connections: 1000,
            max_in_flight: 64,
            metrics: None,
        }
    }
}

impl ServerConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            ..Default::default()
        }
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn with_max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections;
        self
    }

    pub fn with_max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.max_in_flight = max_in_flight.max(1);
        self
    }

    /// Sets the metrics instance.
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Returns whether metrics are enabled.
    pub fn metrics_enabled(&self) -> bool {
        self.metrics.is_some()
    }
}

/// Server statistics.
#[derive(Debug, Default)]
pub struct ServerStats {
    pub connections_total: AtomicU64,
    pub connections_active: AtomicU64,
    pub requests_total: AtomicU64,
    pub errors_total: AtomicU64,
}

/// TCP server for the transaction service.
pub struct Server {
    config: ServerConfig,
    handler: Arc<RequestHandler>,
    stats: Arc<ServerStats>,
    shutdown: broadcast::Sender<()>,
    running: AtomicBool,
}

impl Server {
    /// Creates a new server over the given store.
    pub fn new(config: ServerConfig, store: Arc<dyn TransactionStore>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let mut handler = RequestHandler::new(store);
        if let Some(ref metrics) = config.metrics {
            handler = handler.with_metrics(metrics.clone());
        }
        Self {
            config,
            handler: Arc::new(handler),
            stats: Arc::new(ServerStats::default()),
            shutdown: shutdown_tx,
            running: AtomicBool::new(false),
        }
    }

    /// Binds the configured address and runs the server.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        self.run_on(listener).await
    }

    /// Runs the server on an already bound listener.
    pub async fn run_on(&self, listener: TcpListener) -> Result<(), ServerError> {
        self.running.store(true, Ordering::SeqCst);
        tracing::info!("Server listening on {}", listener.local_addr()?);

        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            if self.stats.connections_active.load(Ordering::Relaxed)
                                >= self.config.max_connections as u64
                            {
                                tracing::warn!("Connection limit reached, rejecting {}", addr);
                                continue;
                            }

                            self.stats.connections_total.fetch_add(1, Ordering::Relaxed);
                            self.stats.connections_active.fetch_add(1, Ordering::Relaxed);

                            if let Some(ref metrics) = self.config.metrics {
                                metrics.connection_opened();
                            }

                            let handler = self.handler.clone();
                            let stats = self.stats.clone();
                            let config = self.config.clone();
                            let mut conn_shutdown = self.shutdown.subscribe();

                            tokio::spawn(async move {
                                let result = Self::handle_connection(
                                    stream,
                                    addr,
                                    handler,
                                    stats.clone(),
                                    config.idle_timeout,
                                    config.max_in_flight,
                                    &mut conn_shutdown,
                                )
                                .await;

                                if let Err(e) = result {
                                    tracing::debug!("Connection {} error: {}", addr, e);
                                    stats.errors_total.fetch_add(1, Ordering::Relaxed);
                                }

                                stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                                if let Some(ref metrics) = config.metrics {
                                    metrics.connection_closed();
                                }

                                tracing::info!("Client disconnected: {}", addr);
                            });
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    tracing::info!("Server shutting down");
                    break;
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Handles a single connection.
    ///
    /// Each transaction call runs on its own task, so a slow call does not
    /// hold up the calls queued behind it; responses are written in
    /// completion order and matched to requests by id.
    async fn handle_connection(
        mut stream: TcpStream,
        addr: SocketAddr,
        handler: Arc<RequestHandler>,
        stats: Arc<ServerStats>,
        idle_timeout: Duration,
        max_in_flight: usize,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<(), ServerError> {
        tracing::info!("Client connected: {}", addr);

        let mut session = Session::new(addr);
        let mut decoder = Decoder::new();
        let mut buf = [0u8; 8192];
        let mut calls: JoinSet<Response> = JoinSet::new();

        loop {
            tokio::select! {
                biased;

                // Completed calls
                Some(joined) = calls.join_next() => {
                    match joined {
                        Ok(response) => Self::write_response(&mut stream, addr, &response).await?,
                        Err(e) => tracing::error!("[{}] Call task failed: {}", addr, e),
                    }
                    continue;
                }

                // Handle incoming data from client
                result = stream.read(&mut buf) => {
                    match result {
                        Ok(0) => {
                            tracing::debug!("[{}] Connection closed by client", addr);
                            return Ok(());
                        }
                        Ok(n) => {
                            tracing::debug!("[{}] Received {} bytes", addr, n);
                            decoder.extend(&buf[..n]);
                        }
                        Err(e) => {
                            tracing::debug!("[{}] Read error: {}", addr, e);
                            return Err(ServerError::Io(e));
                        }
                    }
                }

                // Handle idle timeout
                _ = tokio::time::sleep(idle_timeout) => {
                    if calls.is_empty() && session.idle_duration() > idle_timeout {
                        tracing::debug!("[{}] Idle timeout", addr);
                        return Ok(());
                    }
                    continue;
                }

                // Handle shutdown signal
                _ = shutdown.recv() => {
                    tracing::debug!(
                        "[{}] Shutdown signal received, answering {} call(s) in flight",
                        addr,
                        calls.len()
                    );
                    Self::drain_calls(&mut calls, &mut stream, addr).await?;
                    return Ok(());
                }
            }

            // Process any complete requests
            loop {
                let request = match decoder.decode_request() {
                    Ok(Some(request)) => request,
                    Ok(None) => break,
                    // The frame was consumed; only its payload was bad.
                    Err(e @ (ProtocolError::Json(_) | ProtocolError::InvalidUtf8)) => {
                        tracing::warn!("[{}] Malformed request: {}", addr, e);
                        stats.errors_total.fetch_add(1, Ordering::Relaxed);
                        let error = ResponseError::new(ErrorCode::BadRequest, e.to_string());
                        let response = Response::error("", error);
                        Self::write_response(&mut stream, addr, &response).await?;
                        continue;
                    }
                    Err(e) => return Err(e.into()),
                };

                tracing::info!("[{}] Request: {:?} (id={})", addr, request.op, request.id);
                session.record_request();
                stats.requests_total.fetch_add(1, Ordering::Relaxed);

                if !request.op.is_session() {
                    while calls.len() >= max_in_flight {
                        Self::finish_one(&mut calls, &mut stream, addr).await?;
                    }
                    let handler = handler.clone();
                    calls.spawn(async move { handler.handle(&request).await });
                    continue;
                }

                let response = handler.handle_session(&mut session, &request);

                if session.state() == SessionState::Closing {
                    // Answer everything already in flight before saying goodbye.
                    Self::drain_calls(&mut calls, &mut stream, addr).await?;
                    Self::write_response(&mut stream, addr, &response).await?;
                    tracing::debug!("[{}] Session closing", addr);
                    return Ok(());
                }

                Self::write_response(&mut stream, addr, &response).await?;
            }
        }
    }

    /// Waits for the next call to complete and writes its response.
    async fn finish_one(
        calls: &mut JoinSet<Response>,
        stream: &mut TcpStream,
        addr: SocketAddr,
    ) -> Result<(), ServerError> {
        match calls.join_next().await {
            Some(Ok(response)) => Self::write_response(stream, addr, &response).await,
            Some(Err(e)) => {
                tracing::error!("[{}] Call task failed: {}", addr, e);
                Ok(())
            }
            None => Ok(()),
        }
    }

    async fn drain_calls(
        calls: &mut JoinSet<Response>,
        stream: &mut TcpStream,
        addr: SocketAddr,
    ) -> Result<(), ServerError> {
        while !calls.is_empty() {
            Self::finish_one(calls, stream, addr).await?;
        }
        Ok(())
    }

    async fn write_response(
        stream: &mut TcpStream,
        addr: SocketAddr,
        response: &Response,
    ) -> Result<(), ServerError> {
        tracing::info!(
            "[{}] Response: {} (id={})",
            addr,
            if response.is_ok() { "OK" } else { "ERROR" },
            response.id
        );

        let response_bytes = Encoder::encode_response(response)?;
        tracing::debug!("[{}] Writing {} bytes", addr, response_bytes.len());
        stream.write_all(&response_bytes).await?;
        Ok(())
    }

    /// Initiates server shutdown.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    /// Returns a handle that can trigger shutdown from another task.
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown.clone()
    }

    /// Returns whether the server is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Returns server statistics.
    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }

    pub fn handler(&self) -> &Arc<RequestHandler> {
        &self.handler
    }
}
