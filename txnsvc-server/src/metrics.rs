//! Prometheus metrics and the HTTP endpoint that exposes them.

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::core::Collector;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use txnsvc_protocol::message::Operation;
use txnsvc_protocol::ErrorCode;

/// Latency buckets in seconds. Calls are a single statement, so the range
/// is weighted toward the low milliseconds.
const DURATION_BUCKETS: &[f64] = &[
    0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 1.0, 5.0,
];

const TEXT_FORMAT: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Server-wide counters, exported in the Prometheus text format.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    connections_total: Counter,
    connections_active: Gauge,
    requests_total: CounterVec,
    errors_total: CounterVec,
    request_duration: HistogramVec,
}

fn register<C>(registry: &Registry, collector: C) -> Result<C, prometheus::Error>
where
    C: Collector + Clone + 'static,
{
    registry.register(Box::new(collector.clone()))?;
    Ok(collector)
}

impl Metrics {
    /// Builds the metric set on a fresh registry.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let connections_total = register(
            &registry,
            Counter::new("txnsvc_connections_total", "Client connections accepted")?,
        )?;
        let connections_active = register(
            &registry,
            Gauge::new("txnsvc_connections_active", "Client connections currently open")?,
        )?;
        let requests_total = register(
            &registry,
            CounterVec::new(
                Opts::new("txnsvc_requests_total", "Requests handled, by operation"),
                &["operation"],
            )?,
        )?;
        let errors_total = register(
            &registry,
            CounterVec::new(
                Opts::new("txnsvc_errors_total", "Error responses, by error code"),
                &["code"],
            )?,
        )?;
        let request_duration = register(
            &registry,
            HistogramVec::new(
                HistogramOpts::new(
                    "txnsvc_request_duration_seconds",
                    "Time from dispatch to response, by operation",
                )
                .buckets(DURATION_BUCKETS.to_vec()),
                &["operation"],
            )?,
        )?;

        Ok(Self {
            registry,
            connections_total,
            connections_active,
            requests_total,
            errors_total,
            request_duration,
        })
    }

    pub fn connection_opened(&self) {
        self.connections_total.inc();
        self.connections_active.inc();
    }

    pub fn connection_closed(&self) {
        self.connections_active.dec();
    }

    /// Records one answered request and, for failures, its error code.
    pub fn observe_request(&self, op: Operation, elapsed: Duration, error: Option<ErrorCode>) {
        let label = [op.as_str()];
        self.requests_total.with_label_values(&label).inc();
        self.request_duration
            .with_label_values(&label)
            .observe(elapsed.as_secs_f64());
        if let Some(code) = error {
            self.errors_total.with_label_values(&[code.as_str()]).inc();
        }
    }

    /// Renders every registered series in the text exposition format.
    pub fn encode(&self) -> Result<Vec<u8>, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(buffer)
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

/// Runs the HTTP metrics server.
///
/// Serves metrics at `/metrics` and a liveness probe at `/health`.
pub async fn run_metrics_server(
    addr: SocketAddr,
    metrics: Arc<Metrics>,
    shutdown: broadcast::Receiver<()>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = TcpListener::bind(addr).await?;
    serve_metrics(listener, metrics, shutdown).await
}

async fn serve_metrics(
    listener: TcpListener,
    metrics: Arc<Metrics>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing::info!(
        "Metrics server listening on http://{}/metrics",
        listener.local_addr()?
    );

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _)) => {
                        let metrics = metrics.clone();
                        tokio::spawn(async move {
                            let io = TokioIo::new(stream);
                            let service = service_fn(move |req| {
                                let metrics = metrics.clone();
                                async move { handle_request(req, metrics).await }
                            });
                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                tracing::debug!("Metrics connection error: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!("Metrics server accept error: {}", e);
                    }
                }
            }
            _ = shutdown.recv() => {
                tracing::info!("Metrics server shutting down");
                break;
            }
        }
    }

    Ok(())
}

fn text_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
}

/// Handles an HTTP request to the metrics server.
async fn handle_request(
    req: Request<hyper::body::Incoming>,
    metrics: Arc<Metrics>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let response = match req.uri().path() {
        "/metrics" => match metrics.encode() {
            Ok(body) => {
                let mut response = text_response(StatusCode::OK, body);
                response
                    .headers_mut()
                    .insert(CONTENT_TYPE, HeaderValue::from_static(TEXT_FORMAT));
                response
            }
            Err(e) => {
                tracing::error!("Failed to encode metrics: {}", e);
                text_response(StatusCode::INTERNAL_SERVER_ERROR, "metrics unavailable")
            }
        },
        "/health" | "/healthz" => text_response(StatusCode::OK, "OK"),
        _ => text_response(StatusCode::NOT_FOUND, "Not Found"),
    };

    Ok(response)
}
