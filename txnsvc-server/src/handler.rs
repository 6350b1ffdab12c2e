//! Request handlers.

use crate::error::ServerError;
use crate::metrics::Metrics;
use crate::service::TransactionService;
use crate::session::{Session, SessionState};
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use txnsvc_protocol::message::{
    HelloParams, HelloResult, Operation, Request, Response, ResponseError, ResponseMeta,
};
use txnsvc_protocol::PROTOCOL_VERSION;
use txnsvc_store::TransactionStore;

/// Server identity reported in HELLO.
#[derive(Debug, Clone)]
pub struct ServerInfo {
    pub name: String,
    pub version: String,
}

impl Default for ServerInfo {
    fn default() -> Self {
        Self {
            name: "txnsvc".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Request handler.
///
/// Session operations need the connection's [`Session`] and go through
/// [`RequestHandler::handle_session`]; everything else is independent of the
/// connection and goes through [`RequestHandler::handle`], which callers may
/// run concurrently.
pub struct RequestHandler {
    service: TransactionService,
    info: ServerInfo,
    /// Metrics for request tracking.
    metrics: Option<Arc<Metrics>>,
}

impl RequestHandler {
    pub fn new(store: Arc<dyn TransactionStore>) -> Self {
        Self {
            service: TransactionService::new(store),
            info: ServerInfo::default(),
            metrics: None,
        }
    }

    /// Sets the server identity.
    pub fn with_info(mut self, info: ServerInfo) -> Self {
        self.info = info;
        self
    }

    /// Sets the metrics instance.
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn service(&self) -> &TransactionService {
        &self.service
    }

    pub fn info(&self) -> &ServerInfo {
        &self.info
    }

    /// Returns a reference to the metrics, if set.
    pub fn metrics(&self) -> Option<&Arc<Metrics>> {
        self.metrics.as_ref()
    }

    /// Handles a connection-independent request.
    ///
    /// The request's `timeout_ms`, when present, bounds the whole call; an
    /// expired call is abandoned and answered with `DEADLINE_EXCEEDED`.
    pub async fn handle(&self, request: &Request) -> Response {
        let op_name = request.op.as_str();
        let started = Instant::now();

        let result = match request.timeout_ms {
            Some(timeout_ms) => {
                let deadline = Duration::from_millis(timeout_ms);
                match tokio::time::timeout(deadline, self.dispatch(request)).await {
                    Ok(result) => result,
                    Err(_) => {
                        tracing::warn!(
                            "{} (id={}) exceeded its {} ms deadline",
                            op_name,
                            request.id,
                            timeout_ms
                        );
                        Err(ServerError::DeadlineExceeded(timeout_ms))
                    }
                }
            }
            None => self.dispatch(request).await,
        };

        self.finish(request, started, result)
    }

    /// Handles HELLO and BYE, which act on the connection's session.
    pub fn handle_session(&self, session: &mut Session, request: &Request) -> Response {
        let started = Instant::now();
        let result = match request.op {
            Operation::Hello => self.handle_hello(session, &request.params),
            Operation::Bye => self.handle_bye(session),
            op => Err(ServerError::InvalidRequest(format!(
                "{} is not a session operation",
                op.as_str()
            ))),
        };
        self.finish(request, started, result)
    }

    async fn dispatch(&self, request: &Request) -> Result<Value, ServerError> {
        match request.op {
            Operation::Ping => Ok(json!({"pong": true})),
            Operation::CreateTransaction => {
                let params = parse_params(&request.params)?;
                to_result(self.service.create_transaction(params).await?)
            }
            Operation::UpdateTransaction => {
                let params = parse_params(&request.params)?;
                to_result(self.service.update_transaction(params).await?)
            }
            Operation::GetTransaction => {
                let params = parse_params(&request.params)?;
                to_result(self.service.get_transaction(params).await?)
            }
            Operation::DeleteTransaction => {
                let params = parse_params(&request.params)?;
                to_result(self.service.delete_transaction(params).await?)
            }
            Operation::Hello | Operation::Bye => Err(ServerError::InvalidRequest(format!(
                "{} must be handled on the connection",
                request.op.as_str()
            ))),
        }
    }

    fn finish(
        &self,
        request: &Request,
        started: Instant,
        result: Result<Value, ServerError>,
    ) -> Response {
        let response = self.respond(request, result);
        if let Some(ref metrics) = self.metrics {
            metrics.observe_request(request.op, started.elapsed(), response.error_code());
        }
        response
    }

    fn respond(&self, request: &Request, result: Result<Value, ServerError>) -> Response {
        let meta = ResponseMeta {
            server_time: Some(Utc::now()),
            ..Default::default()
        };

        let response = match result {
            Ok(value) => Response::ok(&request.id, value),
            Err(e) => {
                tracing::debug!(
                    "{} (id={}) failed: {}",
                    request.op.as_str(),
                    request.id,
                    e
                );
                let mut error = ResponseError::new(e.error_code(), e.to_string());
                if !request.op.is_idempotent() {
                    error = error.not_retryable();
                }
                Response::error(&request.id, error)
            }
        };
        response.with_meta(meta)
    }

    fn handle_hello(&self, session: &mut Session, params: &Value) -> Result<Value, ServerError> {
        let hello: HelloParams = parse_params(params)?;

        if hello.protocol_version != PROTOCOL_VERSION {
            return Err(ServerError::UnsupportedProtocol(hello.protocol_version));
        }

        session.complete_handshake(hello.protocol_version, hello.client_name);

        to_result(HelloResult {
            protocol_version: PROTOCOL_VERSION,
            server_name: self.info.name.clone(),
            server_version: self.info.version.clone(),
            session_id: session.id.clone(),
        })
    }

    fn handle_bye(&self, session: &mut Session) -> Result<Value, ServerError> {
        session.set_state(SessionState::Closing);
        Ok(json!({"goodbye": true}))
    }
}

/// Decodes request params. Omitted params read as an empty object.
fn parse_params<T: DeserializeOwned>(params: &Value) -> Result<T, ServerError> {
    let params = match params {
        Value::Null => Value::Object(Default::default()),
        other => other.clone(),
    };
    serde_json::from_value(params).map_err(|e| ServerError::InvalidRequest(e.to_string()))
}

fn to_result<T: Serialize>(result: T) -> Result<Value, ServerError> {
    Ok(serde_json::to_value(result)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use txnsvc_protocol::message::{GetTransactionResult, TransactionResult};
    use txnsvc_protocol::ErrorCode;
    use txnsvc_store::{MemoryStore, SchemaMode, StoreError};
    use uuid::Uuid;

    fn test_handler() -> (Arc<MemoryStore>, RequestHandler, Session) {
        let store = Arc::new(MemoryStore::new());
        let handler = RequestHandler::new(store.clone());
        let session = Session::new(SocketAddr::new(
            IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
            12345,
        ));
        (store, handler, session)
    }

    async fn create(handler: &RequestHandler, balance: i32) -> TransactionResult {
        let request =
            Request::new("c", Operation::CreateTransaction).with_params(json!({"balance": balance}));
        let response = handler.handle(&request).await;
        assert!(response.is_ok());
        serde_json::from_value(response.result.unwrap()).unwrap()
    }

    #[test]
    fn test_hello() {
        let (_store, handler, mut session) = test_handler();

        let request = Request::new("1", Operation::Hello).with_params(json!({
            "protocol_version": 1,
            "client_name": "test"
        }));

        let response = handler.handle_session(&mut session, &request);
        assert!(response.is_ok());
        assert_eq!(session.state(), SessionState::Ready);
        assert_eq!(session.client_name(), Some("test"));

        let result: HelloResult = serde_json::from_value(response.result.unwrap()).unwrap();
        assert_eq!(result.server_name, "txnsvc");
        assert_eq!(result.session_id, session.id);
    }

    #[test]
    fn test_hello_wrong_version() {
        let (_store, handler, mut session) = test_handler();

        let request =
            Request::new("1", Operation::Hello).with_params(json!({"protocol_version": 99}));
        let response = handler.handle_session(&mut session, &request);

        assert_eq!(response.error_code(), Some(ErrorCode::UnsupportedProtocol));
        assert_eq!(session.state(), SessionState::Connected);
    }

    #[test]
    fn test_bye_closes_session() {
        let (_store, handler, mut session) = test_handler();

        let response = handler.handle_session(&mut session, &Request::new("1", Operation::Bye));
        assert!(response.is_ok());
        assert_eq!(session.state(), SessionState::Closing);
    }

    #[tokio::test]
    async fn test_ping_pong() {
        let (_store, handler, _session) = test_handler();

        let response = handler.handle(&Request::new("1", Operation::Ping)).await;

        assert!(response.is_ok());
        assert_eq!(response.id, "1");
        assert_eq!(response.result.unwrap()["pong"], true);
        assert!(response.meta.server_time.is_some());
    }

    #[tokio::test]
    async fn test_create_then_get() {
        let (_store, handler, _session) = test_handler();
        let created = create(&handler, 500).await;
        assert!(created.success);
        assert_eq!(created.message, "Transaction created successfully");

        let request = Request::new("g", Operation::GetTransaction)
            .with_params(json!({"transactionId": created.transaction_id}));
        let response = handler.handle(&request).await;
        let fetched: GetTransactionResult =
            serde_json::from_value(response.result.unwrap()).unwrap();
        assert_eq!(fetched.balance, 500);
        assert_eq!(fetched.transaction_id, created.transaction_id);
    }

    #[tokio::test]
    async fn test_error_codes_on_the_wire() {
        let (_store, handler, _session) = test_handler();

        let request = Request::new("1", Operation::GetTransaction)
            .with_params(json!({"transactionId": "not-a-uuid"}));
        let response = handler.handle(&request).await;
        assert_eq!(response.error_code(), Some(ErrorCode::InvalidArgument));
        assert!(response
            .error
            .unwrap()
            .message
            .starts_with("invalid transaction ID: "));

        let request = Request::new("2", Operation::UpdateTransaction).with_params(json!({
            "transactionId": Uuid::new_v4().to_string(),
            "balance": 3
        }));
        let response = handler.handle(&request).await;
        assert_eq!(response.error_code(), Some(ErrorCode::NotFound));
        assert_eq!(response.error.unwrap().message, "Transaction not found");

        let request = Request::new("3", Operation::GetTransaction)
            .with_params(json!({"transactionId": Uuid::new_v4().to_string()}));
        let response = handler.handle(&request).await;
        assert_eq!(response.error_code(), Some(ErrorCode::NotFound));
        assert_eq!(response.error.unwrap().message, "failed to find transaction");
    }

    #[tokio::test]
    async fn test_delete_missing_is_ok_response() {
        let (_store, handler, _session) = test_handler();

        let request = Request::new("1", Operation::DeleteTransaction)
            .with_params(json!({"transactionId": Uuid::new_v4().to_string()}));
        let response = handler.handle(&request).await;

        assert!(response.is_ok());
        let result = response.result.unwrap();
        assert_eq!(result["success"], false);
        assert_eq!(result["message"], "Transaction not found");
    }

    #[tokio::test]
    async fn test_malformed_params_are_bad_request() {
        let (store, handler, _session) = test_handler();

        for params in [
            json!({"balance": "lots"}),
            json!({"balance": 1u64 << 40}),
            json!({"balance": 1.5}),
            json!([1]),
        ] {
            let request = Request::new("1", Operation::CreateTransaction).with_params(params);
            let response = handler.handle(&request).await;
            assert_eq!(response.error_code(), Some(ErrorCode::BadRequest));
        }

        let request = Request::new("2", Operation::GetTransaction)
            .with_params(json!({"transactionId": 42}));
        let response = handler.handle(&request).await;
        assert_eq!(response.error_code(), Some(ErrorCode::BadRequest));

        assert_eq!(store.statements_executed(), 0);
    }

    #[tokio::test]
    async fn test_missing_balance_defaults_to_zero() {
        let (store, handler, _session) = test_handler();

        for params in [json!({}), Value::Null] {
            let request = Request::new("1", Operation::CreateTransaction).with_params(params);
            let response = handler.handle(&request).await;
            let created: TransactionResult =
                serde_json::from_value(response.result.unwrap()).unwrap();
            assert!(created.success);
            assert_eq!(created.balance, 0);
        }
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_missing_transaction_id_is_invalid_argument() {
        let (store, handler, _session) = test_handler();
        create(&handler, 10).await;
        let executed = store.statements_executed();

        for op in [
            Operation::GetTransaction,
            Operation::UpdateTransaction,
            Operation::DeleteTransaction,
        ] {
            let request = Request::new("1", op).with_params(json!({"balance": 3}));
            let response = handler.handle(&request).await;
            let error = response.error.unwrap();
            assert_eq!(error.code, ErrorCode::InvalidArgument, "{:?}", op);
            assert!(error.message.starts_with("invalid transaction ID"));
        }
        assert_eq!(store.statements_executed(), executed);
    }

    #[tokio::test]
    async fn test_session_ops_rejected_off_connection() {
        let (_store, handler, _session) = test_handler();

        let response = handler.handle(&Request::new("1", Operation::Hello)).await;
        assert_eq!(response.error_code(), Some(ErrorCode::BadRequest));
    }

    #[tokio::test]
    async fn test_failing_store_is_internal() {
        let (store, handler, _session) = test_handler();
        store.set_failing(true);

        let request =
            Request::new("1", Operation::CreateTransaction).with_params(json!({"balance": 1}));
        let response = handler.handle(&request).await;

        let error = response.error.unwrap();
        assert_eq!(error.code, ErrorCode::InternalError);
        assert!(!error.retryable);
        assert!(error.message.starts_with("failed to create transaction: "));
    }

    /// Store whose calls never finish.
    struct StalledStore;

    #[async_trait]
    impl TransactionStore for StalledStore {
        async fn prepare(&self, _mode: SchemaMode) -> Result<(), StoreError> {
            Ok(())
        }
        async fn insert(&self, _id: Uuid, _balance: i64) -> Result<(), StoreError> {
            std::future::pending().await
        }
        async fn update_balance(&self, _id: Uuid, _balance: i64) -> Result<u64, StoreError> {
            std::future::pending().await
        }
        async fn delete(&self, _id: Uuid) -> Result<u64, StoreError> {
            std::future::pending().await
        }
        async fn fetch_balance(&self, _id: Uuid) -> Result<Option<i64>, StoreError> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_deadline_exceeded() {
        let handler = RequestHandler::new(Arc::new(StalledStore));

        let request = Request::new("1", Operation::CreateTransaction)
            .with_params(json!({"balance": 1}))
            .with_timeout_ms(20);
        let error = handler.handle(&request).await.error.unwrap();
        assert_eq!(error.code, ErrorCode::DeadlineExceeded);
        // The insert may still land, so a create is never worth repeating.
        assert!(!error.retryable);

        let request = Request::new("2", Operation::GetTransaction)
            .with_params(json!({"transactionId": Uuid::new_v4().to_string()}))
            .with_timeout_ms(20);
        let error = handler.handle(&request).await.error.unwrap();
        assert_eq!(error.code, ErrorCode::DeadlineExceeded);
        assert!(error.retryable);
    }

    #[tokio::test]
    async fn test_metrics_recorded() {
        let (_store, handler, _session) = test_handler();
        let metrics = Arc::new(Metrics::new().unwrap());
        let handler = handler.with_metrics(metrics.clone());

        create(&handler, 1).await;
        let request = Request::new("2", Operation::GetTransaction)
            .with_params(json!({"transactionId": Uuid::new_v4().to_string()}));
        handler.handle(&request).await;

        let encoded = String::from_utf8(metrics.encode().unwrap()).unwrap();
        assert!(encoded.contains("txnsvc_requests_total{operation=\"CREATE_TRANSACTION\"} 1"));
        assert!(encoded.contains("txnsvc_requests_total{operation=\"GET_TRANSACTION\"} 1"));
        assert!(encoded.contains("txnsvc_errors_total{code=\"NOT_FOUND\"} 1"));
    }
}
