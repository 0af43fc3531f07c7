//! Module for the http front door that hands uploaded readings to the ingestion handler.
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::ingest::{IngestError, IngestRequest, IngestionHandler};

fn default_route() -> String {
    String::from("/")
}

#[derive(Serialize, Deserialize, Debug, Clone)]
/// Parameters for the http listener.
pub struct HttpParameters {
    /// The ip address the server should listen on.
    pub address: String,
    /// The port the server should listen on.
    pub port: u16,
    /// The path readings are posted to.
    #[serde(default = "default_route")]
    pub route: String,
}

#[derive(Serialize, Debug)]
struct UploadResponse {
    success: bool,
}

/// Builds the router. Every method is routed to the handler, which rejects everything but POST.
pub fn router(route: &str, handler: Arc<IngestionHandler>) -> Router {
    Router::new()
        .route(route, any(upload))
        .with_state(handler)
}

async fn upload(State(handler): State<Arc<IngestionHandler>>, method: Method, body: Bytes) -> Response {
    match handler.handle(IngestRequest { method, body }).await {
        Ok(_) => (StatusCode::OK, Json(UploadResponse { success: true })).into_response(),
        Err(err) => error_response(err),
    }
}

fn error_response(err: IngestError) -> Response {
    let status = err.status_code();
    match &err {
        IngestError::MethodNotAllowed(_) => {
            log::warn!(target: "telemetryd::http", "Rejected request: \'{}\'", err);
            (status, [(header::ALLOW, "POST")], "Only POST allowed").into_response()
        }
        IngestError::InvalidRequest(reason) => {
            log::warn!(target: "telemetryd::http", "Rejected request: \'{}\'", err);
            (status, format!("Missing or invalid fields: {}", reason)).into_response()
        }
        IngestError::LogAppend(_) | IngestError::LatestUpdate { .. } => {
            log::error!(target: "telemetryd::http", "Upload error: \'{}\'", err);
            (status, "Server error").into_response()
        }
    }
}

/// Serves the router until `shutdown` completes.
///
/// # Errors
///
/// * The address cannot be parsed or bound.
///
/// * The server fails while accepting connections.
///
pub async fn serve<F>(params: HttpParameters, handler: Arc<IngestionHandler>, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let address: SocketAddr = match format!("{}:{}", params.address, params.port).parse() {
        Ok(address) => address,
        Err(err) => {
            log::error!(target: "telemetryd::http", "Invalid listen address: \'{}\'", err);
            return Err(std::io::Error::new(std::io::ErrorKind::InvalidInput, err));
        }
    };

    let listener = tokio::net::TcpListener::bind(address).await?;
    log::info!(target: "telemetryd::http", "Listening on \'{}\', readings accepted at \'{}\'", listener.local_addr()?, params.route);

    axum::serve(listener, router(&params.route, handler))
        .with_graceful_shutdown(shutdown)
        .await
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use serde_json::json;
    use tower::ServiceExt;

    use super::*;
    use crate::ingest::tests::FaultyStore;

    fn app() -> (Arc<FaultyStore>, Router) {
        let store = Arc::new(FaultyStore::default());
        let handler = Arc::new(IngestionHandler::new(store.clone()));
        (store, router("/", handler))
    }

    async fn send(app: Router, method: Method, body: &str) -> (StatusCode, Option<String>, String) {
        let request = Request::builder()
            .method(method)
            .uri("/")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let allow = response
            .headers()
            .get(header::ALLOW)
            .map(|value| value.to_str().unwrap().to_string());
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, allow, String::from_utf8(bytes.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn accepted_reading_returns_success() {
        let (store, app) = app();
        let body = json!({"deviceId": "bus-1", "timestamp": 100, "payload": {"lat": 1.0, "lon": 2.0}});

        let (status, _, text) = send(app, Method::POST, &body.to_string()).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(serde_json::from_str::<serde_json::Value>(&text).unwrap(), json!({"success": true}));
        assert_eq!(store.inner.logs("bus-1").len(), 1);
        assert_eq!(
            serde_json::to_value(store.inner.latest("bus-1").unwrap()).unwrap(),
            json!({"timestamp": 100, "lat": 1.0, "lon": 2.0})
        );
    }

    #[tokio::test]
    async fn empty_device_id_is_bad_request() {
        let (store, app) = app();

        let (status, _, text) = send(app, Method::POST, r#"{"deviceId": "", "payload": {"x": 1}}"#).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(text.contains("deviceId"));
        assert_eq!(store.append_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn get_is_method_not_allowed() {
        let (store, app) = app();

        let (status, allow, _) = send(app, Method::GET, "").await;

        assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(allow.as_deref(), Some("POST"));
        assert_eq!(store.append_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn store_failures_do_not_leak_details() {
        let (store, app) = app();
        store.fail_append.store(true, Ordering::SeqCst);

        let (status, _, text) = send(app, Method::POST, r#"{"deviceId": "bus-1", "payload": {"x": 1}}"#).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(text, "Server error");
        assert_eq!(store.latest_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn snapshot_failure_is_server_error_with_log_entry() {
        let (store, app) = app();
        store.fail_latest.store(true, Ordering::SeqCst);

        let (status, _, _) = send(app, Method::POST, r#"{"deviceId": "bus-1", "payload": {"x": 1}}"#).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(store.inner.logs("bus-1").len(), 1);
        assert!(store.inner.latest("bus-1").is_none());
    }

    #[tokio::test]
    async fn nul_in_payload_is_bad_request() {
        let (store, app) = app();

        let (status, _, text) = send(app, Method::POST, r#"{"deviceId": "bus-1", "payload": {"note": "a\u0000b"}}"#).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(text.contains("NUL"));
        assert_eq!(store.append_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn superseded_snapshot_is_success() {
        let (store, app) = app();
        store.force_superseded.store(true, Ordering::SeqCst);

        let (status, _, text) = send(app, Method::POST, r#"{"deviceId": "bus-1", "payload": {"x": 1}}"#).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(serde_json::from_str::<serde_json::Value>(&text).unwrap(), json!({"success": true}));
        assert_eq!(store.inner.logs("bus-1").len(), 1);
        assert!(store.inner.latest("bus-1").is_none());
    }

    #[test]
    fn route_defaults_to_root() {
        let params: HttpParameters = serde_yaml::from_str("address: 127.0.0.1\nport: 8080").unwrap();

        assert_eq!(params.route, "/");
        assert_eq!(params.port, 8080);
    }
}
