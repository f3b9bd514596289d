//! Edge proxy: forwards an enveloped request to the data service with the
//! server-held key attached, and relays the upstream status and body verbatim.
//!
//! - `OPTIONS` on any path is answered as a CORS preflight before the body is read.
//! - Any other method on any path is treated as an envelope submission.
//! - `GET /healthz` and `GET /openapi.json` are local.
//!
//! The envelope's `endpoint` is appended to the base URL as-is. There is no
//! allow-list, so a caller can reach any path the key can reach, and a
//! caller-supplied `Authorization` header replaces the injected one.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderName, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{error, info};
use utoipa::{OpenApi, ToSchema};

const ALLOW_ORIGIN: &str = "*";
const ALLOW_HEADERS: &str = "Content-Type, Authorization, apikey";
const ALLOW_METHODS: &str = "GET, POST, PUT, DELETE, PATCH, OPTIONS";

/// Where and how requests are forwarded.
#[derive(Clone)]
pub struct ProxyState {
    client: reqwest::Client,
    service_url: String,
    service_key: String,
}

impl ProxyState {
    pub fn new(service_url: impl Into<String>, service_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            service_url: service_url.into(),
            service_key: service_key.into(),
        }
    }
}

/// Request body describing the call to forward.
#[derive(Deserialize, Debug, Default, ToSchema)]
pub struct ProxyEnvelope {
    /// Path (and query) appended to the data service base URL
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Forwarded HTTP method, `GET` when absent
    #[serde(default)]
    pub method: Option<String>,
    /// Sent for POST, PUT and PATCH. Strings are forwarded unchanged, anything else JSON-encoded
    #[serde(default)]
    #[schema(value_type = Object)]
    pub body: Option<Value>,
    /// Extra request headers; these win over the injected ones
    #[serde(default)]
    #[schema(value_type = Object)]
    pub headers: Option<BTreeMap<String, Value>>,
}

#[derive(Serialize, Deserialize, Debug, ToSchema)]
pub struct ErrorBody {
    pub error: String,
}

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Missing endpoint parameter")]
    MissingEndpoint,

    #[error("{0}")]
    Internal(String),
}

impl From<serde_json::Error> for ProxyError {
    fn from(e: serde_json::Error) -> Self {
        ProxyError::Internal(e.to_string())
    }
}

impl From<reqwest::Error> for ProxyError {
    fn from(e: reqwest::Error) -> Self {
        ProxyError::Internal(e.to_string())
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = match self {
            ProxyError::MissingEndpoint => StatusCode::BAD_REQUEST,
            ProxyError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = ErrorBody {
            error: self.to_string(),
        };
        (status, cors_headers(), Json(body)).into_response()
    }
}

#[derive(OpenApi)]
#[openapi(
    paths(proxy_handler),
    components(schemas(ProxyEnvelope, ErrorBody))
)]
pub struct ApiDoc;

fn cors_headers() -> [(HeaderName, &'static str); 3] {
    [
        (header::ACCESS_CONTROL_ALLOW_ORIGIN, ALLOW_ORIGIN),
        (header::ACCESS_CONTROL_ALLOW_HEADERS, ALLOW_HEADERS),
        (header::ACCESS_CONTROL_ALLOW_METHODS, ALLOW_METHODS),
    ]
}

/// Build the proxy router.
pub fn create_router(state: ProxyState) -> Router {
    Router::new()
        .route("/healthz", get(health_handler).fallback(proxy_handler))
        .route("/openapi.json", get(openapi_handler).fallback(proxy_handler))
        .fallback(proxy_handler)
        .with_state(Arc::new(state))
}

/// Forward an enveloped request to the data service.
#[utoipa::path(
    post,
    path = "/",
    request_body = ProxyEnvelope,
    responses(
        (status = 200, description = "Upstream status and body relayed unchanged"),
        (status = 204, description = "CORS preflight (OPTIONS)"),
        (status = 400, description = "Envelope has no endpoint", body = ErrorBody),
        (status = 500, description = "Envelope unreadable or upstream unreachable", body = ErrorBody)
    )
)]
async fn proxy_handler(
    State(state): State<Arc<ProxyState>>,
    method: Method,
    body: Bytes,
) -> Response {
    if method == Method::OPTIONS {
        return (StatusCode::NO_CONTENT, cors_headers()).into_response();
    }

    match forward(&state, &body).await {
        Ok(response) => response,
        Err(e) => {
            if let ProxyError::Internal(msg) = &e {
                error!("proxy call failed: {msg}");
            }
            e.into_response()
        }
    }
}

async fn forward(state: &ProxyState, raw: &[u8]) -> Result<Response, ProxyError> {
    let envelope: ProxyEnvelope = if raw.is_empty() {
        ProxyEnvelope::default()
    } else {
        serde_json::from_slice(raw)?
    };

    let endpoint = match envelope.endpoint.as_deref() {
        Some(endpoint) if !endpoint.is_empty() => endpoint,
        _ => return Err(ProxyError::MissingEndpoint),
    };
    let method_name = envelope.method.as_deref().unwrap_or("GET");
    let method = reqwest::Method::from_bytes(method_name.as_bytes())
        .map_err(|e| ProxyError::Internal(format!("invalid method '{method_name}': {e}")))?;

    let url = format!("{}{}", state.service_url, endpoint);
    let headers = outbound_headers(&state.service_key, envelope.headers.as_ref())?;

    let mut request = state.client.request(method, url).headers(headers);
    if matches!(method_name, "POST" | "PUT" | "PATCH") {
        if let Some(body) = envelope.body.as_ref().and_then(outbound_body) {
            request = request.body(body);
        }
    }

    let upstream = request.send().await?;
    let status = upstream.status();
    let text = upstream.text().await?;
    info!(method = method_name, endpoint, status = status.as_u16(), "forwarded");

    Ok((
        status,
        cors_headers(),
        [(header::CONTENT_TYPE, "application/json")],
        text,
    )
        .into_response())
}

/// Injected credentials first, then the caller's headers on top.
fn outbound_headers(
    service_key: &str,
    extra: Option<&BTreeMap<String, Value>>,
) -> Result<reqwest::header::HeaderMap, ProxyError> {
    let mut headers = reqwest::header::HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert("apikey", header_value(service_key)?);
    headers.insert(header::AUTHORIZATION, header_value(&format!("Bearer {service_key}"))?);

    for (name, value) in extra.into_iter().flatten() {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| ProxyError::Internal(format!("invalid header name '{name}': {e}")))?;
        let value = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        headers.insert(name, header_value(&value)?);
    }
    Ok(headers)
}

fn header_value(value: &str) -> Result<HeaderValue, ProxyError> {
    HeaderValue::from_str(value).map_err(|e| ProxyError::Internal(format!("invalid header value: {e}")))
}

/// Falsy bodies (null, false, 0, "") are not sent.
fn outbound_body(body: &Value) -> Option<String> {
    match body {
        Value::Null | Value::Bool(false) => None,
        Value::String(s) if s.is_empty() => None,
        Value::Number(n) if n.as_f64() == Some(0.0) => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

async fn health_handler() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn openapi_handler() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::Request};
    use std::sync::Mutex;
    use tokio::net::TcpListener;
    use tower::ServiceExt; // For .oneshot() testing

    /// A request as it reached the upstream.
    #[derive(Debug, Clone, Default)]
    struct Forwarded {
        method: String,
        uri: String,
        apikey: Option<String>,
        authorization: Option<String>,
        content_type: Option<String>,
        extra: Option<String>,
        body: String,
    }

    type Log = Arc<Mutex<Vec<Forwarded>>>;

    async fn spawn_upstream() -> (String, Log) {
        let log: Log = Arc::default();
        let app = Router::new()
            .fallback(
                |State(log): State<Log>,
                 method: Method,
                 uri: axum::http::Uri,
                 headers: axum::http::HeaderMap,
                 body: String| async move {
                    let get = |name: &str| {
                        headers
                            .get(name)
                            .and_then(|v| v.to_str().ok())
                            .map(String::from)
                    };
                    log.lock().unwrap().push(Forwarded {
                        method: method.to_string(),
                        uri: uri.to_string(),
                        apikey: get("apikey"),
                        authorization: get("authorization"),
                        content_type: get("content-type"),
                        extra: get("prefer"),
                        body,
                    });
                    (StatusCode::CREATED, r#"[{"id": 1}]"#)
                },
            )
            .with_state(log.clone());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}"), log)
    }

    fn post(body: impl Into<Body>) -> Request<Body> {
        Request::builder()
            .uri("/.netlify/functions/proxy")
            .method("POST")
            .header("content-type", "application/json")
            .body(body.into())
            .unwrap()
    }

    async fn read(response: Response) -> (StatusCode, axum::http::HeaderMap, String) {
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, headers, String::from_utf8(bytes.to_vec()).unwrap())
    }

    fn offline_router() -> Router {
        // port 1 on loopback refuses connections
        create_router(ProxyState::new("http://127.0.0.1:1", "service-key"))
    }

    #[tokio::test]
    async fn preflight_short_circuits_before_parsing() {
        let request = Request::builder()
            .uri("/anything")
            .method("OPTIONS")
            .body(Body::from("not json at all"))
            .unwrap();
        let (status, headers, body) = read(offline_router().oneshot(request).await.unwrap()).await;

        assert_eq!(status, StatusCode::NO_CONTENT);
        assert!(body.is_empty());
        assert_eq!(headers["access-control-allow-origin"], "*");
        assert_eq!(headers["access-control-allow-headers"], ALLOW_HEADERS);
        assert_eq!(headers["access-control-allow-methods"], ALLOW_METHODS);
    }

    #[tokio::test]
    async fn preflight_on_local_routes_is_still_204() {
        let request = Request::builder()
            .uri("/healthz")
            .method("OPTIONS")
            .body(Body::empty())
            .unwrap();
        let response = offline_router().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn missing_endpoint_is_400() {
        for body in ["", "{}", r#"{"endpoint": null, "method": "POST"}"#, r#"{"endpoint": ""}"#] {
            let (status, headers, text) =
                read(offline_router().oneshot(post(body)).await.unwrap()).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "body {body:?}");
            assert_eq!(text, r#"{"error":"Missing endpoint parameter"}"#);
            assert_eq!(headers["access-control-allow-origin"], "*");
        }
    }

    #[tokio::test]
    async fn unparseable_envelope_is_500() {
        let (status, _, text) = read(offline_router().oneshot(post("{oops")).await.unwrap()).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        let body: ErrorBody = serde_json::from_str(&text).unwrap();
        assert!(!body.error.is_empty());
    }

    #[tokio::test]
    async fn unreachable_upstream_is_500_with_message() {
        let envelope = json!({ "endpoint": "/rest/v1/events" }).to_string();
        let (status, headers, text) =
            read(offline_router().oneshot(post(envelope)).await.unwrap()).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(headers["access-control-allow-origin"], "*");
        let body: Value = serde_json::from_str(&text).unwrap();
        assert!(body["error"].as_str().is_some_and(|m| !m.is_empty()));
    }

    #[tokio::test]
    async fn relays_upstream_status_and_body_verbatim() {
        let (url, log) = spawn_upstream().await;
        let app = create_router(ProxyState::new(url, "service-key"));

        let envelope = json!({
            "endpoint": "/rest/v1/events?select=*&order=date.asc",
        })
        .to_string();
        let (status, headers, text) = read(app.oneshot(post(envelope)).await.unwrap()).await;

        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(text, r#"[{"id": 1}]"#);
        assert_eq!(headers["content-type"], "application/json");
        assert_eq!(headers["access-control-allow-origin"], "*");

        let seen = log.lock().unwrap()[0].clone();
        assert_eq!(seen.method, "GET");
        assert_eq!(seen.uri, "/rest/v1/events?select=*&order=date.asc");
        assert_eq!(seen.apikey.as_deref(), Some("service-key"));
        assert_eq!(seen.authorization.as_deref(), Some("Bearer service-key"));
        assert_eq!(seen.content_type.as_deref(), Some("application/json"));
        assert!(seen.body.is_empty());
    }

    #[tokio::test]
    async fn object_body_is_json_encoded_in_order() {
        let (url, log) = spawn_upstream().await;
        let app = create_router(ProxyState::new(url, "service-key"));

        let envelope = r#"{"endpoint":"/rest/v1/events","method":"POST","body":{"name":"Pi Day","date":"2026-03-14","tags":[1,2]}}"#;
        app.oneshot(post(envelope)).await.unwrap();

        let seen = log.lock().unwrap()[0].clone();
        assert_eq!(seen.method, "POST");
        assert_eq!(seen.body, r#"{"name":"Pi Day","date":"2026-03-14","tags":[1,2]}"#);
    }

    #[tokio::test]
    async fn string_body_is_forwarded_unchanged() {
        let (url, log) = spawn_upstream().await;
        let app = create_router(ProxyState::new(url, "service-key"));

        let envelope = json!({
            "endpoint": "/rest/v1/events?id=eq.1",
            "method": "PATCH",
            "body": "{ \"name\" : \"kept as is\" }",
        })
        .to_string();
        app.oneshot(post(envelope)).await.unwrap();

        let seen = log.lock().unwrap()[0].clone();
        assert_eq!(seen.method, "PATCH");
        assert_eq!(seen.body, "{ \"name\" : \"kept as is\" }");
    }

    #[tokio::test]
    async fn body_is_dropped_for_other_methods() {
        let (url, log) = spawn_upstream().await;
        let app = create_router(ProxyState::new(url, "service-key"));

        let envelope = json!({
            "endpoint": "/rest/v1/events?id=eq.1",
            "method": "DELETE",
            "body": { "ignored": true },
        })
        .to_string();
        app.oneshot(post(envelope)).await.unwrap();

        let seen = log.lock().unwrap()[0].clone();
        assert_eq!(seen.method, "DELETE");
        assert!(seen.body.is_empty());
    }

    #[tokio::test]
    async fn caller_headers_override_injected_ones() {
        let (url, log) = spawn_upstream().await;
        let app = create_router(ProxyState::new(url, "service-key"));

        let envelope = json!({
            "endpoint": "/rest/v1/rpc/is_admin",
            "method": "POST",
            "body": {},
            "headers": { "Authorization": "Bearer user-token", "Prefer": "return=minimal" },
        })
        .to_string();
        app.oneshot(post(envelope)).await.unwrap();

        let seen = log.lock().unwrap()[0].clone();
        assert_eq!(seen.authorization.as_deref(), Some("Bearer user-token"));
        assert_eq!(seen.apikey.as_deref(), Some("service-key"));
        assert_eq!(seen.extra.as_deref(), Some("return=minimal"));
        assert_eq!(seen.body, "{}");
    }

    #[tokio::test]
    async fn health_and_openapi_are_local() {
        let request = Request::builder()
            .uri("/healthz")
            .method("GET")
            .body(Body::empty())
            .unwrap();
        let (status, _, text) = read(offline_router().oneshot(request).await.unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(text, r#"{"status":"ok"}"#);

        let request = Request::builder()
            .uri("/openapi.json")
            .method("GET")
            .body(Body::empty())
            .unwrap();
        let (status, _, text) = read(offline_router().oneshot(request).await.unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        let doc: Value = serde_json::from_str(&text).unwrap();
        assert!(doc["components"]["schemas"]["ProxyEnvelope"].is_object());
    }
}
