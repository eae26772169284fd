//! Courier service: HTTP listener, socket upgrades and background sweeps.

use crate::codec::CodecSettings;
use crate::domain::config::GatewayConfig;
use crate::domain::connection::{ConnectionMeta, TransportKind};
use crate::domain::error::{ApiError, GatewayError};
use crate::ports::{CloseReason, CredentialRegistry};
use crate::router::RpcRouter;
use crate::transport::authenticated::{AuthenticatedAdapter, AuthenticatedRequest};
use crate::transport::exchange::error_reply;
use crate::transport::liveness::{liveness_task, LivenessMonitor};
use crate::transport::pending::{sweep_task, PendingExchangeStore};
use crate::transport::plaintext::{PlainRequest, PlaintextAdapter};
use crate::transport::socket::{SocketAdapter, SocketMode};
use crate::transport::third_party::{ThirdPartyAdapter, ThirdPartyRequest};
use crate::transport::HttpReply;
use axum::{
    body::Bytes,
    extract::{ws::WebSocketUpgrade, ConnectInfo, Path, Query, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::{any, get, post},
    Json, Router,
};
use shared_crypto::RsaPrivateKey;
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Courier service state
pub struct CourierService {
    config: GatewayConfig,
    router: Arc<RpcRouter>,
    state: AppState,
}

/// Shared by every route.
#[derive(Clone)]
struct AppState {
    router: Arc<RpcRouter>,
    pending: Arc<PendingExchangeStore>,
    liveness: Arc<LivenessMonitor>,
    sockets: Arc<SocketAdapter>,
    plaintext: Arc<PlaintextAdapter>,
    authenticated: Arc<AuthenticatedAdapter>,
    third_party: Arc<ThirdPartyAdapter>,
}

impl CourierService {
    /// Create the service around an already configured router.
    pub fn new(
        config: GatewayConfig,
        router: Arc<RpcRouter>,
        credentials: Arc<dyn CredentialRegistry>,
        private_key: Arc<RsaPrivateKey>,
    ) -> Result<Self, GatewayError> {
        config.validate()?;

        let codec = CodecSettings::from(&config.codec);
        let pending = Arc::new(PendingExchangeStore::new(config.authenticated.request_timeout));
        let liveness = Arc::new(LivenessMonitor::new(&config.socket));
        let sockets = Arc::new(SocketAdapter::new(
            Arc::clone(&router),
            Arc::clone(&liveness),
            Arc::clone(&private_key),
            &config.socket,
            codec,
        ));
        let plaintext = Arc::new(PlaintextAdapter::new(Arc::clone(&router), Arc::clone(&pending)));
        let authenticated = Arc::new(AuthenticatedAdapter::new(
            Arc::clone(&router),
            Arc::clone(&pending),
            Arc::clone(&credentials),
            router.store(),
            private_key,
            &config,
        ));
        let third_party = Arc::new(ThirdPartyAdapter::new(
            Arc::clone(&router),
            Arc::clone(&pending),
            credentials,
            config.third_party.markers.iter().cloned(),
            codec,
        ));

        Ok(Self {
            state: AppState {
                router: Arc::clone(&router),
                pending,
                liveness,
                sockets,
                plaintext,
                authenticated,
                third_party,
            },
            config,
            router,
        })
    }

    pub fn router(&self) -> &Arc<RpcRouter> {
        &self.router
    }

    pub fn pending_store(&self) -> Arc<PendingExchangeStore> {
        Arc::clone(&self.state.pending)
    }

    pub fn liveness(&self) -> Arc<LivenessMonitor> {
        Arc::clone(&self.state.liveness)
    }

    /// Bind the configured listener address.
    pub async fn bind(&self) -> Result<TcpListener, GatewayError> {
        let addr = self.config.http_addr();
        TcpListener::bind(addr)
            .await
            .map_err(|source| GatewayError::Bind { addr, source })
    }

    /// Build the HTTP router
    pub fn build_http_router(&self) -> Router {
        Router::new()
            .route("/socket/:encryption/:scope", get(socket_upgrade))
            .route("/api/:name", get(plaintext_api).post(plaintext_api))
            .route("/api/:name/:id", get(plaintext_api).post(plaintext_api))
            .route("/s2s/:name", post(authenticated_api))
            .route("/tp/:marker/:name", any(third_party_api))
            .route("/tp/:marker/:name/:params", any(third_party_api))
            .route("/health", get(health_check))
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Serve on `listener` until `shutdown` resolves.
    ///
    /// The liveness sweep, the pending-exchange sweep and the worker channel
    /// listener run for as long as the server does.
    pub async fn run<F>(self, listener: TcpListener, shutdown: F) -> Result<(), GatewayError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let local_addr = listener.local_addr()?;
        let tasks = self.start_background_tasks();
        let app = self.build_http_router();

        let liveness = Arc::clone(&self.state.liveness);
        let router = Arc::clone(&self.router);
        let signal = async move {
            shutdown.await;
            info!("Received shutdown signal");
            let closed = liveness.close_all(&router, CloseReason::Shutdown).await;
            info!(closed, "Closed open sockets");
        };

        info!(addr = %local_addr, worker_id = %self.router.worker_id(), "Courier service started");
        let result = axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(signal)
            .await
            .map_err(|e| GatewayError::Server(e.to_string()));

        for task in tasks {
            task.abort();
        }
        info!("Courier service stopped");
        result
    }

    fn start_background_tasks(&self) -> Vec<JoinHandle<()>> {
        let liveness = tokio::spawn(liveness_task(
            Arc::clone(&self.state.liveness),
            Arc::clone(&self.router),
        ));
        let pending = tokio::spawn(sweep_task(
            Arc::clone(&self.state.pending),
            Arc::clone(&self.router),
            self.config.authenticated.sweep_interval,
        ));
        let listener = self.router.spawn_worker_listener();
        vec![liveness, pending, listener]
    }
}

impl IntoResponse for HttpReply {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let mut response = (status, self.body).into_response();
        let headers = response.headers_mut();
        for (name, value) in self.headers {
            match (HeaderName::try_from(name.as_str()), HeaderValue::try_from(value.as_str())) {
                (Ok(name), Ok(value)) if name == header::SET_COOKIE => {
                    headers.append(name, value);
                }
                (Ok(name), Ok(value)) => {
                    headers.insert(name, value);
                }
                _ => warn!(header = %name, "Dropped invalid response header"),
            }
        }
        response
    }
}

fn connection_meta(
    kind: TransportKind,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: &HeaderMap,
    uri: &Uri,
) -> ConnectionMeta {
    let mut meta = ConnectionMeta::new(kind).with_url(uri.to_string());
    if let Some(ConnectInfo(addr)) = peer {
        meta = meta.with_ip(addr.ip());
        meta.port = addr.port();
    }
    if let Some(host) = headers.get(header::HOST).and_then(|v| v.to_str().ok()) {
        meta.host = host.to_string();
    }
    headers.iter().fold(meta, |meta, (name, value)| match value.to_str() {
        Ok(value) => meta.with_header(name.as_str(), value),
        Err(_) => meta,
    })
}

async fn socket_upgrade(
    State(state): State<AppState>,
    Path((encryption, scope)): Path<(String, String)>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    uri: Uri,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(mode) = SocketMode::from_path(&encryption, &scope) else {
        warn!(%encryption, %scope, "Unknown socket mode");
        return StatusCode::NOT_FOUND.into_response();
    };
    let meta = connection_meta(TransportKind::Socket, peer, &headers, &uri);
    let sockets = Arc::clone(&state.sockets);
    ws.on_upgrade(move |socket| sockets.serve(socket, mode, meta))
}

async fn plaintext_api(
    State(state): State<AppState>,
    Path(path): Path<HashMap<String, String>>,
    Query(query): Query<HashMap<String, String>>,
    method: Method,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    uri: Uri,
    body: Bytes,
) -> HttpReply {
    let request = PlainRequest {
        meta: connection_meta(TransportKind::Http, peer, &headers, &uri),
        api: path.get("name").cloned().unwrap_or_default(),
        id: path.get("id").cloned(),
        method: method.to_string(),
        query,
        content_type: content_type(&headers),
        body,
    };
    state.plaintext.handle(request).await
}

async fn authenticated_api(
    State(state): State<AppState>,
    Path(name): Path<String>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    uri: Uri,
    body: Bytes,
) -> HttpReply {
    let request = AuthenticatedRequest {
        meta: connection_meta(TransportKind::HttpsAuthenticated, peer, &headers, &uri),
        api: name,
        body,
    };
    state.authenticated.handle(request).await
}

async fn third_party_api(
    State(state): State<AppState>,
    Path(path): Path<HashMap<String, String>>,
    Query(query): Query<HashMap<String, String>>,
    method: Method,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    uri: Uri,
    body: Bytes,
) -> HttpReply {
    let (Some(marker), Some(api)) = (path.get("marker"), path.get("name")) else {
        return error_reply("", state.router.now_ms(), &ApiError::unknown_api(""));
    };
    let request = ThirdPartyRequest {
        meta: connection_meta(TransportKind::HttpsThirdParty, peer, &headers, &uri),
        marker: marker.clone(),
        api: api.clone(),
        blob: path.get("params").cloned(),
        method: method.to_string(),
        query,
        content_type: content_type(&headers),
        body,
    };
    state.third_party.handle(request).await
}

fn content_type(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Health check endpoint
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let stats = state.pending.stats();
    Json(serde_json::json!({
        "status": "healthy",
        "workerId": state.router.worker_id(),
        "sockets": state.liveness.len(),
        "pending": {
            "count": state.pending.pending_count(),
            "registered": stats.total_registered.load(Ordering::Relaxed),
            "completed": stats.total_completed.load(Ordering::Relaxed),
            "timeouts": stats.total_timeouts.load(Ordering::Relaxed),
        },
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::StaticCredentialRegistry;
    use crate::testing::server_key;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    fn service() -> CourierService {
        let router = RpcRouter::builder("w1").build();
        router
            .register_api("greet", |ctx| async move {
                let name = ctx.params()["name"].as_str().unwrap_or("anonymous").to_string();
                Ok(json!({ "hello": name }))
            })
            .unwrap();
        CourierService::new(
            GatewayConfig::default(),
            router,
            Arc::new(StaticCredentialRegistry::default()),
            Arc::new(server_key().clone()),
        )
        .unwrap()
    }

    async fn body_json(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let app = service().build_http_router();
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["sockets"], 0);
    }

    #[tokio::test]
    async fn test_plaintext_route() {
        let app = service().build_http_router();
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/greet?name=ferris")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body[0]["data"]["hello"], "ferris");
    }

    #[tokio::test]
    async fn test_unknown_api_status() {
        let app = service().build_http_router();
        let response = app
            .oneshot(Request::builder().uri("/api/missing").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_unknown_marker_rejected() {
        let app = service().build_http_router();
        let response = app
            .oneshot(Request::builder().uri("/tp/nobody/greet").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_json(response).await["errorCode"], "INVALID_CLIENT");
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let mut config = GatewayConfig::default();
        config.authenticated.protocol_version = " ".into();
        let result = CourierService::new(
            config,
            RpcRouter::builder("w1").build(),
            Arc::new(StaticCredentialRegistry::default()),
            Arc::new(server_key().clone()),
        );
        assert!(matches!(result, Err(GatewayError::Config(_))));
    }
}
