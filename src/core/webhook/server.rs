//! Webhook HTTP ingress: axum server with an ordered validation chain.
//!
//! Validation order is part of the contract: rate limit (429), content
//! type (415), JSON object body (400), hook exists (404), hook enabled
//! (403), authentication (401), then 202 with an async dispatch.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::{ConnectInfo, Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Map, Value};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::auth::{validate_hook_auth, RateLimiter};
use super::store::WebhookStore;
use crate::config::WebhookConfig;
use crate::errors::{CoreError, CoreResult};

/// Receives validated hook payloads, fire-and-forget.
#[async_trait]
pub trait HookDispatcher: Send + Sync {
    async fn dispatch(&self, hook_id: String, payload: Map<String, Value>);
}

#[derive(Clone)]
pub struct ServerState {
    store: Arc<WebhookStore>,
    limiter: Arc<RateLimiter>,
    dispatcher: Arc<dyn HookDispatcher>,
    global_token: String,
}

pub struct WebhookServer {
    handle: JoinHandle<()>,
    pub local_addr: SocketAddr,
}

impl WebhookServer {
    /// Bind and start serving. The returned struct owns the serve task.
    pub async fn start(
        config: &WebhookConfig,
        store: Arc<WebhookStore>,
        dispatcher: Arc<dyn HookDispatcher>,
    ) -> CoreResult<Self> {
        let state = ServerState {
            store,
            limiter: Arc::new(RateLimiter::new(config.rate_limit_per_minute)),
            dispatcher,
            global_token: config.token.clone(),
        };

        let app = Router::new()
            .route("/health", get(handle_health))
            .route("/hooks/{hook_id}", post(handle_hook))
            .layer(tower_http::limit::RequestBodyLimitLayer::new(
                config.max_body_bytes,
            ))
            .with_state(state);

        let addr = format!("{}:{}", config.host, config.port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| CoreError::Webhook(format!("bind {addr}: {e}")))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| CoreError::Webhook(format!("local addr: {e}")))?;

        let handle = tokio::spawn(async move {
            if let Err(err) = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await
            {
                warn!("Webhook server exited: {err}");
            }
        });

        info!("Webhook server listening on {local_addr}");
        Ok(Self { handle, local_addr })
    }

    pub fn stop(&self) {
        self.handle.abort();
        info!("Webhook server stopped");
    }
}

async fn handle_health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

async fn handle_hook(
    Path(hook_id): Path<String>,
    State(state): State<ServerState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> impl IntoResponse {
    info!("Webhook request received hook={hook_id}");
    let source: IpAddr = remote.ip();

    // 1. Rate limit per source.
    if !state.limiter.check(source) {
        warn!("Webhook rejected: rate limited hook={hook_id}");
        return (StatusCode::TOO_MANY_REQUESTS, Json(json!({"error": "rate_limited"})));
    }

    // 2. Content type.
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if !content_type.starts_with("application/json") {
        warn!("Webhook rejected: bad content-type hook={hook_id}");
        return (
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            Json(json!({"error": "content_type_must_be_json"})),
        );
    }

    // 3. Body must parse as a JSON object (not array, not scalar).
    let payload: Map<String, Value> = match serde_json::from_slice::<Value>(&body) {
        Ok(Value::Object(map)) => map,
        Ok(_) => {
            warn!("Webhook rejected: body not object hook={hook_id}");
            return (StatusCode::BAD_REQUEST, Json(json!({"error": "body_must_be_object"})));
        }
        Err(_) => {
            warn!("Webhook rejected: invalid JSON hook={hook_id}");
            return (StatusCode::BAD_REQUEST, Json(json!({"error": "invalid_json"})));
        }
    };

    // 4. Hook lookup.
    let Some(hook) = state.store.get_hook(&hook_id) else {
        warn!("Webhook rejected: not found hook={hook_id}");
        return (StatusCode::NOT_FOUND, Json(json!({"error": "hook_not_found"})));
    };

    // 5. Enabled.
    if !hook.enabled {
        warn!("Webhook rejected: disabled hook={hook_id}");
        return (StatusCode::FORBIDDEN, Json(json!({"error": "hook_disabled"})));
    }

    // 6. Per-hook auth.
    let authorization = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let signature = if hook.hmac_header.is_empty() {
        ""
    } else {
        headers
            .get(hook.hmac_header.as_str())
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
    };
    if !validate_hook_auth(&hook, authorization, signature, &body, &state.global_token) {
        warn!("Webhook rejected: unauthorized hook={hook_id}");
        return (StatusCode::UNAUTHORIZED, Json(json!({"error": "unauthorized"})));
    }

    debug!("Webhook validation passed hook={hook_id}");

    // 7. Fire-and-forget dispatch so the HTTP response never waits on a
    // subprocess.
    let dispatcher = state.dispatcher.clone();
    let id_for_task = hook_id.clone();
    tokio::spawn(async move {
        dispatcher.dispatch(id_for_task, payload).await;
    });

    (
        StatusCode::ACCEPTED,
        Json(json!({"accepted": true, "hook_id": hook_id})),
    )
}
