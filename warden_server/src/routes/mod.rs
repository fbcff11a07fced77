//! Internal HTTP surface of the defense pipeline
//!
//! Every `/api/v1` route requires the shared secret in `X-Warden-Secret`.

pub mod fraud;
pub mod screen;
pub mod sessions;

use crate::audit::AuditLog;
use crate::clock::Clock;
use crate::config::Config;
use crate::error::DefenseError;
use crate::fraud::FraudDetector;
use crate::pipeline::{retry_after_for, status_for, DefensePipeline};
use crate::session::SessionManager;
use crate::abuse::RateLimiter;
use crate::store::StateStore;
use axum::{
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use warden_common::constants;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<dyn StateStore>,
    pub clock: Arc<dyn Clock>,
    pub audit: AuditLog,
    pub pipeline: DefensePipeline,
}

impl AppState {
    /// Build every service. Each one probes the store before it is usable.
    pub async fn new(
        config: Config,
        store: Arc<dyn StateStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, DefenseError> {
        let audit = AuditLog::new();
        let limiter = RateLimiter::init(store.clone(), clock.clone(), &config.rate_limit).await?;
        let fraud = FraudDetector::init(
            store.clone(),
            clock.clone(),
            audit.clone(),
            config.fraud.clone(),
        )
        .await?;
        let sessions = SessionManager::init(
            store.clone(),
            clock.clone(),
            audit.clone(),
            config.session.clone(),
        )
        .await?;

        Ok(Self {
            pipeline: DefensePipeline::new(limiter, fraud, sessions, clock.clone(), audit.clone()),
            config: Arc::new(config),
            store,
            clock,
            audit,
        })
    }
}

/// Build the full router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .merge(screen::router())
        .merge(fraud::router())
        .merge(sessions::router())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Validate the shared secret header
fn authorize(state: &AppState, headers: &HeaderMap) -> Result<(), Response> {
    let provided = headers
        .get(constants::WARDEN_SECRET_HEADER)
        .and_then(|v| v.to_str().ok());

    match provided {
        Some(secret) if secret == state.config.warden_secret => Ok(()),
        _ => Err((StatusCode::FORBIDDEN, "Invalid warden secret").into_response()),
    }
}

/// Error response for a pipeline failure. Store causes are never exposed.
fn error_response(state: &AppState, error: &DefenseError) -> Response {
    let (status, reason) = status_for(error);
    let message = if status == StatusCode::SERVICE_UNAVAILABLE {
        "Service temporarily unavailable".to_string()
    } else {
        error.to_string()
    };

    let body = Json(serde_json::json!({
        "error": message,
        "reason": reason,
    }));
    match retry_after_for(error, state.clock.now()) {
        Some(secs) => (status, [(header::RETRY_AFTER, secs.to_string())], body).into_response(),
        None => (status, body).into_response(),
    }
}

/// Health check endpoint
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let store_status = state
        .store
        .ping()
        .await
        .map(|_| "ok")
        .unwrap_or("error");

    let status = if store_status == "ok" { "healthy" } else { "degraded" };
    let code = if store_status == "ok" {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        code,
        Json(serde_json::json!({
            "status": status,
            "store": store_status,
            "backend": format!("{:?}", state.config.store_backend).to_lowercase(),
        })),
    )
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::{FraudSettings, RateLimitSettings, SessionSettings, StoreBackend};
    use crate::store::MemoryStore;
    use axum::body::Body;
    use axum::http::Request;
    use std::time::Duration;

    pub const SECRET: &str = "test-secret";

    pub fn test_config() -> Config {
        Config {
            host: "127.0.0.1".to_string(),
            port: 0,
            store_backend: StoreBackend::Memory,
            redis_url: String::new(),
            store_timeout: Duration::from_millis(150),
            warden_secret: SECRET.to_string(),
            rate_limit: RateLimitSettings::default(),
            fraud: FraudSettings::default(),
            session: SessionSettings::default(),
        }
    }

    pub async fn app() -> (Arc<MemoryStore>, Router) {
        let clock = Arc::new(ManualClock::new());
        let store = Arc::new(MemoryStore::new(clock.clone()));
        let state = AppState::new(test_config(), store.clone(), clock).await.unwrap();
        (store, router(state))
    }

    pub fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(constants::WARDEN_SECRET_HEADER, SECRET)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    pub fn empty_request(method: &str, uri: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(constants::WARDEN_SECRET_HEADER, SECRET)
            .body(Body::empty())
            .unwrap()
    }

    pub async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    pub fn browser_request(ip: &str, path: &str) -> serde_json::Value {
        serde_json::json!({
            "ip_address": ip,
            "endpoint_path": path,
            "http_method": "POST",
            "is_authenticated": false,
            "user_agent": "Mozilla/5.0 Firefox/128.0",
            "raw_headers": [["Accept-Language", "en-US"], ["Accept", "text/html"]],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use crate::store::memory::Fault;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_health() {
        let (store, app) = app().await;
        let request = Request::get("/health").body(Body::empty()).unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["store"], "ok");

        store.inject_fault(Fault::Unavailable);
        let request = Request::get("/health").body(Body::empty()).unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_secret_required() {
        let (_, app) = app().await;
        let request = Request::post("/api/v1/screen")
            .header("content-type", "application/json")
            .body(Body::from(browser_request("192.0.2.1", "/auth/login").to_string()))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }
}
