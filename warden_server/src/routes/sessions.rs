//! Session management routes

use super::{authorize, error_response, AppState};
use crate::session::{Credentials, SessionRecord};
use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use warden_common::{InboundRequest, SessionState};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/v1/sessions", post(create_session))
        .route(
            "/api/v1/sessions/{session_id}",
            get(validate_session).delete(invalidate_session),
        )
        .route(
            "/api/v1/users/{user_id}/sessions",
            get(list_sessions).delete(invalidate_user_sessions),
        )
        .route(
            "/api/v1/devices/{fingerprint}/sessions",
            get(list_device_sessions),
        )
}

/// Session as exposed over HTTP; the integrity hash stays internal
#[derive(Debug, Serialize)]
struct SessionView {
    session_id: String,
    user_id: String,
    device_fingerprint: String,
    ip_address: String,
    auth_method: String,
    state: SessionState,
    created_at: DateTime<Utc>,
    last_activity_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl From<SessionRecord> for SessionView {
    fn from(record: SessionRecord) -> Self {
        Self {
            state: record.state(),
            session_id: record.session_id,
            user_id: record.user_id,
            device_fingerprint: record.device_fingerprint,
            ip_address: record.ip_address,
            auth_method: record.auth_method,
            created_at: record.created_at,
            last_activity_at: record.last_activity_at,
            expires_at: record.expires_at,
        }
    }
}

#[derive(Debug, Deserialize)]
struct CreateSessionRequest {
    user_id: String,
    request: InboundRequest,
    auth_method: String,
}

async fn create_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreateSessionRequest>,
) -> Response {
    if let Err(response) = authorize(&state, &headers) {
        return response;
    }

    let credentials = Credentials {
        auth_method: payload.auth_method,
    };
    match state
        .pipeline
        .issue_session(&payload.user_id, &payload.request, &credentials)
        .await
    {
        Ok(record) => (StatusCode::CREATED, Json(SessionView::from(record))).into_response(),
        Err(e) => error_response(&state, &e),
    }
}

async fn validate_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
) -> Response {
    if let Err(response) = authorize(&state, &headers) {
        return response;
    }

    match state.pipeline.sessions.validate(&session_id).await {
        Ok(record) => Json(SessionView::from(record)).into_response(),
        Err(e) => error_response(&state, &e),
    }
}

async fn invalidate_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
) -> Response {
    if let Err(response) = authorize(&state, &headers) {
        return response;
    }

    match state.pipeline.sessions.invalidate(&session_id).await {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => (StatusCode::NOT_FOUND, "Session not found").into_response(),
        Err(e) => error_response(&state, &e),
    }
}

async fn list_sessions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(user_id): Path<String>,
) -> Response {
    if let Err(response) = authorize(&state, &headers) {
        return response;
    }

    match state.pipeline.sessions.list(&user_id).await {
        Ok(records) => {
            let sessions: Vec<SessionView> = records.into_iter().map(SessionView::from).collect();
            Json(serde_json::json!({ "user_id": user_id, "sessions": sessions })).into_response()
        }
        Err(e) => error_response(&state, &e),
    }
}

/// Live sessions bound to one device fingerprint, across users
async fn list_device_sessions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(fingerprint): Path<String>,
) -> Response {
    if let Err(response) = authorize(&state, &headers) {
        return response;
    }

    match state.pipeline.sessions.sessions_for_device(&fingerprint).await {
        Ok(records) => {
            let sessions: Vec<SessionView> = records.into_iter().map(SessionView::from).collect();
            Json(serde_json::json!({ "device_fingerprint": fingerprint, "sessions": sessions }))
                .into_response()
        }
        Err(e) => error_response(&state, &e),
    }
}

async fn invalidate_user_sessions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(user_id): Path<String>,
) -> Response {
    if let Err(response) = authorize(&state, &headers) {
        return response;
    }

    match state.pipeline.sessions.invalidate_all(&user_id).await {
        Ok(revoked) => Json(serde_json::json!({ "user_id": user_id, "revoked": revoked })).into_response(),
        Err(e) => error_response(&state, &e),
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use crate::store::memory::Fault;
    use axum::http::StatusCode;
    use serde_json::json;
    use tower::ServiceExt;

    fn create_body(user_id: &str) -> serde_json::Value {
        json!({
            "user_id": user_id,
            "request": browser_request("192.0.2.40", "/auth/login"),
            "auth_method": "oauth",
        })
    }

    #[tokio::test]
    async fn test_session_lifecycle() {
        let (_, app) = app().await;

        let response = app
            .clone()
            .oneshot(json_request("POST", "/api/v1/sessions", create_body("alice")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let created = body_json(response).await;
        assert_eq!(created["state"], "created");
        assert!(created.get("integrity_hash").is_none());
        let id = created["session_id"].as_str().unwrap().to_string();

        let response = app
            .clone()
            .oneshot(empty_request("GET", &format!("/api/v1/sessions/{}", id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .clone()
            .oneshot(empty_request("GET", "/api/v1/users/alice/sessions"))
            .await
            .unwrap();
        assert_eq!(body_json(response).await["sessions"].as_array().unwrap().len(), 1);

        let fingerprint = created["device_fingerprint"].as_str().unwrap().to_string();
        let response = app
            .clone()
            .oneshot(empty_request(
                "GET",
                &format!("/api/v1/devices/{}/sessions", fingerprint),
            ))
            .await
            .unwrap();
        assert_eq!(body_json(response).await["sessions"][0]["user_id"], "alice");

        let response = app
            .clone()
            .oneshot(empty_request("DELETE", &format!("/api/v1/sessions/{}", id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = app
            .oneshot(empty_request("GET", &format!("/api/v1/sessions/{}", id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_json(response).await["reason"], "session_expired");
    }

    #[tokio::test]
    async fn test_revoke_all_for_user() {
        let (_, app) = app().await;
        for _ in 0..2 {
            app.clone()
                .oneshot(json_request("POST", "/api/v1/sessions", create_body("bob")))
                .await
                .unwrap();
        }

        let response = app
            .oneshot(empty_request("DELETE", "/api/v1/users/bob/sessions"))
            .await
            .unwrap();
        assert_eq!(body_json(response).await["revoked"], 2);
    }

    #[tokio::test]
    async fn test_locked_account_gets_no_session() {
        let (_, app) = app().await;
        for _ in 0..5 {
            app.clone()
                .oneshot(json_request(
                    "POST",
                    "/api/v1/login",
                    json!({
                        "request": browser_request("192.0.2.41", "/auth/login"),
                        "account": "alice",
                        "credentials_valid": false,
                    }),
                ))
                .await
                .unwrap();
        }

        let response = app
            .clone()
            .oneshot(json_request("POST", "/api/v1/sessions", create_body("alice")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::LOCKED);
        assert!(response.headers().contains_key("retry-after"));
        assert_eq!(body_json(response).await["reason"], "account_locked");

        let response = app
            .oneshot(empty_request("GET", "/api/v1/users/alice/sessions"))
            .await
            .unwrap();
        assert!(body_json(response).await["sessions"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_store_failure_hides_cause() {
        let (store, app) = app().await;
        store.inject_fault(Fault::Unavailable);

        let response = app
            .oneshot(json_request("POST", "/api/v1/sessions", create_body("carol")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(response.headers().contains_key("retry-after"));
        let body = body_json(response).await;
        assert_eq!(body["error"], "Service temporarily unavailable");
        assert_eq!(body["reason"], "service_degraded");
    }
}
