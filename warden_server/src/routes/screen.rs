//! Screening and login routes

use super::{authorize, error_response, AppState};
use crate::pipeline::LoginOutcome;
use crate::session::Credentials;
use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use serde::Deserialize;
use warden_common::InboundRequest;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/v1/screen", post(screen))
        .route("/api/v1/login", post(login))
}

/// Run the full pipeline over one inbound request. The verdict is the
/// payload; the HTTP status of this call is 200 whenever a verdict exists.
async fn screen(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<InboundRequest>,
) -> Response {
    if let Err(response) = authorize(&state, &headers) {
        return response;
    }

    Json(state.pipeline.screen(&request).await).into_response()
}

#[derive(Debug, Deserialize)]
struct LoginRequest {
    request: InboundRequest,
    account: String,
    /// Outcome of credential verification done by the caller
    credentials_valid: bool,
    #[serde(default = "default_auth_method")]
    auth_method: String,
}

fn default_auth_method() -> String {
    "password".to_string()
}

/// Record a login attempt and issue a session on success
async fn login(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<LoginRequest>,
) -> Response {
    if let Err(response) = authorize(&state, &headers) {
        return response;
    }

    let credentials = Credentials {
        auth_method: payload.auth_method,
    };
    let valid = payload.credentials_valid;
    let result = state
        .pipeline
        .login(&payload.request, &payload.account, &credentials, move || async move { valid })
        .await;

    match result {
        Ok(LoginOutcome::Authenticated {
            session,
            risk_level,
        }) => Json(serde_json::json!({
            "status": "authenticated",
            "session_id": session.session_id,
            "expires_at": session.expires_at,
            "risk_level": risk_level,
        }))
        .into_response(),
        Ok(LoginOutcome::Rejected { assessment }) => (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({
                "status": "rejected",
                "risk_level": assessment.risk_level,
                "locked": !assessment.lockouts.is_empty(),
            })),
        )
            .into_response(),
        Err(e) => error_response(&state, &e),
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use axum::http::StatusCode;
    use serde_json::json;
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_screen_returns_verdict() {
        let (_, app) = app().await;
        let response = app
            .oneshot(json_request(
                "POST",
                "/api/v1/screen",
                browser_request("192.0.2.1", "/products/search"),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let verdict = body_json(response).await;
        assert_eq!(verdict["admit"], true);
        assert_eq!(verdict["http_status"], 200);
    }

    #[tokio::test]
    async fn test_login_flow() {
        let (_, app) = app().await;
        let attempt = |valid: bool| {
            json_request(
                "POST",
                "/api/v1/login",
                json!({
                    "request": browser_request("192.0.2.2", "/auth/login"),
                    "account": "alice",
                    "credentials_valid": valid,
                }),
            )
        };

        let response = app.clone().oneshot(attempt(false)).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_json(response).await["status"], "rejected");

        let response = app.oneshot(attempt(true)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "authenticated");
        assert!(body["session_id"].as_str().unwrap().len() >= 43);
    }
}
