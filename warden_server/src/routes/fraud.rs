//! Lockout and alert lookups
//!
//! Subjects are addressed as `account:<id>` or `ip:<addr>`.

use super::{authorize, error_response, AppState};
use crate::fraud::{LockoutStatus, Subject};
use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/v1/lockouts/{subject}", get(get_lockout))
        .route("/api/v1/alerts/{subject}", get(get_alerts))
}

fn parse_subject(raw: &str) -> Result<Subject, Response> {
    Subject::parse(raw).ok_or_else(|| {
        (
            StatusCode::BAD_REQUEST,
            "Subject must be account:<id> or ip:<addr>",
        )
            .into_response()
    })
}

async fn get_lockout(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(subject): Path<String>,
) -> Response {
    if let Err(response) = authorize(&state, &headers) {
        return response;
    }
    let subject = match parse_subject(&subject) {
        Ok(s) => s,
        Err(response) => return response,
    };

    let status = state.pipeline.fraud.subject_lockout(&subject).await;

    match status {
        LockoutStatus::Clear => Json(serde_json::json!({
            "subject": subject.to_string(),
            "locked": false,
        }))
        .into_response(),
        LockoutStatus::Locked(record) => Json(serde_json::json!({
            "subject": subject.to_string(),
            "locked": true,
            "retry_after": record.retry_after(state.clock.now()),
            "lockout": record,
        }))
        .into_response(),
        LockoutStatus::Unavailable(_) => (
            StatusCode::SERVICE_UNAVAILABLE,
            "Service temporarily unavailable",
        )
            .into_response(),
    }
}

async fn get_alerts(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(subject): Path<String>,
) -> Response {
    if let Err(response) = authorize(&state, &headers) {
        return response;
    }
    let subject = match parse_subject(&subject) {
        Ok(s) => s,
        Err(response) => return response,
    };

    match state.pipeline.fraud.recent_alerts(&subject).await {
        Ok(alerts) => Json(serde_json::json!({
            "subject": subject.to_string(),
            "alerts": alerts,
        }))
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
    async fn test_lockout_and_alerts_visible() {
        let (_, app) = app().await;
        for _ in 0..5 {
            let response = app
                .clone()
                .oneshot(json_request(
                    "POST",
                    "/api/v1/login",
                    json!({
                        "request": browser_request("192.0.2.7", "/auth/login"),
                        "account": "alice",
                        "credentials_valid": false,
                    }),
                ))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        }

        let response = app
            .clone()
            .oneshot(empty_request("GET", "/api/v1/lockouts/account:alice"))
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["locked"], true);
        assert_eq!(body["lockout"]["risk_level"], "critical");
        assert!(body["retry_after"].as_u64().unwrap() > 0);

        let response = app
            .clone()
            .oneshot(empty_request("GET", "/api/v1/alerts/account:alice"))
            .await
            .unwrap();
        let body = body_json(response).await;
        assert!(!body["alerts"].as_array().unwrap().is_empty());

        let response = app
            .oneshot(empty_request("GET", "/api/v1/lockouts/device:abc"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
