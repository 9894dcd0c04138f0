use crate::state::AppState;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use notify_core::{AdmissionError, Decision, InputError, RateLimitRule, RuleUsage};
use serde::Serialize;
use tracing::{error, info};

#[derive(Debug, Serialize)]
pub struct StatusBody {
    pub status: &'static str,
    pub message: String,
}

impl StatusBody {
    fn success(message: impl Into<String>) -> Json<Self> {
        Json(Self {
            status: "success",
            message: message.into(),
        })
    }
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub message: String,
    pub error: String,
    pub status: u16,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error: error.into(),
            status: status.as_u16(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self)).into_response()
    }
}

impl From<AdmissionError> for ApiError {
    fn from(err: AdmissionError) -> Self {
        match &err {
            AdmissionError::InvalidInput(InputError::EmptyIdentity) => ApiError::new(
                StatusCode::BAD_REQUEST,
                "userID is mandatory",
                "invalid_user_id",
            ),
            AdmissionError::InvalidInput(InputError::EmptyEventType) => ApiError::new(
                StatusCode::BAD_REQUEST,
                "notification type is mandatory",
                "invalid_type",
            ),
            AdmissionError::RuleLookup(_) => ApiError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "error getting rate limit rule",
                err.to_string(),
            ),
            AdmissionError::Backend(_) => ApiError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal server error",
                err.to_string(),
            ),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ping", get(ping))
        .route("/rules", get(list_rules))
        .route("/rules/:type", get(rule_by_type))
        .route("/notifications/users/:user_id", get(usage_by_user))
        .route("/notifications/:type/users/:user_id", post(send_notification))
        .with_state(state)
}

async fn ping() -> Json<StatusBody> {
    StatusBody::success("pong")
}

async fn list_rules(State(state): State<AppState>) -> Json<Vec<RateLimitRule>> {
    Json(state.admission.rules())
}

async fn rule_by_type(
    State(state): State<AppState>,
    Path(event_type): Path<String>,
) -> Result<Json<RateLimitRule>, ApiError> {
    match state.admission.rule_for(&event_type).await? {
        Some(rule) => Ok(Json(rule)),
        None => Err(ApiError::new(
            StatusCode::NOT_FOUND,
            "notification type not found",
            "rule_not_found",
        )),
    }
}

async fn usage_by_user(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<Vec<RuleUsage>>, ApiError> {
    Ok(Json(state.admission.usage(&user_id).await?))
}

async fn send_notification(
    State(state): State<AppState>,
    Path((event_type, user_id)): Path<(String, String)>,
) -> Result<Json<StatusBody>, ApiError> {
    match state.admission.decide(&user_id, &event_type).await? {
        Decision::Allowed => {}
        Decision::Denied { rule } => {
            info!(identity = %user_id, event_type = %rule.event_type, "notification throttled");
            return Err(ApiError::new(
                StatusCode::TOO_MANY_REQUESTS,
                format!(
                    "message limit exceeded: {} per {}",
                    rule.max_count,
                    notify_core::format_duration(rule.window)
                ),
                "rate_limit_exceeded",
            ));
        }
    }
    // The admission is already recorded; a failed delivery still used quota.
    if let Err(err) = state.notifier.send(&user_id, &event_type).await {
        error!(identity = %user_id, event_type = %event_type, %err, "delivery failed");
        return Err(ApiError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "notification delivery failed",
            err.to_string(),
        ));
    }
    Ok(StatusBody::success("notification sent"))
}
