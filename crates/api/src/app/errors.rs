use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use rollcall_infra::UserError;

pub fn user_error_to_response(err: UserError) -> axum::response::Response {
    match err {
        UserError::Validation(msg) => json_error(StatusCode::BAD_REQUEST, "validation_error", msg),
        UserError::AlreadyExists(name) => json_error(
            StatusCode::CONFLICT,
            "already_exists",
            format!("username already exists: {name}"),
        ),
        UserError::NotFound => json_error(StatusCode::NOT_FOUND, "not_found", "user not found"),
        UserError::InvalidCredentials => {
            json_error(StatusCode::UNAUTHORIZED, "invalid_credentials", "invalid credentials")
        }
        UserError::InvalidToken(e) => json_error(StatusCode::UNAUTHORIZED, "invalid_token", e.to_string()),
        UserError::Credential(e) => {
            tracing::error!(error = %e, "credential failure");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "credential_error", "credential failure")
        }
        UserError::Store(e) => {
            tracing::error!(error = %e, "identity store failure");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", e.to_string())
        }
        UserError::Dispatch(e) => json_error(StatusCode::BAD_GATEWAY, "publish_error", e.to_string()),
    }
}

/// Malformed or incomplete request bodies get the same `{error,message}` shape.
pub fn json_rejection_to_response(rejection: JsonRejection) -> axum::response::Response {
    json_error(rejection.status(), "invalid_body", rejection.body_text())
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
