use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, Request, StatusCode},
    middleware::Next,
    response::Response,
};

use crate::app::errors::json_error;
use crate::app::services::AppServices;
use crate::context::CurrentUser;

/// Header carrying the raw access token (no `Bearer` prefix).
pub const ACCESS_TOKEN_HEADER: &str = "access-token";

/// Resolve the caller from `access-token`, or reject with 401.
pub async fn current_user(
    State(services): State<Arc<AppServices>>,
    mut req: Request<Body>,
    next: Next,
) -> Result<Response, Response> {
    let token = extract_token(req.headers()).ok_or_else(unauthorized)?;

    let user = services
        .users
        .retrieve_by_token(token)
        .await
        .ok_or_else(unauthorized)?;

    req.extensions_mut().insert(CurrentUser::new(user));

    Ok(next.run(req).await)
}

fn extract_token(headers: &HeaderMap) -> Option<&str> {
    let token = headers.get(ACCESS_TOKEN_HEADER)?.to_str().ok()?.trim();
    if token.is_empty() {
        return None;
    }
    Some(token)
}

fn unauthorized() -> Response {
    json_error(StatusCode::UNAUTHORIZED, "unauthorized", "missing or invalid access token")
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn extracts_trimmed_token() {
        let mut headers = HeaderMap::new();
        headers.insert(ACCESS_TOKEN_HEADER, HeaderValue::from_static(" abc.def.ghi "));
        assert_eq!(extract_token(&headers), Some("abc.def.ghi"));
    }

    #[test]
    fn missing_or_blank_header_is_rejected() {
        let mut headers = HeaderMap::new();
        assert_eq!(extract_token(&headers), None);

        headers.insert(ACCESS_TOKEN_HEADER, HeaderValue::from_static("   "));
        assert_eq!(extract_token(&headers), None);
    }
}
