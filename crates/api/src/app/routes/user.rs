use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Extension},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;

use rollcall_auth::UserProfile;

use crate::app::services::AppServices;
use crate::app::{dto, errors};
use crate::context::CurrentUser;
use crate::middleware;

/// `/user` endpoints. `GET` routes require an `access-token` header; the
/// rest are public.
///
/// Both `/user` and `/user/` are accepted for the collection root.
pub fn router(services: Arc<AppServices>) -> Router {
    let auth = axum::middleware::from_fn_with_state(services, middleware::current_user);

    Router::new()
        .route("/user", get(me).route_layer(auth.clone()).post(create_user))
        .route("/user/", get(me).route_layer(auth.clone()).post(create_user))
        .route("/user/all", get(list_users).route_layer(auth))
        .route("/user/schedule", post(schedule_user))
        .route("/user/oauth2", post(oauth2))
        .route("/user/oauth2/refresh", post(refresh))
}

pub async fn create_user(
    Extension(services): Extension<Arc<AppServices>>,
    payload: Result<Json<dto::CredentialsRequest>, JsonRejection>,
) -> axum::response::Response {
    let Json(body) = match payload {
        Ok(body) => body,
        Err(rejection) => return errors::json_rejection_to_response(rejection),
    };
    match services.users.create_later(body.into(), None).await {
        Ok(task_id) => {
            tracing::debug!(%task_id, "user creation enqueued");
            StatusCode::CREATED.into_response()
        }
        Err(e) => errors::user_error_to_response(e),
    }
}

pub async fn schedule_user(
    Extension(services): Extension<Arc<AppServices>>,
    payload: Result<Json<dto::CredentialsRequest>, JsonRejection>,
) -> axum::response::Response {
    let Json(body) = match payload {
        Ok(body) => body,
        Err(rejection) => return errors::json_rejection_to_response(rejection),
    };
    let when = Utc::now() + services.schedule_delay();
    match services.users.create_later(body.into(), Some(when)).await {
        Ok(task_id) => {
            tracing::debug!(%task_id, %when, "user creation scheduled");
            StatusCode::CREATED.into_response()
        }
        Err(e) => errors::user_error_to_response(e),
    }
}

pub async fn oauth2(
    Extension(services): Extension<Arc<AppServices>>,
    payload: Result<Json<dto::CredentialsRequest>, JsonRejection>,
) -> axum::response::Response {
    let Json(body) = match payload {
        Ok(body) => body,
        Err(rejection) => return errors::json_rejection_to_response(rejection),
    };
    match services.users.authenticate(&body.username, &body.password).await {
        Ok(auth) => Json(auth).into_response(),
        Err(e) => errors::user_error_to_response(e),
    }
}

pub async fn refresh(
    Extension(services): Extension<Arc<AppServices>>,
    payload: Result<Json<dto::RefreshRequest>, JsonRejection>,
) -> axum::response::Response {
    let Json(body) = match payload {
        Ok(body) => body,
        Err(rejection) => return errors::json_rejection_to_response(rejection),
    };
    match services.users.refresh(&body.refresh_token).await {
        Ok(auth) => Json(auth).into_response(),
        Err(e) => errors::user_error_to_response(e),
    }
}

pub async fn me(Extension(current): Extension<CurrentUser>) -> Json<UserProfile> {
    Json(current.user().profile())
}

pub async fn list_users(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    match services.users.retrieve_all().await {
        Ok(users) => {
            let profiles: Vec<UserProfile> = users.iter().map(|u| u.profile()).collect();
            Json(profiles).into_response()
        }
        Err(e) => errors::user_error_to_response(e),
    }
}
