use serde::Deserialize;

use rollcall_auth::NewUser;

// -------------------------
// Request DTOs
// -------------------------

/// Body of `POST /user/`, `POST /user/schedule` and `POST /user/oauth2`.
#[derive(Debug, Deserialize)]
pub struct CredentialsRequest {
    pub username: String,
    pub password: String,
}

impl From<CredentialsRequest> for NewUser {
    fn from(req: CredentialsRequest) -> Self {
        NewUser::new(req.username, req.password)
    }
}

#[derive(Debug, Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}
