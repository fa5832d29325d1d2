use rollcall_auth::User;

/// Identity resolved from the `access-token` header.
///
/// Inserted by [`crate::middleware::current_user`]; present on every
/// protected route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentUser {
    user: User,
}

impl CurrentUser {
    pub fn new(user: User) -> Self {
        Self { user }
    }

    pub fn user(&self) -> &User {
        &self.user
    }

    pub fn into_user(self) -> User {
        self.user
    }
}
