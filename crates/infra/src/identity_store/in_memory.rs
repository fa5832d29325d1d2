use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use rollcall_auth::User;
use rollcall_core::UserId;

use super::{StoreError, UserStore};

#[derive(Debug, Default)]
struct Records {
    by_id: HashMap<UserId, User>,
    by_username: HashMap<String, UserId>,
}

/// In-memory identity store for tests/dev.
///
/// The username index is checked and updated under the same write lock, so
/// concurrent creates of one username yield exactly one record.
#[derive(Debug, Default)]
pub struct InMemoryUserStore {
    records: RwLock<Records>,
}

impl InMemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().map(|r| r.by_id.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl UserStore for InMemoryUserStore {
    async fn retrieve_by_username(&self, username: &str) -> Result<Option<User>, StoreError> {
        let records = self.records.read().map_err(|_| StoreError::Poisoned)?;
        Ok(records
            .by_username
            .get(username)
            .and_then(|id| records.by_id.get(id))
            .cloned())
    }

    async fn retrieve_one(&self, id: UserId) -> Result<Option<User>, StoreError> {
        let records = self.records.read().map_err(|_| StoreError::Poisoned)?;
        Ok(records.by_id.get(&id).cloned())
    }

    async fn create(&self, user: User) -> Result<User, StoreError> {
        let mut records = self.records.write().map_err(|_| StoreError::Poisoned)?;
        if records.by_username.contains_key(&user.username) {
            return Err(StoreError::Conflict(user.username));
        }

        records.by_username.insert(user.username.clone(), user.id);
        records.by_id.insert(user.id, user.clone());
        Ok(user)
    }

    async fn retrieve_all(&self) -> Result<Vec<User>, StoreError> {
        let records = self.records.read().map_err(|_| StoreError::Poisoned)?;
        let mut users: Vec<User> = records.by_id.values().cloned().collect();
        users.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(users)
    }
}
