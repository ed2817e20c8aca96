//! In-memory user directory.
//!
//! Populated from user lifecycle events so connections can carry a public
//! user projection without a database round-trip.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::domain::{PublicUser, UserLookup};
use crate::shared::error::AppError;

#[derive(Debug, Default, Clone)]
pub struct InMemoryUserDirectory {
    users: Arc<DashMap<i64, PublicUser>>,
}

impl InMemoryUserDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a user projection
    pub fn upsert(&self, user: PublicUser) {
        self.users.insert(user.id, user);
    }

    pub fn remove(&self, id: i64) -> Option<PublicUser> {
        self.users.remove(&id).map(|(_, user)| user)
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

#[async_trait]
impl UserLookup for InMemoryUserDirectory {
    async fn find_by_id(&self, id: i64) -> Result<Option<PublicUser>, AppError> {
        Ok(self.users.get(&id).map(|entry| entry.value().clone()))
    }
}
