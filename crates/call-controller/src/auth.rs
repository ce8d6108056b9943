//! Hunt membership seam.
//!
//! The platform's identity service decides who may take part in a hunt's
//! calls; the controller only asks.

use crate::errors::CallError;
use async_trait::async_trait;
use common::types::{HuntId, UserId};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

/// Answers whether a user belongs to a hunt.
#[async_trait]
pub trait Authorizer: Send + Sync {
    /// # Errors
    ///
    /// Returns an error when membership cannot be determined.
    async fn is_member(&self, user: &UserId, hunt: &HuntId) -> Result<bool, CallError>;
}

/// Everyone is a member of every hunt. Development mode only.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

#[async_trait]
impl Authorizer for AllowAll {
    async fn is_member(&self, _user: &UserId, _hunt: &HuntId) -> Result<bool, CallError> {
        Ok(true)
    }
}

/// Fixed membership table.
#[derive(Debug, Clone, Default)]
pub struct StaticMembership {
    members: Arc<RwLock<HashMap<HuntId, HashSet<UserId>>>>,
}

impl StaticMembership {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `user` to `hunt`.
    pub fn grant(&self, hunt: &HuntId, user: &UserId) {
        if let Ok(mut members) = self.members.write() {
            members.entry(hunt.clone()).or_default().insert(user.clone());
        }
    }

    /// Remove `user` from `hunt`.
    pub fn revoke(&self, hunt: &HuntId, user: &UserId) {
        if let Ok(mut members) = self.members.write() {
            if let Some(users) = members.get_mut(hunt) {
                users.remove(user);
            }
        }
    }
}

#[async_trait]
impl Authorizer for StaticMembership {
    async fn is_member(&self, user: &UserId, hunt: &HuntId) -> Result<bool, CallError> {
        let members = self
            .members
            .read()
            .map_err(|_| CallError::Internal("membership table poisoned".to_string()))?;
        Ok(members.get(hunt).is_some_and(|users| users.contains(user)))
    }
}
