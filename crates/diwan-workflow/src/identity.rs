//! Identity and role lookup seam

use crate::approval::Actor;
use async_trait::async_trait;
use diwan_core::{RoleRef, UserId};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("User not found: {0}")]
    UserNotFound(UserId),

    #[error("Identity backend error: {0}")]
    Backend(String),
}

/// Role memberships and the admin flag, owned outside this crate
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Resolve a user into an actor with roles and admin flag
    async fn resolve_actor(&self, user_id: &UserId) -> Result<Actor, IdentityError>;

    /// Current holders of `role`, in a stable order
    async fn role_holders(&self, role: &RoleRef) -> Result<Vec<UserId>, IdentityError>;
}

/// In-memory directory, for tests and fixtures
#[derive(Debug, Default)]
pub struct StaticDirectory {
    roles: RwLock<HashMap<UserId, HashSet<RoleRef>>>,
    admins: RwLock<HashSet<UserId>>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant(&self, user_id: UserId, role: impl Into<RoleRef>) {
        self.roles.write().entry(user_id).or_default().insert(role.into());
    }

    pub fn revoke(&self, user_id: &UserId, role: &RoleRef) {
        if let Some(roles) = self.roles.write().get_mut(user_id) {
            roles.remove(role);
        }
    }

    pub fn make_admin(&self, user_id: UserId) {
        self.admins.write().insert(user_id);
    }
}

#[async_trait]
impl IdentityProvider for StaticDirectory {
    async fn resolve_actor(&self, user_id: &UserId) -> Result<Actor, IdentityError> {
        let roles = self.roles.read().get(user_id).cloned().unwrap_or_default();
        let actor = Actor::new(*user_id).with_roles(roles);
        Ok(if self.admins.read().contains(user_id) {
            actor.admin()
        } else {
            actor
        })
    }

    async fn role_holders(&self, role: &RoleRef) -> Result<Vec<UserId>, IdentityError> {
        let mut holders: Vec<UserId> = self
            .roles
            .read()
            .iter()
            .filter(|(_, roles)| roles.contains(role))
            .map(|(user, _)| *user)
            .collect();
        holders.sort();
        Ok(holders)
    }
}
