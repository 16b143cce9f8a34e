//! Role directory backed by the `user_roles` table

use crate::Result;
use async_trait::async_trait;
use diwan_core::{RoleRef, UserId};
use diwan_workflow::{Actor, IdentityError, IdentityProvider};
use sqlx::PgPool;
use uuid::Uuid;

/// Reads role memberships from PostgreSQL. Holding `admin_role` makes an
/// actor an administrator.
#[derive(Clone)]
pub struct PgDirectory {
    pool: PgPool,
    admin_role: RoleRef,
}

impl PgDirectory {
    pub fn new(pool: PgPool, admin_role: impl Into<RoleRef>) -> Self {
        Self {
            pool,
            admin_role: admin_role.into(),
        }
    }

    pub async fn grant(&self, user_id: &UserId, role: &RoleRef) -> Result<()> {
        sqlx::query("INSERT INTO user_roles (user_id, role) VALUES ($1, $2) ON CONFLICT DO NOTHING")
            .bind(*user_id.as_uuid())
            .bind(role.as_str())
            .execute(&self.pool)
            .await?;
        tracing::info!(user_id = %user_id, role = %role, "Role granted");
        Ok(())
    }

    pub async fn revoke(&self, user_id: &UserId, role: &RoleRef) -> Result<bool> {
        let result = sqlx::query("DELETE FROM user_roles WHERE user_id = $1 AND role = $2")
            .bind(*user_id.as_uuid())
            .bind(role.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn roles_of(&self, user_id: &UserId) -> Result<Vec<RoleRef>> {
        let roles: Vec<String> =
            sqlx::query_scalar("SELECT role FROM user_roles WHERE user_id = $1 ORDER BY role")
                .bind(*user_id.as_uuid())
                .fetch_all(&self.pool)
                .await?;
        Ok(roles.into_iter().map(RoleRef::new).collect())
    }

    async fn holders_of(&self, role: &RoleRef) -> Result<Vec<UserId>> {
        let holders: Vec<Uuid> =
            sqlx::query_scalar("SELECT user_id FROM user_roles WHERE role = $1 ORDER BY user_id")
                .bind(role.as_str())
                .fetch_all(&self.pool)
                .await?;
        Ok(holders.into_iter().map(UserId::from_uuid).collect())
    }
}

#[async_trait]
impl IdentityProvider for PgDirectory {
    async fn resolve_actor(&self, user_id: &UserId) -> std::result::Result<Actor, IdentityError> {
        let roles = self.roles_of(user_id).await?;
        let is_admin = roles.contains(&self.admin_role);
        let actor = Actor::new(*user_id).with_roles(roles);
        Ok(if is_admin { actor.admin() } else { actor })
    }

    async fn role_holders(&self, role: &RoleRef) -> std::result::Result<Vec<UserId>, IdentityError> {
        Ok(self.holders_of(role).await?)
    }
}
