use anyhow::Context;
use async_trait::async_trait;
use sqlx::PgPool;
use thiserror::Error;
use uuid::Uuid;

use super::password::PasswordHash;
use super::repo_types::{MediaSlot, NewUser, User, UserRow};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("username or email already taken")]
    Duplicate,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Persistence for user records. Callers pass usernames and emails already
/// normalized.
#[async_trait]
pub trait UserStore: Send + Sync {
    async fn find_by_id(&self, id: Uuid) -> anyhow::Result<Option<User>>;

    /// First user whose username or email matches one of the given values.
    async fn find_by_login(
        &self,
        username: Option<&str>,
        email: Option<&str>,
    ) -> anyhow::Result<Option<User>>;

    async fn create(&self, new: NewUser) -> Result<User, StoreError>;

    /// Overwrites the stored refresh token. Returns `false` if the user is gone.
    async fn set_refresh_token(&self, id: Uuid, token: Option<&str>) -> anyhow::Result<bool>;

    /// Replaces the refresh token only if the stored one still equals `expected`.
    async fn rotate_refresh_token(
        &self,
        id: Uuid,
        expected: &str,
        next: &str,
    ) -> anyhow::Result<bool>;

    /// The only write that touches the password column.
    async fn set_password_hash(&self, id: Uuid, hash: &PasswordHash) -> anyhow::Result<bool>;

    async fn update_profile(
        &self,
        id: Uuid,
        full_name: &str,
        email: &str,
    ) -> Result<Option<User>, StoreError>;

    async fn set_media(&self, id: Uuid, slot: MediaSlot, url: &str)
        -> anyhow::Result<Option<User>>;
}

const USER_COLUMNS: &str = "id, username, email, full_name, avatar_url, cover_image_url, \
     password_hash, refresh_token, watch_history, created_at, updated_at";

#[derive(Clone)]
pub struct PgUserStore {
    db: PgPool,
}

impl PgUserStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

fn map_unique(e: sqlx::Error) -> StoreError {
    match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() => StoreError::Duplicate,
        _ => StoreError::Other(anyhow::Error::new(e)),
    }
}

#[async_trait]
impl UserStore for PgUserStore {
    async fn find_by_id(&self, id: Uuid) -> anyhow::Result<Option<User>> {
        let row = sqlx::query_as::<_, UserRow>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.db)
        .await
        .context("find user by id")?;
        Ok(row.map(User::from))
    }

    async fn find_by_login(
        &self,
        username: Option<&str>,
        email: Option<&str>,
    ) -> anyhow::Result<Option<User>> {
        let row = sqlx::query_as::<_, UserRow>(&format!(
            r#"
            SELECT {USER_COLUMNS}
            FROM users
            WHERE username = $1 OR email = $2
            ORDER BY created_at ASC
            LIMIT 1
            "#
        ))
        .bind(username)
        .bind(email)
        .fetch_optional(&self.db)
        .await
        .context("find user by login")?;
        Ok(row.map(User::from))
    }

    async fn create(&self, new: NewUser) -> Result<User, StoreError> {
        let row = sqlx::query_as::<_, UserRow>(&format!(
            r#"
            INSERT INTO users (id, username, email, full_name, avatar_url, cover_image_url, password_hash)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING {USER_COLUMNS}
            "#
        ))
        .bind(new.id)
        .bind(&new.username)
        .bind(&new.email)
        .bind(&new.full_name)
        .bind(&new.avatar_url)
        .bind(&new.cover_image_url)
        .bind(new.password_hash.as_str())
        .fetch_one(&self.db)
        .await
        .map_err(map_unique)?;
        Ok(row.into())
    }

    async fn set_refresh_token(&self, id: Uuid, token: Option<&str>) -> anyhow::Result<bool> {
        let res = sqlx::query(
            "UPDATE users SET refresh_token = $2, updated_at = now() WHERE id = $1",
        )
        .bind(id)
        .bind(token)
        .execute(&self.db)
        .await
        .context("set refresh token")?;
        Ok(res.rows_affected() == 1)
    }

    async fn rotate_refresh_token(
        &self,
        id: Uuid,
        expected: &str,
        next: &str,
    ) -> anyhow::Result<bool> {
        let res = sqlx::query(
            r#"
            UPDATE users SET refresh_token = $3, updated_at = now()
            WHERE id = $1 AND refresh_token = $2
            "#,
        )
        .bind(id)
        .bind(expected)
        .bind(next)
        .execute(&self.db)
        .await
        .context("rotate refresh token")?;
        Ok(res.rows_affected() == 1)
    }

    async fn set_password_hash(&self, id: Uuid, hash: &PasswordHash) -> anyhow::Result<bool> {
        let res = sqlx::query(
            "UPDATE users SET password_hash = $2, updated_at = now() WHERE id = $1",
        )
        .bind(id)
        .bind(hash.as_str())
        .execute(&self.db)
        .await
        .context("set password hash")?;
        Ok(res.rows_affected() == 1)
    }

    async fn update_profile(
        &self,
        id: Uuid,
        full_name: &str,
        email: &str,
    ) -> Result<Option<User>, StoreError> {
        let row = sqlx::query_as::<_, UserRow>(&format!(
            r#"
            UPDATE users SET full_name = $2, email = $3, updated_at = now()
            WHERE id = $1
            RETURNING {USER_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(full_name)
        .bind(email)
        .fetch_optional(&self.db)
        .await
        .map_err(map_unique)?;
        Ok(row.map(User::from))
    }

    async fn set_media(
        &self,
        id: Uuid,
        slot: MediaSlot,
        url: &str,
    ) -> anyhow::Result<Option<User>> {
        let column = match slot {
            MediaSlot::Avatar => "avatar_url",
            MediaSlot::CoverImage => "cover_image_url",
        };
        let row = sqlx::query_as::<_, UserRow>(&format!(
            "UPDATE users SET {column} = $2, updated_at = now() WHERE id = $1 RETURNING {USER_COLUMNS}"
        ))
        .bind(id)
        .bind(url)
        .fetch_optional(&self.db)
        .await
        .with_context(|| format!("set {column}"))?;
        Ok(row.map(User::from))
    }
}

#[cfg(test)]
pub(crate) use memory::MemoryUserStore;
