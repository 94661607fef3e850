use anyhow::anyhow;
use async_trait::async_trait;
use sqlx::PgPool;
use thiserror::Error;
use uuid::Uuid;

use super::{
    model::{Role, User},
    repo_types::UserRow,
};
use crate::error::ServiceError;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Unique constraint violation, e.g. an email already used by a live user.
    #[error("{0}")]
    Conflict(String),

    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

impl From<StoreError> for ServiceError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Conflict(msg) => ServiceError::Conflict(msg),
            StoreError::Backend(err) => ServiceError::Upstream(err),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    /// A row with this id already exists (live or soft-deleted).
    AlreadyExists,
}

/// Durable storage for user profiles. Reads exclude soft-deleted rows.
#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn create(&self, user: &User) -> StoreResult<CreateOutcome>;

    /// Persists every mutable profile field. `Ok(false)` when no live row matched.
    async fn update(&self, user: &User) -> StoreResult<bool>;

    /// Marks the user deleted and returns the row as it was deleted.
    async fn soft_delete(&self, id: Uuid) -> StoreResult<Option<User>>;

    async fn get_by_id(&self, id: Uuid) -> StoreResult<Option<User>>;

    async fn get_by_email(&self, email: &str) -> StoreResult<Option<User>>;

    async fn list_all(&self) -> StoreResult<Vec<User>>;

    async fn set_role(&self, id: Uuid, role: Role) -> StoreResult<bool>;

    async fn set_active(&self, id: Uuid, active: bool) -> StoreResult<bool>;
}

const USER_COLUMNS: &str = "id, email, firstname, lastname, about, date_of_birth, gender, location, \
     socials, avatar_url, needs_completion, role, active, created_at, updated_at, deleted_at";

#[derive(Clone)]
pub struct PgUserRepository {
    db: PgPool,
}

impl PgUserRepository {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

fn db_error(e: sqlx::Error, what: &'static str) -> StoreError {
    if let sqlx::Error::Database(db) = &e {
        if db.is_unique_violation() {
            return StoreError::Conflict("email already in use".into());
        }
    }
    StoreError::Backend(anyhow!(e).context(what))
}

#[async_trait]
impl UserRepository for PgUserRepository {
    async fn create(&self, user: &User) -> StoreResult<CreateOutcome> {
        let res = sqlx::query(
            r#"
            INSERT INTO users (id, email, firstname, lastname, needs_completion, role, active,
                               created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(user.id)
        .bind(&user.email)
        .bind(&user.firstname)
        .bind(&user.lastname)
        .bind(user.needs_completion)
        .bind(user.role.as_str())
        .bind(user.active)
        .bind(user.created_at)
        .bind(user.updated_at)
        .execute(&self.db)
        .await
        .map_err(|e| db_error(e, "insert user"))?;

        Ok(if res.rows_affected() == 0 {
            CreateOutcome::AlreadyExists
        } else {
            CreateOutcome::Created
        })
    }

    async fn update(&self, user: &User) -> StoreResult<bool> {
        let res = sqlx::query(
            r#"
            UPDATE users
               SET firstname = $2, lastname = $3, about = $4, date_of_birth = $5,
                   gender = $6, location = $7, socials = $8, avatar_url = $9,
                   needs_completion = $10, updated_at = $11
             WHERE id = $1 AND deleted_at IS NULL
            "#,
        )
        .bind(user.id)
        .bind(&user.firstname)
        .bind(&user.lastname)
        .bind(&user.about)
        .bind(user.date_of_birth)
        .bind(user.gender.map(|g| g.as_str()))
        .bind(&user.location)
        .bind(&user.socials)
        .bind(&user.avatar_url)
        .bind(user.needs_completion)
        .bind(user.updated_at)
        .execute(&self.db)
        .await
        .map_err(|e| db_error(e, "update user"))?;
        Ok(res.rows_affected() > 0)
    }

    async fn soft_delete(&self, id: Uuid) -> StoreResult<Option<User>> {
        let sql = format!(
            "UPDATE users SET deleted_at = now(), updated_at = now() \
             WHERE id = $1 AND deleted_at IS NULL RETURNING {USER_COLUMNS}"
        );
        let row = sqlx::query_as::<_, UserRow>(&sql)
            .bind(id)
            .fetch_optional(&self.db)
            .await
            .map_err(|e| db_error(e, "soft delete user"))?;
        row.map(User::try_from).transpose().map_err(StoreError::from)
    }

    async fn get_by_id(&self, id: Uuid) -> StoreResult<Option<User>> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1 AND deleted_at IS NULL");
        let row = sqlx::query_as::<_, UserRow>(&sql)
            .bind(id)
            .fetch_optional(&self.db)
            .await
            .map_err(|e| db_error(e, "select user by id"))?;
        row.map(User::try_from).transpose().map_err(StoreError::from)
    }

    async fn get_by_email(&self, email: &str) -> StoreResult<Option<User>> {
        let sql =
            format!("SELECT {USER_COLUMNS} FROM users WHERE email = $1 AND deleted_at IS NULL");
        let row = sqlx::query_as::<_, UserRow>(&sql)
            .bind(email)
            .fetch_optional(&self.db)
            .await
            .map_err(|e| db_error(e, "select user by email"))?;
        row.map(User::try_from).transpose().map_err(StoreError::from)
    }

    async fn list_all(&self) -> StoreResult<Vec<User>> {
        let sql = format!(
            "SELECT {USER_COLUMNS} FROM users WHERE deleted_at IS NULL ORDER BY created_at ASC"
        );
        let rows = sqlx::query_as::<_, UserRow>(&sql)
            .fetch_all(&self.db)
            .await
            .map_err(|e| db_error(e, "list users"))?;
        rows.into_iter()
            .map(|r| User::try_from(r).map_err(StoreError::from))
            .collect()
    }

    async fn set_role(&self, id: Uuid, role: Role) -> StoreResult<bool> {
        let res = sqlx::query(
            "UPDATE users SET role = $2, updated_at = now() WHERE id = $1 AND deleted_at IS NULL",
        )
        .bind(id)
        .bind(role.as_str())
        .execute(&self.db)
        .await
        .map_err(|e| db_error(e, "set user role"))?;
        Ok(res.rows_affected() > 0)
    }

    async fn set_active(&self, id: Uuid, active: bool) -> StoreResult<bool> {
        let res = sqlx::query(
            "UPDATE users SET active = $2, updated_at = now() WHERE id = $1 AND deleted_at IS NULL",
        )
        .bind(id)
        .bind(active)
        .execute(&self.db)
        .await
        .map_err(|e| db_error(e, "set user active"))?;
        Ok(res.rows_affected() > 0)
    }
}
