use anyhow::Context;
use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use crate::auth::repo_types::{CreateUserError, NewUser, User, UserChanges, UserLookup};

const USER_COLUMNS: &str =
    "id, username, email, password AS password_hash, is_confirmed, created_at, updated_at";

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn find_one(&self, lookup: UserLookup<'_>) -> anyhow::Result<Option<User>>;
    async fn create(&self, new: NewUser<'_>) -> Result<User, CreateUserError>;
    /// Applies the changes and returns the updated row, `None` if the id is
    /// unknown.
    async fn update(&self, id: Uuid, changes: UserChanges) -> anyhow::Result<Option<User>>;
}

#[derive(Clone)]
pub struct PgUserStore {
    db: PgPool,
}

impl PgUserStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl UserStore for PgUserStore {
    async fn find_one(&self, lookup: UserLookup<'_>) -> anyhow::Result<Option<User>> {
        let query = match lookup {
            UserLookup::Id(_) => format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1"),
            UserLookup::Username(_) => {
                format!("SELECT {USER_COLUMNS} FROM users WHERE username = $1")
            }
            UserLookup::Email(_) => format!("SELECT {USER_COLUMNS} FROM users WHERE email = $1"),
        };
        let q = sqlx::query_as::<_, User>(&query);
        let q = match lookup {
            UserLookup::Id(id) => q.bind(id),
            UserLookup::Username(name) => q.bind(name),
            UserLookup::Email(email) => q.bind(email),
        };
        let user = q.fetch_optional(&self.db).await.context("find user")?;
        Ok(user)
    }

    async fn create(&self, new: NewUser<'_>) -> Result<User, CreateUserError> {
        let query = format!(
            r#"
            INSERT INTO users (username, email, password)
            VALUES ($1, $2, $3)
            RETURNING {USER_COLUMNS}
            "#
        );
        let result = sqlx::query_as::<_, User>(&query)
            .bind(new.username)
            .bind(new.email)
            .bind(new.password_hash)
            .fetch_one(&self.db)
            .await;

        match result {
            Ok(user) => Ok(user),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                let constraint = e.constraint().map(str::to_owned);
                match constraint.as_deref() {
                    Some("users_username_key") => Err(CreateUserError::UsernameTaken),
                    Some("users_email_key") => Err(CreateUserError::EmailTaken),
                    _ => Err(anyhow::Error::new(sqlx::Error::Database(e))
                        .context("insert user")
                        .into()),
                }
            }
            Err(e) => Err(anyhow::Error::new(e).context("insert user").into()),
        }
    }

    async fn update(&self, id: Uuid, changes: UserChanges) -> anyhow::Result<Option<User>> {
        let query = format!(
            r#"
            UPDATE users
               SET password = COALESCE($2, password),
                   is_confirmed = COALESCE($3, is_confirmed),
                   updated_at = now()
             WHERE id = $1
            RETURNING {USER_COLUMNS}
            "#
        );
        let user = sqlx::query_as::<_, User>(&query)
            .bind(id)
            .bind(changes.password_hash)
            .bind(changes.is_confirmed)
            .fetch_optional(&self.db)
            .await
            .context("update user")?;
        Ok(user)
    }
}

#[cfg(test)]
pub use memory::MemoryUserStore;
