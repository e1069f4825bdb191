use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

/// User record in the database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: String, // scrypt "<key>.<salt>", never exposed
    pub is_confirmed: bool,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// Exact-match lookup criteria.
#[derive(Debug, Clone, Copy)]
pub enum UserLookup<'a> {
    Id(Uuid),
    Username(&'a str),
    Email(&'a str),
}

#[derive(Debug)]
pub struct NewUser<'a> {
    pub username: &'a str,
    pub email: &'a str,
    pub password_hash: &'a str,
}

#[derive(Debug, Default)]
pub struct UserChanges {
    pub password_hash: Option<String>,
    pub is_confirmed: Option<bool>,
}

#[derive(Debug, thiserror::Error)]
pub enum CreateUserError {
    #[error("username already in use")]
    UsernameTaken,
    #[error("email already in use")]
    EmailTaken,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
