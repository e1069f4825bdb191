use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::auth::{
    repo_types::User,
    validation::{FieldError, FormInput},
};

/// Input for `registerUser`. Missing fields deserialize as empty strings
/// so they surface as "Required" field errors instead of a bad request.
#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RegisterUserInput {
    pub username: String,
    pub email: String,
    pub confirm_email: String,
    pub password: String,
    pub confirm_password: String,
}

impl FormInput for RegisterUserInput {
    fn field(&self, name: &str) -> Option<&str> {
        match name {
            "username" => Some(&self.username),
            "email" => Some(&self.email),
            "confirmEmail" => Some(&self.confirm_email),
            "password" => Some(&self.password),
            "confirmPassword" => Some(&self.confirm_password),
            _ => None,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LoginUserInput {
    pub username_or_email: String,
    pub password: String,
}

impl FormInput for LoginUserInput {
    fn field(&self, name: &str) -> Option<&str> {
        match name {
            "usernameOrEmail" => Some(&self.username_or_email),
            "password" => Some(&self.password),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendNewConfirmationCodeInput {
    pub user_id: Uuid,
    pub user_email: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ResetUserPasswordInput {
    pub token: String,
    pub password: String,
    pub confirm_password: String,
}

impl FormInput for ResetUserPasswordInput {
    fn field(&self, name: &str) -> Option<&str> {
        match name {
            "token" => Some(&self.token),
            "password" => Some(&self.password),
            "confirmPassword" => Some(&self.confirm_password),
            _ => None,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ChangeUserPasswordInput {
    pub old_password: String,
    pub password: String,
    pub confirm_password: String,
}

impl FormInput for ChangeUserPasswordInput {
    fn field(&self, name: &str) -> Option<&str> {
        match name {
            "oldPassword" => Some(&self.old_password),
            "password" => Some(&self.password),
            "confirmPassword" => Some(&self.confirm_password),
            _ => None,
        }
    }
}

/// Outcome of a form mutation: either field errors or the affected user.
#[derive(Debug)]
pub enum AuthFormResponse {
    Errors(Vec<FieldError>),
    User(User),
}

impl AuthFormResponse {
    pub fn error(field: &str, message: &str) -> Self {
        AuthFormResponse::Errors(vec![FieldError::new(field, message)])
    }

    pub fn errors(&self) -> &[FieldError] {
        match self {
            AuthFormResponse::Errors(errors) => errors,
            AuthFormResponse::User(_) => &[],
        }
    }

    pub fn user(&self) -> Option<&User> {
        match self {
            AuthFormResponse::User(user) => Some(user),
            AuthFormResponse::Errors(_) => None,
        }
    }

    /// Wire shape with the user rendered for `viewer`.
    pub fn view(self, viewer: Option<Uuid>) -> AuthFormView {
        match self {
            AuthFormResponse::Errors(errors) => AuthFormView {
                errors: Some(errors),
                user: None,
            },
            AuthFormResponse::User(user) => AuthFormView {
                errors: None,
                user: Some(PublicUser::view(&user, viewer)),
            },
        }
    }
}

#[derive(Debug, Serialize)]
pub struct AuthFormView {
    pub errors: Option<Vec<FieldError>>,
    pub user: Option<PublicUser>,
}

/// User as returned to clients. The email is only readable by its owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicUser {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    pub is_confirmed: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl PublicUser {
    pub fn view(user: &User, viewer: Option<Uuid>) -> Self {
        let email = if viewer == Some(user.id) {
            user.email.clone()
        } else {
            String::new()
        };
        Self {
            id: user.id,
            username: user.username.clone(),
            email,
            is_confirmed: user.is_confirmed,
            created_at: user.created_at,
            updated_at: user.updated_at,
        }
    }
}
