use std::sync::Arc;

use anyhow::Context;
use axum::extract::FromRef;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::{
    auth::{
        dto::{
            AuthFormResponse, ChangeUserPasswordInput, LoginUserInput, RegisterUserInput,
            ResetUserPasswordInput, SendNewConfirmationCodeInput,
        },
        extractors::RequestContext,
        password::PasswordHasher,
        repo::UserStore,
        repo_types::{CreateUserError, NewUser, User, UserChanges, UserLookup},
        session::{ttl_from_days, SessionStore},
        tokens::{TokenKind, TokenStore},
        validation::{
            messages::INVALID_TOKEN, validate, FieldError, CHANGE_PASSWORD_SCHEMA, LOGIN_SCHEMA,
            REGISTER_SCHEMA, RESET_PASSWORD_SCHEMA,
        },
    },
    errors::AppError,
    mailer::{Email, Mailer},
    state::AppState,
};

pub const USERNAME_TAKEN: &str = "Username already in use";
pub const EMAIL_TAKEN: &str = "Email already in use";
pub const INVALID_LOGIN: &str = "Invalid username/email or password";
pub const USER_NOT_FOUND_BY_TOKEN: &str = "User not found";
pub const USER_NOT_FOUND: &str = "User not found.";
pub const OLD_PASSWORD_INCORRECT: &str = "Password is incorrect.";
pub const NEW_PASSWORD_UNCHANGED: &str = "New password must be different from old password.";

/// Verified against on logins for unknown users so both failure paths pay
/// the same KDF cost. Matches no password.
const DUMMY_PASSWORD_HASH: &str = "5f5f5f5f5f5f5f5f5f5f5f5f5f5f5f5f5f5f5f5f5f5f5f5f5f5f5f5f5f5f5f5f5f5f5f5f5f5f5f5f5f5f5f5f5f5f5f5f5f5f5f5f5f5f5f5f5f5f5f5f5f5f5f5f.a3a3a3a3a3a3a3a3";

/// Business logic behind every auth operation. Cheap to build per request.
#[derive(Clone)]
pub struct AuthService {
    users: Arc<dyn UserStore>,
    tokens: TokenStore,
    sessions: SessionStore,
    mailer: Arc<dyn Mailer>,
    hasher: PasswordHasher,
    frontend_url: String,
}

impl FromRef<AppState> for AuthService {
    fn from_ref(state: &AppState) -> Self {
        Self {
            users: state.users.clone(),
            tokens: TokenStore::new(state.cache.clone()),
            sessions: SessionStore::from_ref(state),
            mailer: state.mailer.clone(),
            hasher: state.hasher,
            frontend_url: state.config.frontend_url.clone(),
        }
    }
}

impl FromRef<AppState> for SessionStore {
    fn from_ref(state: &AppState) -> Self {
        SessionStore::new(state.cache.clone(), ttl_from_days(state.config.session_ttl_days))
    }
}

impl AuthService {
    #[cfg(test)]
    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub async fn get_current_user(&self, ctx: &RequestContext) -> Result<Option<User>, AppError> {
        let Some(user_id) = ctx.session.user_id() else {
            return Ok(None);
        };
        let user = self.users.find_one(UserLookup::Id(user_id)).await?;
        if user.is_none() {
            debug!(%user_id, "session user no longer exists");
        }
        Ok(user)
    }

    #[instrument(skip(self, ctx, input), fields(username = %input.username))]
    pub async fn register(
        &self,
        ctx: &mut RequestContext,
        input: RegisterUserInput,
    ) -> Result<AuthFormResponse, AppError> {
        let mut errors = validate(&input, REGISTER_SCHEMA);
        if self
            .users
            .find_one(UserLookup::Username(&input.username))
            .await?
            .is_some()
        {
            errors.push(FieldError::new("username", USERNAME_TAKEN));
        }
        if self
            .users
            .find_one(UserLookup::Email(&input.email))
            .await?
            .is_some()
        {
            errors.push(FieldError::new("email", EMAIL_TAKEN));
        }
        if !errors.is_empty() {
            warn!(count = errors.len(), "register rejected");
            return Ok(AuthFormResponse::Errors(errors));
        }

        let password_hash = self.hash(&input.password).await?;
        let created = self
            .users
            .create(NewUser {
                username: &input.username,
                email: &input.email,
                password_hash: &password_hash,
            })
            .await;
        let user = match created {
            Ok(user) => user,
            Err(CreateUserError::UsernameTaken) => {
                return Ok(AuthFormResponse::error("username", USERNAME_TAKEN))
            }
            Err(CreateUserError::EmailTaken) => {
                return Ok(AuthFormResponse::error("email", EMAIL_TAKEN))
            }
            Err(CreateUserError::Other(e)) => return Err(e.into()),
        };

        self.sessions.authenticate(&mut ctx.session, user.id).await?;

        // The account stays usable if this fails; a new code can be requested.
        if let Err(e) = self.send_confirmation_code(user.id, &user.email).await {
            error!(user_id = %user.id, error = %e, "confirmation email failed");
        }

        info!(user_id = %user.id, "user registered");
        Ok(AuthFormResponse::User(user))
    }

    #[instrument(skip(self, ctx, input))]
    pub async fn login(
        &self,
        ctx: &mut RequestContext,
        input: LoginUserInput,
    ) -> Result<AuthFormResponse, AppError> {
        let errors = validate(&input, LOGIN_SCHEMA);
        if !errors.is_empty() {
            return Ok(AuthFormResponse::Errors(errors));
        }

        let invalid = || {
            AuthFormResponse::Errors(vec![
                FieldError::new("usernameOrEmail", INVALID_LOGIN),
                FieldError::new("password", INVALID_LOGIN),
            ])
        };

        let lookup = if input.username_or_email.contains('@') {
            UserLookup::Email(&input.username_or_email)
        } else {
            UserLookup::Username(&input.username_or_email)
        };
        let Some(user) = self.users.find_one(lookup).await? else {
            self.verify(DUMMY_PASSWORD_HASH, &input.password).await?;
            warn!("login unknown user");
            return Ok(invalid());
        };

        if !self.verify(&user.password_hash, &input.password).await? {
            warn!(user_id = %user.id, "login invalid password");
            return Ok(invalid());
        }

        self.sessions.authenticate(&mut ctx.session, user.id).await?;
        info!(user_id = %user.id, "user logged in");
        Ok(AuthFormResponse::User(user))
    }

    #[instrument(skip(self, ctx))]
    pub async fn logout(&self, ctx: &mut RequestContext) -> Result<bool, AppError> {
        let user_id = ctx.session.user_id();
        self.sessions.destroy(&mut ctx.session).await?;
        if let Some(user_id) = user_id {
            info!(%user_id, "user logged out");
        }
        Ok(true)
    }

    /// Best effort: any failure is logged and reported as `false`.
    #[instrument(skip(self, _ctx, input), fields(user_id = %input.user_id))]
    pub async fn send_new_confirmation_code(
        &self,
        _ctx: &mut RequestContext,
        input: SendNewConfirmationCodeInput,
    ) -> Result<bool, AppError> {
        if let Ok(Some(user)) = self.users.find_one(UserLookup::Id(input.user_id)).await {
            if user.is_confirmed {
                info!("sending confirmation code to an already confirmed user");
            }
        }
        match self
            .send_confirmation_code(input.user_id, &input.user_email)
            .await
        {
            Ok(()) => Ok(true),
            Err(e) => {
                warn!(error = %e, "confirmation code resend failed");
                Ok(false)
            }
        }
    }

    #[instrument(skip(self, _ctx, code))]
    pub async fn confirm_email(
        &self,
        _ctx: &mut RequestContext,
        code: String,
    ) -> Result<AuthFormResponse, AppError> {
        let Some(user_id) = self.tokens.resolve(TokenKind::Confirmation, &code).await? else {
            return Ok(AuthFormResponse::error("code", INVALID_TOKEN));
        };
        if self.users.find_one(UserLookup::Id(user_id)).await?.is_none() {
            return Ok(AuthFormResponse::error("code", USER_NOT_FOUND_BY_TOKEN));
        }

        self.tokens.revoke(TokenKind::Confirmation, &code).await?;
        let changes = UserChanges {
            is_confirmed: Some(true),
            ..Default::default()
        };
        match self.users.update(user_id, changes).await? {
            Some(user) => {
                info!(%user_id, "email confirmed");
                Ok(AuthFormResponse::User(user))
            }
            None => Ok(AuthFormResponse::error("code", USER_NOT_FOUND_BY_TOKEN)),
        }
    }

    /// Always `true` once the lookup succeeds, so callers cannot learn which
    /// emails are registered.
    #[instrument(skip(self, _ctx, email))]
    pub async fn send_password_reset_email(
        &self,
        _ctx: &mut RequestContext,
        email: String,
    ) -> Result<bool, AppError> {
        let Some(user) = self.users.find_one(UserLookup::Email(&email)).await? else {
            debug!("password reset requested for unknown email");
            return Ok(true);
        };

        let token = self.tokens.issue(TokenKind::PasswordReset, user.id).await?;
        let href = format!("{}/reset-password?token={}", self.frontend_url, token);
        let email = Email {
            to: user.email.clone(),
            subject: "Reset Password".into(),
            text: format!("RESET PASSWORD: {href}"),
            html: format!(
                r#"<div><span>RESET PASSWORD: <a href="{href}">Reset Password</a></span></div>"#
            ),
        };
        if let Err(e) = self.mailer.send(email).await {
            error!(user_id = %user.id, error = %e, "password reset email failed");
        }
        Ok(true)
    }

    #[instrument(skip(self, ctx, input))]
    pub async fn reset_password(
        &self,
        ctx: &mut RequestContext,
        input: ResetUserPasswordInput,
    ) -> Result<AuthFormResponse, AppError> {
        let errors = validate(&input, RESET_PASSWORD_SCHEMA);
        if !errors.is_empty() {
            return Ok(AuthFormResponse::Errors(errors));
        }

        let Some(user_id) = self
            .tokens
            .resolve(TokenKind::PasswordReset, &input.token)
            .await?
        else {
            return Ok(AuthFormResponse::error("token", INVALID_TOKEN));
        };
        if self.users.find_one(UserLookup::Id(user_id)).await?.is_none() {
            return Ok(AuthFormResponse::error("token", USER_NOT_FOUND_BY_TOKEN));
        }

        let changes = UserChanges {
            password_hash: Some(self.hash(&input.password).await?),
            ..Default::default()
        };
        let Some(user) = self.users.update(user_id, changes).await? else {
            return Ok(AuthFormResponse::error("token", USER_NOT_FOUND_BY_TOKEN));
        };
        self.tokens
            .revoke(TokenKind::PasswordReset, &input.token)
            .await?;
        self.sessions.authenticate(&mut ctx.session, user.id).await?;

        info!(%user_id, "password reset");
        Ok(AuthFormResponse::User(user))
    }

    #[instrument(skip(self, ctx, input))]
    pub async fn change_password(
        &self,
        ctx: &mut RequestContext,
        input: ChangeUserPasswordInput,
    ) -> Result<AuthFormResponse, AppError> {
        let user_id = ctx.session.user_id().ok_or(AppError::NotAuthenticated)?;
        let user = self
            .users
            .find_one(UserLookup::Id(user_id))
            .await?
            .ok_or_else(|| AppError::NotFound(USER_NOT_FOUND.into()))?;

        let mut errors = validate(&input, CHANGE_PASSWORD_SCHEMA);
        if !self.verify(&user.password_hash, &input.old_password).await? {
            errors.push(FieldError::new("oldPassword", OLD_PASSWORD_INCORRECT));
        }
        if input.old_password == input.password {
            errors.push(FieldError::new("password", NEW_PASSWORD_UNCHANGED));
        }
        if !errors.is_empty() {
            warn!(%user_id, count = errors.len(), "change password rejected");
            return Ok(AuthFormResponse::Errors(errors));
        }

        let changes = UserChanges {
            password_hash: Some(self.hash(&input.password).await?),
            ..Default::default()
        };
        let user = self
            .users
            .update(user_id, changes)
            .await?
            .ok_or_else(|| AppError::NotFound(USER_NOT_FOUND.into()))?;

        info!(%user_id, "password changed");
        Ok(AuthFormResponse::User(user))
    }

    async fn send_confirmation_code(&self, user_id: Uuid, to: &str) -> anyhow::Result<()> {
        let code = self.tokens.issue(TokenKind::Confirmation, user_id).await?;
        self.mailer
            .send(Email {
                to: to.to_string(),
                subject: "Confirmation Code".into(),
                text: format!("CODE: {code}"),
                html: format!("<div><span>CODE: <b>{code}</b></span></div>"),
            })
            .await
            .context("send confirmation email")
    }

    async fn hash(&self, plain: &str) -> anyhow::Result<String> {
        let hasher = self.hasher;
        let plain = plain.to_owned();
        tokio::task::spawn_blocking(move || hasher.hash_password(&plain))
            .await
            .context("hash task")?
    }

    async fn verify(&self, stored: &str, plain: &str) -> anyhow::Result<bool> {
        let hasher = self.hasher;
        let (stored, plain) = (stored.to_owned(), plain.to_owned());
        tokio::task::spawn_blocking(move || hasher.verify_password(&stored, &plain))
            .await
            .context("verify task")?
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::*;
    use crate::auth::session::Session;
    use crate::auth::validation::messages;
    use crate::state::Fakes;

    fn setup() -> (AuthService, Fakes) {
        let (state, fakes) = AppState::fake();
        (AuthService::from_ref(&state), fakes)
    }

    fn ctx() -> RequestContext {
        RequestContext::new(Session::anonymous(), None)
    }

    fn register_input(name: &str, password: &str) -> RegisterUserInput {
        let email = format!("{name}@test.com");
        RegisterUserInput {
            username: name.into(),
            email: email.clone(),
            confirm_email: email,
            password: password.into(),
            confirm_password: password.into(),
        }
    }

    fn login_input(who: &str, password: &str) -> LoginUserInput {
        LoginUserInput {
            username_or_email: who.into(),
            password: password.into(),
        }
    }

    fn fe(field: &str, message: &str) -> FieldError {
        FieldError::new(field, message)
    }

    async fn registered(svc: &AuthService, name: &str, password: &str) -> User {
        let mut c = ctx();
        let res = svc.register(&mut c, register_input(name, password)).await.unwrap();
        res.user().cloned().expect("registration should succeed")
    }

    fn last_code(fakes: &Fakes) -> String {
        let email = fakes.mailer.last().expect("an email was sent");
        email.text.trim_start_matches("CODE: ").to_string()
    }

    #[tokio::test]
    async fn register_creates_unconfirmed_user_and_logs_in() {
        let (svc, fakes) = setup();
        let mut c = ctx();
        let res = svc
            .register(&mut c, register_input("RegisterUser", "RegisterUser123"))
            .await
            .unwrap();

        let user = res.user().expect("user");
        assert_eq!(user.username, "RegisterUser");
        assert!(!user.is_confirmed);
        assert_ne!(user.password_hash, "RegisterUser123");
        assert_eq!(c.session.user_id(), Some(user.id));

        let email = fakes.mailer.last().unwrap();
        assert_eq!(email.to, "RegisterUser@test.com");
        assert_eq!(email.subject, "Confirmation Code");
        let code = last_code(&fakes);
        assert_eq!(code.len(), 8);
        assert_eq!(email.html, format!("<div><span>CODE: <b>{code}</b></span></div>"));
    }

    #[tokio::test]
    async fn register_twice_reports_both_uniqueness_errors() {
        let (svc, _) = setup();
        registered(&svc, "RegisterUser", "RegisterUser123").await;

        let mut c = ctx();
        let res = svc
            .register(&mut c, register_input("RegisterUser", "RegisterUser123"))
            .await
            .unwrap();
        assert_eq!(
            res.errors(),
            &[fe("username", USERNAME_TAKEN), fe("email", EMAIL_TAKEN)]
        );
        assert_eq!(c.session.user_id(), None);
    }

    #[tokio::test]
    async fn uniqueness_errors_follow_schema_errors() {
        let (svc, _) = setup();
        registered(&svc, "taken", "Password123").await;

        let mut input = register_input("taken", "weak");
        input.confirm_password = "weak".into();
        let res = svc.register(&mut ctx(), input).await.unwrap();
        let errors = res.errors();
        assert_eq!(errors[0], fe("password", messages::PASSWORD_TOO_SHORT));
        assert_eq!(errors[errors.len() - 2], fe("username", USERNAME_TAKEN));
        assert_eq!(errors[errors.len() - 1], fe("email", EMAIL_TAKEN));
    }

    #[tokio::test]
    async fn register_survives_mail_failure() {
        let (svc, fakes) = setup();
        fakes.mailer.set_failing(true);
        let mut c = ctx();
        let res = svc
            .register(&mut c, register_input("mailless", "Password123"))
            .await
            .unwrap();
        assert!(res.user().is_some());
        assert!(c.session.user_id().is_some());
    }

    #[tokio::test]
    async fn login_by_username_or_email() {
        let (svc, _) = setup();
        let user = registered(&svc, "loginuser", "Password123").await;

        let mut c = ctx();
        let res = svc.login(&mut c, login_input("loginuser", "Password123")).await.unwrap();
        assert_eq!(res.user().map(|u| u.id), Some(user.id));
        assert_eq!(c.session.user_id(), Some(user.id));

        let mut c = ctx();
        let res = svc
            .login(&mut c, login_input("loginuser@test.com", "Password123"))
            .await
            .unwrap();
        assert_eq!(res.user().map(|u| u.id), Some(user.id));
    }

    #[tokio::test]
    async fn login_failures_are_indistinguishable() {
        let (svc, _) = setup();
        registered(&svc, "loginuser", "Password123").await;
        let expected = [
            fe("usernameOrEmail", INVALID_LOGIN),
            fe("password", INVALID_LOGIN),
        ];

        let mut c = ctx();
        let wrong_password = svc.login(&mut c, login_input("loginuser", "Nope12345")).await.unwrap();
        assert_eq!(wrong_password.errors(), &expected);
        assert_eq!(c.session.user_id(), None);

        let unknown = svc.login(&mut ctx(), login_input("ghost", "Password123")).await.unwrap();
        assert_eq!(unknown.errors(), &expected);
    }

    #[test]
    fn dummy_hash_is_well_formed_and_matches_nothing() {
        let (state, _) = AppState::fake();
        for candidate in ["", "Password123", "ghost"] {
            assert!(!state.hasher.verify_password(DUMMY_PASSWORD_HASH, candidate).unwrap());
        }
    }

    #[tokio::test]
    async fn unknown_user_login_pays_the_kdf_cost() {
        let (svc, _) = setup();
        registered(&svc, "timed", "Password123").await;

        let mut known = Duration::MAX;
        let mut unknown = Duration::MAX;
        for _ in 0..3 {
            let started = Instant::now();
            svc.login(&mut ctx(), login_input("timed", "Nope12345")).await.unwrap();
            known = known.min(started.elapsed());

            let started = Instant::now();
            svc.login(&mut ctx(), login_input("ghost", "Nope12345")).await.unwrap();
            unknown = unknown.min(started.elapsed());
        }
        assert!(
            unknown * 4 >= known,
            "unknown user took {unknown:?}, wrong password took {known:?}"
        );
    }

    #[tokio::test]
    async fn login_requires_both_fields() {
        let (svc, _) = setup();
        let res = svc.login(&mut ctx(), login_input("", "")).await.unwrap();
        assert_eq!(
            res.errors(),
            &[
                fe("usernameOrEmail", messages::REQUIRED),
                fe("password", messages::REQUIRED)
            ]
        );
    }

    #[tokio::test]
    async fn logout_destroys_session() {
        let (svc, _) = setup();
        let mut c = ctx();
        svc.register(&mut c, register_input("leaving", "Password123"))
            .await
            .unwrap();
        let id = c.session.id().unwrap().to_string();

        assert!(svc.logout(&mut c).await.unwrap());
        assert_eq!(c.session.user_id(), None);
        let restored = svc.sessions().load(Some(id)).await.unwrap();
        assert_eq!(restored.user_id(), None);
    }

    #[tokio::test]
    async fn current_user_follows_session() {
        let (svc, fakes) = setup();
        assert!(svc.get_current_user(&ctx()).await.unwrap().is_none());

        let mut c = ctx();
        svc.register(&mut c, register_input("current", "Password123"))
            .await
            .unwrap();
        let first = svc.get_current_user(&c).await.unwrap().unwrap();
        let second = svc.get_current_user(&c).await.unwrap().unwrap();
        assert_eq!(first, second);

        fakes.users.remove(first.id);
        assert!(svc.get_current_user(&c).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn confirm_email_with_valid_code() {
        let (svc, fakes) = setup();
        let user = registered(&svc, "confirmer", "Password123").await;
        let code = last_code(&fakes);

        let res = svc.confirm_email(&mut ctx(), code.clone()).await.unwrap();
        assert!(res.user().unwrap().is_confirmed);

        let again = svc.confirm_email(&mut ctx(), code).await.unwrap();
        assert_eq!(again.errors(), &[fe("code", INVALID_TOKEN)]);
        let stored = fakes.users.find_one(UserLookup::Id(user.id)).await.unwrap().unwrap();
        assert!(stored.is_confirmed);
    }

    #[tokio::test]
    async fn confirm_email_with_unknown_code() {
        let (svc, fakes) = setup();
        let user = registered(&svc, "confirmer", "Password123").await;

        let res = svc.confirm_email(&mut ctx(), "DEADBEEF".into()).await.unwrap();
        assert_eq!(res.errors(), &[fe("code", INVALID_TOKEN)]);
        let stored = fakes.users.find_one(UserLookup::Id(user.id)).await.unwrap().unwrap();
        assert!(!stored.is_confirmed);
    }

    #[tokio::test]
    async fn confirm_email_for_deleted_user() {
        let (svc, fakes) = setup();
        let user = registered(&svc, "vanishing", "Password123").await;
        let code = last_code(&fakes);
        fakes.users.remove(user.id);

        let res = svc.confirm_email(&mut ctx(), code).await.unwrap();
        assert_eq!(res.errors(), &[fe("code", USER_NOT_FOUND_BY_TOKEN)]);
    }

    #[tokio::test]
    async fn resend_confirmation_code() {
        let (svc, fakes) = setup();
        let user = registered(&svc, "resender", "Password123").await;
        let first = last_code(&fakes);

        let input = SendNewConfirmationCodeInput {
            user_id: user.id,
            user_email: user.email.clone(),
        };
        assert!(svc.send_new_confirmation_code(&mut ctx(), input).await.unwrap());
        let second = last_code(&fakes);
        assert_ne!(first, second);

        // Older codes stay valid until they expire.
        let res = svc.confirm_email(&mut ctx(), first).await.unwrap();
        assert!(res.user().is_some());
    }

    #[tokio::test]
    async fn resend_reports_mail_failure_as_false() {
        let (svc, fakes) = setup();
        let user = registered(&svc, "resender", "Password123").await;
        fakes.mailer.set_failing(true);
        let input = SendNewConfirmationCodeInput {
            user_id: user.id,
            user_email: user.email,
        };
        assert!(!svc.send_new_confirmation_code(&mut ctx(), input).await.unwrap());
    }

    #[tokio::test]
    async fn password_reset_email_does_not_leak_existence() {
        let (svc, fakes) = setup();
        let before = fakes.mailer.sent().len();
        assert!(svc
            .send_password_reset_email(&mut ctx(), "nobody@test.com".into())
            .await
            .unwrap());
        assert_eq!(fakes.mailer.sent().len(), before);
    }

    #[tokio::test]
    async fn password_reset_email_carries_link() {
        let (svc, fakes) = setup();
        registered(&svc, "forgetful", "Password123").await;
        assert!(svc
            .send_password_reset_email(&mut ctx(), "forgetful@test.com".into())
            .await
            .unwrap());

        let email = fakes.mailer.last().unwrap();
        assert_eq!(email.subject, "Reset Password");
        let link = email.text.trim_start_matches("RESET PASSWORD: ");
        assert!(link.starts_with("http://localhost:3000/reset-password?token="));
        assert!(email.html.contains(&format!(r#"<a href="{link}">"#)));
        assert_eq!(fakes.cache.keys_with_prefix("forgot-password:").len(), 1);
    }

    async fn reset_token(svc: &AuthService, fakes: &Fakes, email: &str) -> String {
        svc.send_password_reset_email(&mut ctx(), email.into())
            .await
            .unwrap();
        let text = fakes.mailer.last().unwrap().text;
        text.rsplit("token=").next().unwrap().to_string()
    }

    #[tokio::test]
    async fn reset_password_full_flow() {
        let (svc, fakes) = setup();
        let user = registered(&svc, "resetter", "Password123").await;
        let token = reset_token(&svc, &fakes, "resetter@test.com").await;

        let mut c = ctx();
        let input = ResetUserPasswordInput {
            token: token.clone(),
            password: "NewPassword123".into(),
            confirm_password: "NewPassword123".into(),
        };
        let res = svc.reset_password(&mut c, input).await.unwrap();
        assert_eq!(res.user().map(|u| u.id), Some(user.id));
        assert_eq!(c.session.user_id(), Some(user.id));
        assert!(fakes.cache.keys_with_prefix("forgot-password:").is_empty());

        let old = svc.login(&mut ctx(), login_input("resetter", "Password123")).await.unwrap();
        assert!(!old.errors().is_empty());
        let new = svc.login(&mut ctx(), login_input("resetter", "NewPassword123")).await.unwrap();
        assert!(new.user().is_some());
    }

    #[tokio::test]
    async fn reset_password_validates_before_token_lookup() {
        let (svc, _) = setup();
        let input = ResetUserPasswordInput {
            token: "12345".into(),
            password: "te1".into(),
            confirm_password: "te2".into(),
        };
        let res = svc.reset_password(&mut ctx(), input).await.unwrap();
        assert_eq!(
            res.errors(),
            &[
                fe("token", INVALID_TOKEN),
                fe("password", messages::PASSWORD_TOO_SHORT),
                fe("password", messages::PASSWORD_INVALID),
                fe("confirmPassword", messages::PASSWORDS_MUST_MATCH),
            ]
        );
    }

    #[tokio::test]
    async fn reset_password_with_unknown_token() {
        let (svc, _) = setup();
        let mut c = ctx();
        let input = ResetUserPasswordInput {
            token: Uuid::new_v4().simple().to_string(),
            password: "NewPassword123".into(),
            confirm_password: "NewPassword123".into(),
        };
        let res = svc.reset_password(&mut c, input).await.unwrap();
        assert_eq!(res.errors(), &[fe("token", INVALID_TOKEN)]);
        assert_eq!(c.session.user_id(), None);
    }

    #[tokio::test]
    async fn reset_password_for_deleted_user() {
        let (svc, fakes) = setup();
        let user = registered(&svc, "resetter", "Password123").await;
        let token = reset_token(&svc, &fakes, "resetter@test.com").await;
        fakes.users.remove(user.id);

        let input = ResetUserPasswordInput {
            token,
            password: "NewPassword123".into(),
            confirm_password: "NewPassword123".into(),
        };
        let res = svc.reset_password(&mut ctx(), input).await.unwrap();
        assert_eq!(res.errors(), &[fe("token", USER_NOT_FOUND_BY_TOKEN)]);
    }

    fn change_input(old: &str, new: &str) -> ChangeUserPasswordInput {
        ChangeUserPasswordInput {
            old_password: old.into(),
            password: new.into(),
            confirm_password: new.into(),
        }
    }

    #[tokio::test]
    async fn change_password_requires_session() {
        let (svc, _) = setup();
        let err = svc
            .change_password(&mut ctx(), change_input("Password123", "Password456"))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotAuthenticated));
    }

    #[tokio::test]
    async fn change_password_with_wrong_old_password() {
        let (svc, _) = setup();
        let mut c = ctx();
        svc.register(&mut c, register_input("changer", "Password123"))
            .await
            .unwrap();

        let res = svc
            .change_password(&mut c, change_input("Wrong1234", "Password456"))
            .await
            .unwrap();
        assert_eq!(res.errors(), &[fe("oldPassword", OLD_PASSWORD_INCORRECT)]);

        let login = svc.login(&mut ctx(), login_input("changer", "Password123")).await.unwrap();
        assert!(login.user().is_some());
    }

    #[tokio::test]
    async fn change_password_accumulates_errors() {
        let (svc, _) = setup();
        let mut c = ctx();
        svc.register(&mut c, register_input("changer", "Password123"))
            .await
            .unwrap();

        let res = svc
            .change_password(&mut c, change_input("password", "password"))
            .await
            .unwrap();
        assert_eq!(
            res.errors(),
            &[
                fe("password", messages::PASSWORD_INVALID),
                fe("oldPassword", OLD_PASSWORD_INCORRECT),
                fe("password", NEW_PASSWORD_UNCHANGED),
            ]
        );
    }

    #[tokio::test]
    async fn change_password_then_login() {
        let (svc, _) = setup();
        let mut c = ctx();
        svc.register(&mut c, register_input("changer", "Password123"))
            .await
            .unwrap();

        let res = svc
            .change_password(&mut c, change_input("Password123", "Password456"))
            .await
            .unwrap();
        assert!(res.user().is_some());
        assert!(c.session.user_id().is_some());

        let old = svc.login(&mut ctx(), login_input("changer", "Password123")).await.unwrap();
        assert_eq!(
            old.errors(),
            &[
                fe("usernameOrEmail", INVALID_LOGIN),
                fe("password", INVALID_LOGIN)
            ]
        );
        let new = svc.login(&mut ctx(), login_input("changer", "Password456")).await.unwrap();
        assert!(new.user().is_some());
    }

    #[tokio::test]
    async fn change_password_for_vanished_user() {
        let (svc, fakes) = setup();
        let mut c = ctx();
        let res = svc
            .register(&mut c, register_input("changer", "Password123"))
            .await
            .unwrap();
        fakes.users.remove(res.user().unwrap().id);

        let err = svc
            .change_password(&mut c, change_input("Password123", "Password456"))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(ref m) if m == USER_NOT_FOUND));
    }
}
