use std::time::Duration;

use axum::{
    extract::{FromRef, State},
    routing::post,
    Json, Router,
};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use futures_util::future::BoxFuture;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::{
    auth::{
        dto::{
            AuthFormResponse, ChangeUserPasswordInput, LoginUserInput, PublicUser,
            RegisterUserInput, ResetUserPasswordInput, SendNewConfirmationCodeInput,
        },
        extractors::RequestContext,
        rate_limit::{Identity, RateLimitPolicy, RateLimiter},
        services::AuthService,
        session::{CookieChange, SessionStore, COOKIE_NAME},
    },
    errors::AppError,
    state::AppState,
};

pub fn auth_routes() -> Router<AppState> {
    Router::new().route("/graphql", post(graphql))
}

type HandlerFuture<'a> = BoxFuture<'a, Result<Value, AppError>>;
type Handler = for<'a> fn(&'a AuthService, &'a mut RequestContext, Value) -> HandlerFuture<'a>;

/// Checks run in order before an operation's handler.
pub enum Guard {
    Authenticated,
    RateLimit(RateLimitPolicy),
}

pub struct Operation {
    pub name: &'static str,
    pub guards: &'static [Guard],
    handler: Handler,
}

const REGISTER_LIMIT: RateLimitPolicy = RateLimitPolicy {
    window: Duration::from_secs(60),
    max: 5,
    limit_by_variables: true,
    message: Some(
        "Seems like you're trying to register to often! Please try again later or with different values.",
    ),
};

pub static OPERATIONS: &[Operation] = &[
    Operation {
        name: "hello",
        guards: &[],
        handler: hello,
    },
    Operation {
        name: "getCurrentUser",
        guards: &[],
        handler: get_current_user,
    },
    Operation {
        name: "registerUser",
        guards: &[Guard::RateLimit(REGISTER_LIMIT)],
        handler: register_user,
    },
    Operation {
        name: "loginUser",
        guards: &[],
        handler: login_user,
    },
    Operation {
        name: "logoutUser",
        guards: &[],
        handler: logout_user,
    },
    Operation {
        name: "sendNewConfirmationCode",
        guards: &[],
        handler: send_new_confirmation_code,
    },
    Operation {
        name: "confirmUserEmail",
        guards: &[],
        handler: confirm_user_email,
    },
    Operation {
        name: "sendPasswordResetEmail",
        guards: &[],
        handler: send_password_reset_email,
    },
    Operation {
        name: "resetUserPassword",
        guards: &[],
        handler: reset_user_password,
    },
    Operation {
        name: "changeUserPassword",
        guards: &[Guard::Authenticated],
        handler: change_user_password,
    },
];

pub fn find_operation(name: &str) -> Option<&'static Operation> {
    OPERATIONS.iter().find(|op| op.name == name)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphqlRequest {
    pub operation_name: String,
    #[serde(default)]
    pub variables: Value,
}

#[derive(Debug, Serialize)]
pub struct GraphqlResponse {
    pub data: serde_json::Map<String, Value>,
}

impl FromRef<AppState> for RateLimiter {
    fn from_ref(state: &AppState) -> Self {
        RateLimiter::new(state.cache.clone())
    }
}

#[instrument(skip_all, fields(operation = %request.operation_name))]
pub async fn graphql(
    State(state): State<AppState>,
    mut ctx: RequestContext,
    jar: CookieJar,
    Json(request): Json<GraphqlRequest>,
) -> Result<(CookieJar, Json<GraphqlResponse>), AppError> {
    let op = find_operation(&request.operation_name).ok_or_else(|| {
        warn!("unknown operation");
        AppError::BadRequest(format!(
            "Cannot query field \"{}\" on type \"Query\" or \"Mutation\".",
            request.operation_name
        ))
    })?;

    let limiter = RateLimiter::from_ref(&state);
    for guard in op.guards {
        match guard {
            Guard::Authenticated => {
                if ctx.session.user_id().is_none() {
                    return Err(AppError::NotAuthenticated);
                }
            }
            Guard::RateLimit(policy) => {
                let identity = Identity::of(ctx.session.user_id(), ctx.client_ip);
                limiter
                    .hit(op.name, Some(&request.variables), identity, policy)
                    .await?;
            }
        }
    }

    let service = AuthService::from_ref(&state);
    let value = (op.handler)(&service, &mut ctx, request.variables).await?;
    debug!("operation completed");

    let jar = sync_cookie(jar, &ctx, &SessionStore::from_ref(&state), state.config.production);
    let mut data = serde_json::Map::new();
    data.insert(op.name.to_string(), value);
    Ok((jar, Json(GraphqlResponse { data })))
}

/// Mirrors the session's cookie change onto the response.
fn sync_cookie(jar: CookieJar, ctx: &RequestContext, sessions: &SessionStore, secure: bool) -> CookieJar {
    match (ctx.session.cookie_change(), ctx.session.id()) {
        (CookieChange::Set, Some(id)) => {
            let max_age = time::Duration::seconds(sessions.ttl().as_secs() as i64);
            jar.add(
                Cookie::build((COOKIE_NAME, id.to_string()))
                    .path("/")
                    .http_only(true)
                    .same_site(SameSite::Lax)
                    .secure(secure)
                    .max_age(max_age),
            )
        }
        (CookieChange::Clear, _) => jar.remove(Cookie::build(COOKIE_NAME).path("/")),
        _ => jar,
    }
}

fn arg<T: DeserializeOwned>(variables: &Value, name: &str) -> Result<T, AppError> {
    let raw = variables
        .get(name)
        .cloned()
        .ok_or_else(|| AppError::BadRequest(format!("Variable \"${name}\" is required.")))?;
    serde_json::from_value(raw)
        .map_err(|e| AppError::BadRequest(format!("Variable \"${name}\" got invalid value: {e}")))
}

fn to_value<T: Serialize>(value: T) -> Result<Value, AppError> {
    serde_json::to_value(value).map_err(|e| AppError::Internal(e.into()))
}

fn form(response: AuthFormResponse, ctx: &RequestContext) -> Result<Value, AppError> {
    to_value(response.view(ctx.session.user_id()))
}

fn hello<'a>(_: &'a AuthService, _: &'a mut RequestContext, _: Value) -> HandlerFuture<'a> {
    Box::pin(async { Ok(Value::String("Hello World!".into())) })
}

fn get_current_user<'a>(
    svc: &'a AuthService,
    ctx: &'a mut RequestContext,
    _: Value,
) -> HandlerFuture<'a> {
    Box::pin(async move {
        let user = svc.get_current_user(ctx).await?;
        let viewer = ctx.session.user_id();
        to_value(user.map(|u| PublicUser::view(&u, viewer)))
    })
}

fn register_user<'a>(
    svc: &'a AuthService,
    ctx: &'a mut RequestContext,
    vars: Value,
) -> HandlerFuture<'a> {
    Box::pin(async move {
        let input: RegisterUserInput = arg(&vars, "registerUserInput")?;
        let response = svc.register(ctx, input).await?;
        form(response, ctx)
    })
}

fn login_user<'a>(
    svc: &'a AuthService,
    ctx: &'a mut RequestContext,
    vars: Value,
) -> HandlerFuture<'a> {
    Box::pin(async move {
        let input: LoginUserInput = arg(&vars, "loginUserInput")?;
        let response = svc.login(ctx, input).await?;
        form(response, ctx)
    })
}

fn logout_user<'a>(
    svc: &'a AuthService,
    ctx: &'a mut RequestContext,
    _: Value,
) -> HandlerFuture<'a> {
    Box::pin(async move { to_value(svc.logout(ctx).await?) })
}

fn send_new_confirmation_code<'a>(
    svc: &'a AuthService,
    ctx: &'a mut RequestContext,
    vars: Value,
) -> HandlerFuture<'a> {
    Box::pin(async move {
        let input: SendNewConfirmationCodeInput = arg(&vars, "sendNewConfirmationCodeInput")?;
        to_value(svc.send_new_confirmation_code(ctx, input).await?)
    })
}

fn confirm_user_email<'a>(
    svc: &'a AuthService,
    ctx: &'a mut RequestContext,
    vars: Value,
) -> HandlerFuture<'a> {
    Box::pin(async move {
        let code: String = arg(&vars, "code")?;
        let response = svc.confirm_email(ctx, code).await?;
        form(response, ctx)
    })
}

fn send_password_reset_email<'a>(
    svc: &'a AuthService,
    ctx: &'a mut RequestContext,
    vars: Value,
) -> HandlerFuture<'a> {
    Box::pin(async move {
        let email: String = arg(&vars, "email")?;
        to_value(svc.send_password_reset_email(ctx, email).await?)
    })
}

fn reset_user_password<'a>(
    svc: &'a AuthService,
    ctx: &'a mut RequestContext,
    vars: Value,
) -> HandlerFuture<'a> {
    Box::pin(async move {
        let input: ResetUserPasswordInput = arg(&vars, "resetPasswordInput")?;
        let response = svc.reset_password(ctx, input).await?;
        form(response, ctx)
    })
}

fn change_user_password<'a>(
    svc: &'a AuthService,
    ctx: &'a mut RequestContext,
    vars: Value,
) -> HandlerFuture<'a> {
    Box::pin(async move {
        let input: ChangeUserPasswordInput = arg(&vars, "changeUserPasswordInput")?;
        let response = svc.change_password(ctx, input).await?;
        form(response, ctx)
    })
}
