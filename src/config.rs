use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub database_url: String,
    pub redis_url: String,
    pub host: String,
    pub port: u16,
    pub production: bool,
    pub frontend_url: String,
    pub session_ttl_days: i64,
    /// Read the client address from `X-Forwarded-For` as appended by a
    /// reverse proxy in front of the server.
    pub trust_proxy: bool,
    pub scrypt_log_n: u8,
    pub mail_from: String,
    pub smtp: Option<SmtpConfig>,
}

pub const MAX_SESSION_TTL_DAYS: i64 = 3650;

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = std::env::var("DATABASE_URL")?;
        let production = std::env::var("APP_ENV")
            .map(|v| v == "production")
            .unwrap_or(false);

        let smtp = match std::env::var("EMAIL_HOST") {
            Ok(host) if !host.is_empty() => Some(SmtpConfig {
                host,
                port: parse_or("EMAIL_PORT", 587),
                username: std::env::var("EMAIL_USER").ok(),
                password: std::env::var("EMAIL_PASSWORD").ok(),
            }),
            _ => None,
        };

        Ok(Self {
            database_url,
            redis_url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://127.0.0.1:6379".into()),
            host: std::env::var("APP_HOST").unwrap_or_else(|_| "0.0.0.0".into()),
            port: parse_or("APP_PORT", 4000),
            production,
            frontend_url: std::env::var("FRONTEND_URL")
                .unwrap_or_else(|_| "http://localhost:3000".into()),
            session_ttl_days: parse_or::<i64>("SESSION_TTL_DAYS", 7).clamp(1, MAX_SESSION_TTL_DAYS),
            trust_proxy: parse_or("TRUST_PROXY", false),
            scrypt_log_n: parse_or("SCRYPT_LOG_N", 14),
            mail_from: std::env::var("EMAIL_FROM")
                .unwrap_or_else(|_| "Auth Server <noreply@example.com>".into()),
            smtp,
        })
    }
}

fn parse_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}
