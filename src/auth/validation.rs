use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

pub const USERNAME_MIN: usize = 4;
pub const USERNAME_MAX: usize = 16;
pub const USERNAME_RESERVED: &[&str] = &["superadmin", "admin", "god", "null", "undefined"];
pub const PASSWORD_MIN: usize = 6;
pub const PASSWORD_MAX: usize = 99;

pub mod messages {
    pub const REQUIRED: &str = "Required";
    pub const INVALID_TOKEN: &str = "Invalid or expired token";
    pub const EMAILS_MUST_MATCH: &str = "Emails must match";
    pub const PASSWORDS_MUST_MATCH: &str = "Passwords must match";

    pub const USERNAME_TOO_SHORT: &str = "Too short! Minimum of 4 characters in length";
    pub const USERNAME_TOO_LONG: &str = "Too long! Maximum of 16 characters in length";
    pub const USERNAME_RESERVED: &str = "Nice try";
    pub const USERNAME_INVALID: &str = "Username can only contain letters, numbers, and \"_\"";

    pub const PASSWORD_TOO_SHORT: &str = "Too short! Minimum of 6 characters in length";
    pub const PASSWORD_TOO_LONG: &str = "Too long! Maximum of 99 characters in length";
    pub const PASSWORD_INVALID: &str =
        "Must contain at least one uppercase letter, one lowercase letter, and one number";

    pub const EMAIL_INVALID: &str = "InvalidEmail";
}

/// One validation failure, returned to the caller as data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// A submitted form whose fields can be looked up by name.
pub trait FormInput {
    fn field(&self, name: &str) -> Option<&str>;
}

pub enum Rule {
    MinLen(usize, &'static str),
    MaxLen(usize, &'static str),
    NotOneOf(&'static [&'static str], &'static str),
    /// Predicate over the raw value; an empty value is checked too.
    Matches(fn(&str) -> bool, &'static str),
    /// Email shape; empty values are left to `Required`.
    Email(&'static str),
    EqualsField(&'static str, &'static str),
    Required(&'static str),
}

pub struct FieldRules {
    pub field: &'static str,
    pub rules: &'static [Rule],
}

pub type Schema = &'static [FieldRules];

impl Rule {
    fn check(&self, value: &str, form: &dyn FormInput) -> Option<&'static str> {
        let ok = match self {
            Rule::MinLen(min, _) => value.chars().count() >= *min,
            Rule::MaxLen(max, _) => value.chars().count() <= *max,
            Rule::NotOneOf(set, _) => !set.iter().any(|reserved| *reserved == value),
            Rule::Matches(pred, _) => pred(value),
            Rule::Email(_) => value.is_empty() || is_valid_email(value),
            Rule::EqualsField(other, _) => form.field(other).unwrap_or_default() == value,
            Rule::Required(_) => !value.is_empty(),
        };
        if ok {
            None
        } else {
            Some(self.message())
        }
    }

    fn message(&self) -> &'static str {
        match self {
            Rule::MinLen(_, m)
            | Rule::MaxLen(_, m)
            | Rule::NotOneOf(_, m)
            | Rule::Matches(_, m)
            | Rule::Email(m)
            | Rule::EqualsField(_, m)
            | Rule::Required(m) => m,
        }
    }
}

/// Runs every rule of every field and collects all failures in
/// declaration order. Never short-circuits.
pub fn validate(form: &dyn FormInput, schema: Schema) -> Vec<FieldError> {
    let mut errors = Vec::new();
    for field in schema {
        let value = form.field(field.field).unwrap_or_default();
        for rule in field.rules {
            if let Some(message) = rule.check(value, form) {
                errors.push(FieldError::new(field.field, message));
            }
        }
    }
    errors
}

lazy_static! {
    static ref USERNAME_RE: Regex = Regex::new(r"^[A-Za-z0-9_]+$").unwrap();
    static ref EMAIL_RE: Regex = Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap();
    static ref RESET_TOKEN_RE: Regex = Regex::new(r"^[0-9a-z]{32}$").unwrap();
}

pub fn is_valid_email(email: &str) -> bool {
    EMAIL_RE.is_match(email)
}

fn is_valid_username(value: &str) -> bool {
    USERNAME_RE.is_match(value)
}

fn is_strong_password(value: &str) -> bool {
    value.chars().any(|c| c.is_ascii_digit())
        && value.chars().any(|c| c.is_ascii_lowercase())
        && value.chars().any(|c| c.is_ascii_uppercase())
}

fn is_reset_token(value: &str) -> bool {
    RESET_TOKEN_RE.is_match(value)
}

const PASSWORD_RULES: &[Rule] = &[
    Rule::MinLen(PASSWORD_MIN, messages::PASSWORD_TOO_SHORT),
    Rule::MaxLen(PASSWORD_MAX, messages::PASSWORD_TOO_LONG),
    Rule::Matches(is_strong_password, messages::PASSWORD_INVALID),
    Rule::Required(messages::REQUIRED),
];

const CONFIRM_PASSWORD_RULES: &[Rule] = &[
    Rule::EqualsField("password", messages::PASSWORDS_MUST_MATCH),
    Rule::Required(messages::REQUIRED),
];

pub static REGISTER_SCHEMA: Schema = &[
    FieldRules {
        field: "username",
        rules: &[
            Rule::MinLen(USERNAME_MIN, messages::USERNAME_TOO_SHORT),
            Rule::MaxLen(USERNAME_MAX, messages::USERNAME_TOO_LONG),
            Rule::NotOneOf(USERNAME_RESERVED, messages::USERNAME_RESERVED),
            Rule::Matches(is_valid_username, messages::USERNAME_INVALID),
            Rule::Required(messages::REQUIRED),
        ],
    },
    FieldRules {
        field: "email",
        rules: &[
            Rule::Email(messages::EMAIL_INVALID),
            Rule::Required(messages::REQUIRED),
        ],
    },
    FieldRules {
        field: "confirmEmail",
        rules: &[
            Rule::EqualsField("email", messages::EMAILS_MUST_MATCH),
            Rule::Required(messages::REQUIRED),
        ],
    },
    FieldRules {
        field: "password",
        rules: PASSWORD_RULES,
    },
    FieldRules {
        field: "confirmPassword",
        rules: CONFIRM_PASSWORD_RULES,
    },
];

pub static LOGIN_SCHEMA: Schema = &[
    FieldRules {
        field: "usernameOrEmail",
        rules: &[Rule::Required(messages::REQUIRED)],
    },
    FieldRules {
        field: "password",
        rules: &[Rule::Required(messages::REQUIRED)],
    },
];

pub static RESET_PASSWORD_SCHEMA: Schema = &[
    FieldRules {
        field: "token",
        rules: &[
            Rule::Matches(is_reset_token, messages::INVALID_TOKEN),
            Rule::Required(messages::REQUIRED),
        ],
    },
    FieldRules {
        field: "password",
        rules: PASSWORD_RULES,
    },
    FieldRules {
        field: "confirmPassword",
        rules: CONFIRM_PASSWORD_RULES,
    },
];

pub static CHANGE_PASSWORD_SCHEMA: Schema = &[
    FieldRules {
        field: "oldPassword",
        rules: &[Rule::Required(messages::REQUIRED)],
    },
    FieldRules {
        field: "password",
        rules: PASSWORD_RULES,
    },
    FieldRules {
        field: "confirmPassword",
        rules: CONFIRM_PASSWORD_RULES,
    },
];
