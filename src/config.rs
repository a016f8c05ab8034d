//! Server configuration, loaded once from the environment at startup.

use crate::error::ConfigError;

mod env_keys {
    pub const PORT: &str = "PORT";
    pub const BASE_URL: &str = "BASE_URL";
    pub const JWT_SECRET: &str = "JWT_SECRET";
    pub const DATABASE_URL: &str = "DATABASE_URL";
}

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_BASE_URL: &str = "http://localhost:8080";

#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP listen port.
    pub port: u16,

    /// Public base for the URLs handed to agents in `registered` frames.
    /// Stored without a trailing slash.
    pub base_url: String,

    /// HMAC secret for session tokens. Mandatory, whitespace-trimmed.
    pub jwt_secret: String,

    /// Postgres-compatible connection URL. SQLite URLs are accepted for
    /// development and tests.
    pub database_url: String,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let port = match lookup(env_keys::PORT) {
            Some(raw) => raw
                .parse::<u16>()
                .map_err(|e| ConfigError::Invalid(env_keys::PORT, e.to_string()))?,
            None => DEFAULT_PORT,
        };

        let base_url = lookup(env_keys::BASE_URL)
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
            .trim_end_matches('/')
            .to_string();

        let jwt_secret = lookup(env_keys::JWT_SECRET)
            .ok_or(ConfigError::Missing(env_keys::JWT_SECRET))?
            .trim()
            .to_string();
        if jwt_secret.is_empty() {
            return Err(ConfigError::Invalid(
                env_keys::JWT_SECRET,
                "must not be empty".to_string(),
            ));
        }

        let database_url =
            lookup(env_keys::DATABASE_URL).ok_or(ConfigError::Missing(env_keys::DATABASE_URL))?;

        Ok(Self {
            port,
            base_url,
            jwt_secret,
            database_url,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from<'a>(pairs: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + 'a {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_applied_for_optional_vars() {
        let config = Config::from_lookup(lookup_from(&[
            ("JWT_SECRET", "s3cret"),
            ("DATABASE_URL", "sqlite::memory:"),
        ]))
        .unwrap();

        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.base_url, DEFAULT_BASE_URL);
    }

    #[test]
    fn base_url_trailing_slash_trimmed() {
        let config = Config::from_lookup(lookup_from(&[
            ("JWT_SECRET", "s3cret"),
            ("DATABASE_URL", "sqlite::memory:"),
            ("BASE_URL", "https://tunnel.example.com/"),
        ]))
        .unwrap();

        assert_eq!(config.base_url, "https://tunnel.example.com");
    }

    #[test]
    fn jwt_secret_is_trimmed_and_required() {
        let config = Config::from_lookup(lookup_from(&[
            ("JWT_SECRET", "  s3cret\n"),
            ("DATABASE_URL", "sqlite::memory:"),
        ]))
        .unwrap();
        assert_eq!(config.jwt_secret, "s3cret");

        let missing = Config::from_lookup(lookup_from(&[("DATABASE_URL", "sqlite::memory:")]));
        assert!(matches!(missing, Err(ConfigError::Missing("JWT_SECRET"))));

        let blank = Config::from_lookup(lookup_from(&[
            ("JWT_SECRET", "   "),
            ("DATABASE_URL", "sqlite::memory:"),
        ]));
        assert!(matches!(blank, Err(ConfigError::Invalid("JWT_SECRET", _))));
    }

    #[test]
    fn bad_port_rejected() {
        let result = Config::from_lookup(lookup_from(&[
            ("JWT_SECRET", "s3cret"),
            ("DATABASE_URL", "sqlite::memory:"),
            ("PORT", "eighty"),
        ]));
        assert!(matches!(result, Err(ConfigError::Invalid("PORT", _))));
    }
}
