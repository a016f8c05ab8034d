//! Error kinds shared across the server.

use thiserror::Error;

use crate::protocol;

/// Startup configuration problems. Any of these terminate the process
/// with exit code 1 before the listener is bound.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} environment variable is required")]
    Missing(&'static str),

    #[error("{0} is invalid: {1}")]
    Invalid(&'static str, String),
}

/// Failures while admitting an agent session.
///
/// Each variant maps to the close code the transport is shut with.
#[derive(Debug, Error)]
pub enum RegisterError {
    #[error("invalid or expired token")]
    Auth,

    #[error("subdomain '{0}' is already taken")]
    SubdomainConflict(String),

    #[error("storage error: {0}")]
    Storage(#[from] sea_orm::DbErr),
}

impl RegisterError {
    pub fn close_code(&self) -> u16 {
        match self {
            RegisterError::Auth => protocol::CLOSE_AUTH_FAILED,
            RegisterError::SubdomainConflict(_) | RegisterError::Storage(_) => {
                protocol::CLOSE_REGISTRATION_FAILED
            }
        }
    }
}

/// Device-code allocation failures surfaced by the activation API.
#[derive(Debug, Error)]
pub enum DeviceCodeError {
    #[error("could not allocate a unique device code")]
    Exhausted,

    #[error("storage error: {0}")]
    Storage(#[from] sea_orm::DbErr),
}
