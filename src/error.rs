//! Error types shared by the data-service client, the authorization gate and the CLI.
//!
//! The edge proxy has its own response-shaped error (`proxy::ProxyError`);
//! this enum covers everything that runs on the caller side.

use thiserror::Error;

use crate::models::Capability;

#[derive(Debug, Error)]
pub enum Error {
    /// Missing or malformed configuration value
    #[error("configuration error: {0}")]
    Config(String),

    /// Transport failure talking to the data service or the proxy
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Persisted session store failure
    #[error("session store error: {0}")]
    Storage(#[from] sled::Error),

    #[error("token error: {0}")]
    Token(#[from] jsonwebtoken::errors::Error),

    /// The data service answered with a non-success status
    #[error("data service returned {status}: {body}")]
    Upstream { status: u16, body: String },

    /// A lookup expected at most one row and got more
    #[error("expected at most one row from {table}, got {count}")]
    MultipleRows { table: String, count: usize },

    /// A record failed local validation before being sent
    #[error("invalid input: {0}")]
    Invalid(String),

    #[error("not signed in")]
    NotSignedIn,

    /// Capabilities are still being resolved; the default `false` must not be trusted yet
    #[error("capabilities are still loading")]
    Unresolved,

    #[error("missing capability: {0}")]
    Forbidden(Capability),
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::Invalid(msg.into())
    }

    pub fn upstream(status: u16, body: impl Into<String>) -> Self {
        Self::Upstream {
            status,
            body: body.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_error_names_status_and_body() {
        let err = Error::upstream(409, r#"{"message":"duplicate key"}"#);
        assert_eq!(
            err.to_string(),
            r#"data service returned 409: {"message":"duplicate key"}"#
        );
    }

    #[test]
    fn forbidden_names_the_capability() {
        let err = Error::Forbidden(Capability::ManageRoles);
        assert_eq!(err.to_string(), "missing capability: manage roles");
    }
}
