//! Top-level error types.

use std::time::Duration;

/// Crate-wide result alias.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Configuration problems. Any of these at startup is fatal.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("no bot identities configured (set BOT_TOKENS or add [[bots]] to the config file)")]
    NoIdentities,

    #[error("bot '{0}' has no token")]
    MissingToken(String),

    #[error("unknown presence action '{0}'")]
    InvalidAction(String),

    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

/// Errors from the messaging transport.
///
/// Split into transient failures, which callers skip or retry, and permanent
/// ones, which end the affected ticker or identity.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("network error: {0}")]
    Network(String),

    #[error("rate limited, retry after {0:?}")]
    RateLimited(Duration),

    #[error("platform api error: {0}")]
    Api(String),

    #[error("connection closed")]
    Closed,

    #[error("conversation no longer accessible: {0}")]
    ConversationUnavailable(String),

    #[error("bot identity rejected: {0}")]
    Unauthorized(String),
}

impl TransportError {
    /// Permanent errors will not go away by retrying the same call.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            TransportError::ConversationUnavailable(_) | TransportError::Unauthorized(_)
        )
    }
}

/// Errors from the presence registry.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PresenceError {
    #[error("ticker registry for bot '{0}' is closed")]
    RegistryClosed(String),
}

/// Inbound events that can't be mapped to a conversation.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EventError {
    #[error("{kind} event {event_id} carries no chat")]
    MissingChat { event_id: String, kind: crate::EventKind },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn top_level_error_wraps_config_and_context_errors() {
        let error = Error::from(ConfigError::NoIdentities);
        assert!(matches!(error, Error::Config(ConfigError::NoIdentities)));

        let error = Error::from(anyhow::anyhow!("failed to read config.toml"));
        assert_eq!(error.to_string(), "failed to read config.toml");
    }

    #[test]
    fn permanent_errors_are_classified() {
        assert!(TransportError::Unauthorized("invalid token".into()).is_permanent());
        assert!(TransportError::ConversationUnavailable("bot was blocked".into()).is_permanent());
        assert!(!TransportError::Timeout(Duration::from_secs(10)).is_permanent());
        assert!(!TransportError::RateLimited(Duration::from_secs(3)).is_permanent());
        assert!(!TransportError::Api("Bad Request".into()).is_permanent());
        assert!(!TransportError::Closed.is_permanent());
    }
}
