use crate::lifecycle::TrialStatus;

#[derive(Debug, thiserror::Error)]
pub enum HpoError {
    #[error("invalid location: {0}")]
    InvalidLocation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid transition: cannot {action} a {status} node")]
    InvalidTransition {
        status: TrialStatus,
        action: &'static str,
    },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("concurrent write conflict: {0}")]
    ConcurrentWriteConflict(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl HpoError {
    /// Lock contention is the only failure a caller is expected to retry.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ConcurrentWriteConflict(_))
    }

    /// Stable machine-readable name of the variant.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidLocation(_) => "invalid_location",
            Self::NotFound(_) => "not_found",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::Serialization(_) => "serialization_error",
            Self::ConcurrentWriteConflict(_) => "concurrent_write_conflict",
            Self::Io(_) => "io_error",
        }
    }
}

impl From<serde_json::Error> for HpoError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, HpoError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_lock_conflicts_are_retryable() {
        let conflict = HpoError::ConcurrentWriteConflict("trial 3".to_string());
        assert!(conflict.is_retryable());
        assert_eq!(conflict.code(), "concurrent_write_conflict");

        let ended = HpoError::InvalidTransition {
            status: TrialStatus::Success,
            action: "start",
        };
        assert!(!ended.is_retryable());
        assert_eq!(ended.to_string(), "invalid transition: cannot start a success node");
    }

    #[test]
    fn json_errors_become_serialization_errors() {
        let err: HpoError = serde_json::from_str::<serde_json::Value>("{")
            .expect_err("truncated")
            .into();
        assert_eq!(err.code(), "serialization_error");
    }
}
