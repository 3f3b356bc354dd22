use std::io;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Failures surfaced by the process inventory and control operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The OS process table could not be read at all.
    #[error("process collection failed: {0}")]
    Collection(String),

    #[error("invalid query parameter `{field}`: {reason}")]
    InvalidQuery { field: &'static str, reason: String },

    #[error("process {pid} not found")]
    NotFound { pid: u32 },

    #[error("not permitted to signal process {pid}: {reason}")]
    Permission { pid: u32, reason: String },

    #[error("unsupported signal `{name}`")]
    UnsupportedSignal { name: String },

    /// kill(2) failed with an errno other than ESRCH/EPERM.
    #[error("failed to send {signal} to process {pid}: {source}")]
    SignalFailed {
        pid: u32,
        signal: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("configuration error: {0}")]
    Config(String),

    /// A background worker died before producing a result.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub(crate) fn invalid_query(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidQuery {
            field,
            reason: reason.into(),
        }
    }

    pub(crate) fn permission(pid: u32, reason: impl Into<String>) -> Self {
        Self::Permission {
            pid,
            reason: reason.into(),
        }
    }

    /// Stable identifier the transport layer maps to status codes.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Collection(_) => "collection_error",
            Self::InvalidQuery { .. } => "invalid_query",
            Self::NotFound { .. } => "not_found",
            Self::Permission { .. } => "permission_denied",
            Self::UnsupportedSignal { .. } => "unsupported_signal",
            Self::SignalFailed { .. } => "signal_failed",
            Self::Config(_) => "config_error",
            Self::Internal(_) => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_offending_input() {
        let err = Error::invalid_query("sort_by", "unknown field `rss`");
        assert_eq!(
            err.to_string(),
            "invalid query parameter `sort_by`: unknown field `rss`"
        );
        assert_eq!(Error::NotFound { pid: 42 }.to_string(), "process 42 not found");
        let err = Error::UnsupportedSignal {
            name: "SIGWINCH".to_string(),
        };
        assert!(err.to_string().contains("SIGWINCH"));
    }

    #[test]
    fn kinds_are_stable() {
        assert_eq!(Error::NotFound { pid: 1 }.kind(), "not_found");
        assert_eq!(Error::permission(1, "protected").kind(), "permission_denied");
        assert_eq!(Error::Collection("x".into()).kind(), "collection_error");
    }
}
