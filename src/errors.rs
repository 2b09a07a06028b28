//! Error taxonomy shared by every component.
//!
//! Every error carries a `kind`, an optional job UUID, and a human message.
//! `anyhow` is still used at binary boundaries (see `src/bin/*.rs`) to
//! collect context as it unwinds; internally, components return
//! `Result<T, JobletError>` so callers can match on `kind` to decide
//! CLI exit codes or RPC status mapping.

use uuid::Uuid;

/// The nine error kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    ResourceExhausted,
    IsolationSetup,
    UpstreamIo,
    Cancelled,
    Timeout,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "VALIDATION",
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::Conflict => "CONFLICT",
            ErrorKind::ResourceExhausted => "RESOURCE_EXHAUSTED",
            ErrorKind::IsolationSetup => "ISOLATION_SETUP",
            ErrorKind::UpstreamIo => "UPSTREAM_IO",
            ErrorKind::Cancelled => "CANCELLED",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::Internal => "INTERNAL",
        }
    }

    /// CLI exit code mapping: 0 success, 1 user error, 2 server error,
    /// 3 timeout, 4 not-found.
    pub fn exit_code(&self) -> i32 {
        match self {
            ErrorKind::Validation => 1,
            ErrorKind::NotFound => 4,
            ErrorKind::Timeout => 3,
            ErrorKind::Cancelled => 3,
            ErrorKind::Conflict
            | ErrorKind::ResourceExhausted
            | ErrorKind::IsolationSetup
            | ErrorKind::UpstreamIo
            | ErrorKind::Internal => 2,
        }
    }
}

/// The error type propagated through the core engine.
#[derive(Debug, thiserror::Error)]
pub struct JobletError {
    pub kind: ErrorKind,
    pub job_id: Option<Uuid>,
    pub message: String,
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl std::fmt::Display for JobletError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.job_id {
            Some(id) => write!(f, "{:?} (job {id}): {}", self.kind, self.message),
            None => write!(f, "{:?}: {}", self.kind, self.message),
        }
    }
}

impl JobletError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        JobletError {
            kind,
            job_id: None,
            message: message.into(),
            source: None,
        }
    }

    pub fn for_job(kind: ErrorKind, job_id: Uuid, message: impl Into<String>) -> Self {
        JobletError {
            kind,
            job_id: Some(job_id),
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(
        mut self,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, message)
    }

    pub fn resource_exhausted(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ResourceExhausted, message)
    }

    pub fn isolation_setup(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::IsolationSetup, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    pub fn upstream_io_err(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::new(ErrorKind::UpstreamIo, message).with_source(source)
    }

    /// Whether a caller may retry the exact same request and expect a
    /// different outcome.
    pub fn retryable(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::Timeout | ErrorKind::ResourceExhausted | ErrorKind::UpstreamIo
        )
    }
}

pub type Result<T> = std::result::Result<T, JobletError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_match_spec_table() {
        assert_eq!(ErrorKind::Validation.exit_code(), 1);
        assert_eq!(ErrorKind::Internal.exit_code(), 2);
        assert_eq!(ErrorKind::Timeout.exit_code(), 3);
        assert_eq!(ErrorKind::NotFound.exit_code(), 4);
    }

    #[test]
    fn upstream_io_is_retryable_but_validation_is_not() {
        assert!(JobletError::new(ErrorKind::UpstreamIo, "x").retryable());
        assert!(!JobletError::validation("x").retryable());
    }
}
