use std::fmt::Write;
use thiserror::Error;

/// Formats an error and its entire source chain with each error on a new line
///
/// This produces output like:
/// ```
/// Error message
///   Caused by: First cause
///   Caused by: Second cause
///   Caused by: Root cause
/// ```
pub fn format_error_chain(err: &dyn std::error::Error) -> String {
    let mut output = String::new();
    write!(&mut output, "{}", err).ok();

    let mut source = err.source();
    while let Some(err) = source {
        write!(&mut output, "\n  Caused by: {}", err).ok();
        source = err.source();
    }

    output
}

/// Formats an anyhow::Error with its full chain
pub fn format_anyhow_chain(err: &anyhow::Error) -> String {
    let mut output = String::new();

    let chain: Vec<_> = err.chain().collect();

    if let Some((first, rest)) = chain.split_first() {
        write!(&mut output, "{}", first).ok();
        for cause in rest {
            write!(&mut output, "\n  Caused by: {}", cause).ok();
        }
    }

    output
}

/// Central application error type
#[derive(Error, Debug)]
pub enum AppError {
    /// Kubernetes-related errors
    #[error("Kubernetes error: {0}")]
    Kubernetes(#[from] kube::Error),

    #[error("Kubernetes config error: {0}")]
    KubernetesConfig(String),

    /// Credential exchange failures while building remote-cluster clients
    #[error("Credential exchange error: {0}")]
    CredentialExchange(String),

    /// A cluster or endpoint could not be reached
    #[error("Unreachable: {0}")]
    Unreachable(String),

    /// A call exceeded its deadline
    #[error("Timed out: {0}")]
    Timeout(String),

    /// HTTP client errors
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization/Deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Environment variable error: {0}")]
    EnvVar(#[from] std::env::VarError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal errors with context
    #[error("Internal error: {0}")]
    Internal(String),

    /// Not found errors
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid input errors
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

/// Convenience type alias for Results using AppError
pub type AppResult<T> = Result<T, AppError>;

/// Coarse classification used by the reconcilers and the client factory to
/// pick a retry strategy. Every error maps to exactly one category.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Input violates an invariant; surfaced as a condition, not retried
    Validation,
    /// Optimistic-concurrency mismatch; re-read and retry without backoff
    Conflict,
    /// Network/unreachable/timeout; retried with exponential backoff
    Transient,
    /// Credentials expired or revoked; invalidates cached clients
    Unauthorized,
    /// A referenced record is absent
    NotFound,
    /// Programmer error or corrupt state; left for human intervention
    Fatal,
}

impl ErrorCategory {
    /// Stable label for logs and metrics
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCategory::Validation => "validation",
            ErrorCategory::Conflict => "conflict",
            ErrorCategory::Transient => "transient",
            ErrorCategory::Unauthorized => "unauthorized",
            ErrorCategory::NotFound => "not_found",
            ErrorCategory::Fatal => "fatal",
        }
    }
}

impl AppError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            AppError::Kubernetes(kube::Error::Api(e)) => match e.code {
                401 | 403 => ErrorCategory::Unauthorized,
                404 | 410 => ErrorCategory::NotFound,
                409 => ErrorCategory::Conflict,
                422 => ErrorCategory::Validation,
                _ => ErrorCategory::Transient,
            },
            AppError::Kubernetes(_) => ErrorCategory::Transient,
            AppError::Http(e) => match e.status() {
                Some(code) if code.as_u16() == 401 || code.as_u16() == 403 => {
                    ErrorCategory::Unauthorized
                }
                _ => ErrorCategory::Transient,
            },
            AppError::Unreachable(_) | AppError::Timeout(_) => ErrorCategory::Transient,
            AppError::CredentialExchange(_) => ErrorCategory::Unauthorized,
            AppError::InvalidInput(_) => ErrorCategory::Validation,
            AppError::NotFound(_) => ErrorCategory::NotFound,
            AppError::KubernetesConfig(_)
            | AppError::Json(_)
            | AppError::Yaml(_)
            | AppError::Config(_)
            | AppError::EnvVar(_)
            | AppError::Io(_)
            | AppError::Internal(_) => ErrorCategory::Fatal,
        }
    }

    pub fn is_conflict(&self) -> bool {
        self.category() == ErrorCategory::Conflict
    }

    pub fn is_not_found(&self) -> bool {
        self.category() == ErrorCategory::NotFound
    }

    pub fn is_unauthorized(&self) -> bool {
        self.category() == ErrorCategory::Unauthorized
    }
}

// Implement From for common error types that don't have automatic conversion
impl From<String> for AppError {
    fn from(s: String) -> Self {
        AppError::Internal(s)
    }
}

impl From<&str> for AppError {
    fn from(s: &str) -> Self {
        AppError::Internal(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(code: u16) -> AppError {
        AppError::Kubernetes(kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: "test".to_string(),
            reason: "test".to_string(),
            code,
        }))
    }

    #[test]
    fn api_status_codes_map_to_categories() {
        assert_eq!(api_error(401).category(), ErrorCategory::Unauthorized);
        assert_eq!(api_error(403).category(), ErrorCategory::Unauthorized);
        assert_eq!(api_error(404).category(), ErrorCategory::NotFound);
        assert_eq!(api_error(409).category(), ErrorCategory::Conflict);
        assert_eq!(api_error(422).category(), ErrorCategory::Validation);
        assert_eq!(api_error(500).category(), ErrorCategory::Transient);
        assert_eq!(api_error(503).category(), ErrorCategory::Transient);
    }

    #[test]
    fn conflict_predicate_matches_409_only() {
        assert!(api_error(409).is_conflict());
        assert!(!api_error(404).is_conflict());
        assert!(!AppError::Internal("x".to_string()).is_conflict());
    }

    #[test]
    fn validation_and_fatal_are_not_retried_categories() {
        assert_eq!(
            AppError::InvalidInput("bad version".to_string()).category(),
            ErrorCategory::Validation
        );
        assert_eq!(
            AppError::Config("missing".to_string()).category(),
            ErrorCategory::Fatal
        );
    }

    #[test]
    fn error_chain_is_flattened_line_by_line() {
        let io = std::io::Error::other("root cause");
        let err = AppError::Io(io);
        let chain = format_error_chain(&err);
        assert!(chain.starts_with("I/O error:"));
    }
}
