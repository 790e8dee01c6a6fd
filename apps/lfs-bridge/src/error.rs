use std::io;

use lfs_bridge_proto::ProtocolError;
use thiserror::Error;

use crate::bridge::BridgeError;
use crate::validate::ValidationError;

/// Failure categories the engine reasons about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidRequest,
    NotFound,
    AuthenticationRequired,
    RateLimited,
    HumanVerificationRequired,
    ServerError,
    Timeout,
    PoolExhausted,
    Integrity,
    Remote,
    Internal,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::NotFound => "not_found",
            ErrorKind::AuthenticationRequired => "authentication_required",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::HumanVerificationRequired => "human_verification_required",
            ErrorKind::ServerError => "server_error",
            ErrorKind::Timeout => "timeout",
            ErrorKind::PoolExhausted => "pool_exhausted",
            ErrorKind::Integrity => "integrity",
            ErrorKind::Remote => "remote",
            ErrorKind::Internal => "internal",
        }
    }

    /// Whether a caller may reasonably try again. Nothing in the adapter
    /// retries on its own.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::ServerError | ErrorKind::Timeout | ErrorKind::PoolExhausted
        )
    }

    pub fn is_temporary(self) -> bool {
        matches!(
            self,
            ErrorKind::RateLimited
                | ErrorKind::ServerError
                | ErrorKind::Timeout
                | ErrorKind::PoolExhausted
        )
    }
}

pub const CODE_INVALID_REQUEST: i32 = 400;
pub const CODE_AUTHENTICATION_REQUIRED: i32 = 401;
pub const CODE_HUMAN_VERIFICATION: i32 = 403;
pub const CODE_NOT_FOUND: i32 = 404;
pub const CODE_INTEGRITY: i32 = 422;
pub const CODE_RATE_LIMITED: i32 = 429;
pub const CODE_INTERNAL: i32 = 500;
pub const CODE_BAD_GATEWAY: i32 = 502;
pub const CODE_POOL_EXHAUSTED: i32 = 503;
pub const CODE_TIMEOUT: i32 = 504;

/// Object-scoped transfer failure. Backends translate every lower-level
/// failure into one of these before the engine sees it.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("invalid request: {0}")]
    Validation(#[from] ValidationError),
    #[error("object {0} not found")]
    NotFound(String),
    #[error(
        "authentication required: {0}; sign in with your credential provider and retry"
    )]
    AuthenticationRequired(String),
    #[error("rate limited by the remote store: {0}; wait a few minutes before retrying")]
    RateLimited(String),
    #[error(
        "human verification required: {0}; complete the verification in your browser and retry"
    )]
    HumanVerificationRequired(String),
    #[error("remote store error {code}: {message}")]
    Server { code: i32, message: String },
    #[error("storage bridge timed out: {0}")]
    Timeout(String),
    #[error("too many concurrent operations (limit {0})")]
    TooManyConcurrentOperations(usize),
    #[error("integrity check failed: {0}")]
    Integrity(String),
    #[error("remote store rejected the request ({code}): {message}")]
    Remote { code: i32, message: String },
    #[error("internal error: {0}")]
    Internal(String),
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl TransferError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TransferError::InvalidRequest(_) | TransferError::Validation(_) => {
                ErrorKind::InvalidRequest
            }
            TransferError::NotFound(_) => ErrorKind::NotFound,
            TransferError::AuthenticationRequired(_) => ErrorKind::AuthenticationRequired,
            TransferError::RateLimited(_) => ErrorKind::RateLimited,
            TransferError::HumanVerificationRequired(_) => ErrorKind::HumanVerificationRequired,
            TransferError::Server { .. } => ErrorKind::ServerError,
            TransferError::Timeout(_) => ErrorKind::Timeout,
            TransferError::TooManyConcurrentOperations(_) => ErrorKind::PoolExhausted,
            TransferError::Integrity(_) => ErrorKind::Integrity,
            TransferError::Remote { .. } => ErrorKind::Remote,
            TransferError::Internal(_) | TransferError::Io(_) => ErrorKind::Internal,
        }
    }

    pub fn code(&self) -> i32 {
        match self {
            TransferError::InvalidRequest(_) | TransferError::Validation(_) => CODE_INVALID_REQUEST,
            TransferError::NotFound(_) => CODE_NOT_FOUND,
            TransferError::AuthenticationRequired(_) => CODE_AUTHENTICATION_REQUIRED,
            TransferError::RateLimited(_) => CODE_RATE_LIMITED,
            TransferError::HumanVerificationRequired(_) => CODE_HUMAN_VERIFICATION,
            TransferError::Server { code, .. } | TransferError::Remote { code, .. } => *code,
            TransferError::Timeout(_) => CODE_TIMEOUT,
            TransferError::TooManyConcurrentOperations(_) => CODE_POOL_EXHAUSTED,
            TransferError::Integrity(_) => CODE_INTEGRITY,
            TransferError::Internal(_) | TransferError::Io(_) => CODE_INTERNAL,
        }
    }

    pub fn to_protocol(&self) -> ProtocolError {
        ProtocolError::new(self.code(), self.to_string())
    }
}

impl From<BridgeError> for TransferError {
    fn from(err: BridgeError) -> Self {
        match err {
            BridgeError::TooManyConcurrentOperations { limit } => {
                TransferError::TooManyConcurrentOperations(limit)
            }
            BridgeError::Timeout { .. } => TransferError::Timeout(err.to_string()),
            BridgeError::Spawn { .. } | BridgeError::Io(_) | BridgeError::MalformedOutput(_) => {
                TransferError::Internal(err.to_string())
            }
            BridgeError::Remote {
                code,
                error,
                details,
                ..
            } => classify_remote(code, error, details),
        }
    }
}

fn classify_remote(code: i64, error: String, details: String) -> TransferError {
    let message = if details.is_empty() {
        error
    } else {
        format!("{error} ({details})")
    };
    let code = i32::try_from(code).unwrap_or(CODE_BAD_GATEWAY);
    match code {
        400 | 422 => TransferError::InvalidRequest(message),
        401 => TransferError::AuthenticationRequired(message),
        403 => TransferError::HumanVerificationRequired(message),
        404 => TransferError::NotFound(message),
        408 | 504 => TransferError::Timeout(message),
        429 => TransferError::RateLimited(message),
        500..=599 => TransferError::Server { code, message },
        _ => TransferError::Remote { code, message },
    }
}
