use thiserror::Error;
use tonic::{Code, Status};

/// The error taxonomy every core component propagates. RPC boundaries map
/// these to status codes; most mappings are contextual (the same
/// `MalformedToken` means `permission_denied` in `SignOut` but
/// `failed_precondition` in `TranslateAccessToken`), so handlers usually map
/// explicitly at the call site rather than through `to_status`. `to_status`
/// exists for the cases that don't vary by call site (middleware, the
/// validator's refresh loop, background tasks).
#[derive(Debug, Error, Clone)]
pub enum AuthError {
    #[error("malformed token")]
    MalformedToken,

    #[error("invalid token type")]
    InvalidTokenType,

    #[error("invalid algorithm: {0}")]
    InvalidAlgorithm(String),

    #[error("algorithm not supported: {0}")]
    AlgorithmNotSupported(String),

    #[error("key not found")]
    KeyNotFound,

    #[error("keyset not ready")]
    KeysetNotReady,

    #[error("authentication failed")]
    AuthFailed,

    #[error("store failure: {0}")]
    StoreFailure(String),

    #[error("bus failure: {0}")]
    BusFailure(String),

    #[error("secret store failure: {0}")]
    SecretFailure(String),

    #[error("stream aborted")]
    StreamAborted,

    #[error("cancelled")]
    Cancelled,

    #[error("validation failed: {0}")]
    Validation(String),
}

impl AuthError {
    pub fn to_status(&self) -> Status {
        let code = match self {
            AuthError::MalformedToken
            | AuthError::InvalidTokenType
            | AuthError::InvalidAlgorithm(_)
            | AuthError::AlgorithmNotSupported(_)
            | AuthError::Validation(_) => Code::FailedPrecondition,
            AuthError::AuthFailed => Code::PermissionDenied,
            AuthError::KeyNotFound | AuthError::KeysetNotReady => Code::FailedPrecondition,
            AuthError::StoreFailure(_) | AuthError::BusFailure(_) | AuthError::SecretFailure(_) => Code::Internal,
            AuthError::StreamAborted => Code::Internal,
            AuthError::Cancelled => Code::Cancelled,
        };
        Status::new(code, self.to_string())
    }
}

impl From<AuthError> for Status {
    fn from(err: AuthError) -> Self {
        err.to_status()
    }
}

pub type Result<T> = std::result::Result<T, AuthError>;
