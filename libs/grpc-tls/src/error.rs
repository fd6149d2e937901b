//! Errors for the peer-certificate check. TLS material loading and channel
//! bootstrap live outside this crate; this only covers SAN validation.

#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("failed to parse PEM: {0}")]
    Pem(#[from] pem::PemError),

    #[error("failed to parse certificate at {path}: {reason}")]
    CertificateParseError { path: String, reason: String },

    #[error("peer certificate SAN mismatch: expected one of [{expected}], got [{actual}]")]
    SanValidationError { expected: String, actual: String },
}

pub type TlsResult<T> = std::result::Result<T, TlsError>;
