//! Peer certificate check for incoming gRPC connections.
//!
//! TLS material loading and channel bootstrap are external collaborators;
//! this crate only answers one question: does the peer certificate on a
//! request carry the common/alternative name we expect.

pub mod cert_generation;
pub mod error;
pub mod san_validation;

pub use cert_generation::{generate_dev_certificates, CertificateBundle};
pub use error::{TlsError, TlsResult};
pub use san_validation::{extract_san_entries, validate_san, SanEntry};

/// Peer identity extracted from a tonic request's TLS connection info.
pub struct PeerCertificate {
    pub pem: String,
}

/// Given a request's peer certificate and the common name the caller
/// expects to see, returns `Ok(())` or a `TlsError` describing the mismatch.
pub fn check_peer(peer: &PeerCertificate, expected_common_name: &str) -> TlsResult<()> {
    validate_san(&peer.pem, std::slice::from_ref(&expected_common_name.to_string()))
}
