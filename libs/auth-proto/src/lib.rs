//! Generated gRPC types for the authentication core, plus the
//! hand-maintained `google.protobuf.Any` pack/unpack helpers for the wire
//! public-key payloads carried in `GetValidationKeySetResponse.key`.

pub mod dfr {
    pub mod auth {
        pub mod v1 {
            tonic::include_proto!("dfr.auth.v1");
        }
    }
}

pub use dfr::auth::v1::*;

use prost::Message;
use prost_types::Any;

const RSA_TYPE_URL: &str = "type.googleapis.com/dfr.auth.v1.RSA";
const EC_TYPE_URL: &str = "type.googleapis.com/dfr.auth.v1.EC";

pub fn pack_rsa(rsa: &RSA) -> Any {
    Any { type_url: RSA_TYPE_URL.to_string(), value: rsa.encode_to_vec() }
}

pub fn pack_ec(ec: &EC) -> Any {
    Any { type_url: EC_TYPE_URL.to_string(), value: ec.encode_to_vec() }
}

#[derive(Debug, Clone)]
pub enum WireKey {
    Rsa(RSA),
    Ec(EC),
}

#[derive(Debug, thiserror::Error)]
pub enum UnpackError {
    #[error("unknown message type: {0}")]
    UnknownType(String),
    #[error("malformed payload: {0}")]
    Decode(#[from] prost::DecodeError),
}

pub fn unpack(any: &Any) -> Result<WireKey, UnpackError> {
    match any.type_url.as_str() {
        RSA_TYPE_URL => Ok(WireKey::Rsa(RSA::decode(any.value.as_slice())?)),
        EC_TYPE_URL => Ok(WireKey::Ec(EC::decode(any.value.as_slice())?)),
        other => Err(UnpackError::UnknownType(other.to_string())),
    }
}

impl WireKey {
    pub fn pack(&self) -> Any {
        match self {
            WireKey::Rsa(rsa) => pack_rsa(rsa),
            WireKey::Ec(ec) => pack_ec(ec),
        }
    }
}
