//! Composes the opaque codec with a JOSE builder/signer: the only component
//! that mints and parses the JWTs resource servers ultimately verify.

use auth_entity::{AuthError, Key, KeyAlgorithm, KeyMaterial, Token, TokenType};
use opaque_tokens::OpaquePrefix;
use serde::{Deserialize, Serialize};

/// Claims carried by every JWT this service mints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub iss: String,
    pub sub: String,
    pub jti: String,
    pub iat: i64,
    pub exp: i64,
    #[serde(rename = "type")]
    pub token_type: String,
}

/// `generate_opaque` / `decode_opaque` delegate straight to the opaque codec;
/// they exist on this crate's surface because the rest of the core only ever
/// reaches the codec through the token manager.
pub fn generate_opaque(token_type: TokenType) -> (String, String) {
    opaque_tokens::generate(token_type.into())
}

pub fn decode_opaque(token_type: TokenType, encoded: &str) -> Result<String, AuthError> {
    opaque_tokens::decode(token_type.into(), encoded)
}

fn jwt_algorithm(algorithm: KeyAlgorithm) -> Result<jsonwebtoken::Algorithm, AuthError> {
    match algorithm {
        KeyAlgorithm::Rs256 => Ok(jsonwebtoken::Algorithm::RS256),
        KeyAlgorithm::Es256 => Ok(jsonwebtoken::Algorithm::ES256),
        KeyAlgorithm::Hs256 => Ok(jsonwebtoken::Algorithm::HS256),
    }
}

fn encoding_key(material: &KeyMaterial) -> Result<jsonwebtoken::EncodingKey, AuthError> {
    match material {
        KeyMaterial::Hmac(secret) => Ok(jsonwebtoken::EncodingKey::from_secret(secret)),
        KeyMaterial::Rsa(_) | KeyMaterial::Ecdsa(_) => {
            let pem = key_codec::encode_private_pem(material)?;
            match material {
                KeyMaterial::Rsa(_) => jsonwebtoken::EncodingKey::from_rsa_pem(pem.as_bytes())
                    .map_err(|e| AuthError::InvalidAlgorithm(format!("bad RSA signing key: {e}"))),
                KeyMaterial::Ecdsa(_) => jsonwebtoken::EncodingKey::from_ec_pem(pem.as_bytes())
                    .map_err(|e| AuthError::InvalidAlgorithm(format!("bad EC signing key: {e}"))),
                KeyMaterial::Hmac(_) => unreachable!(),
            }
        }
    }
}

/// Sign a JWT for `token` using `key`, with header `{alg, kid, typ=JWT}` and
/// claims `{iss, sub, jti, iat, exp, type}`.
pub fn encode_jwt(key: &Key, token: &Token, issuer: &str) -> Result<String, AuthError> {
    let algorithm = jwt_algorithm(key.algorithm)?;

    let mut header = jsonwebtoken::Header::new(algorithm);
    header.kid = Some(key.id.clone());
    header.typ = Some("JWT".to_string());

    let claims = Claims {
        iss: issuer.to_string(),
        sub: token.user_id.clone(),
        jti: token.id.clone(),
        iat: token.issued_at.timestamp(),
        exp: token.expires_at.timestamp(),
        token_type: token.token_type.claim_str().to_string(),
    };

    let encoding_key = encoding_key(&key.material)?;
    jsonwebtoken::encode(&header, &claims, &encoding_key)
        .map_err(|e| AuthError::InvalidAlgorithm(format!("JWT signing failed: {e}")))
}
