use serde::{Deserialize, Serialize};

/// Key family. Consistent with `KeyAlgorithm` (e.g. `Rsa` always pairs with `Rs256`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyType {
    Rsa,
    Ecdsa,
}

impl std::fmt::Display for KeyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeyType::Rsa => f.write_str("RSA"),
            KeyType::Ecdsa => f.write_str("ECDSA"),
        }
    }
}

/// JOSE `alg` header values the core signs or verifies with. `Hs256` only
/// ever appears on a symmetric test key fed directly to the token manager or
/// validator in unit tests; the key manager never mints one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyAlgorithm {
    Rs256,
    Es256,
    Hs256,
}

impl KeyAlgorithm {
    pub fn as_str(self) -> &'static str {
        match self {
            KeyAlgorithm::Rs256 => "RS256",
            KeyAlgorithm::Es256 => "ES256",
            KeyAlgorithm::Hs256 => "HS256",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "RS256" => Some(KeyAlgorithm::Rs256),
            "ES256" => Some(KeyAlgorithm::Es256),
            "HS256" => Some(KeyAlgorithm::Hs256),
            _ => None,
        }
    }
}

impl std::fmt::Display for KeyAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The ECDSA curve a given EC key was generated on. The key manager only
/// ever mints `P256` keys; the other two remain decodable for interop with
/// keys minted elsewhere (see the wire `EC.crv` field in `key-codec`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EcdsaCurve {
    P256,
    P384,
    P521,
}

/// The private key material backing a `Key`, tagged by family. `key-codec`
/// dispatches wire encoding on this enum rather than on a stored function
/// pointer (there is no convenient Rust equivalent of a Go closure stored
/// alongside the value, and a match arm reads just as clearly).
#[derive(Clone)]
pub enum KeyMaterial {
    Rsa(Box<rsa::RsaPrivateKey>),
    Ecdsa(EcdsaPrivateKey),
    /// Raw HMAC secret. Never produced by the key manager; exists so the
    /// token manager and validator can be exercised against HS256 fixtures.
    Hmac(Vec<u8>),
}

#[derive(Clone)]
pub enum EcdsaPrivateKey {
    P256(Box<p256::SecretKey>),
    P384(Box<p384::SecretKey>),
    P521(Box<p521::SecretKey>),
}

impl EcdsaPrivateKey {
    pub fn curve(&self) -> EcdsaCurve {
        match self {
            EcdsaPrivateKey::P256(_) => EcdsaCurve::P256,
            EcdsaPrivateKey::P384(_) => EcdsaCurve::P384,
            EcdsaPrivateKey::P521(_) => EcdsaCurve::P521,
        }
    }
}

/// A signing key as held by the key manager's pool.
#[derive(Clone)]
pub struct Key {
    pub id: String,
    pub key_type: KeyType,
    pub algorithm: KeyAlgorithm,
    pub material: KeyMaterial,
}

impl Key {
    pub fn new(id: impl Into<String>, key_type: KeyType, algorithm: KeyAlgorithm, material: KeyMaterial) -> Self {
        Self { id: id.into(), key_type, algorithm, material }
    }
}

impl std::fmt::Debug for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Key")
            .field("id", &self.id)
            .field("key_type", &self.key_type)
            .field("algorithm", &self.algorithm)
            .finish_non_exhaustive()
    }
}

/// A verification (public) key as cached by the JWT validator. Distinct from
/// `Key` because the validator never holds private material.
#[derive(Clone)]
pub enum VerificationKey {
    Rsa(Box<rsa::RsaPublicKey>),
    Ecdsa(EcdsaPublicKey),
    Hmac(Vec<u8>),
}

#[derive(Clone)]
pub enum EcdsaPublicKey {
    P256(Box<p256::PublicKey>),
    P384(Box<p384::PublicKey>),
    P521(Box<p521::PublicKey>),
}
