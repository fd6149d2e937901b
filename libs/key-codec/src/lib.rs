//! PEM ↔ runtime key, and runtime public key ↔ wire public-key message, for
//! RSA and ECDSA (P-256/P-384/P-521).

use auth_entity::{AuthError, EcdsaCurve, EcdsaPrivateKey, Key, KeyAlgorithm, KeyMaterial, KeyType};
use auth_proto::{ECType, EC, RSA};
use base64::Engine;
use rsa::pkcs1::{DecodeRsaPrivateKey, EncodeRsaPrivateKey};
use rsa::traits::PublicKeyParts;
use rsa::{BigUint, RsaPrivateKey, RsaPublicKey};

const RSA_PEM_TAG: &str = "RSA PRIVATE KEY";
const EC_PEM_TAG: &str = "EC PRIVATE KEY";

const B64: base64::engine::GeneralPurpose = base64::engine::general_purpose::URL_SAFE_NO_PAD;

/// Parse a PEM-encoded private key for the given algorithm into runtime key
/// material. `Hs256` always fails with `AlgorithmNotSupported`; anything
/// else unrecognized fails with `InvalidAlgorithm`.
pub fn decode_private(algorithm: KeyAlgorithm, pem_str: &str) -> Result<KeyMaterial, AuthError> {
    match algorithm {
        KeyAlgorithm::Rs256 => decode_rsa_private(pem_str).map(|k| KeyMaterial::Rsa(Box::new(k))),
        KeyAlgorithm::Es256 => decode_ecdsa_private(pem_str).map(KeyMaterial::Ecdsa),
        KeyAlgorithm::Hs256 => Err(AuthError::AlgorithmNotSupported("HS256".to_string())),
    }
}

fn decode_rsa_private(pem_str: &str) -> Result<RsaPrivateKey, AuthError> {
    let block = pem::parse(pem_str).map_err(|_| AuthError::InvalidAlgorithm("malformed PEM".to_string()))?;
    if block.tag() != RSA_PEM_TAG {
        return Err(AuthError::InvalidAlgorithm(format!("unexpected PEM tag: {}", block.tag())));
    }
    RsaPrivateKey::from_pkcs1_der(block.contents())
        .map_err(|e| AuthError::InvalidAlgorithm(format!("RSA key parse failed: {e}")))
}

fn decode_ecdsa_private(pem_str: &str) -> Result<EcdsaPrivateKey, AuthError> {
    let block = pem::parse(pem_str).map_err(|_| AuthError::InvalidAlgorithm("malformed PEM".to_string()))?;
    if block.tag() != EC_PEM_TAG {
        return Err(AuthError::InvalidAlgorithm(format!("unexpected PEM tag: {}", block.tag())));
    }

    // The curve isn't known ahead of time (the JOSE `alg` tag is just
    // "ES256" regardless of curve), so try each supported curve's SEC1
    // parser in turn; each rejects DER that doesn't match its own curve OID.
    if let Ok(key) = p256::SecretKey::from_sec1_der(block.contents()) {
        return Ok(EcdsaPrivateKey::P256(Box::new(key)));
    }
    if let Ok(key) = p384::SecretKey::from_sec1_der(block.contents()) {
        return Ok(EcdsaPrivateKey::P384(Box::new(key)));
    }
    if let Ok(key) = p521::SecretKey::from_sec1_der(block.contents()) {
        return Ok(EcdsaPrivateKey::P521(Box::new(key)));
    }
    Err(AuthError::InvalidAlgorithm("unrecognized EC curve".to_string()))
}

/// Re-encode a private key as PEM, for the key manager's secret-store writes.
pub fn encode_private_pem(material: &KeyMaterial) -> Result<String, AuthError> {
    match material {
        KeyMaterial::Rsa(key) => key
            .to_pkcs1_pem(rsa::pkcs8::LineEnding::LF)
            .map(|p| p.to_string())
            .map_err(|e| AuthError::InvalidAlgorithm(format!("RSA PEM encode failed: {e}"))),
        KeyMaterial::Ecdsa(ec) => encode_ecdsa_private_pem(ec),
        KeyMaterial::Hmac(_) => Err(AuthError::AlgorithmNotSupported("HS256 keys are not stored".to_string())),
    }
}

fn encode_ecdsa_private_pem(ec: &EcdsaPrivateKey) -> Result<String, AuthError> {
    match ec {
        EcdsaPrivateKey::P256(key) => key
            .to_sec1_pem(elliptic_curve::pkcs8::LineEnding::LF)
            .map(|p| p.to_string())
            .map_err(|e| AuthError::InvalidAlgorithm(format!("EC PEM encode failed: {e}"))),
        EcdsaPrivateKey::P384(key) => key
            .to_sec1_pem(elliptic_curve::pkcs8::LineEnding::LF)
            .map(|p| p.to_string())
            .map_err(|e| AuthError::InvalidAlgorithm(format!("EC PEM encode failed: {e}"))),
        EcdsaPrivateKey::P521(key) => key
            .to_sec1_pem(elliptic_curve::pkcs8::LineEnding::LF)
            .map(|p| p.to_string())
            .map_err(|e| AuthError::InvalidAlgorithm(format!("EC PEM encode failed: {e}"))),
    }
}

/// Encode an RSA public key as the wire `RSA{n, e}` message.
pub fn encode_public_rsa(public_key: &RsaPublicKey) -> RSA {
    let n = B64.encode(public_key.n().to_bytes_be());
    let e_bytes = public_key.e().to_bytes_be();
    // Pad to a 4-byte big-endian unsigned integer, the wire convention this
    // implementation picks for the non-shortcut case.
    let mut buf = [0u8; 4];
    let start = 4usize.saturating_sub(e_bytes.len());
    buf[start..].copy_from_slice(&e_bytes[e_bytes.len().saturating_sub(4)..]);
    let e = B64.encode(buf);
    RSA { n, e }
}

/// Decode the wire `RSA{n, e}` message back into a public key. Accepts both
/// the 4-byte big-endian exponent and the conventional `"AQAB"`/`"AAEAAQ"`
/// shortcuts for 65537.
pub fn decode_public_rsa(wire: &RSA) -> Result<RsaPublicKey, AuthError> {
    let n_bytes = B64.decode(&wire.n).map_err(|_| AuthError::MalformedToken)?;
    let n = BigUint::from_bytes_be(&n_bytes);

    let e = if wire.e == "AQAB" || wire.e == "AAEAAQ" {
        BigUint::from(65537u32)
    } else {
        let e_bytes = B64.decode(&wire.e).map_err(|_| AuthError::MalformedToken)?;
        BigUint::from_bytes_be(&e_bytes)
    };

    RsaPublicKey::new(n, e).map_err(|e| AuthError::InvalidAlgorithm(format!("invalid RSA public key: {e}")))
}

/// Encode an ECDSA public key as the wire `EC{crv, x, y}` message.
pub fn encode_public_ecdsa_p256(public_key: &p256::PublicKey) -> EC {
    encode_ec_point(ECType::P256, public_key.to_encoded_point(false))
}

pub fn encode_public_ecdsa_p384(public_key: &p384::PublicKey) -> EC {
    encode_ec_point(ECType::P384, public_key.to_encoded_point(false))
}

pub fn encode_public_ecdsa_p521(public_key: &p521::PublicKey) -> EC {
    encode_ec_point(ECType::P521, public_key.to_encoded_point(false))
}

fn encode_ec_point<C>(crv: ECType, point: elliptic_curve::sec1::EncodedPoint<C>) -> EC
where
    C: elliptic_curve::Curve + elliptic_curve::sec1::ModulusSize,
{
    let x = point.x().map(|x| B64.encode(x)).unwrap_or_default();
    let y = point.y().map(|y| B64.encode(y)).unwrap_or_default();
    EC { crv: crv as i32, x, y }
}

/// The decoded form of an `EC` wire message: curve tag plus raw coordinates.
pub enum DecodedEcdsaPublic {
    P256(Box<p256::PublicKey>),
    P384(Box<p384::PublicKey>),
    P521(Box<p521::PublicKey>),
}

pub fn decode_public_ecdsa(wire: &EC) -> Result<DecodedEcdsaPublic, AuthError> {
    use elliptic_curve::generic_array::GenericArray;

    let x = B64.decode(&wire.x).map_err(|_| AuthError::MalformedToken)?;
    let y = B64.decode(&wire.y).map_err(|_| AuthError::MalformedToken)?;

    match ECType::try_from(wire.crv).unwrap_or(ECType::Undefined) {
        ECType::Undefined => Err(AuthError::InvalidAlgorithm("curve undefined".to_string())),
        ECType::P256 => {
            let point = p256::EncodedPoint::from_affine_coordinates(
                GenericArray::from_slice(&x),
                GenericArray::from_slice(&y),
                false,
            );
            p256::PublicKey::from_encoded_point(&point)
                .into_option()
                .map(|k| DecodedEcdsaPublic::P256(Box::new(k)))
                .ok_or_else(|| AuthError::InvalidAlgorithm("invalid P-256 point".to_string()))
        }
        ECType::P384 => {
            let point = p384::EncodedPoint::from_affine_coordinates(
                GenericArray::from_slice(&x),
                GenericArray::from_slice(&y),
                false,
            );
            p384::PublicKey::from_encoded_point(&point)
                .into_option()
                .map(|k| DecodedEcdsaPublic::P384(Box::new(k)))
                .ok_or_else(|| AuthError::InvalidAlgorithm("invalid P-384 point".to_string()))
        }
        ECType::P521 => {
            let point = p521::EncodedPoint::from_affine_coordinates(
                GenericArray::from_slice(&x),
                GenericArray::from_slice(&y),
                false,
            );
            p521::PublicKey::from_encoded_point(&point)
                .into_option()
                .map(|k| DecodedEcdsaPublic::P521(Box::new(k)))
                .ok_or_else(|| AuthError::InvalidAlgorithm("invalid P-521 point".to_string()))
        }
    }
}

/// Generate a fresh 2048-bit RSA keypair, as the key manager's refresh cycle
/// does for every new pool entry.
pub fn generate_rsa(id: impl Into<String>) -> Result<Key, AuthError> {
    let mut rng = rand::rngs::OsRng;
    let private = RsaPrivateKey::new(&mut rng, 2048).map_err(|e| AuthError::SecretFailure(format!("RSA generation failed: {e}")))?;
    Ok(Key::new(id, KeyType::Rsa, KeyAlgorithm::Rs256, KeyMaterial::Rsa(Box::new(private))))
}

/// Generate a fresh P-256 ECDSA keypair, as the key manager's refresh cycle does.
pub fn generate_ecdsa_p256(id: impl Into<String>) -> Key {
    let mut rng = rand::rngs::OsRng;
    let secret = p256::SecretKey::random(&mut rng);
    Key::new(id, KeyType::Ecdsa, KeyAlgorithm::Es256, KeyMaterial::Ecdsa(EcdsaPrivateKey::P256(Box::new(secret))))
}

/// Encode a `Key`'s public half as the wire message from §4.2, dispatching
/// on its material variant.
pub fn encode_public(key: &Key) -> Result<auth_proto::WireKey, AuthError> {
    match &key.material {
        KeyMaterial::Rsa(private) => Ok(auth_proto::WireKey::Rsa(encode_public_rsa(&private.to_public_key()))),
        KeyMaterial::Ecdsa(EcdsaPrivateKey::P256(private)) => {
            Ok(auth_proto::WireKey::Ec(encode_public_ecdsa_p256(&private.public_key())))
        }
        KeyMaterial::Ecdsa(EcdsaPrivateKey::P384(private)) => {
            Ok(auth_proto::WireKey::Ec(encode_public_ecdsa_p384(&private.public_key())))
        }
        KeyMaterial::Ecdsa(EcdsaPrivateKey::P521(private)) => {
            Ok(auth_proto::WireKey::Ec(encode_public_ecdsa_p521(&private.public_key())))
        }
        KeyMaterial::Hmac(_) => Err(AuthError::AlgorithmNotSupported("HS256 has no public half".to_string())),
    }
}

pub fn curve_of(material: &KeyMaterial) -> Option<EcdsaCurve> {
    match material {
        KeyMaterial::Ecdsa(ec) => Some(ec.curve()),
        _ => None,
    }
}
