//! Opaque token codec: checksummed, prefixed, base64-encoded random strings
//! that index a server-side token record without carrying any claims of
//! their own.
//!
//! Wire format: `<prefix>_<base64url(seed + "_" + lower-hex(crc32_ieee(seed)))>`

use auth_entity::AuthError;
use base64::Engine;
use rand::Rng;

const SEED_LEN: usize = 16;
const SEED_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

/// The two credential kinds an opaque token can encode. Distinct from
/// `auth_entity::TokenType` because the wire prefix is a codec-level
/// concern, not a data-model one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpaquePrefix {
    Refresh,
    Access,
}

impl OpaquePrefix {
    fn as_str(self) -> &'static str {
        match self {
            OpaquePrefix::Refresh => "dfr",
            OpaquePrefix::Access => "dfa",
        }
    }

    pub fn parse(s: &str) -> Result<Self, AuthError> {
        match s {
            "dfr" => Ok(OpaquePrefix::Refresh),
            "dfa" => Ok(OpaquePrefix::Access),
            _ => Err(AuthError::InvalidTokenType),
        }
    }
}

impl From<auth_entity::TokenType> for OpaquePrefix {
    fn from(t: auth_entity::TokenType) -> Self {
        match t {
            auth_entity::TokenType::Refresh => OpaquePrefix::Refresh,
            auth_entity::TokenType::Access => OpaquePrefix::Access,
        }
    }
}

fn random_seed() -> String {
    let mut rng = rand::rngs::OsRng;
    (0..SEED_LEN)
        .map(|_| {
            let idx = rng.gen_range(0..SEED_ALPHABET.len());
            SEED_ALPHABET[idx] as char
        })
        .collect()
}

fn checksum_hex(seed: &str) -> String {
    format!("{:x}", crc32fast::hash(seed.as_bytes()))
}

/// Generate a fresh opaque token of the given kind. Returns `(encoded, seed)`;
/// `seed` is also the server-side record id.
pub fn generate(prefix: OpaquePrefix) -> (String, String) {
    let seed = random_seed();
    let payload = format!("{}_{}", seed, checksum_hex(&seed));
    let encoded = base64::engine::general_purpose::URL_SAFE.encode(payload.as_bytes());
    (format!("{}_{}", prefix.as_str(), encoded), seed)
}

/// Decode and validate an opaque token, returning its seed.
pub fn decode(expected_prefix: OpaquePrefix, encoded: &str) -> Result<String, AuthError> {
    let want_prefix = format!("{}_", expected_prefix.as_str());
    let prefix_bytes = match encoded.as_bytes().get(..4) {
        Some(bytes) => bytes,
        None => return Err(AuthError::MalformedToken),
    };
    if prefix_bytes != want_prefix.as_bytes() {
        return Err(AuthError::MalformedToken);
    }

    // `prefix_bytes` matched an ASCII-only prefix, so byte offset 4 is a char boundary.
    let rest = &encoded[4..];
    let decoded = base64::engine::general_purpose::URL_SAFE
        .decode(rest)
        .map_err(|_| AuthError::MalformedToken)?;
    let decoded = String::from_utf8(decoded).map_err(|_| AuthError::MalformedToken)?;

    let (seed, suffix) = decoded.split_once('_').ok_or(AuthError::MalformedToken)?;
    if suffix != checksum_hex(seed) {
        return Err(AuthError::MalformedToken);
    }

    Ok(seed.to_string())
}
