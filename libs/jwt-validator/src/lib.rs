//! Caches the signing core's public keyset and verifies JWTs against it.
//! The cache is refreshed out of band: a miss or a bus notification signals
//! the refresh loop rather than blocking the caller on a network round trip.

use async_trait::async_trait;
use auth_entity::{AuthError, EcdsaPublicKey, KeyAlgorithm, TokenType, VerificationKey};
use event_bus::{Dispatcher, Envelope, KEYSET_UPDATED};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use token_manager::Claims;
use tokio::sync::{mpsc, RwLock};
use tracing::{info, warn};

/// One verification key as published by `GetValidationKeySet`.
#[derive(Clone)]
pub struct KeySetEntry {
    pub kid: String,
    pub algorithm: KeyAlgorithm,
    pub verification: VerificationKey,
}

/// Fetches the current keyset from wherever it lives. Production wires this
/// to the signing core's gRPC endpoint; tests supply a canned keyset.
#[async_trait]
pub trait KeySetSource: Send + Sync {
    async fn fetch(&self) -> Result<Vec<KeySetEntry>, AuthError>;
}

/// Fetches the keyset over the `GetValidationKeySet` server stream.
pub struct GrpcKeySetSource {
    client: auth_proto::auth_service_client::AuthServiceClient<tonic::transport::Channel>,
}

impl GrpcKeySetSource {
    pub fn new(client: auth_proto::auth_service_client::AuthServiceClient<tonic::transport::Channel>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl KeySetSource for GrpcKeySetSource {
    async fn fetch(&self) -> Result<Vec<KeySetEntry>, AuthError> {
        let mut client = self.client.clone();
        let mut stream = client
            .get_validation_key_set(auth_proto::GetValidationKeySetRequest {})
            .await
            .map_err(|e| AuthError::StoreFailure(format!("fetch keyset: {e}")))?
            .into_inner();

        let mut entries = Vec::new();
        while let Some(resp) = stream
            .message()
            .await
            .map_err(|e| AuthError::StoreFailure(format!("keyset stream: {e}")))?
        {
            let algorithm = KeyAlgorithm::parse(&resp.alg)
                .ok_or_else(|| AuthError::InvalidAlgorithm(resp.alg.clone()))?;
            let any = resp.key.ok_or(AuthError::MalformedToken)?;
            let wire = auth_proto::unpack(&any).map_err(|_| AuthError::MalformedToken)?;
            let verification = match wire {
                auth_proto::WireKey::Rsa(rsa) => {
                    VerificationKey::Rsa(Box::new(key_codec::decode_public_rsa(&rsa)?))
                }
                auth_proto::WireKey::Ec(ec) => match key_codec::decode_public_ecdsa(&ec)? {
                    key_codec::DecodedEcdsaPublic::P256(k) => VerificationKey::Ecdsa(EcdsaPublicKey::P256(k)),
                    key_codec::DecodedEcdsaPublic::P384(k) => VerificationKey::Ecdsa(EcdsaPublicKey::P384(k)),
                    key_codec::DecodedEcdsaPublic::P521(k) => VerificationKey::Ecdsa(EcdsaPublicKey::P521(k)),
                },
            };
            entries.push(KeySetEntry { kid: resp.kid, algorithm, verification });
        }
        Ok(entries)
    }
}

pub struct JwtValidatorConfig {
    pub issuer: String,
    /// Refreshes requested within this window of the last one are dropped,
    /// except for the very first refresh on startup.
    pub refresh_suppression_window: Duration,
}

impl JwtValidatorConfig {
    pub fn new(issuer: impl Into<String>) -> Self {
        Self { issuer: issuer.into(), refresh_suppression_window: Duration::from_secs(1) }
    }
}

struct State {
    keys: HashMap<String, KeySetEntry>,
    last_refreshed: Option<Instant>,
}

/// Cheap, cloneable handle used by request handlers to verify tokens and to
/// react to external keyset-invalidation signals. The refresh loop itself
/// lives on the paired `JwtValidatorRunner`.
pub struct JwtValidator {
    config: JwtValidatorConfig,
    state: RwLock<State>,
    expired_tx: mpsc::Sender<()>,
}

/// Owns the refresh loop. Spawn `run()` once at startup.
pub struct JwtValidatorRunner {
    validator: Arc<JwtValidator>,
    source: Arc<dyn KeySetSource>,
    expired_rx: mpsc::Receiver<()>,
}

impl JwtValidator {
    pub fn new(config: JwtValidatorConfig, source: Arc<dyn KeySetSource>) -> (Arc<Self>, JwtValidatorRunner) {
        let (expired_tx, expired_rx) = mpsc::channel(16);
        let validator = Arc::new(Self {
            config,
            state: RwLock::new(State { keys: HashMap::new(), last_refreshed: None }),
            expired_tx,
        });
        let runner = JwtValidatorRunner { validator: validator.clone(), source, expired_rx };
        (validator, runner)
    }

    /// Requests an out-of-band keyset refresh. Safe to call repeatedly; the
    /// runner collapses bursts via its suppression window.
    pub fn trigger_refresh(&self) {
        let _ = self.expired_tx.try_send(());
    }

    /// Verifies `jwt` against the cached keyset. A `kid` the cache doesn't
    /// recognize triggers a refresh and rejects this token; any other
    /// verification failure (signature, issuer, expiry, token type) rejects
    /// this token only and does not touch the cache.
    pub async fn verify_token(&self, jwt: &str) -> Result<Claims, AuthError> {
        let header = jsonwebtoken::decode_header(jwt).map_err(|_| AuthError::MalformedToken)?;
        let kid = header.kid.ok_or(AuthError::MalformedToken)?;

        let entry = {
            let state = self.state.read().await;
            state.keys.get(&kid).cloned()
        };

        let entry = match entry {
            Some(entry) => entry,
            None => {
                self.trigger_refresh();
                return Err(AuthError::KeysetNotReady);
            }
        };

        let decoding_key = decoding_key_for(&entry.verification)?;
        let mut validation = jsonwebtoken::Validation::new(jwt_algorithm(entry.algorithm));
        validation.set_issuer(&[self.config.issuer.clone()]);

        let data = jsonwebtoken::decode::<Claims>(jwt, &decoding_key, &validation)
            .map_err(|e| AuthError::Validation(e.to_string()))?;

        // jsonwebtoken's Validation has no iat check of its own (only exp/nbf/aud), so a
        // future-dated iat would otherwise sail through.
        let now = chrono::Utc::now().timestamp();
        if data.claims.iat > now {
            return Err(AuthError::Validation("token iat is in the future".to_string()));
        }

        if data.claims.token_type != TokenType::Access.claim_str() {
            return Err(AuthError::InvalidTokenType);
        }

        Ok(data.claims)
    }

    async fn fetch_keyset(&self, source: &dyn KeySetSource) -> Result<(), AuthError> {
        let entries = source.fetch().await?;
        let mut state = self.state.write().await;
        state.keys = entries.into_iter().map(|e| (e.kid.clone(), e)).collect();
        state.last_refreshed = Some(Instant::now());
        Ok(())
    }
}

impl JwtValidatorRunner {
    /// Refreshes the keyset on start, then blocks serving refresh requests
    /// until the channel closes (the validator handle was dropped).
    pub async fn run(mut self) {
        let _ = self.validator.expired_tx.try_send(());

        loop {
            match self.expired_rx.recv().await {
                Some(()) => {
                    let too_early = {
                        let state = self.validator.state.read().await;
                        match state.last_refreshed {
                            Some(last) => last.elapsed() < self.validator.config.refresh_suppression_window,
                            None => false,
                        }
                    };
                    if too_early {
                        continue;
                    }

                    if let Err(e) = self.validator.fetch_keyset(self.source.as_ref()).await {
                        warn!(error = %e, "failed to fetch a new keyset");
                    }
                }
                None => {
                    info!("shutting down jwt validator refresh loop");
                    return;
                }
            }
        }
    }
}

fn jwt_algorithm(algorithm: KeyAlgorithm) -> jsonwebtoken::Algorithm {
    match algorithm {
        KeyAlgorithm::Rs256 => jsonwebtoken::Algorithm::RS256,
        KeyAlgorithm::Es256 => jsonwebtoken::Algorithm::ES256,
        KeyAlgorithm::Hs256 => jsonwebtoken::Algorithm::HS256,
    }
}

fn decoding_key_for(verification: &VerificationKey) -> Result<jsonwebtoken::DecodingKey, AuthError> {
    match verification {
        VerificationKey::Hmac(secret) => Ok(jsonwebtoken::DecodingKey::from_secret(secret)),
        VerificationKey::Rsa(public) => {
            use rsa::pkcs1::EncodeRsaPublicKey;
            let pem = public
                .to_pkcs1_pem(rsa::pkcs8::LineEnding::LF)
                .map_err(|e| AuthError::InvalidAlgorithm(format!("RSA public PEM encode failed: {e}")))?;
            jsonwebtoken::DecodingKey::from_rsa_pem(pem.as_bytes())
                .map_err(|e| AuthError::InvalidAlgorithm(format!("bad RSA verification key: {e}")))
        }
        VerificationKey::Ecdsa(ec) => {
            use elliptic_curve::pkcs8::{EncodePublicKey, LineEnding};
            let pem = match ec {
                EcdsaPublicKey::P256(k) => k.to_public_key_pem(LineEnding::LF),
                EcdsaPublicKey::P384(k) => k.to_public_key_pem(LineEnding::LF),
                EcdsaPublicKey::P521(k) => k.to_public_key_pem(LineEnding::LF),
            }
            .map_err(|e| AuthError::InvalidAlgorithm(format!("EC public PEM encode failed: {e}")))?;
            jsonwebtoken::DecodingKey::from_ec_pem(pem.as_bytes())
                .map_err(|e| AuthError::InvalidAlgorithm(format!("bad EC verification key: {e}")))
        }
    }
}

/// Wires the validator's refresh trigger to the bus so it reacts to
/// `keyset_updated` without polling or waiting out its own cache TTL.
pub async fn register_keyset_updated_handler(
    dispatcher: &Dispatcher,
    validator: Arc<JwtValidator>,
) -> Result<(), event_bus::EventBusError> {
    dispatcher
        .register(
            KEYSET_UPDATED,
            Arc::new(move |_envelope: Envelope| {
                let validator = validator.clone();
                Box::pin(async move {
                    validator.trigger_refresh();
                })
            }),
        )
        .await
}
