//! Implements the five RPCs of `AuthService`. Status-code mapping is mostly
//! contextual rather than going through `AuthError::to_status`: the same
//! underlying failure means a different code depending on which call it
//! surfaced from.

use std::pin::Pin;
use std::sync::Arc;

use auth_entity::{Filter, Token, TokenType};
use auth_proto::auth_service_server::AuthService;
use auth_proto::{
    GetAccessTokenRequest, GetAccessTokenResponse, GetValidationKeySetRequest, GetValidationKeySetResponse,
    SignInRequest, SignInResponse, SignOutRequest, SignOutResponse, TranslateAccessTokenRequest,
    TranslateAccessTokenResponse,
};
use chrono::Utc;
use futures_util::Stream;
use key_manager::KeyManager;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status, Streaming};
use tracing::{info, warn};
use user_directory::{UserDirectory, UserIdentifier};

use crate::validators::{non_empty, validate_email};

const STREAM_CHANNEL_CAPACITY: usize = 16;

pub struct TlsPeerCheck {
    pub expected_common_name: String,
}

#[derive(Clone)]
pub struct AuthServer {
    store: Arc<dyn token_store::Store>,
    key_manager: Arc<KeyManager>,
    user_directory: Arc<dyn UserDirectory>,
    issuer: String,
    refresh_token_ttl: chrono::Duration,
    access_token_ttl: chrono::Duration,
    tls_peer_check: Option<Arc<TlsPeerCheck>>,
}

impl AuthServer {
    pub fn new(
        store: Arc<dyn token_store::Store>,
        key_manager: Arc<KeyManager>,
        user_directory: Arc<dyn UserDirectory>,
        issuer: String,
        refresh_token_ttl: chrono::Duration,
        access_token_ttl: chrono::Duration,
        tls_peer_check: Option<TlsPeerCheck>,
    ) -> Self {
        Self {
            store,
            key_manager,
            user_directory,
            issuer,
            refresh_token_ttl,
            access_token_ttl,
            tls_peer_check: tls_peer_check.map(Arc::new),
        }
    }

    /// Reads the peer's leaf certificate off the TLS connection info tonic
    /// attaches to a request and re-encodes it as PEM for `grpc_tls`.
    fn peer_certificate_pem<T>(request: &Request<T>) -> Option<String> {
        let certs = request.peer_certs()?;
        let der = certs.first()?.clone().into_inner();
        let pem = pem::Pem::new("CERTIFICATE", der);
        Some(pem::encode(&pem))
    }

    fn check_tls_peer<T>(&self, request: &Request<T>) -> Result<(), Status> {
        let Some(check) = &self.tls_peer_check else { return Ok(()) };
        let pem = Self::peer_certificate_pem(request)
            .ok_or_else(|| Status::unauthenticated("no client certificate presented"))?;
        let peer = grpc_tls::PeerCertificate { pem };
        grpc_tls::check_peer(&peer, &check.expected_common_name)
            .map_err(|e| Status::unauthenticated(format!("peer certificate rejected: {e}")))
    }
}

type ResponseStream<T> = Pin<Box<dyn Stream<Item = Result<T, Status>> + Send + 'static>>;

#[tonic::async_trait]
impl AuthService for AuthServer {
    async fn sign_in(&self, request: Request<SignInRequest>) -> Result<Response<SignInResponse>, Status> {
        let req = request.into_inner();

        if !validate_email(&req.email) {
            return Err(Status::failed_precondition("malformed email"));
        }
        if !non_empty(&req.password) {
            return Err(Status::failed_precondition("password must not be empty"));
        }

        let secret = self
            .user_directory
            .get_secret(UserIdentifier::Email(req.email))
            .await
            .map_err(|e| Status::failed_precondition(format!("user lookup failed: {e}")))?;

        let matches = bcrypt::verify(&req.password, &secret.password_hash)
            .map_err(|e| Status::failed_precondition(format!("credential check failed: {e}")))?;
        if !matches {
            return Err(Status::failed_precondition("invalid credentials"));
        }

        let (encoded, seed) = token_manager::generate_opaque(TokenType::Refresh);
        let token = Token::new(seed, secret.id, TokenType::Refresh, Utc::now(), self.refresh_token_ttl);
        self.store.create(&token).await.map_err(|e| Status::internal(e.to_string()))?;

        Ok(Response::new(SignInResponse { refresh_token: encoded }))
    }

    async fn sign_out(&self, request: Request<SignOutRequest>) -> Result<Response<SignOutResponse>, Status> {
        let req = request.into_inner();

        if !non_empty(&req.refresh_token) {
            return Err(Status::failed_precondition("refresh_token must not be empty"));
        }

        let seed = token_manager::decode_opaque(TokenType::Refresh, &req.refresh_token)
            .map_err(|e| Status::permission_denied(e.to_string()))?;
        let token = self.store.get(&seed).await.map_err(|e| Status::permission_denied(e.to_string()))?;

        let user_tokens = self
            .store
            .get_multiple(&Filter::user_id_eq(&token.user_id))
            .await
            .map_err(|e| Status::internal(e.to_string()))?;

        for t in &user_tokens {
            self.store.delete(&t.id).await.map_err(|e| Status::internal(e.to_string()))?;
        }

        info!(user_id = %token.user_id, cascaded = user_tokens.len(), "signed out, cascaded token deletion");
        Ok(Response::new(SignOutResponse {}))
    }

    async fn get_access_token(
        &self,
        request: Request<GetAccessTokenRequest>,
    ) -> Result<Response<GetAccessTokenResponse>, Status> {
        let req = request.into_inner();

        if !non_empty(&req.refresh_token) {
            return Err(Status::failed_precondition("refresh_token must not be empty"));
        }

        let seed = token_manager::decode_opaque(TokenType::Refresh, &req.refresh_token)
            .map_err(|e| Status::permission_denied(e.to_string()))?;
        let refresh = self.store.get(&seed).await.map_err(|e| Status::internal(e.to_string()))?;

        let (encoded, new_seed) = token_manager::generate_opaque(TokenType::Access);
        let access = Token::new(new_seed, refresh.user_id.clone(), TokenType::Access, Utc::now(), self.access_token_ttl);
        self.store.create(&access).await.map_err(|e| Status::internal(e.to_string()))?;

        Ok(Response::new(GetAccessTokenResponse { access_token: encoded }))
    }

    type TranslateAccessTokenStream = ResponseStream<TranslateAccessTokenResponse>;

    async fn translate_access_token(
        &self,
        request: Request<Streaming<TranslateAccessTokenRequest>>,
    ) -> Result<Response<Self::TranslateAccessTokenStream>, Status> {
        self.check_tls_peer(&request)?;

        let mut inbound = request.into_inner();
        let store = self.store.clone();
        let key_manager = self.key_manager.clone();
        let issuer = self.issuer.clone();

        let (tx, rx) = tokio::sync::mpsc::channel(STREAM_CHANNEL_CAPACITY);

        tokio::spawn(async move {
            loop {
                let next = match inbound.message().await {
                    Ok(Some(req)) => req,
                    Ok(None) => return,
                    Err(e) => {
                        let _ = tx.send(Err(Status::aborted(format!("stream read failed: {e}")))).await;
                        return;
                    }
                };

                let response = translate_one(&store, &key_manager, &issuer, next).await;
                if tx.send(response).await.is_err() {
                    return;
                }
            }
        });

        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }

    type GetValidationKeySetStream = ResponseStream<GetValidationKeySetResponse>;

    async fn get_validation_key_set(
        &self,
        _request: Request<GetValidationKeySetRequest>,
    ) -> Result<Response<Self::GetValidationKeySetStream>, Status> {
        let key_manager = self.key_manager.clone();
        let (tx, rx) = tokio::sync::mpsc::channel(STREAM_CHANNEL_CAPACITY);

        tokio::spawn(async move {
            let keys = match key_manager.get_keyset().await {
                Ok(keys) => keys,
                Err(e) => {
                    let _ = tx.send(Err(Status::internal(e.to_string()))).await;
                    return;
                }
            };

            for key in keys {
                let wire = match key_codec::encode_public(&key) {
                    Ok(wire) => wire,
                    Err(e) => {
                        warn!(kid = %key.id, error = %e, "skipping unencodable key in keyset");
                        continue;
                    }
                };
                let response = GetValidationKeySetResponse {
                    kid: key.id.clone(),
                    kty: key.key_type.to_string(),
                    alg: key.algorithm.as_str().to_string(),
                    key: Some(wire.pack()),
                };
                if tx.send(Ok(response)).await.is_err() {
                    return;
                }
            }
        });

        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }
}

async fn translate_one(
    store: &Arc<dyn token_store::Store>,
    key_manager: &Arc<KeyManager>,
    issuer: &str,
    request: TranslateAccessTokenRequest,
) -> Result<TranslateAccessTokenResponse, Status> {
    if !non_empty(&request.opaque_access_token) {
        return Err(Status::failed_precondition("opaque_access_token must not be empty"));
    }

    let seed = token_manager::decode_opaque(TokenType::Access, &request.opaque_access_token)
        .map_err(|e| Status::failed_precondition(e.to_string()))?;
    let token = store.get(&seed).await.map_err(|e| Status::internal(e.to_string()))?;
    let key = key_manager.get_random().await.map_err(|e| Status::internal(e.to_string()))?;
    let jwt = token_manager::encode_jwt(&key, &token, issuer).map_err(|e| Status::internal(e.to_string()))?;

    Ok(TranslateAccessTokenResponse { access_token: jwt, metadata: request.metadata })
}
