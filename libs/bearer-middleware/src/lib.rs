//! Wraps a resource server's inner actix-web service: extracts a bearer
//! opaque access token, translates it through the signing core, and hands
//! the resulting JWT to the wrapped handler via the request extensions.

use actix_web::{
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    Error, HttpMessage,
};
use futures::future::{ready, Ready};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use translator_client::Translator;

/// Placed in request extensions on success; the wrapped handler reads it
/// out via `req.extensions().get::<TranslatedToken>()`.
#[derive(Debug, Clone)]
pub struct TranslatedToken {
    pub access_token: String,
    pub metadata: HashMap<String, String>,
}

pub struct BearerAuth {
    translator: Translator,
}

impl BearerAuth {
    pub fn new(translator: Translator) -> Self {
        Self { translator }
    }
}

impl<S, B> Transform<S, ServiceRequest> for BearerAuth
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Transform = BearerAuthMiddleware<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(BearerAuthMiddleware { service: Rc::new(service), translator: self.translator.clone() }))
    }
}

pub struct BearerAuthMiddleware<S> {
    service: Rc<S>,
    translator: Translator,
}

impl<S, B> Service<ServiceRequest> for BearerAuthMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>>>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let service = self.service.clone();
        let translator = self.translator.clone();

        Box::pin(async move {
            let opaque_access_token = extract_bearer_token(&req)?;

            let (access_token, metadata) = translator
                .translate(&opaque_access_token, HashMap::new())
                .await
                .map_err(|e| actix_web::error::ErrorUnauthorized(format!("token translation failed: {e}")))?;

            req.extensions_mut().insert(TranslatedToken { access_token, metadata });

            service.call(req).await
        })
    }
}

/// Requires exactly one `Authorization` header, prefixed `Bearer `, with a
/// non-empty token following it.
fn extract_bearer_token(req: &ServiceRequest) -> Result<String, actix_web::Error> {
    let mut headers = req.headers().get_all("Authorization");

    let first = headers
        .next()
        .ok_or_else(|| actix_web::error::ErrorUnauthorized("missing Authorization header"))?;

    if headers.next().is_some() {
        return Err(actix_web::error::ErrorUnauthorized("multiple Authorization headers"));
    }

    let value = first
        .to_str()
        .map_err(|_| actix_web::error::ErrorUnauthorized("malformed Authorization header"))?;

    let token = value
        .strip_prefix("Bearer ")
        .ok_or_else(|| actix_web::error::ErrorUnauthorized("Authorization header must be a Bearer token"))?;

    if token.is_empty() {
        return Err(actix_web::error::ErrorUnauthorized("empty bearer token"));
    }

    Ok(token.to_string())
}

/// `FromRequest` sugar so handlers can take `translated: TranslatedToken`
/// directly instead of reaching into the request extensions themselves.
impl actix_web::FromRequest for TranslatedToken {
    type Error = actix_web::Error;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &actix_web::HttpRequest, _payload: &mut actix_web::dev::Payload) -> Self::Future {
        match req.extensions().get::<TranslatedToken>() {
            Some(translated) => ready(Ok(translated.clone())),
            None => ready(Err(actix_web::error::ErrorUnauthorized("request was not translated"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{http::header, test, web, App, HttpResponse};
    use auth_proto::auth_service_client::AuthServiceClient;
    use auth_proto::auth_service_server::{AuthService, AuthServiceServer};
    use auth_proto::{
        GetAccessTokenRequest, GetAccessTokenResponse, GetValidationKeySetRequest, GetValidationKeySetResponse,
        SignInRequest, SignInResponse, SignOutRequest, SignOutResponse, TranslateAccessTokenRequest,
        TranslateAccessTokenResponse,
    };
    use futures_util::Stream;
    use std::pin::Pin as StdPin;
    use std::sync::Arc;
    use tokio::sync::mpsc;
    use tokio_stream::wrappers::{ReceiverStream, TcpListenerStream};
    use tonic::{Request, Response, Status, Streaming};
    use translator_client::TranslatorConfig;

    #[derive(Clone, Default)]
    struct EchoAuthService;

    type BoxStream<T> = StdPin<Box<dyn Stream<Item = Result<T, Status>> + Send + 'static>>;

    #[tonic::async_trait]
    impl AuthService for EchoAuthService {
        type TranslateAccessTokenStream = BoxStream<TranslateAccessTokenResponse>;
        type GetValidationKeySetStream = BoxStream<GetValidationKeySetResponse>;

        async fn sign_in(&self, _: Request<SignInRequest>) -> Result<Response<SignInResponse>, Status> {
            Err(Status::unimplemented("unused in this test"))
        }

        async fn sign_out(&self, _: Request<SignOutRequest>) -> Result<Response<SignOutResponse>, Status> {
            Err(Status::unimplemented("unused in this test"))
        }

        async fn get_access_token(&self, _: Request<GetAccessTokenRequest>) -> Result<Response<GetAccessTokenResponse>, Status> {
            Err(Status::unimplemented("unused in this test"))
        }

        async fn get_validation_key_set(
            &self,
            _: Request<GetValidationKeySetRequest>,
        ) -> Result<Response<Self::GetValidationKeySetStream>, Status> {
            Err(Status::unimplemented("unused in this test"))
        }

        async fn translate_access_token(
            &self,
            request: Request<Streaming<TranslateAccessTokenRequest>>,
        ) -> Result<Response<Self::TranslateAccessTokenStream>, Status> {
            let mut inbound = request.into_inner();
            let (tx, rx) = mpsc::channel(8);

            tokio::spawn(async move {
                while let Ok(Some(req)) = inbound.message().await {
                    if req.opaque_access_token == "reject-me" {
                        let _ = tx.send(Err(Status::permission_denied("rejected"))).await;
                        continue;
                    }
                    let response = TranslateAccessTokenResponse {
                        access_token: format!("jwt-for-{}", req.opaque_access_token),
                        metadata: req.metadata,
                    };
                    if tx.send(Ok(response)).await.is_err() {
                        return;
                    }
                }
            });

            Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
        }
    }

    async fn spawn_translator() -> Translator {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            tonic::transport::Server::builder()
                .add_service(AuthServiceServer::new(EchoAuthService))
                .serve_with_incoming(TcpListenerStream::new(listener))
                .await
                .unwrap();
        });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let client = AuthServiceClient::connect(format!("http://{addr}")).await.unwrap();
        let (translator, runner) = translator_client::new(client, TranslatorConfig::default()).await.unwrap();
        tokio::spawn(runner.run());
        translator
    }

    async fn handler(translated: TranslatedToken) -> HttpResponse {
        HttpResponse::Ok().body(translated.access_token)
    }

    #[actix_web::test]
    async fn valid_bearer_token_is_translated_and_reaches_the_handler() {
        let translator = spawn_translator().await;
        let app = test::init_service(
            App::new().wrap(BearerAuth::new(translator)).route("/", web::get().to(handler)),
        )
        .await;

        let req = test::TestRequest::get()
            .uri("/")
            .insert_header((header::AUTHORIZATION, "Bearer opaque-1"))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 200);
        let body = test::read_body(resp).await;
        assert_eq!(body, "jwt-for-opaque-1");
    }

    #[actix_web::test]
    async fn missing_authorization_header_is_rejected() {
        let translator = spawn_translator().await;
        let app = test::init_service(
            App::new().wrap(BearerAuth::new(translator)).route("/", web::get().to(handler)),
        )
        .await;

        let req = test::TestRequest::get().uri("/").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 401);
    }

    #[actix_web::test]
    async fn non_bearer_scheme_is_rejected() {
        let translator = spawn_translator().await;
        let app = test::init_service(
            App::new().wrap(BearerAuth::new(translator)).route("/", web::get().to(handler)),
        )
        .await;

        let req = test::TestRequest::get()
            .uri("/")
            .insert_header((header::AUTHORIZATION, "Basic dXNlcjpwYXNz"))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 401);
    }

    #[actix_web::test]
    async fn translator_rejection_surfaces_as_401() {
        let translator = spawn_translator().await;
        let app = test::init_service(
            App::new().wrap(BearerAuth::new(translator)).route("/", web::get().to(handler)),
        )
        .await;

        let req = test::TestRequest::get()
            .uri("/")
            .insert_header((header::AUTHORIZATION, "Bearer reject-me"))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 401);
    }
}
