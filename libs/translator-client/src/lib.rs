//! Resource-server-side helper that owns a single open translate stream and
//! multiplexes concurrent callers over it, transparently renewing the
//! stream when it fails. See the job loop / renewal loop split below: only
//! the job loop ever touches the stream's read half, only the renewal loop
//! ever replaces it, and they talk to each other exclusively through the
//! `stream_aborted` signal — no mutex is ever held across a channel send.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use auth_entity::AuthError;
use auth_proto::auth_service_client::AuthServiceClient;
use auth_proto::TranslateAccessTokenRequest;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio_stream::wrappers::ReceiverStream;
use tonic::transport::Channel;
use tracing::{error, info, warn};

#[derive(Clone)]
pub struct TranslatorConfig {
    pub job_queue_size: usize,
    pub stream_renewal_interval: Duration,
}

impl Default for TranslatorConfig {
    fn default() -> Self {
        Self { job_queue_size: 64, stream_renewal_interval: Duration::from_secs(1) }
    }
}

struct Job {
    opaque_access_token: String,
    metadata: HashMap<String, String>,
    reply: oneshot::Sender<Result<(String, HashMap<String, String>), AuthError>>,
}

/// The half of the bidi call the job loop actually drives: an outbound
/// sender feeding the request stream, and the inbound response stream.
///
/// `inbound` carries its own mutex rather than relying on the outer
/// `RwLock`'s read guard for mutability: the job loop only ever takes a
/// read lock on the stream (so the renewal loop's write lock can still
/// exclude it), but `Streaming::message` needs `&mut self`. In practice
/// there is only ever one job-loop task, so this inner lock is never
/// contended — it exists to keep the outer lock's read/write split honest
/// without reaching for unsafe aliasing.
struct OpenStream {
    outbound: mpsc::Sender<TranslateAccessTokenRequest>,
    inbound: tokio::sync::Mutex<tonic::Streaming<auth_proto::TranslateAccessTokenResponse>>,
}

struct Shared {
    stream: RwLock<OpenStream>,
    stream_aborted: mpsc::Sender<()>,
    jobs: mpsc::Sender<Job>,
}

/// Handle callers use to translate opaque access tokens. Cheap to clone.
#[derive(Clone)]
pub struct Translator {
    shared: Arc<Shared>,
}

impl Translator {
    /// Blocks until the translated JWT and echoed metadata, or an error,
    /// come back from the server on the shared stream.
    pub async fn translate(
        &self,
        opaque_access_token: &str,
        metadata: HashMap<String, String>,
    ) -> Result<(String, HashMap<String, String>), AuthError> {
        let (reply, reply_rx) = oneshot::channel();
        let job = Job { opaque_access_token: opaque_access_token.to_string(), metadata, reply };

        self.shared
            .jobs
            .send(job)
            .await
            .map_err(|_| AuthError::StreamAborted)?;

        reply_rx.await.map_err(|_| AuthError::StreamAborted)?
    }
}

/// Owns the background job loop and renewal loop. `run` never returns;
/// spawn it and keep the `Translator` handle for callers.
pub struct TranslatorRunner {
    shared: Arc<Shared>,
    client: AuthServiceClient<Channel>,
    config: TranslatorConfig,
    jobs_rx: mpsc::Receiver<Job>,
    stream_aborted_rx: mpsc::Receiver<()>,
}

async fn open_stream(client: &mut AuthServiceClient<Channel>, job_queue_size: usize) -> Result<OpenStream, tonic::Status> {
    let (outbound, outbound_rx) = mpsc::channel(job_queue_size);
    let response = client.translate_access_token(ReceiverStream::new(outbound_rx)).await?;
    Ok(OpenStream { outbound, inbound: tokio::sync::Mutex::new(response.into_inner()) })
}

/// Build a translator and its runner. The runner performs one initial
/// stream open before returning, matching the reference renewal loop's
/// "initial open before the job loop begins serving" contract.
pub async fn new(
    mut client: AuthServiceClient<Channel>,
    config: TranslatorConfig,
) -> Result<(Translator, TranslatorRunner), tonic::Status> {
    let initial = open_stream(&mut client, config.job_queue_size).await?;

    let (jobs_tx, jobs_rx) = mpsc::channel(config.job_queue_size);
    let (aborted_tx, stream_aborted_rx) = mpsc::channel(1);

    let shared = Arc::new(Shared {
        stream: RwLock::new(initial),
        stream_aborted: aborted_tx,
        jobs: jobs_tx,
    });

    let translator = Translator { shared: shared.clone() };
    let runner = TranslatorRunner { shared, client, config, jobs_rx, stream_aborted_rx };
    Ok((translator, runner))
}

fn signal_stream_aborted(tx: &mpsc::Sender<()>) {
    // Non-blocking: if a signal is already pending, drop this one.
    let _ = tx.try_send(());
}

impl TranslatorRunner {
    pub async fn run(self) {
        let TranslatorRunner { shared, client, config, mut jobs_rx, stream_aborted_rx } = self;

        tokio::spawn(handle_stream_renewals(shared.clone(), client, config, stream_aborted_rx));

        while let Some(job) = jobs_rx.recv().await {
            handle_job(&shared, job).await;
        }
    }
}

async fn handle_job(shared: &Arc<Shared>, job: Job) {
    let stream = shared.stream.read().await;
    let request = TranslateAccessTokenRequest {
        opaque_access_token: job.opaque_access_token.clone(),
        metadata: job.metadata.clone(),
    };

    if let Err(e) = stream.outbound.send(request).await {
        // The outbound half closed: the stream needs renewal. Re-enqueue
        // rather than failing the caller; the renewed stream will serve it.
        drop(stream);
        warn!(error = %e, "translate send failed, stream closed; re-enqueuing job");
        signal_stream_aborted(&shared.stream_aborted);
        let _ = shared.jobs.send(job).await;
        return;
    }

    let mut inbound = stream.inbound.lock().await;
    match inbound.message().await {
        Ok(Some(response)) => {
            let _ = job.reply.send(Ok((response.access_token, response.metadata)));
        }
        Ok(None) => {
            // Clean close from the server side; reply with the fact, no renewal.
            let _ = job.reply.send(Err(AuthError::StreamAborted));
        }
        Err(status) => {
            warn!(error = %status, "translate receive failed; signalling stream renewal");
            signal_stream_aborted(&shared.stream_aborted);
            let _ = job.reply.send(Err(AuthError::StreamAborted));
        }
    }
}

async fn handle_stream_renewals(
    shared: Arc<Shared>,
    mut client: AuthServiceClient<Channel>,
    config: TranslatorConfig,
    mut stream_aborted_rx: mpsc::Receiver<()>,
) {
    while stream_aborted_rx.recv().await.is_some() {
        renew_stream(&shared, &mut client, &config).await;
    }
}

async fn renew_stream(shared: &Arc<Shared>, client: &mut AuthServiceClient<Channel>, config: &TranslatorConfig) {
    let mut guard = shared.stream.write().await;
    loop {
        info!("renewing the token translation stream");
        match open_stream(client, config.job_queue_size).await {
            Ok(fresh) => {
                *guard = fresh;
                return;
            }
            Err(status) => {
                error!(error = %status, "failed to renew the token translation stream");
                tokio::time::sleep(config.stream_renewal_interval).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use auth_proto::auth_service_server::{AuthService, AuthServiceServer};
    use auth_proto::{
        GetAccessTokenRequest, GetAccessTokenResponse, GetValidationKeySetRequest,
        GetValidationKeySetResponse, SignInRequest, SignInResponse, SignOutRequest, SignOutResponse,
        TranslateAccessTokenResponse,
    };
    use futures_util::Stream;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio_stream::wrappers::{ReceiverStream, TcpListenerStream};
    use tonic::{Request, Response, Status, Streaming};

    /// Fails the first translate request it receives on the stream with a
    /// non-EOF error, then behaves normally — the scripted scenario the
    /// renewal loop is meant to recover from.
    #[derive(Clone, Default)]
    struct ScriptedAuthService {
        fail_once: Arc<AtomicBool>,
    }

    type BoxStream<T> = Pin<Box<dyn Stream<Item = Result<T, Status>> + Send + 'static>>;

    #[tonic::async_trait]
    impl AuthService for ScriptedAuthService {
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

        async fn get_validation_key_set(&self, _: Request<GetValidationKeySetRequest>) -> Result<Response<Self::GetValidationKeySetStream>, Status> {
            Err(Status::unimplemented("unused in this test"))
        }

        async fn translate_access_token(
            &self,
            request: Request<Streaming<TranslateAccessTokenRequest>>,
        ) -> Result<Response<Self::TranslateAccessTokenStream>, Status> {
            let mut inbound = request.into_inner();
            let fail_once = self.fail_once.clone();
            let (tx, rx) = mpsc::channel(8);

            tokio::spawn(async move {
                loop {
                    match inbound.message().await {
                        Ok(Some(req)) => {
                            if fail_once.swap(false, Ordering::SeqCst) {
                                let _ = tx.send(Err(Status::unavailable("scripted failure"))).await;
                                return;
                            }
                            let response = TranslateAccessTokenResponse {
                                access_token: format!("jwt-for-{}", req.opaque_access_token),
                                metadata: req.metadata,
                            };
                            if tx.send(Ok(response)).await.is_err() {
                                return;
                            }
                        }
                        Ok(None) | Err(_) => return,
                    }
                }
            });

            Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
        }
    }

    async fn spawn_server(service: ScriptedAuthService) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            tonic::transport::Server::builder()
                .add_service(AuthServiceServer::new(service))
                .serve_with_incoming(TcpListenerStream::new(listener))
                .await
                .unwrap();
        });

        // Give the listener a beat to start accepting.
        tokio::time::sleep(Duration::from_millis(50)).await;
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn translate_round_trips_through_a_healthy_stream() {
        let endpoint = spawn_server(ScriptedAuthService::default()).await;
        let client = AuthServiceClient::connect(endpoint).await.unwrap();
        let (translator, runner) = new(client, TranslatorConfig::default()).await.unwrap();
        tokio::spawn(runner.run());

        let (jwt, _metadata) = translator.translate("opaque-1", HashMap::new()).await.unwrap();
        assert_eq!(jwt, "jwt-for-opaque-1");
    }

    #[tokio::test]
    async fn translate_recovers_after_a_scripted_stream_failure() {
        let service = ScriptedAuthService { fail_once: Arc::new(AtomicBool::new(true)) };
        let endpoint = spawn_server(service).await;
        let client = AuthServiceClient::connect(endpoint).await.unwrap();
        let config = TranslatorConfig { job_queue_size: 8, stream_renewal_interval: Duration::from_millis(20) };
        let (translator, runner) = new(client, config).await.unwrap();
        tokio::spawn(runner.run());

        // First call rides the stream that is about to fail; it should
        // surface an error and trigger renewal rather than hang.
        let first = translator.translate("opaque-1", HashMap::new()).await;
        assert!(first.is_err());

        // Renewal runs in the background; poll translate until it succeeds
        // on the fresh stream rather than racing a fixed sleep.
        let mut last_err = None;
        for _ in 0..20 {
            match translator.translate("opaque-2", HashMap::new()).await {
                Ok((jwt, _)) => {
                    assert_eq!(jwt, "jwt-for-opaque-2");
                    return;
                }
                Err(e) => {
                    last_err = Some(e);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
            }
        }
        panic!("translator never recovered after scripted failure: {last_err:?}");
    }

    #[tokio::test]
    async fn translate_re_enqueues_the_same_job_after_a_send_eof_and_resolves_once_renewed() {
        let endpoint = spawn_server(ScriptedAuthService::default()).await;
        let client = AuthServiceClient::connect(endpoint).await.unwrap();
        let config = TranslatorConfig { job_queue_size: 8, stream_renewal_interval: Duration::from_millis(20) };
        let (translator, runner) = new(client, config).await.unwrap();

        // Simulate send-EOF on the very first job: swap the live outbound sender
        // for one whose receiver is already gone, so `outbound.send` fails
        // without ever touching the (still healthy) inbound half.
        {
            let mut guard = translator.shared.stream.write().await;
            let (broken_tx, broken_rx) = mpsc::channel::<TranslateAccessTokenRequest>(1);
            drop(broken_rx);
            guard.outbound = broken_tx;
        }

        tokio::spawn(runner.run());

        // This is the one and only `translate()` call for this job: the
        // re-enqueue happens inside the runner, not via a second call here.
        let (jwt, _metadata) = translator.translate("opaque-1", HashMap::new()).await.unwrap();
        assert_eq!(jwt, "jwt-for-opaque-1");
    }
}
