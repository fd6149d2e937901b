//! Authentication core entry point.
//!
//! Bootstraps the token store, the signing keyset, the event bus, and the
//! user directory client, then serves `AuthService` until a shutdown signal.

use anyhow::{Context, Result};
use auth_proto::auth_service_server::AuthServiceServer;
use auth_server::config::{Cli, Settings};
use auth_server::grpc::server::TlsPeerCheck;
use auth_server::AuthServer;
use event_bus::{Dispatcher, EventBus, KafkaEventBus};
use key_manager::{KeyManager, KeyManagerConfig, VaultSecretStore};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tonic::transport::Server;
use tracing::{error, info};
use user_directory::GrpcUserDirectory;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "auth_server=info,info".into()))
        .with_target(false)
        .json()
        .init();

    info!("starting authentication core");

    let cli = Cli::parse(std::env::args()).context("failed to parse command-line arguments")?;
    let settings = Settings::load(&cli).context("failed to load configuration")?;
    info!("configuration loaded");

    let db_pool = PgPoolOptions::new()
        .max_connections(settings.database.max_connections)
        .acquire_timeout(Duration::from_secs(5))
        .connect(&settings.database.url)
        .await
        .context("failed to connect to the token store database")?;
    let store: Arc<dyn token_store::Store> = Arc::new(token_store::PgTokenStore::new(db_pool));
    info!("token store connected");

    let bus: Arc<dyn EventBus> = Arc::new(
        KafkaEventBus::new(&settings.mq.brokers, &settings.mq.topic).context("failed to connect to the event bus")?,
    );

    let secret_store = Arc::new(
        VaultSecretStore::new(&settings.vault.address, &settings.vault.token, &settings.vault.mount_path)
            .context("failed to build the secret store client")?,
    );
    let key_manager = Arc::new(KeyManager::new(
        secret_store,
        Some(bus.clone()),
        KeyManagerConfig {
            mount_path: settings.vault.mount_path.clone(),
            key_count: settings.vault.key_count,
            refresh_interval: settings.vault.refresh_interval,
        },
    ));
    let _key_refresh_handle = key_manager.clone().spawn_refresh_loop();
    info!("signing keyset ready");

    let dispatcher = Dispatcher::new(bus.clone(), "auth-server");
    token_store::register_user_deleted_handler(&dispatcher, store.clone())
        .await
        .context("failed to register the user_deleted handler")?;

    let user_directory: Arc<dyn user_directory::UserDirectory> = Arc::new(
        GrpcUserDirectory::connect(settings.user_service.endpoint())
            .await
            .context("failed to connect to the user directory")?,
    );
    info!(endpoint = %settings.user_service.endpoint(), "user directory connected");

    let tls_peer_check = settings
        .tls
        .as_ref()
        .map(|tls| TlsPeerCheck { expected_common_name: tls.expected_common_name.clone() });

    let auth_server = AuthServer::new(
        store.clone(),
        key_manager,
        user_directory,
        settings.issuer.clone(),
        settings.refresh_token_ttl,
        settings.access_token_ttl,
        tls_peer_check,
    );

    let addr = format!("0.0.0.0:{}", cli.port).parse().context("invalid listen address")?;
    let mut builder = Server::builder();
    if let Some(tls) = &settings.tls {
        let cert = std::fs::read_to_string(&tls.cert_path).context("failed to read TLS_CERT_PATH")?;
        let key = std::fs::read_to_string(&tls.key_path).context("failed to read TLS_KEY_PATH")?;
        let client_ca = std::fs::read_to_string(&tls.client_ca_path).context("failed to read TLS_CLIENT_CA_PATH")?;
        let identity = tonic::transport::Identity::from_pem(cert, key);
        let tls_config = tonic::transport::ServerTlsConfig::new()
            .identity(identity)
            .client_ca_root(tonic::transport::Certificate::from_pem(client_ca));
        builder = builder.tls_config(tls_config).context("failed to configure server TLS")?;
    } else {
        info!("running without TLS (-insecure)");
    }

    info!(addr = %addr, "serving AuthService");
    builder
        .add_service(AuthServiceServer::new(auth_server))
        .serve_with_shutdown(addr, shutdown_signal())
        .await
        .context("gRPC server error")?;

    store.close().await.ok();
    info!("authentication core shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    #[cfg(unix)]
    let quit = async {
        signal::unix::signal(signal::unix::SignalKind::quit())
            .expect("failed to install SIGQUIT handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let quit = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT"),
        _ = terminate => info!("received SIGTERM"),
        _ = quit => info!("received SIGQUIT"),
    }

    info!("shutting down gracefully");
}
