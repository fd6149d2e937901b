//! Configuration management for the authentication core.
//!
//! Loads settings from environment variables, with a `.env` file loaded as a
//! local-development convenience. There is no secrets-manager integration:
//! the one genuine secret this service handles (the signing keyset) lives in
//! Vault, reached through `VAULT_*`.

use anyhow::{Context, Result};
use std::env;
use std::time::Duration;
use tracing::info;

/// Command-line flags, parsed by hand since nothing else in this codebase
/// reaches for an argument-parsing crate.
#[derive(Debug, Clone)]
pub struct Cli {
    pub port: u16,
    pub insecure: bool,
}

impl Cli {
    pub fn parse(args: impl Iterator<Item = String>) -> Result<Self> {
        let mut port = 50051u16;
        let mut insecure = false;

        let mut args = args.skip(1);
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "-p" | "--port" => {
                    let value = args.next().context("-p requires a port number")?;
                    port = value.parse().context("invalid port passed to -p")?;
                }
                "-insecure" | "--insecure" => insecure = true,
                other => anyhow::bail!("unrecognized argument: {other}"),
            }
        }

        Ok(Self { port, insecure })
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub database: DatabaseSettings,
    pub mq: MqSettings,
    pub vault: VaultSettings,
    pub user_service: UserServiceSettings,
    pub tls: Option<TlsSettings>,
    pub otel_endpoint: Option<String>,
    pub issuer: String,
    pub refresh_token_ttl: chrono::Duration,
    pub access_token_ttl: chrono::Duration,
}

impl Settings {
    pub fn load(cli: &Cli) -> Result<Self> {
        if cfg!(debug_assertions) {
            dotenvy::dotenv().ok();
            info!("loaded .env file for development");
        }

        let tls = if cli.insecure { None } else { Some(TlsSettings::from_env()?) };

        Ok(Self {
            database: DatabaseSettings::from_env()?,
            mq: MqSettings::from_env()?,
            vault: VaultSettings::from_env()?,
            user_service: UserServiceSettings::from_env()?,
            tls,
            otel_endpoint: env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok(),
            issuer: env::var("AUTH_ISSUER").unwrap_or_else(|_| "dfr-auth".to_string()),
            refresh_token_ttl: chrono::Duration::seconds(
                env::var("REFRESH_TOKEN_TTL_SECONDS")
                    .unwrap_or_else(|_| "604800".to_string()) // 7 days
                    .parse()
                    .context("invalid REFRESH_TOKEN_TTL_SECONDS")?,
            ),
            // The source this was distilled from varies the access-token TTL
            // default between 5 minutes and a week across its call sites;
            // fifteen minutes is the one chosen default here, see DESIGN.md.
            access_token_ttl: chrono::Duration::seconds(
                env::var("ACCESS_TOKEN_TTL_SECONDS")
                    .unwrap_or_else(|_| "900".to_string())
                    .parse()
                    .context("invalid ACCESS_TOKEN_TTL_SECONDS")?,
            ),
        })
    }
}

#[derive(Debug, Clone)]
pub struct DatabaseSettings {
    pub url: String,
    pub max_connections: u32,
}

impl DatabaseSettings {
    fn from_env() -> Result<Self> {
        Ok(Self {
            url: env::var("DB_URL").context("DB_URL must be set")?,
            max_connections: env::var("DB_MAX_CONNECTIONS")
                .unwrap_or_else(|_| "10".to_string())
                .parse()
                .context("invalid DB_MAX_CONNECTIONS")?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct MqSettings {
    pub brokers: String,
    pub topic: String,
}

impl MqSettings {
    fn from_env() -> Result<Self> {
        Ok(Self {
            brokers: env::var("MQ_BROKERS").context("MQ_BROKERS must be set")?,
            topic: env::var("MQ_TOPIC").unwrap_or_else(|_| "auth-events".to_string()),
        })
    }
}

#[derive(Debug, Clone)]
pub struct VaultSettings {
    pub address: String,
    pub token: String,
    pub mount_path: String,
    pub key_count: usize,
    pub refresh_interval: Duration,
}

impl VaultSettings {
    fn from_env() -> Result<Self> {
        Ok(Self {
            address: env::var("VAULT_ADDR").context("VAULT_ADDR must be set")?,
            token: env::var("VAULT_TOKEN").context("VAULT_TOKEN must be set")?,
            mount_path: env::var("VAULT_MOUNT_PATH").context("VAULT_MOUNT_PATH must be set")?,
            key_count: env::var("VAULT_KEY_COUNT")
                .unwrap_or_else(|_| "2".to_string())
                .parse()
                .context("invalid VAULT_KEY_COUNT")?,
            refresh_interval: Duration::from_secs(
                env::var("VAULT_KEY_REFRESH_SECONDS")
                    .unwrap_or_else(|_| "86400".to_string())
                    .parse()
                    .context("invalid VAULT_KEY_REFRESH_SECONDS")?,
            ),
        })
    }
}

#[derive(Debug, Clone)]
pub struct UserServiceSettings {
    pub host: String,
    pub port: u16,
}

impl UserServiceSettings {
    fn from_env() -> Result<Self> {
        Ok(Self {
            host: env::var("USER_SERVICE_SERVICE_HOST").context("USER_SERVICE_SERVICE_HOST must be set")?,
            port: env::var("USER_SERVICE_SERVICE_PORT")
                .context("USER_SERVICE_SERVICE_PORT must be set")?
                .parse()
                .context("invalid USER_SERVICE_SERVICE_PORT")?,
        })
    }

    pub fn endpoint(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone)]
pub struct TlsSettings {
    pub cert_path: String,
    pub key_path: String,
    pub client_ca_path: String,
    pub expected_common_name: String,
}

impl TlsSettings {
    fn from_env() -> Result<Self> {
        Ok(Self {
            cert_path: env::var("TLS_CERT_PATH").context("TLS_CERT_PATH must be set")?,
            key_path: env::var("TLS_KEY_PATH").context("TLS_KEY_PATH must be set")?,
            client_ca_path: env::var("TLS_CLIENT_CA_PATH").context("TLS_CLIENT_CA_PATH must be set")?,
            expected_common_name: env::var("TLS_EXPECTED_COMMON_NAME")
                .context("TLS_EXPECTED_COMMON_NAME must be set")?,
        })
    }
}
