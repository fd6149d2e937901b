//! Owns the live signing keyset: a rotating pool of RSA and ECDSA keys held
//! in a secret store, refreshed on a timer, with every refresh announced on
//! the event bus so the validator knows to invalidate its cache.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use auth_entity::{AuthError, Key, KeyAlgorithm, KeyType};
use event_bus::{Envelope, EventBus, KeysetUpdatedPayload, KEYSET_UPDATED};
use rand::Rng;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

const PATH_LEN: usize = 50;
const PATH_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
const FIELD_PRIVATE: &str = "private";
const FIELD_ALGORITHM: &str = "algorithm";
const FIELD_KEY_TYPE: &str = "keyType";

/// The narrow secret-store contract the key manager needs. Production wiring
/// is `VaultSecretStore`; tests use `InMemorySecretStore`.
#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn list(&self, mount_path: &str) -> Result<Vec<String>, AuthError>;
    async fn get(&self, path: &str) -> Result<HashMap<String, String>, AuthError>;
    async fn put(&self, path: &str, fields: HashMap<String, String>) -> Result<(), AuthError>;
    async fn delete_metadata(&self, path: &str) -> Result<(), AuthError>;
}

pub struct VaultSecretStore {
    client: vaultrs::client::VaultClient,
    mount: String,
}

impl VaultSecretStore {
    pub fn new(address: &str, token: &str, mount: &str) -> Result<Self, AuthError> {
        use vaultrs::client::{VaultClient, VaultClientSettingsBuilder};

        let settings = VaultClientSettingsBuilder::default()
            .address(address)
            .token(token)
            .build()
            .map_err(|e| AuthError::SecretFailure(format!("bad vault client settings: {e}")))?;

        let client = VaultClient::new(settings)
            .map_err(|e| AuthError::SecretFailure(format!("failed to build vault client: {e}")))?;

        Ok(Self { client, mount: mount.to_string() })
    }
}

#[async_trait]
impl SecretStore for VaultSecretStore {
    async fn list(&self, mount_path: &str) -> Result<Vec<String>, AuthError> {
        match vaultrs::kv2::list(&self.client, &self.mount, mount_path).await {
            Ok(paths) => Ok(paths),
            Err(e) if e.to_string().contains("404") => Ok(Vec::new()),
            Err(e) => Err(AuthError::SecretFailure(format!("vault list error: {e}"))),
        }
    }

    async fn get(&self, path: &str) -> Result<HashMap<String, String>, AuthError> {
        vaultrs::kv2::read(&self.client, &self.mount, path)
            .await
            .map_err(|e| AuthError::SecretFailure(format!("vault read error: {e}")))
    }

    async fn put(&self, path: &str, fields: HashMap<String, String>) -> Result<(), AuthError> {
        vaultrs::kv2::set(&self.client, &self.mount, path, &fields)
            .await
            .map_err(|e| AuthError::SecretFailure(format!("vault write error: {e}")))?;
        Ok(())
    }

    async fn delete_metadata(&self, path: &str) -> Result<(), AuthError> {
        vaultrs::kv2::delete_metadata(&self.client, &self.mount, path)
            .await
            .map_err(|e| AuthError::SecretFailure(format!("vault delete error: {e}")))?;
        Ok(())
    }
}

#[derive(Clone)]
pub struct KeyManagerConfig {
    pub mount_path: String,
    pub key_count: usize,
    pub refresh_interval: std::time::Duration,
}

pub struct KeyManager {
    store: Arc<dyn SecretStore>,
    bus: Option<Arc<dyn EventBus>>,
    config: KeyManagerConfig,
}

fn random_path() -> String {
    let mut rng = rand::rngs::OsRng;
    (0..PATH_LEN)
        .map(|_| PATH_ALPHABET[rng.gen_range(0..PATH_ALPHABET.len())] as char)
        .collect()
}

fn parse_key(path: &str, fields: &HashMap<String, String>) -> Result<Key, AuthError> {
    let algorithm = fields
        .get(FIELD_ALGORITHM)
        .and_then(|s| KeyAlgorithm::parse(s))
        .ok_or_else(|| AuthError::InvalidAlgorithm(format!("path {path} has no recognizable algorithm")))?;
    let key_type = match fields.get(FIELD_KEY_TYPE).map(String::as_str) {
        Some("RSA") => KeyType::Rsa,
        Some("ECDSA") => KeyType::Ecdsa,
        other => return Err(AuthError::InvalidAlgorithm(format!("path {path} has unknown keyType {other:?}"))),
    };
    let pem = fields
        .get(FIELD_PRIVATE)
        .ok_or_else(|| AuthError::KeyNotFound)?;
    let material = key_codec::decode_private(algorithm, pem)?;
    Ok(Key::new(path, key_type, algorithm, material))
}

impl KeyManager {
    pub fn new(store: Arc<dyn SecretStore>, bus: Option<Arc<dyn EventBus>>, config: KeyManagerConfig) -> Self {
        Self { store, bus, config }
    }

    pub async fn list(&self, mount_path: &str) -> Result<Vec<String>, AuthError> {
        self.store.list(mount_path).await
    }

    pub async fn get_random(&self) -> Result<Key, AuthError> {
        let paths = self.store.list(&self.config.mount_path).await?;
        if paths.is_empty() {
            return Err(AuthError::KeyNotFound);
        }
        let index = rand::rngs::OsRng.gen_range(0..paths.len());
        let path = &paths[index];
        let fields = self.store.get(path).await?;
        parse_key(path, &fields)
    }

    pub async fn get_keyset(&self) -> Result<Vec<Key>, AuthError> {
        let paths = self.store.list(&self.config.mount_path).await?;
        let mut keys = Vec::with_capacity(paths.len());
        for path in &paths {
            let fields = self.store.get(path).await?;
            keys.push(parse_key(path, &fields)?);
        }
        Ok(keys)
    }

    /// Purge every key and mint a fresh keyset, then announce it.
    pub async fn refresh_keys(&self) -> Result<(), AuthError> {
        let paths = self.store.list(&self.config.mount_path).await?;
        for path in &paths {
            self.store.delete_metadata(path).await?;
        }

        for _ in 0..self.config.key_count {
            let path = random_path();
            let key = key_codec::generate_rsa(&path)?;
            self.store_key(&path, &key).await?;
        }
        for _ in 0..self.config.key_count {
            let path = random_path();
            let key = key_codec::generate_ecdsa_p256(&path);
            self.store_key(&path, &key).await?;
        }

        if let Some(bus) = &self.bus {
            let envelope = Envelope::new("key-manager", KEYSET_UPDATED, KeysetUpdatedPayload::default())
                .map_err(|e| AuthError::BusFailure(e.to_string()))?
                .with_metadata("mount_path", self.config.mount_path.clone())
                .with_metadata("key_count", self.config.key_count.to_string());
            bus.publish(envelope).await.map_err(|e| AuthError::BusFailure(e.to_string()))?;
        }

        Ok(())
    }

    async fn store_key(&self, path: &str, key: &Key) -> Result<(), AuthError> {
        let pem = key_codec::encode_private_pem(&key.material)?;
        let mut fields = HashMap::new();
        fields.insert(FIELD_PRIVATE.to_string(), pem);
        fields.insert(FIELD_ALGORITHM.to_string(), key.algorithm.as_str().to_string());
        fields.insert(FIELD_KEY_TYPE.to_string(), key.key_type.to_string());
        self.store.put(path, fields).await
    }

    /// Refresh once on start, then on every tick, logging and continuing
    /// past failures. Cancel by aborting the returned handle.
    pub fn spawn_refresh_loop(self: Arc<Self>) -> Option<JoinHandle<()>> {
        if self.config.refresh_interval.is_zero() {
            return None;
        }

        Some(tokio::spawn(async move {
            if let Err(e) = self.refresh_keys().await {
                error!(error = %e, "initial key refresh failed");
            } else {
                info!(mount_path = %self.config.mount_path, "initial key refresh complete");
            }

            let mut ticker = tokio::time::interval(self.config.refresh_interval);
            ticker.tick().await; // interval fires immediately; the first refresh already happened above.

            loop {
                ticker.tick().await;
                match self.refresh_keys().await {
                    Ok(()) => info!(mount_path = %self.config.mount_path, "key refresh complete"),
                    Err(e) => warn!(error = %e, "key refresh failed, will retry next tick"),
                }
            }
        }))
    }
}

#[cfg(test)]
pub mod test_support {
    use super::*;
    use tokio::sync::Mutex;

    #[derive(Default)]
    pub struct InMemorySecretStore {
        entries: Mutex<HashMap<String, HashMap<String, String>>>,
    }

    #[async_trait]
    impl SecretStore for InMemorySecretStore {
        async fn list(&self, _mount_path: &str) -> Result<Vec<String>, AuthError> {
            Ok(self.entries.lock().await.keys().cloned().collect())
        }

        async fn get(&self, path: &str) -> Result<HashMap<String, String>, AuthError> {
            self.entries
                .lock()
                .await
                .get(path)
                .cloned()
                .ok_or(AuthError::KeyNotFound)
        }

        async fn put(&self, path: &str, fields: HashMap<String, String>) -> Result<(), AuthError> {
            self.entries.lock().await.insert(path.to_string(), fields);
            Ok(())
        }

        async fn delete_metadata(&self, path: &str) -> Result<(), AuthError> {
            self.entries.lock().await.remove(path);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::InMemorySecretStore;
    use super::*;
    use event_bus::InMemoryEventBus;

    fn config(key_count: usize) -> KeyManagerConfig {
        KeyManagerConfig {
            mount_path: "auth".to_string(),
            key_count,
            refresh_interval: std::time::Duration::ZERO,
        }
    }

    #[tokio::test]
    async fn get_random_on_empty_store_is_key_not_found() {
        let manager = KeyManager::new(Arc::new(InMemorySecretStore::default()), None, config(1));
        let err = manager.get_random().await.unwrap_err();
        assert!(matches!(err, AuthError::KeyNotFound));
    }

    #[tokio::test]
    async fn refresh_keys_mints_rsa_and_ecdsa_and_publishes() {
        let store = Arc::new(InMemorySecretStore::default());
        let bus = Arc::new(InMemoryEventBus::new());
        let manager = KeyManager::new(store.clone(), Some(bus.clone()), config(2));

        let mut keyset_updates = bus.subscribe("test", KEYSET_UPDATED).await.unwrap();

        manager.refresh_keys().await.unwrap();

        let keyset = manager.get_keyset().await.unwrap();
        assert_eq!(keyset.len(), 4); // 2 RSA + 2 ECDSA
        let rsa_count = keyset.iter().filter(|k| k.key_type == KeyType::Rsa).count();
        let ecdsa_count = keyset.iter().filter(|k| k.key_type == KeyType::Ecdsa).count();
        assert_eq!(rsa_count, 2);
        assert_eq!(ecdsa_count, 2);

        let event = tokio::time::timeout(std::time::Duration::from_secs(1), keyset_updates.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.event_type, KEYSET_UPDATED);
    }

    #[tokio::test]
    async fn refresh_keys_purges_prior_keyset() {
        let store = Arc::new(InMemorySecretStore::default());
        let manager = KeyManager::new(store.clone(), None, config(1));

        manager.refresh_keys().await.unwrap();
        let first = manager.get_keyset().await.unwrap();

        manager.refresh_keys().await.unwrap();
        let second = manager.get_keyset().await.unwrap();

        assert_eq!(second.len(), 2);
        let first_ids: std::collections::HashSet<_> = first.iter().map(|k| k.id.clone()).collect();
        assert!(second.iter().all(|k| !first_ids.contains(&k.id)));
    }

    #[tokio::test]
    async fn get_random_returns_a_key_from_the_pool() {
        let store = Arc::new(InMemorySecretStore::default());
        let manager = KeyManager::new(store.clone(), None, config(1));
        manager.refresh_keys().await.unwrap();

        let key = manager.get_random().await.unwrap();
        let all = manager.get_keyset().await.unwrap();
        assert!(all.iter().any(|k| k.id == key.id));
    }
}
