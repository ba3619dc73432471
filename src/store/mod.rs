//! Credentials and the keyed row stores behind the signal ciphers.
//!
//! [`DeviceStore`] owns the writable [`AuthCreds`] plus a cache-fronted view
//! of the application's [`KeyStoreBackend`]. Multi-row protocol operations
//! (pre-key upload, retry with a fresh pre-key, pairing completion) go
//! through [`StoreTransaction`] so the rows commit together.

pub mod commands;
pub mod error;
pub mod memory;
pub mod traits;

use crate::binary::jid::Jid;
use crate::crypto::key_pair::{KeyPair, PreKey};
use crate::proto::{AdvSignedDeviceIdentity, MessageKey};
use crate::signal::address::{SenderKeyName, SignalAddress};
use crate::signal::error::{SignalError, SignalResult};
use crate::signal::keyhelper;
use crate::signal::record::{SenderKeyRecord, SessionRecord};
use crate::signal::store::{
    IdentityStore, PreKeyStore, SenderKeyStore, SessionStore, SignedPreKeyStore,
};
use async_trait::async_trait;
use commands::{apply_command, DeviceCommand};
use error::{Result, StoreError};
use log::warn;
use rand::RngCore;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio::time::{sleep, Duration};
use traits::{KeyStoreBackend, RowWrite, StoreKind};

const DEFAULT_MAX_COMMIT_RETRIES: u32 = 5;
const COMMIT_RETRY_BASE: Duration = Duration::from_millis(100);
const CACHE_CAPACITY: u64 = 10_000;
const CACHE_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Default)]
pub struct AccountSettings {
    pub unarchive_chats: bool,
}

/// The persisted per-install credentials. Created once by [`AuthCreds::init`]
/// and mutated over the client's lifetime through [`DeviceCommand`]s.
#[derive(Debug, Clone)]
pub struct AuthCreds {
    pub noise_key: KeyPair,
    pub pairing_ephemeral_key_pair: KeyPair,
    pub signed_identity_key: KeyPair,
    pub signed_pre_key: PreKey,
    pub registration_id: u32,
    pub adv_secret_key: [u8; 32],
    pub me: Option<Jid>,
    pub lid: Option<Jid>,
    pub push_name: String,
    pub platform: String,
    pub account: Option<AdvSignedDeviceIdentity>,
    pub next_pre_key_id: u32,
    pub first_unuploaded_pre_key_id: u32,
    pub registered: bool,
    pub routing_info: Option<Vec<u8>>,
    pub last_prop_hash: Option<String>,
    pub processed_history_messages: Vec<MessageKey>,
    pub account_settings: AccountSettings,
}

impl AuthCreds {
    /// Fresh credentials for a never-paired install. The registration id is
    /// fixed here and never mutated afterwards.
    pub fn init() -> Self {
        let signed_identity_key = KeyPair::new();
        let signed_pre_key = signed_identity_key.create_signed_prekey(1);
        let mut adv_secret_key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut adv_secret_key);
        Self {
            noise_key: KeyPair::new(),
            pairing_ephemeral_key_pair: KeyPair::new(),
            signed_identity_key,
            signed_pre_key,
            registration_id: keyhelper::generate_registration_id(),
            adv_secret_key,
            me: None,
            lid: None,
            push_name: String::new(),
            platform: String::new(),
            account: None,
            next_pre_key_id: 1,
            first_unuploaded_pre_key_id: 1,
            registered: false,
            routing_info: None,
            last_prop_hash: None,
            processed_history_messages: Vec::new(),
            account_settings: AccountSettings::default(),
        }
    }
}

/// Owns the credentials and the keyed stores, fronted by a TTL cache.
pub struct DeviceStore {
    creds: RwLock<AuthCreds>,
    backend: Arc<dyn KeyStoreBackend>,
    cache: moka::future::Cache<(StoreKind, String), Vec<u8>>,
    commit_lock: Mutex<()>,
    max_commit_retries: u32,
}

impl DeviceStore {
    pub fn new(creds: AuthCreds, backend: Arc<dyn KeyStoreBackend>) -> Arc<Self> {
        Arc::new(Self {
            creds: RwLock::new(creds),
            backend,
            cache: moka::future::Cache::builder()
                .max_capacity(CACHE_CAPACITY)
                .time_to_live(CACHE_TTL)
                .build(),
            commit_lock: Mutex::new(()),
            max_commit_retries: DEFAULT_MAX_COMMIT_RETRIES,
        })
    }

    pub async fn creds(&self) -> AuthCreds {
        self.creds.read().await.clone()
    }

    pub async fn me(&self) -> Option<Jid> {
        self.creds.read().await.me.clone()
    }

    pub async fn lid(&self) -> Option<Jid> {
        self.creds.read().await.lid.clone()
    }

    /// Applies a credential mutation. The caller is responsible for emitting
    /// `creds.update` afterwards.
    pub async fn process_command(&self, command: DeviceCommand) {
        apply_command(&mut *self.creds.write().await, command);
    }

    /// Cache-first read-through of keyed rows.
    pub async fn get(
        &self,
        kind: StoreKind,
        ids: &[String],
    ) -> Result<HashMap<String, Vec<u8>>> {
        let mut found = HashMap::with_capacity(ids.len());
        let mut misses = Vec::new();
        for id in ids {
            match self.cache.get(&(kind, id.clone())).await {
                Some(value) => {
                    found.insert(id.clone(), value);
                }
                None => misses.push(id.clone()),
            }
        }
        if !misses.is_empty() {
            let fetched = self.backend.get(kind, &misses).await?;
            for (id, value) in fetched {
                self.cache.insert((kind, id.clone()), value.clone()).await;
                found.insert(id, value);
            }
        }
        Ok(found)
    }

    pub async fn get_one(&self, kind: StoreKind, id: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.get(kind, &[id.to_string()]).await?.remove(id))
    }

    /// Immediate batched write, outside any transaction.
    pub async fn set(&self, rows: Vec<RowWrite>) -> Result<()> {
        self.backend.set(rows.clone()).await?;
        self.apply_to_cache(&rows).await;
        Ok(())
    }

    /// Opens a transaction. Reads inside it see its own uncommitted writes;
    /// nothing reaches the backend until [`DeviceStore::commit`].
    pub fn begin(self: &Arc<Self>) -> StoreTransaction {
        StoreTransaction {
            store: Arc::clone(self),
            pending: HashMap::new(),
        }
    }

    /// Commits a transaction's writes as one batch, retrying with
    /// exponential backoff. Commits are serialized: concurrent transactions
    /// never interleave their side effects.
    pub async fn commit(&self, tx: StoreTransaction) -> Result<()> {
        if tx.pending.is_empty() {
            return Ok(());
        }
        let rows: Vec<RowWrite> = tx
            .pending
            .into_iter()
            .map(|((kind, id), value)| (kind, id, value))
            .collect();

        let _guard = self.commit_lock.lock().await;
        let mut delay = COMMIT_RETRY_BASE;
        let mut last_error = String::new();
        for attempt in 1..=self.max_commit_retries {
            match self.backend.set(rows.clone()).await {
                Ok(()) => {
                    self.apply_to_cache(&rows).await;
                    return Ok(());
                }
                Err(e) => {
                    warn!(target: "Store", "commit attempt {attempt} failed: {e}");
                    last_error = e.to_string();
                    if attempt < self.max_commit_retries {
                        sleep(delay).await;
                        delay *= 2;
                    }
                }
            }
        }
        Err(StoreError::CommitFailed {
            attempts: self.max_commit_retries,
            last_error,
        })
    }

    pub async fn clear(&self) -> Result<()> {
        self.cache.invalidate_all();
        self.backend.clear().await
    }

    async fn apply_to_cache(&self, rows: &[RowWrite]) {
        for (kind, id, value) in rows {
            match value {
                Some(bytes) => {
                    self.cache
                        .insert((*kind, id.clone()), bytes.clone())
                        .await;
                }
                None => self.cache.invalidate(&(*kind, id.clone())).await,
            }
        }
    }
}

/// A batch of row writes with read-your-writes semantics.
pub struct StoreTransaction {
    store: Arc<DeviceStore>,
    pending: HashMap<(StoreKind, String), Option<Vec<u8>>>,
}

impl StoreTransaction {
    pub async fn get(&self, kind: StoreKind, id: &str) -> Result<Option<Vec<u8>>> {
        if let Some(value) = self.pending.get(&(kind, id.to_string())) {
            return Ok(value.clone());
        }
        self.store.get_one(kind, id).await
    }

    pub fn set(&mut self, kind: StoreKind, id: impl Into<String>, value: Option<Vec<u8>>) {
        self.pending.insert((kind, id.into()), value);
    }
}

fn storage_err(e: StoreError) -> SignalError {
    SignalError::Storage(e.to_string())
}

#[async_trait]
impl IdentityStore for DeviceStore {
    async fn get_identity_key_pair(&self) -> SignalResult<KeyPair> {
        Ok(self.creds.read().await.signed_identity_key.clone())
    }

    async fn get_local_registration_id(&self) -> SignalResult<u32> {
        Ok(self.creds.read().await.registration_id)
    }

    async fn save_identity(&self, address: &SignalAddress, key: [u8; 32]) -> SignalResult<bool> {
        let previous = self.get_identity(address).await?;
        self.set(vec![(
            StoreKind::Identity,
            address.to_string(),
            Some(key.to_vec()),
        )])
        .await
        .map_err(storage_err)?;
        let changed = previous.map(|p| p != key).unwrap_or(false);
        if changed {
            warn!(target: "Store", "identity for {address} changed; continuing (trust is permissive)");
        }
        Ok(changed)
    }

    async fn get_identity(&self, address: &SignalAddress) -> SignalResult<Option<[u8; 32]>> {
        let row = self
            .get_one(StoreKind::Identity, &address.to_string())
            .await
            .map_err(storage_err)?;
        Ok(row.and_then(|b| b.as_slice().try_into().ok()))
    }
}

#[async_trait]
impl SessionStore for DeviceStore {
    async fn load_session(&self, address: &SignalAddress) -> SignalResult<Option<SessionRecord>> {
        match self
            .get_one(StoreKind::Session, &address.to_string())
            .await
            .map_err(storage_err)?
        {
            Some(bytes) => Ok(Some(SessionRecord::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn store_session(
        &self,
        address: &SignalAddress,
        record: &SessionRecord,
    ) -> SignalResult<()> {
        self.set(vec![(
            StoreKind::Session,
            address.to_string(),
            Some(record.serialize()?),
        )])
        .await
        .map_err(storage_err)
    }

    async fn contains_session(&self, address: &SignalAddress) -> SignalResult<bool> {
        Ok(self
            .get_one(StoreKind::Session, &address.to_string())
            .await
            .map_err(storage_err)?
            .is_some())
    }

    async fn delete_session(&self, address: &SignalAddress) -> SignalResult<()> {
        self.set(vec![(StoreKind::Session, address.to_string(), None)])
            .await
            .map_err(storage_err)
    }
}

#[async_trait]
impl PreKeyStore for DeviceStore {
    async fn load_prekey(&self, id: u32) -> SignalResult<Option<PreKey>> {
        match self
            .get_one(StoreKind::PreKey, &id.to_string())
            .await
            .map_err(storage_err)?
        {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| SignalError::Storage(e.to_string())),
            None => Ok(None),
        }
    }

    async fn store_prekey(&self, id: u32, record: PreKey) -> SignalResult<()> {
        let bytes = serde_json::to_vec(&record).map_err(|e| SignalError::Storage(e.to_string()))?;
        self.set(vec![(StoreKind::PreKey, id.to_string(), Some(bytes))])
            .await
            .map_err(storage_err)
    }

    async fn remove_prekey(&self, id: u32) -> SignalResult<()> {
        self.set(vec![(StoreKind::PreKey, id.to_string(), None)])
            .await
            .map_err(storage_err)
    }
}

#[async_trait]
impl SignedPreKeyStore for DeviceStore {
    async fn load_signed_prekey(&self, id: u32) -> SignalResult<Option<PreKey>> {
        let creds = self.creds.read().await;
        if creds.signed_pre_key.key_id == id {
            Ok(Some(creds.signed_pre_key.clone()))
        } else {
            Ok(None)
        }
    }
}

#[async_trait]
impl SenderKeyStore for DeviceStore {
    async fn load_sender_key(
        &self,
        name: &SenderKeyName,
    ) -> SignalResult<Option<SenderKeyRecord>> {
        match self
            .get_one(StoreKind::SenderKey, &name.to_string())
            .await
            .map_err(storage_err)?
        {
            Some(bytes) => Ok(Some(SenderKeyRecord::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn store_sender_key(
        &self,
        name: &SenderKeyName,
        record: &SenderKeyRecord,
    ) -> SignalResult<()> {
        self.set(vec![(
            StoreKind::SenderKey,
            name.to_string(),
            Some(record.serialize()?),
        )])
        .await
        .map_err(storage_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyBackend {
        inner: memory::MemoryStore,
        failures_left: AtomicU32,
        set_calls: AtomicU32,
    }

    impl FlakyBackend {
        fn failing(n: u32) -> Self {
            Self {
                inner: memory::MemoryStore::new(),
                failures_left: AtomicU32::new(n),
                set_calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl KeyStoreBackend for FlakyBackend {
        async fn get(&self, kind: StoreKind, ids: &[String]) -> Result<HashMap<String, Vec<u8>>> {
            self.inner.get(kind, ids).await
        }

        async fn set(&self, rows: Vec<RowWrite>) -> Result<()> {
            self.set_calls.fetch_add(1, Ordering::SeqCst);
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(StoreError::Backend("injected failure".into()));
            }
            self.inner.set(rows).await
        }

        async fn clear(&self) -> Result<()> {
            self.inner.clear().await
        }
    }

    fn fresh_store() -> Arc<DeviceStore> {
        DeviceStore::new(AuthCreds::init(), Arc::new(memory::MemoryStore::new()))
    }

    #[tokio::test]
    async fn transaction_reads_see_uncommitted_writes() {
        let store = fresh_store();
        let mut tx = store.begin();
        tx.set(StoreKind::PreKey, "7", Some(vec![1, 2, 3]));
        assert_eq!(
            tx.get(StoreKind::PreKey, "7").await.unwrap(),
            Some(vec![1, 2, 3])
        );
        // Not visible outside the transaction yet.
        assert_eq!(store.get_one(StoreKind::PreKey, "7").await.unwrap(), None);

        store.commit(tx).await.unwrap();
        assert_eq!(
            store.get_one(StoreKind::PreKey, "7").await.unwrap(),
            Some(vec![1, 2, 3])
        );
    }

    #[tokio::test(start_paused = true)]
    async fn commit_retries_with_backoff_then_succeeds() {
        let backend = Arc::new(FlakyBackend::failing(2));
        let store = DeviceStore::new(AuthCreds::init(), backend.clone());

        let mut tx = store.begin();
        tx.set(StoreKind::Session, "peer.0", Some(vec![9]));
        store.commit(tx).await.unwrap();

        assert_eq!(backend.set_calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            store.get_one(StoreKind::Session, "peer.0").await.unwrap(),
            Some(vec![9])
        );
    }

    #[tokio::test(start_paused = true)]
    async fn failed_commit_leaves_prior_value_visible() {
        let backend = Arc::new(FlakyBackend::failing(0));
        let store = DeviceStore::new(AuthCreds::init(), backend.clone());
        store
            .set(vec![(StoreKind::PreKey, "3".into(), Some(vec![1]))])
            .await
            .unwrap();

        // All subsequent commits fail.
        backend.failures_left.store(u32::MAX, Ordering::SeqCst);
        let mut tx = store.begin();
        tx.set(StoreKind::PreKey, "3", Some(vec![2]));
        assert!(matches!(
            store.commit(tx).await,
            Err(StoreError::CommitFailed { attempts: 5, .. })
        ));

        assert_eq!(
            store.get_one(StoreKind::PreKey, "3").await.unwrap(),
            Some(vec![1])
        );
    }

    #[tokio::test]
    async fn deletes_are_row_removals() {
        let store = fresh_store();
        store
            .set(vec![(StoreKind::SenderKey, "g::a.0".into(), Some(vec![5]))])
            .await
            .unwrap();
        store
            .set(vec![(StoreKind::SenderKey, "g::a.0".into(), None)])
            .await
            .unwrap();
        assert_eq!(
            store.get_one(StoreKind::SenderKey, "g::a.0").await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn registration_id_is_stable_and_14_bit() {
        let creds = AuthCreds::init();
        assert!(creds.registration_id >= 1 && creds.registration_id <= 16380);
        assert_eq!(creds.next_pre_key_id, 1);
        assert_eq!(creds.first_unuploaded_pre_key_id, 1);
    }

    #[tokio::test]
    async fn signed_prekey_is_served_from_creds() {
        let store = fresh_store();
        let creds = store.creds().await;
        let spk = store
            .load_signed_prekey(creds.signed_pre_key.key_id)
            .await
            .unwrap()
            .expect("current signed prekey");
        assert_eq!(spk.key_id, creds.signed_pre_key.key_id);
        assert!(store.load_signed_prekey(999).await.unwrap().is_none());
    }
}
