//! Storage traits the ciphers run against. The engine's device store
//! implements these on top of the keyed row backend; tests use a plain
//! in-memory implementation.

use crate::crypto::key_pair::{KeyPair, PreKey};
use crate::signal::address::{SenderKeyName, SignalAddress};
use crate::signal::error::SignalResult;
use crate::signal::record::{SenderKeyRecord, SessionRecord};
use async_trait::async_trait;

#[async_trait]
pub trait IdentityStore: Send + Sync {
    async fn get_identity_key_pair(&self) -> SignalResult<KeyPair>;
    async fn get_local_registration_id(&self) -> SignalResult<u32>;
    /// Records the peer identity. Returns true when it replaced a different
    /// key. Identity trust is permissive: a change is recorded and logged,
    /// never rejected.
    async fn save_identity(&self, address: &SignalAddress, key: [u8; 32]) -> SignalResult<bool>;
    async fn get_identity(&self, address: &SignalAddress) -> SignalResult<Option<[u8; 32]>>;
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn load_session(&self, address: &SignalAddress) -> SignalResult<Option<SessionRecord>>;
    async fn store_session(
        &self,
        address: &SignalAddress,
        record: &SessionRecord,
    ) -> SignalResult<()>;
    async fn contains_session(&self, address: &SignalAddress) -> SignalResult<bool>;
    async fn delete_session(&self, address: &SignalAddress) -> SignalResult<()>;
}

#[async_trait]
pub trait PreKeyStore: Send + Sync {
    async fn load_prekey(&self, id: u32) -> SignalResult<Option<PreKey>>;
    async fn store_prekey(&self, id: u32, record: PreKey) -> SignalResult<()>;
    async fn remove_prekey(&self, id: u32) -> SignalResult<()>;
}

#[async_trait]
pub trait SignedPreKeyStore: Send + Sync {
    async fn load_signed_prekey(&self, id: u32) -> SignalResult<Option<PreKey>>;
}

#[async_trait]
pub trait SenderKeyStore: Send + Sync {
    async fn load_sender_key(&self, name: &SenderKeyName)
        -> SignalResult<Option<SenderKeyRecord>>;
    async fn store_sender_key(
        &self,
        name: &SenderKeyName,
        record: &SenderKeyRecord,
    ) -> SignalResult<()>;
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Plain in-memory store for cipher tests.
    pub(crate) struct TestStore {
        identity: KeyPair,
        registration_id: u32,
        signed_pre_key: PreKey,
        sessions: Mutex<HashMap<String, SessionRecord>>,
        identities: Mutex<HashMap<String, [u8; 32]>>,
        prekeys: Mutex<HashMap<u32, PreKey>>,
        sender_keys: Mutex<HashMap<String, SenderKeyRecord>>,
    }

    impl TestStore {
        pub(crate) fn new(registration_id: u32) -> Self {
            let identity = KeyPair::new();
            let signed_pre_key = identity.create_signed_prekey(1);
            Self {
                identity,
                registration_id,
                signed_pre_key,
                sessions: Mutex::new(HashMap::new()),
                identities: Mutex::new(HashMap::new()),
                prekeys: Mutex::new(HashMap::new()),
                sender_keys: Mutex::new(HashMap::new()),
            }
        }

        pub(crate) async fn add_prekey(&self, id: u32) {
            self.prekeys.lock().unwrap().insert(id, PreKey::new(id));
        }

        pub(crate) fn bundle(
            &self,
            pre_key_id: Option<u32>,
        ) -> crate::signal::session::PreKeyBundle {
            let pre_key = pre_key_id.map(|id| {
                let prekeys = self.prekeys.lock().unwrap();
                let pk = prekeys.get(&id).expect("prekey must be added first");
                (id, pk.key_pair.public_key)
            });
            crate::signal::session::PreKeyBundle {
                registration_id: self.registration_id,
                identity_key: self.identity.public_key,
                signed_pre_key_id: self.signed_pre_key.key_id,
                signed_pre_key_pub: self.signed_pre_key.key_pair.public_key,
                signed_pre_key_signature: self.signed_pre_key.signature.expect("signed"),
                pre_key,
            }
        }
    }

    #[async_trait]
    impl IdentityStore for TestStore {
        async fn get_identity_key_pair(&self) -> SignalResult<KeyPair> {
            Ok(self.identity.clone())
        }

        async fn get_local_registration_id(&self) -> SignalResult<u32> {
            Ok(self.registration_id)
        }

        async fn save_identity(
            &self,
            address: &SignalAddress,
            key: [u8; 32],
        ) -> SignalResult<bool> {
            let old = self
                .identities
                .lock()
                .unwrap()
                .insert(address.to_string(), key);
            Ok(old.map(|o| o != key).unwrap_or(false))
        }

        async fn get_identity(&self, address: &SignalAddress) -> SignalResult<Option<[u8; 32]>> {
            Ok(self
                .identities
                .lock()
                .unwrap()
                .get(&address.to_string())
                .copied())
        }
    }

    #[async_trait]
    impl SessionStore for TestStore {
        async fn load_session(
            &self,
            address: &SignalAddress,
        ) -> SignalResult<Option<SessionRecord>> {
            Ok(self
                .sessions
                .lock()
                .unwrap()
                .get(&address.to_string())
                .cloned())
        }

        async fn store_session(
            &self,
            address: &SignalAddress,
            record: &SessionRecord,
        ) -> SignalResult<()> {
            self.sessions
                .lock()
                .unwrap()
                .insert(address.to_string(), record.clone());
            Ok(())
        }

        async fn contains_session(&self, address: &SignalAddress) -> SignalResult<bool> {
            Ok(self
                .sessions
                .lock()
                .unwrap()
                .contains_key(&address.to_string()))
        }

        async fn delete_session(&self, address: &SignalAddress) -> SignalResult<()> {
            self.sessions.lock().unwrap().remove(&address.to_string());
            Ok(())
        }
    }

    #[async_trait]
    impl PreKeyStore for TestStore {
        async fn load_prekey(&self, id: u32) -> SignalResult<Option<PreKey>> {
            Ok(self.prekeys.lock().unwrap().get(&id).cloned())
        }

        async fn store_prekey(&self, id: u32, record: PreKey) -> SignalResult<()> {
            self.prekeys.lock().unwrap().insert(id, record);
            Ok(())
        }

        async fn remove_prekey(&self, id: u32) -> SignalResult<()> {
            self.prekeys.lock().unwrap().remove(&id);
            Ok(())
        }
    }

    #[async_trait]
    impl SignedPreKeyStore for TestStore {
        async fn load_signed_prekey(&self, id: u32) -> SignalResult<Option<PreKey>> {
            if id == self.signed_pre_key.key_id {
                Ok(Some(self.signed_pre_key.clone()))
            } else {
                Ok(None)
            }
        }
    }

    #[async_trait]
    impl SenderKeyStore for TestStore {
        async fn load_sender_key(
            &self,
            name: &SenderKeyName,
        ) -> SignalResult<Option<SenderKeyRecord>> {
            Ok(self
                .sender_keys
                .lock()
                .unwrap()
                .get(&name.to_string())
                .cloned())
        }

        async fn store_sender_key(
            &self,
            name: &SenderKeyName,
            record: &SenderKeyRecord,
        ) -> SignalResult<()> {
            self.sender_keys
                .lock()
                .unwrap()
                .insert(name.to_string(), record.clone());
            Ok(())
        }
    }
}
