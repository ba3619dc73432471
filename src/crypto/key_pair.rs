use crate::crypto::xed25519;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey, StaticSecret};

/// The DJB key type marker the signal protocol prepends to serialized
/// public keys.
pub const DJB_TYPE: u8 = 5;

/// An X25519 key pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPair {
    pub public_key: [u8; 32],
    pub private_key: [u8; 32],
}

impl KeyPair {
    pub fn new() -> Self {
        let mut seed = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut seed);
        Self::from_private_key(seed)
    }

    pub fn from_private_key(private_key: [u8; 32]) -> Self {
        let private = StaticSecret::from(private_key);
        let public = PublicKey::from(&private);
        Self {
            public_key: *public.as_bytes(),
            private_key: private.to_bytes(),
        }
    }

    /// Diffie-Hellman agreement with a peer public key.
    pub fn shared_secret(&self, their_public: &[u8; 32]) -> [u8; 32] {
        x25519_dalek::x25519(self.private_key, *their_public)
    }

    /// Signs another key pair's public key, prefixed with the DJB type byte,
    /// as required for signed pre-keys.
    pub fn sign_key(&self, key_to_sign: &[u8; 32]) -> [u8; 64] {
        let mut message = [0u8; 33];
        message[0] = DJB_TYPE;
        message[1..].copy_from_slice(key_to_sign);
        self.sign_message(&message)
    }

    pub fn sign_message(&self, message: &[u8]) -> [u8; 64] {
        xed25519::sign(&self.private_key, message)
    }

    pub fn create_signed_prekey(&self, key_id: u32) -> PreKey {
        let new_key = PreKey::new(key_id);
        let signature = self.sign_key(&new_key.key_pair.public_key);
        PreKey {
            signature: Some(signature),
            ..new_key
        }
    }
}

impl Default for KeyPair {
    fn default() -> Self {
        Self::new()
    }
}

/// A pre-key with an optional signature (present on signed pre-keys).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreKey {
    pub key_pair: KeyPair,
    pub key_id: u32,
    #[serde(with = "serde_bytes")]
    pub signature: Option<[u8; 64]>,
}

impl PreKey {
    pub fn new(key_id: u32) -> Self {
        Self {
            key_pair: KeyPair::new(),
            key_id,
            signature: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dh_is_symmetric() {
        let a = KeyPair::new();
        let b = KeyPair::new();
        assert_eq!(a.shared_secret(&b.public_key), b.shared_secret(&a.public_key));
    }

    #[test]
    fn signed_prekey_verifies_under_identity_key() {
        let identity = KeyPair::new();
        let spk = identity.create_signed_prekey(1);
        let mut message = [0u8; 33];
        message[0] = DJB_TYPE;
        message[1..].copy_from_slice(&spk.key_pair.public_key);
        assert!(xed25519::verify(
            &identity.public_key,
            &message,
            &spk.signature.unwrap()
        ));
    }
}
