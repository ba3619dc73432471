//! Key derivation for the double ratchet and group sender chains.

use crate::crypto::key_pair::KeyPair;
use crate::signal::error::{SignalError, SignalResult};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

const MESSAGE_KEY_SEED: &[u8] = &[0x01];
const CHAIN_KEY_SEED: &[u8] = &[0x02];

fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// Expands chain material into the fixed-width buffers the ratchet needs.
fn kdf(ikm: &[u8], salt: Option<&[u8]>, info: &[u8], okm: &mut [u8]) -> SignalResult<()> {
    Hkdf::<Sha256>::new(salt, ikm)
        .expand(info, okm)
        .map_err(|_| SignalError::Cipher("hkdf output too long".to_string()))
}

/// Per-message key material derived from a chain key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageKeys {
    pub cipher_key: [u8; 32],
    pub mac_key: [u8; 32],
    pub iv: [u8; 16],
    pub index: u32,
}

/// A symmetric HMAC chain; `index` is the counter of the next message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainKey {
    pub key: [u8; 32],
    pub index: u32,
}

impl ChainKey {
    pub fn new(key: [u8; 32], index: u32) -> Self {
        Self { key, index }
    }

    pub fn message_keys(&self) -> SignalResult<MessageKeys> {
        let seed = hmac_sha256(&self.key, MESSAGE_KEY_SEED);
        let mut okm = [0u8; 80];
        kdf(&seed, None, b"WhisperMessageKeys", &mut okm)?;
        let mut cipher_key = [0u8; 32];
        let mut mac_key = [0u8; 32];
        let mut iv = [0u8; 16];
        cipher_key.copy_from_slice(&okm[0..32]);
        mac_key.copy_from_slice(&okm[32..64]);
        iv.copy_from_slice(&okm[64..80]);
        Ok(MessageKeys {
            cipher_key,
            mac_key,
            iv,
            index: self.index,
        })
    }

    pub fn next(&self) -> Self {
        Self {
            key: hmac_sha256(&self.key, CHAIN_KEY_SEED),
            index: self.index + 1,
        }
    }
}

/// The root key of a session; each DH ratchet step folds a fresh shared
/// secret into it and yields the next chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootKey {
    pub key: [u8; 32],
}

impl RootKey {
    pub fn new(key: [u8; 32]) -> Self {
        Self { key }
    }

    pub fn create_chain(
        &self,
        their_ratchet_key: &[u8; 32],
        our_ratchet_key: &KeyPair,
    ) -> SignalResult<(RootKey, ChainKey)> {
        let shared = our_ratchet_key.shared_secret(their_ratchet_key);
        let mut okm = [0u8; 64];
        kdf(&shared, Some(&self.key), b"WhisperRatchet", &mut okm)?;
        let mut root = [0u8; 32];
        let mut chain = [0u8; 32];
        root.copy_from_slice(&okm[0..32]);
        chain.copy_from_slice(&okm[32..64]);
        Ok((RootKey::new(root), ChainKey::new(chain, 0)))
    }
}

/// Derives the initial root and receive chain from the X3DH master secret.
pub fn derive_initial_keys(master_secret: &[u8]) -> SignalResult<(RootKey, ChainKey)> {
    let mut okm = [0u8; 64];
    kdf(master_secret, None, b"WhisperText", &mut okm)?;
    let mut root = [0u8; 32];
    let mut chain = [0u8; 32];
    root.copy_from_slice(&okm[0..32]);
    chain.copy_from_slice(&okm[32..64]);
    Ok((RootKey::new(root), ChainKey::new(chain, 0)))
}

/// Sender-chain derivation for group messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderChainKey {
    pub iteration: u32,
    pub seed: [u8; 32],
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderMessageKey {
    pub iteration: u32,
    pub iv: [u8; 16],
    pub cipher_key: [u8; 32],
}

impl SenderChainKey {
    pub fn new(iteration: u32, seed: [u8; 32]) -> Self {
        Self { iteration, seed }
    }

    pub fn message_key(&self) -> SignalResult<SenderMessageKey> {
        let seed = hmac_sha256(&self.seed, MESSAGE_KEY_SEED);
        let mut okm = [0u8; 48];
        kdf(&seed, None, b"WhisperGroup", &mut okm)?;
        let mut iv = [0u8; 16];
        let mut cipher_key = [0u8; 32];
        iv.copy_from_slice(&okm[0..16]);
        cipher_key.copy_from_slice(&okm[16..48]);
        Ok(SenderMessageKey {
            iteration: self.iteration,
            iv,
            cipher_key,
        })
    }

    pub fn next(&self) -> Self {
        Self {
            iteration: self.iteration + 1,
            seed: hmac_sha256(&self.seed, CHAIN_KEY_SEED),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_key_advance_changes_material() {
        let ck = ChainKey::new([1u8; 32], 0);
        let next = ck.next();
        assert_eq!(next.index, 1);
        assert_ne!(ck.key, next.key);
        assert_ne!(
            ck.message_keys().unwrap().cipher_key,
            next.message_keys().unwrap().cipher_key
        );
    }

    #[test]
    fn ratchet_step_is_symmetric() {
        let root = RootKey::new([7u8; 32]);
        let alice = KeyPair::new();
        let bob = KeyPair::new();

        let (root_a, chain_a) = root.create_chain(&bob.public_key, &alice).unwrap();
        let (root_b, chain_b) = root.create_chain(&alice.public_key, &bob).unwrap();
        assert_eq!(root_a, root_b);
        assert_eq!(chain_a, chain_b);
    }

    #[test]
    fn sender_chain_derivations_are_stable() {
        let ck = SenderChainKey::new(0, [9u8; 32]);
        let mk1 = ck.message_key().unwrap();
        let mk2 = ck.message_key().unwrap();
        assert_eq!(mk1, mk2);
        assert_eq!(ck.next().iteration, 1);
    }
}
