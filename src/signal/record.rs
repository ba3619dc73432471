//! Session and sender-key records. These serialize to the opaque row bytes
//! the key store holds; the store never interprets them.

use crate::crypto::key_pair::KeyPair;
use crate::signal::error::{SignalError, SignalResult};
use crate::signal::ratchet::{ChainKey, MessageKeys, RootKey, SenderChainKey, SenderMessageKey};
use serde::{Deserialize, Serialize};

/// How many receiver chains are retained; older ratchet keys fall off.
const MAX_RECEIVER_CHAINS: usize = 5;
/// Cap on message keys skipped within one chain.
pub const MAX_SKIPPED_MESSAGE_KEYS: usize = 2000;
const MAX_SENDER_KEY_STATES: usize = 5;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SenderChain {
    pub ratchet_key: KeyPair,
    pub chain_key: ChainKey,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceiverChain {
    pub ratchet_key: [u8; 32],
    pub chain_key: ChainKey,
    pub skipped_keys: Vec<MessageKeys>,
}

/// Pre-key metadata carried on outgoing messages until the peer acknowledges
/// the session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingPreKey {
    pub pre_key_id: Option<u32>,
    pub signed_pre_key_id: u32,
    pub base_key: [u8; 32],
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub root_key: RootKey,
    pub sender_chain: SenderChain,
    pub receiver_chains: Vec<ReceiverChain>,
    pub local_identity: [u8; 32],
    pub remote_identity: [u8; 32],
    pub remote_registration_id: u32,
    pub previous_counter: u32,
    /// The base key that created this session; lets a re-delivered pkmsg be
    /// recognized instead of re-running X3DH.
    pub alice_base_key: [u8; 32],
    pub pending_pre_key: Option<PendingPreKey>,
}

impl SessionRecord {
    pub fn serialize(&self) -> SignalResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| SignalError::Storage(e.to_string()))
    }

    pub fn deserialize(bytes: &[u8]) -> SignalResult<Self> {
        serde_json::from_slice(bytes).map_err(|e| SignalError::Storage(e.to_string()))
    }

    pub fn receiver_chain_mut(&mut self, ratchet_key: &[u8; 32]) -> Option<&mut ReceiverChain> {
        self.receiver_chains
            .iter_mut()
            .find(|c| &c.ratchet_key == ratchet_key)
    }

    pub fn push_receiver_chain(&mut self, chain: ReceiverChain) {
        self.receiver_chains.push(chain);
        if self.receiver_chains.len() > MAX_RECEIVER_CHAINS {
            self.receiver_chains.remove(0);
        }
    }

    pub fn clear_pending_pre_key(&mut self) {
        self.pending_pre_key = None;
    }

    pub fn has_unacknowledged_pre_key(&self) -> bool {
        self.pending_pre_key.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SenderKeyState {
    pub key_id: u32,
    pub chain_key: SenderChainKey,
    pub signing_pub: [u8; 32],
    pub signing_priv: Option<[u8; 32]>,
    pub skipped_keys: Vec<SenderMessageKey>,
}

impl SenderKeyState {
    /// Message key for `iteration`, advancing the chain and retaining
    /// skipped keys for out-of-order delivery.
    pub fn message_key_for(&mut self, iteration: u32) -> SignalResult<SenderMessageKey> {
        if iteration < self.chain_key.iteration {
            if let Some(pos) = self
                .skipped_keys
                .iter()
                .position(|k| k.iteration == iteration)
            {
                return Ok(self.skipped_keys.remove(pos));
            }
            return Err(SignalError::DuplicateMessage(iteration));
        }
        if iteration - self.chain_key.iteration > MAX_SKIPPED_MESSAGE_KEYS as u32 {
            return Err(SignalError::CounterTooFar(iteration));
        }
        while self.chain_key.iteration < iteration {
            self.skipped_keys.push(self.chain_key.message_key()?);
            self.chain_key = self.chain_key.next();
        }
        let key = self.chain_key.message_key()?;
        self.chain_key = self.chain_key.next();
        Ok(key)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SenderKeyRecord {
    /// Most recent state first.
    pub states: Vec<SenderKeyState>,
}

impl SenderKeyRecord {
    pub fn serialize(&self) -> SignalResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| SignalError::Storage(e.to_string()))
    }

    pub fn deserialize(bytes: &[u8]) -> SignalResult<Self> {
        serde_json::from_slice(bytes).map_err(|e| SignalError::Storage(e.to_string()))
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn current_state_mut(&mut self) -> Option<&mut SenderKeyState> {
        self.states.first_mut()
    }

    pub fn state_by_id_mut(&mut self, key_id: u32) -> Option<&mut SenderKeyState> {
        self.states.iter_mut().find(|s| s.key_id == key_id)
    }

    pub fn add_state(&mut self, state: SenderKeyState) {
        // Re-announcements of the key we already hold replace in place.
        self.states.retain(|s| s.key_id != state.key_id);
        self.states.insert(0, state);
        self.states.truncate(MAX_SENDER_KEY_STATES);
    }
}
