//! One-to-one session establishment and the session cipher.
//!
//! `process_prekey_bundle` runs the initiator half of X3DH against a fetched
//! bundle; `message_decrypt_prekey` runs the responder half when a `pkmsg`
//! arrives. After that both sides converge on the same double-ratchet state
//! and exchange `msg` ciphertexts.

use crate::crypto::cbc;
use crate::crypto::key_pair::{KeyPair, DJB_TYPE};
use crate::crypto::xed25519;
use crate::proto::{PreKeyWhisperMessageProto, WhisperMessageProto};
use crate::signal::address::SignalAddress;
use crate::signal::error::{SignalError, SignalResult};
use crate::signal::ratchet::{derive_initial_keys, MessageKeys};
use crate::signal::record::{
    PendingPreKey, ReceiverChain, SenderChain, SessionRecord, MAX_SKIPPED_MESSAGE_KEYS,
};
use crate::signal::store::{IdentityStore, PreKeyStore, SessionStore, SignedPreKeyStore};
use hmac::{Hmac, Mac};
use prost::Message as ProstMessage;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

const CIPHERTEXT_VERSION: u8 = 3;
const VERSION_BYTE: u8 = (CIPHERTEXT_VERSION << 4) | CIPHERTEXT_VERSION;
const MAC_LENGTH: usize = 8;
const DISCONTINUITY: [u8; 32] = [0xFF; 32];

/// The two ciphertext kinds carried in `enc` children.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CiphertextType {
    PreKey,
    Whisper,
}

impl CiphertextType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CiphertextType::PreKey => "pkmsg",
            CiphertextType::Whisper => "msg",
        }
    }
}

/// A peer's published key bundle, as fetched from the server.
#[derive(Debug, Clone)]
pub struct PreKeyBundle {
    pub registration_id: u32,
    pub identity_key: [u8; 32],
    pub signed_pre_key_id: u32,
    pub signed_pre_key_pub: [u8; 32],
    pub signed_pre_key_signature: [u8; 64],
    pub pre_key: Option<(u32, [u8; 32])>,
}

/// Installs a session from a peer's bundle (initiator side of X3DH).
pub async fn process_prekey_bundle(
    address: &SignalAddress,
    bundle: &PreKeyBundle,
    session_store: &dyn SessionStore,
    identity_store: &dyn IdentityStore,
) -> SignalResult<()> {
    let mut signed_key_message = [0u8; 33];
    signed_key_message[0] = DJB_TYPE;
    signed_key_message[1..].copy_from_slice(&bundle.signed_pre_key_pub);
    if !xed25519::verify(
        &bundle.identity_key,
        &signed_key_message,
        &bundle.signed_pre_key_signature,
    ) {
        return Err(SignalError::BadSignedPreKeySignature);
    }

    let our_identity = identity_store.get_identity_key_pair().await?;
    let base_key = KeyPair::new();

    let mut secrets = Vec::with_capacity(32 * 5);
    secrets.extend_from_slice(&DISCONTINUITY);
    secrets.extend_from_slice(&our_identity.shared_secret(&bundle.signed_pre_key_pub));
    secrets.extend_from_slice(&base_key.shared_secret(&bundle.identity_key));
    secrets.extend_from_slice(&base_key.shared_secret(&bundle.signed_pre_key_pub));
    if let Some((_, one_time_pub)) = &bundle.pre_key {
        secrets.extend_from_slice(&base_key.shared_secret(one_time_pub));
    }

    let (root, initial_recv_chain) = derive_initial_keys(&secrets)?;
    let our_ratchet = KeyPair::new();
    let (root, send_chain) = root.create_chain(&bundle.signed_pre_key_pub, &our_ratchet)?;

    let record = SessionRecord {
        root_key: root,
        sender_chain: SenderChain {
            ratchet_key: our_ratchet,
            chain_key: send_chain,
        },
        receiver_chains: vec![ReceiverChain {
            ratchet_key: bundle.signed_pre_key_pub,
            chain_key: initial_recv_chain,
            skipped_keys: Vec::new(),
        }],
        local_identity: our_identity.public_key,
        remote_identity: bundle.identity_key,
        remote_registration_id: bundle.registration_id,
        previous_counter: 0,
        alice_base_key: base_key.public_key,
        pending_pre_key: Some(PendingPreKey {
            pre_key_id: bundle.pre_key.as_ref().map(|(id, _)| *id),
            signed_pre_key_id: bundle.signed_pre_key_id,
            base_key: base_key.public_key,
        }),
    };

    identity_store
        .save_identity(address, bundle.identity_key)
        .await?;
    session_store.store_session(address, &record).await
}

/// Encrypts under an existing session. Returns `pkmsg` while the peer has
/// not yet acknowledged the session, `msg` afterwards.
pub async fn message_encrypt(
    plaintext: &[u8],
    address: &SignalAddress,
    session_store: &dyn SessionStore,
    identity_store: &dyn IdentityStore,
) -> SignalResult<(CiphertextType, Vec<u8>)> {
    let mut record = session_store
        .load_session(address)
        .await?
        .ok_or_else(|| SignalError::NoSession(address.to_string()))?;

    let message_keys = record.sender_chain.chain_key.message_keys()?;
    let ciphertext = cbc::encrypt(&message_keys.cipher_key, &message_keys.iv, plaintext)?;

    let proto = WhisperMessageProto {
        ratchet_key: Some(record.sender_chain.ratchet_key.public_key.to_vec()),
        counter: Some(message_keys.index),
        previous_counter: Some(record.previous_counter),
        ciphertext: Some(ciphertext),
    };

    let mut body = Vec::with_capacity(proto.encoded_len() + 1 + MAC_LENGTH);
    body.push(VERSION_BYTE);
    proto.encode(&mut body).expect("vec write cannot fail");
    let mac = envelope_mac(
        &message_keys.mac_key,
        &record.local_identity,
        &record.remote_identity,
        &body,
    );
    body.extend_from_slice(&mac);

    record.sender_chain.chain_key = record.sender_chain.chain_key.next();

    let (kind, serialized) = match &record.pending_pre_key {
        Some(pending) => {
            let registration_id = identity_store.get_local_registration_id().await?;
            let pk_proto = PreKeyWhisperMessageProto {
                pre_key_id: pending.pre_key_id,
                base_key: Some(pending.base_key.to_vec()),
                identity_key: Some(record.local_identity.to_vec()),
                message: Some(body),
                registration_id: Some(registration_id),
                signed_pre_key_id: Some(pending.signed_pre_key_id),
            };
            let mut out = Vec::with_capacity(pk_proto.encoded_len() + 1);
            out.push(VERSION_BYTE);
            pk_proto.encode(&mut out).expect("vec write cannot fail");
            (CiphertextType::PreKey, out)
        }
        None => (CiphertextType::Whisper, body),
    };

    session_store.store_session(address, &record).await?;
    Ok((kind, serialized))
}

/// Decrypts a `pkmsg`: builds the responder session if this base key is new,
/// then decrypts the inner whisper message. The consumed one-time pre-key is
/// removed from the store after the first successful decrypt.
pub async fn message_decrypt_prekey(
    serialized: &[u8],
    address: &SignalAddress,
    session_store: &dyn SessionStore,
    identity_store: &dyn IdentityStore,
    prekey_store: &dyn PreKeyStore,
    signed_prekey_store: &dyn SignedPreKeyStore,
) -> SignalResult<Vec<u8>> {
    let (version, body) = split_version(serialized)?;
    if version != CIPHERTEXT_VERSION {
        return Err(SignalError::InvalidMessage("unsupported pkmsg version"));
    }
    let envelope = PreKeyWhisperMessageProto::decode(body)?;

    let their_base: [u8; 32] = envelope
        .base_key
        .as_deref()
        .and_then(|b| b.try_into().ok())
        .ok_or(SignalError::InvalidMessage("pkmsg without base key"))?;
    let their_identity: [u8; 32] = envelope
        .identity_key
        .as_deref()
        .and_then(|b| b.try_into().ok())
        .ok_or(SignalError::InvalidMessage("pkmsg without identity key"))?;
    let inner = envelope
        .message
        .as_deref()
        .ok_or(SignalError::InvalidMessage("pkmsg without inner message"))?;

    let existing = session_store.load_session(address).await?;
    let session_is_current = existing
        .as_ref()
        .map(|r| r.alice_base_key == their_base)
        .unwrap_or(false);

    let mut record = if session_is_current {
        existing.expect("checked above")
    } else {
        let signed_pre_key_id = envelope
            .signed_pre_key_id
            .ok_or(SignalError::InvalidMessage("pkmsg without signed pre-key id"))?;
        let signed_pre_key = signed_prekey_store
            .load_signed_prekey(signed_pre_key_id)
            .await?
            .ok_or(SignalError::MissingSignedPreKey(signed_pre_key_id))?;
        let one_time = match envelope.pre_key_id {
            Some(id) => Some(
                prekey_store
                    .load_prekey(id)
                    .await?
                    .ok_or(SignalError::MissingPreKey(id))?,
            ),
            None => None,
        };

        let our_identity = identity_store.get_identity_key_pair().await?;
        let mut secrets = Vec::with_capacity(32 * 5);
        secrets.extend_from_slice(&DISCONTINUITY);
        secrets.extend_from_slice(&signed_pre_key.key_pair.shared_secret(&their_identity));
        secrets.extend_from_slice(&our_identity.shared_secret(&their_base));
        secrets.extend_from_slice(&signed_pre_key.key_pair.shared_secret(&their_base));
        if let Some(otp) = &one_time {
            secrets.extend_from_slice(&otp.key_pair.shared_secret(&their_base));
        }

        let (root, send_chain) = derive_initial_keys(&secrets)?;
        identity_store.save_identity(address, their_identity).await?;

        SessionRecord {
            root_key: root,
            sender_chain: SenderChain {
                ratchet_key: signed_pre_key.key_pair.clone(),
                chain_key: send_chain,
            },
            receiver_chains: Vec::new(),
            local_identity: our_identity.public_key,
            remote_identity: their_identity,
            remote_registration_id: envelope.registration_id.unwrap_or_default(),
            previous_counter: 0,
            alice_base_key: their_base,
            pending_pre_key: None,
        }
    };

    let plaintext = decrypt_whisper_into(&mut record, inner)?;
    session_store.store_session(address, &record).await?;

    // The one-time pre-key is single use; drop it only after the decrypt
    // actually succeeded.
    if !session_is_current {
        if let Some(id) = envelope.pre_key_id {
            prekey_store.remove_prekey(id).await?;
        }
    }

    Ok(plaintext)
}

/// Decrypts a `msg` under the established session.
pub async fn message_decrypt(
    serialized: &[u8],
    address: &SignalAddress,
    session_store: &dyn SessionStore,
    _identity_store: &dyn IdentityStore,
) -> SignalResult<Vec<u8>> {
    let mut record = session_store
        .load_session(address)
        .await?
        .ok_or_else(|| SignalError::NoSession(address.to_string()))?;
    let plaintext = decrypt_whisper_into(&mut record, serialized)?;
    session_store.store_session(address, &record).await?;
    Ok(plaintext)
}

fn split_version(serialized: &[u8]) -> SignalResult<(u8, &[u8])> {
    let (&version_byte, rest) = serialized
        .split_first()
        .ok_or(SignalError::InvalidMessage("empty ciphertext"))?;
    Ok((version_byte >> 4, rest))
}

fn envelope_mac(
    mac_key: &[u8; 32],
    sender_identity: &[u8; 32],
    receiver_identity: &[u8; 32],
    body: &[u8],
) -> [u8; MAC_LENGTH] {
    let mut mac = HmacSha256::new_from_slice(mac_key).expect("hmac accepts any key length");
    mac.update(sender_identity);
    mac.update(receiver_identity);
    mac.update(body);
    let full: [u8; 32] = mac.finalize().into_bytes().into();
    let mut out = [0u8; MAC_LENGTH];
    out.copy_from_slice(&full[..MAC_LENGTH]);
    out
}

fn chain_message_keys(chain: &mut ReceiverChain, counter: u32) -> SignalResult<MessageKeys> {
    if counter < chain.chain_key.index {
        if let Some(pos) = chain.skipped_keys.iter().position(|k| k.index == counter) {
            return Ok(chain.skipped_keys.remove(pos));
        }
        return Err(SignalError::DuplicateMessage(counter));
    }
    if counter - chain.chain_key.index > MAX_SKIPPED_MESSAGE_KEYS as u32 {
        return Err(SignalError::CounterTooFar(counter));
    }
    while chain.chain_key.index < counter {
        chain.skipped_keys.push(chain.chain_key.message_keys()?);
        chain.chain_key = chain.chain_key.next();
    }
    let keys = chain.chain_key.message_keys()?;
    chain.chain_key = chain.chain_key.next();
    Ok(keys)
}

fn decrypt_whisper_into(record: &mut SessionRecord, serialized: &[u8]) -> SignalResult<Vec<u8>> {
    let (version, _) = split_version(serialized)?;
    if version != CIPHERTEXT_VERSION {
        return Err(SignalError::InvalidMessage("unsupported message version"));
    }
    if serialized.len() < 1 + MAC_LENGTH {
        return Err(SignalError::InvalidMessage("message too short"));
    }
    let (body, their_mac) = serialized.split_at(serialized.len() - MAC_LENGTH);
    let proto = WhisperMessageProto::decode(&body[1..])?;

    let their_ratchet: [u8; 32] = proto
        .ratchet_key
        .as_deref()
        .and_then(|b| b.try_into().ok())
        .ok_or(SignalError::InvalidMessage("message without ratchet key"))?;
    let counter = proto
        .counter
        .ok_or(SignalError::InvalidMessage("message without counter"))?;
    let ciphertext = proto
        .ciphertext
        .as_deref()
        .ok_or(SignalError::InvalidMessage("message without ciphertext"))?;

    // A ratchet key we have not seen triggers a DH ratchet step: derive the
    // new receive chain, then rotate our own sending ratchet against it.
    if record.receiver_chain_mut(&their_ratchet).is_none() {
        let (root, recv_chain) = record
            .root_key
            .create_chain(&their_ratchet, &record.sender_chain.ratchet_key)?;
        record.push_receiver_chain(ReceiverChain {
            ratchet_key: their_ratchet,
            chain_key: recv_chain,
            skipped_keys: Vec::new(),
        });

        let our_new_ratchet = KeyPair::new();
        let (root, send_chain) = root.create_chain(&their_ratchet, &our_new_ratchet)?;
        record.previous_counter = record.sender_chain.chain_key.index;
        record.root_key = root;
        record.sender_chain = SenderChain {
            ratchet_key: our_new_ratchet,
            chain_key: send_chain,
        };
    }

    let chain = record
        .receiver_chain_mut(&their_ratchet)
        .expect("chain just ensured");
    let message_keys = chain_message_keys(chain, counter)?;

    let expected = envelope_mac(
        &message_keys.mac_key,
        &record.remote_identity,
        &record.local_identity,
        body,
    );
    if expected.as_slice() != their_mac {
        return Err(SignalError::BadMac);
    }

    let plaintext = cbc::decrypt(&message_keys.cipher_key, &message_keys.iv, ciphertext)?;

    // The peer has clearly processed our pkmsg once we can read a reply.
    record.clear_pending_pre_key();
    Ok(plaintext)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::store::tests::TestStore;

    fn bundle_for(store: &TestStore, pre_key_id: Option<u32>) -> PreKeyBundle {
        store.bundle(pre_key_id)
    }

    #[tokio::test]
    async fn first_contact_uses_pkmsg_and_consumes_prekey() {
        let alice = TestStore::new(1);
        let bob = TestStore::new(2);
        bob.add_prekey(31).await;

        let bob_addr = SignalAddress::new("bob".into(), 0);
        let alice_addr = SignalAddress::new("alice".into(), 0);

        process_prekey_bundle(&bob_addr, &bundle_for(&bob, Some(31)), &alice, &alice)
            .await
            .unwrap();

        let (kind, ct) = message_encrypt(b"hi bob", &bob_addr, &alice, &alice)
            .await
            .unwrap();
        assert_eq!(kind, CiphertextType::PreKey);

        let pt = message_decrypt_prekey(&ct, &alice_addr, &bob, &bob, &bob, &bob)
            .await
            .unwrap();
        assert_eq!(pt, b"hi bob");

        // Pre-key 31 was single use.
        assert!(bob.load_prekey(31).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn conversation_converges_to_whisper_messages() {
        let alice = TestStore::new(10);
        let bob = TestStore::new(20);
        bob.add_prekey(7).await;

        let bob_addr = SignalAddress::new("bob".into(), 0);
        let alice_addr = SignalAddress::new("alice".into(), 0);

        process_prekey_bundle(&bob_addr, &bundle_for(&bob, Some(7)), &alice, &alice)
            .await
            .unwrap();

        let (_, ct1) = message_encrypt(b"one", &bob_addr, &alice, &alice).await.unwrap();
        let pt1 = message_decrypt_prekey(&ct1, &alice_addr, &bob, &bob, &bob, &bob)
            .await
            .unwrap();
        assert_eq!(pt1, b"one");

        // Bob replies; after the reply round-trips, Alice stops sending pkmsg.
        let (kind, ct2) = message_encrypt(b"two", &alice_addr, &bob, &bob).await.unwrap();
        assert_eq!(kind, CiphertextType::Whisper);
        let pt2 = message_decrypt(&ct2, &bob_addr, &alice, &alice).await.unwrap();
        assert_eq!(pt2, b"two");

        let (kind, ct3) = message_encrypt(b"three", &bob_addr, &alice, &alice)
            .await
            .unwrap();
        assert_eq!(kind, CiphertextType::Whisper);
        let pt3 = message_decrypt(&ct3, &alice_addr, &bob, &bob).await.unwrap();
        assert_eq!(pt3, b"three");
    }

    #[tokio::test]
    async fn out_of_order_delivery_within_a_chain() {
        let alice = TestStore::new(3);
        let bob = TestStore::new(4);
        bob.add_prekey(1).await;

        let bob_addr = SignalAddress::new("bob".into(), 0);
        let alice_addr = SignalAddress::new("alice".into(), 0);

        process_prekey_bundle(&bob_addr, &bundle_for(&bob, Some(1)), &alice, &alice)
            .await
            .unwrap();

        let (_, first) = message_encrypt(b"first", &bob_addr, &alice, &alice).await.unwrap();
        let (_, second) = message_encrypt(b"second", &bob_addr, &alice, &alice)
            .await
            .unwrap();

        // Deliver in reverse order.
        let pt2 = message_decrypt_prekey(&second, &alice_addr, &bob, &bob, &bob, &bob)
            .await
            .unwrap();
        assert_eq!(pt2, b"second");
        let pt1 = message_decrypt_prekey(&first, &alice_addr, &bob, &bob, &bob, &bob)
            .await
            .unwrap();
        assert_eq!(pt1, b"first");
    }

    #[tokio::test]
    async fn tampered_mac_is_rejected() {
        let alice = TestStore::new(5);
        let bob = TestStore::new(6);
        bob.add_prekey(2).await;

        let bob_addr = SignalAddress::new("bob".into(), 0);
        let alice_addr = SignalAddress::new("alice".into(), 0);

        process_prekey_bundle(&bob_addr, &bundle_for(&bob, Some(2)), &alice, &alice)
            .await
            .unwrap();
        let (_, mut ct) = message_encrypt(b"payload", &bob_addr, &alice, &alice)
            .await
            .unwrap();
        let last = ct.len() - 1;
        ct[last] ^= 0xFF;
        assert!(
            message_decrypt_prekey(&ct, &alice_addr, &bob, &bob, &bob, &bob)
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn bundle_without_one_time_prekey_still_works() {
        let alice = TestStore::new(7);
        let bob = TestStore::new(8);

        let bob_addr = SignalAddress::new("bob".into(), 0);
        let alice_addr = SignalAddress::new("alice".into(), 0);

        process_prekey_bundle(&bob_addr, &bundle_for(&bob, None), &alice, &alice)
            .await
            .unwrap();
        let (_, ct) = message_encrypt(b"no otp", &bob_addr, &alice, &alice).await.unwrap();
        let pt = message_decrypt_prekey(&ct, &alice_addr, &bob, &bob, &bob, &bob)
            .await
            .unwrap();
        assert_eq!(pt, b"no otp");
    }
}
