//! Group messaging: sender-key distribution and the group cipher (`skmsg`).

use crate::crypto::cbc;
use crate::crypto::key_pair::KeyPair;
use crate::crypto::xed25519;
use crate::proto::{SenderKeyDistributionMessageProto, SenderKeyMessageProto};
use crate::signal::address::SenderKeyName;
use crate::signal::error::{SignalError, SignalResult};
use crate::signal::ratchet::SenderChainKey;
use crate::signal::record::SenderKeyState;
use crate::signal::store::SenderKeyStore;
use prost::Message as ProstMessage;
use rand::RngCore;

const VERSION_BYTE: u8 = 0x33;
const SIGNATURE_LENGTH: usize = 64;

/// Creates (or re-announces) our sender key for a group, returning the
/// distribution message to deliver to members over 1:1 sessions.
pub async fn create_distribution_message(
    name: &SenderKeyName,
    store: &dyn SenderKeyStore,
) -> SignalResult<SenderKeyDistributionMessageProto> {
    let mut record = store.load_sender_key(name).await?.unwrap_or_default();

    if record.is_empty() {
        let (seed, key_id) = {
            let mut rng = rand::thread_rng();
            let mut seed = [0u8; 32];
            rng.fill_bytes(&mut seed);
            (seed, rng.next_u32())
        };
        let signing = KeyPair::new();
        record.add_state(SenderKeyState {
            key_id,
            chain_key: SenderChainKey::new(0, seed),
            signing_pub: signing.public_key,
            signing_priv: Some(signing.private_key),
            skipped_keys: Vec::new(),
        });
        store.store_sender_key(name, &record).await?;
    }

    let state = record
        .current_state_mut()
        .ok_or_else(|| SignalError::NoSenderKeyState(name.to_string()))?;
    Ok(SenderKeyDistributionMessageProto {
        id: Some(state.key_id),
        iteration: Some(state.chain_key.iteration),
        chain_key: Some(state.chain_key.seed.to_vec()),
        signing_key: Some(state.signing_pub.to_vec()),
    })
}

/// Installs a peer's distribution message so their `skmsg` traffic becomes
/// readable.
pub async fn process_distribution_message(
    name: &SenderKeyName,
    distribution: &SenderKeyDistributionMessageProto,
    store: &dyn SenderKeyStore,
) -> SignalResult<()> {
    let key_id = distribution
        .id
        .ok_or(SignalError::InvalidMessage("distribution without id"))?;
    let iteration = distribution
        .iteration
        .ok_or(SignalError::InvalidMessage("distribution without iteration"))?;
    let seed: [u8; 32] = distribution
        .chain_key
        .as_deref()
        .and_then(|b| b.try_into().ok())
        .ok_or(SignalError::InvalidMessage("distribution without chain key"))?;
    let signing_pub: [u8; 32] = distribution
        .signing_key
        .as_deref()
        .and_then(|b| b.try_into().ok())
        .ok_or(SignalError::InvalidMessage("distribution without signing key"))?;

    let mut record = store.load_sender_key(name).await?.unwrap_or_default();
    record.add_state(SenderKeyState {
        key_id,
        chain_key: SenderChainKey::new(iteration, seed),
        signing_pub,
        signing_priv: None,
        skipped_keys: Vec::new(),
    });
    store.store_sender_key(name, &record).await
}

/// Parses a serialized distribution message (the `axolotl` blob carried in
/// a Message).
pub fn parse_distribution_message(
    serialized: &[u8],
) -> SignalResult<SenderKeyDistributionMessageProto> {
    let (&version, body) = serialized
        .split_first()
        .ok_or(SignalError::InvalidMessage("empty distribution message"))?;
    if version >> 4 != 3 {
        return Err(SignalError::InvalidMessage(
            "unsupported distribution version",
        ));
    }
    Ok(SenderKeyDistributionMessageProto::decode(body)?)
}

pub fn serialize_distribution_message(
    distribution: &SenderKeyDistributionMessageProto,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(distribution.encoded_len() + 1);
    out.push(VERSION_BYTE);
    distribution
        .encode(&mut out)
        .expect("vec write cannot fail");
    out
}

/// Encrypts a group message under our sender key.
pub async fn group_encrypt(
    name: &SenderKeyName,
    plaintext: &[u8],
    store: &dyn SenderKeyStore,
) -> SignalResult<Vec<u8>> {
    let mut record = store
        .load_sender_key(name)
        .await?
        .ok_or_else(|| SignalError::NoSenderKeyState(name.to_string()))?;
    let state = record
        .current_state_mut()
        .ok_or_else(|| SignalError::NoSenderKeyState(name.to_string()))?;
    let signing_priv = state
        .signing_priv
        .ok_or(SignalError::InvalidMessage("sender key has no signing key"))?;

    let message_key = state.chain_key.message_key()?;
    state.chain_key = state.chain_key.next();

    let ciphertext = cbc::encrypt(&message_key.cipher_key, &message_key.iv, plaintext)?;
    let proto = SenderKeyMessageProto {
        id: Some(state.key_id),
        iteration: Some(message_key.iteration),
        ciphertext: Some(ciphertext),
    };

    let mut body = Vec::with_capacity(proto.encoded_len() + 1 + SIGNATURE_LENGTH);
    body.push(VERSION_BYTE);
    proto.encode(&mut body).expect("vec write cannot fail");
    let signature = xed25519::sign(&signing_priv, &body);
    body.extend_from_slice(&signature);

    store.store_sender_key(name, &record).await?;
    Ok(body)
}

/// Decrypts an `skmsg` from the sender this name addresses.
pub async fn group_decrypt(
    name: &SenderKeyName,
    serialized: &[u8],
    store: &dyn SenderKeyStore,
) -> SignalResult<Vec<u8>> {
    if serialized.len() < 1 + SIGNATURE_LENGTH {
        return Err(SignalError::InvalidMessage("sender key message too short"));
    }
    let (body, signature) = serialized.split_at(serialized.len() - SIGNATURE_LENGTH);
    if body[0] >> 4 != 3 {
        return Err(SignalError::InvalidMessage("unsupported skmsg version"));
    }
    let proto = SenderKeyMessageProto::decode(&body[1..])?;
    let key_id = proto
        .id
        .ok_or(SignalError::InvalidMessage("skmsg without key id"))?;
    let iteration = proto
        .iteration
        .ok_or(SignalError::InvalidMessage("skmsg without iteration"))?;
    let ciphertext = proto
        .ciphertext
        .as_deref()
        .ok_or(SignalError::InvalidMessage("skmsg without ciphertext"))?;

    let mut record = store
        .load_sender_key(name)
        .await?
        .ok_or_else(|| SignalError::NoSenderKeyState(name.to_string()))?;
    let state = record
        .state_by_id_mut(key_id)
        .ok_or_else(|| SignalError::NoSenderKeyState(name.to_string()))?;

    let signature: &[u8; 64] = signature
        .try_into()
        .map_err(|_| SignalError::InvalidMessage("bad signature length"))?;
    if !xed25519::verify(&state.signing_pub, body, signature) {
        return Err(SignalError::BadMac);
    }

    let message_key = state.message_key_for(iteration)?;
    let plaintext = cbc::decrypt(&message_key.cipher_key, &message_key.iv, ciphertext)?;

    store.store_sender_key(name, &record).await?;
    Ok(plaintext)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::store::tests::TestStore;

    fn name() -> SenderKeyName {
        SenderKeyName::new("group1@g.us".into(), "alice.0".into())
    }

    #[tokio::test]
    async fn distribution_then_encrypt_decrypt() {
        let alice = TestStore::new(1);
        let bob = TestStore::new(2);

        let skdm = create_distribution_message(&name(), &alice).await.unwrap();
        process_distribution_message(&name(), &skdm, &bob).await.unwrap();

        let ct = group_encrypt(&name(), b"group hello", &alice).await.unwrap();
        let pt = group_decrypt(&name(), &ct, &bob).await.unwrap();
        assert_eq!(pt, b"group hello");

        // Chain advances per message.
        let ct2 = group_encrypt(&name(), b"again", &alice).await.unwrap();
        assert_ne!(ct, ct2);
        assert_eq!(group_decrypt(&name(), &ct2, &bob).await.unwrap(), b"again");
    }

    #[tokio::test]
    async fn decrypt_without_distribution_fails() {
        let alice = TestStore::new(1);
        let bob = TestStore::new(2);

        create_distribution_message(&name(), &alice).await.unwrap();
        let ct = group_encrypt(&name(), b"secret", &alice).await.unwrap();
        assert!(matches!(
            group_decrypt(&name(), &ct, &bob).await,
            Err(SignalError::NoSenderKeyState(_))
        ));
    }

    #[tokio::test]
    async fn out_of_order_group_messages() {
        let alice = TestStore::new(1);
        let bob = TestStore::new(2);

        let skdm = create_distribution_message(&name(), &alice).await.unwrap();
        process_distribution_message(&name(), &skdm, &bob).await.unwrap();

        let ct1 = group_encrypt(&name(), b"one", &alice).await.unwrap();
        let ct2 = group_encrypt(&name(), b"two", &alice).await.unwrap();
        assert_eq!(group_decrypt(&name(), &ct2, &bob).await.unwrap(), b"two");
        assert_eq!(group_decrypt(&name(), &ct1, &bob).await.unwrap(), b"one");
    }

    #[tokio::test]
    async fn distribution_round_trips_through_serialization() {
        let alice = TestStore::new(1);
        let skdm = create_distribution_message(&name(), &alice).await.unwrap();
        let bytes = serialize_distribution_message(&skdm);
        let parsed = parse_distribution_message(&bytes).unwrap();
        assert_eq!(parsed, skdm);
    }

    #[tokio::test]
    async fn tampered_signature_is_rejected() {
        let alice = TestStore::new(1);
        let bob = TestStore::new(2);

        let skdm = create_distribution_message(&name(), &alice).await.unwrap();
        process_distribution_message(&name(), &skdm, &bob).await.unwrap();

        let mut ct = group_encrypt(&name(), b"payload", &alice).await.unwrap();
        let last = ct.len() - 1;
        ct[last] ^= 1;
        assert!(matches!(
            group_decrypt(&name(), &ct, &bob).await,
            Err(SignalError::BadMac)
        ));
    }
}
