//! Cross-module scenarios: the signal ciphers running on top of the keyed
//! device store, and transactional store behavior under concurrency.

use std::sync::Arc;

use wamd::proto;
use wamd::signal::address::{SenderKeyName, SignalAddress};
use wamd::signal::group;
use wamd::signal::store::{PreKeyStore, SignedPreKeyStore};
use wamd::signal::{
    message_decrypt, message_decrypt_prekey, message_encrypt, process_prekey_bundle,
    CiphertextType, PreKeyBundle,
};
use wamd::store::memory::MemoryStore;
use wamd::store::traits::StoreKind;
use wamd::store::{AuthCreds, DeviceStore};

use prost::Message as ProstMessage;

async fn bundle_for(store: &DeviceStore, pre_key_id: Option<u32>) -> PreKeyBundle {
    let creds = store.creds().await;
    let pre_key = match pre_key_id {
        Some(id) => {
            let pk = store
                .load_prekey(id)
                .await
                .unwrap()
                .expect("prekey stored first");
            Some((id, pk.key_pair.public_key))
        }
        None => None,
    };
    let signed = store
        .load_signed_prekey(creds.signed_pre_key.key_id)
        .await
        .unwrap()
        .expect("signed prekey");
    PreKeyBundle {
        registration_id: creds.registration_id,
        identity_key: creds.signed_identity_key.public_key,
        signed_pre_key_id: signed.key_id,
        signed_pre_key_pub: signed.key_pair.public_key,
        signed_pre_key_signature: signed.signature.expect("signed prekey signature"),
        pre_key,
    }
}

fn fresh_device() -> Arc<DeviceStore> {
    DeviceStore::new(AuthCreds::init(), Arc::new(MemoryStore::new()))
}

#[tokio::test]
async fn first_contact_round_trip_consumes_the_prekey_row() {
    let alice = fresh_device();
    let bob = fresh_device();

    // Bob publishes a one-time pre-key.
    bob.store_prekey(7, wamd::crypto::key_pair::PreKey::new(7))
        .await
        .unwrap();
    assert!(bob.load_prekey(7).await.unwrap().is_some());

    let alice_addr = SignalAddress::new("alice".into(), 0);
    let bob_addr = SignalAddress::new("bob".into(), 0);

    process_prekey_bundle(&bob_addr, &bundle_for(&bob, Some(7)).await, &*alice, &*alice)
        .await
        .unwrap();

    let body = proto::Message::text("hi").encode_to_vec();
    let (kind, ciphertext) = message_encrypt(&body, &bob_addr, &*alice, &*alice)
        .await
        .unwrap();
    assert_eq!(kind, CiphertextType::PreKey);

    let plaintext = message_decrypt_prekey(&ciphertext, &alice_addr, &*bob, &*bob, &*bob, &*bob)
        .await
        .unwrap();
    let decoded = proto::Message::decode(plaintext.as_slice()).unwrap();
    assert_eq!(decoded.conversation.as_deref(), Some("hi"));

    // The pre-key row is gone after the first successful decrypt.
    assert!(bob.load_prekey(7).await.unwrap().is_none());

    // Bob replies and both sides settle on whisper messages.
    let reply = proto::Message::text("hello back").encode_to_vec();
    let (kind, ciphertext) = message_encrypt(&reply, &alice_addr, &*bob, &*bob)
        .await
        .unwrap();
    assert_eq!(kind, CiphertextType::Whisper);
    let plaintext = message_decrypt(&ciphertext, &bob_addr, &*alice, &*alice)
        .await
        .unwrap();
    assert_eq!(
        proto::Message::decode(plaintext.as_slice())
            .unwrap()
            .conversation
            .as_deref(),
        Some("hello back")
    );

    let (kind, _) = message_encrypt(b"third", &bob_addr, &*alice, &*alice)
        .await
        .unwrap();
    assert_eq!(kind, CiphertextType::Whisper);
}

#[tokio::test]
async fn group_fanout_over_device_stores() {
    let alice = fresh_device();
    let members = [fresh_device(), fresh_device(), fresh_device()];

    let name = SenderKeyName::new("120363000@g.us".into(), "alice.0".into());
    let distribution = group::create_distribution_message(&name, &*alice)
        .await
        .unwrap();
    let serialized = group::serialize_distribution_message(&distribution);

    // Every member installs the distribution (delivered 1:1 in production).
    for member in &members {
        let parsed = group::parse_distribution_message(&serialized).unwrap();
        group::process_distribution_message(&name, &parsed, &**member)
            .await
            .unwrap();
    }

    let skmsg = group::group_encrypt(&name, b"group broadcast", &*alice)
        .await
        .unwrap();
    for member in &members {
        assert_eq!(
            group::group_decrypt(&name, &skmsg, &**member).await.unwrap(),
            b"group broadcast"
        );
    }

    // The next message needs no fresh distribution.
    let second = group::group_encrypt(&name, b"again", &*alice).await.unwrap();
    for member in &members {
        assert_eq!(
            group::group_decrypt(&name, &second, &**member).await.unwrap(),
            b"again"
        );
    }
}

#[tokio::test]
async fn concurrent_transactions_do_not_tear() {
    let store = fresh_device();

    let mut handles = Vec::new();
    for tag in 0u8..8 {
        let store = Arc::clone(&store);
        handles.push(tokio::spawn(async move {
            let mut tx = store.begin();
            tx.set(StoreKind::AppStateSyncKey, "row-a", Some(vec![tag]));
            tx.set(StoreKind::AppStateSyncKey, "row-b", Some(vec![tag]));
            store.commit(tx).await.unwrap();
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    // Whichever transaction landed last, both rows must carry the same tag:
    // commits are serialized and applied as one batch.
    let a = store
        .get_one(StoreKind::AppStateSyncKey, "row-a")
        .await
        .unwrap()
        .expect("row-a present");
    let b = store
        .get_one(StoreKind::AppStateSyncKey, "row-b")
        .await
        .unwrap()
        .expect("row-b present");
    assert_eq!(a, b);
}

#[tokio::test]
async fn session_rows_live_under_the_session_kind() {
    let alice = fresh_device();
    let bob = fresh_device();
    bob.store_prekey(3, wamd::crypto::key_pair::PreKey::new(3))
        .await
        .unwrap();

    let bob_addr = SignalAddress::new("998877".into(), 2);
    process_prekey_bundle(&bob_addr, &bundle_for(&bob, Some(3)).await, &*alice, &*alice)
        .await
        .unwrap();

    // The record is addressed by the `user.device` string.
    let row = alice
        .get_one(StoreKind::Session, "998877.2")
        .await
        .unwrap();
    assert!(row.is_some(), "session row keyed by signal address");
}
