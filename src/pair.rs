//! QR pairing: `pair-device` ref handling and the `pair-success`
//! verification/confirmation exchange.

use crate::binary::jid::{Jid, SERVER_JID};
use crate::binary::node::{Node, NodeBuilder};
use crate::client::Client;
use crate::crypto::xed25519;
use crate::proto;
use crate::store::commands::DeviceCommand;
use crate::store::AuthCreds;
use crate::types::events::{Event, PairError, PairSuccess, Qr};
use base64::prelude::*;
use hmac::{Hmac, Mac};
use log::{debug, error, info, warn};
use prost::Message as ProstMessage;
use sha2::Sha256;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

// Signature domain prefixes for the ADV identity exchange.
const ADV_PREFIX_ACCOUNT_SIGNATURE: &[u8] = &[6, 0];
const ADV_PREFIX_DEVICE_SIGNATURE: &[u8] = &[6, 1];

#[derive(Debug, Error)]
#[error("pairing failed with code {code}: {text}")]
pub struct PairCryptoError {
    pub code: u16,
    pub text: &'static str,
}

/// The QR payload: `ref,noisePub,identityPub,advSecret`, all base64 except
/// the ref.
pub fn make_qr_data(creds: &AuthCreds, ref_str: &str) -> String {
    [
        ref_str.to_string(),
        BASE64_STANDARD.encode(creds.noise_key.public_key),
        BASE64_STANDARD.encode(creds.signed_identity_key.public_key),
        BASE64_STANDARD.encode(creds.adv_secret_key),
    ]
    .join(",")
}

/// Routes pairing-related iqs. Returns false when the stanza is not ours.
pub async fn handle_pairing_iq(client: &Arc<Client>, node: &Node) -> bool {
    if node.attrs.get("from").map(String::as_str) != Some(SERVER_JID) {
        return false;
    }
    let Some(children) = node.children() else {
        return false;
    };

    for child in children {
        match child.tag.as_str() {
            "pair-device" => {
                if let Some(ack) = build_ack_node(node) {
                    if let Err(e) = client.send_node(ack).await {
                        warn!(target: "Client/Pair", "pair-device ack failed: {e}");
                    }
                }
                // In pairing-code mode the refs are not surfaced; the link
                // code flow finishes through its own notification.
                if !client.config.print_qr_in_terminal {
                    debug!(target: "Client/Pair", "QR refs ignored, pairing-code mode active");
                    return true;
                }
                let creds = client.store.creds().await;
                let codes: Vec<String> = child
                    .get_children_by_tag("ref")
                    .iter()
                    .filter_map(|r| r.bytes_content())
                    .filter_map(|b| String::from_utf8(b.to_vec()).ok())
                    .map(|r| make_qr_data(&creds, &r))
                    .collect();
                debug!(target: "Client/Pair", "emitting {} QR refs", codes.len());
                client.emit(Event::Qr(Qr { codes }));
                return true;
            }
            "pair-success" => {
                handle_pair_success(client, node, child).await;
                return true;
            }
            _ => {}
        }
    }
    false
}

fn build_ack_node(request: &Node) -> Option<Node> {
    let to = request.attrs.get("from")?;
    let id = request.attrs.get("id")?;
    Some(
        NodeBuilder::new("iq")
            .attr("to", to.clone())
            .attr("id", id.clone())
            .attr("type", "result")
            .build(),
    )
}

/// Verifies the phone-signed ADV identity and produces our self-signed copy
/// plus the key index to confirm with.
pub fn do_pair_crypto(
    creds: &AuthCreds,
    device_identity_bytes: &[u8],
) -> Result<(Vec<u8>, u32), PairCryptoError> {
    let container = proto::AdvSignedDeviceIdentityHmac::decode(device_identity_bytes)
        .map_err(|_| PairCryptoError {
            code: 500,
            text: "internal-error",
        })?;
    let details = container.details.as_deref().ok_or(PairCryptoError {
        code: 500,
        text: "internal-error",
    })?;
    let hmac_bytes = container.hmac.as_deref().ok_or(PairCryptoError {
        code: 500,
        text: "internal-error",
    })?;

    let mut mac = HmacSha256::new_from_slice(&creds.adv_secret_key).expect("hmac key length");
    mac.update(details);
    if mac.verify_slice(hmac_bytes).is_err() {
        return Err(PairCryptoError {
            code: 401,
            text: "hmac-mismatch",
        });
    }

    let mut signed_identity =
        proto::AdvSignedDeviceIdentity::decode(details).map_err(|_| PairCryptoError {
            code: 500,
            text: "internal-error",
        })?;

    let account_sig_key: [u8; 32] = signed_identity
        .account_signature_key
        .as_deref()
        .and_then(|k| k.try_into().ok())
        .ok_or(PairCryptoError {
            code: 500,
            text: "internal-error",
        })?;
    let account_signature: [u8; 64] = signed_identity
        .account_signature
        .as_deref()
        .and_then(|s| s.try_into().ok())
        .ok_or(PairCryptoError {
            code: 500,
            text: "internal-error",
        })?;
    let inner_details = signed_identity.details.clone().ok_or(PairCryptoError {
        code: 500,
        text: "internal-error",
    })?;

    let mut account_message = Vec::with_capacity(2 + inner_details.len() + 32);
    account_message.extend_from_slice(ADV_PREFIX_ACCOUNT_SIGNATURE);
    account_message.extend_from_slice(&inner_details);
    account_message.extend_from_slice(&creds.signed_identity_key.public_key);
    if !xed25519::verify(&account_sig_key, &account_message, &account_signature) {
        return Err(PairCryptoError {
            code: 401,
            text: "signature-mismatch",
        });
    }

    let mut device_message = Vec::with_capacity(2 + inner_details.len() + 64);
    device_message.extend_from_slice(ADV_PREFIX_DEVICE_SIGNATURE);
    device_message.extend_from_slice(&inner_details);
    device_message.extend_from_slice(&creds.signed_identity_key.public_key);
    device_message.extend_from_slice(&account_sig_key);
    let device_signature = creds.signed_identity_key.sign_message(&device_message);
    signed_identity.device_signature = Some(device_signature.to_vec());

    let identity_details =
        proto::AdvDeviceIdentity::decode(inner_details.as_slice()).map_err(|_| PairCryptoError {
            code: 500,
            text: "internal-error",
        })?;
    let key_index = identity_details.key_index.unwrap_or(0);

    Ok((signed_identity.encode_to_vec(), key_index))
}

async fn handle_pair_success(client: &Arc<Client>, request: &Node, success: &Node) {
    let Some(req_id) = request.attrs.get("id").cloned() else {
        error!(target: "Client/Pair", "pair-success without request id");
        return;
    };

    let Some(device_identity) = success
        .get_optional_child("device-identity")
        .and_then(|n| n.bytes_content())
    else {
        error!(target: "Client/Pair", "pair-success without device-identity");
        let _ = client
            .send_node(build_pair_error_node(&req_id, 500, "internal-error"))
            .await;
        return;
    };

    let platform = success
        .get_optional_child("platform")
        .and_then(|n| n.attrs.get("name").cloned())
        .unwrap_or_default();
    let business_name = success
        .get_optional_child("biz")
        .and_then(|n| n.attrs.get("name").cloned())
        .unwrap_or_default();
    let (jid, lid) = match success.get_optional_child("device") {
        Some(device) => {
            let mut parser = device.attrs();
            (
                parser.optional_jid("jid").unwrap_or_default(),
                parser.optional_jid("lid").unwrap_or_default(),
            )
        }
        None => (Jid::default(), Jid::default()),
    };

    let creds = client.store.creds().await;
    match do_pair_crypto(&creds, device_identity) {
        Ok((self_signed, key_index)) => {
            let account = match proto::AdvSignedDeviceIdentity::decode(self_signed.as_slice()) {
                Ok(account) => account,
                Err(e) => {
                    error!(target: "Client/Pair", "self-signed identity failed to re-decode: {e}");
                    client.emit(Event::PairError(PairError {
                        id: jid,
                        lid,
                        error: format!("identity re-decode failed: {e}"),
                    }));
                    return;
                }
            };

            client
                .store
                .process_command(DeviceCommand::SetMe(Some(jid.clone())))
                .await;
            client
                .store
                .process_command(DeviceCommand::SetLid(Some(lid.clone())))
                .await;
            client
                .store
                .process_command(DeviceCommand::SetAccount(Some(account)))
                .await;
            client
                .store
                .process_command(DeviceCommand::SetPlatform(platform.clone()))
                .await;
            client
                .store
                .process_command(DeviceCommand::SetRegistered(true))
                .await;
            if !business_name.is_empty() {
                client
                    .store
                    .process_command(DeviceCommand::SetPushName(business_name.clone()))
                    .await;
            }
            client.emit(Event::CredsUpdate);

            let response = NodeBuilder::new("iq")
                .attr("to", SERVER_JID)
                .attr("id", req_id)
                .attr("type", "result")
                .children([NodeBuilder::new("pair-device-sign")
                    .children([NodeBuilder::new("device-identity")
                        .attr("key-index", key_index.to_string())
                        .bytes(self_signed)
                        .build()])
                    .build()])
                .build();
            if let Err(e) = client.send_node(response).await {
                error!(target: "Client/Pair", "pair confirmation send failed: {e}");
                return;
            }

            // The server now closes the stream with a restart-required
            // error; the supervisor reconnects with the new credentials.
            client.expected_disconnect.store(true, Ordering::Relaxed);
            info!(target: "Client/Pair", "paired as {jid}");
            client.emit(Event::PairSuccess(PairSuccess {
                id: jid,
                lid,
                business_name,
                platform,
            }));
        }
        Err(e) => {
            error!(target: "Client/Pair", "pairing crypto failed: {e}");
            let _ = client
                .send_node(build_pair_error_node(&req_id, e.code, e.text))
                .await;
            client.emit(Event::PairError(PairError {
                id: jid,
                lid,
                error: e.to_string(),
            }));
        }
    }
}

fn build_pair_error_node(req_id: &str, code: u16, text: &str) -> Node {
    NodeBuilder::new("iq")
        .attr("to", SERVER_JID)
        .attr("type", "error")
        .attr("id", req_id)
        .children([NodeBuilder::new("error")
            .attr("code", code.to_string())
            .attr("text", text)
            .build()])
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::key_pair::KeyPair;

    /// Builds the blob a phone would produce when the QR is scanned.
    fn phone_signed_identity(creds: &AuthCreds, account_key: &KeyPair, key_index: u32) -> Vec<u8> {
        let details = proto::AdvDeviceIdentity {
            raw_id: Some(42),
            timestamp: Some(1_700_000_000),
            key_index: Some(key_index),
            account_type: None,
            device_type: None,
        }
        .encode_to_vec();

        let mut account_message = Vec::new();
        account_message.extend_from_slice(ADV_PREFIX_ACCOUNT_SIGNATURE);
        account_message.extend_from_slice(&details);
        account_message.extend_from_slice(&creds.signed_identity_key.public_key);
        let account_signature = account_key.sign_message(&account_message);

        let signed = proto::AdvSignedDeviceIdentity {
            details: Some(details),
            account_signature_key: Some(account_key.public_key.to_vec()),
            account_signature: Some(account_signature.to_vec()),
            device_signature: None,
        }
        .encode_to_vec();

        let mut mac = HmacSha256::new_from_slice(&creds.adv_secret_key).unwrap();
        mac.update(&signed);
        proto::AdvSignedDeviceIdentityHmac {
            details: Some(signed),
            hmac: Some(mac.finalize().into_bytes().to_vec()),
            account_type: None,
        }
        .encode_to_vec()
    }

    #[test]
    fn qr_data_has_four_comma_fields() {
        let creds = AuthCreds::init();
        let qr = make_qr_data(&creds, "2@REFSTRING");
        let parts: Vec<&str> = qr.split(',').collect();
        assert_eq!(parts.len(), 4);
        assert_eq!(parts[0], "2@REFSTRING");
        assert_eq!(
            BASE64_STANDARD.decode(parts[1]).unwrap(),
            creds.noise_key.public_key
        );
        assert_eq!(
            BASE64_STANDARD.decode(parts[3]).unwrap(),
            creds.adv_secret_key
        );
    }

    #[test]
    fn pair_crypto_accepts_a_valid_phone_blob() {
        let creds = AuthCreds::init();
        let account_key = KeyPair::new();
        let blob = phone_signed_identity(&creds, &account_key, 7);

        let (self_signed, key_index) = do_pair_crypto(&creds, &blob).expect("verifies");
        assert_eq!(key_index, 7);

        // Our device signature must verify under our identity key.
        let reparsed = proto::AdvSignedDeviceIdentity::decode(self_signed.as_slice()).unwrap();
        let details = reparsed.details.unwrap();
        let mut device_message = Vec::new();
        device_message.extend_from_slice(ADV_PREFIX_DEVICE_SIGNATURE);
        device_message.extend_from_slice(&details);
        device_message.extend_from_slice(&creds.signed_identity_key.public_key);
        device_message.extend_from_slice(&account_key.public_key);
        let signature: [u8; 64] = reparsed
            .device_signature
            .unwrap()
            .as_slice()
            .try_into()
            .unwrap();
        assert!(xed25519::verify(
            &creds.signed_identity_key.public_key,
            &device_message,
            &signature
        ));
    }

    #[test]
    fn pair_crypto_rejects_wrong_adv_secret() {
        let creds = AuthCreds::init();
        let account_key = KeyPair::new();
        let blob = phone_signed_identity(&creds, &account_key, 1);

        let mut other = AuthCreds::init();
        other.signed_identity_key = creds.signed_identity_key.clone();
        let err = do_pair_crypto(&other, &blob).unwrap_err();
        assert_eq!(err.code, 401);
        assert_eq!(err.text, "hmac-mismatch");
    }

    #[test]
    fn pair_crypto_rejects_bad_account_signature() {
        let creds = AuthCreds::init();
        let account_key = KeyPair::new();
        let mut blob_creds = creds.clone();
        // Signature binds OUR identity key; a different key must fail.
        blob_creds.signed_identity_key = KeyPair::new();
        let blob = phone_signed_identity(&blob_creds, &account_key, 1);

        // Same adv secret so the HMAC passes, wrong bound identity.
        let mut verifier = creds.clone();
        verifier.adv_secret_key = blob_creds.adv_secret_key;
        let err = do_pair_crypto(&verifier, &blob).unwrap_err();
        assert_eq!(err.text, "signature-mismatch");
    }
}
