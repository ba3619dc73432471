//! Pairing-code (link code) flow: the phoneless alternative to QR pairing.
//!
//! The companion shows an 8-character code; the user types it on the
//! primary device. Both sides derive a wrapping key from the code via
//! PBKDF2, exchange ephemeral keys under it, and agree on the ADV secret.

use crate::binary::jid::{Jid, SERVER_JID};
use crate::binary::node::{Node, NodeBuilder, NodeContent};
use crate::client::Client;
use crate::error::ClientError;
use crate::request::InfoQuery;
use crate::store::commands::DeviceCommand;
use crate::types::events::Event;
use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use hkdf::Hkdf;
use hmac::Hmac;
use log::info;
use rand::seq::SliceRandom;
use rand::RngCore;
use sha2::Sha256;
use std::sync::Arc;

const LINK_CODE_SALT: &[u8] = b"Link Code Pairing Key Bundle";
const LINK_CODE_PBKDF2_ROUNDS: u32 = 1 << 17;
const LINK_CODE_LENGTH: usize = 8;
/// Unambiguous alphabet for displayed codes (no 0/O, 1/I).
const LINK_CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

fn generate_link_code() -> String {
    let mut rng = rand::thread_rng();
    (0..LINK_CODE_LENGTH)
        .map(|_| *LINK_CODE_ALPHABET.choose(&mut rng).expect("alphabet") as char)
        .collect()
}

fn derive_link_code_key(code: &str) -> [u8; 32] {
    let mut key = [0u8; 32];
    pbkdf2::pbkdf2::<Hmac<Sha256>>(
        code.as_bytes(),
        LINK_CODE_SALT,
        LINK_CODE_PBKDF2_ROUNDS,
        &mut key,
    )
    .expect("pbkdf2 output length");
    key
}

/// Seals a blob under the code-derived key; random nonce prepended.
fn wrap_with_code_key(key: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>, ClientError> {
    let cipher = Aes256Gcm::new_from_slice(key).expect("code key is 32 bytes");
    let mut iv = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut iv);
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&iv), plaintext)
        .map_err(|_| ClientError::Internal("link-code wrap failed".to_string()))?;
    let mut out = Vec::with_capacity(12 + ciphertext.len());
    out.extend_from_slice(&iv);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

fn unwrap_with_code_key(key: &[u8; 32], wrapped: &[u8]) -> Result<Vec<u8>, ClientError> {
    if wrapped.len() < 12 {
        return Err(ClientError::InvalidArgument(
            "wrapped blob shorter than its iv".into(),
        ));
    }
    let (iv, ciphertext) = wrapped.split_at(12);
    let cipher = Aes256Gcm::new_from_slice(key).expect("code key is 32 bytes");
    cipher
        .decrypt(Nonce::from_slice(iv), ciphertext)
        .map_err(|_| ClientError::Internal("link-code unwrap failed".to_string()))
}

impl Client {
    /// Starts pairing-code registration for `phone_number` (digits only,
    /// country code included). Returns the code to display to the user.
    pub async fn request_pairing_code(
        self: &Arc<Self>,
        phone_number: &str,
    ) -> Result<String, ClientError> {
        if phone_number.is_empty() || !phone_number.chars().all(|c| c.is_ascii_digit()) {
            return Err(ClientError::InvalidArgument(
                "phone number must be digits with country code".into(),
            ));
        }

        let code = generate_link_code();
        let code_key = derive_link_code_key(&code);
        *self.pairing_code_key.lock().await = Some(code_key);

        let creds = self.store.creds().await;
        let wrapped_ephemeral =
            wrap_with_code_key(&code_key, &creds.pairing_ephemeral_key_pair.public_key)?;

        let registration = NodeBuilder::new("link_code_companion_reg")
            .attr("jid", format!("{phone_number}@{SERVER_JID}"))
            .attr("stage", "companion_hello")
            .children([
                NodeBuilder::new("link_code_pairing_wrapped_companion_ephemeral_pub")
                    .bytes(wrapped_ephemeral)
                    .build(),
                NodeBuilder::new("companion_server_auth_key_pub")
                    .bytes(creds.noise_key.public_key.to_vec())
                    .build(),
                NodeBuilder::new("link_code_pairing_nonce").bytes(vec![0]).build(),
            ])
            .build();

        self.send_iq(InfoQuery::set(
            "md",
            Jid::server_jid(),
            Some(NodeContent::Nodes(vec![registration])),
        ))
        .await?;

        info!(target: "Client/PairCode", "pairing code requested for {phone_number}");
        Ok(format!("{}-{}", &code[..4], &code[4..]))
    }

    /// Finishes the exchange when the primary pushes its half: unwrap the
    /// primary ephemeral, run both ECDHs, derive the ADV secret, and upload
    /// our wrapped key bundle.
    pub(crate) async fn handle_code_pair_notification(
        self: &Arc<Self>,
        node: &Node,
    ) -> Result<(), ClientError> {
        let Some(code_key) = *self.pairing_code_key.lock().await else {
            return Err(ClientError::InvalidArgument(
                "link-code notification without a pending pairing code".into(),
            ));
        };

        let registration = node
            .get_optional_child("link_code_companion_reg")
            .ok_or_else(|| {
                ClientError::InvalidArgument("notification without registration child".into())
            })?;
        let wrapped_primary = registration
            .get_optional_child("link_code_pairing_wrapped_primary_ephemeral_pub")
            .and_then(|n| n.bytes_content())
            .ok_or_else(|| {
                ClientError::InvalidArgument("registration without primary ephemeral".into())
            })?;
        let primary_identity: [u8; 32] = registration
            .get_optional_child("primary_identity_pub")
            .and_then(|n| n.bytes_content())
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| {
                ClientError::InvalidArgument("registration without primary identity".into())
            })?;

        let primary_ephemeral: [u8; 32] = unwrap_with_code_key(&code_key, wrapped_primary)?
            .as_slice()
            .try_into()
            .map_err(|_| ClientError::InvalidArgument("bad primary ephemeral length".into()))?;

        let creds = self.store.creds().await;
        let companion_shared = creds
            .pairing_ephemeral_key_pair
            .shared_secret(&primary_ephemeral);
        let identity_shared = creds.signed_identity_key.shared_secret(&primary_identity);

        let mut random = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut random);

        let mut ikm = Vec::with_capacity(96);
        ikm.extend_from_slice(&companion_shared);
        ikm.extend_from_slice(&identity_shared);
        ikm.extend_from_slice(&random);
        let mut adv_secret = [0u8; 32];
        Hkdf::<Sha256>::new(None, &ikm)
            .expand(b"adv secret", &mut adv_secret)
            .map_err(|_| {
                ClientError::Internal("adv secret derivation failed".to_string())
            })?;

        self.store
            .process_command(DeviceCommand::SetAdvSecretKey(adv_secret))
            .await;
        self.emit(Event::CredsUpdate);

        // The bundle proves our identity key to the primary; it is wrapped
        // under the same code-derived key.
        let mut bundle = Vec::with_capacity(64);
        bundle.extend_from_slice(&creds.signed_identity_key.public_key);
        bundle.extend_from_slice(&random);
        let wrapped_bundle = wrap_with_code_key(&code_key, &bundle)?;

        let finish = NodeBuilder::new("link_code_companion_reg")
            .attr("stage", "companion_finish")
            .children([NodeBuilder::new("link_code_pairing_wrapped_key_bundle")
                .bytes(wrapped_bundle)
                .build()])
            .build();
        self.send_iq(InfoQuery::set(
            "md",
            Jid::server_jid(),
            Some(NodeContent::Nodes(vec![finish])),
        ))
        .await?;

        *self.pairing_code_key.lock().await = None;
        info!(target: "Client/PairCode", "pairing-code exchange finished, waiting for pair-success");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn link_code_uses_the_display_alphabet() {
        let code = generate_link_code();
        assert_eq!(code.len(), LINK_CODE_LENGTH);
        assert!(code.bytes().all(|b| LINK_CODE_ALPHABET.contains(&b)));
    }

    #[test]
    fn code_key_wrap_round_trip() {
        let key = derive_link_code_key("ABCD2345");
        let wrapped = wrap_with_code_key(&key, b"ephemeral-key-bytes").unwrap();
        assert_eq!(
            unwrap_with_code_key(&key, &wrapped).unwrap(),
            b"ephemeral-key-bytes"
        );

        let other = derive_link_code_key("ABCD2346");
        assert!(unwrap_with_code_key(&other, &wrapped).is_err());
    }

    #[test]
    fn derivation_is_deterministic_per_code() {
        assert_eq!(derive_link_code_key("WXYZ7890"), derive_link_code_key("WXYZ7890"));
        assert_ne!(derive_link_code_key("WXYZ7890"), derive_link_code_key("WXYZ7891"));
    }
}
