//! Inbound message pipeline: flood guard, ignored-JID filter, placeholder
//! handling, decrypt with retry, receipts, and event admission. All of it
//! runs under the client's processing mutex so subscribers observe
//! consistent state, and every stanza is ack'd exactly once.

mod decrypt;
mod parsing;
mod retry;

pub use parsing::parse_message_info;

use crate::binary::jid::{Jid, SERVER_JID};
use crate::binary::node::{Node, NodeBuilder, NodeContent};
use crate::client::Client;
use log::{debug, warn};
use rand::Rng;
use std::sync::Arc;
use tokio::time::Instant;

/// NACK code for ciphertext we can never decrypt (missing key material).
const ACK_PARSING_ERROR: u16 = 487;

impl Client {
    pub(crate) async fn handle_message(self: &Arc<Self>, node: Node, from_offline: bool) {
        let _processing = self.processing_mutex.lock().await;
        self.event_bus.buffer();

        if !self.flood_admit(&node).await {
            // Still ack so the server does not redeliver the flood.
            self.send_ack(&node, None).await;
            self.event_bus.flush();
            return;
        }

        if self.is_ignored_sender(&node) {
            self.send_ack(&node, None).await;
            self.event_bus.flush();
            return;
        }

        let info = match parsing::parse_message_info(self, &node).await {
            Ok(info) => info,
            Err(e) => {
                warn!(target: "Client/Recv", "unparseable message stanza: {e}");
                self.send_ack(&node, Some(ACK_PARSING_ERROR)).await;
                self.event_bus.flush();
                return;
            }
        };

        // Server-pushed placeholder: the phone has not uploaded the real
        // ciphertext yet. Ask for a resend unless it shows up shortly.
        if node.get_optional_child("unavailable").is_some() {
            self.handle_unavailable_envelope(&node, &info.id).await;
            self.event_bus.flush();
            return;
        }

        let ack_error = self.decrypt_and_admit(&node, &info, from_offline).await;
        self.send_ack(&node, ack_error).await;
        self.event_bus.flush();
    }

    /// Sliding-window rate guard per sender. Returns false when the stanza
    /// must be dropped (it is still ack'd by the caller).
    pub(crate) async fn flood_admit(&self, node: &Node) -> bool {
        let sender_key = node
            .attrs
            .get("participant")
            .or_else(|| node.attrs.get("from"))
            .cloned()
            .unwrap_or_default();

        let now = Instant::now();
        let mut windows = self.flood_windows.lock().await;
        let window = windows.entry(sender_key.clone()).or_default();
        while let Some(front) = window.front() {
            if now.duration_since(*front) > self.config.flood_window {
                window.pop_front();
            } else {
                break;
            }
        }
        if window.len() >= self.config.flood_threshold {
            warn!(target: "Client/Recv", "flood guard dropping stanza from {sender_key}");
            return false;
        }
        window.push_back(now);
        true
    }

    fn is_ignored_sender(&self, node: &Node) -> bool {
        let Some(filter) = &self.config.should_ignore_jid else {
            return false;
        };
        let Some(from) = node.attrs().optional_jid("from") else {
            return false;
        };
        // Server notices are never filtered.
        if from.user.is_empty() && from.server == SERVER_JID {
            return false;
        }
        if filter(&from) {
            debug!(target: "Client/Recv", "ignoring stanza from {from}");
            return true;
        }
        false
    }

    async fn handle_unavailable_envelope(self: &Arc<Self>, node: &Node, message_id: &str) {
        self.send_ack(node, None).await;

        if self.placeholder_cache.get(&message_id.to_string()).await.is_some() {
            debug!(target: "Client/Recv", "placeholder resend already pending for {message_id}");
            return;
        }
        self.placeholder_cache
            .insert(message_id.to_string(), ())
            .await;

        let client = Arc::clone(self);
        let id = message_id.to_string();
        let chat = node.attrs().optional_jid("from").unwrap_or_default();
        tokio::spawn(async move {
            // Give the real envelope a moment to arrive before asking the
            // phone to resend; a successful decrypt cancels the mark.
            tokio::time::sleep(std::time::Duration::from_secs(5)).await;
            if client.placeholder_cache.get(&id).await.is_none() {
                debug!(target: "Client/Recv", "placeholder for {id} resolved itself");
                return;
            }
            if let Err(e) = client.request_placeholder_resend(&chat, &id).await {
                client.report_unexpected(
                    format!("placeholder resend request failed: {e}"),
                    "placeholder-resend",
                );
            }
        });
    }

    async fn request_placeholder_resend(
        &self,
        chat: &Jid,
        message_id: &str,
    ) -> Result<(), crate::error::ClientError> {
        let me = self.store.me().await.ok_or(crate::error::ClientError::NotLoggedIn)?;
        let peer = crate::proto::Message {
            protocol_message: Some(crate::proto::ProtocolMessage {
                key: Some(crate::proto::MessageKey {
                    remote_jid: Some(chat.to_string()),
                    from_me: Some(false),
                    id: Some(message_id.to_string()),
                    participant: None,
                }),
                r#type: Some(crate::proto::protocol_message_type::PEER_DATA_OPERATION_REQUEST_MESSAGE),
            }),
            ..Default::default()
        };
        // Delivered as a device-to-device message to our own phone.
        self.send_peer_message(me.to_non_ad(), peer).await?;
        Ok(())
    }
}

/// Appends `1..=15` bytes of padding, each holding the pad length.
pub(crate) fn pad_message(mut plaintext: Vec<u8>) -> Vec<u8> {
    let pad: u8 = rand::thread_rng().gen_range(1..=15);
    plaintext.extend(std::iter::repeat(pad).take(pad as usize));
    plaintext
}

/// Strips the random padding applied by [`pad_message`].
pub(crate) fn unpad_message(plaintext: &[u8]) -> Result<&[u8], crate::error::ClientError> {
    let Some(&pad) = plaintext.last() else {
        return Err(crate::error::ClientError::Internal(
            "empty plaintext".to_string(),
        ));
    };
    if pad == 0 || pad as usize > plaintext.len() || pad > 16 {
        return Err(crate::error::ClientError::Internal(format!(
            "invalid message padding: {pad}"
        )));
    }
    Ok(&plaintext[..plaintext.len() - pad as usize])
}

/// Wire shape of the retry receipt's key bundle, used when `count > 1`.
pub(crate) fn keys_node(
    registration_id: u32,
    identity_pub: &[u8; 32],
    prekey: &crate::crypto::key_pair::PreKey,
    signed_prekey: &crate::crypto::key_pair::PreKey,
    device_identity: Option<Vec<u8>>,
) -> Node {
    let key_node = |pk: &crate::crypto::key_pair::PreKey, with_signature: bool| {
        let mut children = vec![
            NodeBuilder::new("id")
                .bytes(pk.key_id.to_be_bytes()[1..].to_vec())
                .build(),
            NodeBuilder::new("value")
                .bytes(pk.key_pair.public_key.to_vec())
                .build(),
        ];
        if with_signature {
            if let Some(sig) = pk.signature {
                children.push(NodeBuilder::new("signature").bytes(sig.to_vec()).build());
            }
        }
        children
    };

    let mut children = vec![
        NodeBuilder::new("type")
            .bytes(vec![crate::crypto::key_pair::DJB_TYPE])
            .build(),
        NodeBuilder::new("identity")
            .bytes(identity_pub.to_vec())
            .build(),
        NodeBuilder::new("key")
            .children(key_node(prekey, false))
            .build(),
        NodeBuilder::new("skey")
            .children(key_node(signed_prekey, true))
            .build(),
        NodeBuilder::new("registration")
            .bytes(registration_id.to_be_bytes().to_vec())
            .build(),
    ];
    if let Some(di) = device_identity {
        children.push(NodeBuilder::new("device-identity").bytes(di).build());
    }
    NodeBuilder::new("keys")
        .apply_content(Some(NodeContent::Nodes(children)))
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SocketConfig;
    use crate::store::memory::MemoryStore;
    use crate::store::{AuthCreds, DeviceStore};

    fn flood_node(from: &str) -> Node {
        NodeBuilder::new("message")
            .attr("from", from)
            .attr("id", "3EB0FLOOD")
            .build()
    }

    #[tokio::test(start_paused = true)]
    async fn flood_guard_admits_up_to_threshold_per_window() {
        let store = DeviceStore::new(AuthCreds::init(), Arc::new(MemoryStore::new()));
        let client = Client::new(SocketConfig::default(), store);
        let node = flood_node("15550001111@s.whatsapp.net");

        for _ in 0..50 {
            assert!(client.flood_admit(&node).await);
        }
        // The 51st within the window is dropped.
        assert!(!client.flood_admit(&node).await);

        // Another sender is unaffected.
        let other = flood_node("15550002222@s.whatsapp.net");
        assert!(client.flood_admit(&other).await);

        // Once the window has passed, the counter has effectively reset.
        tokio::time::advance(std::time::Duration::from_secs(11)).await;
        assert!(client.flood_admit(&node).await);
    }

    #[tokio::test]
    async fn flood_guard_keys_groups_by_participant() {
        let store = DeviceStore::new(AuthCreds::init(), Arc::new(MemoryStore::new()));
        let client = Client::new(SocketConfig::default(), store);

        let node = NodeBuilder::new("message")
            .attr("from", "120363000@g.us")
            .attr("participant", "15550001111@s.whatsapp.net")
            .attr("id", "3EB0GRP")
            .build();
        for _ in 0..50 {
            assert!(client.flood_admit(&node).await);
        }
        assert!(!client.flood_admit(&node).await);

        let other_participant = NodeBuilder::new("message")
            .attr("from", "120363000@g.us")
            .attr("participant", "15550009999@s.whatsapp.net")
            .attr("id", "3EB0GRP2")
            .build();
        assert!(client.flood_admit(&other_participant).await);
    }

    #[test]
    fn padding_round_trip() {
        for len in [0usize, 1, 15, 16, 100] {
            let data = vec![0xAB; len];
            let padded = pad_message(data.clone());
            assert!(padded.len() > len && padded.len() <= len + 15);
            assert_eq!(unpad_message(&padded).unwrap(), data.as_slice());
        }
    }

    #[test]
    fn unpad_rejects_garbage() {
        assert!(unpad_message(&[]).is_err());
        assert!(unpad_message(&[0]).is_err());
        assert!(unpad_message(&[1, 2, 3, 200]).is_err());
    }
}
