//! Receipt handling: delivery-status updates, `sender` acknowledgements
//! from companion devices, and peer retry requests that trigger a re-send.

use crate::binary::jid::Jid;
use crate::binary::node::{Node, NodeBuilder};
use crate::client::Client;
use crate::error::ClientError;
use crate::proto;
use crate::signal::session::PreKeyBundle;
use crate::signal::store::SessionStore;
use crate::signal::process_prekey_bundle;
use crate::store::traits::StoreKind;
use crate::types::events::{Event, ReceiptUpdate};
use crate::types::message::{MessageInfo, ReceiptType};
use log::{debug, info, warn};
use std::sync::Arc;

impl Client {
    pub(crate) async fn handle_receipt(self: &Arc<Self>, node: &Node) {
        let _processing = self.processing_mutex.lock().await;
        self.event_bus.buffer();

        let mut attrs = node.attrs();
        let from = attrs.jid("from");
        let id = attrs.string("id");
        let participant = attrs.optional_jid("participant");
        let timestamp = attrs.unix_time("t");
        let receipt_type = ReceiptType::from(attrs.optional_string("type").unwrap_or_default());

        let sender = if from.is_group() {
            participant.clone().unwrap_or_else(|| from.clone())
        } else {
            from.clone()
        };

        // Receipts can carry extra ids under <list>.
        let mut message_ids = vec![id.clone()];
        if let Some(list) = node.get_optional_child("list") {
            for item in list.get_children_by_tag("item") {
                if let Some(extra) = item.attrs().optional_string("id") {
                    message_ids.push(extra.to_string());
                }
            }
        }

        match receipt_type {
            ReceiptType::Retry => {
                let client = Arc::clone(self);
                let node = node.clone();
                let chat = from.clone();
                let sender = sender.clone();
                tokio::spawn(async move {
                    if let Err(e) = client.handle_retry_receipt(&node, &chat, &sender).await {
                        warn!(target: "Client/Retry", "peer retry handling failed: {e}");
                    }
                });
            }
            ReceiptType::Sender if sender.is_ad() => {
                // A companion device acknowledged our pkmsg; drop the
                // pending pre-key state so later sends use plain msg.
                if let Err(e) = self.clear_unacknowledged_prekey(&sender).await {
                    debug!(target: "Client/Recv", "could not clear pending prekey for {sender}: {e}");
                }
            }
            _ => {}
        }

        self.emit(Event::MessageReceiptUpdate(ReceiptUpdate {
            chat: from.clone(),
            sender,
            message_ids,
            receipt_type,
            timestamp,
        }));

        self.send_ack(node, None).await;
        self.event_bus.flush();
    }

    async fn clear_unacknowledged_prekey(&self, sender: &Jid) -> Result<(), ClientError> {
        let address = sender.signal_address();
        let Some(mut record) = self.store.load_session(&address).await? else {
            return Ok(());
        };
        if record.has_unacknowledged_pre_key() {
            record.clear_pending_pre_key();
            self.store.store_session(&address, &record).await?;
            debug!(target: "Client/Recv", "cleared pending prekey state for {address}");
        }
        Ok(())
    }

    /// A peer could not decrypt something we sent. Re-establish key material
    /// as needed and re-send the original plaintext to just that device.
    pub(crate) async fn handle_retry_receipt(
        self: &Arc<Self>,
        node: &Node,
        chat: &Jid,
        sender: &Jid,
    ) -> Result<(), ClientError> {
        let retry_child = node
            .get_optional_child("retry")
            .ok_or_else(|| ClientError::InvalidArgument("retry receipt without <retry>".into()))?;
        let mut retry_attrs = retry_child.attrs();
        let message_id = retry_attrs.string("id");
        let count: u8 = retry_attrs
            .optional_string("count")
            .and_then(|c| c.parse().ok())
            .unwrap_or(1);

        if count >= self.config.max_msg_retry_count {
            warn!(
                target: "Client/Retry",
                "refusing retry #{count} for {message_id}: exceeds cap"
            );
            return Ok(());
        }

        // Each participant retries independently in groups; direct chats
        // have one sender.
        let dedupe_key = if chat.is_group() {
            format!("{chat}:{message_id}:{sender}")
        } else {
            format!("{chat}:{message_id}")
        };
        if self.retry_dedupe.get(&dedupe_key).await.is_some() {
            debug!(target: "Client/Retry", "duplicate retry for {message_id}, ignoring");
            return Ok(());
        }
        self.retry_dedupe.insert(dedupe_key, ()).await;

        {
            let mut pending = self.pending_retries.lock().await;
            if !pending.insert(message_id.clone()) {
                debug!(target: "Client/Retry", "retry already in flight for {message_id}");
                return Ok(());
            }
        }
        let _cleanup = scopeguard::guard((Arc::clone(self), message_id.clone()), |(client, id)| {
            tokio::spawn(async move {
                client.pending_retries.lock().await.remove(&id);
            });
        });

        let Some(original) = self.take_recent_message(chat, &message_id).await else {
            info!(
                target: "Client/Retry",
                "no plaintext for {message_id} (NO_MESSAGE_FOUND), cannot re-send"
            );
            return Ok(());
        };

        let _retry_guard = self.retry_mutex.lock().await;

        if chat.is_group() || chat.is_status_broadcast() {
            // Force a fresh sender-key distribution to this participant on
            // the re-send.
            self.forget_sender_key_for(chat, sender).await?;
        } else {
            let address = sender.signal_address();
            match parse_retry_key_bundle(node) {
                Some(bundle) => {
                    process_prekey_bundle(&address, &bundle, &*self.store, &*self.store).await?;
                    info!(target: "Client/Retry", "installed fresh session for {address} from retry keys");
                }
                None => {
                    // No bundle attached; drop the session so the re-send
                    // fetches one from the server.
                    self.store.delete_session(&address).await?;
                    info!(target: "Client/Retry", "deleted session for {address} ahead of re-send");
                }
            }
        }

        info!(
            target: "Client/Retry",
            "re-sending {message_id} to {chat} (retry #{count})"
        );
        self.send_message_impl(
            chat.to_non_ad(),
            &original,
            Some(message_id),
            Some((sender.clone(), count)),
            true,
        )
        .await?;
        Ok(())
    }

    /// Removes one participant from the group's distribution memory so the
    /// next send re-delivers our sender key to them.
    pub(crate) async fn forget_sender_key_for(
        &self,
        group: &Jid,
        participant: &Jid,
    ) -> Result<(), ClientError> {
        let row = self
            .store
            .get_one(StoreKind::SenderKeyMemory, &group.to_string())
            .await?;
        let mut memory: std::collections::HashMap<String, bool> = row
            .as_deref()
            .and_then(|b| serde_json::from_slice(b).ok())
            .unwrap_or_default();
        memory.remove(&participant.to_non_ad().to_string());
        memory.remove(&participant.to_string());
        let bytes = serde_json::to_vec(&memory).map_err(crate::store::error::StoreError::from)?;
        self.store
            .set(vec![(StoreKind::SenderKeyMemory, group.to_string(), Some(bytes))])
            .await?;
        Ok(())
    }

    pub(crate) async fn take_recent_message(
        &self,
        chat: &Jid,
        message_id: &str,
    ) -> Option<proto::Message> {
        let chat = chat.to_non_ad();
        let cache_key = format!("{chat}:{message_id}");
        if let Some(message) = self.recent_messages.get(&cache_key).await {
            return Some(message);
        }
        let get_message = self.config.get_message.as_ref()?;
        get_message(&proto::MessageKey {
            remote_jid: Some(chat.to_string()),
            from_me: Some(true),
            id: Some(message_id.to_string()),
            participant: None,
        })
    }

    /// Emits an outbound receipt for an admitted inbound message.
    pub(crate) async fn send_message_receipt(
        &self,
        info: &MessageInfo,
        receipt_type: ReceiptType,
    ) -> Result<(), ClientError> {
        let mut builder = NodeBuilder::new("receipt")
            .attr("id", info.id.clone())
            .attr("to", info.source.chat.to_string());
        if receipt_type != ReceiptType::Delivered {
            builder = builder.attr("type", receipt_type.as_str());
        }
        if info.source.is_group {
            builder = builder.attr("participant", info.source.sender.to_string());
        }
        self.send_node(builder.build()).await
    }
}

/// Parses the `<keys>` bundle a retry receipt may carry.
fn parse_retry_key_bundle(node: &Node) -> Option<PreKeyBundle> {
    let keys = node.get_optional_child("keys")?;

    let identity: [u8; 32] = keys
        .get_optional_child("identity")?
        .bytes_content()?
        .try_into()
        .ok()?;
    let registration_id = be_u32(node.get_optional_child("registration")
        .or_else(|| keys.get_optional_child("registration"))?
        .bytes_content()?)?;

    let key_child = keys.get_optional_child("key")?;
    let pre_key_id = be_u32(key_child.get_optional_child("id")?.bytes_content()?)?;
    let pre_key_pub: [u8; 32] = key_child
        .get_optional_child("value")?
        .bytes_content()?
        .try_into()
        .ok()?;

    let skey = keys.get_optional_child("skey")?;
    let signed_pre_key_id = be_u32(skey.get_optional_child("id")?.bytes_content()?)?;
    let signed_pre_key_pub: [u8; 32] = skey
        .get_optional_child("value")?
        .bytes_content()?
        .try_into()
        .ok()?;
    let signed_pre_key_signature: [u8; 64] = skey
        .get_optional_child("signature")?
        .bytes_content()?
        .try_into()
        .ok()?;

    Some(PreKeyBundle {
        registration_id,
        identity_key: identity,
        signed_pre_key_id,
        signed_pre_key_pub,
        signed_pre_key_signature,
        pre_key: Some((pre_key_id, pre_key_pub)),
    })
}

/// Big-endian integer from a 1-4 byte blob (ids are packed to 3 bytes on
/// the wire, registration ids to 4).
fn be_u32(bytes: &[u8]) -> Option<u32> {
    if bytes.is_empty() || bytes.len() > 4 {
        return None;
    }
    let mut buf = [0u8; 4];
    buf[4 - bytes.len()..].copy_from_slice(bytes);
    Some(u32::from_be_bytes(buf))
}
