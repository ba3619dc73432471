use crate::binary::node::Node;
use crate::client::Client;
use crate::message::unpad_message;
use crate::proto;
use crate::signal::address::SenderKeyName;
use crate::signal::error::SignalError;
use crate::signal::{group, message_decrypt, message_decrypt_prekey};
use crate::types::events::{Event, IncomingMessage, MessagesUpsert, UndecryptableMessage, UpsertType};
use crate::types::message::{MessageInfo, ReceiptType};
use log::{debug, info, warn};
use prost::Message as ProstMessage;
use std::sync::Arc;

use super::ACK_PARSING_ERROR;

impl Client {
    /// Decrypts every `enc` child, installs sender keys, emits the receipt,
    /// and upserts decrypted content. Returns the ack error code, if any.
    pub(crate) async fn decrypt_and_admit(
        self: &Arc<Self>,
        node: &Node,
        info: &MessageInfo,
        from_offline: bool,
    ) -> Option<u16> {
        let enc_children = node.get_children_by_tag("enc");
        if enc_children.is_empty() {
            debug!(target: "Client/Recv", "message {} has no enc children", info.id);
            return None;
        }

        let mut admitted = Vec::new();
        for enc in enc_children {
            let enc_type = enc
                .attrs
                .get("type")
                .cloned()
                .unwrap_or_default();
            let Some(ciphertext) = enc.bytes_content() else {
                warn!(target: "Client/Recv", "enc child without ciphertext in {}", info.id);
                return Some(ACK_PARSING_ERROR);
            };

            match self.decrypt_with_retry(&enc_type, ciphertext, info).await {
                Ok(plaintext) => {
                    match self.admit_plaintext(&plaintext, info).await {
                        Ok(Some(message)) => admitted.push(message),
                        Ok(None) => {}
                        Err(e) => {
                            warn!(target: "Client/Recv", "undecodable plaintext in {}: {e}", info.id);
                            return Some(ACK_PARSING_ERROR);
                        }
                    }
                }
                Err(e) if e.is_missing_keys() => {
                    // We can never decrypt this; NACK instead of asking for
                    // a retry that would fail the same way.
                    warn!(target: "Client/Recv", "missing keys for {}: {e}", info.id);
                    return Some(ACK_PARSING_ERROR);
                }
                Err(e) => {
                    info!(target: "Client/Recv", "decrypt failed for {} ({e}), requesting retry", info.id);
                    self.emit(Event::UndecryptableMessage(UndecryptableMessage {
                        info: info.clone(),
                        reason: e.to_string(),
                    }));
                    self.spawn_retry_receipt(info);
                    return None;
                }
            }
        }

        if admitted.is_empty() {
            return None;
        }

        // A real envelope supersedes any pending placeholder-resend ask.
        self.placeholder_cache.invalidate(&info.id).await;

        let receipt_type = receipt_type_for(info, admitted.first());
        if let Err(e) = self.send_message_receipt(info, receipt_type).await {
            debug!(target: "Client/Recv", "receipt send failed for {}: {e}", info.id);
        }

        let kind = if from_offline || info.offline {
            UpsertType::Append
        } else {
            UpsertType::Notify
        };
        self.emit(Event::MessagesUpsert(MessagesUpsert {
            messages: admitted
                .into_iter()
                .map(|message| IncomingMessage {
                    info: info.clone(),
                    message,
                })
                .collect(),
            kind,
        }));
        None
    }

    /// One `enc` child through the right cipher, with bounded exponential
    /// backoff. Missing-key failures are not retried locally.
    async fn decrypt_with_retry(
        self: &Arc<Self>,
        enc_type: &str,
        ciphertext: &[u8],
        info: &MessageInfo,
    ) -> Result<Vec<u8>, SignalError> {
        let mut delay = self.config.retry_request_delay;
        let attempts = self.config.max_msg_retry_count.max(1);
        let mut last_err = SignalError::InvalidMessage("no decrypt attempts made");

        for attempt in 1..=attempts {
            match self.decrypt_enc(enc_type, ciphertext, info).await {
                Ok(plaintext) => return Ok(plaintext),
                Err(e) if e.is_missing_keys() => return Err(e),
                Err(e) => {
                    debug!(
                        target: "Client/Recv",
                        "decrypt attempt {attempt}/{attempts} for {} failed: {e}",
                        info.id
                    );
                    last_err = e;
                    if attempt < attempts {
                        tokio::time::sleep(delay).await;
                        delay *= 2;
                    }
                }
            }
        }
        Err(last_err)
    }

    async fn decrypt_enc(
        &self,
        enc_type: &str,
        ciphertext: &[u8],
        info: &MessageInfo,
    ) -> Result<Vec<u8>, SignalError> {
        let store = &*self.store;
        let address = info.source.sender.signal_address();
        match enc_type {
            "pkmsg" => {
                message_decrypt_prekey(ciphertext, &address, store, store, store, store).await
            }
            "msg" => message_decrypt(ciphertext, &address, store, store).await,
            "skmsg" => {
                let name = SenderKeyName::new(
                    info.source.chat.to_string(),
                    address.to_string(),
                );
                group::group_decrypt(&name, ciphertext, store).await
            }
            other => {
                warn!(target: "Client/Recv", "unknown enc type '{other}'");
                Err(SignalError::InvalidMessage("unknown enc type"))
            }
        }
    }

    /// Decodes the padded plaintext and applies side effects (sender-key
    /// installs, protocol messages). Returns the user-visible message, if
    /// there is one.
    async fn admit_plaintext(
        self: &Arc<Self>,
        plaintext: &[u8],
        info: &MessageInfo,
    ) -> Result<Option<proto::Message>, crate::error::ClientError> {
        let unpadded = unpad_message(plaintext)?;
        let message = proto::Message::decode(unpadded)
            .map_err(|e| crate::error::ClientError::Internal(format!("bad message proto: {e}")))?;

        if let Some(holder) = &message.sender_key_distribution_message {
            if let (Some(group_id), Some(blob)) = (
                &holder.group_id,
                &holder.axolotl_sender_key_distribution_message,
            ) {
                let name = SenderKeyName::new(
                    group_id.clone(),
                    info.source.sender.signal_address().to_string(),
                );
                match group::parse_distribution_message(blob) {
                    Ok(skdm) => {
                        group::process_distribution_message(&name, &skdm, &*self.store).await?;
                        debug!(target: "Client/Recv", "installed sender key for {name}");
                    }
                    Err(e) => {
                        warn!(target: "Client/Recv", "bad sender key distribution in {}: {e}", info.id)
                    }
                }
            }
        }

        let content = message.clone().unwrap_device_sent();
        let is_bare_distribution = content.conversation.is_none()
            && content.protocol_message.is_none()
            && message.sender_key_distribution_message.is_some();
        if is_bare_distribution {
            return Ok(None);
        }
        Ok(Some(content))
    }
}

fn receipt_type_for(info: &MessageInfo, message: Option<&proto::Message>) -> ReceiptType {
    let is_history_sync = message
        .and_then(|m| m.protocol_message.as_ref())
        .and_then(|p| p.r#type)
        == Some(proto::protocol_message_type::HISTORY_SYNC_NOTIFICATION);
    if is_history_sync {
        return ReceiptType::HistSync;
    }
    if info.source.is_from_me {
        // Our own device talking to us is a peer message; our outbound copy
        // in a chat is acknowledged as sender.
        if !info.source.is_group && info.source.chat.user == info.source.sender.user {
            return ReceiptType::PeerMsg;
        }
        return ReceiptType::Sender;
    }
    ReceiptType::Delivered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binary::jid::Jid;
    use crate::types::message::MessageSource;

    fn info(is_from_me: bool, is_group: bool, chat: &str, sender: &str) -> MessageInfo {
        MessageInfo {
            id: "3EB0TEST".into(),
            source: MessageSource {
                chat: chat.parse::<Jid>().unwrap(),
                sender: sender.parse::<Jid>().unwrap(),
                is_from_me,
                is_group,
            },
            timestamp: 0,
            push_name: String::new(),
            category: String::new(),
            offline: false,
        }
    }

    #[test]
    fn receipt_kind_selection() {
        let inbound = info(false, false, "1@s.whatsapp.net", "1@s.whatsapp.net");
        assert_eq!(receipt_type_for(&inbound, None), ReceiptType::Delivered);

        let own_copy = info(true, false, "2@s.whatsapp.net", "1:3@s.whatsapp.net");
        assert_eq!(receipt_type_for(&own_copy, None), ReceiptType::Sender);

        let peer = info(true, false, "1@s.whatsapp.net", "1:3@s.whatsapp.net");
        assert_eq!(receipt_type_for(&peer, None), ReceiptType::PeerMsg);

        let hist = proto::Message {
            protocol_message: Some(proto::ProtocolMessage {
                key: None,
                r#type: Some(proto::protocol_message_type::HISTORY_SYNC_NOTIFICATION),
            }),
            ..Default::default()
        };
        assert_eq!(
            receipt_type_for(&peer, Some(&hist)),
            ReceiptType::HistSync
        );
    }
}
