use crate::binary::node::NodeBuilder;
use crate::client::Client;
use crate::crypto::key_pair::PreKey;
use crate::error::ClientError;
use crate::message::keys_node;
use crate::store::commands::DeviceCommand;
use crate::store::traits::StoreKind;
use crate::types::events::Event;
use crate::types::message::MessageInfo;
use log::{debug, info, warn};
use prost::Message as ProstMessage;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

impl Client {
    /// Bumps the per-(id, participant) retry counter. Returns `None` once
    /// the cap is reached; the maxed entry stays until its TTL lapses, so
    /// further retries for the same id stay suppressed and the counter only
    /// starts over on a later occurrence.
    pub(crate) async fn increment_retry_count(&self, cache_key: &str) -> Option<u8> {
        let current = self
            .msg_retry_cache
            .get(&cache_key.to_string())
            .await
            .unwrap_or(0);
        if current >= self.config.max_msg_retry_count {
            return None;
        }
        let next = current + 1;
        self.msg_retry_cache
            .insert(cache_key.to_string(), next)
            .await;
        Some(next)
    }

    /// Requests a re-send of an undecryptable message. Serialized by the
    /// retry mutex so only one retry negotiation runs at a time.
    pub(crate) fn spawn_retry_receipt(self: &Arc<Self>, info: &MessageInfo) {
        let client = Arc::clone(self);
        let info = info.clone();
        tokio::spawn(async move {
            let _retry_guard = client.retry_mutex.lock().await;
            let cache_key = format!(
                "{}:{}:{}",
                info.source.chat, info.id, info.source.sender
            );
            let Some(count) = client.increment_retry_count(&cache_key).await else {
                info!(
                    target: "Client/Retry",
                    "retry cap reached for {}, giving up on it", info.id
                );
                return;
            };
            match client.send_retry_receipt(&info, count).await {
                Ok(()) => debug!(target: "Client/Retry", "sent retry #{count} for {}", info.id),
                Err(e) => warn!(
                    target: "Client/Retry",
                    "failed to send retry #{count} for {}: {e}", info.id
                ),
            }
        });
    }

    /// Emits `receipt type=retry`. From the second attempt on it carries a
    /// fresh pre-key bundle, committed to the store in one transaction with
    /// the counter advance so the server and we agree on the key material.
    pub(crate) async fn send_retry_receipt(
        self: &Arc<Self>,
        info: &MessageInfo,
        count: u8,
    ) -> Result<(), ClientError> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();

        let retry_child = NodeBuilder::new("retry")
            .attr("count", count.to_string())
            .attr("id", info.id.clone())
            .attr("t", now.to_string())
            .attr("v", "1")
            .build();
        let mut children = vec![retry_child];

        if count > 1 {
            let creds = self.store.creds().await;
            let prekey_id = creds.next_pre_key_id;
            let prekey = PreKey::new(prekey_id);

            let mut tx = self.store.begin();
            tx.set(
                StoreKind::PreKey,
                prekey_id.to_string(),
                Some(serde_json::to_vec(&prekey).map_err(crate::store::error::StoreError::from)?),
            );
            self.store.commit(tx).await?;
            self.store
                .process_command(DeviceCommand::SetNextPreKeyId(prekey_id + 1))
                .await;
            self.emit(Event::CredsUpdate);

            children.push(keys_node(
                creds.registration_id,
                &creds.signed_identity_key.public_key,
                &prekey,
                &creds.signed_pre_key,
                creds.account.as_ref().map(|a| a.encode_to_vec()),
            ));
        }

        let mut builder = NodeBuilder::new("receipt")
            .attr("to", info.source.chat.to_string())
            .attr("id", info.id.clone())
            .attr("type", "retry");
        if info.source.is_group {
            builder = builder.attr("participant", info.source.sender.to_string());
        }
        self.send_node(builder.children(children).build()).await
    }
}

#[cfg(test)]
mod tests {
    use crate::config::SocketConfig;
    use crate::store::memory::MemoryStore;
    use crate::store::{AuthCreds, DeviceStore};
    use std::sync::Arc;

    #[tokio::test]
    async fn retry_counter_caps_and_suppresses() {
        let store = DeviceStore::new(AuthCreds::init(), Arc::new(MemoryStore::new()));
        let client = crate::client::Client::new(SocketConfig::default(), store);

        let key = "chat:MSGID:sender";
        for expected in 1..=5u8 {
            assert_eq!(client.increment_retry_count(key).await, Some(expected));
        }
        // Cap reached: every further request is suppressed until the TTL
        // expires the entry.
        assert_eq!(client.increment_retry_count(key).await, None);
        assert_eq!(client.increment_retry_count(key).await, None);
    }
}
