//! Pre-key stock management: lazy upload when the server's count runs low,
//! and bundle fetches for peers we have no session with.

use crate::binary::jid::Jid;
use crate::binary::node::{Node, NodeBuilder, NodeContent};
use crate::client::Client;
use crate::crypto::key_pair::DJB_TYPE;
use crate::error::ClientError;
use crate::request::InfoQuery;
use crate::signal::keyhelper;
use crate::signal::session::PreKeyBundle;
use crate::store::commands::DeviceCommand;
use crate::store::traits::StoreKind;
use crate::types::events::Event;
use log::{info, warn};
use std::collections::HashMap;

/// Server-side threshold below which we top the stock up.
const MIN_PREKEY_COUNT: usize = 5;
/// How many one-time pre-keys one upload carries.
const PREKEY_UPLOAD_BATCH: u32 = 30;

/// Big-endian integer from a 1-4 byte blob; ids come packed to 3 bytes,
/// registration ids to 4.
pub(crate) fn be_u32(bytes: &[u8]) -> Option<u32> {
    if bytes.is_empty() || bytes.len() > 4 {
        return None;
    }
    let mut buf = [0u8; 4];
    buf[4 - bytes.len()..].copy_from_slice(bytes);
    Some(u32::from_be_bytes(buf))
}

impl Client {
    pub(crate) async fn get_server_prekey_count(&self) -> Result<usize, ClientError> {
        let response = self
            .send_iq(InfoQuery::get(
                "encrypt",
                Jid::server_jid(),
                Some(NodeContent::Nodes(vec![NodeBuilder::new("count").build()])),
            ))
            .await?;
        let count = response
            .get_optional_child("count")
            .and_then(|n| n.attrs().optional_u64("value"))
            .unwrap_or(0);
        Ok(count as usize)
    }

    pub(crate) async fn refill_prekeys_if_needed(&self) -> Result<(), ClientError> {
        let count = self.get_server_prekey_count().await?;
        if count >= MIN_PREKEY_COUNT {
            return Ok(());
        }
        info!(target: "Client/PreKeys", "server holds {count} pre-keys, uploading more");
        self.upload_prekeys().await
    }

    /// Generates a batch, commits it with the counter advance in one
    /// transaction, then uploads. `firstUnuploadedPreKeyId` only moves once
    /// the server accepted the batch.
    pub(crate) async fn upload_prekeys(&self) -> Result<(), ClientError> {
        let creds = self.store.creds().await;
        let start_id = creds.next_pre_key_id;
        let prekeys = keyhelper::generate_prekeys(start_id, PREKEY_UPLOAD_BATCH);

        let mut tx = self.store.begin();
        for pk in &prekeys {
            tx.set(
                StoreKind::PreKey,
                pk.key_id.to_string(),
                Some(serde_json::to_vec(pk).map_err(crate::store::error::StoreError::from)?),
            );
        }
        self.store.commit(tx).await?;
        self.store
            .process_command(DeviceCommand::SetNextPreKeyId(start_id + PREKEY_UPLOAD_BATCH))
            .await;
        self.emit(Event::CredsUpdate);

        let key_nodes: Vec<Node> = prekeys
            .iter()
            .map(|pk| {
                NodeBuilder::new("key")
                    .children([
                        NodeBuilder::new("id")
                            .bytes(pk.key_id.to_be_bytes()[1..].to_vec())
                            .build(),
                        NodeBuilder::new("value")
                            .bytes(pk.key_pair.public_key.to_vec())
                            .build(),
                    ])
                    .build()
            })
            .collect();

        let skey = &creds.signed_pre_key;
        let skey_node = NodeBuilder::new("skey")
            .children([
                NodeBuilder::new("id")
                    .bytes(skey.key_id.to_be_bytes()[1..].to_vec())
                    .build(),
                NodeBuilder::new("value")
                    .bytes(skey.key_pair.public_key.to_vec())
                    .build(),
                NodeBuilder::new("signature")
                    .bytes(skey.signature.map(|s| s.to_vec()).unwrap_or_default())
                    .build(),
            ])
            .build();

        self.send_iq(InfoQuery::set(
            "encrypt",
            Jid::server_jid(),
            Some(NodeContent::Nodes(vec![
                NodeBuilder::new("registration")
                    .bytes(creds.registration_id.to_be_bytes().to_vec())
                    .build(),
                NodeBuilder::new("type").bytes(vec![DJB_TYPE]).build(),
                NodeBuilder::new("identity")
                    .bytes(creds.signed_identity_key.public_key.to_vec())
                    .build(),
                NodeBuilder::new("list").children(key_nodes).build(),
                skey_node,
            ])),
        ))
        .await?;

        self.store
            .process_command(DeviceCommand::SetFirstUnuploadedPreKeyId(
                start_id + PREKEY_UPLOAD_BATCH,
            ))
            .await;
        self.emit(Event::CredsUpdate);
        info!(
            target: "Client/PreKeys",
            "uploaded pre-keys {start_id}..{}", start_id + PREKEY_UPLOAD_BATCH - 1
        );
        Ok(())
    }

    /// Fetches pre-key bundles for the given device JIDs.
    pub(crate) async fn fetch_prekeys(
        &self,
        devices: &[Jid],
    ) -> Result<HashMap<Jid, PreKeyBundle>, ClientError> {
        let user_nodes: Vec<Node> = devices
            .iter()
            .map(|jid| NodeBuilder::new("user").attr("jid", jid.to_string()).build())
            .collect();

        let response = self
            .send_iq(InfoQuery::get(
                "encrypt",
                Jid::server_jid(),
                Some(NodeContent::Nodes(vec![NodeBuilder::new("key")
                    .children(user_nodes)
                    .build()])),
            ))
            .await?;

        let list = response.get_optional_child("list").ok_or_else(|| {
            ClientError::Internal("pre-key response without list".to_string())
        })?;

        let mut bundles = HashMap::new();
        for user in list.get_children_by_tag("user") {
            let Some(jid) = user.attrs().optional_jid("jid") else {
                continue;
            };
            match parse_bundle_node(user) {
                Some(bundle) => {
                    bundles.insert(jid, bundle);
                }
                None => warn!(target: "Client/PreKeys", "malformed bundle for {jid}"),
            }
        }
        Ok(bundles)
    }
}

fn parse_bundle_node(user: &Node) -> Option<PreKeyBundle> {
    let registration_id = be_u32(user.get_optional_child("registration")?.bytes_content()?)?;
    let identity_key: [u8; 32] = user
        .get_optional_child("identity")?
        .bytes_content()?
        .try_into()
        .ok()?;

    let skey = user.get_optional_child("skey")?;
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

    // The one-time key is optional; the server omits it when the stock ran
    // out.
    let pre_key = user.get_optional_child("key").and_then(|key| {
        let id = be_u32(key.get_optional_child("id")?.bytes_content()?)?;
        let value: [u8; 32] = key
            .get_optional_child("value")?
            .bytes_content()?
            .try_into()
            .ok()?;
        Some((id, value))
    });

    Some(PreKeyBundle {
        registration_id,
        identity_key,
        signed_pre_key_id,
        signed_pre_key_pub,
        signed_pre_key_signature,
        pre_key,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::key_pair::KeyPair;

    #[test]
    fn bundle_node_parsing() {
        let identity = KeyPair::new();
        let signed = identity.create_signed_prekey(2);
        let one_time = crate::crypto::key_pair::PreKey::new(44);

        let user = NodeBuilder::new("user")
            .attr("jid", "123:0@s.whatsapp.net")
            .children([
                NodeBuilder::new("registration")
                    .bytes(777u32.to_be_bytes().to_vec())
                    .build(),
                NodeBuilder::new("identity")
                    .bytes(identity.public_key.to_vec())
                    .build(),
                NodeBuilder::new("skey")
                    .children([
                        NodeBuilder::new("id")
                            .bytes(signed.key_id.to_be_bytes()[1..].to_vec())
                            .build(),
                        NodeBuilder::new("value")
                            .bytes(signed.key_pair.public_key.to_vec())
                            .build(),
                        NodeBuilder::new("signature")
                            .bytes(signed.signature.unwrap().to_vec())
                            .build(),
                    ])
                    .build(),
                NodeBuilder::new("key")
                    .children([
                        NodeBuilder::new("id")
                            .bytes(one_time.key_id.to_be_bytes()[1..].to_vec())
                            .build(),
                        NodeBuilder::new("value")
                            .bytes(one_time.key_pair.public_key.to_vec())
                            .build(),
                    ])
                    .build(),
            ])
            .build();

        let bundle = parse_bundle_node(&user).expect("parses");
        assert_eq!(bundle.registration_id, 777);
        assert_eq!(bundle.signed_pre_key_id, 2);
        assert_eq!(bundle.pre_key, Some((44, one_time.key_pair.public_key)));
    }

    #[test]
    fn bundle_without_one_time_key() {
        let identity = KeyPair::new();
        let signed = identity.create_signed_prekey(9);
        let user = NodeBuilder::new("user")
            .children([
                NodeBuilder::new("registration")
                    .bytes(1u32.to_be_bytes().to_vec())
                    .build(),
                NodeBuilder::new("identity")
                    .bytes(identity.public_key.to_vec())
                    .build(),
                NodeBuilder::new("skey")
                    .children([
                        NodeBuilder::new("id").bytes(vec![0, 0, 9]).build(),
                        NodeBuilder::new("value")
                            .bytes(signed.key_pair.public_key.to_vec())
                            .build(),
                        NodeBuilder::new("signature")
                            .bytes(signed.signature.unwrap().to_vec())
                            .build(),
                    ])
                    .build(),
            ])
            .build();
        let bundle = parse_bundle_node(&user).expect("parses");
        assert_eq!(bundle.pre_key, None);
    }
}
