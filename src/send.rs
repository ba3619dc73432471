//! Outbound message pipeline: device resolution, session assertion,
//! per-device signal encryption, and group fan-out via sender keys.

use crate::binary::jid::Jid;
use crate::binary::node::{Node, NodeBuilder, NodeContent};
use crate::client::Client;
use crate::config::{AddressingMode, GroupMetadata};
use crate::error::ClientError;
use crate::message::pad_message;
use crate::proto;
use crate::request::InfoQuery;
use crate::signal::address::SenderKeyName;
use crate::signal::store::SessionStore;
use crate::signal::{group, message_encrypt, process_prekey_bundle};
use crate::store::traits::StoreKind;
use log::{debug, info, warn};
use prost::Message as ProstMessage;
use std::collections::HashMap;

impl Client {
    /// Sends a message to a user or group, returning the message id.
    pub async fn send_message(
        &self,
        to: Jid,
        message: proto::Message,
    ) -> Result<String, ClientError> {
        self.send_message_impl(to, &message, None, None, false).await
    }

    /// Device-to-device message to one of our own devices (no fan-out).
    pub(crate) async fn send_peer_message(
        &self,
        to: Jid,
        message: proto::Message,
    ) -> Result<String, ClientError> {
        let message_id = self.generate_message_id().await;
        let target = to.with_device(0);
        let plaintext = pad_message(message.encode_to_vec());

        self.assert_sessions(std::slice::from_ref(&target)).await?;
        let participant_nodes = self
            .encrypt_for_devices(&[target], &plaintext, None, "")
            .await?;

        let stanza = NodeBuilder::new("message")
            .attr("to", to.to_string())
            .attr("id", message_id.clone())
            .attr("type", "text")
            .attr("category", "peer")
            .children([NodeBuilder::new("participants")
                .children(participant_nodes)
                .build()])
            .build();
        self.send_node(stanza).await?;
        Ok(message_id)
    }

    pub(crate) async fn send_message_impl(
        &self,
        to: Jid,
        message: &proto::Message,
        message_id: Option<String>,
        participant: Option<(Jid, u8)>,
        force_key_distribution: bool,
    ) -> Result<String, ClientError> {
        if to.is_empty() {
            return Err(ClientError::InvalidArgument("empty recipient jid".into()));
        }
        let message_id = match message_id {
            Some(id) => id,
            None => self.generate_message_id().await,
        };
        let is_retry = participant.is_some();

        // Retained so peer retry requests can be honored; the id stays
        // stable across those replays. Keyed by the bare chat JID.
        if !is_retry {
            self.recent_messages
                .insert(
                    format!("{}:{}", to.to_non_ad(), message_id),
                    message.clone(),
                )
                .await;
        }

        if to.is_group() || to.is_broadcast() {
            self.send_group(&to, message, &message_id, participant, force_key_distribution)
                .await?;
        } else {
            self.send_direct(&to, message, &message_id, participant).await?;
        }
        Ok(message_id)
    }

    async fn send_direct(
        &self,
        to: &Jid,
        message: &proto::Message,
        message_id: &str,
        participant: Option<(Jid, u8)>,
    ) -> Result<(), ClientError> {
        let me = self.store.me().await.ok_or(ClientError::NotLoggedIn)?;

        let devices = match &participant {
            // A retry replay narrows the fan-out to the requesting device.
            Some((jid, _)) => vec![jid.clone()],
            None => {
                let mut devices = self
                    .resolve_devices(&[to.clone(), me.to_non_ad()], true)
                    .await?;
                // Everything but the device we are.
                devices.retain(|d| !(d.user == me.user && d.device == me.device));
                devices
            }
        };
        if devices.is_empty() {
            return Err(ClientError::Internal(format!("no devices for {to}")));
        }

        let plaintext = pad_message(message.encode_to_vec());
        let wrapped = pad_message(
            proto::Message {
                device_sent_message: Some(Box::new(proto::DeviceSentMessage {
                    destination_jid: Some(to.to_string()),
                    message: Some(Box::new(message.clone())),
                })),
                ..Default::default()
            }
            .encode_to_vec(),
        );

        self.assert_sessions(&devices).await?;
        let participant_nodes = self
            .encrypt_for_devices(&devices, &plaintext, Some(&wrapped), &me.user)
            .await?;

        let stanza = NodeBuilder::new("message")
            .attr("to", to.to_string())
            .attr("id", message_id)
            .attr("type", "text")
            .children([NodeBuilder::new("participants")
                .children(participant_nodes)
                .build()])
            .build();
        self.send_node(stanza).await
    }

    async fn send_group(
        &self,
        group_jid: &Jid,
        message: &proto::Message,
        message_id: &str,
        participant: Option<(Jid, u8)>,
        force_key_distribution: bool,
    ) -> Result<(), ClientError> {
        let me = self.store.me().await.ok_or(ClientError::NotLoggedIn)?;
        let metadata = self.group_metadata(group_jid).await?;

        let own_sending_jid = match metadata.addressing_mode {
            AddressingMode::Lid => self.store.lid().await.unwrap_or_else(|| me.clone()),
            AddressingMode::Pn => me.clone(),
        };
        let sender_key_name = SenderKeyName::new(
            group_jid.to_string(),
            own_sending_jid.signal_address().to_string(),
        );

        let distribution = group::create_distribution_message(&sender_key_name, &*self.store)
            .await?;

        // Resolve member devices and figure out who still needs our sender
        // key. A retry replay narrows that set to the requesting device.
        let mut members = metadata.participants.clone();
        if !members.iter().any(|p| p.is_same_user_as(&own_sending_jid)) {
            members.push(own_sending_jid.to_non_ad());
        }
        let mut devices = self.resolve_devices(&members, true).await?;
        devices.retain(|d| !(d.user == own_sending_jid.user && d.device == own_sending_jid.device));

        let mut memory = self.sender_key_memory(group_jid).await;
        let distribution_targets: Vec<Jid> = match &participant {
            Some((jid, _)) => vec![jid.clone()],
            None => devices
                .iter()
                .filter(|d| force_key_distribution || !memory.get(&d.to_string()).copied().unwrap_or(false))
                .cloned()
                .collect(),
        };

        let mut participant_nodes = Vec::new();
        if !distribution_targets.is_empty() {
            let skdm_message = proto::Message {
                sender_key_distribution_message: Some(proto::SenderKeyDistributionMessageHolder {
                    group_id: Some(group_jid.to_string()),
                    axolotl_sender_key_distribution_message: Some(
                        group::serialize_distribution_message(&distribution),
                    ),
                }),
                ..Default::default()
            };
            let plaintext = pad_message(skdm_message.encode_to_vec());
            self.assert_sessions(&distribution_targets).await?;
            participant_nodes = self
                .encrypt_for_devices(&distribution_targets, &plaintext, None, "")
                .await?;
            info!(
                target: "Client/Send",
                "distributing sender key for {group_jid} to {} devices",
                distribution_targets.len()
            );
        } else {
            debug!(target: "Client/Send", "all of {group_jid} already holds our sender key");
        }

        let group_plaintext = pad_message(message.encode_to_vec());
        let skmsg = group::group_encrypt(&sender_key_name, &group_plaintext, &*self.store).await?;

        let mut children = Vec::new();
        if !participant_nodes.is_empty() {
            children.push(
                NodeBuilder::new("participants")
                    .children(participant_nodes)
                    .build(),
            );
        }
        children.push(
            NodeBuilder::new("enc")
                .attr("v", "2")
                .attr("type", "skmsg")
                .bytes(skmsg)
                .build(),
        );

        let stanza = NodeBuilder::new("message")
            .attr("to", group_jid.to_string())
            .attr("id", message_id)
            .attr("type", "text")
            .attr("participant", own_sending_jid.to_string())
            .apply_content(Some(NodeContent::Nodes(children)))
            .build();
        self.send_node(stanza).await?;

        // Record who holds our distribution now.
        for target in &distribution_targets {
            memory.insert(target.to_string(), true);
        }
        self.store_sender_key_memory(group_jid, &memory).await?;
        Ok(())
    }

    /// Installs sessions for every device we do not have one with yet,
    /// fetching their bundles in one round trip.
    pub(crate) async fn assert_sessions(&self, devices: &[Jid]) -> Result<(), ClientError> {
        let mut missing = Vec::new();
        for device in devices {
            if !self.store.contains_session(&device.signal_address()).await? {
                missing.push(device.clone());
            }
        }
        if missing.is_empty() {
            return Ok(());
        }

        debug!(target: "Client/Send", "fetching bundles for {} sessionless devices", missing.len());
        let bundles = self.fetch_prekeys(&missing).await?;
        for device in &missing {
            let Some(bundle) = bundles.get(device) else {
                warn!(target: "Client/Send", "server returned no bundle for {device}");
                continue;
            };
            process_prekey_bundle(&device.signal_address(), bundle, &*self.store, &*self.store)
                .await?;
        }
        Ok(())
    }

    /// Encrypts a plaintext for each device, wrapping our own other devices'
    /// copy as a device-sent message when `wrapped` is supplied.
    async fn encrypt_for_devices(
        &self,
        devices: &[Jid],
        plaintext: &[u8],
        wrapped: Option<&[u8]>,
        own_user: &str,
    ) -> Result<Vec<Node>, ClientError> {
        let mut nodes = Vec::with_capacity(devices.len());
        for device in devices {
            let body = match wrapped {
                Some(w) if device.user == own_user => w,
                _ => plaintext,
            };
            let (kind, ciphertext) =
                message_encrypt(body, &device.signal_address(), &*self.store, &*self.store)
                    .await?;
            nodes.push(
                NodeBuilder::new("to")
                    .attr("jid", device.to_string())
                    .children([NodeBuilder::new("enc")
                        .attr("v", "2")
                        .attr("type", kind.as_str())
                        .bytes(ciphertext)
                        .build()])
                    .build(),
            );
        }
        Ok(nodes)
    }

    async fn group_metadata(&self, group_jid: &Jid) -> Result<GroupMetadata, ClientError> {
        if let Some(cached) = &self.config.cached_group_metadata {
            if let Some(metadata) = cached(group_jid) {
                return Ok(metadata);
            }
        }
        self.query_group_metadata(group_jid).await
    }

    pub(crate) async fn query_group_metadata(
        &self,
        group_jid: &Jid,
    ) -> Result<GroupMetadata, ClientError> {
        let response = self
            .send_iq(InfoQuery::get(
                "w:g2",
                group_jid.clone(),
                Some(NodeContent::Nodes(vec![NodeBuilder::new("query")
                    .attr("request", "interactive")
                    .build()])),
            ))
            .await?;

        let group = response.get_optional_child("group").ok_or_else(|| {
            ClientError::Internal(format!("group query for {group_jid} returned no group"))
        })?;

        let addressing_mode = match group.attrs().optional_string("addressing_mode") {
            Some("lid") => AddressingMode::Lid,
            _ => AddressingMode::Pn,
        };
        let participants = group
            .get_children_by_tag("participant")
            .iter()
            .filter_map(|p| p.attrs().optional_jid("jid"))
            .collect();

        Ok(GroupMetadata {
            jid: group_jid.clone(),
            participants,
            addressing_mode,
        })
    }

    pub(crate) async fn sender_key_memory(&self, group_jid: &Jid) -> HashMap<String, bool> {
        self.store
            .get_one(StoreKind::SenderKeyMemory, &group_jid.to_string())
            .await
            .ok()
            .flatten()
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
            .unwrap_or_default()
    }

    async fn store_sender_key_memory(
        &self,
        group_jid: &Jid,
        memory: &HashMap<String, bool>,
    ) -> Result<(), ClientError> {
        let bytes = serde_json::to_vec(memory).map_err(crate::store::error::StoreError::from)?;
        self.store
            .set(vec![(
                StoreKind::SenderKeyMemory,
                group_jid.to_string(),
                Some(bytes),
            )])
            .await?;
        Ok(())
    }
}
