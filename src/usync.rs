//! Device-list resolution over `usync` queries, with a short-lived cache.

use crate::binary::jid::Jid;
use crate::binary::node::{NodeBuilder, NodeContent};
use crate::client::Client;
use crate::error::ClientError;
use crate::request::InfoQuery;
use log::debug;

impl Client {
    /// Resolves each user to the full set of their device JIDs. Results are
    /// cached per user for a short window; retry replays bypass the cache.
    pub(crate) async fn resolve_devices(
        &self,
        users: &[Jid],
        use_cache: bool,
    ) -> Result<Vec<Jid>, ClientError> {
        let mut resolved = Vec::new();
        let mut to_query = Vec::new();

        for user in users {
            let bare = user.to_non_ad();
            if use_cache {
                if let Some(devices) = self.device_cache.get(&bare.to_string()).await {
                    resolved.extend(devices);
                    continue;
                }
            }
            to_query.push(bare);
        }

        if to_query.is_empty() {
            return Ok(resolved);
        }

        let user_nodes: Vec<_> = to_query
            .iter()
            .map(|jid| NodeBuilder::new("user").attr("jid", jid.to_string()).build())
            .collect();

        let usync_node = NodeBuilder::new("usync")
            .attr("sid", self.generate_request_id())
            .attr("mode", "query")
            .attr("context", "message")
            .attr("index", "0")
            .attr("last", "true")
            .children([
                NodeBuilder::new("query")
                    .children([NodeBuilder::new("devices").attr("version", "2").build()])
                    .build(),
                NodeBuilder::new("list").children(user_nodes).build(),
            ])
            .build();

        let response = self
            .send_iq(InfoQuery::get(
                "usync",
                Jid::server_jid(),
                Some(NodeContent::Nodes(vec![usync_node])),
            ))
            .await?;

        let list = response
            .get_optional_child_by_tag(&["usync", "list"])
            .ok_or_else(|| {
                ClientError::Internal("usync response without result list".to_string())
            })?;

        for user_node in list.get_children_by_tag("user") {
            let Some(user_jid) = user_node.attrs().optional_jid("jid") else {
                continue;
            };
            let mut devices = Vec::new();
            if let Some(device_list) =
                user_node.get_optional_child_by_tag(&["devices", "device-list"])
            {
                for device in device_list.get_children_by_tag("device") {
                    if let Some(id) = device.attrs().optional_u64("id") {
                        devices.push(user_jid.with_device(id as u16));
                    }
                }
            }
            if devices.is_empty() {
                devices.push(user_jid.clone());
            }
            debug!(target: "Client/Usync", "{user_jid} has {} devices", devices.len());
            self.device_cache
                .insert(user_jid.to_non_ad().to_string(), devices.clone())
                .await;
            resolved.extend(devices);
        }

        Ok(resolved)
    }
}
