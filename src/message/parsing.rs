use crate::binary::node::Node;
use crate::client::Client;
use crate::error::ClientError;
use crate::types::message::{MessageInfo, MessageSource};

/// Resolves a `message` stanza's routing attributes into a [`MessageInfo`].
///
/// Group traffic carries the group in `from` and the sending device in
/// `participant`; direct traffic carries the sending device in `from`, with
/// `recipient` set when it is our own outbound copy.
pub async fn parse_message_info(client: &Client, node: &Node) -> Result<MessageInfo, ClientError> {
    let mut attrs = node.attrs();
    let from = attrs.jid("from");
    let id = attrs.string("id");
    let timestamp = attrs.unix_time("t");
    let participant = attrs.optional_jid("participant");
    let recipient = attrs.optional_jid("recipient");
    let push_name = attrs
        .optional_string("notify")
        .unwrap_or_default()
        .to_string();
    let category = attrs
        .optional_string("category")
        .unwrap_or_default()
        .to_string();
    let offline = attrs.optional_bool("offline");
    attrs
        .finish()
        .map_err(|e| ClientError::Binary(e))?;

    let own_user = client
        .store
        .me()
        .await
        .map(|me| me.user)
        .unwrap_or_default();

    let source = if from.is_group() || from.is_broadcast() {
        let sender = participant.ok_or_else(|| {
            ClientError::InvalidArgument("group message without participant".to_string())
        })?;
        MessageSource {
            is_from_me: !own_user.is_empty() && sender.user == own_user,
            chat: from.clone(),
            sender,
            is_group: true,
        }
    } else if !own_user.is_empty() && from.user == own_user {
        MessageSource {
            chat: recipient.unwrap_or_else(|| from.to_non_ad()),
            sender: from,
            is_from_me: true,
            is_group: false,
        }
    } else {
        MessageSource {
            chat: from.to_non_ad(),
            sender: from,
            is_from_me: false,
            is_group: false,
        }
    };

    if id.is_empty() {
        return Err(ClientError::InvalidArgument(
            "message without id".to_string(),
        ));
    }

    Ok(MessageInfo {
        id,
        source,
        timestamp,
        push_name,
        category,
        offline,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binary::node::NodeBuilder;
    use crate::config::SocketConfig;
    use crate::store::memory::MemoryStore;
    use crate::store::{AuthCreds, DeviceStore};
    use std::sync::Arc;

    fn test_client() -> Arc<Client> {
        let store = DeviceStore::new(AuthCreds::init(), Arc::new(MemoryStore::new()));
        Client::new(SocketConfig::default(), store)
    }

    #[tokio::test]
    async fn direct_message_routing() {
        let client = test_client();
        let node = NodeBuilder::new("message")
            .attr("from", "15550001111:2@s.whatsapp.net")
            .attr("id", "3EB0AA")
            .attr("t", "1700000000")
            .attr("notify", "Alice")
            .build();
        let info = parse_message_info(&client, &node).await.unwrap();
        assert_eq!(info.source.chat.to_string(), "15550001111@s.whatsapp.net");
        assert_eq!(info.source.sender.device, 2);
        assert!(!info.source.is_group);
        assert!(!info.source.is_from_me);
        assert_eq!(info.push_name, "Alice");
    }

    #[tokio::test]
    async fn group_message_requires_participant() {
        let client = test_client();
        let without = NodeBuilder::new("message")
            .attr("from", "120363000@g.us")
            .attr("id", "3EB0BB")
            .attr("t", "1700000000")
            .build();
        assert!(parse_message_info(&client, &without).await.is_err());

        let with = NodeBuilder::new("message")
            .attr("from", "120363000@g.us")
            .attr("participant", "15550002222:1@s.whatsapp.net")
            .attr("id", "3EB0CC")
            .attr("t", "1700000000")
            .attr("offline", "1")
            .build();
        let info = parse_message_info(&client, &with).await.unwrap();
        assert!(info.source.is_group);
        assert!(info.offline);
        assert_eq!(info.source.sender.user, "15550002222");
    }
}
