use crate::binary::jid::Jid;
use crate::binary::node::{Node, NodeBuilder, NodeContent};
use crate::client::Client;
use crate::error::ClientError;
use log::warn;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::timeout;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InfoQueryType {
    Get,
    Set,
}

impl InfoQueryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            InfoQueryType::Get => "get",
            InfoQueryType::Set => "set",
        }
    }
}

/// An outbound iq: namespace, type, target, and optional content. The
/// message tag is generated unless the caller supplies one.
#[derive(Debug, Clone)]
pub struct InfoQuery {
    pub namespace: &'static str,
    pub query_type: InfoQueryType,
    pub to: Jid,
    pub id: Option<String>,
    pub content: Option<NodeContent>,
    pub timeout: Option<Duration>,
}

impl InfoQuery {
    pub fn get(namespace: &'static str, to: Jid, content: Option<NodeContent>) -> Self {
        Self {
            namespace,
            query_type: InfoQueryType::Get,
            to,
            id: None,
            content,
            timeout: None,
        }
    }

    pub fn set(namespace: &'static str, to: Jid, content: Option<NodeContent>) -> Self {
        Self {
            namespace,
            query_type: InfoQueryType::Set,
            to,
            id: None,
            content,
            timeout: None,
        }
    }
}

impl Client {
    /// Correlation tag for iq requests: `prefix-counter`.
    pub fn generate_request_id(&self) -> String {
        let count = self
            .id_counter
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        format!("{}-{}", self.unique_id, count)
    }

    /// Message ids use the `3EB0` + uppercase-hex format the protocol
    /// expects; stable across retries of the same logical message.
    pub async fn generate_message_id(&self) -> String {
        let mut data = Vec::with_capacity(8 + 24 + 16);
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        data.extend_from_slice(&now.to_be_bytes());
        if let Some(me) = self.store.me().await {
            data.extend_from_slice(me.user.as_bytes());
            data.extend_from_slice(b"@c.us");
        }
        let mut random_bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut random_bytes);
        data.extend_from_slice(&random_bytes);

        let hash = Sha256::digest(&data);
        format!("3EB0{}", hex::encode_upper(&hash[..9]))
    }

    /// Sends an iq and parks until the correlated response or timeout.
    pub async fn send_iq(&self, query: InfoQuery) -> Result<Node, ClientError> {
        let req_id = query
            .id
            .clone()
            .unwrap_or_else(|| self.generate_request_id());

        let (tx, rx) = tokio::sync::oneshot::channel();
        self.response_waiters
            .lock()
            .await
            .insert(req_id.clone(), tx);

        let node = NodeBuilder::new("iq")
            .attr("id", req_id.clone())
            .attr("xmlns", query.namespace)
            .attr("type", query.query_type.as_str())
            .attr("to", query.to.to_string())
            .apply_content(query.content)
            .build();

        if let Err(e) = self.send_node(node).await {
            self.response_waiters.lock().await.remove(&req_id);
            return Err(e);
        }

        let wait = query.timeout.unwrap_or(self.config.default_query_timeout);
        match timeout(wait, rx).await {
            Ok(Ok(response)) => {
                if response.tag == "stream:error" || response.tag == "xmlstreamend" {
                    return Err(ClientError::ConnectionClosed);
                }
                if response.attrs.get("type").map(String::as_str) == Some("error") {
                    let (code, text) = parse_iq_error(&response);
                    if code == 429 {
                        return Err(ClientError::RateLimited(text));
                    }
                    return Err(ClientError::ServerError { code, text });
                }
                Ok(response)
            }
            Ok(Err(_)) => Err(ClientError::ConnectionClosed),
            Err(_) => {
                self.response_waiters.lock().await.remove(&req_id);
                Err(ClientError::Timeout)
            }
        }
    }

    /// Routes an inbound iq to its waiter. Returns false when nobody is
    /// waiting on that tag.
    pub async fn handle_iq_response(&self, node: Node) -> bool {
        let Some(id) = node.attrs.get("id").cloned() else {
            return false;
        };
        let Some(waiter) = self.response_waiters.lock().await.remove(&id) else {
            return false;
        };
        if waiter.send(node).is_err() {
            warn!(target: "Client/IQ", "iq waiter for {id} was dropped before the response arrived");
        }
        true
    }

    /// Fails every pending waiter; used when the connection goes away.
    pub async fn cancel_response_waiters(&self) {
        let mut waiters = self.response_waiters.lock().await;
        for (_, waiter) in waiters.drain() {
            // Receivers learn of the closure through the dropped sender.
            drop(waiter);
        }
    }
}

fn parse_iq_error(response: &Node) -> (u16, String) {
    match response.get_optional_child("error") {
        Some(error_node) => {
            let mut parser = error_node.attrs();
            let code = parser.optional_u64("code").unwrap_or(0) as u16;
            let text = parser
                .optional_string("text")
                .unwrap_or_default()
                .to_string();
            (code, text)
        }
        None => (0, "malformed error response".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iq_error_parsing() {
        let node = NodeBuilder::new("iq")
            .attr("type", "error")
            .children([NodeBuilder::new("error")
                .attr("code", "429")
                .attr("text", "rate-overlimit")
                .build()])
            .build();
        assert_eq!(parse_iq_error(&node), (429, "rate-overlimit".to_string()));
    }
}
