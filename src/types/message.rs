use crate::binary::jid::Jid;

/// Where a message came from, resolved from stanza attributes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageSource {
    pub chat: Jid,
    /// The specific device that sent it; equals `chat` for direct chats.
    pub sender: Jid,
    pub is_from_me: bool,
    pub is_group: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageInfo {
    pub id: String,
    pub source: MessageSource,
    pub timestamp: i64,
    pub push_name: String,
    pub category: String,
    /// Set when the stanza carried `offline="true"` (server-buffered).
    pub offline: bool,
}

/// Receipt kinds, both inbound and emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiptType {
    /// Absent `type` attribute: plain delivery.
    Delivered,
    Sender,
    Retry,
    Read,
    ReadSelf,
    Played,
    Inactive,
    PeerMsg,
    HistSync,
    ServerError,
}

impl ReceiptType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReceiptType::Delivered => "",
            ReceiptType::Sender => "sender",
            ReceiptType::Retry => "retry",
            ReceiptType::Read => "read",
            ReceiptType::ReadSelf => "read-self",
            ReceiptType::Played => "played",
            ReceiptType::Inactive => "inactive",
            ReceiptType::PeerMsg => "peer_msg",
            ReceiptType::HistSync => "hist_sync",
            ReceiptType::ServerError => "server-error",
        }
    }
}

impl From<&str> for ReceiptType {
    fn from(s: &str) -> Self {
        match s {
            "" | "delivery" => ReceiptType::Delivered,
            "sender" => ReceiptType::Sender,
            "retry" => ReceiptType::Retry,
            "read" => ReceiptType::Read,
            "read-self" => ReceiptType::ReadSelf,
            "played" => ReceiptType::Played,
            "inactive" => ReceiptType::Inactive,
            "peer_msg" => ReceiptType::PeerMsg,
            "hist_sync" => ReceiptType::HistSync,
            _ => ReceiptType::ServerError,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn receipt_type_string_mapping() {
        assert_eq!(ReceiptType::from(""), ReceiptType::Delivered);
        assert_eq!(ReceiptType::from("retry"), ReceiptType::Retry);
        assert_eq!(ReceiptType::from("read"), ReceiptType::Read);
        assert_eq!(ReceiptType::Read.as_str(), "read");
    }
}
