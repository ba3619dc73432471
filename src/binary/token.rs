use std::collections::HashMap;
use std::sync::LazyLock;

pub const DICT_VERSION: u8 = 3;

pub const LIST_EMPTY: u8 = 0;
pub const DICTIONARY_0: u8 = 236;
pub const DICTIONARY_1: u8 = 237;
pub const DICTIONARY_2: u8 = 238;
pub const DICTIONARY_3: u8 = 239;
pub const AD_JID: u8 = 247;
pub const LIST_8: u8 = 248;
pub const LIST_16: u8 = 249;
pub const JID_PAIR: u8 = 250;
pub const HEX_8: u8 = 251;
pub const BINARY_8: u8 = 252;
pub const BINARY_20: u8 = 253;
pub const BINARY_32: u8 = 254;
pub const NIBBLE_8: u8 = 255;

pub const PACKED_MAX: u8 = 127;

/// Single-byte dictionary. Index 0 is reserved (LIST_EMPTY); entries above
/// the dictionary length decode as unknown tokens.
pub static SINGLE_BYTE_TOKENS: &[&str] = &[
    "",
    "xmlstreamstart",
    "xmlstreamend",
    "s.whatsapp.net",
    "type",
    "participant",
    "from",
    "receipt",
    "id",
    "broadcast",
    "status",
    "unavailable",
    "notification",
    "notify",
    "to",
    "jid",
    "user",
    "class",
    "offline",
    "g.us",
    "result",
    "mediatype",
    "enc",
    "skmsg",
    "off_cnt",
    "xmlns",
    "presence",
    "participants",
    "ack",
    "t",
    "iq",
    "device_hash",
    "read",
    "value",
    "media",
    "picture",
    "chatstate",
    "unknown",
    "composing",
    "device",
    "group",
    "text",
    "count",
    "refresh",
    "key",
    "config",
    "message",
    "available",
    "name",
    "category",
    "call",
    "set",
    "get",
    "error",
    "msg",
    "pkmsg",
    "retry",
    "offer",
    "priority",
    "registration",
    "identity",
    "list",
    "skey",
    "signature",
    "success",
    "failure",
    "stream:error",
    "ping",
    "pong",
    "w:p",
    "w:profile:picture",
    "w:stats",
    "usync",
    "query",
    "devices",
    "contacts",
    "mode",
    "context",
    "sid",
    "index",
    "last",
    "delta",
    "version",
    "encrypt",
    "keys",
    "multicast",
    "delivery",
    "played",
    "read-self",
    "sender",
    "inactive",
    "peer_msg",
    "hist_sync",
    "code",
    "expiration",
    "item",
    "add",
    "remove",
    "promote",
    "demote",
    "creator",
    "subject",
    "create",
    "leave",
    "invite",
    "description",
    "announcement",
    "locked",
    "unlocked",
    "w:gp2",
    "w:g2",
    "member",
    "admin",
    "superadmin",
    "pair-device",
    "pair-success",
    "pair-device-sign",
    "device-identity",
    "ref",
    "platform",
    "biz",
    "link_code_companion_reg",
    "companion_ephemeral_pub",
    "link_code_pairing_wrapped_companion_ephemeral_pub",
    "link_code_pairing_wrapped_key_bundle",
    "primary_identity_pub",
    "link_code_pairing_ref",
    "link_code_pairing_nonce",
    "companion_server_auth_key_pub",
    "conflict",
    "replaced",
    "device_removed",
    "restart-required",
    "logged-out",
    "bad-session",
    "precondition-required",
    "too-many-requests",
    "service-unavailable",
    "internal-server-error",
    "timeout",
    "dirty",
    "clean",
    "ib",
    "edge_routing",
    "routing_info",
    "offline_preview",
    "offline_batch",
    "markable",
    "urn:xmpp:whatsapp:push",
    "urn:xmpp:ping",
    "urn:xmpp:receipts",
    "passive",
    "active",
    "background",
    "groups",
    "w:sync:app:state",
    "collection",
    "patch",
    "snapshot",
    "critical_block",
    "critical_unblock_low",
    "regular_low",
    "regular_high",
    "regular",
    "encr_media",
    "digest",
    "verified_name",
    "fallback_hostname",
    "fallback_ip4",
    "fallback_ip6",
    "hostname",
    "ip4",
    "ip6",
    "auth_ttl",
    "media_conn",
    "creation",
    "default",
    "attribute_padding",
    "1",
    "0",
    "true",
    "false",
    "2",
    "web",
    "hash",
    "phash",
    "original_message_id",
    "reason",
    "unavailable_type",
    "view_once",
    "stanza_id",
    "verified_level",
    "low",
    "high",
    "none",
    "push_name",
    "profile",
    "blocklist",
    "block",
    "unblock",
    "privacy",
    "lid",
    "hosted",
    "account_sync",
    "w:m",
    "md-app-state",
    "md-msg-hist",
    "fbid",
    "tctoken",
    "expected_ts",
    "recipient",
    "edit",
    "store_hint",
    "appdata",
    "product",
    "business",
    "smb",
];

/// Secondary dictionaries reached through the DICTIONARY_* markers.
pub static DOUBLE_BYTE_TOKENS: &[&[&str]] = &[
    &[
        "media-gig2-1.cdn.whatsapp.net",
        "media-arn2-1.cdn.whatsapp.net",
        "image/jpeg",
        "image/png",
        "image/webp",
        "video/mp4",
        "audio/ogg; codecs=opus",
        "audio/mpeg",
        "application/pdf",
        "sticker",
        "image",
        "video",
        "audio",
        "document",
        "ptt",
        "gif",
        "url",
        "thumbnail-document",
        "thumbnail-image",
        "thumbnail-video",
        "thumbnail-link",
        "file_sha256",
        "file_enc_sha256",
        "media_key",
        "direct_path",
        "file_length",
        "width",
        "height",
        "seconds",
        "page_count",
        "mimetype",
        "caption",
        "ptv",
    ],
    &[
        "apple",
        "android",
        "smba",
        "smbi",
        "ios",
        "web_plat",
        "windows",
        "macos",
        "ohana",
        "wearos",
        "darwin",
        "payments",
        "invoice",
        "order",
        "catalog",
        "cart",
        "interactive",
        "template",
        "location",
        "live_location",
        "contact_array",
        "poll_creation",
        "poll_update",
        "reaction",
        "keep_in_chat",
        "pin_in_chat",
        "requested",
        "revoked_membership_requests",
        "membership_approval_request",
        "created_membership_requests",
        "linked_group_jid",
        "default_sub_group_jid",
        "parent_group_jid",
    ],
];

static SINGLE_BYTE_MAP: LazyLock<HashMap<&'static str, u8>> = LazyLock::new(|| {
    SINGLE_BYTE_TOKENS
        .iter()
        .enumerate()
        .skip(1)
        .filter(|(_, t)| !t.is_empty())
        .map(|(i, t)| (*t, i as u8))
        .collect()
});

static DOUBLE_BYTE_MAP: LazyLock<HashMap<&'static str, (u8, u8)>> = LazyLock::new(|| {
    let mut map = HashMap::new();
    for (dict, tokens) in DOUBLE_BYTE_TOKENS.iter().enumerate() {
        for (idx, token) in tokens.iter().enumerate() {
            map.insert(*token, (dict as u8, idx as u8));
        }
    }
    map
});

pub fn index_of_single_token(token: &str) -> Option<u8> {
    SINGLE_BYTE_MAP.get(token).copied()
}

pub fn index_of_double_byte_token(token: &str) -> Option<(u8, u8)> {
    DOUBLE_BYTE_MAP.get(token).copied()
}

pub fn get_single_token(index: u8) -> Option<&'static str> {
    match SINGLE_BYTE_TOKENS.get(index as usize).copied() {
        Some("") | None => None,
        some => some,
    }
}

pub fn get_double_token(dict: u8, index: u8) -> Option<&'static str> {
    DOUBLE_BYTE_TOKENS
        .get(dict as usize)
        .and_then(|d| d.get(index as usize))
        .copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_byte_tokens_round_trip() {
        for i in 1..SINGLE_BYTE_TOKENS.len() as u8 {
            if let Some(token) = get_single_token(i) {
                assert_eq!(index_of_single_token(token), Some(i), "token '{token}'");
            }
        }
    }

    #[test]
    fn double_byte_tokens_round_trip() {
        for dict in 0..DOUBLE_BYTE_TOKENS.len() as u8 {
            for idx in 0..=255u8 {
                if let Some(token) = get_double_token(dict, idx) {
                    assert_eq!(index_of_double_byte_token(token), Some((dict, idx)));
                }
            }
        }
    }

    #[test]
    fn dictionary_fits_below_structural_markers() {
        assert!(SINGLE_BYTE_TOKENS.len() <= DICTIONARY_0 as usize);
    }

    #[test]
    fn no_duplicate_single_byte_tokens() {
        assert_eq!(
            SINGLE_BYTE_MAP.len(),
            SINGLE_BYTE_TOKENS.iter().skip(1).filter(|t| !t.is_empty()).count()
        );
    }
}
