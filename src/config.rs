use crate::binary::jid::Jid;
use crate::proto;
use std::sync::Arc;
use std::time::Duration;

pub type GetMessageFn =
    Arc<dyn Fn(&proto::MessageKey) -> Option<proto::Message> + Send + Sync>;
pub type ShouldIgnoreJidFn = Arc<dyn Fn(&Jid) -> bool + Send + Sync>;
pub type CachedGroupMetadataFn = Arc<dyn Fn(&Jid) -> Option<GroupMetadata> + Send + Sync>;
pub type OnUnexpectedErrorFn = Arc<dyn Fn(String, &'static str) + Send + Sync>;

/// Group metadata as the sender pipeline needs it; the full server document
/// is the application's concern.
#[derive(Debug, Clone)]
pub struct GroupMetadata {
    pub jid: Jid,
    pub participants: Vec<Jid>,
    pub addressing_mode: AddressingMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressingMode {
    Pn,
    Lid,
}

/// Connection and pipeline options. Every field has the protocol default;
/// applications override what they need.
#[derive(Clone)]
pub struct SocketConfig {
    /// Protocol version tuple sent in the client payload.
    pub version: (u32, u32, u32),
    /// `[platform, browser, version]` device properties.
    pub browser: (String, String, String),
    /// QR pairing when true, pairing-code mode otherwise.
    pub print_qr_in_terminal: bool,
    pub connect_timeout: Duration,
    pub keep_alive_interval: Duration,
    pub default_query_timeout: Duration,
    /// Base delay before a decrypt retry attempt.
    pub retry_request_delay: Duration,
    pub max_msg_retry_count: u8,
    pub max_reconnect_attempts: u32,
    pub mark_online_on_connect: bool,
    pub sync_full_history: bool,
    pub flood_threshold: usize,
    pub flood_window: Duration,
    /// Emit `auth.clear_required` for classified auth errors.
    pub clear_auth_on_error: bool,
    /// Lifetimes of the bounded pipeline caches.
    pub msg_retry_cache_ttl: Duration,
    pub call_offer_cache_ttl: Duration,
    pub placeholder_resend_cache_ttl: Duration,

    pub get_message: Option<GetMessageFn>,
    pub should_ignore_jid: Option<ShouldIgnoreJidFn>,
    pub cached_group_metadata: Option<CachedGroupMetadataFn>,
    pub on_unexpected_error: Option<OnUnexpectedErrorFn>,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            version: (2, 3000, 1015901307),
            browser: (
                "Mac OS".to_string(),
                "Chrome".to_string(),
                "131.0.6778.86".to_string(),
            ),
            print_qr_in_terminal: true,
            connect_timeout: Duration::from_secs(20),
            keep_alive_interval: Duration::from_secs(25),
            default_query_timeout: Duration::from_secs(60),
            retry_request_delay: Duration::from_millis(250),
            max_msg_retry_count: 5,
            max_reconnect_attempts: 5,
            mark_online_on_connect: true,
            sync_full_history: false,
            flood_threshold: 50,
            flood_window: Duration::from_secs(10),
            clear_auth_on_error: true,
            msg_retry_cache_ttl: Duration::from_secs(900),
            call_offer_cache_ttl: Duration::from_secs(300),
            placeholder_resend_cache_ttl: Duration::from_secs(600),
            get_message: None,
            should_ignore_jid: None,
            cached_group_metadata: None,
            on_unexpected_error: None,
        }
    }
}

impl std::fmt::Debug for SocketConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketConfig")
            .field("version", &self.version)
            .field("browser", &self.browser)
            .field("print_qr_in_terminal", &self.print_qr_in_terminal)
            .field("connect_timeout", &self.connect_timeout)
            .field("keep_alive_interval", &self.keep_alive_interval)
            .field("default_query_timeout", &self.default_query_timeout)
            .field("max_msg_retry_count", &self.max_msg_retry_count)
            .field("max_reconnect_attempts", &self.max_reconnect_attempts)
            .finish_non_exhaustive()
    }
}
