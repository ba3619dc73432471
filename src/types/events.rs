use crate::binary::jid::Jid;
use crate::binary::node::Node;
use crate::proto;
use crate::types::message::{MessageInfo, ReceiptType};

/// Supervisor connection states, as surfaced through `connection.update`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Why the last connection ended; drives the reconnect decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Server ended the stream (`xmlstreamend` / `logged-out`); fatal.
    LoggedOut,
    /// Post-pairing restart; reconnect immediately with the same creds.
    RestartRequired,
    /// Session state the server no longer accepts; creds must be cleared.
    AuthFailure(u16),
    /// Another client took over the stream slot.
    StreamReplaced,
    /// Recoverable close; reconnect with backoff.
    Transient(u16),
    /// Application called close().
    Manual,
}

impl DisconnectReason {
    pub fn code(&self) -> u16 {
        match self {
            DisconnectReason::LoggedOut => 401,
            DisconnectReason::RestartRequired => 515,
            DisconnectReason::AuthFailure(code) => *code,
            DisconnectReason::StreamReplaced => 440,
            DisconnectReason::Transient(code) => *code,
            DisconnectReason::Manual => 0,
        }
    }

    pub fn should_reconnect(&self) -> bool {
        matches!(
            self,
            DisconnectReason::RestartRequired | DisconnectReason::Transient(_)
        )
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConnectionUpdate {
    pub connection: Option<ConnectionState>,
    pub last_disconnect: Option<DisconnectReason>,
    pub qr: Option<String>,
    pub received_pending_notifications: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct Qr {
    pub codes: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct PairSuccess {
    pub id: Jid,
    pub lid: Jid,
    pub business_name: String,
    pub platform: String,
}

#[derive(Debug, Clone)]
pub struct PairError {
    pub id: Jid,
    pub lid: Jid,
    pub error: String,
}

#[derive(Debug, Clone)]
pub struct LoggedOut {
    pub on_connect: bool,
    pub code: u16,
}

/// One decrypted inbound message plus its resolved metadata.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub info: MessageInfo,
    pub message: proto::Message,
}

/// Whether an upsert is live traffic or replayed offline backlog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertType {
    Notify,
    Append,
}

#[derive(Debug, Clone)]
pub struct MessagesUpsert {
    pub messages: Vec<IncomingMessage>,
    pub kind: UpsertType,
}

#[derive(Debug, Clone)]
pub struct ReceiptUpdate {
    pub chat: Jid,
    pub sender: Jid,
    pub message_ids: Vec<String>,
    pub receipt_type: ReceiptType,
    pub timestamp: i64,
}

#[derive(Debug, Clone)]
pub struct UndecryptableMessage {
    pub info: MessageInfo,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallEventKind {
    Offer,
    Accept,
    Reject,
    Timeout,
    Terminate,
    Relay,
}

#[derive(Debug, Clone)]
pub struct CallEvent {
    pub kind: CallEventKind,
    pub call_id: String,
    pub from: Jid,
    pub timestamp: i64,
    pub is_video: bool,
    pub is_group: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParticipantAction {
    Add,
    Remove,
    Promote,
    Demote,
}

#[derive(Debug, Clone)]
pub struct GroupParticipantsUpdate {
    pub jid: Jid,
    pub action: ParticipantAction,
    pub participants: Vec<Jid>,
}

#[derive(Debug, Clone)]
pub struct AuthClearRequired {
    pub code: u16,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct OfflineSyncPreview {
    pub total: i32,
    pub messages: i32,
    pub notifications: i32,
    pub receipts: i32,
}

#[derive(Debug, Clone)]
pub struct OfflineSyncCompleted {
    pub count: i32,
}

#[derive(Debug, Clone)]
pub struct TemporaryBan {
    pub code: i32,
    pub expire_secs: u64,
}

/// Everything the engine emits, in one sum type so subscribers can match
/// exhaustively.
#[derive(Debug, Clone)]
pub enum Event {
    ConnectionUpdate(ConnectionUpdate),
    CredsUpdate,
    Qr(Qr),
    PairSuccess(PairSuccess),
    PairError(PairError),
    LoggedOut(LoggedOut),
    StreamReplaced,
    TemporaryBan(TemporaryBan),
    AuthClearRequired(AuthClearRequired),

    MessagesUpsert(MessagesUpsert),
    UndecryptableMessage(UndecryptableMessage),
    MessageReceiptUpdate(ReceiptUpdate),
    Call(CallEvent),
    GroupParticipantsUpdate(GroupParticipantsUpdate),
    Notification(Node),

    OfflineSyncPreview(OfflineSyncPreview),
    OfflineSyncCompleted(OfflineSyncCompleted),
}
