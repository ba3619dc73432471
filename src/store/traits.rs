use crate::store::error::Result;
use async_trait::async_trait;
use std::collections::HashMap;

/// The row families the engine persists. Each row is addressed by
/// `(kind, id)` and holds opaque bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreKind {
    PreKey,
    Session,
    Identity,
    SenderKey,
    SenderKeyMemory,
    AppStateSyncKey,
    AppStateSyncVersion,
}

impl StoreKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreKind::PreKey => "pre-key",
            StoreKind::Session => "session",
            StoreKind::Identity => "identity",
            StoreKind::SenderKey => "sender-key",
            StoreKind::SenderKeyMemory => "sender-key-memory",
            StoreKind::AppStateSyncKey => "app-state-sync-key",
            StoreKind::AppStateSyncVersion => "app-state-sync-version",
        }
    }
}

/// A pending row write; `None` deletes the row.
pub type RowWrite = (StoreKind, String, Option<Vec<u8>>);

/// The application-provided persistence surface. `set` must apply the whole
/// batch atomically: several protocol operations advance multiple rows
/// together and a torn write desynchronizes us from the server.
#[async_trait]
pub trait KeyStoreBackend: Send + Sync {
    async fn get(&self, kind: StoreKind, ids: &[String]) -> Result<HashMap<String, Vec<u8>>>;
    async fn set(&self, rows: Vec<RowWrite>) -> Result<()>;
    async fn clear(&self) -> Result<()>;
}
