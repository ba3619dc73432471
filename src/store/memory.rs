use crate::store::error::Result;
use crate::store::traits::{KeyStoreBackend, RowWrite, StoreKind};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// In-memory backend. The reference implementation of the store contract;
/// applications bridge the same trait to files or a database.
#[derive(Default)]
pub struct MemoryStore {
    rows: RwLock<HashMap<(StoreKind, String), Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyStoreBackend for MemoryStore {
    async fn get(&self, kind: StoreKind, ids: &[String]) -> Result<HashMap<String, Vec<u8>>> {
        let rows = self.rows.read().await;
        Ok(ids
            .iter()
            .filter_map(|id| {
                rows.get(&(kind, id.clone()))
                    .map(|v| (id.clone(), v.clone()))
            })
            .collect())
    }

    async fn set(&self, writes: Vec<RowWrite>) -> Result<()> {
        let mut rows = self.rows.write().await;
        for (kind, id, value) in writes {
            match value {
                Some(bytes) => {
                    rows.insert((kind, id), bytes);
                }
                None => {
                    rows.remove(&(kind, id));
                }
            }
        }
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.rows.write().await.clear();
        Ok(())
    }
}
