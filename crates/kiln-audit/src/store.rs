//! Local audit sink backed by the redb audit store.

use async_trait::async_trait;
use kiln_core::AuditRecord;
use kiln_state::AuditStore;

use crate::auditor::AuditSink;
use crate::error::AuditError;

/// Persists records into a local [`AuditStore`].
#[derive(Clone)]
pub struct StoreSink {
    store: AuditStore,
}

impl StoreSink {
    pub fn new(store: AuditStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &AuditStore {
        &self.store
    }
}

#[async_trait]
impl AuditSink for StoreSink {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn record(&self, record: &AuditRecord) -> Result<(), AuditError> {
        let store = self.store.clone();
        let record = record.clone();
        // redb commits fsync; keep them off the async workers.
        tokio::task::spawn_blocking(move || store.append(&record))
            .await
            .map_err(|e| AuditError::Request(format!("audit store task failed: {e}")))??;
        Ok(())
    }

    async fn ping(&self) -> Result<(), AuditError> {
        self.store.count()?;
        Ok(())
    }
}
