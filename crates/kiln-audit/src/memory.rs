//! In-process audit sink.

use std::sync::Mutex;

use async_trait::async_trait;
use kiln_core::AuditRecord;

use crate::auditor::AuditSink;
use crate::error::AuditError;

/// Collects records in memory. Used by tests and the simulated backend.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all records, oldest first.
    pub fn records(&self) -> Vec<AuditRecord> {
        self.records
            .lock()
            .map(|records| records.clone())
            .unwrap_or_default()
    }

    /// Records for one user, oldest first.
    pub fn records_for(&self, user: &str) -> Vec<AuditRecord> {
        self.records()
            .into_iter()
            .filter(|r| r.user == user)
            .collect()
    }
}

#[async_trait]
impl AuditSink for MemorySink {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn record(&self, record: &AuditRecord) -> Result<(), AuditError> {
        if let Ok(mut records) = self.records.lock() {
            records.push(record.clone());
        }
        Ok(())
    }
}
