//! Collector exporter for testing.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{Exporter, Result};
use crate::protocol::{Record, ValueType};

/// Exporter that keeps every record it receives.
pub struct CollectorExporter {
    id: String,
    value_types: Vec<ValueType>,
    collected: Arc<RwLock<Vec<Record>>>,
}

impl CollectorExporter {
    pub fn new(id: impl Into<String>) -> Self {
        Self::for_value_types(id, Vec::new())
    }

    pub fn for_value_types(id: impl Into<String>, value_types: Vec<ValueType>) -> Self {
        Self {
            id: id.into(),
            value_types,
            collected: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Shared handle to the collected records, usable after the exporter
    /// moved into a director.
    pub fn collected(&self) -> Arc<RwLock<Vec<Record>>> {
        Arc::clone(&self.collected)
    }

    pub async fn count(&self) -> usize {
        self.collected.read().await.len()
    }

    /// Take all collected records, leaving the collector empty.
    pub async fn take(&self) -> Vec<Record> {
        std::mem::take(&mut *self.collected.write().await)
    }
}

#[async_trait]
impl Exporter for CollectorExporter {
    fn id(&self) -> &str {
        &self.id
    }

    fn value_types(&self) -> Vec<ValueType> {
        self.value_types.clone()
    }

    async fn export(&self, record: &Record) -> Result<()> {
        self.collected.write().await.push(record.clone());
        Ok(())
    }
}
