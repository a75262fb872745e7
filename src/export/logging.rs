//! Logging exporter for debugging record flow.

use async_trait::async_trait;
use tracing::info;

use super::{Exporter, Result};
use crate::protocol::Record;

/// Exporter that logs every record.
pub struct LoggingExporter {
    id: String,
}

impl LoggingExporter {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

#[async_trait]
impl Exporter for LoggingExporter {
    fn id(&self) -> &str {
        &self.id
    }

    async fn export(&self, record: &Record) -> Result<()> {
        info!(
            exporter = %self.id,
            position = record.position,
            source_position = record.source_position,
            key = record.key,
            record_type = ?record.record_type(),
            value_type = ?record.value_type(),
            intent = ?record.intent(),
            "Record"
        );
        Ok(())
    }
}
