//! Record exporters.
//!
//! Exporters see records only after the stream processor has passed them:
//! the [`ExporterDirector`] subscribes behind the processor on a
//! [`DispatcherMode::Pipeline`](crate::dispatcher::DispatcherMode) log, so
//! an exported command has always been processed and its follow-ups are
//! already in the log.

mod collector;
mod director;
mod logging;

use async_trait::async_trait;

pub use collector::CollectorExporter;
pub use director::{ExporterDirector, ExporterDirectorBuilder, ExporterDirectorHandle};
pub use logging::LoggingExporter;

use crate::dispatcher::DispatcherError;
use crate::protocol::{Record, ValueType};

/// Result type for exporter operations.
pub type Result<T> = std::result::Result<T, ExportError>;

/// Errors from exporters and the director.
#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("Export failed: {0}")]
    Failed(String),

    #[error("Exporter '{id}' is already registered")]
    DuplicateExporter { id: String },

    #[error("Dispatcher error: {0}")]
    Dispatcher(#[from] DispatcherError),

    #[error("Exporter director task failed: {0}")]
    Task(String),
}

/// Consumes processed records.
///
/// `export` takes `&self`; exporters that keep state use interior
/// mutability. A failing `export` is retried with backoff and the record is
/// not skipped: the director holds its position until every exporter took
/// the record.
#[async_trait]
pub trait Exporter: Send + Sync {
    /// Unique id, used in logs and for exported positions.
    fn id(&self) -> &str;

    /// Value types this exporter wants. Empty means all.
    fn value_types(&self) -> Vec<ValueType> {
        Vec::new()
    }

    async fn open(&self) -> Result<()> {
        Ok(())
    }

    async fn export(&self, record: &Record) -> Result<()>;

    async fn close(&self) {}
}
