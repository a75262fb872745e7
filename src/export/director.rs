//! Drives exporters from a log subscription.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use backon::Retryable;
use dashmap::DashMap;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{ExportError, Exporter, Result};
use crate::dispatcher::{Dispatcher, Fragment, PollAction, Subscription};
use crate::protocol::{decode_batch, Record, ValueType, NO_KEY};
use crate::stream::ProcessingConfig;
use crate::utils::retry::export_backoff;

#[derive(Default)]
struct Control {
    shutdown: AtomicBool,
    wake: Notify,
}

impl Control {
    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}

struct Container {
    exporter: Arc<dyn Exporter>,
    value_types: Vec<ValueType>,
    /// Last record position this exporter took.
    position: i64,
}

impl Container {
    fn wants(&self, record: &Record) -> bool {
        record.position > self.position
            && (self.value_types.is_empty() || self.value_types.contains(&record.value_type()))
    }
}

/// Assembles an [`ExporterDirector`].
pub struct ExporterDirectorBuilder {
    dispatcher: Arc<Dispatcher>,
    name: String,
    exporters: Vec<Arc<dyn Exporter>>,
    idle_backoff: Duration,
}

impl ExporterDirectorBuilder {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn exporter(mut self, exporter: impl Exporter + 'static) -> Self {
        self.exporters.push(Arc::new(exporter));
        self
    }

    pub fn config(mut self, config: &ProcessingConfig) -> Self {
        self.idle_backoff = Duration::from_millis(config.idle_backoff_ms);
        self
    }

    pub fn build(self) -> Result<ExporterDirector> {
        let mut ids = HashSet::new();
        for exporter in &self.exporters {
            if !ids.insert(exporter.id().to_string()) {
                return Err(ExportError::DuplicateExporter {
                    id: exporter.id().to_string(),
                });
            }
        }
        Ok(ExporterDirector {
            dispatcher: self.dispatcher,
            name: self.name,
            exporters: self.exporters,
            idle_backoff: self.idle_backoff,
        })
    }
}

/// Feeds every record past the stream processor to the exporters, in log
/// order.
pub struct ExporterDirector {
    dispatcher: Arc<Dispatcher>,
    name: String,
    exporters: Vec<Arc<dyn Exporter>>,
    idle_backoff: Duration,
}

impl ExporterDirector {
    pub fn builder(dispatcher: Arc<Dispatcher>) -> ExporterDirectorBuilder {
        ExporterDirectorBuilder {
            dispatcher,
            name: "exporter".to_string(),
            exporters: Vec::new(),
            idle_backoff: Duration::from_millis(ProcessingConfig::default().idle_backoff_ms),
        }
    }

    /// Subscribe and spawn the export task.
    ///
    /// Start this after the stream processor so the subscription lands
    /// behind it in pipeline order.
    pub fn start(self) -> ExporterDirectorHandle {
        let subscription = self.dispatcher.open_subscription(self.name.clone());
        let control = Arc::new(Control::default());
        let (position_tx, position_rx) = watch::channel(subscription.position());
        let exported = Arc::new(DashMap::new());

        info!(director = %self.name, exporters = self.exporters.len(), "Starting exporter director");

        let task = tokio::spawn(self.run(
            subscription,
            Arc::clone(&control),
            position_tx,
            Arc::clone(&exported),
        ));
        ExporterDirectorHandle {
            control,
            position: position_rx,
            exported,
            task,
        }
    }

    async fn run(
        self,
        mut subscription: Subscription,
        control: Arc<Control>,
        position: watch::Sender<i64>,
        exported: Arc<DashMap<String, i64>>,
    ) -> Result<()> {
        let mut containers = Vec::with_capacity(self.exporters.len());
        for exporter in &self.exporters {
            exporter.open().await?;
            debug!(director = %self.name, exporter = %exporter.id(), "Exporter opened");
            containers.push(Container {
                value_types: exporter.value_types(),
                exporter: Arc::clone(exporter),
                position: NO_KEY,
            });
        }

        let result = self
            .export_loop(&mut subscription, &control, &position, &mut containers, &exported)
            .await;

        for container in &containers {
            container.exporter.close().await;
        }
        if let Err(e) = self.dispatcher.close_subscription(subscription).await {
            warn!(director = %self.name, error = %e, "Failed to close subscription");
        }
        info!(director = %self.name, "Exporter director closed");
        result
    }

    async fn export_loop(
        &self,
        subscription: &mut Subscription,
        control: &Control,
        position: &watch::Sender<i64>,
        containers: &mut [Container],
        exported: &DashMap<String, i64>,
    ) -> Result<()> {
        while !control.is_shutdown() {
            let Some((frame_position, payload)) = peek_frame(subscription) else {
                position.send_replace(subscription.position());
                tokio::select! {
                    _ = tokio::time::sleep(self.idle_backoff) => {}
                    _ = control.wake.notified() => {}
                }
                continue;
            };

            match decode_batch(frame_position, &payload) {
                Ok(records) => {
                    for record in &records {
                        for container in containers.iter_mut().filter(|c| c.wants(record)) {
                            if !self.export(container, record, control).await {
                                // Shut down mid-record; the frame stays unread.
                                return Ok(());
                            }
                            exported.insert(container.exporter.id().to_string(), record.position);
                        }
                    }
                }
                Err(e) => {
                    error!(director = %self.name, error = %e, "Skipping undecodable frame");
                }
            }

            consume_frame(subscription);
            position.send_replace(subscription.position());
        }
        Ok(())
    }

    /// Export one record, retrying until it is taken. `false` if the director
    /// was shut down first.
    async fn export(&self, container: &mut Container, record: &Record, control: &Control) -> bool {
        let exporter = Arc::clone(&container.exporter);
        loop {
            let result = (|| exporter.export(record))
                .retry(export_backoff())
                .when(|_| !control.is_shutdown())
                .notify(|e: &ExportError, delay: Duration| {
                    warn!(
                        director = %self.name,
                        exporter = %exporter.id(),
                        position = record.position,
                        error = %e,
                        ?delay,
                        "Export failed, retrying"
                    );
                })
                .await;

            match result {
                Ok(()) => {
                    container.position = record.position;
                    return true;
                }
                Err(e) => {
                    if control.is_shutdown() {
                        return false;
                    }
                    error!(
                        director = %self.name,
                        exporter = %exporter.id(),
                        position = record.position,
                        error = %e,
                        "Exporter keeps failing, holding position"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(self.idle_backoff) => {}
                        _ = control.wake.notified() => {}
                    }
                }
            }
        }
    }
}

/// Copy the next committed frame without moving past it.
fn peek_frame(subscription: &mut Subscription) -> Option<(i64, Vec<u8>)> {
    let mut frame = None;
    subscription.poll(
        &mut |fragment: &Fragment<'_>| {
            frame = Some((fragment.position, fragment.payload.to_vec()));
            PollAction::Postpone
        },
        1,
    );
    frame
}

fn consume_frame(subscription: &mut Subscription) {
    subscription.poll(&mut |_: &Fragment<'_>| PollAction::Consume, 1);
}

// ============================================================================
// Handle
// ============================================================================

/// Control surface of a running exporter director.
pub struct ExporterDirectorHandle {
    control: Arc<Control>,
    position: watch::Receiver<i64>,
    exported: Arc<DashMap<String, i64>>,
    task: JoinHandle<Result<()>>,
}

impl ExporterDirectorHandle {
    /// Everything before this position has been exported.
    pub fn position(&self) -> i64 {
        *self.position.borrow()
    }

    pub async fn wait_for_position(&self, position: i64, timeout: Duration) -> bool {
        let mut rx = self.position.clone();
        let ready = matches!(
            tokio::time::timeout(timeout, rx.wait_for(|p| *p >= position)).await,
            Ok(Ok(_))
        );
        ready
    }

    /// Position of the last record `exporter_id` took.
    pub fn exported_position(&self, exporter_id: &str) -> Option<i64> {
        self.exported.get(exporter_id).map(|position| *position)
    }

    /// Stop exporting and close the subscription. In pipeline mode close the
    /// director before the stream processor in front of it.
    pub async fn close(self) -> Result<()> {
        self.control.shutdown.store(true, Ordering::Release);
        self.control.wake.notify_one();
        self.task
            .await
            .map_err(|e| ExportError::Task(e.to_string()))?
    }
}
