//! The stream processor task.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{
    CommandResponse, CommandResponseWriter, EventAppliers, LogStreamWriter, NoopResponseWriter,
    ProcessingConfig, ProcessingContext, ProcessingError, RecordProcessors, Result,
};
use crate::dispatcher::{Dispatcher, Fragment, PollAction, Subscription};
use crate::state::migration::DbMigrator;
use crate::protocol::{decode_batch, Record, RejectionType, NO_KEY};
use crate::state::{recover_snapshot, write_snapshot, Db, KeyGenerator, LastProcessedPosition};

/// Lifecycle phase of a stream processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Replay,
    Processing,
    Paused,
    Closed,
}

#[derive(Default)]
struct Control {
    paused: AtomicBool,
    shutdown: AtomicBool,
    wake: Notify,
}

// ============================================================================
// Builder
// ============================================================================

/// Assembles a [`StreamProcessor`].
pub struct StreamProcessorBuilder {
    dispatcher: Arc<Dispatcher>,
    name: String,
    config: ProcessingConfig,
    processors: RecordProcessors,
    appliers: EventAppliers,
    migrator: DbMigrator,
    db: Option<Db>,
    response_writer: Arc<dyn CommandResponseWriter>,
}

impl StreamProcessorBuilder {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn config(mut self, config: ProcessingConfig) -> Self {
        self.config = config;
        self
    }

    pub fn processors(mut self, processors: RecordProcessors) -> Self {
        self.processors = processors;
        self
    }

    pub fn appliers(mut self, appliers: EventAppliers) -> Self {
        self.appliers = appliers;
        self
    }

    pub fn migrator(mut self, migrator: DbMigrator) -> Self {
        self.migrator = migrator;
        self
    }

    /// Start from existing state instead of the configured snapshot.
    pub fn db(mut self, db: Db) -> Self {
        self.db = Some(db);
        self
    }

    pub fn response_writer(mut self, writer: Arc<dyn CommandResponseWriter>) -> Self {
        self.response_writer = writer;
        self
    }

    /// Recover state and resolve everything the processor needs.
    pub fn build(self) -> Result<StreamProcessor> {
        let db = match self.db {
            Some(db) => db,
            None => match &self.config.snapshot_path {
                Some(path) if path.exists() => recover_snapshot(path)?,
                _ => Db::new(),
            },
        };

        let writer = LogStreamWriter::new(Arc::clone(&self.dispatcher), self.config.stream_id);
        Ok(StreamProcessor {
            key_generator: KeyGenerator::new(self.config.partition_id),
            dispatcher: self.dispatcher,
            name: self.name,
            config: self.config,
            processors: self.processors,
            appliers: self.appliers,
            migrator: self.migrator,
            db,
            writer,
            response_writer: self.response_writer,
        })
    }
}

// ============================================================================
// Processor
// ============================================================================

/// Single-threaded consumer that turns commands into follow-up records and
/// state changes.
pub struct StreamProcessor {
    dispatcher: Arc<Dispatcher>,
    name: String,
    config: ProcessingConfig,
    processors: RecordProcessors,
    appliers: EventAppliers,
    migrator: DbMigrator,
    key_generator: KeyGenerator,
    db: Db,
    writer: LogStreamWriter,
    response_writer: Arc<dyn CommandResponseWriter>,
}

impl StreamProcessor {
    pub fn builder(dispatcher: Arc<Dispatcher>) -> StreamProcessorBuilder {
        StreamProcessorBuilder {
            dispatcher,
            name: "stream-processor".to_string(),
            config: ProcessingConfig::default(),
            processors: RecordProcessors::new(),
            appliers: EventAppliers::new(),
            migrator: DbMigrator::new(Vec::new()),
            db: None,
            response_writer: Arc::new(NoopResponseWriter),
        }
    }

    /// State as recovered or handed in, before any processing.
    pub fn db(&self) -> &Db {
        &self.db
    }

    /// Subscribe to the log and spawn the processing task.
    ///
    /// The subscription is opened before this returns, so subscribers
    /// opened afterwards come after the processor in pipeline order.
    pub fn start(self) -> StreamProcessorHandle {
        let subscription = self.dispatcher.open_subscription(self.name.clone());
        let control = Arc::new(Control::default());
        let (position_tx, position_rx) = watch::channel(subscription.position());
        let (phase_tx, phase_rx) = watch::channel(Phase::Replay);
        let dispatcher = Arc::clone(&self.dispatcher);
        let abort = self.migrator.abort_handle();

        info!(processor = %self.name, partition_id = self.config.partition_id, "Starting stream processor");

        let task = tokio::spawn(self.run(subscription, Arc::clone(&control), position_tx, phase_tx));

        StreamProcessorHandle {
            dispatcher,
            control,
            abort_migrations: abort,
            position: position_rx,
            phase: phase_rx,
            task,
        }
    }

    async fn run(
        mut self,
        mut subscription: Subscription,
        control: Arc<Control>,
        position: watch::Sender<i64>,
        phase: watch::Sender<Phase>,
    ) -> Result<Db> {
        let result = self
            .run_phases(&mut subscription, &control, &position, &phase)
            .await;

        if let Err(e) = self.dispatcher.close_subscription(subscription).await {
            warn!(processor = %self.name, error = %e, "Failed to close subscription");
        }
        phase.send_replace(Phase::Closed);

        if let Err(e) = result {
            error!(processor = %self.name, error = %e, "Stream processor failed");
            return Err(e);
        }

        if let Some(path) = &self.config.snapshot_path {
            write_snapshot(&self.db, path)?;
        }
        info!(processor = %self.name, "Stream processor closed");
        Ok(self.db)
    }

    async fn run_phases(
        &mut self,
        subscription: &mut Subscription,
        control: &Control,
        position: &watch::Sender<i64>,
        phase: &watch::Sender<Phase>,
    ) -> Result<()> {
        let migrated = self.migrator.run_migrations(&mut self.db)?;
        if migrated > 0 {
            info!(processor = %self.name, migrated, "State migrations applied");
        }

        let pending = self.replay(subscription).await?;
        position.send_replace(subscription.position());
        phase.send_replace(Phase::Processing);

        for command in pending {
            if control.shutdown.load(Ordering::Acquire) {
                return Ok(());
            }
            self.process_command(command).await?;
        }

        let idle = Duration::from_millis(self.config.idle_backoff_ms);
        loop {
            if control.shutdown.load(Ordering::Acquire) {
                return Ok(());
            }

            if control.paused.load(Ordering::Acquire) {
                let resumed = control.wake.notified();
                phase.send_replace(Phase::Paused);
                if control.paused.load(Ordering::Acquire)
                    && !control.shutdown.load(Ordering::Acquire)
                {
                    resumed.await;
                }
                continue;
            }
            if *phase.borrow() == Phase::Paused {
                phase.send_replace(Phase::Processing);
            }

            match poll_frames(subscription, 1).pop() {
                Some((frame_position, payload)) => {
                    match decode_batch(frame_position, &payload) {
                        Ok(records) => {
                            for record in records.into_iter().filter(Record::is_command) {
                                self.process_command(record).await?;
                            }
                        }
                        Err(e) => {
                            error!(processor = %self.name, error = %e, "Skipping undecodable frame");
                        }
                    }
                    position.send_replace(subscription.position());
                }
                None => {
                    position.send_replace(subscription.position());
                    tokio::select! {
                        _ = tokio::time::sleep(idle) => {}
                        _ = control.wake.notified() => {}
                    }
                }
            }
        }
    }

    /// Rebuild state from the events after the last processed position.
    ///
    /// Returns commands that were read but never processed, in log order.
    async fn replay(&mut self, subscription: &mut Subscription) -> Result<Vec<Record>> {
        let last_processed = LastProcessedPosition::get(&self.db.transaction())?.unwrap_or(NO_KEY);
        let mut last_source = last_processed;
        let mut pending: Vec<Record> = Vec::new();
        let mut applied = 0usize;

        loop {
            let frames = poll_frames(subscription, self.config.max_frames_per_poll);
            if frames.is_empty() {
                break;
            }

            for (frame_position, payload) in frames {
                let records = match decode_batch(frame_position, &payload) {
                    Ok(records) => records,
                    Err(e) => {
                        error!(processor = %self.name, error = %e, "Skipping undecodable frame");
                        continue;
                    }
                };

                let mut tx = self.db.transaction();
                for record in records {
                    self.key_generator.observe(&mut tx, record.key)?;

                    if record.is_command() {
                        if record.position > last_source {
                            pending.push(record);
                        }
                        continue;
                    }

                    if record.source_position > last_source {
                        last_source = record.source_position;
                        pending.retain(|command| command.position > last_source);
                    }
                    if record.is_event() && record.source_position > last_processed {
                        self.appliers
                            .apply(&mut tx, record.key, record.intent(), &record.value)?;
                        applied += 1;
                    }
                }
                tx.commit();
            }
            tokio::task::yield_now().await;
        }

        if last_source > last_processed {
            let mut tx = self.db.transaction();
            LastProcessedPosition::set(&mut tx, last_source)?;
            tx.commit();
        }

        info!(
            processor = %self.name,
            applied,
            last_processed_position = last_source,
            unprocessed = pending.len(),
            "Replay complete"
        );
        Ok(pending)
    }

    async fn process_command(&mut self, command: Record) -> Result<()> {
        let Some(processor) = self.processors.get(&command).cloned() else {
            debug!(
                processor = %self.name,
                value_type = ?command.value_type(),
                intent = ?command.intent(),
                "No processor registered, skipping command"
            );
            let mut tx = self.db.transaction();
            LastProcessedPosition::set(&mut tx, command.position)?;
            tx.commit();
            return Ok(());
        };

        let failure = {
            let mut ctx =
                ProcessingContext::new(self.db.transaction(), &self.appliers, self.key_generator);

            match processor.process_record(&command, &mut ctx) {
                Ok(()) => {
                    let (mut tx, mut follow_ups, response) = ctx.into_parts();
                    for record in &mut follow_ups {
                        record.source_position = command.position;
                    }
                    // nothing reaches the log unless the position is staged
                    LastProcessedPosition::set(&mut tx, command.position)?;

                    let written = if follow_ups.is_empty() {
                        Ok(NO_KEY)
                    } else {
                        self.writer.write(&follow_ups).await
                    };

                    match written {
                        Ok(_) => {
                            tx.commit();
                            if let Some(response) = response {
                                send_response(self.response_writer.as_ref(), &command, response)
                                    .await;
                            }
                            None
                        }
                        Err(ProcessingError::BatchTooLarge {
                            size,
                            max_frame_length,
                        }) => {
                            tx.rollback();
                            Some((
                                RejectionType::ExceededBatchRecordSize,
                                format!(
                                    "Expected to process command, but the resulting batch of {size} bytes exceeds the maximum of {max_frame_length} bytes"
                                ),
                            ))
                        }
                        Err(e) => return Err(e),
                    }
                }
                Err(e) => {
                    drop(ctx);
                    error!(
                        processor = %self.name,
                        position = command.position,
                        value_type = ?command.value_type(),
                        intent = ?command.intent(),
                        error = %e,
                        "Command processing failed, rolled back"
                    );
                    Some((RejectionType::ProcessingError, e.to_string()))
                }
            }
        };

        if let Some((rejection_type, reason)) = failure {
            self.reject_failed(&command, rejection_type, &reason).await?;
        }
        Ok(())
    }

    /// Reject a command whose processing was rolled back, in a fresh
    /// transaction.
    async fn reject_failed(
        &mut self,
        command: &Record,
        rejection_type: RejectionType,
        reason: &str,
    ) -> Result<()> {
        let mut rejection = Record::rejection(command, rejection_type, reason);
        rejection.source_position = command.position;

        let mut tx = self.db.transaction();
        LastProcessedPosition::set(&mut tx, command.position)?;
        self.writer.write(std::slice::from_ref(&rejection)).await?;
        tx.commit();

        send_response(self.response_writer.as_ref(), command, rejection).await;
        Ok(())
    }
}

async fn send_response(writer: &dyn CommandResponseWriter, command: &Record, mut record: Record) {
    let Some(request_id) = command.metadata.request_id else {
        return;
    };
    let request_stream_id = command.metadata.request_stream_id.unwrap_or_default();
    record.source_position = command.position;
    record.metadata.request_id = Some(request_id);
    record.metadata.request_stream_id = Some(request_stream_id);

    writer
        .send_response(CommandResponse {
            request_id,
            request_stream_id,
            record,
        })
        .await;
}

/// Copy up to `max` committed frames out of the log.
fn poll_frames(subscription: &mut Subscription, max: usize) -> Vec<(i64, Vec<u8>)> {
    let mut frames = Vec::new();
    subscription.poll(
        &mut |fragment: &Fragment<'_>| {
            frames.push((fragment.position, fragment.payload.to_vec()));
            PollAction::Consume
        },
        max,
    );
    frames
}

// ============================================================================
// Handle
// ============================================================================

/// Control surface of a running stream processor.
pub struct StreamProcessorHandle {
    dispatcher: Arc<Dispatcher>,
    control: Arc<Control>,
    abort_migrations: Arc<AtomicBool>,
    position: watch::Receiver<i64>,
    phase: watch::Receiver<Phase>,
    task: JoinHandle<Result<Db>>,
}

impl StreamProcessorHandle {
    /// Stop after the record in flight. Reading resumes with [`Self::resume`].
    pub fn pause(&self) {
        self.control.paused.store(true, Ordering::Release);
        self.control.wake.notify_one();
    }

    pub fn resume(&self) {
        self.control.paused.store(false, Ordering::Release);
        self.control.wake.notify_one();
    }

    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    pub async fn wait_for_phase(&self, phase: Phase, timeout: Duration) -> bool {
        let mut rx = self.phase.clone();
        let ready = matches!(
            tokio::time::timeout(timeout, rx.wait_for(|p| *p == phase)).await,
            Ok(Ok(_))
        );
        ready
    }

    /// Read position of the processor: everything before it is processed.
    pub fn position(&self) -> i64 {
        *self.position.borrow()
    }

    /// Wait until the processor has read past `position`.
    pub async fn wait_for_position(&self, position: i64, timeout: Duration) -> bool {
        let mut rx = self.position.clone();
        let ready = matches!(
            tokio::time::timeout(timeout, rx.wait_for(|p| *p >= position)).await,
            Ok(Ok(_))
        );
        ready
    }

    /// Wait until the processor has caught up with everything published,
    /// including the follow-ups its own processing wrote.
    pub async fn settle(&self, timeout: Duration) -> bool {
        let settled = async {
            loop {
                let target = self.dispatcher.publisher_position();
                let mut rx = self.position.clone();
                if rx.wait_for(|p| *p >= target).await.is_err() {
                    return false;
                }
                if self.dispatcher.publisher_position() == target {
                    return true;
                }
            }
        };
        tokio::time::timeout(timeout, settled).await.unwrap_or(false)
    }

    /// Stop processing, close the subscription and hand back the state.
    pub async fn close(self) -> Result<Db> {
        self.abort_migrations.store(true, Ordering::Release);
        self.control.shutdown.store(true, Ordering::Release);
        self.control.wake.notify_one();

        self.task
            .await
            .map_err(|e| ProcessingError::Task(e.to_string()))?
    }
}
