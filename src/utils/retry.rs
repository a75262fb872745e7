//! Backoff builders.
//!
//! Uses `backon` for exponential backoff with jitter.

use std::time::Duration;

use backon::ExponentialBuilder;

/// Backoff for log appends refused by the publisher limit.
///
/// - Min delay: 1ms
/// - Max delay: 50ms
/// - Max attempts: 200
/// - Jitter enabled
pub fn backpressure_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(1))
        .with_max_delay(Duration::from_millis(50))
        .with_max_times(200)
        .with_jitter()
}

/// Backoff for outbound connection attempts.
///
/// - Min delay: 50ms
/// - Max delay: 2s
/// - Max attempts: 5
/// - Jitter enabled
pub fn connection_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(50))
        .with_max_delay(Duration::from_secs(2))
        .with_max_times(5)
        .with_jitter()
}

/// Backoff for an exporter that failed to take a record.
///
/// - Min delay: 10ms
/// - Max delay: 1s
/// - Max attempts: 10
/// - Jitter enabled
pub fn export_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(10))
        .with_max_delay(Duration::from_secs(1))
        .with_max_times(10)
        .with_jitter()
}
