//! Integration tests for keel.

#[path = "integration/dispatcher_test.rs"]
mod dispatcher_test;

#[path = "integration/stream_processing_test.rs"]
mod stream_processing_test;

#[path = "integration/modification_test.rs"]
mod modification_test;

#[path = "integration/messaging_test.rs"]
mod messaging_test;
