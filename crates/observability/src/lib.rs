//! Tracing and logging setup shared by chronicle processes and tests.

/// Initialize process-wide observability (tracing/logging).
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init();
}

/// Initialize logging for tests: output goes through the test harness
/// writer, so it is only shown for failing tests.
pub fn init_for_tests() {
    tracing::init_for_tests();
}

/// Tracing configuration (filters, formats).
pub mod tracing;

pub use self::tracing::{LOG_FORMAT_ENV, LogFormat, ParseLogFormatError};
