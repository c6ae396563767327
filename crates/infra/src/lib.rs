//! Infrastructure layer: event storage, applied-events log, listener
//! invocation and catch-up scheduling.

pub mod applied_events;
pub mod config;
pub mod event_store;
pub mod jobs;
pub mod listeners;
pub mod projections;

pub use config::{ChronicleConfig, ConfigError, TableName};
