//! `chronicle-core`: value types shared by the event store crates.
//!
//! This crate contains **pure** primitives (no infrastructure concerns).

pub mod error;
pub mod id;
pub mod stream;
pub mod version;

pub use error::{DomainError, DomainResult};
pub use id::{EventId, JobId};
pub use stream::StreamName;
pub use version::ExpectedVersion;
