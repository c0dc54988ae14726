//! ABOUTME: Core error taxonomy, tracing setup, and time helpers
//! ABOUTME: Foundation crate used by all other enmon components

pub mod error;
pub mod telemetry;
pub mod time;

pub use error::{Error, Result};
pub use time::{now_rfc3339, to_rfc3339, MonotonicTimer};
