//! Stockflow Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Functionality shared by every stockflow workspace member. Today that is
//! the tracing setup used by the sync worker, the CLI and the test harnesses.

pub mod logging;

pub use logging::{init_logging, LogConfig, LoggingGuard};
