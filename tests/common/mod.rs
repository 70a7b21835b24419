//! Shared helpers for integration tests.
//!
//! # Modules
//!
//! - `fixtures`: provider wire bodies and engine setup shortcuts
//! - `logger`: per-test structured logging
//! - `log_capture`: assertions over emitted tracing events

pub mod fixtures;
pub mod log_capture;
pub mod logger;
