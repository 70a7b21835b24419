//! deepq - deep research job queue
//!
//! Accepts research requests, routes each to a healthy provider under cost
//! constraints, reserves budget before dispatch, and drives jobs through
//! submission, polling, retry and settlement.

// Note: deny (not forbid) so test helpers can opt out locally
#![deny(unsafe_code)]
#![warn(clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod cli;
pub mod core;
pub mod error;
pub mod providers;
pub mod render;
pub mod storage;
pub mod util;

/// Test utilities module - included in test builds or when test-utils feature is enabled.
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use crate::core::engine::Engine;
pub use error::{DeepqError, ExitCode, Result};
