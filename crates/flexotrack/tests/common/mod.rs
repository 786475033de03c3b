//! Shared test utilities for flexotrack integration tests.
//!
//! This module provides:
//! - `TestHarness` wiring an engine and snapshot service over temp storage
//! - `ProgramBuilder` for creating programs without boilerplate

pub mod builders;
pub mod harness;

pub use builders::*;
pub use harness::TestHarness;
