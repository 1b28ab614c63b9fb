//! Test helper modules for integration tests

pub mod fake_api;
pub mod harness;

pub use fake_api::*;
pub use harness::*;
