//! Test utilities and helpers for covalue
//!
//! Node and peer fixtures plus timeout helpers shared by unit and
//! integration tests.

pub mod async_helpers;
pub mod fixtures;

pub use async_helpers::*;
pub use fixtures::*;
