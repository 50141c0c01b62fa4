//! Test utilities for integration testing.
//!
//! Available when compiling tests or with the `testing` feature enabled.

pub mod mock_node;

pub use mock_node::{responses, MockNode, NodeCall, ResponseGenerator};
