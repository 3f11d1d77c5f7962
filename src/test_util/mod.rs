//! Utilities for testing code that uses sessions. They are used for testing the session layer
//!  itself, but they are also exported for application testing, typically together with
//!  [crate::transport::in_memory::InMemoryNetwork].

pub mod event;
pub mod peer;
