//! Data models for the task queue

mod envelope;

pub use envelope::*;
