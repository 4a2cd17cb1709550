//! Integration tests for the engine.
//!
//! These run a real engine over a scratch directory: producers and readers
//! on separate threads, the flush thread committing batches, and the
//! directory being closed, damaged and reopened between steps.

#[path = "../common/mod.rs"]
mod common;

mod concurrency;
mod crash_recovery;
mod end_to_end;
mod reopen;
mod tail_wait;
