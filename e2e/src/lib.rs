//! Broadcast smoke tests for the hosted realtime service.
//!
//! The scenarios run against whatever `HarnessConfig` points at: the
//! in-process mock in `cargo test`, or a live project (ignored tests) when
//! `PROJECT_URL` and `PROJECT_ANON_TOKEN` are set.

pub mod harness;
pub mod scenarios;

#[cfg(test)]
mod tests;
