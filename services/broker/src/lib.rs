//! Broker service library crate.
//!
//! # Purpose
//! Exposes the process-host pieces (configuration loading and observability)
//! for use by the broker binary, the demo and tests.
pub mod config;
pub mod observability;
