//! Test utilities for the load generator and its CLI.
//!
//! This crate provides utilities to facilitate testing of the scheduler and the loadtest runner.
//! See the modules for all available utilities.

pub mod server;
pub mod tracing;
