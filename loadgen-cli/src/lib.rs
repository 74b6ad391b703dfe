//! Command line load generator for HTTP inference endpoints.
//!
//! This builds on top of [`loadgen_scheduler`] and issues one `POST` request with a small batch
//! of texts per arrival. The arrival rate follows a configurable [`Schedule`] of linear ramps and
//! does not depend on how quickly the endpoint responds, so a slow endpoint shows up as growing
//! latency and errors instead of a silently lower request rate.
//!
//! After the run, the [`thresholds`] decide whether the endpoint met its targets.
//!
//! [`Schedule`]: loadgen_scheduler::Schedule
#![warn(missing_docs)]
#![warn(missing_debug_implementations)]

pub mod cli;
pub mod config;
pub mod http;
pub mod loadtest;
pub mod metrics;
pub mod observability;
pub mod payload;
pub mod thresholds;
