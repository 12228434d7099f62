//! Turnstile - Request Admission-Control Engine
//!
//! This crate decides whether requests may proceed based on layered rate
//! limit rules, escalating penalties for repeat offenders and an
//! administrative block list. Counters live in a gossip-replicated cluster
//! store with a process-local fallback, so a backend outage never turns the
//! limiter into a single point of failure.

pub mod config;
pub mod error;
pub mod grpc;
pub mod mesh;
pub mod ratelimit;
pub mod store;
