//! Tollgate - Token Bucket Rate Limiting
//!
//! This crate gates request throughput per identity and per named rule using
//! token buckets. Bucket state lives either in process memory or in Redis,
//! where every update runs as one atomic server-side script so that many
//! processes can share the same limits.

pub mod config;
pub mod error;
pub mod middleware;
pub mod ratelimit;
