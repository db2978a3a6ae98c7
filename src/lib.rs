//! Dripfeed - daily personalized SMS scheduling and delivery
//!
//! Each active subscriber gets one message per day at a random time inside
//! their local delivery window. A tick-driven worker claims due deliveries,
//! generates content, and sends it under shared rate limits with
//! exponential-backoff retries.

pub mod config;
pub mod error;
pub mod limiter;
pub mod provider;
pub mod scheduler;
pub mod store;
pub mod worker;

pub use error::{DripfeedError, Result};
