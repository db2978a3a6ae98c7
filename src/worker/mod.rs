//! Delivery processing: the tick worker and its retry backoff policy.

pub mod backoff;
pub mod delivery;

pub use backoff::BackoffPolicy;
pub use delivery::{DeliveryWorker, TickReport, WorkerConfig};
