//! Persistence layer: delivery records, subscriber directory, sent history.
//!
//! SQLite-backed; all authoritative state survives process restarts. See
//! `delivery_store` for the atomic claim/release/finalize protocol.

pub mod delivery_store;
pub mod history;
pub mod records;

pub use delivery_store::DeliveryStore;
pub use history::HistoryStore;
pub use records::{DeliveryRecord, DeliveryStatus, Subscriber};
