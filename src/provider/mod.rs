//! Collaborator seams: subscriber directory, message generation, SMS gateway.
//!
//! The pipeline consumes these through traits only; `http` carries the
//! production implementations.

pub mod http;

pub use http::{HttpGenerator, HttpGeneratorConfig, HttpSender, HttpSenderConfig};

use crate::error::Result;
use crate::store::records::Subscriber;
use async_trait::async_trait;

/// A generated message plus its dedup fingerprint.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedMessage {
    pub content: String,
    pub fingerprint: String,
}

/// Read-only view of the externally-managed subscriber list.
pub trait SubscriberDirectory: Send + Sync {
    fn list_active(&self) -> Result<Vec<Subscriber>>;
}

/// Produces one personalized message for a subscriber.
///
/// `recent_fingerprints` are the subscriber's latest sent messages, newest
/// first, so the generator can avoid repeats. Implementations must be
/// timeout-bounded; a timeout surfaces as `DripfeedError::Generation`.
#[async_trait]
pub trait MessageGenerator: Send + Sync {
    async fn generate(
        &self,
        subscriber: &Subscriber,
        recent_fingerprints: &[String],
    ) -> Result<GeneratedMessage>;
}

/// Delivers one message through the SMS gateway.
///
/// Returns the gateway's receipt id. Implementations must be
/// timeout-bounded; a timeout surfaces as `DripfeedError::Send`.
#[async_trait]
pub trait SmsSender: Send + Sync {
    async fn send(&self, phone: &str, content: &str) -> Result<String>;
}
