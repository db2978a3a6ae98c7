//! HTTP implementations of the collaborator traits.
//!
//! `HttpGenerator` talks to an OpenAI-compatible chat-completions endpoint;
//! `HttpSender` posts to a Twilio-style messages endpoint. Both carry their
//! own request timeout so a hung upstream becomes a retryable failure
//! instead of a stalled worker.

use crate::error::{DripfeedError, Result};
use crate::provider::{GeneratedMessage, MessageGenerator, SmsSender};
use crate::store::records::{Subscriber, fingerprint};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use std::time::Duration;

/// Default chat-completions endpoint
const DEFAULT_GENERATION_ENDPOINT: &str = "https://api.openai.com/v1/chat/completions";

/// Default generation model
const DEFAULT_MODEL: &str = "gpt-4o-mini";

/// Default per-request timeout
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

const SYSTEM_PROMPT: &str = "You write one short, warm, encouraging message for a \
daily SMS. One or two sentences, no hashtags, no emoji spam. Do not repeat \
recent messages.";

/// Configuration for the generation client
#[derive(Debug, Clone)]
pub struct HttpGeneratorConfig {
    pub endpoint: String,
    pub model: String,
    pub max_tokens: u32,
    pub timeout: Duration,
}

impl Default for HttpGeneratorConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_GENERATION_ENDPOINT.to_string(),
            model: DEFAULT_MODEL.to_string(),
            max_tokens: 100,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

/// Chat-completions message generator
pub struct HttpGenerator {
    client: Client,
    api_key: String,
    config: HttpGeneratorConfig,
}

impl HttpGenerator {
    /// Create a new generator, reading OPENAI_API_KEY from the environment.
    pub fn new(config: HttpGeneratorConfig) -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| DripfeedError::Generation("OPENAI_API_KEY not set".to_string()))?;
        Self::with_api_key(api_key, config)
    }

    /// Create a generator with an explicit API key.
    pub fn with_api_key(api_key: String, config: HttpGeneratorConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| DripfeedError::Generation(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            api_key,
            config,
        })
    }

    fn build_request(&self, recent_fingerprints: &[String]) -> Value {
        let mut prompt = String::from("Write today's message.");
        if !recent_fingerprints.is_empty() {
            prompt.push_str(&format!(
                " Avoid repeating the messages with these content ids: {}.",
                recent_fingerprints.join(", ")
            ));
        }

        json!({
            "model": self.config.model,
            "max_tokens": self.config.max_tokens,
            "temperature": 0.7,
            "messages": [
                { "role": "system", "content": SYSTEM_PROMPT },
                { "role": "user", "content": prompt },
            ],
        })
    }
}

#[async_trait]
impl MessageGenerator for HttpGenerator {
    async fn generate(
        &self,
        subscriber: &Subscriber,
        recent_fingerprints: &[String],
    ) -> Result<GeneratedMessage> {
        let body = self.build_request(recent_fingerprints);

        let response = self
            .client
            .post(&self.config.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| DripfeedError::Generation(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(DripfeedError::Generation(format!(
                "endpoint returned {status}: {text}"
            )));
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|e| DripfeedError::Generation(format!("bad response body: {e}")))?;

        let content = payload["choices"][0]["message"]["content"]
            .as_str()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| DripfeedError::Generation("empty completion".to_string()))?
            .to_string();

        tracing::debug!(subscriber = %subscriber.id, chars = content.len(), "message generated");

        let fp = fingerprint(&content);
        Ok(GeneratedMessage {
            content,
            fingerprint: fp,
        })
    }
}

/// Configuration for the SMS gateway client
#[derive(Debug, Clone)]
pub struct HttpSenderConfig {
    pub base_url: String,
    pub account_sid: String,
    pub from_number: String,
    pub timeout: Duration,
}

impl HttpSenderConfig {
    pub fn new(account_sid: impl Into<String>, from_number: impl Into<String>) -> Self {
        Self {
            base_url: "https://api.twilio.com".to_string(),
            account_sid: account_sid.into(),
            from_number: from_number.into(),
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

/// Twilio-style SMS sender
pub struct HttpSender {
    client: Client,
    auth_token: String,
    config: HttpSenderConfig,
}

impl HttpSender {
    /// Create a new sender, reading TWILIO_AUTH_TOKEN from the environment.
    pub fn new(config: HttpSenderConfig) -> Result<Self> {
        let auth_token = std::env::var("TWILIO_AUTH_TOKEN")
            .map_err(|_| DripfeedError::Send("TWILIO_AUTH_TOKEN not set".to_string()))?;
        Self::with_auth_token(auth_token, config)
    }

    /// Create a sender with an explicit auth token.
    pub fn with_auth_token(auth_token: String, config: HttpSenderConfig) -> Result<Self> {
        if config.account_sid.is_empty() || config.from_number.is_empty() {
            return Err(DripfeedError::Send("missing gateway credentials".to_string()));
        }

        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| DripfeedError::Send(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            auth_token,
            config,
        })
    }

    fn messages_url(&self) -> String {
        format!(
            "{}/2010-04-01/Accounts/{}/Messages.json",
            self.config.base_url, self.config.account_sid
        )
    }
}

#[async_trait]
impl SmsSender for HttpSender {
    async fn send(&self, phone: &str, content: &str) -> Result<String> {
        let form = [
            ("To", phone),
            ("From", self.config.from_number.as_str()),
            ("Body", content),
        ];

        let response = self
            .client
            .post(self.messages_url())
            .basic_auth(&self.config.account_sid, Some(&self.auth_token))
            .form(&form)
            .send()
            .await
            .map_err(|e| DripfeedError::Send(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(DripfeedError::Send(format!(
                "gateway returned {status}: {text}"
            )));
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|e| DripfeedError::Send(format!("bad response body: {e}")))?;

        let sid = payload["sid"]
            .as_str()
            .ok_or_else(|| DripfeedError::Send("gateway response missing sid".to_string()))?
            .to_string();

        tracing::info!(receipt = %sid, "message accepted by gateway");
        Ok(sid)
    }
}
