use crate::{transport_error, truncate_diagnostic, DEFAULT_REQUEST_TIMEOUT};
use api::envelope::Envelope;
use api::error::StorageError;
use api::storage::{
	encode_value, validate_key, write_ack, Capabilities, PutOptions, StorageBackend, ValueType,
};
use async_trait::async_trait;
use log::{debug, warn};
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Url};
use serde_json::Value;
use std::time::Duration;

/// Attempts per request, first try included.
pub const DEFAULT_PROXY_MAX_ATTEMPTS: u32 = 3;
/// Base delay between attempts; attempt `n` waits `n` times this.
pub const DEFAULT_PROXY_RETRY_BACKOFF: Duration = Duration::from_millis(1000);

const UNSUPPORTED_LIST_MESSAGE: &str = "list operation not supported by the proxy backend";

/// Connection settings of [`ProxiedKvBackend`].
#[derive(Debug, Clone)]
pub struct ProxyConfig {
	/// URL of the proxy function.
	pub url: String,
	/// Attempts per request, first try included.
	pub max_attempts: u32,
	/// Base delay of the linear backoff.
	pub retry_backoff: Duration,
	/// Per-request timeout.
	pub timeout: Duration,
}

impl ProxyConfig {
	/// Settings with the default retry policy and timeout.
	pub fn new(url: impl Into<String>) -> Self {
		Self {
			url: url.into(),
			max_attempts: DEFAULT_PROXY_MAX_ATTEMPTS,
			retry_backoff: DEFAULT_PROXY_RETRY_BACKOFF,
			timeout: DEFAULT_REQUEST_TIMEOUT,
		}
	}
}

enum AttemptError {
	/// Worth another try: the proxy was not reached or answered with a non-2xx status.
	Retryable(StorageError),
	/// The proxy answered with something that another try will not change.
	Fatal(StorageError),
}

/// Client of an HTTP proxy function that fronts a remote KV store and only accepts `GET`
/// requests with every parameter, the written value included, in the query string.
///
/// Values are sent as URL-encoded JSON text; on read the type hint is passed to the proxy,
/// which decodes server-side. There is no `list`. Transport failures are retried with a linear
/// backoff.
pub struct ProxiedKvBackend {
	client: Client,
	url: Url,
	config: ProxyConfig,
}

impl ProxiedKvBackend {
	/// Builds a client for `config.url`.
	pub fn new(config: ProxyConfig) -> Result<Self, StorageError> {
		let url = Url::parse(&config.url).map_err(|e| {
			StorageError::ConfigurationError(format!("Invalid proxy URL {}: {}", config.url, e))
		})?;
		let client = Client::builder().timeout(config.timeout).build().map_err(|e| {
			StorageError::ConfigurationError(format!("Failed to build HTTP client: {}", e))
		})?;
		Ok(Self { client, url, config })
	}

	/// Sends one proxy request, retrying transport failures.
	async fn request(&self, query: &[(&str, &str)]) -> Result<Envelope<Value>, StorageError> {
		let attempts = self.config.max_attempts.max(1);
		let mut last_error = None;

		for attempt in 1..=attempts {
			match self.attempt(query).await {
				Ok(envelope) => return Ok(envelope),
				Err(AttemptError::Fatal(e)) => return Err(e),
				Err(AttemptError::Retryable(e)) => {
					if attempt < attempts {
						let delay = self.config.retry_backoff * attempt;
						warn!(
							"Proxy request failed (attempt {}/{}): {}. Retrying in {:?}",
							attempt, attempts, e, delay
						);
						tokio::time::sleep(delay).await;
					}
					last_error = Some(e);
				},
			}
		}

		Err(last_error
			.unwrap_or_else(|| StorageError::TransportError("no proxy request was attempted".to_string())))
	}

	async fn attempt(&self, query: &[(&str, &str)]) -> Result<Envelope<Value>, AttemptError> {
		let response = self
			.client
			.get(self.url.clone())
			.query(query)
			.send()
			.await
			.map_err(|e| AttemptError::Retryable(transport_error(e)))?;

		let status = response.status();
		let content_type = response
			.headers()
			.get(CONTENT_TYPE)
			.and_then(|v| v.to_str().ok())
			.unwrap_or_default()
			.to_string();
		let body = response.text().await.map_err(|e| AttemptError::Retryable(transport_error(e)))?;

		if !status.is_success() {
			return Err(AttemptError::Retryable(StorageError::TransportError(format!(
				"proxy returned HTTP {}: {}",
				status,
				truncate_diagnostic(&body)
			))));
		}
		if !content_type.contains("application/json") {
			return Err(AttemptError::Fatal(StorageError::ProtocolError(format!(
				"proxy returned a non-JSON response ({}): {}",
				if content_type.is_empty() { "no content type" } else { content_type.as_str() },
				truncate_diagnostic(&body)
			))));
		}
		serde_json::from_str(&body).map_err(|e| {
			AttemptError::Fatal(StorageError::ProtocolError(format!(
				"proxy returned malformed JSON ({}): {}",
				e,
				truncate_diagnostic(&body)
			)))
		})
	}

	/// Sends a request and unwraps the proxy's own envelope.
	async fn call(&self, query: &[(&str, &str)]) -> Result<Option<Value>, StorageError> {
		let envelope = self.request(query).await?;
		if envelope.success {
			Ok(envelope.data)
		} else {
			Err(StorageError::ProtocolError(format!(
				"proxy rejected the request: {}",
				envelope.error.unwrap_or_else(|| "no error given".to_string())
			)))
		}
	}

	async fn get_value(
		&self, key: &str, value_type: ValueType,
	) -> Result<Option<Value>, StorageError> {
		validate_key(key)?;
		self.call(&[("action", "get"), ("key", key), ("type", value_type.as_str())]).await
	}

	async fn put_value(
		&self, key: &str, value: &Value, options: &PutOptions,
	) -> Result<Option<Value>, StorageError> {
		validate_key(key)?;
		if let Some(ttl) = options.expiration_ttl {
			debug!("Ignoring expiration TTL of {}s for key {}: not supported by the proxy", ttl, key);
		}
		let encoded = encode_value(value)?;
		self.call(&[("action", "put"), ("key", key), ("value", encoded.as_str())]).await?;
		Ok(Some(write_ack(key)))
	}

	async fn delete_value(&self, key: &str) -> Result<Option<Value>, StorageError> {
		validate_key(key)?;
		self.call(&[("action", "delete"), ("key", key)]).await?;
		Ok(Some(write_ack(key)))
	}
}

#[async_trait]
impl StorageBackend for ProxiedKvBackend {
	fn name(&self) -> &'static str {
		"proxy"
	}

	fn capabilities(&self) -> Capabilities {
		Capabilities { list: false, ttl: false }
	}

	async fn get(&self, key: &str, value_type: ValueType) -> Envelope<Value> {
		self.get_value(key, value_type).await.into()
	}

	async fn put(&self, key: &str, value: &Value, options: &PutOptions) -> Envelope<Value> {
		self.put_value(key, value, options).await.into()
	}

	async fn delete(&self, key: &str) -> Envelope<Value> {
		self.delete_value(key).await.into()
	}

	async fn list(&self, prefix: &str, _limit: usize) -> Envelope<Vec<String>> {
		debug!("List of prefix {:?} requested from the proxy backend, which cannot list", prefix);
		Envelope::unsupported(Vec::new(), UNSUPPORTED_LIST_MESSAGE)
	}
}
