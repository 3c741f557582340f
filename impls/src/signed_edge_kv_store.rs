use crate::signing::{Credentials, SignedRequest};
use crate::{transport_error, truncate_diagnostic, DEFAULT_REQUEST_TIMEOUT};
use api::envelope::Envelope;
use api::error::StorageError;
use api::storage::{
	decode_value, encode_value, present_value, validate_key, write_ack, Capabilities, PutOptions,
	StorageBackend, ValueType,
};
use async_trait::async_trait;
use chrono::Utc;
use log::{debug, warn};
use reqwest::{Client, Method, StatusCode, Url};
use serde_json::{json, Map, Value};
use std::time::Duration;

/// Default API endpoint of the edge-KV provider.
pub const DEFAULT_EDGE_KV_ENDPOINT: &str = "https://edgeone.tencentcloudapi.com";
/// Default region header.
pub const DEFAULT_EDGE_KV_REGION: &str = "ap-guangzhou";
/// Default KV namespace holding the portfolio content.
pub const DEFAULT_EDGE_KV_NAMESPACE: &str = "portfolio";
/// Service name in the credential scope.
pub const EDGE_KV_SERVICE: &str = "teo";
/// API version header.
pub const EDGE_KV_API_VERSION: &str = "2022-09-01";

const CONTENT_TYPE: &str = "application/json; charset=utf-8";
const ACTION_PUT: &str = "PutKv";
const ACTION_GET: &str = "GetKv";
const ACTION_DELETE: &str = "DeleteKv";
const ACTION_LIST: &str = "ListKv";
/// The only provider error code that means "this key holds no value".
const KEY_NOT_FOUND_CODE: &str = "ResourceNotFound.KeyNotFound";

/// Upper bound on list pages fetched for a single `list` call.
const MAX_LIST_PAGES: usize = 100;

/// Connection settings of [`SignedEdgeKvBackend`].
#[derive(Debug, Clone)]
pub struct EdgeKvConfig {
	/// Base URL of the provider API, e.g. [`DEFAULT_EDGE_KV_ENDPOINT`].
	pub endpoint: String,
	/// Value of the region header.
	pub region: String,
	/// KV namespace all keys live in.
	pub namespace: String,
	/// Signing credentials.
	pub credentials: Credentials,
	/// Per-request timeout.
	pub timeout: Duration,
}

impl EdgeKvConfig {
	/// Settings with the default endpoint, region, namespace and timeout.
	pub fn new(credentials: Credentials) -> Self {
		Self {
			endpoint: DEFAULT_EDGE_KV_ENDPOINT.to_string(),
			region: DEFAULT_EDGE_KV_REGION.to_string(),
			namespace: DEFAULT_EDGE_KV_NAMESPACE.to_string(),
			credentials,
			timeout: DEFAULT_REQUEST_TIMEOUT,
		}
	}
}

/// What the provider answered to one action.
enum ProviderReply {
	Data(Map<String, Value>),
	KeyNotFound,
}

/// Client of a cloud edge-KV service that authenticates every request with a
/// `TC3-HMAC-SHA256` signature.
///
/// Each storage operation is one provider action, named in the `X-TC-Action` header, with a JSON
/// body. Values travel as their JSON text and are parsed back on read. Requests are not retried:
/// a rejected signature stays rejected.
pub struct SignedEdgeKvBackend {
	client: Client,
	config: EdgeKvConfig,
	scheme: String,
	host: String,
}

impl SignedEdgeKvBackend {
	/// Builds a client for `config.endpoint`.
	pub fn new(config: EdgeKvConfig) -> Result<Self, StorageError> {
		let url = Url::parse(&config.endpoint).map_err(|e| {
			StorageError::ConfigurationError(format!("Invalid edge KV endpoint {}: {}", config.endpoint, e))
		})?;
		let host = url.host_str().ok_or_else(|| {
			StorageError::ConfigurationError(format!("Edge KV endpoint {} has no host", config.endpoint))
		})?;
		let host = match url.port() {
			Some(port) => format!("{}:{}", host, port),
			None => host.to_string(),
		};
		let client = Client::builder().timeout(config.timeout).build().map_err(|e| {
			StorageError::ConfigurationError(format!("Failed to build HTTP client: {}", e))
		})?;
		Ok(Self { client, scheme: url.scheme().to_string(), host, config })
	}

	async fn call(&self, action: &str, payload: Value) -> Result<ProviderReply, StorageError> {
		let body = serde_json::to_vec(&payload)?;
		let timestamp = Utc::now().timestamp();
		let request = SignedRequest::new(
			&self.config.credentials,
			EDGE_KV_SERVICE,
			timestamp,
			"POST",
			&self.scheme,
			&self.host,
			"/",
			&[],
			&[
				("Content-Type".to_string(), CONTENT_TYPE.to_string()),
				("X-TC-Action".to_string(), action.to_string()),
			],
			&[
				("X-TC-Timestamp".to_string(), timestamp.to_string()),
				("X-TC-Version".to_string(), EDGE_KV_API_VERSION.to_string()),
				("X-TC-Region".to_string(), self.config.region.clone()),
			],
			body,
		)?;

		let method = Method::from_bytes(request.method.as_bytes())
			.map_err(|e| StorageError::InternalError(format!("Invalid HTTP method: {}", e)))?;
		let mut builder = self.client.request(method, &request.url);
		for (name, value) in &request.headers {
			builder = builder.header(name.as_str(), value.as_str());
		}

		debug!("Sending {} to edge KV namespace {}", action, self.config.namespace);
		let response = builder.body(request.body).send().await.map_err(transport_error)?;
		let status = response.status();
		let text = response.text().await.map_err(transport_error)?;
		parse_reply(action, status, &text)
	}

	async fn get_value(
		&self, key: &str, value_type: ValueType,
	) -> Result<Option<Value>, StorageError> {
		validate_key(key)?;
		let payload = json!({ "Namespace": self.config.namespace, "Key": key });
		match self.call(ACTION_GET, payload).await? {
			ProviderReply::KeyNotFound => Ok(None),
			ProviderReply::Data(response) => match response.get("Value") {
				None | Some(Value::Null) => Ok(None),
				Some(Value::String(raw)) => Ok(Some(decode_value(key, raw, value_type))),
				Some(other) => Ok(Some(present_value(other.clone(), value_type))),
			},
		}
	}

	async fn put_value(
		&self, key: &str, value: &Value, options: &PutOptions,
	) -> Result<Option<Value>, StorageError> {
		validate_key(key)?;
		let mut payload = json!({
			"Namespace": self.config.namespace,
			"Key": key,
			"Value": encode_value(value)?,
		});
		if let (Some(ttl), Some(fields)) = (options.expiration_ttl, payload.as_object_mut()) {
			fields.insert("ExpirationTtl".to_string(), json!(ttl));
		}
		match self.call(ACTION_PUT, payload).await? {
			ProviderReply::Data(_) => Ok(Some(write_ack(key))),
			ProviderReply::KeyNotFound => Err(StorageError::ProtocolError(format!(
				"{} reported {} while writing {}",
				ACTION_PUT, KEY_NOT_FOUND_CODE, key
			))),
		}
	}

	async fn delete_value(&self, key: &str) -> Result<Option<Value>, StorageError> {
		validate_key(key)?;
		let payload = json!({ "Namespace": self.config.namespace, "Key": key });
		// A missing key means there was nothing to delete.
		match self.call(ACTION_DELETE, payload).await? {
			ProviderReply::Data(_) | ProviderReply::KeyNotFound => Ok(Some(write_ack(key))),
		}
	}

	async fn list_keys(&self, prefix: &str, limit: usize) -> Result<Vec<String>, StorageError> {
		let mut keys: Vec<String> = Vec::new();
		let mut cursor: Option<String> = None;

		for _ in 0..MAX_LIST_PAGES {
			if keys.len() >= limit {
				break;
			}
			let mut payload = json!({
				"Namespace": self.config.namespace,
				"Prefix": prefix,
				"Limit": limit - keys.len(),
			});
			if let (Some(c), Some(fields)) = (&cursor, payload.as_object_mut()) {
				fields.insert("Cursor".to_string(), json!(c));
			}

			let response = match self.call(ACTION_LIST, payload).await? {
				ProviderReply::Data(response) => response,
				ProviderReply::KeyNotFound => {
					return Err(StorageError::ProtocolError(format!(
						"{} reported {} after {} keys",
						ACTION_LIST,
						KEY_NOT_FOUND_CODE,
						keys.len()
					)));
				},
			};
			let page = response.get("Keys").and_then(Value::as_array).ok_or_else(|| {
				StorageError::ProtocolError(format!("{} response has no Keys array", ACTION_LIST))
			})?;
			if page.is_empty() {
				break;
			}
			keys.extend(
				page.iter()
					.filter_map(|entry| match entry {
						Value::String(key) => Some(key.clone()),
						Value::Object(fields) => fields.get("Key").and_then(Value::as_str).map(str::to_string),
						_ => None,
					})
					.filter(|key| key.starts_with(prefix)),
			);

			match response.get("Cursor").and_then(Value::as_str) {
				Some(next) if !next.is_empty() && cursor.as_deref() != Some(next) => {
					cursor = Some(next.to_string());
				},
				_ => break,
			}
		}

		keys.truncate(limit);
		Ok(keys)
	}
}

/// Interprets a provider response body.
///
/// Only a well-formed provider error carrying [`KEY_NOT_FOUND_CODE`] reports absence. Any other
/// error, including a bare HTTP 404 from something that is not the provider, is a failure.
fn parse_reply(action: &str, status: StatusCode, text: &str) -> Result<ProviderReply, StorageError> {
	let parsed: Value = match serde_json::from_str(text) {
		Ok(parsed) => parsed,
		Err(_) if !status.is_success() => {
			return Err(StorageError::TransportError(format!(
				"{} failed with HTTP {}: {}",
				action,
				status,
				truncate_diagnostic(text)
			)));
		},
		Err(_) => {
			return Err(StorageError::ProtocolError(format!(
				"{} returned a non-JSON body: {}",
				action,
				truncate_diagnostic(text)
			)));
		},
	};

	let response = match parsed {
		Value::Object(mut root) => match root.remove("Response") {
			Some(Value::Object(response)) => response,
			_ => {
				return Err(StorageError::ProtocolError(format!(
					"{} returned JSON without a Response object",
					action
				)));
			},
		},
		_ => {
			return Err(StorageError::ProtocolError(format!("{} returned a non-object body", action)));
		},
	};

	if let Some(error) = response.get("Error") {
		let code = error.get("Code").and_then(Value::as_str).unwrap_or("Unknown");
		let message = error.get("Message").and_then(Value::as_str).unwrap_or("");
		if code == KEY_NOT_FOUND_CODE {
			return Ok(ProviderReply::KeyNotFound);
		}
		warn!("Edge KV rejected {}: {} {}", action, code, message);
		return Err(StorageError::ProtocolError(format!("{} rejected: {}: {}", action, code, message)));
	}

	if !status.is_success() {
		return Err(StorageError::TransportError(format!("{} failed with HTTP {}", action, status)));
	}
	Ok(ProviderReply::Data(response))
}

#[async_trait]
impl StorageBackend for SignedEdgeKvBackend {
	fn name(&self) -> &'static str {
		"edge-kv"
	}

	fn capabilities(&self) -> Capabilities {
		Capabilities { list: true, ttl: true }
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

	async fn list(&self, prefix: &str, limit: usize) -> Envelope<Vec<String>> {
		self.list_keys(prefix, limit).await.map(Some).into()
	}
}
