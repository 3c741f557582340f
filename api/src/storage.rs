use crate::envelope::{BatchResult, Envelope};
use crate::error::StorageError;
use async_trait::async_trait;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;

/// Number of keys `list` returns when the caller does not ask for a specific limit.
pub const DEFAULT_LIST_LIMIT: usize = 100;

/// Longest key, in bytes, that any backend accepts.
pub const MAX_KEY_LENGTH: usize = 512;

/// How a stored payload should be handed back by `get`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
	/// Return the stored JSON value. Payloads that are not valid JSON come back as raw strings.
	#[default]
	Json,
	/// Return strings verbatim and any other value as its compact JSON text.
	Text,
}

impl ValueType {
	/// Parses a `json`/`text` hint, defaulting to [`ValueType::Json`].
	pub fn from_hint(hint: Option<&str>) -> Self {
		match hint {
			Some(h) if h.eq_ignore_ascii_case("text") => ValueType::Text,
			_ => ValueType::Json,
		}
	}

	/// The hint as sent over the wire.
	pub fn as_str(&self) -> &'static str {
		match self {
			ValueType::Json => "json",
			ValueType::Text => "text",
		}
	}
}

/// Per-write options.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PutOptions {
	/// Requested time-to-live in seconds. Only honoured by backends whose
	/// [`Capabilities::ttl`] is set; others ignore it.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub expiration_ttl: Option<u64>,
}

/// Optional features a backend may or may not provide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Capabilities {
	/// `list` returns the real key set rather than an empty, flagged result.
	pub list: bool,
	/// `PutOptions::expiration_ttl` is forwarded to the store.
	pub ttl: bool,
}

/// One entry of a [`StorageBackend::batch_put`] call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchItem {
	/// Key to write.
	pub key: String,
	/// Value to write.
	pub value: Value,
	/// Write options for this item.
	#[serde(default)]
	pub options: PutOptions,
}

/// An interface that must be implemented by every storage backend.
///
/// Every operation is a failure boundary: transport, protocol and I/O failures are reported as
/// a failed [`Envelope`] and never escape as panics or errors. A read of an absent key is a
/// success with no data, and deleting an absent key is a success.
#[async_trait]
pub trait StorageBackend: Send + Sync {
	/// Short name used in logs and diagnostics.
	fn name(&self) -> &'static str;

	/// Optional features of this backend.
	fn capabilities(&self) -> Capabilities;

	/// Reads the value stored under `key`.
	async fn get(&self, key: &str, value_type: ValueType) -> Envelope<Value>;

	/// Replaces the value stored under `key`. Acknowledges with `{"key": key}`.
	async fn put(&self, key: &str, value: &Value, options: &PutOptions) -> Envelope<Value>;

	/// Removes `key`. Acknowledges with `{"key": key}` whether or not the key existed.
	async fn delete(&self, key: &str) -> Envelope<Value>;

	/// Lists at most `limit` keys starting with `prefix`.
	///
	/// Backends without a native listing return an empty list with a `message` saying so,
	/// never a partial key set.
	async fn list(&self, prefix: &str, limit: usize) -> Envelope<Vec<String>>;

	/// Writes every item with its own `put`, in order.
	///
	/// This is not a transaction: a failing item does not stop or undo the others, and the
	/// returned results, one per item, are the only record of what was written.
	async fn batch_put(&self, items: Vec<BatchItem>) -> Vec<BatchResult> {
		let mut results = Vec::with_capacity(items.len());
		for item in items {
			let result = self.put(&item.key, &item.value, &item.options).await;
			if !result.success {
				warn!("Batch write of key {} to {} failed: {:?}", item.key, self.name(), result.error);
			}
			results.push(BatchResult { key: item.key, result });
		}
		results
	}

	/// Reads every key in `keys`, skipping keys that are absent or could not be read.
	async fn backup(&self, keys: &[String]) -> BTreeMap<String, Value> {
		let mut snapshot = BTreeMap::new();
		for key in keys {
			let result = self.get(key, ValueType::Json).await;
			match result.data {
				Some(value) if result.success => {
					snapshot.insert(key.clone(), value);
				},
				_ if result.success => debug!("Skipping absent key {} during backup", key),
				_ => warn!("Skipping key {} during backup: {:?}", key, result.error),
			}
		}
		snapshot
	}

	/// Writes every entry of a backup with its own `put`.
	///
	/// Not atomic. Since `put` is a full overwrite, re-running the same restore after a partial
	/// failure converges to the same state.
	async fn restore(&self, snapshot: BTreeMap<String, Value>) -> Vec<BatchResult> {
		let options = PutOptions::default();
		let mut results = Vec::with_capacity(snapshot.len());
		for (key, value) in snapshot {
			let result = self.put(&key, &value, &options).await;
			if !result.success {
				warn!("Restore of key {} to {} failed: {:?}", key, self.name(), result.error);
			}
			results.push(BatchResult { key, result });
		}
		results
	}
}

/// Rejects keys no backend can store.
pub fn validate_key(key: &str) -> Result<(), StorageError> {
	if key.is_empty() {
		return Err(StorageError::InvalidRequestError("key must not be empty".to_string()));
	}
	if key.len() > MAX_KEY_LENGTH {
		return Err(StorageError::InvalidRequestError(format!(
			"key is {} bytes long, the maximum is {}",
			key.len(),
			MAX_KEY_LENGTH
		)));
	}
	Ok(())
}

/// The acknowledgement payload of `put` and `delete`.
pub fn write_ack(key: &str) -> Value {
	json!({ "key": key })
}

/// Encodes a value into the text form that string-only stores keep.
pub fn encode_value(value: &Value) -> Result<String, StorageError> {
	Ok(serde_json::to_string(value)?)
}

/// Decodes text previously produced by [`encode_value`], or written by a foreign writer.
///
/// Text that is not valid JSON is returned as a raw string with a warning, never as an error.
pub fn decode_value(key: &str, raw: &str, value_type: ValueType) -> Value {
	match serde_json::from_str::<Value>(raw) {
		Ok(value) => present_value(value, value_type),
		Err(e) => {
			if value_type == ValueType::Json {
				warn!("Value stored under {} is not valid JSON ({}), returning it as a string", key, e);
			}
			Value::String(raw.to_string())
		},
	}
}

/// Shapes a decoded value according to the requested [`ValueType`].
pub fn present_value(value: Value, value_type: ValueType) -> Value {
	match (value_type, value) {
		(ValueType::Json, value) => value,
		(ValueType::Text, Value::String(s)) => Value::String(s),
		(ValueType::Text, other) => Value::String(other.to_string()),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn decode_round_trips_encoded_values() {
		for value in [json!({"title": "Demo"}), json!([1, 2]), json!("123"), json!(true), json!(4.5)]
		{
			let raw = encode_value(&value).unwrap();
			assert_eq!(decode_value("k", &raw, ValueType::Json), value);
		}
	}

	#[test]
	fn decode_falls_back_to_raw_string() {
		assert_eq!(decode_value("k", "not json {", ValueType::Json), json!("not json {"));
	}

	#[test]
	fn text_hint_stringifies_structured_values() {
		assert_eq!(decode_value("k", r#"{"a":1}"#, ValueType::Text), json!(r#"{"a":1}"#));
		assert_eq!(decode_value("k", r#""hello""#, ValueType::Text), json!("hello"));
	}

	#[test]
	fn validates_keys() {
		assert!(validate_key("project:1").is_ok());
		assert!(matches!(validate_key(""), Err(StorageError::InvalidRequestError(_))));
		let long = "k".repeat(MAX_KEY_LENGTH + 1);
		assert!(matches!(validate_key(&long), Err(StorageError::InvalidRequestError(_))));
	}

	#[test]
	fn parses_value_type_hints() {
		assert_eq!(ValueType::from_hint(None), ValueType::Json);
		assert_eq!(ValueType::from_hint(Some("TEXT")), ValueType::Text);
		assert_eq!(ValueType::from_hint(Some("json")), ValueType::Json);
		assert_eq!(ValueType::from_hint(Some("other")), ValueType::Json);
	}
}
