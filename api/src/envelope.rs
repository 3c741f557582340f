use crate::error::StorageError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The result shape of every storage operation.
///
/// `success` reports whether the backend could complete the operation, not whether a key
/// existed: a `get` of a missing key is `{success: true, data: null}`. `error` is only present
/// when `success` is false. `message` carries out-of-band notes such as an unsupported `list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T> {
	/// True iff the operation completed without a transport or protocol failure.
	pub success: bool,
	/// The payload; `None` for a successful read of an absent key and for failures.
	pub data: Option<T>,
	/// Human-readable failure description, present only when `success` is false.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub error: Option<String>,
	/// Informational note attached to a successful result.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub message: Option<String>,
}

impl<T> Envelope<T> {
	/// A successful result carrying `data`.
	pub fn ok(data: T) -> Self {
		Self { success: true, data: Some(data), error: None, message: None }
	}

	/// A successful result without payload, e.g. a read of an absent key.
	pub fn empty() -> Self {
		Self { success: true, data: None, error: None, message: None }
	}

	/// A failed result.
	pub fn failure(error: impl Into<String>) -> Self {
		Self { success: false, data: None, error: Some(error.into()), message: None }
	}

	/// A successful result flagging that the backend does not support the operation.
	pub fn unsupported(data: T, message: impl Into<String>) -> Self {
		Self { success: true, data: Some(data), error: None, message: Some(message.into()) }
	}

	/// Converts back to a `Result`, for callers that prefer `?` over branching on `success`.
	///
	/// A failed envelope becomes [`StorageError::InternalError`] carrying the backend's
	/// diagnostic; the caller decides how much of it to expose.
	pub fn into_result(self) -> Result<Option<T>, StorageError> {
		if self.success {
			Ok(self.data)
		} else {
			Err(StorageError::InternalError(
				self.error.unwrap_or_else(|| "unknown storage failure".to_string()),
			))
		}
	}

	/// Maps the payload, keeping the success flag and notes.
	pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> Envelope<U> {
		Envelope {
			success: self.success,
			data: self.data.map(f),
			error: self.error,
			message: self.message,
		}
	}
}

impl<T> From<Result<Option<T>, StorageError>> for Envelope<T> {
	fn from(result: Result<Option<T>, StorageError>) -> Self {
		match result {
			Ok(Some(data)) => Envelope::ok(data),
			Ok(None) => Envelope::empty(),
			Err(e) => Envelope::failure(e.to_string()),
		}
	}
}

/// The outcome of one item of a [`batch_put`] or [`restore`], tagged with its key so that
/// callers can reconcile a partially applied batch.
///
/// [`batch_put`]: crate::storage::StorageBackend::batch_put
/// [`restore`]: crate::storage::StorageBackend::restore
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchResult {
	/// The key the item was written to.
	pub key: String,
	/// The envelope returned by the underlying `put`.
	#[serde(flatten)]
	pub result: Envelope<Value>,
}

impl BatchResult {
	/// Whether this item was written.
	pub fn is_success(&self) -> bool {
		self.result.success
	}
}
