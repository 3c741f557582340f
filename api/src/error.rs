use std::error::Error;
use std::fmt::{Display, Formatter};
use std::io;

/// Failure categories a storage operation, or the layers built on top of it, can report.
///
/// Backends never return these to their callers directly: every [`StorageBackend`] operation
/// converts them into a failed [`Envelope`]. Callers that prefer `?` can turn an envelope back
/// into a `Result` with [`Envelope::into_result`].
///
/// [`StorageBackend`]: crate::storage::StorageBackend
/// [`Envelope`]: crate::envelope::Envelope
/// [`Envelope::into_result`]: crate::envelope::Envelope::into_result
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
	/// A record that the caller required does not exist.
	///
	/// Backends report a missing key as a successful empty read; this variant is only produced
	/// by higher layers that need the value to be present.
	NoSuchKeyError(String),

	/// The request was malformed, e.g. an empty key or a non-object resource body.
	InvalidRequestError(String),

	/// Authentication or authorization failed.
	AuthError(String),

	/// The backend could not reach its store: connection failure, timeout or non-2xx status.
	TransportError(String),

	/// The store answered, but the answer could not be understood or was a rejection, e.g. a
	/// non-JSON body or a signature mismatch.
	ProtocolError(String),

	/// The backend could not be constructed from the supplied settings.
	ConfigurationError(String),

	/// Anything else, including I/O errors of the local backend.
	InternalError(String),
}

impl Display for StorageError {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		match self {
			StorageError::NoSuchKeyError(message) => {
				write!(f, "Requested key does not exist: {}", message)
			},
			StorageError::InvalidRequestError(message) => {
				write!(f, "Invalid storage request: {}", message)
			},
			StorageError::AuthError(message) => {
				write!(f, "Authentication or Authorization failure: {}", message)
			},
			StorageError::TransportError(message) => {
				write!(f, "Transport failure: {}", message)
			},
			StorageError::ProtocolError(message) => {
				write!(f, "Protocol failure: {}", message)
			},
			StorageError::ConfigurationError(message) => {
				write!(f, "Invalid storage configuration: {}", message)
			},
			StorageError::InternalError(message) => {
				write!(f, "Internal storage error: {}", message)
			},
		}
	}
}

impl Error for StorageError {}

impl From<io::Error> for StorageError {
	fn from(err: io::Error) -> Self {
		StorageError::InternalError(err.to_string())
	}
}

impl From<serde_json::Error> for StorageError {
	fn from(err: serde_json::Error) -> Self {
		StorageError::ProtocolError(err.to_string())
	}
}
