//! Hosts [`StorageBackend`] implementations for the folio portfolio server.
//!
//! Three interchangeable backends are provided: a local one (memory or one file per key), a
//! client for a cloud edge-KV service authenticated with signed requests, and a client for a
//! thin HTTP proxy function that only understands `GET` requests. [`storage_factory`] picks
//! one of them at start-up.
//!
//! [`StorageBackend`]: api::storage::StorageBackend

#![deny(rustdoc::broken_intra_doc_links)]
#![deny(rustdoc::private_intra_doc_links)]
#![deny(missing_docs)]

use api::error::StorageError;
use std::time::Duration;

/// Contains the local backend, in memory or file-backed.
pub mod local_store;
/// Contains the backend talking to an HTTP `GET` proxy in front of a remote KV store.
pub mod proxied_kv_store;
/// Contains the backend talking to a cloud edge-KV service with signed requests.
pub mod signed_edge_kv_store;
/// Contains canonical request construction and HMAC-SHA256 request signing.
pub mod signing;
/// Contains the start-up selection of one backend from configuration.
pub mod storage_factory;

#[cfg(test)]
mod mock_servers;

/// Timeout applied to every request of the remote backends.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// How much of an unexpected response body is kept in an error message.
const DIAGNOSTIC_LENGTH: usize = 200;

/// Shortens a response body for use in an error message, on a character boundary.
pub(crate) fn truncate_diagnostic(body: &str) -> String {
	match body.char_indices().nth(DIAGNOSTIC_LENGTH) {
		Some((idx, _)) => format!("{}...", &body[..idx]),
		None => body.to_string(),
	}
}

/// Maps a client-side HTTP failure to a transport error.
pub(crate) fn transport_error(err: reqwest::Error) -> StorageError {
	if err.is_timeout() {
		StorageError::TransportError(format!("request timed out: {}", err))
	} else if err.is_connect() {
		StorageError::TransportError(format!("connection failed: {}", err))
	} else {
		StorageError::TransportError(err.to_string())
	}
}
