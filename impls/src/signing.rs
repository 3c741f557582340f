//! Request signing for the edge-KV provider (`TC3-HMAC-SHA256`).
//!
//! The provider recomputes the signature from the request it receives, so the bytes that are
//! signed and the bytes that are sent must come from the same place. [`SignedRequest::new`] is
//! that place: it derives the URL, the transmitted headers and the `Authorization` header from a
//! single list of query parameters and headers, and the backend sends nothing else.
//!
//! Signature input, in order:
//!
//! ```text
//! canonical request = METHOD \n PATH \n SORTED_QUERY \n SORTED_LOWERCASE_HEADERS \n SIGNED_HEADERS \n hex(sha256(body))
//! string to sign    = TC3-HMAC-SHA256 \n TIMESTAMP \n DATE/SERVICE/tc3_request \n hex(sha256(canonical request))
//! signing key       = HMAC(HMAC(HMAC("TC3" + secret, DATE), SERVICE), "tc3_request")
//! ```

use api::error::StorageError;
use chrono::DateTime;
use hmac::{Hmac, Mac};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

/// Name of the signing scheme, first token of the `Authorization` header.
pub const SIGNING_ALGORITHM: &str = "TC3-HMAC-SHA256";

const SCOPE_TERMINATOR: &str = "tc3_request";

/// RFC 3986 unreserved characters are the only ones left unescaped.
const QUERY_ESCAPES: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'_').remove(b'.').remove(b'~');

/// Secret pair issued by the provider.
#[derive(Clone)]
pub struct Credentials {
	/// Public identifier of the key, sent in the clear.
	pub secret_id: String,
	/// Secret half, only ever used as HMAC key material.
	pub secret_key: String,
}

impl std::fmt::Debug for Credentials {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Credentials")
			.field("secret_id", &self.secret_id)
			.field("secret_key", &"<redacted>")
			.finish()
	}
}

/// The parts of a signature that end up in the `Authorization` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
	/// `DATE/SERVICE/tc3_request`.
	pub credential_scope: String,
	/// Sorted, lowercase, `;`-separated names of the signed headers.
	pub signed_headers: String,
	/// Lowercase hex HMAC-SHA256.
	pub signature: String,
}

impl Signature {
	/// Renders the `Authorization` header value.
	pub fn authorization(&self, secret_id: &str) -> String {
		format!(
			"{} Credential={}/{}, SignedHeaders={}, Signature={}",
			SIGNING_ALGORITHM, secret_id, self.credential_scope, self.signed_headers, self.signature
		)
	}
}

/// Percent-encodes a query component; unreserved characters are kept.
pub fn uri_encode(input: &str) -> String {
	utf8_percent_encode(input, QUERY_ESCAPES).to_string()
}

/// Encodes and sorts query parameters into their canonical form.
pub fn canonical_query(query: &[(String, String)]) -> String {
	let mut pairs: Vec<(String, String)> =
		query.iter().map(|(k, v)| (uri_encode(k), uri_encode(v))).collect();
	pairs.sort();
	pairs.iter().map(|(k, v)| format!("{}={}", k, v)).collect::<Vec<_>>().join("&")
}

/// Returns the canonical header block (each line `name:value\n`) and the signed header list.
///
/// Names and values are lowercased and trimmed, then sorted by name.
pub fn canonical_headers(headers: &[(String, String)]) -> (String, String) {
	let mut normalized: Vec<(String, String)> = headers
		.iter()
		.map(|(name, value)| (name.trim().to_lowercase(), value.trim().to_lowercase()))
		.collect();
	normalized.sort();

	let block = normalized.iter().map(|(name, value)| format!("{}:{}\n", name, value)).collect();
	let signed = normalized.iter().map(|(name, _)| name.as_str()).collect::<Vec<_>>().join(";");
	(block, signed)
}

/// Lowercase hex SHA-256 of `data`.
pub fn sha256_hex(data: &[u8]) -> String {
	hex::encode(Sha256::digest(data))
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<Vec<u8>, StorageError> {
	let mut mac = HmacSha256::new_from_slice(key)
		.map_err(|e| StorageError::InternalError(format!("Invalid HMAC key: {}", e)))?;
	mac.update(data);
	Ok(mac.finalize().into_bytes().to_vec())
}

/// Builds the canonical request string.
pub fn canonical_request(
	method: &str, path: &str, query: &[(String, String)], headers: &[(String, String)],
	body: &[u8],
) -> String {
	let (header_block, signed_headers) = canonical_headers(headers);
	format!(
		"{}\n{}\n{}\n{}\n{}\n{}",
		method.to_uppercase(),
		path,
		canonical_query(query),
		header_block,
		signed_headers,
		sha256_hex(body)
	)
}

/// Formats the UTC date of `timestamp` as used in the credential scope.
fn scope_date(timestamp: i64) -> Result<String, StorageError> {
	DateTime::from_timestamp(timestamp, 0)
		.map(|t| t.format("%Y-%m-%d").to_string())
		.ok_or_else(|| StorageError::InternalError(format!("Invalid signing timestamp {}", timestamp)))
}

/// Signs a request for `service` at `timestamp` (seconds since the UNIX epoch).
///
/// `headers` must be exactly the headers that will be transmitted and signed, including `host`.
pub fn compute_signature(
	credentials: &Credentials, service: &str, timestamp: i64, method: &str, path: &str,
	query: &[(String, String)], headers: &[(String, String)], body: &[u8],
) -> Result<Signature, StorageError> {
	let date = scope_date(timestamp)?;
	let credential_scope = format!("{}/{}/{}", date, service, SCOPE_TERMINATOR);
	let canonical = canonical_request(method, path, query, headers, body);
	let string_to_sign = format!(
		"{}\n{}\n{}\n{}",
		SIGNING_ALGORITHM,
		timestamp,
		credential_scope,
		sha256_hex(canonical.as_bytes())
	);

	let secret_date = hmac_sha256(format!("TC3{}", credentials.secret_key).as_bytes(), date.as_bytes())?;
	let secret_service = hmac_sha256(&secret_date, service.as_bytes())?;
	let secret_signing = hmac_sha256(&secret_service, SCOPE_TERMINATOR.as_bytes())?;
	let signature = hex::encode(hmac_sha256(&secret_signing, string_to_sign.as_bytes())?);

	Ok(Signature { credential_scope, signed_headers: canonical_headers(headers).1, signature })
}

/// A fully built request: the only thing the edge-KV backend transmits.
#[derive(Debug, Clone)]
pub struct SignedRequest {
	/// Upper-case HTTP method.
	pub method: String,
	/// Absolute URL, query already in canonical form.
	pub url: String,
	/// Every header to send, `Authorization` included.
	pub headers: Vec<(String, String)>,
	/// Request body.
	pub body: Vec<u8>,
}

impl SignedRequest {
	/// Signs and assembles a request.
	///
	/// `signed_headers` are signed and sent; `host` is added to them from `host`.
	/// `unsigned_headers` are sent without being covered by the signature.
	pub fn new(
		credentials: &Credentials, service: &str, timestamp: i64, method: &str, scheme: &str,
		host: &str, path: &str, query: &[(String, String)], signed_headers: &[(String, String)],
		unsigned_headers: &[(String, String)], body: Vec<u8>,
	) -> Result<Self, StorageError> {
		let mut headers: Vec<(String, String)> = Vec::with_capacity(signed_headers.len() + 1);
		headers.push(("Host".to_string(), host.to_string()));
		headers.extend(signed_headers.iter().cloned());

		let signature =
			compute_signature(credentials, service, timestamp, method, path, query, &headers, &body)?;

		let query_string = canonical_query(query);
		let url = if query_string.is_empty() {
			format!("{}://{}{}", scheme, host, path)
		} else {
			format!("{}://{}{}?{}", scheme, host, path, query_string)
		};

		headers.extend(unsigned_headers.iter().cloned());
		headers.push(("Authorization".to_string(), signature.authorization(&credentials.secret_id)));

		Ok(Self { method: method.to_uppercase(), url, headers, body })
	}

	/// Looks up a header by case-insensitive name.
	pub fn header(&self, name: &str) -> Option<&str> {
		self.headers.iter().find(|(k, _)| k.eq_ignore_ascii_case(name)).map(|(_, v)| v.as_str())
	}
}

/// Parses the `SignedHeaders` and `Signature` fields back out of an `Authorization` header.
pub fn parse_authorization(header: &str) -> Option<(String, String, String)> {
	let rest = header.strip_prefix(SIGNING_ALGORITHM)?.trim();
	let mut credential = None;
	let mut signed_headers = None;
	let mut signature = None;
	for field in rest.split(',') {
		let (name, value) = field.trim().split_once('=')?;
		match name {
			"Credential" => credential = Some(value.to_string()),
			"SignedHeaders" => signed_headers = Some(value.to_string()),
			"Signature" => signature = Some(value.to_string()),
			_ => {},
		}
	}
	Some((credential?, signed_headers?, signature?))
}
