use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::{Bytes, Incoming};
use hyper::header::CONTENT_TYPE;
use hyper::service::Service;
use hyper::{Method, Request, Response, StatusCode};
use percent_encoding::percent_decode_str;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{debug, error, info_span, warn, Instrument};
use tracing_opentelemetry::OpenTelemetrySpanExt;
use url::form_urlencoded;

use api::auth::Authorizer;
use api::envelope::Envelope;
use api::error::StorageError;
use api::storage::{
	validate_key, BatchItem, PutOptions, StorageBackend, ValueType, DEFAULT_LIST_LIMIT,
};

use crate::resource_store::{ResourceKind, ResourceStore};
use crate::telemetry::extract_context;

/// Upper bound on request bodies.
const MAX_BODY_SIZE: usize = 1024 * 1024;
/// Key cap when a backup without explicit keys lists the whole store.
const BACKUP_LIST_LIMIT: usize = 10_000;

const INTERNAL_ERROR_MESSAGE: &str = "Internal server error";
const NOT_FOUND_MESSAGE: &str = "Not found";

type HttpResponse = Response<Full<Bytes>>;

#[derive(Clone)]
pub(crate) struct FolioService {
	backend: Arc<dyn StorageBackend>,
	resources: Arc<ResourceStore>,
	authorizer: Arc<dyn Authorizer>,
}

#[derive(Deserialize, Default)]
struct BackupRequest {
	#[serde(default)]
	keys: Option<Vec<String>>,
}

impl FolioService {
	pub(crate) fn new(backend: Arc<dyn StorageBackend>, authorizer: Arc<dyn Authorizer>) -> Self {
		let resources = Arc::new(ResourceStore::new(Arc::clone(&backend)));
		Self { backend, resources, authorizer }
	}

	/// Dispatches one request whose body has already been read.
	pub(crate) async fn route(
		&self, method: &Method, path: &str, query: &str, headers_map: &HashMap<String, String>,
		body: Bytes,
	) -> HttpResponse {
		let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
		let result = match segments.as_slice() {
			["health"] if method == Method::GET => Ok(self.health()),
			["api", "storage", rest @ ..] => match self.authorize(headers_map).await {
				Ok(()) => self.handle_storage(method, rest, query, body).await,
				Err(e) => Err(e),
			},
			["api", collection, rest @ ..] => match ResourceKind::from_collection(collection) {
				Some(kind) => self.handle_resource(method, kind, rest, headers_map, body).await,
				None => Ok(invalid_path()),
			},
			_ => Ok(invalid_path()),
		};
		result.unwrap_or_else(error_response)
	}

	async fn authorize(&self, headers_map: &HashMap<String, String>) -> Result<(), StorageError> {
		let auth_response = self.authorizer.verify(headers_map).await?;
		debug!("Authorized request of {}", auth_response.user_token);
		Ok(())
	}

	fn health(&self) -> HttpResponse {
		json_response(
			StatusCode::OK,
			&Envelope::ok(json!({
				"status": "ok",
				"backend": self.backend.name(),
				"capabilities": self.backend.capabilities(),
			})),
		)
	}

	async fn handle_resource(
		&self, method: &Method, kind: ResourceKind, rest: &[&str],
		headers_map: &HashMap<String, String>, body: Bytes,
	) -> Result<HttpResponse, StorageError> {
		match (method, rest) {
			(&Method::GET, []) => {
				let entries = self.resources.list(kind).await?;
				Ok(json_response(StatusCode::OK, &Envelope::ok(entries)))
			},
			(&Method::POST, []) => {
				self.authorize(headers_map).await?;
				let created = self.resources.create(kind, parse_body(&body)?).await?;
				Ok(json_response(StatusCode::CREATED, &Envelope::ok(created)))
			},
			(&Method::GET, [id]) => {
				let record = self.resources.get(kind, id).await?;
				Ok(json_response(StatusCode::OK, &Envelope::ok(record)))
			},
			(&Method::PUT, [id]) => {
				self.authorize(headers_map).await?;
				let updated = self.resources.update(kind, id, parse_body(&body)?).await?;
				Ok(json_response(StatusCode::OK, &Envelope::ok(updated)))
			},
			(&Method::DELETE, [id]) => {
				self.authorize(headers_map).await?;
				self.resources.delete(kind, id).await?;
				Ok(json_response(StatusCode::OK, &Envelope::ok(json!({ "id": id }))))
			},
			(_, []) | (_, [_]) => Ok(method_not_allowed()),
			_ => Ok(invalid_path()),
		}
	}

	async fn handle_storage(
		&self, method: &Method, rest: &[&str], query: &str, body: Bytes,
	) -> Result<HttpResponse, StorageError> {
		match (method, rest) {
			(&Method::GET, ["keys"]) => {
				let prefix = query_param(query, "prefix").unwrap_or_default();
				let limit = match query_param(query, "limit") {
					Some(limit) => limit.parse::<usize>().map_err(|_| {
						StorageError::InvalidRequestError(format!("invalid limit {:?}", limit))
					})?,
					None => DEFAULT_LIST_LIMIT,
				};
				let listed = checked(self.backend.list(&prefix, limit).await)?;
				Ok(json_response(StatusCode::OK, &listed))
			},
			(_, ["keys", key @ ..]) if !key.is_empty() => {
				let key = decode_key(&key.join("/"))?;
				validate_key(&key)?;
				match *method {
					Method::GET => {
						let value_type = ValueType::from_hint(query_param(query, "type").as_deref());
						let read = checked(self.backend.get(&key, value_type).await)?;
						Ok(json_response(StatusCode::OK, &read))
					},
					Method::PUT => {
						let expiration_ttl = match query_param(query, "ttl") {
							Some(ttl) => Some(ttl.parse::<u64>().map_err(|_| {
								StorageError::InvalidRequestError(format!("invalid ttl {:?}", ttl))
							})?),
							None => None,
						};
						let value = parse_body(&body)?;
						let written = checked(
							self.backend.put(&key, &value, &PutOptions { expiration_ttl }).await,
						)?;
						Ok(json_response(StatusCode::OK, &written))
					},
					Method::DELETE => {
						let deleted = checked(self.backend.delete(&key).await)?;
						Ok(json_response(StatusCode::OK, &deleted))
					},
					_ => Ok(method_not_allowed()),
				}
			},
			(&Method::POST, ["batch"]) => {
				let items = match parse_body(&body)? {
					Value::Array(items) => items.into_iter().map(batch_item).collect(),
					_ => {
						return Err(StorageError::InvalidRequestError(
							"batch body must be a JSON array".to_string(),
						));
					},
				};
				let results = self.backend.batch_put(items).await;
				let failed = results.iter().filter(|r| !r.is_success()).count();
				if failed > 0 {
					warn!("{} of {} batch items failed", failed, results.len());
				}
				Ok(json_response(StatusCode::OK, &Envelope::ok(results)))
			},
			(&Method::POST, ["backup"]) => {
				let request: BackupRequest = if body.is_empty() {
					BackupRequest::default()
				} else {
					serde_json::from_slice(&body).map_err(|e| {
						StorageError::InvalidRequestError(format!("invalid backup request: {}", e))
					})?
				};
				let (keys, truncated) = match request.keys {
					Some(keys) => (keys, false),
					None => {
						let keys = self.all_keys().await?;
						let truncated = keys.len() >= BACKUP_LIST_LIMIT;
						(keys, truncated)
					},
				};
				let snapshot = self.backend.backup(&keys).await;
				let mut envelope = Envelope::ok(snapshot);
				if truncated {
					warn!("Backup stopped at {} keys, the store may hold more", BACKUP_LIST_LIMIT);
					envelope.message = Some(format!(
						"backup truncated at {} keys, pass explicit keys for the rest",
						BACKUP_LIST_LIMIT
					));
				}
				Ok(json_response(StatusCode::OK, &envelope))
			},
			(&Method::POST, ["restore"]) => {
				let snapshot: BTreeMap<String, Value> = serde_json::from_slice(&body).map_err(|e| {
					StorageError::InvalidRequestError(format!("restore body must be a JSON object: {}", e))
				})?;
				let results = self.backend.restore(snapshot).await;
				Ok(json_response(StatusCode::OK, &Envelope::ok(results)))
			},
			_ => Ok(invalid_path()),
		}
	}

	async fn all_keys(&self) -> Result<Vec<String>, StorageError> {
		if !self.backend.capabilities().list {
			return Err(StorageError::InvalidRequestError(format!(
				"the {} backend cannot list its keys, pass the keys to back up",
				self.backend.name()
			)));
		}
		Ok(checked(self.backend.list("", BACKUP_LIST_LIMIT).await)?.data.unwrap_or_default())
	}
}

impl Service<Request<Incoming>> for FolioService {
	type Response = HttpResponse;
	type Error = hyper::Error;
	type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

	fn call(&self, req: Request<Incoming>) -> Self::Future {
		let service = self.clone();

		Box::pin(async move {
			let (parts, body) = req.into_parts();
			let headers_map = parts
				.headers
				.iter()
				.map(|(k, v)| (k.as_str().to_string(), v.to_str().unwrap_or_default().to_string()))
				.collect::<HashMap<String, String>>();

			let span = info_span!("request", method = %parts.method, path = %parts.uri.path());
			let _ = span.set_parent(extract_context(&headers_map));

			async move {
				let bytes = match Limited::new(body, MAX_BODY_SIZE).collect().await {
					Ok(collected) => collected.to_bytes(),
					Err(e) if e.is::<LengthLimitError>() => {
						return Ok(message_response(
							StatusCode::PAYLOAD_TOO_LARGE,
							"Request body too large",
						));
					},
					Err(e) => {
						warn!("Failed to read request body: {}", e);
						return Ok(message_response(StatusCode::BAD_REQUEST, "Error reading request body"));
					},
				};
				let query = parts.uri.query().unwrap_or_default();
				Ok::<_, hyper::Error>(
					service.route(&parts.method, parts.uri.path(), query, &headers_map, bytes).await,
				)
			}
			.instrument(span)
			.await
		})
	}
}

/// Turns a failed backend envelope into an error, keeping the diagnostic for the log only.
fn checked<T>(envelope: Envelope<T>) -> Result<Envelope<T>, StorageError> {
	if envelope.success {
		Ok(envelope)
	} else {
		Err(StorageError::InternalError(envelope.error.unwrap_or_default()))
	}
}

/// A malformed item becomes an item with an empty key, so that it fails on its own.
fn batch_item(item: Value) -> BatchItem {
	serde_json::from_value(item).unwrap_or_else(|e| {
		debug!("Malformed batch item: {}", e);
		BatchItem { key: String::new(), value: Value::Null, options: PutOptions::default() }
	})
}

fn parse_body(body: &Bytes) -> Result<Value, StorageError> {
	serde_json::from_slice(body)
		.map_err(|e| StorageError::InvalidRequestError(format!("request body is not valid JSON: {}", e)))
}

fn query_param(query: &str, name: &str) -> Option<String> {
	form_urlencoded::parse(query.as_bytes())
		.find(|(key, _)| key == name)
		.map(|(_, value)| value.into_owned())
}

fn decode_key(raw: &str) -> Result<String, StorageError> {
	percent_decode_str(raw)
		.decode_utf8()
		.map(|key| key.into_owned())
		.map_err(|e| StorageError::InvalidRequestError(format!("key is not valid UTF-8: {}", e)))
}

fn json_response<T: Serialize>(status: StatusCode, body: &T) -> HttpResponse {
	match serde_json::to_vec(body) {
		Ok(bytes) => Response::builder()
			.status(status)
			.header(CONTENT_TYPE, "application/json")
			.body(Full::new(Bytes::from(bytes)))
			// unwrap safety: body only errors when previous chained calls failed.
			.unwrap(),
		Err(e) => {
			error!("Failed to serialize response: {}", e);
			message_response(StatusCode::INTERNAL_SERVER_ERROR, INTERNAL_ERROR_MESSAGE)
		},
	}
}

fn message_response(status: StatusCode, message: &str) -> HttpResponse {
	let envelope: Envelope<Value> = Envelope::failure(message);
	let bytes = serde_json::to_vec(&envelope).unwrap_or_default();
	Response::builder()
		.status(status)
		.header(CONTENT_TYPE, "application/json")
		.body(Full::new(Bytes::from(bytes)))
		// unwrap safety: body only errors when previous chained calls failed.
		.unwrap()
}

fn invalid_path() -> HttpResponse {
	message_response(StatusCode::NOT_FOUND, "Invalid request path.")
}

fn method_not_allowed() -> HttpResponse {
	message_response(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed.")
}

fn error_response(e: StorageError) -> HttpResponse {
	match e {
		StorageError::NoSuchKeyError(key) => {
			debug!("Not found: {}", key);
			message_response(StatusCode::NOT_FOUND, NOT_FOUND_MESSAGE)
		},
		StorageError::InvalidRequestError(msg) => message_response(StatusCode::BAD_REQUEST, &msg),
		StorageError::AuthError(msg) => message_response(StatusCode::UNAUTHORIZED, &msg),
		e => {
			error!("Request failed: {}", e);
			message_response(StatusCode::INTERNAL_SERVER_ERROR, INTERNAL_ERROR_MESSAGE)
		},
	}
}
