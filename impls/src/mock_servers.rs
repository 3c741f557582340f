//! In-process stand-ins for the remote services the HTTP backends talk to.

use crate::signing::{compute_signature, parse_authorization, Credentials};
use crate::signed_edge_kv_store::EDGE_KV_SERVICE;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use reqwest::Url;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;

pub(crate) const MOCK_SECRET_ID: &str = "AKIDMOCK";
pub(crate) const MOCK_SECRET_KEY: &str = "mock-secret";

/// Number of keys per `ListKv` page.
const LIST_PAGE_SIZE: usize = 2;

type MockResponse = Response<Full<Bytes>>;

async fn serve<F, Fut>(handler: F) -> String
where
	F: Fn(Request<Incoming>) -> Fut + Clone + Send + Sync + 'static,
	Fut: Future<Output = Result<MockResponse, Infallible>> + Send + 'static,
{
	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();
	tokio::spawn(async move {
		while let Ok((stream, _)) = listener.accept().await {
			let handler = handler.clone();
			tokio::spawn(async move {
				let _ = http1::Builder::new()
					.serve_connection(TokioIo::new(stream), service_fn(handler))
					.await;
			});
		}
	});
	format!("http://{}", addr)
}

fn respond(status: StatusCode, content_type: &str, body: String) -> MockResponse {
	Response::builder()
		.status(status)
		.header("Content-Type", content_type)
		.body(Full::new(Bytes::from(body)))
		.unwrap()
}

/// Edge-KV provider that verifies request signatures the way the real one does.
pub(crate) struct MockEdgeKv {
	pub(crate) url: String,
	pub(crate) state: Arc<EdgeKvState>,
}

pub(crate) struct EdgeKvState {
	credentials: Credentials,
	records: Mutex<BTreeMap<String, String>>,
	last_ttl: Mutex<Option<u64>>,
	requests: AtomicUsize,
	rejections: Mutex<BTreeMap<String, String>>,
	not_found_page: AtomicBool,
}

impl EdgeKvState {
	pub(crate) fn request_count(&self) -> usize {
		self.requests.load(Ordering::SeqCst)
	}

	pub(crate) fn last_ttl(&self) -> Option<u64> {
		*self.last_ttl.lock().unwrap()
	}

	/// Answers every `action` request with the provider error `code`.
	pub(crate) fn reject_action(&self, action: &str, code: &str) {
		self.rejections.lock().unwrap().insert(action.to_string(), code.to_string());
	}

	/// Answers every request with a `404` HTML page, as a wrong endpoint would.
	pub(crate) fn serve_not_found_page(&self, enabled: bool) {
		self.not_found_page.store(enabled, Ordering::SeqCst);
	}
}

impl MockEdgeKv {
	pub(crate) async fn start() -> Self {
		let state = Arc::new(EdgeKvState {
			credentials: Credentials {
				secret_id: MOCK_SECRET_ID.to_string(),
				secret_key: MOCK_SECRET_KEY.to_string(),
			},
			records: Mutex::new(BTreeMap::new()),
			last_ttl: Mutex::new(None),
			requests: AtomicUsize::new(0),
			rejections: Mutex::new(BTreeMap::new()),
			not_found_page: AtomicBool::new(false),
		});
		let handler_state = Arc::clone(&state);
		let url = serve(move |req| handle_edge_kv(Arc::clone(&handler_state), req)).await;
		Self { url, state }
	}
}

fn edge_kv_reply(response: Value) -> MockResponse {
	respond(StatusCode::OK, "application/json", json!({ "Response": response }).to_string())
}

fn edge_kv_error(code: &str, message: &str) -> MockResponse {
	edge_kv_reply(json!({ "Error": { "Code": code, "Message": message }, "RequestId": "mock" }))
}

async fn handle_edge_kv(
	state: Arc<EdgeKvState>, req: Request<Incoming>,
) -> Result<MockResponse, Infallible> {
	state.requests.fetch_add(1, Ordering::SeqCst);
	if state.not_found_page.load(Ordering::SeqCst) {
		let page = "<html><body>404 Not Found</body></html>".to_string();
		return Ok(respond(StatusCode::NOT_FOUND, "text/html", page));
	}
	let (parts, body) = req.into_parts();
	let body = body.collect().await.map(|c| c.to_bytes()).unwrap_or_default();

	let header = |name: &str| {
		parts.headers.get(name).and_then(|v| v.to_str().ok()).map(str::to_string)
	};
	let Some((_, signed_names, signature)) =
		header("authorization").as_deref().and_then(parse_authorization)
	else {
		return Ok(edge_kv_error("AuthFailure.SignatureFailure", "missing authorization"));
	};
	let Some(timestamp) = header("x-tc-timestamp").and_then(|t| t.parse::<i64>().ok()) else {
		return Ok(edge_kv_error("AuthFailure.InvalidAuthorization", "missing timestamp"));
	};
	let signed_headers: Vec<(String, String)> = signed_names
		.split(';')
		.map(|name| (name.to_string(), header(name).unwrap_or_default()))
		.collect();
	let expected = compute_signature(
		&state.credentials,
		EDGE_KV_SERVICE,
		timestamp,
		parts.method.as_str(),
		parts.uri.path(),
		&[],
		&signed_headers,
		&body,
	);
	if expected.map(|s| s.signature) != Ok(signature) {
		return Ok(edge_kv_error("AuthFailure.SignatureFailure", "signature mismatch"));
	}

	let payload: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
	let key = payload["Key"].as_str().unwrap_or_default().to_string();
	let action = header("x-tc-action").unwrap_or_default();
	if let Some(code) = state.rejections.lock().unwrap().get(&action) {
		return Ok(edge_kv_error(code, "rejected"));
	}
	let mut records = state.records.lock().unwrap();

	let reply = match action.as_str() {
		"PutKv" => {
			records.insert(key, payload["Value"].as_str().unwrap_or_default().to_string());
			*state.last_ttl.lock().unwrap() = payload["ExpirationTtl"].as_u64();
			edge_kv_reply(json!({ "RequestId": "mock" }))
		},
		"GetKv" => match records.get(&key) {
			Some(value) => edge_kv_reply(json!({ "Value": value, "RequestId": "mock" })),
			None => edge_kv_error("ResourceNotFound.KeyNotFound", "key does not exist"),
		},
		"DeleteKv" => match records.remove(&key) {
			Some(_) => edge_kv_reply(json!({ "RequestId": "mock" })),
			None => edge_kv_error("ResourceNotFound.KeyNotFound", "key does not exist"),
		},
		"ListKv" => {
			let prefix = payload["Prefix"].as_str().unwrap_or_default();
			let limit = payload["Limit"].as_u64().unwrap_or(100) as usize;
			let offset: usize =
				payload["Cursor"].as_str().and_then(|c| c.parse().ok()).unwrap_or_default();
			let matching: Vec<&String> = records.keys().filter(|k| k.starts_with(prefix)).collect();
			let page: Vec<&String> =
				matching.iter().skip(offset).take(limit.min(LIST_PAGE_SIZE)).copied().collect();
			let next = offset + page.len();
			let cursor = if next < matching.len() { Value::from(next.to_string()) } else { Value::Null };
			edge_kv_reply(json!({ "Keys": page, "Cursor": cursor, "RequestId": "mock" }))
		},
		_ => edge_kv_error("InvalidAction", "unknown action"),
	};
	Ok(reply)
}

/// GET-only proxy function fronting a string store.
pub(crate) struct MockProxy {
	pub(crate) url: String,
	pub(crate) state: Arc<ProxyState>,
}

pub(crate) struct ProxyState {
	records: Mutex<BTreeMap<String, String>>,
	requests: AtomicUsize,
	failures_remaining: AtomicUsize,
	html: AtomicBool,
	refuse: AtomicBool,
}

impl ProxyState {
	pub(crate) fn request_count(&self) -> usize {
		self.requests.load(Ordering::SeqCst)
	}

	/// Answers the next `count` requests with `503`.
	pub(crate) fn fail_next(&self, count: usize) {
		self.failures_remaining.store(count, Ordering::SeqCst);
	}

	/// Answers every request with an HTML error page.
	pub(crate) fn serve_html(&self, enabled: bool) {
		self.html.store(enabled, Ordering::SeqCst);
	}

	/// Answers every request with a well-formed `{"success": false}` envelope.
	pub(crate) fn refuse_requests(&self, enabled: bool) {
		self.refuse.store(enabled, Ordering::SeqCst);
	}

	pub(crate) fn raw(&self, key: &str) -> Option<String> {
		self.records.lock().unwrap().get(key).cloned()
	}
}

impl MockProxy {
	pub(crate) async fn start() -> Self {
		let state = Arc::new(ProxyState {
			records: Mutex::new(BTreeMap::new()),
			requests: AtomicUsize::new(0),
			failures_remaining: AtomicUsize::new(0),
			html: AtomicBool::new(false),
			refuse: AtomicBool::new(false),
		});
		let handler_state = Arc::clone(&state);
		let url = serve(move |req| handle_proxy(Arc::clone(&handler_state), req)).await;
		Self { url: format!("{}/kv", url), state }
	}
}

fn proxy_reply(envelope: Value) -> MockResponse {
	respond(StatusCode::OK, "application/json; charset=utf-8", envelope.to_string())
}

async fn handle_proxy(
	state: Arc<ProxyState>, req: Request<Incoming>,
) -> Result<MockResponse, Infallible> {
	state.requests.fetch_add(1, Ordering::SeqCst);

	let remaining = state.failures_remaining.load(Ordering::SeqCst);
	if remaining > 0 {
		state.failures_remaining.store(remaining - 1, Ordering::SeqCst);
		return Ok(respond(
			StatusCode::SERVICE_UNAVAILABLE,
			"text/plain",
			"upstream unavailable".to_string(),
		));
	}
	if state.html.load(Ordering::SeqCst) {
		let page = format!("<html><body>{}</body></html>", "Bad gateway. ".repeat(50));
		return Ok(respond(StatusCode::OK, "text/html; charset=utf-8", page));
	}
	if state.refuse.load(Ordering::SeqCst) {
		return Ok(proxy_reply(json!({ "success": false, "error": "quota exceeded" })));
	}

	let url = match Url::parse(&format!("http://mock{}", req.uri())) {
		Ok(url) => url,
		Err(_) => return Ok(proxy_reply(json!({ "success": false, "error": "bad uri" }))),
	};
	let params: BTreeMap<String, String> = url.query_pairs().into_owned().collect();
	let key = params.get("key").cloned().unwrap_or_default();
	let mut records = state.records.lock().unwrap();

	let envelope = match params.get("action").map(String::as_str) {
		Some("get") => match records.get(&key) {
			None => json!({ "success": true, "data": null }),
			Some(raw) => {
				let parsed = serde_json::from_str::<Value>(raw);
				let data = match (params.get("type").map(String::as_str), parsed) {
					(Some("text"), Ok(Value::String(s))) => Value::String(s),
					(Some("text"), _) => Value::String(raw.clone()),
					(_, Ok(value)) => value,
					(_, Err(_)) => Value::String(raw.clone()),
				};
				json!({ "success": true, "data": data })
			},
		},
		Some("put") => match params.get("value") {
			Some(value) => {
				records.insert(key.clone(), value.clone());
				json!({ "success": true, "data": { "key": key } })
			},
			None => json!({ "success": false, "error": "missing value" }),
		},
		Some("delete") => {
			records.remove(&key);
			json!({ "success": true, "data": { "key": key } })
		},
		_ => json!({ "success": false, "error": "unknown action" }),
	};
	Ok(proxy_reply(envelope))
}
