use api::envelope::Envelope;
use api::error::StorageError;
use api::storage::{
	decode_value, present_value, validate_key, write_ack, Capabilities, PutOptions,
	StorageBackend, ValueType,
};
use async_trait::async_trait;
use log::debug;
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;

const FILE_EXTENSION: &str = ".json";

/// Longest escaped file name; keys escaping to more are stored under a digest instead, keeping
/// clear of the 255 byte file name limit once the temp-file suffix is added.
const MAX_ESCAPED_FILE_NAME: usize = 200;

/// Marks digest file names. Never produced by escaping, which encodes `~` as `%7E`.
const HASHED_FILE_PREFIX: &str = "~";

/// Characters kept as-is in file names. `_` is escaped because it stands in for `:`.
const FILE_NAME_ESCAPES: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'.').remove(b':');

/// Maps `project:1` to `project_1.json`, escaping everything that is not filesystem-safe.
///
/// Keys too long for that become `~<sha256>.json`, and the file holds `{"key", "value"}` so the
/// key can still be listed.
fn key_to_file_name(key: &str) -> String {
	let escaped = utf8_percent_encode(key, FILE_NAME_ESCAPES).to_string();
	let file_name = format!("{}{}", escaped.replace(':', "_"), FILE_EXTENSION);
	if file_name.len() <= MAX_ESCAPED_FILE_NAME {
		file_name
	} else {
		let digest = hex::encode(Sha256::digest(key.as_bytes()));
		format!("{}{}{}", HASHED_FILE_PREFIX, digest, FILE_EXTENSION)
	}
}

fn is_hashed_file_name(file_name: &str) -> bool {
	file_name.starts_with(HASHED_FILE_PREFIX)
}

/// Reverses [`key_to_file_name`] for escaped names. Returns `None` for digest names and for
/// files this backend did not write.
fn file_name_to_key(file_name: &str) -> Option<String> {
	if is_hashed_file_name(file_name) {
		return None;
	}
	let stem = file_name.strip_suffix(FILE_EXTENSION)?;
	let restored = stem.replace('_', ":");
	percent_decode_str(&restored).decode_utf8().ok().map(|key| key.into_owned())
}

enum LocalStore {
	Memory(Mutex<BTreeMap<String, Value>>),
	Files { dir: PathBuf, tmp_counter: AtomicU64 },
}

/// Local implementation of the storage contract, either in memory or one file per key.
///
/// The in-memory flavour loses everything on restart and is meant for development and tests.
/// The file-backed flavour keeps each key as a pretty-printed JSON file in one directory.
pub struct LocalBackend {
	store: LocalStore,
}

impl LocalBackend {
	/// Creates an in-memory instance.
	pub fn in_memory() -> Self {
		Self { store: LocalStore::Memory(Mutex::new(BTreeMap::new())) }
	}

	/// Creates an instance keeping one file per key in `dir`. The directory is created on the
	/// first write.
	pub fn file_backed(dir: impl Into<PathBuf>) -> Self {
		Self { store: LocalStore::Files { dir: dir.into(), tmp_counter: AtomicU64::new(0) } }
	}

	async fn get_value(
		&self, key: &str, value_type: ValueType,
	) -> Result<Option<Value>, StorageError> {
		validate_key(key)?;
		match &self.store {
			LocalStore::Memory(map) => {
				let guard = map.lock().await;
				Ok(guard.get(key).cloned().map(|value| present_value(value, value_type)))
			},
			LocalStore::Files { dir, .. } => {
				let file_name = key_to_file_name(key);
				let path = dir.join(&file_name);
				match tokio::fs::read_to_string(&path).await {
					Ok(raw) if is_hashed_file_name(&file_name) => {
						let (stored_key, value) = unwrap_hashed_record(&raw)?;
						Ok((stored_key == key).then(|| present_value(value, value_type)))
					},
					Ok(raw) => Ok(Some(decode_value(key, &raw, value_type))),
					Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
					Err(e) => Err(StorageError::InternalError(format!(
						"Failed to read {}: {}",
						path.display(),
						e
					))),
				}
			},
		}
	}

	async fn put_value(
		&self, key: &str, value: &Value, options: &PutOptions,
	) -> Result<Option<Value>, StorageError> {
		validate_key(key)?;
		if let Some(ttl) = options.expiration_ttl {
			debug!("Ignoring expiration TTL of {}s for key {}: not supported locally", ttl, key);
		}
		match &self.store {
			LocalStore::Memory(map) => {
				map.lock().await.insert(key.to_string(), value.clone());
			},
			LocalStore::Files { dir, tmp_counter } => {
				let file_name = key_to_file_name(key);
				let contents = if is_hashed_file_name(&file_name) {
					serde_json::to_string_pretty(&json!({ "key": key, "value": value }))?
				} else {
					serde_json::to_string_pretty(value)?
				};
				ensure_dir(dir).await?;
				let tmp_path = dir
					.join(format!("{}.{}.tmp", file_name, tmp_counter.fetch_add(1, Ordering::Relaxed)));
				tokio::fs::write(&tmp_path, contents).await?;
				tokio::fs::rename(&tmp_path, dir.join(&file_name)).await?;
			},
		}
		Ok(Some(write_ack(key)))
	}

	async fn delete_value(&self, key: &str) -> Result<Option<Value>, StorageError> {
		validate_key(key)?;
		match &self.store {
			LocalStore::Memory(map) => {
				map.lock().await.remove(key);
			},
			LocalStore::Files { dir, .. } => {
				match tokio::fs::remove_file(dir.join(key_to_file_name(key))).await {
					Ok(()) => {},
					Err(e) if e.kind() == ErrorKind::NotFound => {},
					Err(e) => return Err(e.into()),
				}
			},
		}
		Ok(Some(write_ack(key)))
	}

	async fn list_keys(&self, prefix: &str, limit: usize) -> Result<Vec<String>, StorageError> {
		match &self.store {
			LocalStore::Memory(map) => {
				let guard = map.lock().await;
				Ok(guard
					.range(prefix.to_string()..)
					.take_while(|(key, _)| key.starts_with(prefix))
					.take(limit)
					.map(|(key, _)| key.clone())
					.collect())
			},
			LocalStore::Files { dir, .. } => {
				let mut entries = match tokio::fs::read_dir(dir).await {
					Ok(entries) => entries,
					Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
					Err(e) => return Err(e.into()),
				};
				let mut keys = Vec::new();
				while let Some(entry) = entries.next_entry().await? {
					let file_name = entry.file_name();
					let Some(file_name) = file_name.to_str() else {
						continue;
					};
					let key = if is_hashed_file_name(file_name) {
						if !file_name.ends_with(FILE_EXTENSION) {
							continue;
						}
						let raw = tokio::fs::read_to_string(entry.path()).await?;
						Some(unwrap_hashed_record(&raw)?.0)
					} else {
						file_name_to_key(file_name)
					};
					if let Some(key) = key.filter(|key| key.starts_with(prefix)) {
						keys.push(key);
					}
				}
				keys.sort();
				keys.truncate(limit);
				Ok(keys)
			},
		}
	}
}

/// Splits a digest-named file into its key and value.
fn unwrap_hashed_record(raw: &str) -> Result<(String, Value), StorageError> {
	let mut record: Value = serde_json::from_str(raw)?;
	let key = match record.get("key").and_then(Value::as_str) {
		Some(key) => key.to_string(),
		None => {
			return Err(StorageError::InternalError(
				"Stored record under a digest file name has no key".to_string(),
			));
		},
	};
	Ok((key, record["value"].take()))
}

async fn ensure_dir(dir: &Path) -> Result<(), StorageError> {
	match tokio::fs::create_dir_all(dir).await {
		Ok(()) => Ok(()),
		Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(()),
		Err(e) => Err(StorageError::InternalError(format!(
			"Failed to create storage directory {}: {}",
			dir.display(),
			e
		))),
	}
}

#[async_trait]
impl StorageBackend for LocalBackend {
	fn name(&self) -> &'static str {
		match self.store {
			LocalStore::Memory(_) => "in-memory",
			LocalStore::Files { .. } => "local-file",
		}
	}

	fn capabilities(&self) -> Capabilities {
		Capabilities { list: true, ttl: false }
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

#[cfg(test)]
mod tests {
	use super::*;

	mod in_memory_suite {
		api::define_storage_backend_tests!(
			InMemoryStorageTest,
			crate::local_store::LocalBackend,
			crate::local_store::LocalBackend::in_memory()
		);
	}

	mod file_backed_suite {
		api::define_storage_backend_tests!(
			FileBackedStorageTest,
			crate::local_store::LocalBackend,
			crate::local_store::LocalBackend::file_backed(tempfile::tempdir().unwrap().keep())
		);
	}

	#[test]
	fn file_names_round_trip_to_keys() {
		assert_eq!(key_to_file_name("project:1"), "project_1.json");
		assert_eq!(key_to_file_name("projects:list"), "projects_list.json");
		for key in ["project:1", "user_admin", "a/b:c", "100%:done", "техника:1", "v1.2-rc"] {
			assert_eq!(file_name_to_key(&key_to_file_name(key)).as_deref(), Some(key));
		}
		assert_eq!(file_name_to_key("project_1.json.3.tmp"), None);
	}

	#[test]
	fn overlong_keys_get_digest_file_names() {
		let long_key = format!("project:{}", "a".repeat(300));
		let file_name = key_to_file_name(&long_key);
		assert!(file_name.starts_with(HASHED_FILE_PREFIX));
		assert_eq!(file_name.len(), HASHED_FILE_PREFIX.len() + 64 + FILE_EXTENSION.len());
		assert_eq!(file_name_to_key(&file_name), None);
		assert_eq!(key_to_file_name(&long_key), file_name);
		assert!(!is_hashed_file_name(&key_to_file_name("~tilde:1")));
	}

	#[tokio::test]
	async fn file_backend_accepts_every_valid_key_length() {
		let dir = tempfile::tempdir().unwrap();
		let store = LocalBackend::file_backed(dir.path());
		let ascii_key = format!("project:{}", "a".repeat(300));
		let wide_key = format!("timeline:{}", "э".repeat(250));
		assert!(wide_key.len() <= api::storage::MAX_KEY_LENGTH);

		for key in [&ascii_key, &wide_key] {
			let ack = store.put(key, &json!({"title": "Long"}), &PutOptions::default()).await;
			assert!(ack.success, "{:?}", ack.error);
			let read = store.get(key, ValueType::Json).await;
			assert_eq!(read, Envelope::ok(json!({"title": "Long"})));
		}
		assert_eq!(
			store.get(&ascii_key, ValueType::Text).await.data,
			Some(json!(r#"{"title":"Long"}"#))
		);

		store.put("project:1", &json!(1), &PutOptions::default()).await;
		let listed = store.list("project:", 100).await.data.unwrap();
		assert_eq!(listed, vec!["project:1".to_string(), ascii_key.clone()]);

		assert!(store.delete(&ascii_key).await.success);
		assert!(store.get(&ascii_key, ValueType::Json).await.data.is_none());
		assert_eq!(store.list("timeline:", 100).await.data, Some(vec![wide_key]));
	}

	#[tokio::test]
	async fn local_scenario() {
		let dir = tempfile::tempdir().unwrap();
		let store = LocalBackend::file_backed(dir.path().join("data"));

		let ack = store.put("project:1", &json!({"title": "Demo"}), &PutOptions::default()).await;
		assert!(ack.success);
		assert_eq!(ack.data, Some(json!({"key": "project:1"})));
		assert!(dir.path().join("data").join("project_1.json").exists());

		let read = store.get("project:1", ValueType::Json).await;
		assert_eq!(read, Envelope::ok(json!({"title": "Demo"})));

		let listed = store.list("project:", 100).await;
		assert_eq!(listed.data, Some(vec!["project:1".to_string()]));

		assert!(store.delete("project:1").await.success);
		let read = store.get("project:1", ValueType::Json).await;
		assert!(read.success);
		assert!(read.data.is_none());
	}

	#[tokio::test]
	async fn list_on_missing_directory_is_empty() {
		let dir = tempfile::tempdir().unwrap();
		let store = LocalBackend::file_backed(dir.path().join("never-created"));

		let listed = store.list("", 100).await;
		assert!(listed.success);
		assert_eq!(listed.data, Some(Vec::new()));
	}

	#[tokio::test]
	async fn foreign_non_json_file_is_returned_raw() {
		let dir = tempfile::tempdir().unwrap();
		std::fs::write(dir.path().join("note_legacy.json"), "plain words").unwrap();
		let store = LocalBackend::file_backed(dir.path());

		let read = store.get("note:legacy", ValueType::Json).await;
		assert_eq!(read, Envelope::ok(json!("plain words")));
	}

	#[tokio::test]
	async fn unreadable_entry_is_a_failure_not_a_miss() {
		let dir = tempfile::tempdir().unwrap();
		// A directory where the record file should be cannot be read as a file.
		std::fs::create_dir(dir.path().join("project_1.json")).unwrap();
		let store = LocalBackend::file_backed(dir.path());

		let read = store.get("project:1", ValueType::Json).await;
		assert!(!read.success);
		assert!(read.error.is_some());
	}

	#[tokio::test]
	async fn text_hint_returns_serialized_json() {
		let store = LocalBackend::in_memory();
		store.put("skill:1", &json!({"name": "Rust"}), &PutOptions::default()).await;

		let read = store.get("skill:1", ValueType::Text).await;
		assert_eq!(read.data, Some(json!(r#"{"name":"Rust"}"#)));
	}

	#[tokio::test]
	async fn ttl_is_ignored() {
		let store = LocalBackend::in_memory();
		assert!(!store.capabilities().ttl);

		let options = PutOptions { expiration_ttl: Some(1) };
		assert!(store.put("session:1", &json!("token"), &options).await.success);
		assert_eq!(store.get("session:1", ValueType::Json).await.data, Some(json!("token")));
	}
}
