use api::error::StorageError;
use api::storage::{validate_key, PutOptions, StorageBackend, ValueType};
use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// The content types of the portfolio.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ResourceKind {
	Project,
	Skill,
	Award,
	Timeline,
}

const KINDS: [ResourceKind; 4] =
	[ResourceKind::Project, ResourceKind::Skill, ResourceKind::Award, ResourceKind::Timeline];

const ID_FIELD: &str = "id";
const CREATED_AT_FIELD: &str = "createdAt";
const UPDATED_AT_FIELD: &str = "updatedAt";

impl ResourceKind {
	/// Resolves the collection segment of a route, e.g. `projects`.
	pub(crate) fn from_collection(segment: &str) -> Option<Self> {
		KINDS.into_iter().find(|kind| kind.collection() == segment)
	}

	pub(crate) fn collection(&self) -> &'static str {
		match self {
			ResourceKind::Project => "projects",
			ResourceKind::Skill => "skills",
			ResourceKind::Award => "awards",
			ResourceKind::Timeline => "timeline",
		}
	}

	fn record_prefix(&self) -> &'static str {
		match self {
			ResourceKind::Project => "project",
			ResourceKind::Skill => "skill",
			ResourceKind::Award => "award",
			ResourceKind::Timeline => "timeline",
		}
	}

	/// Key of the summary array, e.g. `projects:list`.
	pub(crate) fn list_key(&self) -> String {
		format!("{}:list", self.collection())
	}

	/// Key of one detail record, e.g. `project:1699999999000`.
	pub(crate) fn record_key(&self, id: &str) -> String {
		format!("{}:{}", self.record_prefix(), id)
	}

	/// Fields copied from a record into its list entry.
	fn summary_fields(&self) -> &'static [&'static str] {
		match self {
			ResourceKind::Project => &[
				ID_FIELD,
				"title",
				"description",
				"tags",
				"image",
				"featured",
				CREATED_AT_FIELD,
				UPDATED_AT_FIELD,
			],
			ResourceKind::Skill => {
				&[ID_FIELD, "name", "category", "level", "icon", CREATED_AT_FIELD, UPDATED_AT_FIELD]
			},
			ResourceKind::Award => {
				&[ID_FIELD, "title", "issuer", "date", "level", CREATED_AT_FIELD, UPDATED_AT_FIELD]
			},
			ResourceKind::Timeline => &[
				ID_FIELD,
				"title",
				"organization",
				"type",
				"startDate",
				"endDate",
				CREATED_AT_FIELD,
				UPDATED_AT_FIELD,
			],
		}
	}

	fn index(&self) -> usize {
		match self {
			ResourceKind::Project => 0,
			ResourceKind::Skill => 1,
			ResourceKind::Award => 2,
			ResourceKind::Timeline => 3,
		}
	}

	fn summarize(&self, record: &Map<String, Value>) -> Value {
		let summary: Map<String, Value> = self
			.summary_fields()
			.iter()
			.filter_map(|field| record.get(*field).map(|v| (field.to_string(), v.clone())))
			.collect();
		Value::Object(summary)
	}
}

/// CRUD over the `{type}:list` summary arrays and `{type}:{id}` detail records.
///
/// Every change to a list key happens under that kind's mutex, so within one process concurrent
/// writers of the same kind never overwrite each other's list entries.
pub(crate) struct ResourceStore {
	backend: Arc<dyn StorageBackend>,
	list_locks: [Mutex<()>; 4],
}

fn entry_id(entry: &Value) -> Option<&str> {
	entry.get(ID_FIELD).and_then(Value::as_str)
}

fn now() -> String {
	Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn into_object(body: Value) -> Result<Map<String, Value>, StorageError> {
	match body {
		Value::Object(fields) => Ok(fields),
		_ => Err(StorageError::InvalidRequestError("request body must be a JSON object".to_string())),
	}
}

impl ResourceStore {
	pub(crate) fn new(backend: Arc<dyn StorageBackend>) -> Self {
		Self {
			backend,
			list_locks: [Mutex::new(()), Mutex::new(()), Mutex::new(()), Mutex::new(())],
		}
	}

	async fn read(&self, key: &str) -> Result<Option<Value>, StorageError> {
		self.backend.get(key, ValueType::Json).await.into_result()
	}

	async fn write(&self, key: &str, value: &Value) -> Result<(), StorageError> {
		self.backend.put(key, value, &PutOptions::default()).await.into_result().map(|_| ())
	}

	/// Summary entries of `kind`; an absent list key is an empty collection.
	pub(crate) async fn list(&self, kind: ResourceKind) -> Result<Vec<Value>, StorageError> {
		match self.read(&kind.list_key()).await? {
			None | Some(Value::Null) => Ok(Vec::new()),
			Some(Value::Array(entries)) => Ok(entries),
			Some(_) => Err(StorageError::InternalError(format!(
				"{} does not hold an array",
				kind.list_key()
			))),
		}
	}

	/// The full record; `update` and `delete` go through here, so an id that cannot form a valid
	/// key is rejected before any write.
	pub(crate) async fn get(&self, kind: ResourceKind, id: &str) -> Result<Value, StorageError> {
		let key = kind.record_key(id);
		validate_key(&key)?;
		self.read(&key).await?.ok_or(StorageError::NoSuchKeyError(key))
	}

	/// Stores a new record under a fresh millisecond-timestamp id and appends its summary.
	pub(crate) async fn create(&self, kind: ResourceKind, body: Value) -> Result<Value, StorageError> {
		let mut record = into_object(body)?;
		let _guard = self.list_locks[kind.index()].lock().await;
		let mut entries = self.list(kind).await?;

		let mut id = Utc::now().timestamp_millis();
		while entries.iter().any(|entry| entry_id(entry) == Some(id.to_string().as_str())) {
			id += 1;
		}
		let id = id.to_string();
		let timestamp = now();
		record.insert(ID_FIELD.to_string(), Value::String(id.clone()));
		record.insert(CREATED_AT_FIELD.to_string(), Value::String(timestamp.clone()));
		record.insert(UPDATED_AT_FIELD.to_string(), Value::String(timestamp));

		let summary = kind.summarize(&record);
		let record = Value::Object(record);
		self.write(&kind.record_key(&id), &record).await?;
		entries.push(summary);
		self.write(&kind.list_key(), &Value::Array(entries)).await?;

		info!("Created {}", kind.record_key(&id));
		Ok(record)
	}

	/// Shallow-merges `patch` into an existing record and refreshes its summary.
	pub(crate) async fn update(
		&self, kind: ResourceKind, id: &str, patch: Value,
	) -> Result<Value, StorageError> {
		let patch = into_object(patch)?;
		let _guard = self.list_locks[kind.index()].lock().await;
		let mut record = into_object(self.get(kind, id).await?).map_err(|_| {
			StorageError::InternalError(format!("{} does not hold an object", kind.record_key(id)))
		})?;

		for (field, value) in patch {
			if field != ID_FIELD && field != CREATED_AT_FIELD {
				record.insert(field, value);
			}
		}
		record.insert(UPDATED_AT_FIELD.to_string(), Value::String(now()));

		let summary = kind.summarize(&record);
		let record = Value::Object(record);
		self.write(&kind.record_key(id), &record).await?;

		let mut entries = self.list(kind).await?;
		match entries.iter_mut().find(|entry| entry_id(entry) == Some(id)) {
			Some(entry) => *entry = summary,
			None => {
				debug!("{} was missing from {}, re-adding it", id, kind.list_key());
				entries.push(summary);
			},
		}
		self.write(&kind.list_key(), &Value::Array(entries)).await?;

		info!("Updated {}", kind.record_key(id));
		Ok(record)
	}

	/// Deletes the record and its summary entry.
	pub(crate) async fn delete(&self, kind: ResourceKind, id: &str) -> Result<(), StorageError> {
		let _guard = self.list_locks[kind.index()].lock().await;
		self.get(kind, id).await?;
		self.backend.delete(&kind.record_key(id)).await.into_result()?;

		let mut entries = self.list(kind).await?;
		entries.retain(|entry| entry_id(entry) != Some(id));
		self.write(&kind.list_key(), &Value::Array(entries)).await?;

		info!("Deleted {}", kind.record_key(id));
		Ok(())
	}
}
