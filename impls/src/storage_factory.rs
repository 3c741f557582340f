use crate::local_store::LocalBackend;
use crate::proxied_kv_store::{ProxiedKvBackend, ProxyConfig, DEFAULT_PROXY_MAX_ATTEMPTS};
use crate::signed_edge_kv_store::{
	EdgeKvConfig, SignedEdgeKvBackend, DEFAULT_EDGE_KV_ENDPOINT, DEFAULT_EDGE_KV_NAMESPACE,
	DEFAULT_EDGE_KV_REGION,
};
use crate::signing::Credentials;
use api::error::StorageError;
use api::storage::StorageBackend;
use log::{info, warn};
use std::path::PathBuf;
use std::sync::Arc;

/// Directory of the file-backed local store when none is configured.
pub const DEFAULT_DATA_DIR: &str = "./data";

/// Which backend the process runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StorageMode {
	/// One file per key under the data directory.
	#[default]
	Local,
	/// A map that lives as long as the process.
	InMemory,
	/// Signed requests straight to the edge-KV provider.
	Direct,
	/// `GET` requests to a proxy function.
	Proxy,
}

impl StorageMode {
	/// Parses a mode setting. Unknown values fall back to [`StorageMode::Local`].
	pub fn parse(mode: &str) -> Self {
		match mode.trim().to_ascii_lowercase().as_str() {
			"memory" | "local" => StorageMode::Local,
			"in-memory" => StorageMode::InMemory,
			"direct" => StorageMode::Direct,
			"proxy" => StorageMode::Proxy,
			other => {
				warn!("Unknown storage mode {:?}, falling back to local storage", other);
				StorageMode::Local
			},
		}
	}
}

/// Edge-KV settings; the credentials are only required in [`StorageMode::Direct`].
#[derive(Debug, Clone)]
pub struct EdgeKvSettings {
	/// Base URL of the provider API.
	pub endpoint: String,
	/// Region header value.
	pub region: String,
	/// KV namespace.
	pub namespace: String,
	/// Secret id of the signing credentials.
	pub secret_id: Option<String>,
	/// Secret key of the signing credentials.
	pub secret_key: Option<String>,
}

impl Default for EdgeKvSettings {
	fn default() -> Self {
		Self {
			endpoint: DEFAULT_EDGE_KV_ENDPOINT.to_string(),
			region: DEFAULT_EDGE_KV_REGION.to_string(),
			namespace: DEFAULT_EDGE_KV_NAMESPACE.to_string(),
			secret_id: None,
			secret_key: None,
		}
	}
}

/// Everything needed to build any of the backends.
#[derive(Debug, Clone)]
pub struct StorageConfig {
	/// Selected backend.
	pub mode: StorageMode,
	/// Directory of the file-backed local store.
	pub data_dir: PathBuf,
	/// Settings of the direct edge-KV backend.
	pub edge_kv: EdgeKvSettings,
	/// URL of the proxy function.
	pub proxy_url: Option<String>,
	/// Attempts per proxy request, first try included.
	pub proxy_max_attempts: u32,
}

impl Default for StorageConfig {
	fn default() -> Self {
		Self {
			mode: StorageMode::default(),
			data_dir: PathBuf::from(DEFAULT_DATA_DIR),
			edge_kv: EdgeKvSettings::default(),
			proxy_url: None,
			proxy_max_attempts: DEFAULT_PROXY_MAX_ATTEMPTS,
		}
	}
}

/// Builds the one backend the process uses for its whole lifetime.
pub fn create_storage_backend(
	config: &StorageConfig,
) -> Result<Arc<dyn StorageBackend>, StorageError> {
	let backend: Arc<dyn StorageBackend> = match config.mode {
		StorageMode::Local => Arc::new(LocalBackend::file_backed(config.data_dir.clone())),
		StorageMode::InMemory => Arc::new(LocalBackend::in_memory()),
		StorageMode::Direct => {
			let settings = &config.edge_kv;
			let (secret_id, secret_key) = match (&settings.secret_id, &settings.secret_key) {
				(Some(id), Some(key)) if !id.is_empty() && !key.is_empty() => (id.clone(), key.clone()),
				_ => {
					return Err(StorageError::ConfigurationError(
						"direct storage mode requires an edge KV secret id and secret key".to_string(),
					));
				},
			};
			let mut edge_config = EdgeKvConfig::new(Credentials { secret_id, secret_key });
			edge_config.endpoint = settings.endpoint.clone();
			edge_config.region = settings.region.clone();
			edge_config.namespace = settings.namespace.clone();
			Arc::new(SignedEdgeKvBackend::new(edge_config)?)
		},
		StorageMode::Proxy => {
			let url = config.proxy_url.as_deref().filter(|url| !url.is_empty()).ok_or_else(|| {
				StorageError::ConfigurationError("proxy storage mode requires a proxy URL".to_string())
			})?;
			let mut proxy_config = ProxyConfig::new(url);
			proxy_config.max_attempts = config.proxy_max_attempts;
			Arc::new(ProxiedKvBackend::new(proxy_config)?)
		},
	};
	info!("Using the {} storage backend", backend.name());
	Ok(backend)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_modes() {
		assert_eq!(StorageMode::parse("memory"), StorageMode::Local);
		assert_eq!(StorageMode::parse("local"), StorageMode::Local);
		assert_eq!(StorageMode::parse("in-memory"), StorageMode::InMemory);
		assert_eq!(StorageMode::parse(" Direct "), StorageMode::Direct);
		assert_eq!(StorageMode::parse("proxy"), StorageMode::Proxy);
		assert_eq!(StorageMode::parse("redis"), StorageMode::Local);
	}

	#[test]
	fn builds_local_backends() {
		let dir = tempfile::tempdir().unwrap();
		let config = StorageConfig { data_dir: dir.path().to_path_buf(), ..Default::default() };
		assert_eq!(create_storage_backend(&config).unwrap().name(), "local-file");

		let config = StorageConfig { mode: StorageMode::InMemory, ..Default::default() };
		assert_eq!(create_storage_backend(&config).unwrap().name(), "in-memory");
	}

	#[test]
	fn direct_mode_requires_credentials() {
		let mut config = StorageConfig { mode: StorageMode::Direct, ..Default::default() };
		config.edge_kv.secret_id = Some("AKID".to_string());
		assert!(matches!(
			create_storage_backend(&config),
			Err(StorageError::ConfigurationError(_))
		));

		config.edge_kv.secret_key = Some("secret".to_string());
		let backend = create_storage_backend(&config).unwrap();
		assert_eq!(backend.name(), "edge-kv");
		assert!(backend.capabilities().list);
	}

	#[test]
	fn proxy_mode_requires_url() {
		let mut config = StorageConfig { mode: StorageMode::Proxy, ..Default::default() };
		assert!(matches!(
			create_storage_backend(&config),
			Err(StorageError::ConfigurationError(_))
		));

		config.proxy_url = Some("https://proxy.example.com/kv".to_string());
		let backend = create_storage_backend(&config).unwrap();
		assert_eq!(backend.name(), "proxy");
		assert!(!backend.capabilities().list);
	}
}
