use impls::storage_factory::{EdgeKvSettings, StorageConfig, StorageMode, DEFAULT_DATA_DIR};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::level_filters::LevelFilter;

const BIND_ADDR_VAR: &str = "FOLIO_BIND_ADDRESS";
const LOG_LEVEL_VAR: &str = "FOLIO_LOG_LEVEL";
const OTLP_ENDPOINT_VAR: &str = "FOLIO_OTLP_ENDPOINT";
const STORAGE_MODE_VAR: &str = "FOLIO_STORAGE_MODE";
const DATA_DIR_VAR: &str = "FOLIO_DATA_DIR";
const EDGE_KV_ENDPOINT_VAR: &str = "FOLIO_EDGE_KV_ENDPOINT";
const EDGE_KV_REGION_VAR: &str = "FOLIO_EDGE_KV_REGION";
const EDGE_KV_NAMESPACE_VAR: &str = "FOLIO_EDGE_KV_NAMESPACE";
const EDGE_KV_SECRET_ID_VAR: &str = "FOLIO_EDGE_KV_SECRET_ID";
const EDGE_KV_SECRET_KEY_VAR: &str = "FOLIO_EDGE_KV_SECRET_KEY";
const PROXY_URL_VAR: &str = "FOLIO_PROXY_URL";
const PROXY_MAX_ATTEMPTS_VAR: &str = "FOLIO_PROXY_MAX_ATTEMPTS";
const JWT_SECRET_VAR: &str = "FOLIO_JWT_SECRET";
const JWT_RSA_PEM_VAR: &str = "FOLIO_JWT_RSA_PEM";

// The structure of the toml config file. Any settings specified therein can be overriden by the corresponding
// environment variable.
#[derive(Deserialize, Default)]
struct TomlConfig {
	server_config: Option<ServerConfig>,
	storage_config: Option<StorageSection>,
	edge_kv_config: Option<EdgeKvSection>,
	proxy_config: Option<ProxySection>,
	jwt_auth_config: Option<JwtAuthConfig>,
}

#[derive(Deserialize, Default)]
struct ServerConfig {
	bind_address: Option<SocketAddr>,
	log_level: Option<String>,
	otlp_endpoint: Option<String>,
}

#[derive(Deserialize, Default)]
struct StorageSection {
	mode: Option<String>,
	data_dir: Option<PathBuf>,
}

#[derive(Deserialize, Default)]
struct EdgeKvSection {
	endpoint: Option<String>,
	region: Option<String>,
	namespace: Option<String>,
	secret_id: Option<String>,
	secret_key: Option<String>,
}

#[derive(Deserialize, Default)]
struct ProxySection {
	url: Option<String>,
	max_attempts: Option<u32>,
}

#[derive(Deserialize, Default)]
struct JwtAuthConfig {
	secret: Option<String>,
	rsa_pem: Option<String>,
}

// Encapsulates the result of reading both the environment variables and the config file.
pub(crate) struct Configuration {
	pub(crate) bind_address: SocketAddr,
	pub(crate) log_level: LevelFilter,
	pub(crate) otlp_endpoint: Option<String>,
	pub(crate) storage: StorageConfig,
	pub(crate) jwt_secret: Option<String>,
	pub(crate) rsa_pem: Option<String>,
}

#[inline]
fn read_env(env_var: &str) -> Result<Option<String>, String> {
	match std::env::var(env_var) {
		Ok(env) => Ok(Some(env)),
		Err(std::env::VarError::NotPresent) => Ok(None),
		Err(e) => Err(format!("Failed to load the {} environment variable: {}", env_var, e)),
	}
}

#[inline]
fn read_config<T: std::fmt::Display>(
	env: Option<T>, config: Option<T>, item: &str, var_name: &str,
) -> Result<T, String> {
	env.or(config).ok_or(format!(
		"{} must be provided in the configuration file or the environment variable {} must be set.",
		item, var_name
	))
}

fn parse_env<T: std::str::FromStr>(value: Option<String>, var_name: &str) -> Result<Option<T>, String>
where
	T::Err: std::fmt::Display,
{
	value
		.map(|v| {
			v.parse().map_err(|e| format!("Unable to parse the {} environment variable: {}", var_name, e))
		})
		.transpose()
}

pub(crate) fn load_configuration(config_file_path: Option<&str>) -> Result<Configuration, String> {
	let config_file = match config_file_path {
		Some(path) => Some(
			std::fs::read_to_string(path)
				.map_err(|e| format!("Failed to read configuration file: {}", e))?,
		),
		None => None,
	};
	resolve_configuration(config_file.as_deref(), read_env)
}

/// Merges the file contents with the environment as seen through `env`.
fn resolve_configuration<E>(config_file: Option<&str>, env: E) -> Result<Configuration, String>
where
	E: Fn(&str) -> Result<Option<String>, String>,
{
	let TomlConfig { server_config, storage_config, edge_kv_config, proxy_config, jwt_auth_config } =
		match config_file {
			Some(contents) => toml::from_str(contents)
				.map_err(|e| format!("Failed to parse configuration file: {}", e))?,
			None => TomlConfig::default(), // All fields are set to `None`
		};
	let server_config = server_config.unwrap_or_default();
	let storage_config = storage_config.unwrap_or_default();
	let edge_kv_config = edge_kv_config.unwrap_or_default();
	let proxy_config = proxy_config.unwrap_or_default();
	let jwt_auth_config = jwt_auth_config.unwrap_or_default();

	let bind_address_env = parse_env(env(BIND_ADDR_VAR)?, BIND_ADDR_VAR)?;
	let bind_address = read_config(
		bind_address_env,
		server_config.bind_address,
		"Folio server bind address",
		BIND_ADDR_VAR,
	)?;

	let log_level = env(LOG_LEVEL_VAR)?
		.or(server_config.log_level)
		.map(|level| {
			level.parse::<LevelFilter>().map_err(|e| format!("Invalid log level {}: {}", level, e))
		})
		.transpose()?
		.unwrap_or(LevelFilter::INFO);
	let otlp_endpoint = env(OTLP_ENDPOINT_VAR)?.or(server_config.otlp_endpoint);

	let mode = env(STORAGE_MODE_VAR)?
		.or(storage_config.mode)
		.map(|mode| StorageMode::parse(&mode))
		.unwrap_or_default();
	let data_dir = env(DATA_DIR_VAR)?
		.map(PathBuf::from)
		.or(storage_config.data_dir)
		.unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR));

	let defaults = EdgeKvSettings::default();
	let edge_kv = EdgeKvSettings {
		endpoint: env(EDGE_KV_ENDPOINT_VAR)?.or(edge_kv_config.endpoint).unwrap_or(defaults.endpoint),
		region: env(EDGE_KV_REGION_VAR)?.or(edge_kv_config.region).unwrap_or(defaults.region),
		namespace: env(EDGE_KV_NAMESPACE_VAR)?
			.or(edge_kv_config.namespace)
			.unwrap_or(defaults.namespace),
		secret_id: env(EDGE_KV_SECRET_ID_VAR)?.or(edge_kv_config.secret_id),
		secret_key: env(EDGE_KV_SECRET_KEY_VAR)?.or(edge_kv_config.secret_key),
	};

	let proxy_url = env(PROXY_URL_VAR)?.or(proxy_config.url);
	let proxy_max_attempts = parse_env(env(PROXY_MAX_ATTEMPTS_VAR)?, PROXY_MAX_ATTEMPTS_VAR)?
		.or(proxy_config.max_attempts)
		.unwrap_or(StorageConfig::default().proxy_max_attempts);

	let jwt_secret = env(JWT_SECRET_VAR)?.or(jwt_auth_config.secret);
	let rsa_pem = env(JWT_RSA_PEM_VAR)?.or(jwt_auth_config.rsa_pem);

	Ok(Configuration {
		bind_address,
		log_level,
		otlp_endpoint,
		storage: StorageConfig { mode, data_dir, edge_kv, proxy_url, proxy_max_attempts },
		jwt_secret,
		rsa_pem,
	})
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::collections::HashMap;

	fn env_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Result<Option<String>, String> {
		let vars: HashMap<String, String> =
			vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
		move |name| Ok(vars.get(name).cloned())
	}

	const CONFIG_FILE: &str = r#"
[server_config]
bind_address = "127.0.0.1:8080"
log_level = "debug"

[storage_config]
mode = "proxy"
data_dir = "/var/lib/folio"

[proxy_config]
url = "https://proxy.example.com/kv"
max_attempts = 5

[jwt_auth_config]
secret = "file-secret"
"#;

	#[test]
	fn reads_configuration_file() {
		let config = resolve_configuration(Some(CONFIG_FILE), env_from(&[])).unwrap();
		assert_eq!(config.bind_address, "127.0.0.1:8080".parse().unwrap());
		assert_eq!(config.log_level, LevelFilter::DEBUG);
		assert_eq!(config.storage.mode, StorageMode::Proxy);
		assert_eq!(config.storage.data_dir, PathBuf::from("/var/lib/folio"));
		assert_eq!(config.storage.proxy_url.as_deref(), Some("https://proxy.example.com/kv"));
		assert_eq!(config.storage.proxy_max_attempts, 5);
		assert_eq!(config.jwt_secret.as_deref(), Some("file-secret"));
		assert!(config.otlp_endpoint.is_none());
	}

	#[test]
	fn environment_overrides_file() {
		let env = env_from(&[
			(BIND_ADDR_VAR, "0.0.0.0:9000"),
			(STORAGE_MODE_VAR, "direct"),
			(EDGE_KV_SECRET_ID_VAR, "AKID"),
			(EDGE_KV_SECRET_KEY_VAR, "secret"),
			(PROXY_MAX_ATTEMPTS_VAR, "2"),
		]);
		let config = resolve_configuration(Some(CONFIG_FILE), env).unwrap();
		assert_eq!(config.bind_address, "0.0.0.0:9000".parse().unwrap());
		assert_eq!(config.storage.mode, StorageMode::Direct);
		assert_eq!(config.storage.edge_kv.secret_id.as_deref(), Some("AKID"));
		assert_eq!(config.storage.edge_kv.namespace, "portfolio");
		assert_eq!(config.storage.proxy_max_attempts, 2);
	}

	#[test]
	fn applies_defaults() {
		let config =
			resolve_configuration(None, env_from(&[(BIND_ADDR_VAR, "127.0.0.1:3000")])).unwrap();
		assert_eq!(config.log_level, LevelFilter::INFO);
		assert_eq!(config.storage.mode, StorageMode::Local);
		assert_eq!(config.storage.data_dir, PathBuf::from(DEFAULT_DATA_DIR));
		assert_eq!(config.storage.proxy_max_attempts, 3);
		assert!(config.jwt_secret.is_none() && config.rsa_pem.is_none());
	}

	#[test]
	fn rejects_missing_or_invalid_settings() {
		let missing = resolve_configuration(None, env_from(&[])).err().unwrap();
		assert!(missing.contains(BIND_ADDR_VAR));

		let env = env_from(&[(BIND_ADDR_VAR, "not-an-address")]);
		assert!(resolve_configuration(None, env).is_err());

		let env = env_from(&[(BIND_ADDR_VAR, "127.0.0.1:3000"), (LOG_LEVEL_VAR, "loud")]);
		assert!(resolve_configuration(None, env).is_err());
	}
}
