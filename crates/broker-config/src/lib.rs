//! Configuration module for the broker.
//!
//! Configuration is a TOML document describing the local provider, the
//! processor polling intervals, the storage backend, the local clouds and their
//! plugin implementations, the authorization policy, the federation peers and
//! the HTTP API. It is loaded at startup and again on an administrative reload.
//!
//! ## Modular Configuration Support
//!
//! Configurations can be split into multiple files:
//! - Use `include = ["file1.toml", "file2.toml"]` to include other config files
//! - Each top-level section must be unique across all files (no duplicates allowed)
//! - `${VAR}` and `${VAR:-default}` are replaced from the environment

mod loader;

#[cfg(feature = "testing")]
pub mod builders {
	pub mod config;
}

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
	#[error("IO error: {0}")]
	Io(#[from] std::io::Error),
	#[error("Configuration error: {0}")]
	Parse(String),
	#[error("Validation error: {0}")]
	Validation(String),
}

impl From<toml::de::Error> for ConfigError {
	fn from(err: toml::de::Error) -> Self {
		// Keep the message only; the default rendering dumps the whole input.
		ConfigError::Parse(err.message().to_string())
	}
}

/// Top-level broker configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
	pub broker: BrokerConfig,
	#[serde(default)]
	pub processors: ProcessorsConfig,
	pub storage: StorageConfig,
	/// Local clouds by name.
	pub clouds: HashMap<String, CloudConfig>,
	#[serde(default)]
	pub authorization: AuthorizationConfig,
	#[serde(default)]
	pub federation: FederationConfig,
	pub api: Option<ApiConfig>,
}

/// Identity of the local provider.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BrokerConfig {
	/// Provider id of this broker in the federation.
	pub provider_id: String,
	/// Cloud used when a request does not name one. Must be a key of `[clouds]`.
	pub default_cloud_name: String,
	/// How long a reload waits for in-flight requests before swapping anyway.
	#[serde(default = "default_reload_drain_timeout_seconds")]
	pub reload_drain_timeout_seconds: u64,
}

fn default_reload_drain_timeout_seconds() -> u64 {
	30
}

/// Sleep intervals of the lifecycle processors, in milliseconds.
///
/// A processor sleeps after each full pass over its queue.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ProcessorsConfig {
	#[serde(default = "default_open_sleep_ms")]
	pub open_sleep_ms: u64,
	#[serde(default = "default_spawning_sleep_ms")]
	pub spawning_sleep_ms: u64,
	#[serde(default = "default_fulfilled_sleep_ms")]
	pub fulfilled_sleep_ms: u64,
	#[serde(default = "default_failed_sleep_ms")]
	pub failed_sleep_ms: u64,
	#[serde(default = "default_closed_sleep_ms")]
	pub closed_sleep_ms: u64,
}

fn default_open_sleep_ms() -> u64 {
	1000
}

fn default_spawning_sleep_ms() -> u64 {
	2000
}

fn default_fulfilled_sleep_ms() -> u64 {
	2000
}

fn default_failed_sleep_ms() -> u64 {
	5000
}

fn default_closed_sleep_ms() -> u64 {
	2000
}

impl Default for ProcessorsConfig {
	fn default() -> Self {
		Self {
			open_sleep_ms: default_open_sleep_ms(),
			spawning_sleep_ms: default_spawning_sleep_ms(),
			fulfilled_sleep_ms: default_fulfilled_sleep_ms(),
			failed_sleep_ms: default_failed_sleep_ms(),
			closed_sleep_ms: default_closed_sleep_ms(),
		}
	}
}

impl ProcessorsConfig {
	/// All intervals with their key names, for validation and logging.
	pub fn intervals(&self) -> [(&'static str, Duration); 5] {
		[
			("open_sleep_ms", Duration::from_millis(self.open_sleep_ms)),
			("spawning_sleep_ms", Duration::from_millis(self.spawning_sleep_ms)),
			("fulfilled_sleep_ms", Duration::from_millis(self.fulfilled_sleep_ms)),
			("failed_sleep_ms", Duration::from_millis(self.failed_sleep_ms)),
			("closed_sleep_ms", Duration::from_millis(self.closed_sleep_ms)),
		]
	}
}

/// Configuration for the storage backend.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
	/// Which implementation to use as primary.
	pub primary: String,
	/// Map of storage implementation names to their configurations.
	pub implementations: HashMap<String, toml::Value>,
	/// Interval in seconds between expired-entry cleanups.
	#[serde(default = "default_cleanup_interval_seconds")]
	pub cleanup_interval_seconds: u64,
}

fn default_cleanup_interval_seconds() -> u64 {
	3600
}

/// One local cloud and the plugin implementation serving it.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CloudConfig {
	/// Registered cloud implementation name, e.g. `emulated`.
	pub implementation: String,
	/// Implementation-specific settings, validated by the implementation.
	#[serde(default = "empty_table")]
	pub config: toml::Value,
}

fn empty_table() -> toml::Value {
	toml::Value::Table(toml::Table::new())
}

/// Authorization policy.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AuthorizationConfig {
	/// `allow_all` or `role_aware`.
	#[serde(default = "default_authorization_implementation")]
	pub implementation: String,
	/// User ids allowed to run administrative operations.
	#[serde(default)]
	pub admins: Vec<String>,
}

fn default_authorization_implementation() -> String {
	"allow_all".to_string()
}

impl Default for AuthorizationConfig {
	fn default() -> Self {
		Self {
			implementation: default_authorization_implementation(),
			admins: Vec::new(),
		}
	}
}

/// Peer providers and how to reach them.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FederationConfig {
	/// Timeout of one federation call.
	#[serde(default = "default_federation_timeout_seconds")]
	pub timeout_seconds: u64,
	/// Peer provider id to base URL.
	#[serde(default)]
	pub peers: HashMap<String, String>,
}

fn default_federation_timeout_seconds() -> u64 {
	30
}

impl Default for FederationConfig {
	fn default() -> Self {
		Self {
			timeout_seconds: default_federation_timeout_seconds(),
			peers: HashMap::new(),
		}
	}
}

/// Configuration for the HTTP API server.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApiConfig {
	#[serde(default)]
	pub enabled: bool,
	#[serde(default = "default_api_host")]
	pub host: String,
	#[serde(default = "default_api_port")]
	pub port: u16,
	/// Request timeout in seconds.
	#[serde(default = "default_api_timeout")]
	pub timeout_seconds: u64,
	/// Maximum request size in bytes.
	#[serde(default = "default_max_request_size")]
	pub max_request_size: usize,
}

fn default_api_host() -> String {
	"127.0.0.1".to_string()
}

fn default_api_port() -> u16 {
	8080
}

fn default_api_timeout() -> u64 {
	30
}

fn default_max_request_size() -> usize {
	1024 * 1024
}

/// Resolves environment variables in a string.
///
/// Replaces ${VAR_NAME} with the value of the environment variable VAR_NAME.
/// Supports default values with ${VAR_NAME:-default_value}.
///
/// Input strings are limited to 1MB to prevent ReDoS attacks.
pub(crate) fn resolve_env_vars(input: &str) -> Result<String, ConfigError> {
	const MAX_INPUT_SIZE: usize = 1024 * 1024;
	if input.len() > MAX_INPUT_SIZE {
		return Err(ConfigError::Validation(format!(
			"Configuration file too large: {} bytes (max: {} bytes)",
			input.len(),
			MAX_INPUT_SIZE
		)));
	}

	let re = Regex::new(r"\$\{([A-Z_][A-Z0-9_]{0,127})(?::-([^}]{0,256}))?\}")
		.map_err(|e| ConfigError::Parse(format!("Regex error: {}", e)))?;

	let mut result = String::with_capacity(input.len());
	let mut last_end = 0;

	for cap in re.captures_iter(input) {
		let (Some(full_match), Some(var_name)) = (cap.get(0), cap.get(1)) else {
			continue;
		};
		let value = match std::env::var(var_name.as_str()) {
			Ok(v) => v,
			Err(_) => match cap.get(2) {
				Some(default) => default.as_str().to_string(),
				None => {
					return Err(ConfigError::Validation(format!(
						"Environment variable '{}' not found",
						var_name.as_str()
					)))
				},
			},
		};
		result.push_str(&input[last_end..full_match.start()]);
		result.push_str(&value);
		last_end = full_match.end();
	}
	result.push_str(&input[last_end..]);

	Ok(result)
}

impl Config {
	/// Loads configuration from a file, following `include` directives.
	pub async fn from_file(path: &str) -> Result<Self, ConfigError> {
		let path_buf = Path::new(path);
		let base_dir = path_buf.parent().unwrap_or_else(|| Path::new("."));

		let mut loader = loader::ConfigLoader::new(base_dir);
		let file_name = path_buf
			.file_name()
			.ok_or_else(|| ConfigError::Validation(format!("Invalid path: {}", path)))?;
		loader.load_config(file_name).await
	}

	/// Drain timeout of the reload gate.
	pub fn reload_drain_timeout(&self) -> Duration {
		Duration::from_secs(self.broker.reload_drain_timeout_seconds)
	}

	/// Checks cross-section consistency:
	/// - provider id is set and is not listed as its own peer
	/// - the default cloud is one of the configured clouds
	/// - no processor sleeps for zero milliseconds
	/// - the primary storage has an implementation table
	fn validate(&self) -> Result<(), ConfigError> {
		if self.broker.provider_id.trim().is_empty() {
			return Err(ConfigError::Validation("Provider ID cannot be empty".into()));
		}

		if self.clouds.is_empty() {
			return Err(ConfigError::Validation(
				"At least one cloud must be configured".into(),
			));
		}
		if !self.clouds.contains_key(&self.broker.default_cloud_name) {
			return Err(ConfigError::Validation(format!(
				"Default cloud '{}' is not configured in [clouds]",
				self.broker.default_cloud_name
			)));
		}
		for (name, cloud) in &self.clouds {
			if cloud.implementation.is_empty() {
				return Err(ConfigError::Validation(format!(
					"Cloud '{}' has no implementation",
					name
				)));
			}
		}

		for (key, interval) in self.processors.intervals() {
			if interval.is_zero() {
				return Err(ConfigError::Validation(format!(
					"processors.{} must be greater than zero",
					key
				)));
			}
		}

		if self.storage.primary.is_empty() {
			return Err(ConfigError::Validation(
				"Storage primary implementation cannot be empty".into(),
			));
		}
		if !self
			.storage
			.implementations
			.contains_key(&self.storage.primary)
		{
			return Err(ConfigError::Validation(format!(
				"Primary storage '{}' not found in implementations",
				self.storage.primary
			)));
		}

		if self.federation.peers.contains_key(&self.broker.provider_id) {
			return Err(ConfigError::Validation(format!(
				"Local provider '{}' cannot be listed as a federation peer",
				self.broker.provider_id
			)));
		}

		if self.authorization.implementation == "role_aware" && self.authorization.admins.is_empty()
		{
			return Err(ConfigError::Validation(
				"role_aware authorization requires at least one admin".into(),
			));
		}

		Ok(())
	}
}

/// Parses a TOML string, resolving environment variables and validating.
impl FromStr for Config {
	type Err = ConfigError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let resolved = resolve_env_vars(s)?;
		let config: Config = toml::from_str(&resolved)?;
		config.validate()?;
		Ok(config)
	}
}
