//! Configuration builder for tests and development setups.

use crate::{
	ApiConfig, AuthorizationConfig, BrokerConfig, CloudConfig, Config, FederationConfig,
	ProcessorsConfig, StorageConfig,
};
use std::collections::HashMap;

/// Builds a [`Config`] with an in-memory storage and one emulated cloud.
///
/// Processor intervals default to a few milliseconds so lifecycle tests run fast.
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
	provider_id: String,
	default_cloud_name: String,
	reload_drain_timeout_seconds: u64,
	processors: ProcessorsConfig,
	clouds: HashMap<String, CloudConfig>,
	authorization: AuthorizationConfig,
	peers: HashMap<String, String>,
	api: Option<ApiConfig>,
}

impl Default for ConfigBuilder {
	fn default() -> Self {
		Self::new()
	}
}

impl ConfigBuilder {
	pub fn new() -> Self {
		let mut clouds = HashMap::new();
		clouds.insert(
			"default".to_string(),
			CloudConfig {
				implementation: "emulated".to_string(),
				config: toml::Value::Table(toml::Table::new()),
			},
		);
		Self {
			provider_id: "provider-a".to_string(),
			default_cloud_name: "default".to_string(),
			reload_drain_timeout_seconds: 1,
			processors: ProcessorsConfig {
				open_sleep_ms: 5,
				spawning_sleep_ms: 5,
				fulfilled_sleep_ms: 5,
				failed_sleep_ms: 5,
				closed_sleep_ms: 5,
			},
			clouds,
			authorization: AuthorizationConfig::default(),
			peers: HashMap::new(),
			api: None,
		}
	}

	pub fn provider_id(mut self, id: impl Into<String>) -> Self {
		self.provider_id = id.into();
		self
	}

	pub fn processors(mut self, processors: ProcessorsConfig) -> Self {
		self.processors = processors;
		self
	}

	/// Adds (or replaces) a cloud served by the given implementation.
	pub fn cloud(
		mut self,
		name: impl Into<String>,
		implementation: impl Into<String>,
		config: toml::Value,
	) -> Self {
		self.clouds.insert(
			name.into(),
			CloudConfig {
				implementation: implementation.into(),
				config,
			},
		);
		self
	}

	pub fn authorization(mut self, authorization: AuthorizationConfig) -> Self {
		self.authorization = authorization;
		self
	}

	pub fn peer(mut self, provider_id: impl Into<String>, url: impl Into<String>) -> Self {
		self.peers.insert(provider_id.into(), url.into());
		self
	}

	pub fn reload_drain_timeout_seconds(mut self, seconds: u64) -> Self {
		self.reload_drain_timeout_seconds = seconds;
		self
	}

	pub fn api(mut self, api: ApiConfig) -> Self {
		self.api = Some(api);
		self
	}

	pub fn build(self) -> Config {
		let mut implementations = HashMap::new();
		implementations.insert(
			"memory".to_string(),
			toml::Value::Table(toml::Table::new()),
		);

		Config {
			broker: BrokerConfig {
				provider_id: self.provider_id,
				default_cloud_name: self.default_cloud_name,
				reload_drain_timeout_seconds: self.reload_drain_timeout_seconds,
			},
			processors: self.processors,
			storage: StorageConfig {
				primary: "memory".to_string(),
				implementations,
				cleanup_interval_seconds: 3600,
			},
			clouds: self.clouds,
			authorization: self.authorization,
			federation: FederationConfig {
				timeout_seconds: 5,
				peers: self.peers,
			},
			api: self.api,
		}
	}
}
