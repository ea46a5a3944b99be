//! Builder pattern for constructing broker engines.
//!
//! Composes a [`BrokerEngine`] from configuration and factory functions.
//! Storage backends and cloud implementations are chosen by name from the
//! `[storage]` and `[clouds]` sections; tests and embedders can swap in their
//! own federation client or plugins for a named cloud.

use crate::authorization::create_authorization;
use crate::controller::OrderController;
use crate::engine::BrokerEngine;
use crate::facade::{ApplicationFacade, FacadeCore, RemoteFacade};
use crate::processors::{ProcessorContext, ProcessorsController};
use crate::recovery::RecoveryService;
use crate::registry::OrderRegistry;
use crate::state::StateTransitioner;
use broker_cloud::{
	CloudConnectorFactory, CloudFactory, ConfiguredCredentialMapper, DisconnectedFederationClient,
	FederationClient, LocalCloudConnector, PluginSet,
};
use broker_config::Config;
use broker_storage::{StorageFactory, StorageService};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Errors that can occur during broker construction.
#[derive(Debug, Error)]
pub enum BuilderError {
	#[error("Configuration error: {0}")]
	Config(String),
	#[error("Missing required component: {0}")]
	MissingComponent(String),
}

/// Factory functions for every pluggable component, keyed by implementation name.
#[derive(Clone)]
pub struct BrokerFactories {
	pub storage_factories: HashMap<String, StorageFactory>,
	pub cloud_factories: HashMap<String, CloudFactory>,
}

impl BrokerFactories {
	/// All implementations compiled into the broker.
	pub fn builtin() -> Self {
		Self {
			storage_factories: broker_storage::get_all_implementations()
				.into_iter()
				.map(|(name, factory)| (name.to_string(), factory))
				.collect(),
			cloud_factories: broker_cloud::get_all_implementations()
				.into_iter()
				.map(|(name, factory)| (name.to_string(), factory))
				.collect(),
		}
	}
}

/// Cloud plugins resolved by name, with explicit overrides taking precedence.
#[derive(Clone, Default)]
pub(crate) struct CloudSources {
	pub factories: HashMap<String, CloudFactory>,
	pub overrides: HashMap<String, PluginSet>,
}

/// Builder for constructing a BrokerEngine with pluggable implementations.
pub struct BrokerBuilder {
	config: Config,
	federation: Option<Arc<dyn FederationClient>>,
	plugins: HashMap<String, PluginSet>,
}

impl BrokerBuilder {
	pub fn new(config: Config) -> Self {
		Self {
			config,
			federation: None,
			plugins: HashMap::new(),
		}
	}

	/// Client used to reach peer providers. Without one, every remote call
	/// fails as unavailable.
	pub fn with_federation_client(mut self, client: Arc<dyn FederationClient>) -> Self {
		self.federation = Some(client);
		self
	}

	/// Serves the named cloud with `plugins` instead of its configured implementation.
	pub fn with_plugins(mut self, cloud_name: impl Into<String>, plugins: PluginSet) -> Self {
		self.plugins.insert(cloud_name.into(), plugins);
		self
	}

	/// Builds the engine. Nothing runs until [`BrokerEngine::initialize`].
	pub fn build(self, factories: BrokerFactories) -> Result<BrokerEngine, BuilderError> {
		let storage = Arc::new(build_storage(&self.config, &factories.storage_factories)?);

		let sources = CloudSources {
			factories: factories.cloud_factories,
			overrides: self.plugins,
		};
		let clouds = build_local_clouds(&self.config, &sources)?;

		let authorization = create_authorization(&self.config.authorization)
			.map_err(|e| BuilderError::Config(e.to_string()))?;
		tracing::info!(
			component = "authorization",
			implementation = %self.config.authorization.implementation,
			"Loaded"
		);

		let federation = self
			.federation
			.unwrap_or_else(|| Arc::new(DisconnectedFederationClient));
		let provider_id = self.config.broker.provider_id.clone();

		let registry = Arc::new(OrderRegistry::new());
		let transitioner = Arc::new(StateTransitioner::new(
			provider_id.clone(),
			storage.clone(),
			registry.clone(),
			federation.clone(),
		));
		let connectors = Arc::new(CloudConnectorFactory::new(
			provider_id.clone(),
			self.config.broker.default_cloud_name.clone(),
			clouds,
			federation,
		));
		let controller = Arc::new(OrderController::new(
			provider_id.clone(),
			registry.clone(),
			transitioner.clone(),
			connectors.clone(),
		));
		let context = Arc::new(ProcessorContext {
			local_provider_id: provider_id,
			registry: registry.clone(),
			transitioner,
			connectors: connectors.clone(),
		});
		let processors = Arc::new(ProcessorsController::new(
			context,
			&self.config.processors,
		));
		let core = Arc::new(FacadeCore::new(
			controller,
			connectors.clone(),
			processors.clone(),
			authorization,
			self.config.reload_drain_timeout(),
		));
		let recovery = RecoveryService::new(storage.clone(), registry.clone());

		Ok(BrokerEngine::new(
			self.config,
			storage,
			registry,
			connectors,
			processors,
			ApplicationFacade::new(core.clone()),
			RemoteFacade::new(core),
			recovery,
			sources,
		))
	}
}

fn build_storage(
	config: &Config,
	factories: &HashMap<String, StorageFactory>,
) -> Result<StorageService, BuilderError> {
	let primary = &config.storage.primary;
	let settings = config.storage.implementations.get(primary).ok_or_else(|| {
		BuilderError::Config(format!("Primary storage '{}' has no configuration", primary))
	})?;
	let factory = factories.get(primary).ok_or_else(|| {
		BuilderError::MissingComponent(format!("storage implementation '{}'", primary))
	})?;

	match factory(settings) {
		Ok(backend) => {
			tracing::info!(component = "storage", implementation = %primary, "Loaded");
			Ok(StorageService::new(backend))
		},
		Err(e) => {
			tracing::error!(
				component = "storage",
				implementation = %primary,
				error = %e,
				"Failed to create storage implementation"
			);
			Err(BuilderError::Config(format!(
				"Failed to create storage implementation '{}': {}",
				primary, e
			)))
		},
	}
}

/// Creates a connector for every configured cloud.
///
/// Each cloud gets its plugins from an override or from the factory named by
/// its `implementation`, and a credential mapper from the same config table.
pub(crate) fn build_local_clouds(
	config: &Config,
	sources: &CloudSources,
) -> Result<HashMap<String, LocalCloudConnector>, BuilderError> {
	let mut clouds = HashMap::new();
	for (name, cloud) in &config.clouds {
		let plugins = match sources.overrides.get(name) {
			Some(plugins) => plugins.clone(),
			None => {
				let factory = sources.factories.get(&cloud.implementation).ok_or_else(|| {
					BuilderError::MissingComponent(format!(
						"cloud implementation '{}' for cloud '{}'",
						cloud.implementation, name
					))
				})?;
				factory(name, &cloud.config).map_err(|e| {
					tracing::error!(
						component = "cloud",
						cloud = %name,
						implementation = %cloud.implementation,
						error = %e,
						"Failed to create cloud implementation"
					);
					BuilderError::Config(format!("Failed to create cloud '{}': {}", name, e))
				})?
			},
		};
		let mapper = ConfiguredCredentialMapper::from_config(name, &cloud.config)
			.map_err(|e| BuilderError::Config(format!("cloud '{}': {}", name, e)))?;

		tracing::info!(component = "cloud", cloud = %name, implementation = %cloud.implementation, "Loaded");
		clouds.insert(
			name.clone(),
			LocalCloudConnector::new(name.clone(), plugins, Arc::new(mapper)),
		);
	}

	if !clouds.contains_key(&config.broker.default_cloud_name) {
		return Err(BuilderError::Config(format!(
			"Default cloud '{}' is not configured",
			config.broker.default_cloud_name
		)));
	}
	Ok(clouds)
}

#[cfg(test)]
mod tests {
	use super::*;
	use broker_config::builders::config::ConfigBuilder;

	#[test]
	fn test_builtin_factories() {
		let factories = BrokerFactories::builtin();
		assert!(factories.storage_factories.contains_key("memory"));
		assert!(factories.storage_factories.contains_key("file"));
		assert!(factories.cloud_factories.contains_key("emulated"));
	}

	#[tokio::test]
	async fn test_build_with_defaults() {
		let engine = BrokerBuilder::new(ConfigBuilder::new().build())
			.build(BrokerFactories::builtin())
			.unwrap();
		assert_eq!(engine.provider_id(), "provider-a");
		assert_eq!(engine.connectors().local_cloud_names(), vec!["default".to_string()]);
		assert!(!engine.processors().is_running().await);
	}

	#[test]
	fn test_unknown_cloud_implementation_is_missing_component() {
		let config = ConfigBuilder::new()
			.cloud("other", "openstack", toml::Value::Table(toml::Table::new()))
			.build();
		let result = BrokerBuilder::new(config).build(BrokerFactories::builtin());
		assert!(matches!(result, Err(BuilderError::MissingComponent(_))));
	}

	#[test]
	fn test_invalid_cloud_config_is_rejected() {
		let mut table = toml::Table::new();
		table.insert("ready_after_polls".into(), toml::Value::String("soon".into()));
		let config = ConfigBuilder::new()
			.cloud("default", "emulated", toml::Value::Table(table))
			.build();
		let result = BrokerBuilder::new(config).build(BrokerFactories::builtin());
		assert!(matches!(result, Err(BuilderError::Config(_))));
	}

	#[test]
	fn test_missing_storage_factory() {
		let mut factories = BrokerFactories::builtin();
		factories.storage_factories.remove("memory");
		let result = BrokerBuilder::new(ConfigBuilder::new().build()).build(factories);
		assert!(matches!(result, Err(BuilderError::MissingComponent(_))));
	}

	#[test]
	fn test_plugin_override_skips_factory() {
		let config = ConfigBuilder::new()
			.cloud("private", "vendor", toml::Value::Table(toml::Table::new()))
			.build();
		let plugins = PluginSet::uniform(Arc::new(
			broker_cloud::implementations::emulated::EmulatedCloud::new("private", 0),
		));
		let sources = CloudSources {
			factories: BrokerFactories::builtin().cloud_factories,
			overrides: HashMap::from([("private".to_string(), plugins)]),
		};
		let clouds = build_local_clouds(&config, &sources).unwrap();
		let mut names: Vec<_> = clouds.keys().cloned().collect();
		names.sort();
		assert_eq!(names, vec!["default".to_string(), "private".to_string()]);
	}
}
