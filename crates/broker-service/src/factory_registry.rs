//! Dynamic factory registry for broker implementations.
//!
//! Collects every storage and cloud factory compiled into the binary, so the
//! builder can be handed exactly the implementations a configuration names.

use broker_cloud::{CloudFactory, FederationClient};
use broker_config::Config;
use broker_core::{BrokerBuilder, BrokerEngine, BrokerFactories};
use broker_storage::StorageFactory;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

/// Registry of all implementation factories.
pub struct FactoryRegistry {
	pub storage: HashMap<String, StorageFactory>,
	pub cloud: HashMap<String, CloudFactory>,
}

impl FactoryRegistry {
	pub fn new() -> Self {
		Self {
			storage: HashMap::new(),
			cloud: HashMap::new(),
		}
	}

	pub fn register_storage(&mut self, name: impl Into<String>, factory: StorageFactory) {
		self.storage.insert(name.into(), factory);
	}

	pub fn register_cloud(&mut self, name: impl Into<String>, factory: CloudFactory) {
		self.cloud.insert(name.into(), factory);
	}

	/// Factories for the implementations `config` refers to.
	///
	/// Fails on the first name the registry does not know.
	pub fn factories_for(&self, config: &Config) -> Result<BrokerFactories, String> {
		let mut storage_factories = HashMap::new();
		for name in config.storage.implementations.keys() {
			let factory = self
				.storage
				.get(name)
				.ok_or_else(|| unknown("storage", name, self.storage.keys()))?;
			storage_factories.insert(name.clone(), *factory);
		}

		let mut cloud_factories = HashMap::new();
		for cloud in config.clouds.values() {
			let name = &cloud.implementation;
			let factory = self
				.cloud
				.get(name)
				.ok_or_else(|| unknown("cloud", name, self.cloud.keys()))?;
			cloud_factories.insert(name.clone(), *factory);
		}

		Ok(BrokerFactories {
			storage_factories,
			cloud_factories,
		})
	}
}

impl Default for FactoryRegistry {
	fn default() -> Self {
		Self::new()
	}
}

fn unknown<'a>(kind: &str, name: &str, available: impl Iterator<Item = &'a String>) -> String {
	let mut available: Vec<&str> = available.map(String::as_str).collect();
	available.sort_unstable();
	format!(
		"Unknown {} implementation '{}'. Available: [{}]",
		kind,
		name,
		available.join(", ")
	)
}

static REGISTRY: OnceLock<FactoryRegistry> = OnceLock::new();

/// Global registry with every built-in implementation.
pub fn get_registry() -> &'static FactoryRegistry {
	REGISTRY.get_or_init(|| {
		let mut registry = FactoryRegistry::new();

		for (name, factory) in broker_storage::get_all_implementations() {
			tracing::debug!(implementation = name, "Registering storage implementation");
			registry.register_storage(name, factory);
		}

		for (name, factory) in broker_cloud::get_all_implementations() {
			tracing::debug!(implementation = name, "Registering cloud implementation");
			registry.register_cloud(name, factory);
		}

		registry
	})
}

/// Builds the broker engine for `config` from the global registry.
pub fn build_broker_from_config(
	config: Config,
	federation: Arc<dyn FederationClient>,
) -> Result<BrokerEngine, Box<dyn std::error::Error>> {
	let factories = get_registry().factories_for(&config)?;
	Ok(BrokerBuilder::new(config)
		.with_federation_client(federation)
		.build(factories)?)
}

#[cfg(test)]
mod tests {
	use super::*;
	use broker_config::builders::config::ConfigBuilder;

	#[test]
	fn test_registry_has_builtin_implementations() {
		let registry = get_registry();
		assert!(registry.storage.contains_key("memory"));
		assert!(registry.storage.contains_key("file"));
		assert!(registry.cloud.contains_key("emulated"));
	}

	#[test]
	fn test_factories_only_for_configured_implementations() {
		let config = ConfigBuilder::new().build();
		let factories = get_registry().factories_for(&config).unwrap();
		assert_eq!(factories.storage_factories.len(), 1);
		assert!(factories.storage_factories.contains_key("memory"));
		assert_eq!(factories.cloud_factories.len(), 1);
	}

	#[test]
	fn test_unknown_cloud_implementation_lists_available() {
		let config = ConfigBuilder::new()
			.cloud("private", "vsphere", toml::Value::Table(toml::Table::new()))
			.build();
		let err = match get_registry().factories_for(&config) {
			Err(e) => e,
			Ok(_) => panic!("vsphere is not registered"),
		};
		assert!(err.contains("vsphere"));
		assert!(err.contains("emulated"));
	}
}
