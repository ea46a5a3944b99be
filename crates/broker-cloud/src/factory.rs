//! Connector selection and the cloud implementation registry.

use crate::{
	CloudConnector, CloudError, FederationClient, LocalCloudConnector, PluginSet,
	RemoteCloudConnector,
};
use arc_swap::ArcSwap;
use broker_types::{
	FederationEnvelope, FederationRequest, FederationResponse, ImplementationRegistry, SystemUser,
};
use std::collections::HashMap;
use std::sync::Arc;

/// Factory signature every cloud implementation provides.
///
/// Receives the cloud name and its `[clouds.<name>.config]` table.
pub type CloudFactory = fn(&str, &toml::Value) -> Result<PluginSet, CloudError>;

/// Registry trait for cloud implementations.
pub trait CloudRegistry: ImplementationRegistry<Factory = CloudFactory> {}

/// Returns `(name, factory)` for every built-in cloud implementation.
pub fn get_all_implementations() -> Vec<(&'static str, CloudFactory)> {
	use crate::implementations::emulated;

	vec![(emulated::Registry::NAME, emulated::Registry::factory())]
}

struct LocalClouds {
	default_cloud_name: String,
	connectors: HashMap<String, Arc<LocalCloudConnector>>,
}

/// Chooses the connector for an order from its provider id.
///
/// The local clouds are held behind an [`ArcSwap`] so a configuration reload
/// can replace them while connectors handed out earlier stay valid.
pub struct CloudConnectorFactory {
	local_provider_id: String,
	clouds: ArcSwap<LocalClouds>,
	federation: Arc<dyn FederationClient>,
}

impl CloudConnectorFactory {
	pub fn new(
		local_provider_id: impl Into<String>,
		default_cloud_name: impl Into<String>,
		connectors: HashMap<String, LocalCloudConnector>,
		federation: Arc<dyn FederationClient>,
	) -> Self {
		Self {
			local_provider_id: local_provider_id.into(),
			clouds: ArcSwap::from_pointee(LocalClouds {
				default_cloud_name: default_cloud_name.into(),
				connectors: wrap(connectors),
			}),
			federation,
		}
	}

	pub fn local_provider_id(&self) -> &str {
		&self.local_provider_id
	}

	pub fn federation_client(&self) -> Arc<dyn FederationClient> {
		self.federation.clone()
	}

	pub fn default_cloud_name(&self) -> String {
		self.clouds.load().default_cloud_name.clone()
	}

	/// Names of the local clouds, sorted.
	pub fn local_cloud_names(&self) -> Vec<String> {
		let mut names: Vec<String> = self.clouds.load().connectors.keys().cloned().collect();
		names.sort();
		names
	}

	/// Returns a local connector when `provider_id` is this provider and a
	/// remote one otherwise.
	pub fn connector(
		&self,
		provider_id: &str,
		cloud_name: &str,
	) -> Result<Arc<dyn CloudConnector>, CloudError> {
		if provider_id == self.local_provider_id {
			let clouds = self.clouds.load();
			let connector = clouds.connectors.get(cloud_name).ok_or_else(|| {
				CloudError::InvalidParameter(format!("unknown cloud: {}", cloud_name))
			})?;
			Ok(connector.clone())
		} else {
			Ok(Arc::new(RemoteCloudConnector::new(
				self.local_provider_id.clone(),
				provider_id,
				cloud_name,
				self.federation.clone(),
			)))
		}
	}

	/// Cloud names offered by a provider.
	pub async fn cloud_names(
		&self,
		provider_id: &str,
		user: &SystemUser,
	) -> Result<Vec<String>, CloudError> {
		if provider_id == self.local_provider_id {
			return Ok(self.local_cloud_names());
		}
		let envelope = FederationEnvelope {
			requesting_provider: self.local_provider_id.clone(),
			request: FederationRequest::GetCloudNames { user: user.clone() },
		};
		match self.federation.send(provider_id, envelope).await? {
			FederationResponse::CloudNames(names) => Ok(names),
			other => Err(CloudError::Internal(format!(
				"provider {} answered get_cloud_names with {:?}",
				provider_id, other
			))),
		}
	}

	/// Swaps in a new set of local clouds.
	pub fn replace_local_clouds(
		&self,
		default_cloud_name: impl Into<String>,
		connectors: HashMap<String, LocalCloudConnector>,
	) {
		let default_cloud_name = default_cloud_name.into();
		tracing::info!(
			default_cloud = %default_cloud_name,
			clouds = connectors.len(),
			"Local clouds replaced"
		);
		self.clouds.store(Arc::new(LocalClouds {
			default_cloud_name,
			connectors: wrap(connectors),
		}));
	}
}

fn wrap(
	connectors: HashMap<String, LocalCloudConnector>,
) -> HashMap<String, Arc<LocalCloudConnector>> {
	connectors
		.into_iter()
		.map(|(name, connector)| (name, Arc::new(connector)))
		.collect()
}
