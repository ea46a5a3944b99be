//! Per-cloud plugin capabilities.
//!
//! A cloud implementation provides one [`CloudPlugin`] per resource type plus
//! quota and image lookups. [`PluginSet`] groups them; dispatch on the order
//! kind is a match on [`ResourceType`].

use crate::{CloudCredential, CloudError};
use async_trait::async_trait;
use broker_types::{
	ComputeAction, Image, ImageSummary, Instance, Order, Quota, ResourceType, SecurityRule,
	SecurityRuleInstance,
};
use std::sync::Arc;

fn unsupported(operation: &str, order: &Order) -> CloudError {
	CloudError::NotImplemented(format!(
		"{} is not supported for {} orders",
		operation,
		order.resource_type()
	))
}

/// Lifecycle operations for one resource type.
///
/// Only the three provisioning operations are mandatory; the others default to
/// `NotImplemented`.
#[async_trait]
pub trait CloudPlugin: Send + Sync {
	/// Provisions the resource and returns the cloud's instance id.
	async fn request_instance(
		&self,
		order: &Order,
		credential: &CloudCredential,
	) -> Result<String, CloudError>;

	async fn get_instance(
		&self,
		order: &Order,
		credential: &CloudCredential,
	) -> Result<Instance, CloudError>;

	async fn delete_instance(
		&self,
		order: &Order,
		credential: &CloudCredential,
	) -> Result<(), CloudError>;

	async fn perform_action(
		&self,
		order: &Order,
		_action: ComputeAction,
		_credential: &CloudCredential,
	) -> Result<(), CloudError> {
		Err(unsupported("compute action", order))
	}

	async fn take_snapshot(
		&self,
		order: &Order,
		_name: &str,
		_credential: &CloudCredential,
	) -> Result<String, CloudError> {
		Err(unsupported("snapshot", order))
	}

	async fn request_security_rule(
		&self,
		order: &Order,
		_rule: &SecurityRule,
		_credential: &CloudCredential,
	) -> Result<String, CloudError> {
		Err(unsupported("security rule", order))
	}

	async fn get_security_rules(
		&self,
		order: &Order,
		_credential: &CloudCredential,
	) -> Result<Vec<SecurityRuleInstance>, CloudError> {
		Err(unsupported("security rule", order))
	}

	async fn delete_security_rule(
		&self,
		order: &Order,
		_rule_id: &str,
		_credential: &CloudCredential,
	) -> Result<(), CloudError> {
		Err(unsupported("security rule", order))
	}
}

#[async_trait]
pub trait QuotaPlugin: Send + Sync {
	async fn get_user_quota(
		&self,
		resource_type: ResourceType,
		credential: &CloudCredential,
	) -> Result<Quota, CloudError>;
}

#[async_trait]
pub trait ImagePlugin: Send + Sync {
	async fn get_all_images(
		&self,
		credential: &CloudCredential,
	) -> Result<Vec<ImageSummary>, CloudError>;

	async fn get_image(
		&self,
		image_id: &str,
		credential: &CloudCredential,
	) -> Result<Image, CloudError>;
}

/// The plugins serving one cloud.
#[derive(Clone)]
pub struct PluginSet {
	pub compute: Arc<dyn CloudPlugin>,
	pub network: Arc<dyn CloudPlugin>,
	pub volume: Arc<dyn CloudPlugin>,
	pub attachment: Arc<dyn CloudPlugin>,
	pub public_ip: Arc<dyn CloudPlugin>,
	pub quota: Arc<dyn QuotaPlugin>,
	pub image: Arc<dyn ImagePlugin>,
}

impl PluginSet {
	/// Uses one implementation for every slot.
	pub fn uniform<P>(plugin: Arc<P>) -> Self
	where
		P: CloudPlugin + QuotaPlugin + ImagePlugin + 'static,
	{
		Self {
			compute: plugin.clone(),
			network: plugin.clone(),
			volume: plugin.clone(),
			attachment: plugin.clone(),
			public_ip: plugin.clone(),
			quota: plugin.clone(),
			image: plugin,
		}
	}

	pub fn plugin_for(&self, resource_type: ResourceType) -> &Arc<dyn CloudPlugin> {
		match resource_type {
			ResourceType::Compute => &self.compute,
			ResourceType::Network => &self.network,
			ResourceType::Volume => &self.volume,
			ResourceType::Attachment => &self.attachment,
			ResourceType::PublicIp => &self.public_ip,
		}
	}
}
