//! Connector for the clouds of the local provider.

use crate::{CloudConnector, CloudError, CredentialMapper, PluginSet};
use async_trait::async_trait;
use broker_types::{
	truncate_id, ComputeAction, Image, ImageSummary, Instance, Order, Quota, ResourceType,
	SecurityRule, SecurityRuleInstance, SystemUser,
};
use std::sync::Arc;

/// Serves one local cloud by dispatching to its plugins.
pub struct LocalCloudConnector {
	cloud_name: String,
	plugins: PluginSet,
	mapper: Arc<dyn CredentialMapper>,
}

impl LocalCloudConnector {
	pub fn new(
		cloud_name: impl Into<String>,
		plugins: PluginSet,
		mapper: Arc<dyn CredentialMapper>,
	) -> Self {
		Self {
			cloud_name: cloud_name.into(),
			plugins,
			mapper,
		}
	}

	pub fn cloud_name(&self) -> &str {
		&self.cloud_name
	}

	fn instance_id<'a>(&self, order: &'a Order) -> Result<&'a str, CloudError> {
		order
			.instance_id
			.as_deref()
			.ok_or_else(|| CloudError::NotFound(format!("order {} has no instance", order.id)))
	}
}

#[async_trait]
impl CloudConnector for LocalCloudConnector {
	async fn request_instance(&self, order: &Order) -> Result<Option<String>, CloudError> {
		let credential = self.mapper.map(&order.user).await?;
		let instance_id = self
			.plugins
			.plugin_for(order.resource_type())
			.request_instance(order, &credential)
			.await?;
		if instance_id.is_empty() {
			return Err(CloudError::ProviderRejected(format!(
				"cloud {} returned no instance id",
				self.cloud_name
			)));
		}
		tracing::debug!(
			order_id = %truncate_id(&order.id),
			cloud = %self.cloud_name,
			instance_id = %instance_id,
			"Instance requested"
		);
		Ok(Some(instance_id))
	}

	async fn delete_instance(&self, order: &Order) -> Result<(), CloudError> {
		// Nothing was provisioned, so there is nothing to release.
		if order.instance_id.is_none() {
			return Ok(());
		}
		let credential = self.mapper.map(&order.user).await?;
		self.plugins
			.plugin_for(order.resource_type())
			.delete_instance(order, &credential)
			.await
	}

	async fn get_instance(&self, order: &Order) -> Result<Instance, CloudError> {
		self.instance_id(order)?;
		let credential = self.mapper.map(&order.user).await?;
		self.plugins
			.plugin_for(order.resource_type())
			.get_instance(order, &credential)
			.await
	}

	async fn get_user_quota(
		&self,
		user: &SystemUser,
		resource_type: ResourceType,
	) -> Result<Quota, CloudError> {
		let credential = self.mapper.map(user).await?;
		self.plugins
			.quota
			.get_user_quota(resource_type, &credential)
			.await
	}

	async fn get_all_images(&self, user: &SystemUser) -> Result<Vec<ImageSummary>, CloudError> {
		let credential = self.mapper.map(user).await?;
		self.plugins.image.get_all_images(&credential).await
	}

	async fn get_image(&self, image_id: &str, user: &SystemUser) -> Result<Image, CloudError> {
		let credential = self.mapper.map(user).await?;
		self.plugins.image.get_image(image_id, &credential).await
	}

	async fn perform_compute_action(
		&self,
		order: &Order,
		action: ComputeAction,
	) -> Result<(), CloudError> {
		self.instance_id(order)?;
		let credential = self.mapper.map(&order.user).await?;
		self.plugins
			.compute
			.perform_action(order, action, &credential)
			.await
	}

	async fn take_snapshot(&self, order: &Order, name: &str) -> Result<String, CloudError> {
		self.instance_id(order)?;
		let credential = self.mapper.map(&order.user).await?;
		self.plugins
			.compute
			.take_snapshot(order, name, &credential)
			.await
	}

	async fn request_security_rule(
		&self,
		order: &Order,
		rule: &SecurityRule,
	) -> Result<String, CloudError> {
		rule.validate().map_err(CloudError::InvalidParameter)?;
		self.instance_id(order)?;
		let credential = self.mapper.map(&order.user).await?;
		self.plugins
			.plugin_for(order.resource_type())
			.request_security_rule(order, rule, &credential)
			.await
	}

	async fn get_security_rules(
		&self,
		order: &Order,
	) -> Result<Vec<SecurityRuleInstance>, CloudError> {
		self.instance_id(order)?;
		let credential = self.mapper.map(&order.user).await?;
		self.plugins
			.plugin_for(order.resource_type())
			.get_security_rules(order, &credential)
			.await
	}

	async fn delete_security_rule(&self, order: &Order, rule_id: &str) -> Result<(), CloudError> {
		self.instance_id(order)?;
		let credential = self.mapper.map(&order.user).await?;
		self.plugins
			.plugin_for(order.resource_type())
			.delete_security_rule(order, rule_id, &credential)
			.await
	}
}
