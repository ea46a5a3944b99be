//! Connector for orders owned by a peer provider.

use crate::{CloudConnector, CloudError, FederationClient};
use async_trait::async_trait;
use broker_types::{
	truncate_id, ComputeAction, FederationEnvelope, FederationRequest, FederationResponse, Image,
	ImageSummary, Instance, Order, Quota, ResourceType, SecurityRule, SecurityRuleInstance,
	SystemUser,
};
use std::sync::Arc;

/// Forwards operations to the provider that owns the order.
pub struct RemoteCloudConnector {
	local_provider_id: String,
	destination_provider: String,
	cloud_name: String,
	client: Arc<dyn FederationClient>,
}

impl RemoteCloudConnector {
	pub fn new(
		local_provider_id: impl Into<String>,
		destination_provider: impl Into<String>,
		cloud_name: impl Into<String>,
		client: Arc<dyn FederationClient>,
	) -> Self {
		Self {
			local_provider_id: local_provider_id.into(),
			destination_provider: destination_provider.into(),
			cloud_name: cloud_name.into(),
			client,
		}
	}

	async fn send(&self, request: FederationRequest) -> Result<FederationResponse, CloudError> {
		let operation = request.operation();
		let envelope = FederationEnvelope {
			requesting_provider: self.local_provider_id.clone(),
			request,
		};
		self.client
			.send(&self.destination_provider, envelope)
			.await
			.map_err(|e| {
				tracing::debug!(
					destination = %self.destination_provider,
					operation,
					condition = %e.condition,
					"Federation request failed"
				);
				CloudError::from(e)
			})
	}

	fn unexpected(&self, operation: &str, response: FederationResponse) -> CloudError {
		CloudError::Internal(format!(
			"provider {} answered {} with unexpected payload {:?}",
			self.destination_provider, operation, response
		))
	}
}

#[async_trait]
impl CloudConnector for RemoteCloudConnector {
	async fn request_instance(&self, order: &Order) -> Result<Option<String>, CloudError> {
		match self
			.send(FederationRequest::CreateOrder {
				order: order.clone(),
			})
			.await?
		{
			FederationResponse::Empty => {
				tracing::debug!(
					order_id = %truncate_id(&order.id),
					destination = %self.destination_provider,
					"Order forwarded"
				);
				Ok(None)
			},
			other => Err(self.unexpected("create_order", other)),
		}
	}

	async fn delete_instance(&self, order: &Order) -> Result<(), CloudError> {
		let result = self
			.send(FederationRequest::DeleteOrder {
				order_id: order.id.clone(),
				user: order.user.clone(),
				resource_type: order.resource_type(),
			})
			.await;
		match result {
			Ok(_) => Ok(()),
			// The peer no longer knows the order, so it holds nothing for us.
			Err(CloudError::NotFound(_)) => Ok(()),
			Err(e) => Err(e),
		}
	}

	async fn get_instance(&self, order: &Order) -> Result<Instance, CloudError> {
		match self
			.send(FederationRequest::GetOrderInstance {
				order_id: order.id.clone(),
				user: order.user.clone(),
				resource_type: order.resource_type(),
			})
			.await?
		{
			FederationResponse::Instance(instance) => Ok(instance),
			other => Err(self.unexpected("get_order_instance", other)),
		}
	}

	async fn get_user_quota(
		&self,
		user: &SystemUser,
		resource_type: ResourceType,
	) -> Result<Quota, CloudError> {
		match self
			.send(FederationRequest::GetUserQuota {
				cloud_name: self.cloud_name.clone(),
				user: user.clone(),
				resource_type,
			})
			.await?
		{
			FederationResponse::Quota(quota) => Ok(quota),
			other => Err(self.unexpected("get_user_quota", other)),
		}
	}

	async fn get_all_images(&self, user: &SystemUser) -> Result<Vec<ImageSummary>, CloudError> {
		match self
			.send(FederationRequest::GetAllImages {
				cloud_name: self.cloud_name.clone(),
				user: user.clone(),
			})
			.await?
		{
			FederationResponse::Images(images) => Ok(images),
			other => Err(self.unexpected("get_all_images", other)),
		}
	}

	async fn get_image(&self, image_id: &str, user: &SystemUser) -> Result<Image, CloudError> {
		match self
			.send(FederationRequest::GetImage {
				cloud_name: self.cloud_name.clone(),
				image_id: image_id.to_string(),
				user: user.clone(),
			})
			.await?
		{
			FederationResponse::Image(image) => Ok(image),
			other => Err(self.unexpected("get_image", other)),
		}
	}

	async fn perform_compute_action(
		&self,
		order: &Order,
		action: ComputeAction,
	) -> Result<(), CloudError> {
		Err(CloudError::NotImplemented(format!(
			"{} is not available for order {} owned by {}",
			action, order.id, self.destination_provider
		)))
	}

	async fn take_snapshot(&self, order: &Order, _name: &str) -> Result<String, CloudError> {
		Err(CloudError::NotImplemented(format!(
			"snapshot is not available for order {} owned by {}",
			order.id, self.destination_provider
		)))
	}

	async fn request_security_rule(
		&self,
		order: &Order,
		rule: &SecurityRule,
	) -> Result<String, CloudError> {
		match self
			.send(FederationRequest::CreateSecurityRule {
				order_id: order.id.clone(),
				user: order.user.clone(),
				rule: rule.clone(),
			})
			.await?
		{
			FederationResponse::SecurityRuleId(id) => Ok(id),
			other => Err(self.unexpected("create_security_rule", other)),
		}
	}

	async fn get_security_rules(
		&self,
		order: &Order,
	) -> Result<Vec<SecurityRuleInstance>, CloudError> {
		match self
			.send(FederationRequest::GetSecurityRules {
				order_id: order.id.clone(),
				user: order.user.clone(),
			})
			.await?
		{
			FederationResponse::SecurityRules(rules) => Ok(rules),
			other => Err(self.unexpected("get_security_rules", other)),
		}
	}

	async fn delete_security_rule(&self, order: &Order, rule_id: &str) -> Result<(), CloudError> {
		self.send(FederationRequest::DeleteSecurityRule {
			order_id: order.id.clone(),
			user: order.user.clone(),
			rule_id: rule_id.to_string(),
		})
		.await
		.map(|_| ())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use broker_types::{ErrorCondition, FederationError, InstanceState, OrderKind, VolumeSpec};
	use tokio::sync::Mutex;

	/// Records envelopes and answers with a canned result.
	struct CannedClient {
		reply: Result<FederationResponse, FederationError>,
		sent: Mutex<Vec<(String, FederationEnvelope)>>,
	}

	impl CannedClient {
		fn new(reply: Result<FederationResponse, FederationError>) -> Arc<Self> {
			Arc::new(Self {
				reply,
				sent: Mutex::new(Vec::new()),
			})
		}
	}

	#[async_trait]
	impl FederationClient for CannedClient {
		async fn send(
			&self,
			destination_provider: &str,
			envelope: FederationEnvelope,
		) -> Result<FederationResponse, FederationError> {
			self.sent
				.lock()
				.await
				.push((destination_provider.to_string(), envelope));
			self.reply.clone()
		}
	}

	fn order() -> Order {
		Order::new(
			SystemUser::new("u1", "User", "idp"),
			"provider-a",
			"provider-b",
			"default",
			OrderKind::Volume(VolumeSpec {
				name: None,
				size_gb: 5,
			}),
		)
	}

	fn connector(client: Arc<CannedClient>) -> RemoteCloudConnector {
		RemoteCloudConnector::new("provider-a", "provider-b", "default", client)
	}

	#[tokio::test]
	async fn test_request_instance_forwards_order_and_returns_none() {
		let client = CannedClient::new(Ok(FederationResponse::Empty));
		let order = order();
		let result = connector(client.clone()).request_instance(&order).await;
		assert_eq!(result, Ok(None));

		let sent = client.sent.lock().await;
		assert_eq!(sent.len(), 1);
		assert_eq!(sent[0].0, "provider-b");
		assert_eq!(sent[0].1.requesting_provider, "provider-a");
		assert_eq!(
			sent[0].1.request,
			FederationRequest::CreateOrder { order: order.clone() }
		);
	}

	#[tokio::test]
	async fn test_remote_not_found_on_delete_is_success() {
		let client = CannedClient::new(Err(FederationError::new(
			ErrorCondition::NotFound,
			"unknown order",
		)));
		assert!(connector(client).delete_instance(&order()).await.is_ok());
	}

	#[tokio::test]
	async fn test_peer_condition_is_preserved() {
		let client = CannedClient::new(Err(FederationError::new(
			ErrorCondition::Forbidden,
			"denied",
		)));
		let err = connector(client).get_instance(&order()).await.unwrap_err();
		assert_eq!(err, CloudError::Unauthorized("denied".into()));
	}

	#[tokio::test]
	async fn test_unexpected_payload_is_internal_error() {
		let client = CannedClient::new(Ok(FederationResponse::CloudNames(vec![])));
		let err = connector(client).get_instance(&order()).await.unwrap_err();
		assert!(matches!(err, CloudError::Internal(_)));
	}

	#[tokio::test]
	async fn test_get_instance_returns_peer_view() {
		let instance = Instance::new("vol-9", InstanceState::Ready, ResourceType::Volume);
		let client = CannedClient::new(Ok(FederationResponse::Instance(instance.clone())));
		assert_eq!(
			connector(client).get_instance(&order()).await.unwrap(),
			instance
		);
	}

	#[tokio::test]
	async fn test_compute_actions_are_not_forwarded() {
		let client = CannedClient::new(Ok(FederationResponse::Empty));
		let err = connector(client.clone())
			.perform_compute_action(&order(), ComputeAction::Stop)
			.await
			.unwrap_err();
		assert!(matches!(err, CloudError::NotImplemented(_)));
		assert!(client.sent.lock().await.is_empty());
	}
}
