//! Facade for requests made by local users through the HTTP API.

use super::{check_owner, FacadeCore, ReloadUpdate};
use crate::authorization::Operation;
use crate::BrokerError;
use broker_types::{
	truncate_id, ComputeAction, CreateOrderRequest, Image, ImageSummary, InstanceStatus, Order,
	OrderKind, OrderState, OrderView, Quota, ResourceAmounts, ResourceType, SecurityRule,
	SecurityRuleInstance, SystemUser,
};
use std::sync::Arc;
use tracing::instrument;

/// Operations offered to local users.
///
/// The local provider is the requester of every order created here.
#[derive(Clone)]
pub struct ApplicationFacade {
	core: Arc<FacadeCore>,
}

impl ApplicationFacade {
	pub fn new(core: Arc<FacadeCore>) -> Self {
		Self { core }
	}

	pub fn core(&self) -> &Arc<FacadeCore> {
		&self.core
	}

	/// Creates an order and returns its id. Provisioning happens in the background.
	#[instrument(skip_all, fields(user = %user.id))]
	pub async fn create_order(
		&self,
		user: &SystemUser,
		request: CreateOrderRequest,
	) -> Result<String, BrokerError> {
		let _permit = self.core.gate().enter().await;
		self.core.authorize(user, Operation::CreateOrder)?;

		let (provider, cloud_name) = self
			.core
			.resolve_target(request.provider.as_deref(), request.cloud_name.as_deref());
		if provider == self.core.local_provider_id()
			&& !self.core.connectors().local_cloud_names().contains(&cloud_name)
		{
			return Err(BrokerError::InvalidParameter(format!(
				"unknown cloud: {}",
				cloud_name
			)));
		}
		validate_kind(&request.kind)?;
		self.check_references(user, &provider, &request.kind).await?;

		let mut order = Order::new(
			user.clone(),
			self.core.local_provider_id(),
			provider,
			cloud_name,
			request.kind,
		);
		order.requirements = request.requirements;
		let order_id = self.core.controller().activate(order).await?;
		tracing::info!(order_id = %truncate_id(&order_id), "Order created");
		Ok(order_id)
	}

	/// Orders an order refers to must be live, owned by the same user, of the
	/// expected kind and served by the same provider.
	async fn check_references(
		&self,
		user: &SystemUser,
		provider: &str,
		kind: &OrderKind,
	) -> Result<(), BrokerError> {
		let expected: Vec<(&str, ResourceType)> = match kind {
			OrderKind::Compute(spec) => spec
				.network_order_ids
				.iter()
				.map(|id| (id.as_str(), ResourceType::Network))
				.collect(),
			OrderKind::Attachment(spec) => vec![
				(spec.compute_order_id.as_str(), ResourceType::Compute),
				(spec.volume_order_id.as_str(), ResourceType::Volume),
			],
			OrderKind::PublicIp(spec) => {
				vec![(spec.compute_order_id.as_str(), ResourceType::Compute)]
			},
			OrderKind::Network(_) | OrderKind::Volume(_) => Vec::new(),
		};

		for (order_id, resource_type) in expected {
			let referenced = self
				.core
				.controller()
				.get_order(order_id, resource_type)
				.map_err(|_| {
					BrokerError::InvalidParameter(format!(
						"referenced {} order {} does not exist",
						resource_type, order_id
					))
				})?;
			check_owner(&referenced, user)?;
			let snapshot = referenced.snapshot().await;
			if snapshot.provider != provider {
				return Err(BrokerError::InvalidParameter(format!(
					"referenced order {} is served by {}, not {}",
					order_id, snapshot.provider, provider
				)));
			}
			if matches!(snapshot.state, OrderState::Closed | OrderState::Failed) {
				return Err(BrokerError::InvalidParameter(format!(
					"referenced order {} is {}",
					order_id, snapshot.state
				)));
			}
		}
		Ok(())
	}

	/// Current state of an order together with its instance.
	#[instrument(skip_all, fields(order_id = %truncate_id(order_id)))]
	pub async fn get_order(
		&self,
		user: &SystemUser,
		order_id: &str,
		resource_type: ResourceType,
	) -> Result<OrderView, BrokerError> {
		let _permit = self.core.gate().enter().await;
		self.core.authorize(user, Operation::GetOrder)?;
		let order = self.core.controller().get_order(order_id, resource_type)?;
		check_owner(&order, user)?;

		let snapshot = order.snapshot().await;
		let instance = self.core.controller().get_resource_instance(&snapshot).await?;
		Ok(OrderView {
			id: snapshot.id,
			state: snapshot.state,
			provider: snapshot.provider,
			cloud_name: snapshot.cloud_name,
			fault_message: snapshot.fault_message,
			instance,
		})
	}

	#[instrument(skip_all, fields(order_id = %truncate_id(order_id)))]
	pub async fn delete_order(
		&self,
		user: &SystemUser,
		order_id: &str,
		resource_type: ResourceType,
	) -> Result<(), BrokerError> {
		let _permit = self.core.gate().enter().await;
		self.core.authorize(user, Operation::DeleteOrder)?;
		let order = self.core.controller().get_order(order_id, resource_type)?;
		check_owner(&order, user)?;
		self.core.controller().delete(&order).await
	}

	pub async fn get_all_instances_status(
		&self,
		user: &SystemUser,
		resource_type: ResourceType,
	) -> Result<Vec<InstanceStatus>, BrokerError> {
		let _permit = self.core.gate().enter().await;
		self.core.authorize(user, Operation::ListOrders)?;
		Ok(self
			.core
			.controller()
			.get_instances_status(user, resource_type)
			.await)
	}

	/// Resources held by the user's fulfilled orders in one local cloud.
	pub async fn get_user_allocation(
		&self,
		user: &SystemUser,
		provider: Option<&str>,
		cloud_name: Option<&str>,
		resource_type: ResourceType,
	) -> Result<ResourceAmounts, BrokerError> {
		let _permit = self.core.gate().enter().await;
		self.core.authorize(user, Operation::GetUserAllocation)?;
		let (provider, cloud_name) = self.core.resolve_target(provider, cloud_name);
		self.core
			.controller()
			.get_user_allocation(&provider, &cloud_name, user, resource_type)
			.await
	}

	pub async fn get_user_quota(
		&self,
		user: &SystemUser,
		provider: Option<&str>,
		cloud_name: Option<&str>,
		resource_type: ResourceType,
	) -> Result<Quota, BrokerError> {
		let _permit = self.core.gate().enter().await;
		self.core.authorize(user, Operation::GetUserQuota)?;
		let connector = self.core.connector(provider, cloud_name)?;
		Ok(connector.get_user_quota(user, resource_type).await?)
	}

	pub async fn get_all_images(
		&self,
		user: &SystemUser,
		provider: Option<&str>,
		cloud_name: Option<&str>,
	) -> Result<Vec<ImageSummary>, BrokerError> {
		let _permit = self.core.gate().enter().await;
		self.core.authorize(user, Operation::GetImages)?;
		let connector = self.core.connector(provider, cloud_name)?;
		Ok(connector.get_all_images(user).await?)
	}

	pub async fn get_image(
		&self,
		user: &SystemUser,
		provider: Option<&str>,
		cloud_name: Option<&str>,
		image_id: &str,
	) -> Result<Image, BrokerError> {
		let _permit = self.core.gate().enter().await;
		self.core.authorize(user, Operation::GetImages)?;
		let connector = self.core.connector(provider, cloud_name)?;
		Ok(connector.get_image(image_id, user).await?)
	}

	/// Cloud names offered by a provider, the local one when `provider` is `None`.
	pub async fn get_cloud_names(
		&self,
		user: &SystemUser,
		provider: Option<&str>,
	) -> Result<Vec<String>, BrokerError> {
		let _permit = self.core.gate().enter().await;
		self.core.authorize(user, Operation::GetCloudNames)?;
		let (provider, _) = self.core.resolve_target(provider, None);
		Ok(self.core.connectors().cloud_names(&provider, user).await?)
	}

	/// Pauses, hibernates, stops or resumes a fulfilled compute order.
	#[instrument(skip_all, fields(order_id = %truncate_id(order_id), action = %action))]
	pub async fn perform_compute_action(
		&self,
		user: &SystemUser,
		order_id: &str,
		action: ComputeAction,
	) -> Result<(), BrokerError> {
		let _permit = self.core.gate().enter().await;
		self.core.authorize(user, Operation::ComputeAction)?;
		let order = self
			.core
			.controller()
			.get_order(order_id, ResourceType::Compute)?;
		check_owner(&order, user)?;
		let snapshot = self
			.core
			.fulfilled_snapshot(&order, Operation::ComputeAction)
			.await?;
		let connector = self
			.core
			.connectors()
			.connector(&snapshot.provider, &snapshot.cloud_name)?;
		Ok(connector.perform_compute_action(&snapshot, action).await?)
	}

	/// Creates an image from a fulfilled compute order; returns the image id.
	#[instrument(skip_all, fields(order_id = %truncate_id(order_id)))]
	pub async fn take_snapshot(
		&self,
		user: &SystemUser,
		order_id: &str,
		name: &str,
	) -> Result<String, BrokerError> {
		let _permit = self.core.gate().enter().await;
		self.core.authorize(user, Operation::TakeSnapshot)?;
		if name.trim().is_empty() {
			return Err(BrokerError::InvalidParameter("snapshot name is empty".into()));
		}
		let order = self
			.core
			.controller()
			.get_order(order_id, ResourceType::Compute)?;
		check_owner(&order, user)?;
		let snapshot = self
			.core
			.fulfilled_snapshot(&order, Operation::TakeSnapshot)
			.await?;
		let connector = self
			.core
			.connectors()
			.connector(&snapshot.provider, &snapshot.cloud_name)?;
		Ok(connector.take_snapshot(&snapshot, name).await?)
	}

	pub async fn create_security_rule(
		&self,
		user: &SystemUser,
		order_id: &str,
		resource_type: ResourceType,
		rule: SecurityRule,
	) -> Result<String, BrokerError> {
		let _permit = self.core.gate().enter().await;
		self.core.authorize(user, Operation::CreateSecurityRule)?;
		rule.validate().map_err(BrokerError::InvalidParameter)?;
		let order = self.core.controller().get_order(order_id, resource_type)?;
		check_owner(&order, user)?;
		let (snapshot, connector) = self
			.core
			.security_rule_target(&order, Operation::CreateSecurityRule)
			.await?;
		Ok(connector.request_security_rule(&snapshot, &rule).await?)
	}

	pub async fn get_security_rules(
		&self,
		user: &SystemUser,
		order_id: &str,
		resource_type: ResourceType,
	) -> Result<Vec<SecurityRuleInstance>, BrokerError> {
		let _permit = self.core.gate().enter().await;
		self.core.authorize(user, Operation::GetSecurityRules)?;
		let order = self.core.controller().get_order(order_id, resource_type)?;
		check_owner(&order, user)?;
		let (snapshot, connector) = self
			.core
			.security_rule_target(&order, Operation::GetSecurityRules)
			.await?;
		Ok(connector.get_security_rules(&snapshot).await?)
	}

	pub async fn delete_security_rule(
		&self,
		user: &SystemUser,
		order_id: &str,
		resource_type: ResourceType,
		rule_id: &str,
	) -> Result<(), BrokerError> {
		let _permit = self.core.gate().enter().await;
		self.core.authorize(user, Operation::DeleteSecurityRule)?;
		let order = self.core.controller().get_order(order_id, resource_type)?;
		check_owner(&order, user)?;
		let (snapshot, connector) = self
			.core
			.security_rule_target(&order, Operation::DeleteSecurityRule)
			.await?;
		Ok(connector.delete_security_rule(&snapshot, rule_id).await?)
	}

	/// Applies a new set of pluggable components. Admins only.
	pub async fn reload(&self, user: &SystemUser, update: ReloadUpdate) -> Result<(), BrokerError> {
		self.core.reload(user, update).await
	}
}

fn validate_kind(kind: &OrderKind) -> Result<(), BrokerError> {
	let invalid = |message: &str| Err(BrokerError::InvalidParameter(message.to_string()));
	match kind {
		OrderKind::Compute(spec) => {
			if spec.vcpu == 0 || spec.memory_mb == 0 {
				return invalid("compute orders need at least one vCPU and some memory");
			}
			if spec.image_id.trim().is_empty() {
				return invalid("compute orders need an image");
			}
		},
		OrderKind::Network(spec) => {
			if !spec.cidr.contains('/') {
				return invalid("network CIDR must include a prefix length");
			}
		},
		OrderKind::Volume(spec) => {
			if spec.size_gb == 0 {
				return invalid("volume size must be positive");
			}
		},
		OrderKind::Attachment(spec) => {
			if spec.compute_order_id == spec.volume_order_id {
				return invalid("attachment must reference two different orders");
			}
		},
		OrderKind::PublicIp(_) => {},
	}
	Ok(())
}
