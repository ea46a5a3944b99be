//! Order-level operations shared by both facades.

use crate::registry::{OrderRegistry, SharedOrder};
use crate::state::StateTransitioner;
use crate::BrokerError;
use broker_cloud::CloudConnectorFactory;
use broker_types::{
	truncate_id, Instance, InstanceState, InstanceStatus, Order, OrderKind, OrderState,
	ResourceAmounts, ResourceType, SystemUser,
};
use std::sync::Arc;
use tracing::instrument;

/// Looks up, creates and closes orders on behalf of the facades.
pub struct OrderController {
	local_provider_id: String,
	registry: Arc<OrderRegistry>,
	transitioner: Arc<StateTransitioner>,
	connectors: Arc<CloudConnectorFactory>,
}

impl OrderController {
	pub fn new(
		local_provider_id: impl Into<String>,
		registry: Arc<OrderRegistry>,
		transitioner: Arc<StateTransitioner>,
		connectors: Arc<CloudConnectorFactory>,
	) -> Self {
		Self {
			local_provider_id: local_provider_id.into(),
			registry,
			transitioner,
			connectors,
		}
	}

	pub fn local_provider_id(&self) -> &str {
		&self.local_provider_id
	}

	pub fn transitioner(&self) -> &Arc<StateTransitioner> {
		&self.transitioner
	}

	/// Registers a new OPEN order and returns its id.
	pub async fn activate(&self, order: Order) -> Result<String, BrokerError> {
		let shared = self.transitioner.activate(order).await?;
		Ok(shared.id().to_string())
	}

	/// Finds an active order of the given kind.
	///
	/// A kind mismatch is reported as not found, like a missing order.
	pub fn get_order(
		&self,
		order_id: &str,
		resource_type: ResourceType,
	) -> Result<SharedOrder, BrokerError> {
		self.registry
			.get(order_id)
			.filter(|order| order.resource_type() == resource_type)
			.ok_or_else(|| {
				BrokerError::NotFound(format!("{} order {}", resource_type, order_id))
			})
	}

	/// Finds an active order of any kind.
	pub fn find(&self, order_id: &str) -> Result<SharedOrder, BrokerError> {
		self.registry
			.get(order_id)
			.ok_or_else(|| BrokerError::NotFound(format!("order {}", order_id)))
	}

	/// Moves an order to CLOSED so the closed processor releases it.
	#[instrument(skip_all, fields(order_id = %truncate_id(order.id())))]
	pub async fn delete(&self, order: &SharedOrder) -> Result<(), BrokerError> {
		self.check_no_dependents(order).await?;

		let mut locked = order.lock().await;
		if locked.state == OrderState::Closed {
			return Err(BrokerError::NotAcceptable(format!(
				"order {} is already closed",
				order.id()
			)));
		}
		self.transitioner
			.transition(&mut locked, OrderState::Closed)
			.await?;
		Ok(())
	}

	/// Compute and volume orders cannot be closed while an attachment or
	/// public IP that uses them is still open.
	async fn check_no_dependents(&self, order: &SharedOrder) -> Result<(), BrokerError> {
		if !matches!(
			order.resource_type(),
			ResourceType::Compute | ResourceType::Volume
		) {
			return Ok(());
		}
		for candidate in self.registry.active_orders() {
			if !matches!(
				candidate.resource_type(),
				ResourceType::Attachment | ResourceType::PublicIp
			) || !candidate.references().iter().any(|id| id == order.id())
			{
				continue;
			}
			let state = candidate.lock().await.state;
			if state != OrderState::Closed {
				return Err(BrokerError::NotAcceptable(format!(
					"order {} is still used by {} order {}",
					order.id(),
					candidate.resource_type(),
					candidate.id()
				)));
			}
		}
		Ok(())
	}

	/// Current view of the resource behind an order.
	///
	/// Orders that were never provisioned, or remote orders the owner has not
	/// answered for yet, get an instance built from the order's own state.
	pub async fn get_resource_instance(&self, order: &Order) -> Result<Instance, BrokerError> {
		if order.is_provider_local(&self.local_provider_id) {
			if order.instance_id.is_none() {
				return Ok(synthesized_instance(order));
			}
			let connector = self
				.connectors
				.connector(&order.provider, &order.cloud_name)?;
			return Ok(connector.get_instance(order).await?);
		}

		match order.state {
			OrderState::Open | OrderState::Failed => Ok(synthesized_instance(order)),
			OrderState::Pending => {
				let connector = self
					.connectors
					.connector(&order.provider, &order.cloud_name)?;
				match connector.get_instance(order).await {
					Ok(instance) => Ok(instance),
					Err(e) => {
						tracing::debug!(
							order_id = %truncate_id(&order.id),
							error = %e,
							"Owner has no instance yet"
						);
						Ok(synthesized_instance(order))
					},
				}
			},
			_ => {
				let connector = self
					.connectors
					.connector(&order.provider, &order.cloud_name)?;
				Ok(connector.get_instance(order).await?)
			},
		}
	}

	/// Status of every active order of a kind owned by `user`, oldest first.
	pub async fn get_instances_status(
		&self,
		user: &SystemUser,
		resource_type: ResourceType,
	) -> Vec<InstanceStatus> {
		let mut statuses = Vec::new();
		for order in self.registry.active_orders() {
			if order.resource_type() != resource_type || !order.user().same_principal(user) {
				continue;
			}
			let locked = order.lock().await;
			statuses.push((
				locked.created_at,
				InstanceStatus {
					order_id: locked.id.clone(),
					resource_type,
					provider: locked.provider.clone(),
					cloud_name: locked.cloud_name.clone(),
					state: locked.state,
				},
			));
		}
		statuses.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.order_id.cmp(&b.1.order_id)));
		statuses.into_iter().map(|(_, status)| status).collect()
	}

	/// Resources held by FULFILLED local orders of `user` in one cloud.
	pub async fn get_user_allocation(
		&self,
		provider: &str,
		cloud_name: &str,
		user: &SystemUser,
		resource_type: ResourceType,
	) -> Result<ResourceAmounts, BrokerError> {
		if provider != self.local_provider_id {
			return Err(BrokerError::InvalidParameter(format!(
				"allocation is only tracked for provider {}",
				self.local_provider_id
			)));
		}

		let mut allocation = ResourceAmounts::default();
		for order in self.registry.active_orders() {
			if order.resource_type() != resource_type || !order.user().same_principal(user) {
				continue;
			}
			let locked = order.lock().await;
			if locked.state != OrderState::Fulfilled
				|| locked.cloud_name != cloud_name
				|| !locked.is_provider_local(&self.local_provider_id)
			{
				continue;
			}
			let used = match &locked.kind {
				OrderKind::Compute(spec) => ResourceAmounts {
					instances: 1,
					vcpu: spec.vcpu,
					ram_mb: spec.memory_mb,
					disk_gb: spec.disk_gb,
					..Default::default()
				},
				OrderKind::Volume(spec) => ResourceAmounts {
					volumes: 1,
					disk_gb: spec.size_gb,
					..Default::default()
				},
				OrderKind::Network(_) => ResourceAmounts {
					networks: 1,
					..Default::default()
				},
				OrderKind::PublicIp(_) => ResourceAmounts {
					public_ips: 1,
					..Default::default()
				},
				OrderKind::Attachment(_) => ResourceAmounts::default(),
			};
			allocation = allocation.saturating_add(&used);
		}
		Ok(allocation)
	}
}

/// Instance view derived from the order alone.
pub fn synthesized_instance(order: &Order) -> Instance {
	let state = order.cached_instance_state.unwrap_or(match order.state {
		OrderState::Open | OrderState::Pending | OrderState::Spawning => InstanceState::Creating,
		OrderState::Fulfilled => InstanceState::Ready,
		OrderState::Failed | OrderState::FailedAfterSuccessfulRequest => InstanceState::Failed,
		OrderState::Closed | OrderState::Deactivated => InstanceState::Unavailable,
	});
	let mut instance = Instance::new(
		order.instance_id.clone().unwrap_or_else(|| order.id.clone()),
		state,
		order.resource_type(),
	);
	if let Some(fault) = &order.fault_message {
		instance = instance.with_attribute("fault", fault);
	}
	instance
}
