//! Facade for requests arriving from peer providers.
//!
//! Every request that touches an existing order is checked for consistency
//! before anything else: the order must be owned by this provider and must
//! have been requested by the provider that sends the request. Event
//! notifications go the other way, from the owner to the requester.

use super::{check_owner, FacadeCore};
use crate::authorization::Operation;
use crate::registry::SharedOrder;
use crate::{BrokerError, ConsistencyError};
use broker_types::{
	truncate_id, FederationEnvelope, FederationError, FederationRequest, FederationResponse,
	InstanceState, Order, OrderState, RemoteEvent, ResourceType, SecurityRule, SystemUser,
};
use std::sync::Arc;
use tracing::instrument;

/// An empty cloud name stands for the default cloud.
fn named(cloud_name: &str) -> Option<&str> {
	Some(cloud_name).filter(|name| !name.is_empty())
}

#[derive(Clone)]
pub struct RemoteFacade {
	core: Arc<FacadeCore>,
}

impl RemoteFacade {
	pub fn new(core: Arc<FacadeCore>) -> Self {
		Self { core }
	}

	/// Serves one federation request.
	#[instrument(skip_all, fields(
		requester = %envelope.requesting_provider,
		operation = envelope.request.operation(),
	))]
	pub async fn handle(
		&self,
		envelope: FederationEnvelope,
	) -> Result<FederationResponse, FederationError> {
		let _permit = self.core.gate().enter().await;
		let requester = envelope.requesting_provider;
		let result = match envelope.request {
			FederationRequest::CreateOrder { order } => self
				.create_order(&requester, order)
				.await
				.map(|()| FederationResponse::Empty),
			FederationRequest::GetOrderInstance {
				order_id,
				user,
				resource_type,
			} => self
				.get_order_instance(&requester, &order_id, &user, resource_type)
				.await,
			FederationRequest::DeleteOrder {
				order_id,
				user,
				resource_type,
			} => self
				.delete_order(&requester, &order_id, &user, resource_type)
				.await
				.map(|()| FederationResponse::Empty),
			FederationRequest::GetUserQuota {
				cloud_name,
				user,
				resource_type,
			} => self.get_user_quota(&cloud_name, &user, resource_type).await,
			FederationRequest::GetImage {
				cloud_name,
				image_id,
				user,
			} => self.get_image(&cloud_name, &image_id, &user).await,
			FederationRequest::GetAllImages { cloud_name, user } => {
				self.get_all_images(&cloud_name, &user).await
			},
			FederationRequest::GetCloudNames { user } => self
				.core
				.authorize(&user, Operation::GetCloudNames)
				.map(|()| FederationResponse::CloudNames(self.core.connectors().local_cloud_names())),
			FederationRequest::CreateSecurityRule {
				order_id,
				user,
				rule,
			} => self
				.create_security_rule(&requester, &order_id, &user, rule)
				.await,
			FederationRequest::GetSecurityRules { order_id, user } => {
				self.get_security_rules(&requester, &order_id, &user).await
			},
			FederationRequest::DeleteSecurityRule {
				order_id,
				user,
				rule_id,
			} => self
				.delete_security_rule(&requester, &order_id, &user, &rule_id)
				.await
				.map(|()| FederationResponse::Empty),
			FederationRequest::NotifyEvent { order, event } => self
				.notify_event(&requester, &order, event)
				.await
				.map(|()| FederationResponse::Empty),
		};

		result.map_err(|e| {
			tracing::debug!(error = %e, "Federation request failed");
			FederationError::from(e)
		})
	}

	/// The order must belong to this provider and come from `requester`.
	fn check_consistency(&self, order: &Order, requester: &str) -> Result<(), BrokerError> {
		if !order.is_provider_local(self.core.local_provider_id()) {
			return Err(ConsistencyError::ProviderMismatch {
				expected: self.core.local_provider_id().to_string(),
				actual: order.provider.clone(),
			}
			.into());
		}
		if order.requester != requester {
			return Err(ConsistencyError::RequesterMismatch {
				declared: requester.to_string(),
				actual: order.requester.clone(),
			}
			.into());
		}
		Ok(())
	}

	/// Looks up a local order on behalf of `requester` and `user`.
	async fn find_order(
		&self,
		requester: &str,
		order_id: &str,
		user: &SystemUser,
		resource_type: Option<ResourceType>,
		operation: Operation,
	) -> Result<(SharedOrder, Order), BrokerError> {
		let controller = self.core.controller();
		let order = match resource_type {
			Some(resource_type) => controller.get_order(order_id, resource_type)?,
			None => controller.find(order_id)?,
		};
		let snapshot = order.snapshot().await;
		self.check_consistency(&snapshot, requester)?;
		self.core.authorize(user, operation)?;
		check_owner(&order, user)?;
		Ok((order, snapshot))
	}

	async fn create_order(&self, requester: &str, mut order: Order) -> Result<(), BrokerError> {
		self.check_consistency(&order, requester)?;
		self.core.authorize(&order.user, Operation::CreateOrder)?;

		// A requester whose reply or own write was lost sends the same order again.
		if let Ok(existing) = self.core.controller().find(&order.id) {
			let existing = existing.snapshot().await;
			if existing.requester == requester && existing.user == order.user {
				tracing::debug!(order_id = %truncate_id(&order.id), "Order already accepted");
				return Ok(());
			}
			return Err(BrokerError::Conflict(format!(
				"order {} already exists",
				order.id
			)));
		}

		if order.cloud_name.is_empty() {
			order.cloud_name = self.core.connectors().default_cloud_name();
		}
		if !self
			.core
			.connectors()
			.local_cloud_names()
			.contains(&order.cloud_name)
		{
			return Err(BrokerError::InvalidParameter(format!(
				"unknown cloud: {}",
				order.cloud_name
			)));
		}
		order.state = OrderState::Open;
		order.instance_id = None;
		order.cached_instance_state = None;
		order.fault_message = None;

		let order_id = self.core.controller().activate(order).await?;
		tracing::info!(order_id = %truncate_id(&order_id), "Accepted order from peer");
		Ok(())
	}

	async fn get_order_instance(
		&self,
		requester: &str,
		order_id: &str,
		user: &SystemUser,
		resource_type: ResourceType,
	) -> Result<FederationResponse, BrokerError> {
		let (_, snapshot) = self
			.find_order(requester, order_id, user, Some(resource_type), Operation::GetOrder)
			.await?;
		let instance = self.core.controller().get_resource_instance(&snapshot).await?;
		Ok(FederationResponse::Instance(instance))
	}

	/// Closing an order that is already closed succeeds, so a requester can
	/// retry a deletion whose reply it lost.
	async fn delete_order(
		&self,
		requester: &str,
		order_id: &str,
		user: &SystemUser,
		resource_type: ResourceType,
	) -> Result<(), BrokerError> {
		let (order, snapshot) = self
			.find_order(requester, order_id, user, Some(resource_type), Operation::DeleteOrder)
			.await?;
		if snapshot.state == OrderState::Closed {
			return Ok(());
		}
		self.core.controller().delete(&order).await
	}

	async fn get_user_quota(
		&self,
		cloud_name: &str,
		user: &SystemUser,
		resource_type: ResourceType,
	) -> Result<FederationResponse, BrokerError> {
		self.core.authorize(user, Operation::GetUserQuota)?;
		let connector = self.core.connector(None, named(cloud_name))?;
		Ok(FederationResponse::Quota(
			connector.get_user_quota(user, resource_type).await?,
		))
	}

	async fn get_image(
		&self,
		cloud_name: &str,
		image_id: &str,
		user: &SystemUser,
	) -> Result<FederationResponse, BrokerError> {
		self.core.authorize(user, Operation::GetImages)?;
		let connector = self.core.connector(None, named(cloud_name))?;
		Ok(FederationResponse::Image(
			connector.get_image(image_id, user).await?,
		))
	}

	async fn get_all_images(
		&self,
		cloud_name: &str,
		user: &SystemUser,
	) -> Result<FederationResponse, BrokerError> {
		self.core.authorize(user, Operation::GetImages)?;
		let connector = self.core.connector(None, named(cloud_name))?;
		Ok(FederationResponse::Images(
			connector.get_all_images(user).await?,
		))
	}

	async fn create_security_rule(
		&self,
		requester: &str,
		order_id: &str,
		user: &SystemUser,
		rule: SecurityRule,
	) -> Result<FederationResponse, BrokerError> {
		rule.validate().map_err(BrokerError::InvalidParameter)?;
		let (order, _) = self
			.find_order(requester, order_id, user, None, Operation::CreateSecurityRule)
			.await?;
		let (snapshot, connector) = self
			.core
			.security_rule_target(&order, Operation::CreateSecurityRule)
			.await?;
		Ok(FederationResponse::SecurityRuleId(
			connector.request_security_rule(&snapshot, &rule).await?,
		))
	}

	async fn get_security_rules(
		&self,
		requester: &str,
		order_id: &str,
		user: &SystemUser,
	) -> Result<FederationResponse, BrokerError> {
		let (order, _) = self
			.find_order(requester, order_id, user, None, Operation::GetSecurityRules)
			.await?;
		let (snapshot, connector) = self
			.core
			.security_rule_target(&order, Operation::GetSecurityRules)
			.await?;
		Ok(FederationResponse::SecurityRules(
			connector.get_security_rules(&snapshot).await?,
		))
	}

	async fn delete_security_rule(
		&self,
		requester: &str,
		order_id: &str,
		user: &SystemUser,
		rule_id: &str,
	) -> Result<(), BrokerError> {
		let (order, _) = self
			.find_order(requester, order_id, user, None, Operation::DeleteSecurityRule)
			.await?;
		let (snapshot, connector) = self
			.core
			.security_rule_target(&order, Operation::DeleteSecurityRule)
			.await?;
		Ok(connector.delete_security_rule(&snapshot, rule_id).await?)
	}

	/// Applies an event signalled by the provider that owns one of our orders.
	///
	/// FULFILLED moves a PENDING or FAILED_AFTER_SUCCESSFUL_REQUEST order to
	/// FULFILLED. FAILED moves a PENDING order to FAILED_AFTER_SUCCESSFUL_REQUEST
	/// and a FULFILLED one to FAILED. Events that do not fit the current state
	/// are dropped.
	#[instrument(skip_all, fields(order_id = %truncate_id(&remote.id), event = ?event))]
	pub async fn notify_event(
		&self,
		signalling_provider: &str,
		remote: &Order,
		event: RemoteEvent,
	) -> Result<(), BrokerError> {
		let order = self.core.controller().find(&remote.id)?;
		let mut locked = order.lock().await;
		if locked.provider != signalling_provider {
			return Err(ConsistencyError::ProviderMismatch {
				expected: locked.provider.clone(),
				actual: signalling_provider.to_string(),
			}
			.into());
		}
		if locked.requester != self.core.local_provider_id() {
			return Err(ConsistencyError::RequesterMismatch {
				declared: self.core.local_provider_id().to_string(),
				actual: locked.requester.clone(),
			}
			.into());
		}

		let target = match (event, locked.state) {
			(
				RemoteEvent::InstanceFulfilled,
				OrderState::Pending | OrderState::FailedAfterSuccessfulRequest,
			) => OrderState::Fulfilled,
			(RemoteEvent::InstanceFailed, OrderState::Pending) => {
				OrderState::FailedAfterSuccessfulRequest
			},
			(RemoteEvent::InstanceFailed, OrderState::Fulfilled) => OrderState::Failed,
			(_, state) => {
				tracing::debug!(state = %state, "Event does not apply to current state");
				return Ok(());
			},
		};

		let observed = remote.cached_instance_state.unwrap_or(match event {
			RemoteEvent::InstanceFulfilled => InstanceState::Ready,
			RemoteEvent::InstanceFailed => InstanceState::Failed,
		});
		let fault = remote.fault_message.clone();
		self.core
			.controller()
			.transitioner()
			.transition_with(&mut locked, target, |order| {
				order.cached_instance_state = Some(observed);
				order.fault_message = fault;
			})
			.await?;
		Ok(())
	}
}
