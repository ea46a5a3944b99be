//! Entry points for local API calls and federation requests.
//!
//! Both facades share one [`FacadeCore`]: the admission gate, the current
//! authorization plugin and the components requests are delegated to. Every
//! request holds a gate permit while it runs; [`FacadeCore::reload`] swaps the
//! pluggable components with the gate closed.

pub mod application;
pub mod gate;
pub mod remote;

pub use application::ApplicationFacade;
pub use gate::{AdmissionGate, Permit};
pub use remote::RemoteFacade;

use crate::authorization::{AuthorizationPlugin, Operation};
use crate::controller::OrderController;
use crate::processors::ProcessorsController;
use crate::registry::SharedOrder;
use crate::BrokerError;
use arc_swap::ArcSwap;
use broker_cloud::{CloudConnector, CloudConnectorFactory, LocalCloudConnector};
use broker_config::ProcessorsConfig;
use broker_types::{Order, OrderState, ResourceType, SystemUser};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Pluggable components replaced by a reload.
pub struct ReloadUpdate {
	pub default_cloud_name: String,
	pub clouds: HashMap<String, LocalCloudConnector>,
	pub authorization: Box<dyn AuthorizationPlugin>,
	pub processors: ProcessorsConfig,
	pub drain_timeout: Duration,
}

/// State shared by the application and remote facades.
pub struct FacadeCore {
	local_provider_id: String,
	gate: AdmissionGate,
	authorization: ArcSwap<Box<dyn AuthorizationPlugin>>,
	controller: Arc<OrderController>,
	connectors: Arc<CloudConnectorFactory>,
	processors: Arc<ProcessorsController>,
	drain_timeout_ms: AtomicU64,
}

impl FacadeCore {
	pub fn new(
		controller: Arc<OrderController>,
		connectors: Arc<CloudConnectorFactory>,
		processors: Arc<ProcessorsController>,
		authorization: Box<dyn AuthorizationPlugin>,
		drain_timeout: Duration,
	) -> Self {
		Self {
			local_provider_id: controller.local_provider_id().to_string(),
			gate: AdmissionGate::new(),
			authorization: ArcSwap::from_pointee(authorization),
			controller,
			connectors,
			processors,
			drain_timeout_ms: AtomicU64::new(drain_timeout.as_millis() as u64),
		}
	}

	pub fn local_provider_id(&self) -> &str {
		&self.local_provider_id
	}

	pub fn gate(&self) -> &AdmissionGate {
		&self.gate
	}

	pub fn controller(&self) -> &Arc<OrderController> {
		&self.controller
	}

	pub(crate) fn authorize(
		&self,
		user: &SystemUser,
		operation: Operation,
	) -> Result<(), BrokerError> {
		self.authorization.load().authorize(user, operation).inspect_err(|e| {
			tracing::debug!(user = %user.id, operation = %operation, error = %e, "Request denied");
		})
	}

	/// Connector for `provider_id`, with the local default cloud when none is given.
	///
	/// Requests to a peer without a cloud name go out with an empty name; the
	/// peer substitutes its own default.
	pub(crate) fn connector(
		&self,
		provider_id: Option<&str>,
		cloud_name: Option<&str>,
	) -> Result<Arc<dyn CloudConnector>, BrokerError> {
		let (provider_id, cloud_name) = self.resolve_target(provider_id, cloud_name);
		Ok(self.connectors.connector(&provider_id, &cloud_name)?)
	}

	pub(crate) fn resolve_target(
		&self,
		provider_id: Option<&str>,
		cloud_name: Option<&str>,
	) -> (String, String) {
		let provider_id = provider_id
			.filter(|p| !p.is_empty())
			.unwrap_or(&self.local_provider_id)
			.to_string();
		let cloud_name = match cloud_name.filter(|c| !c.is_empty()) {
			Some(name) => name.to_string(),
			None if provider_id == self.local_provider_id => self.connectors.default_cloud_name(),
			None => String::new(),
		};
		(provider_id, cloud_name)
	}

	pub(crate) fn connectors(&self) -> &Arc<CloudConnectorFactory> {
		&self.connectors
	}

	/// Snapshot of an order that must be FULFILLED for the operation to make sense.
	pub(crate) async fn fulfilled_snapshot(
		&self,
		order: &SharedOrder,
		operation: Operation,
	) -> Result<Order, BrokerError> {
		let snapshot = order.snapshot().await;
		if snapshot.state != OrderState::Fulfilled {
			return Err(BrokerError::NotAcceptable(format!(
				"{} requires a fulfilled order, order {} is {}",
				operation, snapshot.id, snapshot.state
			)));
		}
		Ok(snapshot)
	}

	/// Order and connector for a security-rule operation.
	pub(crate) async fn security_rule_target(
		&self,
		order: &SharedOrder,
		operation: Operation,
	) -> Result<(Order, Arc<dyn CloudConnector>), BrokerError> {
		check_rule_owner_kind(order.resource_type())?;
		let snapshot = self.fulfilled_snapshot(order, operation).await?;
		let connector = self
			.connectors
			.connector(&snapshot.provider, &snapshot.cloud_name)?;
		Ok((snapshot, connector))
	}

	/// Swaps the pluggable components with the admission gate closed.
	///
	/// Requests already admitted get up to the drain timeout to finish; new
	/// requests wait until the swap is done.
	pub async fn reload(&self, user: &SystemUser, update: ReloadUpdate) -> Result<(), BrokerError> {
		self.authorize(user, Operation::Reload)?;
		let drain_timeout = Duration::from_millis(self.drain_timeout_ms.load(Ordering::SeqCst));
		let _guard = self.gate.begin_reload(drain_timeout).await?;

		self.connectors
			.replace_local_clouds(update.default_cloud_name, update.clouds);
		self.authorization.store(Arc::new(update.authorization));
		self.processors.reset(&update.processors);
		self.drain_timeout_ms
			.store(update.drain_timeout.as_millis() as u64, Ordering::SeqCst);

		tracing::info!(user = %user.id, "Configuration reloaded");
		Ok(())
	}
}

/// Only the user who created an order may act on it.
pub(crate) fn check_owner(order: &SharedOrder, user: &SystemUser) -> Result<(), BrokerError> {
	if order.user().same_principal(user) {
		return Ok(());
	}
	Err(BrokerError::Authorization(format!(
		"user {} does not own order {}",
		user.id,
		order.id()
	)))
}

fn check_rule_owner_kind(resource_type: ResourceType) -> Result<(), BrokerError> {
	match resource_type {
		ResourceType::Network | ResourceType::PublicIp => Ok(()),
		other => Err(BrokerError::InvalidParameter(format!(
			"security rules apply to network and public IP orders, not {}",
			other
		))),
	}
}
