//! Watches FULFILLED orders for instances that stop working.

use super::{OrderProcessor, ProcessorContext};
use crate::registry::SharedOrder;
use crate::BrokerError;
use async_trait::async_trait;
use broker_types::{truncate_id, InstanceState, OrderState};
use std::sync::Arc;
use tracing::instrument;

pub struct FulfilledProcessor {
	context: Arc<ProcessorContext>,
}

impl FulfilledProcessor {
	pub fn new(context: Arc<ProcessorContext>) -> Self {
		Self { context }
	}
}

#[async_trait]
impl OrderProcessor for FulfilledProcessor {
	fn name(&self) -> &'static str {
		"fulfilled"
	}

	fn state(&self) -> OrderState {
		OrderState::Fulfilled
	}

	#[instrument(skip_all, fields(order_id = %truncate_id(order.id())))]
	async fn process(&self, order: SharedOrder) -> Result<(), BrokerError> {
		let mut locked = order.lock().await;
		if locked.state != OrderState::Fulfilled
			|| !locked.is_provider_local(&self.context.local_provider_id)
		{
			return Ok(());
		}

		let connector = self
			.context
			.connectors
			.connector(&locked.provider, &locked.cloud_name)?;
		let (observed, fault) = match connector.get_instance(&locked).await {
			Ok(instance) if instance.state == InstanceState::Failed => {
				(Some(InstanceState::Failed), "instance failed".to_string())
			},
			Ok(instance) => {
				if locked.cached_instance_state != Some(instance.state) {
					self.context
						.transitioner
						.persist_with(&mut locked, |order| {
							order.cached_instance_state = Some(instance.state);
						})
						.await?;
				}
				return Ok(());
			},
			Err(e) => (None, e.to_string()),
		};

		tracing::warn!(fault = %fault, "Fulfilled instance lost");
		self.context
			.transitioner
			.transition_with(&mut locked, OrderState::Failed, |order| {
				if observed.is_some() {
					order.cached_instance_state = observed;
				}
				order.fault_message = Some(fault);
			})
			.await?;
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::testing::{compute_kind, Harness, ScriptedPlugin};
	use broker_cloud::CloudError;

	async fn fulfilled_order(harness: &Harness) -> SharedOrder {
		let order = harness.activate_local(compute_kind()).await;
		order.lock().await.record_instance_id(Some("vm-7".into()));
		harness
			.drive(&order, &[OrderState::Spawning, OrderState::Fulfilled])
			.await;
		order
	}

	#[tokio::test]
	async fn test_healthy_instance_stays_fulfilled() {
		let plugin = ScriptedPlugin::new();
		plugin.set_instance_state(InstanceState::Ready);
		let harness = Harness::local(plugin);
		let order = fulfilled_order(&harness).await;

		FulfilledProcessor::new(harness.context())
			.process(order.clone())
			.await
			.unwrap();

		assert_eq!(order.lock().await.state, OrderState::Fulfilled);
	}

	#[tokio::test]
	async fn test_failed_or_missing_instance_fails_order() {
		let plugin = ScriptedPlugin::new();
		plugin.set_instance_state(InstanceState::Failed);
		let harness = Harness::local(plugin.clone());
		let failed = fulfilled_order(&harness).await;
		FulfilledProcessor::new(harness.context())
			.process(failed.clone())
			.await
			.unwrap();
		assert_eq!(failed.lock().await.state, OrderState::Failed);

		plugin.set_instance_error(CloudError::NotFound("vm-7".into()));
		let missing = fulfilled_order(&harness).await;
		FulfilledProcessor::new(harness.context())
			.process(missing.clone())
			.await
			.unwrap();
		let locked = missing.lock().await;
		assert_eq!(locked.state, OrderState::Failed);
		assert!(locked.fault_message.as_deref().is_some_and(|m| m.contains("vm-7")));
	}

	#[tokio::test]
	async fn test_failed_write_keeps_order_unchanged() {
		let plugin = ScriptedPlugin::new();
		plugin.set_instance_state(InstanceState::Failed);
		let harness = Harness::local(plugin);
		let order = fulfilled_order(&harness).await;
		harness.storage.fail_writes(true);

		let result = FulfilledProcessor::new(harness.context())
			.process(order.clone())
			.await;

		assert!(result.is_err());
		let locked = order.lock().await;
		assert_eq!(locked.state, OrderState::Fulfilled);
		assert_ne!(locked.cached_instance_state, Some(InstanceState::Failed));
		assert!(locked.fault_message.is_none());
	}

	#[tokio::test]
	async fn test_peer_owned_order_is_left_alone() {
		let harness = Harness::local(ScriptedPlugin::new());
		let order = harness.activate_remote(compute_kind(), "provider-b").await;
		harness
			.drive(&order, &[OrderState::Pending, OrderState::Fulfilled])
			.await;

		FulfilledProcessor::new(harness.context())
			.process(order.clone())
			.await
			.unwrap();

		assert_eq!(order.lock().await.state, OrderState::Fulfilled);
		assert!(harness.federation.sent_operations().is_empty());
	}
}
