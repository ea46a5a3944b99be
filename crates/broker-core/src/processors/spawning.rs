//! Polls instances of SPAWNING orders until they are ready or failed.

use super::{OrderProcessor, ProcessorContext};
use crate::registry::SharedOrder;
use crate::BrokerError;
use async_trait::async_trait;
use broker_types::{truncate_id, InstanceState, OrderState};
use std::sync::Arc;
use tracing::instrument;

pub struct SpawningProcessor {
	context: Arc<ProcessorContext>,
}

impl SpawningProcessor {
	pub fn new(context: Arc<ProcessorContext>) -> Self {
		Self { context }
	}
}

#[async_trait]
impl OrderProcessor for SpawningProcessor {
	fn name(&self) -> &'static str {
		"spawning"
	}

	fn state(&self) -> OrderState {
		OrderState::Spawning
	}

	#[instrument(skip_all, fields(order_id = %truncate_id(order.id())))]
	async fn process(&self, order: SharedOrder) -> Result<(), BrokerError> {
		let mut locked = order.lock().await;
		if locked.state != OrderState::Spawning
			|| !locked.is_provider_local(&self.context.local_provider_id)
		{
			return Ok(());
		}

		let connector = self
			.context
			.connectors
			.connector(&locked.provider, &locked.cloud_name)?;
		let polled = connector.get_instance(&locked).await;

		let transitioner = &self.context.transitioner;
		match polled {
			Ok(instance) => match instance.state {
				InstanceState::Ready => {
					transitioner
						.transition_with(&mut locked, OrderState::Fulfilled, |order| {
							order.cached_instance_state = Some(InstanceState::Ready);
							order.fault_message = None;
						})
						.await?;
				},
				InstanceState::Failed => {
					transitioner
						.transition_with(
							&mut locked,
							OrderState::FailedAfterSuccessfulRequest,
							|order| {
								order.cached_instance_state = Some(InstanceState::Failed);
								order.fault_message = Some("instance failed while spawning".into());
							},
						)
						.await?;
				},
				other => {
					if locked.cached_instance_state != Some(other) {
						tracing::debug!(instance_state = %other, "Instance still spawning");
						transitioner
							.persist_with(&mut locked, |order| {
								order.cached_instance_state = Some(other);
							})
							.await?;
					}
				},
			},
			Err(e) => {
				tracing::warn!(error = %e, "Failed to poll spawning instance");
				let fault = e.to_string();
				transitioner
					.transition_with(
						&mut locked,
						OrderState::FailedAfterSuccessfulRequest,
						|order| order.fault_message = Some(fault),
					)
					.await?;
			},
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::testing::{compute_kind, Harness, ScriptedPlugin};
	use broker_cloud::CloudError;

	async fn spawning_order(harness: &Harness) -> SharedOrder {
		let order = harness.activate_local(compute_kind()).await;
		{
			let mut locked = order.lock().await;
			locked.record_instance_id(Some("vm-1".into()));
		}
		harness.drive(&order, &[OrderState::Spawning]).await;
		order
	}

	#[tokio::test]
	async fn test_ready_instance_fulfills_order() {
		let plugin = ScriptedPlugin::new();
		plugin.set_instance_state(InstanceState::Ready);
		let harness = Harness::local(plugin);
		let order = spawning_order(&harness).await;

		SpawningProcessor::new(harness.context())
			.process(order.clone())
			.await
			.unwrap();

		let locked = order.lock().await;
		assert_eq!(locked.state, OrderState::Fulfilled);
		assert_eq!(locked.cached_instance_state, Some(InstanceState::Ready));
		assert_eq!(harness.states_holding(order.id()), vec![OrderState::Fulfilled]);
	}

	#[tokio::test]
	async fn test_failed_instance_fails_after_request() {
		let plugin = ScriptedPlugin::new();
		plugin.set_instance_state(InstanceState::Failed);
		let harness = Harness::local(plugin);
		let order = spawning_order(&harness).await;

		SpawningProcessor::new(harness.context())
			.process(order.clone())
			.await
			.unwrap();

		assert_eq!(
			order.lock().await.state,
			OrderState::FailedAfterSuccessfulRequest
		);
	}

	#[tokio::test]
	async fn test_poll_error_fails_after_request() {
		let plugin = ScriptedPlugin::new();
		plugin.set_instance_error(CloudError::NotFound("vm-1".into()));
		let harness = Harness::local(plugin);
		let order = spawning_order(&harness).await;

		SpawningProcessor::new(harness.context())
			.process(order.clone())
			.await
			.unwrap();

		let locked = order.lock().await;
		assert_eq!(locked.state, OrderState::FailedAfterSuccessfulRequest);
		assert!(locked.fault_message.is_some());
	}

	#[tokio::test]
	async fn test_creating_instance_keeps_polling_and_caches_state() {
		let plugin = ScriptedPlugin::new();
		plugin.set_instance_state(InstanceState::Creating);
		let harness = Harness::local(plugin);
		let order = spawning_order(&harness).await;

		SpawningProcessor::new(harness.context())
			.process(order.clone())
			.await
			.unwrap();

		let locked = order.lock().await;
		assert_eq!(locked.state, OrderState::Spawning);
		assert_eq!(locked.cached_instance_state, Some(InstanceState::Creating));
		assert_eq!(harness.states_holding(order.id()), vec![OrderState::Spawning]);
	}

	#[tokio::test]
	async fn test_failed_write_keeps_previous_observation() {
		let plugin = ScriptedPlugin::new();
		plugin.set_instance_state(InstanceState::Ready);
		let harness = Harness::local(plugin);
		let order = spawning_order(&harness).await;
		harness.storage.fail_writes(true);

		let result = SpawningProcessor::new(harness.context())
			.process(order.clone())
			.await;

		assert!(result.is_err());
		let locked = order.lock().await;
		assert_eq!(locked.state, OrderState::Spawning);
		assert_eq!(locked.cached_instance_state, None);
		assert!(locked.fault_message.is_none());
	}

	#[tokio::test]
	async fn test_peer_owned_order_is_left_alone() {
		let harness = Harness::local(ScriptedPlugin::new());
		let order = harness.activate_remote(compute_kind(), "provider-b").await;
		harness.drive(&order, &[OrderState::Spawning]).await;

		SpawningProcessor::new(harness.context())
			.process(order.clone())
			.await
			.unwrap();

		assert_eq!(order.lock().await.state, OrderState::Spawning);
		assert!(harness.federation.sent_operations().is_empty());
	}
}
