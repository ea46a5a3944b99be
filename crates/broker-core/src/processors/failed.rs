//! Gives orders that failed after a successful request another chance.

use super::{OrderProcessor, ProcessorContext};
use crate::registry::SharedOrder;
use crate::BrokerError;
use async_trait::async_trait;
use broker_types::{truncate_id, InstanceState, OrderState};
use std::sync::Arc;
use tracing::instrument;

/// Moves FAILED_AFTER_SUCCESSFUL_REQUEST orders back to FULFILLED once their
/// instance reports ready. Anything else leaves the order where it is.
pub struct FailedRecoveryProcessor {
	context: Arc<ProcessorContext>,
}

impl FailedRecoveryProcessor {
	pub fn new(context: Arc<ProcessorContext>) -> Self {
		Self { context }
	}
}

#[async_trait]
impl OrderProcessor for FailedRecoveryProcessor {
	fn name(&self) -> &'static str {
		"failed_recovery"
	}

	fn state(&self) -> OrderState {
		OrderState::FailedAfterSuccessfulRequest
	}

	#[instrument(skip_all, fields(order_id = %truncate_id(order.id())))]
	async fn process(&self, order: SharedOrder) -> Result<(), BrokerError> {
		let mut locked = order.lock().await;
		if locked.state != OrderState::FailedAfterSuccessfulRequest
			|| !locked.is_provider_local(&self.context.local_provider_id)
		{
			return Ok(());
		}

		let connector = self
			.context
			.connectors
			.connector(&locked.provider, &locked.cloud_name)?;
		match connector.get_instance(&locked).await {
			Ok(instance) if instance.state == InstanceState::Ready => {
				tracing::info!("Instance recovered");
				self.context
					.transitioner
					.transition_with(&mut locked, OrderState::Fulfilled, |order| {
						order.cached_instance_state = Some(InstanceState::Ready);
						order.fault_message = None;
					})
					.await?;
			},
			Ok(instance) => {
				tracing::debug!(instance_state = %instance.state, "Instance not recovered");
			},
			Err(e) => {
				tracing::debug!(error = %e, "Instance still unreachable");
			},
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::testing::{compute_kind, Harness, ScriptedPlugin};

	#[tokio::test]
	async fn test_ready_instance_recovers_order() {
		let plugin = ScriptedPlugin::new();
		let harness = Harness::local(plugin.clone());
		let order = harness.activate_local(compute_kind()).await;
		order.lock().await.record_instance_id(Some("vm-9".into()));
		harness
			.drive(
				&order,
				&[OrderState::Spawning, OrderState::FailedAfterSuccessfulRequest],
			)
			.await;
		let processor = FailedRecoveryProcessor::new(harness.context());

		plugin.set_instance_state(InstanceState::Failed);
		processor.process(order.clone()).await.unwrap();
		assert_eq!(
			order.lock().await.state,
			OrderState::FailedAfterSuccessfulRequest
		);

		plugin.set_instance_state(InstanceState::Ready);
		processor.process(order.clone()).await.unwrap();
		assert_eq!(order.lock().await.state, OrderState::Fulfilled);
		assert_eq!(harness.states_holding(order.id()), vec![OrderState::Fulfilled]);
	}

	#[tokio::test]
	async fn test_peer_owned_order_is_left_alone() {
		let plugin = ScriptedPlugin::new();
		plugin.set_instance_state(InstanceState::Ready);
		let harness = Harness::local(plugin);
		let order = harness.activate_remote(compute_kind(), "provider-b").await;
		harness
			.drive(
				&order,
				&[OrderState::Pending, OrderState::FailedAfterSuccessfulRequest],
			)
			.await;

		FailedRecoveryProcessor::new(harness.context())
			.process(order.clone())
			.await
			.unwrap();

		assert_eq!(
			order.lock().await.state,
			OrderState::FailedAfterSuccessfulRequest
		);
		assert!(harness.federation.sent_operations().is_empty());
	}
}
