//! Releases the resources of CLOSED orders and retires them.

use super::{OrderProcessor, ProcessorContext};
use crate::registry::SharedOrder;
use crate::BrokerError;
use async_trait::async_trait;
use broker_cloud::CloudError;
use broker_types::{truncate_id, OrderState};
use std::sync::Arc;
use tracing::instrument;

/// Deletes the instance behind each CLOSED order, then deactivates it.
///
/// A deletion the cloud rejects leaves the order in CLOSED, so it is retried
/// on the next pass.
pub struct ClosedProcessor {
	context: Arc<ProcessorContext>,
}

impl ClosedProcessor {
	pub fn new(context: Arc<ProcessorContext>) -> Self {
		Self { context }
	}
}

#[async_trait]
impl OrderProcessor for ClosedProcessor {
	fn name(&self) -> &'static str {
		"closed"
	}

	fn state(&self) -> OrderState {
		OrderState::Closed
	}

	#[instrument(skip_all, fields(order_id = %truncate_id(order.id())))]
	async fn process(&self, order: SharedOrder) -> Result<(), BrokerError> {
		let mut locked = order.lock().await;
		if locked.state != OrderState::Closed {
			return Ok(());
		}

		let local = locked.is_provider_local(&self.context.local_provider_id);
		if !local || locked.instance_id.is_some() {
			let connector = self
				.context
				.connectors
				.connector(&locked.provider, &locked.cloud_name)?;
			match connector.delete_instance(&locked).await {
				Ok(()) => {},
				Err(CloudError::NotFound(_)) => {
					tracing::debug!("Instance already gone");
				},
				Err(e) => return Err(e.into()),
			}
		}

		self.context.transitioner.deactivate(&mut locked).await?;
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::testing::{compute_kind, Harness, ScriptedPlugin};

	#[tokio::test]
	async fn test_deletes_instance_then_deactivates() {
		let plugin = ScriptedPlugin::new();
		let harness = Harness::local(plugin.clone());
		let order = harness.activate_local(compute_kind()).await;
		order.lock().await.record_instance_id(Some("vm-3".into()));
		harness
			.drive(&order, &[OrderState::Spawning, OrderState::Closed])
			.await;

		ClosedProcessor::new(harness.context())
			.process(order.clone())
			.await
			.unwrap();

		assert_eq!(plugin.deleted(), vec!["vm-3".to_string()]);
		assert_eq!(order.lock().await.state, OrderState::Deactivated);
		assert!(harness.states_holding(order.id()).is_empty());
		assert!(harness.registry.get(order.id()).is_none());
	}

	#[tokio::test]
	async fn test_rejected_deletion_stays_closed() {
		let plugin = ScriptedPlugin::new();
		plugin.set_delete_result(Err(CloudError::ProviderRejected("busy".into())));
		let harness = Harness::local(plugin.clone());
		let order = harness.activate_local(compute_kind()).await;
		order.lock().await.record_instance_id(Some("vm-4".into()));
		harness
			.drive(&order, &[OrderState::Spawning, OrderState::Closed])
			.await;

		let result = ClosedProcessor::new(harness.context())
			.process(order.clone())
			.await;

		assert!(matches!(result, Err(BrokerError::Provider(_))));
		assert_eq!(order.lock().await.state, OrderState::Closed);
		assert_eq!(harness.states_holding(order.id()), vec![OrderState::Closed]);
	}

	#[tokio::test]
	async fn test_not_found_counts_as_deleted() {
		let plugin = ScriptedPlugin::new();
		plugin.set_delete_result(Err(CloudError::NotFound("vm-5".into())));
		let harness = Harness::local(plugin.clone());
		let order = harness.activate_local(compute_kind()).await;
		order.lock().await.record_instance_id(Some("vm-5".into()));
		harness
			.drive(&order, &[OrderState::Spawning, OrderState::Closed])
			.await;

		ClosedProcessor::new(harness.context())
			.process(order.clone())
			.await
			.unwrap();

		assert_eq!(order.lock().await.state, OrderState::Deactivated);
	}

	#[tokio::test]
	async fn test_local_order_without_instance_skips_cloud() {
		let plugin = ScriptedPlugin::new();
		plugin.set_delete_result(Err(CloudError::ProviderRejected("unused".into())));
		let harness = Harness::local(plugin.clone());
		let order = harness.activate_local(compute_kind()).await;
		harness.drive(&order, &[OrderState::Closed]).await;

		ClosedProcessor::new(harness.context())
			.process(order.clone())
			.await
			.unwrap();

		assert!(plugin.deleted().is_empty());
		assert_eq!(order.lock().await.state, OrderState::Deactivated);
	}
}
