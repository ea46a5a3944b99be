//! Requests the resource behind each OPEN order.

use super::{OrderProcessor, ProcessorContext};
use crate::registry::SharedOrder;
use crate::BrokerError;
use async_trait::async_trait;
use broker_types::{truncate_id, OrderState};
use std::sync::Arc;
use tracing::instrument;

/// Hands OPEN orders to their cloud connector.
///
/// A local order moves to SPAWNING with the instance id the cloud returned; a
/// remote order moves to PENDING once the owner accepted it. A rejected request
/// moves the order to FAILED with the reason recorded.
pub struct OpenProcessor {
	context: Arc<ProcessorContext>,
}

impl OpenProcessor {
	pub fn new(context: Arc<ProcessorContext>) -> Self {
		Self { context }
	}
}

#[async_trait]
impl OrderProcessor for OpenProcessor {
	fn name(&self) -> &'static str {
		"open"
	}

	fn state(&self) -> OrderState {
		OrderState::Open
	}

	#[instrument(skip_all, fields(order_id = %truncate_id(order.id())))]
	async fn process(&self, order: SharedOrder) -> Result<(), BrokerError> {
		let mut locked = order.lock().await;
		if locked.state != OrderState::Open {
			tracing::debug!(state = %locked.state, "Order left OPEN before processing");
			return Ok(());
		}

		let local = locked.is_provider_local(&self.context.local_provider_id);
		if local && locked.instance_id.is_some() {
			// The cloud already created the instance; only the write of SPAWNING failed.
			tracing::debug!("Retrying transition for requested instance");
			self.context
				.transitioner
				.transition(&mut locked, OrderState::Spawning)
				.await?;
			return Ok(());
		}

		let requested = match self
			.context
			.connectors
			.connector(&locked.provider, &locked.cloud_name)
		{
			Ok(connector) => connector.request_instance(&locked).await,
			Err(e) => Err(e),
		};

		match requested {
			Ok(instance_id) => {
				let target = if local {
					// Kept in memory even if the write below fails, so the next
					// pass does not request a second instance.
					locked.record_instance_id(instance_id);
					OrderState::Spawning
				} else {
					OrderState::Pending
				};
				self.context.transitioner.transition(&mut locked, target).await?;
			},
			Err(e) => {
				tracing::warn!(
					provider = %locked.provider,
					cloud = %locked.cloud_name,
					error = %e,
					"Instance request rejected"
				);
				let fault = e.to_string();
				self.context
					.transitioner
					.transition_with(&mut locked, OrderState::Failed, |order| {
						order.instance_id = None;
						order.fault_message = Some(fault);
					})
					.await?;
			},
		}
		Ok(())
	}
}
