//! Rebuilds the in-memory queues from storage at startup.
//!
//! Storage is written before queues move, so the stored state of every order
//! is the last committed one. Recovery puts each non-deactivated order back
//! into the queue of that state, oldest first, before any processor runs.

use crate::registry::OrderRegistry;
use broker_storage::StorageService;
use broker_types::{truncate_id, Order, OrderState, StorageKey};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::instrument;

#[derive(Debug, Error)]
pub enum RecoveryError {
	#[error("Storage error: {0}")]
	Storage(String),
}

/// Outcome of a recovery run.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
	/// Orders put back into a queue.
	pub total_orders: usize,
	/// Recovered orders per state.
	pub per_state: BTreeMap<String, usize>,
	/// Stored orders already retired.
	pub skipped_deactivated: usize,
}

pub struct RecoveryService {
	storage: Arc<StorageService>,
	registry: Arc<OrderRegistry>,
}

impl RecoveryService {
	pub fn new(storage: Arc<StorageService>, registry: Arc<OrderRegistry>) -> Self {
		Self { storage, registry }
	}

	#[instrument(skip_all)]
	pub async fn recover_state(&self) -> Result<RecoveryReport, RecoveryError> {
		tracing::info!("Starting state recovery from storage");

		let mut orders: Vec<Order> = self
			.storage
			.retrieve_all::<Order>(StorageKey::Orders.as_str())
			.await
			.map_err(|e| RecoveryError::Storage(e.to_string()))?
			.into_iter()
			.map(|(_, order)| order)
			.collect();
		orders.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));

		let mut report = RecoveryReport::default();
		for order in orders {
			if order.state == OrderState::Deactivated {
				report.skipped_deactivated += 1;
				continue;
			}
			let state = order.state;
			let order_id = order.id.clone();
			if !self.registry.restore(order) {
				tracing::warn!(order_id = %truncate_id(&order_id), "Order already active, skipped");
				continue;
			}
			report.total_orders += 1;
			*report.per_state.entry(state.to_string()).or_default() += 1;
		}

		tracing::info!(
			total = report.total_orders,
			skipped_deactivated = report.skipped_deactivated,
			"State recovery completed"
		);
		Ok(report)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::testing::{compute_kind, volume_kind, Harness, ScriptedPlugin};

	#[tokio::test]
	async fn test_recovery_rebuilds_queues_from_storage() {
		let harness = Harness::local(ScriptedPlugin::new());
		let open = harness.activate_local(compute_kind()).await;
		let spawning = harness.activate_local(compute_kind()).await;
		spawning.lock().await.record_instance_id(Some("vm-1".into()));
		harness.drive(&spawning, &[OrderState::Spawning]).await;
		let retired = harness.activate_local(volume_kind()).await;
		harness
			.drive(&retired, &[OrderState::Closed, OrderState::Deactivated])
			.await;

		// A fresh registry over the same storage, as after a restart.
		let registry = Arc::new(OrderRegistry::new());
		let report = RecoveryService::new(harness.storage_service.clone(), registry.clone())
			.recover_state()
			.await
			.unwrap();

		assert_eq!(report.total_orders, 2);
		assert_eq!(report.skipped_deactivated, 1);
		assert_eq!(report.per_state.get("OPEN"), Some(&1));
		assert_eq!(report.per_state.get("SPAWNING"), Some(&1));
		assert_eq!(registry.states_holding(open.id()), vec![OrderState::Open]);
		assert_eq!(registry.states_holding(spawning.id()), vec![OrderState::Spawning]);
		assert!(registry.get(retired.id()).is_none());
		let recovered = registry.get(spawning.id()).unwrap().snapshot().await;
		assert_eq!(recovered.instance_id.as_deref(), Some("vm-1"));
	}

	#[tokio::test]
	async fn test_failed_write_is_not_recovered_as_new_state() {
		let harness = Harness::local(ScriptedPlugin::new());
		let order = harness.activate_local(compute_kind()).await;
		harness.storage.fail_writes(true);
		{
			let mut locked = order.lock().await;
			assert!(harness
				.transitioner
				.transition(&mut locked, OrderState::Closed)
				.await
				.is_err());
		}
		harness.storage.fail_writes(false);

		let registry = Arc::new(OrderRegistry::new());
		RecoveryService::new(harness.storage_service.clone(), registry.clone())
			.recover_state()
			.await
			.unwrap();
		assert_eq!(registry.states_holding(order.id()), vec![OrderState::Open]);
	}
}
