//! Order state machine.
//!
//! Moves orders between state queues with validation and write-through
//! persistence. Storage is written first; queues migrate only once the write
//! succeeded, so after a crash the queues rebuilt from storage match the last
//! committed state.

use crate::registry::{LockedOrder, OrderRegistry, SharedOrder};
use broker_cloud::FederationClient;
use broker_storage::{StorageError, StorageService};
use broker_types::{
	current_timestamp, truncate_id, FederationEnvelope, FederationRequest, Order, OrderState,
	RemoteEvent, StateChange, StorageKey,
};
use once_cell::sync::Lazy;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;

/// Errors that can occur while changing an order's state.
#[derive(Debug, Error)]
pub enum TransitionError {
	#[error("Invalid state transition from {from} to {to}")]
	InvalidTransition { from: OrderState, to: OrderState },
	#[error("Order already exists: {0}")]
	Duplicate(String),
	#[error("Storage error: {0}")]
	Storage(String),
}

/// Checks a transition against the static transition table.
pub fn is_valid_transition(from: OrderState, to: OrderState) -> bool {
	static TRANSITIONS: Lazy<HashMap<OrderState, HashSet<OrderState>>> = Lazy::new(|| {
		use OrderState::*;

		let mut m = HashMap::new();
		m.insert(Open, HashSet::from([Spawning, Pending, Failed, Closed]));
		m.insert(
			Pending,
			HashSet::from([Fulfilled, FailedAfterSuccessfulRequest, Closed]),
		);
		m.insert(
			Spawning,
			HashSet::from([Fulfilled, FailedAfterSuccessfulRequest, Closed]),
		);
		m.insert(Fulfilled, HashSet::from([Failed, Closed]));
		m.insert(
			FailedAfterSuccessfulRequest,
			HashSet::from([Fulfilled, Closed]),
		);
		m.insert(Failed, HashSet::from([Closed]));
		m.insert(Closed, HashSet::from([Deactivated]));
		m.insert(Deactivated, HashSet::new()); // terminal
		m
	});

	TRANSITIONS
		.get(&from)
		.is_some_and(|allowed| allowed.contains(&to))
}

/// The only component that changes an order's state or queue membership.
pub struct StateTransitioner {
	local_provider_id: String,
	storage: Arc<StorageService>,
	registry: Arc<OrderRegistry>,
	federation: Arc<dyn FederationClient>,
}

impl StateTransitioner {
	pub fn new(
		local_provider_id: impl Into<String>,
		storage: Arc<StorageService>,
		registry: Arc<OrderRegistry>,
		federation: Arc<dyn FederationClient>,
	) -> Self {
		Self {
			local_provider_id: local_provider_id.into(),
			storage,
			registry,
			federation,
		}
	}

	/// Registers a new order: saves it, indexes it and enqueues it in OPEN.
	///
	/// Rejects an id that is already active or already stored.
	pub async fn activate(&self, order: Order) -> Result<SharedOrder, TransitionError> {
		if order.state != OrderState::Open {
			return Err(TransitionError::InvalidTransition {
				from: order.state,
				to: OrderState::Open,
			});
		}
		if self.registry.get(&order.id).is_some() {
			return Err(TransitionError::Duplicate(order.id));
		}

		self.storage
			.save(StorageKey::Orders.as_str(), &order.id, &order)
			.await
			.map_err(|e| match e {
				StorageError::AlreadyExists => TransitionError::Duplicate(order.id.clone()),
				other => TransitionError::Storage(other.to_string()),
			})?;

		let shared = SharedOrder::new(order);
		if !self.registry.insert_active(shared.clone()) {
			return Err(TransitionError::Duplicate(shared.id().to_string()));
		}
		if let Some(queue) = self.registry.queue(OrderState::Open) {
			queue.add_item(shared.clone());
		}
		tracing::info!(order_id = %truncate_id(shared.id()), "Order activated");
		Ok(shared)
	}

	/// Moves a locked order to `to`.
	///
	/// Validates the transition, persists the new state, stores an audit
	/// record, then migrates the order between queues. On a storage failure
	/// nothing changes.
	pub async fn transition(
		&self,
		order: &mut LockedOrder<'_>,
		to: OrderState,
	) -> Result<(), TransitionError> {
		self.transition_with(order, to, |_| {}).await
	}

	/// Like [`transition`](Self::transition), with `stage` applied to the
	/// persisted copy. The in-memory order only sees those fields once the
	/// write succeeded.
	pub async fn transition_with(
		&self,
		order: &mut LockedOrder<'_>,
		to: OrderState,
		stage: impl FnOnce(&mut Order) + Send,
	) -> Result<(), TransitionError> {
		let from = order.state;
		if !is_valid_transition(from, to) {
			return Err(TransitionError::InvalidTransition { from, to });
		}

		let mut updated: Order = (**order).clone();
		stage(&mut updated);
		updated.state = to;
		updated.updated_at = current_timestamp();

		self.storage
			.update(StorageKey::Orders.as_str(), &updated.id, &updated)
			.await
			.map_err(|e| TransitionError::Storage(e.to_string()))?;
		self.record_change(&updated.id, from, to, updated.updated_at)
			.await;

		if let Some(queue) = self.registry.queue(from) {
			queue.remove_item(&updated.id);
		}
		order.replace(updated);
		match self.registry.queue(to) {
			Some(queue) => queue.add_item(order.handle().clone()),
			None => self.registry.remove_active(order.handle().id()),
		}

		tracing::info!(
			order_id = %truncate_id(&order.id),
			from = %from,
			to = %to,
			"Order state changed"
		);
		self.notify_requester(&**order, to);
		Ok(())
	}

	/// Retires a CLOSED order whose resource is gone.
	///
	/// The record stays in storage as DEACTIVATED; the order leaves the CLOSED
	/// queue and the active index.
	pub async fn deactivate(&self, order: &mut LockedOrder<'_>) -> Result<(), TransitionError> {
		self.transition(order, OrderState::Deactivated).await
	}

	/// Writes the order with `stage` applied, keeping its state. Memory is
	/// updated only after the write succeeded.
	pub async fn persist_with(
		&self,
		order: &mut LockedOrder<'_>,
		stage: impl FnOnce(&mut Order) + Send,
	) -> Result<(), TransitionError> {
		let mut updated: Order = (**order).clone();
		stage(&mut updated);
		updated.updated_at = current_timestamp();
		self.storage
			.update(StorageKey::Orders.as_str(), &updated.id, &updated)
			.await
			.map_err(|e| TransitionError::Storage(e.to_string()))?;
		order.replace(updated);
		Ok(())
	}

	async fn record_change(&self, order_id: &str, from: OrderState, to: OrderState, timestamp: u64) {
		let change = StateChange {
			order_id: order_id.to_string(),
			from,
			to,
			timestamp,
		};
		let id = format!("{}-{}", order_id, uuid::Uuid::new_v4());
		if let Err(e) = self
			.storage
			.store(StorageKey::StateChanges.as_str(), &id, &change)
			.await
		{
			tracing::warn!(
				order_id = %truncate_id(order_id),
				error = %e,
				"Failed to store state change"
			);
		}
	}

	/// Tells a remote requester that its order was fulfilled or failed.
	fn notify_requester(&self, order: &Order, to: OrderState) {
		if !order.is_provider_local(&self.local_provider_id)
			|| !order.is_requester_remote(&self.local_provider_id)
		{
			return;
		}
		let event = match to {
			OrderState::Fulfilled => RemoteEvent::InstanceFulfilled,
			OrderState::Failed | OrderState::FailedAfterSuccessfulRequest => {
				RemoteEvent::InstanceFailed
			},
			_ => return,
		};

		let requester = order.requester.clone();
		let envelope = FederationEnvelope {
			requesting_provider: self.local_provider_id.clone(),
			request: FederationRequest::NotifyEvent {
				order: order.clone(),
				event,
			},
		};
		let client = self.federation.clone();
		let order_id = truncate_id(&order.id);
		tokio::spawn(async move {
			if let Err(e) = client.send(&requester, envelope).await {
				tracing::warn!(
					order_id = %order_id,
					requester = %requester,
					event = ?event,
					error = %e,
					"Failed to notify requester"
				);
			}
		});
	}
}
