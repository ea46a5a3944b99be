//! Shared order handles and the registry that owns the state queues.

use crate::queue::StateQueue;
use broker_types::{Order, OrderState, ResourceType, SystemUser};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::HashMap;
use std::ops::Deref;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};

struct OrderSlot {
	id: String,
	resource_type: ResourceType,
	user: SystemUser,
	references: Vec<String>,
	order: Mutex<Order>,
}

/// Handle to an order shared between queues, processors and requests.
///
/// The identity, kind and owner of an order never change, so they are readable
/// without the lock. Everything else requires [`SharedOrder::lock`].
#[derive(Clone)]
pub struct SharedOrder(Arc<OrderSlot>);

impl SharedOrder {
	pub fn new(order: Order) -> Self {
		Self(Arc::new(OrderSlot {
			id: order.id.clone(),
			resource_type: order.resource_type(),
			user: order.user.clone(),
			references: order
				.kind
				.referenced_orders()
				.into_iter()
				.map(str::to_string)
				.collect(),
			order: Mutex::new(order),
		}))
	}

	pub fn id(&self) -> &str {
		&self.0.id
	}

	pub fn resource_type(&self) -> ResourceType {
		self.0.resource_type
	}

	pub fn user(&self) -> &SystemUser {
		&self.0.user
	}

	/// Ids of the orders this one refers to (networks, attached compute/volume).
	pub fn references(&self) -> &[String] {
		&self.0.references
	}

	/// Acquires the order's exclusive lock.
	pub async fn lock(&self) -> LockedOrder<'_> {
		LockedOrder {
			handle: self,
			guard: self.0.order.lock().await,
		}
	}

	/// Copy of the current order, taken under the lock.
	pub async fn snapshot(&self) -> Order {
		self.0.order.lock().await.clone()
	}
}

impl std::fmt::Debug for SharedOrder {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_tuple("SharedOrder").field(&self.0.id).finish()
	}
}

/// An order whose lock is held.
///
/// Reads go through `Deref`. Everything persisted goes through the state
/// transitioner; the only direct write is the instance id a cloud handed out,
/// which must survive a failed write so it is not requested twice.
pub struct LockedOrder<'a> {
	handle: &'a SharedOrder,
	guard: MutexGuard<'a, Order>,
}

impl LockedOrder<'_> {
	pub fn handle(&self) -> &SharedOrder {
		self.handle
	}

	pub fn record_instance_id(&mut self, instance_id: Option<String>) {
		self.guard.instance_id = instance_id;
	}

	pub(crate) fn replace(&mut self, order: Order) {
		*self.guard = order;
	}
}

impl Deref for LockedOrder<'_> {
	type Target = Order;

	fn deref(&self) -> &Order {
		&self.guard
	}
}

/// Owner of the per-state queues and of the active-orders index.
///
/// There is exactly one queue per non-terminal state. Deactivated orders are
/// in no queue and not in the index.
pub struct OrderRegistry {
	queues: HashMap<OrderState, StateQueue>,
	active: DashMap<String, SharedOrder>,
}

impl Default for OrderRegistry {
	fn default() -> Self {
		Self::new()
	}
}

impl OrderRegistry {
	pub fn new() -> Self {
		let queues = OrderState::QUEUED
			.iter()
			.map(|state| (*state, StateQueue::new(*state)))
			.collect();
		Self {
			queues,
			active: DashMap::new(),
		}
	}

	/// Queue of a state; `None` for `Deactivated`.
	pub fn queue(&self, state: OrderState) -> Option<&StateQueue> {
		self.queues.get(&state)
	}

	pub fn get(&self, order_id: &str) -> Option<SharedOrder> {
		self.active.get(order_id).map(|entry| entry.value().clone())
	}

	pub fn active_orders(&self) -> Vec<SharedOrder> {
		self.active
			.iter()
			.map(|entry| entry.value().clone())
			.collect()
	}

	pub fn active_count(&self) -> usize {
		self.active.len()
	}

	/// Adds to the active index; `false` if the id is already present.
	pub(crate) fn insert_active(&self, order: SharedOrder) -> bool {
		match self.active.entry(order.id().to_string()) {
			Entry::Occupied(_) => false,
			Entry::Vacant(slot) => {
				slot.insert(order);
				true
			},
		}
	}

	/// Puts a stored order back into the index and the queue of its state.
	pub(crate) fn restore(&self, order: Order) -> bool {
		let state = order.state;
		let order = SharedOrder::new(order);
		if !self.insert_active(order.clone()) {
			return false;
		}
		match self.queue(state) {
			Some(queue) => queue.add_item(order),
			None => self.remove_active(order.id()),
		}
		true
	}

	pub(crate) fn remove_active(&self, order_id: &str) {
		self.active.remove(order_id);
	}

	/// Ids per queue, for inspection.
	pub fn queue_snapshots(&self) -> Vec<(OrderState, Vec<String>)> {
		OrderState::QUEUED
			.iter()
			.filter_map(|state| self.queues.get(state).map(|q| (*state, q.snapshot())))
			.collect()
	}

	/// States whose queue holds the order. A consistent registry returns at
	/// most one.
	pub fn states_holding(&self, order_id: &str) -> Vec<OrderState> {
		OrderState::QUEUED
			.iter()
			.filter(|state| {
				self.queues
					.get(state)
					.is_some_and(|queue| queue.contains(order_id))
			})
			.copied()
			.collect()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use broker_types::{AttachmentSpec, OrderKind};

	fn attachment() -> Order {
		Order::new(
			SystemUser::new("u1", "User", "idp"),
			"provider-a",
			"provider-a",
			"default",
			OrderKind::Attachment(AttachmentSpec {
				compute_order_id: "c1".into(),
				volume_order_id: "v1".into(),
				device: None,
			}),
		)
	}

	#[test]
	fn test_one_queue_per_non_terminal_state() {
		let registry = OrderRegistry::new();
		for state in OrderState::QUEUED {
			assert_eq!(registry.queue(state).map(|q| q.state()), Some(state));
		}
		assert!(registry.queue(OrderState::Deactivated).is_none());
	}

	#[test]
	fn test_active_index_rejects_duplicates() {
		let registry = OrderRegistry::new();
		let order = SharedOrder::new(attachment());
		assert!(registry.insert_active(order.clone()));
		assert!(!registry.insert_active(order.clone()));
		assert_eq!(registry.active_count(), 1);

		registry.remove_active(order.id());
		assert!(registry.get(order.id()).is_none());
	}

	#[tokio::test]
	async fn test_shared_order_metadata_and_recording() {
		let order = SharedOrder::new(attachment());
		assert_eq!(order.resource_type(), ResourceType::Attachment);
		assert_eq!(order.references(), ["c1".to_string(), "v1".to_string()]);

		let mut locked = order.lock().await;
		locked.record_instance_id(Some("att-1".into()));
		drop(locked);

		assert_eq!(order.snapshot().await.instance_id.as_deref(), Some("att-1"));
	}
}
