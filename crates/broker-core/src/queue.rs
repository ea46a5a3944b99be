//! Cursor-based queue holding the orders of one lifecycle state.
//!
//! A processor walks its queue with [`StateQueue::get_next`] while requests and
//! other processors add and remove orders concurrently. Nodes live in an arena
//! indexed by `usize`; the cursor is an index, so unlinking a node never leaves
//! it dangling.

use crate::registry::SharedOrder;
use broker_types::OrderState;
use std::sync::{Mutex, MutexGuard, PoisonError};

struct Node {
	order: SharedOrder,
	prev: Option<usize>,
	next: Option<usize>,
}

#[derive(Default)]
struct Inner {
	nodes: Vec<Option<Node>>,
	free: Vec<usize>,
	head: Option<usize>,
	tail: Option<usize>,
	cursor: Option<usize>,
	len: usize,
}

impl Inner {
	fn node(&self, index: usize) -> Option<&Node> {
		self.nodes.get(index).and_then(Option::as_ref)
	}

	fn node_mut(&mut self, index: usize) -> Option<&mut Node> {
		self.nodes.get_mut(index).and_then(Option::as_mut)
	}

	fn allocate(&mut self, node: Node) -> usize {
		match self.free.pop() {
			Some(index) => {
				self.nodes[index] = Some(node);
				index
			},
			None => {
				self.nodes.push(Some(node));
				self.nodes.len() - 1
			},
		}
	}

	fn find(&self, order_id: &str) -> Option<usize> {
		let mut current = self.head;
		while let Some(index) = current {
			let node = self.node(index)?;
			if node.order.id() == order_id {
				return Some(index);
			}
			current = node.next;
		}
		None
	}

	fn unlink(&mut self, index: usize) -> Option<Node> {
		let node = self.nodes.get_mut(index)?.take()?;
		match node.prev {
			Some(prev) => {
				if let Some(p) = self.node_mut(prev) {
					p.next = node.next;
				}
			},
			None => self.head = node.next,
		}
		match node.next {
			Some(next) => {
				if let Some(n) = self.node_mut(next) {
					n.prev = node.prev;
				}
			},
			None => self.tail = node.prev,
		}
		if self.cursor == Some(index) {
			self.cursor = node.next;
		}
		self.free.push(index);
		self.len -= 1;
		Some(node)
	}
}

/// Thread-safe list of the orders in one state, with a traversal cursor.
///
/// All operations take the queue's own lock for a short, non-async critical
/// section. Removal is O(n) in the queue length; everything else is O(1).
pub struct StateQueue {
	state: OrderState,
	inner: Mutex<Inner>,
}

impl StateQueue {
	pub fn new(state: OrderState) -> Self {
		Self {
			state,
			inner: Mutex::new(Inner::default()),
		}
	}

	/// State whose orders this queue holds.
	pub fn state(&self) -> OrderState {
		self.state
	}

	// A panic inside the lock cannot leave the links half-updated, so a
	// poisoned lock is still usable.
	fn lock(&self) -> MutexGuard<'_, Inner> {
		self.inner.lock().unwrap_or_else(PoisonError::into_inner)
	}

	/// Appends an order at the tail.
	///
	/// When the cursor is exhausted it moves to the new order, so a processor
	/// that has walked past the tail picks the order up on its next call.
	pub fn add_item(&self, order: SharedOrder) {
		let mut inner = self.lock();
		let tail = inner.tail;
		let index = inner.allocate(Node {
			order,
			prev: tail,
			next: None,
		});
		match tail {
			Some(t) => {
				if let Some(node) = inner.node_mut(t) {
					node.next = Some(index);
				}
			},
			None => inner.head = Some(index),
		}
		inner.tail = Some(index);
		if inner.cursor.is_none() {
			inner.cursor = Some(index);
		}
		inner.len += 1;
	}

	/// Unlinks the order with the given id.
	///
	/// Returns `false`, leaving the queue untouched, if the order is not a
	/// member. Removing the order under the cursor advances the cursor.
	pub fn remove_item(&self, order_id: &str) -> bool {
		let mut inner = self.lock();
		match inner.find(order_id) {
			Some(index) => inner.unlink(index).is_some(),
			None => false,
		}
	}

	/// Returns the order at the cursor and advances the cursor.
	pub fn get_next(&self) -> Option<SharedOrder> {
		let mut inner = self.lock();
		let index = inner.cursor?;
		let (order, next) = {
			let node = inner.node(index)?;
			(node.order.clone(), node.next)
		};
		inner.cursor = next;
		Some(order)
	}

	/// Moves the cursor back to the head.
	pub fn reset_pointer(&self) {
		let mut inner = self.lock();
		inner.cursor = inner.head;
	}

	pub fn len(&self) -> usize {
		self.lock().len
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	pub fn contains(&self, order_id: &str) -> bool {
		self.lock().find(order_id).is_some()
	}

	/// Order ids in list order.
	pub fn snapshot(&self) -> Vec<String> {
		let inner = self.lock();
		let mut ids = Vec::with_capacity(inner.len);
		let mut current = inner.head;
		while let Some(index) = current {
			let Some(node) = inner.node(index) else {
				break;
			};
			ids.push(node.order.id().to_string());
			current = node.next;
		}
		ids
	}
}
