//! Admission gate shared by the local and federation facades.
//!
//! Requests hold a [`Permit`] while they run. A reload closes the gate, waits
//! for the permits in flight to drain, swaps the pluggable components and
//! reopens the gate when its [`ReloadGuard`] drops.

use crate::BrokerError;
use std::time::Duration;
use tokio::sync::{watch, Mutex, MutexGuard};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct GateState {
	reloading: bool,
	in_flight: usize,
}

pub struct AdmissionGate {
	state: watch::Sender<GateState>,
	reload_lock: Mutex<()>,
}

impl Default for AdmissionGate {
	fn default() -> Self {
		Self::new()
	}
}

impl AdmissionGate {
	pub fn new() -> Self {
		Self {
			state: watch::Sender::new(GateState::default()),
			reload_lock: Mutex::new(()),
		}
	}

	/// Waits until no reload is in progress, then counts the caller in.
	pub async fn enter(&self) -> Permit<'_> {
		let mut rx = self.state.subscribe();
		loop {
			// The sender lives in self, so the channel never closes here.
			let _ = rx.wait_for(|s| !s.reloading).await;
			let admitted = self.state.send_if_modified(|s| {
				if s.reloading {
					return false;
				}
				s.in_flight += 1;
				true
			});
			if admitted {
				return Permit { gate: self };
			}
		}
	}

	/// Closes the gate and waits up to `drain_timeout` for requests in flight.
	///
	/// Only one reload may run at a time; a second caller gets `Conflict`.
	pub async fn begin_reload(
		&self,
		drain_timeout: Duration,
	) -> Result<ReloadGuard<'_>, BrokerError> {
		let lock = self
			.reload_lock
			.try_lock()
			.map_err(|_| BrokerError::Conflict("a reload is already in progress".into()))?;
		self.state.send_modify(|s| s.reloading = true);
		let guard = ReloadGuard {
			gate: self,
			_lock: lock,
		};

		let mut rx = self.state.subscribe();
		let drained = tokio::time::timeout(drain_timeout, rx.wait_for(|s| s.in_flight == 0))
			.await
			.is_ok();
		if !drained {
			tracing::warn!(
				in_flight = self.in_flight(),
				timeout_ms = drain_timeout.as_millis() as u64,
				"Requests still in flight after drain timeout, reloading anyway"
			);
		}
		Ok(guard)
	}

	pub fn in_flight(&self) -> usize {
		self.state.borrow().in_flight
	}

	pub fn is_reloading(&self) -> bool {
		self.state.borrow().reloading
	}
}

/// Counts one request in flight until dropped.
pub struct Permit<'a> {
	gate: &'a AdmissionGate,
}

impl Drop for Permit<'_> {
	fn drop(&mut self) {
		self.gate
			.state
			.send_modify(|s| s.in_flight = s.in_flight.saturating_sub(1));
	}
}

/// Keeps the gate closed until dropped.
pub struct ReloadGuard<'a> {
	gate: &'a AdmissionGate,
	_lock: MutexGuard<'a, ()>,
}

impl Drop for ReloadGuard<'_> {
	fn drop(&mut self) {
		self.gate.state.send_modify(|s| s.reloading = false);
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::Arc;

	#[tokio::test]
	async fn test_permits_count_in_flight() {
		let gate = AdmissionGate::new();
		let a = gate.enter().await;
		let b = gate.enter().await;
		assert_eq!(gate.in_flight(), 2);
		drop(a);
		assert_eq!(gate.in_flight(), 1);
		drop(b);
		assert_eq!(gate.in_flight(), 0);
	}

	#[tokio::test]
	async fn test_reload_waits_for_drain_and_blocks_new_requests() {
		let gate = Arc::new(AdmissionGate::new());
		let permit = gate.enter().await;

		let reloading = {
			let gate = gate.clone();
			tokio::spawn(async move {
				let _guard = gate.begin_reload(Duration::from_secs(5)).await.unwrap();
				tokio::time::sleep(Duration::from_millis(20)).await;
			})
		};
		tokio::time::sleep(Duration::from_millis(10)).await;
		assert!(gate.is_reloading());
		assert!(!reloading.is_finished());

		let late = {
			let gate = gate.clone();
			tokio::spawn(async move {
				let _permit = gate.enter().await;
				gate.is_reloading()
			})
		};
		tokio::time::sleep(Duration::from_millis(10)).await;
		assert!(!late.is_finished(), "request admitted during reload");

		drop(permit);
		reloading.await.unwrap();
		assert!(!late.await.unwrap(), "request ran while reload was in progress");
		assert_eq!(gate.in_flight(), 0);
	}

	#[tokio::test]
	async fn test_drain_timeout_proceeds() {
		let gate = AdmissionGate::new();
		let _stuck = gate.enter().await;

		let guard = gate.begin_reload(Duration::from_millis(10)).await.unwrap();
		assert!(gate.is_reloading());
		drop(guard);
		assert!(!gate.is_reloading());
	}

	#[tokio::test]
	async fn test_concurrent_reload_conflicts() {
		let gate = AdmissionGate::new();
		let _first = gate.begin_reload(Duration::from_millis(10)).await.unwrap();
		assert!(matches!(
			gate.begin_reload(Duration::from_millis(10)).await,
			Err(BrokerError::Conflict(_))
		));
	}
}
