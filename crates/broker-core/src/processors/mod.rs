//! Background processors that advance orders through their lifecycle.
//!
//! Each processor is bound to one state queue. Its loop takes the next order
//! from the queue and processes it; once the queue is exhausted it rewinds the
//! cursor and sleeps for its configured interval. A failure or panic while
//! processing one order is logged and the loop moves on.

pub mod closed;
pub mod failed;
pub mod fulfilled;
pub mod open;
pub mod spawning;

pub use closed::ClosedProcessor;
pub use failed::FailedRecoveryProcessor;
pub use fulfilled::FulfilledProcessor;
pub use open::OpenProcessor;
pub use spawning::SpawningProcessor;

use crate::registry::{OrderRegistry, SharedOrder};
use crate::state::StateTransitioner;
use crate::BrokerError;
use async_trait::async_trait;
use broker_cloud::CloudConnectorFactory;
use broker_config::ProcessorsConfig;
use broker_types::{truncate_id, OrderState};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

/// What every processor needs to act on orders.
pub struct ProcessorContext {
	pub local_provider_id: String,
	pub registry: Arc<OrderRegistry>,
	pub transitioner: Arc<StateTransitioner>,
	pub connectors: Arc<CloudConnectorFactory>,
}

/// One stage of the order lifecycle.
#[async_trait]
pub trait OrderProcessor: Send + Sync {
	fn name(&self) -> &'static str;

	/// State whose queue this processor consumes.
	fn state(&self) -> OrderState;

	/// Handles one order taken from the queue.
	///
	/// Implementations lock the order and re-check its state before acting,
	/// since it may have moved since it was dequeued.
	async fn process(&self, order: SharedOrder) -> Result<(), BrokerError>;
}

/// Runs a processor until `shutdown` turns true or its sender is dropped.
pub async fn run_processor(
	processor: Arc<dyn OrderProcessor>,
	registry: Arc<OrderRegistry>,
	interval: watch::Receiver<Duration>,
	mut shutdown: watch::Receiver<bool>,
) {
	let Some(queue) = registry.queue(processor.state()) else {
		tracing::error!(processor = processor.name(), "No queue for processor state");
		return;
	};
	tracing::debug!(processor = processor.name(), "Processor started");

	loop {
		if *shutdown.borrow() {
			break;
		}

		match queue.get_next() {
			Some(order) => {
				let order_id = truncate_id(order.id());
				match AssertUnwindSafe(processor.process(order)).catch_unwind().await {
					Ok(Ok(())) => {},
					Ok(Err(e)) => {
						tracing::warn!(
							processor = processor.name(),
							order_id = %order_id,
							error = %e,
							"Failed to process order"
						);
					},
					Err(_) => {
						tracing::error!(
							processor = processor.name(),
							order_id = %order_id,
							"Processor panicked while handling order"
						);
					},
				}
			},
			None => {
				queue.reset_pointer();
				let sleep = *interval.borrow();
				tokio::select! {
					_ = tokio::time::sleep(sleep) => {}
					changed = shutdown.changed() => {
						if changed.is_err() {
							break;
						}
					}
				}
			},
		}
	}

	tracing::debug!(processor = processor.name(), "Processor stopped");
}

struct ProcessorHandle {
	processor: Arc<dyn OrderProcessor>,
	interval: watch::Sender<Duration>,
}

/// Starts, stops and retunes the five processors.
pub struct ProcessorsController {
	registry: Arc<OrderRegistry>,
	processors: Vec<ProcessorHandle>,
	shutdown: watch::Sender<bool>,
	tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ProcessorsController {
	pub fn new(context: Arc<ProcessorContext>, config: &ProcessorsConfig) -> Self {
		let processors: Vec<Arc<dyn OrderProcessor>> = vec![
			Arc::new(OpenProcessor::new(context.clone())),
			Arc::new(SpawningProcessor::new(context.clone())),
			Arc::new(FulfilledProcessor::new(context.clone())),
			Arc::new(FailedRecoveryProcessor::new(context.clone())),
			Arc::new(ClosedProcessor::new(context.clone())),
		];
		let processors = processors
			.into_iter()
			.zip(config.intervals())
			.map(|(processor, (_, interval))| ProcessorHandle {
				processor,
				interval: watch::Sender::new(interval),
			})
			.collect();
		let (shutdown, _) = watch::channel(false);

		Self {
			registry: context.registry.clone(),
			processors,
			shutdown,
			tasks: Mutex::new(Vec::new()),
		}
	}

	/// Spawns one task per processor. Does nothing if they already run.
	pub async fn start_all(&self) {
		let mut tasks = self.tasks.lock().await;
		if !tasks.is_empty() {
			return;
		}
		self.shutdown.send_replace(false);
		for handle in &self.processors {
			tasks.push(tokio::spawn(run_processor(
				handle.processor.clone(),
				self.registry.clone(),
				handle.interval.subscribe(),
				self.shutdown.subscribe(),
			)));
		}
		tracing::info!(count = tasks.len(), "Processors started");
	}

	/// Signals every processor to stop and waits for them.
	pub async fn stop_all(&self) {
		let mut tasks = self.tasks.lock().await;
		self.shutdown.send_replace(true);
		for task in tasks.drain(..) {
			if let Err(e) = task.await {
				tracing::error!(error = %e, "Processor task failed");
			}
		}
		tracing::info!("Processors stopped");
	}

	/// Applies new sleep intervals; running loops pick them up on their next sleep.
	pub fn reset(&self, config: &ProcessorsConfig) {
		for (handle, (key, interval)) in self.processors.iter().zip(config.intervals()) {
			let previous = handle.interval.send_replace(interval);
			if previous != interval {
				tracing::info!(
					processor = handle.processor.name(),
					setting = key,
					interval_ms = interval.as_millis() as u64,
					"Processor interval changed"
				);
			}
		}
	}

	pub async fn is_running(&self) -> bool {
		!self.tasks.lock().await.is_empty()
	}

	/// Current interval of each processor, by name.
	pub fn intervals(&self) -> Vec<(&'static str, Duration)> {
		self.processors
			.iter()
			.map(|handle| (handle.processor.name(), *handle.interval.borrow()))
			.collect()
	}
}
