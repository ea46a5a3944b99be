//! Broker engine that owns the order lifecycle at runtime.
//!
//! The engine holds every component the builder wired together. Starting it
//! recovers the queues from storage, starts the five processors and the
//! storage cleanup loop; shutting it down stops them again. Configuration
//! reload rebuilds the pluggable components and hands them to the facades.

use crate::authorization::create_authorization;
use crate::builder::{build_local_clouds, CloudSources};
use crate::facade::{ApplicationFacade, ReloadUpdate, RemoteFacade};
use crate::processors::ProcessorsController;
use crate::recovery::{RecoveryReport, RecoveryService};
use crate::registry::OrderRegistry;
use crate::BrokerError;
use arc_swap::ArcSwap;
use broker_cloud::CloudConnectorFactory;
use broker_config::Config;
use broker_storage::StorageService;
use broker_types::SystemUser;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

/// Errors that can occur while starting or running the engine.
#[derive(Debug, Error)]
pub enum EngineError {
	#[error("Configuration error: {0}")]
	Config(String),
	#[error("Recovery error: {0}")]
	Recovery(String),
	#[error("Service error: {0}")]
	Service(String),
}

/// Runtime of one broker provider.
pub struct BrokerEngine {
	config: ArcSwap<Config>,
	storage: Arc<StorageService>,
	registry: Arc<OrderRegistry>,
	connectors: Arc<CloudConnectorFactory>,
	processors: Arc<ProcessorsController>,
	application: ApplicationFacade,
	remote: RemoteFacade,
	recovery: RecoveryService,
	clouds: CloudSources,
	started: AtomicBool,
	shutdown: watch::Sender<bool>,
	cleanup: Mutex<Option<JoinHandle<()>>>,
}

impl BrokerEngine {
	#[allow(clippy::too_many_arguments)]
	pub(crate) fn new(
		config: Config,
		storage: Arc<StorageService>,
		registry: Arc<OrderRegistry>,
		connectors: Arc<CloudConnectorFactory>,
		processors: Arc<ProcessorsController>,
		application: ApplicationFacade,
		remote: RemoteFacade,
		recovery: RecoveryService,
		clouds: CloudSources,
	) -> Self {
		let (shutdown, _) = watch::channel(false);
		Self {
			config: ArcSwap::from_pointee(config),
			storage,
			registry,
			connectors,
			processors,
			application,
			remote,
			recovery,
			clouds,
			started: AtomicBool::new(false),
			shutdown,
			cleanup: Mutex::new(None),
		}
	}

	pub fn provider_id(&self) -> &str {
		self.connectors.local_provider_id()
	}

	/// Configuration currently in effect.
	pub fn config(&self) -> Arc<Config> {
		self.config.load_full()
	}

	pub fn storage(&self) -> &Arc<StorageService> {
		&self.storage
	}

	pub fn registry(&self) -> &Arc<OrderRegistry> {
		&self.registry
	}

	pub fn connectors(&self) -> &Arc<CloudConnectorFactory> {
		&self.connectors
	}

	pub fn processors(&self) -> &Arc<ProcessorsController> {
		&self.processors
	}

	pub fn application(&self) -> &ApplicationFacade {
		&self.application
	}

	pub fn remote(&self) -> &RemoteFacade {
		&self.remote
	}

	/// Recovers orders from storage and starts the background tasks.
	///
	/// Recovery completes before any processor runs. Calling it again is a no-op
	/// that returns an empty report.
	pub async fn initialize(&self) -> Result<RecoveryReport, EngineError> {
		if self.started.swap(true, Ordering::SeqCst) {
			return Ok(RecoveryReport::default());
		}

		let report = match self.recovery.recover_state().await {
			Ok(report) => report,
			Err(e) => {
				self.started.store(false, Ordering::SeqCst);
				return Err(EngineError::Recovery(e.to_string()));
			},
		};

		self.processors.start_all().await;
		self.start_cleanup().await;
		tracing::info!(
			provider_id = %self.provider_id(),
			recovered = report.total_orders,
			"Broker engine started"
		);
		Ok(report)
	}

	/// Runs until interrupted, then shuts down.
	pub async fn run(&self) -> Result<(), EngineError> {
		self.initialize().await?;
		tokio::signal::ctrl_c()
			.await
			.map_err(|e| EngineError::Service(format!("Failed to listen for shutdown: {}", e)))?;
		tracing::info!("Shutdown signal received");
		self.shutdown().await;
		Ok(())
	}

	/// Stops the processors and the cleanup loop.
	pub async fn shutdown(&self) {
		self.shutdown.send_replace(true);
		self.processors.stop_all().await;
		if let Some(handle) = self.cleanup.lock().await.take() {
			let _ = handle.await;
		}
		self.started.store(false, Ordering::SeqCst);
		tracing::info!("Broker engine stopped");
	}

	/// Applies a new configuration to the running broker.
	///
	/// Clouds, credential mappings, authorization, processor intervals and the
	/// drain timeout are replaced. The provider id and storage are fixed for the
	/// lifetime of the process.
	pub async fn reload(&self, user: &SystemUser, config: Config) -> Result<(), BrokerError> {
		if config.broker.provider_id != self.provider_id() {
			return Err(BrokerError::InvalidParameter(format!(
				"provider id cannot change on reload ({} -> {})",
				self.provider_id(),
				config.broker.provider_id
			)));
		}

		let clouds = build_local_clouds(&config, &self.clouds)
			.map_err(|e| BrokerError::InvalidParameter(e.to_string()))?;
		let authorization = create_authorization(&config.authorization)?;
		let update = ReloadUpdate {
			default_cloud_name: config.broker.default_cloud_name.clone(),
			clouds,
			authorization,
			processors: config.processors.clone(),
			drain_timeout: config.reload_drain_timeout(),
		};

		self.application.core().reload(user, update).await?;
		self.config.store(Arc::new(config));
		Ok(())
	}

	async fn start_cleanup(&self) {
		let storage = self.storage.clone();
		let period = Duration::from_secs(self.config.load().storage.cleanup_interval_seconds.max(1));
		self.shutdown.send_replace(false);
		let mut shutdown = self.shutdown.subscribe();

		let handle = tokio::spawn(async move {
			let mut interval = tokio::time::interval(period);
			interval.tick().await;
			loop {
				tokio::select! {
					_ = interval.tick() => {
						match storage.cleanup_expired().await {
							Ok(count) if count > 0 => {
								tracing::debug!(removed = count, "Storage cleanup");
							},
							Err(e) => {
								tracing::warn!(error = %e, "Storage cleanup failed");
							},
							_ => {},
						}
					},
					changed = shutdown.changed() => {
						if changed.is_err() || *shutdown.borrow() {
							break;
						}
					},
				}
			}
		});
		*self.cleanup.lock().await = Some(handle);
	}
}
