//! Test doubles shared by the unit tests of this crate.

use crate::authorization::AllowAllAuthorizationPlugin;
use crate::controller::OrderController;
use crate::facade::{ApplicationFacade, FacadeCore, RemoteFacade};
use crate::processors::{ProcessorContext, ProcessorsController};
use crate::registry::{OrderRegistry, SharedOrder};
use crate::state::StateTransitioner;
use async_trait::async_trait;
use broker_cloud::{
	CloudConnectorFactory, CloudCredential, CloudError, CloudPlugin, ConfiguredCredentialMapper,
	FederationClient, ImagePlugin, LocalCloudConnector, PluginSet, QuotaPlugin,
};
use broker_config::ProcessorsConfig;
use broker_storage::implementations::memory::MemoryStorage;
use broker_storage::{StorageError, StorageInterface, StorageService};
use broker_types::{
	AttachmentSpec, ComputeAction, ComputeSpec, ConfigSchema, ErrorCondition, FederationEnvelope,
	FederationError, FederationResponse, Image, ImageSummary, Instance, InstanceState,
	NetworkSpec, Order, OrderKind, OrderState, PublicIpSpec, Quota, ResourceAmounts,
	ResourceType, SecurityRule, SecurityRuleInstance, SystemUser, VolumeSpec,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

pub const LOCAL: &str = "provider-a";
pub const CLOUD: &str = "default";

pub fn user() -> SystemUser {
	SystemUser::new("user-1", "User One", "idp")
}

pub fn other_user() -> SystemUser {
	SystemUser::new("user-2", "User Two", "idp")
}

pub fn compute_kind() -> OrderKind {
	OrderKind::Compute(ComputeSpec {
		name: Some("vm".into()),
		vcpu: 2,
		memory_mb: 2048,
		disk_gb: 20,
		image_id: "img-ubuntu-22.04".into(),
		public_key: None,
		network_order_ids: vec![],
	})
}

pub fn network_kind() -> OrderKind {
	OrderKind::Network(NetworkSpec {
		name: Some("net".into()),
		cidr: "10.0.0.0/24".into(),
		gateway: None,
		allocation_mode: Default::default(),
	})
}

pub fn volume_kind() -> OrderKind {
	OrderKind::Volume(VolumeSpec {
		name: None,
		size_gb: 10,
	})
}

pub fn attachment_kind(compute_order_id: &str, volume_order_id: &str) -> OrderKind {
	OrderKind::Attachment(AttachmentSpec {
		compute_order_id: compute_order_id.into(),
		volume_order_id: volume_order_id.into(),
		device: None,
	})
}

pub fn public_ip_kind(compute_order_id: &str) -> OrderKind {
	OrderKind::PublicIp(PublicIpSpec {
		compute_order_id: compute_order_id.into(),
	})
}

/// Cloud plugin whose answers are set by the test.
pub struct ScriptedPlugin {
	request_result: Mutex<Option<Result<String, CloudError>>>,
	instance_state: Mutex<Result<InstanceState, CloudError>>,
	delete_result: Mutex<Result<(), CloudError>>,
	panic_on_get: AtomicBool,
	requests: AtomicUsize,
	deleted: Mutex<Vec<String>>,
	actions: Mutex<Vec<ComputeAction>>,
	rules: Mutex<Vec<SecurityRuleInstance>>,
}

impl ScriptedPlugin {
	pub fn new() -> Arc<Self> {
		Arc::new(Self {
			request_result: Mutex::new(None),
			instance_state: Mutex::new(Ok(InstanceState::Creating)),
			delete_result: Mutex::new(Ok(())),
			panic_on_get: AtomicBool::new(false),
			requests: AtomicUsize::new(0),
			deleted: Mutex::new(Vec::new()),
			actions: Mutex::new(Vec::new()),
			rules: Mutex::new(Vec::new()),
		})
	}

	/// Fixes the answer of every following request; otherwise ids are `vm-<n>`.
	pub fn set_request_result(&self, result: Result<String, CloudError>) {
		*self.request_result.lock().unwrap() = Some(result);
	}

	pub fn set_instance_state(&self, state: InstanceState) {
		*self.instance_state.lock().unwrap() = Ok(state);
	}

	pub fn set_instance_error(&self, error: CloudError) {
		*self.instance_state.lock().unwrap() = Err(error);
	}

	pub fn set_delete_result(&self, result: Result<(), CloudError>) {
		*self.delete_result.lock().unwrap() = result;
	}

	pub fn panic_on_get(&self, enabled: bool) {
		self.panic_on_get.store(enabled, Ordering::SeqCst);
	}

	pub fn request_count(&self) -> usize {
		self.requests.load(Ordering::SeqCst)
	}

	pub fn deleted(&self) -> Vec<String> {
		self.deleted.lock().unwrap().clone()
	}

	pub fn actions(&self) -> Vec<ComputeAction> {
		self.actions.lock().unwrap().clone()
	}
}

#[async_trait]
impl CloudPlugin for ScriptedPlugin {
	async fn request_instance(
		&self,
		_order: &Order,
		_credential: &CloudCredential,
	) -> Result<String, CloudError> {
		let n = self.requests.fetch_add(1, Ordering::SeqCst) + 1;
		match self.request_result.lock().unwrap().clone() {
			Some(result) => result,
			None => Ok(format!("vm-{}", n)),
		}
	}

	async fn get_instance(
		&self,
		order: &Order,
		_credential: &CloudCredential,
	) -> Result<Instance, CloudError> {
		if self.panic_on_get.load(Ordering::SeqCst) {
			panic!("scripted plugin panic");
		}
		let state = self.instance_state.lock().unwrap().clone()?;
		let id = order.instance_id.clone().unwrap_or_default();
		Ok(Instance::new(id, state, order.resource_type()))
	}

	async fn delete_instance(
		&self,
		order: &Order,
		_credential: &CloudCredential,
	) -> Result<(), CloudError> {
		self.delete_result.lock().unwrap().clone()?;
		if let Some(id) = &order.instance_id {
			self.deleted.lock().unwrap().push(id.clone());
		}
		Ok(())
	}

	async fn perform_action(
		&self,
		_order: &Order,
		action: ComputeAction,
		_credential: &CloudCredential,
	) -> Result<(), CloudError> {
		self.actions.lock().unwrap().push(action);
		Ok(())
	}

	async fn take_snapshot(
		&self,
		_order: &Order,
		name: &str,
		_credential: &CloudCredential,
	) -> Result<String, CloudError> {
		Ok(format!("img-{}", name))
	}

	async fn request_security_rule(
		&self,
		_order: &Order,
		rule: &SecurityRule,
		_credential: &CloudCredential,
	) -> Result<String, CloudError> {
		let mut rules = self.rules.lock().unwrap();
		let id = format!("rule-{}", rules.len() + 1);
		rules.push(SecurityRuleInstance {
			id: id.clone(),
			rule: rule.clone(),
		});
		Ok(id)
	}

	async fn get_security_rules(
		&self,
		_order: &Order,
		_credential: &CloudCredential,
	) -> Result<Vec<SecurityRuleInstance>, CloudError> {
		Ok(self.rules.lock().unwrap().clone())
	}

	async fn delete_security_rule(
		&self,
		_order: &Order,
		rule_id: &str,
		_credential: &CloudCredential,
	) -> Result<(), CloudError> {
		let mut rules = self.rules.lock().unwrap();
		let before = rules.len();
		rules.retain(|r| r.id != rule_id);
		if rules.len() == before {
			return Err(CloudError::NotFound(format!("rule {}", rule_id)));
		}
		Ok(())
	}
}

#[async_trait]
impl QuotaPlugin for ScriptedPlugin {
	async fn get_user_quota(
		&self,
		_resource_type: ResourceType,
		_credential: &CloudCredential,
	) -> Result<Quota, CloudError> {
		let total = ResourceAmounts {
			instances: 10,
			vcpu: 20,
			ram_mb: 40960,
			disk_gb: 500,
			networks: 5,
			public_ips: 5,
			volumes: 10,
		};
		Ok(Quota::new(total, ResourceAmounts::default()))
	}
}

#[async_trait]
impl ImagePlugin for ScriptedPlugin {
	async fn get_all_images(
		&self,
		_credential: &CloudCredential,
	) -> Result<Vec<ImageSummary>, CloudError> {
		Ok(vec![ImageSummary {
			id: "img-ubuntu-22.04".into(),
			name: "ubuntu-22.04".into(),
		}])
	}

	async fn get_image(
		&self,
		image_id: &str,
		_credential: &CloudCredential,
	) -> Result<Image, CloudError> {
		if image_id != "img-ubuntu-22.04" {
			return Err(CloudError::NotFound(format!("image {}", image_id)));
		}
		Ok(Image {
			id: image_id.into(),
			name: "ubuntu-22.04".into(),
			size_bytes: 1 << 30,
			min_disk_gb: 10,
			min_ram_mb: 512,
			status: "active".into(),
		})
	}
}

/// Records every envelope and answers with canned responses.
pub struct RecordingFederationClient {
	sent: Mutex<Vec<(String, FederationEnvelope)>>,
	responses: Mutex<HashMap<&'static str, Result<FederationResponse, FederationError>>>,
	default_response: Mutex<Result<FederationResponse, FederationError>>,
}

impl RecordingFederationClient {
	pub fn new() -> Arc<Self> {
		Arc::new(Self {
			sent: Mutex::new(Vec::new()),
			responses: Mutex::new(HashMap::new()),
			default_response: Mutex::new(Err(FederationError::new(
				ErrorCondition::ProviderUnavailable,
				"no peer",
			))),
		})
	}

	/// Answers every operation without a specific response with `Empty`.
	pub fn respond_ok(&self) {
		*self.default_response.lock().unwrap() = Ok(FederationResponse::Empty);
	}

	pub fn respond_to(
		&self,
		operation: &'static str,
		response: Result<FederationResponse, FederationError>,
	) {
		self.responses.lock().unwrap().insert(operation, response);
	}

	pub fn sent(&self) -> Vec<(String, FederationEnvelope)> {
		self.sent.lock().unwrap().clone()
	}

	pub fn sent_operations(&self) -> Vec<&'static str> {
		self.sent
			.lock()
			.unwrap()
			.iter()
			.map(|(_, envelope)| envelope.request.operation())
			.collect()
	}
}

#[async_trait]
impl FederationClient for RecordingFederationClient {
	async fn send(
		&self,
		destination_provider: &str,
		envelope: FederationEnvelope,
	) -> Result<FederationResponse, FederationError> {
		let operation = envelope.request.operation();
		self.sent
			.lock()
			.unwrap()
			.push((destination_provider.to_string(), envelope));
		let specific = self.responses.lock().unwrap().get(operation).cloned();
		specific.unwrap_or_else(|| self.default_response.lock().unwrap().clone())
	}
}

/// Delivers envelopes straight to the remote facade of the destination.
#[derive(Default)]
pub struct LoopbackFederationClient {
	peers: RwLock<HashMap<String, RemoteFacade>>,
}

impl LoopbackFederationClient {
	pub fn register(&self, provider_id: &str, facade: RemoteFacade) {
		self.peers
			.write()
			.unwrap()
			.insert(provider_id.to_string(), facade);
	}
}

#[async_trait]
impl FederationClient for LoopbackFederationClient {
	async fn send(
		&self,
		destination_provider: &str,
		envelope: FederationEnvelope,
	) -> Result<FederationResponse, FederationError> {
		let facade = self
			.peers
			.read()
			.unwrap()
			.get(destination_provider)
			.cloned()
			.ok_or_else(|| {
				FederationError::new(ErrorCondition::ProviderUnavailable, "unknown peer")
			})?;
		facade.handle(envelope).await
	}
}

/// Storage backend that can be told to reject writes.
pub struct FailingStorage {
	inner: MemoryStorage,
	fail_writes: Arc<AtomicBool>,
}

/// Switch controlling a [`FailingStorage`].
#[derive(Clone)]
pub struct StorageFaults(Arc<AtomicBool>);

impl StorageFaults {
	pub fn fail_writes(&self, enabled: bool) {
		self.0.store(enabled, Ordering::SeqCst);
	}
}

impl FailingStorage {
	pub fn new() -> (Self, StorageFaults) {
		let flag = Arc::new(AtomicBool::new(false));
		(
			Self {
				inner: MemoryStorage::new(),
				fail_writes: flag.clone(),
			},
			StorageFaults(flag),
		)
	}

	fn check(&self) -> Result<(), StorageError> {
		if self.fail_writes.load(Ordering::SeqCst) {
			return Err(StorageError::Backend("disk full".into()));
		}
		Ok(())
	}
}

#[async_trait]
impl StorageInterface for FailingStorage {
	async fn get_bytes(&self, key: &str) -> Result<Vec<u8>, StorageError> {
		self.inner.get_bytes(key).await
	}

	async fn set_bytes(
		&self,
		key: &str,
		value: Vec<u8>,
		ttl: Option<Duration>,
	) -> Result<(), StorageError> {
		self.check()?;
		self.inner.set_bytes(key, value, ttl).await
	}

	async fn delete(&self, key: &str) -> Result<(), StorageError> {
		self.check()?;
		self.inner.delete(key).await
	}

	async fn exists(&self, key: &str) -> Result<bool, StorageError> {
		self.inner.exists(key).await
	}

	async fn list_ids(&self, namespace: &str) -> Result<Vec<String>, StorageError> {
		self.inner.list_ids(namespace).await
	}

	fn config_schema(&self) -> Box<dyn ConfigSchema> {
		self.inner.config_schema()
	}
}

/// One provider's core components wired over a scripted cloud.
pub struct Harness {
	pub provider_id: String,
	pub storage: StorageFaults,
	pub storage_service: Arc<StorageService>,
	pub registry: Arc<OrderRegistry>,
	pub transitioner: Arc<StateTransitioner>,
	pub connectors: Arc<CloudConnectorFactory>,
	pub federation: Arc<RecordingFederationClient>,
	controller: Arc<OrderController>,
	context: Arc<ProcessorContext>,
}

impl Harness {
	/// Provider `provider-a` with one cloud served by `plugin` and a recording
	/// federation client.
	pub fn local(plugin: Arc<ScriptedPlugin>) -> Self {
		let federation = RecordingFederationClient::new();
		Self::build(LOCAL, plugin, federation.clone(), federation)
	}

	/// Provider `provider_id` whose federation traffic goes through `client`.
	pub fn with_client(
		provider_id: &str,
		plugin: Arc<ScriptedPlugin>,
		client: Arc<dyn FederationClient>,
	) -> Self {
		Self::build(provider_id, plugin, RecordingFederationClient::new(), client)
	}

	fn build(
		provider_id: &str,
		plugin: Arc<ScriptedPlugin>,
		federation: Arc<RecordingFederationClient>,
		client: Arc<dyn FederationClient>,
	) -> Self {
		let (backend, storage) = FailingStorage::new();
		let storage_service = Arc::new(StorageService::new(Box::new(backend)));
		let registry = Arc::new(OrderRegistry::new());
		let transitioner = Arc::new(StateTransitioner::new(
			provider_id,
			storage_service.clone(),
			registry.clone(),
			client.clone(),
		));
		let connectors = Arc::new(CloudConnectorFactory::new(
			provider_id,
			CLOUD,
			local_clouds(plugin),
			client,
		));
		let controller = Arc::new(OrderController::new(
			provider_id,
			registry.clone(),
			transitioner.clone(),
			connectors.clone(),
		));
		let context = Arc::new(ProcessorContext {
			local_provider_id: provider_id.to_string(),
			registry: registry.clone(),
			transitioner: transitioner.clone(),
			connectors: connectors.clone(),
		});
		Self {
			provider_id: provider_id.to_string(),
			storage,
			storage_service,
			registry,
			transitioner,
			connectors,
			federation,
			controller,
			context,
		}
	}

	pub fn context(&self) -> Arc<ProcessorContext> {
		self.context.clone()
	}

	pub fn controller(&self) -> Arc<OrderController> {
		self.controller.clone()
	}

	pub async fn activate_local(&self, kind: OrderKind) -> SharedOrder {
		let order = Order::new(user(), &self.provider_id, &self.provider_id, CLOUD, kind);
		self.transitioner.activate(order).await.unwrap()
	}

	pub async fn activate_remote(&self, kind: OrderKind, provider: &str) -> SharedOrder {
		let order = Order::new(user(), &self.provider_id, provider, CLOUD, kind);
		self.transitioner.activate(order).await.unwrap()
	}

	/// Walks an order through `path` with plain transitions.
	pub async fn drive(&self, order: &SharedOrder, path: &[OrderState]) {
		let mut locked = order.lock().await;
		for state in path {
			self.transitioner.transition(&mut locked, *state).await.unwrap();
		}
	}

	pub fn states_holding(&self, order_id: &str) -> Vec<OrderState> {
		self.registry.states_holding(order_id)
	}

	/// Both facades over this harness, allowing every operation.
	pub fn facades(
		&self,
		processors: &ProcessorsConfig,
	) -> (ApplicationFacade, RemoteFacade, Arc<ProcessorsController>) {
		let processors = Arc::new(ProcessorsController::new(self.context(), processors));
		let core = Arc::new(FacadeCore::new(
			self.controller(),
			self.connectors.clone(),
			processors.clone(),
			Box::new(AllowAllAuthorizationPlugin),
			Duration::from_secs(1),
		));
		(
			ApplicationFacade::new(core.clone()),
			RemoteFacade::new(core),
			processors,
		)
	}
}

pub fn local_clouds(plugin: Arc<ScriptedPlugin>) -> HashMap<String, LocalCloudConnector> {
	let empty = toml::Value::Table(Default::default());
	let mapper = ConfiguredCredentialMapper::from_config(CLOUD, &empty).unwrap();
	HashMap::from([(
		CLOUD.to_string(),
		LocalCloudConnector::new(CLOUD, PluginSet::uniform(plugin), Arc::new(mapper)),
	)])
}

/// Polls until the order reaches `state` or the timeout expires.
pub async fn wait_for_state(order: &SharedOrder, state: OrderState, timeout: Duration) -> bool {
	let deadline = tokio::time::Instant::now() + timeout;
	loop {
		if order.lock().await.state == state {
			return true;
		}
		if tokio::time::Instant::now() >= deadline {
			return false;
		}
		tokio::time::sleep(Duration::from_millis(5)).await;
	}
}
