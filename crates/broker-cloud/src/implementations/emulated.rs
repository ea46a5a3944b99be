//! In-memory emulated cloud.
//!
//! Keeps every resource in process memory. Useful for development setups and
//! for exercising the full lifecycle without a real provider.
//!
//! ```toml
//! [clouds.default]
//! implementation = "emulated"
//! [clouds.default.config]
//! ready_after_polls = 2
//! images = ["ubuntu-22.04", "debian-12"]
//! [clouds.default.config.quota]
//! instances = 10
//! vcpu = 32
//! ```

use crate::{
	CloudCredential, CloudError, CloudFactory, CloudPlugin, CloudRegistry, ImagePlugin,
	PluginSet, QuotaPlugin,
};
use async_trait::async_trait;
use broker_types::{
	ComputeAction, ConfigSchema, Field, FieldType, Image, ImageSummary, ImplementationRegistry,
	Instance, InstanceState, Order, OrderKind, Quota, ResourceAmounts, ResourceType, Schema,
	SecurityRule, SecurityRuleInstance, ValidationError,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

const DEFAULT_IMAGES: [&str; 2] = ["ubuntu-22.04", "debian-12"];

fn default_quota() -> ResourceAmounts {
	ResourceAmounts {
		instances: 20,
		vcpu: 64,
		ram_mb: 131_072,
		disk_gb: 2_000,
		networks: 10,
		public_ips: 10,
		volumes: 20,
	}
}

struct EmulatedResource {
	owner: String,
	resource_type: ResourceType,
	state: InstanceState,
	polls: u32,
	usage: ResourceAmounts,
	attributes: Vec<(String, String)>,
	rules: Vec<SecurityRuleInstance>,
}

/// Emulated cloud serving every resource type.
pub struct EmulatedCloud {
	cloud_name: String,
	ready_after_polls: u32,
	quota: ResourceAmounts,
	resources: RwLock<HashMap<String, EmulatedResource>>,
	images: RwLock<Vec<Image>>,
}

impl EmulatedCloud {
	pub fn new(cloud_name: impl Into<String>, ready_after_polls: u32) -> Self {
		Self::with_catalogue(
			cloud_name,
			ready_after_polls,
			default_quota(),
			DEFAULT_IMAGES.iter().map(|name| name.to_string()).collect(),
		)
	}

	pub fn with_catalogue(
		cloud_name: impl Into<String>,
		ready_after_polls: u32,
		quota: ResourceAmounts,
		image_names: Vec<String>,
	) -> Self {
		let images = image_names
			.into_iter()
			.map(|name| Image {
				id: format!("img-{}", name),
				name,
				size_bytes: 2 * 1024 * 1024 * 1024,
				min_disk_gb: 10,
				min_ram_mb: 512,
				status: "active".to_string(),
			})
			.collect();
		Self {
			cloud_name: cloud_name.into(),
			ready_after_polls,
			quota,
			resources: RwLock::new(HashMap::new()),
			images: RwLock::new(images),
		}
	}

	/// Forces the state of an instance, as if the cloud changed it.
	pub async fn set_instance_state(
		&self,
		instance_id: &str,
		state: InstanceState,
	) -> Result<(), CloudError> {
		let mut resources = self.resources.write().await;
		let resource = resources
			.get_mut(instance_id)
			.ok_or_else(|| CloudError::NotFound(instance_id.to_string()))?;
		resource.state = state;
		Ok(())
	}

	/// Number of resources currently held by the cloud.
	pub async fn resource_count(&self) -> usize {
		self.resources.read().await.len()
	}

	fn usage_of(kind: &OrderKind) -> ResourceAmounts {
		match kind {
			OrderKind::Compute(spec) => ResourceAmounts {
				instances: 1,
				vcpu: spec.vcpu,
				ram_mb: spec.memory_mb,
				disk_gb: spec.disk_gb,
				..Default::default()
			},
			OrderKind::Network(_) => ResourceAmounts {
				networks: 1,
				..Default::default()
			},
			OrderKind::Volume(spec) => ResourceAmounts {
				volumes: 1,
				disk_gb: spec.size_gb,
				..Default::default()
			},
			OrderKind::PublicIp(_) => ResourceAmounts {
				public_ips: 1,
				..Default::default()
			},
			OrderKind::Attachment(_) => ResourceAmounts::default(),
		}
	}

	fn attributes_of(kind: &OrderKind, sequence: usize) -> Vec<(String, String)> {
		let octet = sequence % 250 + 2;
		match kind {
			OrderKind::Compute(spec) => vec![
				("vcpu".to_string(), spec.vcpu.to_string()),
				("memory_mb".to_string(), spec.memory_mb.to_string()),
				("disk_gb".to_string(), spec.disk_gb.to_string()),
				("image_id".to_string(), spec.image_id.clone()),
				("ip".to_string(), format!("10.0.0.{}", octet)),
				("power_state".to_string(), "running".to_string()),
			],
			OrderKind::Network(spec) => vec![
				("cidr".to_string(), spec.cidr.clone()),
				(
					"gateway".to_string(),
					spec.gateway.clone().unwrap_or_default(),
				),
			],
			OrderKind::Volume(spec) => vec![("size_gb".to_string(), spec.size_gb.to_string())],
			OrderKind::Attachment(spec) => vec![(
				"device".to_string(),
				spec.device.clone().unwrap_or_else(|| "/dev/vdb".to_string()),
			)],
			OrderKind::PublicIp(_) => vec![("ip".to_string(), format!("203.0.113.{}", octet))],
		}
	}

	fn used_by(resources: &HashMap<String, EmulatedResource>, owner: &str) -> ResourceAmounts {
		resources
			.values()
			.filter(|resource| resource.owner == owner)
			.fold(ResourceAmounts::default(), |acc, resource| {
				acc.saturating_add(&resource.usage)
			})
	}

	fn exceeds(requested: &ResourceAmounts, available: &ResourceAmounts) -> bool {
		requested.instances > available.instances
			|| requested.vcpu > available.vcpu
			|| requested.ram_mb > available.ram_mb
			|| requested.disk_gb > available.disk_gb
			|| requested.networks > available.networks
			|| requested.public_ips > available.public_ips
			|| requested.volumes > available.volumes
	}

	fn instance_id(order: &Order) -> Result<&str, CloudError> {
		order
			.instance_id
			.as_deref()
			.ok_or_else(|| CloudError::NotFound(format!("order {} has no instance", order.id)))
	}

	fn supports_rules(order: &Order) -> Result<(), CloudError> {
		match order.resource_type() {
			ResourceType::Network | ResourceType::PublicIp => Ok(()),
			other => Err(CloudError::InvalidParameter(format!(
				"security rules do not apply to {} orders",
				other
			))),
		}
	}
}

#[async_trait]
impl CloudPlugin for EmulatedCloud {
	async fn request_instance(
		&self,
		order: &Order,
		credential: &CloudCredential,
	) -> Result<String, CloudError> {
		if let OrderKind::Compute(spec) = &order.kind {
			let images = self.images.read().await;
			if !images.iter().any(|image| image.id == spec.image_id) {
				return Err(CloudError::ProviderRejected(format!(
					"unknown image {}",
					spec.image_id
				)));
			}
		}

		let usage = Self::usage_of(&order.kind);
		let mut resources = self.resources.write().await;
		let available = self
			.quota
			.saturating_sub(&Self::used_by(&resources, &credential.user_id));
		if Self::exceeds(&usage, &available) {
			return Err(CloudError::ProviderRejected(format!(
				"quota exceeded in cloud {}",
				self.cloud_name
			)));
		}

		let instance_id = format!("{}-{}", order.resource_type(), uuid::Uuid::new_v4());
		let state = if self.ready_after_polls == 0 {
			InstanceState::Ready
		} else {
			InstanceState::Creating
		};
		let attributes = Self::attributes_of(&order.kind, resources.len());
		resources.insert(
			instance_id.clone(),
			EmulatedResource {
				owner: credential.user_id.clone(),
				resource_type: order.resource_type(),
				state,
				polls: 0,
				usage,
				attributes,
				rules: Vec::new(),
			},
		);
		Ok(instance_id)
	}

	async fn get_instance(
		&self,
		order: &Order,
		_credential: &CloudCredential,
	) -> Result<Instance, CloudError> {
		let instance_id = Self::instance_id(order)?;
		let mut resources = self.resources.write().await;
		let resource = resources
			.get_mut(instance_id)
			.ok_or_else(|| CloudError::NotFound(instance_id.to_string()))?;

		resource.polls = resource.polls.saturating_add(1);
		if resource.state == InstanceState::Creating && resource.polls >= self.ready_after_polls
		{
			resource.state = InstanceState::Ready;
		}

		let mut instance = Instance::new(instance_id, resource.state, resource.resource_type);
		for (key, value) in &resource.attributes {
			instance = instance.with_attribute(key.clone(), value);
		}
		Ok(instance)
	}

	async fn delete_instance(
		&self,
		order: &Order,
		_credential: &CloudCredential,
	) -> Result<(), CloudError> {
		let instance_id = Self::instance_id(order)?;
		self.resources
			.write()
			.await
			.remove(instance_id)
			.map(|_| ())
			.ok_or_else(|| CloudError::NotFound(instance_id.to_string()))
	}

	async fn perform_action(
		&self,
		order: &Order,
		action: ComputeAction,
		_credential: &CloudCredential,
	) -> Result<(), CloudError> {
		let instance_id = Self::instance_id(order)?;
		let mut resources = self.resources.write().await;
		let resource = resources
			.get_mut(instance_id)
			.ok_or_else(|| CloudError::NotFound(instance_id.to_string()))?;
		if resource.resource_type != ResourceType::Compute {
			return Err(CloudError::NotImplemented(format!(
				"{} is not supported for {} resources",
				action, resource.resource_type
			)));
		}
		if resource.state != InstanceState::Ready {
			return Err(CloudError::NotAcceptable(format!(
				"instance {} is {}",
				instance_id, resource.state
			)));
		}
		let power_state = match action {
			ComputeAction::Pause => "paused",
			ComputeAction::Hibernate => "hibernated",
			ComputeAction::Stop => "stopped",
			ComputeAction::Resume => "running",
		};
		match resource
			.attributes
			.iter_mut()
			.find(|(key, _)| key == "power_state")
		{
			Some((_, value)) => *value = power_state.to_string(),
			None => resource
				.attributes
				.push(("power_state".to_string(), power_state.to_string())),
		}
		Ok(())
	}

	async fn take_snapshot(
		&self,
		order: &Order,
		name: &str,
		_credential: &CloudCredential,
	) -> Result<String, CloudError> {
		let instance_id = Self::instance_id(order)?;
		let disk_gb = {
			let resources = self.resources.read().await;
			let resource = resources
				.get(instance_id)
				.ok_or_else(|| CloudError::NotFound(instance_id.to_string()))?;
			if resource.resource_type != ResourceType::Compute {
				return Err(CloudError::NotImplemented(
					"snapshots are only supported for compute resources".into(),
				));
			}
			resource.usage.disk_gb
		};

		let image = Image {
			id: format!("img-{}", uuid::Uuid::new_v4()),
			name: name.to_string(),
			size_bytes: u64::from(disk_gb) * 1024 * 1024 * 1024,
			min_disk_gb: disk_gb,
			min_ram_mb: 512,
			status: "active".to_string(),
		};
		let image_id = image.id.clone();
		self.images.write().await.push(image);
		Ok(image_id)
	}

	async fn request_security_rule(
		&self,
		order: &Order,
		rule: &SecurityRule,
		_credential: &CloudCredential,
	) -> Result<String, CloudError> {
		Self::supports_rules(order)?;
		let instance_id = Self::instance_id(order)?;
		let mut resources = self.resources.write().await;
		let resource = resources
			.get_mut(instance_id)
			.ok_or_else(|| CloudError::NotFound(instance_id.to_string()))?;
		if resource.rules.iter().any(|existing| existing.rule == *rule) {
			return Err(CloudError::Conflict("security rule already exists".into()));
		}
		let id = format!("rule-{}", uuid::Uuid::new_v4());
		resource.rules.push(SecurityRuleInstance {
			id: id.clone(),
			rule: rule.clone(),
		});
		Ok(id)
	}

	async fn get_security_rules(
		&self,
		order: &Order,
		_credential: &CloudCredential,
	) -> Result<Vec<SecurityRuleInstance>, CloudError> {
		Self::supports_rules(order)?;
		let instance_id = Self::instance_id(order)?;
		let resources = self.resources.read().await;
		resources
			.get(instance_id)
			.map(|resource| resource.rules.clone())
			.ok_or_else(|| CloudError::NotFound(instance_id.to_string()))
	}

	async fn delete_security_rule(
		&self,
		order: &Order,
		rule_id: &str,
		_credential: &CloudCredential,
	) -> Result<(), CloudError> {
		Self::supports_rules(order)?;
		let instance_id = Self::instance_id(order)?;
		let mut resources = self.resources.write().await;
		let resource = resources
			.get_mut(instance_id)
			.ok_or_else(|| CloudError::NotFound(instance_id.to_string()))?;
		let before = resource.rules.len();
		resource.rules.retain(|rule| rule.id != rule_id);
		if resource.rules.len() == before {
			return Err(CloudError::NotFound(format!("security rule {}", rule_id)));
		}
		Ok(())
	}
}

#[async_trait]
impl QuotaPlugin for EmulatedCloud {
	async fn get_user_quota(
		&self,
		_resource_type: ResourceType,
		credential: &CloudCredential,
	) -> Result<Quota, CloudError> {
		let resources = self.resources.read().await;
		Ok(Quota::new(
			self.quota,
			Self::used_by(&resources, &credential.user_id),
		))
	}
}

#[async_trait]
impl ImagePlugin for EmulatedCloud {
	async fn get_all_images(
		&self,
		_credential: &CloudCredential,
	) -> Result<Vec<ImageSummary>, CloudError> {
		Ok(self
			.images
			.read()
			.await
			.iter()
			.map(|image| ImageSummary {
				id: image.id.clone(),
				name: image.name.clone(),
			})
			.collect())
	}

	async fn get_image(
		&self,
		image_id: &str,
		_credential: &CloudCredential,
	) -> Result<Image, CloudError> {
		self.images
			.read()
			.await
			.iter()
			.find(|image| image.id == image_id)
			.cloned()
			.ok_or_else(|| CloudError::NotFound(format!("image {}", image_id)))
	}
}

/// Configuration schema for the emulated cloud.
pub struct EmulatedCloudSchema;

impl ConfigSchema for EmulatedCloudSchema {
	fn validate(&self, config: &toml::Value) -> Result<(), ValidationError> {
		let amount = || FieldType::Integer {
			min: Some(0),
			max: Some(i64::from(u32::MAX)),
		};
		let quota = Schema::new(
			vec![],
			vec![
				Field::new("instances", amount()),
				Field::new("vcpu", amount()),
				Field::new("ram_mb", amount()),
				Field::new("disk_gb", amount()),
				Field::new("networks", amount()),
				Field::new("public_ips", amount()),
				Field::new("volumes", amount()),
			],
		);
		let schema = Schema::new(
			vec![],
			vec![
				Field::new(
					"ready_after_polls",
					FieldType::Integer {
						min: Some(0),
						max: Some(1_000),
					},
				),
				Field::new("images", FieldType::Array(Box::new(FieldType::String))),
				Field::new("quota", FieldType::Table(quota)),
				Field::new("default_credential", FieldType::String),
			],
		);
		schema.validate(config)
	}
}

fn read_u32(table: Option<&toml::Value>, key: &str, default: u32) -> u32 {
	table
		.and_then(|t| t.get(key))
		.and_then(|v| v.as_integer())
		.and_then(|v| u32::try_from(v).ok())
		.unwrap_or(default)
}

/// Builds an emulated cloud from its configuration table.
pub fn create_cloud(cloud_name: &str, config: &toml::Value) -> Result<PluginSet, CloudError> {
	EmulatedCloudSchema
		.validate(config)
		.map_err(|e| CloudError::Configuration(format!("cloud {}: {}", cloud_name, e)))?;

	let ready_after_polls = read_u32(Some(config), "ready_after_polls", 0);
	let defaults = default_quota();
	let quota_table = config.get("quota");
	let quota = ResourceAmounts {
		instances: read_u32(quota_table, "instances", defaults.instances),
		vcpu: read_u32(quota_table, "vcpu", defaults.vcpu),
		ram_mb: read_u32(quota_table, "ram_mb", defaults.ram_mb),
		disk_gb: read_u32(quota_table, "disk_gb", defaults.disk_gb),
		networks: read_u32(quota_table, "networks", defaults.networks),
		public_ips: read_u32(quota_table, "public_ips", defaults.public_ips),
		volumes: read_u32(quota_table, "volumes", defaults.volumes),
	};
	let images = match config.get("images").and_then(|v| v.as_array()) {
		Some(names) => names
			.iter()
			.filter_map(|name| name.as_str().map(str::to_string))
			.collect(),
		None => DEFAULT_IMAGES.iter().map(|name| name.to_string()).collect(),
	};

	tracing::debug!(cloud = %cloud_name, ready_after_polls, "Emulated cloud created");
	Ok(PluginSet::uniform(Arc::new(EmulatedCloud::with_catalogue(
		cloud_name,
		ready_after_polls,
		quota,
		images,
	))))
}

/// Registry for the emulated cloud implementation.
pub struct Registry;

impl ImplementationRegistry for Registry {
	const NAME: &'static str = "emulated";
	type Factory = CloudFactory;

	fn factory() -> Self::Factory {
		create_cloud
	}
}

impl CloudRegistry for Registry {}

#[cfg(test)]
mod tests {
	use super::*;
	use broker_types::{
		ComputeSpec, Direction, EtherType, NetworkSpec, Protocol, SystemUser, VolumeSpec,
	};

	fn credential(user: &str) -> CloudCredential {
		CloudCredential {
			user_id: user.to_string(),
			cloud_name: "default".to_string(),
			token: user.to_string(),
		}
	}

	fn order(kind: OrderKind) -> Order {
		Order::new(
			SystemUser::new("u1", "User", "idp"),
			"provider-a",
			"provider-a",
			"default",
			kind,
		)
	}

	fn compute(vcpu: u32) -> OrderKind {
		OrderKind::Compute(ComputeSpec {
			name: Some("vm".into()),
			vcpu,
			memory_mb: 1024,
			disk_gb: 20,
			image_id: "img-ubuntu-22.04".into(),
			public_key: None,
			network_order_ids: vec![],
		})
	}

	fn network() -> OrderKind {
		OrderKind::Network(NetworkSpec {
			name: None,
			cidr: "10.1.0.0/24".into(),
			gateway: Some("10.1.0.1".into()),
			allocation_mode: Default::default(),
		})
	}

	fn ssh_rule() -> SecurityRule {
		SecurityRule {
			direction: Direction::In,
			port_from: 22,
			port_to: 22,
			cidr: "0.0.0.0/0".into(),
			ether_type: EtherType::IPv4,
			protocol: Protocol::Tcp,
		}
	}

	#[tokio::test]
	async fn test_instance_ready_after_configured_polls() {
		let cloud = EmulatedCloud::new("default", 2);
		let mut order = order(compute(2));
		let cred = credential("u1");
		order.instance_id = Some(cloud.request_instance(&order, &cred).await.unwrap());

		let first = cloud.get_instance(&order, &cred).await.unwrap();
		assert_eq!(first.state, InstanceState::Creating);
		let second = cloud.get_instance(&order, &cred).await.unwrap();
		assert_eq!(second.state, InstanceState::Ready);
		assert_eq!(second.attributes.get("vcpu"), Some(&"2".to_string()));
	}

	#[tokio::test]
	async fn test_quota_is_enforced_and_reported() {
		let quota = ResourceAmounts {
			instances: 1,
			vcpu: 4,
			..default_quota()
		};
		let cloud = EmulatedCloud::with_catalogue("default", 0, quota, vec!["ubuntu-22.04".into()]);
		let cred = credential("u1");

		cloud.request_instance(&order(compute(2)), &cred).await.unwrap();
		let err = cloud
			.request_instance(&order(compute(1)), &cred)
			.await
			.unwrap_err();
		assert!(matches!(err, CloudError::ProviderRejected(_)));

		let used = cloud
			.get_user_quota(ResourceType::Compute, &cred)
			.await
			.unwrap();
		assert_eq!(used.used.vcpu, 2);
		assert_eq!(used.available.instances, 0);

		// Another user has a separate allowance.
		assert!(cloud
			.request_instance(&order(compute(1)), &credential("u2"))
			.await
			.is_ok());
	}

	#[tokio::test]
	async fn test_unknown_image_rejected() {
		let cloud = EmulatedCloud::new("default", 0);
		let kind = OrderKind::Compute(ComputeSpec {
			name: None,
			vcpu: 1,
			memory_mb: 512,
			disk_gb: 10,
			image_id: "img-missing".into(),
			public_key: None,
			network_order_ids: vec![],
		});
		let err = cloud
			.request_instance(&order(kind), &credential("u1"))
			.await
			.unwrap_err();
		assert!(matches!(err, CloudError::ProviderRejected(_)));
	}

	#[tokio::test]
	async fn test_delete_twice_reports_not_found() {
		let cloud = EmulatedCloud::new("default", 0);
		let cred = credential("u1");
		let mut order = order(OrderKind::Volume(VolumeSpec {
			name: None,
			size_gb: 5,
		}));
		order.instance_id = Some(cloud.request_instance(&order, &cred).await.unwrap());

		cloud.delete_instance(&order, &cred).await.unwrap();
		assert_eq!(cloud.resource_count().await, 0);
		assert!(matches!(
			cloud.delete_instance(&order, &cred).await,
			Err(CloudError::NotFound(_))
		));
	}

	#[tokio::test]
	async fn test_compute_actions_and_snapshot() {
		let cloud = EmulatedCloud::new("default", 0);
		let cred = credential("u1");
		let mut order = order(compute(1));
		order.instance_id = Some(cloud.request_instance(&order, &cred).await.unwrap());

		cloud
			.perform_action(&order, ComputeAction::Stop, &cred)
			.await
			.unwrap();
		let instance = cloud.get_instance(&order, &cred).await.unwrap();
		assert_eq!(
			instance.attributes.get("power_state"),
			Some(&"stopped".to_string())
		);

		let image_id = cloud.take_snapshot(&order, "backup", &cred).await.unwrap();
		let image = cloud.get_image(&image_id, &cred).await.unwrap();
		assert_eq!(image.name, "backup");
		assert_eq!(cloud.get_all_images(&cred).await.unwrap().len(), 3);
	}

	#[tokio::test]
	async fn test_actions_require_ready_instance() {
		let cloud = EmulatedCloud::new("default", 5);
		let cred = credential("u1");
		let mut order = order(compute(1));
		order.instance_id = Some(cloud.request_instance(&order, &cred).await.unwrap());

		let err = cloud
			.perform_action(&order, ComputeAction::Pause, &cred)
			.await
			.unwrap_err();
		assert!(matches!(err, CloudError::NotAcceptable(_)));
	}

	#[tokio::test]
	async fn test_security_rules_lifecycle() {
		let cloud = EmulatedCloud::new("default", 0);
		let cred = credential("u1");
		let mut order = order(network());
		order.instance_id = Some(cloud.request_instance(&order, &cred).await.unwrap());

		let rule_id = cloud
			.request_security_rule(&order, &ssh_rule(), &cred)
			.await
			.unwrap();
		assert!(matches!(
			cloud.request_security_rule(&order, &ssh_rule(), &cred).await,
			Err(CloudError::Conflict(_))
		));
		assert_eq!(cloud.get_security_rules(&order, &cred).await.unwrap().len(), 1);

		cloud
			.delete_security_rule(&order, &rule_id, &cred)
			.await
			.unwrap();
		assert!(cloud.get_security_rules(&order, &cred).await.unwrap().is_empty());
	}

	#[tokio::test]
	async fn test_security_rules_rejected_for_volumes() {
		let cloud = EmulatedCloud::new("default", 0);
		let mut order = order(OrderKind::Volume(VolumeSpec {
			name: None,
			size_gb: 1,
		}));
		order.instance_id = Some("volume-1".into());
		assert!(matches!(
			cloud
				.request_security_rule(&order, &ssh_rule(), &credential("u1"))
				.await,
			Err(CloudError::InvalidParameter(_))
		));
	}

	#[test]
	fn test_config_schema() {
		let valid: toml::Value = toml::from_str(
			r#"
ready_after_polls = 3
images = ["alpine"]
[quota]
instances = 2
"#,
		)
		.unwrap();
		assert!(create_cloud("default", &valid).is_ok());

		let invalid: toml::Value = toml::from_str("ready_after_polls = -1\n").unwrap();
		assert!(matches!(
			create_cloud("default", &invalid),
			Err(CloudError::Configuration(_))
		));
	}
}
