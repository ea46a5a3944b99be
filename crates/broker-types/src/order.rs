//! Order types for the broker.
//!
//! An order is a request for a federated resource together with its tracked
//! lifecycle state. The resource-specific attributes live in [`OrderKind`], a
//! tagged union with one variant per resource type.

use crate::{current_timestamp, InstanceState};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Lifecycle state of an order.
///
/// `Open` is the initial state and `Deactivated` the only terminal one. Every
/// other state has a queue of its own in the order registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderState {
	/// Accepted and waiting for the provisioning request.
	Open,
	/// Owned by a remote provider; waiting for its signals.
	Pending,
	/// Provisioning accepted by the local cloud; instance not yet ready.
	Spawning,
	/// Instance is ready.
	Fulfilled,
	/// The provisioning request failed, or a ready instance was lost.
	Failed,
	/// The cloud accepted the request but the instance later failed.
	FailedAfterSuccessfulRequest,
	/// Deletion requested; waiting for the cloud-side delete.
	Closed,
	/// Cloud-side deletion confirmed. Terminal.
	Deactivated,
}

impl OrderState {
	/// States that own a queue in the registry, in processing order.
	pub const QUEUED: [OrderState; 7] = [
		OrderState::Open,
		OrderState::Pending,
		OrderState::Spawning,
		OrderState::Fulfilled,
		OrderState::Failed,
		OrderState::FailedAfterSuccessfulRequest,
		OrderState::Closed,
	];

	/// Returns the wire name of the state.
	pub fn as_str(&self) -> &'static str {
		match self {
			OrderState::Open => "OPEN",
			OrderState::Pending => "PENDING",
			OrderState::Spawning => "SPAWNING",
			OrderState::Fulfilled => "FULFILLED",
			OrderState::Failed => "FAILED",
			OrderState::FailedAfterSuccessfulRequest => "FAILED_AFTER_SUCCESSFUL_REQUEST",
			OrderState::Closed => "CLOSED",
			OrderState::Deactivated => "DEACTIVATED",
		}
	}

	pub fn is_terminal(&self) -> bool {
		matches!(self, OrderState::Deactivated)
	}
}

impl fmt::Display for OrderState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Resource type discriminator, used for plugin dispatch and request routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
	Compute,
	Network,
	Volume,
	Attachment,
	PublicIp,
}

impl ResourceType {
	pub fn as_str(&self) -> &'static str {
		match self {
			ResourceType::Compute => "compute",
			ResourceType::Network => "network",
			ResourceType::Volume => "volume",
			ResourceType::Attachment => "attachment",
			ResourceType::PublicIp => "public_ip",
		}
	}

	pub fn all() -> impl Iterator<Item = Self> {
		[
			Self::Compute,
			Self::Network,
			Self::Volume,
			Self::Attachment,
			Self::PublicIp,
		]
		.into_iter()
	}
}

impl fmt::Display for ResourceType {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for ResourceType {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"compute" | "computes" => Ok(Self::Compute),
			"network" | "networks" => Ok(Self::Network),
			"volume" | "volumes" => Ok(Self::Volume),
			"attachment" | "attachments" => Ok(Self::Attachment),
			"public_ip" | "public_ips" | "publicIps" => Ok(Self::PublicIp),
			other => Err(format!("unknown resource type: {}", other)),
		}
	}
}

/// Compute (virtual machine) attributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComputeSpec {
	pub name: Option<String>,
	pub vcpu: u32,
	/// Memory in MB.
	pub memory_mb: u32,
	/// Root disk in GB.
	pub disk_gb: u32,
	pub image_id: String,
	pub public_key: Option<String>,
	/// Network orders the instance is plugged into.
	#[serde(default)]
	pub network_order_ids: Vec<String>,
}

/// Address allocation mode of a network.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationMode {
	#[default]
	Dynamic,
	Static,
}

/// Private network attributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkSpec {
	pub name: Option<String>,
	pub cidr: String,
	pub gateway: Option<String>,
	#[serde(default)]
	pub allocation_mode: AllocationMode,
}

/// Block volume attributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeSpec {
	pub name: Option<String>,
	pub size_gb: u32,
}

/// Volume-to-compute attachment. Both sides are referenced by order id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttachmentSpec {
	pub compute_order_id: String,
	pub volume_order_id: String,
	pub device: Option<String>,
}

/// Public IP bound to a compute order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublicIpSpec {
	pub compute_order_id: String,
}

/// Kind-specific attributes of an order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrderKind {
	Compute(ComputeSpec),
	Network(NetworkSpec),
	Volume(VolumeSpec),
	Attachment(AttachmentSpec),
	PublicIp(PublicIpSpec),
}

impl OrderKind {
	pub fn resource_type(&self) -> ResourceType {
		match self {
			OrderKind::Compute(_) => ResourceType::Compute,
			OrderKind::Network(_) => ResourceType::Network,
			OrderKind::Volume(_) => ResourceType::Volume,
			OrderKind::Attachment(_) => ResourceType::Attachment,
			OrderKind::PublicIp(_) => ResourceType::PublicIp,
		}
	}

	/// Ids of other orders this order refers to.
	pub fn referenced_orders(&self) -> Vec<&str> {
		match self {
			OrderKind::Compute(spec) => spec.network_order_ids.iter().map(String::as_str).collect(),
			OrderKind::Attachment(spec) => {
				vec![spec.compute_order_id.as_str(), spec.volume_order_id.as_str()]
			},
			OrderKind::PublicIp(spec) => vec![spec.compute_order_id.as_str()],
			OrderKind::Network(_) | OrderKind::Volume(_) => Vec::new(),
		}
	}
}

/// End user on whose behalf the broker acts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SystemUser {
	pub id: String,
	pub name: String,
	/// Identity provider that authenticated the user.
	pub identity_provider_id: String,
}

impl SystemUser {
	pub fn new(
		id: impl Into<String>,
		name: impl Into<String>,
		identity_provider_id: impl Into<String>,
	) -> Self {
		Self {
			id: id.into(),
			name: name.into(),
			identity_provider_id: identity_provider_id.into(),
		}
	}

	/// Two users are the same principal when id and identity provider match.
	pub fn same_principal(&self, other: &SystemUser) -> bool {
		self.id == other.id && self.identity_provider_id == other.identity_provider_id
	}
}

/// A request for a federated resource and its lifecycle state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
	/// Globally unique, immutable identifier.
	pub id: String,
	pub state: OrderState,
	/// Provider that owns and fulfills the order.
	pub provider: String,
	/// Provider that originated the request.
	pub requester: String,
	/// Cloud of the owning provider that hosts the resource.
	pub cloud_name: String,
	/// Handle assigned by the owning cloud once provisioned.
	pub instance_id: Option<String>,
	/// Last instance state observed while polling.
	pub cached_instance_state: Option<InstanceState>,
	pub user: SystemUser,
	pub kind: OrderKind,
	/// Free-form hints forwarded to cloud plugins.
	#[serde(default)]
	pub requirements: HashMap<String, String>,
	/// Reason of the last provisioning failure.
	pub fault_message: Option<String>,
	pub created_at: u64,
	pub updated_at: u64,
}

impl Order {
	/// Creates an order in `Open` state with a fresh UUID v4 id.
	pub fn new(
		user: SystemUser,
		requester: impl Into<String>,
		provider: impl Into<String>,
		cloud_name: impl Into<String>,
		kind: OrderKind,
	) -> Self {
		let now = current_timestamp();
		Self {
			id: uuid::Uuid::new_v4().to_string(),
			state: OrderState::Open,
			provider: provider.into(),
			requester: requester.into(),
			cloud_name: cloud_name.into(),
			instance_id: None,
			cached_instance_state: None,
			user,
			kind,
			requirements: HashMap::new(),
			fault_message: None,
			created_at: now,
			updated_at: now,
		}
	}

	pub fn resource_type(&self) -> ResourceType {
		self.kind.resource_type()
	}

	/// True when the order is owned by `local_provider_id`.
	pub fn is_provider_local(&self, local_provider_id: &str) -> bool {
		self.provider == local_provider_id
	}

	/// True when the order was requested by another provider.
	pub fn is_requester_remote(&self, local_provider_id: &str) -> bool {
		self.requester != local_provider_id
	}
}

/// Audit record of one committed state transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateChange {
	pub order_id: String,
	pub from: OrderState,
	pub to: OrderState,
	pub timestamp: u64,
}
