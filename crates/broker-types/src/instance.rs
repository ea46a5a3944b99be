//! Provider-agnostic views of cloud resources.
//!
//! Cloud plugins translate their native representations into these types, so
//! the lifecycle engine never sees provider-specific formats.

use crate::ResourceType;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// State of a provisioned instance as reported by its cloud.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceState {
	Ready,
	Creating,
	Unavailable,
	Failed,
	Inconsistent,
}

impl fmt::Display for InstanceState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let s = match self {
			InstanceState::Ready => "READY",
			InstanceState::Creating => "CREATING",
			InstanceState::Unavailable => "UNAVAILABLE",
			InstanceState::Failed => "FAILED",
			InstanceState::Inconsistent => "INCONSISTENT",
		};
		f.write_str(s)
	}
}

/// Provisioned resource as seen through a cloud connector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
	pub id: String,
	pub state: InstanceState,
	pub resource_type: ResourceType,
	/// Kind-specific details, e.g. `ip`, `vcpu`, `size_gb`.
	#[serde(default)]
	pub attributes: BTreeMap<String, String>,
}

impl Instance {
	pub fn new(id: impl Into<String>, state: InstanceState, resource_type: ResourceType) -> Self {
		Self {
			id: id.into(),
			state,
			resource_type,
			attributes: BTreeMap::new(),
		}
	}

	pub fn with_attribute(mut self, key: impl Into<String>, value: impl ToString) -> Self {
		self.attributes.insert(key.into(), value.to_string());
		self
	}
}

/// Amounts of each resource type; used for quota totals, usage and allocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceAmounts {
	pub instances: u32,
	pub vcpu: u32,
	pub ram_mb: u32,
	pub disk_gb: u32,
	pub networks: u32,
	pub public_ips: u32,
	pub volumes: u32,
}

impl ResourceAmounts {
	/// Component-wise subtraction clamped at zero.
	pub fn saturating_sub(&self, other: &ResourceAmounts) -> ResourceAmounts {
		ResourceAmounts {
			instances: self.instances.saturating_sub(other.instances),
			vcpu: self.vcpu.saturating_sub(other.vcpu),
			ram_mb: self.ram_mb.saturating_sub(other.ram_mb),
			disk_gb: self.disk_gb.saturating_sub(other.disk_gb),
			networks: self.networks.saturating_sub(other.networks),
			public_ips: self.public_ips.saturating_sub(other.public_ips),
			volumes: self.volumes.saturating_sub(other.volumes),
		}
	}

	/// Component-wise addition, saturating at `u32::MAX`.
	pub fn saturating_add(&self, other: &ResourceAmounts) -> ResourceAmounts {
		ResourceAmounts {
			instances: self.instances.saturating_add(other.instances),
			vcpu: self.vcpu.saturating_add(other.vcpu),
			ram_mb: self.ram_mb.saturating_add(other.ram_mb),
			disk_gb: self.disk_gb.saturating_add(other.disk_gb),
			networks: self.networks.saturating_add(other.networks),
			public_ips: self.public_ips.saturating_add(other.public_ips),
			volumes: self.volumes.saturating_add(other.volumes),
		}
	}
}

/// User quota in one cloud.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quota {
	pub total: ResourceAmounts,
	pub used: ResourceAmounts,
	pub available: ResourceAmounts,
}

impl Quota {
	/// Builds a quota, deriving `available` from `total` and `used`.
	pub fn new(total: ResourceAmounts, used: ResourceAmounts) -> Self {
		Self {
			total,
			used,
			available: total.saturating_sub(&used),
		}
	}
}

/// Entry of an image listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSummary {
	pub id: String,
	pub name: String,
}

/// Image details.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
	pub id: String,
	pub name: String,
	pub size_bytes: u64,
	pub min_disk_gb: u32,
	pub min_ram_mb: u32,
	pub status: String,
}

/// Lifecycle actions on a ready compute instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComputeAction {
	Pause,
	Hibernate,
	Stop,
	Resume,
}

impl fmt::Display for ComputeAction {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let s = match self {
			ComputeAction::Pause => "pause",
			ComputeAction::Hibernate => "hibernate",
			ComputeAction::Stop => "stop",
			ComputeAction::Resume => "resume",
		};
		f.write_str(s)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
	In,
	Out,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EtherType {
	IPv4,
	IPv6,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
	Tcp,
	Udp,
	Icmp,
	Any,
}

/// Firewall rule attached to a network or public IP order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityRule {
	pub direction: Direction,
	pub port_from: u16,
	pub port_to: u16,
	pub cidr: String,
	pub ether_type: EtherType,
	pub protocol: Protocol,
}

impl SecurityRule {
	/// Checks the port range and that the CIDR has a prefix length.
	pub fn validate(&self) -> Result<(), String> {
		if self.port_from > self.port_to {
			return Err(format!(
				"port range {}-{} is inverted",
				self.port_from, self.port_to
			));
		}
		let (address, prefix) = self
			.cidr
			.split_once('/')
			.ok_or_else(|| format!("invalid CIDR: {}", self.cidr))?;
		let max_prefix = match self.ether_type {
			EtherType::IPv4 => 32,
			EtherType::IPv6 => 128,
		};
		match prefix.parse::<u8>() {
			Ok(p) if p <= max_prefix && !address.is_empty() => Ok(()),
			_ => Err(format!("invalid CIDR: {}", self.cidr)),
		}
	}
}

/// A security rule as created in the cloud.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityRuleInstance {
	pub id: String,
	#[serde(flatten)]
	pub rule: SecurityRule,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_quota_available_is_clamped() {
		let total = ResourceAmounts {
			instances: 10,
			vcpu: 20,
			ram_mb: 4096,
			..Default::default()
		};
		let used = ResourceAmounts {
			instances: 12,
			vcpu: 4,
			ram_mb: 1024,
			..Default::default()
		};
		let quota = Quota::new(total, used);
		assert_eq!(quota.available.instances, 0);
		assert_eq!(quota.available.vcpu, 16);
		assert_eq!(quota.available.ram_mb, 3072);
	}

	#[test]
	fn test_security_rule_validation() {
		let mut rule = SecurityRule {
			direction: Direction::In,
			port_from: 22,
			port_to: 22,
			cidr: "10.0.0.0/24".into(),
			ether_type: EtherType::IPv4,
			protocol: Protocol::Tcp,
		};
		assert!(rule.validate().is_ok());

		rule.cidr = "10.0.0.0/33".into();
		assert!(rule.validate().is_err());

		rule.cidr = "10.0.0.0/8".into();
		rule.port_from = 80;
		rule.port_to = 22;
		assert!(rule.validate().is_err());
	}
}
