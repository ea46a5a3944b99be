//! Storage namespaces used by the broker.

use std::str::FromStr;

/// Namespaces for persisted collections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageKey {
	/// Order records, keyed by order id.
	Orders,
	/// Audit trail of committed transitions, keyed by `<order id>-<sequence>`.
	StateChanges,
}

impl StorageKey {
	pub fn as_str(&self) -> &'static str {
		match self {
			StorageKey::Orders => "orders",
			StorageKey::StateChanges => "state_changes",
		}
	}

	pub fn all() -> impl Iterator<Item = Self> {
		[Self::Orders, Self::StateChanges].into_iter()
	}
}

impl FromStr for StorageKey {
	type Err = ();

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"orders" => Ok(Self::Orders),
			"state_changes" => Ok(Self::StateChanges),
			_ => Err(()),
		}
	}
}

impl From<StorageKey> for &'static str {
	fn from(key: StorageKey) -> Self {
		key.as_str()
	}
}
