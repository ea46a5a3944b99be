//! Authorization plugins consulted by the facades.

use crate::BrokerError;
use broker_config::AuthorizationConfig;
use broker_types::SystemUser;
use std::collections::HashSet;
use std::fmt;

/// Operations subject to authorization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
	CreateOrder,
	GetOrder,
	DeleteOrder,
	ListOrders,
	GetUserQuota,
	GetUserAllocation,
	GetImages,
	GetCloudNames,
	ComputeAction,
	TakeSnapshot,
	CreateSecurityRule,
	GetSecurityRules,
	DeleteSecurityRule,
	Reload,
}

impl fmt::Display for Operation {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let s = match self {
			Operation::CreateOrder => "create_order",
			Operation::GetOrder => "get_order",
			Operation::DeleteOrder => "delete_order",
			Operation::ListOrders => "list_orders",
			Operation::GetUserQuota => "get_user_quota",
			Operation::GetUserAllocation => "get_user_allocation",
			Operation::GetImages => "get_images",
			Operation::GetCloudNames => "get_cloud_names",
			Operation::ComputeAction => "compute_action",
			Operation::TakeSnapshot => "take_snapshot",
			Operation::CreateSecurityRule => "create_security_rule",
			Operation::GetSecurityRules => "get_security_rules",
			Operation::DeleteSecurityRule => "delete_security_rule",
			Operation::Reload => "reload",
		};
		f.write_str(s)
	}
}

/// Decides whether a user may perform an operation.
pub trait AuthorizationPlugin: Send + Sync {
	fn authorize(&self, user: &SystemUser, operation: Operation) -> Result<(), BrokerError>;
}

/// Permits everything.
pub struct AllowAllAuthorizationPlugin;

impl AuthorizationPlugin for AllowAllAuthorizationPlugin {
	fn authorize(&self, _user: &SystemUser, _operation: Operation) -> Result<(), BrokerError> {
		Ok(())
	}
}

/// Permits order operations to everyone and reload to admins only.
pub struct RoleAwareAuthorizationPlugin {
	admins: HashSet<String>,
}

impl RoleAwareAuthorizationPlugin {
	pub fn new(admins: impl IntoIterator<Item = String>) -> Self {
		Self {
			admins: admins.into_iter().collect(),
		}
	}
}

impl AuthorizationPlugin for RoleAwareAuthorizationPlugin {
	fn authorize(&self, user: &SystemUser, operation: Operation) -> Result<(), BrokerError> {
		if operation == Operation::Reload && !self.admins.contains(&user.id) {
			return Err(BrokerError::Authorization(format!(
				"user {} may not perform {}",
				user.id, operation
			)));
		}
		Ok(())
	}
}

/// Builds the plugin named in `[authorization]`.
pub fn create_authorization(
	config: &AuthorizationConfig,
) -> Result<Box<dyn AuthorizationPlugin>, BrokerError> {
	match config.implementation.as_str() {
		"allow_all" => Ok(Box::new(AllowAllAuthorizationPlugin)),
		"role_aware" => Ok(Box::new(RoleAwareAuthorizationPlugin::new(
			config.admins.iter().cloned(),
		))),
		other => Err(BrokerError::InvalidParameter(format!(
			"unknown authorization implementation: {}",
			other
		))),
	}
}
