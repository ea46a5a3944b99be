//! Cloud access for the broker.
//!
//! Every operation on an order's resource goes through a [`CloudConnector`].
//! Orders owned by the local provider are served by a [`LocalCloudConnector`],
//! which dispatches on the order kind to a [`CloudPlugin`] of the configured
//! cloud; orders owned by a peer are served by a [`RemoteCloudConnector`],
//! which forwards the operation through a [`FederationClient`].
//! [`CloudConnectorFactory`] picks between the two from the provider id alone.

use async_trait::async_trait;
use broker_types::{
	ComputeAction, ErrorCondition, FederationError, Image, ImageSummary, Instance, Order, Quota,
	ResourceType, SecurityRule, SecurityRuleInstance, SystemUser,
};
use thiserror::Error;

pub mod credentials;
pub mod factory;
pub mod federation;
pub mod local;
pub mod plugin;
pub mod remote;

/// Re-export implementations
pub mod implementations {
	pub mod emulated;
}

pub use credentials::{CloudCredential, ConfiguredCredentialMapper, CredentialMapper};
pub use factory::{get_all_implementations, CloudConnectorFactory, CloudFactory, CloudRegistry};
pub use federation::{DisconnectedFederationClient, FederationClient};
pub use local::LocalCloudConnector;
pub use plugin::{CloudPlugin, ImagePlugin, PluginSet, QuotaPlugin};
pub use remote::RemoteCloudConnector;

/// Errors returned by connectors and plugins.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CloudError {
	#[error("Unauthorized: {0}")]
	Unauthorized(String),
	#[error("Unauthenticated: {0}")]
	Unauthenticated(String),
	#[error("No credential for user {0}")]
	NoCredential(String),
	#[error("Not found: {0}")]
	NotFound(String),
	#[error("Invalid parameter: {0}")]
	InvalidParameter(String),
	#[error("Provider rejected request: {0}")]
	ProviderRejected(String),
	#[error("Not acceptable: {0}")]
	NotAcceptable(String),
	#[error("Conflict: {0}")]
	Conflict(String),
	#[error("Not implemented: {0}")]
	NotImplemented(String),
	#[error("Provider unavailable: {0}")]
	Unavailable(String),
	#[error("Configuration error: {0}")]
	Configuration(String),
	#[error("Internal error: {0}")]
	Internal(String),
}

impl CloudError {
	/// Wire condition reported to peers for this error.
	pub fn condition(&self) -> ErrorCondition {
		match self {
			CloudError::Unauthorized(_) => ErrorCondition::Forbidden,
			CloudError::Unauthenticated(_) | CloudError::NoCredential(_) => {
				ErrorCondition::Unauthenticated
			},
			CloudError::NotFound(_) => ErrorCondition::NotFound,
			CloudError::InvalidParameter(_) => ErrorCondition::BadRequest,
			CloudError::NotAcceptable(_) => ErrorCondition::NotAcceptable,
			CloudError::Conflict(_) | CloudError::Configuration(_) => ErrorCondition::Conflict,
			CloudError::NotImplemented(_) => ErrorCondition::NotImplemented,
			CloudError::Unavailable(_) => ErrorCondition::ProviderUnavailable,
			CloudError::ProviderRejected(_) | CloudError::Internal(_) => {
				ErrorCondition::InternalError
			},
		}
	}
}

/// Translates a peer's error condition into the local taxonomy.
impl From<FederationError> for CloudError {
	fn from(err: FederationError) -> Self {
		let message = err.message;
		match err.condition {
			ErrorCondition::Forbidden => CloudError::Unauthorized(message),
			ErrorCondition::Unauthenticated => CloudError::Unauthenticated(message),
			ErrorCondition::BadRequest => CloudError::InvalidParameter(message),
			ErrorCondition::NotFound => CloudError::NotFound(message),
			ErrorCondition::Conflict => CloudError::Conflict(message),
			ErrorCondition::NotAcceptable => CloudError::NotAcceptable(message),
			ErrorCondition::NotImplemented => CloudError::NotImplemented(message),
			ErrorCondition::ProviderUnavailable => CloudError::Unavailable(message),
			ErrorCondition::InternalError => CloudError::Internal(message),
		}
	}
}

impl From<CloudError> for FederationError {
	fn from(err: CloudError) -> Self {
		FederationError::new(err.condition(), err.to_string())
	}
}

/// Uniform operations on the resource behind an order.
///
/// Implemented once for the local clouds and once for peer providers; callers
/// never need to know which one they hold.
#[async_trait]
pub trait CloudConnector: Send + Sync {
	/// Asks the owning cloud to provision the order.
	///
	/// Returns the instance id for local orders and `None` for remote ones,
	/// whose instance id stays with the owning provider.
	async fn request_instance(&self, order: &Order) -> Result<Option<String>, CloudError>;

	async fn delete_instance(&self, order: &Order) -> Result<(), CloudError>;

	async fn get_instance(&self, order: &Order) -> Result<Instance, CloudError>;

	async fn get_user_quota(
		&self,
		user: &SystemUser,
		resource_type: ResourceType,
	) -> Result<Quota, CloudError>;

	async fn get_all_images(&self, user: &SystemUser) -> Result<Vec<ImageSummary>, CloudError>;

	async fn get_image(&self, image_id: &str, user: &SystemUser) -> Result<Image, CloudError>;

	async fn perform_compute_action(
		&self,
		order: &Order,
		action: ComputeAction,
	) -> Result<(), CloudError>;

	/// Creates an image from a compute instance and returns the image id.
	async fn take_snapshot(&self, order: &Order, name: &str) -> Result<String, CloudError>;

	async fn request_security_rule(
		&self,
		order: &Order,
		rule: &SecurityRule,
	) -> Result<String, CloudError>;

	async fn get_security_rules(
		&self,
		order: &Order,
	) -> Result<Vec<SecurityRuleInstance>, CloudError>;

	async fn delete_security_rule(&self, order: &Order, rule_id: &str) -> Result<(), CloudError>;
}
