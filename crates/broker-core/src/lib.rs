//! Core order lifecycle engine of the federated resource broker.
//!
//! Orders are held in one [`queue::StateQueue`] per lifecycle state, owned by
//! the [`registry::OrderRegistry`]. The [`state::StateTransitioner`] is the only
//! way to move an order between queues. Five processors advance orders by
//! calling out to cloud connectors, and two facades (local API and federation)
//! admit requests through a gate that coordinates with configuration reload.
//! [`builder::BrokerBuilder`] wires everything into a [`engine::BrokerEngine`].

use broker_cloud::CloudError;
use broker_types::{ErrorCondition, FederationError};
use thiserror::Error;

pub mod authorization;
pub mod builder;
pub mod controller;
pub mod engine;
pub mod facade;
pub mod processors;
pub mod queue;
pub mod recovery;
pub mod registry;
pub mod state;

#[cfg(test)]
pub(crate) mod testing;

pub use authorization::{AuthorizationPlugin, Operation};
pub use builder::{BrokerBuilder, BrokerFactories, BuilderError};
pub use controller::OrderController;
pub use engine::{BrokerEngine, EngineError};
pub use facade::{AdmissionGate, ApplicationFacade, FacadeCore, ReloadUpdate, RemoteFacade};
pub use processors::{OrderProcessor, ProcessorsController};
pub use queue::StateQueue;
pub use recovery::{RecoveryError, RecoveryReport, RecoveryService};
pub use registry::{LockedOrder, OrderRegistry, SharedOrder};
pub use state::{StateTransitioner, TransitionError};

/// A federation request whose declared origin does not match the order.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConsistencyError {
	#[error("order is owned by {actual}, not by {expected}")]
	ProviderMismatch { expected: String, actual: String },
	#[error("declared requester {declared} does not match order requester {actual}")]
	RequesterMismatch { declared: String, actual: String },
}

/// Errors returned by the facades and the order controller.
#[derive(Debug, Error)]
pub enum BrokerError {
	#[error("Unauthenticated: {0}")]
	Unauthenticated(String),
	#[error("Not authorized: {0}")]
	Authorization(String),
	#[error("Consistency error: {0}")]
	Consistency(#[from] ConsistencyError),
	#[error("Not found: {0}")]
	NotFound(String),
	#[error("Invalid parameter: {0}")]
	InvalidParameter(String),
	#[error("Conflict: {0}")]
	Conflict(String),
	#[error("Not acceptable: {0}")]
	NotAcceptable(String),
	#[error("Not implemented: {0}")]
	NotImplemented(String),
	#[error("Provider error: {0}")]
	Provider(String),
	#[error("Provider unavailable: {0}")]
	ProviderUnavailable(String),
	#[error("Storage error: {0}")]
	Storage(String),
	#[error("Internal error: {0}")]
	Internal(String),
}

impl BrokerError {
	/// Wire condition used for federation replies and HTTP status codes.
	pub fn condition(&self) -> ErrorCondition {
		match self {
			BrokerError::Unauthenticated(_) => ErrorCondition::Unauthenticated,
			BrokerError::Authorization(_) => ErrorCondition::Forbidden,
			BrokerError::Consistency(ConsistencyError::RequesterMismatch { .. }) => {
				ErrorCondition::BadRequest
			},
			BrokerError::Consistency(ConsistencyError::ProviderMismatch { .. }) => {
				ErrorCondition::NotFound
			},
			BrokerError::NotFound(_) => ErrorCondition::NotFound,
			BrokerError::InvalidParameter(_) => ErrorCondition::BadRequest,
			BrokerError::Conflict(_) => ErrorCondition::Conflict,
			BrokerError::NotAcceptable(_) => ErrorCondition::NotAcceptable,
			BrokerError::NotImplemented(_) => ErrorCondition::NotImplemented,
			BrokerError::ProviderUnavailable(_) => ErrorCondition::ProviderUnavailable,
			BrokerError::Provider(_) | BrokerError::Storage(_) | BrokerError::Internal(_) => {
				ErrorCondition::InternalError
			},
		}
	}
}

impl From<CloudError> for BrokerError {
	fn from(err: CloudError) -> Self {
		match err {
			CloudError::Unauthorized(m) => BrokerError::Authorization(m),
			CloudError::Unauthenticated(m) => BrokerError::Unauthenticated(m),
			CloudError::NoCredential(user) => {
				BrokerError::Unauthenticated(format!("no cloud credential for user {}", user))
			},
			CloudError::NotFound(m) => BrokerError::NotFound(m),
			CloudError::InvalidParameter(m) => BrokerError::InvalidParameter(m),
			CloudError::ProviderRejected(m) => BrokerError::Provider(m),
			CloudError::NotAcceptable(m) => BrokerError::NotAcceptable(m),
			CloudError::Conflict(m) | CloudError::Configuration(m) => BrokerError::Conflict(m),
			CloudError::NotImplemented(m) => BrokerError::NotImplemented(m),
			CloudError::Unavailable(m) => BrokerError::ProviderUnavailable(m),
			CloudError::Internal(m) => BrokerError::Internal(m),
		}
	}
}

impl From<TransitionError> for BrokerError {
	fn from(err: TransitionError) -> Self {
		match err {
			TransitionError::InvalidTransition { .. } => BrokerError::NotAcceptable(err.to_string()),
			TransitionError::Duplicate(id) => {
				BrokerError::Conflict(format!("order {} already exists", id))
			},
			TransitionError::Storage(m) => BrokerError::Storage(m),
		}
	}
}

impl From<BrokerError> for FederationError {
	fn from(err: BrokerError) -> Self {
		FederationError::new(err.condition(), err.to_string())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_consistency_errors_map_by_kind() {
		let requester: BrokerError = ConsistencyError::RequesterMismatch {
			declared: "provider-x".into(),
			actual: "provider-b".into(),
		}
		.into();
		assert_eq!(requester.condition(), ErrorCondition::BadRequest);

		let provider: BrokerError = ConsistencyError::ProviderMismatch {
			expected: "provider-a".into(),
			actual: "provider-c".into(),
		}
		.into();
		assert_eq!(provider.condition(), ErrorCondition::NotFound);
	}

	#[test]
	fn test_cloud_errors_keep_their_condition() {
		let cases = [
			CloudError::Unauthorized("x".into()),
			CloudError::Unauthenticated("x".into()),
			CloudError::NotFound("x".into()),
			CloudError::InvalidParameter("x".into()),
			CloudError::NotAcceptable("x".into()),
			CloudError::Conflict("x".into()),
			CloudError::NotImplemented("x".into()),
			CloudError::Unavailable("x".into()),
			CloudError::Internal("x".into()),
			CloudError::ProviderRejected("x".into()),
		];
		for cloud in cases {
			let expected = cloud.condition();
			assert_eq!(BrokerError::from(cloud).condition(), expected);
		}
	}

	#[test]
	fn test_federation_error_from_broker_error() {
		let err: FederationError = BrokerError::NotAcceptable("already closed".into()).into();
		assert_eq!(err.condition, ErrorCondition::NotAcceptable);
		assert!(err.message.contains("already closed"));
	}
}
