//! Federation protocol messages exchanged between peer providers.
//!
//! The messages are transport-agnostic: any transport that can carry a
//! [`FederationEnvelope`] to a peer and bring back a [`FederationReply`] works.
//! Failures travel as one of the nine [`ErrorCondition`] values, which are the
//! compatibility surface other providers depend on.

use crate::{
	Image, ImageSummary, Instance, Order, Quota, ResourceType, SecurityRule, SecurityRuleInstance,
	SystemUser,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Fixed error vocabulary of the federation protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCondition {
	/// Caller is authenticated but not entitled to the operation.
	Forbidden,
	/// Caller identity could not be established.
	Unauthenticated,
	/// Malformed or inconsistent request.
	BadRequest,
	/// Order, instance or image is unknown.
	NotFound,
	/// Request conflicts with the provider configuration or current state.
	Conflict,
	/// Operation is not acceptable for the order in its current state.
	NotAcceptable,
	/// Operation is not supported by the provider or its cloud.
	NotImplemented,
	/// Provider could not be reached or did not answer.
	ProviderUnavailable,
	/// Anything else.
	InternalError,
}

impl ErrorCondition {
	pub fn as_str(&self) -> &'static str {
		match self {
			ErrorCondition::Forbidden => "forbidden",
			ErrorCondition::Unauthenticated => "unauthenticated",
			ErrorCondition::BadRequest => "bad-request",
			ErrorCondition::NotFound => "not-found",
			ErrorCondition::Conflict => "conflict",
			ErrorCondition::NotAcceptable => "not-acceptable",
			ErrorCondition::NotImplemented => "not-implemented",
			ErrorCondition::ProviderUnavailable => "provider-unavailable",
			ErrorCondition::InternalError => "internal-error",
		}
	}

	/// HTTP status used when the condition is rendered by the REST surface.
	pub fn status_code(&self) -> u16 {
		match self {
			ErrorCondition::Forbidden => 403,
			ErrorCondition::Unauthenticated => 401,
			ErrorCondition::BadRequest => 400,
			ErrorCondition::NotFound => 404,
			ErrorCondition::Conflict => 409,
			ErrorCondition::NotAcceptable => 406,
			ErrorCondition::NotImplemented => 501,
			ErrorCondition::ProviderUnavailable => 503,
			ErrorCondition::InternalError => 500,
		}
	}
}

impl fmt::Display for ErrorCondition {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for ErrorCondition {
	type Err = ();

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"forbidden" => Ok(Self::Forbidden),
			"unauthenticated" => Ok(Self::Unauthenticated),
			"bad-request" => Ok(Self::BadRequest),
			"not-found" => Ok(Self::NotFound),
			"conflict" => Ok(Self::Conflict),
			"not-acceptable" => Ok(Self::NotAcceptable),
			"not-implemented" => Ok(Self::NotImplemented),
			"provider-unavailable" => Ok(Self::ProviderUnavailable),
			"internal-error" => Ok(Self::InternalError),
			_ => Err(()),
		}
	}
}

/// Error reported by, or while talking to, a peer provider.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{condition}: {message}")]
pub struct FederationError {
	pub condition: ErrorCondition,
	pub message: String,
}

impl FederationError {
	pub fn new(condition: ErrorCondition, message: impl Into<String>) -> Self {
		Self {
			condition,
			message: message.into(),
		}
	}
}

/// Signal sent by the owning provider to the requester of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RemoteEvent {
	InstanceFulfilled,
	InstanceFailed,
}

/// Operations a provider can ask of a peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum FederationRequest {
	CreateOrder {
		order: Order,
	},
	GetOrderInstance {
		order_id: String,
		user: SystemUser,
		resource_type: ResourceType,
	},
	DeleteOrder {
		order_id: String,
		user: SystemUser,
		resource_type: ResourceType,
	},
	GetUserQuota {
		cloud_name: String,
		user: SystemUser,
		resource_type: ResourceType,
	},
	GetImage {
		cloud_name: String,
		image_id: String,
		user: SystemUser,
	},
	GetAllImages {
		cloud_name: String,
		user: SystemUser,
	},
	GetCloudNames {
		user: SystemUser,
	},
	CreateSecurityRule {
		order_id: String,
		user: SystemUser,
		rule: SecurityRule,
	},
	GetSecurityRules {
		order_id: String,
		user: SystemUser,
	},
	DeleteSecurityRule {
		order_id: String,
		user: SystemUser,
		rule_id: String,
	},
	NotifyEvent {
		order: Order,
		event: RemoteEvent,
	},
}

impl FederationRequest {
	/// Operation name, for logging.
	pub fn operation(&self) -> &'static str {
		match self {
			FederationRequest::CreateOrder { .. } => "create_order",
			FederationRequest::GetOrderInstance { .. } => "get_order_instance",
			FederationRequest::DeleteOrder { .. } => "delete_order",
			FederationRequest::GetUserQuota { .. } => "get_user_quota",
			FederationRequest::GetImage { .. } => "get_image",
			FederationRequest::GetAllImages { .. } => "get_all_images",
			FederationRequest::GetCloudNames { .. } => "get_cloud_names",
			FederationRequest::CreateSecurityRule { .. } => "create_security_rule",
			FederationRequest::GetSecurityRules { .. } => "get_security_rules",
			FederationRequest::DeleteSecurityRule { .. } => "delete_security_rule",
			FederationRequest::NotifyEvent { .. } => "notify_event",
		}
	}
}

/// Successful result payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum FederationResponse {
	Empty,
	Instance(Instance),
	Quota(Quota),
	Images(Vec<ImageSummary>),
	Image(Image),
	CloudNames(Vec<String>),
	SecurityRuleId(String),
	SecurityRules(Vec<SecurityRuleInstance>),
}

/// A request together with the provider that declares itself as its sender.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FederationEnvelope {
	pub requesting_provider: String,
	pub request: FederationRequest,
}

/// What a peer sends back for an envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FederationReply {
	Success(FederationResponse),
	Failure(FederationError),
}

impl From<Result<FederationResponse, FederationError>> for FederationReply {
	fn from(result: Result<FederationResponse, FederationError>) -> Self {
		match result {
			Ok(response) => FederationReply::Success(response),
			Err(error) => FederationReply::Failure(error),
		}
	}
}

impl FederationReply {
	pub fn into_result(self) -> Result<FederationResponse, FederationError> {
		match self {
			FederationReply::Success(response) => Ok(response),
			FederationReply::Failure(error) => Err(error),
		}
	}
}
