//! Request and response bodies of the HTTP API.

use crate::{ComputeAction, Instance, OrderKind, OrderState, ResourceType};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Body of an order creation request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateOrderRequest {
	/// Target provider; the local provider when omitted.
	pub provider: Option<String>,
	/// Target cloud; the provider's default cloud when omitted.
	pub cloud_name: Option<String>,
	#[serde(flatten)]
	pub kind: OrderKind,
	#[serde(default)]
	pub requirements: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateOrderResponse {
	pub id: String,
}

/// Order as returned to API clients: its lifecycle state plus the instance view.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderView {
	pub id: String,
	pub state: OrderState,
	pub provider: String,
	pub cloud_name: String,
	pub fault_message: Option<String>,
	pub instance: Instance,
}

/// One entry of a user's order listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceStatus {
	pub order_id: String,
	pub resource_type: ResourceType,
	pub provider: String,
	pub cloud_name: String,
	pub state: OrderState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComputeActionRequest {
	pub action: ComputeAction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotRequest {
	pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotResponse {
	pub image_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityRuleCreated {
	pub id: String,
}

/// JSON error body returned by the API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
	/// Wire condition, e.g. `not-found`.
	pub error: String,
	pub message: String,
}
