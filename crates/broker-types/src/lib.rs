//! Common types module for the federated resource broker.
//!
//! This module defines the data model shared by every broker component: orders
//! and their lifecycle states, provider-agnostic instance views, the federation
//! wire vocabulary, and the configuration validation framework used by
//! pluggable implementations.

/// Request and response bodies for the HTTP API.
pub mod api;
/// Federation protocol messages and the fixed error-condition vocabulary.
pub mod federation;
/// Provider-agnostic views of cloud resources (instances, quotas, images, rules).
pub mod instance;
/// Orders, resource kinds and lifecycle states.
pub mod order;
/// Registry trait for self-registering implementations.
pub mod registry;
/// Storage namespaces for persisted data.
pub mod storage;
/// Utility functions for formatting and time.
pub mod utils;
/// Configuration validation types for ensuring type-safe configurations.
pub mod validation;

pub use api::*;
pub use federation::*;
pub use instance::*;
pub use order::*;
pub use registry::ImplementationRegistry;
pub use storage::*;
pub use utils::{current_timestamp, truncate_id};
pub use validation::*;
