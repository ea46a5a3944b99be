//! State management for orders.
//!
//! This module provides the transition table and the transitioner that moves
//! orders between state queues while keeping storage authoritative.

pub mod order;

pub use order::{is_valid_transition, StateTransitioner, TransitionError};
