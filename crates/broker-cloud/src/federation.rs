//! Outbound federation transport.

use async_trait::async_trait;
use broker_types::{ErrorCondition, FederationEnvelope, FederationError, FederationResponse};

/// Sends federation requests to peer providers.
///
/// Transport failures are reported as `provider-unavailable`; errors raised by
/// the peer come back with the peer's own condition.
#[async_trait]
pub trait FederationClient: Send + Sync {
	async fn send(
		&self,
		destination_provider: &str,
		envelope: FederationEnvelope,
	) -> Result<FederationResponse, FederationError>;
}

/// Client for a provider with no configured peers.
pub struct DisconnectedFederationClient;

#[async_trait]
impl FederationClient for DisconnectedFederationClient {
	async fn send(
		&self,
		destination_provider: &str,
		envelope: FederationEnvelope,
	) -> Result<FederationResponse, FederationError> {
		tracing::debug!(
			destination = %destination_provider,
			operation = envelope.request.operation(),
			"No federation route"
		);
		Err(FederationError::new(
			ErrorCondition::ProviderUnavailable,
			format!("no route to provider {}", destination_provider),
		))
	}
}
