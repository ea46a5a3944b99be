//! HTTP transport for federation requests.
//!
//! Envelopes are posted as JSON to `<peer url>/federation`; the peer answers
//! with a [`FederationReply`]. Anything that keeps a reply from arriving is
//! reported as `provider-unavailable`.

use async_trait::async_trait;
use broker_cloud::FederationClient;
use broker_config::FederationConfig;
use broker_types::{
	ErrorCondition, FederationEnvelope, FederationError, FederationReply, FederationResponse,
};
use std::collections::HashMap;
use std::time::Duration;

pub struct HttpFederationClient {
	client: reqwest::Client,
	peers: HashMap<String, String>,
}

impl HttpFederationClient {
	pub fn new(config: &FederationConfig) -> Result<Self, reqwest::Error> {
		let client = reqwest::Client::builder()
			.pool_idle_timeout(Duration::from_secs(90))
			.pool_max_idle_per_host(10)
			.timeout(Duration::from_secs(config.timeout_seconds))
			.build()?;
		Ok(Self {
			client,
			peers: config.peers.clone(),
		})
	}

	fn endpoint(&self, provider_id: &str) -> Option<String> {
		self.peers
			.get(provider_id)
			.map(|base| format!("{}/federation", base.trim_end_matches('/')))
	}
}

fn unavailable(message: String) -> FederationError {
	FederationError::new(ErrorCondition::ProviderUnavailable, message)
}

#[async_trait]
impl FederationClient for HttpFederationClient {
	async fn send(
		&self,
		destination_provider: &str,
		envelope: FederationEnvelope,
	) -> Result<FederationResponse, FederationError> {
		let url = self.endpoint(destination_provider).ok_or_else(|| {
			unavailable(format!("no route to provider {}", destination_provider))
		})?;
		let operation = envelope.request.operation();
		tracing::debug!(destination = %destination_provider, operation, "Sending federation request");

		let response = self
			.client
			.post(&url)
			.json(&envelope)
			.send()
			.await
			.map_err(|e| {
				tracing::warn!(destination = %destination_provider, operation, error = %e, "Federation request failed");
				unavailable(format!("provider {}: {}", destination_provider, e))
			})?;

		let status = response.status();
		if !status.is_success() {
			return Err(unavailable(format!(
				"provider {} answered {}",
				destination_provider, status
			)));
		}

		match response.json::<FederationReply>().await {
			Ok(FederationReply::Success(result)) => Ok(result),
			Ok(FederationReply::Failure(error)) => Err(error),
			Err(e) => Err(unavailable(format!(
				"invalid reply from provider {}: {}",
				destination_provider, e
			))),
		}
	}
}
