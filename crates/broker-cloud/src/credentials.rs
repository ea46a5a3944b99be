//! Mapping of federation users to cloud credentials.

use crate::CloudError;
use async_trait::async_trait;
use broker_types::SystemUser;
use std::collections::HashMap;

/// Credential a plugin presents to its cloud on behalf of a user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudCredential {
	pub user_id: String,
	pub cloud_name: String,
	pub token: String,
}

/// Resolves the cloud credential to use for a federation user.
#[async_trait]
pub trait CredentialMapper: Send + Sync {
	async fn map(&self, user: &SystemUser) -> Result<CloudCredential, CloudError>;
}

/// Mapper driven by the cloud's configuration table.
///
/// ```toml
/// [clouds.default.config]
/// default_credential = "shared-token"
/// [clouds.default.config.credentials]
/// alice = "alice-token"
/// ```
///
/// Without a `credentials` table the user id is forwarded as the token.
#[derive(Debug, Clone)]
pub struct ConfiguredCredentialMapper {
	cloud_name: String,
	tokens: Option<HashMap<String, String>>,
	default_token: Option<String>,
}

impl ConfiguredCredentialMapper {
	pub fn from_config(cloud_name: &str, config: &toml::Value) -> Result<Self, CloudError> {
		let tokens = match config.get("credentials") {
			None => None,
			Some(value) => {
				let table = value.as_table().ok_or_else(|| {
					CloudError::Configuration("credentials must be a table".into())
				})?;
				let mut tokens = HashMap::new();
				for (user, token) in table {
					let token = token.as_str().ok_or_else(|| {
						CloudError::Configuration(format!("credential of {} must be a string", user))
					})?;
					tokens.insert(user.clone(), token.to_string());
				}
				Some(tokens)
			},
		};

		let default_token = match config.get("default_credential") {
			None => None,
			Some(value) => Some(
				value
					.as_str()
					.ok_or_else(|| {
						CloudError::Configuration("default_credential must be a string".into())
					})?
					.to_string(),
			),
		};

		Ok(Self {
			cloud_name: cloud_name.to_string(),
			tokens,
			default_token,
		})
	}
}

#[async_trait]
impl CredentialMapper for ConfiguredCredentialMapper {
	async fn map(&self, user: &SystemUser) -> Result<CloudCredential, CloudError> {
		let token = match &self.tokens {
			None => user.id.clone(),
			Some(tokens) => tokens
				.get(&user.id)
				.or(self.default_token.as_ref())
				.cloned()
				.ok_or_else(|| CloudError::NoCredential(user.id.clone()))?,
		};
		Ok(CloudCredential {
			user_id: user.id.clone(),
			cloud_name: self.cloud_name.clone(),
			token,
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn user(id: &str) -> SystemUser {
		SystemUser::new(id, id, "idp")
	}

	#[tokio::test]
	async fn test_passthrough_without_credentials_table() {
		let mapper =
			ConfiguredCredentialMapper::from_config("default", &toml::Value::Table(Default::default()))
				.unwrap();
		let credential = mapper.map(&user("alice")).await.unwrap();
		assert_eq!(credential.token, "alice");
		assert_eq!(credential.cloud_name, "default");
	}

	#[tokio::test]
	async fn test_configured_tokens_and_default() {
		let config: toml::Value = toml::from_str(
			r#"
default_credential = "shared"
[credentials]
alice = "alice-token"
"#,
		)
		.unwrap();
		let mapper = ConfiguredCredentialMapper::from_config("default", &config).unwrap();
		assert_eq!(mapper.map(&user("alice")).await.unwrap().token, "alice-token");
		assert_eq!(mapper.map(&user("bob")).await.unwrap().token, "shared");
	}

	#[tokio::test]
	async fn test_unknown_user_without_default_has_no_credential() {
		let config: toml::Value = toml::from_str("[credentials]\nalice = \"t\"\n").unwrap();
		let mapper = ConfiguredCredentialMapper::from_config("default", &config).unwrap();
		assert!(matches!(
			mapper.map(&user("bob")).await,
			Err(CloudError::NoCredential(id)) if id == "bob"
		));
	}

	#[test]
	fn test_invalid_credentials_table_rejected() {
		let config: toml::Value = toml::from_str("credentials = \"nope\"\n").unwrap();
		assert!(matches!(
			ConfiguredCredentialMapper::from_config("default", &config),
			Err(CloudError::Configuration(_))
		));
	}
}
