//! Storage module for the broker.
//!
//! Durable storage is a write-through sink for order records: the lifecycle
//! engine keeps its working set in memory and persists every committed
//! transition here, so that the queues can be rebuilt after a restart.
//! Backends only implement a small key/value interface; [`StorageService`]
//! layers typed JSON access and namespaces on top of it.

use async_trait::async_trait;
use broker_types::{ConfigSchema, ImplementationRegistry};
use serde::{de::DeserializeOwned, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Re-export implementations
pub mod implementations {
	pub mod file;
	pub mod memory;
}

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
	#[error("Not found")]
	NotFound,
	#[error("Already exists")]
	AlreadyExists,
	#[error("Serialization error: {0}")]
	Serialization(String),
	#[error("Backend error: {0}")]
	Backend(String),
	#[error("Configuration error: {0}")]
	Configuration(String),
}

/// Low-level key/value interface implemented by storage backends.
///
/// Keys have the form `<namespace>:<id>`.
#[async_trait]
pub trait StorageInterface: Send + Sync {
	async fn get_bytes(&self, key: &str) -> Result<Vec<u8>, StorageError>;

	/// Stores raw bytes, with an optional time-to-live.
	async fn set_bytes(
		&self,
		key: &str,
		value: Vec<u8>,
		ttl: Option<Duration>,
	) -> Result<(), StorageError>;

	/// Deleting a missing key is not an error.
	async fn delete(&self, key: &str) -> Result<(), StorageError>;

	async fn exists(&self, key: &str) -> Result<bool, StorageError>;

	/// Returns the ids stored under `namespace`, in no particular order.
	async fn list_ids(&self, namespace: &str) -> Result<Vec<String>, StorageError>;

	fn config_schema(&self) -> Box<dyn ConfigSchema>;

	/// Removes expired entries and returns how many were removed.
	async fn cleanup_expired(&self) -> Result<usize, StorageError> {
		Ok(0)
	}
}

/// Factory signature every storage implementation provides.
pub type StorageFactory = fn(&toml::Value) -> Result<Box<dyn StorageInterface>, StorageError>;

/// Registry trait for storage implementations.
pub trait StorageRegistry: ImplementationRegistry<Factory = StorageFactory> {}

/// Returns `(name, factory)` for every built-in storage implementation.
pub fn get_all_implementations() -> Vec<(&'static str, StorageFactory)> {
	use implementations::{file, memory};

	vec![
		(file::Registry::NAME, file::Registry::factory()),
		(memory::Registry::NAME, memory::Registry::factory()),
	]
}

/// Typed storage on top of a backend.
///
/// Values are serialized to JSON and stored under `<namespace>:<id>`.
pub struct StorageService {
	backend: Box<dyn StorageInterface>,
}

impl StorageService {
	pub fn new(backend: Box<dyn StorageInterface>) -> Self {
		Self { backend }
	}

	fn key(namespace: &str, id: &str) -> String {
		format!("{}:{}", namespace, id)
	}

	fn encode<T: Serialize>(data: &T) -> Result<Vec<u8>, StorageError> {
		serde_json::to_vec(data).map_err(|e| StorageError::Serialization(e.to_string()))
	}

	/// Creates or overwrites a value.
	pub async fn store<T: Serialize>(
		&self,
		namespace: &str,
		id: &str,
		data: &T,
	) -> Result<(), StorageError> {
		self.backend
			.set_bytes(&Self::key(namespace, id), Self::encode(data)?, None)
			.await
	}

	/// Creates a value that must not exist yet.
	///
	/// Used for the first write of an order, so that a duplicated id is
	/// rejected instead of silently replacing another order.
	pub async fn save<T: Serialize>(
		&self,
		namespace: &str,
		id: &str,
		data: &T,
	) -> Result<(), StorageError> {
		let key = Self::key(namespace, id);
		if self.backend.exists(&key).await? {
			return Err(StorageError::AlreadyExists);
		}
		self.backend.set_bytes(&key, Self::encode(data)?, None).await
	}

	/// Replaces an existing value; fails with `NotFound` if it is absent.
	pub async fn update<T: Serialize>(
		&self,
		namespace: &str,
		id: &str,
		data: &T,
	) -> Result<(), StorageError> {
		let key = Self::key(namespace, id);
		if !self.backend.exists(&key).await? {
			return Err(StorageError::NotFound);
		}
		self.backend.set_bytes(&key, Self::encode(data)?, None).await
	}

	pub async fn retrieve<T: DeserializeOwned>(
		&self,
		namespace: &str,
		id: &str,
	) -> Result<T, StorageError> {
		let bytes = self.backend.get_bytes(&Self::key(namespace, id)).await?;
		serde_json::from_slice(&bytes).map_err(|e| StorageError::Serialization(e.to_string()))
	}

	/// Loads every value of a namespace.
	///
	/// Entries that vanish between listing and reading are skipped; entries
	/// that fail to deserialize are skipped with a warning.
	pub async fn retrieve_all<T: DeserializeOwned>(
		&self,
		namespace: &str,
	) -> Result<Vec<(String, T)>, StorageError> {
		let mut values = Vec::new();
		for id in self.backend.list_ids(namespace).await? {
			match self.retrieve::<T>(namespace, &id).await {
				Ok(value) => values.push((id, value)),
				Err(StorageError::NotFound) => {},
				Err(e) => {
					tracing::warn!(namespace, id = %id, error = %e, "Skipping unreadable entry");
				},
			}
		}
		Ok(values)
	}

	pub async fn remove(&self, namespace: &str, id: &str) -> Result<(), StorageError> {
		self.backend.delete(&Self::key(namespace, id)).await
	}

	pub async fn exists(&self, namespace: &str, id: &str) -> Result<bool, StorageError> {
		self.backend.exists(&Self::key(namespace, id)).await
	}

	/// Removes expired entries; a no-op for backends without TTL support.
	pub async fn cleanup_expired(&self) -> Result<usize, StorageError> {
		self.backend.cleanup_expired().await
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use implementations::memory::MemoryStorage;
	use serde::Deserialize;

	#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
	struct Record {
		state: String,
	}

	fn service() -> StorageService {
		StorageService::new(Box::new(MemoryStorage::new()))
	}

	#[tokio::test]
	async fn test_save_rejects_duplicates() {
		let storage = service();
		let record = Record {
			state: "OPEN".into(),
		};
		storage.save("orders", "o1", &record).await.unwrap();
		assert!(matches!(
			storage.save("orders", "o1", &record).await,
			Err(StorageError::AlreadyExists)
		));
	}

	#[tokio::test]
	async fn test_update_requires_existing_value() {
		let storage = service();
		let record = Record {
			state: "SPAWNING".into(),
		};
		assert!(matches!(
			storage.update("orders", "missing", &record).await,
			Err(StorageError::NotFound)
		));

		storage.store("orders", "o1", &record).await.unwrap();
		let updated = Record {
			state: "FULFILLED".into(),
		};
		storage.update("orders", "o1", &updated).await.unwrap();
		let loaded: Record = storage.retrieve("orders", "o1").await.unwrap();
		assert_eq!(loaded, updated);
	}

	#[tokio::test]
	async fn test_retrieve_all_is_namespace_scoped() {
		let storage = service();
		let record = Record {
			state: "OPEN".into(),
		};
		storage.store("orders", "o1", &record).await.unwrap();
		storage.store("orders", "o2", &record).await.unwrap();
		storage.store("state_changes", "o1-1", &record).await.unwrap();

		let mut ids: Vec<String> = storage
			.retrieve_all::<Record>("orders")
			.await
			.unwrap()
			.into_iter()
			.map(|(id, _)| id)
			.collect();
		ids.sort();
		assert_eq!(ids, vec!["o1".to_string(), "o2".to_string()]);
	}
}
