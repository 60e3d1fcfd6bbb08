//! Loom store adapter: the object store seam every engine crate talks to, service-account
//! scoped handles, and `MemStore`, an in-memory implementation with snapshot reads.

#![forbid(unsafe_code)]

use std::sync::Arc;

use loom_core::events::OwnerEvent;
use loom_core::obj::Labels;
use loom_core::{Delta, ObjectKey, TypeKey};
use serde_json::Value;
use tokio::sync::broadcast;

mod mem;

pub use mem::{MemStore, World};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(ObjectKey),
    #[error("{0} already exists")]
    AlreadyExists(ObjectKey),
    /// Optimistic concurrency failure (HTTP 409).
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    /// Rejected by admission or schema validation.
    #[error("invalid: {0}")]
    Invalid(String),
    #[error("transport: {0}")]
    Transport(String),
}

impl StoreError {
    /// Conflicts and transport failures are retried with backoff; everything else is surfaced.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Conflict(_) | StoreError::Transport(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

/// JSON documents keyed by `(apiVersion, kind, namespace, name)`.
#[async_trait::async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, key: &ObjectKey) -> Result<Option<Value>, StoreError>;

    /// Objects of `ty` in `namespace` (all namespaces when `None`) carrying every label in `labels`.
    async fn list(&self, ty: &TypeKey, namespace: Option<&str>, labels: &Labels) -> Result<Vec<Value>, StoreError>;

    /// Create `doc`; a `generateName` without a `name` gets a random suffix.
    async fn create(&self, doc: Value) -> Result<Value, StoreError>;

    /// Replace spec and metadata. A `resourceVersion` on `doc` must match the stored one.
    async fn update(&self, doc: Value) -> Result<Value, StoreError>;

    /// Server-side apply: create `doc` or merge its fields into the stored object.
    async fn patch(&self, doc: Value) -> Result<Value, StoreError>;

    async fn delete(&self, key: &ObjectKey) -> Result<(), StoreError>;

    /// Replace `status` only. A `resourceVersion` on `doc` must match the stored one.
    async fn update_status(&self, doc: Value) -> Result<Value, StoreError>;

    /// Make sure changes to `ty` are delivered to subscribers.
    async fn watch(&self, ty: &TypeKey) -> Result<(), StoreError>;

    fn subscribe(&self) -> broadcast::Receiver<Delta>;
}

/// Hands out store handles acting as a service account.
#[async_trait::async_trait]
pub trait StoreProvider: Send + Sync {
    async fn for_service_account(&self, namespace: &str, name: &str) -> Result<Arc<dyn ObjectStore>, StoreError>;
}

/// Records events against owner objects.
#[async_trait::async_trait]
pub trait EventRecorder: Send + Sync {
    async fn record(&self, owner: &Value, event: &OwnerEvent) -> Result<(), StoreError>;
}

pub fn service_account_key(namespace: &str, name: &str) -> ObjectKey {
    ObjectKey::new("v1", "ServiceAccount", Some(namespace), name)
}
