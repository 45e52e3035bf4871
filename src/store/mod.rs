//! Backing object store used by the controllers
//!
//! The controllers only need four operations from the cluster: get, create,
//! update and status update, each with optimistic-concurrency semantics.
//! [`ObjectStore`] captures that contract so reconcile logic can run against
//! the real API server ([`KubeStore`]) or an in-memory store in tests.

mod kube_store;

pub use kube_store::KubeStore;

use std::fmt::Debug;

use async_trait::async_trait;
use kube::Resource;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::controller::error::Result;

/// Any typed Kubernetes object the controllers read or write
pub trait StoreObject:
    Resource<DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

impl<T> StoreObject for T where
    T: Resource<DynamicType = ()>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

/// Object store with optimistic concurrency
///
/// Every method returns `Error::NotFound` when the object does not exist and
/// `Error::ConflictError` when a write is based on a stale resource version.
/// `namespace` is `None` for cluster-scoped kinds.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch the latest version of an object
    async fn get<K: StoreObject>(&self, namespace: Option<&str>, name: &str) -> Result<K>;

    /// Create an object; its namespace is taken from its metadata
    async fn create<K: StoreObject>(&self, obj: &K) -> Result<K>;

    /// Replace an object (spec and metadata); rejected on a stale resource version
    async fn update<K: StoreObject>(&self, obj: &K) -> Result<K>;

    /// Replace the status sub-resource; rejected on a stale resource version
    async fn update_status<K: StoreObject>(&self, obj: &K) -> Result<K>;
}

/// Short `kind/namespace/name` identity used in logs and error messages
pub fn object_key<K: StoreObject>(namespace: Option<&str>, name: &str) -> String {
    let kind = K::kind(&());
    match namespace {
        Some(ns) => format!("{}/{}/{}", kind, ns, name),
        None => format!("{}/{}", kind, name),
    }
}
