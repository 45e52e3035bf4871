//! [`ObjectStore`] backed by the Kubernetes API server

use async_trait::async_trait;
use kube::api::{ApiResource, DynamicObject, Patch, PatchParams, PostParams};
use kube::{Api, Client, ResourceExt};
use tracing::debug;

use super::{ObjectStore, StoreObject, object_key};
use crate::controller::error::{Error, Result};
use crate::resources::FIELD_MANAGER;

/// Object store talking to the API server through a dynamic API
///
/// Typed objects are converted to and from [`DynamicObject`] so one code path
/// serves both namespaced and cluster-scoped kinds.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    fn api<K: StoreObject>(&self, namespace: Option<&str>) -> Api<DynamicObject> {
        let resource = ApiResource::erase::<K>(&());
        match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &resource),
            None => Api::all_with(self.client.clone(), &resource),
        }
    }

    fn post_params() -> PostParams {
        PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        }
    }
}

/// Map API errors onto the store's not-found / conflict outcomes
fn map_kube_error(err: kube::Error, key: &str) -> Error {
    match &err {
        kube::Error::Api(api_err) if api_err.code == 404 => Error::NotFound(key.to_string()),
        kube::Error::Api(api_err) if api_err.code == 409 => {
            Error::ConflictError(format!("{}: {}", key, api_err.message))
        }
        _ => Error::KubeError(err),
    }
}

fn to_dynamic<K: StoreObject>(obj: &K) -> Result<DynamicObject> {
    Ok(serde_json::from_value(serde_json::to_value(obj)?)?)
}

fn from_dynamic<K: StoreObject>(obj: DynamicObject) -> Result<K> {
    Ok(serde_json::from_value(serde_json::to_value(obj)?)?)
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn get<K: StoreObject>(&self, namespace: Option<&str>, name: &str) -> Result<K> {
        let key = object_key::<K>(namespace, name);
        let obj = self
            .api::<K>(namespace)
            .get(name)
            .await
            .map_err(|e| map_kube_error(e, &key))?;
        from_dynamic(obj)
    }

    async fn create<K: StoreObject>(&self, obj: &K) -> Result<K> {
        let namespace = obj.namespace();
        let name = obj.name_any();
        let key = object_key::<K>(namespace.as_deref(), &name);

        let created = self
            .api::<K>(namespace.as_deref())
            .create(&Self::post_params(), &to_dynamic(obj)?)
            .await
            .map_err(|e| map_kube_error(e, &key))?;
        debug!(object = %key, "Created object");
        from_dynamic(created)
    }

    async fn update<K: StoreObject>(&self, obj: &K) -> Result<K> {
        let namespace = obj.namespace();
        let name = obj.name_any();
        let key = object_key::<K>(namespace.as_deref(), &name);

        let updated = self
            .api::<K>(namespace.as_deref())
            .replace(&name, &Self::post_params(), &to_dynamic(obj)?)
            .await
            .map_err(|e| map_kube_error(e, &key))?;
        debug!(object = %key, "Updated object");
        from_dynamic(updated)
    }

    async fn update_status<K: StoreObject>(&self, obj: &K) -> Result<K> {
        let namespace = obj.namespace();
        let name = obj.name_any();
        let key = object_key::<K>(namespace.as_deref(), &name);
        let resource_version = obj
            .resource_version()
            .ok_or(Error::MissingObjectKey(".metadata.resourceVersion"))?;

        let mut value = serde_json::to_value(obj)?;
        let status = value
            .get_mut("status")
            .map(serde_json::Value::take)
            .unwrap_or(serde_json::Value::Null);

        // Carrying resourceVersion makes the API server reject stale writes with 409
        let patch = serde_json::json!({
            "metadata": { "resourceVersion": resource_version },
            "status": status,
        });

        let updated = self
            .api::<K>(namespace.as_deref())
            .patch_status(
                &name,
                &PatchParams {
                    field_manager: Some(FIELD_MANAGER.to_string()),
                    ..Default::default()
                },
                &Patch::Merge(&patch),
            )
            .await
            .map_err(|e| map_kube_error(e, &key))?;
        debug!(object = %key, "Updated status");
        from_dynamic(updated)
    }
}
