//! Resolve an involved object's labels, annotations and owners from the API server.

use std::sync::Mutex;

use k8s_openapi::api::core::v1::ObjectReference;
use kexp_core::ObjectMetadata;
use kube::{
    api::Api,
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{self, Scope},
    Client,
};
use rustc_hash::FxHashMap;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum LookupError {
    #[error("object not found")]
    NotFound,
    #[error("object reference missing {0}")]
    MissingField(&'static str),
    #[error("kube: {0}")]
    Kube(#[from] kube::Error),
    #[error("{0}")]
    Other(String),
}

impl LookupError {
    pub fn is_not_found(&self) -> bool { matches!(self, LookupError::NotFound) }
}

#[async_trait::async_trait]
pub trait MetadataLookup: Send + Sync {
    async fn resolve(&self, reference: &ObjectReference) -> Result<ObjectMetadata, LookupError>;
}

/// Lookup through discovery and a dynamic GET. Discovery results are kept per GVK.
pub struct KubeMetadataLookup {
    client: Client,
    resources: Mutex<FxHashMap<String, (ApiResource, bool)>>,
}

impl KubeMetadataLookup {
    pub fn new(client: Client) -> Self {
        Self { client, resources: Mutex::new(FxHashMap::default()) }
    }

    async fn api_resource(&self, gvk: &GroupVersionKind) -> Result<(ApiResource, bool), LookupError> {
        let key = gvk_key(gvk);
        let known = self.resources.lock().unwrap_or_else(|e| e.into_inner()).get(&key).cloned();
        if let Some(found) = known {
            return Ok(found);
        }
        let (ar, caps) = discovery::pinned_kind(&self.client, gvk).await.map_err(from_kube)?;
        let namespaced = matches!(caps.scope, Scope::Namespaced);
        debug!(gvk = %key, namespaced, "discovered api resource");
        self.resources.lock().unwrap_or_else(|e| e.into_inner()).insert(key, (ar.clone(), namespaced));
        Ok((ar, namespaced))
    }
}

#[async_trait::async_trait]
impl MetadataLookup for KubeMetadataLookup {
    async fn resolve(&self, reference: &ObjectReference) -> Result<ObjectMetadata, LookupError> {
        let api_version = reference.api_version.as_deref().filter(|s| !s.is_empty()).ok_or(LookupError::MissingField("apiVersion"))?;
        let kind = reference.kind.as_deref().filter(|s| !s.is_empty()).ok_or(LookupError::MissingField("kind"))?;
        let name = reference.name.as_deref().filter(|s| !s.is_empty()).ok_or(LookupError::MissingField("name"))?;
        let gvk = parse_api_version(api_version, kind);
        let (ar, namespaced) = self.api_resource(&gvk).await?;
        let api: Api<DynamicObject> = if namespaced {
            match reference.namespace.as_deref().filter(|s| !s.is_empty()) {
                Some(ns) => Api::namespaced_with(self.client.clone(), ns, &ar),
                None => return Err(LookupError::MissingField("namespace")),
            }
        } else {
            Api::all_with(self.client.clone(), &ar)
        };
        let obj = api.get(name).await.map_err(from_kube)?;
        let meta = obj.metadata;
        Ok(ObjectMetadata {
            labels: meta.labels.unwrap_or_default(),
            annotations: meta.annotations.unwrap_or_default(),
            owner_references: meta.owner_references.unwrap_or_default(),
            deleted: meta.deletion_timestamp.is_some(),
        })
    }
}

fn from_kube(e: kube::Error) -> LookupError {
    match e {
        kube::Error::Api(ref resp) if resp.code == 404 => LookupError::NotFound,
        other => LookupError::Kube(other),
    }
}

/// `apps/v1` + `Deployment` → apps/v1/Deployment; `v1` + `Pod` → core group.
pub(crate) fn parse_api_version(api_version: &str, kind: &str) -> GroupVersionKind {
    match api_version.split_once('/') {
        Some((group, version)) => GroupVersionKind { group: group.to_string(), version: version.to_string(), kind: kind.to_string() },
        None => GroupVersionKind { group: String::new(), version: api_version.to_string(), kind: kind.to_string() },
    }
}

fn gvk_key(gvk: &GroupVersionKind) -> String {
    if gvk.group.is_empty() {
        format!("{}/{}", gvk.version, gvk.kind)
    } else {
        format!("{}/{}/{}", gvk.group, gvk.version, gvk.kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_api_version_core() {
        let gvk = parse_api_version("v1", "Pod");
        assert_eq!(gvk.group, "");
        assert_eq!(gvk.version, "v1");
        assert_eq!(gvk.kind, "Pod");
        assert_eq!(gvk_key(&gvk), "v1/Pod");
    }

    #[test]
    fn parse_api_version_group() {
        let gvk = parse_api_version("apps/v1", "Deployment");
        assert_eq!(gvk.group, "apps");
        assert_eq!(gvk.version, "v1");
        assert_eq!(gvk_key(&gvk), "apps/v1/Deployment");
    }

    #[test]
    fn api_404_maps_to_not_found() {
        let resp = kube::core::ErrorResponse { status: "Failure".into(), message: "pods \"x\" not found".into(), reason: "NotFound".into(), code: 404 };
        assert!(from_kube(kube::Error::Api(resp)).is_not_found());
        let resp = kube::core::ErrorResponse { status: "Failure".into(), message: "forbidden".into(), reason: "Forbidden".into(), code: 403 };
        assert!(!from_kube(kube::Error::Api(resp)).is_not_found());
    }
}
