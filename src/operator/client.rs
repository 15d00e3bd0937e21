use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{LocalObjectReference, Secret, ServiceAccount};
use k8s_openapi::api::rbac::v1::{
    ClusterRole, ClusterRoleBinding, Role, RoleBinding, RoleRef, Subject as RbacSubject,
};
use kube::api::{DeleteParams, DynamicObject, Patch, PatchParams, PostParams};
use kube::core::{ApiResource, GroupVersionKind, ObjectMeta};
use kube::discovery::{self, Scope};
use kube::{Api, Client};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::model::{
    GrantScope, PermissionGrant, ResourceKind, Subject, FIELD_MANAGER, MANAGED_BY_LABEL,
};
use crate::orchestrator::Error;

pub type SharedClient = Arc<dyn RemoteResourceClient>;

/// Sole point of contact with the cluster.
///
/// Each call maps to one remote request and reports its outcome once; callers
/// decide whether to retry.
#[async_trait]
pub trait RemoteResourceClient: Send + Sync {
    /// Server-side applies every document in `manifest`.
    async fn apply(&self, manifest: &str) -> Result<(), Error>;

    async fn delete(
        &self,
        kind: ResourceKind,
        name: &str,
        namespace: Option<&str>,
        ignore_missing: bool,
    ) -> Result<(), Error>;

    async fn get(
        &self,
        kind: ResourceKind,
        name: &str,
        namespace: Option<&str>,
    ) -> Result<Value, Error>;

    /// Declarative: granting a held role is a no-op.
    async fn grant_role(&self, grant: &PermissionGrant) -> Result<(), Error>;

    /// Declarative: revoking an unheld role is a no-op.
    async fn revoke_role(&self, grant: &PermissionGrant) -> Result<(), Error>;

    async fn copy_secret(
        &self,
        name: &str,
        from_namespace: &str,
        to_namespace: &str,
    ) -> Result<(), Error>;

    /// Adds `secret` to the image pull secrets of the subject's service account.
    async fn link_secret(&self, secret: &str, subject: &Subject) -> Result<(), Error>;

    /// Removes the pull secret reference. Absent account or link is a no-op.
    async fn unlink_secret(&self, secret: &str, subject: &Subject) -> Result<(), Error>;
}

/// kube-rs backed client. Connects on first use so actions that never touch
/// the cluster (build, push, render) work without a kubeconfig.
pub struct KubeClient {
    client: OnceCell<Client>,
}

impl KubeClient {
    pub fn new() -> KubeClient {
        KubeClient {
            client: OnceCell::new(),
        }
    }

    /// Uses an already connected client.
    #[cfg(test)]
    pub fn with_client(client: Client) -> KubeClient {
        KubeClient {
            client: OnceCell::new_with(Some(client)),
        }
    }

    async fn client(&self) -> Result<Client, Error> {
        let client = self
            .client
            .get_or_try_init(|| async {
                let client = Client::try_default().await?;
                debug!("Connected to cluster, default namespace {}", client.default_namespace());
                Ok::<Client, Error>(client)
            })
            .await?;
        Ok(client.clone())
    }

    async fn dynamic_api(
        &self,
        kind: ResourceKind,
        namespace: Option<&str>,
    ) -> Result<Api<DynamicObject>, Error> {
        let client = self.client().await?;
        let ar = api_resource(kind);
        let api = match (kind.is_namespaced(), namespace) {
            (true, Some(ns)) => Api::namespaced_with(client, ns, &ar),
            (true, None) => Api::default_namespaced_with(client, &ar),
            (false, _) => Api::all_with(client, &ar),
        };
        Ok(api)
    }

    async fn apply_document(&self, object: DynamicObject) -> Result<(), Error> {
        let types = object
            .types
            .clone()
            .ok_or_else(|| Error::Apply("Manifest document has no apiVersion/kind".into()))?;
        let name = object
            .metadata
            .name
            .clone()
            .ok_or_else(|| Error::Apply(format!("{} manifest has no metadata.name", types.kind)))?;

        let (group, version) = parse_api_version(&types.api_version);
        let gvk = GroupVersionKind::gvk(group, version, &types.kind);
        let client = self.client().await?;
        let (ar, caps) = discovery::pinned_kind(&client, &gvk)
            .await
            .map_err(|e| Error::Apply(format!("Unable to resolve kind {}: {}", types.kind, e)))?;

        let api: Api<DynamicObject> = match caps.scope {
            Scope::Namespaced => match object.metadata.namespace.as_deref() {
                Some(ns) => Api::namespaced_with(client, ns, &ar),
                None => Api::default_namespaced_with(client, &ar),
            },
            Scope::Cluster => Api::all_with(client, &ar),
        };

        api.patch(
            &name,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(&object),
        )
        .await
        .map_err(|e| {
            classify(
                e,
                ResourceKind::from_kind(&types.kind),
                &name,
                object.metadata.namespace.as_deref(),
            )
        })?;
        info!("Applied {} {}", types.kind, name);
        Ok(())
    }
}

impl Default for KubeClient {
    fn default() -> Self {
        KubeClient::new()
    }
}

#[async_trait]
impl RemoteResourceClient for KubeClient {
    async fn apply(&self, manifest: &str) -> Result<(), Error> {
        for object in parse_manifest(manifest)? {
            self.apply_document(object).await?;
        }
        Ok(())
    }

    async fn delete(
        &self,
        kind: ResourceKind,
        name: &str,
        namespace: Option<&str>,
        ignore_missing: bool,
    ) -> Result<(), Error> {
        let api = self.dynamic_api(kind, namespace).await?;
        match api.delete(name, &DeleteParams::background()).await {
            Ok(_) => {
                info!("Deleted {} {}", kind, name);
                Ok(())
            }
            Err(e) => match classify(e, Some(kind), name, namespace) {
                Error::NotFound { .. } if ignore_missing => {
                    debug!("{} {} already absent", kind, name);
                    Ok(())
                }
                err => Err(err),
            },
        }
    }

    async fn get(
        &self,
        kind: ResourceKind,
        name: &str,
        namespace: Option<&str>,
    ) -> Result<Value, Error> {
        let api = self.dynamic_api(kind, namespace).await?;
        let object = api
            .get(name)
            .await
            .map_err(|e| classify(e, Some(kind), name, namespace))?;
        Ok(serde_json::to_value(object)?)
    }

    async fn grant_role(&self, grant: &PermissionGrant) -> Result<(), Error> {
        let client = self.client().await?;
        let name = grant.binding_name();
        let pp = PatchParams::apply(FIELD_MANAGER).force();
        let subjects = Some(vec![RbacSubject {
            kind: "ServiceAccount".into(),
            name: grant.subject.service_account.clone(),
            namespace: Some(grant.subject.namespace.clone()),
            api_group: None,
        }]);
        let role_ref = RoleRef {
            api_group: "rbac.authorization.k8s.io".into(),
            kind: "ClusterRole".into(),
            name: grant.role.clone(),
        };

        let result = match grant.scope {
            GrantScope::Cluster => {
                let binding = ClusterRoleBinding {
                    metadata: managed_meta(&name, None),
                    role_ref,
                    subjects,
                };
                let api: Api<ClusterRoleBinding> = Api::all(client);
                api.patch(&name, &pp, &Patch::Apply(&binding)).await.map(|_| ())
            }
            GrantScope::Namespaced => {
                let binding = RoleBinding {
                    metadata: managed_meta(&name, Some(&grant.namespace)),
                    role_ref,
                    subjects,
                };
                let api: Api<RoleBinding> = Api::namespaced(client, &grant.namespace);
                api.patch(&name, &pp, &Patch::Apply(&binding)).await.map(|_| ())
            }
        };
        result.map_err(|e| {
            classify(
                e,
                Some(grant.binding_kind()),
                &name,
                Some(grant.namespace.as_str()),
            )
        })?;
        info!("Granted {}", grant);
        Ok(())
    }

    async fn revoke_role(&self, grant: &PermissionGrant) -> Result<(), Error> {
        let namespace = match grant.scope {
            GrantScope::Cluster => None,
            GrantScope::Namespaced => Some(grant.namespace.as_str()),
        };
        self.delete(grant.binding_kind(), &grant.binding_name(), namespace, true)
            .await?;
        info!("Revoked {}", grant);
        Ok(())
    }

    async fn copy_secret(
        &self,
        name: &str,
        from_namespace: &str,
        to_namespace: &str,
    ) -> Result<(), Error> {
        let client = self.client().await?;
        let source: Api<Secret> = Api::namespaced(client.clone(), from_namespace);
        let mut secret = source
            .get(name)
            .await
            .map_err(|e| classify(e, Some(ResourceKind::Secret), name, Some(from_namespace)))?;

        // Server-owned fields (uid, resourceVersion, managedFields) must not travel.
        secret.metadata = managed_meta(name, Some(to_namespace));

        let target: Api<Secret> = Api::namespaced(client, to_namespace);
        target
            .patch(
                name,
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(&secret),
            )
            .await
            .map_err(|e| classify(e, Some(ResourceKind::Secret), name, Some(to_namespace)))?;
        info!("Copied secret {} from {} to {}", name, from_namespace, to_namespace);
        Ok(())
    }

    async fn link_secret(&self, secret: &str, subject: &Subject) -> Result<(), Error> {
        let client = self.client().await?;
        let api: Api<ServiceAccount> = Api::namespaced(client, &subject.namespace);
        let not_found = |e| {
            classify(
                e,
                Some(ResourceKind::ServiceAccount),
                &subject.service_account,
                Some(subject.namespace.as_str()),
            )
        };
        let mut account = api.get(&subject.service_account).await.map_err(not_found)?;

        let references = account.image_pull_secrets.get_or_insert_with(Vec::new);
        if references.iter().any(|r| r.name.as_deref() == Some(secret)) {
            debug!("{} already linked to {}", secret, subject);
            return Ok(());
        }
        references.push(LocalObjectReference {
            name: Some(secret.to_string()),
        });

        api.replace(&subject.service_account, &PostParams::default(), &account)
            .await
            .map_err(|e| Error::Apply(format!("Unable to link {} to {}: {}", secret, subject, e)))?;
        info!("Linked pull secret {} to {}", secret, subject);
        Ok(())
    }

    async fn unlink_secret(&self, secret: &str, subject: &Subject) -> Result<(), Error> {
        let client = self.client().await?;
        let api: Api<ServiceAccount> = Api::namespaced(client, &subject.namespace);
        let mut account = match api.get(&subject.service_account).await {
            Ok(account) => account,
            Err(e) => {
                return match classify(
                    e,
                    Some(ResourceKind::ServiceAccount),
                    &subject.service_account,
                    Some(subject.namespace.as_str()),
                ) {
                    Error::NotFound { .. } => Ok(()),
                    err => Err(err),
                }
            }
        };

        let before = account.image_pull_secrets.as_ref().map_or(0, |r| r.len());
        if let Some(references) = account.image_pull_secrets.as_mut() {
            references.retain(|r| r.name.as_deref() != Some(secret));
        }
        if account.image_pull_secrets.as_ref().map_or(0, |r| r.len()) == before {
            debug!("{} was not linked to {}", secret, subject);
            return Ok(());
        }

        api.replace(&subject.service_account, &PostParams::default(), &account)
            .await
            .map_err(|e| {
                Error::Apply(format!("Unable to unlink {} from {}: {}", secret, subject, e))
            })?;
        info!("Unlinked pull secret {} from {}", secret, subject);
        Ok(())
    }
}

/// Turns a kube error into the crate taxonomy: 404 is NotFound, any other API
/// rejection is an ApplyError, transport problems stay kube errors.
fn classify(
    error: kube::Error,
    kind: Option<ResourceKind>,
    name: &str,
    namespace: Option<&str>,
) -> Error {
    match error {
        kube::Error::Api(response) if response.code == 404 => match kind {
            Some(kind) => Error::NotFound {
                kind,
                name: name.to_string(),
                namespace: namespace.map(String::from),
            },
            None => Error::Apply(format!("{}: {}", name, response.message)),
        },
        kube::Error::Api(response) => Error::Apply(format!(
            "{} rejected ({} {}): {}",
            name, response.code, response.reason, response.message
        )),
        other => Error::Kube(other),
    }
}

fn managed_meta(name: &str, namespace: Option<&str>) -> ObjectMeta {
    let mut labels: BTreeMap<String, String> = BTreeMap::new();
    labels.insert(MANAGED_BY_LABEL.into(), FIELD_MANAGER.into());
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: namespace.map(String::from),
        labels: Some(labels),
        ..Default::default()
    }
}

fn api_resource(kind: ResourceKind) -> ApiResource {
    match kind {
        ResourceKind::Job => ApiResource::erase::<Job>(&()),
        ResourceKind::Secret => ApiResource::erase::<Secret>(&()),
        ResourceKind::ServiceAccount => ApiResource::erase::<ServiceAccount>(&()),
        ResourceKind::Role => ApiResource::erase::<Role>(&()),
        ResourceKind::RoleBinding => ApiResource::erase::<RoleBinding>(&()),
        ResourceKind::ClusterRole => ApiResource::erase::<ClusterRole>(&()),
        ResourceKind::ClusterRoleBinding => ApiResource::erase::<ClusterRoleBinding>(&()),
    }
}

/// Parses every non-empty document of a multi-document manifest.
///
/// The YAML parser is not `Send`, so it must be dropped before any request is
/// awaited.
fn parse_manifest(manifest: &str) -> Result<Vec<DynamicObject>, Error> {
    let mut objects = Vec::new();
    for document in serde_yaml::Deserializer::from_str(manifest) {
        let value = serde_yaml::Value::deserialize(document)?;
        if value.is_null() {
            continue;
        }
        objects.push(serde_yaml::from_value(value)?);
    }
    Ok(objects)
}

/// Splits `group/version`; core resources have no group.
fn parse_api_version(api_version: &str) -> (&str, &str) {
    match api_version.split_once('/') {
        Some((group, version)) => (group, version),
        None => ("", api_version),
    }
}
