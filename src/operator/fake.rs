//! In-memory cluster used by unit tests.
//!
//! Records every call as a short label (`"revoke cluster-reader"`,
//! `"apply Job/tls-scanner-job"`) so tests can assert on ordering, and fails
//! any call whose label was registered with [`FakeCluster::fail_on`].

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Mutex;

use crate::model::{GrantScope, PermissionGrant, ResourceKind, Subject};
use crate::operator::client::RemoteResourceClient;
use crate::orchestrator::Error;

type ObjectKey = (ResourceKind, Option<String>, String);

#[derive(Default)]
struct State {
    objects: BTreeMap<ObjectKey, Value>,
    links: BTreeMap<(String, String), Vec<String>>,
    calls: Vec<String>,
    failures: HashSet<String>,
    job_statuses: VecDeque<Value>,
    applied: Vec<String>,
}

#[derive(Default)]
pub struct FakeCluster {
    state: Mutex<State>,
}

fn key(kind: ResourceKind, name: &str, namespace: Option<&str>) -> ObjectKey {
    let namespace = if kind.is_namespaced() {
        namespace.map(String::from)
    } else {
        None
    };
    (kind, namespace, name.to_string())
}

impl FakeCluster {
    pub fn new() -> FakeCluster {
        FakeCluster::default()
    }

    /// Seeds the cluster-wide pull secret.
    pub fn with_secret(self, name: &str, namespace: &str) -> FakeCluster {
        self.insert(
            ResourceKind::Secret,
            name,
            Some(namespace),
            json!({"kind": "Secret", "metadata": {"name": name, "namespace": namespace}, "type": "kubernetes.io/dockerconfigjson"}),
        );
        self
    }

    pub fn insert(&self, kind: ResourceKind, name: &str, namespace: Option<&str>, object: Value) {
        let mut state = self.state.lock().unwrap();
        state.objects.insert(key(kind, name, namespace), object);
    }

    pub fn fail_on(&self, label: &str) {
        self.state.lock().unwrap().failures.insert(label.to_string());
    }

    /// Job statuses returned by successive `get` calls; the last one sticks.
    pub fn script_job_statuses(&self, statuses: Vec<Value>) {
        self.state.lock().unwrap().job_statuses = statuses.into();
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn calls_starting_with(&self, prefix: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.starts_with(prefix))
            .collect()
    }

    pub fn applied(&self) -> Vec<String> {
        self.state.lock().unwrap().applied.clone()
    }

    pub fn exists(&self, kind: ResourceKind, name: &str, namespace: Option<&str>) -> bool {
        let state = self.state.lock().unwrap();
        state.objects.contains_key(&key(kind, name, namespace))
    }

    pub fn count(&self, kind: ResourceKind) -> usize {
        let state = self.state.lock().unwrap();
        state.objects.keys().filter(|(k, _, _)| *k == kind).count()
    }

    pub fn linked(&self, subject: &Subject) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state
            .links
            .get(&(subject.namespace.clone(), subject.service_account.clone()))
            .cloned()
            .unwrap_or_default()
    }

    fn record(&self, label: String) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(label.clone());
        if state.failures.contains(&label) {
            return Err(Error::Apply(format!("injected failure: {}", label)));
        }
        Ok(())
    }

    fn not_found(kind: ResourceKind, name: &str, namespace: Option<&str>) -> Error {
        Error::NotFound {
            kind,
            name: name.to_string(),
            namespace: namespace.map(String::from),
        }
    }
}

#[async_trait]
impl RemoteResourceClient for FakeCluster {
    async fn apply(&self, manifest: &str) -> Result<(), Error> {
        for document in serde_yaml::Deserializer::from_str(manifest) {
            let object = Value::deserialize(document)?;
            if object.is_null() {
                continue;
            }
            let kind_name = object["kind"].as_str().unwrap_or_default().to_string();
            let name = object["metadata"]["name"]
                .as_str()
                .unwrap_or_default()
                .to_string();
            self.record(format!("apply {}/{}", kind_name, name))?;

            let kind = ResourceKind::from_kind(&kind_name)
                .ok_or_else(|| Error::Apply(format!("unknown kind {}", kind_name)))?;
            if name.is_empty() {
                return Err(Error::Apply("manifest has no metadata.name".into()));
            }
            let namespace = object["metadata"]["namespace"].as_str().map(String::from);
            let mut state = self.state.lock().unwrap();
            state.applied.push(manifest.to_string());
            state
                .objects
                .insert(key(kind, &name, namespace.as_deref()), object);
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
        self.record(format!("delete {}/{}", kind, name))?;
        let mut state = self.state.lock().unwrap();
        match state.objects.remove(&key(kind, name, namespace)) {
            Some(_) => Ok(()),
            None if ignore_missing => Ok(()),
            None => Err(Self::not_found(kind, name, namespace)),
        }
    }

    async fn get(
        &self,
        kind: ResourceKind,
        name: &str,
        namespace: Option<&str>,
    ) -> Result<Value, Error> {
        self.record(format!("get {}/{}", kind, name))?;
        let mut state = self.state.lock().unwrap();
        let status = if kind == ResourceKind::Job {
            match state.job_statuses.len() {
                0 => None,
                1 => state.job_statuses.front().cloned(),
                _ => state.job_statuses.pop_front(),
            }
        } else {
            None
        };
        let object = state
            .objects
            .get_mut(&key(kind, name, namespace))
            .ok_or_else(|| Self::not_found(kind, name, namespace))?;
        if let Some(status) = status {
            object["status"] = status;
        }
        Ok(object.clone())
    }

    async fn grant_role(&self, grant: &PermissionGrant) -> Result<(), Error> {
        self.record(format!("grant {}", grant.role))?;
        let namespace = match grant.scope {
            GrantScope::Cluster => None,
            GrantScope::Namespaced => Some(grant.namespace.as_str()),
        };
        let binding = json!({
            "kind": grant.binding_kind().to_string(),
            "metadata": {"name": grant.binding_name(), "namespace": namespace},
            "roleRef": {"kind": "ClusterRole", "name": grant.role},
            "subjects": [{"kind": "ServiceAccount", "name": grant.subject.service_account, "namespace": grant.subject.namespace}],
        });
        self.insert(grant.binding_kind(), &grant.binding_name(), namespace, binding);
        Ok(())
    }

    async fn revoke_role(&self, grant: &PermissionGrant) -> Result<(), Error> {
        self.record(format!("revoke {}", grant.role))?;
        let namespace = match grant.scope {
            GrantScope::Cluster => None,
            GrantScope::Namespaced => Some(grant.namespace.as_str()),
        };
        let mut state = self.state.lock().unwrap();
        state
            .objects
            .remove(&key(grant.binding_kind(), &grant.binding_name(), namespace));
        Ok(())
    }

    async fn copy_secret(
        &self,
        name: &str,
        from_namespace: &str,
        to_namespace: &str,
    ) -> Result<(), Error> {
        self.record(format!("copy_secret {}", name))?;
        let mut state = self.state.lock().unwrap();
        let mut secret = state
            .objects
            .get(&key(ResourceKind::Secret, name, Some(from_namespace)))
            .cloned()
            .ok_or_else(|| Self::not_found(ResourceKind::Secret, name, Some(from_namespace)))?;
        secret["metadata"]["namespace"] = json!(to_namespace);
        state
            .objects
            .insert(key(ResourceKind::Secret, name, Some(to_namespace)), secret);
        Ok(())
    }

    async fn link_secret(&self, secret: &str, subject: &Subject) -> Result<(), Error> {
        self.record(format!("link {}", secret))?;
        let mut state = self.state.lock().unwrap();
        let links = state
            .links
            .entry((subject.namespace.clone(), subject.service_account.clone()))
            .or_default();
        if !links.iter().any(|s| s == secret) {
            links.push(secret.to_string());
        }
        Ok(())
    }

    async fn unlink_secret(&self, secret: &str, subject: &Subject) -> Result<(), Error> {
        self.record(format!("unlink {}", secret))?;
        let mut state = self.state.lock().unwrap();
        if let Some(links) = state
            .links
            .get_mut(&(subject.namespace.clone(), subject.service_account.clone()))
        {
            links.retain(|s| s != secret);
        }
        Ok(())
    }
}
