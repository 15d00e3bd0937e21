use k8s_openapi::api::rbac::v1::{ClusterRole, PolicyRule};
use kube::core::ObjectMeta;
use std::collections::BTreeMap;
use tracing::{error, info, warn};

use super::client::SharedClient;
use crate::model::{
    GrantScope, PermissionGrant, ResourceKind, Subject, FIELD_MANAGER, MANAGED_BY_LABEL,
};
use crate::orchestrator::{Error, TeardownReport};

pub const CLUSTER_READER: &str = "cluster-reader";
pub const PRIVILEGED_EXECUTION: &str = "system:openshift:scc:privileged";

/// Name of the ClusterRole created for one namespace's scanner.
pub fn dedicated_role_name(namespace: &str) -> String {
    format!("tls-scanner-{}", namespace)
}

/// A grant sequence that stopped early. `attempted` includes the failing grant
/// so revocation can be driven from the same list.
#[derive(Debug)]
pub struct GrantFailure {
    pub attempted: Vec<PermissionGrant>,
    pub error: Error,
}

pub struct PermissionGrantor {
    client: SharedClient,
}

impl PermissionGrantor {
    pub fn new(client: SharedClient) -> PermissionGrantor {
        PermissionGrantor { client }
    }

    /// The grants a deployment to `namespace` holds, in acquisition order.
    pub fn planned_grants(namespace: &str) -> Vec<PermissionGrant> {
        let subject = Subject::execution_identity(namespace);
        let grant = |role: String, scope: GrantScope| PermissionGrant {
            subject: subject.clone(),
            role,
            namespace: namespace.to_string(),
            scope,
        };
        vec![
            grant(CLUSTER_READER.into(), GrantScope::Cluster),
            grant(PRIVILEGED_EXECUTION.into(), GrantScope::Namespaced),
            grant(dedicated_role_name(namespace), GrantScope::Cluster),
        ]
    }

    /// Cross-namespace access the scanner needs beyond cluster-reader.
    pub fn dedicated_role(namespace: &str) -> ClusterRole {
        let mut labels: BTreeMap<String, String> = BTreeMap::new();
        labels.insert(MANAGED_BY_LABEL.into(), FIELD_MANAGER.into());

        ClusterRole {
            metadata: ObjectMeta {
                name: Some(dedicated_role_name(namespace)),
                labels: Some(labels),
                ..Default::default()
            },
            rules: Some(vec![
                rule(&[""], &["pods/exec"], &["create"]),
                rule(&[""], &["pods", "namespaces"], &["get", "list"]),
                rule(
                    &["operator.openshift.io"],
                    &["ingresscontrollers"],
                    &["get", "list", "watch"],
                ),
                rule(
                    &["machineconfiguration.openshift.io"],
                    &["kubeletconfigs"],
                    &["get", "list", "watch"],
                ),
            ]),
            ..Default::default()
        }
    }

    /// Acquires every planned grant in order, stopping at the first failure.
    pub async fn grant(&self, namespace: &str) -> Result<Vec<PermissionGrant>, GrantFailure> {
        let mut attempted = Vec::new();
        for grant in Self::planned_grants(namespace) {
            attempted.push(grant.clone());
            if let Err(error) = self.acquire(&grant).await {
                error!("Unable to grant {}: {}", grant, error);
                return Err(GrantFailure { attempted, error });
            }
        }
        info!("{} grants held in {}", attempted.len(), namespace);
        Ok(attempted)
    }

    async fn acquire(&self, grant: &PermissionGrant) -> Result<(), Error> {
        if grant.role == dedicated_role_name(&grant.namespace) {
            let role = serde_json::to_string(&Self::dedicated_role(&grant.namespace))?;
            self.client.apply(&role).await?;
        }
        self.client.grant_role(grant).await
    }

    /// Revokes every grant in the list and removes the dedicated role.
    ///
    /// Never stops early: each failure is collected and all of them come back
    /// together as one aggregate error.
    pub async fn revoke(&self, namespace: &str, grants: &[PermissionGrant]) -> Result<(), Error> {
        let mut report = TeardownReport::default();
        for grant in grants.iter().rev() {
            let result = self.client.revoke_role(grant).await;
            if let Err(e) = &result {
                warn!("Unable to revoke {}: {}", grant, e);
            }
            report.record(format!("revoke {}", grant), result);
        }

        let role = dedicated_role_name(namespace);
        report.record(
            format!("delete ClusterRole {}", role),
            self.client
                .delete(ResourceKind::ClusterRole, &role, None, true)
                .await,
        );
        report.into_result().map(|_| ())
    }

    /// Planned grants whose binding currently exists.
    pub async fn held(&self, namespace: &str) -> Result<Vec<PermissionGrant>, Error> {
        let mut held = Vec::new();
        for grant in Self::planned_grants(namespace) {
            let scope_ns = match grant.scope {
                GrantScope::Cluster => None,
                GrantScope::Namespaced => Some(namespace),
            };
            match self
                .client
                .get(grant.binding_kind(), &grant.binding_name(), scope_ns)
                .await
            {
                Ok(_) => held.push(grant),
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(held)
    }
}

fn rule(groups: &[&str], resources: &[&str], verbs: &[&str]) -> PolicyRule {
    let owned = |items: &[&str]| items.iter().map(|s| s.to_string()).collect::<Vec<_>>();
    PolicyRule {
        api_groups: Some(owned(groups)),
        resources: Some(owned(resources)),
        verbs: owned(verbs),
        ..Default::default()
    }
}
