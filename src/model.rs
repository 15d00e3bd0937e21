use serde::{Deserialize, Serialize};
use std::fmt;

/// Service account the scanning workload runs as.
pub const EXECUTION_IDENTITY: &str = "default";

/// Fixed name of the scanning Job; one per namespace, not per run.
pub const DEFAULT_WORKLOAD_NAME: &str = "tls-scanner-job";

/// Field manager recorded on every server-side apply.
pub const FIELD_MANAGER: &str = "tls-scanner-deployer";

pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

/// Identifies one provisioned workload instance.
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq, Debug)]
pub struct ScanJobHandle {
    pub name: String,
    pub namespace: String,
    pub image_reference: String,
}

impl fmt::Display for ScanJobHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "job/{} in {} ({})", self.name, self.namespace, self.image_reference)
    }
}

/// A service account that receives elevated capabilities.
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq, Hash, Debug)]
pub struct Subject {
    pub namespace: String,
    pub service_account: String,
}

impl Subject {
    pub fn execution_identity(namespace: &str) -> Subject {
        Subject {
            namespace: namespace.to_string(),
            service_account: EXECUTION_IDENTITY.to_string(),
        }
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "system:serviceaccount:{}:{}",
            self.namespace, self.service_account
        )
    }
}

/// Whether a grant is bound cluster-wide or only inside the target namespace.
#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum GrantScope {
    Cluster,
    Namespaced,
}

/// One elevated capability bound to the execution identity.
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq, Hash, Debug)]
pub struct PermissionGrant {
    pub subject: Subject,
    pub role: String,
    pub namespace: String,
    pub scope: GrantScope,
}

impl PermissionGrant {
    /// Name of the binding object that represents this grant.
    ///
    /// The name is derived from the grant alone, so revoking only ever touches
    /// bindings this tool created and never a binding someone else owns.
    pub fn binding_name(&self) -> String {
        let role = self.role.replace(':', "-");
        match self.scope {
            GrantScope::Cluster => format!("tls-scanner-{}-{}", self.namespace, role),
            GrantScope::Namespaced => format!("tls-scanner-{}", role),
        }
    }

    pub fn binding_kind(&self) -> ResourceKind {
        match self.scope {
            GrantScope::Cluster => ResourceKind::ClusterRoleBinding,
            GrantScope::Namespaced => ResourceKind::RoleBinding,
        }
    }
}

impl fmt::Display for PermissionGrant {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} for {} in {}", self.role, self.subject, self.namespace)
    }
}

/// Kinds of remote resources this tool reads or mutates.
#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub enum ResourceKind {
    Job,
    Secret,
    ServiceAccount,
    Role,
    RoleBinding,
    ClusterRole,
    ClusterRoleBinding,
}

impl ResourceKind {
    pub fn from_kind(kind: &str) -> Option<ResourceKind> {
        match kind {
            "Job" => Some(ResourceKind::Job),
            "Secret" => Some(ResourceKind::Secret),
            "ServiceAccount" => Some(ResourceKind::ServiceAccount),
            "Role" => Some(ResourceKind::Role),
            "RoleBinding" => Some(ResourceKind::RoleBinding),
            "ClusterRole" => Some(ResourceKind::ClusterRole),
            "ClusterRoleBinding" => Some(ResourceKind::ClusterRoleBinding),
            _ => None,
        }
    }

    pub fn is_namespaced(&self) -> bool {
        !matches!(
            self,
            ResourceKind::ClusterRole | ResourceKind::ClusterRoleBinding
        )
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let kind = match self {
            ResourceKind::Job => "Job",
            ResourceKind::Secret => "Secret",
            ResourceKind::ServiceAccount => "ServiceAccount",
            ResourceKind::Role => "Role",
            ResourceKind::RoleBinding => "RoleBinding",
            ResourceKind::ClusterRole => "ClusterRole",
            ResourceKind::ClusterRoleBinding => "ClusterRoleBinding",
        };
        write!(f, "{}", kind)
    }
}

/// Where a deployment currently stands. Never persisted; always inferred from
/// what exists in the cluster.
#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Debug)]
pub enum LifecycleState {
    Unprovisioned,
    PermissionsGranted,
    WorkloadSubmitted,
    WorkloadComplete,
    TornDown,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let message: String = match self {
            LifecycleState::Unprovisioned => "Unprovisioned".into(),
            LifecycleState::PermissionsGranted => "PermissionsGranted".into(),
            LifecycleState::WorkloadSubmitted => "WorkloadSubmitted".into(),
            LifecycleState::WorkloadComplete => "WorkloadComplete".into(),
            LifecycleState::TornDown => "TornDown".into(),
        };
        write!(f, "{}", message)
    }
}

impl LifecycleState {
    pub fn message(&self) -> String {
        match self {
            LifecycleState::Unprovisioned => "Nothing is provisioned".to_string(),
            LifecycleState::PermissionsGranted => {
                "Permissions granted, no workload submitted".to_string()
            }
            LifecycleState::WorkloadSubmitted => "Workload submitted and running".to_string(),
            LifecycleState::WorkloadComplete => {
                "Workload finished, run cleanup when results are collected".to_string()
            }
            LifecycleState::TornDown => "Everything has been torn down".to_string(),
        }
    }
}

/// Observed phase of the scanning Job.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum WorkloadPhase {
    Running,
    Terminal(TerminalStatus),
}

#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Debug)]
pub enum TerminalStatus {
    Complete,
    Failed,
}

impl fmt::Display for TerminalStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TerminalStatus::Complete => write!(f, "complete"),
            TerminalStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Labeled unit of work reported in progress headers and failure banners.
#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Debug)]
pub enum Step {
    Build,
    Push,
    GrantPermissions,
    ProvisionArtifactChannel,
    SubmitWorkload,
    Monitor,
    RemoveWorkload,
    RevokePermissions,
    UnlinkArtifactChannel,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let label = match self {
            Step::Build => "build",
            Step::Push => "push",
            Step::GrantPermissions => "grant permissions",
            Step::ProvisionArtifactChannel => "provision artifact channel",
            Step::SubmitWorkload => "submit workload",
            Step::Monitor => "monitor",
            Step::RemoveWorkload => "remove workload",
            Step::RevokePermissions => "revoke permissions",
            Step::UnlinkArtifactChannel => "unlink artifact channel",
        };
        write!(f, "{}", label)
    }
}
