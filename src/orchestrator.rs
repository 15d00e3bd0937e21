use chrono::Local;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::config::DeploymentConfiguration;
use crate::image::ImageTool;
use crate::model::{
    LifecycleState, ResourceKind, ScanJobHandle, Step, TerminalStatus, WorkloadPhase,
};
use crate::operator::{
    ArtifactChannelProvisioner, JobDeployer, JobMonitor, PermissionGrantor, SharedClient,
};

#[derive(Debug, Error)]
pub enum Error {
    #[error("ConfigurationError: {0}")]
    Configuration(String),
    #[error("ConfigurationError: unresolved template placeholder(s): {}", .0.join(", "))]
    UnresolvedPlaceholder(Vec<String>),
    #[error("ApplyError: {0}")]
    Apply(String),
    #[error("NotFoundError: {kind} {name} not found in {}", .namespace.as_deref().unwrap_or("cluster scope"))]
    NotFound {
        kind: ResourceKind,
        name: String,
        namespace: Option<String>,
    },
    #[error("DeployError: {0}")]
    Deploy(Box<Error>),
    #[error("TimeoutError: {name} in {namespace} did not finish within {}s", .waited.as_secs())]
    Timeout {
        name: String,
        namespace: String,
        waited: Duration,
    },
    #[error("WorkloadFailed: {0}")]
    WorkloadFailed(String),
    #[error("AggregateTeardownError: {} step(s) failed: {}", .0.len(), failed_steps(.0))]
    AggregateTeardown(Vec<StepFailure>),
    #[error("{step} failed: {source}")]
    StepFailed {
        step: Step,
        #[source]
        source: Box<Error>,
    },
    #[error("ImageError: {0}")]
    Image(String),
    #[error("KubeError: {0}")]
    Kube(#[from] kube::Error),
    #[error("UnableToSerializeObject: {0}")]
    UnableToSerializeObject(#[from] serde_json::Error),
    #[error("UnableToParseManifest: {0}")]
    UnableToParseManifest(#[from] serde_yaml::Error),
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    /// Tags a forward-path error with the step it came from.
    pub fn at(self, step: Step) -> Error {
        match self {
            Error::StepFailed { .. } => self,
            other => Error::StepFailed {
                step,
                source: Box::new(other),
            },
        }
    }

    pub fn failing_step(&self) -> Option<Step> {
        match self {
            Error::StepFailed { step, .. } => Some(*step),
            _ => None,
        }
    }

    /// Process status for a failed action. Input problems exit 2, everything
    /// else exits 1.
    pub fn exit_code(&self) -> u8 {
        match self {
            Error::StepFailed { source, .. } => source.exit_code(),
            Error::Configuration(_) | Error::UnresolvedPlaceholder(_) => 2,
            _ => 1,
        }
    }
}

/// One teardown sub-step that did not succeed.
#[derive(Debug)]
pub struct StepFailure {
    pub step: String,
    pub error: Error,
}

impl fmt::Display for StepFailure {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}: {}", self.step, self.error)
    }
}

fn failed_steps(failures: &[StepFailure]) -> String {
    failures
        .iter()
        .map(|f| f.step.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Accumulates teardown outcomes so every step runs regardless of earlier
/// failures. Nested aggregates are flattened.
#[derive(Debug, Default)]
pub struct TeardownReport {
    pub completed: Vec<String>,
    pub failures: Vec<StepFailure>,
}

impl TeardownReport {
    pub fn record(&mut self, step: impl Into<String>, result: Result<(), Error>) {
        let step = step.into();
        match result {
            Ok(()) => self.completed.push(step),
            Err(Error::AggregateTeardown(failures)) => self.failures.extend(failures),
            Err(error) => self.failures.push(StepFailure { step, error }),
        }
    }

    pub fn into_result(self) -> Result<TeardownReport, Error> {
        if self.failures.is_empty() {
            Ok(self)
        } else {
            Err(Error::AggregateTeardown(self.failures))
        }
    }
}

/// Prints the labeled progress header for a step.
pub fn announce(step: Step) {
    println!("==> [{}] {}", Local::now().format("%H:%M:%S"), step);
    info!("Starting step: {}", step);
}

/// Sequences the named actions and owns the idempotency and partial-failure
/// rules.
///
/// Nothing is remembered between invocations. Every decision that depends on
/// prior runs is made by asking the cluster what exists.
pub struct LifecycleOrchestrator {
    config: Arc<DeploymentConfiguration>,
    client: SharedClient,
    images: Arc<dyn ImageTool>,
}

impl LifecycleOrchestrator {
    pub fn new(
        config: Arc<DeploymentConfiguration>,
        client: SharedClient,
        images: Arc<dyn ImageTool>,
    ) -> LifecycleOrchestrator {
        LifecycleOrchestrator {
            config,
            client,
            images,
        }
    }

    fn grantor(&self) -> PermissionGrantor {
        PermissionGrantor::new(self.client.clone())
    }

    fn provisioner(&self) -> ArtifactChannelProvisioner {
        ArtifactChannelProvisioner::new(self.client.clone(), self.config.pull_secret.clone())
    }

    fn deployer(&self) -> JobDeployer {
        JobDeployer::new(self.client.clone(), self.config.clone())
    }

    fn monitor_for(&self) -> JobMonitor {
        JobMonitor::new(self.client.clone(), self.config.poll_interval)
    }

    pub async fn build(&self) -> Result<(), Error> {
        announce(Step::Build);
        self.images
            .build(&self.config.image_reference, &self.config.build_context)
            .await
            .map_err(|e| e.at(Step::Build))
    }

    pub async fn push(&self) -> Result<(), Error> {
        announce(Step::Push);
        self.images
            .push(&self.config.image_reference)
            .await
            .map_err(|e| e.at(Step::Push))
    }

    /// Unprovisioned -> PermissionsGranted -> WorkloadSubmitted.
    ///
    /// Stops at the first failing step. Whatever was granted stays granted
    /// until an explicit cleanup.
    pub async fn deploy(&self) -> Result<ScanJobHandle, Error> {
        let namespace = self.config.namespace()?;

        announce(Step::GrantPermissions);
        if let Err(failure) = self.grantor().grant(namespace).await {
            warn!(
                "{} grant(s) attempted before failure; run cleanup to revoke them",
                failure.attempted.len()
            );
            return Err(failure.error.at(Step::GrantPermissions));
        }
        info!("State {}", LifecycleState::PermissionsGranted);

        announce(Step::ProvisionArtifactChannel);
        self.provisioner()
            .provision(namespace)
            .await
            .map_err(|e| e.at(Step::ProvisionArtifactChannel))?;

        announce(Step::SubmitWorkload);
        let handle = self
            .deployer()
            .deploy()
            .await
            .map_err(|e| e.at(Step::SubmitWorkload))?;
        info!("State {}", LifecycleState::WorkloadSubmitted);
        Ok(handle)
    }

    /// Waits for the workload; a timeout is reported, never cleaned up.
    pub async fn monitor(&self, timeout: Duration) -> Result<TerminalStatus, Error> {
        let handle = self.deployer().handle()?;
        announce(Step::Monitor);
        let status = self
            .monitor_for()
            .monitor(&handle, timeout)
            .await
            .map_err(|e| e.at(Step::Monitor))?;
        info!("State {} ({})", LifecycleState::WorkloadComplete, status);
        Ok(status)
    }

    /// build -> push -> deploy, aborting on the first failure.
    pub async fn full_deploy(&self) -> Result<ScanJobHandle, Error> {
        self.build().await?;
        self.push().await?;
        self.deploy().await
    }

    /// Tears down everything a deploy may have created, from any state.
    ///
    /// Every step runs even when an earlier one failed; failures come back
    /// together as one aggregate error.
    pub async fn cleanup(&self) -> Result<TeardownReport, Error> {
        let namespace = self.config.namespace()?;
        let mut report = TeardownReport::default();

        announce(Step::RemoveWorkload);
        let removal = match self.deployer().handle() {
            Ok(handle) => self.deployer().remove(&handle).await.map(|_| ()),
            Err(e) => Err(e),
        };
        report.record(Step::RemoveWorkload.to_string(), removal);

        announce(Step::RevokePermissions);
        let grants = PermissionGrantor::planned_grants(namespace);
        report.record(
            Step::RevokePermissions.to_string(),
            self.grantor().revoke(namespace, &grants).await,
        );

        announce(Step::UnlinkArtifactChannel);
        report.record(
            Step::UnlinkArtifactChannel.to_string(),
            self.provisioner().teardown(namespace).await,
        );

        for failure in &report.failures {
            error!("Teardown step failed: {}", failure);
        }
        if report.failures.is_empty() {
            info!("State {}", LifecycleState::TornDown);
        }
        report.into_result()
    }

    /// Infers the current state from what exists in the cluster.
    pub async fn state(&self) -> Result<LifecycleState, Error> {
        let namespace = self.config.namespace()?;
        let handle = self.deployer().handle()?;
        match self.monitor_for().observe(&handle).await {
            Ok(WorkloadPhase::Running) => return Ok(LifecycleState::WorkloadSubmitted),
            Ok(WorkloadPhase::Terminal(_)) => return Ok(LifecycleState::WorkloadComplete),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        };

        if self.grantor().held(namespace).await?.is_empty() {
            Ok(LifecycleState::Unprovisioned)
        } else {
            Ok(LifecycleState::PermissionsGranted)
        }
    }

    pub async fn render(&self) -> Result<String, Error> {
        self.deployer().render_manifest().await
    }
}
