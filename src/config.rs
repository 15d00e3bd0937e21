use clap::Args;
use kube::config::Kubeconfig;
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

use crate::model::DEFAULT_WORKLOAD_NAME;
use crate::orchestrator::Error;

/// Cluster-wide registry credential copied into the target namespace.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct PullSecretSource {
    pub name: String,
    pub namespace: String,
}

/// Immutable input bundle for one invocation.
///
/// Built once in `main` and shared by reference with every component. Nothing
/// downstream looks at the process environment.
#[derive(Clone, Debug)]
pub struct DeploymentConfiguration {
    pub image_reference: String,
    namespace: Option<String>,
    pub workload_name: String,
    pub template_path: PathBuf,
    pub build_context: PathBuf,
    pub container_engine: String,
    pub pull_secret: PullSecretSource,
    pub poll_interval: Duration,
    pub wait_timeout: Duration,
}

impl DeploymentConfiguration {
    /// Target namespace, or a configuration error for actions that need one.
    pub fn namespace(&self) -> Result<&str, Error> {
        self.namespace.as_deref().ok_or_else(|| {
            Error::Configuration(
                "Unable to determine target namespace: set TLS_SCANNER_NAMESPACE, pass --namespace \
                 or select a kubeconfig context with a namespace"
                    .into(),
            )
        })
    }

    #[cfg(test)]
    pub fn for_tests(namespace: Option<&str>, image: &str, template_path: PathBuf) -> Self {
        DeploymentConfiguration {
            image_reference: image.to_string(),
            namespace: namespace.map(String::from),
            workload_name: DEFAULT_WORKLOAD_NAME.to_string(),
            template_path,
            build_context: PathBuf::from("."),
            container_engine: "docker".into(),
            pull_secret: PullSecretSource {
                name: "pull-secret".into(),
                namespace: "openshift-config".into(),
            },
            poll_interval: Duration::from_secs(5),
            wait_timeout: Duration::from_secs(600),
        }
    }
}

#[derive(Args, Clone, Debug)]
pub struct Settings {
    /// Image reference the workload runs
    #[arg(long, env = "TLS_SCANNER_IMAGE", default_value = "tls-scanner:latest", global = true)]
    image: String,

    /// Target namespace; defaults to the namespace of the active kubeconfig context
    #[arg(short, long, env = "TLS_SCANNER_NAMESPACE", global = true)]
    namespace: Option<String>,

    /// Resource template with ${IMAGE}, ${NAMESPACE} and ${NAME} placeholders
    #[arg(long, env = "TLS_SCANNER_TEMPLATE", default_value = "manifests/scanner-job.yaml", global = true)]
    template: PathBuf,

    #[arg(long, env = "TLS_SCANNER_JOB_NAME", default_value = DEFAULT_WORKLOAD_NAME, global = true)]
    job_name: String,

    /// Directory handed to the container engine as build context
    #[arg(long, env = "TLS_SCANNER_BUILD_CONTEXT", default_value = ".", global = true)]
    build_context: PathBuf,

    #[arg(long, env = "TLS_SCANNER_CONTAINER_ENGINE", default_value = "docker", global = true)]
    container_engine: String,

    #[arg(long, env = "TLS_SCANNER_PULL_SECRET", default_value = "pull-secret", global = true)]
    pull_secret: String,

    #[arg(long, env = "TLS_SCANNER_PULL_SECRET_NAMESPACE", default_value = "openshift-config", global = true)]
    pull_secret_namespace: String,

    /// Seconds to wait for the workload to reach a terminal status
    #[arg(long, env = "TLS_SCANNER_TIMEOUT_SECS", default_value_t = 1800, global = true)]
    timeout_secs: u64,

    #[arg(long, env = "TLS_SCANNER_POLL_SECS", default_value_t = 10, global = true)]
    poll_secs: u64,
}

impl Settings {
    pub fn into_configuration(self) -> DeploymentConfiguration {
        let namespace = resolve_namespace(self.namespace, active_context_namespace);
        DeploymentConfiguration {
            image_reference: self.image,
            namespace,
            workload_name: self.job_name,
            template_path: self.template,
            build_context: self.build_context,
            container_engine: self.container_engine,
            pull_secret: PullSecretSource {
                name: self.pull_secret,
                namespace: self.pull_secret_namespace,
            },
            poll_interval: Duration::from_secs(self.poll_secs.max(1)),
            wait_timeout: Duration::from_secs(self.timeout_secs),
        }
    }
}

/// Explicit namespace wins; otherwise ask the kubeconfig lookup.
fn resolve_namespace<F>(explicit: Option<String>, fallback: F) -> Option<String>
where
    F: FnOnce() -> Option<String>,
{
    match explicit.filter(|ns| !ns.trim().is_empty()) {
        Some(ns) => Some(ns),
        None => fallback().filter(|ns| !ns.trim().is_empty()),
    }
}

fn active_context_namespace() -> Option<String> {
    let kubeconfig = match Kubeconfig::read() {
        Ok(k) => k,
        Err(e) => {
            debug!("Unable to read kubeconfig: {}", e);
            return None;
        }
    };
    let current = kubeconfig.current_context.clone()?;
    let namespace = kubeconfig
        .contexts
        .iter()
        .find(|c| c.name == current)
        .and_then(|c| c.context.as_ref())
        .and_then(|c| c.namespace.clone());
    debug!("Active context {} has namespace {:?}", current, namespace);
    namespace
}
