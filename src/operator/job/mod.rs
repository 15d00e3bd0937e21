use std::sync::Arc;
use tracing::{debug, error, info};

use super::client::SharedClient;
use super::template::{placeholders, render, workload_parameters};
use crate::config::DeploymentConfiguration;
use crate::model::{ResourceKind, ScanJobHandle};
use crate::orchestrator::Error;

mod monitor;
pub use monitor::JobMonitor;

pub struct JobDeployer {
    client: SharedClient,
    config: Arc<DeploymentConfiguration>,
}

impl JobDeployer {
    pub fn new(client: SharedClient, config: Arc<DeploymentConfiguration>) -> JobDeployer {
        JobDeployer { client, config }
    }

    pub fn handle(&self) -> Result<ScanJobHandle, Error> {
        Ok(ScanJobHandle {
            name: self.config.workload_name.clone(),
            namespace: self.config.namespace()?.to_string(),
            image_reference: self.config.image_reference.clone(),
        })
    }

    pub async fn render_manifest(&self) -> Result<String, Error> {
        let namespace = self.config.namespace()?;
        let path = &self.config.template_path;
        let template = tokio::fs::read_to_string(path).await.map_err(|e| {
            Error::Configuration(format!("Unable to read template {}: {}", path.display(), e))
        })?;
        debug!(
            "Template {} references {:?}",
            path.display(),
            placeholders(&template)
        );
        render(&template, &workload_parameters(&self.config, namespace))
    }

    /// Renders the template and applies it. An identical workload that already
    /// exists is left as is.
    pub async fn deploy(&self) -> Result<ScanJobHandle, Error> {
        let handle = self.handle()?;
        let manifest = self.render_manifest().await?;
        if let Err(e) = self.client.apply(&manifest).await {
            error!("Unable to submit {}: {}", handle, e);
            return Err(Error::Deploy(Box::new(e)));
        }
        info!("Workload {} submitted", handle);
        Ok(handle)
    }

    /// Deletes the workload if it exists. Returns whether anything was removed.
    pub async fn remove(&self, handle: &ScanJobHandle) -> Result<bool, Error> {
        match self
            .client
            .get(ResourceKind::Job, &handle.name, Some(&handle.namespace))
            .await
        {
            Ok(_) => {}
            Err(e) if e.is_not_found() => {
                info!("Workload {} already absent", handle.name);
                return Ok(false);
            }
            Err(e) => return Err(e),
        };
        self.client
            .delete(ResourceKind::Job, &handle.name, Some(&handle.namespace), false)
            .await?;
        info!("Workload {} removed", handle.name);
        Ok(true)
    }
}
