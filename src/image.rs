use async_trait::async_trait;
use std::path::Path;
use tokio::process::Command;
use tracing::{debug, info};

use crate::orchestrator::Error;

/// Image construction and registry transport. Each call succeeds or fails as
/// a whole.
#[async_trait]
pub trait ImageTool: Send + Sync {
    async fn build(&self, image: &str, context: &Path) -> Result<(), Error>;
    async fn push(&self, image: &str) -> Result<(), Error>;
}

/// Drives a local container engine CLI (`docker`, `podman`).
pub struct ContainerEngine {
    program: String,
}

impl ContainerEngine {
    pub fn new(program: &str) -> ContainerEngine {
        ContainerEngine {
            program: program.to_string(),
        }
    }

    async fn run(&self, args: &[&str]) -> Result<(), Error> {
        debug!("Running {} {}", self.program, args.join(" "));
        let output = Command::new(&self.program)
            .args(args)
            .output()
            .await
            .map_err(|e| Error::Image(format!("Unable to run {}: {}", self.program, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Image(format!(
                "{} {} exited with {}: {}",
                self.program,
                args.first().unwrap_or(&""),
                output.status,
                stderr.trim()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl ImageTool for ContainerEngine {
    async fn build(&self, image: &str, context: &Path) -> Result<(), Error> {
        let context = context.to_string_lossy().into_owned();
        self.run(&["build", "-t", image, context.as_str()]).await?;
        info!("Built image {}", image);
        Ok(())
    }

    async fn push(&self, image: &str) -> Result<(), Error> {
        self.run(&["push", image]).await?;
        info!("Pushed image {}", image);
        Ok(())
    }
}
