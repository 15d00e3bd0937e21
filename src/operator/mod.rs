mod channel;
mod client;
#[cfg(test)]
pub mod fake;
mod job;
mod permissions;
pub mod template;

pub use channel::ArtifactChannelProvisioner;
pub use client::{KubeClient, SharedClient};
pub use job::{JobDeployer, JobMonitor};
pub use permissions::PermissionGrantor;
#[cfg(test)]
pub use permissions::{CLUSTER_READER, PRIVILEGED_EXECUTION};
