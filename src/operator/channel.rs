use tracing::info;

use super::client::SharedClient;
use crate::config::PullSecretSource;
use crate::model::Subject;
use crate::orchestrator::Error;

/// Registry credential available to the workload's execution identity.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ArtifactChannel {
    pub secret: String,
    pub subject: Subject,
}

pub struct ArtifactChannelProvisioner {
    client: SharedClient,
    source: PullSecretSource,
}

impl ArtifactChannelProvisioner {
    pub fn new(client: SharedClient, source: PullSecretSource) -> ArtifactChannelProvisioner {
        ArtifactChannelProvisioner { client, source }
    }

    pub fn channel(&self, namespace: &str) -> ArtifactChannel {
        ArtifactChannel {
            secret: self.source.name.clone(),
            subject: Subject::execution_identity(namespace),
        }
    }

    /// Copies the pull credential into `namespace` and links it to the
    /// execution identity. Both halves are idempotent.
    pub async fn provision(&self, namespace: &str) -> Result<ArtifactChannel, Error> {
        if self.source.namespace != namespace {
            self.client
                .copy_secret(&self.source.name, &self.source.namespace, namespace)
                .await?;
        }
        let channel = self.channel(namespace);
        self.client
            .link_secret(&channel.secret, &channel.subject)
            .await?;
        info!("Pull secret {} available to {}", channel.secret, channel.subject);
        Ok(channel)
    }

    /// Unlinks the credential. The copied secret stays behind: an inert
    /// credential is preferable to deleting one that may be shared.
    pub async fn teardown(&self, namespace: &str) -> Result<(), Error> {
        let channel = self.channel(namespace);
        self.client
            .unlink_secret(&channel.secret, &channel.subject)
            .await
    }
}
