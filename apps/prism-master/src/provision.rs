//! The instance-provisioning collaborator. The cloud control plane itself
//! lives behind this trait; the fleet manager only ever asks for create,
//! delete, and list.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

#[async_trait]
pub trait InstanceProvider: Send + Sync {
    async fn create_instance(&self, name: &str) -> anyhow::Result<()>;
    async fn delete_instance(&self, name: &str) -> anyhow::Result<()>;
    async fn list_instances(&self) -> anyhow::Result<Vec<String>>;
}

/// Provider backed by the provisioning API:
/// `POST {base}/instances/{name}`, `DELETE {base}/instances/{name}`,
/// `GET {base}/instances`.
pub struct HttpProvider {
    base_url: String,
    client: reqwest::Client,
}

impl HttpProvider {
    pub fn new(base_url: String) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    fn instance_url(&self, name: &str) -> String {
        format!("{}/instances/{}", self.base_url, name)
    }
}

#[derive(Debug, Deserialize)]
struct InstanceList {
    instances: Vec<String>,
}

#[async_trait]
impl InstanceProvider for HttpProvider {
    async fn create_instance(&self, name: &str) -> anyhow::Result<()> {
        debug!(%name, "requesting worker instance creation");
        self.client
            .post(self.instance_url(name))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn delete_instance(&self, name: &str) -> anyhow::Result<()> {
        debug!(%name, "requesting worker instance deletion");
        self.client
            .delete(self.instance_url(name))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn list_instances(&self) -> anyhow::Result<Vec<String>> {
        let list: InstanceList = self
            .client
            .get(format!("{}/instances", self.base_url))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(list.instances)
    }
}
