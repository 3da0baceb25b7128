use async_trait::async_trait;
use bytes::Bytes;

use crate::protocol::PublishMethod;

/// Delivers finished segments and manifests to the ingestion endpoint, one
/// request per file. Owned and invoked by the engine, never by the
/// orchestrator.
#[async_trait]
pub trait Publisher: Send + 'static {
    /// Set the destination. Called once, when the orchestrator answers
    /// `StartStream` with `BaseUrl`.
    fn set_destination(&mut self, base_url: String, method: PublishMethod);

    fn has_destination(&self) -> bool;

    /// Upload one file to `base_url + "/" + name`.
    async fn publish(&mut self, name: &str, data: Bytes) -> anyhow::Result<()>;
}

/// HTTP publisher: POST per file for HLS, PUT for DASH. Retries and auth are
/// the ingestion endpoint's problem, not ours.
pub struct HttpPublisher {
    client: reqwest::Client,
    destination: Option<(String, PublishMethod)>,
}

impl HttpPublisher {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            destination: None,
        }
    }
}

impl Default for HttpPublisher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Publisher for HttpPublisher {
    fn set_destination(&mut self, base_url: String, method: PublishMethod) {
        self.destination = Some((base_url.trim_end_matches('/').to_string(), method));
    }

    fn has_destination(&self) -> bool {
        self.destination.is_some()
    }

    async fn publish(&mut self, name: &str, data: Bytes) -> anyhow::Result<()> {
        let (base_url, method) = self
            .destination
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("publish before base-url"))?;

        let url = format!("{}/{}", base_url, name);
        let request = match method {
            PublishMethod::Post => self.client.post(&url),
            PublishMethod::Put => self.client.put(&url),
        };

        let response = request.body(data).send().await?;
        response.error_for_status()?;
        log::debug!("published {}", url);
        Ok(())
    }
}

#[cfg(test)]
#[path = "publisher_test.rs"]
mod publisher_test;
