//! Cluster discovery token

use async_trait::async_trait;
use std::time::Duration;
use tracing::info;
use virtcluster_common::{Error, Result};

/// Hands out a fresh discovery token for a cluster of `size` members
#[async_trait]
pub trait DiscoverySource: Send + Sync {
    async fn new_token(&self, size: usize) -> Result<String>;
}

/// etcd public discovery service, `GET {url}?size={n}`
#[derive(Debug, Clone)]
pub struct EtcdDiscovery {
    client: reqwest::Client,
    url: String,
}

impl EtcdDiscovery {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::System(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl DiscoverySource for EtcdDiscovery {
    async fn new_token(&self, size: usize) -> Result<String> {
        let response = self
            .client
            .get(&self.url)
            .query(&[("size", size)])
            .send()
            .await
            .map_err(|e| Error::fetch("discovery token", e))?;

        if !response.status().is_success() {
            return Err(Error::fetch(
                "discovery token",
                format!("HTTP {}", response.status()),
            ));
        }

        let token = response
            .text()
            .await
            .map_err(|e| Error::fetch("discovery token", e))?
            .trim()
            .to_string();

        if token.is_empty() {
            return Err(Error::fetch("discovery token", "empty response"));
        }

        info!("Obtained discovery token {}", token);
        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    #[tokio::test]
    async fn test_new_token() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET).path("/new").query_param("size", "3");
                then.status(200)
                    .body("https://discovery.etcd.io/6a28e078895c5ec737174db2419bb2f3\n");
            })
            .await;

        let discovery = EtcdDiscovery::new(server.url("/new"), Duration::from_secs(5)).unwrap();
        let token = discovery.new_token(3).await.unwrap();

        mock.assert_async().await;
        assert_eq!(token, "https://discovery.etcd.io/6a28e078895c5ec737174db2419bb2f3");
    }

    #[tokio::test]
    async fn test_empty_token_rejected() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/new");
                then.status(200).body("  ");
            })
            .await;

        let discovery = EtcdDiscovery::new(server.url("/new"), Duration::from_secs(5)).unwrap();
        assert!(matches!(
            discovery.new_token(1).await,
            Err(Error::ResourceFetchFailed { .. })
        ));
    }
}
