//! Readiness gate
//!
//! Polls the cluster status endpoint until the expected number of nodes
//! report a `Ready` condition or the attempt budget runs out.

use crate::config::ReadinessConfig;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};
use virtcluster_common::{Error, Result};

/// Anything that can report how many nodes are ready
#[async_trait]
pub trait ClusterStatusSource: Send + Sync {
    async fn ready_count(&self) -> Result<usize>;
}

/// Node list as served by `GET /api/v1/nodes`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeList {
    #[serde(default)]
    pub items: Vec<NodeItem>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeItem {
    #[serde(default)]
    pub status: Option<NodeStatus>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeStatus {
    #[serde(default)]
    pub conditions: Vec<NodeCondition>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeCondition {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub status: Option<String>,
}

impl NodeList {
    /// Condition entries of kind `Ready`. The condition's status is not
    /// consulted.
    pub fn ready_count(&self) -> usize {
        self.items
            .iter()
            .filter_map(|item| item.status.as_ref())
            .flat_map(|status| status.conditions.iter())
            .filter(|c| c.kind == "Ready")
            .count()
    }
}

/// Status read from the cluster API on the control node
#[derive(Debug, Clone)]
pub struct KubeApiStatus {
    client: reqwest::Client,
    endpoint: String,
}

impl KubeApiStatus {
    /// `endpoint` is the API base, e.g. `http://192.168.10.1:8080`
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::System(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }

    pub async fn nodes(&self) -> Result<NodeList> {
        let url = format!("{}/api/v1/nodes", self.endpoint.trim_end_matches('/'));

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::fetch(&url, e))?;

        if !response.status().is_success() {
            return Err(Error::fetch(&url, format!("HTTP {}", response.status())));
        }

        response
            .json::<NodeList>()
            .await
            .map_err(|e| Error::fetch(&url, e))
    }
}

#[async_trait]
impl ClusterStatusSource for KubeApiStatus {
    async fn ready_count(&self) -> Result<usize> {
        Ok(self.nodes().await?.ready_count())
    }
}

/// Result of a readiness wait. A timeout is an outcome, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReadinessOutcome {
    Ready {
        ready: usize,
        attempts: u32,
    },
    TimedOut {
        ready: usize,
        expected: usize,
        attempts: u32,
    },
}

impl ReadinessOutcome {
    pub fn is_ready(&self) -> bool {
        matches!(self, ReadinessOutcome::Ready { .. })
    }

    /// Turn a timeout into `Error::ReadinessTimeout`
    pub fn into_result(self) -> Result<Self> {
        match self {
            ReadinessOutcome::TimedOut {
                ready,
                expected,
                attempts,
            } => Err(Error::ReadinessTimeout {
                ready,
                expected,
                attempts,
            }),
            ready => Ok(ready),
        }
    }
}

/// Fixed-interval poller with an attempt budget
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessPoller {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl Default for ReadinessPoller {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(500),
            max_attempts: 50,
        }
    }
}

impl From<&ReadinessConfig> for ReadinessPoller {
    fn from(config: &ReadinessConfig) -> Self {
        Self::new(Duration::from_millis(config.interval_ms), config.max_attempts)
    }
}

impl ReadinessPoller {
    pub fn new(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts,
        }
    }

    /// Poll `source` until exactly `expected` nodes are ready.
    ///
    /// Sleeps `interval` between attempts. A failed query counts as zero
    /// ready nodes for that attempt.
    pub async fn wait_ready(&self, source: &dyn ClusterStatusSource, expected: usize) -> ReadinessOutcome {
        let mut ready = 0;

        for attempt in 1..=self.max_attempts {
            if attempt > 1 {
                tokio::time::sleep(self.interval).await;
            }

            ready = match source.ready_count().await {
                Ok(count) => count,
                Err(e) => {
                    debug!("Status query failed on attempt {}: {}", attempt, e);
                    0
                }
            };

            if ready == expected {
                info!(ready, attempts = attempt, "Cluster ready");
                return ReadinessOutcome::Ready {
                    ready,
                    attempts: attempt,
                };
            }

            info!(
                "Waiting for {} nodes to be ready ({} so far, attempt {}/{})",
                expected, ready, attempt, self.max_attempts
            );
        }

        warn!(
            "Cluster not ready after {} attempts: {}/{} nodes ready",
            self.max_attempts, ready, expected
        );

        ReadinessOutcome::TimedOut {
            ready,
            expected,
            attempts: self.max_attempts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays scripted answers, repeating the last one
    struct Scripted {
        answers: Mutex<VecDeque<Option<usize>>>,
        calls: Mutex<u32>,
    }

    impl Scripted {
        fn new(answers: &[Option<usize>]) -> Self {
            Self {
                answers: Mutex::new(answers.iter().copied().collect()),
                calls: Mutex::new(0),
            }
        }

        fn calls(&self) -> u32 {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl ClusterStatusSource for Scripted {
        async fn ready_count(&self) -> Result<usize> {
            *self.calls.lock().unwrap() += 1;
            let mut answers = self.answers.lock().unwrap();
            let answer = if answers.len() > 1 {
                answers.pop_front().flatten()
            } else {
                answers.front().copied().flatten()
            };
            answer.ok_or_else(|| Error::fetch("nodes", "connection refused"))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_within_budget() {
        let source = Scripted::new(&[Some(0), Some(1), Some(2), Some(3)]);
        let poller = ReadinessPoller::default();

        let start = tokio::time::Instant::now();
        let outcome = poller.wait_ready(&source, 3).await;

        assert_eq!(outcome, ReadinessOutcome::Ready { ready: 3, attempts: 4 });
        assert!(start.elapsed() >= Duration::from_millis(1500));
        assert!(start.elapsed() < Duration::from_millis(2000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out() {
        let source = Scripted::new(&[Some(2)]);
        let poller = ReadinessPoller::default();

        let start = tokio::time::Instant::now();
        let outcome = poller.wait_ready(&source, 3).await;

        assert_eq!(
            outcome,
            ReadinessOutcome::TimedOut { ready: 2, expected: 3, attempts: 50 }
        );
        assert_eq!(source.calls(), 50);
        assert!(start.elapsed() >= Duration::from_millis(49 * 500));
        assert!(start.elapsed() <= Duration::from_secs(25));
        assert!(matches!(
            outcome.into_result(),
            Err(Error::ReadinessTimeout { ready: 2, expected: 3, attempts: 50 })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_query_errors_count_as_zero() {
        let source = Scripted::new(&[None, None, Some(2)]);
        let poller = ReadinessPoller::new(Duration::from_millis(500), 5);

        let outcome = poller.wait_ready(&source, 2).await;
        assert_eq!(outcome, ReadinessOutcome::Ready { ready: 2, attempts: 3 });

        let failing = Scripted::new(&[None]);
        let outcome = poller.wait_ready(&failing, 2).await;
        assert_eq!(
            outcome,
            ReadinessOutcome::TimedOut { ready: 0, expected: 2, attempts: 5 }
        );
    }

    #[test]
    fn test_ready_count_parsing() {
        let body = r#"{
            "kind": "NodeList",
            "items": [
                {"status": {"conditions": [{"type": "Ready", "status": "True"}]}},
                {"status": {"conditions": [{"type": "Ready", "status": "False"}]}},
                {"status": {"conditions": [{"type": "OutOfDisk", "status": "False"}, {"type": "Ready"}]}},
                {"metadata": {"name": "pending"}}
            ]
        }"#;

        let nodes: NodeList = serde_json::from_str(body).unwrap();
        assert_eq!(nodes.ready_count(), 3);
    }

    #[tokio::test]
    async fn test_kube_api_status() {
        use httpmock::prelude::*;

        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/api/v1/nodes");
                then.status(200).json_body(serde_json::json!({
                    "items": [
                        {"status": {"conditions": [{"type": "Ready", "status": "True"}]}},
                        {"status": {"conditions": [{"type": "Ready", "status": "True"}]}}
                    ]
                }));
            })
            .await;

        let status = KubeApiStatus::new(server.base_url(), Duration::from_secs(5)).unwrap();
        assert_eq!(status.ready_count().await.unwrap(), 2);
    }
}
