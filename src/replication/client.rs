use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;

use crate::config::ReplicationConfig;
use crate::error::{ClusterError, ClusterResult, ErrorBody};
use crate::membership::{service::MembershipService, types::NodeId};

/// Exponential backoff with jitter, shared by retries and shippers.
#[derive(Debug, Clone)]
pub struct Backoff {
    current: Duration,
    initial: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            current: initial,
            initial,
            max,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let jitter = Duration::from_millis(rand::random::<u64>() % 50);
        let delay = self.current + jitter;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// HTTP client for the replication listener of peers.
#[derive(Clone)]
pub struct PeerClient {
    http: reqwest::Client,
    membership: Arc<MembershipService>,
    config: ReplicationConfig,
}

impl PeerClient {
    pub fn new(membership: Arc<MembershipService>, config: ReplicationConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            membership,
            config,
        }
    }

    pub fn config(&self) -> &ReplicationConfig {
        &self.config
    }

    fn url(&self, node: &NodeId, path: &str) -> ClusterResult<String> {
        let member = self
            .membership
            .get_member(node)
            .ok_or_else(|| ClusterError::unreachable(node, "not a known member"))?;
        Ok(format!("http://{}{}", member.replication_addr, path))
    }

    pub async fn post<Req, Resp>(&self, node: &NodeId, path: &str, body: &Req) -> ClusterResult<Resp>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        self.post_with_timeout(node, path, body, self.config.request_timeout)
            .await
    }

    pub async fn post_with_timeout<Req, Resp>(
        &self,
        node: &NodeId,
        path: &str,
        body: &Req,
        timeout: Duration,
    ) -> ClusterResult<Resp>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let url = self.url(node, path)?;
        let response = self
            .http
            .post(url)
            .json(body)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| ClusterError::unreachable(node, e))?;
        decode(node, response).await
    }

    pub async fn get<Resp>(&self, node: &NodeId, path: &str, timeout: Duration) -> ClusterResult<Resp>
    where
        Resp: DeserializeOwned,
    {
        let url = self.url(node, path)?;
        let response = self
            .http
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| ClusterError::unreachable(node, e))?;
        decode(node, response).await
    }

    /// Retries transport failures with backoff. Errors the peer answered with
    /// are returned immediately.
    pub async fn post_with_retry<Req, Resp>(
        &self,
        node: &NodeId,
        path: &str,
        body: &Req,
        attempts: usize,
    ) -> ClusterResult<Resp>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let mut backoff = Backoff::new(self.config.initial_backoff, self.config.max_backoff);
        let mut last_error = ClusterError::unreachable(node, "no attempt made");

        for attempt in 0..attempts {
            match self.post(node, path, body).await {
                Ok(resp) => return Ok(resp),
                Err(e @ ClusterError::NodeUnreachable { .. }) => {
                    last_error = e;
                    if attempt + 1 < attempts {
                        tokio::time::sleep(backoff.next_delay()).await;
                    }
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error)
    }

    pub async fn get_with_retry<Resp>(
        &self,
        node: &NodeId,
        path: &str,
        timeout: Duration,
        attempts: usize,
    ) -> ClusterResult<Resp>
    where
        Resp: DeserializeOwned,
    {
        let mut backoff = Backoff::new(self.config.initial_backoff, self.config.max_backoff);
        let mut last_error = ClusterError::unreachable(node, "no attempt made");

        for attempt in 0..attempts {
            match self.get(node, path, timeout).await {
                Ok(resp) => return Ok(resp),
                Err(e @ ClusterError::NodeUnreachable { .. }) => {
                    last_error = e;
                    if attempt + 1 < attempts {
                        tokio::time::sleep(backoff.next_delay()).await;
                    }
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error)
    }
}

async fn decode<Resp: DeserializeOwned>(node: &NodeId, response: reqwest::Response) -> ClusterResult<Resp> {
    if response.status().is_success() {
        return response
            .json::<Resp>()
            .await
            .map_err(|e| ClusterError::unreachable(node, format!("bad response body: {}", e)));
    }

    let status = response.status();
    match response.json::<ErrorBody>().await {
        Ok(body) => Err(ClusterError::from_body(body)),
        Err(_) => Err(ClusterError::unreachable(node, format!("status {}", status))),
    }
}
