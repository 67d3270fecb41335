//! Container (GKE) API surface used by the autoscaler.

use std::time::Duration;

use crate::core::types::Mig;
use crate::core::types::ResourceLimiter;
use crate::platform::CloudResult;

/// A node pool as reported by the control plane.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodePool {
    pub name: String,
    /// URLs of the managed groups backing the pool, one per zone.
    pub instance_group_urls: Vec<String>,
    pub autoprovisioned: bool,
    pub min_node_count: i64,
    pub max_node_count: i64,
}

#[async_trait::async_trait]
pub trait AutoscalingGkeClient: Send + Sync {
    async fn fetch_node_pools(&self) -> CloudResult<Vec<NodePool>>;

    /// Zones the cluster's nodes may run in.
    async fn fetch_locations(&self) -> CloudResult<Vec<String>>;

    /// Cluster-wide autoprovisioning limits; `None` when the cluster defines none.
    async fn fetch_resource_limits(&self) -> CloudResult<Option<ResourceLimiter>>;

    /// Creates the node pool described by an autoprovisioned group and waits for it.
    async fn create_node_pool(&self, mig: &Mig) -> CloudResult<()>;

    async fn delete_node_pool(&self, name: &str) -> CloudResult<()>;
}

/// Endpoint and timing settings of the container client.
#[derive(Debug, Clone)]
pub struct GkeClientConfig {
    pub container_domain: String,
    pub project: String,
    pub location: String,
    pub cluster_name: String,
    pub request_timeout: Duration,
    pub operation_wait_timeout: Duration,
    pub operation_poll_interval: Duration,
    pub user_agent: String,
}

impl GkeClientConfig {
    pub fn new(
        project: impl Into<String>,
        location: impl Into<String>,
        cluster_name: impl Into<String>,
    ) -> Self {
        Self {
            container_domain: "https://container.googleapis.com".to_string(),
            project: project.into(),
            location: location.into(),
            cluster_name: cluster_name.into(),
            request_timeout: Duration::from_secs(30),
            operation_wait_timeout: Duration::from_secs(120),
            operation_poll_interval: Duration::from_secs(1),
            user_agent: format!("gce-autoscaler/{}", env!("CARGO_PKG_VERSION")),
        }
    }

    pub fn with_container_domain(mut self, domain: impl Into<String>) -> Self {
        self.container_domain = domain.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_operation_wait_timeout(mut self, timeout: Duration) -> Self {
        self.operation_wait_timeout = timeout;
        self
    }

    pub fn with_operation_poll_interval(mut self, interval: Duration) -> Self {
        self.operation_poll_interval = interval;
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// `projects/<p>/locations/<l>/clusters/<c>` under the configured domain.
    pub fn cluster_url(&self) -> String {
        format!(
            "{}/v1/projects/{}/locations/{}/clusters/{}",
            self.container_domain, self.project, self.location, self.cluster_name
        )
    }
}
