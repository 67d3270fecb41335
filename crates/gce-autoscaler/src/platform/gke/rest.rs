//! reqwest-backed implementation of [`AutoscalingGkeClient`].

use std::sync::Arc;

use tracing::debug;
use tracing::info;

use crate::core::types::Mig;
use crate::core::types::ResourceLimiter;
use crate::platform::auth::TokenSource;
use crate::platform::gce::operation::wait_for_operation;
use crate::platform::gce::operation::OperationState;
use crate::platform::gce::operation::WaitPolicy;
use crate::platform::gke::client::AutoscalingGkeClient;
use crate::platform::gke::client::GkeClientConfig;
use crate::platform::gke::client::NodePool;
use crate::platform::gke::wire::ClusterResource;
use crate::platform::gke::wire::ContainerOperation;
use crate::platform::gke::wire::CreateNodePoolRequest;
use crate::platform::gke::wire::NodePoolList;
use crate::platform::metrics::ApiCallCounter;
use crate::platform::transport::JsonTransport;
use crate::platform::CloudResult;

impl From<&ContainerOperation> for OperationState {
    fn from(op: &ContainerOperation) -> Self {
        match (op.status.as_str(), &op.error) {
            ("DONE", Some(error)) => Self::Failed {
                payload: error.to_string(),
            },
            ("DONE", None) => Self::Done,
            ("RUNNING", _) => Self::Running,
            _ => Self::Pending,
        }
    }
}

pub struct GkeRestClient {
    transport: JsonTransport,
    config: GkeClientConfig,
    calls: ApiCallCounter,
}

impl GkeRestClient {
    pub fn new(
        config: GkeClientConfig,
        tokens: Arc<dyn TokenSource>,
        calls: ApiCallCounter,
    ) -> CloudResult<Self> {
        let transport = JsonTransport::new(config.request_timeout, &config.user_agent, tokens)?;
        info!(
            domain = %config.container_domain,
            project = %config.project,
            location = %config.location,
            cluster = %config.cluster_name,
            "Container client created"
        );
        Ok(Self {
            transport,
            config,
            calls,
        })
    }

    async fn fetch_cluster(&self) -> CloudResult<ClusterResource> {
        self.calls.register("clusters", "get");
        self.transport.get(&self.config.cluster_url()).await
    }

    async fn wait_for_operation(&self, operation: &ContainerOperation) -> CloudResult<()> {
        let policy = WaitPolicy {
            poll_interval: self.config.operation_poll_interval,
            timeout: self.config.operation_wait_timeout,
        };
        let url = format!(
            "{}/v1/projects/{}/locations/{}/operations/{}",
            self.config.container_domain, self.config.project, self.config.location, operation.name
        );
        let target = if operation.target_link.is_empty() {
            self.config.cluster_name.clone()
        } else {
            operation.target_link.clone()
        };
        wait_for_operation(&operation.name, &target, policy, || async {
            self.calls.register("operations", "get");
            let op: ContainerOperation = self.transport.get(&url).await?;
            debug!(operation = %op.name, status = %op.status, "Container operation status");
            Ok(OperationState::from(&op))
        })
        .await
    }
}

#[async_trait::async_trait]
impl AutoscalingGkeClient for GkeRestClient {
    async fn fetch_node_pools(&self) -> CloudResult<Vec<NodePool>> {
        self.calls.register("node_pools", "list");
        let url = format!("{}/nodePools", self.config.cluster_url());
        let list: NodePoolList = self.transport.get(&url).await?;
        Ok(list.node_pools.into_iter().map(Into::into).collect())
    }

    async fn fetch_locations(&self) -> CloudResult<Vec<String>> {
        Ok(self.fetch_cluster().await?.locations)
    }

    async fn fetch_resource_limits(&self) -> CloudResult<Option<ResourceLimiter>> {
        Ok(self
            .fetch_cluster()
            .await?
            .autoscaling
            .and_then(|autoscaling| autoscaling.resource_limiter()))
    }

    async fn create_node_pool(&self, mig: &Mig) -> CloudResult<()> {
        self.calls.register("node_pools", "create");
        let request = CreateNodePoolRequest::for_mig(mig);
        info!(node_pool = %request.node_pool.name, machine_type = %request.node_pool.config.machine_type, "Creating node pool");
        let url = format!("{}/nodePools", self.config.cluster_url());
        let op: ContainerOperation = self.transport.post(&url, Some(&request)).await?;
        self.wait_for_operation(&op).await
    }

    async fn delete_node_pool(&self, name: &str) -> CloudResult<()> {
        self.calls.register("node_pools", "delete");
        info!(node_pool = %name, "Deleting node pool");
        let url = format!("{}/nodePools/{name}", self.config.cluster_url());
        let op: ContainerOperation = self.transport.delete(&url).await?;
        self.wait_for_operation(&op).await
    }
}
