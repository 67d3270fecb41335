use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use gce_autoscaler::core::GceCloudProvider;
use gce_autoscaler::core::GceManager;
use gce_autoscaler::platform::auth::MetadataTokenSource;
use gce_autoscaler::platform::auth::StaticTokenSource;
use gce_autoscaler::platform::auth::TokenSource;
use gce_autoscaler::platform::gce::AutoscalingGceClient;
use gce_autoscaler::platform::gce::GceRestClient;
use gce_autoscaler::platform::gke::AutoscalingGkeClient;
use gce_autoscaler::platform::gke::GkeRestClient;
use gce_autoscaler::platform::kube_client;
use gce_autoscaler::platform::metrics::ApiCallCounter;

use crate::config::RunArgs;

/// The daemon: a provider kept fresh at the scan interval plus a view of the cluster's nodes.
pub struct Application {
    provider: Arc<GceCloudProvider>,
    kube: Option<kube::Client>,
    calls: ApiCallCounter,
    scan_interval: Duration,
}

impl Application {
    pub async fn build(args: RunArgs) -> Result<Self> {
        let tokens: Arc<dyn TokenSource> = match &args.access_token {
            Some(token) => Arc::new(StaticTokenSource::new(token.clone())),
            None => Arc::new(
                MetadataTokenSource::new()
                    .map_err(|e| anyhow::anyhow!("Failed to create metadata token source: {e:?}"))?,
            ),
        };
        let calls = ApiCallCounter::new();

        let gce: Arc<dyn AutoscalingGceClient> = Arc::new(
            GceRestClient::new(args.gce_client_config(), tokens.clone(), calls.clone())
                .map_err(|e| anyhow::anyhow!("Failed to create compute client: {e:?}"))?,
        );
        let manager_config = args.manager_config();
        let gke: Option<Arc<dyn AutoscalingGkeClient>> = if manager_config.mode.is_gke() {
            Some(Arc::new(
                GkeRestClient::new(args.gke_client_config(), tokens, calls.clone())
                    .map_err(|e| anyhow::anyhow!("Failed to create container client: {e:?}"))?,
            ))
        } else {
            None
        };

        let manager = GceManager::create(manager_config, gce, gke)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to create manager: {e:?}"))?;
        let provider = Arc::new(GceCloudProvider::new(Arc::new(manager)));

        let kube = match kube_client::init_kube_client(args.kubeconfig.clone()).await {
            Ok(client) => Some(client),
            Err(e) => {
                tracing::warn!("Kubernetes API unavailable, node mapping disabled: {e:?}");
                None
            }
        };

        Ok(Self {
            provider,
            kube,
            calls,
            scan_interval: args.scan_interval,
        })
    }

    /// Runs until Ctrl-C.
    pub async fn run(&self) -> Result<()> {
        let regeneration = {
            let manager = self.provider.manager().clone();
            tokio::spawn(async move { manager.run_instances_regeneration().await })
        };

        let mut ticker = tokio::time::interval(self.scan_interval);
        tracing::info!(provider = self.provider.name(), interval = ?self.scan_interval, "Starting refresh loop");
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("Shutdown requested");
                    break;
                }
                _ = ticker.tick() => self.scan().await,
            }
        }

        self.provider.cleanup();
        if let Err(e) = regeneration.await {
            tracing::error!("Instances cache regeneration task failed: {e}");
        }
        tracing::info!(calls = ?self.calls.snapshot(), "Cloud API calls made");
        Ok(())
    }

    async fn scan(&self) {
        if let Err(e) = self.provider.refresh().await {
            tracing::error!("Failed to refresh cloud provider: {e:?}");
            return;
        }
        for group in self.provider.node_groups() {
            match group.target_size().await {
                Ok(size) => tracing::info!(group = %group.debug(), target_size = size, "Node group"),
                Err(e) => tracing::warn!(group = %group.debug(), "Cannot read target size: {e:?}"),
            }
        }

        let Some(client) = &self.kube else {
            return;
        };
        let nodes = match kube_client::list_nodes(client.clone()).await {
            Ok(nodes) => nodes,
            Err(e) => {
                tracing::warn!("Failed to list nodes: {e:?}");
                return;
            }
        };
        for node in nodes {
            let name = node.metadata.name.clone().unwrap_or_default();
            match self.provider.node_group_for_node(&node).await {
                Ok(Some(group)) => tracing::debug!(node = %name, group = %group.id(), "Node mapped"),
                Ok(None) => tracing::debug!(node = %name, "Node outside every registered group"),
                Err(e) => tracing::debug!(node = %name, "Cannot map node: {e:?}"),
            }
        }
    }
}
