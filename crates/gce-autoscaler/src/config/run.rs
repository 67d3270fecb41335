use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use clap::ValueEnum;
use gce_autoscaler::core::types::ResourceLimiter;
use gce_autoscaler::core::types::GIB;
use gce_autoscaler::core::types::RESOURCE_CPU;
use gce_autoscaler::core::types::RESOURCE_MEMORY;
use gce_autoscaler::core::ManagerConfig;
use gce_autoscaler::core::ManagerMode;
use gce_autoscaler::platform::gce::GceClientConfig;
use gce_autoscaler::platform::gke::GkeClientConfig;

/// Which control plane owns the node groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ProviderKind {
    Gce,
    Gke,
    #[value(name = "gke-nap")]
    GkeNap,
}

impl From<ProviderKind> for ManagerMode {
    fn from(kind: ProviderKind) -> Self {
        match kind {
            ProviderKind::Gce => ManagerMode::Gce,
            ProviderKind::Gke => ManagerMode::Gke,
            ProviderKind::GkeNap => ManagerMode::GkeNap,
        }
    }
}

/// `<min>:<max>` bounds of a cluster-wide resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Range {
    pub min: i64,
    pub max: i64,
}

fn parse_range(value: &str) -> Result<Range, String> {
    let (min, max) = value
        .split_once(':')
        .ok_or_else(|| format!("expected <min>:<max>, got {value:?}"))?;
    let min: i64 = min
        .parse()
        .map_err(|e| format!("invalid minimum {min:?}: {e}"))?;
    let max: i64 = max
        .parse()
        .map_err(|e| format!("invalid maximum {max:?}: {e}"))?;
    if min < 0 || max < min {
        return Err(format!("invalid range {value:?}: need 0 <= min <= max"));
    }
    Ok(Range { min, max })
}

/// `<min>:<max>` in GiB, converted to bytes.
fn parse_memory_range(value: &str) -> Result<Range, String> {
    let gib = parse_range(value)?;
    let to_bytes = |amount: i64| {
        amount
            .checked_mul(GIB)
            .ok_or_else(|| format!("memory {amount}GiB in {value:?} is too large"))
    };
    Ok(Range {
        min: to_bytes(gib.min)?,
        max: to_bytes(gib.max)?,
    })
}

#[derive(Parser, Debug, Clone)]
pub struct RunArgs {
    #[arg(long, value_enum, env = "GCE_AUTOSCALER_PROVIDER", default_value = "gce")]
    pub provider: ProviderKind,

    #[arg(long, env = "GCE_PROJECT", help = "Project that owns the instance groups")]
    pub project: String,

    #[arg(
        long,
        env = "GCE_LOCATION",
        help = "Zone of the instance groups, or region with --regional"
    )]
    pub location: String,

    #[arg(long, env = "GKE_CLUSTER_NAME", default_value = "")]
    pub cluster_name: String,

    #[arg(long, help = "Treat --location as a region and discover groups in all its zones")]
    pub regional: bool,

    #[arg(
        long = "nodes",
        value_name = "MIN:MAX:URL",
        help = "Explicitly configured instance group, may be repeated"
    )]
    pub nodes: Vec<String>,

    #[arg(
        long = "node-group-auto-discovery",
        value_name = "SPEC",
        help = "mig:namePrefix=<p>,min=<n>,max=<m> or label:<k>=<v>,..., may be repeated"
    )]
    pub node_group_auto_discovery: Vec<String>,

    #[arg(long, default_value_t = 1)]
    pub concurrent_refreshes: usize,

    #[arg(long, default_value = "5s", value_parser = humantime::parse_duration)]
    pub mig_instances_min_refresh_wait: Duration,

    #[arg(
        long,
        default_value = "60s",
        value_parser = humantime::parse_duration,
        help = "Minimum time between two full refreshes of the group registry"
    )]
    pub refresh_interval: Duration,

    #[arg(long, default_value = "10s", value_parser = humantime::parse_duration)]
    pub scan_interval: Duration,

    #[arg(long, env = "GCE_COMPUTE_DOMAIN", default_value = "https://www.googleapis.com")]
    pub compute_domain: String,

    #[arg(
        long,
        env = "GKE_CONTAINER_DOMAIN",
        default_value = "https://container.googleapis.com"
    )]
    pub container_domain: String,

    #[arg(long, default_value = "30s", value_parser = humantime::parse_duration)]
    pub request_timeout: Duration,

    #[arg(long, default_value = "20s", value_parser = humantime::parse_duration)]
    pub operation_timeout: Duration,

    #[arg(long, default_value = "100ms", value_parser = humantime::parse_duration)]
    pub operation_poll_interval: Duration,

    #[arg(
        long,
        env = "KUBECONFIG",
        value_hint = clap::ValueHint::FilePath,
        help = "Path to kubeconfig file (defaults to cluster config or ~/.kube/config)"
    )]
    pub kubeconfig: Option<PathBuf>,

    #[arg(
        long,
        env = "GCE_ACCESS_TOKEN",
        hide_env_values = true,
        help = "Static bearer token; the metadata server is used when unset"
    )]
    pub access_token: Option<String>,

    #[arg(long, default_value = concat!("gce-autoscaler/", env!("CARGO_PKG_VERSION")))]
    pub user_agent: String,

    #[arg(
        long,
        value_parser = parse_range,
        value_name = "MIN:MAX",
        help = "Cluster-wide cores, used when the control plane reports no limits"
    )]
    pub cores_total: Option<Range>,

    #[arg(
        long,
        value_parser = parse_memory_range,
        value_name = "MIN:MAX",
        help = "Cluster-wide memory in GiB, used when the control plane reports no limits"
    )]
    pub memory_total: Option<Range>,
}

impl RunArgs {
    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig::new(self.project.clone(), self.location.clone())
            .with_mode(self.provider.into())
            .with_regional(self.regional)
            .with_cluster_name(self.cluster_name.clone())
            .with_refresh_interval(self.refresh_interval)
            .with_concurrent_refreshes(self.concurrent_refreshes)
            .with_mig_instances_min_refresh_wait(self.mig_instances_min_refresh_wait)
            .with_explicit_specs(self.nodes.clone())
            .with_auto_discovery_specs(self.node_group_auto_discovery.clone())
            .with_flag_resource_limiter(self.resource_limiter())
    }

    pub fn gce_client_config(&self) -> GceClientConfig {
        GceClientConfig::new(self.project.clone())
            .with_compute_domain(self.compute_domain.clone())
            .with_request_timeout(self.request_timeout)
            .with_operation_wait_timeout(self.operation_timeout)
            .with_operation_poll_interval(self.operation_poll_interval)
            .with_user_agent(self.user_agent.clone())
    }

    pub fn gke_client_config(&self) -> GkeClientConfig {
        GkeClientConfig::new(
            self.project.clone(),
            self.location.clone(),
            self.cluster_name.clone(),
        )
        .with_container_domain(self.container_domain.clone())
        .with_request_timeout(self.request_timeout)
        .with_user_agent(self.user_agent.clone())
    }

    fn resource_limiter(&self) -> Option<ResourceLimiter> {
        if self.cores_total.is_none() && self.memory_total.is_none() {
            return None;
        }
        let mut min = BTreeMap::new();
        let mut max = BTreeMap::new();
        if let Some(cores) = self.cores_total {
            min.insert(RESOURCE_CPU.to_string(), cores.min);
            max.insert(RESOURCE_CPU.to_string(), cores.max);
        }
        if let Some(memory) = self.memory_total {
            min.insert(RESOURCE_MEMORY.to_string(), memory.min);
            max.insert(RESOURCE_MEMORY.to_string(), memory.max);
        }
        Some(ResourceLimiter::new(min, max))
    }
}
