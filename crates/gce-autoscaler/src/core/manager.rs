//! Group registry and refresh orchestration.
//!
//! In GCE mode groups come from explicit specs and autodiscovery rules; in the GKE modes they
//! mirror the cluster's node pools. [`GceManager::refresh`] is called once per outer-loop tick and
//! does real work at most once per refresh interval.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use derive_more::Display;
use error_stack::Report;
use error_stack::ResultExt;
use futures::StreamExt;
use parking_lot::Mutex;
use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::core::cache::GceCache;
use crate::core::cache::MachineTypeKey;
use crate::core::errors::AutoscalerError;
use crate::core::errors::AutoscalerResult;
use crate::core::gce_ref::parse_mig_url;
use crate::core::gce_ref::GroupRef;
use crate::core::info_provider::CacheMigLister;
use crate::core::info_provider::CachingMigInfoProvider;
use crate::core::info_provider::InfoProviderConfig;
use crate::core::mig_operations::control_plane_error;
use crate::core::mig_operations::MigOperations;
use crate::core::node_group_spec::parse_mig_auto_discovery_specs;
use crate::core::node_group_spec::MigAutoDiscoveryConfig;
use crate::core::node_group_spec::NodeGroupSpec;
use crate::core::node_group_spec::MIG_AUTO_DISCOVERER_KEY_MAX_NODES;
use crate::core::node_group_spec::MIG_AUTO_DISCOVERER_KEY_MIN_NODES;
use crate::core::types::Mig;
use crate::core::types::ResourceLimiter;
use crate::platform::gce::AutoscalingGceClient;
use crate::platform::gke::AutoscalingGkeClient;
use crate::platform::CloudError;

/// Where registered groups come from.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum ManagerMode {
    /// Explicit specs and autodiscovery over plain managed instance groups.
    #[display("gce")]
    Gce,
    /// Node pools of a GKE cluster.
    #[display("gke")]
    Gke,
    /// Node pools of a GKE cluster with node autoprovisioning.
    #[display("gke_nap")]
    GkeNap,
}

impl ManagerMode {
    pub fn is_gke(self) -> bool {
        matches!(self, Self::Gke | Self::GkeNap)
    }
}

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub mode: ManagerMode,
    pub project: String,
    /// Zone, or region when `regional` is set.
    pub location: String,
    pub regional: bool,
    pub cluster_name: String,
    pub refresh_interval: Duration,
    pub machines_refresh_interval: Duration,
    pub instances_regeneration_interval: Duration,
    pub concurrent_refreshes: usize,
    pub mig_instances_min_refresh_wait: Duration,
    /// `<min>:<max>:<url>` specs. Only allowed in GCE mode.
    pub explicit_specs: Vec<String>,
    /// `mig:...` and `label:...` rules. Only allowed in GCE mode.
    pub auto_discovery_specs: Vec<String>,
    /// Used when the control plane reports no limits.
    pub flag_resource_limiter: Option<ResourceLimiter>,
}

impl ManagerConfig {
    pub fn new(project: impl Into<String>, location: impl Into<String>) -> Self {
        Self {
            mode: ManagerMode::Gce,
            project: project.into(),
            location: location.into(),
            regional: false,
            cluster_name: String::new(),
            refresh_interval: Duration::from_secs(60),
            machines_refresh_interval: Duration::from_secs(60 * 60),
            instances_regeneration_interval: Duration::from_secs(60 * 60),
            concurrent_refreshes: 1,
            mig_instances_min_refresh_wait: Duration::from_secs(5),
            explicit_specs: Vec::new(),
            auto_discovery_specs: Vec::new(),
            flag_resource_limiter: None,
        }
    }

    pub fn with_mode(mut self, mode: ManagerMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_regional(mut self, regional: bool) -> Self {
        self.regional = regional;
        self
    }

    pub fn with_cluster_name(mut self, cluster_name: impl Into<String>) -> Self {
        self.cluster_name = cluster_name.into();
        self
    }

    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    pub fn with_machines_refresh_interval(mut self, interval: Duration) -> Self {
        self.machines_refresh_interval = interval;
        self
    }

    pub fn with_instances_regeneration_interval(mut self, interval: Duration) -> Self {
        self.instances_regeneration_interval = interval;
        self
    }

    pub fn with_concurrent_refreshes(mut self, concurrent_refreshes: usize) -> Self {
        self.concurrent_refreshes = concurrent_refreshes.max(1);
        self
    }

    pub fn with_mig_instances_min_refresh_wait(mut self, wait: Duration) -> Self {
        self.mig_instances_min_refresh_wait = wait;
        self
    }

    pub fn with_explicit_specs(mut self, specs: Vec<String>) -> Self {
        self.explicit_specs = specs;
        self
    }

    pub fn with_auto_discovery_specs(mut self, specs: Vec<String>) -> Self {
        self.auto_discovery_specs = specs;
        self
    }

    pub fn with_flag_resource_limiter(mut self, limiter: Option<ResourceLimiter>) -> Self {
        self.flag_resource_limiter = limiter;
        self
    }
}

#[derive(Debug, Default)]
struct RefreshTimes {
    last_refresh: Option<Instant>,
    machines_last_refresh: Option<Instant>,
}

pub struct GceManager {
    config: ManagerConfig,
    ops: Arc<MigOperations>,
    auto_discovery: Vec<MigAutoDiscoveryConfig>,
    explicitly_configured: Mutex<HashSet<GroupRef>>,
    /// Autodiscovered groups missing from the last discovery pass.
    missing_once: Mutex<HashSet<GroupRef>>,
    times: Mutex<RefreshTimes>,
    refresh_lock: tokio::sync::Mutex<()>,
    shutdown: CancellationToken,
}

impl GceManager {
    /// Builds the manager, registers explicitly configured groups and performs the first refresh.
    pub async fn create(
        config: ManagerConfig,
        gce: Arc<dyn AutoscalingGceClient>,
        gke: Option<Arc<dyn AutoscalingGkeClient>>,
    ) -> AutoscalerResult<Self> {
        if config.mode.is_gke()
            && !(config.explicit_specs.is_empty() && config.auto_discovery_specs.is_empty())
        {
            return Err(Report::new(AutoscalerError::InvalidArgument {
                message: format!(
                    "node group specs and autodiscovery are not supported in {} mode",
                    config.mode
                ),
            }));
        }
        let auto_discovery = parse_mig_auto_discovery_specs(&config.auto_discovery_specs)?;

        let cache = Arc::new(GceCache::new());
        let info = Arc::new(CachingMigInfoProvider::new(
            cache.clone(),
            Arc::new(CacheMigLister::new(cache.clone())),
            gce.clone(),
            InfoProviderConfig::new(config.project.clone())
                .with_concurrent_refreshes(config.concurrent_refreshes)
                .with_mig_instances_min_refresh_wait(config.mig_instances_min_refresh_wait),
        ));
        let mut ops = MigOperations::new(
            config.project.clone(),
            config.location.clone(),
            cache,
            info,
            gce,
        );
        match gke {
            Some(gke) => ops = ops.with_gke_client(gke),
            None if config.mode.is_gke() => {
                return Err(Report::new(AutoscalerError::InvalidArgument {
                    message: format!("{} mode needs a container API client", config.mode),
                }));
            }
            None => {}
        }

        let manager = Self {
            config,
            ops: Arc::new(ops),
            auto_discovery,
            explicitly_configured: Mutex::new(HashSet::new()),
            missing_once: Mutex::new(HashSet::new()),
            times: Mutex::new(RefreshTimes::default()),
            refresh_lock: tokio::sync::Mutex::new(()),
            shutdown: CancellationToken::new(),
        };
        manager.fetch_explicit_migs().await?;
        manager.force_refresh().await?;
        Ok(manager)
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn mode(&self) -> ManagerMode {
        self.config.mode
    }

    /// Handle shared with the node groups.
    pub fn ops(&self) -> &Arc<MigOperations> {
        &self.ops
    }

    pub fn get_migs(&self) -> Vec<Mig> {
        self.ops.get_migs()
    }

    /// Limits reported by the control plane, if any were fetched.
    pub fn get_resource_limiter(&self) -> Option<ResourceLimiter> {
        self.ops.cache().get_resource_limiter()
    }

    /// Drops per-tick facts and, once per refresh interval, resyncs the registry.
    pub async fn refresh(&self) -> AutoscalerResult<()> {
        let cache = self.ops.cache();
        cache.invalidate_all_mig_instances();
        cache.invalidate_all_mig_target_sizes();
        cache.invalidate_all_mig_basenames();
        cache.invalidate_all_list_managed_instances_results();
        cache.invalidate_all_mig_instance_template_names();

        let last_refresh = self.times.lock().last_refresh;
        if last_refresh.is_some_and(|t| t.elapsed() < self.config.refresh_interval) {
            return Ok(());
        }
        self.force_refresh().await
    }

    async fn force_refresh(&self) -> AutoscalerResult<()> {
        let _guard = self.refresh_lock.lock().await;
        match self.config.mode {
            ManagerMode::Gce => {
                self.clear_machines_cache();
                self.fetch_auto_migs().await.inspect_err(|e| {
                    error!("Failed to fetch MIGs: {e:?}");
                })?;
            }
            ManagerMode::Gke | ManagerMode::GkeNap => {
                if self.config.mode == ManagerMode::GkeNap {
                    self.fetch_resource_limiter().await.inspect_err(|e| {
                        error!("Failed to fetch resource limits: {e:?}");
                    })?;
                }
                self.fetch_machines_cache().await.inspect_err(|e| {
                    error!("Failed to fetch machine types: {e:?}");
                })?;
                self.ops.refresh_node_pools().await.inspect_err(|e| {
                    error!("Failed to fetch node pools: {e:?}");
                })?;
            }
        }
        self.refresh_autoscaling_options().await;

        self.times.lock().last_refresh = Some(Instant::now());
        info!(next_in = ?self.config.refresh_interval, mode = %self.config.mode, "Refreshed GCE resources");
        Ok(())
    }

    async fn fetch_explicit_migs(&self) -> AutoscalerResult<()> {
        let mut changed = false;
        for spec in &self.config.explicit_specs {
            let mig = NodeGroupSpec::from_flag(spec)
                .and_then(|spec| spec.to_mig())
                .attach_printable_lazy(|| format!("failed to parse node group spec {spec:?}"))?;
            self.explicitly_configured.lock().insert(mig.gce_ref.clone());
            if self.ops.register_mig(mig).await {
                changed = true;
            }
        }
        if changed {
            self.ops.info().regenerate_mig_instances_cache().await?;
        }
        Ok(())
    }

    fn is_explicit(&self, mig: &GroupRef) -> bool {
        self.explicitly_configured.lock().contains(mig)
    }

    /// Registers the groups the discovery rules match and drops autodiscovered groups that were
    /// not matched by two passes in a row.
    async fn fetch_auto_migs(&self) -> AutoscalerResult<()> {
        let mut seen = HashSet::new();
        let mut to_register = Vec::new();

        for cfg in &self.auto_discovery {
            let links = self.find_migs_named(&cfg.re).await?;
            'links: for link in links {
                let gce_ref = parse_mig_url(&link)?;
                let (mut min_size, mut max_size) = (cfg.min_size, cfg.max_size);

                if cfg.is_label_based() {
                    debug!(mig = %gce_ref, labels = ?cfg.labels, "Evaluating instance template labels");
                    let template = match self.ops.info().get_mig_instance_template(&gce_ref).await
                    {
                        Ok(template) => template,
                        Err(e) => {
                            if matches!(
                                e.current_context(),
                                AutoscalerError::GroupDoesNotExist { .. }
                            ) {
                                debug!(mig = %gce_ref, "Ignoring mig whose instance template is not found");
                                continue;
                            }
                            return Err(e);
                        }
                    };
                    let labels = &template.properties.labels;
                    for (key, value) in &cfg.labels {
                        if labels.get(key) != Some(value) {
                            debug!(mig = %gce_ref, template = %template.name, "Instance template missing label {key}={value}, ignoring mig");
                            continue 'links;
                        }
                    }
                    if let Some(value) = labels.get(MIG_AUTO_DISCOVERER_KEY_MIN_NODES) {
                        min_size = template_bound(value, "min", &template.name)?;
                    }
                    if let Some(value) = labels.get(MIG_AUTO_DISCOVERER_KEY_MAX_NODES) {
                        max_size = template_bound(value, "max", &template.name)?;
                    }
                }

                seen.insert(gce_ref.clone());
                if self.is_explicit(&gce_ref) {
                    debug!(mig = %gce_ref, "Ignoring explicitly configured MIG in autodiscovery");
                    continue;
                }
                to_register.push(Mig::new(gce_ref, min_size, max_size));
            }
        }

        let registered: Vec<bool> = futures::stream::iter(to_register)
            .map(|mig| async move {
                let gce_ref = mig.gce_ref.clone();
                let changed = self.ops.register_mig(mig).await;
                if changed {
                    info!(mig = %gce_ref, "Autodiscovered MIG");
                }
                changed
            })
            .buffer_unordered(self.config.concurrent_refreshes.max(1))
            .collect()
            .await;
        let mut changed = registered.into_iter().any(|c| c);

        {
            let mut missing_once = self.missing_once.lock();
            missing_once.retain(|mig| !seen.contains(mig));
            for mig in self.ops.get_migs() {
                if seen.contains(&mig.gce_ref) || self.is_explicit(&mig.gce_ref) {
                    continue;
                }
                if missing_once.remove(&mig.gce_ref) {
                    info!(mig = %mig.gce_ref, "Unregistering MIG no longer matched by autodiscovery");
                    self.ops.cache().unregister_mig(&mig.gce_ref);
                    changed = true;
                } else {
                    debug!(mig = %mig.gce_ref, "MIG not matched by autodiscovery, keeping it for one more pass");
                    missing_once.insert(mig.gce_ref.clone());
                }
            }
        }

        if changed {
            self.ops.info().regenerate_mig_instances_cache().await?;
        }
        Ok(())
    }

    async fn find_migs_named(&self, name: &Regex) -> AutoscalerResult<Vec<String>> {
        let gce = self.ops.gce();
        let discovery_error = |report: Report<CloudError>| {
            control_plane_error(report, "cannot autodiscover managed instance groups")
        };
        if !self.config.regional {
            return gce
                .fetch_migs_with_name(&self.config.location, name)
                .await
                .map_err(discovery_error);
        }
        let zones = gce
            .fetch_zones(&self.config.location)
            .await
            .map_err(discovery_error)?;
        let mut links = Vec::new();
        for zone in zones {
            links.extend(
                gce.fetch_migs_with_name(&zone, name)
                    .await
                    .map_err(discovery_error)?,
            );
        }
        Ok(links)
    }

    /// Reads per-group option overrides from the templates of every registered group.
    async fn refresh_autoscaling_options(&self) {
        let info = self.ops.info();
        for mig in self.ops.get_migs() {
            let gce_ref = &mig.gce_ref;
            let template = match info.get_mig_instance_template(gce_ref).await {
                Ok(template) => template,
                Err(e) => {
                    warn!(mig = %gce_ref, "Not evaluating autoscaling options: failed to find corresponding instance template: {e:?}");
                    continue;
                }
            };
            if template.properties.metadata.is_none() {
                warn!(mig = %gce_ref, template = %template.name, "Failed to extract autoscaling options: instance template is incomplete");
                continue;
            }
            let kube_env = match info.get_mig_kube_env(gce_ref).await {
                Ok(kube_env) => kube_env,
                Err(e) => {
                    warn!(mig = %gce_ref, template = %template.name, "Failed to extract autoscaling options: can't get kube-env: {e:?}");
                    continue;
                }
            };
            let options = match kube_env.autoscaling_options() {
                Ok(options) => options,
                Err(e) => {
                    warn!(mig = %gce_ref, template = %template.name, "Failed to extract autoscaling options: {e}");
                    continue;
                }
            };
            if self.ops.cache().get_autoscaling_options(gce_ref).as_ref() != Some(&options) {
                debug!(mig = %gce_ref, ?options, "Extracted autoscaling options from instance template kube-env");
            }
            self.ops.cache().set_autoscaling_options(gce_ref, options);
        }
    }

    fn machines_cache_fresh(&self) -> bool {
        self.times
            .lock()
            .machines_last_refresh
            .is_some_and(|t| t.elapsed() < self.config.machines_refresh_interval)
    }

    fn clear_machines_cache(&self) {
        if self.machines_cache_fresh() {
            return;
        }
        self.ops.cache().invalidate_all_machines();
        self.times.lock().machines_last_refresh = Some(Instant::now());
        debug!(next_in = ?self.config.machines_refresh_interval, "Cleared machine types cache");
    }

    /// Replaces the machine catalog with the types of every cluster location.
    async fn fetch_machines_cache(&self) -> AutoscalerResult<()> {
        if self.machines_cache_fresh() {
            return Ok(());
        }
        let locations = self
            .ops
            .gke()?
            .fetch_locations()
            .await
            .map_err(|report| control_plane_error(report, "cannot fetch cluster locations"))?;
        let mut machines = HashMap::new();
        for location in locations {
            let types = self
                .ops
                .gce()
                .fetch_machine_types(&location)
                .await
                .map_err(|report| {
                    control_plane_error(report, format!("cannot fetch machine types in {location}"))
                })?;
            for machine in types {
                machines.insert(MachineTypeKey::new(location.clone(), machine.name.clone()), machine);
            }
        }
        info!(count = machines.len(), "Refreshed machine types");
        self.ops.cache().set_machines(machines);
        self.times.lock().machines_last_refresh = Some(Instant::now());
        Ok(())
    }

    async fn fetch_resource_limiter(&self) -> AutoscalerResult<()> {
        let limits = self
            .ops
            .gke()?
            .fetch_resource_limits()
            .await
            .map_err(|report| control_plane_error(report, "cannot fetch resource limits"))?;
        match limits {
            Some(limiter) => {
                debug!(?limiter, "Refreshed resource limits");
                self.ops.cache().set_resource_limiter(Some(limiter));
            }
            None => {
                let old = self.ops.cache().get_resource_limiter();
                error!(?old, "Resource limits should always be defined in NAP mode, but they appear to be empty. Using possibly outdated limits");
            }
        }
        Ok(())
    }

    /// Rebuilds the instance to group map every `instances_regeneration_interval` until
    /// [`GceManager::cleanup`] is called.
    pub async fn run_instances_regeneration(&self) {
        let period = self.config.instances_regeneration_interval;
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("Instances cache regeneration stopped");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.ops.info().regenerate_mig_instances_cache().await {
                        error!("Error while regenerating Mig cache: {e:?}");
                    }
                }
            }
        }
    }

    /// Stops background work.
    pub fn cleanup(&self) {
        self.shutdown.cancel();
    }
}

fn template_bound(value: &str, which: &str, template: &str) -> AutoscalerResult<i64> {
    value.parse().map_err(|_| {
        Report::new(AutoscalerError::MalformedSpec {
            message: format!("invalid {which} nodes {value} in instance template labels: {template}"),
        })
    })
}
