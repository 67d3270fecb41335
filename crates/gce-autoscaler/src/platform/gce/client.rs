//! Compute API surface used by the autoscaler.

use std::collections::HashSet;
use std::time::Duration;

use error_stack::Report;
use rand::Rng;
use regex::Regex;
use tracing::warn;

use crate::core::gce_ref::GceRef;
use crate::core::types::GceInstance;
use crate::core::types::InstanceTemplate;
use crate::core::types::InstanceTemplateName;
use crate::core::types::MachineType;
use crate::core::types::ManagedInstanceGroup;
use crate::platform::CloudError;
use crate::platform::CloudResult;

const INSTANCE_NAME_ALPHABET: &[u8] = b"bcdfghjklmnpqrstvwxz2456789";
const INSTANCE_NAME_SUFFIX_LEN: usize = 4;
const INSTANCE_NAME_ATTEMPTS: usize = 100;

/// Typed calls against the compute REST API.
///
/// Long-running calls (`resize_mig`, `delete_instances`, `create_instances`) return once the
/// operation they start has completed.
#[async_trait::async_trait]
pub trait AutoscalingGceClient: Send + Sync {
    async fn fetch_machine_type(&self, zone: &str, machine_type: &str)
        -> CloudResult<MachineType>;

    async fn fetch_machine_types(&self, zone: &str) -> CloudResult<Vec<MachineType>>;

    /// Lists every managed group in `zone`, consuming all pages.
    async fn fetch_all_migs(&self, zone: &str) -> CloudResult<Vec<ManagedInstanceGroup>>;

    /// Fails with [`CloudError::GroupDoesNotExist`] when the group is gone.
    async fn fetch_mig(&self, mig: &GceRef) -> CloudResult<ManagedInstanceGroup>;

    async fn fetch_mig_target_size(&self, mig: &GceRef) -> CloudResult<i64> {
        Ok(self.fetch_mig(mig).await?.target_size)
    }

    async fn fetch_mig_basename(&self, mig: &GceRef) -> CloudResult<String> {
        Ok(self.fetch_mig(mig).await?.base_instance_name)
    }

    async fn fetch_list_managed_instances_results(&self, mig: &GceRef) -> CloudResult<String> {
        Ok(self.fetch_mig(mig).await?.list_managed_instances_results)
    }

    async fn fetch_mig_template_name(&self, mig: &GceRef) -> CloudResult<InstanceTemplateName> {
        let group = self.fetch_mig(mig).await?;
        InstanceTemplateName::from_url(&group.instance_template).ok_or_else(|| {
            Report::new(CloudError::Serialization {
                message: format!(
                    "cannot derive template name of {mig} from {:?}",
                    group.instance_template
                ),
            })
        })
    }

    /// Lists the managed instances of a group with their state and creation errors.
    async fn fetch_mig_instances(&self, mig: &GceRef) -> CloudResult<Vec<GceInstance>>;

    async fn fetch_mig_template(
        &self,
        mig: &GceRef,
        template_name: &str,
        regional: bool,
    ) -> CloudResult<InstanceTemplate>;

    /// Self links of the groups in `zone` whose name fully matches `filter`.
    async fn fetch_migs_with_name(&self, zone: &str, filter: &Regex) -> CloudResult<Vec<String>>;

    async fn fetch_zones(&self, region: &str) -> CloudResult<Vec<String>>;

    async fn resize_mig(&self, mig: &GceRef, size: i64) -> CloudResult<()>;

    /// Deletes the given instances; unknown instances are skipped rather than failing the batch.
    async fn delete_instances(&self, mig: &GceRef, instances: &[GceRef]) -> CloudResult<()>;

    async fn create_instances(
        &self,
        mig: &GceRef,
        base_name: &str,
        delta: i64,
        existing_provider_ids: &[String],
    ) -> CloudResult<()>;
}

/// Endpoint and timing settings of the compute client.
#[derive(Debug, Clone)]
pub struct GceClientConfig {
    /// scheme and host, e.g. `https://www.googleapis.com`
    pub compute_domain: String,
    pub project: String,
    pub request_timeout: Duration,
    pub operation_wait_timeout: Duration,
    pub operation_poll_interval: Duration,
    pub operation_deletion_poll_interval: Duration,
    pub user_agent: String,
}

impl GceClientConfig {
    pub fn new(project: impl Into<String>) -> Self {
        Self {
            compute_domain: "https://www.googleapis.com".to_string(),
            project: project.into(),
            request_timeout: Duration::from_secs(30),
            operation_wait_timeout: Duration::from_secs(20),
            operation_poll_interval: Duration::from_millis(100),
            operation_deletion_poll_interval: Duration::from_secs(1),
            user_agent: format!("gce-autoscaler/{}", env!("CARGO_PKG_VERSION")),
        }
    }

    pub fn with_compute_domain(mut self, domain: impl Into<String>) -> Self {
        self.compute_domain = domain.into().trim_end_matches('/').to_string();
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

    pub fn with_operation_deletion_poll_interval(mut self, interval: Duration) -> Self {
        self.operation_deletion_poll_interval = interval;
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }
}

/// Instance names of the given provider ids; ids that do not parse are kept verbatim.
pub fn instance_ids_to_names(provider_ids: &[String]) -> HashSet<String> {
    provider_ids
        .iter()
        .map(|id| match GceRef::from_provider_id(id) {
            Ok(r) => r.name,
            Err(e) => {
                warn!(provider_id = %id, "Failed to extract instance name: {e}");
                id.clone()
            }
        })
        .collect()
}

/// `<base_name>-<4 random chars>`, avoiding `existing` for a bounded number of attempts.
pub fn generate_instance_name(base_name: &str, existing: &HashSet<String>) -> String {
    let mut rng = rand::rng();
    let mut candidate = || {
        let suffix: String = (0..INSTANCE_NAME_SUFFIX_LEN)
            .map(|_| {
                let ix = rng.random_range(0..INSTANCE_NAME_ALPHABET.len());
                char::from(INSTANCE_NAME_ALPHABET[ix])
            })
            .collect();
        format!("{base_name}-{suffix}")
    };
    for _ in 0..INSTANCE_NAME_ATTEMPTS {
        let name = candidate();
        if !existing.contains(&name) {
            return name;
        }
    }
    warn!(base_name = %base_name, "Unable to create unique name for a new instance, duplicate name might occur");
    candidate()
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn generated_names_use_base_and_suffix() {
        let name = generate_instance_name("gke-pool", &HashSet::new());
        let suffix = name.strip_prefix("gke-pool-").unwrap();
        assert_eq!(suffix.len(), 4);
        assert!(suffix.bytes().all(|b| INSTANCE_NAME_ALPHABET.contains(&b)));
    }

    #[test]
    fn generated_names_avoid_existing() {
        let existing: HashSet<String> = INSTANCE_NAME_ALPHABET
            .iter()
            .skip(1)
            .map(|b| format!("n-{0}{0}{0}{0}", char::from(*b)))
            .collect();
        for _ in 0..20 {
            assert!(!existing.contains(&generate_instance_name("n", &existing)));
        }
    }

    #[test]
    fn provider_ids_become_names() {
        let names = instance_ids_to_names(&[
            "gce://p1/us-central1-b/vm-abcd".to_string(),
            "not-a-provider-id".to_string(),
        ]);
        assert!(names.contains("vm-abcd"));
        assert!(names.contains("not-a-provider-id"));
    }

    #[test]
    fn config_builders() {
        let config = GceClientConfig::new("p1")
            .with_compute_domain("http://127.0.0.1:8080/")
            .with_operation_poll_interval(Duration::from_millis(5));
        assert_eq!(config.compute_domain, "http://127.0.0.1:8080");
        assert_eq!(config.operation_poll_interval, Duration::from_millis(5));
        assert_eq!(config.operation_wait_timeout, Duration::from_secs(20));
    }
}
