//! Per-group overrides of the scale-down and provisioning defaults.
//!
//! Templates may carry `autoscaling_options` in `AUTOSCALER_ENV_VARS`; recognized keys replace the
//! caller's defaults, anything unparsable is logged and ignored.

use std::collections::BTreeMap;
use std::time::Duration;

use tracing::warn;

pub const SCALE_DOWN_UTILIZATION_THRESHOLD_KEY: &str = "scaledownutilizationthreshold";
pub const SCALE_DOWN_GPU_UTILIZATION_THRESHOLD_KEY: &str = "scaledowngpuutilizationthreshold";
pub const SCALE_DOWN_UNNEEDED_TIME_KEY: &str = "scaledownunneededtime";
pub const SCALE_DOWN_UNREADY_TIME_KEY: &str = "scaledownunreadytime";
pub const MAX_NODE_PROVISION_TIME_KEY: &str = "maxnodeprovisiontime";

#[derive(Debug, Clone, PartialEq)]
pub struct NodeGroupAutoscalingOptions {
    pub scale_down_utilization_threshold: f64,
    pub scale_down_gpu_utilization_threshold: f64,
    pub scale_down_unneeded_time: Duration,
    pub scale_down_unready_time: Duration,
    pub max_node_provision_time: Duration,
}

impl Default for NodeGroupAutoscalingOptions {
    fn default() -> Self {
        Self {
            scale_down_utilization_threshold: 0.5,
            scale_down_gpu_utilization_threshold: 0.5,
            scale_down_unneeded_time: Duration::from_secs(10 * 60),
            scale_down_unready_time: Duration::from_secs(20 * 60),
            max_node_provision_time: Duration::from_secs(15 * 60),
        }
    }
}

impl NodeGroupAutoscalingOptions {
    /// `defaults` with every recognized entry of `options` applied.
    pub fn merged(mut self, options: &BTreeMap<String, String>, mig_name: &str) -> Self {
        if let Some(v) = float_option(options, mig_name, SCALE_DOWN_UTILIZATION_THRESHOLD_KEY) {
            self.scale_down_utilization_threshold = v;
        }
        if let Some(v) = float_option(options, mig_name, SCALE_DOWN_GPU_UTILIZATION_THRESHOLD_KEY) {
            self.scale_down_gpu_utilization_threshold = v;
        }
        if let Some(v) = duration_option(options, mig_name, SCALE_DOWN_UNNEEDED_TIME_KEY) {
            self.scale_down_unneeded_time = v;
        }
        if let Some(v) = duration_option(options, mig_name, SCALE_DOWN_UNREADY_TIME_KEY) {
            self.scale_down_unready_time = v;
        }
        if let Some(v) = duration_option(options, mig_name, MAX_NODE_PROVISION_TIME_KEY) {
            self.max_node_provision_time = v;
        }
        self
    }
}

fn float_option(options: &BTreeMap<String, String>, mig_name: &str, key: &str) -> Option<f64> {
    let raw = options.get(key)?;
    match raw.parse::<f64>() {
        Ok(v) => Some(v),
        Err(e) => {
            warn!(mig = %mig_name, "failed to convert autoscaling_options option {key:?} (value {raw:?}) to float: {e}");
            None
        }
    }
}

fn duration_option(
    options: &BTreeMap<String, String>,
    mig_name: &str,
    key: &str,
) -> Option<Duration> {
    let raw = options.get(key)?;
    match humantime::parse_duration(raw) {
        Ok(v) => Some(v),
        Err(e) => {
            warn!(mig = %mig_name, "failed to convert autoscaling_options option {key:?} (value {raw:?}) to duration: {e}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    fn options(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn recognized_keys_override_defaults() {
        let merged = NodeGroupAutoscalingOptions::default().merged(
            &options(&[
                ("scaledownutilizationthreshold", "0.7"),
                ("scaledowngpuutilizationthreshold", "0.2"),
                ("scaledownunneededtime", "5m"),
                ("scaledownunreadytime", "1h"),
                ("maxnodeprovisiontime", "30s"),
                ("unrelated", "x"),
            ]),
            "ng1",
        );
        assert_eq!(
            merged,
            NodeGroupAutoscalingOptions {
                scale_down_utilization_threshold: 0.7,
                scale_down_gpu_utilization_threshold: 0.2,
                scale_down_unneeded_time: Duration::from_secs(300),
                scale_down_unready_time: Duration::from_secs(3600),
                max_node_provision_time: Duration::from_secs(30),
            }
        );
    }

    #[test]
    fn unparsable_values_keep_defaults() {
        let defaults = NodeGroupAutoscalingOptions::default();
        let merged = defaults.clone().merged(
            &options(&[
                ("scaledownutilizationthreshold", "high"),
                ("scaledownunneededtime", "soon"),
            ]),
            "ng1",
        );
        assert_eq!(merged, defaults);
    }
}
