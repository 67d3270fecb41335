//! Typed access to the `kube-env` metadata document and its `AUTOSCALER_ENV_VARS` entry.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use k8s_openapi::api::core::v1::Taint;
use regex::Regex;
use serde_yaml::Value;
use thiserror::Error;
use tracing::debug;
use tracing::error;
use tracing::warn;

const AUTOSCALER_ENV_VARS: &str = "AUTOSCALER_ENV_VARS";

static KUBE_RESERVED_ARG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"--kube-reserved=([^ ]+)").expect("valid regex"));

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KubeEnvError {
    #[error("error unmarshalling kubeEnv: {message}")]
    Unmarshal { message: String },
    #[error("malformed autoscaler var: {var}")]
    MalformedAutoscalerVar { var: String },
    #[error("error while parsing key-value list, val: {value}")]
    MalformedKeyValue { value: String },
}

/// Splits `k1=v1,k2=v2`; an empty string is an empty map.
pub fn parse_key_value_list(list: &str) -> Result<BTreeMap<String, String>, KubeEnvError> {
    let mut result = BTreeMap::new();
    if list.is_empty() {
        return Ok(result);
    }
    for pair in list.split(',') {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| KubeEnvError::MalformedKeyValue {
                value: pair.to_string(),
            })?;
        result.insert(key.to_string(), value.to_string());
    }
    Ok(result)
}

/// `value[:effect]` entries keyed by taint key; a missing effect is left empty.
fn build_taints(entries: BTreeMap<String, String>) -> Vec<Taint> {
    entries
        .into_iter()
        .map(|(key, value)| {
            let (value, effect) = value.split_once(':').unwrap_or((value.as_str(), ""));
            Taint {
                key,
                value: Some(value.to_string()),
                effect: effect.to_string(),
                time_added: None,
            }
        })
        .collect()
}

/// A parsed `kube-env`: a flat `KEY: value` YAML mapping.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KubeEnv {
    entries: BTreeMap<String, String>,
}

impl KubeEnv {
    pub fn parse(raw: &str) -> Result<Self, KubeEnvError> {
        let document: Value = serde_yaml::from_str(raw).map_err(|e| KubeEnvError::Unmarshal {
            message: e.to_string(),
        })?;
        let mapping = match document {
            Value::Null => return Ok(Self::default()),
            Value::Mapping(mapping) => mapping,
            other => {
                return Err(KubeEnvError::Unmarshal {
                    message: format!("expected a mapping, got {other:?}"),
                })
            }
        };
        let mut entries = BTreeMap::new();
        for (key, value) in mapping {
            let (Some(key), Some(value)) = (scalar(&key), scalar(&value)) else {
                return Err(KubeEnvError::Unmarshal {
                    message: "kube-env entries must be scalars".to_string(),
                });
            };
            entries.insert(key, value);
        }
        Ok(Self { entries })
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Value of a top-level key, empty when absent.
    pub fn get(&self, key: &str) -> &str {
        self.entries.get(key).map(String::as_str).unwrap_or_default()
    }

    /// Looks `name` up in `AUTOSCALER_ENV_VARS` (`;`-separated `name=value`, values optionally
    /// quoted). Entries are scanned in order, so a malformed entry before `name` is an error.
    pub fn autoscaler_var(&self, name: &str) -> Result<Option<String>, KubeEnvError> {
        let vars = self.get(AUTOSCALER_ENV_VARS);
        if vars.trim_matches(' ').is_empty() {
            return Ok(None);
        }
        for var in vars.split(';') {
            let var = var.trim_matches(' ');
            let (key, value) = var
                .split_once('=')
                .ok_or_else(|| KubeEnvError::MalformedAutoscalerVar {
                    var: var.to_string(),
                })?;
            if key.trim_matches(' ') == name {
                return Ok(Some(value.trim_matches([' ', '"', '\'']).to_string()));
            }
        }
        debug!(name, vars, "var not found in AUTOSCALER_ENV_VARS");
        Ok(None)
    }

    /// The autoscaler var when present, otherwise the legacy top-level key.
    fn autoscaler_var_or_legacy(&self, name: &str, legacy: &str) -> String {
        match self.autoscaler_var(name) {
            Ok(Some(value)) => value,
            Ok(None) => self.get(legacy).to_string(),
            Err(e) => {
                error!("error while trying to extract {name} from AUTOSCALER_ENV_VARS: {e}");
                self.get(legacy).to_string()
            }
        }
    }

    pub fn labels(&self) -> Result<BTreeMap<String, String>, KubeEnvError> {
        parse_key_value_list(&self.autoscaler_var_or_legacy("node_labels", "NODE_LABELS"))
    }

    pub fn taints(&self) -> Result<Vec<Taint>, KubeEnvError> {
        let entries =
            parse_key_value_list(&self.autoscaler_var_or_legacy("node_taints", "NODE_TAINTS"))?;
        Ok(build_taints(entries))
    }

    /// Raw kube-reserved list from `kube_reserved`, else from `--kube-reserved` in
    /// `KUBELET_TEST_ARGS`.
    pub fn kube_reserved(&self) -> Option<String> {
        match self.autoscaler_var("kube_reserved") {
            Ok(Some(value)) => return Some(value),
            Ok(None) => {}
            Err(e) => error!("error while trying to extract kube_reserved from AUTOSCALER_ENV_VARS: {e}"),
        }
        KUBE_RESERVED_ARG
            .captures(self.get("KUBELET_TEST_ARGS"))
            .and_then(|captures| captures.get(1))
            .map(|m| m.as_str().to_string())
    }

    /// Named list-valued autoscaler var; absent means empty.
    fn autoscaler_list(&self, name: &str) -> Result<BTreeMap<String, String>, KubeEnvError> {
        match self.autoscaler_var(name)? {
            Some(list) => parse_key_value_list(&list),
            None => Ok(BTreeMap::new()),
        }
    }

    pub fn extended_resources(&self) -> Result<BTreeMap<String, String>, KubeEnvError> {
        self.autoscaler_list("extended_resources")
    }

    pub fn eviction_hard(&self) -> Result<BTreeMap<String, String>, KubeEnvError> {
        self.autoscaler_list("evictionHard")
    }

    pub fn autoscaling_options(&self) -> Result<BTreeMap<String, String>, KubeEnvError> {
        self.autoscaler_list("autoscaling_options")
    }

    /// Number of local SSDs backing ephemeral storage; 0 when unset or unparsable.
    pub fn ephemeral_storage_local_ssd_count(&self) -> i64 {
        match self.autoscaler_var("ephemeral_storage_local_ssd_count") {
            Ok(Some(value)) => value.parse().unwrap_or_else(|e| {
                warn!("cannot parse ephemeral_storage_local_ssd_count value, default to 0: {e}");
                0
            }),
            Ok(None) => 0,
            Err(e) => {
                warn!("cannot extract ephemeral_storage_local_ssd_count from kube-env, default to 0: {e}");
                0
            }
        }
    }

    /// Whether ephemeral storage must not be derived from the boot disk.
    pub fn boot_disk_ephemeral_storage_blocked(&self) -> bool {
        matches!(
            self.autoscaler_var("BLOCK_EPH_STORAGE_BOOT_DISK"),
            Ok(Some(value)) if value == "true"
        )
    }
}

fn scalar(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Null => Some(String::new()),
        _ => None,
    }
}
