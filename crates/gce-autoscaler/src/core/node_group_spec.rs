//! Group configuration from flags: explicit `min:max:url` specs and autodiscovery rules.

use std::collections::BTreeMap;

use error_stack::Report;
use error_stack::ResultExt;
use regex::Regex;

use crate::core::errors::AutoscalerError;
use crate::core::errors::AutoscalerResult;
use crate::core::gce_ref::parse_mig_url;
use crate::core::types::Mig;

const AUTO_DISCOVERER_TYPE_MIG: &str = "mig";
const AUTO_DISCOVERER_TYPE_LABEL: &str = "label";
const MIG_AUTO_DISCOVERER_KEY_PREFIX: &str = "namePrefix";
pub(crate) const MIG_AUTO_DISCOVERER_KEY_MIN_NODES: &str = "min";
pub(crate) const MIG_AUTO_DISCOVERER_KEY_MAX_NODES: &str = "max";
const LABEL_DISCOVERY_MAX_SIZE: i64 = 1000;

fn malformed(message: impl Into<String>) -> Report<AutoscalerError> {
    Report::new(AutoscalerError::MalformedSpec {
        message: message.into(),
    })
}

/// A group named on the command line together with its bounds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeGroupSpec {
    pub name: String,
    pub min_size: i64,
    pub max_size: i64,
}

impl NodeGroupSpec {
    /// Parses `<min>:<max>:<name>`; the name may itself contain colons.
    pub fn from_flag(value: &str) -> AutoscalerResult<Self> {
        let mut tokens = value.splitn(3, ':');
        let (Some(min), Some(max), Some(name)) = (tokens.next(), tokens.next(), tokens.next())
        else {
            return Err(malformed(format!("wrong nodes configuration: {value}")));
        };
        let min_size = min
            .parse()
            .map_err(|_| malformed(format!("failed to set min size: {min}, expected integer")))?;
        let max_size = max
            .parse()
            .map_err(|_| malformed(format!("failed to set max size: {max}, expected integer")))?;
        let spec = Self {
            name: name.to_string(),
            min_size,
            max_size,
        };
        spec.validate()?;
        Ok(spec)
    }

    pub fn validate(&self) -> AutoscalerResult<()> {
        if self.min_size < 0 {
            return Err(malformed("min size must be >= 0"));
        }
        if self.max_size < self.min_size {
            return Err(malformed("max size must be greater or equal to min size"));
        }
        if self.max_size < 1 {
            return Err(malformed("max size must be greater than 0"));
        }
        if self.name.is_empty() {
            return Err(malformed("group name must not be blank"));
        }
        Ok(())
    }

    /// The group the spec names, with the spec's bounds.
    pub fn to_mig(&self) -> AutoscalerResult<Mig> {
        self.validate()?;
        let gce_ref = parse_mig_url(&self.name)
            .attach_printable_lazy(|| format!("failed to parse mig url: {}", self.name))?;
        Ok(Mig::new(gce_ref, self.min_size, self.max_size))
    }
}

/// How to find groups automatically: by name pattern, optionally narrowed by template labels.
#[derive(Debug, Clone)]
pub struct MigAutoDiscoveryConfig {
    pub re: Regex,
    pub min_size: i64,
    pub max_size: i64,
    /// Empty for name-prefix rules.
    pub labels: BTreeMap<String, String>,
}

impl MigAutoDiscoveryConfig {
    pub fn is_label_based(&self) -> bool {
        !self.labels.is_empty()
    }

    /// Parses `mig:namePrefix=p,min=a,max=b` or `label:k=v,...`.
    pub fn parse(spec: &str) -> AutoscalerResult<Self> {
        let tokens: Vec<&str> = spec.split(':').collect();
        let [kind, body] = tokens.as_slice() else {
            return Err(malformed(format!(
                "spec \"{spec}\" should be mig:key=value,key=value"
            )));
        };
        match *kind {
            AUTO_DISCOVERER_TYPE_LABEL => Self::parse_label_spec(body),
            AUTO_DISCOVERER_TYPE_MIG => Self::parse_name_prefix_spec(body),
            _ => Err(malformed(
                "unsupported auto-discovery type specified. Supported types are 'label' and 'mig'",
            )),
        }
    }

    fn parse_label_spec(body: &str) -> AutoscalerResult<Self> {
        let mut labels = BTreeMap::new();
        for arg in body.split(',') {
            let kv: Vec<&str> = arg.split('=').collect();
            let [key, value] = kv.as_slice() else {
                return Err(malformed(format!(
                    "invalid label key=value pair {kv:?}; use key1=value1,key2=value2"
                )));
            };
            labels.insert(key.to_string(), value.to_string());
        }
        if labels.is_empty() {
            return Err(malformed("no labels specified. use key1=value1,key2=value2"));
        }
        Ok(Self {
            re: Regex::new(".*").change_context_lazy(|| AutoscalerError::MalformedSpec {
                message: "match-all pattern".to_string(),
            })?,
            min_size: 0,
            max_size: LABEL_DISCOVERY_MAX_SIZE,
            labels,
        })
    }

    fn parse_name_prefix_spec(body: &str) -> AutoscalerResult<Self> {
        let mut re = None;
        let mut min_size = 0;
        let mut max_size = 0;
        for arg in body.split(',') {
            let kv: Vec<&str> = arg.split('=').collect();
            let [key, value] = kv.as_slice() else {
                return Err(malformed(format!("invalid key=value pair {kv:?}")));
            };
            match *key {
                MIG_AUTO_DISCOVERER_KEY_PREFIX => {
                    let pattern = format!("^{value}.+");
                    re = Some(Regex::new(&pattern).map_err(|_| {
                        malformed(format!(
                            "invalid instance group name prefix \"{value}\" - \"{pattern}\" must be a valid RE2 regexp"
                        ))
                    })?);
                }
                MIG_AUTO_DISCOVERER_KEY_MIN_NODES => {
                    min_size = value
                        .parse()
                        .map_err(|_| malformed(format!("invalid minimum nodes: {value}")))?;
                }
                MIG_AUTO_DISCOVERER_KEY_MAX_NODES => {
                    max_size = value
                        .parse()
                        .map_err(|_| malformed(format!("invalid maximum nodes: {value}")))?;
                }
                _ => {
                    return Err(malformed(format!(
                        "unsupported key \"{key}\" is specified for mig-auto-discovery \"{body}\". Supported keys are \"{MIG_AUTO_DISCOVERER_KEY_PREFIX}, {MIG_AUTO_DISCOVERER_KEY_MIN_NODES}, {MIG_AUTO_DISCOVERER_KEY_MAX_NODES}\""
                    )))
                }
            }
        }
        let re = match re {
            Some(re) if re.as_str() != "^.+" => re,
            _ => return Err(malformed("empty instance group name prefix supplied")),
        };
        if min_size > max_size {
            return Err(malformed(format!(
                "minimum size {min_size} is greater than maximum size {max_size}"
            )));
        }
        if max_size < 1 {
            return Err(malformed(format!("maximum size {max_size} must be at least 1")));
        }
        Ok(Self {
            re,
            min_size,
            max_size,
            labels: BTreeMap::new(),
        })
    }
}

/// Parses every autodiscovery spec. Either any number of name-prefix rules or a single label
/// rule is accepted.
pub fn parse_mig_auto_discovery_specs(
    specs: &[String],
) -> AutoscalerResult<Vec<MigAutoDiscoveryConfig>> {
    let mut configs: Vec<MigAutoDiscoveryConfig> = Vec::new();
    let mut label_entry_found = false;
    for spec in specs {
        let config = MigAutoDiscoveryConfig::parse(spec)?;
        if label_entry_found {
            return Err(malformed(if config.is_label_based() {
                "more than 1 label-based entry found in NodeGroupAutoDiscoverySpecs"
            } else {
                "label-based and name-prefix-based entries are both specified in NodeGroupAutoDiscoverySpecs"
            }));
        }
        if config.is_label_based() {
            label_entry_found = true;
            if !configs.is_empty() {
                return Err(malformed(
                    "label-based and name-prefix-based entries are both specified in NodeGroupAutoDiscoverySpecs",
                ));
            }
        }
        configs.push(config);
    }
    Ok(configs)
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::core::gce_ref::GceRef;

    fn message(err: Report<AutoscalerError>) -> String {
        match err.current_context() {
            AutoscalerError::MalformedSpec { message } => message.clone(),
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn explicit_spec_with_legacy_url() {
        let spec = NodeGroupSpec::from_flag(
            "0:10:https://content.googleapis.com/compute/v1/projects/p1/zones/us-central1-b/instanceGroups/ng1",
        )
        .unwrap();
        let mig = spec.to_mig().unwrap();
        assert_eq!(mig.gce_ref, GceRef::new("p1", "us-central1-b", "ng1"));
        assert_eq!((mig.min_size, mig.max_size), (0, 10));
        assert!(!mig.autoprovisioned);
    }

    #[test]
    fn explicit_spec_errors() {
        assert_eq!(
            message(NodeGroupSpec::from_flag("1:5").unwrap_err()),
            "wrong nodes configuration: 1:5"
        );
        assert_eq!(
            message(NodeGroupSpec::from_flag("a:5:url").unwrap_err()),
            "failed to set min size: a, expected integer"
        );
        assert_eq!(
            message(NodeGroupSpec::from_flag("-1:5:url").unwrap_err()),
            "min size must be >= 0"
        );
        assert_eq!(
            message(NodeGroupSpec::from_flag("5:1:url").unwrap_err()),
            "max size must be greater or equal to min size"
        );
        assert_eq!(
            message(NodeGroupSpec::from_flag("0:0:url").unwrap_err()),
            "max size must be greater than 0"
        );
    }

    #[test]
    fn explicit_spec_needs_a_mig_url() {
        let spec = NodeGroupSpec::from_flag("0:10:ng1").unwrap();
        assert!(matches!(
            spec.to_mig().unwrap_err().current_context(),
            AutoscalerError::MalformedUrl { .. }
        ));
    }

    #[test]
    fn name_prefix_discovery() {
        let config = MigAutoDiscoveryConfig::parse("mig:namePrefix=pool,min=1,max=5").unwrap();
        assert_eq!(config.re.as_str(), "^pool.+");
        assert_eq!((config.min_size, config.max_size), (1, 5));
        assert!(!config.is_label_based());
    }

    #[test]
    fn name_prefix_discovery_errors() {
        let cases = [
            ("mig", "spec \"mig\" should be mig:key=value,key=value"),
            (
                "asg:namePrefix=pool",
                "unsupported auto-discovery type specified. Supported types are 'label' and 'mig'",
            ),
            ("mig:namePrefix=pool,min=x,max=5", "invalid minimum nodes: x"),
            ("mig:namePrefix=pool,min=1,max=y", "invalid maximum nodes: y"),
            ("mig:namePrefix=,min=1,max=5", "empty instance group name prefix supplied"),
            ("mig:min=1,max=5", "empty instance group name prefix supplied"),
            (
                "mig:namePrefix=pool,min=6,max=5",
                "minimum size 6 is greater than maximum size 5",
            ),
            ("mig:namePrefix=pool,min=0,max=0", "maximum size 0 must be at least 1"),
            (
                "mig:namePrefix=pool,size=3",
                "unsupported key \"size\" is specified for mig-auto-discovery \"namePrefix=pool,size=3\". Supported keys are \"namePrefix, min, max\"",
            ),
        ];
        for (spec, expected) in cases {
            assert_eq!(message(MigAutoDiscoveryConfig::parse(spec).unwrap_err()), expected, "{spec}");
        }
    }

    #[test]
    fn label_discovery_defaults() {
        let config = MigAutoDiscoveryConfig::parse("label:team=infra,tier=batch").unwrap();
        assert!(config.is_label_based());
        assert_eq!(config.labels.len(), 2);
        assert_eq!((config.min_size, config.max_size), (0, 1000));
        assert!(config.re.is_match("anything"));

        assert!(message(MigAutoDiscoveryConfig::parse("label:team").unwrap_err())
            .starts_with("invalid label key=value pair"));
    }

    #[test]
    fn spec_lists_mix_rules_carefully() {
        let specs = |v: &[&str]| v.iter().map(|s| s.to_string()).collect::<Vec<_>>();

        let prefixes =
            parse_mig_auto_discovery_specs(&specs(&["mig:namePrefix=a,max=3", "mig:namePrefix=b,max=3"]))
                .unwrap();
        assert_eq!(prefixes.len(), 2);

        assert_eq!(
            message(
                parse_mig_auto_discovery_specs(&specs(&["label:a=b", "label:c=d"])).unwrap_err()
            ),
            "more than 1 label-based entry found in NodeGroupAutoDiscoverySpecs"
        );
        for mixed in [
            ["label:a=b", "mig:namePrefix=a,max=3"],
            ["mig:namePrefix=a,max=3", "label:a=b"],
        ] {
            assert_eq!(
                message(parse_mig_auto_discovery_specs(&specs(&mixed)).unwrap_err()),
                "label-based and name-prefix-based entries are both specified in NodeGroupAutoDiscoverySpecs"
            );
        }
    }
}
