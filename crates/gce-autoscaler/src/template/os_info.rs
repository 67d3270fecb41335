use derive_more::Display;
use error_stack::Report;
use tracing::error;
use tracing::warn;

use crate::core::errors::AutoscalerError;
use crate::core::errors::AutoscalerResult;
use crate::template::kube_env::KubeEnv;

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperatingSystem {
    #[display("linux")]
    Linux,
    #[display("windows")]
    Windows,
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OsDistribution {
    #[display("cos")]
    Cos,
    #[display("ubuntu")]
    Ubuntu,
    #[display("windows_ltsc")]
    WindowsLtsc,
    #[display("windows_sac")]
    WindowsSac,
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SystemArchitecture {
    #[default]
    #[display("amd64")]
    Amd64,
    #[display("arm64")]
    Arm64,
}

impl SystemArchitecture {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "amd64" => Some(Self::Amd64),
            "arm64" => Some(Self::Arm64),
            _ => None,
        }
    }
}

/// OS facts of the nodes a group produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MigOsInfo {
    pub os: OperatingSystem,
    pub distribution: OsDistribution,
    pub arch: SystemArchitecture,
}

impl Default for MigOsInfo {
    fn default() -> Self {
        Self {
            os: OperatingSystem::Linux,
            distribution: OsDistribution::Cos,
            arch: SystemArchitecture::Amd64,
        }
    }
}

fn kube_env_error(message: String) -> Report<AutoscalerError> {
    Report::new(AutoscalerError::KubeEnv { message })
}

impl MigOsInfo {
    /// Reads `os`, `os_distribution` and `arch` from `AUTOSCALER_ENV_VARS`.
    ///
    /// A missing `os` means linux and a missing distribution means cos; unknown values of either
    /// fail. An unusable `arch` falls back to amd64.
    pub fn from_kube_env(mig_id: &str, kube_env: &KubeEnv) -> AutoscalerResult<Self> {
        let os = match kube_env
            .autoscaler_var("os")
            .map_err(|e| kube_env_error(e.to_string()))?
        {
            None => {
                warn!(mig = %mig_id, "no os defined in AUTOSCALER_ENV_VARS; using default linux");
                OperatingSystem::Linux
            }
            Some(value) => match value.as_str() {
                "linux" => OperatingSystem::Linux,
                "windows" => OperatingSystem::Windows,
                _ => return Err(Report::new(AutoscalerError::UnknownOperatingSystem { value })),
            },
        };

        let distribution = match kube_env
            .autoscaler_var("os_distribution")
            .map_err(|e| kube_env_error(e.to_string()))?
        {
            None => {
                warn!(mig = %mig_id, "no os-distribution defined in AUTOSCALER_ENV_VARS; using default cos");
                OsDistribution::Cos
            }
            Some(value) => match value.as_str() {
                "cos" => OsDistribution::Cos,
                "ubuntu" => OsDistribution::Ubuntu,
                "windows_ltsc" => OsDistribution::WindowsLtsc,
                "windows_sac" => OsDistribution::WindowsSac,
                "cos_containerd" => {
                    warn!("cos_containerd os distribution is deprecated");
                    OsDistribution::Cos
                }
                "ubuntu_containerd" => {
                    warn!("ubuntu_containerd os distribution is deprecated");
                    OsDistribution::Ubuntu
                }
                other => {
                    return Err(kube_env_error(format!(
                        "unexpected os-distribution={other} passed via AUTOSCALER_ENV_VARS"
                    )))
                }
            },
        };

        let arch = match kube_env.autoscaler_var("arch") {
            Ok(Some(value)) => SystemArchitecture::parse(&value).unwrap_or_else(|| {
                error!(mig = %mig_id, "unknown arch {value:?} defined in AUTOSCALER_ENV_VARS, falling back to amd64");
                SystemArchitecture::Amd64
            }),
            Ok(None) => {
                error!(mig = %mig_id, "no arch defined in AUTOSCALER_ENV_VARS, falling back to amd64");
                SystemArchitecture::Amd64
            }
            Err(e) => {
                error!(mig = %mig_id, "Couldn't extract architecture from kube-env, falling back to amd64: {e}");
                SystemArchitecture::Amd64
            }
        };

        Ok(Self {
            os,
            distribution,
            arch,
        })
    }
}
