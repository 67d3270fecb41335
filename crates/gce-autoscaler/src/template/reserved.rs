//! Memory and disk the OS, kernel and kubelet keep for themselves.

use std::collections::BTreeMap;

use tracing::error;
use tracing::warn;

use crate::core::types::GIB;
use crate::core::types::MIB;
use crate::template::os_info::MigOsInfo;
use crate::template::os_info::OperatingSystem;
use crate::template::os_info::OsDistribution;
use crate::template::os_info::SystemArchitecture;
use crate::template::quantity;

const KIB: i64 = 1024;

const KERNEL_RESERVED_RATIO: i64 = 64;
const KERNEL_RESERVED_MEMORY: i64 = 16 * MIB;
const SWIOTLB_THRESHOLD_MEMORY: i64 = 3 * GIB;
const SWIOTLB_RESERVED_MEMORY: i64 = 64 * MIB;
const LOW_MEMORY_THRESHOLD: i64 = 8 * GIB;
const LOW_MEMORY_OFFSET: i64 = 8 * MIB;
const EVICTION_CORRECTION_RATIO: f64 = 0.00175;
const MAX_EVICTION_CORRECTION: f64 = (248 * MIB) as f64;
const UBUNTU_SPECIFIC_OFFSET: i64 = 4 * MIB;
const ARM64_KERNEL_RATIO: f64 = 0.9971;

const DEFAULT_EVICTION_HARD_MEMORY: i64 = 100 * MIB;
const DEFAULT_EVICTION_HARD_EPHEMERAL_STORAGE_RATIO: f64 = 0.1;
const MEMORY_AVAILABLE: &str = "memory.available";
const NODEFS_AVAILABLE: &str = "nodefs.available";

/// Filesystem overhead of ephemeral storage on local SSDs, in KiB, by SSD count.
const COS_LOCAL_SSD_OVERHEAD_KIB: [(i64, i64); 10] = [
    (1, 7_289_472),
    (2, 13_725_224),
    (3, 20_031_312),
    (4, 26_332_924),
    (5, 32_634_536),
    (6, 38_946_604),
    (7, 45_254_008),
    (8, 51_556_096),
    (16, 52_837_800),
    (24, 78_686_620),
];

const UBUNTU_LOCAL_SSD_OVERHEAD_KIB: [(i64, i64); 10] = [
    (1, 7_219_840),
    (2, 13_651_496),
    (3, 19_953_488),
    (4, 26_255_100),
    (5, 32_556_712),
    (6, 38_860_588),
    (7, 45_163_896),
    (8, 51_465_984),
    (16, 52_747_688),
    (24, 78_601_032),
];

/// Computes what the OS keeps out of a node's physical resources.
pub trait ReservedCalculator: Send + Sync {
    /// Memory invisible to the kubelet.
    fn kernel_reserved(&self, os_info: &MigOsInfo, physical_memory: i64) -> i64;

    /// Boot-disk space used by the OS image.
    fn os_reserved_ephemeral_storage(&self, os_info: &MigOsInfo, disk_size: i64) -> i64;
}

/// Reservations of GCE node images.
#[derive(Debug, Clone, Copy, Default)]
pub struct GceReserved;

fn ceil(value: f64) -> i64 {
    value.ceil() as i64
}

impl ReservedCalculator for GceReserved {
    fn kernel_reserved(&self, os_info: &MigOsInfo, physical_memory: i64) -> i64 {
        match os_info.os {
            OperatingSystem::Linux => {
                let mut reserved = physical_memory / KERNEL_RESERVED_RATIO + KERNEL_RESERVED_MEMORY;
                if physical_memory > SWIOTLB_THRESHOLD_MEMORY {
                    reserved += SWIOTLB_RESERVED_MEMORY;
                }
                if physical_memory <= LOW_MEMORY_THRESHOLD {
                    reserved += LOW_MEMORY_OFFSET;
                }
                let correction = (EVICTION_CORRECTION_RATIO * physical_memory as f64)
                    .min(MAX_EVICTION_CORRECTION) as i64;
                match os_info.distribution {
                    OsDistribution::Cos => {
                        reserved += correction;
                        if os_info.arch == SystemArchitecture::Arm64 {
                            reserved = (reserved as f64 * ARM64_KERNEL_RATIO) as i64;
                        }
                    }
                    OsDistribution::Ubuntu => reserved += correction + UBUNTU_SPECIFIC_OFFSET,
                    OsDistribution::WindowsLtsc | OsDistribution::WindowsSac => {}
                }
                reserved
            }
            OperatingSystem::Windows => 0,
        }
    }

    fn os_reserved_ephemeral_storage(&self, os_info: &MigOsInfo, disk_size: i64) -> i64 {
        let disk = disk_size as f64;
        let logs = ceil(0.001 * disk).min(100 * MIB);
        match os_info.distribution {
            OsDistribution::Cos => {
                let mut reserved = ceil(0.015635 * disk) + ceil(4.148 * GIB as f64) + logs;
                if os_info.arch == SystemArchitecture::Arm64 {
                    reserved += 64 * MIB;
                }
                reserved
            }
            OsDistribution::Ubuntu => ceil(0.03083 * disk) + ceil(0.171 * GIB as f64) + logs,
            OsDistribution::WindowsLtsc | OsDistribution::WindowsSac => {
                ceil(0.1133 * GIB as f64) + ceil(0.010 * GIB as f64)
            }
        }
    }
}

/// Bytes lost to the filesystem when ephemeral storage spans `count` local SSDs.
pub fn local_ssd_filesystem_overhead(count: i64, distribution: OsDistribution) -> i64 {
    let table = match distribution {
        OsDistribution::Cos => &COS_LOCAL_SSD_OVERHEAD_KIB,
        OsDistribution::Ubuntu => &UBUNTU_LOCAL_SSD_OVERHEAD_KIB,
        other => {
            error!(distribution = %other, "local SSD filesystem overhead is unknown for this distribution");
            return 0;
        }
    };
    let bucket = match count {
        ..=8 => count,
        9..=16 => 16,
        _ => 24,
    };
    table
        .iter()
        .find(|(disks, _)| *disks == bucket)
        .map(|(_, kib)| kib * KIB)
        .unwrap_or_default()
}

/// Kubelet hard eviction thresholds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvictionHard {
    pub memory: i64,
    pub ephemeral_storage_ratio: f64,
}

impl Default for EvictionHard {
    fn default() -> Self {
        Self {
            memory: DEFAULT_EVICTION_HARD_MEMORY,
            ephemeral_storage_ratio: DEFAULT_EVICTION_HARD_EPHEMERAL_STORAGE_RATIO,
        }
    }
}

impl EvictionHard {
    /// `memory.available` as a quantity and `nodefs.available` as a percentage; anything missing
    /// or unparsable keeps its default.
    pub fn parse_or_default(values: &BTreeMap<String, String>) -> Self {
        let mut eviction = Self::default();
        if let Some(memory) = values.get(MEMORY_AVAILABLE) {
            match quantity::parse_value(memory) {
                Ok(bytes) => eviction.memory = bytes,
                Err(e) => warn!("cannot parse {MEMORY_AVAILABLE}={memory:?}, using default: {e}"),
            }
        }
        if let Some(nodefs) = values.get(NODEFS_AVAILABLE) {
            match nodefs
                .strip_suffix('%')
                .and_then(|percent| percent.parse::<f64>().ok())
            {
                Some(percent) => eviction.ephemeral_storage_ratio = percent / 100.0,
                None => warn!("cannot parse {NODEFS_AVAILABLE}={nodefs:?}, using default"),
            }
        }
        eviction
    }

    pub fn ephemeral_storage(&self, disk_size: i64) -> i64 {
        (self.ephemeral_storage_ratio * disk_size as f64) as i64
    }
}

/// Memory the kubelet reserves on a managed node of the given size.
///
/// 255 MiB below 1 GiB; above that 25% of the first 4 GiB, 20% of the next 4 GiB, 10% of the
/// next 8 GiB, 6% of the next 112 GiB and 2% of the rest.
pub fn kube_reserved_memory(memory: i64) -> i64 {
    if memory < GIB {
        return 255 * MIB;
    }
    bracketed(
        memory,
        &[
            (4 * GIB, 0.25),
            (4 * GIB, 0.20),
            (8 * GIB, 0.10),
            (112 * GIB, 0.06),
            (i64::MAX, 0.02),
        ],
    )
}

/// Millicores the kubelet reserves: 6% of the first core, 1% of the next, 0.5% of the next two
/// and 0.25% of the rest.
pub fn kube_reserved_cpu_milli(cpu_milli: i64) -> i64 {
    bracketed(
        cpu_milli,
        &[(1000, 0.06), (1000, 0.01), (2000, 0.005), (i64::MAX, 0.0025)],
    )
}

fn bracketed(total: i64, brackets: &[(i64, f64)]) -> i64 {
    let mut remaining = total;
    let mut reserved = 0.0;
    for (size, ratio) in brackets {
        if remaining <= 0 {
            break;
        }
        let portion = remaining.min(*size);
        reserved += portion as f64 * ratio;
        remaining -= portion;
    }
    reserved as i64
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    fn linux(distribution: OsDistribution, arch: SystemArchitecture) -> MigOsInfo {
        MigOsInfo {
            os: OperatingSystem::Linux,
            distribution,
            arch,
        }
    }

    #[test]
    fn kernel_reserved_small_cos_node() {
        let info = linux(OsDistribution::Cos, SystemArchitecture::Amd64);
        let physical = 200 * MIB;
        let expected = physical / 64 + 16 * MIB + 8 * MIB + (0.00175 * physical as f64) as i64;
        assert_eq!(GceReserved.kernel_reserved(&info, physical), expected);
    }

    #[test]
    fn kernel_reserved_large_ubuntu_node() {
        let info = linux(OsDistribution::Ubuntu, SystemArchitecture::Amd64);
        let physical = 512 * GIB;
        let expected = physical / 64 + 16 * MIB + 64 * MIB + 248 * MIB + 4 * MIB;
        assert_eq!(GceReserved.kernel_reserved(&info, physical), expected);
    }

    #[test]
    fn kernel_reserved_arm_cos_is_scaled() {
        let amd = GceReserved.kernel_reserved(&linux(OsDistribution::Cos, SystemArchitecture::Amd64), 4 * GIB);
        let arm = GceReserved.kernel_reserved(&linux(OsDistribution::Cos, SystemArchitecture::Arm64), 4 * GIB);
        assert_eq!(arm, (amd as f64 * 0.9971) as i64);
    }

    #[test]
    fn windows_reserves_no_kernel_memory() {
        let info = MigOsInfo {
            os: OperatingSystem::Windows,
            distribution: OsDistribution::WindowsLtsc,
            arch: SystemArchitecture::Amd64,
        };
        assert_eq!(GceReserved.kernel_reserved(&info, 8 * GIB), 0);
        assert_eq!(
            GceReserved.os_reserved_ephemeral_storage(&info, 100 * GIB),
            ceil(0.1133 * GIB as f64) + ceil(0.010 * GIB as f64)
        );
    }

    #[test]
    fn os_reserved_storage_caps_log_space() {
        let info = linux(OsDistribution::Cos, SystemArchitecture::Amd64);
        let disk = 500 * GIB;
        assert_eq!(
            GceReserved.os_reserved_ephemeral_storage(&info, disk),
            ceil(0.015635 * disk as f64) + ceil(4.148 * GIB as f64) + 100 * MIB
        );
    }

    #[test]
    fn local_ssd_overhead_buckets() {
        assert_eq!(
            local_ssd_filesystem_overhead(1, OsDistribution::Cos),
            7_289_472 * 1024
        );
        assert_eq!(
            local_ssd_filesystem_overhead(9, OsDistribution::Ubuntu),
            52_747_688 * 1024
        );
        assert_eq!(
            local_ssd_filesystem_overhead(17, OsDistribution::Cos),
            78_686_620 * 1024
        );
        assert_eq!(local_ssd_filesystem_overhead(2, OsDistribution::WindowsSac), 0);
    }

    #[test]
    fn eviction_hard_from_kube_env_values() {
        let eviction = EvictionHard::parse_or_default(&BTreeMap::from([
            (MEMORY_AVAILABLE.to_string(), "200Mi".to_string()),
            (NODEFS_AVAILABLE.to_string(), "5%".to_string()),
        ]));
        assert_eq!(eviction.memory, 200 * MIB);
        assert_eq!(eviction.ephemeral_storage(1000), 50);

        let fallback = EvictionHard::parse_or_default(&BTreeMap::from([(
            NODEFS_AVAILABLE.to_string(),
            "lots".to_string(),
        )]));
        assert_eq!(fallback, EvictionHard::default());
    }

    #[test]
    fn bracketed_kube_reserved() {
        assert_eq!(kube_reserved_memory(512 * MIB), 255 * MIB);
        assert_eq!(kube_reserved_memory(4 * GIB), GIB);
        assert_eq!(
            kube_reserved_memory(16 * GIB),
            GIB + (0.2 * (4 * GIB) as f64) as i64 + (0.1 * (8 * GIB) as f64) as i64
        );
        assert_eq!(kube_reserved_cpu_milli(1000), 60);
        assert_eq!(kube_reserved_cpu_milli(4000), 60 + 10 + 10);
        assert_eq!(kube_reserved_cpu_milli(8000), 60 + 10 + 10 + 10);
    }
}
