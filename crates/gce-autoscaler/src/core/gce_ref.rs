//! Canonical references to compute resources.
//!
//! A [`GceRef`] identifies a managed instance group or an instance by `(project, zone, name)`.
//! Two URL shapes are accepted on input (`https://www.googleapis.com/...` and
//! `https://content.googleapis.com/...`); the `content.` form is emitted.

use std::fmt;

use error_stack::Report;

use crate::core::errors::AutoscalerError;
use crate::core::errors::AutoscalerResult;

/// Provider name used in node provider ids.
pub const GCE_PROVIDER_ID_SCHEME: &str = "gce";

const URL_SCHEME: &str = "https";
const DOMAIN_SUFFIX: &str = "googleapis.com/compute/v1/projects/";
const CANONICAL_HOST_PREFIX: &str = "content.";
const LEGACY_HOST_PREFIX: &str = "www.";

/// Reference to an entity in the compute world.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GceRef {
    pub project: String,
    pub zone: String,
    pub name: String,
}

/// Identity of a managed instance group.
pub type GroupRef = GceRef;

/// Identity of a VM.
pub type InstanceRef = GceRef;

impl GceRef {
    pub fn new(project: impl Into<String>, zone: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            zone: zone.into(),
            name: name.into(),
        }
    }

    /// Converts to the string used as `spec.providerID` of a node.
    pub fn to_provider_id(&self) -> String {
        format!(
            "{GCE_PROVIDER_ID_SCHEME}://{}/{}/{}",
            self.project, self.zone, self.name
        )
    }

    /// Parses `gce://<project-id>/<zone>/<name>`.
    pub fn from_provider_id(id: &str) -> AutoscalerResult<Self> {
        let malformed = || {
            Report::new(AutoscalerError::MalformedProviderId {
                id: id.to_string(),
            })
        };
        let rest = id
            .strip_prefix(GCE_PROVIDER_ID_SCHEME)
            .and_then(|rest| rest.strip_prefix("://"))
            .ok_or_else(malformed)?;
        match split_triple(rest) {
            Some((project, zone, name)) => Ok(Self::new(project, zone, name)),
            None => Err(malformed()),
        }
    }

    /// Region of the zone, i.e. the zone without its trailing `-<letter>`.
    pub fn region(&self) -> Option<&str> {
        region_of_zone(&self.zone)
    }
}

impl fmt::Display for GceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.project, self.zone, self.name)
    }
}

/// Returns the zone up to its last `-`.
pub fn region_of_zone(zone: &str) -> Option<&str> {
    zone.rfind('-').map(|ix| &zone[..ix])
}

/// Zonal resource collections a URL may point into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    InstanceGroups,
    InstanceGroupManagers,
    Instances,
}

impl ResourceKind {
    pub const fn segment(self) -> &'static str {
        match self {
            Self::InstanceGroups => "instanceGroups",
            Self::InstanceGroupManagers => "instanceGroupManagers",
            Self::Instances => "instances",
        }
    }
}

/// Parses `https://{www|content}.googleapis.com/compute/v1/projects/<p>/zones/<z>/<kind>/<n>`.
pub fn parse_gce_url(url: &str, kind: ResourceKind) -> AutoscalerResult<GceRef> {
    let (project, zone, found_kind, name) = split_gce_url(url)?;
    if found_kind != kind.segment() {
        return Err(Report::new(AutoscalerError::MalformedUrl {
            url: url.to_string(),
        })
        .attach_printable(format!(
            "expected {} resource, got {found_kind}",
            kind.segment()
        )));
    }
    Ok(GceRef::new(project, zone, name))
}

/// Parses a group URL; both `instanceGroups` and `instanceGroupManagers` collections name the
/// same group.
pub fn parse_mig_url(url: &str) -> AutoscalerResult<GceRef> {
    let (project, zone, kind, name) = split_gce_url(url)?;
    if kind != ResourceKind::InstanceGroups.segment()
        && kind != ResourceKind::InstanceGroupManagers.segment()
    {
        return Err(Report::new(AutoscalerError::MalformedUrl {
            url: url.to_string(),
        })
        .attach_printable(format!("expected instance group resource, got {kind}")));
    }
    Ok(GceRef::new(project, zone, name))
}

pub fn parse_instance_url(url: &str) -> AutoscalerResult<GceRef> {
    parse_gce_url(url, ResourceKind::Instances)
}

pub fn generate_gce_url(r: &GceRef, kind: ResourceKind) -> String {
    format!(
        "{URL_SCHEME}://{CANONICAL_HOST_PREFIX}{DOMAIN_SUFFIX}{}/zones/{}/{}/{}",
        r.project,
        r.zone,
        kind.segment(),
        r.name
    )
}

/// Canonical group URL; this is also the node group id.
pub fn generate_mig_url(r: &GceRef) -> String {
    generate_gce_url(r, ResourceKind::InstanceGroups)
}

pub fn generate_instance_url(r: &GceRef) -> String {
    generate_gce_url(r, ResourceKind::Instances)
}

fn split_gce_url(url: &str) -> AutoscalerResult<(&str, &str, &str, &str)> {
    let malformed = || {
        Report::new(AutoscalerError::MalformedUrl {
            url: url.to_string(),
        })
    };
    let host_and_path = url
        .strip_prefix(URL_SCHEME)
        .and_then(|rest| rest.strip_prefix("://"))
        .ok_or_else(malformed)?;
    let path = host_and_path
        .strip_prefix(CANONICAL_HOST_PREFIX)
        .or_else(|| host_and_path.strip_prefix(LEGACY_HOST_PREFIX))
        .and_then(|rest| rest.strip_prefix(DOMAIN_SUFFIX))
        .ok_or_else(malformed)?;

    let segments: Vec<&str> = path.split('/').collect();
    match segments.as_slice() {
        [project, "zones", zone, kind, name]
            if !project.is_empty() && !zone.is_empty() && !kind.is_empty() && !name.is_empty() =>
        {
            Ok((project, zone, kind, name))
        }
        _ => Err(malformed()),
    }
}

fn split_triple(value: &str) -> Option<(&str, &str, &str)> {
    let mut parts = value.split('/');
    let project = parts.next()?;
    let zone = parts.next()?;
    let name = parts.next()?;
    if parts.next().is_some() || project.is_empty() || zone.is_empty() || name.is_empty() {
        return None;
    }
    Some((project, zone, name))
}
