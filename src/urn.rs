//! Resource types and service ids.
//!
//! An open `domain:kind:name:version` shape, since this crate hosts an application-supplied
//! device tree rather than one fixed device profile.

use std::{fmt::Display, str::FromStr};

use anyhow::Context;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Device,
    Service,
}

impl Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ResourceKind::Device => "device",
            ResourceKind::Service => "service",
        };
        write!(f, "{name}")
    }
}

/// `urn:<domain>:(device|service):<name>:<version>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceType {
    pub domain: String,
    pub kind: ResourceKind,
    pub name: String,
    pub version: u32,
}

impl ResourceType {
    pub fn device(domain: impl Into<String>, name: impl Into<String>, version: u32) -> Self {
        Self {
            domain: domain.into(),
            kind: ResourceKind::Device,
            name: name.into(),
            version,
        }
    }

    pub fn service(domain: impl Into<String>, name: impl Into<String>, version: u32) -> Self {
        Self {
            domain: domain.into(),
            kind: ResourceKind::Service,
            name: name.into(),
            version,
        }
    }

    /// Whether `self` (the type a hosted device/service declares) satisfies a query
    /// of `other` under the given [`VersionMatch`] rule. Domain, kind and name must be
    /// identical; only the version comparison varies.
    pub fn matches(&self, other: &ResourceType, version_match: VersionMatch) -> bool {
        if self.domain != other.domain || self.kind != other.kind || self.name != other.name {
            return false;
        }
        match version_match {
            VersionMatch::Exact => self.version == other.version,
            VersionMatch::AtLeast => self.version >= other.version,
            VersionMatch::Any => true,
        }
    }
}

/// UDA version-match rule used when answering `ST:` search targets (§4.G) or resolving
/// `servicesByType` lookups (§4.A).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionMatch {
    Exact,
    AtLeast,
    Any,
}

impl Serialize for ResourceType {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl Display for ResourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "urn:{}:{}:{}:{}",
            self.domain, self.kind, self.name, self.version
        )
    }
}

impl FromStr for ResourceType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(5, ':');
        let urn = parts.next().context("urn prefix")?;
        anyhow::ensure!(urn == "urn", "expected urn prefix, got {urn}");
        let domain = parts.next().context("domain")?.to_string();
        let schema_type = parts.next().context("schema_type")?;
        let name = parts.next().context("service/device name")?.to_string();
        let version = parts
            .next()
            .context("service/device version")?
            .parse()
            .context("parse version")?;
        let kind = match schema_type {
            "device" => ResourceKind::Device,
            "service" => ResourceKind::Service,
            rest => return Err(anyhow::anyhow!("unknown resource kind: {rest}")),
        };
        Ok(ResourceType {
            domain,
            kind,
            name,
            version,
        })
    }
}

/// `urn:<domain>:serviceId:<id>`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceId {
    pub domain: String,
    pub id: String,
}

impl ServiceId {
    pub fn new(domain: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            id: id.into(),
        }
    }
}

impl Display for ServiceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "urn:{}:serviceId:{}", self.domain, self.id)
    }
}

impl FromStr for ServiceId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(4, ':');
        let urn = parts.next().context("urn prefix")?;
        anyhow::ensure!(urn == "urn", "expected urn prefix, got {urn}");
        let domain = parts.next().context("domain")?.to_string();
        let marker = parts.next().context("serviceId marker")?;
        anyhow::ensure!(marker == "serviceId", "expected serviceId marker, got {marker}");
        let id = parts.next().context("service id")?.to_string();
        Ok(ServiceId { domain, id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_type_round_trip() {
        let rt = ResourceType::service("schemas-upnp-org", "ContentDirectory", 1);
        let s = rt.to_string();
        assert_eq!(s, "urn:schemas-upnp-org:service:ContentDirectory:1");
        let parsed: ResourceType = s.parse().unwrap();
        assert_eq!(parsed, rt);
    }

    #[test]
    fn version_match_at_least() {
        let hosted = ResourceType::service("schemas-upnp-org", "ContentDirectory", 2);
        let queried = ResourceType::service("schemas-upnp-org", "ContentDirectory", 1);
        assert!(hosted.matches(&queried, VersionMatch::AtLeast));
        assert!(!hosted.matches(&queried, VersionMatch::Exact));
    }

    #[test]
    fn service_id_round_trip() {
        let id = ServiceId::new("schemas-upnp-org", "ContentDirectory");
        let s = id.to_string();
        assert_eq!(s, "urn:schemas-upnp-org:serviceId:ContentDirectory");
        let parsed: ServiceId = s.parse().unwrap();
        assert_eq!(parsed, id);
    }
}
