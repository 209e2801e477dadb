//! Unique Service Name: `(UDN, resource identifier)`, rendered either as the bare UDN
//! (device-id advertisement) or `UDN::ResourceIdentifier` (type advertisement).
//!
//! Carries an arbitrary [`ResourceType`](crate::urn::ResourceType) so the SSDP handler can
//! enumerate advertisement tuples from the live device tree.

use std::{fmt::Display, str::FromStr};

use anyhow::Context;

use crate::{tree::Udn, urn::ResourceType};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UsnKind {
    RootDevice,
    DeviceUdn,
    ResourceType(ResourceType),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Usn {
    pub udn: Udn,
    pub kind: UsnKind,
}

impl Usn {
    pub fn root_device(udn: Udn) -> Self {
        Self {
            udn,
            kind: UsnKind::RootDevice,
        }
    }

    pub fn device_udn(udn: Udn) -> Self {
        Self {
            udn,
            kind: UsnKind::DeviceUdn,
        }
    }

    pub fn resource(udn: Udn, resource_type: ResourceType) -> Self {
        Self {
            udn,
            kind: UsnKind::ResourceType(resource_type),
        }
    }
}

impl Display for Usn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            UsnKind::RootDevice => write!(f, "{}::upnp:rootdevice", self.udn),
            UsnKind::DeviceUdn => write!(f, "{}", self.udn),
            UsnKind::ResourceType(rt) => write!(f, "{}::{}", self.udn, rt),
        }
    }
}

impl FromStr for Usn {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once("::") {
            Some((udn, "upnp:rootdevice")) => Ok(Self::root_device(udn.parse()?)),
            Some((udn, rest)) => Ok(Self::resource(udn.parse()?, rest.parse()?)),
            None => Ok(Self::device_udn(s.parse().context("parse bare udn")?)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_device_display_round_trip() {
        let udn: Udn = "uuid:11111111-1111-1111-1111-111111111111".parse().unwrap();
        let usn = Usn::root_device(udn);
        let s = usn.to_string();
        assert_eq!(s, "uuid:11111111-1111-1111-1111-111111111111::upnp:rootdevice");
        let parsed: Usn = s.parse().unwrap();
        assert_eq!(parsed, usn);
    }

    #[test]
    fn resource_type_display_round_trip() {
        let udn: Udn = "uuid:11111111-1111-1111-1111-111111111111".parse().unwrap();
        let rt = ResourceType::service("schemas-upnp-org", "ContentDirectory", 1);
        let usn = Usn::resource(udn, rt);
        let s = usn.to_string();
        let parsed: Usn = s.parse().unwrap();
        assert_eq!(parsed, usn);
    }
}
