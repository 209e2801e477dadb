//! Host-lifecycle-facing failure taxonomy.
//!
//! This is a different error surface than [`crate::action::ActionError`]: that one encodes a
//! per-action UPnP error code returned to a control point inside a SOAP fault. `HostError` is
//! what `init()`/`quit()` and the description/control/eventing HTTP handlers report about
//! themselves (`last_error()`, HTTP status selection).

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostErrorKind {
    NotFound,
    InvalidFormat,
    InvalidDeviceDescription,
    InvalidServiceDescription,
    Communications,
    Timeout,
    AlreadyInitialized,
    InvalidConfiguration,
    ActionFailed,
    Undefined,
}

impl HostErrorKind {
    /// Status code this failure maps to when it escapes an HTTP-facing handler.
    pub fn http_status(&self) -> reqwest::StatusCode {
        use reqwest::StatusCode as S;
        match self {
            HostErrorKind::NotFound => S::NOT_FOUND,
            HostErrorKind::InvalidFormat => S::BAD_REQUEST,
            HostErrorKind::InvalidConfiguration => S::BAD_REQUEST,
            HostErrorKind::InvalidDeviceDescription => S::INTERNAL_SERVER_ERROR,
            HostErrorKind::InvalidServiceDescription => S::INTERNAL_SERVER_ERROR,
            HostErrorKind::Communications => S::INTERNAL_SERVER_ERROR,
            HostErrorKind::Timeout => S::GATEWAY_TIMEOUT,
            HostErrorKind::AlreadyInitialized => S::CONFLICT,
            HostErrorKind::ActionFailed => S::INTERNAL_SERVER_ERROR,
            HostErrorKind::Undefined => S::INTERNAL_SERVER_ERROR,
        }
    }
}

impl fmt::Display for HostErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HostErrorKind::NotFound => "NotFound",
            HostErrorKind::InvalidFormat => "InvalidFormat",
            HostErrorKind::InvalidDeviceDescription => "InvalidDeviceDescription",
            HostErrorKind::InvalidServiceDescription => "InvalidServiceDescription",
            HostErrorKind::Communications => "Communications",
            HostErrorKind::Timeout => "Timeout",
            HostErrorKind::AlreadyInitialized => "AlreadyInitialized",
            HostErrorKind::InvalidConfiguration => "InvalidConfiguration",
            HostErrorKind::ActionFailed => "ActionFailed",
            HostErrorKind::Undefined => "Undefined",
        };
        write!(f, "{name}")
    }
}

#[derive(Debug, Clone)]
pub struct HostError {
    pub kind: HostErrorKind,
    pub description: String,
}

impl HostError {
    pub fn new(kind: HostErrorKind, description: impl Into<String>) -> Self {
        Self {
            kind,
            description: description.into(),
        }
    }

    pub fn not_found(description: impl Into<String>) -> Self {
        Self::new(HostErrorKind::NotFound, description)
    }

    pub fn invalid_device_description(description: impl Into<String>) -> Self {
        Self::new(HostErrorKind::InvalidDeviceDescription, description)
    }

    pub fn invalid_service_description(description: impl Into<String>) -> Self {
        Self::new(HostErrorKind::InvalidServiceDescription, description)
    }

    pub fn already_initialized() -> Self {
        Self::new(HostErrorKind::AlreadyInitialized, "host is already initialized")
    }
}

impl fmt::Display for HostError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.description)
    }
}

impl std::error::Error for HostError {}

impl From<anyhow::Error> for HostError {
    fn from(err: anyhow::Error) -> Self {
        Self {
            kind: HostErrorKind::Undefined,
            description: err.to_string(),
        }
    }
}

impl From<std::io::Error> for HostError {
    fn from(err: std::io::Error) -> Self {
        let kind = match err.kind() {
            std::io::ErrorKind::NotFound => HostErrorKind::NotFound,
            _ => HostErrorKind::Communications,
        };
        Self {
            kind,
            description: err.to_string(),
        }
    }
}
