//! Device-host wide configuration.
//!
//! `HostConfig` is built programmatically with `with_*` builder methods and a struct-literal
//! default, rather than loaded from a file — the embedding application constructs it directly.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use crate::tree::{DeviceFactory, ServiceNode};

const MIN_CACHE_CONTROL_MAX_AGE: Duration = Duration::from_secs(30);
const MAX_CACHE_CONTROL_MAX_AGE: Duration = Duration::from_secs(1800);
const DEFAULT_INDIVIDUAL_ADVERTISEMENT_COUNT: usize = 2;

/// Subscription accept/reject hook: called from the Subscription Manager's create/renew
/// transitions, `is_new` distinguishing initial SUBSCRIBE from renewal.
pub type SubscriptionPolicy = Arc<dyn Fn(&ServiceNode, SocketAddr, bool) -> bool + Send + Sync>;

fn default_subscription_policy() -> SubscriptionPolicy {
    Arc::new(|_service, _peer, _is_new| true)
}

/// Non-loopback IPv4 addresses of every local interface, used as the default
/// `network_interfaces`.
pub fn default_network_interfaces() -> Vec<IpAddr> {
    match get_if_addrs::get_if_addrs() {
        Ok(interfaces) => interfaces
            .into_iter()
            .filter_map(|iface| match iface.ip() {
                IpAddr::V4(addr) if !addr.is_loopback() => Some(IpAddr::V4(addr)),
                _ => None,
            })
            .collect(),
        Err(err) => {
            tracing::warn!("failed to enumerate network interfaces: {err}, falling back to 0.0.0.0");
            vec![IpAddr::V4(Ipv4Addr::UNSPECIFIED)]
        }
    }
}

/// Device-host wide configuration.
#[derive(Clone)]
pub struct HostConfig {
    pub path_to_device_description: String,
    pub device_factory: DeviceFactory,
    /// Reject structurally invalid device/service description XML at build time rather than
    /// hosting it.
    pub strict_parsing: bool,
    pub cache_control_max_age: Duration,
    pub network_interfaces: Vec<IpAddr>,
    pub individual_advertisement_count: usize,
    pub thread_pool_permits: Option<usize>,
    pub subscription_policy: SubscriptionPolicy,
}

impl HostConfig {
    pub fn new(path_to_device_description: impl Into<String>, device_factory: DeviceFactory) -> Self {
        Self {
            path_to_device_description: path_to_device_description.into(),
            device_factory,
            strict_parsing: true,
            cache_control_max_age: MAX_CACHE_CONTROL_MAX_AGE,
            network_interfaces: default_network_interfaces(),
            individual_advertisement_count: DEFAULT_INDIVIDUAL_ADVERTISEMENT_COUNT,
            thread_pool_permits: None,
            subscription_policy: default_subscription_policy(),
        }
    }

    pub fn with_strict_parsing(mut self, strict_parsing: bool) -> Self {
        self.strict_parsing = strict_parsing;
        self
    }

    /// Clamped to [30, 1800] seconds.
    pub fn with_cache_control_max_age(mut self, max_age: Duration) -> Self {
        self.cache_control_max_age = max_age.clamp(MIN_CACHE_CONTROL_MAX_AGE, MAX_CACHE_CONTROL_MAX_AGE);
        self
    }

    pub fn with_network_interfaces(mut self, interfaces: Vec<IpAddr>) -> Self {
        self.network_interfaces = interfaces;
        self
    }

    pub fn with_individual_advertisement_count(mut self, count: usize) -> Self {
        self.individual_advertisement_count = count.max(1);
        self
    }

    pub fn with_thread_pool_permits(mut self, permits: usize) -> Self {
        self.thread_pool_permits = Some(permits);
        self
    }

    pub fn with_subscription_policy(mut self, policy: SubscriptionPolicy) -> Self {
        self.subscription_policy = policy;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::ParsedDeviceHandlers;

    fn factory() -> DeviceFactory {
        Arc::new(|_info| Ok(ParsedDeviceHandlers::new()))
    }

    #[test]
    fn cache_control_max_age_is_clamped() {
        let config = HostConfig::new("description.xml", factory())
            .with_cache_control_max_age(Duration::from_secs(5));
        assert_eq!(config.cache_control_max_age, Duration::from_secs(30));

        let config = HostConfig::new("description.xml", factory())
            .with_cache_control_max_age(Duration::from_secs(100_000));
        assert_eq!(config.cache_control_max_age, Duration::from_secs(1800));
    }

    #[test]
    fn defaults_are_sane() {
        let config = HostConfig::new("description.xml", factory());
        assert!(config.strict_parsing);
        assert_eq!(config.individual_advertisement_count, 2);
        assert_eq!(config.cache_control_max_age, Duration::from_secs(1800));
    }
}
