//! Host Orchestrator: two-phase `init`/`quit` wiring the Device Tree Store, HTTP Server, SSDP
//! Handler/Presence Announcer and Subscription Manager together.
//!
//! Setup state lives behind a `tokio::sync::Mutex` rather than `std::sync::Mutex` since both
//! `init` and `quit` hold it across `.await` points.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::HostConfig;
use crate::error::{HostError, HostErrorKind};
use crate::eventing;
use crate::router;
use crate::ssdp::{SsdpListener, SsdpListenerConfig};
use crate::subscription::SubscriptionManager;
use crate::tree::{DescriptionProvider, DeviceConfig, Tree, TreeBuilder};

const GRACEFUL_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Lifecycle state of a [`DeviceHost`]: `Uninitialised`, `Initialising`, `Initialised`,
/// `Exiting`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HostState {
    Uninitialised,
    Initialising,
    Initialised,
    Exiting,
}

/// Everything torn down in reverse on `quit()`: bound sockets, running timers, the subscriber
/// table. Lives only while `state == Initialised`.
struct Running {
    tree: Arc<Tree>,
    subscriptions: SubscriptionManager,
    http_addrs: Vec<SocketAddr>,
    http_cancellation: CancellationToken,
    http_tasks: Vec<JoinHandle<()>>,
    ssdp_cancellation: CancellationToken,
    ssdp_tasks: Vec<JoinHandle<()>>,
    eventing_cancellation: CancellationToken,
}

/// Top-level device-host handle. One instance binds one device tree (built from
/// `config.path_to_device_description`) to SSDP, HTTP and GENA across every configured
/// interface.
pub struct DeviceHost {
    config: HostConfig,
    state: Mutex<HostState>,
    running: Mutex<Option<Running>>,
    last_error: Mutex<Option<HostError>>,
}

impl DeviceHost {
    pub fn new(config: HostConfig) -> Self {
        Self {
            config,
            state: Mutex::new(HostState::Uninitialised),
            running: Mutex::new(None),
            last_error: Mutex::new(None),
        }
    }

    /// Last top-level error kind reported by `init()`/`quit()`, if any.
    pub async fn last_error(&self) -> Option<HostErrorKind> {
        self.last_error.lock().await.as_ref().map(|e| e.kind)
    }

    pub async fn last_error_description(&self) -> Option<String> {
        self.last_error.lock().await.as_ref().map(|e| e.description.clone())
    }

    async fn fail(&self, err: HostError) -> HostError {
        *self.last_error.lock().await = Some(err.clone());
        err
    }

    /// Bound HTTP `SocketAddr`s, one per configured interface, empty unless `Initialised`.
    pub async fn http_endpoints(&self) -> Vec<SocketAddr> {
        match self.running.lock().await.as_ref() {
            Some(running) => running.http_addrs.clone(),
            None => Vec::new(),
        }
    }

    pub async fn tree(&self) -> Option<Arc<Tree>> {
        self.running.lock().await.as_ref().map(|r| r.tree.clone())
    }

    /// Builds the device tree, binds HTTP and SSDP on every configured interface, and starts the
    /// Presence Announcer. `quit()` is invoked internally on any mid-init failure so a caller
    /// never has to clean up a half-bound host themselves.
    pub async fn init(&self) -> Result<(), HostError> {
        let span = tracing::info_span!("device_host");
        let _enter = span.enter();

        {
            let mut state = self.state.lock().await;
            if *state == HostState::Initialised || *state == HostState::Initialising {
                return Err(self.fail(HostError::already_initialized()).await);
            }
            *state = HostState::Initialising;
        }

        match self.init_inner().await {
            Ok(running) => {
                *self.running.lock().await = Some(running);
                *self.state.lock().await = HostState::Initialised;
                tracing::info!("device host initialised");
                Ok(())
            }
            Err(err) => {
                *self.state.lock().await = HostState::Uninitialised;
                Err(self.fail(err).await)
            }
        }
    }

    async fn init_inner(&self) -> Result<Running, HostError> {
        if self.config.network_interfaces.is_empty() {
            return Err(HostError::new(
                HostErrorKind::InvalidConfiguration,
                "no network interfaces configured",
            ));
        }

        let provider = DescriptionProvider::new(
            std::path::Path::new(&self.config.path_to_device_description)
                .parent()
                .unwrap_or_else(|| std::path::Path::new(".")),
        );
        let description_file_name = std::path::Path::new(&self.config.path_to_device_description)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(&self.config.path_to_device_description)
            .to_string();

        let device_config = DeviceConfig {
            path_to_description: description_file_name,
            factory: self.config.device_factory.clone(),
            strict_parsing: self.config.strict_parsing,
        };

        // HTTP is bound before the tree is built so the bound ports are known and fed into the
        // tree's `locations`; the listener itself can't start accepting until
        // the tree (and thus the router's lookup tables) exists, which is fine since nothing can
        // reach it yet.
        let mut listeners = Vec::with_capacity(self.config.network_interfaces.len());
        for interface in &self.config.network_interfaces {
            let listener = tokio::net::TcpListener::bind((*interface, 0))
                .await
                .map_err(|err| HostError::new(HostErrorKind::Communications, err.to_string()))?;
            listeners.push(listener);
        }
        let http_addrs: Vec<SocketAddr> = listeners
            .iter()
            .map(|l| l.local_addr().expect("bound listener has a local addr"))
            .collect();
        let base_urls: Vec<reqwest::Url> = http_addrs
            .iter()
            .map(|addr| format!("http://{addr}").parse().expect("valid base url"))
            .collect();

        let builder = TreeBuilder::new(&provider, &base_urls);
        let (tree, receivers) = builder.build(&device_config).await.map_err(HostError::from)?;
        let tree = Arc::new(tree);

        let subscriptions = SubscriptionManager::new(self.config.subscription_policy.clone());

        let eventing_cancellation = CancellationToken::new();
        eventing::spawn(
            tree.clone(),
            subscriptions.clone(),
            receivers,
            eventing_cancellation.clone(),
        );

        let http_cancellation = CancellationToken::new();
        let state = router::AppState::new(tree.clone(), subscriptions.clone());
        let app = router::build(state).into_make_service_with_connect_info::<SocketAddr>();
        let mut http_tasks = Vec::with_capacity(listeners.len());
        for listener in listeners {
            let app = app.clone();
            let cancellation = http_cancellation.clone();
            http_tasks.push(tokio::spawn(async move {
                if let Err(err) = axum::serve(listener, app)
                    .with_graceful_shutdown(cancellation.cancelled_owned())
                    .await
                {
                    tracing::error!("http server exited with error: {err}");
                }
            }));
        }

        let ssdp_cancellation = CancellationToken::new();
        let announce_interval = (self.config.cache_control_max_age / 2).max(Duration::from_secs(1));
        let mut ssdp_tasks = Vec::with_capacity(self.config.network_interfaces.len());
        for (interface_index, interface) in self.config.network_interfaces.iter().enumerate() {
            let std::net::IpAddr::V4(v4) = interface else {
                // Non-goal: IPv6 multicast is out of scope; a configured IPv6
                // interface simply gets no SSDP listener rather than failing the whole init.
                tracing::warn!(%interface, "skipping non-IPv4 interface for SSDP (IPv6 multicast is out of scope)");
                continue;
            };
            let listener_config = SsdpListenerConfig {
                ttl: None,
                server: server_header(),
                cache_control_secs: self.config.cache_control_max_age.as_secs() as usize,
                individual_advertisement_count: self.config.individual_advertisement_count,
                boot_id: 1,
                config_id: 1,
                interface_index,
            };
            let mut listener = match SsdpListener::bind(tree.clone(), *v4, listener_config).await {
                Ok(listener) => listener,
                Err(err) => {
                    // Eventing and HTTP are already live at this point (and, since HTTP is
                    // live, subscriptions may already exist) — roll every one of them back
                    // before surfacing the error, in the same reverse order `quit()` uses, so a
                    // failed `init()` never leaves a bound port or running timer behind.
                    subscriptions.shutdown().await;
                    eventing_cancellation.cancel();
                    ssdp_cancellation.cancel();
                    await_with_grace(ssdp_tasks).await;
                    http_cancellation.cancel();
                    await_with_grace(http_tasks).await;
                    return Err(HostError::new(HostErrorKind::Communications, err.to_string()));
                }
            };
            let cancellation = ssdp_cancellation.clone();
            ssdp_tasks.push(tokio::spawn(async move {
                if let Err(err) = listener.listen(cancellation, announce_interval).await {
                    tracing::error!("ssdp listener exited with error: {err}");
                }
            }));
        }

        Ok(Running {
            tree,
            subscriptions,
            http_addrs,
            http_cancellation,
            http_tasks,
            ssdp_cancellation,
            ssdp_tasks,
            eventing_cancellation,
        })
    }

    /// Idempotent teardown: a `quit()` with nothing running is a no-op that reports no error.
    /// Teardown order strictly reverses `init()` — the Presence Announcer's last act inside
    /// `SsdpListener::listen` is sending `ssdp:byebye` before its socket closes, so cancelling
    /// SSDP before HTTP guarantees byebye precedes every bound port closing.
    pub async fn quit(&self) -> Result<(), HostError> {
        let span = tracing::info_span!("device_host");
        let _enter = span.enter();

        let mut state = self.state.lock().await;
        if *state != HostState::Initialised {
            return Ok(());
        }
        *state = HostState::Exiting;
        drop(state);

        let Some(running) = self.running.lock().await.take() else {
            *self.state.lock().await = HostState::Uninitialised;
            return Ok(());
        };

        running.subscriptions.shutdown().await;
        running.eventing_cancellation.cancel();

        running.ssdp_cancellation.cancel();
        await_with_grace(running.ssdp_tasks).await;

        running.http_cancellation.cancel();
        await_with_grace(running.http_tasks).await;

        *self.state.lock().await = HostState::Uninitialised;
        tracing::info!("device host shut down");
        Ok(())
    }
}

async fn await_with_grace(tasks: Vec<JoinHandle<()>>) {
    let join_all = async {
        for task in tasks {
            let _ = task.await;
        }
    };
    if tokio::time::timeout(GRACEFUL_SHUTDOWN_GRACE, join_all).await.is_err() {
        tracing::warn!("workers did not drain within the shutdown grace period");
    }
}

fn server_header() -> String {
    format!(
        "{}/{} UPnP/1.0 upnp-device-host/{}",
        std::env::consts::OS,
        "1.0",
        env!("CARGO_PKG_VERSION")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::{DeviceFactory, ParsedDeviceHandlers};
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::Arc as StdArc;

    async fn write_sample_device(dir: &std::path::Path) {
        tokio::fs::create_dir_all(dir).await.unwrap();
        tokio::fs::write(
            dir.join("description.xml"),
            br#"<?xml version="1.0"?>
<root xmlns="urn:schemas-upnp-org:device-1-0">
  <specVersion><major>1</major><minor>0</minor></specVersion>
  <device>
    <deviceType>urn:schemas-upnp-org:device:BinaryLight:1</deviceType>
    <friendlyName>Lamp</friendlyName>
    <manufacturer>Acme</manufacturer>
    <modelName>Lamp</modelName>
    <UDN>uuid:44444444-4444-4444-4444-444444444444</UDN>
    <serviceList>
      <service>
        <serviceType>urn:schemas-upnp-org:service:SwitchPower:1</serviceType>
        <serviceId>urn:upnp-org:serviceId:SwitchPower</serviceId>
        <SCPDURL>SwitchPower.xml</SCPDURL>
        <controlURL>SwitchPower/control</controlURL>
        <eventSubURL>SwitchPower/event</eventSubURL>
      </service>
    </serviceList>
  </device>
</root>"#,
        )
        .await
        .unwrap();
        tokio::fs::write(
            dir.join("SwitchPower.xml"),
            br#"<?xml version="1.0"?>
<scpd xmlns="urn:schemas-upnp-org:service-1-0">
  <specVersion><major>1</major><minor>0</minor></specVersion>
  <actionList>
    <action>
      <name>SetTarget</name>
      <argumentList>
        <argument><name>newTargetValue</name><direction>in</direction><relatedStateVariable>Target</relatedStateVariable></argument>
      </argumentList>
    </action>
  </actionList>
  <serviceStateTable>
    <stateVariable sendEvents="yes">
      <name>Target</name>
      <dataType>boolean</dataType>
      <defaultValue>0</defaultValue>
    </stateVariable>
  </serviceStateTable>
</scpd>"#,
        )
        .await
        .unwrap();
    }

    fn factory() -> DeviceFactory {
        StdArc::new(|_info| {
            let mut handlers = ParsedDeviceHandlers::new();
            let mut actions = std::collections::HashMap::new();
            let handler: crate::action::ActionHandler = StdArc::new(|_service, _scanner| {
                Box::pin(async move {
                    Ok::<Vec<crate::service_variables::Value>, crate::action::ActionError>(vec![])
                })
            });
            actions.insert("SetTarget".to_string(), handler);
            handlers.insert("SwitchPower".to_string(), actions);
            Ok(handlers)
        })
    }

    async fn test_dir() -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("upnp-host-test-{}", uuid::Uuid::new_v4()));
        write_sample_device(&dir).await;
        dir
    }

    #[tokio::test]
    async fn init_then_quit_leaves_no_bound_ports() {
        let dir = test_dir().await;
        let config = HostConfig::new(dir.join("description.xml").to_string_lossy(), factory())
            .with_network_interfaces(vec![IpAddr::V4(Ipv4Addr::LOCALHOST)]);
        let host = DeviceHost::new(config);

        host.init().await.unwrap();
        assert_eq!(host.http_endpoints().await.len(), 1);

        host.quit().await.unwrap();
        assert!(host.http_endpoints().await.is_empty());

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }

    #[tokio::test]
    async fn double_quit_is_a_noop() {
        let dir = test_dir().await;
        let config = HostConfig::new(dir.join("description.xml").to_string_lossy(), factory())
            .with_network_interfaces(vec![IpAddr::V4(Ipv4Addr::LOCALHOST)]);
        let host = DeviceHost::new(config);

        host.init().await.unwrap();
        host.quit().await.unwrap();
        host.quit().await.unwrap();
    }

    #[tokio::test]
    async fn reinit_while_initialised_is_rejected() {
        let dir = test_dir().await;
        let config = HostConfig::new(dir.join("description.xml").to_string_lossy(), factory())
            .with_network_interfaces(vec![IpAddr::V4(Ipv4Addr::LOCALHOST)]);
        let host = DeviceHost::new(config);

        host.init().await.unwrap();
        let err = host.init().await.unwrap_err();
        assert_eq!(err.kind, HostErrorKind::AlreadyInitialized);

        host.quit().await.unwrap();
    }
}
