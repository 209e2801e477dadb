//! In-memory device tree: the Device Tree Store.
//!
//! Devices and services live in parallel arenas keyed by stable integer ids rather than an
//! owning parent→child `Rc`/`Arc` graph, so the parent back-reference does not need a second
//! cycle-breaking mechanism. The tree is built once by [`TreeBuilder`] and then read-shared;
//! the only mutable fields afterwards are the per-variable [`StateVariableCell`] value cells.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use anyhow::Context;
use reqwest::Url;
use tokio::sync::{mpsc, RwLock};

use crate::action::{Action, ActionHandler};
use crate::service_variables::{StateVariableDef, Value};
use crate::urn::{ResourceType, ServiceId, VersionMatch};

mod builder;
mod provider;

pub use builder::{
    BuildError, DeviceConfig, DeviceFactory, ParsedDeviceHandlers, ParsedDeviceInfo,
    ParsedServiceInfo, ServiceChangeReceivers, TreeBuilder,
};
pub use provider::DescriptionProvider;

/// Unique Device Name: `uuid:<uuid>`, stable across restarts.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Udn(String);

impl Udn {
    pub fn new(uuid: uuid::Uuid) -> Self {
        Self(format!("uuid:{uuid}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Udn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Udn {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        anyhow::ensure!(s.starts_with("uuid:"), "udn must start with uuid:");
        let uuid: uuid::Uuid = s
            .strip_prefix("uuid:")
            .expect("prefix checked above")
            .parse()
            .context("parse udn uuid")?;
        Ok(Self::new(uuid))
    }
}

/// Arena key for a [`DeviceNode`]. Stable for the lifetime of the hosted tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceKey(usize);

/// Arena key for a [`ServiceNode`]. Stable for the lifetime of the hosted tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceKey(usize);

#[cfg(test)]
impl DeviceKey {
    pub(crate) fn for_test(n: usize) -> Self {
        Self(n)
    }
}

#[cfg(test)]
impl ServiceKey {
    pub(crate) fn for_test(n: usize) -> Self {
        Self(n)
    }
}

#[derive(Debug, Clone)]
pub struct Icon {
    pub mimetype: String,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    /// Path this icon is served under, e.g. `icons/0`.
    pub url: String,
    pub bytes: std::sync::Arc<[u8]>,
}

/// A device node: either a root (no parent) or embedded.
#[derive(Debug)]
pub struct DeviceNode {
    pub key: DeviceKey,
    pub udn: Udn,
    pub device_type: ResourceType,
    pub friendly_name: String,
    pub manufacturer: String,
    pub manufacturer_url: Option<String>,
    pub model_description: Option<String>,
    pub model_name: String,
    pub model_number: Option<String>,
    pub model_url: Option<String>,
    pub serial_number: Option<String>,
    pub icons: Vec<Icon>,
    pub parent: Option<DeviceKey>,
    pub root: DeviceKey,
    pub children: Vec<DeviceKey>,
    pub services: Vec<ServiceKey>,
    /// One description URL per bound interface. Only populated on root
    /// devices — embedded devices are reachable through the root's single description
    /// document.
    pub locations: Vec<Url>,
    /// Cached bytes of the device description document this device's root was parsed from.
    /// Only set on root devices; served verbatim by the HTTP server.
    pub description_bytes: Option<std::sync::Arc<[u8]>>,
}

impl DeviceNode {
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }
}

pub struct ActionEntry {
    pub descriptor: Action,
    pub handler: ActionHandler,
}

/// A single state variable's mutable value cell, individually lock-guarded so that concurrent
/// action handlers touching different variables of the same service never contend.
pub struct StateVariableCell {
    pub def: StateVariableDef,
    value: RwLock<Value>,
}

impl StateVariableCell {
    pub fn new(def: StateVariableDef) -> Self {
        let initial = def
            .default
            .clone()
            .unwrap_or_else(|| Value::parse(def.data_type, "").unwrap_or(Value::String(String::new())));
        Self {
            def,
            value: RwLock::new(initial),
        }
    }

    pub async fn get(&self) -> Value {
        self.value.read().await.clone()
    }

    /// Type/range-validated read-modify-write. Returns the previous value so the caller can
    /// decide whether a `ValueChanged` signal is warranted.
    pub async fn set(&self, new_value: Value) -> anyhow::Result<Value> {
        new_value.check_allowed(self.def.range, &self.def.allowed_values)?;
        let mut guard = self.value.write().await;
        Ok(std::mem::replace(&mut *guard, new_value))
    }
}

impl fmt::Debug for StateVariableCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateVariableCell")
            .field("def", &self.def)
            .finish()
    }
}

/// Emitted on the service's change channel when one of its evented variables is written and
/// actually changes value; consumed by the Event Notifier.
#[derive(Debug, Clone)]
pub struct StateChange {
    pub service: ServiceKey,
    pub variable: String,
}

pub struct ServiceNode {
    pub key: ServiceKey,
    pub device: DeviceKey,
    pub service_id: ServiceId,
    pub service_type: ResourceType,
    /// Request-path (not a full URL — served Host varies per interface) this service's SCPD,
    /// control and event endpoints are reachable under, e.g. `/uuid:.../SwitchPower/scpd.xml`.
    pub scpd_path: String,
    pub control_path: String,
    pub event_path: String,
    pub actions: HashMap<String, ActionEntry>,
    pub variables: HashMap<String, StateVariableCell>,
    /// Variable names in SCPD declaration order — `variables` is a `HashMap` for O(1) lookup,
    /// so this is the only place declaration order survives, and UDA mandates property-sets
    /// list evented variables in that order.
    pub variable_order: Vec<String>,
    pub evented: bool,
    pub scpd_bytes: std::sync::Arc<[u8]>,
    pub(crate) change_tx: mpsc::UnboundedSender<StateChange>,
}

impl ServiceNode {
    pub fn action(&self, name: &str) -> Option<&ActionEntry> {
        self.actions.get(name)
    }

    pub fn variable(&self, name: &str) -> Option<&StateVariableCell> {
        self.variables.get(name)
    }

    /// Evented variable names in declaration order.
    pub fn evented_variable_names(&self) -> impl Iterator<Item = &str> {
        self.variable_order.iter().filter_map(|name| {
            let cell = self.variables.get(name)?;
            cell.def.eventing.is_evented().then_some(name.as_str())
        })
    }

    /// Write a state variable and, if it is evented and the value actually changed, signal the
    /// Event Notifier. This is the single path action handlers use to mutate state.
    pub async fn set_variable(&self, name: &str, new_value: Value) -> anyhow::Result<()> {
        let cell = self
            .variables
            .get(name)
            .with_context(|| format!("no such state variable: {name}"))?;
        let old = cell.set(new_value).await?;
        let new = cell.get().await;
        if cell.def.eventing.is_evented() && old != new {
            // Closed receiver just means no Event Notifier task is currently listening
            // (e.g. mid-shutdown); dropping the change is correct, not an error.
            let _ = self.change_tx.send(StateChange {
                service: self.key,
                variable: name.to_string(),
            });
        }
        Ok(())
    }
}

impl fmt::Debug for ServiceNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceNode")
            .field("key", &self.key)
            .field("service_id", &self.service_id)
            .field("service_type", &self.service_type)
            .field("control_path", &self.control_path)
            .field("evented", &self.evented)
            .finish()
    }
}

/// Lookup scope for [`Tree::find_by_udn`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Root,
    Embedded,
    All,
}

/// The committed, read-mostly device tree. Mutations are confined to (1) the
/// one-shot construction in [`TreeBuilder::build`] and (2) state-variable writes through
/// [`ServiceNode::set_variable`], which lock only the affected cell.
#[derive(Default)]
pub struct Tree {
    devices: Vec<DeviceNode>,
    services: Vec<ServiceNode>,
    roots: Vec<DeviceKey>,
    by_udn: HashMap<Udn, DeviceKey>,
    by_control_url: HashMap<String, ServiceKey>,
    by_event_url: HashMap<String, ServiceKey>,
}

impl Tree {
    pub(crate) fn push_device(&mut self, mut node: DeviceNode) -> DeviceKey {
        let key = DeviceKey(self.devices.len());
        node.key = key;
        self.by_udn.insert(node.udn.clone(), key);
        if node.is_root() {
            self.roots.push(key);
        }
        self.devices.push(node);
        key
    }

    pub(crate) fn push_service(&mut self, mut node: ServiceNode) -> ServiceKey {
        let key = ServiceKey(self.services.len());
        node.key = key;
        self.by_control_url.insert(node.control_path.clone(), key);
        self.by_event_url.insert(node.event_path.clone(), key);
        self.services.push(node);
        key
    }

    pub fn roots(&self) -> impl Iterator<Item = &DeviceNode> {
        self.roots.iter().map(move |k| &self.devices[k.0])
    }

    pub fn device(&self, key: DeviceKey) -> &DeviceNode {
        &self.devices[key.0]
    }

    pub(crate) fn device_mut(&mut self, key: DeviceKey) -> &mut DeviceNode {
        &mut self.devices[key.0]
    }

    pub fn service(&self, key: ServiceKey) -> &ServiceNode {
        &self.services[key.0]
    }

    pub fn all_devices(&self) -> impl Iterator<Item = &DeviceNode> {
        self.devices.iter()
    }

    pub fn all_services(&self) -> impl Iterator<Item = &ServiceNode> {
        self.services.iter()
    }

    /// ∀ hosted root device r: `find_by_udn(r.udn, Root)` returns r exactly once.
    pub fn find_by_udn(&self, udn: &Udn, scope: Scope) -> Option<&DeviceNode> {
        let device = self.by_udn.get(udn).map(|k| &self.devices[k.0])?;
        match scope {
            Scope::All => Some(device),
            Scope::Root if device.is_root() => Some(device),
            Scope::Embedded if !device.is_root() => Some(device),
            _ => None,
        }
    }

    pub fn services_by_type<'a>(
        &'a self,
        resource_type: &'a ResourceType,
        version_match: VersionMatch,
    ) -> impl Iterator<Item = &'a ServiceNode> {
        self.services
            .iter()
            .filter(move |s| s.service_type.matches(resource_type, version_match))
    }

    pub fn service_for_control_path(&self, path: &str) -> Option<&ServiceNode> {
        self.by_control_url.get(path).map(|k| &self.services[k.0])
    }

    pub fn service_for_event_path(&self, path: &str) -> Option<&ServiceNode> {
        self.by_event_url.get(path).map(|k| &self.services[k.0])
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn udn_round_trip() {
        let uuid = uuid::Uuid::new_v4();
        let udn = Udn::new(uuid);
        let s = udn.to_string();
        let parsed: Udn = s.parse().unwrap();
        assert_eq!(parsed, udn);
    }

    #[tokio::test]
    async fn state_variable_cell_rejects_out_of_range() {
        use crate::service_variables::{DataType, Eventing, Range};
        let def = StateVariableDef {
            name: "Brightness".into(),
            data_type: DataType::Ui1,
            eventing: Eventing::No,
            default: Some(Value::Ui1(0)),
            range: Some(Range {
                minimum: 0.0,
                maximum: 100.0,
                step: None,
            }),
            allowed_values: vec![],
        };
        let cell = StateVariableCell::new(def);
        assert!(cell.set(Value::Ui1(50)).await.is_ok());
        assert!(cell.set(Value::Ui1(255)).await.is_err());
    }
}
