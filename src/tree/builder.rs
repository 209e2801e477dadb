//! Tree Builder: parses a device description and its services' SCPDs, asks an
//! application-supplied factory for action handlers, validates cross-references, and commits
//! the result into a [`Tree`].
//!
//! Parsing happens in two passes: an async pass ([`parse_device`]) walks the description tree
//! fetching SCPDs and owns everything it builds, and a plain synchronous pass ([`commit`])
//! assigns arena keys and wires parent/child/service links. Splitting it this way keeps the
//! recursive descent (which has to be async, since it fetches SCPDs per service) from having to
//! thread a `&mut Tree` borrow through a boxed future across every `.await`.

use std::collections::HashMap;
use std::sync::Arc;

use reqwest::Url;
use tokio::sync::mpsc;

use crate::action::{Action, ActionHandler};
use crate::service_variables::StateVariableDef;
use crate::urn::{ResourceType, ServiceId};
use crate::xml::device_description::{DeviceDescriptionDocument, ParsedDevice, ParsedIcon, ParsedService};
use crate::xml::service_description::ServiceDescriptionDocument;
use crate::FromXml;

use super::provider::DescriptionProvider;
use super::{
    ActionEntry, DeviceKey, DeviceNode, Icon, ServiceKey, ServiceNode, StateChange,
    StateVariableCell, Tree, Udn,
};

/// One parsed service, handed to the [`DeviceFactory`] alongside its sibling services so the
/// application can wire up handlers.
pub struct ParsedServiceInfo<'a> {
    pub service_id: &'a ServiceId,
    pub service_type: &'a ResourceType,
    pub actions: &'a [Action],
    pub variables: &'a [StateVariableDef],
}

/// One parsed device node, handed to the [`DeviceFactory`] — called once per device (root and
/// each embedded device) so a single factory can serve heterogeneous device types in the tree.
pub struct ParsedDeviceInfo<'a> {
    pub device_type: &'a ResourceType,
    pub udn: &'a str,
    pub friendly_name: &'a str,
    pub services: Vec<ParsedServiceInfo<'a>>,
}

/// `service id -> action name -> handler`, produced by the [`DeviceFactory`] for one device.
pub type ParsedDeviceHandlers = HashMap<String, HashMap<String, ActionHandler>>;

/// Application-supplied factory producing action handlers for a parsed device node.
pub type DeviceFactory =
    Arc<dyn Fn(&ParsedDeviceInfo) -> anyhow::Result<ParsedDeviceHandlers> + Send + Sync>;

/// Inputs to [`TreeBuilder::build`].
pub struct DeviceConfig {
    pub path_to_description: String,
    pub factory: DeviceFactory,
    /// Turns any cross-reference warning into a hard
    /// `InvalidDeviceDescription` failure rather than a best-effort skip.
    pub strict_parsing: bool,
}

#[derive(Debug)]
pub enum BuildError {
    InvalidDeviceDescription(String),
    InvalidServiceDescription(String),
    MissingActionHandler(String),
    Io(String),
}

impl std::fmt::Display for BuildError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BuildError::InvalidDeviceDescription(m) => write!(f, "invalid device description: {m}"),
            BuildError::InvalidServiceDescription(m) => write!(f, "invalid service description: {m}"),
            BuildError::MissingActionHandler(m) => write!(f, "missing action handler: {m}"),
            BuildError::Io(m) => write!(f, "{m}"),
        }
    }
}

impl std::error::Error for BuildError {}

impl From<BuildError> for crate::error::HostError {
    fn from(err: BuildError) -> Self {
        use crate::error::{HostError, HostErrorKind};
        match err {
            BuildError::InvalidDeviceDescription(m) => {
                HostError::new(HostErrorKind::InvalidDeviceDescription, m)
            }
            BuildError::InvalidServiceDescription(m) => {
                HostError::new(HostErrorKind::InvalidServiceDescription, m)
            }
            BuildError::MissingActionHandler(m) => {
                HostError::new(HostErrorKind::InvalidDeviceDescription, m)
            }
            BuildError::Io(m) => HostError::new(HostErrorKind::Communications, m),
        }
    }
}

impl From<crate::error::HostError> for BuildError {
    fn from(err: crate::error::HostError) -> Self {
        BuildError::Io(err.to_string())
    }
}

/// Receiving end of each built service's state-change channel, handed to the Event Notifier at
/// host init alongside the built [`Tree`].
pub type ServiceChangeReceivers = Vec<(ServiceKey, mpsc::UnboundedReceiver<StateChange>)>;

struct BuiltService {
    service_id: ServiceId,
    service_type: ResourceType,
    scpd_path: String,
    control_path: String,
    event_path: String,
    actions: HashMap<String, ActionEntry>,
    variables: HashMap<String, StateVariableCell>,
    variable_order: Vec<String>,
    evented: bool,
    scpd_bytes: Arc<[u8]>,
}

struct BuiltDevice {
    udn: Udn,
    device_type: ResourceType,
    friendly_name: String,
    manufacturer: String,
    manufacturer_url: Option<String>,
    model_description: Option<String>,
    model_name: String,
    model_number: Option<String>,
    model_url: Option<String>,
    serial_number: Option<String>,
    icons: Vec<Icon>,
    services: Vec<BuiltService>,
    children: Vec<BuiltDevice>,
    locations: Vec<Url>,
    description_bytes: Option<Arc<[u8]>>,
}

pub struct TreeBuilder<'a> {
    provider: &'a DescriptionProvider,
    base_urls: &'a [Url],
}

impl<'a> TreeBuilder<'a> {
    pub fn new(provider: &'a DescriptionProvider, base_urls: &'a [Url]) -> Self {
        Self { provider, base_urls }
    }

    pub async fn build(
        &self,
        config: &DeviceConfig,
    ) -> Result<(Tree, ServiceChangeReceivers), BuildError> {
        let description_bytes = self.provider.load(&config.path_to_description).await?;
        let doc = DeviceDescriptionDocument::read_xml(&mut quick_xml::Reader::from_reader(
            description_bytes.as_slice(),
        ))
        .map_err(|e| BuildError::InvalidDeviceDescription(e.to_string()))?;
        let description_bytes: Arc<[u8]> = description_bytes.into();

        let built = self
            .parse_device(&doc.device, true, config, Some(description_bytes))
            .await?;

        let mut tree = Tree::default();
        let mut receivers = Vec::new();
        commit(&mut tree, built, None, None, &mut receivers);
        Ok((tree, receivers))
    }

    fn parse_device<'b>(
        &'b self,
        parsed: &'b ParsedDevice,
        is_root: bool,
        config: &'b DeviceConfig,
        description_bytes: Option<Arc<[u8]>>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<BuiltDevice, BuildError>> + 'b>>
    {
        Box::pin(async move {
            let udn: Udn = parsed
                .udn
                .parse()
                .map_err(|e: anyhow::Error| BuildError::InvalidDeviceDescription(e.to_string()))?;
            let path_prefix = format!("/{udn}");

            let mut fetched = Vec::with_capacity(parsed.services.len());
            for service in &parsed.services {
                let scpd_bytes = self
                    .provider
                    .load(&service.scpd_url)
                    .await
                    .map_err(|e| BuildError::InvalidServiceDescription(e.to_string()))?;
                let scpd = ServiceDescriptionDocument::read_xml(&mut quick_xml::Reader::from_reader(
                    scpd_bytes.as_slice(),
                ))
                .map_err(|e| BuildError::InvalidServiceDescription(e.to_string()))?;
                fetched.push((service, scpd, Arc::<[u8]>::from(scpd_bytes)));
            }

            let parsed_services: Vec<ParsedServiceInfo> = fetched
                .iter()
                .map(|(service, scpd, _)| ParsedServiceInfo {
                    service_id: &service.service_id,
                    service_type: &service.service_type,
                    actions: &scpd.actions,
                    variables: &scpd.variables,
                })
                .collect();
            let device_info = ParsedDeviceInfo {
                device_type: &parsed.device_type,
                udn: &parsed.udn,
                friendly_name: &parsed.friendly_name,
                services: parsed_services,
            };
            let mut handlers = (config.factory)(&device_info)
                .map_err(|e| BuildError::MissingActionHandler(e.to_string()))?;

            let mut services = Vec::with_capacity(fetched.len());
            for (service, scpd, scpd_bytes) in fetched {
                services.push(build_service(
                    service,
                    scpd,
                    scpd_bytes,
                    &mut handlers,
                    &path_prefix,
                    config.strict_parsing,
                )?);
            }

            let mut children = Vec::with_capacity(parsed.devices.len());
            for child in &parsed.devices {
                children.push(self.parse_device(child, false, config, None).await?);
            }

            let icons = self.load_icons(&parsed.icons, &path_prefix).await;

            Ok(BuiltDevice {
                udn,
                device_type: parsed.device_type.clone(),
                friendly_name: parsed.friendly_name.clone(),
                manufacturer: parsed.manufacturer.clone(),
                manufacturer_url: parsed.manufacturer_url.clone(),
                model_description: parsed.model_description.clone(),
                model_name: parsed.model_name.clone(),
                model_number: parsed.model_number.clone(),
                model_url: parsed.model_url.clone(),
                serial_number: parsed.serial_number.clone(),
                icons,
                services,
                children,
                locations: if is_root {
                    self.base_urls
                        .iter()
                        .map(|base| join_absolute(base, &format!("{path_prefix}/description.xml")))
                        .collect()
                } else {
                    Vec::new()
                },
                description_bytes,
            })
        })
    }

    async fn load_icons(&self, parsed: &[ParsedIcon], path_prefix: &str) -> Vec<Icon> {
        let mut icons = Vec::with_capacity(parsed.len());
        for (i, icon) in parsed.iter().enumerate() {
            let bytes = self.provider.load(&icon.url).await.unwrap_or_default();
            icons.push(Icon {
                mimetype: icon.mimetype.clone(),
                width: icon.width,
                height: icon.height,
                depth: icon.depth,
                url: format!("{path_prefix}/icons/{i}"),
                bytes: bytes.into(),
            });
        }
        icons
    }
}

fn build_service(
    service: &ParsedService,
    scpd: ServiceDescriptionDocument,
    scpd_bytes: Arc<[u8]>,
    handlers: &mut ParsedDeviceHandlers,
    path_prefix: &str,
    strict_parsing: bool,
) -> Result<BuiltService, BuildError> {
    let mut service_handlers = handlers.remove(&service.service_id.id).unwrap_or_default();

    let mut actions = HashMap::new();
    for action in scpd.actions {
        for arg in action.in_arguments().iter().chain(action.out_arguments()) {
            let declared = scpd
                .variables
                .iter()
                .any(|v| v.name == arg.related_state_variable);
            if !declared && strict_parsing {
                return Err(BuildError::InvalidServiceDescription(format!(
                    "{}: argument {} references undeclared state variable {}",
                    action.name(),
                    arg.name(),
                    arg.related_state_variable
                )));
            }
        }
        let handler = service_handlers.remove(action.name()).ok_or_else(|| {
            BuildError::MissingActionHandler(format!("{}::{}", service.service_id, action.name))
        })?;
        actions.insert(
            action.name.clone(),
            ActionEntry {
                descriptor: action,
                handler,
            },
        );
    }

    let variable_order: Vec<String> = scpd.variables.iter().map(|def| def.name.clone()).collect();
    let variables: HashMap<String, StateVariableCell> = scpd
        .variables
        .into_iter()
        .map(|def| (def.name.clone(), StateVariableCell::new(def)))
        .collect();
    let evented = variables.values().any(|v| v.def.eventing.is_evented());

    Ok(BuiltService {
        service_id: service.service_id.clone(),
        service_type: service.service_type.clone(),
        scpd_path: format!("{path_prefix}/{}", service.scpd_url.trim_start_matches('/')),
        control_path: format!("{path_prefix}/{}", service.control_url.trim_start_matches('/')),
        event_path: format!("{path_prefix}/{}", service.event_sub_url.trim_start_matches('/')),
        actions,
        variables,
        variable_order,
        evented,
        scpd_bytes,
    })
}

fn join_absolute(base: &Url, absolute_path: &str) -> Url {
    base.join(absolute_path).unwrap_or_else(|_| base.clone())
}

/// Assigns arena keys and wires parent/child/service links; plain recursion is fine here since
/// it does no I/O and needs no `.await` (the async/owned-data split this module uses exists
/// precisely so this step can stay synchronous).
fn commit(
    tree: &mut Tree,
    built: BuiltDevice,
    parent: Option<DeviceKey>,
    root: Option<DeviceKey>,
    receivers: &mut ServiceChangeReceivers,
) -> DeviceKey {
    let device_node = DeviceNode {
        key: DeviceKey(0),
        udn: built.udn,
        device_type: built.device_type,
        friendly_name: built.friendly_name,
        manufacturer: built.manufacturer,
        manufacturer_url: built.manufacturer_url,
        model_description: built.model_description,
        model_name: built.model_name,
        model_number: built.model_number,
        model_url: built.model_url,
        serial_number: built.serial_number,
        icons: built.icons,
        parent,
        root: root.unwrap_or(DeviceKey(0)),
        children: Vec::new(),
        services: Vec::new(),
        locations: built.locations,
        description_bytes: built.description_bytes,
    };
    let device_key = tree.push_device(device_node);
    let root_key = root.unwrap_or(device_key);
    tree.device_mut(device_key).root = root_key;

    for service in built.services {
        let (change_tx, change_rx) = mpsc::unbounded_channel();
        let service_node = ServiceNode {
            key: ServiceKey(0),
            device: device_key,
            service_id: service.service_id,
            service_type: service.service_type,
            scpd_path: service.scpd_path,
            control_path: service.control_path,
            event_path: service.event_path,
            actions: service.actions,
            variables: service.variables,
            variable_order: service.variable_order,
            evented: service.evented,
            scpd_bytes: service.scpd_bytes,
            change_tx,
        };
        let service_key = tree.push_service(service_node);
        receivers.push((service_key, change_rx));
        tree.device_mut(device_key).services.push(service_key);
    }

    for child in built.children {
        let child_key = commit(tree, child, Some(device_key), Some(root_key), receivers);
        tree.device_mut(device_key).children.push(child_key);
    }

    device_key
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::ActionError;
    use crate::service_variables::Value;

    fn noop_handler() -> ActionHandler {
        Arc::new(|_service, _scanner| Box::pin(async move { Ok::<Vec<Value>, ActionError>(vec![]) }))
    }

    #[tokio::test]
    async fn builds_single_device_single_service_tree() {
        let dir = std::env::temp_dir().join(format!("upnp-build-test-{}", uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
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
    <UDN>uuid:22222222-2222-2222-2222-222222222222</UDN>
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

        let provider = DescriptionProvider::new(&dir);
        let base_url: Url = "http://192.168.1.10:8080".parse().unwrap();
        let builder = TreeBuilder::new(&provider, std::slice::from_ref(&base_url));

        let factory: DeviceFactory = Arc::new(|_info| {
            let mut handlers = ParsedDeviceHandlers::new();
            let mut actions = HashMap::new();
            actions.insert("SetTarget".to_string(), noop_handler());
            handlers.insert("SwitchPower".to_string(), actions);
            Ok(handlers)
        });

        let config = DeviceConfig {
            path_to_description: "description.xml".to_string(),
            factory,
            strict_parsing: true,
        };

        let (tree, receivers) = builder.build(&config).await.unwrap();
        assert_eq!(receivers.len(), 1);
        let root = tree.roots().next().unwrap();
        assert_eq!(root.friendly_name, "Lamp");
        assert_eq!(root.locations.len(), 1);
        assert!(root.locations[0].as_str().ends_with("/description.xml"));

        let service = tree.service(root.services[0]);
        assert!(service.action("SetTarget").is_some());
        assert!(service.evented);

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }

    #[tokio::test]
    async fn missing_handler_is_a_build_error() {
        let dir = std::env::temp_dir().join(format!("upnp-build-test-{}", uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
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
    <UDN>uuid:33333333-3333-3333-3333-333333333333</UDN>
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
    <action><name>SetTarget</name><argumentList></argumentList></action>
  </actionList>
  <serviceStateTable></serviceStateTable>
</scpd>"#,
        )
        .await
        .unwrap();

        let provider = DescriptionProvider::new(&dir);
        let base_url: Url = "http://192.168.1.10:8080".parse().unwrap();
        let builder = TreeBuilder::new(&provider, std::slice::from_ref(&base_url));
        let factory: DeviceFactory = Arc::new(|_info| Ok(ParsedDeviceHandlers::new()));
        let config = DeviceConfig {
            path_to_description: "description.xml".to_string(),
            factory,
            strict_parsing: true,
        };

        let result = builder.build(&config).await;
        assert!(matches!(result, Err(BuildError::MissingActionHandler(_))));

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }
}
