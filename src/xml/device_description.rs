//! Device-description XML parsing: the root document and its nested device/service topology.
//!
//! Parses an arbitrary device topology rather than one fixed device profile, since this crate
//! hosts an application-supplied tree. `URLBase` is not supported — descriptions are expected
//! to use relative URLs resolved against the request's own `Host` header, which is what every
//! modern UPnP stack does anyway.

use anyhow::Context;
use quick_xml::events::{BytesStart, Event};

use crate::urn::{ResourceType, ServiceId};
use crate::{FromXml, XmlReaderExt};

/// Parses the body of an element whose start tag the caller already consumed — list items
/// (`<icon>`, `<service>`, nested `<device>`) are read this way since a surrounding loop has
/// to inspect the start tag before it knows which parser to hand the reader to.
trait ReadXmlFrom<'a>: Sized {
    fn read_xml_from(
        r: &mut quick_xml::Reader<&'a [u8]>,
        start: &BytesStart<'a>,
    ) -> anyhow::Result<Self>;
}

/// `<specVersion>` of a description document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpecVersion {
    pub major: u32,
    pub minor: u32,
}

impl<'a> FromXml<'a> for SpecVersion {
    fn read_xml(r: &mut quick_xml::Reader<&'a [u8]>) -> anyhow::Result<Self> {
        let start = r.read_to_start()?.into_owned();
        anyhow::ensure!(
            start.local_name().as_ref() == b"specVersion",
            "expected <specVersion>"
        );
        let mut major = 1;
        let mut minor = 0;
        loop {
            match r.read_event_err_eof()?.into_owned() {
                Event::Start(e) => {
                    let text = r.read_text(e.name())?.to_string();
                    match e.local_name().as_ref() {
                        b"major" => major = text.parse().context("parse specVersion major")?,
                        b"minor" => minor = text.parse().context("parse specVersion minor")?,
                        _ => {}
                    }
                }
                Event::End(end) if end == start.to_end() => break,
                _ => {}
            }
        }
        Ok(SpecVersion { major, minor })
    }
}

#[derive(Debug)]
pub struct DeviceDescriptionDocument {
    pub spec_version: SpecVersion,
    pub device: ParsedDevice,
}

impl<'a> FromXml<'a> for DeviceDescriptionDocument {
    fn read_xml(r: &mut quick_xml::Reader<&'a [u8]>) -> anyhow::Result<Self> {
        let root = r.read_to_start()?.into_owned();
        anyhow::ensure!(
            root.local_name().as_ref() == b"root",
            "expected <root> document element"
        );
        let spec_version = SpecVersion::read_xml(r)?;
        let device = ParsedDevice::read_xml(r).context("parse root <device>")?;
        r.read_to_end(root.name())?;
        Ok(Self { spec_version, device })
    }
}

#[derive(Debug, Clone)]
pub struct ParsedIcon {
    pub mimetype: String,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub url: String,
}

impl<'a> ReadXmlFrom<'a> for ParsedIcon {
    fn read_xml_from(
        r: &mut quick_xml::Reader<&'a [u8]>,
        start: &BytesStart<'a>,
    ) -> anyhow::Result<Self> {
        let end = start.to_end().into_owned();
        let mut mimetype = None;
        let mut width = None;
        let mut height = None;
        let mut depth = None;
        let mut url = None;
        loop {
            match r.read_event_err_eof()?.into_owned() {
                Event::Start(e) => {
                    let text = r.read_text(e.name())?.to_string();
                    match e.local_name().as_ref() {
                        b"mimetype" => mimetype = Some(text),
                        b"width" => width = Some(text.parse().context("parse icon width")?),
                        b"height" => height = Some(text.parse().context("parse icon height")?),
                        b"depth" => depth = Some(text.parse().context("parse icon depth")?),
                        b"url" => url = Some(text),
                        _ => {}
                    }
                }
                Event::End(e) if e == end => break,
                _ => {}
            }
        }
        Ok(ParsedIcon {
            mimetype: mimetype.context("icon missing mimetype")?,
            width: width.context("icon missing width")?,
            height: height.context("icon missing height")?,
            depth: depth.context("icon missing depth")?,
            url: url.context("icon missing url")?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ParsedService {
    pub service_id: ServiceId,
    pub service_type: ResourceType,
    pub scpd_url: String,
    pub control_url: String,
    pub event_sub_url: String,
}

impl<'a> ReadXmlFrom<'a> for ParsedService {
    fn read_xml_from(
        r: &mut quick_xml::Reader<&'a [u8]>,
        start: &BytesStart<'a>,
    ) -> anyhow::Result<Self> {
        let end = start.to_end().into_owned();
        let mut service_type = None;
        let mut service_id = None;
        let mut scpd_url = None;
        let mut control_url = None;
        let mut event_sub_url = None;
        loop {
            match r.read_event_err_eof()?.into_owned() {
                Event::Start(e) => {
                    let text = r.read_text(e.name())?.to_string();
                    match e.local_name().as_ref() {
                        b"serviceType" => {
                            service_type = Some(text.parse().context("parse serviceType")?)
                        }
                        b"serviceId" => {
                            service_id = Some(text.parse().context("parse serviceId")?)
                        }
                        b"SCPDURL" => scpd_url = Some(text),
                        b"controlURL" => control_url = Some(text),
                        b"eventSubURL" => event_sub_url = Some(text),
                        _ => {}
                    }
                }
                Event::End(e) if e == end => break,
                _ => {}
            }
        }
        Ok(ParsedService {
            service_id: service_id.context("service missing serviceId")?,
            service_type: service_type.context("service missing serviceType")?,
            scpd_url: scpd_url.context("service missing SCPDURL")?,
            control_url: control_url.context("service missing controlURL")?,
            event_sub_url: event_sub_url.context("service missing eventSubURL")?,
        })
    }
}

/// A device node as declared in the description document, before it is committed into the
/// live [`crate::tree::Tree`] — `udn` is kept as raw text here; [`crate::tree::TreeBuilder`]
/// parses it into a [`crate::tree::Udn`] so this module does not need to depend on `tree`.
#[derive(Debug)]
pub struct ParsedDevice {
    pub device_type: ResourceType,
    pub udn: String,
    pub friendly_name: String,
    pub manufacturer: String,
    pub manufacturer_url: Option<String>,
    pub model_description: Option<String>,
    pub model_name: String,
    pub model_number: Option<String>,
    pub model_url: Option<String>,
    pub serial_number: Option<String>,
    pub presentation_url: Option<String>,
    pub icons: Vec<ParsedIcon>,
    pub services: Vec<ParsedService>,
    pub devices: Vec<ParsedDevice>,
}

impl<'a> FromXml<'a> for ParsedDevice {
    fn read_xml(r: &mut quick_xml::Reader<&'a [u8]>) -> anyhow::Result<Self> {
        let start = r.read_to_start()?.into_owned();
        anyhow::ensure!(start.local_name().as_ref() == b"device", "expected <device>");
        Self::read_xml_from(r, &start)
    }
}

impl<'a> ReadXmlFrom<'a> for ParsedDevice {
    fn read_xml_from(
        r: &mut quick_xml::Reader<&'a [u8]>,
        start: &BytesStart<'a>,
    ) -> anyhow::Result<Self> {
        let end = start.to_end().into_owned();
        let mut device_type = None;
        let mut udn = None;
        let mut friendly_name = None;
        let mut manufacturer = None;
        let mut manufacturer_url = None;
        let mut model_description = None;
        let mut model_name = None;
        let mut model_number = None;
        let mut model_url = None;
        let mut serial_number = None;
        let mut presentation_url = None;
        let mut icons = Vec::new();
        let mut services = Vec::new();
        let mut devices = Vec::new();

        loop {
            match r.read_event_err_eof()?.into_owned() {
                Event::Start(e) => match e.local_name().as_ref() {
                    b"deviceType" => {
                        device_type = Some(
                            r.read_text(e.name())?
                                .to_string()
                                .parse()
                                .context("deviceType")?,
                        )
                    }
                    b"UDN" => udn = Some(r.read_text(e.name())?.to_string()),
                    b"friendlyName" => friendly_name = Some(r.read_text(e.name())?.to_string()),
                    b"manufacturer" => manufacturer = Some(r.read_text(e.name())?.to_string()),
                    b"manufacturerURL" => {
                        manufacturer_url = Some(r.read_text(e.name())?.to_string())
                    }
                    b"modelDescription" => {
                        model_description = Some(r.read_text(e.name())?.to_string())
                    }
                    b"modelName" => model_name = Some(r.read_text(e.name())?.to_string()),
                    b"modelNumber" => model_number = Some(r.read_text(e.name())?.to_string()),
                    b"modelURL" => model_url = Some(r.read_text(e.name())?.to_string()),
                    b"serialNumber" => serial_number = Some(r.read_text(e.name())?.to_string()),
                    b"presentationURL" => {
                        presentation_url = Some(r.read_text(e.name())?.to_string())
                    }
                    b"iconList" => {
                        let list_end = e.to_end().into_owned();
                        loop {
                            match r.read_event_err_eof()?.into_owned() {
                                Event::Start(item) if item.local_name().as_ref() == b"icon" => {
                                    icons.push(ParsedIcon::read_xml_from(r, &item)?);
                                }
                                Event::End(end) if end == list_end => break,
                                _ => {}
                            }
                        }
                    }
                    b"serviceList" => {
                        let list_end = e.to_end().into_owned();
                        loop {
                            match r.read_event_err_eof()?.into_owned() {
                                Event::Start(item) if item.local_name().as_ref() == b"service" => {
                                    services.push(ParsedService::read_xml_from(r, &item)?);
                                }
                                Event::End(end) if end == list_end => break,
                                _ => {}
                            }
                        }
                    }
                    b"deviceList" => {
                        let list_end = e.to_end().into_owned();
                        loop {
                            match r.read_event_err_eof()?.into_owned() {
                                Event::Start(item) if item.local_name().as_ref() == b"device" => {
                                    devices.push(ParsedDevice::read_xml_from(r, &item)?);
                                }
                                Event::End(end) if end == list_end => break,
                                _ => {}
                            }
                        }
                    }
                    _ => {
                        r.read_to_end(e.name())?;
                    }
                },
                Event::End(e) if e == end => break,
                _ => {}
            }
        }

        Ok(ParsedDevice {
            device_type: device_type.context("device missing deviceType")?,
            udn: udn.context("device missing UDN")?,
            friendly_name: friendly_name.context("device missing friendlyName")?,
            manufacturer: manufacturer.context("device missing manufacturer")?,
            manufacturer_url,
            model_description,
            model_name: model_name.context("device missing modelName")?,
            model_number,
            model_url,
            serial_number,
            presentation_url,
            icons,
            services,
            devices,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &[u8] = br#"<?xml version="1.0"?>
<root xmlns="urn:schemas-upnp-org:device-1-0">
  <specVersion><major>1</major><minor>0</minor></specVersion>
  <device>
    <deviceType>urn:schemas-upnp-org:device:BinaryLight:1</deviceType>
    <friendlyName>Example Lamp</friendlyName>
    <manufacturer>Acme</manufacturer>
    <modelName>Lamp 3000</modelName>
    <UDN>uuid:11111111-1111-1111-1111-111111111111</UDN>
    <iconList>
      <icon>
        <mimetype>image/png</mimetype>
        <width>32</width>
        <height>32</height>
        <depth>24</depth>
        <url>icons/0</url>
      </icon>
    </iconList>
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
</root>"#;

    #[test]
    fn parses_device_with_one_service() {
        let mut r = quick_xml::Reader::from_reader(SAMPLE);
        let doc = DeviceDescriptionDocument::read_xml(&mut r).unwrap();
        assert_eq!(doc.spec_version.major, 1);
        assert_eq!(doc.device.friendly_name, "Example Lamp");
        assert_eq!(doc.device.udn, "uuid:11111111-1111-1111-1111-111111111111");
        assert_eq!(doc.device.icons.len(), 1);
        assert_eq!(doc.device.services.len(), 1);
        assert_eq!(doc.device.services[0].service_id.id, "SwitchPower");
    }
}
