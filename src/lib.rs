#![doc = include_str!("../README.md")]

/// SOAP envelope, action payload and fault encoding/decoding.
pub mod action;
/// Device-host wide configuration (bound interfaces, cache-control max-age,
/// device factory, subscription policy, ...).
pub mod config;
/// Failure-kind taxonomy surfaced by [`host::DeviceHost`].
pub mod error;
/// GENA eventing: property-set construction and NOTIFY delivery.
pub mod eventing;
/// Two-phase init/quit orchestrator wiring the device tree, HTTP server, SSDP
/// handler and subscription manager together.
pub mod host;
/// Runtime representation of UPnP data types and state-variable values.
pub mod service_variables;
/// Simple Service Discovery Protocol ([SSDP](https://en.wikipedia.org/wiki/Simple_Service_Discovery_Protocol))
/// implementation: presence announcer and M-SEARCH responder.
pub mod ssdp;
/// Per-service subscriber table and per-subscription delivery state machine.
pub mod subscription;
/// Axum router used to serve device/service descriptions and dispatch SOAP control.
pub mod router;
/// In-memory device tree (arena), description loading and tree construction.
pub mod tree;
/// Uniform Resource Name parsing for device/service types, and unique service names.
pub mod urn;
/// Unique Service Name: the pair (UDN, resource identifier) used on the wire.
pub mod usn;
/// Device/service description document (de)serialization.
pub mod xml;

/// Useful utility functions for [Reader](quick_xml::Reader)
pub trait XmlReaderExt<'a> {
    fn read_event_err_eof(&mut self) -> anyhow::Result<quick_xml::events::Event<'a>>;
    fn read_to_start(&mut self) -> anyhow::Result<quick_xml::events::BytesStart<'a>>;
    fn read_to_start_or_empty(
        &mut self,
    ) -> anyhow::Result<(bool, quick_xml::events::BytesStart<'a>)>;
    fn read_end(&mut self) -> anyhow::Result<quick_xml::events::BytesEnd<'a>>;
    fn read_text(&mut self) -> anyhow::Result<quick_xml::events::BytesText<'a>>;
}

impl<'a> XmlReaderExt<'a> for quick_xml::Reader<&'a [u8]> {
    fn read_event_err_eof(&mut self) -> anyhow::Result<quick_xml::events::Event<'a>> {
        let event = self.read_event()?;
        match event {
            quick_xml::events::Event::Eof => Err(anyhow::anyhow!("early eof")),
            _ => Ok(event),
        }
    }
    fn read_to_start(&mut self) -> anyhow::Result<quick_xml::events::BytesStart<'a>> {
        loop {
            let event = self.read_event_err_eof()?.into_owned();
            if let quick_xml::events::Event::Start(e) = event {
                break Ok(e);
            }
        }
    }
    fn read_to_start_or_empty(
        &mut self,
    ) -> anyhow::Result<(bool, quick_xml::events::BytesStart<'a>)> {
        loop {
            let event = self.read_event_err_eof()?.into_owned();
            match event {
                quick_xml::events::Event::Start(e) => break Ok((false, e)),
                quick_xml::events::Event::Empty(e) => break Ok((true, e)),
                _ => (),
            }
        }
    }
    fn read_end(&mut self) -> anyhow::Result<quick_xml::events::BytesEnd<'a>> {
        let event = self.read_event()?;
        match event {
            quick_xml::events::Event::End(e) => Ok(e),
            e => anyhow::bail!("expected end, got {:?}", e),
        }
    }
    fn read_text(&mut self) -> anyhow::Result<quick_xml::events::BytesText<'a>> {
        let event = self.read_event()?;
        match event {
            quick_xml::events::Event::Text(e) => Ok(e),
            e => anyhow::bail!("expected text, got {:?}", e),
        }
    }
}

pub type XmlWriter = quick_xml::Writer<Vec<u8>>;

/// Allows structs to serialize themselves into xml fragments
pub trait IntoXml {
    fn write_xml(&self, w: &mut XmlWriter) -> std::io::Result<()>;

    fn into_string(&self) -> std::io::Result<String> {
        let mut w = quick_xml::Writer::new(Vec::new());
        self.write_xml(&mut w)?;
        Ok(String::from_utf8(w.into_inner()).expect("produced value to be utf-8"))
    }
}

impl std::fmt::Debug for Box<dyn IntoXml> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.into_string().unwrap())
    }
}

/// Allows structs to deserialize themselves from an xml reader
pub trait FromXml<'a> {
    fn read_xml(r: &mut quick_xml::Reader<&'a [u8]>) -> anyhow::Result<Self>
    where
        Self: Sized;
}

impl<T: IntoXml> IntoXml for Vec<T> {
    fn write_xml(&self, w: &mut XmlWriter) -> std::io::Result<()> {
        for el in self {
            el.write_xml(w)?;
        }
        Ok(())
    }
}
