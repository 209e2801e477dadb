//! SOAP envelope, action descriptors, and argument (de)serialization.
//!
//! `Argument` is a plain runtime record (name + direction + related state-variable name) since
//! actions here are declared by a parsed SCPD document rather than a compile-time Rust type per
//! service.

use std::{collections::HashMap, fmt::Display, future::Future, pin::Pin, str::FromStr, sync::Arc};

use anyhow::Context;
use axum::{http::HeaderMap, response::IntoResponse};
use axum_extra::headers::{self, HeaderMapExt};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use reqwest::StatusCode;

use crate::{
    service_variables::Value, tree::ServiceNode, urn::ResourceType, FromXml, IntoXml, XmlReaderExt,
    XmlWriter,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgumentDirection {
    In,
    Out,
}

impl FromStr for ArgumentDirection {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in" => Ok(Self::In),
            "out" => Ok(Self::Out),
            _ => Err(anyhow::anyhow!("expected in or out, got {s}")),
        }
    }
}

impl From<ArgumentDirection> for &str {
    fn from(value: ArgumentDirection) -> Self {
        match value {
            ArgumentDirection::In => "in",
            ArgumentDirection::Out => "out",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Argument {
    pub name: String,
    pub direction: ArgumentDirection,
    pub related_state_variable: String,
}

impl Argument {
    pub fn new(
        name: impl Into<String>,
        direction: ArgumentDirection,
        related_state_variable: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            direction,
            related_state_variable: related_state_variable.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn write_xml(&self, w: &mut quick_xml::Writer<Vec<u8>>) -> quick_xml::Result<()> {
        let parent = BytesStart::new("argument");
        w.write_event(Event::Start(parent.clone()))?;
        w.create_element("name")
            .write_text_content(BytesText::new(&self.name))?;
        w.create_element("direction")
            .write_text_content(BytesText::new(self.direction.into()))?;
        w.create_element("relatedStateVariable")
            .write_text_content(BytesText::new(&self.related_state_variable))?;
        w.write_event(Event::End(parent.to_end()))
    }
}

/// An action as declared in a service's SCPD: name plus ordered input/output arguments.
/// Output argument order is load-bearing — UPnP mandates the response carries them in
/// declaration order.
#[derive(Debug, Clone)]
pub struct Action {
    pub name: String,
    pub in_arguments: Vec<Argument>,
    pub out_arguments: Vec<Argument>,
}

impl Action {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            in_arguments: Vec::new(),
            out_arguments: Vec::new(),
        }
    }

    pub fn with_input(mut self, arg: Argument) -> Self {
        self.in_arguments.push(arg);
        self
    }

    pub fn with_output(mut self, arg: Argument) -> Self {
        self.out_arguments.push(arg);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn in_arguments(&self) -> &[Argument] {
        &self.in_arguments
    }

    pub fn out_arguments(&self) -> &[Argument] {
        &self.out_arguments
    }

    pub fn input_scanner(&self, input: Vec<InArgumentPayload>) -> ArgumentScanner {
        ArgumentScanner::new(
            input,
            self.in_arguments.iter().map(|a| a.name.clone()).collect(),
        )
    }

    /// Zips declared output arguments with handler-produced values, in declaration order.
    pub fn map_out_arguments(&self, values: Vec<Value>) -> Vec<OutArgumentPayload> {
        if values.len() != self.out_arguments.len() {
            tracing::warn!(
                "mismatched output arguments length from {} action ({}/{})",
                self.name(),
                values.len(),
                self.out_arguments.len(),
            );
        }
        self.out_arguments
            .iter()
            .zip(values)
            .map(|(arg, value)| OutArgumentPayload {
                name: arg.name.clone(),
                value,
            })
            .collect()
    }
}

impl IntoXml for Action {
    fn write_xml(&self, w: &mut XmlWriter) -> quick_xml::Result<()> {
        let parent = BytesStart::new("action");
        w.write_event(Event::Start(parent.clone()))?;
        w.create_element("name")
            .write_text_content(BytesText::new(&self.name))?;

        let argument_list = BytesStart::new("argumentList");
        w.write_event(Event::Start(argument_list.clone()))?;
        for argument in &self.in_arguments {
            argument.write_xml(w)?;
        }
        for argument in &self.out_arguments {
            argument.write_xml(w)?;
        }
        w.write_event(Event::End(argument_list.to_end()))?;

        w.write_event(Event::End(parent.to_end()))
    }
}

#[derive(Debug)]
pub(crate) struct SoapMessage<T> {
    inner: T,
}

impl<T> SoapMessage<T> {
    pub fn new(payload: T) -> Self {
        Self { inner: payload }
    }

    pub fn into_inner(self) -> T {
        self.inner
    }
}

impl<'a, T: FromXml<'a>> SoapMessage<T> {
    pub fn from_xml(raw_xml: &'a [u8]) -> anyhow::Result<Self> {
        use quick_xml::Reader;
        let mut r = Reader::from_reader(raw_xml);

        let envelope = r.read_to_start()?.into_owned();
        anyhow::ensure!(envelope.local_name().as_ref() == b"Envelope");
        let body = r.read_to_start()?.into_owned();
        anyhow::ensure!(body.local_name().as_ref() == b"Body");

        let payload = T::read_xml(&mut r)?;

        r.read_to_end(body.name())?;
        r.read_to_end(envelope.name())?;
        Ok(Self { inner: payload })
    }
}

impl<T: IntoXml> SoapMessage<T> {
    pub fn into_xml(self) -> anyhow::Result<String> {
        use quick_xml::Writer;
        let mut w = Writer::new(Vec::new());
        w.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
        let envelope = BytesStart::new("s:Envelope").with_attributes([
            ("xmlns:s", "http://schemas.xmlsoap.org/soap/envelope/"),
            (
                "s:encodingStyle",
                "http://schemas.xmlsoap.org/soap/encoding/",
            ),
        ]);
        let envelope_end = envelope.to_end().into_owned();
        w.write_event(Event::Start(envelope.clone()))?;

        let body = BytesStart::new("s:Body");
        let body_end = body.to_end().into_owned();
        w.write_event(Event::Start(body))?;

        self.inner.write_xml(&mut w)?;

        w.write_event(Event::End(body_end))?;
        w.write_event(Event::End(envelope_end))?;
        Ok(String::from_utf8(w.into_inner())?)
    }
}

impl<T: IntoXml> IntoResponse for SoapMessage<T> {
    fn into_response(self) -> axum::response::Response {
        let mut header_map = HeaderMap::new();
        header_map.typed_insert(headers::ContentType::xml());
        let body = self.into_xml().expect("serialization not fail");
        (header_map, body).into_response()
    }
}

/// An SCPD action invocation inside a SOAP message, generic over argument payload shape
/// (in/out differ: the request carries raw text, the response carries typed [`Value`]s).
#[derive(Debug, Clone)]
pub struct ActionPayload<T> {
    pub name: String,
    pub arguments: Vec<T>,
}

impl<T> ActionPayload<T> {
    pub fn name(&self) -> &str {
        &self.name
    }
}

#[derive(Debug, Clone)]
pub struct InArgumentPayload {
    pub name: String,
    pub value: String,
}

impl InArgumentPayload {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<'a> FromXml<'a> for ActionPayload<InArgumentPayload> {
    fn read_xml(r: &mut quick_xml::Reader<&'a [u8]>) -> anyhow::Result<Self>
    where
        Self: Sized,
    {
        let action_name_tag = r.read_to_start()?;
        let action_name_tag_end = action_name_tag.to_end().into_owned();
        let action_name = String::from_utf8(action_name_tag.local_name().into_inner().to_vec())?;
        let mut arguments = Vec::new();

        loop {
            let next = r.read_event_err_eof()?.into_owned();
            match next {
                Event::Start(var) => {
                    let name = String::from_utf8(var.local_name().into_inner().to_vec())?;
                    let value = r.read_text(var.name())?.to_string();
                    arguments.push(InArgumentPayload { name, value });
                }
                Event::End(end) if end == action_name_tag_end => break,
                _ => (),
            }
        }

        Ok(Self {
            name: action_name,
            arguments,
        })
    }
}

impl ActionPayload<InArgumentPayload> {
    pub fn arguments_map(&self) -> HashMap<&str, &str> {
        self.arguments
            .iter()
            .map(|a| (a.name.as_str(), a.value.as_str()))
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct OutArgumentPayload {
    pub name: String,
    pub value: Value,
}

impl OutArgumentPayload {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl IntoXml for ActionPayload<OutArgumentPayload> {
    fn write_xml(&self, w: &mut XmlWriter) -> quick_xml::Result<()> {
        let action_name = format!("u:{}", self.name());
        let action = BytesStart::new(&action_name);
        let action_end = action.to_end().into_owned();
        w.write_event(Event::Start(action))?;
        for argument in &self.arguments {
            w.create_element(argument.name())
                .write_inner_content(|w| argument.value.write_xml(w))?;
        }
        w.write_event(Event::End(action_end))
    }
}

/// Helps produce a SOAP action request/response using a single buffer.
/// To produce an action response rather than a request, the action name simply carries a
/// `Response` suffix (as [`ActionResponse`] already does).
pub struct WritableAction {
    w: quick_xml::Writer<Vec<u8>>,
    action_name: String,
}

impl WritableAction {
    pub fn new(action_name: &str, urn: ResourceType) -> quick_xml::Result<Self> {
        let mut w = quick_xml::Writer::new(Vec::new());
        w.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
        let envelope = BytesStart::new("s:Envelope").with_attributes([
            ("xmlns:s", "http://schemas.xmlsoap.org/soap/envelope/"),
            (
                "s:encodingStyle",
                "http://schemas.xmlsoap.org/soap/encoding/",
            ),
        ]);
        w.write_event(Event::Start(envelope))?;
        let body = BytesStart::new("s:Body");
        w.write_event(Event::Start(body))?;

        let action_name = format!("u:{action_name}");
        let urn = urn.to_string();
        let action = BytesStart::new(&action_name).with_attributes([("xmlns:u", urn.as_str())]);
        w.write_event(Event::Start(action))?;

        Ok(Self { w, action_name })
    }

    pub fn write_argument<T: IntoXml>(&mut self, name: &str, argument: T) -> quick_xml::Result<()> {
        self.w
            .create_element(name)
            .write_inner_content(|w| argument.write_xml(w))?;
        Ok(())
    }

    pub fn finish(mut self) -> quick_xml::Result<String> {
        self.w
            .write_event(Event::End(BytesEnd::new(self.action_name.clone())))?;
        self.w
            .write_event(Event::End(BytesEnd::new("s:Body")))?;
        self.w
            .write_event(Event::End(BytesEnd::new("s:Envelope")))?;
        Ok(String::from_utf8(self.w.into_inner())?)
    }
}

#[derive(Debug)]
pub struct ActionResponse {
    pub action_name: String,
    pub service_type: ResourceType,
    pub arguments: Vec<OutArgumentPayload>,
}

impl IntoXml for ActionResponse {
    fn write_xml(&self, w: &mut XmlWriter) -> quick_xml::Result<()> {
        let action = BytesStart::new(format!("u:{}Response", self.action_name))
            .with_attributes([("xmlns:u", self.service_type.to_string().as_str())]);
        let action_end = action.to_end().into_owned();
        w.write_event(Event::Start(action))?;
        for argument in &self.arguments {
            w.create_element(argument.name())
                .write_inner_content(|w| argument.value.write_xml(w))?;
        }
        w.write_event(Event::End(action_end))
    }
}

impl IntoResponse for ActionResponse {
    fn into_response(self) -> axum::response::Response {
        SoapMessage::new(self).into_response()
    }
}

/// A scanner over an action invocation's input arguments, type-checking each against the
/// action's declared parameter names in order. Owns its expected-name list (rather than
/// borrowing the originating [`Action`]) so it carries no lifetime — handlers stored as
/// `'static` boxed closures can accept it directly.
#[derive(Debug)]
pub struct ArgumentScanner {
    payload: std::vec::IntoIter<InArgumentPayload>,
    expected: std::vec::IntoIter<String>,
}

impl ArgumentScanner {
    pub fn new(payload: Vec<InArgumentPayload>, expected_names: Vec<String>) -> Self {
        Self {
            payload: payload.into_iter(),
            expected: expected_names.into_iter(),
        }
    }

    pub fn next<T: crate::service_variables::IntoUpnpValue>(&mut self) -> Result<T, ActionError> {
        let Some(expected_next) = self.expected.next() else {
            return Err(ActionErrorCode::InvalidArguments.into());
        };
        let Some(next) = self.payload.next() else {
            return Err(ActionErrorCode::InvalidArguments.into());
        };
        if next.name() != expected_next {
            return Err(ActionErrorCode::InvalidArguments.into());
        }
        T::from_xml_value(&next.value).map_err(|_| ActionErrorCode::InvalidArguments.into())
    }
}

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Application-supplied action invocation handler. Receives the owning [`ServiceNode`] so it
/// can read/write that service's state variables through [`ServiceNode::set_variable`] — the
/// single path that keeps a write's change signal flowing to the Event Notifier.
pub type ActionHandler = Arc<
    dyn Fn(&ServiceNode, ArgumentScanner) -> BoxFuture<Result<Vec<Value>, ActionError>> + Send + Sync,
>;

#[derive(Debug, Clone, Copy)]
pub enum ActionErrorCode {
    /// No action by that name at this service.
    InvalidAction,
    /// Not enough in args, args in the wrong order, or one or more in args are of the
    /// wrong data type.
    InvalidArguments,
    /// Current state of the service prevents invoking that action.
    ActionFailed,
    /// The argument value is invalid.
    ArgumentInvalid,
    /// An argument value is outside its allowed range/value list.
    ArgumentValueOutOfRange,
    OptionalActionNotImplemented,
    OutOfMemory,
    HumanInterventionRequired,
    StringArgumentTooLong,
    Other(u16),
}

impl ActionErrorCode {
    pub fn code(&self) -> u16 {
        match self {
            ActionErrorCode::InvalidAction => 401,
            ActionErrorCode::InvalidArguments => 402,
            ActionErrorCode::ActionFailed => 501,
            ActionErrorCode::ArgumentInvalid => 600,
            ActionErrorCode::ArgumentValueOutOfRange => 601,
            ActionErrorCode::OptionalActionNotImplemented => 602,
            ActionErrorCode::OutOfMemory => 603,
            ActionErrorCode::HumanInterventionRequired => 604,
            ActionErrorCode::StringArgumentTooLong => 605,
            ActionErrorCode::Other(code) => *code,
        }
    }
}

impl From<ActionErrorCode> for ActionError {
    fn from(code: ActionErrorCode) -> Self {
        Self {
            code,
            description: None,
        }
    }
}

#[derive(Debug)]
pub struct ActionError {
    pub code: ActionErrorCode,
    pub description: Option<String>,
}

impl ActionError {
    pub fn not_implemented() -> Self {
        Self {
            code: ActionErrorCode::OptionalActionNotImplemented,
            description: None,
        }
    }

    pub fn not_found() -> Self {
        Self {
            code: ActionErrorCode::InvalidAction,
            description: None,
        }
    }
}

impl From<anyhow::Error> for ActionError {
    fn from(err: anyhow::Error) -> Self {
        Self {
            code: ActionErrorCode::ActionFailed,
            description: Some(err.to_string()),
        }
    }
}

impl Display for ActionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(description) = &self.description {
            write!(f, "{}: {}", self.code.code(), description)
        } else {
            write!(f, "{}", self.code.code())
        }
    }
}

impl std::error::Error for ActionError {}

impl IntoXml for ActionError {
    fn write_xml(&self, w: &mut XmlWriter) -> quick_xml::Result<()> {
        let parent = BytesStart::new("s:Fault");
        let parent_end = parent.to_end().into_owned();
        w.write_event(Event::Start(parent.clone()))?;

        w.create_element("faultcode")
            .write_text_content(BytesText::new("s:Client"))?;
        w.create_element("faultstring")
            .write_text_content(BytesText::new("UPnPError"))?;
        let detail = BytesStart::new("detail");
        let detail_end = detail.to_end().into_owned();
        w.write_event(Event::Start(detail.clone()))?;

        w.create_element("UPnPError")
            .with_attribute(("xmlns", "urn:schemas-upnp-org:control-1-0"))
            .write_inner_content::<_, quick_xml::Error>(|w| {
                w.create_element("errorCode")
                    .write_text_content(BytesText::new(&self.code.code().to_string()))?;
                if let Some(description) = &self.description {
                    w.create_element("errorDescription")
                        .write_text_content(BytesText::new(description))?;
                }
                Ok(())
            })?;

        w.write_event(Event::End(detail_end))?;
        w.write_event(Event::End(parent_end))
    }
}

impl IntoResponse for ActionError {
    fn into_response(self) -> axum::response::Response {
        let status_code = StatusCode::INTERNAL_SERVER_ERROR;
        let body = SoapMessage::new(self);
        (status_code, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_action_payload_xml() {
        let raw = br#"<?xml version="1.0"?>
<s:Envelope
xmlns:s="http://schemas.xmlsoap.org/soap/envelope/"
s:encodingStyle="http://schemas.xmlsoap.org/soap/encoding/">
<s:Body>
<u:actionName xmlns:u="urn:schemas-upnp-org:service:serviceType:v">
<argumentName>in arg value</argumentName>
<anotherArgument>another value</anotherArgument>
</u:actionName>
</s:Body>
</s:Envelope>"#;
        let payload: SoapMessage<ActionPayload<InArgumentPayload>> =
            SoapMessage::from_xml(raw).unwrap();
        let payload = payload.into_inner();
        assert_eq!(payload.name, "actionName");
        let args = payload.arguments_map();
        assert_eq!(args.get("argumentName"), Some("in arg value").as_ref());
        assert_eq!(args.get("anotherArgument"), Some("another value").as_ref());
    }

    #[test]
    fn action_fault_round_trip_contains_code() {
        let err = ActionError {
            code: ActionErrorCode::InvalidArguments,
            description: Some("bad arg".into()),
        };
        let xml = err.into_string().unwrap();
        assert!(xml.contains("402"));
        assert!(xml.contains("bad arg"));
    }
}
