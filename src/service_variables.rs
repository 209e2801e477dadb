//! UPnP data types and runtime state-variable values.
//!
//! `DataType` and `IntoUpnpValue` cover the full UDA type table. [`Value`] and
//! [`StateVariable`] carry a runtime-typed value rather than a generic parameter, since this
//! crate's device tree is built at runtime from a parsed description rather than from
//! compile-time per-service variable types.

use core::str;
use std::fmt;

use anyhow::Context;
use quick_xml::events::{BytesStart, BytesText, Event};
use serde::{Deserialize, Serialize};

use crate::{IntoXml, XmlWriter};

#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub enum DataType {
    Ui1,
    Ui2,
    Ui4,
    Ui8,
    I1,
    I2,
    I4,
    I8,
    Int,
    R4,
    R8,
    Number,
    Float,
    Fixed14_4,
    Char,
    #[default]
    String,
    Date,
    DateTime,
    DateTimeTz,
    Time,
    TimeTz,
    Boolean,
    BinBase64,
    BinHex,
    Uri,
    Uuid,
}

fn parse_bool(str_val: &str) -> anyhow::Result<bool> {
    match str_val {
        "1" | "true" | "yes" => Ok(true),
        "0" | "false" | "no" => Ok(false),
        _ => Err(anyhow::anyhow!("unknown boolean value: {str_val}")),
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataType::Ui1 => "ui1",
            DataType::Ui2 => "ui2",
            DataType::Ui4 => "ui4",
            DataType::Ui8 => "ui8",
            DataType::I1 => "i1",
            DataType::I2 => "i2",
            DataType::I4 => "i4",
            DataType::I8 => "i8",
            DataType::Int => "int",
            DataType::R4 => "r4",
            DataType::R8 => "r8",
            DataType::Number => "number",
            DataType::Float => "float",
            DataType::Fixed14_4 => "fixed.14.4",
            DataType::Char => "char",
            DataType::String => "string",
            DataType::Date => "date",
            DataType::DateTime => "dateTime",
            DataType::DateTimeTz => "dateTime.tz",
            DataType::Time => "time",
            DataType::TimeTz => "time.tz",
            DataType::Boolean => "boolean",
            DataType::BinBase64 => "bin.base64",
            DataType::BinHex => "bin.hex",
            DataType::Uri => "uri",
            DataType::Uuid => "uuid",
        };
        write!(f, "{name}")
    }
}

impl std::str::FromStr for DataType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ui1" => Ok(DataType::Ui1),
            "ui2" => Ok(DataType::Ui2),
            "ui4" => Ok(DataType::Ui4),
            "ui8" => Ok(DataType::Ui8),
            "i1" => Ok(DataType::I1),
            "i2" => Ok(DataType::I2),
            "i4" => Ok(DataType::I4),
            "i8" => Ok(DataType::I8),
            "int" => Ok(DataType::Int),
            "r4" => Ok(DataType::R4),
            "r8" => Ok(DataType::R8),
            "number" => Ok(DataType::Number),
            "fp" | "float" => Ok(DataType::Float),
            "fixed.14.4" => Ok(DataType::Fixed14_4),
            "char" => Ok(DataType::Char),
            "string" => Ok(DataType::String),
            "date" => Ok(DataType::Date),
            "dateTime" => Ok(DataType::DateTime),
            "dateTime.tz" => Ok(DataType::DateTimeTz),
            "time" => Ok(DataType::Time),
            "time.tz" => Ok(DataType::TimeTz),
            "boolean" => Ok(DataType::Boolean),
            "bin.base64" => Ok(DataType::BinBase64),
            "bin.hex" => Ok(DataType::BinHex),
            "uri" => Ok(DataType::Uri),
            "uuid" => Ok(DataType::Uuid),
            data_type => Err(anyhow::anyhow!("unrecognized data type: {data_type}")),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Range {
    pub minimum: f64,
    pub maximum: f64,
    pub step: Option<f64>,
}

impl IntoXml for Range {
    fn write_xml(&self, w: &mut XmlWriter) -> std::io::Result<()> {
        let parent = BytesStart::new("allowedValueRange");
        w.write_event(Event::Start(parent.clone()))?;
        w.create_element("minimum")
            .write_text_content(BytesText::new(&self.minimum.to_string()))?;
        w.create_element("maximum")
            .write_text_content(BytesText::new(&self.maximum.to_string()))?;
        if let Some(step) = self.step {
            w.create_element("step")
                .write_text_content(BytesText::new(&step.to_string()))?;
        }
        w.write_event(Event::End(parent.to_end()))
    }
}

/// Convert types into typed UPnP values and back.
pub trait IntoUpnpValue: IntoXml {
    const TYPE_NAME: DataType = DataType::String;
    fn from_xml_value(value: &str) -> anyhow::Result<Self>
    where
        Self: Sized;
}

macro_rules! impl_int_upnp_value {
    ($ty:ty, $variant:ident, $label:literal) => {
        impl IntoUpnpValue for $ty {
            const TYPE_NAME: DataType = DataType::$variant;
            fn from_xml_value(value: &str) -> anyhow::Result<Self> {
                value.parse().context($label)
            }
        }

        impl IntoXml for $ty {
            fn write_xml(&self, w: &mut XmlWriter) -> std::io::Result<()> {
                w.write_event(Event::Text(BytesText::from_escaped(self.to_string())))
            }
        }
    };
}

impl_int_upnp_value!(u8, Ui1, "parse u8");
impl_int_upnp_value!(u16, Ui2, "parse u16");
impl_int_upnp_value!(u32, Ui4, "parse u32");
impl_int_upnp_value!(u64, Ui8, "parse u64");
impl_int_upnp_value!(i8, I1, "parse i8");
impl_int_upnp_value!(i16, I2, "parse i16");
impl_int_upnp_value!(i32, I4, "parse i32");
impl_int_upnp_value!(i64, I8, "parse i64");

impl IntoUpnpValue for f64 {
    const TYPE_NAME: DataType = DataType::R8;
    fn from_xml_value(value: &str) -> anyhow::Result<Self> {
        value.parse().context("parse f64")
    }
}

impl IntoXml for f64 {
    fn write_xml(&self, w: &mut XmlWriter) -> std::io::Result<()> {
        w.write_event(Event::Text(BytesText::from_escaped(self.to_string())))
    }
}

impl IntoUpnpValue for bool {
    const TYPE_NAME: DataType = DataType::Boolean;
    fn from_xml_value(value: &str) -> anyhow::Result<Self> {
        parse_bool(value)
    }
}

impl IntoXml for bool {
    fn write_xml(&self, w: &mut XmlWriter) -> std::io::Result<()> {
        let val = if *self { "1" } else { "0" };
        w.write_event(Event::Text(BytesText::new(val)))
    }
}

impl IntoUpnpValue for uuid::Uuid {
    const TYPE_NAME: DataType = DataType::Uuid;
    fn from_xml_value(value: &str) -> anyhow::Result<Self> {
        value.parse().context("parse uuid")
    }
}

impl IntoXml for uuid::Uuid {
    fn write_xml(&self, w: &mut XmlWriter) -> std::io::Result<()> {
        w.write_event(Event::Text(BytesText::from_escaped(self.to_string())))
    }
}

impl IntoUpnpValue for String {
    const TYPE_NAME: DataType = DataType::String;
    fn from_xml_value(value: &str) -> anyhow::Result<Self> {
        Ok(value.to_string())
    }
}

impl IntoXml for String {
    fn write_xml(&self, w: &mut XmlWriter) -> std::io::Result<()> {
        w.write_event(Event::Text(BytesText::new(self)))
    }
}

impl IntoUpnpValue for reqwest::Url {
    const TYPE_NAME: DataType = DataType::Uri;
    fn from_xml_value(value: &str) -> anyhow::Result<Self> {
        value.parse().context("parse url")
    }
}

impl IntoXml for reqwest::Url {
    fn write_xml(&self, w: &mut XmlWriter) -> std::io::Result<()> {
        w.write_event(Event::Text(BytesText::new(self.as_str())))
    }
}

impl<T: IntoUpnpValue> IntoUpnpValue for Option<T> {
    fn from_xml_value(value: &str) -> anyhow::Result<Self>
    where
        Self: Sized,
    {
        if value.is_empty() {
            Ok(None)
        } else {
            T::from_xml_value(value).map(Some)
        }
    }
}

impl<T: IntoXml> IntoXml for Option<T> {
    fn write_xml(&self, w: &mut XmlWriter) -> std::io::Result<()> {
        match self {
            Some(v) => v.write_xml(w),
            None => Ok(()),
        }
    }
}

/// Runtime-typed state-variable value, as stored in a [`crate::tree::StateVariableCell`].
///
/// A fixed closed set of Rust primitives rather than an arbitrary `Box<dyn IntoUpnpValue>`:
/// the cell needs to compare old/new values to decide whether a change occurred (§4.F), which
/// an opaque trait object cannot do without also requiring `PartialEq` + `Clone` object safety.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Ui1(u8),
    Ui2(u16),
    Ui4(u32),
    Ui8(u64),
    I1(i8),
    I2(i16),
    I4(i32),
    I8(i64),
    Number(String),
    Boolean(bool),
    Uuid(uuid::Uuid),
    Uri(String),
    String(String),
}

impl Value {
    pub fn data_type(&self) -> DataType {
        match self {
            Value::Ui1(_) => DataType::Ui1,
            Value::Ui2(_) => DataType::Ui2,
            Value::Ui4(_) => DataType::Ui4,
            Value::Ui8(_) => DataType::Ui8,
            Value::I1(_) => DataType::I1,
            Value::I2(_) => DataType::I2,
            Value::I4(_) => DataType::I4,
            Value::I8(_) => DataType::I8,
            Value::Number(_) => DataType::Number,
            Value::Boolean(_) => DataType::Boolean,
            Value::Uuid(_) => DataType::Uuid,
            Value::Uri(_) => DataType::Uri,
            Value::String(_) => DataType::String,
        }
    }

    /// Parse a wire-format string into a [`Value`] of the given declared [`DataType`].
    /// Unsupported/exotic UDA types (date, time, bin.hex, ...) fall back to the opaque
    /// `String` representation — they still round-trip on the wire, they are simply not
    /// range/allowed-value validated the way numeric and boolean types are (§3).
    pub fn parse(data_type: DataType, raw: &str) -> anyhow::Result<Self> {
        Ok(match data_type {
            DataType::Ui1 => Value::Ui1(u8::from_xml_value(raw)?),
            DataType::Ui2 => Value::Ui2(u16::from_xml_value(raw)?),
            DataType::Ui4 => Value::Ui4(u32::from_xml_value(raw)?),
            DataType::Ui8 => Value::Ui8(u64::from_xml_value(raw)?),
            DataType::I1 => Value::I1(i8::from_xml_value(raw)?),
            DataType::I2 => Value::I2(i16::from_xml_value(raw)?),
            DataType::I4 | DataType::Int => Value::I4(i32::from_xml_value(raw)?),
            DataType::I8 => Value::I8(i64::from_xml_value(raw)?),
            DataType::R4 | DataType::R8 | DataType::Number | DataType::Float
            | DataType::Fixed14_4 => {
                raw.parse::<f64>().context("parse numeric value")?;
                Value::Number(raw.to_string())
            }
            DataType::Boolean => Value::Boolean(parse_bool(raw)?),
            DataType::Uuid => Value::Uuid(raw.parse().context("parse uuid")?),
            DataType::Uri => Value::Uri(raw.to_string()),
            _ => Value::String(raw.to_string()),
        })
    }

    /// Validate `self` against a state variable's declared range/allowed-value list (§3).
    pub fn check_allowed(
        &self,
        range: Option<Range>,
        allowed_values: &[String],
    ) -> anyhow::Result<()> {
        if !allowed_values.is_empty() {
            let rendered = self.to_xml_text();
            anyhow::ensure!(
                allowed_values.iter().any(|v| v == &rendered),
                "value {rendered} not in allowed value list"
            );
        }
        if let Some(range) = range {
            let numeric: f64 = match self {
                Value::Ui1(v) => *v as f64,
                Value::Ui2(v) => *v as f64,
                Value::Ui4(v) => *v as f64,
                Value::Ui8(v) => *v as f64,
                Value::I1(v) => *v as f64,
                Value::I2(v) => *v as f64,
                Value::I4(v) => *v as f64,
                Value::I8(v) => *v as f64,
                Value::Number(v) => v.parse().unwrap_or(f64::NAN),
                _ => return Ok(()),
            };
            anyhow::ensure!(
                numeric >= range.minimum && numeric <= range.maximum,
                "value {numeric} out of range [{}, {}]",
                range.minimum,
                range.maximum
            );
        }
        Ok(())
    }

    fn to_xml_text(&self) -> String {
        match self {
            Value::Ui1(v) => v.to_string(),
            Value::Ui2(v) => v.to_string(),
            Value::Ui4(v) => v.to_string(),
            Value::Ui8(v) => v.to_string(),
            Value::I1(v) => v.to_string(),
            Value::I2(v) => v.to_string(),
            Value::I4(v) => v.to_string(),
            Value::I8(v) => v.to_string(),
            Value::Number(v) => v.clone(),
            Value::Boolean(v) => if *v { "1" } else { "0" }.to_string(),
            Value::Uuid(v) => v.to_string(),
            Value::Uri(v) => v.clone(),
            Value::String(v) => v.clone(),
        }
    }
}

impl IntoXml for Value {
    fn write_xml(&self, w: &mut XmlWriter) -> std::io::Result<()> {
        w.write_event(Event::Text(BytesText::new(&self.to_xml_text())))
    }
}

/// Eventing mode of a state variable (§3): `no` is never reported, `yes` is delivered over
/// unicast GENA NOTIFY, `multicast` is reserved for UPnP 1.1's multicast eventing extension
/// (accepted when parsed, not separately transported — this host delivers all evented
/// variables over unicast NOTIFY, matching this crate's Non-goals).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eventing {
    No,
    Yes,
    Multicast,
}

impl Eventing {
    pub fn is_evented(&self) -> bool {
        !matches!(self, Eventing::No)
    }
}

/// Static definition of a state variable, as declared in a service's SCPD.
#[derive(Debug, Clone)]
pub struct StateVariableDef {
    pub name: String,
    pub data_type: DataType,
    pub eventing: Eventing,
    pub default: Option<Value>,
    pub range: Option<Range>,
    pub allowed_values: Vec<String>,
}

impl IntoXml for StateVariableDef {
    fn write_xml(&self, w: &mut XmlWriter) -> std::io::Result<()> {
        let send_events = match self.eventing {
            Eventing::No => "no",
            Eventing::Yes | Eventing::Multicast => "yes",
        };
        let parent =
            BytesStart::new("stateVariable").with_attributes([("sendEvents", send_events)]);
        w.write_event(Event::Start(parent.clone()))?;
        w.create_element("name")
            .write_text_content(BytesText::new(&self.name))?;
        w.create_element("dataType")
            .write_text_content(BytesText::new(&self.data_type.to_string()))?;
        if let Some(default) = &self.default {
            w.create_element("defaultValue")
                .write_inner_content(|w| default.write_xml(w))?;
        }
        if !self.allowed_values.is_empty() {
            w.create_element("allowedValueList").write_inner_content(
                |w| -> quick_xml::Result<()> {
                    for val in &self.allowed_values {
                        w.create_element("allowedValue")
                            .write_text_content(BytesText::new(val))?;
                    }
                    Ok(())
                },
            )?;
        };
        if let Some(range) = self.range {
            range.write_xml(w)?;
        }
        w.write_event(Event::End(parent.to_end()))?;
        Ok(())
    }
}
