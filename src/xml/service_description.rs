//! SCPD (Service Control Protocol Description) XML parsing: actions and state variables
//! declared by a service. Feeds [`crate::tree::TreeBuilder`], since services here are declared
//! by a parsed document rather than a fixed Rust trait impl.

use anyhow::Context;
use quick_xml::events::{BytesStart, Event};

use crate::action::{Action, Argument, ArgumentDirection};
use crate::service_variables::{DataType, Eventing, Range, StateVariableDef, Value};
use crate::{FromXml, XmlReaderExt};

#[derive(Debug)]
pub struct ServiceDescriptionDocument {
    pub actions: Vec<Action>,
    pub variables: Vec<StateVariableDef>,
}

impl<'a> FromXml<'a> for ServiceDescriptionDocument {
    fn read_xml(r: &mut quick_xml::Reader<&'a [u8]>) -> anyhow::Result<Self> {
        let scpd = r.read_to_start()?.into_owned();
        anyhow::ensure!(scpd.local_name().as_ref() == b"scpd", "expected <scpd>");
        let end = scpd.to_end().into_owned();
        let mut actions = Vec::new();
        let mut variables = Vec::new();
        loop {
            match r.read_event_err_eof()?.into_owned() {
                Event::Start(e) => match e.local_name().as_ref() {
                    b"specVersion" => {
                        r.read_to_end(e.name())?;
                    }
                    b"actionList" => actions = read_action_list(r, &e)?,
                    b"serviceStateTable" => variables = read_state_table(r, &e)?,
                    _ => {
                        r.read_to_end(e.name())?;
                    }
                },
                Event::End(e) if e == end => break,
                _ => {}
            }
        }
        Ok(Self { actions, variables })
    }
}

fn read_action_list<'a>(
    r: &mut quick_xml::Reader<&'a [u8]>,
    list_start: &BytesStart<'a>,
) -> anyhow::Result<Vec<Action>> {
    let list_end = list_start.to_end().into_owned();
    let mut actions = Vec::new();
    loop {
        match r.read_event_err_eof()?.into_owned() {
            Event::Start(e) if e.local_name().as_ref() == b"action" => {
                actions.push(read_action(r, &e)?);
            }
            Event::End(e) if e == list_end => break,
            _ => {}
        }
    }
    Ok(actions)
}

fn read_action<'a>(
    r: &mut quick_xml::Reader<&'a [u8]>,
    start: &BytesStart<'a>,
) -> anyhow::Result<Action> {
    let end = start.to_end().into_owned();
    let mut action: Option<Action> = None;
    loop {
        match r.read_event_err_eof()?.into_owned() {
            Event::Start(e) if e.local_name().as_ref() == b"name" => {
                let text = r.read_text(e.name())?.to_string();
                action = Some(Action::new(text));
            }
            Event::Start(e) if e.local_name().as_ref() == b"argumentList" => {
                let mut current = action.take().context("argumentList appeared before name")?;
                let list_end = e.to_end().into_owned();
                loop {
                    match r.read_event_err_eof()?.into_owned() {
                        Event::Start(arg) if arg.local_name().as_ref() == b"argument" => {
                            let (direction, argument) = read_argument(r, &arg)?;
                            current = match direction {
                                ArgumentDirection::In => current.with_input(argument),
                                ArgumentDirection::Out => current.with_output(argument),
                            };
                        }
                        Event::End(e) if e == list_end => break,
                        _ => {}
                    }
                }
                action = Some(current);
            }
            Event::End(e) if e == end => break,
            _ => {}
        }
    }
    action.context("action missing <name>")
}

fn read_argument<'a>(
    r: &mut quick_xml::Reader<&'a [u8]>,
    start: &BytesStart<'a>,
) -> anyhow::Result<(ArgumentDirection, Argument)> {
    let end = start.to_end().into_owned();
    let mut name = None;
    let mut direction = None;
    let mut related = None;
    loop {
        match r.read_event_err_eof()?.into_owned() {
            Event::Start(e) => {
                let text = r.read_text(e.name())?.to_string();
                match e.local_name().as_ref() {
                    b"name" => name = Some(text),
                    b"direction" => direction = Some(text.parse().context("argument direction")?),
                    b"relatedStateVariable" => related = Some(text),
                    _ => {}
                }
            }
            Event::End(e) if e == end => break,
            _ => {}
        }
    }
    let direction = direction.context("argument missing <direction>")?;
    let argument = Argument::new(
        name.context("argument missing <name>")?,
        direction,
        related.context("argument missing <relatedStateVariable>")?,
    );
    Ok((direction, argument))
}

fn read_state_table<'a>(
    r: &mut quick_xml::Reader<&'a [u8]>,
    list_start: &BytesStart<'a>,
) -> anyhow::Result<Vec<StateVariableDef>> {
    let list_end = list_start.to_end().into_owned();
    let mut variables = Vec::new();
    loop {
        match r.read_event_err_eof()?.into_owned() {
            Event::Start(e) if e.local_name().as_ref() == b"stateVariable" => {
                variables.push(read_state_variable(r, &e)?);
            }
            Event::End(e) if e == list_end => break,
            _ => {}
        }
    }
    Ok(variables)
}

fn read_state_variable<'a>(
    r: &mut quick_xml::Reader<&'a [u8]>,
    start: &BytesStart<'a>,
) -> anyhow::Result<StateVariableDef> {
    let end = start.to_end().into_owned();
    let send_events = start
        .try_get_attribute("sendEvents")?
        .map(|a| a.value.to_vec())
        .unwrap_or_else(|| b"no".to_vec());
    let eventing = match send_events.as_slice() {
        b"yes" => Eventing::Yes,
        _ => Eventing::No,
    };

    let mut name = None;
    let mut data_type = None;
    let mut default_raw = None;
    let mut allowed_values = Vec::new();
    let mut range = None;

    loop {
        match r.read_event_err_eof()?.into_owned() {
            Event::Start(e) => match e.local_name().as_ref() {
                b"name" => name = Some(r.read_text(e.name())?.to_string()),
                b"dataType" => {
                    data_type = Some(r.read_text(e.name())?.to_string().parse().context("dataType")?)
                }
                b"defaultValue" => default_raw = Some(r.read_text(e.name())?.to_string()),
                b"allowedValueList" => {
                    let list_end = e.to_end().into_owned();
                    loop {
                        match r.read_event_err_eof()?.into_owned() {
                            Event::Start(v) if v.local_name().as_ref() == b"allowedValue" => {
                                allowed_values.push(r.read_text(v.name())?.to_string());
                            }
                            Event::End(e) if e == list_end => break,
                            _ => {}
                        }
                    }
                }
                b"allowedValueRange" => {
                    let range_end = e.to_end().into_owned();
                    let mut minimum = None;
                    let mut maximum = None;
                    let mut step = None;
                    loop {
                        match r.read_event_err_eof()?.into_owned() {
                            Event::Start(v) => {
                                let text = r.read_text(v.name())?.to_string();
                                match v.local_name().as_ref() {
                                    b"minimum" => minimum = Some(text.parse().context("range minimum")?),
                                    b"maximum" => maximum = Some(text.parse().context("range maximum")?),
                                    b"step" => step = Some(text.parse().context("range step")?),
                                    _ => {}
                                }
                            }
                            Event::End(e) if e == range_end => break,
                            _ => {}
                        }
                    }
                    range = Some(Range {
                        minimum: minimum.context("allowedValueRange missing minimum")?,
                        maximum: maximum.context("allowedValueRange missing maximum")?,
                        step,
                    });
                }
                _ => {
                    r.read_to_end(e.name())?;
                }
            },
            Event::End(e) if e == end => break,
            _ => {}
        }
    }

    let data_type = data_type.context("stateVariable missing dataType")?;
    let default = default_raw
        .map(|raw| Value::parse(data_type, &raw))
        .transpose()
        .context("parse defaultValue")?;

    Ok(StateVariableDef {
        name: name.context("stateVariable missing name")?,
        data_type,
        eventing,
        default,
        range,
        allowed_values,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &[u8] = br#"<?xml version="1.0"?>
<scpd xmlns="urn:schemas-upnp-org:service-1-0">
  <specVersion><major>1</major><minor>0</minor></specVersion>
  <actionList>
    <action>
      <name>SetTarget</name>
      <argumentList>
        <argument>
          <name>newTargetValue</name>
          <direction>in</direction>
          <relatedStateVariable>Target</relatedStateVariable>
        </argument>
      </argumentList>
    </action>
    <action>
      <name>GetStatus</name>
      <argumentList>
        <argument>
          <name>ResultStatus</name>
          <direction>out</direction>
          <relatedStateVariable>Status</relatedStateVariable>
        </argument>
      </argumentList>
    </action>
  </actionList>
  <serviceStateTable>
    <stateVariable sendEvents="no">
      <name>Target</name>
      <dataType>boolean</dataType>
      <defaultValue>0</defaultValue>
    </stateVariable>
    <stateVariable sendEvents="yes">
      <name>Status</name>
      <dataType>boolean</dataType>
      <defaultValue>0</defaultValue>
    </stateVariable>
  </serviceStateTable>
</scpd>"#;

    #[test]
    fn parses_actions_and_variables() {
        let mut r = quick_xml::Reader::from_reader(SAMPLE);
        let doc = ServiceDescriptionDocument::read_xml(&mut r).unwrap();
        assert_eq!(doc.actions.len(), 2);
        assert_eq!(doc.actions[0].name(), "SetTarget");
        assert_eq!(doc.actions[0].in_arguments()[0].related_state_variable, "Target");
        assert_eq!(doc.actions[1].out_arguments()[0].name(), "ResultStatus");

        assert_eq!(doc.variables.len(), 2);
        let status = doc.variables.iter().find(|v| v.name == "Status").unwrap();
        assert!(status.eventing.is_evented());
        let target = doc.variables.iter().find(|v| v.name == "Target").unwrap();
        assert!(!target.eventing.is_evented());
    }
}
