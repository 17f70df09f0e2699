//! XML snapshot and restore of a chain.
//!
//! ```xml
//! <chain>
//!   <unit id="input.test_pattern" width="640" height="480" pixelformat="RGB24" format_name="640x480 rgb">
//!     <control id="fps">30</control>
//!   </unit>
//!   <unit id="filter.passthrough"/>
//! </chain>
//! ```
//!
//! Format attributes are written only for units with a bound format. On
//! restore they become the unit's preferred-format hint.

use super::Chain;
use crate::error::{Error, Result};
use crate::format::{FormatHint, PixelFormat};
use crate::unit::{ControlValue, UnitHandle, UnitStatus};
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use tracing::{debug, warn};

impl Chain {
    /// Serialize unit ids, bound formats and control values.
    pub fn snapshot(&self) -> Result<String> {
        let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
        writer.write_event(Event::Start(BytesStart::new("chain")))?;

        for unit in &self.units {
            let mut element = BytesStart::new("unit");
            element.push_attribute(("id", unit.id()));
            if let Some(format) = unit.output_format() {
                element.push_attribute(("width", format.width.to_string().as_str()));
                element.push_attribute(("height", format.height.to_string().as_str()));
                element.push_attribute(("pixelformat", format.pixel_format.as_str()));
                element.push_attribute(("format_name", format.name.as_str()));
            }

            if unit.controls().is_empty() {
                writer.write_event(Event::Empty(element))?;
                continue;
            }
            writer.write_event(Event::Start(element))?;
            for control in unit.controls() {
                let mut element = BytesStart::new("control");
                element.push_attribute(("id", control.id()));
                writer.write_event(Event::Start(element))?;
                let value = control.value().to_string();
                writer.write_event(Event::Text(BytesText::new(&value)))?;
                writer.write_event(Event::End(BytesEnd::new("control")))?;
            }
            writer.write_event(Event::End(BytesEnd::new("unit")))?;
        }

        writer.write_event(Event::End(BytesEnd::new("chain")))?;
        String::from_utf8(writer.into_inner()).map_err(|e| Error::Snapshot(e.to_string()))
    }

    /// Replace the chain's units with those described by `xml`.
    ///
    /// Every unit is created through the manager, given its saved format as
    /// a preference and brought to Ready before its controls are applied.
    /// Unknown controls are skipped with a warning.
    pub fn load_from_str(&mut self, xml: &str) -> Result<()> {
        self.remove_all();
        self.set_desired_status(UnitStatus::Ready)?;

        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(true);

        let mut current: Option<UnitHandle> = None;
        let mut control: Option<(String, String)> = None;

        loop {
            match reader.read_event()? {
                Event::Start(e) => match e.name().as_ref() {
                    b"chain" => {}
                    b"unit" => current = Some(self.restore_unit(&e)?),
                    b"control" => control = Some((control_id(&e)?, String::new())),
                    other => return Err(unexpected_element(other)),
                },
                Event::Empty(e) => match e.name().as_ref() {
                    b"chain" => {}
                    b"unit" => {
                        self.restore_unit(&e)?;
                    }
                    b"control" => {
                        let id = control_id(&e)?;
                        self.restore_control(current, &id, "")?;
                    }
                    other => return Err(unexpected_element(other)),
                },
                Event::Text(text) => {
                    if let Some((_, value)) = control.as_mut() {
                        value.push_str(&text.unescape()?);
                    }
                }
                Event::End(e) => match e.name().as_ref() {
                    b"unit" => current = None,
                    b"control" => {
                        if let Some((id, value)) = control.take() {
                            self.restore_control(current, &id, &value)?;
                        }
                    }
                    _ => {}
                },
                Event::Eof => break,
                _ => {}
            }
        }
        debug!(chain = %self.name, units = self.units.len(), "chain restored");
        Ok(())
    }

    fn restore_unit(&mut self, element: &BytesStart<'_>) -> Result<UnitHandle> {
        let mut id = None;
        let mut hint = FormatHint::new();

        for attr in element.attributes() {
            let attr = attr?;
            let value = attr.unescape_value()?;
            match attr.key.as_ref() {
                b"id" => id = Some(value.into_owned()),
                b"width" => hint = hint.with_width(parse_dimension("width", &value)?),
                b"height" => hint = hint.with_height(parse_dimension("height", &value)?),
                b"pixelformat" => {
                    let pixel_format: PixelFormat = value.parse().map_err(|_| {
                        Error::Snapshot(format!("unknown pixel format [{}]", value))
                    })?;
                    hint = hint.with_pixel_format(pixel_format);
                }
                b"format_name" => hint = hint.with_name(value.into_owned()),
                other => {
                    return Err(Error::Snapshot(format!(
                        "unknown unit attribute [{}]",
                        String::from_utf8_lossy(other)
                    )));
                }
            }
        }

        let id = id.ok_or_else(|| Error::Snapshot("unit without an id".into()))?;
        let mut unit = self.create_unit(&id).map_err(|e| {
            warn!(chain = %self.name, id = %id, error = %e, "cannot restore unit");
            Error::Snapshot(format!("cannot instantiate [{}]: {}", id, e))
        })?;
        unit.set_preferred_format(hint);
        self.insert_tail(unit)
    }

    fn restore_control(&mut self, unit: Option<UnitHandle>, id: &str, text: &str) -> Result<()> {
        let unit = unit
            .and_then(|handle| self.unit_mut(handle))
            .ok_or_else(|| Error::Snapshot(format!("control [{}] outside a unit", id)))?;
        let Some(control) = unit.control(id) else {
            warn!(unit = %unit.id(), control = %id, "snapshot names an unknown control, skipping");
            return Ok(());
        };
        let value: ControlValue = control.parse_value(text)?;
        if let Err(e) = unit.set_control(id, value) {
            warn!(unit = %unit.id(), control = %id, error = %e, "cannot restore control value");
        }
        Ok(())
    }
}

fn control_id(element: &BytesStart<'_>) -> Result<String> {
    for attr in element.attributes() {
        let attr = attr?;
        match attr.key.as_ref() {
            b"id" => return Ok(attr.unescape_value()?.into_owned()),
            other => {
                return Err(Error::Snapshot(format!(
                    "unknown control attribute [{}]",
                    String::from_utf8_lossy(other)
                )));
            }
        }
    }
    Err(Error::Snapshot("control without an id".into()))
}

fn parse_dimension(name: &str, value: &str) -> Result<u32> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::Snapshot(format!("invalid {} [{}]", name, value)))
}

fn unexpected_element(name: &[u8]) -> Error {
    Error::Snapshot(format!(
        "unexpected element [{}]",
        String::from_utf8_lossy(name)
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_dimension() {
        assert_eq!(parse_dimension("width", " 640 ").unwrap(), 640);
        assert!(matches!(
            parse_dimension("width", "wide"),
            Err(Error::Snapshot(_))
        ));
    }

    #[test]
    fn test_empty_chain_snapshot() {
        let chain = Chain::new();
        let xml = chain.snapshot().unwrap();
        assert!(xml.starts_with("<chain>"));
        assert!(xml.trim_end().ends_with("</chain>"));
    }

    #[test]
    fn test_load_requires_manager() {
        let mut chain = Chain::new();
        let err = chain
            .load_from_str(r#"<chain><unit id="filter.passthrough"/></chain>"#)
            .unwrap_err();
        assert!(matches!(err, Error::Snapshot(msg) if msg.contains("filter.passthrough")));
    }

    #[test]
    fn test_control_outside_unit_rejected() {
        let mut chain = Chain::new();
        let err = chain
            .load_from_str(r#"<chain><control id="fps">30</control></chain>"#)
            .unwrap_err();
        assert!(matches!(err, Error::Snapshot(_)));
    }
}
