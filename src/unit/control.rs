//! Typed unit controls.
//!
//! A control is a named, typed parameter owned by a unit (exposure, frame
//! rate, test pattern...). Changing one goes through the owning unit's
//! validator, which may accept, coerce or reject the proposed value before
//! it is committed.

use crate::error::{Error, Result};
use std::fmt;

/// Value of a control.
#[derive(Clone, Debug, PartialEq)]
pub enum ControlValue {
    /// Integer value.
    Int(i32),
    /// Floating point value.
    Float(f64),
    /// Boolean value.
    Bool(bool),
    /// Index into the control's enum options.
    Enum(i32),
    /// Free-form text.
    String(String),
}

impl ControlValue {
    /// Name of the value type, used in errors.
    pub const fn type_name(&self) -> &'static str {
        match self {
            ControlValue::Int(_) => "int",
            ControlValue::Float(_) => "float",
            ControlValue::Bool(_) => "boolean",
            ControlValue::Enum(_) => "enum",
            ControlValue::String(_) => "string",
        }
    }

    /// Integer payload for `Int` and `Enum`.
    pub fn as_int(&self) -> Option<i32> {
        match self {
            ControlValue::Int(v) | ControlValue::Enum(v) => Some(*v),
            _ => None,
        }
    }

    /// Float payload.
    pub fn as_float(&self) -> Option<f64> {
        match self {
            ControlValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    /// Boolean payload.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ControlValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// String payload.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ControlValue::String(v) => Some(v),
            _ => None,
        }
    }
}

impl fmt::Display for ControlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlValue::Int(v) | ControlValue::Enum(v) => write!(f, "{v}"),
            ControlValue::Float(v) => write!(f, "{v}"),
            ControlValue::Bool(v) => write!(f, "{}", u8::from(*v)),
            ControlValue::String(v) => f.write_str(v),
        }
    }
}

/// One choice of an enum control.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EnumOption {
    /// Value stored in the control.
    pub value: i32,
    /// Display label.
    pub label: String,
}

/// Type and valid range of a control.
#[derive(Clone, Debug, PartialEq)]
pub enum ControlType {
    /// Integer in `min..=max`.
    Int {
        /// Smallest accepted value.
        min: i32,
        /// Largest accepted value.
        max: i32,
        /// Suggested increment.
        step: i32,
    },
    /// Float in `min..=max`.
    Float {
        /// Smallest accepted value.
        min: f64,
        /// Largest accepted value.
        max: f64,
        /// Suggested increment.
        step: f64,
    },
    /// On/off switch.
    Bool,
    /// One of a fixed set of options.
    Enum(Vec<EnumOption>),
    /// Free-form text.
    String,
}

/// A named, typed unit parameter.
#[derive(Clone, Debug, PartialEq)]
pub struct Control {
    id: String,
    name: String,
    ty: ControlType,
    value: ControlValue,
    enabled: bool,
}

impl Control {
    /// Integer control.
    pub fn int(id: &str, name: &str, min: i32, max: i32, step: i32, initial: i32) -> Self {
        Self::build(id, name, ControlType::Int { min, max, step }, ControlValue::Int(initial))
    }

    /// Float control.
    pub fn float(id: &str, name: &str, min: f64, max: f64, step: f64, initial: f64) -> Self {
        Self::build(
            id,
            name,
            ControlType::Float { min, max, step },
            ControlValue::Float(initial),
        )
    }

    /// Boolean control.
    pub fn boolean(id: &str, name: &str, initial: bool) -> Self {
        Self::build(id, name, ControlType::Bool, ControlValue::Bool(initial))
    }

    /// Enum control from `(value, label)` pairs.
    pub fn enumeration(id: &str, name: &str, options: &[(i32, &str)], initial: i32) -> Self {
        let options = options
            .iter()
            .map(|(value, label)| EnumOption {
                value: *value,
                label: label.to_string(),
            })
            .collect();
        Self::build(id, name, ControlType::Enum(options), ControlValue::Enum(initial))
    }

    /// String control.
    pub fn string(id: &str, name: &str, initial: &str) -> Self {
        Self::build(
            id,
            name,
            ControlType::String,
            ControlValue::String(initial.to_string()),
        )
    }

    fn build(id: &str, name: &str, ty: ControlType, value: ControlValue) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            ty,
            value,
            enabled: true,
        }
    }

    /// Control id, unique within a unit.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Display name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Type and range.
    pub fn control_type(&self) -> &ControlType {
        &self.ty
    }

    /// Committed value.
    pub fn value(&self) -> &ControlValue {
        &self.value
    }

    /// Whether the control currently accepts changes.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Enable or disable the control.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    /// Check that `value` has this control's type and lies in its range.
    pub fn check(&self, value: &ControlValue) -> Result<()> {
        let in_range = match (&self.ty, value) {
            (ControlType::Int { min, max, .. }, ControlValue::Int(v)) => (*min..=*max).contains(v),
            (ControlType::Float { min, max, .. }, ControlValue::Float(v)) => {
                *v >= *min && *v <= *max
            }
            (ControlType::Bool, ControlValue::Bool(_)) => true,
            (ControlType::Enum(options), ControlValue::Enum(v)) => {
                options.iter().any(|o| o.value == *v)
            }
            (ControlType::String, ControlValue::String(_)) => true,
            _ => {
                return Err(Error::ControlType {
                    control: self.id.clone(),
                    expected: self.expected_type(),
                });
            }
        };
        if in_range {
            Ok(())
        } else {
            Err(Error::ControlRejected(self.id.clone()))
        }
    }

    /// Parse the textual form used in chain snapshots.
    pub fn parse_value(&self, text: &str) -> Result<ControlValue> {
        let text = text.trim();
        let invalid = || Error::Snapshot(format!("invalid value [{text}] for control [{}]", self.id));
        Ok(match &self.ty {
            ControlType::Int { .. } => ControlValue::Int(text.parse().map_err(|_| invalid())?),
            ControlType::Float { .. } => ControlValue::Float(text.parse().map_err(|_| invalid())?),
            ControlType::Bool => {
                let n: i64 = text.parse().map_err(|_| invalid())?;
                ControlValue::Bool(n != 0)
            }
            ControlType::Enum(_) => ControlValue::Enum(text.parse().map_err(|_| invalid())?),
            ControlType::String => ControlValue::String(text.to_string()),
        })
    }

    pub(crate) fn commit(&mut self, value: ControlValue) {
        self.value = value;
    }

    fn expected_type(&self) -> &'static str {
        match self.ty {
            ControlType::Int { .. } => "int",
            ControlType::Float { .. } => "float",
            ControlType::Bool => "boolean",
            ControlType::Enum(_) => "enum",
            ControlType::String => "string",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_check() {
        let ctl = Control::int("gain", "Gain", 0, 10, 1, 5);
        assert!(ctl.check(&ControlValue::Int(10)).is_ok());
        assert!(matches!(
            ctl.check(&ControlValue::Int(11)),
            Err(Error::ControlRejected(_))
        ));
        assert!(matches!(
            ctl.check(&ControlValue::Bool(true)),
            Err(Error::ControlType { expected: "int", .. })
        ));
    }

    #[test]
    fn test_enum_options() {
        let ctl = Control::enumeration("mode", "Mode", &[(0, "off"), (2, "auto")], 0);
        assert!(ctl.check(&ControlValue::Enum(2)).is_ok());
        assert!(ctl.check(&ControlValue::Enum(1)).is_err());
    }

    #[test]
    fn test_snapshot_text() {
        let ctl = Control::boolean("flip", "Flip", false);
        assert_eq!(ctl.parse_value("1").unwrap(), ControlValue::Bool(true));
        assert_eq!(ControlValue::Bool(true).to_string(), "1");

        let ctl = Control::float("fps", "Frame rate", 1.0, 120.0, 1.0, 30.0);
        assert_eq!(ctl.parse_value(" 15.5 ").unwrap(), ControlValue::Float(15.5));
        assert!(ctl.parse_value("fast").is_err());
    }
}
