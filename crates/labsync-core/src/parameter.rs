//! Typed device parameters and their declared constraints.
//!
//! Every instrument class declares a static table of [`ParameterSpec`]s. A
//! [`ParameterSet`] holds the in-memory value of each declared parameter and is
//! the unit that presets save and load. Values are validated against their [`ParameterSpec`]
//! before they are stored or transmitted; out-of-range values are rejected and
//! never clamped.
//!
//! # Indexed parameters
//!
//! Multi-channel instruments declare per-channel parameters with
//! `channels > 0`. Their keys carry the channel in brackets:
//!
//! ```text
//! frequency[1] = 1000.0
//! frequency[2] = 250.0
//! ```
//!
//! The unindexed form (`frequency`) is resolved against the set's `channel`
//! selector by [`ParameterSet::resolve`]; a selector of 0 addresses every
//! channel.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::device::DeviceId;
use crate::error::{LabError, LabResult};

/// Name of the selector parameter used to resolve unindexed keys.
pub const CHANNEL_SELECTOR: &str = "channel";

// =============================================================================
// Values
// =============================================================================

/// A parameter value as stored in memory and in preset files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterValue {
    /// Switches (emission, output)
    Bool(bool),
    /// Integer settings (channel, sweep points)
    Int(i64),
    /// Physical quantities
    Float(f64),
    /// Choice-list members (modes, waveforms)
    Text(String),
}

impl ParameterValue {
    /// Numeric view; integers widen to `f64`.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParameterValue::Float(v) => Some(*v),
            ParameterValue::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    /// Integer view.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ParameterValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Boolean view.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ParameterValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// Text view.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParameterValue::Text(v) => Some(v),
            _ => None,
        }
    }

    fn type_name(&self) -> &'static str {
        match self {
            ParameterValue::Bool(_) => "bool",
            ParameterValue::Int(_) => "integer",
            ParameterValue::Float(_) => "float",
            ParameterValue::Text(_) => "text",
        }
    }
}

impl std::fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParameterValue::Bool(v) => write!(f, "{}", v),
            ParameterValue::Int(v) => write!(f, "{}", v),
            ParameterValue::Float(v) => write!(f, "{}", v),
            ParameterValue::Text(v) => f.write_str(v),
        }
    }
}

impl From<f64> for ParameterValue {
    fn from(value: f64) -> Self {
        ParameterValue::Float(value)
    }
}

impl From<i64> for ParameterValue {
    fn from(value: i64) -> Self {
        ParameterValue::Int(value)
    }
}

impl From<bool> for ParameterValue {
    fn from(value: bool) -> Self {
        ParameterValue::Bool(value)
    }
}

impl From<&str> for ParameterValue {
    fn from(value: &str) -> Self {
        ParameterValue::Text(value.to_string())
    }
}

impl From<String> for ParameterValue {
    fn from(value: String) -> Self {
        ParameterValue::Text(value)
    }
}

// =============================================================================
// Specs
// =============================================================================

/// Declared domain of a parameter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Constraint {
    /// Inclusive float range
    FloatRange {
        /// Lower bound
        min: f64,
        /// Upper bound
        max: f64,
    },
    /// Inclusive integer range
    IntRange {
        /// Lower bound
        min: i64,
        /// Upper bound
        max: i64,
    },
    /// One of a fixed list of lowercase names
    Choices(&'static [&'static str]),
    /// On/off
    Bool,
}

/// Const-friendly default value of a spec.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DefaultValue {
    /// Boolean default
    Bool(bool),
    /// Integer default
    Int(i64),
    /// Float default
    Float(f64),
    /// Choice default
    Text(&'static str),
}

impl DefaultValue {
    fn to_value(self) -> ParameterValue {
        match self {
            DefaultValue::Bool(v) => ParameterValue::Bool(v),
            DefaultValue::Int(v) => ParameterValue::Int(v),
            DefaultValue::Float(v) => ParameterValue::Float(v),
            DefaultValue::Text(v) => ParameterValue::Text(v.to_string()),
        }
    }
}

/// Declaration of one device parameter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParameterSpec {
    /// Base name (without channel index)
    pub name: &'static str,
    /// Physical unit, empty when dimensionless
    pub unit: &'static str,
    /// Allowed values
    pub constraint: Constraint,
    /// Value used when a set is created
    pub default: DefaultValue,
    /// Number of channels for indexed parameters, 0 otherwise
    pub channels: u8,
}

impl ParameterSpec {
    /// Float parameter with an inclusive range.
    pub const fn float(name: &'static str, unit: &'static str, min: f64, max: f64, default: f64) -> Self {
        Self {
            name,
            unit,
            constraint: Constraint::FloatRange { min, max },
            default: DefaultValue::Float(default),
            channels: 0,
        }
    }

    /// Integer parameter with an inclusive range.
    pub const fn int(name: &'static str, unit: &'static str, min: i64, max: i64, default: i64) -> Self {
        Self {
            name,
            unit,
            constraint: Constraint::IntRange { min, max },
            default: DefaultValue::Int(default),
            channels: 0,
        }
    }

    /// Choice-list parameter.
    pub const fn choice(name: &'static str, choices: &'static [&'static str], default: &'static str) -> Self {
        Self {
            name,
            unit: "",
            constraint: Constraint::Choices(choices),
            default: DefaultValue::Text(default),
            channels: 0,
        }
    }

    /// Boolean parameter.
    pub const fn switch(name: &'static str, default: bool) -> Self {
        Self {
            name,
            unit: "",
            constraint: Constraint::Bool,
            default: DefaultValue::Bool(default),
            channels: 0,
        }
    }

    /// Make this parameter per-channel.
    pub const fn per_channel(mut self, channels: u8) -> Self {
        self.channels = channels;
        self
    }

    /// True for per-channel parameters.
    pub fn is_indexed(&self) -> bool {
        self.channels > 0
    }

    /// Check a value against the constraint, returning the normalized value.
    ///
    /// Integers are accepted for float parameters and widened. Text choices
    /// are matched case-insensitively and stored lowercase.
    pub fn check(&self, value: &ParameterValue) -> Result<ParameterValue, String> {
        match (self.constraint, value) {
            (Constraint::FloatRange { min, max }, v) => {
                let x = v
                    .as_f64()
                    .ok_or_else(|| format!("expected a number, got {}", v.type_name()))?;
                if !x.is_finite() {
                    return Err(format!("{} is not a finite number", x));
                }
                if x < min || x > max {
                    return Err(format!("{} {} is outside [{}, {}]", x, self.unit, min, max));
                }
                Ok(ParameterValue::Float(x))
            }
            (Constraint::IntRange { min, max }, ParameterValue::Int(x)) => {
                if *x < min || *x > max {
                    return Err(format!("{} is outside [{}, {}]", x, min, max));
                }
                Ok(ParameterValue::Int(*x))
            }
            (Constraint::IntRange { .. }, v) => {
                Err(format!("expected an integer, got {}", v.type_name()))
            }
            (Constraint::Choices(choices), ParameterValue::Text(s)) => {
                let lower = s.to_ascii_lowercase();
                if choices.contains(&lower.as_str()) {
                    Ok(ParameterValue::Text(lower))
                } else {
                    Err(format!("'{}' is not one of {}", s, choices.join(", ")))
                }
            }
            (Constraint::Choices(choices), v) => Err(format!(
                "expected one of {}, got {}",
                choices.join(", "),
                v.type_name()
            )),
            (Constraint::Bool, ParameterValue::Bool(b)) => Ok(ParameterValue::Bool(*b)),
            (Constraint::Bool, v) => Err(format!("expected a bool, got {}", v.type_name())),
        }
    }
}

// =============================================================================
// Keys
// =============================================================================

/// Parsed parameter key: base name plus optional channel index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParameterKey {
    /// Base name
    pub name: String,
    /// Channel index for per-channel parameters
    pub channel: Option<u8>,
}

impl ParameterKey {
    /// Unindexed key.
    pub fn plain(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            channel: None,
        }
    }

    /// Key addressing one channel.
    pub fn indexed(name: impl Into<String>, channel: u8) -> Self {
        Self {
            name: name.into(),
            channel: Some(channel),
        }
    }

    /// Parse `name` or `name[n]`.
    pub fn parse(raw: &str) -> Result<Self, String> {
        let raw = raw.trim();
        match raw.split_once('[') {
            None => {
                if raw.is_empty() || raw.contains(']') {
                    return Err(format!("malformed parameter key '{}'", raw));
                }
                Ok(Self::plain(raw))
            }
            Some((name, rest)) => {
                let index = rest
                    .strip_suffix(']')
                    .ok_or_else(|| format!("malformed parameter key '{}'", raw))?;
                let channel = index
                    .trim()
                    .parse::<u8>()
                    .map_err(|_| format!("malformed channel index in '{}'", raw))?;
                if name.is_empty() {
                    return Err(format!("malformed parameter key '{}'", raw));
                }
                Ok(Self::indexed(name, channel))
            }
        }
    }
}

impl std::fmt::Display for ParameterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.channel {
            Some(ch) => write!(f, "{}[{}]", self.name, ch),
            None => f.write_str(&self.name),
        }
    }
}

/// Find the spec for `key` and check that the index matches its shape.
pub fn lookup_spec<'a>(
    specs: &'a [ParameterSpec],
    device: &DeviceId,
    key: &ParameterKey,
) -> LabResult<&'a ParameterSpec> {
    let spec = specs
        .iter()
        .find(|s| s.name == key.name)
        .ok_or_else(|| LabError::validation(device, key.to_string(), "unknown parameter"))?;

    match (spec.is_indexed(), key.channel) {
        (false, None) => Ok(spec),
        (false, Some(_)) => Err(LabError::validation(
            device,
            key.to_string(),
            "parameter is not per-channel",
        )),
        (true, None) => Err(LabError::validation(
            device,
            key.to_string(),
            "channel index required",
        )),
        (true, Some(ch)) if ch == 0 || ch > spec.channels => Err(LabError::validation(
            device,
            key.to_string(),
            format!("channel must be 1-{}", spec.channels),
        )),
        (true, Some(_)) => Ok(spec),
    }
}

/// Validate `value` for `key` against `specs`, returning the normalized value.
pub fn validate(
    specs: &[ParameterSpec],
    device: &DeviceId,
    key: &ParameterKey,
    value: &ParameterValue,
) -> LabResult<ParameterValue> {
    let spec = lookup_spec(specs, device, key)?;
    spec.check(value)
        .map_err(|reason| LabError::validation(device, key.to_string(), reason))
}

// =============================================================================
// Parameter Set
// =============================================================================

/// In-memory values of every declared parameter of one device.
///
/// Keys are stored in their display form (`frequency[2]`) in a `BTreeMap` so
/// that iteration, and therefore preset serialization, is deterministic.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterSet {
    device: DeviceId,
    specs: &'static [ParameterSpec],
    values: BTreeMap<String, ParameterValue>,
}

impl ParameterSet {
    /// Create a set holding the default of every declared parameter.
    pub fn with_defaults(device: DeviceId, specs: &'static [ParameterSpec]) -> Self {
        let mut values = BTreeMap::new();
        for spec in specs {
            if spec.is_indexed() {
                for ch in 1..=spec.channels {
                    values.insert(
                        ParameterKey::indexed(spec.name, ch).to_string(),
                        spec.default.to_value(),
                    );
                }
            } else {
                values.insert(spec.name.to_string(), spec.default.to_value());
            }
        }
        Self {
            device,
            specs,
            values,
        }
    }

    /// Declared specs.
    pub fn specs(&self) -> &'static [ParameterSpec] {
        self.specs
    }

    /// Owning device.
    pub fn device(&self) -> &DeviceId {
        &self.device
    }

    /// Expand `raw` into concrete keys.
    ///
    /// Indexed keys resolve to themselves. An unindexed key of a per-channel
    /// parameter resolves to the channel named by the `channel` selector, or
    /// to every channel when the selector is 0.
    pub fn resolve(&self, raw: &str) -> LabResult<Vec<ParameterKey>> {
        let key = ParameterKey::parse(raw)
            .map_err(|reason| LabError::validation(&self.device, raw, reason))?;
        let spec = self
            .specs
            .iter()
            .find(|s| s.name == key.name)
            .ok_or_else(|| LabError::validation(&self.device, raw, "unknown parameter"))?;

        if !spec.is_indexed() || key.channel.is_some() {
            lookup_spec(self.specs, &self.device, &key)?;
            return Ok(vec![key]);
        }

        let selected = self
            .values
            .get(CHANNEL_SELECTOR)
            .and_then(ParameterValue::as_i64)
            .ok_or_else(|| LabError::validation(&self.device, raw, "channel index required"))?;

        match u8::try_from(selected) {
            Ok(0) => Ok((1..=spec.channels)
                .map(|ch| ParameterKey::indexed(spec.name, ch))
                .collect()),
            Ok(ch) if ch <= spec.channels => Ok(vec![ParameterKey::indexed(spec.name, ch)]),
            _ => Err(LabError::validation(
                &self.device,
                raw,
                format!("selected channel {} is out of range", selected),
            )),
        }
    }

    /// Validate without storing.
    pub fn validate(&self, key: &ParameterKey, value: &ParameterValue) -> LabResult<ParameterValue> {
        validate(self.specs, &self.device, key, value)
    }

    /// Validate and store one value. Returns the normalized value.
    pub fn set(&mut self, key: &ParameterKey, value: &ParameterValue) -> LabResult<ParameterValue> {
        let normalized = self.validate(key, value)?;
        self.values.insert(key.to_string(), normalized.clone());
        Ok(normalized)
    }

    /// Validate every entry of `values` and replace them all, or none.
    pub fn replace_all(&mut self, values: &BTreeMap<String, ParameterValue>) -> LabResult<()> {
        let mut staged = self.values.clone();
        for (raw, value) in values {
            let key = ParameterKey::parse(raw)
                .map_err(|reason| LabError::validation(&self.device, raw.as_str(), reason))?;
            let normalized = self.validate(&key, value)?;
            staged.insert(key.to_string(), normalized);
        }
        self.values = staged;
        Ok(())
    }

    /// Current value of a key in display form.
    pub fn get(&self, key: &str) -> Option<&ParameterValue> {
        self.values.get(key)
    }

    /// All values, ordered by key.
    pub fn values(&self) -> &BTreeMap<String, ParameterValue> {
        &self.values
    }

    /// Iterate over parsed keys and values, ordered by key.
    pub fn iter(&self) -> impl Iterator<Item = (ParameterKey, &ParameterValue)> + '_ {
        self.values.iter().filter_map(|(raw, value)| {
            ParameterKey::parse(raw).ok().map(|key| (key, value))
        })
    }
}
