//! Option sets for conversion requests.
//!
//! An [`OptionSet`] is the raw, order-independent map of options attached to
//! a request. It is what the cache key is derived from. The typed views
//! ([`ConversionOptions`], and the screenshot options in
//! [`crate::screenshot`]) are resolved from it on demand.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::PathBuf;
use thiserror::Error;

/// Reserved key under which the profile name is folded into the key hash.
pub const PROFILE_KEY: &str = "profile";

/// Error type for option handling
#[derive(Debug, Error)]
pub enum OptionsError {
    /// The option set does not fit the typed view
    #[error("Invalid options: {0}")]
    Invalid(#[from] serde_json::Error),

    /// A `key=value` pair could not be split
    #[error("Malformed option '{0}', expected key=value")]
    MalformedPair(String),

    /// The reserved profile key was set by the caller
    #[error("Option key '{PROFILE_KEY}' is reserved")]
    ReservedKey,
}

/// Resolved option map for one conversion request.
///
/// Keys are kept sorted, and nested objects are sorted again when the set is
/// canonicalized, so two sets with equal contents always produce the same
/// canonical text regardless of insertion order.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OptionSet(BTreeMap<String, Value>);

impl OptionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    /// Insert or replace an option, returning the previous value.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(key.into(), value.into())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// Parse a `key=value` pair as given on the command line.
    ///
    /// The value is read as JSON when it parses as JSON (`600`, `true`,
    /// `{"path":"logo.png"}`), and as a plain string otherwise.
    pub fn insert_pair(&mut self, pair: &str) -> Result<(), OptionsError> {
        let (key, raw) = pair
            .split_once('=')
            .ok_or_else(|| OptionsError::MalformedPair(pair.to_string()))?;
        let key = key.trim();
        if key.is_empty() {
            return Err(OptionsError::MalformedPair(pair.to_string()));
        }
        if key == PROFILE_KEY {
            return Err(OptionsError::ReservedKey);
        }
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        self.insert(key, value);
        Ok(())
    }

    /// Canonical JSON text: objects at every depth with sorted keys, no
    /// whitespace.
    pub fn canonical_json(&self) -> String {
        let mut out = String::new();
        out.push('{');
        for (i, (key, value)) in self.0.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            write_json_string(&mut out, key);
            out.push(':');
            write_canonical(&mut out, value);
        }
        out.push('}');
        out
    }

    /// Deserialize the option set into a typed view.
    pub fn resolve<T: DeserializeOwned>(&self) -> Result<T, OptionsError> {
        let map: serde_json::Map<String, Value> =
            self.0.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        Ok(serde_json::from_value(Value::Object(map))?)
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for OptionSet {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut set = OptionSet::new();
        for (key, value) in iter {
            set.insert(key, value);
        }
        set
    }
}

fn write_canonical(out: &mut String, value: &Value) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (key, value)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_json_string(out, key);
                out.push(':');
                write_canonical(out, value);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(out, item);
            }
            out.push(']');
        }
        // Scalars already have a single textual form
        other => {
            let _ = write!(out, "{}", other);
        }
    }
}

fn write_json_string(out: &mut String, s: &str) {
    let _ = write!(out, "{}", Value::String(s.to_string()));
}

/// Anchor of an overlay along one axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Anchor {
    Start,
    Center,
    #[default]
    End,
}

/// Secondary image composited on top of the video.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverlayOptions {
    /// Image to composite
    pub path: PathBuf,
    /// Horizontal anchor (default `end`)
    #[serde(default)]
    pub x: Anchor,
    /// Vertical anchor (default `end`)
    #[serde(default)]
    pub y: Anchor,
    /// Pixel padding applied to `start` and `end` anchors (default 10)
    #[serde(default = "default_overlay_padding")]
    pub padding: u32,
}

fn default_overlay_padding() -> u32 {
    10
}

/// Typed view of an [`OptionSet`] for video conversions.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConversionOptions {
    pub max_width: Option<u32>,
    pub max_height: Option<u32>,
    /// Requested output duration in seconds
    pub duration: Option<f64>,
    pub fps: Option<f64>,
    /// Saturation multiplier, 1 when absent
    pub saturation: Option<f64>,
    pub overlay: Option<OverlayOptions>,
    pub crf: Option<u32>,
    pub preset: Option<String>,
    #[serde(deserialize_with = "rate_option")]
    pub max_rate: Option<String>,
    #[serde(deserialize_with = "rate_option")]
    pub buf_size: Option<String>,
    #[serde(deserialize_with = "rate_option")]
    pub bitrate: Option<String>,
    #[serde(deserialize_with = "rate_option")]
    pub min_rate: Option<String>,
    pub cpu_used: Option<i32>,
    /// Options the built-in profiles do not know about, kept for custom ones
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl ConversionOptions {
    pub fn saturation(&self) -> f64 {
        self.saturation.unwrap_or(1.0)
    }

    /// True when any explicit bitrate knob was supplied.
    pub fn has_explicit_rates(&self) -> bool {
        self.bitrate.is_some() || self.min_rate.is_some() || self.max_rate.is_some()
    }
}

/// Rates may be given as strings (`"1M"`, `"750k"`) or as plain numbers.
fn rate_option<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawRate {
        Text(String),
        Number(u64),
    }

    Ok(Option::<RawRate>::deserialize(deserializer)?.map(|raw| match raw {
        RawRate::Text(text) => text,
        RawRate::Number(n) => n.to_string(),
    }))
}
