//! Topic grammar
//!
//! Topics name a data stream independent of the gateway that reports it:
//!
//! ```text
//! xbee.digitalIn/[00:13:A2:00:40:A0:44:33]!/DIO0
//! └── literal ─┘ └──── device qualifier ───┘ └ literal
//! ```
//!
//! A segment that opens with `[` and has a closing `]` is a device-qualifier
//! segment naming one radio. The qualifier `[!]` is a wildcard matching any
//! radio. At the device level, the key `!` stands for any gateway.
//!
//! Inbound messages carry a stream identifier `<device_id>/<topic>`, split
//! on the first `/` only.

use regex::Regex;
use serde_json::Value;
use std::fmt;
use std::sync::OnceLock;

use super::error::TopicError;

/// Wildcard marker, used as a device key and inside a qualifier (`[!]`)
pub const WILDCARD: &str = "!";

/// Qualifier segment matching any radio
pub const ANY_QUALIFIER: &str = "[!]";

/// First-level partition key of the topic tree
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DeviceKey {
    /// A specific gateway, by connect id
    Device(String),
    /// Any gateway holding the topic
    Any,
}

impl DeviceKey {
    pub fn parse(device_id: &str) -> Self {
        if device_id == WILDCARD {
            DeviceKey::Any
        } else {
            DeviceKey::Device(device_id.to_string())
        }
    }

    pub fn is_wildcard(&self) -> bool {
        matches!(self, DeviceKey::Any)
    }
}

impl fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceKey::Device(id) => write!(f, "{}", id),
            DeviceKey::Any => write!(f, "{}", WILDCARD),
        }
    }
}

/// One `/`-delimited piece of a topic
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Segment {
    /// Plain segment, matched by string equality
    Literal(String),
    /// Device qualifier naming one radio; holds the full segment text,
    /// including any suffix after the closing bracket
    Qualifier(String),
    /// `[!]`, matches any qualifier segment
    AnyQualifier,
}

impl Segment {
    pub fn parse(segment: &str) -> Self {
        let Some(rest) = segment.strip_prefix('[') else {
            return Segment::Literal(segment.to_string());
        };
        match rest.find(']') {
            Some(close) if &rest[..close] == WILDCARD => Segment::AnyQualifier,
            Some(_) => Segment::Qualifier(segment.to_string()),
            None => Segment::Literal(segment.to_string()),
        }
    }

    pub fn is_qualifier(&self) -> bool {
        !matches!(self, Segment::Literal(_))
    }

    /// Text used as the child key in the topic tree
    pub fn as_str(&self) -> &str {
        match self {
            Segment::Literal(s) | Segment::Qualifier(s) => s,
            Segment::AnyQualifier => ANY_QUALIFIER,
        }
    }
}

/// A parsed topic path
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Topic {
    raw: String,
    segments: Vec<Segment>,
}

impl Topic {
    pub fn parse(topic: &str) -> Self {
        Self {
            raw: topic.to_string(),
            segments: topic.split('/').map(Segment::parse).collect(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// True if any segment is the `[!]` wildcard
    pub fn has_wildcard(&self) -> bool {
        self.segments
            .iter()
            .any(|s| matches!(s, Segment::AnyQualifier))
    }
}

impl From<&str> for Topic {
    fn from(topic: &str) -> Self {
        Topic::parse(topic)
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// A stream identifier split into device id and topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamId {
    pub device_id: String,
    pub topic: String,
}

impl StreamId {
    /// Parse `<device_id>/<topic>`, splitting on the first `/`
    pub fn parse(stream_id: &str) -> Result<Self, TopicError> {
        match stream_id.split_once('/') {
            Some((device, topic)) if !device.is_empty() && !topic.is_empty() => Ok(Self {
                device_id: device.to_string(),
                topic: topic.to_string(),
            }),
            _ => Err(TopicError::MalformedStreamId(stream_id.to_string())),
        }
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.device_id, self.topic)
    }
}

fn template_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\$\{\s*([A-Za-z_][A-Za-z0-9_]*)\s*\}").expect("template pattern is valid")
    })
}

/// Expand `${field}` placeholders against a widget's configuration object
///
/// Strings are substituted as-is, numbers and booleans by their JSON text.
pub fn expand_template(template: &str, fields: &Value) -> Result<String, TopicError> {
    let mut out = String::with_capacity(template.len());
    let mut last = 0;

    for caps in template_pattern().captures_iter(template) {
        let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let name = name.as_str();
        let text = match fields.get(name) {
            Some(Value::String(s)) => s.clone(),
            Some(v @ (Value::Number(_) | Value::Bool(_))) => v.to_string(),
            Some(_) => return Err(TopicError::NonScalarField(name.to_string())),
            None => return Err(TopicError::MissingField(name.to_string())),
        };
        out.push_str(&template[last..whole.start()]);
        out.push_str(&text);
        last = whole.end();
    }

    out.push_str(&template[last..]);
    Ok(out)
}

/// XBee stream family a widget pin reads from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// `DIO*` pins
    DigitalIn,
    /// `AD*` pins
    Analog,
    /// Anything else is treated as the serial stream
    SerialIn,
}

impl StreamKind {
    pub fn for_pin(pin: &str) -> Self {
        if pin.starts_with("DIO") {
            StreamKind::DigitalIn
        } else if pin.starts_with("AD") {
            StreamKind::Analog
        } else {
            StreamKind::SerialIn
        }
    }

    pub fn prefix(&self) -> &'static str {
        match self {
            StreamKind::DigitalIn => "xbee.digitalIn",
            StreamKind::Analog => "xbee.analog",
            StreamKind::SerialIn => "xbee.serialIn",
        }
    }

    /// Topic template for a widget whose pin name lives in `pin_field`
    ///
    /// Serial streams have no pin segment.
    pub fn template(&self, pin_field: &str) -> String {
        match self {
            StreamKind::SerialIn => format!("{}/[${{radio}}]!", self.prefix()),
            _ => format!("{}/[${{radio}}]!/${{{}}}", self.prefix(), pin_field),
        }
    }
}
