//! Decoded (or to be encoded) device messages.
use std::{collections::BTreeMap, fmt};

use thiserror::Error;

/// Three letter message type, as found after the talker in ASCII frames.
/// Binary frames are mapped onto the same vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MsgType(pub [u8; 3]);

impl MsgType {
    pub const IMU: Self = Self(*b"IMU");
    pub const IM1: Self = Self(*b"IM1");
    pub const GPS: Self = Self(*b"GPS");
    pub const GP2: Self = Self(*b"GP2");
    pub const HDG: Self = Self(*b"HDG");
    pub const INS: Self = Self(*b"INS");
    pub const CAL: Self = Self(*b"CAL");
    pub const HPP: Self = Self(*b"HPP");
    pub const UBX: Self = Self(*b"UBX");
    pub const GGA: Self = Self(*b"GGA");
    pub const CFG: Self = Self(*b"CFG");
    pub const VEH: Self = Self(*b"VEH");
    pub const SEN: Self = Self(*b"SEN");
    pub const STA: Self = Self(*b"STA");
    pub const ERR: Self = Self(*b"ERR");
    pub const PNG: Self = Self(*b"PNG");
    pub const ECH: Self = Self(*b"ECH");
    pub const VER: Self = Self(*b"VER");
    pub const SER: Self = Self(*b"SER");
    pub const PID: Self = Self(*b"PID");
    pub const IHW: Self = Self(*b"IHW");
    pub const FHW: Self = Self(*b"FHW");
    pub const FSN: Self = Self(*b"FSN");
    pub const RST: Self = Self(*b"RST");
    pub const UNL: Self = Self(*b"UNL");
    pub const ODO: Self = Self(*b"ODO");
    pub const UNKNOWN: Self = Self(*b"???");

    /// Streaming (measurement) types, as opposed to command/response types.
    pub const STREAMING: [Self; 7] = [
        Self::CAL,
        Self::IMU,
        Self::IM1,
        Self::INS,
        Self::GPS,
        Self::GP2,
        Self::HDG,
    ];

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let tag: [u8; 3] = bytes.try_into().ok()?;
        Some(Self(tag))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_streaming(&self) -> bool {
        Self::STREAMING.contains(self)
    }
}

impl fmt::Display for MsgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

/// Reasons a frame failed to decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("checksum failure")]
    Checksum,
    #[error("unknown message type")]
    UnknownType,
    #[error("unexpected field count ({found})")]
    LengthMismatch { found: usize },
    #[error("field does not fit its declared type")]
    FieldDecode,
    #[error("malformed framing")]
    Framing,
}

/// Single field value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    UInt(u64),
    Float(f64),
    Text(Vec<u8>),
}

impl Value {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::UInt(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            Self::Text(_) => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            Self::UInt(v) => i64::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Self::UInt(v) => Some(*v),
            Self::Int(v) => u64::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Text(v) => Some(v),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{}", v),
            Self::UInt(v) => write!(f, "{}", v),
            Self::Float(v) => write!(f, "{}", v),
            Self::Text(v) => write!(f, "{}", String::from_utf8_lossy(v)),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Self::UInt(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Text(v.as_bytes().to_vec())
    }
}

impl From<&[u8]> for Value {
    fn from(v: &[u8]) -> Self {
        Self::Text(v.to_vec())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Self::Text(v)
    }
}

/// Ordered name/value pairs carried by CFG, VEH, SEN and STA messages.
/// Read requests carry names with empty values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Configurations(pub Vec<(String, Vec<u8>)>);

impl Configurations {
    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.0
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_slice())
    }

    /// Builds a read request out of configuration names.
    pub fn names<S: AsRef<str>>(names: &[S]) -> Self {
        Self(
            names
                .iter()
                .map(|n| (n.as_ref().to_string(), Vec::new()))
                .collect(),
        )
    }

    pub fn pairs<K: AsRef<str>, V: AsRef<[u8]>>(pairs: &[(K, V)]) -> Self {
        Self(
            pairs
                .iter()
                .map(|(k, v)| (k.as_ref().to_string(), v.as_ref().to_vec()))
                .collect(),
        )
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_slice()))
    }
}

/// A device message.
///
/// Decoding never fails: a frame that does not decode produces
/// a [Message] with `valid == false`, its [ParseError] and the raw bytes,
/// but no fields.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Message type
    pub msgtype: MsgType,
    /// True when the frame passed checksum and decoding
    pub valid: bool,
    /// Decoding failure, when not valid
    pub error: Option<ParseError>,
    /// Undecoded frame, kept for logging and diagnostics
    pub raw: Vec<u8>,
    fields: BTreeMap<String, Value>,
    configurations: Option<Configurations>,
}

impl Message {
    /// Creates a new (outgoing) [Message] of this type.
    pub fn new(msgtype: MsgType) -> Self {
        Self {
            msgtype,
            valid: true,
            error: None,
            raw: Vec::new(),
            fields: BTreeMap::new(),
            configurations: None,
        }
    }

    /// Message that failed to decode.
    pub fn invalid(msgtype: MsgType, error: ParseError, raw: &[u8]) -> Self {
        let mut msg = Self::new(msgtype);
        msg.raw = raw.to_vec();
        msg.fail(error);
        msg
    }

    /// Marks this message invalid, discarding anything decoded so far.
    pub(crate) fn fail(&mut self, error: ParseError) {
        self.valid = false;
        self.error = Some(error);
        self.fields.clear();
        self.configurations = None;
    }

    /// Copies and returns [Message] with one more field.
    pub fn with(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.set(name, value);
        self
    }

    /// Copies and returns [Message] with these [Configurations].
    pub fn with_configurations(mut self, configurations: Configurations) -> Self {
        self.configurations = Some(configurations);
        self
    }

    pub fn set(&mut self, name: &str, value: impl Into<Value>) {
        self.fields.insert(name.to_string(), value.into());
    }

    pub fn set_configurations(&mut self, configurations: Configurations) {
        self.configurations = Some(configurations);
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn has(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    pub fn f64(&self, name: &str) -> Option<f64> {
        self.get(name)?.as_f64()
    }

    pub fn i64(&self, name: &str) -> Option<i64> {
        self.get(name)?.as_i64()
    }

    pub fn u64(&self, name: &str) -> Option<u64> {
        self.get(name)?.as_u64()
    }

    pub fn bytes(&self, name: &str) -> Option<&[u8]> {
        self.get(name)?.as_bytes()
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn configurations(&self) -> Option<&Configurations> {
        self.configurations.as_ref()
    }

    /// Compares decoded content, ignoring the raw frame.
    pub fn same_content(&self, rhs: &Self) -> bool {
        self.msgtype == rhs.msgtype
            && self.valid == rhs.valid
            && self.error == rhs.error
            && self.fields == rhs.fields
            && self.configurations == rhs.configurations
    }
}
