//! Phoenix Nest wire format — the two datagram kinds exchanged on the
//! discovery port.
//!
//! Every datagram is one flat JSON object:
//!
//! ```text
//! {"m":"PNSD","v":1,"cmd":"helo","id":"KY4OLB-SDR1","svc":"sdr_server",
//!  "ip":"192.168.1.20","port":4535,"data":4536,"caps":"rsp2pro,2mhz","ts":1700000000}
//! {"m":"PNSD","v":1,"cmd":"bye","id":"KY4OLB-SDR1","ts":1700000060}
//! ```
//!
//! Keys may arrive in any order and unknown keys are ignored. Absent numeric
//! keys read as 0. Strings longer than their bound are truncated, never
//! rejected. Only a missing or foreign protocol tag, a missing `cmd` / `id`,
//! or (for presence) a missing `svc` makes a datagram malformed.

use std::io::{self, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use serde_json::{Map, Value};

// ── Constants ─────────────────────────────────────────────────────────────────

/// Protocol tag carried in the `m` key. Exact match required.
pub const PROTOCOL_TAG: &str = "PNSD";

/// Protocol version carried in the `v` key.
pub const PROTOCOL_VERSION: u32 = 1;

/// Default UDP port shared by every peer.
pub const DEFAULT_PORT: u16 = 5400;

/// Largest datagram the encoder will produce and the listener will read.
pub const MAX_MESSAGE_LEN: usize = 1024;

/// Maximum identity length in bytes.
pub const MAX_ID_LEN: usize = 63;
/// Maximum service-type length in bytes.
pub const MAX_SERVICE_LEN: usize = 31;
/// Maximum reported-IP length in bytes.
pub const MAX_IP_LEN: usize = 63;
/// Maximum capabilities length in bytes.
pub const MAX_CAPS_LEN: usize = 127;

/// Well-known service types.
pub mod service {
    pub const SDR_SERVER: &str = "sdr_server";
    pub const SIGNAL_SPLITTER: &str = "signal_splitter";
    pub const SIGNAL_RELAY: &str = "signal_relay";
    pub const WATERFALL: &str = "waterfall";
    pub const CONTROLLER: &str = "controller";
    pub const DETECTOR: &str = "detector";
}

const CMD_PRESENCE: &str = "helo";
const CMD_DEPARTURE: &str = "bye";

// ── Message kinds ─────────────────────────────────────────────────────────────

/// The two datagram kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Periodic announcement (`helo`).
    Presence,
    /// Graceful leave (`bye`).
    Departure,
}

impl MessageKind {
    /// The `cmd` value for this kind.
    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::Presence => CMD_PRESENCE,
            MessageKind::Departure => CMD_DEPARTURE,
        }
    }
}

impl TryFrom<&str> for MessageKind {
    type Error = WireError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            CMD_PRESENCE => Ok(MessageKind::Presence),
            CMD_DEPARTURE => Ok(MessageKind::Departure),
            other => Err(WireError::UnknownKind(truncate(other, 16))),
        }
    }
}

// ── Self descriptor ───────────────────────────────────────────────────────────

/// What this instance announces about itself.
///
/// Every string is truncated to its bound on construction, so a descriptor
/// always fits the limits a receiver applies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelfDescriptor {
    pub id: String,
    pub service: String,
    /// Address reported in the `ip` key.
    pub ip: String,
    pub ctrl_port: u16,
    /// 0 = no data port; omitted from the wire.
    pub data_port: u16,
    /// Empty = no capabilities; omitted from the wire.
    pub caps: String,
}

impl SelfDescriptor {
    pub fn new(
        id: &str,
        service: &str,
        ip: &str,
        ctrl_port: u16,
        data_port: u16,
        caps: Option<&str>,
    ) -> Self {
        Self {
            id: truncate(id, MAX_ID_LEN),
            service: truncate(service, MAX_SERVICE_LEN),
            ip: truncate(ip, MAX_IP_LEN),
            ctrl_port,
            data_port,
            caps: truncate(caps.unwrap_or_default(), MAX_CAPS_LEN),
        }
    }
}

// ── Decoded messages ──────────────────────────────────────────────────────────

/// A decoded `helo` datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Presence {
    pub version: u32,
    pub id: String,
    pub service: String,
    /// `None` when the sender left out `ip`; the receiver substitutes the
    /// datagram's source address.
    pub ip: Option<String>,
    pub ctrl_port: u16,
    pub data_port: u16,
    pub caps: String,
    /// Sender's clock, unix seconds. Informational only.
    pub timestamp: u64,
}

/// A decoded `bye` datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Departure {
    pub version: u32,
    pub id: String,
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Presence(Presence),
    Departure(Departure),
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Presence(_) => MessageKind::Presence,
            Message::Departure(_) => MessageKind::Departure,
        }
    }

    /// Identity of the sender.
    pub fn id(&self) -> &str {
        match self {
            Message::Presence(p) => &p.id,
            Message::Departure(d) => &d.id,
        }
    }
}

// ── Encoding ──────────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct PresenceFrame<'a> {
    m: &'static str,
    v: u32,
    cmd: &'static str,
    id: &'a str,
    svc: &'a str,
    ip: &'a str,
    port: u16,
    #[serde(skip_serializing_if = "is_zero")]
    data: u16,
    #[serde(skip_serializing_if = "is_empty")]
    caps: &'a str,
    ts: u64,
}

#[derive(Serialize)]
struct DepartureFrame<'a> {
    m: &'static str,
    v: u32,
    cmd: &'static str,
    id: &'a str,
    ts: u64,
}

fn is_zero(n: &u16) -> bool {
    *n == 0
}

fn is_empty(s: &&str) -> bool {
    s.is_empty()
}

/// Encode a `helo` datagram for `me`, stamped with the current time.
pub fn encode_presence(me: &SelfDescriptor) -> Result<Vec<u8>, WireError> {
    encode_presence_at(me, unix_time())
}

/// Encode a `bye` datagram for `me`, stamped with the current time.
pub fn encode_departure(me: &SelfDescriptor) -> Result<Vec<u8>, WireError> {
    encode_departure_at(me, unix_time())
}

pub fn encode_presence_at(me: &SelfDescriptor, ts: u64) -> Result<Vec<u8>, WireError> {
    encode_bounded(&PresenceFrame {
        m: PROTOCOL_TAG,
        v: PROTOCOL_VERSION,
        cmd: CMD_PRESENCE,
        id: &me.id,
        svc: &me.service,
        ip: &me.ip,
        port: me.ctrl_port,
        data: me.data_port,
        caps: &me.caps,
        ts,
    })
}

pub fn encode_departure_at(me: &SelfDescriptor, ts: u64) -> Result<Vec<u8>, WireError> {
    encode_bounded(&DepartureFrame {
        m: PROTOCOL_TAG,
        v: PROTOCOL_VERSION,
        cmd: CMD_DEPARTURE,
        id: &me.id,
        ts,
    })
}

/// Serialize into a buffer that refuses to grow past `MAX_MESSAGE_LEN`.
/// serde_json writes token by token, so the capacity check runs before every
/// append and the first refusal aborts the whole encode.
fn encode_bounded<T: Serialize>(frame: &T) -> Result<Vec<u8>, WireError> {
    let mut out = BoundedBuf::new(MAX_MESSAGE_LEN);
    serde_json::to_writer(&mut out, frame).map_err(|e| {
        if e.is_io() {
            WireError::MessageTooLarge {
                limit: MAX_MESSAGE_LEN,
            }
        } else {
            WireError::Encode(e.to_string())
        }
    })?;
    Ok(out.into_inner())
}

struct BoundedBuf {
    buf: Vec<u8>,
    limit: usize,
}

impl BoundedBuf {
    fn new(limit: usize) -> Self {
        Self {
            buf: Vec::with_capacity(256),
            limit,
        }
    }

    fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}

impl Write for BoundedBuf {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if self.limit - self.buf.len() < data.len() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "message capacity exhausted",
            ));
        }
        self.buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

// ── Decoding ──────────────────────────────────────────────────────────────────

/// Decode one datagram.
pub fn decode(bytes: &[u8]) -> Result<Message, WireError> {
    let value: Value = serde_json::from_slice(bytes).map_err(|_| WireError::NotJson)?;
    let Value::Object(fields) = value else {
        return Err(WireError::NotAnObject);
    };

    match fields.get("m") {
        Some(Value::String(tag)) if tag == PROTOCOL_TAG => {}
        Some(other) => {
            let shown = match other {
                Value::String(s) => s.clone(),
                v => v.to_string(),
            };
            return Err(WireError::ForeignProtocol(truncate(&shown, 16)));
        }
        None => return Err(WireError::MissingField("m")),
    }

    let kind = string_field(&fields, "cmd", 16).ok_or(WireError::MissingField("cmd"))?;
    let kind = MessageKind::try_from(kind.as_str())?;
    let id = string_field(&fields, "id", MAX_ID_LEN).ok_or(WireError::MissingField("id"))?;
    let version = number_field::<u32>(&fields, "v");
    let timestamp = number_field::<u64>(&fields, "ts");

    match kind {
        MessageKind::Presence => {
            let service = string_field(&fields, "svc", MAX_SERVICE_LEN)
                .ok_or(WireError::MissingField("svc"))?;
            Ok(Message::Presence(Presence {
                version,
                id,
                service,
                ip: string_field(&fields, "ip", MAX_IP_LEN),
                ctrl_port: number_field(&fields, "port"),
                data_port: number_field(&fields, "data"),
                caps: string_field(&fields, "caps", MAX_CAPS_LEN).unwrap_or_default(),
                timestamp,
            }))
        }
        MessageKind::Departure => Ok(Message::Departure(Departure {
            version,
            id,
            timestamp,
        })),
    }
}

fn string_field(fields: &Map<String, Value>, key: &str, max: usize) -> Option<String> {
    fields.get(key).and_then(Value::as_str).map(|s| truncate(s, max))
}

/// Anything that is not a non-negative integer fitting `T` reads as 0.
fn number_field<T>(fields: &Map<String, Value>, key: &str) -> T
where
    T: TryFrom<u64> + Default,
{
    fields
        .get(key)
        .and_then(Value::as_u64)
        .and_then(|n| T::try_from(n).ok())
        .unwrap_or_default()
}

// ── Helpers ───────────────────────────────────────────────────────────────────

/// Cut `s` to at most `max` bytes without splitting a character.
pub fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

/// Seconds since the unix epoch; 0 if the clock is before it.
pub fn unix_time() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("datagram is not valid JSON")]
    NotJson,

    #[error("datagram is not a JSON object")]
    NotAnObject,

    #[error("required key `{0}` is missing")]
    MissingField(&'static str),

    #[error("foreign protocol tag {0:?}")]
    ForeignProtocol(String),

    #[error("unknown message kind {0:?}")]
    UnknownKind(String),

    #[error("encoded message exceeds {limit} bytes")]
    MessageTooLarge { limit: usize },

    #[error("encode failed: {0}")]
    Encode(String),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
