//! The wire envelope exchanged on every poll.
//!
//! A [`Message`] carries routing metadata, an opaque body and a handful of
//! flags. It is always produced through a [`MessageBuilder`], which refuses
//! to build without a trace id, session id and route name.
//!
//! Two encodings with identical semantics are supported, chosen by the HTTP
//! content type: a compact length-prefixed binary frame
//! (`application/octet-stream`) and a JSON mirror (`application/json`) in
//! which the body is base64.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use http::{HeaderValue, StatusCode};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use snafu::{ResultExt, Snafu, ensure};

pub const BINARY_CONTENT_TYPE: &str = "application/octet-stream";
pub const JSON_CONTENT_TYPE: &str = "application/json";

const FRAME_VERSION: u8 = 1;

const FLAG_TERMINATED: u8 = 0b0000_0001;
const FLAG_NOT_READY: u8 = 0b0000_0010;
const FLAG_EMPTY: u8 = 0b0000_0100;
const FLAG_ERROR: u8 = 0b0000_1000;
const FLAG_POLL_DELAY: u8 = 0b0001_0000;

#[derive(Debug, Snafu, Clone, Copy, PartialEq, Eq)]
#[snafu(visibility(pub(crate)))]
pub enum BuildError {
    #[snafu(display("message is missing a trace id"))]
    MissingTraceId,

    #[snafu(display("message is missing a session id"))]
    MissingSessionId,

    #[snafu(display("message is missing a route name"))]
    MissingRouteName,
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum DecodeError {
    #[snafu(display("message frame truncated while reading {field}"))]
    Truncated { field: &'static str },

    #[snafu(display("unsupported message frame version {version}"))]
    UnsupportedVersion { version: u8 },

    #[snafu(display("field {field} is not valid UTF-8: {source}"))]
    InvalidUtf8 {
        field: &'static str,
        source: std::string::FromUtf8Error,
    },

    #[snafu(display("unknown error kind {kind}"))]
    UnknownErrorKind { kind: u8 },

    #[snafu(display("{len} trailing bytes after message frame"))]
    TrailingBytes { len: usize },

    #[snafu(display("invalid JSON message: {source}"))]
    Json { source: serde_json::Error },
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum EncodeError {
    #[snafu(display("field {field} is too long to encode ({len} bytes)"))]
    FieldTooLong { field: &'static str, len: usize },

    #[snafu(display("failed to encode JSON message: {source}"))]
    JsonEncode { source: serde_json::Error },
}

/// Wire encoding of a message, picked from the request's content type.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Encoding {
    #[default]
    Binary,
    Json,
}

impl Encoding {
    /// Matches a `content-type` value, ignoring parameters such as `charset`.
    pub fn from_content_type(value: &str) -> Option<Self> {
        let essence = value.split(';').next().unwrap_or_default().trim();
        if essence.eq_ignore_ascii_case(BINARY_CONTENT_TYPE) {
            Some(Encoding::Binary)
        } else if essence.eq_ignore_ascii_case(JSON_CONTENT_TYPE) {
            Some(Encoding::Json)
        } else {
            None
        }
    }

    pub const fn content_type(self) -> &'static str {
        match self {
            Encoding::Binary => BINARY_CONTENT_TYPE,
            Encoding::Json => JSON_CONTENT_TYPE,
        }
    }

    pub fn encode(self, message: &Message) -> Result<Bytes, EncodeError> {
        match self {
            Encoding::Binary => message.encode_binary(),
            Encoding::Json => message.encode_json(),
        }
    }

    pub fn decode(self, bytes: &[u8]) -> Result<MessageBuilder, DecodeError> {
        match self {
            Encoding::Binary => MessageBuilder::decode_binary(bytes),
            Encoding::Json => MessageBuilder::decode_json(bytes),
        }
    }
}

/// Distinguishes failures the protocol understands from opaque ones.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    #[default]
    Unknown,
    /// A failed call to an upstream RPC service; `code` is its status code.
    Rpc,
    /// A transport-level problem such as a closed session.
    Protocol,
}

impl ErrorKind {
    const fn to_wire(self) -> u8 {
        match self {
            ErrorKind::Unknown => 0,
            ErrorKind::Rpc => 1,
            ErrorKind::Protocol => 2,
        }
    }

    fn from_wire(kind: u8) -> Result<Self, DecodeError> {
        match kind {
            0 => Ok(ErrorKind::Unknown),
            1 => Ok(ErrorKind::Rpc),
            2 => Ok(ErrorKind::Protocol),
            kind => UnknownErrorKindSnafu { kind }.fail(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireError {
    pub kind: ErrorKind,
    pub code: i32,
    pub message: String,
}

impl WireError {
    pub fn new(kind: ErrorKind, code: i32, message: impl Into<String>) -> Self {
        Self {
            kind,
            code,
            message: message.into(),
        }
    }
}

/// Data that rides on the HTTP response but never inside the encoded body.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TransportMeta {
    pub cookies: Vec<HeaderValue>,
    pub status: Option<StatusCode>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    trace_id: String,
    session_id: String,
    route_name: String,
    body: Bytes,
    is_terminated: bool,
    is_not_ready: bool,
    is_empty: bool,
    is_error: bool,
    errors: Vec<WireError>,
    poll_delay_ms: Option<u32>,
    transport: TransportMeta,
}

impl Message {
    pub fn builder() -> MessageBuilder {
        MessageBuilder::default()
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn route_name(&self) -> &str {
        &self.route_name
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn into_body(self) -> Bytes {
        self.body
    }

    pub fn has_payload(&self) -> bool {
        !self.body.is_empty()
    }

    pub fn is_terminated(&self) -> bool {
        self.is_terminated
    }

    pub fn is_not_ready(&self) -> bool {
        self.is_not_ready
    }

    pub fn is_empty(&self) -> bool {
        self.is_empty
    }

    pub fn is_error(&self) -> bool {
        self.is_error
    }

    pub fn errors(&self) -> &[WireError] {
        &self.errors
    }

    pub fn poll_delay_ms(&self) -> Option<u32> {
        self.poll_delay_ms
    }

    pub fn transport(&self) -> &TransportMeta {
        &self.transport
    }

    pub fn take_transport(&mut self) -> TransportMeta {
        std::mem::take(&mut self.transport)
    }

    /// Reopens the message for modification, keeping every field.
    pub fn into_builder(self) -> MessageBuilder {
        MessageBuilder {
            trace_id: Some(self.trace_id),
            session_id: Some(self.session_id),
            route_name: Some(self.route_name),
            body: self.body,
            is_terminated: self.is_terminated,
            is_not_ready: self.is_not_ready,
            is_empty: self.is_empty,
            is_error: self.is_error,
            errors: self.errors,
            poll_delay_ms: self.poll_delay_ms,
            transport: self.transport,
        }
    }

    fn flags(&self) -> u8 {
        let mut flags = 0;
        if self.is_terminated {
            flags |= FLAG_TERMINATED;
        }
        if self.is_not_ready {
            flags |= FLAG_NOT_READY;
        }
        if self.is_empty {
            flags |= FLAG_EMPTY;
        }
        if self.is_error {
            flags |= FLAG_ERROR;
        }
        if self.poll_delay_ms.is_some() {
            flags |= FLAG_POLL_DELAY;
        }
        flags
    }

    /// Encodes the compact binary frame.
    ///
    /// Layout: version `u8`, flags `u8`, three `u16`-prefixed strings (trace
    /// id, session id, route name), optional `u32` poll delay, `u32`-prefixed
    /// body, `u16` error count followed by `(u8 kind, i32 code, u32-prefixed
    /// message)` per error. Integers are big-endian.
    pub fn encode_binary(&self) -> Result<Bytes, EncodeError> {
        let mut buf = BytesMut::with_capacity(
            16 + self.trace_id.len()
                + self.session_id.len()
                + self.route_name.len()
                + self.body.len(),
        );
        buf.put_u8(FRAME_VERSION);
        buf.put_u8(self.flags());
        put_str16(&mut buf, "trace_id", &self.trace_id)?;
        put_str16(&mut buf, "session_id", &self.session_id)?;
        put_str16(&mut buf, "route_name", &self.route_name)?;
        if let Some(delay) = self.poll_delay_ms {
            buf.put_u32(delay);
        }
        put_bytes32(&mut buf, "body", &self.body)?;

        let count = u16::try_from(self.errors.len()).map_err(|_| EncodeError::FieldTooLong {
            field: "errors",
            len: self.errors.len(),
        })?;
        buf.put_u16(count);
        for error in &self.errors {
            buf.put_u8(error.kind.to_wire());
            buf.put_i32(error.code);
            put_bytes32(&mut buf, "error.message", error.message.as_bytes())?;
        }
        Ok(buf.freeze())
    }

    pub fn encode_json(&self) -> Result<Bytes, EncodeError> {
        let mirror = JsonMessage {
            trace_id: self.trace_id.clone(),
            session_id: self.session_id.clone(),
            route_name: self.route_name.clone(),
            body: self.body.clone(),
            is_terminated: self.is_terminated,
            is_not_ready: self.is_not_ready,
            is_empty: self.is_empty,
            is_error: self.is_error,
            errors: self.errors.clone(),
            poll_delay_ms: self.poll_delay_ms,
        };
        serde_json::to_vec(&mirror)
            .map(Bytes::from)
            .context(JsonEncodeSnafu)
    }
}

/// Accumulates message fields; metadata is validated by [`build`](Self::build).
///
/// Also used as the outbound item a handler hands to its session: only the
/// body, termination flag, status and cookies matter there, routing metadata
/// is filled in when the poll response is assembled.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MessageBuilder {
    trace_id: Option<String>,
    session_id: Option<String>,
    route_name: Option<String>,
    body: Bytes,
    is_terminated: bool,
    is_not_ready: bool,
    is_empty: bool,
    is_error: bool,
    errors: Vec<WireError>,
    poll_delay_ms: Option<u32>,
    transport: TransportMeta,
}

impl MessageBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    #[must_use]
    pub fn session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    #[must_use]
    pub fn route_name(mut self, route_name: impl Into<String>) -> Self {
        self.route_name = Some(route_name.into());
        self
    }

    #[must_use]
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    #[must_use]
    pub fn terminated(mut self, is_terminated: bool) -> Self {
        self.is_terminated = is_terminated;
        self
    }

    #[must_use]
    pub fn not_ready(mut self, is_not_ready: bool) -> Self {
        self.is_not_ready = is_not_ready;
        self
    }

    #[must_use]
    pub fn empty(mut self, is_empty: bool) -> Self {
        self.is_empty = is_empty;
        self
    }

    /// Appends an error and raises the error flag.
    #[must_use]
    pub fn error(mut self, error: WireError) -> Self {
        self.errors.push(error);
        self.is_error = true;
        self
    }

    #[must_use]
    pub fn errors(mut self, errors: impl IntoIterator<Item = WireError>) -> Self {
        self.errors.extend(errors);
        self.is_error = !self.errors.is_empty();
        self
    }

    #[must_use]
    pub fn poll_delay_ms(mut self, delay: u32) -> Self {
        self.poll_delay_ms = Some(delay);
        self
    }

    #[must_use]
    pub fn status(mut self, status: StatusCode) -> Self {
        self.transport.status = Some(status);
        self
    }

    #[must_use]
    pub fn cookie(mut self, cookie: HeaderValue) -> Self {
        self.transport.cookies.push(cookie);
        self
    }

    #[must_use]
    pub fn cookies(mut self, cookies: impl IntoIterator<Item = HeaderValue>) -> Self {
        self.transport.cookies.extend(cookies);
        self
    }

    pub fn has_trace_id(&self) -> bool {
        self.trace_id.as_deref().is_some_and(|id| !id.is_empty())
    }

    pub fn has_session_id(&self) -> bool {
        self.session_id.as_deref().is_some_and(|id| !id.is_empty())
    }

    pub fn get_route_name(&self) -> Option<&str> {
        self.route_name.as_deref()
    }

    pub fn get_body(&self) -> &Bytes {
        &self.body
    }

    pub fn is_terminated(&self) -> bool {
        self.is_terminated
    }

    pub fn build(self) -> Result<Message, BuildError> {
        let trace_id = non_empty(self.trace_id).ok_or(BuildError::MissingTraceId)?;
        let session_id = non_empty(self.session_id).ok_or(BuildError::MissingSessionId)?;
        let route_name = non_empty(self.route_name).ok_or(BuildError::MissingRouteName)?;

        Ok(Message {
            trace_id,
            session_id,
            route_name,
            body: self.body,
            is_terminated: self.is_terminated,
            is_not_ready: self.is_not_ready,
            is_empty: self.is_empty,
            is_error: self.is_error,
            errors: self.errors,
            poll_delay_ms: self.poll_delay_ms,
            transport: self.transport,
        })
    }

    /// Decodes a binary frame. Empty strings decode as absent metadata so the
    /// router can assign fresh ids.
    pub fn decode_binary(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut buf = bytes;

        ensure!(buf.remaining() >= 2, TruncatedSnafu { field: "header" });
        let version = buf.get_u8();
        ensure!(version == FRAME_VERSION, UnsupportedVersionSnafu { version });
        let flags = buf.get_u8();

        let trace_id = get_str16(&mut buf, "trace_id")?;
        let session_id = get_str16(&mut buf, "session_id")?;
        let route_name = get_str16(&mut buf, "route_name")?;

        let poll_delay_ms = if flags & FLAG_POLL_DELAY != 0 {
            ensure!(buf.remaining() >= 4, TruncatedSnafu { field: "poll_delay_ms" });
            Some(buf.get_u32())
        } else {
            None
        };

        let body = get_bytes32(&mut buf, "body")?;

        ensure!(buf.remaining() >= 2, TruncatedSnafu { field: "errors" });
        let count = buf.get_u16();
        let mut errors = Vec::with_capacity(usize::from(count).min(64));
        for _ in 0..count {
            ensure!(buf.remaining() >= 5, TruncatedSnafu { field: "error" });
            let kind = ErrorKind::from_wire(buf.get_u8())?;
            let code = buf.get_i32();
            let message = get_bytes32(&mut buf, "error.message")?;
            let message = String::from_utf8(message.to_vec()).context(InvalidUtf8Snafu {
                field: "error.message",
            })?;
            errors.push(WireError {
                kind,
                code,
                message,
            });
        }

        ensure!(
            !buf.has_remaining(),
            TrailingBytesSnafu {
                len: buf.remaining()
            }
        );

        Ok(Self {
            trace_id: non_empty(Some(trace_id)),
            session_id: non_empty(Some(session_id)),
            route_name: non_empty(Some(route_name)),
            body,
            is_terminated: flags & FLAG_TERMINATED != 0,
            is_not_ready: flags & FLAG_NOT_READY != 0,
            is_empty: flags & FLAG_EMPTY != 0,
            is_error: flags & FLAG_ERROR != 0,
            errors,
            poll_delay_ms,
            transport: TransportMeta::default(),
        })
    }

    pub fn decode_json(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mirror: JsonMessage = serde_json::from_slice(bytes).context(JsonSnafu)?;
        Ok(Self {
            trace_id: non_empty(Some(mirror.trace_id)),
            session_id: non_empty(Some(mirror.session_id)),
            route_name: non_empty(Some(mirror.route_name)),
            body: mirror.body,
            is_terminated: mirror.is_terminated,
            is_not_ready: mirror.is_not_ready,
            is_empty: mirror.is_empty,
            is_error: mirror.is_error,
            errors: mirror.errors,
            poll_delay_ms: mirror.poll_delay_ms,
            transport: TransportMeta::default(),
        })
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

fn put_str16(buf: &mut BytesMut, field: &'static str, value: &str) -> Result<(), EncodeError> {
    let len = u16::try_from(value.len()).map_err(|_| EncodeError::FieldTooLong {
        field,
        len: value.len(),
    })?;
    buf.put_u16(len);
    buf.put_slice(value.as_bytes());
    Ok(())
}

fn put_bytes32(buf: &mut BytesMut, field: &'static str, value: &[u8]) -> Result<(), EncodeError> {
    let len = u32::try_from(value.len()).map_err(|_| EncodeError::FieldTooLong {
        field,
        len: value.len(),
    })?;
    buf.put_u32(len);
    buf.put_slice(value);
    Ok(())
}

fn get_str16(buf: &mut &[u8], field: &'static str) -> Result<String, DecodeError> {
    ensure!(buf.remaining() >= 2, TruncatedSnafu { field });
    let len = usize::from(buf.get_u16());
    ensure!(buf.remaining() >= len, TruncatedSnafu { field });
    let raw = buf.copy_to_bytes(len);
    String::from_utf8(raw.to_vec()).context(InvalidUtf8Snafu { field })
}

fn get_bytes32(buf: &mut &[u8], field: &'static str) -> Result<Bytes, DecodeError> {
    ensure!(buf.remaining() >= 4, TruncatedSnafu { field });
    let len = buf.get_u32() as usize;
    ensure!(buf.remaining() >= len, TruncatedSnafu { field });
    Ok(buf.copy_to_bytes(len))
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JsonMessage {
    #[serde(default)]
    trace_id: String,
    #[serde(default)]
    session_id: String,
    #[serde(default)]
    route_name: String,
    #[serde(default, with = "base64_body")]
    body: Bytes,
    #[serde(default)]
    is_terminated: bool,
    #[serde(default)]
    is_not_ready: bool,
    #[serde(default)]
    is_empty: bool,
    #[serde(default)]
    is_error: bool,
    #[serde(default)]
    errors: Vec<WireError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    poll_delay_ms: Option<u32>,
}

mod base64_body {
    use super::*;

    pub(super) fn serialize<S: Serializer>(body: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(body))
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64
            .decode(encoded.as_bytes())
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}
