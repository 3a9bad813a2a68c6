use std::fmt;
use std::io::{self, Cursor, Read, Write};

use chrono::{DateTime, SecondsFormat, Utc};
use rmpv::Value;

use crate::config::AppConfig;

pub const DEFAULT_MAX_FRAME_SIZE_BYTES: usize = 8 * 1024 * 1024;
pub const MIN_MAX_FRAME_SIZE_BYTES: usize = 1024;
pub const FRAME_HEADER_SIZE_BYTES: usize = 4;
// Authentication tag appended by the sealed channel.
pub const FRAME_SEAL_OVERHEAD_BYTES: usize = 16;

const COMMAND_KEY: &str = "command";
const ID_KEY: &str = "id";
const DATA_KEY: &str = "data";
const HEARTBEAT_KEY: &str = "heartbeat";
const EMITTED_AT_KEY: &str = "emitted_at";

#[derive(Debug)]
pub enum CodecError {
    InvalidMaxFrameSize { provided: usize, min: usize },
    PayloadTooLarge { size: usize, limit: usize },
    ProtocolZeroLength,
    ProtocolLengthTooLarge { length: usize, limit: usize },
    Io(io::Error),
    MessagePackEncode(rmpv::encode::Error),
    MessagePackDecode(rmpv::decode::Error),
    TrailingDataInPayload,
    EnvelopeMustBeMap,
    MapKeyMustBeUtf8String,
    MissingField { field: &'static str },
    InvalidFieldType { field: &'static str, expected: &'static str },
}

impl CodecError {
    // Peer hung up between frames.
    pub fn is_disconnect(&self) -> bool {
        match self {
            Self::Io(source) => matches!(
                source.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::NotConnected
            ),
            _ => false,
        }
    }
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidMaxFrameSize { provided, min } => write!(
                f,
                "max frame size must be at least {min} bytes and fit in u32, got {provided}"
            ),
            Self::PayloadTooLarge { size, limit } => {
                write!(f, "payload size {size} exceeds limit {limit}")
            }
            Self::ProtocolZeroLength => {
                write!(f, "protocol error: frame length cannot be zero")
            }
            Self::ProtocolLengthTooLarge { length, limit } => write!(
                f,
                "protocol error: frame length {length} exceeds max {limit}"
            ),
            Self::Io(source) => write!(f, "frame io error: {source}"),
            Self::MessagePackEncode(source) => write!(f, "messagepack encode error: {source}"),
            Self::MessagePackDecode(source) => write!(f, "messagepack decode error: {source}"),
            Self::TrailingDataInPayload => write!(f, "payload contains trailing MessagePack data"),
            Self::EnvelopeMustBeMap => write!(f, "message envelope must be a map"),
            Self::MapKeyMustBeUtf8String => write!(f, "map keys must be UTF-8 strings"),
            Self::MissingField { field } => write!(f, "missing envelope field '{field}'"),
            Self::InvalidFieldType { field, expected } => {
                write!(f, "invalid field type for '{field}', expected {expected}")
            }
        }
    }
}

impl std::error::Error for CodecError {}

impl From<io::Error> for CodecError {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

/// Decoded request or reply body.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageParts {
    pub command: String,
    pub id: u32,
    pub data: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HeartbeatFrame {
    pub sequence: u64,
    pub emitted_at: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WireCodec {
    max_frame_size_bytes: usize,
}

impl Default for WireCodec {
    fn default() -> Self {
        Self {
            max_frame_size_bytes: DEFAULT_MAX_FRAME_SIZE_BYTES,
        }
    }
}

impl WireCodec {
    pub fn new(max_frame_size_bytes: usize) -> Result<Self, CodecError> {
        if max_frame_size_bytes < MIN_MAX_FRAME_SIZE_BYTES
            || max_frame_size_bytes + FRAME_SEAL_OVERHEAD_BYTES > u32::MAX as usize
        {
            return Err(CodecError::InvalidMaxFrameSize {
                provided: max_frame_size_bytes,
                min: MIN_MAX_FRAME_SIZE_BYTES,
            });
        }

        Ok(Self {
            max_frame_size_bytes,
        })
    }

    pub fn from_app_config(app_config: &AppConfig) -> Result<Self, CodecError> {
        Self::new(app_config.wire.max_frame_size_bytes)
    }

    pub fn max_frame_size_bytes(&self) -> usize {
        self.max_frame_size_bytes
    }

    pub fn write_frame(&self, writer: &mut impl Write, body: &[u8]) -> Result<(), CodecError> {
        if body.is_empty() {
            return Err(CodecError::ProtocolZeroLength);
        }
        let limit = self.wire_limit();
        if body.len() > limit {
            return Err(CodecError::PayloadTooLarge {
                size: body.len(),
                limit,
            });
        }

        let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE_BYTES + body.len());
        frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
        frame.extend_from_slice(body);
        writer.write_all(&frame)?;
        writer.flush()?;
        Ok(())
    }

    pub fn read_frame(&self, reader: &mut impl Read) -> Result<Vec<u8>, CodecError> {
        let mut header = [0_u8; FRAME_HEADER_SIZE_BYTES];
        reader.read_exact(&mut header)?;

        let declared_len = u32::from_be_bytes(header) as usize;
        if declared_len == 0 {
            return Err(CodecError::ProtocolZeroLength);
        }
        let limit = self.wire_limit();
        if declared_len > limit {
            return Err(CodecError::ProtocolLengthTooLarge {
                length: declared_len,
                limit,
            });
        }

        let mut body = vec![0_u8; declared_len];
        reader.read_exact(&mut body)?;
        Ok(body)
    }

    pub fn encode_message(&self, command: &str, id: u32, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        let value = Value::Map(vec![
            (Value::String(COMMAND_KEY.into()), Value::String(command.into())),
            (Value::String(ID_KEY.into()), Value::Integer(id.into())),
            (Value::String(DATA_KEY.into()), Value::Binary(data.to_vec())),
        ]);
        self.encode_value(&value)
    }

    pub fn decode_message(&self, body: &[u8]) -> Result<MessageParts, CodecError> {
        let entries = self.decode_map(body)?;

        let command = required_field(&entries, COMMAND_KEY)?
            .as_str()
            .ok_or(CodecError::InvalidFieldType {
                field: COMMAND_KEY,
                expected: "utf-8 string",
            })?
            .to_owned();
        let id = required_field(&entries, ID_KEY)?
            .as_u64()
            .and_then(|id| u32::try_from(id).ok())
            .ok_or(CodecError::InvalidFieldType {
                field: ID_KEY,
                expected: "uint32",
            })?;
        let data = match required_field(&entries, DATA_KEY)? {
            Value::Binary(bytes) => bytes.clone(),
            _ => {
                return Err(CodecError::InvalidFieldType {
                    field: DATA_KEY,
                    expected: "binary",
                })
            }
        };

        Ok(MessageParts { command, id, data })
    }

    pub fn encode_heartbeat(
        &self,
        sequence: u64,
        emitted_at: DateTime<Utc>,
    ) -> Result<Vec<u8>, CodecError> {
        let value = Value::Map(vec![
            (Value::String(HEARTBEAT_KEY.into()), Value::Integer(sequence.into())),
            (
                Value::String(EMITTED_AT_KEY.into()),
                Value::String(
                    emitted_at
                        .to_rfc3339_opts(SecondsFormat::Millis, true)
                        .into(),
                ),
            ),
        ]);
        self.encode_value(&value)
    }

    pub fn decode_heartbeat(&self, body: &[u8]) -> Result<HeartbeatFrame, CodecError> {
        let entries = self.decode_map(body)?;

        let sequence = required_field(&entries, HEARTBEAT_KEY)?
            .as_u64()
            .ok_or(CodecError::InvalidFieldType {
                field: HEARTBEAT_KEY,
                expected: "unsigned integer",
            })?;
        let emitted_at = required_field(&entries, EMITTED_AT_KEY)?
            .as_str()
            .ok_or(CodecError::InvalidFieldType {
                field: EMITTED_AT_KEY,
                expected: "utf-8 string",
            })?
            .to_owned();

        Ok(HeartbeatFrame {
            sequence,
            emitted_at,
        })
    }

    fn wire_limit(&self) -> usize {
        self.max_frame_size_bytes + FRAME_SEAL_OVERHEAD_BYTES
    }

    fn encode_value(&self, value: &Value) -> Result<Vec<u8>, CodecError> {
        let mut encoded = Vec::new();
        rmpv::encode::write_value(&mut encoded, value).map_err(CodecError::MessagePackEncode)?;

        if encoded.len() > self.max_frame_size_bytes {
            return Err(CodecError::PayloadTooLarge {
                size: encoded.len(),
                limit: self.max_frame_size_bytes,
            });
        }

        Ok(encoded)
    }

    fn decode_map(&self, body: &[u8]) -> Result<Vec<(String, Value)>, CodecError> {
        if body.is_empty() {
            return Err(CodecError::ProtocolZeroLength);
        }
        if body.len() > self.max_frame_size_bytes {
            return Err(CodecError::PayloadTooLarge {
                size: body.len(),
                limit: self.max_frame_size_bytes,
            });
        }

        let mut cursor = Cursor::new(body);
        let value = rmpv::decode::read_value(&mut cursor).map_err(CodecError::MessagePackDecode)?;
        if cursor.position() as usize != body.len() {
            return Err(CodecError::TrailingDataInPayload);
        }

        let Value::Map(entries) = value else {
            return Err(CodecError::EnvelopeMustBeMap);
        };

        entries
            .into_iter()
            .map(|(key, value)| Ok((parse_key(key)?, value)))
            .collect()
    }
}

fn parse_key(key: Value) -> Result<String, CodecError> {
    let Value::String(text) = key else {
        return Err(CodecError::MapKeyMustBeUtf8String);
    };

    let Some(text) = text.as_str() else {
        return Err(CodecError::MapKeyMustBeUtf8String);
    };

    Ok(text.to_owned())
}

fn required_field<'a>(
    entries: &'a [(String, Value)],
    field: &'static str,
) -> Result<&'a Value, CodecError> {
    entries
        .iter()
        .find(|(key, _)| key == field)
        .map(|(_, value)| value)
        .ok_or(CodecError::MissingField { field })
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use chrono::Utc;
    use rmpv::Value;

    use super::{CodecError, WireCodec, FRAME_SEAL_OVERHEAD_BYTES, MIN_MAX_FRAME_SIZE_BYTES};

    fn small_codec() -> WireCodec {
        WireCodec::new(MIN_MAX_FRAME_SIZE_BYTES).expect("codec should build")
    }

    #[test]
    fn message_survives_framing() {
        let codec = WireCodec::default();
        let body = codec
            .encode_message("echo", 9, b"hi")
            .expect("message should encode");

        let mut wire = Vec::new();
        codec.write_frame(&mut wire, &body).expect("frame should write");
        let read_back = codec
            .read_frame(&mut Cursor::new(wire))
            .expect("frame should read");
        let parts = codec.decode_message(&read_back).expect("message should decode");

        assert_eq!(parts.command, "echo");
        assert_eq!(parts.id, 9);
        assert_eq!(parts.data, b"hi");
    }

    #[test]
    fn rejects_max_frame_size_below_floor() {
        let error = WireCodec::new(16).expect_err("tiny limit should be rejected");
        assert!(matches!(error, CodecError::InvalidMaxFrameSize { provided: 16, .. }));
    }

    #[test]
    fn rejects_zero_length_frame() {
        let codec = WireCodec::default();
        let error = codec
            .read_frame(&mut Cursor::new(vec![0_u8, 0, 0, 0]))
            .expect_err("zero-length frame should fail");

        assert!(matches!(error, CodecError::ProtocolZeroLength));
    }

    #[test]
    fn rejects_declared_length_above_limit() {
        let codec = small_codec();
        let declared = ((MIN_MAX_FRAME_SIZE_BYTES + FRAME_SEAL_OVERHEAD_BYTES + 1) as u32).to_be_bytes();
        let error = codec
            .read_frame(&mut Cursor::new(declared.to_vec()))
            .expect_err("oversized frame should fail");

        assert!(matches!(error, CodecError::ProtocolLengthTooLarge { .. }));
    }

    #[test]
    fn truncated_frame_reports_disconnect() {
        let codec = WireCodec::default();
        let mut wire = 10_u32.to_be_bytes().to_vec();
        wire.extend_from_slice(b"abc");

        let error = codec
            .read_frame(&mut Cursor::new(wire))
            .expect_err("short body should fail");
        assert!(error.is_disconnect());
    }

    #[test]
    fn rejects_oversized_message_on_encode() {
        let codec = small_codec();
        let error = codec
            .encode_message("blob", 1, &vec![0x41; MIN_MAX_FRAME_SIZE_BYTES])
            .expect_err("oversized payload should fail");

        assert!(matches!(error, CodecError::PayloadTooLarge { .. }));
    }

    #[test]
    fn rejects_message_without_command() {
        let codec = WireCodec::default();
        let value = Value::Map(vec![
            (Value::String("id".into()), Value::Integer(1.into())),
            (Value::String("data".into()), Value::Binary(vec![])),
        ]);
        let mut body = Vec::new();
        rmpv::encode::write_value(&mut body, &value).expect("test payload should encode");

        let error = codec.decode_message(&body).expect_err("missing command should fail");
        assert!(matches!(error, CodecError::MissingField { field: "command" }));
    }

    #[test]
    fn rejects_id_wider_than_u32() {
        let codec = WireCodec::default();
        let value = Value::Map(vec![
            (Value::String("command".into()), Value::String("ping".into())),
            (Value::String("id".into()), Value::Integer((u32::MAX as u64 + 1).into())),
            (Value::String("data".into()), Value::Binary(vec![])),
        ]);
        let mut body = Vec::new();
        rmpv::encode::write_value(&mut body, &value).expect("test payload should encode");

        let error = codec.decode_message(&body).expect_err("wide id should fail");
        assert!(matches!(error, CodecError::InvalidFieldType { field: "id", .. }));
    }

    #[test]
    fn rejects_non_string_map_keys() {
        let codec = WireCodec::default();
        let value = Value::Map(vec![(Value::Integer(1.into()), Value::String("x".into()))]);
        let mut body = Vec::new();
        rmpv::encode::write_value(&mut body, &value).expect("test payload should encode");

        let error = codec.decode_message(&body).expect_err("non-string key should fail");
        assert!(matches!(error, CodecError::MapKeyMustBeUtf8String));
    }

    #[test]
    fn rejects_trailing_data_in_payload() {
        let codec = WireCodec::default();
        let mut body = codec
            .encode_message("ping", 1, b"")
            .expect("message should encode");
        rmpv::encode::write_value(&mut body, &Value::Nil).expect("second object should encode");

        let error = codec.decode_message(&body).expect_err("trailing data should fail");
        assert!(matches!(error, CodecError::TrailingDataInPayload));
    }

    #[test]
    fn heartbeat_frame_carries_sequence_and_timestamp() {
        let codec = WireCodec::default();
        let body = codec
            .encode_heartbeat(41, Utc::now())
            .expect("heartbeat should encode");
        let frame = codec.decode_heartbeat(&body).expect("heartbeat should decode");

        assert_eq!(frame.sequence, 41);
        assert!(frame.emitted_at.ends_with('Z'));
    }
}
