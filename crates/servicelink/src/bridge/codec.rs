//! Framed codec for channel messages.
//!
//! Uses LengthDelimitedCodec for framing. A message is two frames: the command
//! name, then the argument payload. Works over any AsyncRead/AsyncWrite.
//!
//! Payload layout (version 1, all integers big-endian):
//!
//! ```text
//! [version: u8][count: u32][value]*count
//!
//! value := tag: u8, body
//!   0 Null   -
//!   1 Bool   u8 (0 or 1)
//!   2 Int    i64
//!   3 Float  f64 bits
//!   4 Str    len: u32, UTF-8 bytes
//!   5 Bytes  len: u32, raw bytes
//!   6 List   count: u32, value*count
//! ```

use std::io;

use tokio_util::bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use super::protocol::{Message, Value, validate_command};

pub const PAYLOAD_VERSION: u8 = 1;

/// Largest single frame accepted on either side.
pub const MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

const MAX_DEPTH: usize = 32;

const TAG_NULL: u8 = 0;
const TAG_BOOL: u8 = 1;
const TAG_INT: u8 = 2;
const TAG_FLOAT: u8 = 3;
const TAG_STR: u8 = 4;
const TAG_BYTES: u8 = 5;
const TAG_LIST: u8 = 6;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("unsupported payload version {0}")]
    UnsupportedVersion(u8),
    #[error("unknown value tag {0:#04x}")]
    UnknownTag(u8),
    #[error("payload truncated: needed {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },
    #[error("string value is not valid UTF-8")]
    InvalidUtf8,
    #[error("values nested deeper than {MAX_DEPTH} levels")]
    TooDeep,
    #[error("{0} trailing bytes after payload")]
    TrailingBytes(usize),
    #[error("invalid command name {0:?}")]
    InvalidCommand(String),
    #[error("value too large to encode ({0} bytes or elements)")]
    TooLarge(usize),
}

/// Encode an argument list into a payload frame.
pub fn encode_args(args: &[Value]) -> Result<Bytes, CodecError> {
    let mut buf = BytesMut::with_capacity(16);
    buf.put_u8(PAYLOAD_VERSION);
    put_len(&mut buf, args.len())?;
    for value in args {
        encode_value(value, &mut buf, 0)?;
    }
    Ok(buf.freeze())
}

/// Decode a payload frame produced by [`encode_args`].
pub fn decode_args(payload: &[u8]) -> Result<Vec<Value>, CodecError> {
    let mut buf = payload;
    ensure(&buf, 1)?;
    let version = buf.get_u8();
    if version != PAYLOAD_VERSION {
        return Err(CodecError::UnsupportedVersion(version));
    }
    let values = decode_seq(&mut buf, 0)?;
    if buf.has_remaining() {
        return Err(CodecError::TrailingBytes(buf.remaining()));
    }
    Ok(values)
}

fn put_len(buf: &mut BytesMut, len: usize) -> Result<(), CodecError> {
    let len = u32::try_from(len).map_err(|_| CodecError::TooLarge(len))?;
    buf.put_u32(len);
    Ok(())
}

fn encode_value(value: &Value, buf: &mut BytesMut, depth: usize) -> Result<(), CodecError> {
    if depth >= MAX_DEPTH {
        return Err(CodecError::TooDeep);
    }
    match value {
        Value::Null => buf.put_u8(TAG_NULL),
        Value::Bool(b) => {
            buf.put_u8(TAG_BOOL);
            buf.put_u8(u8::from(*b));
        }
        Value::Int(n) => {
            buf.put_u8(TAG_INT);
            buf.put_i64(*n);
        }
        Value::Float(x) => {
            buf.put_u8(TAG_FLOAT);
            buf.put_u64(x.to_bits());
        }
        Value::Str(s) => {
            buf.put_u8(TAG_STR);
            put_len(buf, s.len())?;
            buf.put_slice(s.as_bytes());
        }
        Value::Bytes(b) => {
            buf.put_u8(TAG_BYTES);
            put_len(buf, b.len())?;
            buf.put_slice(b);
        }
        Value::List(items) => {
            buf.put_u8(TAG_LIST);
            put_len(buf, items.len())?;
            for item in items {
                encode_value(item, buf, depth + 1)?;
            }
        }
    }
    Ok(())
}

fn ensure(buf: &&[u8], needed: usize) -> Result<(), CodecError> {
    if buf.remaining() < needed {
        return Err(CodecError::Truncated {
            needed,
            remaining: buf.remaining(),
        });
    }
    Ok(())
}

fn decode_seq(buf: &mut &[u8], depth: usize) -> Result<Vec<Value>, CodecError> {
    ensure(buf, 4)?;
    let count = buf.get_u32() as usize;
    // Every value takes at least one byte, so a count beyond what is left is a lie.
    let mut values = Vec::with_capacity(count.min(buf.remaining()));
    for _ in 0..count {
        values.push(decode_value(buf, depth)?);
    }
    Ok(values)
}

fn decode_value(buf: &mut &[u8], depth: usize) -> Result<Value, CodecError> {
    if depth >= MAX_DEPTH {
        return Err(CodecError::TooDeep);
    }
    ensure(buf, 1)?;
    let value = match buf.get_u8() {
        TAG_NULL => Value::Null,
        TAG_BOOL => {
            ensure(buf, 1)?;
            Value::Bool(buf.get_u8() != 0)
        }
        TAG_INT => {
            ensure(buf, 8)?;
            Value::Int(buf.get_i64())
        }
        TAG_FLOAT => {
            ensure(buf, 8)?;
            Value::Float(f64::from_bits(buf.get_u64()))
        }
        TAG_STR => {
            let raw = take_bytes(buf)?;
            Value::Str(String::from_utf8(raw).map_err(|_| CodecError::InvalidUtf8)?)
        }
        TAG_BYTES => Value::Bytes(take_bytes(buf)?),
        TAG_LIST => Value::List(decode_seq(buf, depth + 1)?),
        tag => return Err(CodecError::UnknownTag(tag)),
    };
    Ok(value)
}

fn take_bytes(buf: &mut &[u8]) -> Result<Vec<u8>, CodecError> {
    ensure(buf, 4)?;
    let len = buf.get_u32() as usize;
    ensure(buf, len)?;
    let raw = buf[..len].to_vec();
    buf.advance(len);
    Ok(raw)
}

fn invalid_data(e: CodecError) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e)
}

/// Codec that frames [`Message`]s as a command frame plus a payload frame.
///
/// Wraps LengthDelimitedCodec; a command frame whose payload has not arrived
/// yet is held until the next call.
#[derive(Debug)]
pub struct MessageCodec {
    inner: LengthDelimitedCodec,
    pending_command: Option<String>,
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageCodec {
    pub fn new() -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .length_field_length(4)
                .max_frame_length(MAX_FRAME_LENGTH)
                .new_codec(),
            pending_command: None,
        }
    }
}

fn parse_command(frame: &[u8]) -> io::Result<String> {
    let command = std::str::from_utf8(frame)
        .map_err(|_| invalid_data(CodecError::InvalidCommand(String::from_utf8_lossy(frame).into_owned())))?;
    validate_command(command).map_err(invalid_data)?;
    Ok(command.to_string())
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let command = match self.pending_command.take() {
            Some(command) => command,
            None => match self.inner.decode(src)? {
                Some(frame) => parse_command(&frame)?,
                None => return Ok(None),
            },
        };

        match self.inner.decode(src)? {
            Some(payload) => {
                let args = decode_args(&payload).map_err(invalid_data)?;
                Ok(Some(Message { command, args }))
            }
            None => {
                self.pending_command = Some(command);
                Ok(None)
            }
        }
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        validate_command(&item.command).map_err(invalid_data)?;
        let payload = encode_args(&item.args).map_err(invalid_data)?;
        let payload_len = payload.len();
        // Checked up front so a rejected payload leaves no orphaned command frame.
        if payload_len > MAX_FRAME_LENGTH {
            return Err(invalid_data(CodecError::TooLarge(payload_len)));
        }
        tracing::trace!(command = %item.command, payload_size_bytes = payload_len, "Encoding message");
        if payload_len > 100_000 {
            tracing::info!(
                command = %item.command,
                payload_size_bytes = payload_len,
                payload_size_kb = payload_len / 1024,
                "Large payload being encoded"
            );
        }
        self.inner
            .encode(Bytes::copy_from_slice(item.command.as_bytes()), dst)?;
        self.inner.encode(payload, dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::{QUIT, READY};

    fn sample_args() -> Vec<Value> {
        vec![
            Value::Null,
            Value::Bool(true),
            Value::Bool(false),
            Value::Int(-42),
            Value::Int(i64::MAX),
            Value::Float(2.5),
            Value::Float(-0.0),
            Value::Str("héllo".to_string()),
            Value::Str(String::new()),
            Value::Bytes(vec![0, 255, 7]),
            Value::List(vec![
                Value::Int(1),
                Value::List(vec![Value::from("nested")]),
                Value::List(Vec::new()),
            ]),
        ]
    }

    #[test]
    fn args_roundtrip() {
        let args = sample_args();
        let payload = encode_args(&args).unwrap();
        assert_eq!(decode_args(&payload).unwrap(), args);
    }

    #[test]
    fn nan_keeps_its_bits() {
        let nan = f64::from_bits(0x7ff8_0000_dead_beef);
        let payload = encode_args(&[Value::Float(nan), Value::Float(f64::NEG_INFINITY)]).unwrap();
        match decode_args(&payload).unwrap().as_slice() {
            [Value::Float(a), Value::Float(b)] => {
                assert_eq!(a.to_bits(), nan.to_bits());
                assert_eq!(*b, f64::NEG_INFINITY);
            }
            other => panic!("unexpected decode: {other:?}"),
        }
    }

    #[test]
    fn deepest_allowed_nesting_roundtrips() {
        // MAX_DEPTH lists, the innermost empty.
        let mut value = Value::List(Vec::new());
        for _ in 1..MAX_DEPTH {
            value = Value::List(vec![value]);
        }
        let args = vec![value, Value::List(vec![Value::List(Vec::new()), Value::Null])];
        let payload = encode_args(&args).unwrap();
        assert_eq!(decode_args(&payload).unwrap(), args);
    }

    #[test]
    fn decoder_bounds_nesting_too() {
        let mut payload = vec![PAYLOAD_VERSION, 0, 0, 0, 1];
        for _ in 0..=MAX_DEPTH {
            payload.extend_from_slice(&[TAG_LIST, 0, 0, 0, 1]);
        }
        payload.push(TAG_NULL);
        assert_eq!(decode_args(&payload), Err(CodecError::TooDeep));
    }

    #[test]
    fn largest_string_fits_one_frame() {
        // version + count + tag + length prefix
        let overhead = 1 + 4 + 1 + 4;
        let big = "x".repeat(MAX_FRAME_LENGTH - overhead);
        let msg = Message::new("ECHO", vec![Value::Str(big)]);

        let mut codec = MessageCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(msg.clone(), &mut buf).unwrap();
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), msg);
        assert!(buf.is_empty());
    }

    #[test]
    fn oversized_payload_writes_nothing() {
        let overhead = 1 + 4 + 1 + 4;
        let msg = Message::new("ECHO", vec![Value::Str("x".repeat(MAX_FRAME_LENGTH - overhead + 1))]);

        let mut codec = MessageCodec::new();
        let mut buf = BytesMut::new();
        let err = codec.encode(msg, &mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert!(buf.is_empty());
    }

    #[test]
    fn empty_args_roundtrip() {
        let payload = encode_args(&[]).unwrap();
        assert_eq!(&payload[..], &[PAYLOAD_VERSION, 0, 0, 0, 0]);
        assert!(decode_args(&payload).unwrap().is_empty());
    }

    #[test]
    fn payload_layout_is_stable() {
        let payload = encode_args(&[Value::from("hi"), Value::Int(5)]).unwrap();
        assert_eq!(
            &payload[..],
            &[
                1, // version
                0, 0, 0, 2, // count
                TAG_STR, 0, 0, 0, 2, b'h', b'i', //
                TAG_INT, 0, 0, 0, 0, 0, 0, 0, 5,
            ]
        );
    }

    #[test]
    fn rejects_unknown_version() {
        assert_eq!(
            decode_args(&[9, 0, 0, 0, 0]),
            Err(CodecError::UnsupportedVersion(9))
        );
    }

    #[test]
    fn rejects_unknown_tag() {
        assert_eq!(
            decode_args(&[1, 0, 0, 0, 1, 0x7f]),
            Err(CodecError::UnknownTag(0x7f))
        );
    }

    #[test]
    fn rejects_truncated_string() {
        let err = decode_args(&[1, 0, 0, 0, 1, TAG_STR, 0, 0, 0, 10, b'a']).unwrap_err();
        assert_eq!(
            err,
            CodecError::Truncated {
                needed: 10,
                remaining: 1
            }
        );
    }

    #[test]
    fn rejects_inflated_count() {
        // Claims a billion values but carries none.
        let err = decode_args(&[1, 0x3b, 0x9a, 0xca, 0x00]).unwrap_err();
        assert!(matches!(err, CodecError::Truncated { .. }));
    }

    #[test]
    fn rejects_trailing_bytes() {
        let mut payload = encode_args(&[Value::Null]).unwrap().to_vec();
        payload.extend_from_slice(&[0, 0]);
        assert_eq!(decode_args(&payload), Err(CodecError::TrailingBytes(2)));
    }

    #[test]
    fn rejects_invalid_utf8() {
        let err = decode_args(&[1, 0, 0, 0, 1, TAG_STR, 0, 0, 0, 1, 0xff]).unwrap_err();
        assert_eq!(err, CodecError::InvalidUtf8);
    }

    #[test]
    fn nesting_is_bounded() {
        let mut value = Value::Null;
        for _ in 0..MAX_DEPTH + 1 {
            value = Value::List(vec![value]);
        }
        assert_eq!(encode_args(&[value]), Err(CodecError::TooDeep));
    }

    #[test]
    fn codec_roundtrip_message() {
        let mut codec = MessageCodec::new();
        let mut buf = BytesMut::new();

        let msg = Message::new("COMPUTE", vec!["2".into(), "3".into()]);
        codec.encode(msg.clone(), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();

        assert_eq!(decoded, msg);
        assert!(buf.is_empty());
    }

    #[test]
    fn codec_decodes_back_to_back_messages() {
        let mut codec = MessageCodec::new();
        let mut buf = BytesMut::new();

        codec
            .encode(Message::new(READY, vec!["tcp://127.0.0.1:4000".into()]), &mut buf)
            .unwrap();
        codec.encode(Message::bare(QUIT), &mut buf).unwrap();

        assert_eq!(codec.decode(&mut buf).unwrap().unwrap().command, READY);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap().command, QUIT);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn codec_waits_for_payload_frame() {
        let mut codec = MessageCodec::new();
        let mut encoded = BytesMut::new();
        let msg = Message::new("ECHO", vec!["hi".into()]);
        codec.encode(msg.clone(), &mut encoded).unwrap();

        // command frame is 4 + 4 bytes; deliver it plus one byte of the payload header
        let mut buf = encoded.split_to(9);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&encoded);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), msg);
    }

    #[test]
    fn codec_rejects_invalid_command_on_encode() {
        let mut codec = MessageCodec::new();
        let mut buf = BytesMut::new();
        let err = codec
            .encode(Message::bare("NOT VALID"), &mut buf)
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert!(buf.is_empty());
    }

    #[test]
    fn codec_rejects_invalid_command_on_decode() {
        let mut raw = LengthDelimitedCodec::builder()
            .length_field_length(4)
            .new_codec();
        let mut buf = BytesMut::new();
        raw.encode(Bytes::from_static(b"bad name"), &mut buf).unwrap();
        raw.encode(encode_args(&[]).unwrap(), &mut buf).unwrap();

        let err = MessageCodec::new().decode(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
