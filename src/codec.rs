//! Wire framing: each frame is a 3-element MessagePack array
//! `[span, type, args]`, concatenated on the stream with no separator.
//!
//! Encoding and decoding go through `rmpv`. Decoding is incremental: frames
//! are pulled out of a growable byte buffer, and a short buffer is reported
//! as "need more" rather than an error.

use std::io::{Cursor, ErrorKind};

use bytes::{Buf, BytesMut};
use rmpv::Value;

use crate::error::{ProtocolError, Result};

/// A decoded wire frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Channel identifier, unique within a session.
    pub span: u64,
    /// Message type code, interpreted against the channel's event protocol.
    pub ty: u64,
    /// Message payload.
    pub args: Vec<Value>,
}

/// The payload of a frame once the session has routed it to its channel.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Message type code within the channel's event protocol.
    pub ty: u64,
    /// Message payload.
    pub args: Vec<Value>,
}

impl Frame {
    /// Converts the frame to its wire value.
    pub fn to_value(&self) -> Value {
        Value::Array(vec![
            Value::from(self.span),
            Value::from(self.ty),
            Value::Array(self.args.clone()),
        ])
    }

    /// Parses a frame from a wire value.
    pub fn from_value(value: Value) -> Result<Self> {
        let array = match value {
            Value::Array(array) => array,
            _ => return Err(ProtocolError::from("frame is not an array").into()),
        };
        if array.len() != 3 {
            return Err(ProtocolError::from(format!(
                "frame has {} elements, expected 3",
                array.len()
            ))
            .into());
        }
        let mut fields = array.into_iter();
        let span = fields
            .next()
            .and_then(|v| v.as_u64())
            .ok_or_else(|| ProtocolError::from("frame span is not an unsigned integer"))?;
        let ty = fields
            .next()
            .and_then(|v| v.as_u64())
            .ok_or_else(|| ProtocolError::from("frame type is not an unsigned integer"))?;
        let args = match fields.next() {
            Some(Value::Array(args)) => args,
            _ => return Err(ProtocolError::from("frame args is not an array").into()),
        };
        Ok(Self { span, ty, args })
    }

    pub fn into_message(self) -> (u64, Message) {
        (
            self.span,
            Message {
                ty: self.ty,
                args: self.args,
            },
        )
    }
}

/// Encodes one frame to its wire bytes.
pub fn encode_frame(span: u64, ty: u64, args: &[Value]) -> Result<Vec<u8>> {
    let frame = Frame {
        span,
        ty,
        args: args.to_vec(),
    };
    let mut buffer = Vec::new();
    rmpv::encode::write_value(&mut buffer, &frame.to_value())?;
    Ok(buffer)
}

/// Incremental frame decoder over a reusable byte buffer.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: BytesMut,
}

impl FrameDecoder {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(capacity),
        }
    }

    /// The buffer to append raw bytes to, e.g. via `AsyncReadExt::read_buf`.
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buffer
    }

    /// Whether any undecoded bytes are buffered.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Pulls the next complete frame out of the buffer. Returns `Ok(None)`
    /// when the buffered bytes do not yet hold a full frame.
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        if self.buffer.is_empty() {
            return Ok(None);
        }
        let mut cursor = Cursor::new(&self.buffer[..]);
        match rmpv::decode::read_value(&mut cursor) {
            Ok(value) => {
                let consumed = cursor.position() as usize;
                self.buffer.advance(consumed);
                Frame::from_value(value).map(Some)
            }
            Err(
                rmpv::decode::Error::InvalidMarkerRead(ref e)
                | rmpv::decode::Error::InvalidDataRead(ref e),
            ) if e.kind() == ErrorKind::UnexpectedEof => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::error::Error;

    use super::*;

    fn sample_frames() -> Vec<Frame> {
        vec![
            Frame {
                span: 1,
                ty: 0,
                args: vec![Value::String("hello".into()), Value::from(42)],
            },
            Frame {
                span: u64::MAX,
                ty: 2,
                args: vec![],
            },
            Frame {
                span: 3,
                ty: 1,
                args: vec![
                    Value::Array(vec![Value::from(1), Value::from(2)]),
                    Value::Map(vec![(Value::String("key".into()), Value::Boolean(true))]),
                ],
            },
        ]
    }

    #[test]
    fn round_trip_reproduces_frame_and_bytes() {
        for frame in sample_frames() {
            let bytes = encode_frame(frame.span, frame.ty, &frame.args).unwrap();
            let mut decoder = FrameDecoder::with_capacity(64);
            decoder.buffer_mut().extend_from_slice(&bytes);
            let decoded = decoder.next_frame().unwrap().expect("complete frame");
            assert_eq!(decoded, frame);
            assert!(decoder.is_empty());
            // Re-encoding yields identical bytes.
            let reencoded = encode_frame(decoded.span, decoded.ty, &decoded.args).unwrap();
            assert_eq!(reencoded, bytes);
        }
    }

    #[test]
    fn short_buffer_reports_need_more() {
        let frames = sample_frames();
        let frame = &frames[0];
        let bytes = encode_frame(frame.span, frame.ty, &frame.args).unwrap();
        let mut decoder = FrameDecoder::with_capacity(64);
        for split in 1..bytes.len() {
            decoder.buffer_mut().extend_from_slice(&bytes[..split]);
            assert!(decoder.next_frame().unwrap().is_none());
            decoder.buffer_mut().clear();
        }
        // Feeding the remainder completes the frame.
        decoder.buffer_mut().extend_from_slice(&bytes[..5]);
        assert!(decoder.next_frame().unwrap().is_none());
        decoder.buffer_mut().extend_from_slice(&bytes[5..]);
        assert_eq!(decoder.next_frame().unwrap().unwrap(), *frame);
    }

    #[test]
    fn concatenated_frames_decode_in_order() {
        let frames = sample_frames();
        let mut decoder = FrameDecoder::with_capacity(64);
        for frame in &frames {
            let bytes = encode_frame(frame.span, frame.ty, &frame.args).unwrap();
            decoder.buffer_mut().extend_from_slice(&bytes);
        }
        for frame in &frames {
            assert_eq!(decoder.next_frame().unwrap().unwrap(), *frame);
        }
        assert!(decoder.next_frame().unwrap().is_none());
    }

    #[test]
    fn malformed_frames_are_rejected() {
        let malformed = vec![
            Value::Nil,
            Value::Boolean(true),
            Value::String("not a frame".into()),
            Value::Array(vec![]),
            Value::Array(vec![Value::from(1), Value::from(0)]),
            Value::Array(vec![
                Value::String("span".into()),
                Value::from(0),
                Value::Array(vec![]),
            ]),
            Value::Array(vec![Value::from(1), Value::from(0), Value::Nil]),
            Value::Array(vec![
                Value::from(1),
                Value::from(0),
                Value::Array(vec![]),
                Value::Nil,
            ]),
        ];
        for value in malformed {
            assert!(matches!(
                Frame::from_value(value),
                Err(Error::Protocol(ProtocolError::MalformedFrame(_)))
            ));
        }
    }
}
