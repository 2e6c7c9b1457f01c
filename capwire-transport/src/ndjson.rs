// NDJSON framing: exactly one UTF-8 JSON value per newline-terminated
// line. Oversized frames are a protocol violation, not an IO error; the
// session surfaces them as `bad_request`.

use bytes::{Buf, BufMut, BytesMut};
use capwire_core::protocol::{Message, WireError};
use tokio_util::codec::{Decoder, Encoder};

/// Default cap on a single frame.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),
    #[error("invalid JSON: {0}")]
    Json(String),
    #[error("invalid message: {0}")]
    Message(#[from] WireError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Newline-delimited JSON codec for protocol messages.
#[derive(Debug)]
pub struct NdjsonCodec {
    max_frame_size: usize,
}

impl NdjsonCodec {
    pub fn new() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }
}

impl Default for NdjsonCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for NdjsonCodec {
    type Item = Message;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let newline = src.iter().position(|&b| b == b'\n');

        let Some(pos) = newline else {
            if src.len() > self.max_frame_size {
                return Err(CodecError::FrameTooLarge(src.len()));
            }
            return Ok(None);
        };

        if pos > self.max_frame_size {
            return Err(CodecError::FrameTooLarge(pos));
        }

        let line = src.split_to(pos);
        src.advance(1);

        let json: serde_json::Value =
            serde_json::from_slice(&line).map_err(|e| CodecError::Json(e.to_string()))?;
        Ok(Some(Message::from_json(&json)?))
    }
}

impl Encoder<Message> for NdjsonCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let bytes =
            serde_json::to_vec(&item.to_json()).map_err(|e| CodecError::Json(e.to_string()))?;
        if bytes.len() > self.max_frame_size {
            return Err(CodecError::FrameTooLarge(bytes.len()));
        }
        dst.reserve(bytes.len() + 1);
        dst.put_slice(&bytes);
        dst.put_u8(b'\n');
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use capwire_core::protocol::{Expression, ImportId, Message};

    #[test]
    fn encode_appends_newline() {
        let mut codec = NdjsonCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(Message::Pull(ImportId(1)), &mut buf).unwrap();
        assert_eq!(&buf[..], b"[\"pull\",1]\n");
    }

    #[test]
    fn decode_round_trips_multiple_frames() {
        let mut codec = NdjsonCodec::new();
        let mut buf = BytesMut::new();
        codec
            .encode(Message::Push(Expression::String("first".into())), &mut buf)
            .unwrap();
        codec.encode(Message::Pull(ImportId(1)), &mut buf).unwrap();

        match codec.decode(&mut buf).unwrap().unwrap() {
            Message::Push(Expression::String(s)) => assert_eq!(s, "first"),
            other => panic!("unexpected message: {:?}", other),
        }
        assert_eq!(
            codec.decode(&mut buf).unwrap().unwrap(),
            Message::Pull(ImportId(1))
        );
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn partial_frame_waits_for_more_data() {
        let mut codec = NdjsonCodec::new();
        let mut buf = BytesMut::from(&b"[\"pull\","[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.put_slice(b"3]\n");
        assert_eq!(
            codec.decode(&mut buf).unwrap().unwrap(),
            Message::Pull(ImportId(3))
        );
    }

    #[test]
    fn oversized_frames_are_rejected() {
        let mut codec = NdjsonCodec::with_max_frame_size(16);
        let mut buf = BytesMut::new();
        let big = "x".repeat(64);
        assert!(matches!(
            codec.encode(Message::Push(Expression::String(big)), &mut buf),
            Err(CodecError::FrameTooLarge(_))
        ));
    }

    #[test]
    fn garbage_is_a_codec_error() {
        let mut codec = NdjsonCodec::new();
        let mut buf = BytesMut::from(&b"not json\n"[..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(CodecError::Json(_))
        ));
    }
}
