//! Codec for the applet stdio protocol.
//!
//! Messages are self-delimiting JSON values written back to back. There is no
//! length prefix and no newline requirement: the decoder finds value
//! boundaries itself and resumes exactly where the previous value ended.
//! Works over any AsyncRead/AsyncWrite via FramedRead/FramedWrite.

use std::io;
use std::marker::PhantomData;

use serde::{Serialize, de::DeserializeOwned};
use tokio_util::bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Errors raised while reading or writing the message stream.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// The child wrote something that is not a well-formed message.
    #[error("malformed message: {0}")]
    Malformed(#[source] serde_json::Error),

    /// The stream ended in the middle of a value.
    #[error("stream ended inside a message ({pending} bytes pending)")]
    Truncated { pending: usize },

    /// The stream ended cleanly between values.
    #[error("end of stream")]
    EndOfStream,

    #[error("failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl ProtocolError {
    /// Short stable label for logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            Self::Malformed(_) => "malformed",
            Self::Truncated { .. } => "truncated",
            Self::EndOfStream => "end_of_stream",
            Self::Encode(_) => "encode",
            Self::Io(_) => "io",
        }
    }
}

/// Codec that reads and writes one self-delimiting JSON value per message.
///
/// A container that does not fit in one read is tracked by a boundary scan
/// kept across calls, so each buffered byte is examined once and the value is
/// parsed once its outermost bracket closes.
pub struct JsonStreamCodec<T> {
    scan: Option<Scan>,
    _phantom: PhantomData<T>,
}

/// Progress through an incomplete object or array at the front of the buffer.
#[derive(Debug, Default)]
struct Scan {
    pos: usize,
    depth: usize,
    in_string: bool,
    escaped: bool,
}

impl Scan {
    /// Examine `bytes[self.pos..]`. Returns the end offset of the value once
    /// its outermost container closes.
    fn advance(&mut self, bytes: &[u8]) -> Option<usize> {
        while let Some(&b) = bytes.get(self.pos) {
            self.pos += 1;
            if self.in_string {
                if self.escaped {
                    self.escaped = false;
                } else if b == b'\\' {
                    self.escaped = true;
                } else if b == b'"' {
                    self.in_string = false;
                }
                continue;
            }
            match b {
                b'"' => self.in_string = true,
                b'{' | b'[' => self.depth += 1,
                b'}' | b']' => {
                    self.depth = self.depth.saturating_sub(1);
                    if self.depth == 0 {
                        return Some(self.pos);
                    }
                }
                _ => {}
            }
        }
        None
    }
}

impl<T> Default for JsonStreamCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> JsonStreamCodec<T> {
    pub fn new() -> Self {
        Self {
            scan: None,
            _phantom: PhantomData,
        }
    }
}

impl<T: DeserializeOwned> Decoder for JsonStreamCodec<T> {
    type Item = T;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(scan) = self.scan.as_mut() {
            let Some(end) = scan.advance(src) else {
                return Ok(None);
            };
            self.scan = None;
            let item = serde_json::from_slice(&src[..end]).map_err(ProtocolError::Malformed)?;
            src.advance(end);
            return Ok(Some(item));
        }

        let mut values = serde_json::Deserializer::from_slice(src).into_iter::<T>();
        match values.next() {
            Some(Ok(item)) => {
                let consumed = values.byte_offset();
                src.advance(consumed);
                Ok(Some(item))
            }
            // Value not complete yet, wait for more bytes.
            Some(Err(e)) if e.is_eof() => {
                let start = src
                    .iter()
                    .position(|b| !b.is_ascii_whitespace())
                    .unwrap_or(src.len());
                if matches!(src.get(start), Some(b'{' | b'[')) {
                    src.advance(start);
                    self.scan = Some(Scan::default());
                    return self.decode(src);
                }
                Ok(None)
            }
            Some(Err(e)) => Err(ProtocolError::Malformed(e)),
            // Only whitespace buffered.
            None => Ok(None),
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(item) = self.decode(src)? {
            return Ok(Some(item));
        }
        self.scan = None;
        if src.iter().all(u8::is_ascii_whitespace) {
            src.clear();
            Ok(None)
        } else {
            Err(ProtocolError::Truncated { pending: src.len() })
        }
    }
}

impl<T: Serialize> Encoder<T> for JsonStreamCodec<T> {
    type Error = ProtocolError;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json = serde_json::to_vec(&item).map_err(ProtocolError::Encode)?;
        tracing::trace!(json_size_bytes = json.len(), "Encoding message");
        dst.extend_from_slice(&json);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::AppletMessage;

    fn codec() -> JsonStreamCodec<AppletMessage> {
        JsonStreamCodec::new()
    }

    #[test]
    fn codec_roundtrip_ping() {
        let mut codec = codec();
        let mut buf = BytesMut::new();

        let msg = AppletMessage::new("ping").with("n", 1);
        codec.encode(msg.clone(), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();

        assert_eq!(decoded, msg);
        assert!(buf.is_empty());
    }

    #[test]
    fn encode_adds_no_framing() {
        let mut buf = BytesMut::new();
        codec()
            .encode(AppletMessage::new("ready"), &mut buf)
            .unwrap();
        assert_eq!(&buf[..], br#"{"kind":"ready","data":{}}"#);
    }

    #[test]
    fn decodes_back_to_back_values_without_delimiters() {
        let mut codec = codec();
        let mut buf = BytesMut::from(&br#"{"kind":"a","data":{}}{"kind":"b","data":{"x":[1,2]}}"#[..]);

        let first = codec.decode(&mut buf).unwrap().unwrap();
        let second = codec.decode(&mut buf).unwrap().unwrap();

        assert_eq!(first.kind, "a");
        assert_eq!(second.kind, "b");
        assert_eq!(second.get("x"), Some(&serde_json::json!([1, 2])));
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn resumes_after_partial_value() {
        let mut codec = codec();
        let mut buf = BytesMut::from(&br#"  {"kind":"hel"#[..]);

        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(br#"lo","data":{"n":1}}
{"kind""#);
        let first = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(first.kind, "hello");
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(br#":"next"}"#);
        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(second.kind, "next");
    }

    #[test]
    fn malformed_value_is_an_error() {
        let mut codec = codec();
        let mut buf = BytesMut::from(&b"{oops}"[..]);

        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));
        assert_eq!(err.as_label(), "malformed");
    }

    #[test]
    fn wrong_shape_is_malformed() {
        let mut codec = codec();
        let mut buf = BytesMut::from(&br#"{"data":{}}"#[..]);

        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));
    }

    #[test]
    fn eof_between_values_is_clean() {
        let mut codec = codec();
        let mut buf = BytesMut::from(&b" \n\t"[..]);

        assert!(codec.decode_eof(&mut buf).unwrap().is_none());
        assert!(buf.is_empty());
    }

    #[test]
    fn eof_inside_value_is_truncated() {
        let mut codec = codec();
        let mut buf = BytesMut::from(&br#"{"kind":"#[..]);

        let err = codec.decode_eof(&mut buf).unwrap_err();
        assert!(matches!(err, ProtocolError::Truncated { pending: 8 }));
    }

    #[test]
    fn eof_still_yields_final_complete_value() {
        let mut codec = codec();
        let mut buf = BytesMut::from(&br#"{"kind":"last"}"#[..]);

        let msg = codec.decode_eof(&mut buf).unwrap().unwrap();
        assert_eq!(msg.kind, "last");
    }

    #[test]
    fn large_value_is_scanned_once() {
        let mut codec = codec();
        let payload = "x".repeat(1 << 20);
        let wire =
            serde_json::to_vec(&AppletMessage::new("blob").with("payload", payload.clone())).unwrap();

        let mut buf = BytesMut::new();
        let mut decoded = None;
        for chunk in wire.chunks(16 * 1024) {
            assert!(decoded.is_none());
            buf.extend_from_slice(chunk);
            decoded = codec.decode(&mut buf).unwrap();
            if decoded.is_none() {
                // The next call picks up after the bytes already examined.
                assert_eq!(codec.scan.as_ref().map(|s| s.pos), Some(buf.len()));
            }
        }

        let msg = decoded.unwrap();
        assert_eq!(msg.kind, "blob");
        assert_eq!(
            msg.get("payload").and_then(serde_json::Value::as_str),
            Some(payload.as_str())
        );
        assert!(buf.is_empty());
        assert!(codec.scan.is_none());
    }

    #[test]
    fn brackets_and_escapes_inside_strings_do_not_end_a_value() {
        let mut codec = codec();
        let wire = br#"{"kind":"x","data":{"s":"}]\"{[\\","t":[1,{"u":"}"}]}}{"kind":"y"}"#;

        let mut buf = BytesMut::new();
        let mut kinds = Vec::new();
        for byte in wire {
            buf.extend_from_slice(&[*byte]);
            while let Some(msg) = codec.decode(&mut buf).unwrap() {
                kinds.push(msg.kind.clone());
                if msg.kind == "x" {
                    assert_eq!(msg.get("s"), Some(&serde_json::json!("}]\"{[\\")));
                }
            }
        }

        assert_eq!(kinds, vec!["x", "y"]);
        assert!(buf.is_empty());
    }

    #[test]
    fn malformed_value_is_reported_once_it_closes() {
        let mut codec = codec();
        let mut buf = BytesMut::from(&br#"{"kind":"a","data":{"n":"#[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(b"oops}}");
        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));
    }

    #[test]
    fn eof_during_scan_is_truncated() {
        let mut codec = codec();
        let mut buf = BytesMut::from(&b"  {\"kind\":\"par"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        let err = codec.decode_eof(&mut buf).unwrap_err();
        assert!(matches!(err, ProtocolError::Truncated { pending: 12 }));
        assert!(codec.scan.is_none());
    }
}
