//! LSP transport layer - Content-Length framed JSON-RPC
//!
//! `LspCodec` plugs into `tokio_util::codec::{FramedRead, FramedWrite}`.
//! Decoding yields the raw JSON value of each frame; encoding accepts anything
//! serializable (usually an `lsp_server::Message`) and adds the `jsonrpc`
//! member and the header.

use bytes::{Buf, BufMut, BytesMut};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

const HEADER_END: &[u8] = b"\r\n\r\n";

/// Header blocks longer than this are treated as garbage
const MAX_HEADER_LEN: usize = 8 * 1024;

/// Largest frame body accepted from a server
const MAX_BODY_LEN: usize = 64 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("malformed header: {0}")]
    BadHeader(String),

    #[error("missing Content-Length header")]
    MissingContentLength,

    #[error("frame body of {0} bytes exceeds the limit")]
    BodyTooLarge(usize),

    #[error("stream ended inside a frame ({0} bytes buffered)")]
    Truncated(usize),

    #[error("frame body is not valid UTF-8")]
    InvalidUtf8,

    #[error("frame body is not valid JSON: {0}")]
    InvalidJson(#[source] serde_json::Error),

    #[error("failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Default)]
pub struct LspCodec {
    /// Body length of the frame whose header has been consumed
    body_len: Option<usize>,
}

impl LspCodec {
    fn parse_header(block: &[u8]) -> Result<usize, FrameError> {
        let text = std::str::from_utf8(block)
            .map_err(|_| FrameError::BadHeader("header is not valid UTF-8".to_string()))?;

        let mut content_length = None;
        for line in text.split("\r\n") {
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| FrameError::BadHeader(line.to_string()))?;

            if name.trim().eq_ignore_ascii_case("content-length") {
                let len = value
                    .trim()
                    .parse::<usize>()
                    .map_err(|_| FrameError::BadHeader(line.to_string()))?;
                content_length = Some(len);
            }
        }

        match content_length {
            Some(len) if len > MAX_BODY_LEN => Err(FrameError::BodyTooLarge(len)),
            Some(len) => Ok(len),
            None => Err(FrameError::MissingContentLength),
        }
    }
}

impl Decoder for LspCodec {
    type Item = Value;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Value>, FrameError> {
        let body_len = match self.body_len {
            Some(len) => len,
            None => {
                let Some(end) = src.windows(HEADER_END.len()).position(|w| w == HEADER_END)
                else {
                    if src.len() > MAX_HEADER_LEN {
                        return Err(FrameError::BadHeader(format!(
                            "no header terminator within {} bytes",
                            MAX_HEADER_LEN
                        )));
                    }
                    return Ok(None);
                };

                let len = Self::parse_header(&src[..end])?;
                src.advance(end + HEADER_END.len());
                self.body_len = Some(len);
                len
            }
        };

        if src.len() < body_len {
            return Ok(None);
        }

        self.body_len = None;
        let body = src.split_to(body_len);
        let text = std::str::from_utf8(&body).map_err(|_| FrameError::InvalidUtf8)?;
        let value = serde_json::from_str(text).map_err(FrameError::InvalidJson)?;
        Ok(Some(value))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Value>, FrameError> {
        match self.decode(src)? {
            Some(value) => Ok(Some(value)),
            None if src.is_empty() && self.body_len.is_none() => Ok(None),
            None => Err(FrameError::Truncated(src.len())),
        }
    }
}

impl<T: Serialize> Encoder<T> for LspCodec {
    type Error = FrameError;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), FrameError> {
        let frame = encode(&item)?;
        dst.reserve(frame.len());
        dst.put_slice(&frame);
        Ok(())
    }
}

/// Serialize a message as a JSON-RPC 2.0 frame, header included
pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>, FrameError> {
    let mut value = serde_json::to_value(message).map_err(FrameError::Encode)?;
    if let Value::Object(map) = &mut value {
        map.insert("jsonrpc".to_string(), Value::from("2.0"));
    }
    let body = serde_json::to_vec(&value).map_err(FrameError::Encode)?;

    let mut frame = format!("Content-Length: {}\r\n\r\n", body.len()).into_bytes();
    frame.extend_from_slice(&body);
    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn frame(body: &str) -> Vec<u8> {
        format!("Content-Length: {}\r\n\r\n{}", body.len(), body).into_bytes()
    }

    #[test]
    fn test_encode_prepends_byte_length() {
        let frame = encode(&json!({"method": "initialized", "params": {"é": 1}})).unwrap();
        let text = String::from_utf8(frame).unwrap();
        let (header, body) = text.split_once("\r\n\r\n").unwrap();

        assert_eq!(header, format!("Content-Length: {}", body.len()));
        let value: Value = serde_json::from_str(body).unwrap();
        assert_eq!(value["jsonrpc"], "2.0");
        assert_eq!(value["method"], "initialized");
    }

    #[test]
    fn test_decode_back_to_back_frames() {
        let mut codec = LspCodec::default();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&frame(r#"{"id":1,"result":null}"#));
        buf.extend_from_slice(&frame(r#"{"method":"$/progress"}"#));

        let first = codec.decode(&mut buf).unwrap().unwrap();
        let second = codec.decode(&mut buf).unwrap().unwrap();

        assert_eq!(first["id"], 1);
        assert_eq!(second["method"], "$/progress");
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_decode_partial_input() {
        let mut codec = LspCodec::default();
        let bytes = frame(r#"{"method":"window/logMessage","params":{"type":3,"message":"hi"}}"#);
        let mut buf = BytesMut::new();

        // header only, then the body in two pieces
        let split = bytes.windows(4).position(|w| w == b"\r\n\r\n").unwrap() + 4;
        buf.extend_from_slice(&bytes[..split]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&bytes[split..split + 10]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&bytes[split + 10..]);

        let value = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(value["params"]["message"], "hi");
    }

    #[test]
    fn test_decode_accepts_extra_headers() {
        let mut codec = LspCodec::default();
        let body = r#"{"id":2,"result":{}}"#;
        let mut buf = BytesMut::from(
            format!(
                "content-length: {}\r\nContent-Type: application/vscode-jsonrpc; charset=utf-8\r\n\r\n{}",
                body.len(),
                body
            )
            .as_str(),
        );

        let value = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(value["id"], 2);
    }

    #[test]
    fn test_decode_bad_header() {
        let mut codec = LspCodec::default();
        let mut buf = BytesMut::from("garbage line\r\n\r\n{}");
        assert!(matches!(
            codec.decode(&mut buf),
            Err(FrameError::BadHeader(_))
        ));

        let mut codec = LspCodec::default();
        let mut buf = BytesMut::from("Content-Length: many\r\n\r\n{}");
        assert!(matches!(
            codec.decode(&mut buf),
            Err(FrameError::BadHeader(_))
        ));

        let mut codec = LspCodec::default();
        let mut buf = BytesMut::from("Content-Type: text\r\n\r\n{}");
        assert!(matches!(
            codec.decode(&mut buf),
            Err(FrameError::MissingContentLength)
        ));
    }

    #[test]
    fn test_decode_oversized_body() {
        let mut codec = LspCodec::default();
        let mut buf = BytesMut::from("Content-Length: 99999999999999999\r\n\r\n{}");
        assert!(matches!(
            codec.decode(&mut buf),
            Err(FrameError::BodyTooLarge(99999999999999999))
        ));

        // At the limit the codec just waits for more input
        let mut codec = LspCodec::default();
        let mut buf = BytesMut::from(format!("Content-Length: {}\r\n\r\n{{", MAX_BODY_LEN).as_str());
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert!(buf.capacity() < MAX_BODY_LEN);
    }

    #[test]
    fn test_decode_eof_inside_body() {
        let mut codec = LspCodec::default();
        let mut buf = BytesMut::from("Content-Length: 40\r\n\r\n{\"id\":");
        assert!(matches!(
            codec.decode_eof(&mut buf),
            Err(FrameError::Truncated(_))
        ));
    }

    #[test]
    fn test_decode_eof_between_frames() {
        let mut codec = LspCodec::default();
        let mut buf = BytesMut::new();
        assert!(codec.decode_eof(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_decode_invalid_json() {
        let mut codec = LspCodec::default();
        let mut buf = BytesMut::from(frame("{not json").as_slice());
        assert!(matches!(
            codec.decode(&mut buf),
            Err(FrameError::InvalidJson(_))
        ));
    }
}
