use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::marker::PhantomData;
use thiserror::Error;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

/// One transport message as carried over an NDJSON stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WireEvent {
    pub event: String,
    pub source: String,
    #[serde(default)]
    pub payload: Value,
}

/// Outbound request addressed to one server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WireRequest {
    pub event: String,
    pub destination: String,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame exceeds max size: {size} > {max}")]
    OversizedFrame { size: usize, max: usize },
    #[error("buffer exceeds max size without delimiter: {size} > {max}")]
    OversizedBuffer { size: usize, max: usize },
    #[error("frame encode failed: {0}")]
    Encode(String),
    #[error("frame decode failed: {0}")]
    Decode(String),
}

#[derive(Debug, Clone)]
pub struct DecodeReport<T> {
    pub frames: Vec<T>,
    pub errors: Vec<FrameError>,
}

impl<T> Default for DecodeReport<T> {
    fn default() -> Self {
        Self {
            frames: Vec::new(),
            errors: Vec::new(),
        }
    }
}

/// Serializes `value` as one newline-terminated line.
pub fn encode_frame<T: Serialize>(
    value: &T,
    max_frame_bytes: usize,
) -> Result<Vec<u8>, FrameError> {
    let mut line =
        serde_json::to_vec(value).map_err(|err| FrameError::Encode(err.to_string()))?;
    check_size(line.len(), max_frame_bytes)?;
    line.push(b'\n');
    Ok(line)
}

pub fn decode_frame<T: DeserializeOwned>(
    line: &[u8],
    max_frame_bytes: usize,
) -> Result<T, FrameError> {
    let line = strip_terminator(line);
    check_size(line.len(), max_frame_bytes)?;
    serde_json::from_slice(line).map_err(|err| FrameError::Decode(err.to_string()))
}

fn check_size(size: usize, max: usize) -> Result<(), FrameError> {
    if size > max {
        Err(FrameError::OversizedFrame { size, max })
    } else {
        Ok(())
    }
}

fn strip_terminator(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

fn is_blank(line: &[u8]) -> bool {
    line.iter().all(u8::is_ascii_whitespace)
}

/// Incremental NDJSON decoder. A bad line is reported and skipped; decoding
/// carries on with the next line.
pub struct NdjsonFrameDecoder<T> {
    max_frame_bytes: usize,
    buffer: Vec<u8>,
    marker: PhantomData<T>,
}

impl<T> NdjsonFrameDecoder<T> {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            max_frame_bytes,
            buffer: Vec::new(),
            marker: PhantomData,
        }
    }
}

impl<T> Default for NdjsonFrameDecoder<T> {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}

impl<T: DeserializeOwned> NdjsonFrameDecoder<T> {
    pub fn push_chunk(&mut self, chunk: &[u8]) -> DecodeReport<T> {
        self.buffer.extend_from_slice(chunk);
        let mut report = DecodeReport::default();

        let mut consumed = 0;
        while let Some(offset) = self.buffer[consumed..].iter().position(|b| *b == b'\n') {
            let end = consumed + offset + 1;
            let line = &self.buffer[consumed..end];
            if !is_blank(line) {
                report.push(decode_frame(line, self.max_frame_bytes));
            }
            consumed = end;
        }
        self.buffer.drain(..consumed);

        // An unterminated line this large can never become a valid frame.
        if self.buffer.len() > self.max_frame_bytes {
            report.errors.push(FrameError::OversizedBuffer {
                size: self.buffer.len(),
                max: self.max_frame_bytes,
            });
            self.buffer.clear();
        }
        report
    }

    /// Decodes whatever is left once the stream has ended.
    pub fn finish(&mut self) -> DecodeReport<T> {
        let rest = std::mem::take(&mut self.buffer);
        let mut report = DecodeReport::default();
        if !is_blank(&rest) {
            report.push(decode_frame(&rest, self.max_frame_bytes));
        }
        report
    }
}

impl<T> DecodeReport<T> {
    fn push(&mut self, decoded: Result<T, FrameError>) {
        match decoded {
            Ok(frame) => self.frames.push(frame),
            Err(err) => self.errors.push(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn hello(source: &str) -> WireEvent {
        WireEvent {
            event: "App.Out.Hello".to_string(),
            source: source.to_string(),
            payload: json!({"app_host": "node7", "pid": 4411}),
        }
    }

    #[test]
    fn decoder_handles_split_chunks() {
        let frame = encode_frame(&hello("gw1.srvA"), DEFAULT_MAX_FRAME_BYTES).expect("encode");
        let (head, tail) = frame.split_at(frame.len() / 2);

        let mut decoder = NdjsonFrameDecoder::<WireEvent>::default();
        assert!(decoder.push_chunk(head).frames.is_empty());
        let report = decoder.push_chunk(tail);
        assert_eq!(report.frames, vec![hello("gw1.srvA")]);
        assert!(report.errors.is_empty());
    }

    #[test]
    fn decoder_recovers_after_malformed_line() {
        let mut chunk = encode_frame(&hello("a"), DEFAULT_MAX_FRAME_BYTES).expect("encode");
        chunk.extend_from_slice(b"{\"event\": \n");
        chunk.extend_from_slice(b"\r\n");
        let second = encode_frame(&hello("b"), DEFAULT_MAX_FRAME_BYTES).expect("encode");
        chunk.extend_from_slice(&second);

        let mut decoder = NdjsonFrameDecoder::<WireEvent>::default();
        let report = decoder.push_chunk(&chunk);
        assert_eq!(report.frames.len(), 2);
        assert_eq!(report.errors.len(), 1);
        assert!(matches!(report.errors[0], FrameError::Decode(_)));
    }

    #[test]
    fn finish_decodes_unterminated_tail() {
        let mut decoder = NdjsonFrameDecoder::<WireEvent>::default();
        let frame = serde_json::to_vec(&hello("tail")).expect("json");
        assert!(decoder.push_chunk(&frame).frames.is_empty());
        let report = decoder.finish();
        assert_eq!(report.frames, vec![hello("tail")]);
    }

    #[test]
    fn oversized_frames_are_rejected_both_ways() {
        let big = WireEvent {
            payload: json!({"text": "x".repeat(256)}),
            ..hello("a")
        };
        assert!(matches!(
            encode_frame(&big, 64),
            Err(FrameError::OversizedFrame { .. })
        ));

        let mut chunk = encode_frame(&big, DEFAULT_MAX_FRAME_BYTES).expect("encode");
        let second = encode_frame(&hello("b"), DEFAULT_MAX_FRAME_BYTES).expect("encode");
        chunk.extend_from_slice(&second);
        let mut decoder = NdjsonFrameDecoder::<WireEvent>::new(128);
        let report = decoder.push_chunk(&chunk);
        assert_eq!(report.frames.len(), 1);
        assert!(matches!(
            report.errors[0],
            FrameError::OversizedFrame { .. }
        ));
    }

    #[test]
    fn payload_defaults_to_null() {
        let event: WireEvent =
            decode_frame(br#"{"event":"App.Out.Bye","source":"gw1.srvA"}"#, 1024).expect("decode");
        assert_eq!(event.payload, Value::Null);
    }
}
