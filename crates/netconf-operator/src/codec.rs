// Copyright (C) 2025-present The NetGauze Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or
// implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Framing codec for NETCONF over SSH as per
//! [RFC 6242](https://datatracker.ietf.org/doc/html/rfc6242).
//!
//! The codec starts with the end-of-message framing used for the `<hello>`
//! exchange. When both sides announce `base:1.1` the session switches to the
//! chunked framing, otherwise end-of-message framing is kept for the whole
//! session. Frames are handed out as raw bytes, classifying them is the job
//! of [crate::message].

use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

const END_OF_MESSAGE: &[u8] = b"]]>]]>";
const CHUNK_START: &[u8] = b"\n#";
const END_OF_CHUNKS: &[u8] = b"\n##\n";

/// Maximum chunk size as per RFC 6242
const MAX_CHUNK_SIZE: u64 = 4294967295;

/// Maximum length of chunk size in characters
const MAX_CHUNK_SIZE_LEN: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, strum_macros::Display)]
pub enum Framing {
    /// `]]>]]>` delimited messages (NETCONF 1.0 and every `<hello>`)
    #[default]
    #[strum(to_string = "end-of-message")]
    EndOfMessage,

    /// `\n#<size>\n` chunks terminated by `\n##\n` (NETCONF 1.1)
    #[strum(to_string = "chunked")]
    Chunked,
}

#[derive(Debug, strum_macros::Display)]
pub enum FrameCodecError {
    #[strum(to_string = "std::io:Error: `{0}`")]
    IO(std::io::Error),

    #[strum(to_string = "invalid chunk header: {0}")]
    InvalidChunkHeader(String),

    #[strum(to_string = "invalid chunk size: {0}")]
    InvalidChunkSize(u64),

    #[strum(to_string = "end of chunks marker received before any chunk")]
    EmptyMessage,

    #[strum(to_string = "frame exceeds the maximum allowed length of {0} bytes")]
    FrameTooLong(usize),
}

impl std::error::Error for FrameCodecError {}

impl From<std::io::Error> for FrameCodecError {
    fn from(err: std::io::Error) -> Self {
        Self::IO(err)
    }
}

impl PartialEq for FrameCodecError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::IO(_), Self::IO(_)) => true,
            (Self::InvalidChunkHeader(a), Self::InvalidChunkHeader(b)) => a == b,
            (Self::InvalidChunkSize(a), Self::InvalidChunkSize(b)) => a == b,
            (Self::EmptyMessage, Self::EmptyMessage) => true,
            (Self::FrameTooLong(a), Self::FrameTooLong(b)) => a == b,
            _ => false,
        }
    }
}

#[derive(Debug)]
pub struct FrameCodec {
    framing: Framing,
    /// Accumulates the chunks of the message being decoded
    buf: BytesMut,
    max_frame_len: usize,
}

impl FrameCodec {
    /// Default upper bound for a single decoded message
    pub const DEFAULT_MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

    pub fn new() -> Self {
        Self {
            framing: Framing::EndOfMessage,
            buf: BytesMut::new(),
            max_frame_len: Self::DEFAULT_MAX_FRAME_LEN,
        }
    }

    pub const fn with_max_frame_len(mut self, max_frame_len: usize) -> Self {
        self.max_frame_len = max_frame_len;
        self
    }

    pub const fn framing(&self) -> Framing {
        self.framing
    }

    pub fn set_framing(&mut self, framing: Framing) {
        self.framing = framing;
    }

    fn decode_end_of_message(
        &mut self,
        src: &mut BytesMut,
    ) -> Result<Option<Bytes>, FrameCodecError> {
        let pos = src
            .windows(END_OF_MESSAGE.len())
            .position(|w| w == END_OF_MESSAGE);
        match pos {
            Some(pos) => {
                let frame = src.split_to(pos).freeze();
                src.advance(END_OF_MESSAGE.len());
                Ok(Some(trim_leading_whitespace(frame)))
            }
            None if src.len() > self.max_frame_len => {
                Err(FrameCodecError::FrameTooLong(self.max_frame_len))
            }
            None => Ok(None),
        }
    }

    fn decode_chunked(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, FrameCodecError> {
        loop {
            if src.len() < CHUNK_START.len() + 1 {
                return Ok(None);
            }
            if !src.starts_with(CHUNK_START) {
                return Err(FrameCodecError::InvalidChunkHeader(
                    "expected chunk start sequence or end of chunks marker".to_string(),
                ));
            }
            if src[CHUNK_START.len()] == b'#' {
                if src.len() < END_OF_CHUNKS.len() {
                    return Ok(None);
                }
                if !src.starts_with(END_OF_CHUNKS) {
                    return Err(FrameCodecError::InvalidChunkHeader(
                        "end of chunks marker is not terminated with a newline".to_string(),
                    ));
                }
                src.advance(END_OF_CHUNKS.len());
                if self.buf.is_empty() {
                    return Err(FrameCodecError::EmptyMessage);
                }
                let frame = self.buf.split().freeze();
                if tracing::enabled!(tracing::Level::TRACE) {
                    tracing::trace!("Decoded chunked message: `{:?}`", std::str::from_utf8(&frame));
                }
                return Ok(Some(frame));
            }

            // The size field is at most 10 digits followed by a new line
            let size_start = CHUNK_START.len();
            let search_end = src.len().min(size_start + MAX_CHUNK_SIZE_LEN + 1);
            let size_end = match src[size_start..search_end].iter().position(|&b| b == b'\n') {
                Some(pos) => size_start + pos,
                None if search_end - size_start > MAX_CHUNK_SIZE_LEN => {
                    return Err(FrameCodecError::InvalidChunkHeader(
                        "chunk size is not properly terminated with a newline".to_string(),
                    ));
                }
                None => return Ok(None),
            };
            let size_field = &src[size_start..size_end];
            if size_field.is_empty()
                || size_field[0] == b'0'
                || !size_field.iter().all(u8::is_ascii_digit)
            {
                return Err(FrameCodecError::InvalidChunkHeader(format!(
                    "chunk size `{}` is not a positive decimal number",
                    String::from_utf8_lossy(size_field)
                )));
            }
            let chunk_size = size_field
                .iter()
                .fold(0u64, |acc, digit| acc * 10 + u64::from(digit - b'0'));
            if chunk_size > MAX_CHUNK_SIZE {
                return Err(FrameCodecError::InvalidChunkSize(chunk_size));
            }
            let chunk_size = chunk_size as usize;
            if self.buf.len() + chunk_size > self.max_frame_len {
                return Err(FrameCodecError::FrameTooLong(self.max_frame_len));
            }

            let data_start = size_end + 1;
            if src.len() < data_start + chunk_size {
                src.reserve(data_start + chunk_size - src.len());
                return Ok(None);
            }
            src.advance(data_start);
            self.buf.extend_from_slice(&src[..chunk_size]);
            src.advance(chunk_size);
        }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

fn trim_leading_whitespace(frame: Bytes) -> Bytes {
    let start = frame
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(frame.len());
    frame.slice(start..)
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = FrameCodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.framing {
            Framing::EndOfMessage => self.decode_end_of_message(src),
            Framing::Chunked => self.decode_chunked(src),
        }
    }
}

impl<T: AsRef<[u8]>> Encoder<T> for FrameCodec {
    type Error = FrameCodecError;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload = item.as_ref();
        if tracing::enabled!(tracing::Level::TRACE) {
            tracing::trace!(
                "Encoding {} message: `{:?}`",
                self.framing,
                std::str::from_utf8(payload)
            );
        }
        match self.framing {
            Framing::EndOfMessage => {
                dst.reserve(payload.len() + END_OF_MESSAGE.len());
                dst.extend_from_slice(payload);
                dst.extend_from_slice(END_OF_MESSAGE);
            }
            Framing::Chunked => {
                if payload.is_empty() {
                    return Err(FrameCodecError::EmptyMessage);
                }
                let header = format!("\n#{}\n", payload.len());
                dst.reserve(header.len() + payload.len() + END_OF_CHUNKS.len());
                dst.extend_from_slice(header.as_bytes());
                dst.extend_from_slice(payload);
                dst.extend_from_slice(END_OF_CHUNKS);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_end_of_message_decoding() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from("\n<hello/>]]>]]><rpc-reply/>]]>");
        assert_eq!(
            codec.decode(&mut buf),
            Ok(Some(Bytes::from_static(b"<hello/>")))
        );
        assert_eq!(codec.decode(&mut buf), Ok(None));
        buf.extend_from_slice(b"]]>");
        assert_eq!(
            codec.decode(&mut buf),
            Ok(Some(Bytes::from_static(b"<rpc-reply/>")))
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn test_chunked_decoding() {
        let input = "\n#4\n<rpc\n#18\n message-id=\"102\"\n\n#79\n     xmlns=\"urn:ietf:params:xml:ns:netconf:base:1.0\">\n  <close-session/>\n</rpc>\n##\n";
        let mut codec = FrameCodec::new();
        codec.set_framing(Framing::Chunked);
        let mut buf = BytesMut::from(input);
        let frame = codec.decode(&mut buf).expect("valid frame").expect("complete frame");
        assert_eq!(
            std::str::from_utf8(&frame).expect("utf8"),
            "<rpc message-id=\"102\"\n     xmlns=\"urn:ietf:params:xml:ns:netconf:base:1.0\">\n  <close-session/>\n</rpc>"
        );
        assert_eq!(codec.decode(&mut buf), Ok(None));
    }

    #[test]
    fn test_chunked_decoding_partial_input() {
        let mut codec = FrameCodec::new();
        codec.set_framing(Framing::Chunked);
        let mut buf = BytesMut::from("\n#1");
        assert_eq!(codec.decode(&mut buf), Ok(None));
        buf.extend_from_slice(b"0\n<ok/>");
        assert_eq!(codec.decode(&mut buf), Ok(None));
        buf.extend_from_slice(b"</ok>\n#");
        assert_eq!(codec.decode(&mut buf), Ok(None));
        buf.extend_from_slice(b"#\n");
        assert_eq!(
            codec.decode(&mut buf),
            Ok(Some(Bytes::from_static(b"<ok/></ok>")))
        );
    }

    #[test]
    fn test_chunked_decoding_errors() {
        let mut codec = FrameCodec::new();
        codec.set_framing(Framing::Chunked);
        let mut buf = BytesMut::from("\n#0\n");
        assert!(matches!(
            codec.decode(&mut buf),
            Err(FrameCodecError::InvalidChunkHeader(_))
        ));

        let mut codec = FrameCodec::new();
        codec.set_framing(Framing::Chunked);
        let mut buf = BytesMut::from("\n#4294967296\n");
        assert_eq!(
            codec.decode(&mut buf),
            Err(FrameCodecError::InvalidChunkSize(4294967296))
        );

        let mut codec = FrameCodec::new();
        codec.set_framing(Framing::Chunked);
        let mut buf = BytesMut::from("\n##\n");
        assert_eq!(codec.decode(&mut buf), Err(FrameCodecError::EmptyMessage));

        let mut codec = FrameCodec::new();
        codec.set_framing(Framing::Chunked);
        let mut buf = BytesMut::from("<rpc-reply/>");
        assert!(matches!(
            codec.decode(&mut buf),
            Err(FrameCodecError::InvalidChunkHeader(_))
        ));
    }

    #[test]
    fn test_frame_too_long() {
        let mut codec = FrameCodec::new().with_max_frame_len(8);
        codec.set_framing(Framing::Chunked);
        let mut buf = BytesMut::from("\n#9\n");
        assert_eq!(codec.decode(&mut buf), Err(FrameCodecError::FrameTooLong(8)));
    }

    #[test]
    fn test_encoding() {
        let mut codec = FrameCodec::new();
        let mut dst = BytesMut::new();
        codec.encode("<hello/>", &mut dst).expect("encoded");
        assert_eq!(&dst[..], b"<hello/>]]>]]>");

        codec.set_framing(Framing::Chunked);
        let mut dst = BytesMut::new();
        codec.encode("<rpc/>".to_string(), &mut dst).expect("encoded");
        assert_eq!(&dst[..], b"\n#6\n<rpc/>\n##\n");
        assert_eq!(
            codec.encode("", &mut BytesMut::new()),
            Err(FrameCodecError::EmptyMessage)
        );
    }
}
