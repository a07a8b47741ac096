// Copyright 2026 BadCompany
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! MCP transport codec.
//!
//! Handles the low-level framing of JSON-RPC messages. Decoding accepts both
//! newline-delimited JSON (the MCP stdio default) and LSP-style
//! Content-Length headers, sniffed per message; encoding always emits
//! newline-delimited JSON.

use crate::engine_core::constants::limits;
use crate::engine_core::models::{JsonRpcRequest, JsonRpcResponse};
use anyhow::{anyhow, Context, Result};
use bytes::BytesMut;
use serde_json::Value;
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

// State machine: sniff the framing, then read a header-framed body if one
// was announced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    Sniff,
    Body(usize),
}

pub struct McpCodec {
    state: DecodeState,
}

impl McpCodec {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: DecodeState::Sniff,
        }
    }

    fn decode_header(&mut self, src: &mut BytesMut) -> Result<bool> {
        // Scan for the end of the header block: \r\n\r\n or \n\n
        let mut end = None;
        for i in 0..src.len() {
            if src[i] == b'\n' {
                if i >= 1 && src[i - 1] == b'\n' {
                    end = Some(i + 1);
                    break;
                }
                if i >= 3 && src[i - 1] == b'\r' && src[i - 2] == b'\n' && src[i - 3] == b'\r' {
                    end = Some(i + 1);
                    break;
                }
            }
        }

        let Some(end) = end else {
            if src.len() > 4096 {
                return Err(anyhow!("Header too large"));
            }
            return Ok(false);
        };

        let header_bytes = src.split_to(end);
        let header_str = std::str::from_utf8(&header_bytes).context("Invalid UTF-8 in headers")?;

        let mut len = 0usize;
        for line in header_str.lines() {
            let lower = line.to_lowercase();
            if lower.starts_with("content-length:") {
                if let Some(value) = line.split(':').nth(1) {
                    len = value
                        .trim()
                        .parse::<usize>()
                        .context("Invalid content-length value")?;
                }
            }
        }

        if len == 0 {
            return Err(anyhow!("Missing or invalid Content-Length header"));
        }
        if len as u64 > limits::MAX_MESSAGE_SIZE_BYTES {
            return Err(anyhow!("Message length {} exceeds max limit", len));
        }

        self.state = DecodeState::Body(len);
        Ok(true)
    }

}

impl Default for McpCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for McpCodec {
    type Item = Value;
    type Error = anyhow::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        trace!("decoder attempting to read from {} bytes buffer", src.len());
        loop {
            match self.state {
                DecodeState::Sniff => {
                    // Skip leading newlines left over from line framing
                    while src.first().is_some_and(|b| *b == b'\n' || *b == b'\r') {
                        let _ = src.split_to(1);
                    }
                    if src.is_empty() {
                        return Ok(None);
                    }

                    if src.starts_with(b"Content-Length")
                        || src.starts_with(b"content-length")
                    {
                        if !self.decode_header(src)? {
                            return Ok(None);
                        }
                        // State moved to Body; loop to read it
                    } else {
                        let Some(pos) = src.iter().position(|&b| b == b'\n') else {
                            if src.len() as u64 > limits::MAX_MESSAGE_SIZE_BYTES {
                                return Err(anyhow!("Message exceeded size limit"));
                            }
                            return Ok(None);
                        };

                        let line = src.split_to(pos + 1);
                        let text = std::str::from_utf8(&line)
                            .context("Invalid UTF-8 in message")?
                            .trim();
                        if text.is_empty() {
                            continue;
                        }
                        let val: Value =
                            serde_json::from_str(text).context("Invalid JSON in message")?;
                        return Ok(Some(val));
                    }
                }
                DecodeState::Body(len) => {
                    if src.len() < len {
                        return Ok(None);
                    }
                    let body = src.split_to(len);
                    self.state = DecodeState::Sniff;
                    let val: Value = serde_json::from_slice(&body)?;
                    trace!("decoded message: {:?}", val);
                    return Ok(Some(val));
                }
            }
        }
    }
}

// Unified encoder for both request and response: newline-delimited JSON,
// the framing MCP stdio servers expect.
impl<'a> Encoder<&'a JsonRpcRequest> for McpCodec {
    type Error = anyhow::Error;
    fn encode(&mut self, item: &'a JsonRpcRequest, dst: &mut BytesMut) -> Result<()> {
        let body = serde_json::to_vec(item)?;
        dst.extend_from_slice(&body);
        dst.extend_from_slice(b"\n");
        Ok(())
    }
}

impl<'a> Encoder<&'a JsonRpcResponse> for McpCodec {
    type Error = anyhow::Error;
    fn encode(&mut self, item: &'a JsonRpcResponse, dst: &mut BytesMut) -> Result<()> {
        let body = serde_json::to_vec(item)?;
        dst.extend_from_slice(&body);
        dst.extend_from_slice(b"\n");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_newline_delimited_json() {
        let mut codec = McpCodec::new();
        let mut buf = BytesMut::from(&b"{\"jsonrpc\":\"2.0\",\"method\":\"ping\"}\n"[..]);
        let val = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(val["method"], "ping");
    }

    #[test]
    fn decodes_content_length_framing() {
        let mut codec = McpCodec::new();
        let body = r#"{"jsonrpc":"2.0","method":"ping"}"#;
        let framed = format!("Content-Length: {}\r\n\r\n{}", body.len(), body);
        let mut buf = BytesMut::from(framed.as_bytes());
        let val = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(val["method"], "ping");
    }

    #[test]
    fn partial_input_yields_none_until_complete() {
        let mut codec = McpCodec::new();
        let mut buf = BytesMut::from(&b"{\"jsonrpc\":\"2.0\""[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b",\"method\":\"ping\"}\n");
        assert!(codec.decode(&mut buf).unwrap().is_some());
    }

    #[test]
    fn decodes_two_messages_with_mixed_framing() {
        let mut codec = McpCodec::new();
        let body = r#"{"jsonrpc":"2.0","method":"b"}"#;
        let mut buf = BytesMut::from(
            format!(
                "{}\nContent-Length: {}\r\n\r\n{}",
                r#"{"jsonrpc":"2.0","method":"a"}"#,
                body.len(),
                body
            )
            .as_bytes(),
        );
        let first = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(first["method"], "a");
        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(second["method"], "b");
    }

    #[test]
    fn encoder_emits_newline_delimited() {
        let mut codec = McpCodec::new();
        let mut buf = BytesMut::new();
        let request = JsonRpcRequest::new(1, "ping", serde_json::json!({}));
        codec.encode(&request, &mut buf).unwrap();
        assert!(buf.ends_with(b"\n"));
        // Round-trip through the decoder
        let val = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(val["method"], "ping");
    }

    #[test]
    fn header_without_content_length_is_an_error() {
        let mut codec = McpCodec::new();
        let mut buf = BytesMut::from(&b"Content-Length: zero\r\n\r\n{}"[..]);
        assert!(codec.decode(&mut buf).is_err());
    }
}
