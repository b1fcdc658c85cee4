//! Binary event-stream framing.
//!
//! Each message is laid out as
//!
//! ```text
//! [total length: u32 BE][header length: u32 BE][prelude checksum: u32]
//! [headers: header length bytes][payload][message checksum: u32]
//! ```
//!
//! so `payload length = total length - header length - 16`. A header entry is
//! `[name length: u8][name][value type: u8][value length: u16 BE][value]`.
//! Checksums are skipped, not verified.
//!
//! Only payloads of `:event-type = Records` messages are passed on, and they
//! are passed on as soon as any part of them is buffered. A message with
//! `:message-type = error` fails the stream; `:event-type = End` marks a clean
//! end. Input that ends without either is a protocol error.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::{Buf, Bytes, BytesMut};
use futures::StreamExt;
use futures::stream;
use snowdrift_core::emit;
use snowdrift_core::metrics::events::FramesDecoded;
use tokio_util::codec::Decoder;

use crate::error::{FrameError, SourceError};
use crate::source::ByteStream;

const PRELUDE_LEN: usize = 12;
const CHECKSUM_LEN: usize = 4;
/// Prelude plus trailing checksum.
pub const MESSAGE_OVERHEAD: u32 = 16;

const MESSAGE_TYPE: &str = ":message-type";
const EVENT_TYPE: &str = ":event-type";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    AwaitingPrelude,
    AwaitingHeaders { header_length: usize, payload_length: usize },
    Payload { remaining: usize, records: bool },
    AwaitingChecksum,
}

/// Incremental decoder yielding `Records` payload pieces.
#[derive(Debug)]
pub struct EventStreamDecoder {
    state: State,
    terminated: bool,
}

impl Default for EventStreamDecoder {
    fn default() -> Self {
        Self {
            state: State::AwaitingPrelude,
            terminated: false,
        }
    }
}

impl EventStreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether an `End` message has been seen.
    pub fn terminated(&self) -> bool {
        self.terminated
    }
}

fn parse_headers(block: &[u8]) -> Result<BTreeMap<String, String>, FrameError> {
    let mut headers = BTreeMap::new();
    let mut offset = 0;

    while offset < block.len() {
        let entry = offset;
        let overrun = || FrameError::HeaderOverrun { offset: entry };
        let text = |bytes: &[u8]| {
            std::str::from_utf8(bytes)
                .map(str::to_string)
                .map_err(|_| FrameError::HeaderEncoding { offset: entry })
        };

        let name_len = *block.get(offset).ok_or_else(overrun)? as usize;
        offset += 1;
        let name = text(block.get(offset..offset + name_len).ok_or_else(overrun)?)?;
        offset += name_len;

        // Value type byte; every header this protocol sends is a string.
        offset += 1;
        let len_bytes = block.get(offset..offset + 2).ok_or_else(overrun)?;
        let value_len = u16::from_be_bytes([len_bytes[0], len_bytes[1]]) as usize;
        offset += 2;
        let value = text(block.get(offset..offset + value_len).ok_or_else(overrun)?)?;
        offset += value_len;

        headers.insert(name, value);
    }
    Ok(headers)
}

impl Decoder for EventStreamDecoder {
    type Item = Bytes;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, FrameError> {
        loop {
            match self.state {
                State::AwaitingPrelude => {
                    if src.len() < PRELUDE_LEN {
                        return Ok(None);
                    }
                    let total_length = src.get_u32();
                    let header_length = src.get_u32();
                    src.advance(CHECKSUM_LEN);

                    let Some(payload_length) = total_length
                        .checked_sub(header_length)
                        .and_then(|n| n.checked_sub(MESSAGE_OVERHEAD))
                    else {
                        return Err(FrameError::InvalidPrelude {
                            total_length,
                            header_length,
                        });
                    };
                    self.state = State::AwaitingHeaders {
                        header_length: header_length as usize,
                        payload_length: payload_length as usize,
                    };
                }
                State::AwaitingHeaders {
                    header_length,
                    payload_length,
                } => {
                    if src.len() < header_length {
                        return Ok(None);
                    }
                    let block = src.split_to(header_length);
                    let headers = parse_headers(&block)?;
                    emit!(FramesDecoded { count: 1 });

                    if headers.get(MESSAGE_TYPE).map(String::as_str) == Some("error") {
                        self.terminated = true;
                        return Err(FrameError::RemoteMessage { headers });
                    }
                    let event_type = headers.get(EVENT_TYPE).map(String::as_str);
                    if event_type == Some("End") {
                        self.terminated = true;
                    }
                    self.state = State::Payload {
                        remaining: payload_length,
                        records: event_type == Some("Records"),
                    };
                }
                State::Payload { remaining: 0, .. } => {
                    self.state = State::AwaitingChecksum;
                }
                State::Payload { remaining, records } => {
                    if src.is_empty() {
                        return Ok(None);
                    }
                    let piece = src.split_to(remaining.min(src.len())).freeze();
                    self.state = State::Payload {
                        remaining: remaining - piece.len(),
                        records,
                    };
                    if records {
                        return Ok(Some(piece));
                    }
                }
                State::AwaitingChecksum => {
                    if src.len() < CHECKSUM_LEN {
                        return Ok(None);
                    }
                    src.advance(CHECKSUM_LEN);
                    self.state = State::AwaitingPrelude;
                }
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, FrameError> {
        if let Some(piece) = self.decode(src)? {
            return Ok(Some(piece));
        }
        if !src.is_empty() || self.state != State::AwaitingPrelude {
            return Err(FrameError::Truncated {
                buffered: src.len(),
            });
        }
        if !self.terminated {
            return Err(FrameError::MissingTerminal);
        }
        Ok(None)
    }
}

/// Unwrap an event-stream body into its `Records` payload bytes.
///
/// Payload pieces are yielded as they arrive; the consumer's pace decides
/// how fast input is pulled.
pub fn decode_frames(input: ByteStream, url: String) -> ByteStream {
    struct Driver {
        input: ByteStream,
        decoder: EventStreamDecoder,
        buffer: BytesMut,
        eof: bool,
        url: Arc<str>,
    }

    let driver = Driver {
        input,
        decoder: EventStreamDecoder::new(),
        buffer: BytesMut::new(),
        eof: false,
        url: url.into(),
    };

    stream::unfold(Some(driver), |driver| async move {
        let mut driver = driver?;
        loop {
            let decoded = if driver.eof {
                driver.decoder.decode_eof(&mut driver.buffer)
            } else {
                driver.decoder.decode(&mut driver.buffer)
            };
            match decoded {
                Ok(Some(piece)) => return Some((Ok(piece), Some(driver))),
                Ok(None) if driver.eof => return None,
                Ok(None) => {}
                Err(source) => {
                    let url = driver.url.to_string();
                    return Some((Err(SourceError::Frame { url, source }), None));
                }
            }

            match driver.input.next().await {
                Some(Ok(chunk)) => driver.buffer.extend_from_slice(&chunk),
                Some(Err(e)) => return Some((Err(e), None)),
                None => driver.eof = true,
            }
        }
    })
    .boxed()
}

/// Encode one message. Used to build fixtures.
pub fn encode_message(headers: &[(&str, &str)], payload: &[u8]) -> Bytes {
    let mut header_block = Vec::new();
    for (name, value) in headers {
        header_block.push(name.len() as u8);
        header_block.extend_from_slice(name.as_bytes());
        header_block.push(7);
        header_block.extend_from_slice(&(value.len() as u16).to_be_bytes());
        header_block.extend_from_slice(value.as_bytes());
    }

    let total = header_block.len() + payload.len() + MESSAGE_OVERHEAD as usize;
    let mut out = BytesMut::with_capacity(total);
    out.extend_from_slice(&(total as u32).to_be_bytes());
    out.extend_from_slice(&(header_block.len() as u32).to_be_bytes());
    out.extend_from_slice(&[0; CHECKSUM_LEN]);
    out.extend_from_slice(&header_block);
    out.extend_from_slice(payload);
    out.extend_from_slice(&[0; CHECKSUM_LEN]);
    out.freeze()
}

/// A `Records` event carrying `payload`.
pub fn records_message(payload: &[u8]) -> Bytes {
    encode_message(
        &[(MESSAGE_TYPE, "event"), (EVENT_TYPE, "Records")],
        payload,
    )
}

/// The terminal `End` event.
pub fn end_message() -> Bytes {
    encode_message(&[(MESSAGE_TYPE, "event"), (EVENT_TYPE, "End")], b"")
}
