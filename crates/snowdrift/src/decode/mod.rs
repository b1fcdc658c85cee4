//! Byte-to-record decoding.
//!
//! - `lines`: delimiter splitting and record extraction
//! - `event_stream`: binary message framing around a query response
//! - `record`: the record and batch types

pub mod event_stream;
mod lines;
mod record;

pub use event_stream::{EventStreamDecoder, decode_frames};
pub use lines::{BatchStream, Extractor, LineDecoder, decode_chunks, decode_lines};
pub use record::{Batch, LINE_COLUMN, Record};
