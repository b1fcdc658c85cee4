//! Source input: remote access, decompression and the per-source decode chain.

mod compression;
mod remote;

pub use compression::decompress;
pub use remote::{ObjectInfo, RemoteSource, RemoteSourceRef, StorageRemote};

use std::sync::Arc;

use bytes::Bytes;
use futures::stream::BoxStream;

use crate::config::{Framing, SourceDescriptor};
use crate::decode::{BatchStream, Extractor, LineDecoder, decode_frames, decode_lines};
use crate::error::SourceError;
use crate::filter::RecordFilter;

/// Raw bytes of one source, in order.
pub type ByteStream = BoxStream<'static, Result<Bytes, SourceError>>;

/// Turn a source's object bytes into record batches.
///
/// Layers, outermost first: event-stream unframing, decompression, line
/// decoding with the source's own predicate.
pub fn decode_source(
    source: &SourceDescriptor,
    bytes: ByteStream,
    filter: Option<Arc<RecordFilter>>,
) -> BatchStream {
    let bytes = match source.framing {
        Framing::Raw => bytes,
        Framing::EventStream => decode_frames(bytes, source.url.clone()),
    };
    let bytes = decompress(bytes, source.compression, source.url.clone());
    let decoder = LineDecoder::new(&source.record_delimiters, Extractor::for_source(source))
        .with_filter(filter);
    decode_lines(bytes, decoder, source.url.clone())
}
