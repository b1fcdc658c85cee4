//! Streaming decompression of source bytes.

use std::io;
use std::pin::Pin;

use async_compression::tokio::bufread::{BzDecoder, GzipDecoder, ZstdDecoder};
use futures::{StreamExt, TryStreamExt};
use tokio::io::{AsyncBufRead, AsyncRead};
use tokio_util::io::{ReaderStream, StreamReader};

use super::ByteStream;
use crate::config::Compression;
use crate::error::SourceError;

/// Decompress `input` according to `compression`.
///
/// Errors from `input` itself come out unchanged; only codec failures are
/// reported as decompression errors.
pub fn decompress(input: ByteStream, compression: Compression, url: String) -> ByteStream {
    let decoder: Pin<Box<dyn AsyncRead + Send>> = match compression {
        Compression::None => return input,
        Compression::Gzip => {
            let mut gzip = GzipDecoder::new(buffered(input));
            gzip.multiple_members(true);
            Box::pin(gzip)
        }
        Compression::Bzip2 => Box::pin(BzDecoder::new(buffered(input))),
        Compression::Zstd => Box::pin(ZstdDecoder::new(buffered(input))),
    };

    ReaderStream::new(decoder)
        .map_err(move |e| restore(&url, e))
        .boxed()
}

fn buffered(input: ByteStream) -> impl AsyncBufRead + Send + Unpin + 'static {
    StreamReader::new(input.map_err(io::Error::other))
}

/// Recover a [`SourceError`] that was tunnelled through `io::Error`.
fn restore(url: &str, err: io::Error) -> SourceError {
    if !err.get_ref().is_some_and(|inner| inner.is::<SourceError>()) {
        return SourceError::Decompress {
            url: url.to_string(),
            source: err,
        };
    }
    match err.into_inner().map(|inner| inner.downcast::<SourceError>()) {
        Some(Ok(source)) => *source,
        Some(Err(other)) => SourceError::Decompress {
            url: url.to_string(),
            source: io::Error::other(other),
        },
        None => SourceError::Decompress {
            url: url.to_string(),
            source: io::Error::other("decompression failed"),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StorageError;
    use async_compression::tokio::bufread::{BzEncoder, ZstdEncoder};
    use bytes::Bytes;
    use futures::stream;
    use std::io::Write;
    use tokio::io::AsyncReadExt;

    async fn run(compressed: Vec<u8>, compression: Compression) -> Result<Vec<u8>, SourceError> {
        let chunks: Vec<Result<Bytes, SourceError>> = compressed
            .chunks(7)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        let out: Vec<Bytes> = decompress(stream::iter(chunks).boxed(), compression, "obj".into())
            .try_collect()
            .await?;
        Ok(out.concat())
    }

    #[tokio::test]
    async fn test_gzip_multi_member() {
        let mut data = Vec::new();
        for part in [&b"first\n"[..], b"second\n"] {
            let mut gz = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
            gz.write_all(part).unwrap();
            data.extend(gz.finish().unwrap());
        }
        assert_eq!(run(data, Compression::Gzip).await.unwrap(), b"first\nsecond\n");
    }

    #[tokio::test]
    async fn test_zstd_and_bzip2() {
        let plain = b"inventory line\n".repeat(100);

        let mut zstd = Vec::new();
        ZstdEncoder::new(&plain[..]).read_to_end(&mut zstd).await.unwrap();
        assert_eq!(run(zstd, Compression::Zstd).await.unwrap(), plain);

        let mut bz = Vec::new();
        BzEncoder::new(&plain[..]).read_to_end(&mut bz).await.unwrap();
        assert_eq!(run(bz, Compression::Bzip2).await.unwrap(), plain);
    }

    #[tokio::test]
    async fn test_corrupt_input_is_decompress_error() {
        let err = run(b"definitely not gzip".to_vec(), Compression::Gzip)
            .await
            .unwrap_err();
        assert!(matches!(err, SourceError::Decompress { .. }), "{err}");
        assert_eq!(err.url(), "obj");
    }

    #[tokio::test]
    async fn test_upstream_error_passes_through() {
        let upstream: ByteStream = stream::iter(vec![Err(SourceError::Remote {
            url: "obj".into(),
            source: StorageError::InvalidUrl { url: "obj".into() },
        })])
        .boxed();

        let result: Result<Vec<Bytes>, _> = decompress(upstream, Compression::Gzip, "obj".into())
            .try_collect()
            .await;
        assert!(matches!(result, Err(SourceError::Remote { .. })));
    }
}
