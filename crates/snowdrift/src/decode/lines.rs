//! Delimiter-based record splitting across chunk boundaries.
//!
//! The decoder keeps the unterminated tail of the input in `rest`. Every
//! chunk is appended to it and the candidate delimiters are scanned in
//! order; the first one present splits the buffer and the final segment
//! becomes the new `rest`. While no delimiter turns up, only the bytes past
//! what was already scanned (plus a delimiter-sized overlap) are searched.

use std::sync::Arc;

use bytes::Bytes;
use futures::StreamExt;
use futures::stream::{self, BoxStream};
use indexmap::IndexMap;
use snafu::prelude::*;

use super::record::{Batch, Record};
use crate::config::{ExtractorKind, SourceDescriptor};
use crate::error::{
    ColumnCountSnafu, DecodeError, DecodeSnafu, InvalidJsonSnafu, InvalidUtf8Snafu, SourceError,
};
use crate::filter::RecordFilter;
use crate::source::ByteStream;

/// Stream of decoded batches for one or more sources.
pub type BatchStream = BoxStream<'static, Result<Batch, SourceError>>;

/// Turns one line of text into a record.
#[derive(Debug, Clone)]
pub enum Extractor {
    Raw,
    Delimited {
        field_delimiter: String,
        columns: Vec<String>,
    },
    Json,
}

impl Extractor {
    pub fn for_source(source: &SourceDescriptor) -> Self {
        match source.extractor {
            ExtractorKind::Raw => Extractor::Raw,
            ExtractorKind::Delimited => Extractor::Delimited {
                field_delimiter: source.field_delimiter.clone(),
                columns: source.columns.clone(),
            },
            ExtractorKind::Json => Extractor::Json,
        }
    }

    /// Blank lines yield no record for structured extractors.
    fn extract(&self, line: String) -> Result<Option<Record>, DecodeError> {
        match self {
            Extractor::Raw => Ok(Some(Record::Line(line))),
            _ if line.trim().is_empty() => Ok(None),
            Extractor::Json => {
                let value = serde_json::from_str(&line).context(InvalidJsonSnafu)?;
                Ok(Some(Record::Value(value)))
            }
            Extractor::Delimited {
                field_delimiter,
                columns,
            } => {
                let values: Vec<String> = line
                    .trim_end_matches('\r')
                    .split(field_delimiter.as_str())
                    .map(unquote)
                    .collect();
                ensure!(
                    values.len() >= columns.len(),
                    ColumnCountSnafu {
                        expected: columns.len(),
                        found: values.len(),
                    }
                );

                let mut fields = IndexMap::with_capacity(values.len());
                for (index, value) in values.into_iter().enumerate() {
                    let name = columns
                        .get(index)
                        .cloned()
                        .unwrap_or_else(|| format!("_{index}"));
                    fields.insert(name, value);
                }
                Ok(Some(Record::Fields(fields)))
            }
        }
    }
}

fn unquote(field: &str) -> String {
    match field
        .strip_prefix('"')
        .and_then(|inner| inner.strip_suffix('"'))
    {
        Some(inner) => inner.replace("\"\"", "\""),
        None => field.to_string(),
    }
}

/// Stateful splitter from byte chunks to record batches.
#[derive(Debug, Clone)]
pub struct LineDecoder {
    delimiters: Vec<Vec<u8>>,
    extractor: Extractor,
    filter: Option<Arc<RecordFilter>>,
    rest: Vec<u8>,
    /// Prefix of `rest` known to hold no delimiter.
    scanned: usize,
}

impl LineDecoder {
    pub fn new<I, S>(delimiters: I, extractor: Extractor) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            delimiters: delimiters
                .into_iter()
                .map(|d| d.as_ref().as_bytes().to_vec())
                .filter(|d| !d.is_empty())
                .collect(),
            extractor,
            filter: None,
            rest: Vec::new(),
            scanned: 0,
        }
    }

    pub fn with_filter(mut self, filter: Option<Arc<RecordFilter>>) -> Self {
        self.filter = filter;
        self
    }

    /// Feed one chunk. Returns a batch when at least one complete record
    /// survived the filter.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Option<Batch>, DecodeError> {
        self.rest.extend_from_slice(chunk);

        let scanned = self.scanned;
        let Some(delimiter) = self
            .delimiters
            .iter()
            .find(|d| {
                let from = scanned.saturating_sub(d.len() - 1);
                find(&self.rest[from..], d).is_some()
            })
            .cloned()
        else {
            self.scanned = self.rest.len();
            return Ok(None);
        };

        let buffer = std::mem::take(&mut self.rest);
        let mut lines = Vec::new();
        let mut start = 0;
        while let Some(offset) = find(&buffer[start..], &delimiter) {
            lines.push(buffer[start..start + offset].to_vec());
            start += offset + delimiter.len();
        }
        self.rest = buffer[start..].to_vec();
        // The tail may still hold a lower-priority delimiter.
        self.scanned = 0;

        self.process(lines)
    }

    /// Process whatever is left once the input has ended.
    pub fn finish(&mut self) -> Result<Option<Batch>, DecodeError> {
        if self.rest.is_empty() {
            return Ok(None);
        }
        let last = std::mem::take(&mut self.rest);
        self.scanned = 0;
        self.process(vec![last])
    }

    fn process(&self, lines: Vec<Vec<u8>>) -> Result<Option<Batch>, DecodeError> {
        let mut batch = Vec::with_capacity(lines.len());
        for line in lines {
            let line = String::from_utf8(line).context(InvalidUtf8Snafu)?;
            let Some(record) = self.extractor.extract(line)? else {
                continue;
            };
            if self.filter.as_ref().is_none_or(|f| f.matches(&record)) {
                batch.push(record);
            }
        }
        Ok((!batch.is_empty()).then_some(batch))
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.len() == 1 {
        return haystack.iter().position(|b| *b == needle[0]);
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

enum Phase {
    Reading(ByteStream, LineDecoder),
    Done,
}

/// Decode a byte stream into batches. The first error ends the stream.
pub fn decode_lines(bytes: ByteStream, decoder: LineDecoder, url: String) -> BatchStream {
    let url: Arc<str> = url.into();
    stream::unfold(Phase::Reading(bytes, decoder), move |phase| {
        let url = url.clone();
        async move {
            let Phase::Reading(mut bytes, mut decoder) = phase else {
                return None;
            };
            loop {
                let decoded = match bytes.next().await {
                    Some(Ok(chunk)) => decoder.push(&chunk),
                    Some(Err(e)) => return Some((Err(e), Phase::Done)),
                    None => {
                        return match decoder.finish() {
                            Ok(Some(batch)) => Some((Ok(batch), Phase::Done)),
                            Ok(None) => None,
                            Err(source) => Some((
                                Err(SourceError::Decode {
                                    url: url.to_string(),
                                    source,
                                }),
                                Phase::Done,
                            )),
                        };
                    }
                };
                match decoded {
                    Ok(Some(batch)) => return Some((Ok(batch), Phase::Reading(bytes, decoder))),
                    Ok(None) => continue,
                    Err(source) => {
                        let err = Err(source).context(DecodeSnafu {
                            url: url.to_string(),
                        });
                        return Some((err, Phase::Done));
                    }
                }
            }
        }
    })
    .boxed()
}

/// Convenience for tests and benches: decode an in-memory chunk sequence.
pub fn decode_chunks<I>(chunks: I, decoder: LineDecoder) -> Result<Vec<Batch>, DecodeError>
where
    I: IntoIterator<Item = Bytes>,
{
    let mut decoder = decoder;
    let mut batches = Vec::new();
    for chunk in chunks {
        batches.extend(decoder.push(&chunk)?);
    }
    batches.extend(decoder.finish()?);
    Ok(batches)
}
