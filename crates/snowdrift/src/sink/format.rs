//! Record serialisation for upload sinks.

use bytes::{BufMut, Bytes, BytesMut};
use serde_json::Value;

use crate::config::OutputFormat;
use crate::decode::Record;
use crate::error::SinkError;

/// Turns batches into newline-terminated bytes.
#[derive(Debug, Clone, Copy)]
pub struct RecordEncoder {
    format: OutputFormat,
}

impl RecordEncoder {
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    pub fn encode(&self, batch: &[Record]) -> Result<Bytes, SinkError> {
        let mut out = BytesMut::new();
        for record in batch {
            match self.format {
                OutputFormat::Lines => write_lines(&mut out, record),
                OutputFormat::Csv => write_csv(&mut out, record),
                OutputFormat::Ndjson => write_ndjson(&mut out, record)?,
            }
            out.put_u8(b'\n');
        }
        Ok(out.freeze())
    }
}

fn write_lines(out: &mut BytesMut, record: &Record) {
    match record {
        Record::Line(line) => out.put_slice(line.as_bytes()),
        Record::Fields(fields) => write_joined(out, fields.values().map(String::as_str), false),
        Record::Value(Value::String(s)) => out.put_slice(s.as_bytes()),
        Record::Value(value) => out.put_slice(value.to_string().as_bytes()),
    }
}

/// Lines are rows already and go out verbatim.
fn write_csv(out: &mut BytesMut, record: &Record) {
    match record {
        Record::Line(line) => out.put_slice(line.as_bytes()),
        Record::Fields(fields) => write_joined(out, fields.values().map(String::as_str), true),
        Record::Value(Value::Object(object)) => {
            let values: Vec<String> = object.values().map(scalar_text).collect();
            write_joined(out, values.iter().map(String::as_str), true);
        }
        Record::Value(value) => put_csv_field(out, &scalar_text(value)),
    }
}

fn write_ndjson(out: &mut BytesMut, record: &Record) -> Result<(), SinkError> {
    let encoded = match record {
        Record::Line(line) => serde_json::to_vec(line),
        Record::Fields(fields) => serde_json::to_vec(fields),
        Record::Value(value) => serde_json::to_vec(value),
    }
    .map_err(|source| SinkError::Serialize { source })?;
    out.put_slice(&encoded);
    Ok(())
}

fn write_joined<'a>(out: &mut BytesMut, values: impl Iterator<Item = &'a str>, quote: bool) {
    for (i, value) in values.enumerate() {
        if i > 0 {
            out.put_u8(b',');
        }
        if quote {
            put_csv_field(out, value);
        } else {
            out.put_slice(value.as_bytes());
        }
    }
}

fn put_csv_field(out: &mut BytesMut, value: &str) {
    if !value.contains([',', '"', '\n', '\r']) {
        out.put_slice(value.as_bytes());
        return;
    }
    out.put_u8(b'"');
    out.put_slice(value.replace('"', "\"\"").as_bytes());
    out.put_u8(b'"');
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
