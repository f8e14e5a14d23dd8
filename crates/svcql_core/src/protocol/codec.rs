//! Binary row stream used by the query protocol.
//!
//! Every string is a `u32` big endian byte length followed by UTF-8 bytes. A
//! stream starts with the preamble strings, then a metadata block describing
//! the row schema, then zero or more row blocks.
use std::io::{self, Read, Write};

use bytes::{BufMut, BytesMut};
use svcql_error::{DbError, Result, ResultExt};
use tracing::trace;

use crate::types::convert::{convert_literal, timestamp_from_millis, timestamp_to_millis};
use crate::types::{DataType, Field, Row, RowSchema, ScalarValue};

pub const METADATA_TAG: u8 = b'M';
pub const ROW_TAG: u8 = b'R';

const NULL_FLAG: u8 = 1;
const VALUE_FLAG: u8 = 0;

/// Upper bound on a single string, guards against reading garbage lengths.
const MAX_STRING_LEN: u32 = 64 * 1024 * 1024;

pub trait BufStringMut: BufMut {
    /// Put a length prefixed string in the buffer.
    fn put_string(&mut self, s: &str);
}

impl<B: BufMut> BufStringMut for B {
    fn put_string(&mut self, s: &str) {
        self.put_u32(s.len() as u32);
        self.put(s.as_bytes());
    }
}

pub fn write_string<W: Write>(writer: &mut W, s: &str) -> Result<()> {
    let mut buf = BytesMut::with_capacity(4 + s.len());
    buf.put_string(s);
    writer.write_all(&buf)?;
    Ok(())
}

pub fn read_string<R: Read>(reader: &mut R) -> Result<String> {
    let len = read_u32(reader)?;
    if len > MAX_STRING_LEN {
        return Err(DbError::new(format!("String length {len} exceeds maximum")));
    }
    let mut buf = vec![0; len as usize];
    reader.read_exact(&mut buf).context("Failed to read string")?;
    Ok(String::from_utf8(buf)?)
}

fn read_u8<R: Read>(reader: &mut R) -> Result<u8> {
    let mut buf = [0; 1];
    reader.read_exact(&mut buf)?;
    Ok(buf[0])
}

fn read_u32<R: Read>(reader: &mut R) -> Result<u32> {
    let mut buf = [0; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_be_bytes(buf))
}

fn read_i64<R: Read>(reader: &mut R) -> Result<i64> {
    let mut buf = [0; 8];
    reader.read_exact(&mut buf)?;
    Ok(i64::from_be_bytes(buf))
}

/// Strings sent ahead of the row data identifying what's running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryPreamble {
    pub service: String,
    pub source_name: String,
    pub source_run_id: String,
    pub generated_name: String,
    pub generated_run_id: String,
}

impl QueryPreamble {
    fn fields(&self) -> [&str; 5] {
        [
            &self.service,
            &self.source_name,
            &self.source_run_id,
            &self.generated_name,
            &self.generated_run_id,
        ]
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        for s in self.fields() {
            buf.put_string(s);
        }
    }

    pub fn decode<R: Read>(reader: &mut R) -> Result<Self> {
        Ok(QueryPreamble {
            service: read_string(reader)?,
            source_name: read_string(reader)?,
            source_run_id: read_string(reader)?,
            generated_name: read_string(reader)?,
            generated_run_id: read_string(reader)?,
        })
    }
}

pub fn encode_schema(buf: &mut BytesMut, schema: &RowSchema) {
    buf.put_u8(METADATA_TAG);
    buf.put_u32(schema.len() as u32);
    for field in &schema.fields {
        buf.put_string(&field.name);
        buf.put_u8(field.datatype.wire_tag());
    }
}

/// Encode a row, converting each value to the type declared by the schema.
pub fn encode_row(buf: &mut BytesMut, schema: &RowSchema, row: &Row) -> Result<()> {
    if row.len() != schema.len() {
        return Err(DbError::new(format!(
            "Row has {} values, schema has {} fields",
            row.len(),
            schema.len()
        )));
    }

    buf.put_u8(ROW_TAG);
    for (value, field) in row.iter().zip(&schema.fields) {
        if value.is_null() {
            buf.put_u8(NULL_FLAG);
            continue;
        }
        let value = convert_literal(value, field.datatype)
            .map_err(|e| e.with_field("field", &field.name))?;
        buf.put_u8(VALUE_FLAG);
        match value {
            ScalarValue::Boolean(v) => buf.put_u8(v as u8),
            ScalarValue::Integer(v) => buf.put_i64(v),
            ScalarValue::Number(v) => buf.put_f64(v),
            ScalarValue::String(v) => buf.put_string(&v),
            ScalarValue::Timestamp(v) => buf.put_i64(timestamp_to_millis(&v)),
            ScalarValue::Null => (),
        }
    }
    Ok(())
}

fn decode_value<R: Read>(reader: &mut R, datatype: DataType) -> Result<ScalarValue> {
    if read_u8(reader)? == NULL_FLAG {
        return Ok(ScalarValue::Null);
    }
    Ok(match datatype {
        DataType::Boolean => ScalarValue::Boolean(read_u8(reader)? != 0),
        DataType::Integer => ScalarValue::Integer(read_i64(reader)?),
        DataType::Number => ScalarValue::Number(f64::from_bits(read_i64(reader)? as u64)),
        DataType::String => ScalarValue::String(read_string(reader)?),
        DataType::Timestamp => ScalarValue::Timestamp(timestamp_from_millis(read_i64(reader)?)?),
    })
}

/// Writes the preamble, schema and rows of a query result.
///
/// The schema is written ahead of the first row, or by [`finish`] if no
/// rows were written.
///
/// [`finish`]: RowStreamWriter::finish
#[derive(Debug)]
pub struct RowStreamWriter<W: Write> {
    writer: W,
    schema: RowSchema,
    schema_written: bool,
    rows_written: u64,
    buf: BytesMut,
}

impl<W: Write> RowStreamWriter<W> {
    pub fn new(writer: W, schema: RowSchema) -> Self {
        RowStreamWriter {
            writer,
            schema,
            schema_written: false,
            rows_written: 0,
            buf: BytesMut::new(),
        }
    }

    pub fn write_preamble(&mut self, preamble: &QueryPreamble) -> Result<()> {
        preamble.encode(&mut self.buf);
        self.flush_buf()
    }

    pub fn write_row(&mut self, row: &Row) -> Result<()> {
        self.ensure_schema();
        encode_row(&mut self.buf, &self.schema, row)?;
        self.rows_written += 1;
        self.flush_buf()
    }

    /// Write the schema if no rows were written and flush the writer.
    pub fn finish(&mut self) -> Result<()> {
        self.ensure_schema();
        self.flush_buf()?;
        self.writer.flush()?;
        trace!(rows = self.rows_written, "finished row stream");
        Ok(())
    }

    pub fn rows_written(&self) -> u64 {
        self.rows_written
    }

    pub fn into_inner(self) -> W {
        self.writer
    }

    fn ensure_schema(&mut self) {
        if !self.schema_written {
            encode_schema(&mut self.buf, &self.schema);
            self.schema_written = true;
        }
    }

    fn flush_buf(&mut self) -> Result<()> {
        self.writer.write_all(&self.buf)?;
        self.buf.clear();
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamBlock {
    Metadata(RowSchema),
    Row(Row),
}

/// Everything read from a row stream.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReadResult {
    pub metadata_blocks: usize,
    pub schema: Option<RowSchema>,
    pub rows: Vec<Row>,
}

/// Reads a stream written by [`RowStreamWriter`].
#[derive(Debug)]
pub struct RowStreamReader<R: Read> {
    reader: R,
    schema: Option<RowSchema>,
}

impl<R: Read> RowStreamReader<R> {
    pub fn new(reader: R) -> Self {
        RowStreamReader {
            reader,
            schema: None,
        }
    }

    pub fn read_preamble(&mut self) -> Result<QueryPreamble> {
        QueryPreamble::decode(&mut self.reader)
    }

    /// Read the next block, `None` once the stream ends.
    pub fn next_block(&mut self) -> Result<Option<StreamBlock>> {
        let mut tag = [0; 1];
        loop {
            match self.reader.read(&mut tag) {
                Ok(0) => return Ok(None),
                Ok(_) => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }

        match tag[0] {
            METADATA_TAG => {
                let count = read_u32(&mut self.reader)?;
                let mut fields = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let name = read_string(&mut self.reader)?;
                    let datatype = DataType::from_wire_tag(read_u8(&mut self.reader)?)?;
                    fields.push(Field::new(name, datatype));
                }
                let schema = RowSchema::new(fields);
                self.schema = Some(schema.clone());
                Ok(Some(StreamBlock::Metadata(schema)))
            }
            ROW_TAG => {
                let schema = match &self.schema {
                    Some(schema) => schema,
                    None => return Err(DbError::new("Row block received before metadata")),
                };
                let mut row = Vec::with_capacity(schema.len());
                for field in &schema.fields {
                    row.push(decode_value(&mut self.reader, field.datatype)?);
                }
                Ok(Some(StreamBlock::Row(row)))
            }
            other => Err(DbError::new(format!("Unexpected block tag: {other}"))),
        }
    }

    /// Read blocks until the stream ends.
    pub fn read_to_end(&mut self) -> Result<ReadResult> {
        let mut result = ReadResult::default();
        while let Some(block) = self.next_block()? {
            match block {
                StreamBlock::Metadata(schema) => {
                    result.metadata_blocks += 1;
                    result.schema = Some(schema);
                }
                StreamBlock::Row(row) => result.rows.push(row),
            }
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;

    fn schema() -> RowSchema {
        RowSchema::new([
            Field::new("name", DataType::String),
            Field::new("count", DataType::Integer),
            Field::new("avg", DataType::Number),
            Field::new("ok", DataType::Boolean),
            Field::new("at", DataType::Timestamp),
        ])
    }

    #[test]
    fn schema_written_once_before_rows() {
        let at = NaiveDate::from_ymd_opt(2024, 3, 1)
            .unwrap()
            .and_hms_milli_opt(12, 30, 0, 250)
            .unwrap();
        let mut writer = RowStreamWriter::new(Vec::new(), schema());
        writer
            .write_row(&vec![
                "a".into(),
                ScalarValue::Number(3.0),
                ScalarValue::Number(1.5),
                true.into(),
                at.into(),
            ])
            .unwrap();
        writer
            .write_row(&vec![
                ScalarValue::Null,
                4.into(),
                ScalarValue::Null,
                false.into(),
                ScalarValue::from("2024-03-01"),
            ])
            .unwrap();
        writer.finish().unwrap();

        let bytes = writer.into_inner();
        let result = RowStreamReader::new(bytes.as_slice()).read_to_end().unwrap();
        assert_eq!(1, result.metadata_blocks);
        assert_eq!(Some(schema()), result.schema);
        assert_eq!(
            vec![
                vec![
                    ScalarValue::from("a"),
                    ScalarValue::Integer(3),
                    ScalarValue::Number(1.5),
                    ScalarValue::Boolean(true),
                    ScalarValue::Timestamp(at),
                ],
                vec![
                    ScalarValue::Null,
                    ScalarValue::Integer(4),
                    ScalarValue::Null,
                    ScalarValue::Boolean(false),
                    ScalarValue::Timestamp(
                        NaiveDate::from_ymd_opt(2024, 3, 1)
                            .unwrap()
                            .and_hms_opt(0, 0, 0)
                            .unwrap()
                    ),
                ],
            ],
            result.rows
        );
    }

    #[test]
    fn empty_result_still_has_schema() {
        let mut writer = RowStreamWriter::new(Vec::new(), schema());
        writer.finish().unwrap();
        let bytes = writer.into_inner();
        let result = RowStreamReader::new(bytes.as_slice()).read_to_end().unwrap();
        assert_eq!(1, result.metadata_blocks);
        assert!(result.rows.is_empty());
    }

    #[test]
    fn preamble() {
        let preamble = QueryPreamble {
            service: "sales".to_string(),
            source_name: "sales - source".to_string(),
            source_run_id: "1".to_string(),
            generated_name: "sales - SQL".to_string(),
            generated_run_id: "2".to_string(),
        };
        let mut writer = RowStreamWriter::new(Vec::new(), schema());
        writer.write_preamble(&preamble).unwrap();
        let bytes = writer.into_inner();
        assert_eq!(&[0, 0, 0, 5], &bytes[0..4]);
        assert_eq!(b"sales", &bytes[4..9]);

        let mut reader = RowStreamReader::new(bytes.as_slice());
        assert_eq!(preamble, reader.read_preamble().unwrap());
        assert_eq!(None, reader.next_block().unwrap());
    }

    #[test]
    fn unconvertible_value_errors() {
        let mut buf = BytesMut::new();
        let schema = RowSchema::new([Field::new("n", DataType::Integer)]);
        encode_row(&mut buf, &schema, &vec!["abc".into()]).unwrap_err();
        encode_row(&mut buf, &schema, &vec![]).unwrap_err();
    }
}
