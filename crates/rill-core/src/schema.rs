//! Fixed-width schemas and the row layout used to pack records into buffers.
//!
//! Every field has a physical type with a fixed byte width; a record is the
//! concatenation of its fields and never spans two buffers. Field offsets are
//! precomputed once per layout so the hot write/read path is pointer math
//! plus a bounds check. Values are host-native endian on the local path;
//! only the network frame header fixes an endianness.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::buffer::TupleBuffer;
use crate::error::{EngineError, Result};

/// Physical type of a field, with a fixed byte width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhysicalType {
    U8,
    U16,
    U32,
    U64,
    I8,
    I16,
    I32,
    I64,
    F32,
    F64,
    Bool,
    /// Fixed-width character field of `n` bytes, zero padded.
    Char(usize),
}

impl PhysicalType {
    pub fn size_bytes(&self) -> usize {
        match self {
            PhysicalType::U8 | PhysicalType::I8 | PhysicalType::Bool => 1,
            PhysicalType::U16 | PhysicalType::I16 => 2,
            PhysicalType::U32 | PhysicalType::I32 | PhysicalType::F32 => 4,
            PhysicalType::U64 | PhysicalType::I64 | PhysicalType::F64 => 8,
            PhysicalType::Char(n) => *n,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub physical_type: PhysicalType,
}

impl Field {
    pub fn new(name: impl Into<String>, physical_type: PhysicalType) -> Self {
        Self {
            name: name.into(),
            physical_type,
        }
    }
}

/// An ordered list of fixed-width fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    fields: Vec<Field>,
}

impl Schema {
    pub fn new(fields: Vec<Field>) -> Arc<Self> {
        Arc::new(Self { fields })
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// Sum of the field widths.
    pub fn record_size_bytes(&self) -> usize {
        self.fields.iter().map(|f| f.physical_type.size_bytes()).sum()
    }

    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }
}

/// Precomputed field offsets for row-wise records in a buffer.
#[derive(Debug, Clone)]
pub struct RowLayout {
    schema: Arc<Schema>,
    offsets: Vec<usize>,
    record_size: usize,
}

impl RowLayout {
    pub fn new(schema: Arc<Schema>) -> Self {
        let mut offsets = Vec::with_capacity(schema.fields().len());
        let mut offset = 0usize;
        for field in schema.fields() {
            offsets.push(offset);
            offset += field.physical_type.size_bytes();
        }
        Self {
            schema,
            offsets,
            record_size: offset,
        }
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn record_size(&self) -> usize {
        self.record_size
    }

    pub fn offset_of(&self, field_idx: usize) -> usize {
        self.offsets[field_idx]
    }

    /// How many records fit into a buffer of `capacity_bytes`.
    pub fn capacity_tuples(&self, capacity_bytes: usize) -> u64 {
        if self.record_size == 0 {
            return 0;
        }
        (capacity_bytes / self.record_size) as u64
    }
}

/// Writes records into a [`TupleBuffer`] at row granularity.
pub struct RowWriter<'a> {
    layout: &'a RowLayout,
    buffer: &'a mut TupleBuffer,
}

impl<'a> RowWriter<'a> {
    pub fn new(layout: &'a RowLayout, buffer: &'a mut TupleBuffer) -> Self {
        Self { layout, buffer }
    }

    pub fn layout(&self) -> &RowLayout {
        self.layout
    }

    pub fn capacity_tuples(&self) -> u64 {
        self.layout.capacity_tuples(self.buffer.capacity_bytes())
    }

    fn record_range(&self, index: u64) -> Result<std::ops::Range<usize>> {
        let start = index as usize * self.layout.record_size;
        let end = start + self.layout.record_size;
        if end > self.buffer.capacity_bytes() {
            return Err(EngineError::invariant(format!(
                "record {index} exceeds buffer of {} bytes",
                self.buffer.capacity_bytes()
            )));
        }
        Ok(start..end)
    }

    /// Copies a fully packed record into row slot `index`.
    pub fn write_record_bytes(&mut self, index: u64, record: &[u8]) -> Result<()> {
        if record.len() != self.layout.record_size {
            return Err(EngineError::invariant(format!(
                "record of {} bytes does not match layout width {}",
                record.len(),
                self.layout.record_size
            )));
        }
        let range = self.record_range(index)?;
        self.buffer.as_mut_slice()[range].copy_from_slice(record);
        if index + 1 > self.buffer.number_of_tuples() {
            self.buffer.set_number_of_tuples(index + 1);
        }
        Ok(())
    }

    /// Parses `text` according to the field's physical type and writes it
    /// into row `index`. Used by the CSV/JSON input parsers.
    pub fn write_field_str(&mut self, index: u64, field_idx: usize, text: &str) -> Result<()> {
        let field = &self.layout.schema.fields()[field_idx];
        let range = self.record_range(index)?;
        let offset = range.start + self.layout.offsets[field_idx];
        let slice = self.buffer.as_mut_slice();
        let text = text.trim();
        macro_rules! parse_into {
            ($ty:ty) => {{
                let v: $ty = text.parse().map_err(|_| {
                    EngineError::protocol(format!(
                        "cannot parse {:?} as {:?} for field {}",
                        text, field.physical_type, field.name
                    ))
                })?;
                let bytes = v.to_ne_bytes();
                slice[offset..offset + bytes.len()].copy_from_slice(&bytes);
            }};
        }
        match field.physical_type {
            PhysicalType::U8 => parse_into!(u8),
            PhysicalType::U16 => parse_into!(u16),
            PhysicalType::U32 => parse_into!(u32),
            PhysicalType::U64 => parse_into!(u64),
            PhysicalType::I8 => parse_into!(i8),
            PhysicalType::I16 => parse_into!(i16),
            PhysicalType::I32 => parse_into!(i32),
            PhysicalType::I64 => parse_into!(i64),
            PhysicalType::F32 => parse_into!(f32),
            PhysicalType::F64 => parse_into!(f64),
            PhysicalType::Bool => {
                let v = match text {
                    "true" | "1" => 1u8,
                    "false" | "0" => 0u8,
                    _ => {
                        return Err(EngineError::protocol(format!(
                            "cannot parse {text:?} as bool for field {}",
                            field.name
                        )))
                    }
                };
                slice[offset] = v;
            }
            PhysicalType::Char(n) => {
                let bytes = text.as_bytes();
                if bytes.len() > n {
                    return Err(EngineError::protocol(format!(
                        "value of {} bytes exceeds char({n}) field {}",
                        bytes.len(),
                        field.name
                    )));
                }
                slice[offset..offset + bytes.len()].copy_from_slice(bytes);
                for b in &mut slice[offset + bytes.len()..offset + n] {
                    *b = 0;
                }
            }
        }
        if index + 1 > self.buffer.number_of_tuples() {
            self.buffer.set_number_of_tuples(index + 1);
        }
        Ok(())
    }

    pub fn write_u64(&mut self, index: u64, field_idx: usize, value: u64) -> Result<()> {
        let range = self.record_range(index)?;
        let offset = range.start + self.layout.offsets[field_idx];
        self.buffer.as_mut_slice()[offset..offset + 8].copy_from_slice(&value.to_ne_bytes());
        if index + 1 > self.buffer.number_of_tuples() {
            self.buffer.set_number_of_tuples(index + 1);
        }
        Ok(())
    }
}

/// Reads row-wise records back out of a sealed buffer's bytes.
pub struct RowReader<'a> {
    layout: &'a RowLayout,
    bytes: &'a [u8],
}

impl<'a> RowReader<'a> {
    pub fn new(layout: &'a RowLayout, bytes: &'a [u8]) -> Self {
        Self { layout, bytes }
    }

    pub fn record_bytes(&self, index: u64) -> Result<&'a [u8]> {
        let start = index as usize * self.layout.record_size;
        let end = start + self.layout.record_size;
        if end > self.bytes.len() {
            return Err(EngineError::invariant(format!(
                "record {index} out of bounds for {} bytes",
                self.bytes.len()
            )));
        }
        Ok(&self.bytes[start..end])
    }

    pub fn read_u64(&self, index: u64, field_idx: usize) -> Result<u64> {
        let record = self.record_bytes(index)?;
        let offset = self.layout.offsets[field_idx];
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&record[offset..offset + 8]);
        Ok(u64::from_ne_bytes(bytes))
    }

    /// Reads any integer field widened to `i64`, the engine's key domain.
    pub fn read_as_i64(&self, index: u64, field_idx: usize) -> Result<i64> {
        let record = self.record_bytes(index)?;
        read_field_as_i64(self.layout, record, field_idx)
    }
}

/// Reads one integer field out of a packed record, widened to `i64`.
pub fn read_field_as_i64(layout: &RowLayout, record: &[u8], field_idx: usize) -> Result<i64> {
    let field = &layout.schema().fields()[field_idx];
    let offset = layout.offset_of(field_idx);
    let width = field.physical_type.size_bytes();
    let raw = &record[offset..offset + width];
    let value = match field.physical_type {
        PhysicalType::U8 => raw[0] as i64,
        PhysicalType::I8 => raw[0] as i8 as i64,
        PhysicalType::Bool => raw[0] as i64,
        PhysicalType::U16 => u16::from_ne_bytes([raw[0], raw[1]]) as i64,
        PhysicalType::I16 => i16::from_ne_bytes([raw[0], raw[1]]) as i64,
        PhysicalType::U32 => u32::from_ne_bytes([raw[0], raw[1], raw[2], raw[3]]) as i64,
        PhysicalType::I32 => i32::from_ne_bytes([raw[0], raw[1], raw[2], raw[3]]) as i64,
        PhysicalType::U64 | PhysicalType::I64 => {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(raw);
            i64::from_ne_bytes(bytes)
        }
        other => {
            return Err(EngineError::invariant(format!(
                "field {:?} of type {:?} is not an integer key",
                field.name, other
            )))
        }
    };
    Ok(value)
}

/// Reads one numeric field out of a packed record as `f64`, the domain of
/// windowed aggregates.
pub fn read_field_as_f64(layout: &RowLayout, record: &[u8], field_idx: usize) -> Result<f64> {
    let field = &layout.schema().fields()[field_idx];
    match field.physical_type {
        PhysicalType::F32 => {
            let offset = layout.offset_of(field_idx);
            let mut bytes = [0u8; 4];
            bytes.copy_from_slice(&record[offset..offset + 4]);
            Ok(f32::from_ne_bytes(bytes) as f64)
        }
        PhysicalType::F64 => {
            let offset = layout.offset_of(field_idx);
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&record[offset..offset + 8]);
            Ok(f64::from_ne_bytes(bytes))
        }
        _ => Ok(read_field_as_i64(layout, record, field_idx)? as f64),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferManager;

    fn test_schema() -> Arc<Schema> {
        Schema::new(vec![
            Field::new("key", PhysicalType::U64),
            Field::new("value", PhysicalType::I32),
            Field::new("flag", PhysicalType::Bool),
        ])
    }

    #[test]
    fn record_size_is_sum_of_widths() {
        let schema = test_schema();
        assert_eq!(schema.record_size_bytes(), 8 + 4 + 1);
        let layout = RowLayout::new(schema);
        assert_eq!(layout.offset_of(0), 0);
        assert_eq!(layout.offset_of(1), 8);
        assert_eq!(layout.offset_of(2), 12);
    }

    #[tokio::test]
    async fn write_then_read_fields() {
        let schema = test_schema();
        let layout = RowLayout::new(schema);
        let pool = BufferManager::new(256, 1);
        let mut buffer = pool.acquire().await;
        {
            let mut writer = RowWriter::new(&layout, &mut buffer);
            writer.write_field_str(0, 0, "7").unwrap();
            writer.write_field_str(0, 1, "-13").unwrap();
            writer.write_field_str(0, 2, "true").unwrap();
            writer.write_field_str(1, 0, "8").unwrap();
        }
        assert_eq!(buffer.number_of_tuples(), 2);
        let sealed = buffer.seal();
        let reader = RowReader::new(&layout, sealed.bytes());
        assert_eq!(reader.read_u64(0, 0).unwrap(), 7);
        assert_eq!(reader.read_as_i64(0, 1).unwrap(), -13);
        assert_eq!(reader.read_as_i64(0, 2).unwrap(), 1);
        assert_eq!(reader.read_u64(1, 0).unwrap(), 8);
    }

    #[tokio::test]
    async fn record_must_not_span_buffers() {
        let schema = test_schema();
        let layout = RowLayout::new(schema);
        let pool = BufferManager::new(16, 1);
        let mut buffer = pool.acquire().await;
        let mut writer = RowWriter::new(&layout, &mut buffer);
        // 16 bytes hold exactly one 13-byte record; slot 1 would spill over.
        assert_eq!(writer.capacity_tuples(), 1);
        assert!(writer.write_field_str(1, 0, "1").is_err());
    }

    #[test]
    fn parse_failure_is_protocol_violation() {
        let schema = test_schema();
        let layout = RowLayout::new(schema);
        let pool = BufferManager::new(64, 1);
        let mut buffer = pool.try_acquire().unwrap();
        let mut writer = RowWriter::new(&layout, &mut buffer);
        match writer.write_field_str(0, 0, "not-a-number") {
            Err(EngineError::ProtocolViolation(_)) => {}
            other => panic!("expected ProtocolViolation, got {other:?}"),
        }
    }
}
