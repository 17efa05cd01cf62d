//! Renders packed rows back into textual sink formats.

use rill_core::error::Result;
use rill_core::schema::{read_field_as_f64, read_field_as_i64, PhysicalType, RowLayout};

pub fn field_to_string(layout: &RowLayout, record: &[u8], field_idx: usize) -> Result<String> {
    let field = &layout.schema().fields()[field_idx];
    let rendered = match field.physical_type {
        PhysicalType::F32 | PhysicalType::F64 => {
            read_field_as_f64(layout, record, field_idx)?.to_string()
        }
        PhysicalType::Bool => {
            if read_field_as_i64(layout, record, field_idx)? != 0 {
                "true".to_string()
            } else {
                "false".to_string()
            }
        }
        PhysicalType::Char(n) => {
            let offset = layout.offset_of(field_idx);
            let raw = &record[offset..offset + n];
            let end = raw.iter().position(|b| *b == 0).unwrap_or(n);
            String::from_utf8_lossy(&raw[..end]).into_owned()
        }
        PhysicalType::U64 => {
            // Keep the full unsigned range readable.
            let offset = layout.offset_of(field_idx);
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&record[offset..offset + 8]);
            u64::from_ne_bytes(bytes).to_string()
        }
        _ => read_field_as_i64(layout, record, field_idx)?.to_string(),
    };
    Ok(rendered)
}

/// One row as a CSV line, fields comma separated.
pub fn render_csv(layout: &RowLayout, record: &[u8]) -> Result<String> {
    let mut values = Vec::with_capacity(layout.schema().fields().len());
    for field_idx in 0..layout.schema().fields().len() {
        values.push(field_to_string(layout, record, field_idx)?);
    }
    Ok(values.join(","))
}

/// One row as a JSON object keyed by field names.
pub fn render_json(layout: &RowLayout, record: &[u8]) -> Result<String> {
    let mut object = serde_json::Map::new();
    for (field_idx, field) in layout.schema().fields().iter().enumerate() {
        let value = match field.physical_type {
            PhysicalType::F32 | PhysicalType::F64 => {
                serde_json::Number::from_f64(read_field_as_f64(layout, record, field_idx)?)
                    .map(serde_json::Value::Number)
                    .unwrap_or(serde_json::Value::Null)
            }
            PhysicalType::Bool => {
                serde_json::Value::Bool(read_field_as_i64(layout, record, field_idx)? != 0)
            }
            PhysicalType::Char(_) => {
                serde_json::Value::String(field_to_string(layout, record, field_idx)?)
            }
            _ => serde_json::Value::Number(
                read_field_as_i64(layout, record, field_idx)?.into(),
            ),
        };
        object.insert(field.name.clone(), value);
    }
    Ok(serde_json::Value::Object(object).to_string())
}
