//! Input parsers: one textual tuple into one row slot.

use std::sync::Arc;

use rill_core::config::InputFormat;
use rill_core::error::{EngineError, Result};
use rill_core::schema::{RowWriter, Schema};

pub enum InputParser {
    Csv { delimiter: char },
    Json,
}

impl InputParser {
    pub fn for_format(format: InputFormat) -> Self {
        match format {
            InputFormat::Csv => InputParser::Csv { delimiter: ',' },
            InputFormat::Json => InputParser::Json,
        }
    }

    /// Parses `text` and writes the fields of row `index`.
    pub fn write_tuple(
        &self,
        text: &str,
        index: u64,
        schema: &Arc<Schema>,
        writer: &mut RowWriter<'_>,
    ) -> Result<()> {
        match self {
            InputParser::Csv { delimiter } => {
                let values: Vec<&str> = text.split(*delimiter).collect();
                if values.len() != schema.fields().len() {
                    return Err(EngineError::protocol(format!(
                        "csv tuple has {} values, schema has {} fields: {text:?}",
                        values.len(),
                        schema.fields().len()
                    )));
                }
                for (field_idx, value) in values.iter().enumerate() {
                    writer.write_field_str(index, field_idx, value)?;
                }
                Ok(())
            }
            InputParser::Json => {
                let object: serde_json::Value = serde_json::from_str(text).map_err(|e| {
                    EngineError::protocol(format!("malformed json tuple: {e}: {text:?}"))
                })?;
                let map = object.as_object().ok_or_else(|| {
                    EngineError::protocol(format!("json tuple is not an object: {text:?}"))
                })?;
                for (field_idx, field) in schema.fields().iter().enumerate() {
                    let value = map.get(&field.name).ok_or_else(|| {
                        EngineError::protocol(format!(
                            "json tuple misses field {:?}: {text:?}",
                            field.name
                        ))
                    })?;
                    let text_value = match value {
                        serde_json::Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    writer.write_field_str(index, field_idx, &text_value)?;
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rill_core::buffer::BufferManager;
    use rill_core::schema::{Field, PhysicalType, RowLayout, RowReader};

    fn schema() -> Arc<Schema> {
        Schema::new(vec![
            Field::new("id", PhysicalType::U64),
            Field::new("value", PhysicalType::I64),
        ])
    }

    #[test]
    fn csv_and_json_tuples_parse_identically() {
        let schema = schema();
        let layout = RowLayout::new(schema.clone());
        let pool = BufferManager::new(256, 1);
        let mut buffer = pool.try_acquire().unwrap();
        {
            let mut writer = RowWriter::new(&layout, &mut buffer);
            InputParser::for_format(InputFormat::Csv)
                .write_tuple("7,-3", 0, &schema, &mut writer)
                .unwrap();
            InputParser::for_format(InputFormat::Json)
                .write_tuple(r#"{"id": 7, "value": -3}"#, 1, &schema, &mut writer)
                .unwrap();
        }
        let sealed = buffer.seal();
        let reader = RowReader::new(&layout, sealed.bytes());
        assert_eq!(reader.record_bytes(0).unwrap(), reader.record_bytes(1).unwrap());
    }

    #[test]
    fn csv_arity_mismatch_is_rejected() {
        let schema = schema();
        let layout = RowLayout::new(schema.clone());
        let pool = BufferManager::new(256, 1);
        let mut buffer = pool.try_acquire().unwrap();
        let mut writer = RowWriter::new(&layout, &mut buffer);
        match InputParser::for_format(InputFormat::Csv).write_tuple("7", 0, &schema, &mut writer) {
            Err(EngineError::ProtocolViolation(_)) => {}
            other => panic!("expected ProtocolViolation, got {other:?}"),
        }
    }
}
