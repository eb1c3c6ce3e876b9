//! Schema and memory layout (§3 `Schema`, `MemoryLayout`).

use crate::error::{Result, RuntimeError};

/// The fixed enumeration of field types a [`Schema`] may contain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldType {
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    F32,
    F64,
    Bool,
    Char,
    /// Stored as a fixed-size [`crate::buffer::tuple_buffer::VariableSizedAccess`] in the row.
    VarSized,
}

impl FieldType {
    /// Size in bytes occupied by the field *inside the row* — for `VarSized`
    /// this is the size of the `(childIndex, offset)` access descriptor, not
    /// the variable-length payload itself.
    pub fn in_row_size(self) -> usize {
        match self {
            FieldType::I8 | FieldType::U8 | FieldType::Bool | FieldType::Char => 1,
            FieldType::I16 | FieldType::U16 => 2,
            FieldType::I32 | FieldType::U32 | FieldType::F32 => 4,
            FieldType::I64 | FieldType::U64 | FieldType::F64 => 8,
            FieldType::VarSized => 8, // u32 child index + u32 offset
        }
    }
}

#[derive(Debug, Clone)]
pub struct Field {
    pub name: String,
    pub field_type: FieldType,
}

/// Ordered list of fields plus derived layout constants.
#[derive(Debug, Clone)]
pub struct Schema {
    fields: Vec<Field>,
    key_field_names: Vec<String>,
    record_size: usize,
}

impl Schema {
    pub fn new(fields: Vec<Field>) -> Result<Self> {
        let mut seen = std::collections::HashSet::new();
        for f in &fields {
            if !seen.insert(f.name.as_str()) {
                return Err(RuntimeError::Configuration(format!(
                    "duplicate field name '{}' in schema",
                    f.name
                )));
            }
        }
        let record_size = fields.iter().map(|f| f.field_type.in_row_size()).sum();
        Ok(Self {
            fields,
            key_field_names: Vec::new(),
            record_size,
        })
    }

    pub fn with_keys(mut self, keys: Vec<String>) -> Result<Self> {
        for k in &keys {
            if !self.fields.iter().any(|f| &f.name == k) {
                return Err(RuntimeError::Configuration(format!(
                    "key field '{k}' not present in schema"
                )));
            }
        }
        self.key_field_names = keys;
        Ok(self)
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn key_field_names(&self) -> &[String] {
        &self.key_field_names
    }

    pub fn record_size(&self) -> usize {
        self.record_size
    }

    pub fn capacity(&self, buffer_size: usize) -> usize {
        if self.record_size == 0 {
            0
        } else {
            buffer_size / self.record_size
        }
    }

    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }
}

/// Physical layout of records within a buffer: row-major (fields
/// interleaved per record) or column-major (one contiguous run per field,
/// stride = `capacity * field_size`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryLayout {
    RowMajor,
    ColumnMajor,
}

impl MemoryLayout {
    /// Byte offset of `(row_index, field_index)` within the buffer.
    pub fn field_offset(
        &self,
        schema: &Schema,
        buffer_size: usize,
        row_index: usize,
        field_index: usize,
    ) -> Result<usize> {
        let fields = schema.fields();
        let field = fields
            .get(field_index)
            .ok_or_else(|| RuntimeError::Internal(format!("field index {field_index} out of range")))?;
        match self {
            MemoryLayout::RowMajor => {
                let prefix: usize = fields[..field_index]
                    .iter()
                    .map(|f| f.field_type.in_row_size())
                    .sum();
                Ok(row_index * schema.record_size() + prefix)
            }
            MemoryLayout::ColumnMajor => {
                let capacity = schema.capacity(buffer_size);
                let field_offset_in_capacity: usize = fields[..field_index]
                    .iter()
                    .map(|f| capacity * f.field_type.in_row_size())
                    .sum();
                Ok(field_offset_in_capacity + row_index * field.field_type.in_row_size())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> Schema {
        Schema::new(vec![
            Field { name: "a".into(), field_type: FieldType::I32 },
            Field { name: "b".into(), field_type: FieldType::I64 },
        ])
        .unwrap()
    }

    #[test]
    fn record_size_is_sum_of_field_sizes() {
        assert_eq!(schema().record_size(), 12);
    }

    #[test]
    fn row_major_offsets_are_interleaved() {
        let s = schema();
        let layout = MemoryLayout::RowMajor;
        assert_eq!(layout.field_offset(&s, 4096, 0, 0).unwrap(), 0);
        assert_eq!(layout.field_offset(&s, 4096, 0, 1).unwrap(), 4);
        assert_eq!(layout.field_offset(&s, 4096, 1, 0).unwrap(), 12);
    }

    #[test]
    fn column_major_offsets_are_strided_by_capacity() {
        let s = schema();
        let layout = MemoryLayout::ColumnMajor;
        let capacity = s.capacity(4096);
        assert_eq!(layout.field_offset(&s, 4096, 0, 0).unwrap(), 0);
        assert_eq!(layout.field_offset(&s, 4096, 0, 1).unwrap(), capacity * 4);
        assert_eq!(layout.field_offset(&s, 4096, 1, 0).unwrap(), 4);
    }

    #[test]
    fn duplicate_field_names_rejected() {
        let fields = vec![
            Field { name: "a".into(), field_type: FieldType::I32 },
            Field { name: "a".into(), field_type: FieldType::I64 },
        ];
        assert!(Schema::new(fields).is_err());
    }
}
