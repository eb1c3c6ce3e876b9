//! The record representation operators exchange (§4.4). A logical
//! alternative to decoding straight into fixed schema structs: keeping
//! records as a small tagged-value map lets Selection/Projection/Map stay
//! generic over schema without a compiled-expression layer, at the cost of
//! one allocation per record — acceptable since pipelines are the unit of
//! parallelism here, not individual record throughput.

use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    I8(i8),
    U8(u8),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F32(f32),
    F64(f64),
    Bool(bool),
    Str(String),
    Bytes(Vec<u8>),
}

impl Value {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::I8(v) => Some(*v as i64),
            Value::I16(v) => Some(*v as i64),
            Value::I32(v) => Some(*v as i64),
            Value::I64(v) => Some(*v),
            Value::U8(v) => Some(*v as i64),
            Value::U16(v) => Some(*v as i64),
            Value::U32(v) => Some(*v as i64),
            Value::U64(v) => i64::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::U8(v) => Some(*v as u64),
            Value::U16(v) => Some(*v as u64),
            Value::U32(v) => Some(*v as u64),
            Value::U64(v) => Some(*v),
            Value::I64(v) => u64::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::F32(v) => Some(*v as f64),
            Value::F64(v) => Some(*v),
            _ => self.as_i64().map(|v| v as f64),
        }
    }

    /// Stable byte encoding used for key hashing / bucketing, independent
    /// of in-memory representation.
    pub fn key_bytes(&self) -> Vec<u8> {
        match self {
            Value::I8(v) => v.to_le_bytes().to_vec(),
            Value::U8(v) => v.to_le_bytes().to_vec(),
            Value::I16(v) => v.to_le_bytes().to_vec(),
            Value::U16(v) => v.to_le_bytes().to_vec(),
            Value::I32(v) => v.to_le_bytes().to_vec(),
            Value::U32(v) => v.to_le_bytes().to_vec(),
            Value::I64(v) => v.to_le_bytes().to_vec(),
            Value::U64(v) => v.to_le_bytes().to_vec(),
            Value::F32(v) => v.to_le_bytes().to_vec(),
            Value::F64(v) => v.to_le_bytes().to_vec(),
            Value::Bool(v) => vec![*v as u8],
            Value::Str(v) => v.as_bytes().to_vec(),
            Value::Bytes(v) => v.clone(),
        }
    }
}

pub type Record = HashMap<String, Value>;

pub fn record_key(record: &Record, key_fields: &[String]) -> Vec<u8> {
    let mut out = Vec::new();
    for field in key_fields {
        if let Some(value) = record.get(field) {
            out.extend(value.key_bytes());
        }
    }
    out
}
