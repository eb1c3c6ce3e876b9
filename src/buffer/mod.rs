//! C1 — Tuple Buffer & Buffer Manager (§4.1).

pub mod pool;
pub mod schema;
pub mod tuple_buffer;

pub use pool::BufferPool;
pub use schema::{Field, FieldType, MemoryLayout, Schema};
pub use tuple_buffer::{TupleBuffer, VariableSizedAccess};
