//! Document schemas and the registry that applies them.

pub mod model;
pub mod normalize;
pub mod registry;

pub use model::{FieldDef, FieldType, Schema, SchemaHints, builtin_schemas, parse_schemas};
pub use registry::{LlmSchemaRegistry, SchemaRegistry};
