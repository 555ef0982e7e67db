pub mod catalog;
pub mod entity;

pub use catalog::{
    AttributeDef, EntityDef, Schema, SchemaBuilder, SchemaDef, SchemaError, SchemaProvider,
};
pub use entity::{AttrKind, Attribute, EntityType, LinkTable};
