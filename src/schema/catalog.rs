//! Entity schema catalog
//!
//! A [`Schema`] is built once from [`SchemaDef`] declarations (in code or
//! loaded from JSON), validated, and then shared read-only. The translator
//! only sees it through the [`SchemaProvider`] trait.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, OnceLock};

use super::entity::{AttrKind, Attribute, EntityType, LinkTable};
use crate::data::ScalarKind;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SchemaError {
    #[error("unknown entity '{0}'")]
    UnknownEntity(String),

    #[error("entity '{entity}' has no attribute '{attribute}'")]
    UnknownAttribute { entity: String, attribute: String },

    #[error("name '{0}' is not defined")]
    UnknownName(String),

    #[error("'{kind}' value has no attribute '{attribute}'")]
    NotAnEntity { kind: String, attribute: String },

    #[error("invalid identifier '{0}'")]
    InvalidIdentifier(String),

    #[error("duplicate entity '{0}'")]
    DuplicateEntity(String),

    #[error("duplicate attribute '{attribute}' in entity '{entity}'")]
    DuplicateAttribute { entity: String, attribute: String },

    #[error("entity '{0}' has no primary key")]
    MissingPrimaryKey(String),

    #[error("invalid primary key attribute '{attribute}' in entity '{entity}'")]
    InvalidPrimaryKey { entity: String, attribute: String },

    #[error("attribute {entity}.{attribute} must declare exactly one of kind, reference or collection")]
    AmbiguousAttribute { entity: String, attribute: String },

    #[error("invalid relationship {entity}.{attribute}: {reason}")]
    InvalidRelationship {
        entity: String,
        attribute: String,
        reason: String,
    },

    #[error("schema JSON error: {0}")]
    Json(String),

    #[error("failed to read schema: {0}")]
    Io(String),
}

/// Read-only access to entity metadata
pub trait SchemaProvider: Send + Sync {
    fn entity(&self, name: &str) -> Result<Arc<EntityType>, SchemaError>;

    fn attribute(&self, entity: &str, attribute: &str) -> Result<Attribute, SchemaError> {
        let entity_type = self.entity(entity)?;
        entity_type
            .attribute(attribute)
            .cloned()
            .ok_or_else(|| SchemaError::UnknownAttribute {
                entity: entity.to_string(),
                attribute: attribute.to_string(),
            })
    }

    /// The other end of a relationship attribute, if declared
    fn inverse(&self, entity: &str, attribute: &str) -> Result<Option<Attribute>, SchemaError> {
        let attr = self.attribute(entity, attribute)?;
        match (attr.target(), attr.inverse()) {
            (Some(target), Some(inverse)) => self.attribute(target, inverse).map(Some),
            _ => Ok(None),
        }
    }

    fn primary_key(&self, entity: &str) -> Result<Vec<String>, SchemaError> {
        Ok(self.entity(entity)?.primary_key().to_vec())
    }

    fn has_entity(&self, name: &str) -> bool {
        self.entity(name).is_ok()
    }
}

/// Declarative schema definition, the serde form of a [`Schema`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchemaDef {
    pub entities: Vec<EntityDef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityDef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    #[serde(default)]
    pub primary_key: Vec<String>,
    #[serde(default)]
    pub attributes: Vec<AttributeDef>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AttributeDef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<ScalarKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inverse: Option<String>,
    #[serde(default)]
    pub optional: bool,
    #[serde(default)]
    pub lazy: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<String>,
}

impl AttributeDef {
    pub fn scalar(name: impl Into<String>, kind: ScalarKind) -> Self {
        Self {
            name: name.into(),
            kind: Some(kind),
            ..Default::default()
        }
    }

    pub fn reference(
        name: impl Into<String>,
        target: impl Into<String>,
        inverse: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            reference: Some(target.into()),
            inverse: Some(inverse.into()),
            ..Default::default()
        }
    }

    pub fn collection(
        name: impl Into<String>,
        target: impl Into<String>,
        inverse: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            collection: Some(target.into()),
            inverse: Some(inverse.into()),
            ..Default::default()
        }
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn lazy(mut self) -> Self {
        self.lazy = true;
        self
    }

    pub fn with_column(mut self, column: impl Into<String>) -> Self {
        self.column = Some(column.into());
        self
    }
}

impl EntityDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            table: None,
            primary_key: Vec::new(),
            attributes: Vec::new(),
        }
    }

    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    /// Add a scalar attribute that is part of the primary key
    pub fn key(mut self, name: impl Into<String>, kind: ScalarKind) -> Self {
        let name = name.into();
        self.primary_key.push(name.clone());
        self.attributes.push(AttributeDef::scalar(name, kind));
        self
    }

    pub fn required(self, name: impl Into<String>, kind: ScalarKind) -> Self {
        self.attribute(AttributeDef::scalar(name, kind))
    }

    pub fn optional(self, name: impl Into<String>, kind: ScalarKind) -> Self {
        self.attribute(AttributeDef::scalar(name, kind).optional())
    }

    pub fn reference(
        self,
        name: impl Into<String>,
        target: impl Into<String>,
        inverse: impl Into<String>,
    ) -> Self {
        self.attribute(AttributeDef::reference(name, target, inverse))
    }

    pub fn set(
        self,
        name: impl Into<String>,
        target: impl Into<String>,
        inverse: impl Into<String>,
    ) -> Self {
        self.attribute(AttributeDef::collection(name, target, inverse))
    }

    /// Declare a composite primary key over already-declared attributes
    pub fn primary_key(mut self, attributes: &[&str]) -> Self {
        self.primary_key = attributes.iter().map(|a| a.to_string()).collect();
        self
    }

    pub fn attribute(mut self, attribute: AttributeDef) -> Self {
        self.attributes.push(attribute);
        self
    }
}

/// A validated, immutable entity schema
#[derive(Debug, Clone, Default)]
pub struct Schema {
    entities: BTreeMap<String, Arc<EntityType>>,
}

fn identifier_regex() -> &'static regex::Regex {
    static IDENT: OnceLock<regex::Regex> = OnceLock::new();
    IDENT.get_or_init(|| {
        regex::Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("identifier pattern is valid")
    })
}

fn check_identifier(name: &str) -> Result<(), SchemaError> {
    if identifier_regex().is_match(name) {
        Ok(())
    } else {
        Err(SchemaError::InvalidIdentifier(name.to_string()))
    }
}

fn relationship_error(entity: &str, attribute: &str, reason: impl Into<String>) -> SchemaError {
    SchemaError::InvalidRelationship {
        entity: entity.to_string(),
        attribute: attribute.to_string(),
        reason: reason.into(),
    }
}

/// Columns referencing `entity` from another table: one per key component
fn key_reference_columns(prefix: &str, key: &[String]) -> Vec<String> {
    if key.len() == 1 {
        vec![prefix.to_string()]
    } else {
        key.iter().map(|k| format!("{}_{}", prefix, k)).collect()
    }
}

impl Schema {
    /// Start building a schema from entity definitions
    pub fn builder() -> SchemaBuilder {
        SchemaBuilder::default()
    }

    pub fn from_json(json: &str) -> Result<Self, SchemaError> {
        let def: SchemaDef =
            serde_json::from_str(json).map_err(|e| SchemaError::Json(e.to_string()))?;
        Self::from_def(def)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, SchemaError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| SchemaError::Io(format!("{}: {}", path.display(), e)))?;
        Self::from_json(&json)
    }

    pub fn from_def(def: SchemaDef) -> Result<Self, SchemaError> {
        let mut defs: HashMap<&str, &EntityDef> = HashMap::new();
        for entity in &def.entities {
            check_identifier(&entity.name)?;
            if let Some(table) = &entity.table {
                check_identifier(table)?;
            }
            if defs.insert(entity.name.as_str(), entity).is_some() {
                return Err(SchemaError::DuplicateEntity(entity.name.clone()));
            }
        }

        for entity in &def.entities {
            validate_attributes(entity)?;
        }

        let mut entities = BTreeMap::new();
        for entity in &def.entities {
            let built = build_entity(entity, &defs)?;
            entities.insert(entity.name.clone(), Arc::new(built));
        }

        tracing::debug!(entities = entities.len(), "schema built");
        Ok(Self { entities })
    }

    pub fn entities(&self) -> impl Iterator<Item = &Arc<EntityType>> {
        self.entities.values()
    }

    /// DDL for every entity table and many-to-many link table (SQLite types)
    pub fn create_statements(&self) -> Vec<String> {
        let mut statements = Vec::new();
        let mut links: BTreeMap<String, Vec<(String, ScalarKind)>> = BTreeMap::new();

        for entity in self.entities.values() {
            let mut columns = Vec::new();
            for attr in entity.attributes() {
                match &attr.kind {
                    AttrKind::Scalar(kind) => {
                        columns.push(column_ddl(&attr.columns[0], *kind, attr.nullable));
                    }
                    AttrKind::Reference { target, .. } => {
                        let kinds = self.key_kinds(target);
                        for (column, kind) in attr.columns.iter().zip(kinds) {
                            columns.push(column_ddl(column, kind, attr.nullable));
                        }
                    }
                    AttrKind::Collection { target, .. } => {
                        if let Some(link) = &attr.link {
                            let mut link_columns: Vec<(String, ScalarKind)> = link
                                .source_columns
                                .iter()
                                .cloned()
                                .zip(self.key_kinds(&entity.name))
                                .collect();
                            link_columns.extend(
                                link.target_columns
                                    .iter()
                                    .cloned()
                                    .zip(self.key_kinds(target)),
                            );
                            link_columns.sort();
                            links.insert(link.table.clone(), link_columns);
                        }
                    }
                }
            }
            let key: Vec<String> = entity
                .key_columns()
                .into_iter()
                .map(|(column, _)| format!("\"{}\"", column))
                .collect();
            columns.push(format!("PRIMARY KEY ({})", key.join(", ")));
            statements.push(format!(
                "CREATE TABLE \"{}\" ({})",
                entity.table,
                columns.join(", ")
            ));
        }

        for (table, columns) in links {
            let key: Vec<String> = columns.iter().map(|(c, _)| format!("\"{}\"", c)).collect();
            let mut defs: Vec<String> = columns
                .iter()
                .map(|(column, kind)| column_ddl(column, *kind, false))
                .collect();
            defs.push(format!("PRIMARY KEY ({})", key.join(", ")));
            statements.push(format!("CREATE TABLE \"{}\" ({})", table, defs.join(", ")));
        }
        statements
    }

    fn key_kinds(&self, entity: &str) -> Vec<ScalarKind> {
        self.entities
            .get(entity)
            .map(|e| e.key_columns().into_iter().map(|(_, kind)| kind).collect())
            .unwrap_or_default()
    }
}

fn column_ddl(column: &str, kind: ScalarKind, nullable: bool) -> String {
    let ty = match kind {
        ScalarKind::Int | ScalarKind::Bool => "INTEGER",
        ScalarKind::Float => "REAL",
        ScalarKind::Str | ScalarKind::Unicode | ScalarKind::LongStr | ScalarKind::Date => "TEXT",
        ScalarKind::Bytes => "BLOB",
    };
    if nullable {
        format!("\"{}\" {}", column, ty)
    } else {
        format!("\"{}\" {} NOT NULL", column, ty)
    }
}

impl SchemaProvider for Schema {
    fn entity(&self, name: &str) -> Result<Arc<EntityType>, SchemaError> {
        self.entities
            .get(name)
            .cloned()
            .ok_or_else(|| SchemaError::UnknownEntity(name.to_string()))
    }
}

/// Incremental schema construction
#[derive(Debug, Default)]
pub struct SchemaBuilder {
    def: SchemaDef,
}

impl SchemaBuilder {
    pub fn entity(mut self, entity: EntityDef) -> Self {
        self.def.entities.push(entity);
        self
    }

    pub fn build(self) -> Result<Schema, SchemaError> {
        Schema::from_def(self.def)
    }
}

fn validate_attributes(entity: &EntityDef) -> Result<(), SchemaError> {
    let mut seen = HashSet::new();
    for attr in &entity.attributes {
        check_identifier(&attr.name)?;
        if let Some(column) = &attr.column {
            check_identifier(column)?;
        }
        if !seen.insert(attr.name.as_str()) {
            return Err(SchemaError::DuplicateAttribute {
                entity: entity.name.clone(),
                attribute: attr.name.clone(),
            });
        }
        let declared = [
            attr.kind.is_some(),
            attr.reference.is_some(),
            attr.collection.is_some(),
        ];
        if declared.iter().filter(|d| **d).count() != 1 {
            return Err(SchemaError::AmbiguousAttribute {
                entity: entity.name.clone(),
                attribute: attr.name.clone(),
            });
        }
    }

    if entity.primary_key.is_empty() {
        return Err(SchemaError::MissingPrimaryKey(entity.name.clone()));
    }
    for key in &entity.primary_key {
        let valid = entity
            .attributes
            .iter()
            .any(|a| &a.name == key && a.kind.is_some() && !a.lazy);
        if !valid {
            return Err(SchemaError::InvalidPrimaryKey {
                entity: entity.name.clone(),
                attribute: key.clone(),
            });
        }
    }
    Ok(())
}

fn build_entity(
    entity: &EntityDef,
    defs: &HashMap<&str, &EntityDef>,
) -> Result<EntityType, SchemaError> {
    let mut attributes = Vec::with_capacity(entity.attributes.len());

    for attr in &entity.attributes {
        let in_key = entity.primary_key.contains(&attr.name);
        let nullable = attr.optional && !in_key;

        let built = if let Some(kind) = attr.kind {
            Attribute {
                name: attr.name.clone(),
                kind: AttrKind::Scalar(kind),
                nullable,
                lazy: attr.lazy,
                columns: vec![attr.column.clone().unwrap_or_else(|| attr.name.clone())],
                link: None,
            }
        } else if let Some(target) = &attr.reference {
            let target_def = defs
                .get(target.as_str())
                .ok_or_else(|| relationship_error(&entity.name, &attr.name, format!("unknown target entity '{}'", target)))?;
            if let Some(inverse) = &attr.inverse {
                let other = find_attribute(target_def, inverse).ok_or_else(|| {
                    relationship_error(&entity.name, &attr.name, format!("inverse '{}.{}' does not exist", target, inverse))
                })?;
                if other.reference.is_some() {
                    return Err(relationship_error(&entity.name, &attr.name, "one-to-one relationships are not supported"));
                }
                check_points_back(entity, attr, other)?;
            }
            Attribute {
                name: attr.name.clone(),
                kind: AttrKind::Reference {
                    target: target.clone(),
                    inverse: attr.inverse.clone(),
                },
                nullable,
                lazy: false,
                columns: key_reference_columns(&attr.name, &target_def.primary_key),
                link: None,
            }
        } else if let Some(target) = &attr.collection {
            let target_def = defs
                .get(target.as_str())
                .ok_or_else(|| relationship_error(&entity.name, &attr.name, format!("unknown target entity '{}'", target)))?;
            let inverse = attr.inverse.as_ref().ok_or_else(|| {
                relationship_error(&entity.name, &attr.name, "collections must declare an inverse")
            })?;
            let other = find_attribute(target_def, inverse).ok_or_else(|| {
                relationship_error(&entity.name, &attr.name, format!("inverse '{}.{}' does not exist", target, inverse))
            })?;
            check_points_back(entity, attr, other)?;

            let link = if other.collection.is_some() {
                if target == &entity.name {
                    return Err(relationship_error(&entity.name, &attr.name, "self-referencing many-to-many relationships are not supported"));
                }
                let mut names = [entity.name.as_str(), target.as_str()];
                names.sort();
                Some(LinkTable {
                    table: names.join("_"),
                    source_columns: key_reference_columns(&entity.name.to_lowercase(), &entity.primary_key),
                    target_columns: key_reference_columns(&target.to_lowercase(), &target_def.primary_key),
                })
            } else if other.reference.is_some() {
                None
            } else {
                return Err(relationship_error(&entity.name, &attr.name, "inverse must be a relationship attribute"));
            };

            Attribute {
                name: attr.name.clone(),
                kind: AttrKind::Collection {
                    target: target.clone(),
                    inverse: inverse.clone(),
                },
                nullable: false,
                lazy: false,
                columns: Vec::new(),
                link,
            }
        } else {
            return Err(SchemaError::AmbiguousAttribute {
                entity: entity.name.clone(),
                attribute: attr.name.clone(),
            });
        };
        attributes.push(built);
    }

    Ok(EntityType {
        name: entity.name.clone(),
        table: entity.table.clone().unwrap_or_else(|| entity.name.clone()),
        attributes,
        primary_key: entity.primary_key.clone(),
    })
}

fn find_attribute<'a>(entity: &'a EntityDef, name: &str) -> Option<&'a AttributeDef> {
    entity.attributes.iter().find(|a| a.name == name)
}

/// The inverse end must target this entity and, when it names an inverse, name this attribute
fn check_points_back(
    entity: &EntityDef,
    attr: &AttributeDef,
    other: &AttributeDef,
) -> Result<(), SchemaError> {
    let other_target = other.reference.as_ref().or(other.collection.as_ref());
    if other_target != Some(&entity.name) {
        return Err(relationship_error(&entity.name, &attr.name, format!("inverse '{}' does not point back to '{}'", other.name, entity.name)));
    }
    if let Some(back) = &other.inverse {
        if back != &attr.name {
            return Err(relationship_error(&entity.name, &attr.name, format!("inverse '{}' names '{}' as its inverse", other.name, back)));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn university() -> Schema {
        Schema::builder()
            .entity(
                EntityDef::new("Department")
                    .key("number", ScalarKind::Int)
                    .required("name", ScalarKind::Unicode)
                    .set("groups", "Group", "dept")
                    .set("courses", "Course", "dept"),
            )
            .entity(
                EntityDef::new("Group")
                    .key("number", ScalarKind::Int)
                    .required("major", ScalarKind::Unicode)
                    .reference("dept", "Department", "groups")
                    .set("students", "Student", "group"),
            )
            .entity(
                EntityDef::new("Course")
                    .required("name", ScalarKind::Unicode)
                    .required("semester", ScalarKind::Int)
                    .reference("dept", "Department", "courses")
                    .set("students", "Student", "courses")
                    .primary_key(&["name", "semester"]),
            )
            .entity(
                EntityDef::new("Student")
                    .key("id", ScalarKind::Int)
                    .required("name", ScalarKind::Unicode)
                    .optional("tel", ScalarKind::Str)
                    .attribute(AttributeDef::scalar("picture", ScalarKind::Bytes).optional().lazy())
                    .reference("group", "Group", "students")
                    .set("courses", "Course", "students"),
            )
            .build()
            .unwrap()
    }

    #[test]
    fn test_build_relationships() {
        let schema = university();
        let group = schema.attribute("Student", "group").unwrap();
        assert_eq!(group.columns, vec!["group".to_string()]);

        let inverse = schema.inverse("Group", "students").unwrap().unwrap();
        assert_eq!(inverse.name, "group");

        let groups = schema.attribute("Department", "groups").unwrap();
        assert!(groups.link.is_none());
    }

    #[test]
    fn test_many_to_many_link_table() {
        let schema = university();
        let courses = schema.attribute("Student", "courses").unwrap();
        let link = courses.link.unwrap();
        assert_eq!(link.table, "Course_Student");
        assert_eq!(link.source_columns, vec!["student".to_string()]);
        assert_eq!(
            link.target_columns,
            vec!["course_name".to_string(), "course_semester".to_string()]
        );

        let students = schema.attribute("Course", "students").unwrap().link.unwrap();
        assert_eq!(students.table, "Course_Student");
        assert_eq!(students.source_columns, link.target_columns);
    }

    #[test]
    fn test_unknown_entity() {
        let schema = university();
        assert_eq!(
            schema.entity("FooBar").unwrap_err(),
            SchemaError::UnknownEntity("FooBar".to_string())
        );
        assert!(matches!(
            schema.attribute("Student", "foo"),
            Err(SchemaError::UnknownAttribute { .. })
        ));
    }

    #[test]
    fn test_rejects_one_to_one() {
        let result = Schema::builder()
            .entity(
                EntityDef::new("Person")
                    .key("id", ScalarKind::Int)
                    .attribute(AttributeDef::reference("passport", "Passport", "owner").optional()),
            )
            .entity(
                EntityDef::new("Passport")
                    .key("id", ScalarKind::Int)
                    .reference("owner", "Person", "passport"),
            )
            .build();
        assert!(matches!(result, Err(SchemaError::InvalidRelationship { .. })));
    }

    #[test]
    fn test_rejects_dangling_inverse() {
        let result = Schema::builder()
            .entity(
                EntityDef::new("Group")
                    .key("number", ScalarKind::Int)
                    .set("students", "Student", "group"),
            )
            .entity(EntityDef::new("Student").key("id", ScalarKind::Int))
            .build();
        assert!(matches!(result, Err(SchemaError::InvalidRelationship { .. })));
    }

    #[test]
    fn test_invalid_definitions() {
        let missing_key = Schema::builder()
            .entity(EntityDef::new("Thing").required("name", ScalarKind::Str))
            .build();
        assert_eq!(
            missing_key.unwrap_err(),
            SchemaError::MissingPrimaryKey("Thing".to_string())
        );

        let bad_name = Schema::builder()
            .entity(EntityDef::new("Bad Name").key("id", ScalarKind::Int))
            .build();
        assert!(matches!(bad_name, Err(SchemaError::InvalidIdentifier(_))));
    }

    #[test]
    fn test_from_json() {
        let json = r#"{
            "entities": [
                {"name": "Group", "primary_key": ["number"], "attributes": [
                    {"name": "number", "kind": "int"},
                    {"name": "major", "kind": "unicode"},
                    {"name": "students", "collection": "Student", "inverse": "group"}
                ]},
                {"name": "Student", "primary_key": ["id"], "attributes": [
                    {"name": "id", "kind": "int"},
                    {"name": "tel", "kind": "str", "optional": true},
                    {"name": "group", "reference": "Group", "inverse": "students"}
                ]}
            ]
        }"#;
        let schema = Schema::from_json(json).unwrap();
        let tel = schema.attribute("Student", "tel").unwrap();
        assert!(tel.nullable);
        assert_eq!(tel.scalar_kind(), Some(ScalarKind::Str));

        assert!(matches!(
            Schema::from_json("{not json"),
            Err(SchemaError::Json(_))
        ));
    }

    #[test]
    fn test_create_statements() {
        let schema = university();
        let ddl = schema.create_statements();
        assert_eq!(ddl.len(), 5);
        assert!(ddl.iter().any(|s| s.starts_with("CREATE TABLE \"Course_Student\"")));
        let student = ddl
            .iter()
            .find(|s| s.starts_with("CREATE TABLE \"Student\""))
            .unwrap();
        assert!(student.contains("\"tel\" TEXT,"));
        assert!(student.contains("\"group\" INTEGER NOT NULL"));
        assert!(student.contains("PRIMARY KEY (\"id\")"));
    }
}
