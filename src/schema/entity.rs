use crate::data::ScalarKind;

/// Kind of an attribute: a scalar column or one end of a relationship
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttrKind {
    Scalar(ScalarKind),
    /// To-one: foreign key columns live on the owner's table
    Reference {
        target: String,
        inverse: Option<String>,
    },
    /// To-many: either the target holds the foreign key or a link table does
    Collection { target: String, inverse: String },
}

/// Link table backing a many-to-many collection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkTable {
    pub table: String,
    /// Columns referencing the owner of the collection
    pub source_columns: Vec<String>,
    /// Columns referencing the collection's target
    pub target_columns: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Attribute {
    pub name: String,
    pub kind: AttrKind,
    pub nullable: bool,
    /// Lazy attributes are not loaded with the rest of the entity
    pub lazy: bool,
    /// Columns on the owner's table (scalar column or foreign key columns)
    pub columns: Vec<String>,
    /// Set for many-to-many collections
    pub link: Option<LinkTable>,
}

impl Attribute {
    pub fn is_scalar(&self) -> bool {
        matches!(self.kind, AttrKind::Scalar(_))
    }

    pub fn is_reference(&self) -> bool {
        matches!(self.kind, AttrKind::Reference { .. })
    }

    pub fn is_collection(&self) -> bool {
        matches!(self.kind, AttrKind::Collection { .. })
    }

    pub fn scalar_kind(&self) -> Option<ScalarKind> {
        match self.kind {
            AttrKind::Scalar(kind) => Some(kind),
            _ => None,
        }
    }

    /// Target entity of a relationship attribute
    pub fn target(&self) -> Option<&str> {
        match &self.kind {
            AttrKind::Scalar(_) => None,
            AttrKind::Reference { target, .. } | AttrKind::Collection { target, .. } => {
                Some(target)
            }
        }
    }

    pub fn inverse(&self) -> Option<&str> {
        match &self.kind {
            AttrKind::Scalar(_) => None,
            AttrKind::Reference { inverse, .. } => inverse.as_deref(),
            AttrKind::Collection { inverse, .. } => Some(inverse),
        }
    }
}

/// A mapped entity type
#[derive(Debug, Clone)]
pub struct EntityType {
    pub name: String,
    pub table: String,
    pub(crate) attributes: Vec<Attribute>,
    pub(crate) primary_key: Vec<String>,
}

impl EntityType {
    pub fn attribute(&self, name: &str) -> Option<&Attribute> {
        self.attributes.iter().find(|a| a.name == name)
    }

    pub fn attributes(&self) -> &[Attribute] {
        &self.attributes
    }

    /// Primary key attribute names in key order
    pub fn primary_key(&self) -> &[String] {
        &self.primary_key
    }

    /// Position of an attribute within the primary key
    pub fn key_position(&self, name: &str) -> Option<usize> {
        self.primary_key.iter().position(|k| k == name)
    }

    /// Primary key columns with their kinds
    pub fn key_columns(&self) -> Vec<(String, ScalarKind)> {
        self.primary_key
            .iter()
            .filter_map(|name| self.attribute(name))
            .filter_map(|attr| {
                attr.scalar_kind()
                    .map(|kind| (attr.columns[0].clone(), kind))
            })
            .collect()
    }

    /// Non-key columns loaded together with the entity, in declaration order
    ///
    /// Excludes lazy attributes and collections.
    pub fn eager_attributes(&self) -> impl Iterator<Item = &Attribute> {
        self.attributes.iter().filter(move |attr| {
            !attr.lazy && !attr.is_collection() && self.key_position(&attr.name).is_none()
        })
    }
}
