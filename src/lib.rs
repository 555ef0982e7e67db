//! entql: declarative entity queries compiled to SQL
//!
//! Queries are comprehensions over an entity model
//! (`s for s in Student if s.group.number == 101`). The translator resolves
//! attribute chains into joins and correlated sub-queries, decides when
//! `DISTINCT` is needed, renders SQL with positional parameters, and decodes
//! result rows back into scalars, tuples, or entity instances.
//!
//! # Features
//!
//! - **Entity Schema**: scalar attributes, to-one references, one-to-many and
//!   many-to-many collections, single or composite primary keys
//! - **Type Checking**: incomparable operands are rejected before any SQL is built
//! - **Join Planning**: one alias per canonical path, LEFT joins for optional references
//! - **DISTINCT Analysis**: key-uniqueness over the joined items
//! - **Plan Cache**: compiled plans cached per query tree and distinct mode
//! - **Identity Map**: one instance per entity key across results
//!
//! # Example
//!
//! ```no_run
//! use entql::data::{Bindings, ScalarKind};
//! use entql::query::QueryTree;
//! use entql::schema::{EntityDef, Schema};
//! use entql::translate::{DistinctMode, Translator};
//! use std::sync::Arc;
//!
//! let schema = Schema::builder()
//!     .entity(
//!         EntityDef::new("Group")
//!             .key("number", ScalarKind::Int)
//!             .set("students", "Student", "group"),
//!     )
//!     .entity(
//!         EntityDef::new("Student")
//!             .key("id", ScalarKind::Int)
//!             .required("name", ScalarKind::Unicode)
//!             .reference("group", "Group", "students"),
//!     )
//!     .build()
//!     .unwrap();
//!
//! let translator = Translator::new(Arc::new(schema));
//! let tree = QueryTree::parse("s.name for s in Student if s.group.number == 101").unwrap();
//! let plan = translator.compile(&tree, &Bindings::new(), DistinctMode::Auto).unwrap();
//! println!("{}", plan.sql);
//! ```

pub mod data;
pub mod query;
pub mod schema;
pub mod translate;

// Re-export commonly used types
pub use data::{Bindings, EntityCache, Value};
pub use query::{run_query, Database, Query, QueryError, QueryTree};
pub use schema::{Schema, SchemaProvider};
pub use translate::{CompiledPlan, DistinctMode, TranslateError, Translator};
