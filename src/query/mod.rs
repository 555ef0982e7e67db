pub mod ast;
pub mod cache;
pub mod executor;
pub mod parser;

pub use ast::{Comprehension, Expr, Generator, QueryBuilder, QueryId, QueryTree};
pub use cache::{CacheStats, PlanCache, PlanKey};
pub use executor::{Database, DatabaseError, ExecuteError, Query, Rows};
pub use parser::{parse_query, ParseError};

use crate::data::{Bindings, IdentityMap};
use crate::translate::{Decoded, TranslateError, Translator};

/// Convenience function to parse, compile, and execute a query
pub fn run_query(
    translator: &Translator,
    db: &dyn Database,
    identity: &dyn IdentityMap,
    text: &str,
    bindings: Bindings,
) -> Result<Vec<Decoded>, QueryError> {
    let tree = parse_query(text)?;
    let plan = translator.compile(&tree, &bindings, Default::default())?;
    let rows = translator.execute(&plan, db, identity, &bindings)?;
    Ok(rows.collect::<Result<Vec<_>, _>>().map_err(ExecuteError::from)?)
}

#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("Schema error: {0}")]
    Schema(#[from] crate::schema::SchemaError),

    #[error("Translation error: {0}")]
    Translate(#[from] TranslateError),

    #[error("Execute error: {0}")]
    Execute(#[from] ExecuteError),
}
