//! Query translation
//!
//! Turns a [`QueryTree`] into a [`CompiledPlan`]: the walker resolves names
//! and attribute chains, the planner decides joins and `DISTINCT`, the SQL
//! writer renders text, and decoders describe how rows map back to values.
//! Plans are cached per tree identity.

pub mod alias;
pub mod config;
pub mod decoder;
pub mod plan;
pub mod planner;
pub mod sql;
pub mod types;
mod walker;

use std::sync::Arc;

use crate::data::{Bindings, IdentityMap};
use crate::query::ast::QueryTree;
use crate::query::cache::{CacheStats, PlanCache, PlanKey};
use crate::query::executor::{Database, ExecuteError, Query, Rows};
use crate::schema::{SchemaError, SchemaProvider};

pub use alias::{AliasId, AliasTable, PathKey};
pub use config::{AliasStyle, TranslatorConfig};
pub use decoder::{DecodeError, Decoded, Decoder};
pub use plan::{CompiledPlan, DistinctMode, ParamError, ParamSpec, PlanShape};
pub use sql::{Select, SqlExpr};
pub use types::ExprType;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TranslateError {
    #[error("Incomparable types '{left}' and '{right}' in expression: {expr}")]
    IncomparableTypes {
        left: String,
        right: String,
        expr: String,
    },

    #[error("{expr} raises {source}")]
    ExprEval {
        expr: String,
        #[source]
        source: SchemaError,
    },

    #[error("{0}")]
    Translation(String),

    #[error("Schema error: {0}")]
    Schema(#[from] SchemaError),
}

/// Compiles and executes query trees against one schema
pub struct Translator {
    schema: Arc<dyn SchemaProvider>,
    config: TranslatorConfig,
    cache: PlanCache,
}

impl Translator {
    pub fn new(schema: Arc<dyn SchemaProvider>) -> Self {
        Self::with_config(schema, TranslatorConfig::default())
    }

    pub fn with_config(schema: Arc<dyn SchemaProvider>, config: TranslatorConfig) -> Self {
        let cache = PlanCache::new(config.plan_cache_capacity, config.plan_cache_ttl);
        Self {
            schema,
            config,
            cache,
        }
    }

    pub fn schema(&self) -> &dyn SchemaProvider {
        self.schema.as_ref()
    }

    pub fn config(&self) -> &TranslatorConfig {
        &self.config
    }

    /// Compile the row-returning plan for `tree` under `mode`
    pub fn compile(
        &self,
        tree: &QueryTree,
        bindings: &Bindings,
        mode: DistinctMode,
    ) -> Result<Arc<CompiledPlan>, TranslateError> {
        self.compile_shape(tree, bindings, mode, PlanShape::Rows)
    }

    pub fn compile_shape(
        &self,
        tree: &QueryTree,
        bindings: &Bindings,
        mode: DistinctMode,
        shape: PlanShape,
    ) -> Result<Arc<CompiledPlan>, TranslateError> {
        let key = PlanKey {
            query: tree.id(),
            mode,
            shape,
            signature: bindings.signature(tree.free_names()),
        };
        self.cache.get_or_compile(key, || {
            tracing::debug!(query = %tree.id(), ?mode, ?shape, "compiling query: {}", tree);
            let plan = walker::compile(
                self.schema.as_ref(),
                tree,
                bindings,
                mode,
                shape,
                self.config.alias_style,
            )?;
            tracing::debug!(query = %tree.id(), distinct = plan.distinct, params = plan.params.len(), "compiled:\n{}", plan.sql);
            Ok(Arc::new(plan))
        })
    }

    /// Submit a plan and return its decoded rows
    ///
    /// The returned sequence is lazy over the fetched rows; call `execute`
    /// again to run the statement anew.
    pub fn execute<'a>(
        &self,
        plan: &Arc<CompiledPlan>,
        db: &dyn Database,
        identity: &'a dyn IdentityMap,
        bindings: &Bindings,
    ) -> Result<Rows<'a>, ExecuteError> {
        let params = plan.bind(bindings, self.schema.as_ref())?;
        tracing::debug!(query = %plan.query, params = params.len(), "submitting plan");
        let raw = db.submit(&plan.sql, &params).map_err(ExecuteError::Database)?;
        Ok(Rows::new(plan.clone(), raw, identity))
    }

    /// Drop every cached plan of `tree`
    pub fn invalidate(&self, tree: &QueryTree) {
        self.cache.invalidate_query(tree.id());
    }

    pub fn invalidate_all(&self) {
        self.cache.invalidate_all();
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Open a query handle; the default-mode plan is compiled immediately so
    /// translation errors surface here
    pub fn select<'t>(
        &'t self,
        db: &'t dyn Database,
        identity: &'t dyn IdentityMap,
        tree: impl Into<Arc<QueryTree>>,
        bindings: Bindings,
    ) -> Result<Query<'t>, TranslateError> {
        let tree = tree.into();
        self.compile(&tree, &bindings, DistinctMode::Auto)?;
        Ok(Query::new(self, db, identity, tree, bindings))
    }

    /// Parse `text` and open a query handle over it
    pub fn select_str<'t>(
        &'t self,
        db: &'t dyn Database,
        identity: &'t dyn IdentityMap,
        text: &str,
        bindings: Bindings,
    ) -> Result<Query<'t>, crate::query::QueryError> {
        let tree = QueryTree::parse(text)?;
        Ok(self.select(db, identity, tree, bindings)?)
    }
}

impl std::fmt::Debug for Translator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Translator")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
