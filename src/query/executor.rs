//! Plan execution and query handles

use fxhash::{FxHashMap, FxHashSet};
use parking_lot::Mutex;
use std::sync::Arc;

use super::ast::QueryTree;
use crate::data::{Bindings, IdentityMap, Value};
use crate::translate::{
    CompiledPlan, DecodeError, Decoded, DistinctMode, ParamError, PlanShape, TranslateError,
    Translator,
};

/// Error type returned by a [`Database`], passed through unmodified
pub type DatabaseError = Box<dyn std::error::Error + Send + Sync>;

/// Persistence collaborator: runs one statement with positional parameters
pub trait Database: Send + Sync {
    fn submit(&self, sql: &str, params: &[Value]) -> Result<Vec<Vec<Value>>, DatabaseError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ExecuteError {
    #[error("Multiple objects were found. Use select(...) to retrieve them")]
    MultipleObjectsFound,

    #[error(transparent)]
    Database(DatabaseError),

    #[error("Unbound parameter: {0}")]
    UnboundParameter(#[from] ParamError),

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Translate(#[from] TranslateError),
}

/// Decoded result rows of one execution
///
/// Decoding happens as the sequence is consumed. Plans compiled with
/// `DISTINCT` also drop repeated raw rows.
pub struct Rows<'a> {
    plan: Arc<CompiledPlan>,
    raw: std::vec::IntoIter<Vec<Value>>,
    identity: &'a dyn IdentityMap,
    seen: Option<FxHashSet<Vec<Value>>>,
}

impl<'a> Rows<'a> {
    pub(crate) fn new(
        plan: Arc<CompiledPlan>,
        raw: Vec<Vec<Value>>,
        identity: &'a dyn IdentityMap,
    ) -> Self {
        let seen = plan.distinct.then(FxHashSet::default);
        Self {
            plan,
            raw: raw.into_iter(),
            identity,
            seen,
        }
    }

    pub fn plan(&self) -> &Arc<CompiledPlan> {
        &self.plan
    }
}

impl Iterator for Rows<'_> {
    type Item = Result<Decoded, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let row = self.raw.next()?;
            if let Some(seen) = &mut self.seen {
                if !seen.insert(row.clone()) {
                    continue;
                }
            }
            return Some(self.plan.decode(&row, self.identity));
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, self.raw.size_hint().1)
    }
}

type Snapshots = Arc<Mutex<FxHashMap<DistinctMode, Arc<Vec<Decoded>>>>>;

/// A query bound to its parameters, database and identity map
///
/// Each distinct mode has its own compiled plan and its own result snapshot;
/// handles derived with [`Query::distinct`] or [`Query::without_distinct`]
/// share the snapshot map with the handle they came from.
#[derive(Clone)]
pub struct Query<'t> {
    translator: &'t Translator,
    db: &'t dyn Database,
    identity: &'t dyn IdentityMap,
    tree: Arc<QueryTree>,
    bindings: Bindings,
    mode: DistinctMode,
    snapshots: Snapshots,
}

impl<'t> Query<'t> {
    pub(crate) fn new(
        translator: &'t Translator,
        db: &'t dyn Database,
        identity: &'t dyn IdentityMap,
        tree: Arc<QueryTree>,
        bindings: Bindings,
    ) -> Self {
        Self {
            translator,
            db,
            identity,
            tree,
            bindings,
            mode: DistinctMode::Auto,
            snapshots: Arc::default(),
        }
    }

    pub fn tree(&self) -> &Arc<QueryTree> {
        &self.tree
    }

    pub fn mode(&self) -> DistinctMode {
        self.mode
    }

    fn with_mode(&self, mode: DistinctMode) -> Self {
        Self {
            mode,
            ..self.clone()
        }
    }

    /// Always apply `DISTINCT`
    pub fn distinct(&self) -> Self {
        self.with_mode(DistinctMode::Distinct)
    }

    /// Never apply `DISTINCT`, keeping duplicate rows
    pub fn without_distinct(&self) -> Self {
        self.with_mode(DistinctMode::WithoutDistinct)
    }

    pub fn plan(&self) -> Result<Arc<CompiledPlan>, TranslateError> {
        self.translator.compile(&self.tree, &self.bindings, self.mode)
    }

    pub fn sql(&self) -> Result<String, TranslateError> {
        Ok(self.plan()?.sql.clone())
    }

    /// Run the statement anew and return its rows
    pub fn iter(&self) -> Result<Rows<'t>, ExecuteError> {
        let plan = self.plan()?;
        self.translator
            .execute(&plan, self.db, self.identity, &self.bindings)
    }

    /// All results for the current mode, executed once and then snapshotted
    pub fn fetch(&self) -> Result<Arc<Vec<Decoded>>, ExecuteError> {
        if let Some(snapshot) = self.snapshots.lock().get(&self.mode) {
            return Ok(snapshot.clone());
        }

        let items = self.iter()?.collect::<Result<Vec<_>, _>>()?;
        let snapshot = Arc::new(items);
        self.snapshots.lock().insert(self.mode, snapshot.clone());
        Ok(snapshot)
    }

    /// Drop the result snapshots of every mode
    pub fn refresh(&self) {
        self.snapshots.lock().clear();
    }

    fn scalar(&self, shape: PlanShape) -> Result<Option<Value>, ExecuteError> {
        let plan = self
            .translator
            .compile_shape(&self.tree, &self.bindings, self.mode, shape)?;
        let mut rows = self
            .translator
            .execute(&plan, self.db, self.identity, &self.bindings)?;
        match rows.next() {
            Some(row) => Ok(row?.as_value().cloned()),
            None => Ok(None),
        }
    }

    /// Number of results, computed by the database
    pub fn count(&self) -> Result<i64, ExecuteError> {
        Ok(self
            .scalar(PlanShape::Count)?
            .and_then(|v| v.as_i64())
            .unwrap_or(0))
    }

    pub fn exists(&self) -> Result<bool, ExecuteError> {
        Ok(self
            .scalar(PlanShape::Exists)?
            .and_then(|v| v.as_bool())
            .unwrap_or(false))
    }

    /// The single result, `None` when there is none
    pub fn get(&self) -> Result<Option<Decoded>, ExecuteError> {
        let items = self.fetch()?;
        match items.len() {
            0 => Ok(None),
            1 => Ok(items.first().cloned()),
            _ => Err(ExecuteError::MultipleObjectsFound),
        }
    }

    pub fn first(&self) -> Result<Option<Decoded>, ExecuteError> {
        Ok(self.fetch()?.first().cloned())
    }
}

impl std::fmt::Debug for Query<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Query")
            .field("query", &self.tree.id())
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}
