//! Query expression trees
//!
//! A [`QueryTree`] is a comprehension (`result for var in source if cond ...`)
//! plus optional ordering and paging. Trees are immutable once built and carry
//! a process-unique [`QueryId`] used as their identity by the plan cache.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::data::Value;

static NEXT_QUERY_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a query tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize)]
pub struct QueryId(u64);

impl QueryId {
    fn next() -> Self {
        Self(NEXT_QUERY_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpOp {
    pub fn is_equality(self) -> bool {
        matches!(self, CmpOp::Eq | CmpOp::Ne)
    }
}

impl fmt::Display for CmpOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CmpOp::Eq => "==",
            CmpOp::Ne => "!=",
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

impl fmt::Display for ArithOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ArithOp::Add => "+",
            ArithOp::Sub => "-",
            ArithOp::Mul => "*",
            ArithOp::Div => "/",
            ArithOp::Mod => "%",
        };
        write!(f, "{}", s)
    }
}

/// Expression node
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Iteration variable, entity name or external name
    Name(String),
    Attr(Box<Expr>, String),
    Const(Value),
    /// Entity lookup by primary key: `Group[101]`
    Lookup { entity: Box<Expr>, key: Vec<Expr> },
    Compare {
        op: CmpOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    And(Vec<Expr>),
    Or(Vec<Expr>),
    Not(Box<Expr>),
    Arith {
        op: ArithOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Neg(Box<Expr>),
    In {
        item: Box<Expr>,
        collection: Box<Expr>,
        negated: bool,
    },
    IsNone { expr: Box<Expr>, negated: bool },
    Tuple(Vec<Expr>),
    Call {
        func: String,
        args: Vec<Expr>,
        kwargs: Vec<(String, Expr)>,
    },
    Method {
        target: Box<Expr>,
        method: String,
        args: Vec<Expr>,
    },
    Comprehension(Box<Comprehension>),
}

/// `for var in source if cond ...`
#[derive(Debug, Clone, PartialEq)]
pub struct Generator {
    pub var: String,
    pub source: Expr,
    pub conditions: Vec<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Comprehension {
    pub result: Expr,
    pub generators: Vec<Generator>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderTerm {
    pub expr: Expr,
    pub descending: bool,
}

/// An immutable, identified query
#[derive(Debug, Clone)]
pub struct QueryTree {
    id: QueryId,
    comprehension: Comprehension,
    order_by: Vec<OrderTerm>,
    limit: Option<u64>,
    offset: Option<u64>,
    free_names: BTreeSet<String>,
}

impl QueryTree {
    pub fn new(comprehension: Comprehension) -> Self {
        let free_names = comprehension.free_names();
        Self {
            id: QueryId::next(),
            comprehension,
            order_by: Vec::new(),
            limit: None,
            offset: None,
            free_names,
        }
    }

    pub fn id(&self) -> QueryId {
        self.id
    }

    pub fn comprehension(&self) -> &Comprehension {
        &self.comprehension
    }

    pub fn order_by(&self) -> &[OrderTerm] {
        &self.order_by
    }

    pub fn limit(&self) -> Option<u64> {
        self.limit
    }

    pub fn offset(&self) -> Option<u64> {
        self.offset
    }

    /// Names not bound by any generator: entity names and external parameters
    pub fn free_names(&self) -> &BTreeSet<String> {
        &self.free_names
    }
}

impl fmt::Display for QueryTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.comprehension)
    }
}

impl Comprehension {
    pub fn new(result: Expr, generators: Vec<Generator>) -> Self {
        Self { result, generators }
    }

    fn free_names(&self) -> BTreeSet<String> {
        let mut free = BTreeSet::new();
        let mut bound = Vec::new();
        self.collect_free(&mut bound, &mut free);
        free
    }

    fn collect_free(&self, bound: &mut Vec<String>, free: &mut BTreeSet<String>) {
        let depth = bound.len();
        for generator in &self.generators {
            generator.source.collect_free(bound, free);
            bound.push(generator.var.clone());
            for condition in &generator.conditions {
                condition.collect_free(bound, free);
            }
        }
        self.result.collect_free(bound, free);
        bound.truncate(depth);
    }
}

impl Expr {
    pub fn name(name: impl Into<String>) -> Self {
        Expr::Name(name.into())
    }

    pub fn lit(value: impl Into<Value>) -> Self {
        Expr::Const(value.into())
    }

    pub fn attr(self, attribute: impl Into<String>) -> Self {
        Expr::Attr(Box::new(self), attribute.into())
    }

    /// Attribute chain from a dotted path: `path("s.group.dept")`
    pub fn path(dotted: &str) -> Self {
        let mut parts = dotted.split('.');
        let root = Expr::name(parts.next().unwrap_or_default());
        parts.fold(root, |expr, part| expr.attr(part))
    }

    fn compare(self, op: CmpOp, other: Expr) -> Self {
        Expr::Compare {
            op,
            left: Box::new(self),
            right: Box::new(other),
        }
    }

    pub fn eq(self, other: Expr) -> Self {
        self.compare(CmpOp::Eq, other)
    }

    pub fn ne(self, other: Expr) -> Self {
        self.compare(CmpOp::Ne, other)
    }

    pub fn lt(self, other: Expr) -> Self {
        self.compare(CmpOp::Lt, other)
    }

    pub fn le(self, other: Expr) -> Self {
        self.compare(CmpOp::Le, other)
    }

    pub fn gt(self, other: Expr) -> Self {
        self.compare(CmpOp::Gt, other)
    }

    pub fn ge(self, other: Expr) -> Self {
        self.compare(CmpOp::Ge, other)
    }

    pub fn and(self, other: Expr) -> Self {
        match self {
            Expr::And(mut items) => {
                items.push(other);
                Expr::And(items)
            }
            first => Expr::And(vec![first, other]),
        }
    }

    pub fn or(self, other: Expr) -> Self {
        match self {
            Expr::Or(mut items) => {
                items.push(other);
                Expr::Or(items)
            }
            first => Expr::Or(vec![first, other]),
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(self) -> Self {
        Expr::Not(Box::new(self))
    }

    pub fn arith(self, op: ArithOp, other: Expr) -> Self {
        Expr::Arith {
            op,
            left: Box::new(self),
            right: Box::new(other),
        }
    }

    pub fn is_in(self, collection: Expr) -> Self {
        Expr::In {
            item: Box::new(self),
            collection: Box::new(collection),
            negated: false,
        }
    }

    pub fn not_in(self, collection: Expr) -> Self {
        Expr::In {
            item: Box::new(self),
            collection: Box::new(collection),
            negated: true,
        }
    }

    pub fn is_none(self) -> Self {
        Expr::IsNone {
            expr: Box::new(self),
            negated: false,
        }
    }

    pub fn is_not_none(self) -> Self {
        Expr::IsNone {
            expr: Box::new(self),
            negated: true,
        }
    }

    pub fn tuple(items: Vec<Expr>) -> Self {
        Expr::Tuple(items)
    }

    pub fn call(func: impl Into<String>, args: Vec<Expr>) -> Self {
        Expr::Call {
            func: func.into(),
            args,
            kwargs: Vec::new(),
        }
    }

    pub fn len(self) -> Self {
        Expr::call("len", vec![self])
    }

    pub fn method(self, method: impl Into<String>, args: Vec<Expr>) -> Self {
        Expr::Method {
            target: Box::new(self),
            method: method.into(),
            args,
        }
    }

    pub fn lookup(entity: impl Into<String>, key: Vec<Expr>) -> Self {
        Expr::Lookup {
            entity: Box::new(Expr::name(entity)),
            key,
        }
    }

    pub fn comprehension(comprehension: Comprehension) -> Self {
        Expr::Comprehension(Box::new(comprehension))
    }

    /// Root name of an attribute chain (`x` for `x.a.b`)
    pub fn root_name(&self) -> Option<&str> {
        match self {
            Expr::Name(name) => Some(name),
            Expr::Attr(base, _) => base.root_name(),
            _ => None,
        }
    }

    /// Names the expression uses without binding them itself
    pub fn free_names(&self) -> BTreeSet<String> {
        let mut free = BTreeSet::new();
        self.collect_free(&mut Vec::new(), &mut free);
        free
    }

    fn collect_free(&self, bound: &mut Vec<String>, free: &mut BTreeSet<String>) {
        match self {
            Expr::Name(name) => {
                if !bound.iter().any(|b| b == name) {
                    free.insert(name.clone());
                }
            }
            Expr::Attr(base, _) => base.collect_free(bound, free),
            Expr::Const(_) => {}
            Expr::Lookup { entity, key } => {
                entity.collect_free(bound, free);
                for k in key {
                    k.collect_free(bound, free);
                }
            }
            Expr::Compare { left, right, .. } | Expr::Arith { left, right, .. } => {
                left.collect_free(bound, free);
                right.collect_free(bound, free);
            }
            Expr::And(items) | Expr::Or(items) | Expr::Tuple(items) => {
                for item in items {
                    item.collect_free(bound, free);
                }
            }
            Expr::Not(inner) | Expr::Neg(inner) => inner.collect_free(bound, free),
            Expr::In {
                item, collection, ..
            } => {
                item.collect_free(bound, free);
                collection.collect_free(bound, free);
            }
            Expr::IsNone { expr, .. } => expr.collect_free(bound, free),
            Expr::Call { args, kwargs, .. } => {
                for arg in args {
                    arg.collect_free(bound, free);
                }
                for (_, arg) in kwargs {
                    arg.collect_free(bound, free);
                }
            }
            Expr::Method { target, args, .. } => {
                target.collect_free(bound, free);
                for arg in args {
                    arg.collect_free(bound, free);
                }
            }
            Expr::Comprehension(inner) => inner.collect_free(bound, free),
        }
    }

    /// Binding strength used when rendering
    fn precedence(&self) -> u8 {
        match self {
            Expr::Or(_) => 1,
            Expr::And(_) => 2,
            Expr::Not(_) => 3,
            Expr::Compare { .. } | Expr::In { .. } | Expr::IsNone { .. } => 4,
            Expr::Arith {
                op: ArithOp::Add | ArithOp::Sub,
                ..
            } => 5,
            Expr::Arith { .. } => 6,
            Expr::Neg(_) => 7,
            _ => 8,
        }
    }

    fn fmt_operand(&self, f: &mut fmt::Formatter<'_>, min: u8) -> fmt::Result {
        if self.precedence() < min {
            write!(f, "({})", self)
        } else {
            write!(f, "{}", self)
        }
    }
}

fn write_list(f: &mut fmt::Formatter<'_>, items: &[Expr]) -> fmt::Result {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{}", item)?;
    }
    Ok(())
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prec = self.precedence();
        match self {
            Expr::Name(name) => write!(f, "{}", name),
            Expr::Attr(base, attr) => {
                base.fmt_operand(f, 8)?;
                write!(f, ".{}", attr)
            }
            Expr::Const(value) => write!(f, "{}", value),
            Expr::Lookup { entity, key } => {
                write!(f, "{}[", entity)?;
                write_list(f, key)?;
                write!(f, "]")
            }
            Expr::Compare { op, left, right } => {
                left.fmt_operand(f, prec + 1)?;
                write!(f, " {} ", op)?;
                right.fmt_operand(f, prec + 1)
            }
            Expr::And(items) | Expr::Or(items) => {
                let sep = if matches!(self, Expr::And(_)) { " and " } else { " or " };
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, "{}", sep)?;
                    }
                    item.fmt_operand(f, prec + 1)?;
                }
                Ok(())
            }
            Expr::Not(inner) => {
                write!(f, "not ")?;
                inner.fmt_operand(f, prec)
            }
            Expr::Arith { op, left, right } => {
                left.fmt_operand(f, prec)?;
                write!(f, " {} ", op)?;
                right.fmt_operand(f, prec + 1)
            }
            Expr::Neg(inner) => {
                write!(f, "-")?;
                inner.fmt_operand(f, prec)
            }
            Expr::In {
                item,
                collection,
                negated,
            } => {
                item.fmt_operand(f, prec + 1)?;
                write!(f, "{}", if *negated { " not in " } else { " in " })?;
                collection.fmt_operand(f, prec + 1)
            }
            Expr::IsNone { expr, negated } => {
                expr.fmt_operand(f, prec + 1)?;
                write!(f, "{}", if *negated { " is not None" } else { " is None" })
            }
            Expr::Tuple(items) => {
                write!(f, "(")?;
                write_list(f, items)?;
                if items.len() == 1 {
                    write!(f, ",")?;
                }
                write!(f, ")")
            }
            Expr::Call { func, args, kwargs } => {
                write!(f, "{}(", func)?;
                write_list(f, args)?;
                for (i, (name, value)) in kwargs.iter().enumerate() {
                    if i > 0 || !args.is_empty() {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}={}", name, value)?;
                }
                write!(f, ")")
            }
            Expr::Method {
                target,
                method,
                args,
            } => {
                target.fmt_operand(f, 8)?;
                write!(f, ".{}(", method)?;
                write_list(f, args)?;
                write!(f, ")")
            }
            Expr::Comprehension(inner) => write!(f, "({})", inner),
        }
    }
}

impl fmt::Display for Comprehension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.result)?;
        for generator in &self.generators {
            write!(f, " for {} in {}", generator.var, generator.source)?;
            for condition in &generator.conditions {
                write!(f, " if {}", condition)?;
            }
        }
        Ok(())
    }
}

/// Fluent construction of query trees
#[derive(Debug, Default)]
pub struct QueryBuilder {
    generators: Vec<Generator>,
    result: Option<Expr>,
    order_by: Vec<OrderTerm>,
    limit: Option<u64>,
    offset: Option<u64>,
}

impl QueryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// `for var in source`; `source` is an entity name or an attribute chain
    pub fn generator(mut self, var: impl Into<String>, source: Expr) -> Self {
        self.generators.push(Generator {
            var: var.into(),
            source,
            conditions: Vec::new(),
        });
        self
    }

    /// Attach a condition to the most recent generator
    pub fn filter(mut self, condition: Expr) -> Self {
        if let Some(generator) = self.generators.last_mut() {
            generator.conditions.push(condition);
        }
        self
    }

    pub fn select(mut self, result: Expr) -> Self {
        self.result = Some(result);
        self
    }

    pub fn order_by(mut self, expr: Expr) -> Self {
        self.order_by.push(OrderTerm {
            expr,
            descending: false,
        });
        self
    }

    pub fn order_by_desc(mut self, expr: Expr) -> Self {
        self.order_by.push(OrderTerm {
            expr,
            descending: true,
        });
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Build the tree; without an explicit result the first variable is selected
    pub fn build(self) -> QueryTree {
        let result = self.result.unwrap_or_else(|| {
            Expr::name(
                self.generators
                    .first()
                    .map(|g| g.var.clone())
                    .unwrap_or_default(),
            )
        });
        let mut tree = QueryTree::new(Comprehension::new(result, self.generators));
        tree.order_by = self.order_by;
        tree.limit = self.limit;
        tree.offset = self.offset;
        tree
    }
}

impl QueryTree {
    /// Copy of this tree with a new identity and extra ordering
    pub fn ordered_by(&self, terms: Vec<OrderTerm>) -> QueryTree {
        let mut tree = QueryTree::new(self.comprehension.clone());
        tree.order_by = terms;
        tree.limit = self.limit;
        tree.offset = self.offset;
        tree
    }

    /// Copy of this tree with a new identity and a page window
    pub fn paged(&self, limit: Option<u64>, offset: Option<u64>) -> QueryTree {
        let mut tree = QueryTree::new(self.comprehension.clone());
        tree.order_by = self.order_by.clone();
        tree.limit = limit;
        tree.offset = offset;
        tree
    }
}
