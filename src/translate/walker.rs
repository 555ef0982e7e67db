//! Expression walker
//!
//! Walks a [`QueryTree`] against the schema and builds the statement: every
//! attribute chain is resolved to a column, a join, a correlated sub-query or
//! an external parameter. Operand types are checked as they are produced, so
//! an ill-typed tree fails here and never reaches the emitter.

use chrono::NaiveDate;
use std::collections::BTreeSet;
use std::sync::Arc;

use super::alias::{AliasId, AliasTable, PathKey, ScopeId};
use super::config::AliasStyle;
use super::decoder::{ColumnDecoder, Decoder};
use super::plan::{CompiledPlan, DistinctMode, ParamSpec, PlanShape};
use super::planner::{is_unique, to_one_join, Link, Scope, ScopeItem, FIXED};
use super::sql::{BinOp, FromItem, Join, OrderItem, Select, SqlExpr, SqlWriter, TableRef};
use super::types::{check_binary, check_membership, ExprType, OpClass};
use super::TranslateError;
use crate::data::{Bindings, Bound, ScalarKind, Value};
use crate::query::ast::{ArithOp, CmpOp, Comprehension, Expr, Generator, QueryTree};
use crate::schema::{AttrKind, Attribute, EntityType, SchemaError, SchemaProvider};

#[derive(Debug, Clone)]
struct ScalarOp {
    sql: SqlExpr,
    kind: ScalarKind,
    nullable: bool,
    /// Alias whose column this is
    owner: Option<AliasId>,
    /// The column is the whole primary key of `owner`
    is_key: bool,
}

impl ScalarOp {
    fn new(sql: SqlExpr, kind: ScalarKind) -> Self {
        Self {
            sql,
            kind,
            nullable: false,
            owner: None,
            is_key: false,
        }
    }

    fn nullable(mut self, nullable: bool) -> Self {
        self.nullable = nullable;
        self
    }
}

/// Where the key of an entity operand comes from
#[derive(Debug, Clone)]
enum EntitySource {
    Alias(AliasId),
    /// To-one reference not joined yet: the key is the owner's foreign key
    Foreign {
        owner: AliasId,
        attribute: String,
        columns: Vec<String>,
    },
    /// Bound entity instance
    External(ParamSpec),
    /// Explicit key values: `Group[101]`
    Keys(Vec<SqlExpr>),
}

#[derive(Debug, Clone)]
struct EntityRef {
    entity: Arc<EntityType>,
    source: EntitySource,
    nullable: bool,
}

/// A collection-valued attribute chain, materialized only where it is consumed
#[derive(Debug, Clone)]
struct CollectionRef {
    origin: EntityRef,
    hops: Vec<String>,
    /// Trailing scalar attribute: `g.students.tel`
    tail: Option<String>,
    element: ExprType,
}

#[derive(Debug, Clone)]
enum Operand {
    Scalar(ScalarOp),
    Null,
    Entity(EntityRef),
    Collection(CollectionRef),
    Tuple(Vec<Operand>),
    Query(Comprehension),
    EntityClass(Arc<EntityType>),
}

fn eq(left: SqlExpr, right: SqlExpr) -> SqlExpr {
    SqlExpr::binary(BinOp::Eq, left, right)
}

fn asc(expr: SqlExpr) -> OrderItem {
    OrderItem {
        expr,
        descending: false,
    }
}

fn count_star() -> SqlExpr {
    SqlExpr::function("COUNT", vec![SqlExpr::Star])
}

fn one() -> SqlExpr {
    SqlExpr::Literal(Value::Int64(1))
}

fn cmp_binop(op: CmpOp) -> BinOp {
    match op {
        CmpOp::Eq => BinOp::Eq,
        CmpOp::Ne => BinOp::NotEq,
        CmpOp::Lt => BinOp::Lt,
        CmpOp::Le => BinOp::LtEq,
        CmpOp::Gt => BinOp::Gt,
        CmpOp::Ge => BinOp::GtEq,
    }
}

fn translation(message: impl Into<String>) -> TranslateError {
    TranslateError::Translation(message.into())
}

/// Items whose key an output contains
fn seeds(op: &Operand) -> Vec<AliasId> {
    match op {
        Operand::Entity(EntityRef {
            source: EntitySource::Alias(alias),
            ..
        }) => vec![*alias],
        Operand::Scalar(scalar) if scalar.is_key => scalar.owner.into_iter().collect(),
        Operand::Tuple(items) => items.iter().flat_map(seeds).collect(),
        _ => Vec::new(),
    }
}

#[derive(Debug, Default)]
struct Outputs {
    columns: Vec<SqlExpr>,
    decoders: Vec<Decoder>,
    order: Vec<OrderItem>,
    seeds: Vec<AliasId>,
    has_entity: bool,
}

struct Walker<'a> {
    schema: &'a dyn SchemaProvider,
    bindings: &'a Bindings,
    aliases: AliasTable,
    scopes: Vec<Scope>,
}

impl<'a> Walker<'a> {
    fn new(schema: &'a dyn SchemaProvider, bindings: &'a Bindings, style: AliasStyle) -> Self {
        Self {
            schema,
            bindings,
            aliases: AliasTable::new(style),
            scopes: Vec::new(),
        }
    }

    fn new_scope(&mut self, parent: Option<ScopeId>) -> ScopeId {
        self.scopes.push(Scope::new(parent));
        self.scopes.len() - 1
    }

    fn entity(&self, name: &str) -> Result<Arc<EntityType>, TranslateError> {
        Ok(self.schema.entity(name)?)
    }

    fn alias_entity(&self, alias: AliasId) -> Result<Arc<EntityType>, TranslateError> {
        match &self.aliases.get(alias).entity {
            Some(name) => self.entity(name),
            None => Err(translation(format!(
                "alias '{}' is not an entity",
                self.aliases.name(alias)
            ))),
        }
    }

    fn column(&self, alias: AliasId, column: &str) -> SqlExpr {
        SqlExpr::column(self.aliases.name(alias), column)
    }

    fn is_outer(&self, alias: AliasId) -> bool {
        let scope = self.aliases.scope(alias);
        self.scopes[scope]
            .item(alias)
            .map(|item| item.outer)
            .unwrap_or(false)
    }

    fn lookup_var(&self, scope: ScopeId, name: &str) -> Option<AliasId> {
        let mut current = Some(scope);
        while let Some(id) = current {
            let scope = &self.scopes[id];
            if let Some((_, alias)) = scope.vars.iter().rev().find(|(var, _)| var == name) {
                return Some(*alias);
            }
            current = scope.parent;
        }
        None
    }

    fn push_item(&mut self, scope: ScopeId, alias: AliasId, join: Join, link: Link, outer: bool) {
        let table = self.aliases.get(alias).table.clone();
        self.scopes[scope].items.push(ScopeItem {
            alias,
            table,
            join,
            link,
            outer,
        });
    }

    fn add_condition(&mut self, scope: ScopeId, condition: SqlExpr) {
        match condition {
            SqlExpr::And(items) => self.scopes[scope].conditions.extend(items),
            other => self.scopes[scope].conditions.push(other),
        }
    }

    fn finish(&self, scope: ScopeId, columns: Vec<SqlExpr>, distinct: bool) -> Select {
        self.scopes[scope].to_select(&self.aliases, columns, distinct, Vec::new())
    }

    fn key_exprs(&self, entity: &EntityRef) -> Vec<SqlExpr> {
        match &entity.source {
            EntitySource::Alias(alias) => entity
                .entity
                .key_columns()
                .iter()
                .map(|(column, _)| self.column(*alias, column))
                .collect(),
            EntitySource::Foreign { owner, columns, .. } => {
                columns.iter().map(|c| self.column(*owner, c)).collect()
            }
            EntitySource::External(spec) => (0..entity.entity.primary_key().len())
                .map(|i| SqlExpr::Param(spec.with_component(i)))
                .collect(),
            EntitySource::Keys(exprs) => exprs.clone(),
        }
    }

    fn source_path(&self, entity: &EntityRef) -> String {
        match &entity.source {
            EntitySource::Alias(alias) => self.aliases.get(*alias).path.clone(),
            EntitySource::Foreign {
                owner, attribute, ..
            } => format!("{}.{}", self.aliases.get(*owner).path, attribute),
            EntitySource::External(spec) => spec.to_string(),
            EntitySource::Keys(_) => entity.entity.name.to_lowercase(),
        }
    }

    fn type_of(&mut self, op: &Operand, scope: ScopeId) -> Result<ExprType, TranslateError> {
        Ok(match op {
            Operand::Scalar(scalar) => ExprType::Scalar(scalar.kind),
            Operand::Null => ExprType::None,
            Operand::Entity(entity) => ExprType::Entity(entity.entity.name.clone()),
            Operand::Collection(collection) => ExprType::Set(Box::new(collection.element.clone())),
            Operand::Tuple(items) => {
                let mut types = Vec::with_capacity(items.len());
                for item in items {
                    types.push(self.type_of(item, scope)?);
                }
                ExprType::Tuple(types)
            }
            Operand::Query(_) => {
                // Typing walks the comprehension; roll the walk back afterwards
                let aliases = self.aliases.clone();
                let scopes = self.scopes.clone();
                let element = self
                    .subquery_rows(op.clone(), scope)
                    .and_then(|(sub, element)| self.type_of(&element, sub));
                self.aliases = aliases;
                self.scopes = scopes;
                ExprType::Set(Box::new(element?))
            }
            Operand::EntityClass(entity) => {
                ExprType::Set(Box::new(ExprType::Entity(entity.name.clone())))
            }
        })
    }

    // Generators

    fn generator(&mut self, generator: &Generator, scope: ScopeId) -> Result<(), TranslateError> {
        let source = self.expr(&generator.source, scope)?;
        let alias = match source {
            Operand::EntityClass(entity) => {
                let alias =
                    self.aliases
                        .bind_var(scope, &generator.var, &entity.name, &entity.table);
                self.push_item(scope, alias, Join::Root, Link::Root, false);
                alias
            }
            Operand::Collection(collection) if collection.tail.is_none() => {
                let element = self.materialize(&collection, scope, Some(&generator.var), false)?;
                self.ensure_alias(&element)?.ok_or_else(|| {
                    translation(format!("Cannot iterate over {}", generator.source))
                })?
            }
            _ => {
                return Err(translation(format!(
                    "Cannot iterate over {}",
                    generator.source
                )))
            }
        };
        self.scopes[scope]
            .vars
            .push((generator.var.clone(), alias));

        for condition in &generator.conditions {
            let sql = self.condition(condition, scope)?;
            self.add_condition(scope, sql);
        }
        Ok(())
    }

    /// Join the hops of `collection` into `scope` and return the element entity
    ///
    /// Hops out of an alias of the same scope become inner joins; hops out of
    /// anything else (an enclosing alias, a parameter) become correlated roots
    /// with their join condition in `WHERE`.
    fn materialize(
        &mut self,
        collection: &CollectionRef,
        scope: ScopeId,
        var: Option<&str>,
        register: bool,
    ) -> Result<EntityRef, TranslateError> {
        let mut current = collection.origin.clone();
        let last = collection.hops.len().saturating_sub(1);

        for (i, hop) in collection.hops.iter().enumerate() {
            let attribute = current.entity.attribute(hop).cloned().ok_or_else(|| {
                SchemaError::UnknownAttribute {
                    entity: current.entity.name.clone(),
                    attribute: hop.clone(),
                }
            })?;
            let var = if i == last { var } else { None };

            current = match &attribute.kind {
                AttrKind::Collection { target, .. } => {
                    let target = self.entity(target)?;
                    let alias =
                        self.collection_hop(&current, &attribute, &target, scope, var, register)?;
                    EntityRef {
                        entity: target,
                        source: EntitySource::Alias(alias),
                        nullable: false,
                    }
                }
                AttrKind::Reference { .. } => {
                    match self.entity_attribute(current, hop, hop, scope)? {
                        Operand::Entity(next) => next,
                        _ => return Err(translation(format!("'{}' is not a reference", hop))),
                    }
                }
                AttrKind::Scalar(_) => {
                    return Err(translation(format!("'{}' is not a relationship", hop)))
                }
            };
        }
        Ok(current)
    }

    fn collection_hop(
        &mut self,
        parent: &EntityRef,
        attribute: &Attribute,
        target: &Arc<EntityType>,
        scope: ScopeId,
        var: Option<&str>,
        register: bool,
    ) -> Result<AliasId, TranslateError> {
        let parent_alias = match &parent.source {
            EntitySource::Alias(alias) => Some(*alias),
            _ => None,
        };
        let local = match &parent.source {
            EntitySource::Alias(alias) => self.aliases.scope(*alias) == scope,
            EntitySource::Foreign { owner, .. } => self.aliases.scope(*owner) == scope,
            _ => false,
        };
        let link_parent = parent_alias.unwrap_or(FIXED);
        let registered = |attribute: String| {
            parent_alias
                .filter(|_| register)
                .map(|parent| PathKey {
                    scope,
                    parent,
                    attribute,
                })
        };

        let target_key = registered(attribute.name.clone());
        if let Some(existing) = target_key.as_ref().and_then(|key| self.aliases.lookup(key)) {
            return Ok(existing);
        }

        let parent_keys = self.key_exprs(parent);
        let path = format!("{}.{}", self.source_path(parent), attribute.name);

        match &attribute.link {
            None => {
                let inverse_name = attribute.inverse().unwrap_or_default();
                let inverse = target.attribute(inverse_name).ok_or_else(|| {
                    SchemaError::UnknownAttribute {
                        entity: target.name.clone(),
                        attribute: inverse_name.to_string(),
                    }
                })?;
                let alias = self.target_alias(scope, target, &path, var, target_key);
                let on = inverse
                    .columns
                    .iter()
                    .zip(parent_keys)
                    .map(|(column, key)| eq(self.column(alias, column), key))
                    .collect();
                self.attach(scope, alias, on, local, Link::OneToMany { parent: link_parent });
                Ok(alias)
            }
            Some(link) => {
                let link_path = format!("{}-link", path);
                let link_alias = match registered(format!("{}-link", attribute.name)) {
                    Some(key) => self.aliases.bind_path(key, None, &link.table, &link_path),
                    None => self.aliases.fresh(scope, None, &link.table, &link_path),
                };
                let on = link
                    .source_columns
                    .iter()
                    .zip(parent_keys)
                    .map(|(column, key)| eq(self.column(link_alias, column), key))
                    .collect();
                self.attach(scope, link_alias, on, local, Link::LinkRow { parent: link_parent });

                let alias = self.target_alias(scope, target, &path, var, target_key);
                let on = target
                    .key_columns()
                    .iter()
                    .zip(&link.target_columns)
                    .map(|((key, _), column)| {
                        eq(self.column(alias, key), self.column(link_alias, column))
                    })
                    .collect();
                self.push_item(
                    scope,
                    alias,
                    Join::Inner(on),
                    Link::ViaLink {
                        link: link_alias,
                        parent: link_parent,
                    },
                    false,
                );
                Ok(alias)
            }
        }
    }

    fn target_alias(
        &mut self,
        scope: ScopeId,
        target: &EntityType,
        path: &str,
        var: Option<&str>,
        key: Option<PathKey>,
    ) -> AliasId {
        match (var, key) {
            (Some(var), _) => self.aliases.bind_var(scope, var, &target.name, &target.table),
            (None, Some(key)) => self.aliases.bind_path(key, Some(&target.name), &target.table, path),
            (None, None) => self.aliases.fresh(scope, Some(&target.name), &target.table, path),
        }
    }

    fn attach(&mut self, scope: ScopeId, alias: AliasId, on: Vec<SqlExpr>, local: bool, link: Link) {
        if local {
            self.push_item(scope, alias, Join::Inner(on), link, false);
        } else {
            self.push_item(scope, alias, Join::Root, link, false);
            for condition in on {
                self.add_condition(scope, condition);
            }
        }
    }

    /// Join a to-one reference in the scope that owns `owner`
    fn join_reference(&mut self, owner: AliasId, attribute: &Attribute) -> Result<AliasId, TranslateError> {
        let scope = self.aliases.scope(owner);
        let key = PathKey {
            scope,
            parent: owner,
            attribute: attribute.name.clone(),
        };
        if let Some(existing) = self.aliases.lookup(&key) {
            return Ok(existing);
        }

        let target = self.entity(attribute.target().unwrap_or_default())?;
        let path = format!("{}.{}", self.aliases.get(owner).path, attribute.name);
        let alias = self
            .aliases
            .bind_path(key, Some(&target.name), &target.table, &path);
        let on = target
            .key_columns()
            .iter()
            .zip(&attribute.columns)
            .map(|((key, _), fk)| eq(self.column(alias, key), self.column(owner, fk)))
            .collect();
        let (join, outer) = to_one_join(on, attribute.nullable, self.is_outer(owner));
        self.push_item(scope, alias, join, Link::ToOne { parent: owner }, outer);
        Ok(alias)
    }

    fn ensure_alias(&mut self, entity: &EntityRef) -> Result<Option<AliasId>, TranslateError> {
        match &entity.source {
            EntitySource::Alias(alias) => Ok(Some(*alias)),
            EntitySource::Foreign {
                owner, attribute, ..
            } => {
                let owner_entity = self.alias_entity(*owner)?;
                let attribute = owner_entity.attribute(attribute).cloned().ok_or_else(|| {
                    SchemaError::UnknownAttribute {
                        entity: owner_entity.name.clone(),
                        attribute: attribute.clone(),
                    }
                })?;
                self.join_reference(*owner, &attribute).map(Some)
            }
            EntitySource::External(_) | EntitySource::Keys(_) => Ok(None),
        }
    }

    /// New sub-query scope producing the elements of a collection or comprehension
    fn subquery_rows(&mut self, source: Operand, scope: ScopeId) -> Result<(ScopeId, Operand), TranslateError> {
        let sub = self.new_scope(Some(scope));
        let element = match source {
            Operand::Collection(collection) => self.collection_element(&collection, sub, false)?,
            Operand::Query(comprehension) => {
                for generator in &comprehension.generators {
                    self.generator(generator, sub)?;
                }
                match self.expr(&comprehension.result, sub)? {
                    Operand::Collection(collection) => {
                        self.collection_element(&collection, sub, false)?
                    }
                    other => other,
                }
            }
            _ => return Err(translation("sub-query source must be a collection")),
        };
        Ok((sub, element))
    }

    fn collection_element(
        &mut self,
        collection: &CollectionRef,
        scope: ScopeId,
        register: bool,
    ) -> Result<Operand, TranslateError> {
        let element = self.materialize(collection, scope, None, register)?;
        match &collection.tail {
            None => Ok(Operand::Entity(element)),
            Some(tail) => self.entity_attribute(element, tail, tail, scope),
        }
    }

    // Expressions

    fn expr(&mut self, expr: &Expr, scope: ScopeId) -> Result<Operand, TranslateError> {
        match expr {
            Expr::Name(name) => self.name(name, scope),
            Expr::Attr(base, attribute) => {
                if let Expr::Name(root) = base.as_ref() {
                    if root == "db"
                        && self.lookup_var(scope, root).is_none()
                        && !self.bindings.contains(root)
                    {
                        return self
                            .schema
                            .entity(attribute)
                            .map(Operand::EntityClass)
                            .map_err(|source| TranslateError::ExprEval {
                                expr: expr.to_string(),
                                source,
                            });
                    }
                }
                let base = self.expr(base, scope)?;
                self.attribute(base, attribute, expr, scope)
            }
            Expr::Const(Value::Float64(f)) if !f.is_finite() => {
                Err(translation(format!("Non-finite float constant in expression: {}", expr)))
            }
            Expr::Const(value) => Ok(match value.kind() {
                Some(kind) => Operand::Scalar(ScalarOp::new(SqlExpr::Literal(value.clone()), kind)),
                None => Operand::Null,
            }),
            Expr::Lookup { entity, key } => self.lookup(entity, key, expr, scope),
            Expr::Compare { .. }
            | Expr::And(_)
            | Expr::Or(_)
            | Expr::Not(_)
            | Expr::In { .. }
            | Expr::IsNone { .. } => Ok(Operand::Scalar(ScalarOp::new(
                self.condition(expr, scope)?,
                ScalarKind::Bool,
            ))),
            Expr::Arith { op, left, right } => self.arith(*op, left, right, expr, scope),
            Expr::Neg(inner) => match self.expr(inner, scope)? {
                Operand::Scalar(ScalarOp {
                    sql: SqlExpr::Literal(Value::Int64(i)),
                    ..
                }) => Ok(Operand::Scalar(ScalarOp::new(
                    SqlExpr::Literal(Value::Int64(-i)),
                    ScalarKind::Int,
                ))),
                Operand::Scalar(ScalarOp {
                    sql: SqlExpr::Literal(Value::Float64(f)),
                    ..
                }) => Ok(Operand::Scalar(ScalarOp::new(
                    SqlExpr::Literal(Value::Float64(-f)),
                    ScalarKind::Float,
                ))),
                Operand::Scalar(scalar) if scalar.kind.is_numeric() => Ok(Operand::Scalar(
                    ScalarOp::new(SqlExpr::Neg(Box::new(scalar.sql)), scalar.kind)
                        .nullable(scalar.nullable),
                )),
                other => {
                    let ty = self.type_of(&other, scope)?;
                    Err(translation(format!(
                        "bad operand type for unary -: '{}' in expression: {}",
                        ty, expr
                    )))
                }
            },
            Expr::Tuple(items) => {
                let mut operands = Vec::with_capacity(items.len());
                for item in items {
                    operands.push(self.expr(item, scope)?);
                }
                Ok(Operand::Tuple(operands))
            }
            Expr::Call { func, args, kwargs } => self.call(func, args, kwargs, expr, scope),
            Expr::Method {
                target,
                method,
                args,
            } => self.method(target, method, args, expr, scope),
            Expr::Comprehension(comprehension) => Ok(Operand::Query((**comprehension).clone())),
        }
    }

    /// Iteration variable, then external binding, then entity name
    fn name(&mut self, name: &str, scope: ScopeId) -> Result<Operand, TranslateError> {
        if let Some(alias) = self.lookup_var(scope, name) {
            return Ok(Operand::Entity(EntityRef {
                entity: self.alias_entity(alias)?,
                source: EntitySource::Alias(alias),
                nullable: self.is_outer(alias),
            }));
        }

        if let Some(bound) = self.bindings.get(name) {
            let spec = ParamSpec::new(name, Vec::new());
            return Ok(match bound {
                Bound::Value(value) => match value.kind() {
                    Some(kind) => Operand::Scalar(ScalarOp::new(SqlExpr::Param(spec), kind)),
                    None => Operand::Null,
                },
                Bound::Entity(obj) => Operand::Entity(EntityRef {
                    entity: self.entity(obj.entity())?,
                    source: EntitySource::External(spec),
                    nullable: false,
                }),
            });
        }

        match self.schema.entity(name) {
            Ok(entity) => Ok(Operand::EntityClass(entity)),
            Err(SchemaError::UnknownEntity(_)) => Err(TranslateError::ExprEval {
                expr: name.to_string(),
                source: SchemaError::UnknownName(name.to_string()),
            }),
            Err(source) => Err(TranslateError::ExprEval {
                expr: name.to_string(),
                source,
            }),
        }
    }

    fn attribute(
        &mut self,
        base: Operand,
        attribute: &str,
        expr: &Expr,
        scope: ScopeId,
    ) -> Result<Operand, TranslateError> {
        let text = expr.to_string();
        match base {
            Operand::Entity(entity) => self.entity_attribute(entity, attribute, &text, scope),
            Operand::Scalar(scalar)
                if scalar.kind == ScalarKind::Date
                    && matches!(attribute, "year" | "month" | "day") =>
            {
                Ok(Operand::Scalar(date_part(scalar, attribute)))
            }
            Operand::Collection(collection) => {
                self.collection_attribute(collection, attribute, &text)
            }
            other => {
                let kind = self.type_of(&other, scope)?;
                Err(TranslateError::ExprEval {
                    expr: text,
                    source: SchemaError::NotAnEntity {
                        kind: kind.to_string(),
                        attribute: attribute.to_string(),
                    },
                })
            }
        }
    }

    fn entity_attribute(
        &mut self,
        entity: EntityRef,
        name: &str,
        text: &str,
        scope: ScopeId,
    ) -> Result<Operand, TranslateError> {
        let attribute = entity
            .entity
            .attribute(name)
            .cloned()
            .ok_or_else(|| TranslateError::ExprEval {
                expr: text.to_string(),
                source: SchemaError::UnknownAttribute {
                    entity: entity.entity.name.clone(),
                    attribute: name.to_string(),
                },
            })?;
        let key_position = entity.entity.key_position(name);

        match entity.source.clone() {
            EntitySource::Alias(alias) => self.alias_attribute(alias, &entity.entity, &attribute),
            EntitySource::Foreign { owner, columns, .. } => {
                if let (Some(pos), AttrKind::Scalar(kind)) = (key_position, &attribute.kind) {
                    // Served from the foreign key column, no join
                    return Ok(Operand::Scalar(
                        ScalarOp::new(self.column(owner, &columns[pos]), *kind)
                            .nullable(entity.nullable),
                    ));
                }
                let joined = self.ensure_alias(&entity)?.ok_or_else(|| {
                    translation(format!("cannot join {}", text))
                })?;
                self.alias_attribute(joined, &entity.entity, &attribute)
            }
            EntitySource::External(spec) => match &attribute.kind {
                AttrKind::Scalar(kind) => match key_position {
                    Some(pos) => Ok(Operand::Scalar(ScalarOp::new(
                        SqlExpr::Param(spec.with_component(pos)),
                        *kind,
                    ))),
                    None if spec.path.is_empty() => Ok(Operand::Scalar(
                        ScalarOp::new(SqlExpr::Param(spec.extend(name)), *kind)
                            .nullable(attribute.nullable),
                    )),
                    None => Err(translation(format!(
                        "Attribute '{}' of external parameter '{}' is not available: {}",
                        name, spec, text
                    ))),
                },
                AttrKind::Reference { target, .. } if spec.path.is_empty() => {
                    Ok(Operand::Entity(EntityRef {
                        entity: self.entity(target)?,
                        source: EntitySource::External(spec.extend(name)),
                        nullable: attribute.nullable,
                    }))
                }
                AttrKind::Reference { .. } => Err(translation(format!(
                    "Attribute '{}' of external parameter '{}' is not available: {}",
                    name, spec, text
                ))),
                AttrKind::Collection { target, .. } => Ok(Operand::Collection(CollectionRef {
                    element: ExprType::Entity(target.clone()),
                    origin: entity,
                    hops: vec![name.to_string()],
                    tail: None,
                })),
            },
            EntitySource::Keys(keys) => match &attribute.kind {
                AttrKind::Scalar(kind) => match key_position {
                    Some(pos) => Ok(Operand::Scalar(ScalarOp::new(keys[pos].clone(), *kind))),
                    None => Ok(Operand::Scalar(
                        ScalarOp::new(
                            self.lookup_column(&entity.entity, &keys, &attribute.columns[0], scope),
                            *kind,
                        )
                        .nullable(true),
                    )),
                },
                AttrKind::Reference { target, .. } => {
                    let fk = attribute
                        .columns
                        .iter()
                        .map(|column| self.lookup_column(&entity.entity, &keys, column, scope))
                        .collect();
                    Ok(Operand::Entity(EntityRef {
                        entity: self.entity(target)?,
                        source: EntitySource::Keys(fk),
                        nullable: true,
                    }))
                }
                AttrKind::Collection { target, .. } => Ok(Operand::Collection(CollectionRef {
                    element: ExprType::Entity(target.clone()),
                    origin: entity,
                    hops: vec![name.to_string()],
                    tail: None,
                })),
            },
        }
    }

    fn alias_attribute(
        &mut self,
        alias: AliasId,
        entity: &Arc<EntityType>,
        attribute: &Attribute,
    ) -> Result<Operand, TranslateError> {
        let outer = self.is_outer(alias);
        match &attribute.kind {
            AttrKind::Scalar(kind) => {
                let is_key = entity.primary_key().len() == 1
                    && entity.key_position(&attribute.name).is_some();
                Ok(Operand::Scalar(ScalarOp {
                    sql: self.column(alias, &attribute.columns[0]),
                    kind: *kind,
                    nullable: attribute.nullable || outer,
                    owner: Some(alias),
                    is_key,
                }))
            }
            AttrKind::Reference { target, .. } => Ok(Operand::Entity(EntityRef {
                entity: self.entity(target)?,
                source: EntitySource::Foreign {
                    owner: alias,
                    attribute: attribute.name.clone(),
                    columns: attribute.columns.clone(),
                },
                nullable: attribute.nullable || outer,
            })),
            AttrKind::Collection { target, .. } => Ok(Operand::Collection(CollectionRef {
                origin: EntityRef {
                    entity: entity.clone(),
                    source: EntitySource::Alias(alias),
                    nullable: outer,
                },
                hops: vec![attribute.name.clone()],
                tail: None,
                element: ExprType::Entity(target.clone()),
            })),
        }
    }

    fn collection_attribute(
        &mut self,
        mut collection: CollectionRef,
        name: &str,
        text: &str,
    ) -> Result<Operand, TranslateError> {
        let element = match (&collection.element, &collection.tail) {
            (ExprType::Entity(element), None) => self.entity(element)?,
            (other, _) => {
                return Err(TranslateError::ExprEval {
                    expr: text.to_string(),
                    source: SchemaError::NotAnEntity {
                        kind: other.to_string(),
                        attribute: name.to_string(),
                    },
                })
            }
        };
        let attribute = element.attribute(name).ok_or_else(|| TranslateError::ExprEval {
            expr: text.to_string(),
            source: SchemaError::UnknownAttribute {
                entity: element.name.clone(),
                attribute: name.to_string(),
            },
        })?;

        match &attribute.kind {
            AttrKind::Scalar(kind) => {
                collection.tail = Some(name.to_string());
                collection.element = ExprType::Scalar(*kind);
            }
            AttrKind::Reference { target, .. } | AttrKind::Collection { target, .. } => {
                collection.hops.push(name.to_string());
                collection.element = ExprType::Entity(target.clone());
            }
        }
        Ok(Operand::Collection(collection))
    }

    /// `(SELECT t.column FROM Entity t WHERE t.key = keys)`
    fn lookup_column(
        &mut self,
        entity: &EntityType,
        keys: &[SqlExpr],
        column: &str,
        scope: ScopeId,
    ) -> SqlExpr {
        let sub = self.new_scope(Some(scope));
        let alias = self
            .aliases
            .fresh(sub, Some(&entity.name), &entity.table, &entity.name.to_lowercase());
        self.push_item(sub, alias, Join::Root, Link::Root, false);
        for ((key, _), value) in entity.key_columns().iter().zip(keys) {
            let condition = eq(self.column(alias, key), value.clone());
            self.add_condition(sub, condition);
        }
        let select = self.finish(sub, vec![self.column(alias, column)], false);
        SqlExpr::Subquery(Box::new(select))
    }

    fn lookup(
        &mut self,
        entity: &Expr,
        key: &[Expr],
        expr: &Expr,
        scope: ScopeId,
    ) -> Result<Operand, TranslateError> {
        let text = expr.to_string();
        let entity = match self.expr(entity, scope)? {
            Operand::EntityClass(entity) => entity,
            _ => return Err(translation(format!("{} is not an entity: {}", entity, text))),
        };
        let key_columns = entity.key_columns();
        if key.len() != key_columns.len() {
            return Err(translation(format!(
                "{} expects {} key value(s): {}",
                entity.name,
                key_columns.len(),
                text
            )));
        }

        let mut keys = Vec::with_capacity(key.len());
        for ((_, kind), value) in key_columns.iter().zip(key) {
            let operand = self.expr(value, scope)?;
            let ty = self.type_of(&operand, scope)?;
            check_binary(OpClass::Equality, &ExprType::Scalar(*kind), &ty, &text)?;
            match operand {
                Operand::Scalar(scalar) => keys.push(scalar.sql),
                _ => return Err(translation(format!("invalid key value in {}", text))),
            }
        }
        Ok(Operand::Entity(EntityRef {
            entity,
            source: EntitySource::Keys(keys),
            nullable: false,
        }))
    }

    fn arith(
        &mut self,
        op: ArithOp,
        left: &Expr,
        right: &Expr,
        expr: &Expr,
        scope: ScopeId,
    ) -> Result<Operand, TranslateError> {
        let text = expr.to_string();
        let left = self.expr(left, scope)?;
        let right = self.expr(right, scope)?;
        let (lt, rt) = (self.type_of(&left, scope)?, self.type_of(&right, scope)?);
        check_binary(OpClass::Arithmetic, &lt, &rt, &text)?;

        let (Operand::Scalar(a), Operand::Scalar(b)) = (left, right) else {
            return Err(translation(format!("unsupported operands: {}", text)));
        };
        let strings = a.kind.is_string();
        if strings && op != ArithOp::Add {
            return Err(TranslateError::IncomparableTypes {
                left: lt.to_string(),
                right: rt.to_string(),
                expr: text,
            });
        }

        let nullable = a.nullable || b.nullable;
        let (sql, kind) = match op {
            ArithOp::Add if strings => (
                SqlExpr::binary(BinOp::Concat, a.sql, b.sql),
                ScalarKind::Str,
            ),
            ArithOp::Div => (
                SqlExpr::binary(
                    BinOp::Div,
                    SqlExpr::Cast {
                        expr: Box::new(a.sql),
                        ty: "REAL".to_string(),
                    },
                    b.sql,
                ),
                ScalarKind::Float,
            ),
            _ => {
                let kind = if a.kind == ScalarKind::Float || b.kind == ScalarKind::Float {
                    ScalarKind::Float
                } else {
                    ScalarKind::Int
                };
                let bin = match op {
                    ArithOp::Add => BinOp::Add,
                    ArithOp::Sub => BinOp::Sub,
                    ArithOp::Mul => BinOp::Mul,
                    ArithOp::Mod => BinOp::Mod,
                    ArithOp::Div => BinOp::Div,
                };
                (SqlExpr::binary(bin, a.sql, b.sql), kind)
            }
        };
        Ok(Operand::Scalar(ScalarOp::new(sql, kind).nullable(nullable)))
    }

    // Conditions

    fn condition(&mut self, expr: &Expr, scope: ScopeId) -> Result<SqlExpr, TranslateError> {
        match expr {
            Expr::And(items) => {
                let mut conditions = Vec::with_capacity(items.len());
                for item in items {
                    conditions.push(self.condition(item, scope)?);
                }
                Ok(SqlExpr::And(conditions))
            }
            Expr::Or(items) => {
                let mut conditions = Vec::with_capacity(items.len());
                for item in items {
                    conditions.push(self.condition(item, scope)?);
                }
                Ok(SqlExpr::Or(conditions))
            }
            Expr::Not(inner) => match inner.as_ref() {
                Expr::In {
                    item,
                    collection,
                    negated,
                } => self.membership(item, collection, !negated, inner, scope),
                Expr::IsNone { expr, negated } => self.is_none(expr, !negated, scope),
                other => Ok(SqlExpr::Not(Box::new(self.condition(other, scope)?))),
            },
            Expr::Compare { op, left, right } => self.compare(*op, left, right, expr, scope),
            Expr::In {
                item,
                collection,
                negated,
            } => self.membership(item, collection, *negated, expr, scope),
            Expr::IsNone { expr: inner, negated } => self.is_none(inner, *negated, scope),
            other => {
                let operand = self.expr(other, scope)?;
                self.predicate(operand, other, scope)
            }
        }
    }

    /// Truth value of an operand used as a condition
    fn predicate(&mut self, operand: Operand, expr: &Expr, scope: ScopeId) -> Result<SqlExpr, TranslateError> {
        match operand {
            Operand::Scalar(scalar) if scalar.kind == ScalarKind::Bool => Ok(scalar.sql),
            Operand::Scalar(scalar) => Err(translation(format!(
                "Expression of type '{}' cannot be used as a condition: {}",
                scalar.kind, expr
            ))),
            Operand::Collection(_) | Operand::Query(_) => {
                let (sub, _) = self.subquery_rows(operand, scope)?;
                Ok(SqlExpr::Exists {
                    subquery: Box::new(self.finish(sub, vec![one()], false)),
                    negated: false,
                })
            }
            Operand::Entity(entity) => Ok(SqlExpr::all(
                self.key_exprs(&entity)
                    .into_iter()
                    .map(|key| SqlExpr::IsNotNull(Box::new(key)))
                    .collect(),
            )),
            Operand::Null => Ok(SqlExpr::Literal(Value::Bool(false))),
            Operand::Tuple(_) | Operand::EntityClass(_) => Err(translation(format!(
                "Expression cannot be used as a condition: {}",
                expr
            ))),
        }
    }

    fn is_none(&mut self, expr: &Expr, negated: bool, scope: ScopeId) -> Result<SqlExpr, TranslateError> {
        let operand = self.expr(expr, scope)?;
        match operand {
            Operand::Null => Ok(SqlExpr::Literal(Value::Bool(!negated))),
            other => self.null_test(other, negated, &format!("{} is None", expr), scope),
        }
    }

    /// `operand IS [NOT] NULL`, key-wise for entities
    fn null_test(
        &mut self,
        operand: Operand,
        negated: bool,
        text: &str,
        scope: ScopeId,
    ) -> Result<SqlExpr, TranslateError> {
        match operand {
            Operand::Scalar(scalar) => Ok(if negated {
                SqlExpr::IsNotNull(Box::new(scalar.sql))
            } else {
                SqlExpr::IsNull(Box::new(scalar.sql))
            }),
            Operand::Entity(entity) => {
                let keys = self.key_exprs(&entity);
                Ok(if negated {
                    SqlExpr::any(keys.into_iter().map(|k| SqlExpr::IsNotNull(Box::new(k))).collect())
                } else {
                    SqlExpr::all(keys.into_iter().map(|k| SqlExpr::IsNull(Box::new(k))).collect())
                })
            }
            Operand::Null => Ok(SqlExpr::Literal(Value::Bool(!negated))),
            other => {
                let ty = self.type_of(&other, scope)?;
                Err(TranslateError::IncomparableTypes {
                    left: ty.to_string(),
                    right: ExprType::None.to_string(),
                    expr: text.to_string(),
                })
            }
        }
    }

    fn compare(
        &mut self,
        op: CmpOp,
        left: &Expr,
        right: &Expr,
        expr: &Expr,
        scope: ScopeId,
    ) -> Result<SqlExpr, TranslateError> {
        let text = expr.to_string();
        let left = self.expr(left, scope)?;
        let right = self.expr(right, scope)?;
        let (lt, rt) = (self.type_of(&left, scope)?, self.type_of(&right, scope)?);
        let class = if op.is_equality() {
            OpClass::Equality
        } else {
            OpClass::Ordering
        };
        check_binary(class, &lt, &rt, &text)?;
        self.compare_operands(op, left, right, &text, scope)
    }

    fn compare_operands(
        &mut self,
        op: CmpOp,
        left: Operand,
        right: Operand,
        text: &str,
        scope: ScopeId,
    ) -> Result<SqlExpr, TranslateError> {
        match (left, right) {
            (Operand::Null, Operand::Null) => Ok(SqlExpr::Literal(Value::Bool(op == CmpOp::Eq))),
            (Operand::Null, other) | (other, Operand::Null) if op.is_equality() => {
                self.null_test(other, op == CmpOp::Ne, text, scope)
            }
            (Operand::Scalar(a), Operand::Scalar(b)) => {
                Ok(SqlExpr::binary(cmp_binop(op), a.sql, b.sql))
            }
            (Operand::Entity(a), Operand::Entity(b)) if op.is_equality() => {
                let mut pairs: Vec<SqlExpr> = self
                    .key_exprs(&a)
                    .into_iter()
                    .zip(self.key_exprs(&b))
                    .map(|(x, y)| eq(x, y))
                    .collect();
                match op {
                    CmpOp::Eq => Ok(SqlExpr::all(pairs)),
                    _ if pairs.len() == 1 => match pairs.remove(0) {
                        SqlExpr::Binary { left, right, .. } => {
                            Ok(SqlExpr::binary(BinOp::NotEq, *left, *right))
                        }
                        other => Ok(SqlExpr::Not(Box::new(other))),
                    },
                    _ => Ok(SqlExpr::Not(Box::new(SqlExpr::And(pairs)))),
                }
            }
            (Operand::Tuple(a), Operand::Tuple(b)) if a.len() == b.len() && !a.is_empty() => {
                match op {
                    CmpOp::Eq | CmpOp::Ne => {
                        let mut pairs = Vec::with_capacity(a.len());
                        for (x, y) in a.into_iter().zip(b) {
                            pairs.push(self.compare_operands(CmpOp::Eq, x, y, text, scope)?);
                        }
                        Ok(if op == CmpOp::Eq {
                            SqlExpr::all(pairs)
                        } else {
                            SqlExpr::Not(Box::new(SqlExpr::all(pairs)))
                        })
                    }
                    _ => {
                        // Lexicographic: a0 < b0 OR (a0 = b0 AND a1 < b1) ...
                        let strict = match op {
                            CmpOp::Le => CmpOp::Lt,
                            CmpOp::Ge => CmpOp::Gt,
                            other => other,
                        };
                        let last = a.len() - 1;
                        let mut disjuncts = Vec::with_capacity(a.len());
                        for i in 0..a.len() {
                            let mut conjuncts = Vec::with_capacity(i + 1);
                            for j in 0..i {
                                conjuncts.push(self.compare_operands(
                                    CmpOp::Eq,
                                    a[j].clone(),
                                    b[j].clone(),
                                    text,
                                    scope,
                                )?);
                            }
                            let step = if i == last { op } else { strict };
                            conjuncts.push(self.compare_operands(
                                step,
                                a[i].clone(),
                                b[i].clone(),
                                text,
                                scope,
                            )?);
                            disjuncts.push(SqlExpr::all(conjuncts));
                        }
                        Ok(SqlExpr::any(disjuncts))
                    }
                }
            }
            _ => Err(translation(format!("Unsupported comparison: {}", text))),
        }
    }

    fn membership(
        &mut self,
        item: &Expr,
        collection: &Expr,
        negated: bool,
        expr: &Expr,
        scope: ScopeId,
    ) -> Result<SqlExpr, TranslateError> {
        let text = expr.to_string();
        let item = self.expr(item, scope)?;
        let item_type = self.type_of(&item, scope)?;

        if let Expr::Tuple(options) = collection {
            return self.membership_in_list(item, &item_type, options, negated, &text, scope);
        }

        let source = self.expr(collection, scope)?;
        match source {
            Operand::Scalar(haystack) if haystack.kind.is_string() => {
                let needle = match item {
                    Operand::Scalar(needle) if needle.kind.is_string() => needle,
                    _ => {
                        return Err(TranslateError::IncomparableTypes {
                            left: item_type.to_string(),
                            right: haystack.kind.to_string(),
                            expr: text,
                        })
                    }
                };
                let position = SqlExpr::function("INSTR", vec![haystack.sql, needle.sql]);
                let op = if negated { BinOp::Eq } else { BinOp::Gt };
                Ok(SqlExpr::binary(op, position, SqlExpr::Literal(Value::Int64(0))))
            }
            Operand::Collection(_) | Operand::Query(_) => {
                let (sub, element) = self.subquery_rows(source, scope)?;
                let element_type = self.type_of(&element, sub)?;
                check_membership(
                    &item_type,
                    &element_type,
                    &ExprType::Set(Box::new(element_type.clone())),
                    &text,
                )?;
                self.membership_subquery(item, element, sub, negated, &text)
            }
            other => {
                let ty = self.type_of(&other, scope)?;
                Err(TranslateError::IncomparableTypes {
                    left: item_type.to_string(),
                    right: ty.to_string(),
                    expr: text,
                })
            }
        }
    }

    fn membership_in_list(
        &mut self,
        item: Operand,
        item_type: &ExprType,
        options: &[Expr],
        negated: bool,
        text: &str,
        scope: ScopeId,
    ) -> Result<SqlExpr, TranslateError> {
        let mut operands = Vec::with_capacity(options.len());
        for option in options {
            let operand = self.expr(option, scope)?;
            let ty = self.type_of(&operand, scope)?;
            check_binary(OpClass::Equality, item_type, &ty, text)?;
            operands.push(operand);
        }
        if operands.is_empty() {
            return Ok(SqlExpr::Literal(Value::Bool(negated)));
        }

        if let Operand::Scalar(scalar) = &item {
            if operands.iter().all(|o| matches!(o, Operand::Scalar(_))) {
                let list = operands
                    .into_iter()
                    .filter_map(|o| match o {
                        Operand::Scalar(s) => Some(s.sql),
                        _ => None,
                    })
                    .collect();
                return Ok(SqlExpr::InList {
                    expr: Box::new(scalar.sql.clone()),
                    list,
                    negated,
                });
            }
        }

        let mut alternatives = Vec::with_capacity(operands.len());
        for operand in operands {
            alternatives.push(self.compare_operands(CmpOp::Eq, item.clone(), operand, text, scope)?);
        }
        let any = SqlExpr::any(alternatives);
        Ok(if negated {
            SqlExpr::Not(Box::new(any))
        } else {
            any
        })
    }

    fn flatten(&self, operand: &Operand, text: &str) -> Result<Vec<SqlExpr>, TranslateError> {
        match operand {
            Operand::Scalar(scalar) => Ok(vec![scalar.sql.clone()]),
            Operand::Entity(entity) => Ok(self.key_exprs(entity)),
            Operand::Null => Ok(vec![SqlExpr::Literal(Value::Null)]),
            Operand::Tuple(items) => {
                let mut flat = Vec::new();
                for item in items {
                    flat.extend(self.flatten(item, text)?);
                }
                Ok(flat)
            }
            _ => Err(translation(format!("Unsupported membership test: {}", text))),
        }
    }

    /// `x [NOT] IN (SELECT ...)` for single columns, `[NOT] EXISTS` otherwise
    fn membership_subquery(
        &mut self,
        item: Operand,
        element: Operand,
        sub: ScopeId,
        negated: bool,
        text: &str,
    ) -> Result<SqlExpr, TranslateError> {
        let single = match (&item, &element) {
            (Operand::Scalar(i), Operand::Scalar(e)) => {
                Some((i.sql.clone(), e.sql.clone(), e.nullable))
            }
            (Operand::Entity(i), Operand::Entity(e)) if i.entity.primary_key().len() == 1 => {
                let (mut ik, mut ek) = (self.key_exprs(i), self.key_exprs(e));
                Some((ik.remove(0), ek.remove(0), e.nullable))
            }
            _ => None,
        };

        if let Some((item_sql, element_sql, nullable)) = single {
            if negated && nullable {
                // NOT IN over a NULL yields no rows at all
                self.add_condition(sub, SqlExpr::IsNotNull(Box::new(element_sql.clone())));
            }
            let select = self.finish(sub, vec![element_sql], false);
            return Ok(SqlExpr::InSubquery {
                expr: Box::new(item_sql),
                subquery: Box::new(select),
                negated,
            });
        }

        let items = self.flatten(&item, text)?;
        let elements = self.flatten(&element, text)?;
        if items.len() != elements.len() {
            return Err(translation(format!("Unsupported membership test: {}", text)));
        }
        for (i, e) in items.into_iter().zip(elements) {
            self.add_condition(sub, eq(i, e));
        }
        Ok(SqlExpr::Exists {
            subquery: Box::new(self.finish(sub, vec![one()], false)),
            negated,
        })
    }

    // Functions

    fn call(
        &mut self,
        func: &str,
        args: &[Expr],
        kwargs: &[(String, Expr)],
        expr: &Expr,
        scope: ScopeId,
    ) -> Result<Operand, TranslateError> {
        let text = expr.to_string();
        let single = || match (args, kwargs.is_empty()) {
            ([arg], true) => Ok(arg),
            _ => Err(translation(format!(
                "{}() takes exactly one argument: {}",
                func, text
            ))),
        };

        match func {
            "len" | "count" => self.count(single()?, &text, scope),
            "exists" => {
                let source = self.expr(single()?, scope)?;
                match source {
                    Operand::Collection(_) | Operand::Query(_) => {
                        let (sub, _) = self.subquery_rows(source, scope)?;
                        Ok(Operand::Scalar(ScalarOp::new(
                            SqlExpr::Exists {
                                subquery: Box::new(self.finish(sub, vec![one()], false)),
                                negated: false,
                            },
                            ScalarKind::Bool,
                        )))
                    }
                    _ => Err(translation(format!(
                        "exists() requires a collection: {}",
                        text
                    ))),
                }
            }
            "sum" | "min" | "max" | "avg" => self.aggregate(func, single()?, &text, scope),
            "date" => date_constructor(args, kwargs, &text),
            other => Err(TranslateError::ExprEval {
                expr: text.clone(),
                source: SchemaError::UnknownName(other.to_string()),
            }),
        }
    }

    fn count(&mut self, arg: &Expr, text: &str, scope: ScopeId) -> Result<Operand, TranslateError> {
        let source = self.expr(arg, scope)?;
        match source {
            Operand::Scalar(scalar) if scalar.kind.is_string() => Ok(Operand::Scalar(
                ScalarOp::new(SqlExpr::function("LENGTH", vec![scalar.sql]), ScalarKind::Int)
                    .nullable(scalar.nullable),
            )),
            Operand::Collection(_) | Operand::Query(_) => {
                let (sub, element) = self.subquery_rows(source, scope)?;
                let select = if is_unique(&self.scopes[sub], &seeds(&element)) {
                    self.finish(sub, vec![count_star()], false)
                } else {
                    match &element {
                        Operand::Scalar(scalar) => {
                            self.finish(sub, vec![count_distinct(scalar.sql.clone())], false)
                        }
                        Operand::Entity(entity) if entity.entity.primary_key().len() == 1 => {
                            let key = self.key_exprs(entity).remove(0);
                            self.finish(sub, vec![count_distinct(key)], false)
                        }
                        Operand::Entity(entity) => self.semi_join_count(sub, entity, scope),
                        _ => {
                            return Err(translation(format!(
                                "len() of a tuple sequence with possible duplicates is not supported: {}",
                                text
                            )))
                        }
                    }
                };
                Ok(Operand::Scalar(ScalarOp::new(
                    SqlExpr::Subquery(Box::new(select)),
                    ScalarKind::Int,
                )))
            }
            _ => Err(translation(format!(
                "len() argument must be a string or a collection: {}",
                text
            ))),
        }
    }

    /// Count of distinct composite-key entities:
    /// `SELECT COUNT(*) FROM Entity w WHERE EXISTS (<sub> AND keys = w.keys)`
    fn semi_join_count(&mut self, sub: ScopeId, entity: &EntityRef, scope: ScopeId) -> Select {
        let wrapper = self.new_scope(Some(scope));
        let target = &entity.entity;
        let path = format!("{}.distinct", self.source_path(entity));
        let alias = self
            .aliases
            .fresh(wrapper, Some(&target.name), &target.table, &path);
        self.push_item(wrapper, alias, Join::Root, Link::Root, false);
        let keys = self.key_exprs(entity);
        for ((column, _), key) in target.key_columns().iter().zip(keys) {
            let condition = eq(self.column(alias, column), key);
            self.add_condition(sub, condition);
        }
        let inner = self.finish(sub, vec![one()], false);
        self.add_condition(
            wrapper,
            SqlExpr::Exists {
                subquery: Box::new(inner),
                negated: false,
            },
        );
        self.finish(wrapper, vec![count_star()], false)
    }

    fn aggregate(&mut self, func: &str, arg: &Expr, text: &str, scope: ScopeId) -> Result<Operand, TranslateError> {
        let source = self.expr(arg, scope)?;
        if !matches!(source, Operand::Collection(_) | Operand::Query(_)) {
            return Err(translation(format!("{}() requires a sequence: {}", func, text)));
        }
        let (sub, element) = self.subquery_rows(source, scope)?;
        let scalar = match element {
            Operand::Scalar(scalar) => scalar,
            _ => {
                return Err(translation(format!(
                    "{}() requires a sequence of values: {}",
                    func, text
                )))
            }
        };
        let numeric_only = matches!(func, "sum" | "avg");
        if (numeric_only && !scalar.kind.is_numeric())
            || matches!(scalar.kind, ScalarKind::Bytes | ScalarKind::Bool)
        {
            return Err(translation(format!(
                "{}() is not applicable to '{}' values: {}",
                func, scalar.kind, text
            )));
        }

        // Aggregates run over rows of the owning entity; repeated owners collapse
        let owners: Vec<AliasId> = scalar.owner.into_iter().collect();
        let distinct = !is_unique(&self.scopes[sub], &owners);
        let kind = if func == "avg" {
            ScalarKind::Float
        } else {
            scalar.kind
        };
        let call = SqlExpr::Function {
            name: func.to_uppercase(),
            args: vec![scalar.sql],
            distinct,
        };
        let select = self.finish(sub, vec![call], false);
        Ok(Operand::Scalar(
            ScalarOp::new(SqlExpr::Subquery(Box::new(select)), kind).nullable(true),
        ))
    }

    fn method(
        &mut self,
        target: &Expr,
        method: &str,
        args: &[Expr],
        expr: &Expr,
        scope: ScopeId,
    ) -> Result<Operand, TranslateError> {
        let text = expr.to_string();
        let target = match self.expr(target, scope)? {
            Operand::Scalar(scalar) if scalar.kind.is_string() => scalar,
            other => {
                let ty = self.type_of(&other, scope)?;
                return Err(TranslateError::ExprEval {
                    expr: text,
                    source: SchemaError::NotAnEntity {
                        kind: ty.to_string(),
                        attribute: method.to_string(),
                    },
                });
            }
        };

        match (method, args) {
            ("startswith" | "endswith", [arg]) => {
                let affix = match self.expr(arg, scope)? {
                    Operand::Scalar(scalar) if scalar.kind.is_string() => scalar,
                    other => {
                        let ty = self.type_of(&other, scope)?;
                        return Err(TranslateError::IncomparableTypes {
                            left: target.kind.to_string(),
                            right: ty.to_string(),
                            expr: text,
                        });
                    }
                };
                let starts = method == "startswith";
                let sql = match &affix.sql {
                    SqlExpr::Literal(Value::String(s)) if s.is_empty() => {
                        SqlExpr::Literal(Value::Bool(true))
                    }
                    SqlExpr::Literal(Value::String(s)) => {
                        let n = s.chars().count() as i64;
                        let args = if starts {
                            vec![target.sql, one(), SqlExpr::Literal(Value::Int64(n))]
                        } else {
                            vec![target.sql, SqlExpr::Literal(Value::Int64(-n))]
                        };
                        eq(SqlExpr::function("SUBSTR", args), affix.sql.clone())
                    }
                    other => {
                        let length = SqlExpr::function("LENGTH", vec![other.clone()]);
                        if starts {
                            let args = vec![target.sql, one(), length];
                            eq(SqlExpr::function("SUBSTR", args), other.clone())
                        } else {
                            // SUBSTR(t, 0) is the whole string, so an empty suffix needs its own arm
                            let args = vec![target.sql, SqlExpr::Neg(Box::new(length.clone()))];
                            SqlExpr::Or(vec![
                                eq(length, SqlExpr::Literal(Value::Int64(0))),
                                eq(SqlExpr::function("SUBSTR", args), other.clone()),
                            ])
                        }
                    }
                };
                Ok(Operand::Scalar(ScalarOp::new(sql, ScalarKind::Bool)))
            }
            ("upper" | "lower", []) => Ok(Operand::Scalar(
                ScalarOp::new(
                    SqlExpr::function(&method.to_uppercase(), vec![target.sql]),
                    target.kind,
                )
                .nullable(target.nullable),
            )),
            _ => Err(translation(format!(
                "Unsupported method '{}' in expression: {}",
                method, text
            ))),
        }
    }

    // Projection

    fn output(
        &mut self,
        operand: Operand,
        element: &Expr,
        scope: ScopeId,
        out: &mut Outputs,
    ) -> Result<(), TranslateError> {
        match operand {
            Operand::Scalar(scalar) => {
                if scalar.is_key {
                    out.seeds.extend(scalar.owner);
                }
                out.order.push(asc(scalar.sql.clone()));
                out.decoders.push(Decoder::Scalar {
                    index: out.columns.len(),
                    kind: scalar.kind,
                });
                out.columns.push(scalar.sql);
                Ok(())
            }
            Operand::Null => {
                out.decoders.push(Decoder::Scalar {
                    index: out.columns.len(),
                    kind: ScalarKind::Str,
                });
                out.columns.push(SqlExpr::Literal(Value::Null));
                Ok(())
            }
            Operand::Entity(entity) => self.output_entity(entity, out),
            Operand::Collection(collection) => {
                let element_operand = self.collection_element(&collection, scope, true)?;
                self.output(element_operand, element, scope, out)
            }
            Operand::Tuple(_) => Err(translation(format!(
                "Nested tuples cannot be used as query result: {}",
                element
            ))),
            Operand::Query(_) => Err(translation(format!(
                "Nested query cannot be used as query result: {}",
                element
            ))),
            Operand::EntityClass(entity) => Err(translation(format!(
                "Entity class '{}' cannot be used as query result",
                entity.name
            ))),
        }
    }

    /// Key columns, then eager scalar and foreign key columns
    fn output_entity(&mut self, entity: EntityRef, out: &mut Outputs) -> Result<(), TranslateError> {
        out.has_entity = true;
        let mut key = Vec::new();
        for ((column, kind), expr) in entity.entity.key_columns().into_iter().zip(self.key_exprs(&entity)) {
            key.push(ColumnDecoder {
                column,
                index: out.columns.len(),
                kind,
            });
            out.order.push(asc(expr.clone()));
            out.columns.push(expr);
        }

        let mut columns = Vec::new();
        if let EntitySource::Alias(alias) = entity.source {
            out.seeds.push(alias);
            for attribute in entity.entity.eager_attributes() {
                let kinds: Vec<ScalarKind> = match &attribute.kind {
                    AttrKind::Scalar(kind) => vec![*kind],
                    AttrKind::Reference { target, .. } => self
                        .entity(target)?
                        .key_columns()
                        .into_iter()
                        .map(|(_, kind)| kind)
                        .collect(),
                    AttrKind::Collection { .. } => continue,
                };
                for (column, kind) in attribute.columns.iter().zip(kinds) {
                    columns.push(ColumnDecoder {
                        column: column.clone(),
                        index: out.columns.len(),
                        kind,
                    });
                    out.columns.push(self.column(alias, column));
                }
            }
        }

        out.decoders.push(Decoder::Entity {
            entity: entity.entity.name.clone(),
            key,
            columns,
        });
        Ok(())
    }
}

fn count_distinct(expr: SqlExpr) -> SqlExpr {
    SqlExpr::Function {
        name: "COUNT".to_string(),
        args: vec![expr],
        distinct: true,
    }
}

fn date_part(scalar: ScalarOp, part: &str) -> ScalarOp {
    let format = match part {
        "year" => "%Y",
        "month" => "%m",
        _ => "%d",
    };
    let sql = match scalar.sql {
        SqlExpr::Param(spec) => SqlExpr::Param(spec.extend(part)),
        SqlExpr::Literal(value) => {
            SqlExpr::Literal(value.date_part(part).unwrap_or(Value::Null))
        }
        other => SqlExpr::Cast {
            expr: Box::new(SqlExpr::function(
                "strftime",
                vec![SqlExpr::Literal(Value::from(format)), other],
            )),
            ty: "INTEGER".to_string(),
        },
    };
    ScalarOp::new(sql, ScalarKind::Int).nullable(scalar.nullable)
}

/// `date(1990, 10, 20)` or `date(year=1990, month=10, day=20)` with constant arguments
fn date_constructor(args: &[Expr], kwargs: &[(String, Expr)], text: &str) -> Result<Operand, TranslateError> {
    let invalid = || translation(format!("Invalid date constructor: {}", text));
    let constant = |expr: &Expr| match expr {
        Expr::Const(Value::Int64(v)) => Ok(*v),
        _ => Err(translation(format!("date() arguments must be integer constants: {}", text))),
    };

    if args.len() > 3 {
        return Err(invalid());
    }
    let mut parts: [Option<i64>; 3] = [None; 3];
    for (i, arg) in args.iter().enumerate() {
        parts[i] = Some(constant(arg)?);
    }
    for (name, arg) in kwargs {
        let slot = match name.as_str() {
            "year" => 0,
            "month" => 1,
            "day" => 2,
            _ => return Err(invalid()),
        };
        if parts[slot].is_some() {
            return Err(invalid());
        }
        parts[slot] = Some(constant(arg)?);
    }

    let [Some(year), Some(month), Some(day)] = parts else {
        return Err(invalid());
    };
    let (Ok(year), Ok(month), Ok(day)) = (i32::try_from(year), u32::try_from(month), u32::try_from(day)) else {
        return Err(invalid());
    };
    let date = NaiveDate::from_ymd_opt(year, month, day).ok_or_else(invalid)?;
    Ok(Operand::Scalar(ScalarOp::new(
        SqlExpr::Literal(Value::Date(date)),
        ScalarKind::Date,
    )))
}

/// Projection elements that mention external names but no iteration variable
fn reject_external_results(
    comprehension: &Comprehension,
    elements: &[&Expr],
    bindings: &Bindings,
) -> Result<(), TranslateError> {
    let vars: BTreeSet<&str> = comprehension
        .generators
        .iter()
        .map(|g| g.var.as_str())
        .collect();
    for element in elements {
        let names = element.free_names();
        let uses_var = names.iter().any(|n| vars.contains(n.as_str()));
        if !uses_var && names.iter().any(|n| bindings.contains(n)) {
            return Err(translation(format!(
                "External parameter '{}' cannot be used as query result",
                element
            )));
        }
    }
    Ok(())
}

/// Compile a query tree into a plan of the requested shape
pub(crate) fn compile(
    schema: &dyn SchemaProvider,
    tree: &QueryTree,
    bindings: &Bindings,
    mode: DistinctMode,
    shape: PlanShape,
    style: AliasStyle,
) -> Result<CompiledPlan, TranslateError> {
    let comprehension = tree.comprehension();
    if comprehension.generators.is_empty() {
        return Err(translation("query has no generators"));
    }
    let (elements, tuple): (Vec<&Expr>, bool) = match &comprehension.result {
        Expr::Tuple(items) => (items.iter().collect(), true),
        other => (vec![other], false),
    };
    reject_external_results(comprehension, &elements, bindings)?;

    let mut walker = Walker::new(schema, bindings, style);
    let root = walker.new_scope(None);
    for generator in &comprehension.generators {
        walker.generator(generator, root)?;
    }

    let mut outputs = Outputs::default();
    for element in &elements {
        let operand = walker.expr(element, root)?;
        walker.output(operand, element, root, &mut outputs)?;
    }

    let unique = is_unique(&walker.scopes[root], &outputs.seeds);
    let distinct = match mode {
        DistinctMode::Auto => !unique,
        DistinctMode::Distinct => true,
        DistinctMode::WithoutDistinct => false,
    };

    let order_by = if !tree.order_by().is_empty() {
        let mut order = Vec::new();
        for term in tree.order_by() {
            match walker.expr(&term.expr, root)? {
                Operand::Scalar(scalar) => order.push(OrderItem {
                    expr: scalar.sql,
                    descending: term.descending,
                }),
                Operand::Entity(entity) => {
                    order.extend(walker.key_exprs(&entity).into_iter().map(|expr| OrderItem {
                        expr,
                        descending: term.descending,
                    }))
                }
                _ => {
                    return Err(translation(format!(
                        "Cannot order by {}",
                        term.expr
                    )))
                }
            }
        }
        order
    } else if distinct || outputs.has_entity {
        outputs.order.clone()
    } else {
        let mut order = Vec::new();
        for (_, alias) in &walker.scopes[root].vars {
            let entity = walker.alias_entity(*alias)?;
            for (column, _) in entity.key_columns() {
                order.push(asc(walker.column(*alias, &column)));
            }
        }
        order
    };

    let mut rows = walker.scopes[root].to_select(
        &walker.aliases,
        outputs.columns.clone(),
        distinct,
        order_by,
    );
    rows.limit = tree.limit();
    rows.offset = tree.offset();

    let columns: Vec<String> = rows.columns.iter().map(|c| c.to_string()).collect();
    let (select, decoders) = match shape {
        PlanShape::Rows => (rows, outputs.decoders),
        PlanShape::Count => {
            if rows.limit.is_none() && rows.offset.is_none() {
                rows.order_by.clear();
            }
            let select = Select {
                columns: vec![count_star()],
                from: vec![FromItem {
                    table: TableRef::Derived(Box::new(rows)),
                    alias: "q".to_string(),
                    join: Join::Root,
                }],
                ..Default::default()
            };
            (
                select,
                vec![Decoder::Scalar {
                    index: 0,
                    kind: ScalarKind::Int,
                }],
            )
        }
        PlanShape::Exists => {
            rows.order_by.clear();
            let select = Select {
                columns: vec![SqlExpr::Exists {
                    subquery: Box::new(rows),
                    negated: false,
                }],
                ..Default::default()
            };
            (
                select,
                vec![Decoder::Scalar {
                    index: 0,
                    kind: ScalarKind::Bool,
                }],
            )
        }
    };

    let (sql, params) = SqlWriter::render(&select);
    Ok(CompiledPlan {
        query: tree.id(),
        mode,
        shape,
        sql,
        params,
        distinct,
        columns,
        decoders,
        tuple: tuple && shape == PlanShape::Rows,
        positions: elements.iter().map(|e| e.to_string()).collect(),
        select,
    })
}
