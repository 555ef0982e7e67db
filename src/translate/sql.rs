//! SQL abstract syntax and its deterministic renderer
//!
//! The walker builds [`Select`] trees; [`SqlWriter`] turns them into text and
//! collects external parameters in placeholder order.

use serde::Serialize;
use std::fmt;

use super::plan::ParamSpec;
use crate::data::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BinOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Concat,
}

impl BinOp {
    fn symbol(self) -> &'static str {
        match self {
            BinOp::Eq => "=",
            BinOp::NotEq => "<>",
            BinOp::Lt => "<",
            BinOp::LtEq => "<=",
            BinOp::Gt => ">",
            BinOp::GtEq => ">=",
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Mod => "%",
            BinOp::Concat => "||",
        }
    }

    fn precedence(self) -> u8 {
        match self {
            BinOp::Eq | BinOp::NotEq | BinOp::Lt | BinOp::LtEq | BinOp::Gt | BinOp::GtEq => 4,
            BinOp::Add | BinOp::Sub => 6,
            BinOp::Mul | BinOp::Div | BinOp::Mod => 7,
            BinOp::Concat => 8,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum SqlExpr {
    Column {
        table: String,
        column: String,
    },
    Literal(Value),
    Param(ParamSpec),
    /// `*` inside `COUNT(*)`
    Star,
    Binary {
        op: BinOp,
        left: Box<SqlExpr>,
        right: Box<SqlExpr>,
    },
    And(Vec<SqlExpr>),
    Or(Vec<SqlExpr>),
    Not(Box<SqlExpr>),
    Neg(Box<SqlExpr>),
    IsNull(Box<SqlExpr>),
    IsNotNull(Box<SqlExpr>),
    InList {
        expr: Box<SqlExpr>,
        list: Vec<SqlExpr>,
        negated: bool,
    },
    InSubquery {
        expr: Box<SqlExpr>,
        subquery: Box<Select>,
        negated: bool,
    },
    Exists {
        subquery: Box<Select>,
        negated: bool,
    },
    Subquery(Box<Select>),
    Function {
        name: String,
        args: Vec<SqlExpr>,
        distinct: bool,
    },
    Cast {
        expr: Box<SqlExpr>,
        ty: String,
    },
}

impl SqlExpr {
    pub fn column(table: impl Into<String>, column: impl Into<String>) -> Self {
        SqlExpr::Column {
            table: table.into(),
            column: column.into(),
        }
    }

    pub fn binary(op: BinOp, left: SqlExpr, right: SqlExpr) -> Self {
        SqlExpr::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn function(name: &str, args: Vec<SqlExpr>) -> Self {
        SqlExpr::Function {
            name: name.to_string(),
            args,
            distinct: false,
        }
    }

    /// Conjunction that collapses single items
    pub fn all(mut items: Vec<SqlExpr>) -> Self {
        if items.len() == 1 {
            items.remove(0)
        } else {
            SqlExpr::And(items)
        }
    }

    /// Disjunction that collapses single items
    pub fn any(mut items: Vec<SqlExpr>) -> Self {
        if items.len() == 1 {
            items.remove(0)
        } else {
            SqlExpr::Or(items)
        }
    }

    fn precedence(&self) -> u8 {
        match self {
            SqlExpr::Or(items) if items.len() > 1 => 1,
            SqlExpr::And(items) if items.len() > 1 => 2,
            SqlExpr::Not(_) => 3,
            SqlExpr::Binary { op, .. } => op.precedence(),
            SqlExpr::IsNull(_)
            | SqlExpr::IsNotNull(_)
            | SqlExpr::InList { .. }
            | SqlExpr::InSubquery { .. } => 4,
            SqlExpr::Neg(_) => 9,
            _ => 10,
        }
    }

    /// Visit this expression and every nested expression, sub-queries included
    pub fn walk(&self, visit: &mut dyn FnMut(&SqlExpr)) {
        visit(self);
        match self {
            SqlExpr::Column { .. } | SqlExpr::Literal(_) | SqlExpr::Param(_) | SqlExpr::Star => {}
            SqlExpr::Binary { left, right, .. } => {
                left.walk(visit);
                right.walk(visit);
            }
            SqlExpr::And(items) | SqlExpr::Or(items) => {
                for item in items {
                    item.walk(visit);
                }
            }
            SqlExpr::Not(inner)
            | SqlExpr::Neg(inner)
            | SqlExpr::IsNull(inner)
            | SqlExpr::IsNotNull(inner) => inner.walk(visit),
            SqlExpr::InList { expr, list, .. } => {
                expr.walk(visit);
                for item in list {
                    item.walk(visit);
                }
            }
            SqlExpr::InSubquery { expr, subquery, .. } => {
                expr.walk(visit);
                subquery.walk(visit);
            }
            SqlExpr::Exists { subquery, .. } | SqlExpr::Subquery(subquery) => {
                subquery.walk(visit)
            }
            SqlExpr::Function { args, .. } => {
                for arg in args {
                    arg.walk(visit);
                }
            }
            SqlExpr::Cast { expr, .. } => expr.walk(visit),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum TableRef {
    Named(String),
    Derived(Box<Select>),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Join {
    /// Generator root or correlated root: `CROSS JOIN` after the first item
    Root,
    Inner(Vec<SqlExpr>),
    Left(Vec<SqlExpr>),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FromItem {
    pub table: TableRef,
    pub alias: String,
    pub join: Join,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderItem {
    pub expr: SqlExpr,
    pub descending: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Select {
    pub distinct: bool,
    pub columns: Vec<SqlExpr>,
    pub from: Vec<FromItem>,
    pub selection: Vec<SqlExpr>,
    pub order_by: Vec<OrderItem>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

impl Select {
    pub fn walk(&self, visit: &mut dyn FnMut(&SqlExpr)) {
        for column in &self.columns {
            column.walk(visit);
        }
        for item in &self.from {
            match &item.table {
                TableRef::Derived(select) => select.walk(visit),
                TableRef::Named(_) => {}
            }
            match &item.join {
                Join::Inner(on) | Join::Left(on) => {
                    for cond in on {
                        cond.walk(visit);
                    }
                }
                Join::Root => {}
            }
        }
        for cond in &self.selection {
            cond.walk(visit);
        }
        for order in &self.order_by {
            order.expr.walk(visit);
        }
    }

    /// True when any nested expression matches
    pub fn any_expr(&self, mut pred: impl FnMut(&SqlExpr) -> bool) -> bool {
        let mut found = false;
        self.walk(&mut |e| {
            if !found && pred(e) {
                found = true;
            }
        });
        found
    }
}

/// Renders SQL text and collects parameters in placeholder order
#[derive(Debug, Default)]
pub struct SqlWriter {
    sql: String,
    params: Vec<ParamSpec>,
    depth: usize,
}

impl SqlWriter {
    pub fn render(select: &Select) -> (String, Vec<ParamSpec>) {
        let mut writer = SqlWriter::default();
        writer.select(select);
        (writer.sql, writer.params)
    }

    fn separator(&self) -> &'static str {
        if self.depth == 0 {
            "\n"
        } else {
            " "
        }
    }

    fn select(&mut self, select: &Select) {
        let sep = self.separator();
        self.sql.push_str("SELECT ");
        if select.distinct {
            self.sql.push_str("DISTINCT ");
        }
        for (i, column) in select.columns.iter().enumerate() {
            if i > 0 {
                self.sql.push_str(", ");
            }
            self.expr(column, 0);
        }

        for (i, item) in select.from.iter().enumerate() {
            if i == 0 {
                self.sql.push_str(sep);
                self.sql.push_str("FROM ");
            } else {
                self.sql.push_str(if self.depth == 0 { "\n  " } else { " " });
                match item.join {
                    Join::Root => self.sql.push_str("CROSS JOIN "),
                    Join::Inner(_) => self.sql.push_str("INNER JOIN "),
                    Join::Left(_) => self.sql.push_str("LEFT JOIN "),
                }
            }
            match &item.table {
                TableRef::Named(table) => self.ident(table),
                TableRef::Derived(inner) => self.subquery(inner),
            }
            self.sql.push(' ');
            self.ident(&item.alias);
            if i > 0 {
                if let Join::Inner(on) | Join::Left(on) = &item.join {
                    self.sql.push_str(" ON ");
                    self.conjunction(on);
                }
            }
        }

        if !select.selection.is_empty() {
            self.sql.push_str(sep);
            self.sql.push_str("WHERE ");
            self.conjunction(&select.selection);
        }

        if !select.order_by.is_empty() {
            self.sql.push_str(sep);
            self.sql.push_str("ORDER BY ");
            for (i, item) in select.order_by.iter().enumerate() {
                if i > 0 {
                    self.sql.push_str(", ");
                }
                self.expr(&item.expr, 0);
                if item.descending {
                    self.sql.push_str(" DESC");
                }
            }
        }

        match (select.limit, select.offset) {
            (Some(limit), Some(offset)) => {
                self.sql.push_str(&format!("{}LIMIT {} OFFSET {}", sep, limit, offset))
            }
            (Some(limit), None) => self.sql.push_str(&format!("{}LIMIT {}", sep, limit)),
            (None, Some(offset)) => {
                self.sql.push_str(&format!("{}LIMIT -1 OFFSET {}", sep, offset))
            }
            (None, None) => {}
        }
    }

    fn subquery(&mut self, select: &Select) {
        self.sql.push('(');
        self.depth += 1;
        self.select(select);
        self.depth -= 1;
        self.sql.push(')');
    }

    fn conjunction(&mut self, items: &[SqlExpr]) {
        for (i, item) in items.iter().enumerate() {
            if i > 0 {
                self.sql.push_str(" AND ");
            }
            self.expr(item, 3);
        }
    }

    fn ident(&mut self, name: &str) {
        self.sql.push('"');
        self.sql.push_str(&name.replace('"', "\"\""));
        self.sql.push('"');
    }

    fn literal(&mut self, value: &Value) {
        match value {
            Value::Null => self.sql.push_str("NULL"),
            Value::Bool(b) => self.sql.push_str(if *b { "1" } else { "0" }),
            Value::Int64(i) => self.sql.push_str(&i.to_string()),
            Value::Float64(f) => self.sql.push_str(&format!("{:?}", f)),
            Value::String(s) => {
                self.sql.push('\'');
                self.sql.push_str(&s.replace('\'', "''"));
                self.sql.push('\'');
            }
            Value::Date(d) => self.sql.push_str(&format!("'{}'", d.format("%Y-%m-%d"))),
            Value::Bytes(bytes) => {
                self.sql.push_str("X'");
                for b in bytes {
                    self.sql.push_str(&format!("{:02X}", b));
                }
                self.sql.push('\'');
            }
        }
    }

    /// Render `expr`, parenthesized when it binds weaker than `min`
    fn expr(&mut self, expr: &SqlExpr, min: u8) {
        let prec = expr.precedence();
        let wrap = prec < min;
        if wrap {
            self.sql.push('(');
        }
        match expr {
            SqlExpr::Column { table, column } => {
                self.ident(table);
                self.sql.push('.');
                self.ident(column);
            }
            SqlExpr::Literal(value) => self.literal(value),
            SqlExpr::Param(spec) => {
                self.params.push(spec.clone());
                self.sql.push('?');
            }
            SqlExpr::Star => self.sql.push('*'),
            SqlExpr::Binary { op, left, right } => {
                let (lmin, rmin) = if prec == 4 { (5, 5) } else { (prec, prec + 1) };
                self.expr(left, lmin);
                self.sql.push(' ');
                self.sql.push_str(op.symbol());
                self.sql.push(' ');
                self.expr(right, rmin);
            }
            SqlExpr::And(items) | SqlExpr::Or(items) => {
                if items.is_empty() {
                    self.sql.push_str(if matches!(expr, SqlExpr::And(_)) { "1 = 1" } else { "1 = 0" });
                }
                let sep = if matches!(expr, SqlExpr::And(_)) { " AND " } else { " OR " };
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        self.sql.push_str(sep);
                    }
                    self.expr(item, prec + 1);
                }
            }
            SqlExpr::Not(inner) => {
                self.sql.push_str("NOT ");
                self.expr(inner, 10);
            }
            SqlExpr::Neg(inner) => {
                self.sql.push('-');
                self.expr(inner, 10);
            }
            SqlExpr::IsNull(inner) => {
                self.expr(inner, 5);
                self.sql.push_str(" IS NULL");
            }
            SqlExpr::IsNotNull(inner) => {
                self.expr(inner, 5);
                self.sql.push_str(" IS NOT NULL");
            }
            SqlExpr::InList {
                expr: item,
                list,
                negated,
            } => {
                self.expr(item, 5);
                self.sql.push_str(if *negated { " NOT IN (" } else { " IN (" });
                for (i, value) in list.iter().enumerate() {
                    if i > 0 {
                        self.sql.push_str(", ");
                    }
                    self.expr(value, 0);
                }
                self.sql.push(')');
            }
            SqlExpr::InSubquery {
                expr: item,
                subquery,
                negated,
            } => {
                self.expr(item, 5);
                self.sql.push_str(if *negated { " NOT IN " } else { " IN " });
                self.subquery(subquery);
            }
            SqlExpr::Exists { subquery, negated } => {
                self.sql.push_str(if *negated { "NOT EXISTS " } else { "EXISTS " });
                self.subquery(subquery);
            }
            SqlExpr::Subquery(subquery) => self.subquery(subquery),
            SqlExpr::Function {
                name,
                args,
                distinct,
            } => {
                self.sql.push_str(name);
                self.sql.push('(');
                if *distinct {
                    self.sql.push_str("DISTINCT ");
                }
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        self.sql.push_str(", ");
                    }
                    self.expr(arg, 0);
                }
                self.sql.push(')');
            }
            SqlExpr::Cast { expr: inner, ty } => {
                self.sql.push_str("CAST(");
                self.expr(inner, 0);
                self.sql.push_str(" AS ");
                self.sql.push_str(ty);
                self.sql.push(')');
            }
        }
        if wrap {
            self.sql.push(')');
        }
    }
}

impl fmt::Display for Select {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (sql, _) = SqlWriter::render(self);
        write!(f, "{}", sql)
    }
}

impl fmt::Display for SqlExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut writer = SqlWriter {
            depth: 1,
            ..Default::default()
        };
        writer.expr(self, 0);
        write!(f, "{}", writer.sql)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn col(table: &str, column: &str) -> SqlExpr {
        SqlExpr::column(table, column)
    }

    #[test]
    fn test_render_joins() {
        let select = Select {
            columns: vec![col("s", "id")],
            from: vec![
                FromItem {
                    table: TableRef::Named("Student".to_string()),
                    alias: "s".to_string(),
                    join: Join::Root,
                },
                FromItem {
                    table: TableRef::Named("Group".to_string()),
                    alias: "group-1".to_string(),
                    join: Join::Inner(vec![SqlExpr::binary(
                        BinOp::Eq,
                        col("group-1", "number"),
                        col("s", "group"),
                    )]),
                },
            ],
            selection: vec![SqlExpr::binary(
                BinOp::Eq,
                col("group-1", "major"),
                SqlExpr::Literal(Value::from("O'Brien")),
            )],
            ..Default::default()
        };
        assert_eq!(
            select.to_string(),
            "SELECT \"s\".\"id\"\nFROM \"Student\" \"s\"\n  INNER JOIN \"Group\" \"group-1\" ON \"group-1\".\"number\" = \"s\".\"group\"\nWHERE \"group-1\".\"major\" = 'O''Brien'"
        );
    }

    #[test]
    fn test_params_in_placeholder_order() {
        let x = ParamSpec::new("x", vec![]);
        let y = ParamSpec::new("y", vec!["name".to_string()]);
        let select = Select {
            columns: vec![col("s", "id")],
            from: vec![FromItem {
                table: TableRef::Named("Student".to_string()),
                alias: "s".to_string(),
                join: Join::Root,
            }],
            selection: vec![
                SqlExpr::binary(BinOp::NotEq, col("s", "name"), SqlExpr::Param(y.clone())),
                SqlExpr::binary(BinOp::Gt, col("s", "gpa"), SqlExpr::Param(x.clone())),
            ],
            ..Default::default()
        };
        let (sql, params) = SqlWriter::render(&select);
        assert!(sql.ends_with("WHERE \"s\".\"name\" <> ? AND \"s\".\"gpa\" > ?"));
        assert_eq!(params, vec![y, x]);
    }

    #[test]
    fn test_precedence() {
        let or = SqlExpr::Or(vec![
            SqlExpr::binary(BinOp::Eq, col("a", "x"), SqlExpr::Literal(Value::Int64(1))),
            SqlExpr::IsNull(Box::new(col("a", "y"))),
        ]);
        let and = SqlExpr::And(vec![or, SqlExpr::Literal(Value::Bool(true))]);
        assert_eq!(
            and.to_string(),
            "(\"a\".\"x\" = 1 OR \"a\".\"y\" IS NULL) AND 1"
        );

        let arith = SqlExpr::binary(
            BinOp::Mul,
            SqlExpr::binary(BinOp::Add, col("a", "x"), SqlExpr::Literal(Value::Int64(1))),
            SqlExpr::Literal(Value::Int64(2)),
        );
        assert_eq!(arith.to_string(), "(\"a\".\"x\" + 1) * 2");
    }

    #[test]
    fn test_walk_finds_nested_guard() {
        let inner = Select {
            columns: vec![col("student-1", "tel")],
            from: vec![FromItem {
                table: TableRef::Named("Student".to_string()),
                alias: "student-1".to_string(),
                join: Join::Root,
            }],
            selection: vec![SqlExpr::IsNotNull(Box::new(col("student-1", "tel")))],
            ..Default::default()
        };
        let outer = Select {
            columns: vec![col("g", "number")],
            selection: vec![SqlExpr::InSubquery {
                expr: Box::new(SqlExpr::Literal(Value::from("123"))),
                subquery: Box::new(inner),
                negated: true,
            }],
            ..Default::default()
        };
        assert!(outer.any_expr(|e| matches!(e, SqlExpr::IsNotNull(_))));
        assert!(outer.to_string().contains("NOT IN (SELECT \"student-1\".\"tel\" FROM \"Student\" \"student-1\" WHERE \"student-1\".\"tel\" IS NOT NULL)"));
    }
}
