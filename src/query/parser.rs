//! Textual comprehension grammar
//!
//! ```text
//! query      := test generator+
//! generator  := 'for' NAME 'in' or_test ('if' or_test)*
//! or_test    := and_test ('or' and_test)*
//! and_test   := not_test ('and' not_test)*
//! not_test   := 'not' not_test | comparison
//! comparison := arith (comp_op arith)*
//! arith      := term (('+' | '-') term)*
//! term       := factor (('*' | '/' | '%') factor)*
//! factor     := '-' factor | postfix
//! postfix    := atom ('.' NAME [call] | '[' args ']' | call)*
//! ```
//!
//! Tokens come from `sqlparser`'s tokenizer; Python-style keywords are
//! recognized from plain words.

use sqlparser::dialect::GenericDialect;
use sqlparser::tokenizer::{Token, Tokenizer, TokenizerError};

use super::ast::{ArithOp, CmpOp, Comprehension, Expr, Generator, QueryTree};
use crate::data::Value;

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("Tokenizer error: {0}")]
    Tokenizer(#[from] TokenizerError),

    #[error("Empty query")]
    EmptyQuery,

    #[error("Unexpected token: expected {expected}, found {found}")]
    UnexpectedToken { expected: String, found: String },

    #[error("Unexpected end of query: expected {0}")]
    UnexpectedEnd(String),

    #[error("Query must contain at least one 'for' clause")]
    MissingGenerator,

    #[error("Invalid number literal: {0}")]
    InvalidNumber(String),

    #[error("Unsupported syntax: {0}")]
    Unsupported(String),
}

/// Parse a comprehension query string into a tree
pub fn parse_query(text: &str) -> Result<QueryTree, ParseError> {
    let dialect = GenericDialect {};
    let tokens: Vec<Token> = Tokenizer::new(&dialect, text)
        .tokenize()?
        .into_iter()
        .filter(|t| !matches!(t, Token::Whitespace(_) | Token::EOF))
        .collect();

    if tokens.is_empty() {
        return Err(ParseError::EmptyQuery);
    }

    let mut parser = Parser { tokens, pos: 0 };
    let comprehension = parser.parse_top()?;
    Ok(QueryTree::new(comprehension))
}

impl QueryTree {
    pub fn parse(text: &str) -> Result<QueryTree, ParseError> {
        parse_query(text)
    }
}

enum Comparison {
    Op(CmpOp),
    In,
    NotIn,
    Is,
    IsNot,
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_at(&self, offset: usize) -> Option<&Token> {
        self.tokens.get(self.pos + offset)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    /// Unquoted word at the cursor
    fn peek_word(&self) -> Option<&str> {
        match self.peek() {
            Some(Token::Word(w)) if w.quote_style.is_none() => Some(w.value.as_str()),
            _ => None,
        }
    }

    fn at_keyword(&self, keyword: &str) -> bool {
        self.peek_word() == Some(keyword)
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        if self.at_keyword(keyword) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn unexpected(&self, expected: &str) -> ParseError {
        match self.peek() {
            Some(token) => ParseError::UnexpectedToken {
                expected: expected.to_string(),
                found: token.to_string(),
            },
            None => ParseError::UnexpectedEnd(expected.to_string()),
        }
    }

    fn expect_keyword(&mut self, keyword: &str) -> Result<(), ParseError> {
        if self.eat_keyword(keyword) {
            Ok(())
        } else {
            Err(self.unexpected(&format!("'{}'", keyword)))
        }
    }

    fn expect(&mut self, expected: Token, label: &str) -> Result<(), ParseError> {
        if self.peek() == Some(&expected) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.unexpected(label))
        }
    }

    fn expect_name(&mut self) -> Result<String, ParseError> {
        match self.peek_word() {
            Some(word) if !is_keyword(word) => {
                let name = word.to_string();
                self.pos += 1;
                Ok(name)
            }
            _ => Err(self.unexpected("identifier")),
        }
    }

    fn parse_top(&mut self) -> Result<Comprehension, ParseError> {
        let result = self.parse_or()?;
        let comprehension = if self.at_keyword("for") {
            let generators = self.parse_generators()?;
            Comprehension::new(result, generators)
        } else if let Expr::Comprehension(inner) = result {
            *inner
        } else {
            return Err(ParseError::MissingGenerator);
        };

        if self.peek().is_some() {
            return Err(self.unexpected("end of query"));
        }
        Ok(comprehension)
    }

    fn parse_generators(&mut self) -> Result<Vec<Generator>, ParseError> {
        let mut generators = Vec::new();
        while self.eat_keyword("for") {
            let var = self.expect_name()?;
            self.expect_keyword("in")?;
            let source = self.parse_or()?;
            let mut conditions = Vec::new();
            while self.eat_keyword("if") {
                conditions.push(self.parse_or()?);
            }
            generators.push(Generator {
                var,
                source,
                conditions,
            });
        }
        Ok(generators)
    }

    fn parse_or(&mut self) -> Result<Expr, ParseError> {
        let first = self.parse_and()?;
        if !self.at_keyword("or") {
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat_keyword("or") {
            items.push(self.parse_and()?);
        }
        Ok(Expr::Or(items))
    }

    fn parse_and(&mut self) -> Result<Expr, ParseError> {
        let first = self.parse_not()?;
        if !self.at_keyword("and") {
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat_keyword("and") {
            items.push(self.parse_not()?);
        }
        Ok(Expr::And(items))
    }

    fn parse_not(&mut self) -> Result<Expr, ParseError> {
        if self.eat_keyword("not") {
            let inner = self.parse_not()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_comparison()
    }

    fn comparison_op(&mut self) -> Option<Comparison> {
        let op = match self.peek() {
            Some(Token::DoubleEq) | Some(Token::Eq) => Comparison::Op(CmpOp::Eq),
            Some(Token::Neq) => Comparison::Op(CmpOp::Ne),
            Some(Token::Lt) => Comparison::Op(CmpOp::Lt),
            Some(Token::LtEq) => Comparison::Op(CmpOp::Le),
            Some(Token::Gt) => Comparison::Op(CmpOp::Gt),
            Some(Token::GtEq) => Comparison::Op(CmpOp::Ge),
            _ => {
                if self.eat_keyword("in") {
                    return Some(Comparison::In);
                }
                if self.at_keyword("not") {
                    let next_is_in = matches!(
                        self.peek_at(1),
                        Some(Token::Word(w)) if w.quote_style.is_none() && w.value == "in"
                    );
                    if next_is_in {
                        self.pos += 2;
                        return Some(Comparison::NotIn);
                    }
                    return None;
                }
                if self.eat_keyword("is") {
                    if self.eat_keyword("not") {
                        return Some(Comparison::IsNot);
                    }
                    return Some(Comparison::Is);
                }
                return None;
            }
        };
        self.pos += 1;
        Some(op)
    }

    /// Chained comparisons desugar to a conjunction: `a < b < c` is `a < b and b < c`
    fn parse_comparison(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_arith()?;
        let mut terms = Vec::new();

        while let Some(op) = self.comparison_op() {
            let right = self.parse_arith()?;
            let term = match op {
                Comparison::Op(op) => Expr::Compare {
                    op,
                    left: Box::new(left),
                    right: Box::new(right.clone()),
                },
                Comparison::In | Comparison::NotIn => Expr::In {
                    item: Box::new(left),
                    collection: Box::new(right.clone()),
                    negated: matches!(op, Comparison::NotIn),
                },
                Comparison::Is | Comparison::IsNot => {
                    if right != Expr::Const(Value::Null) {
                        return Err(ParseError::Unsupported(format!(
                            "'is' comparison with {}",
                            right
                        )));
                    }
                    Expr::IsNone {
                        expr: Box::new(left),
                        negated: matches!(op, Comparison::IsNot),
                    }
                }
            };
            terms.push(term);
            left = right;
        }

        match terms.len() {
            0 => Ok(left),
            1 => Ok(terms.remove(0)),
            _ => Ok(Expr::And(terms)),
        }
    }

    fn parse_arith(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_term()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => ArithOp::Add,
                Some(Token::Minus) => ArithOp::Sub,
                _ => return Ok(left),
            };
            self.pos += 1;
            let right = self.parse_term()?;
            left = left.arith(op, right);
        }
    }

    fn parse_term(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_factor()?;
        loop {
            let op = match self.peek() {
                Some(Token::Mul) => ArithOp::Mul,
                Some(Token::Div) => ArithOp::Div,
                Some(Token::Mod) => ArithOp::Mod,
                _ => return Ok(left),
            };
            self.pos += 1;
            let right = self.parse_factor()?;
            left = left.arith(op, right);
        }
    }

    fn parse_factor(&mut self) -> Result<Expr, ParseError> {
        match self.peek() {
            Some(Token::Minus) => {
                self.pos += 1;
                let inner = self.parse_factor()?;
                Ok(match inner {
                    Expr::Const(Value::Int64(i)) => Expr::Const(Value::Int64(-i)),
                    Expr::Const(Value::Float64(f)) => Expr::Const(Value::Float64(-f)),
                    other => Expr::Neg(Box::new(other)),
                })
            }
            Some(Token::Plus) => {
                self.pos += 1;
                self.parse_factor()
            }
            _ => self.parse_postfix(),
        }
    }

    fn parse_postfix(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.parse_atom()?;
        loop {
            match self.peek() {
                Some(Token::Period) => {
                    self.pos += 1;
                    let name = self.expect_name()?;
                    if self.peek() == Some(&Token::LParen) {
                        let (args, kwargs) = self.parse_call_args()?;
                        if !kwargs.is_empty() {
                            return Err(ParseError::Unsupported(format!(
                                "keyword arguments to method '{}'",
                                name
                            )));
                        }
                        expr = expr.method(name, args);
                    } else {
                        expr = expr.attr(name);
                    }
                }
                Some(Token::LBracket) => {
                    self.pos += 1;
                    let mut key = vec![self.parse_or()?];
                    while self.peek() == Some(&Token::Comma) {
                        self.pos += 1;
                        key.push(self.parse_or()?);
                    }
                    self.expect(Token::RBracket, "']'")?;
                    expr = Expr::Lookup {
                        entity: Box::new(expr),
                        key,
                    };
                }
                Some(Token::LParen) => {
                    let func = match &expr {
                        Expr::Name(name) => name.clone(),
                        other => {
                            return Err(ParseError::Unsupported(format!("call of {}", other)))
                        }
                    };
                    let (args, kwargs) = self.parse_call_args()?;
                    expr = Expr::Call { func, args, kwargs };
                }
                _ => return Ok(expr),
            }
        }
    }

    fn parse_call_args(&mut self) -> Result<(Vec<Expr>, Vec<(String, Expr)>), ParseError> {
        self.expect(Token::LParen, "'('")?;
        let mut args = Vec::new();
        let mut kwargs = Vec::new();

        if self.peek() == Some(&Token::RParen) {
            self.pos += 1;
            return Ok((args, kwargs));
        }

        loop {
            let is_kwarg = self.peek_word().is_some() && self.peek_at(1) == Some(&Token::Eq);
            if is_kwarg {
                let name = self.expect_name()?;
                self.pos += 1;
                kwargs.push((name, self.parse_or()?));
            } else {
                let arg = self.parse_or()?;
                if self.at_keyword("for") {
                    let generators = self.parse_generators()?;
                    args.push(Expr::comprehension(Comprehension::new(arg, generators)));
                } else {
                    args.push(arg);
                }
            }

            match self.advance() {
                Some(Token::Comma) => continue,
                Some(Token::RParen) => return Ok((args, kwargs)),
                Some(other) => {
                    return Err(ParseError::UnexpectedToken {
                        expected: "',' or ')'".to_string(),
                        found: other.to_string(),
                    })
                }
                None => return Err(ParseError::UnexpectedEnd("')'".to_string())),
            }
        }
    }

    fn parse_atom(&mut self) -> Result<Expr, ParseError> {
        let token = self
            .advance()
            .ok_or_else(|| ParseError::UnexpectedEnd("expression".to_string()))?;

        match token {
            Token::Word(word) if word.quote_style.is_some() => {
                Ok(Expr::Const(Value::String(word.value)))
            }
            Token::Word(word) => match word.value.as_str() {
                "None" => Ok(Expr::Const(Value::Null)),
                "True" => Ok(Expr::Const(Value::Bool(true))),
                "False" => Ok(Expr::Const(Value::Bool(false))),
                w if is_keyword(w) => Err(ParseError::UnexpectedToken {
                    expected: "expression".to_string(),
                    found: w.to_string(),
                }),
                _ => Ok(Expr::Name(word.value)),
            },
            Token::Number(text, _) => parse_number(&text),
            Token::SingleQuotedString(s) | Token::DoubleQuotedString(s) => {
                Ok(Expr::Const(Value::String(s)))
            }
            Token::LParen => self.parse_parenthesized(),
            other => Err(ParseError::UnexpectedToken {
                expected: "expression".to_string(),
                found: other.to_string(),
            }),
        }
    }

    /// After `(`: a parenthesized expression, a tuple or a generator expression
    fn parse_parenthesized(&mut self) -> Result<Expr, ParseError> {
        if self.peek() == Some(&Token::RParen) {
            self.pos += 1;
            return Ok(Expr::Tuple(Vec::new()));
        }

        let first = self.parse_or()?;
        if self.at_keyword("for") {
            let generators = self.parse_generators()?;
            self.expect(Token::RParen, "')'")?;
            return Ok(Expr::comprehension(Comprehension::new(first, generators)));
        }

        if self.peek() != Some(&Token::Comma) {
            self.expect(Token::RParen, "')'")?;
            return Ok(first);
        }

        let mut items = vec![first];
        while self.peek() == Some(&Token::Comma) {
            self.pos += 1;
            if self.peek() == Some(&Token::RParen) {
                break;
            }
            items.push(self.parse_or()?);
        }
        self.expect(Token::RParen, "')'")?;
        Ok(Expr::Tuple(items))
    }
}

fn is_keyword(word: &str) -> bool {
    matches!(
        word,
        "for" | "in" | "if" | "not" | "and" | "or" | "is" | "None" | "True" | "False"
    )
}

fn parse_number(text: &str) -> Result<Expr, ParseError> {
    if text.contains(['.', 'e', 'E']) {
        text.parse::<f64>()
            .map(|f| Expr::Const(Value::Float64(f)))
            .map_err(|_| ParseError::InvalidNumber(text.to_string()))
    } else {
        text.parse::<i64>()
            .map(|i| Expr::Const(Value::Int64(i)))
            .map_err(|_| ParseError::InvalidNumber(text.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_generator() {
        let tree = parse_query("s for s in Student").unwrap();
        let comp = tree.comprehension();
        assert_eq!(comp.result, Expr::name("s"));
        assert_eq!(comp.generators.len(), 1);
        assert_eq!(comp.generators[0].source, Expr::name("Student"));
    }

    #[test]
    fn test_chained_comparison() {
        let tree = parse_query("s for s in db.Student if 3 <= s.gpa < 4").unwrap();
        let generator = &tree.comprehension().generators[0];
        assert_eq!(generator.source, Expr::path("db.Student"));
        assert_eq!(
            generator.conditions[0],
            Expr::lit(3)
                .le(Expr::path("s.gpa"))
                .and(Expr::path("s.gpa").lt(Expr::lit(4)))
        );
    }

    #[test]
    fn test_membership_and_none() {
        let tree = parse_query("g for g in Group if 'John' not in g.students.name and g.dept is not None").unwrap();
        let condition = &tree.comprehension().generators[0].conditions[0];
        assert_eq!(
            condition,
            &Expr::lit("John")
                .not_in(Expr::path("g.students.name"))
                .and(Expr::path("g.dept").is_not_none())
        );
    }

    #[test]
    fn test_nested_generator_in_call() {
        let tree = parse_query(
            "d for d in Department if len(s for c in d.courses for s in c.students) > 4",
        )
        .unwrap();
        let condition = &tree.comprehension().generators[0].conditions[0];
        match condition {
            Expr::Compare { left, .. } => match left.as_ref() {
                Expr::Call { func, args, .. } => {
                    assert_eq!(func, "len");
                    assert!(matches!(&args[0], Expr::Comprehension(c) if c.generators.len() == 2));
                }
                other => panic!("Expected call, got {:?}", other),
            },
            other => panic!("Expected comparison, got {:?}", other),
        }
    }

    #[test]
    fn test_keyword_arguments_and_methods() {
        let tree = parse_query(
            "s for s in Student if s.dob < date(year=1990, month=10, day=20) and s.name.startswith('J')",
        )
        .unwrap();
        let condition = &tree.comprehension().generators[0].conditions[0];
        let Expr::And(items) = condition else {
            panic!("Expected conjunction");
        };
        match &items[0] {
            Expr::Compare { right, .. } => {
                assert!(matches!(right.as_ref(), Expr::Call { kwargs, .. } if kwargs.len() == 3));
            }
            other => panic!("Expected comparison, got {:?}", other),
        }
        assert_eq!(
            items[1],
            Expr::path("s.name").method("startswith", vec![Expr::lit("J")])
        );
    }

    #[test]
    fn test_tuples_and_lookup() {
        let tree = parse_query("(s.name, s.group.number) for s in Student if s.group == Group[101]").unwrap();
        let comp = tree.comprehension();
        assert!(matches!(&comp.result, Expr::Tuple(items) if items.len() == 2));
        assert_eq!(
            comp.generators[0].conditions[0],
            Expr::path("s.group").eq(Expr::lookup("Group", vec![Expr::lit(101)]))
        );
    }

    #[test]
    fn test_parenthesized_query() {
        let tree = parse_query("(s for s in Student if -s.gpa < -3.5)").unwrap();
        let condition = &tree.comprehension().generators[0].conditions[0];
        assert_eq!(
            condition,
            &Expr::Neg(Box::new(Expr::path("s.gpa"))).lt(Expr::lit(-3.5))
        );
    }

    #[test]
    fn test_errors() {
        assert!(matches!(parse_query(""), Err(ParseError::EmptyQuery)));
        assert!(matches!(
            parse_query("s.name"),
            Err(ParseError::MissingGenerator)
        ));
        assert!(matches!(
            parse_query("s for in Student"),
            Err(ParseError::UnexpectedToken { .. })
        ));
        assert!(matches!(
            parse_query("s for s in Student if"),
            Err(ParseError::UnexpectedEnd(_))
        ));
    }
}
