//! Operand types and compatibility rules

use std::fmt;

use super::TranslateError;
use crate::data::ScalarKind;

/// Static type of a translated expression
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExprType {
    Scalar(ScalarKind),
    Entity(String),
    Set(Box<ExprType>),
    Tuple(Vec<ExprType>),
    None,
}

impl ExprType {
    pub fn is_collection(&self) -> bool {
        matches!(self, ExprType::Set(_))
    }

    /// Normalized form used for compatibility checks
    fn base(&self) -> ExprType {
        match self {
            ExprType::Scalar(kind) => ExprType::Scalar(kind.base()),
            ExprType::Set(inner) => ExprType::Set(Box::new(inner.base())),
            ExprType::Tuple(items) => ExprType::Tuple(items.iter().map(|t| t.base()).collect()),
            other => other.clone(),
        }
    }
}

impl fmt::Display for ExprType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExprType::Scalar(kind) => write!(f, "{}", kind),
            ExprType::Entity(name) => write!(f, "{}", name),
            ExprType::Set(inner) => write!(f, "Set of {}", inner),
            ExprType::Tuple(items) => {
                write!(f, "(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, ")")
            }
            ExprType::None => write!(f, "NoneType"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpClass {
    Equality,
    Ordering,
    Arithmetic,
}

fn incomparable(left: &ExprType, right: &ExprType, expr: &str) -> TranslateError {
    TranslateError::IncomparableTypes {
        left: left.to_string(),
        right: right.to_string(),
        expr: expr.to_string(),
    }
}

/// Check that two operand types may meet under an operator class
pub fn check_binary(
    class: OpClass,
    left: &ExprType,
    right: &ExprType,
    expr: &str,
) -> Result<(), TranslateError> {
    if left.is_collection() || right.is_collection() {
        return Err(incomparable(left, right, expr));
    }

    match class {
        OpClass::Equality => {
            if comparable(left, right) {
                Ok(())
            } else {
                Err(incomparable(left, right, expr))
            }
        }
        OpClass::Ordering => match (left.base(), right.base()) {
            (ExprType::Scalar(a), ExprType::Scalar(b)) if scalar_compatible(a, b) => Ok(()),
            (ExprType::Tuple(a), ExprType::Tuple(b))
                if a.len() == b.len() && a.iter().zip(&b).all(|(x, y)| comparable(x, y)) =>
            {
                Ok(())
            }
            _ => Err(incomparable(left, right, expr)),
        },
        OpClass::Arithmetic => match (left.base(), right.base()) {
            (ExprType::Scalar(a), ExprType::Scalar(b))
                if (a.is_numeric() && b.is_numeric())
                    || (a == ScalarKind::Str && b == ScalarKind::Str) =>
            {
                Ok(())
            }
            _ => Err(incomparable(left, right, expr)),
        },
    }
}

/// Check `item in collection` given the collection's element type
pub fn check_membership(
    item: &ExprType,
    element: &ExprType,
    collection: &ExprType,
    expr: &str,
) -> Result<(), TranslateError> {
    if item.is_collection() || !comparable(item, element) || matches!(item, ExprType::None) {
        return Err(incomparable(item, collection, expr));
    }
    Ok(())
}

fn scalar_compatible(a: ScalarKind, b: ScalarKind) -> bool {
    let (a, b) = (a.base(), b.base());
    a == b || (a.is_numeric() && b.is_numeric())
}

/// Equality compatibility, applied element-wise to tuples
fn comparable(left: &ExprType, right: &ExprType) -> bool {
    match (left, right) {
        (ExprType::Set(_), _) | (_, ExprType::Set(_)) => false,
        (ExprType::None, _) | (_, ExprType::None) => true,
        (ExprType::Scalar(a), ExprType::Scalar(b)) => scalar_compatible(*a, *b),
        (ExprType::Entity(a), ExprType::Entity(b)) => a == b,
        (ExprType::Tuple(a), ExprType::Tuple(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(x, y)| comparable(x, y))
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set_of(entity: &str) -> ExprType {
        ExprType::Set(Box::new(ExprType::Entity(entity.to_string())))
    }

    #[test]
    fn test_scalar_vs_collection() {
        let err = check_binary(
            OpClass::Equality,
            &ExprType::Scalar(ScalarKind::Int),
            &set_of("Student"),
            "g.number == g.students",
        )
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Incomparable types 'int' and 'Set of Student' in expression: g.number == g.students"
        );
    }

    #[test]
    fn test_string_subtypes() {
        let unicode = ExprType::Scalar(ScalarKind::Unicode);
        let str_ = ExprType::Scalar(ScalarKind::Str);
        assert!(check_binary(OpClass::Equality, &unicode, &str_, "a == b").is_ok());
        assert!(check_binary(OpClass::Ordering, &unicode, &str_, "a < b").is_ok());
        assert!(check_binary(OpClass::Arithmetic, &unicode, &str_, "a + b").is_ok());
    }

    #[test]
    fn test_numeric_family() {
        let int = ExprType::Scalar(ScalarKind::Int);
        let float = ExprType::Scalar(ScalarKind::Float);
        let date = ExprType::Scalar(ScalarKind::Date);
        assert!(check_binary(OpClass::Ordering, &int, &float, "a < b").is_ok());
        assert!(check_binary(OpClass::Ordering, &int, &date, "a < b").is_err());
    }

    #[test]
    fn test_entities_compare_by_equality_only() {
        let student = ExprType::Entity("Student".to_string());
        let group = ExprType::Entity("Group".to_string());
        assert!(check_binary(OpClass::Equality, &student, &student, "a == b").is_ok());
        assert!(check_binary(OpClass::Equality, &student, &group, "a == b").is_err());
        assert!(check_binary(OpClass::Ordering, &student, &student, "a < b").is_err());
        assert!(check_binary(OpClass::Equality, &student, &ExprType::None, "a == None").is_ok());
    }

    #[test]
    fn test_membership() {
        let collection = set_of("Student");
        let student = ExprType::Entity("Student".to_string());
        let element = ExprType::Entity("Student".to_string());
        assert!(check_membership(&student, &element, &collection, "s in g.students").is_ok());

        let int = ExprType::Scalar(ScalarKind::Int);
        let err = check_membership(&int, &element, &collection, "1 in g.students").unwrap_err();
        assert!(err.to_string().contains("'int' and 'Set of Student'"));
    }

    #[test]
    fn test_tuple_equality() {
        let a = ExprType::Tuple(vec![
            ExprType::Scalar(ScalarKind::Unicode),
            ExprType::Scalar(ScalarKind::Int),
        ]);
        let b = ExprType::Tuple(vec![
            ExprType::Scalar(ScalarKind::Str),
            ExprType::Scalar(ScalarKind::Float),
        ]);
        assert!(check_binary(OpClass::Equality, &a, &b, "a == b").is_ok());
        assert_eq!(a.to_string(), "(unicode, int)");
    }
}
