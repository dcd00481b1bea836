use std::cell::RefCell;
use std::rc::Rc;

/// Runtime values. Arrays share their backing store, so an index store
/// through one register is visible through every alias of the array.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Float(f64),
    Str(Rc<str>),
    Bool(bool),
    Null,
    Array(Rc<RefCell<Vec<Value>>>),
}

impl Value {
    pub fn str(s: impl Into<Rc<str>>) -> Value {
        Value::Str(s.into())
    }

    pub fn array(items: Vec<Value>) -> Value {
        Value::Array(Rc::new(RefCell::new(items)))
    }

    /// Only `false` and `null` are falsy.
    pub fn is_truthy(&self) -> bool {
        !matches!(self, Value::Bool(false) | Value::Null)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::Bool(_) => "bool",
            Value::Null => "null",
            Value::Array(_) => "array",
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Int(n) => write!(f, "{n}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Str(s) => write!(f, "{s}"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Null => write!(f, "null"),
            Value::Array(items) => {
                write!(f, "[")?;
                for (i, item) in items.borrow().iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
        }
    }
}

/// Failure modes of the shared arithmetic below. The optimizer folds only
/// when an operation succeeds; the VM maps these onto runtime faults.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValueOpError {
    #[error("unsupported operand types: {0} and {1}")]
    Types(&'static str, &'static str),
    #[error("unsupported operand type: {0}")]
    Type(&'static str),
    #[error("division by zero")]
    DivisionByZero,
}

type OpResult = Result<Value, ValueOpError>;

fn type_err(a: &Value, b: &Value) -> ValueOpError {
    ValueOpError::Types(a.type_name(), b.type_name())
}

// Int/float promotion: an operation with a float on either side produces
// a float. Integer arithmetic wraps rather than panics.

pub fn add(a: &Value, b: &Value) -> OpResult {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => Ok(Value::Int(x.wrapping_add(*y))),
        (Value::Int(x), Value::Float(y)) => Ok(Value::Float(*x as f64 + y)),
        (Value::Float(x), Value::Int(y)) => Ok(Value::Float(x + *y as f64)),
        (Value::Float(x), Value::Float(y)) => Ok(Value::Float(x + y)),
        (Value::Str(x), Value::Str(y)) => Ok(Value::str(format!("{x}{y}"))),
        _ => Err(type_err(a, b)),
    }
}

pub fn sub(a: &Value, b: &Value) -> OpResult {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => Ok(Value::Int(x.wrapping_sub(*y))),
        (Value::Int(x), Value::Float(y)) => Ok(Value::Float(*x as f64 - y)),
        (Value::Float(x), Value::Int(y)) => Ok(Value::Float(x - *y as f64)),
        (Value::Float(x), Value::Float(y)) => Ok(Value::Float(x - y)),
        _ => Err(type_err(a, b)),
    }
}

pub fn mul(a: &Value, b: &Value) -> OpResult {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => Ok(Value::Int(x.wrapping_mul(*y))),
        (Value::Int(x), Value::Float(y)) => Ok(Value::Float(*x as f64 * y)),
        (Value::Float(x), Value::Int(y)) => Ok(Value::Float(x * *y as f64)),
        (Value::Float(x), Value::Float(y)) => Ok(Value::Float(x * y)),
        _ => Err(type_err(a, b)),
    }
}

/// Division by zero is an error for both numeric kinds — never a silent
/// infinity.
pub fn div(a: &Value, b: &Value) -> OpResult {
    match (a, b) {
        (_, Value::Int(0)) => Err(ValueOpError::DivisionByZero),
        (_, Value::Float(y)) if *y == 0.0 => Err(ValueOpError::DivisionByZero),
        (Value::Int(x), Value::Int(y)) => Ok(Value::Int(x.wrapping_div(*y))),
        (Value::Int(x), Value::Float(y)) => Ok(Value::Float(*x as f64 / y)),
        (Value::Float(x), Value::Int(y)) => Ok(Value::Float(x / *y as f64)),
        (Value::Float(x), Value::Float(y)) => Ok(Value::Float(x / y)),
        _ => Err(type_err(a, b)),
    }
}

pub fn rem(a: &Value, b: &Value) -> OpResult {
    match (a, b) {
        (_, Value::Int(0)) => Err(ValueOpError::DivisionByZero),
        (_, Value::Float(y)) if *y == 0.0 => Err(ValueOpError::DivisionByZero),
        (Value::Int(x), Value::Int(y)) => Ok(Value::Int(x.wrapping_rem(*y))),
        (Value::Int(x), Value::Float(y)) => Ok(Value::Float(*x as f64 % y)),
        (Value::Float(x), Value::Int(y)) => Ok(Value::Float(x % *y as f64)),
        (Value::Float(x), Value::Float(y)) => Ok(Value::Float(x % y)),
        _ => Err(type_err(a, b)),
    }
}

pub fn neg(a: &Value) -> OpResult {
    match a {
        Value::Int(x) => Ok(Value::Int(x.wrapping_neg())),
        Value::Float(x) => Ok(Value::Float(-x)),
        _ => Err(ValueOpError::Type(a.type_name())),
    }
}

/// Equality crosses the int/float divide numerically; other kinds compare
/// structurally and never equal a different kind.
pub fn equals(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Int(x), Value::Float(y)) | (Value::Float(y), Value::Int(x)) => *x as f64 == *y,
        _ => a == b,
    }
}

fn numeric_cmp(a: &Value, b: &Value) -> Result<std::cmp::Ordering, ValueOpError> {
    let ord = match (a, b) {
        (Value::Int(x), Value::Int(y)) => x.partial_cmp(y),
        (Value::Int(x), Value::Float(y)) => (*x as f64).partial_cmp(y),
        (Value::Float(x), Value::Int(y)) => x.partial_cmp(&(*y as f64)),
        (Value::Float(x), Value::Float(y)) => x.partial_cmp(y),
        (Value::Str(x), Value::Str(y)) => x.partial_cmp(y),
        _ => return Err(type_err(a, b)),
    };
    // NaN comparisons are unordered; report them as a type-level failure
    // rather than inventing an answer.
    ord.ok_or_else(|| type_err(a, b))
}

pub fn lt(a: &Value, b: &Value) -> OpResult {
    numeric_cmp(a, b).map(|o| Value::Bool(o.is_lt()))
}

pub fn le(a: &Value, b: &Value) -> OpResult {
    numeric_cmp(a, b).map(|o| Value::Bool(o.is_le()))
}

pub fn gt(a: &Value, b: &Value) -> OpResult {
    numeric_cmp(a, b).map(|o| Value::Bool(o.is_gt()))
}

pub fn ge(a: &Value, b: &Value) -> OpResult {
    numeric_cmp(a, b).map(|o| Value::Bool(o.is_ge()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int_arithmetic_stays_int() {
        assert_eq!(add(&Value::Int(3), &Value::Int(10)), Ok(Value::Int(13)));
        assert_eq!(div(&Value::Int(7), &Value::Int(2)), Ok(Value::Int(3)));
    }

    #[test]
    fn mixed_operands_promote_to_float() {
        assert_eq!(add(&Value::Int(1), &Value::Float(0.5)), Ok(Value::Float(1.5)));
        assert_eq!(mul(&Value::Float(2.0), &Value::Int(3)), Ok(Value::Float(6.0)));
    }

    #[test]
    fn division_by_zero_is_an_error() {
        assert_eq!(div(&Value::Int(1), &Value::Int(0)), Err(ValueOpError::DivisionByZero));
        assert_eq!(div(&Value::Float(1.0), &Value::Float(0.0)), Err(ValueOpError::DivisionByZero));
        assert_eq!(rem(&Value::Int(1), &Value::Int(0)), Err(ValueOpError::DivisionByZero));
    }

    #[test]
    fn string_concat_on_add() {
        assert_eq!(add(&Value::str("ab"), &Value::str("cd")), Ok(Value::str("abcd")));
    }

    #[test]
    fn cross_kind_equality() {
        assert!(equals(&Value::Int(1), &Value::Float(1.0)));
        assert!(!equals(&Value::Int(1), &Value::str("1")));
    }

    #[test]
    fn comparison_type_error() {
        assert!(lt(&Value::Bool(true), &Value::Int(1)).is_err());
        assert_eq!(lt(&Value::str("a"), &Value::str("b")), Ok(Value::Bool(true)));
    }

    #[test]
    fn truthiness() {
        assert!(!Value::Null.is_truthy());
        assert!(!Value::Bool(false).is_truthy());
        assert!(Value::Int(0).is_truthy());
        assert!(Value::str("").is_truthy());
    }

    #[test]
    fn array_aliases_share_storage() {
        let a = Value::array(vec![Value::Int(1)]);
        let b = a.clone();
        if let Value::Array(items) = &a {
            items.borrow_mut().push(Value::Int(2));
        }
        assert_eq!(a, b);
    }

    #[test]
    fn display_formats() {
        assert_eq!(Value::Int(42).to_string(), "42");
        assert_eq!(Value::Float(2.5).to_string(), "2.5");
        assert_eq!(Value::array(vec![Value::Int(1), Value::str("x")]).to_string(), "[1, x]");
    }
}
