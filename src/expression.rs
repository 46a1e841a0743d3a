use serde_json::{Value, json};

use crate::error::{Error, Result};
use crate::value::OrderedValue;

// ---------------------------------------------------------------------------
// Field helpers
// ---------------------------------------------------------------------------

/// Resolve a dot-notation path, returning `Null` when any segment is
/// missing or not an object.
pub fn resolve_field(doc: &Value, path: &str) -> Value {
    let mut current = doc;
    for part in path.split('.') {
        match current {
            Value::Object(map) => match map.get(part) {
                Some(v) => current = v,
                None => return Value::Null,
            },
            _ => return Value::Null,
        }
    }
    current.clone()
}

/// Set a dot-notation path, creating intermediate objects as needed.
pub fn set_field(doc: &mut Value, path: &str, value: Value) {
    let mut parts = path.split('.').peekable();
    let mut current = doc;
    while let Some(part) = parts.next() {
        let Value::Object(map) = current else {
            return;
        };
        if parts.peek().is_none() {
            map.insert(part.to_string(), value);
            return;
        }
        let child = map.entry(part.to_string()).or_insert_with(|| json!({}));
        if !child.is_object() {
            *child = json!({});
        }
        current = child;
    }
}

/// Remove a dot-notation path if present.
pub fn remove_field(doc: &mut Value, path: &str) {
    let (parent, leaf) = match path.rsplit_once('.') {
        Some((parent, leaf)) => (Some(parent), leaf),
        None => (None, path),
    };
    let mut current = doc;
    if let Some(parent) = parent {
        for part in parent.split('.') {
            match current.as_object_mut().and_then(|m| m.get_mut(part)) {
                Some(next) => current = next,
                None => return,
            }
        }
    }
    if let Value::Object(map) = current {
        map.remove(leaf);
    }
}

/// Integral results stay integers so that sums of integer scores round-trip
/// as integers.
pub fn number_to_value(n: f64) -> Value {
    if n.fract() == 0.0 && n >= i64::MIN as f64 && n <= i64::MAX as f64 {
        Value::Number((n as i64).into())
    } else {
        serde_json::Number::from_f64(n)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

pub fn is_truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        _ => true,
    }
}

// ---------------------------------------------------------------------------
// Expression
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
}

impl CompareOp {
    fn from_operator(op: &str) -> Option<Self> {
        Some(match op {
            "$eq" => CompareOp::Eq,
            "$ne" => CompareOp::Ne,
            "$gt" => CompareOp::Gt,
            "$gte" => CompareOp::Gte,
            "$lt" => CompareOp::Lt,
            "$lte" => CompareOp::Lte,
            _ => return None,
        })
    }

    pub fn holds(self, a: &OrderedValue, b: &OrderedValue) -> bool {
        match self {
            CompareOp::Eq => a == b,
            CompareOp::Ne => a != b,
            CompareOp::Gt => a > b,
            CompareOp::Gte => a >= b,
            CompareOp::Lt => a < b,
            CompareOp::Lte => a <= b,
        }
    }
}

/// An aggregation expression: field references, literals, `$size`,
/// comparisons and arithmetic.
#[derive(Debug, Clone)]
pub enum Expression {
    Literal(Value),
    FieldRef(String),
    Size(Box<Expression>),
    Compare(CompareOp, Box<Expression>, Box<Expression>),
    Add(Vec<Expression>),
    Subtract(Box<Expression>, Box<Expression>),
    Multiply(Vec<Expression>),
    Divide(Box<Expression>, Box<Expression>),
}

fn operands(op: &str, arg: &Value) -> Result<Vec<Expression>> {
    let arr = arg
        .as_array()
        .ok_or_else(|| Error::QuerySyntax(format!("{op} requires an array")))?;
    arr.iter().map(Expression::parse).collect()
}

fn binary(op: &str, arg: &Value) -> Result<(Box<Expression>, Box<Expression>)> {
    let mut exprs = operands(op, arg)?;
    if exprs.len() != 2 {
        return Err(Error::QuerySyntax(format!(
            "{op} requires exactly 2 arguments"
        )));
    }
    let b = exprs.pop();
    let a = exprs.pop();
    match (a, b) {
        (Some(a), Some(b)) => Ok((Box::new(a), Box::new(b))),
        _ => Err(Error::QuerySyntax(format!("{op} requires exactly 2 arguments"))),
    }
}

impl Expression {
    pub fn parse(val: &Value) -> Result<Expression> {
        match val {
            Value::String(s) if s.starts_with('$') => Ok(Expression::FieldRef(s[1..].to_string())),
            Value::Object(map) if map.len() == 1 && map.keys().all(|k| k.starts_with('$')) => {
                let Some((key, arg)) = map.iter().next() else {
                    return Ok(Expression::Literal(val.clone()));
                };
                let op = key.as_str();
                if let Some(cmp) = CompareOp::from_operator(op) {
                    let (a, b) = binary(op, arg)?;
                    return Ok(Expression::Compare(cmp, a, b));
                }
                match op {
                    "$size" => {
                        // Accept both `{$size: "$f"}` and `{$size: ["$f"]}`
                        let inner = match arg {
                            Value::Array(items) if items.len() == 1 => &items[0],
                            other => other,
                        };
                        Ok(Expression::Size(Box::new(Expression::parse(inner)?)))
                    }
                    "$add" => Ok(Expression::Add(operands(op, arg)?)),
                    "$subtract" => {
                        let (a, b) = binary(op, arg)?;
                        Ok(Expression::Subtract(a, b))
                    }
                    "$multiply" => Ok(Expression::Multiply(operands(op, arg)?)),
                    "$divide" => {
                        let (a, b) = binary(op, arg)?;
                        Ok(Expression::Divide(a, b))
                    }
                    _ => Err(Error::QuerySyntax(format!(
                        "unknown expression operator: {op}"
                    ))),
                }
            }
            _ => Ok(Expression::Literal(val.clone())),
        }
    }

    pub fn eval(&self, doc: &Value) -> Value {
        match self {
            Expression::Literal(v) => v.clone(),
            Expression::FieldRef(path) => resolve_field(doc, path),
            Expression::Size(inner) => match inner.eval(doc) {
                Value::Array(items) => Value::Number(items.len().into()),
                _ => Value::Null,
            },
            Expression::Compare(op, a, b) => {
                let a = OrderedValue::from_json(&a.eval(doc));
                let b = OrderedValue::from_json(&b.eval(doc));
                Value::Bool(op.holds(&a, &b))
            }
            Expression::Add(exprs) => {
                let mut sum = 0.0_f64;
                for e in exprs {
                    match e.eval(doc).as_f64() {
                        Some(n) => sum += n,
                        None => return Value::Null,
                    }
                }
                number_to_value(sum)
            }
            Expression::Subtract(a, b) => match (a.eval(doc).as_f64(), b.eval(doc).as_f64()) {
                (Some(a), Some(b)) => number_to_value(a - b),
                _ => Value::Null,
            },
            Expression::Multiply(exprs) => {
                let mut product = 1.0_f64;
                for e in exprs {
                    match e.eval(doc).as_f64() {
                        Some(n) => product *= n,
                        None => return Value::Null,
                    }
                }
                number_to_value(product)
            }
            Expression::Divide(a, b) => match (a.eval(doc).as_f64(), b.eval(doc).as_f64()) {
                (Some(a), Some(b)) if b != 0.0 => number_to_value(a / b),
                _ => Value::Null,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval(expr: Value, doc: Value) -> Value {
        Expression::parse(&expr).unwrap().eval(&doc)
    }

    #[test]
    fn field_ref_nested() {
        let doc = json!({"marks": {"score": 91}});
        assert_eq!(eval(json!("$marks.score"), doc), json!(91));
    }

    #[test]
    fn missing_field_is_null() {
        assert_eq!(eval(json!("$missing"), json!({"a": 1})), Value::Null);
    }

    #[test]
    fn size_of_array() {
        let doc = json!({"marks": [1, 2, 3]});
        assert_eq!(eval(json!({"$size": "$marks"}), doc.clone()), json!(3));
        assert_eq!(eval(json!({"$size": ["$marks"]}), doc), json!(3));
    }

    #[test]
    fn size_of_non_array_is_null() {
        assert_eq!(eval(json!({"$size": "$name"}), json!({"name": "x"})), Value::Null);
    }

    #[test]
    fn compare_size_with_literal() {
        let doc = json!({"marks": [{"score": 1}]});
        assert_eq!(eval(json!({"$lt": [{"$size": "$marks"}, 2]}), doc.clone()), json!(true));
        assert_eq!(eval(json!({"$gte": [{"$size": "$marks"}, 2]}), doc), json!(false));
    }

    #[test]
    fn arithmetic() {
        let doc = json!({"a": 10, "b": 4});
        assert_eq!(eval(json!({"$add": ["$a", "$b"]}), doc.clone()), json!(14));
        assert_eq!(eval(json!({"$subtract": ["$a", "$b"]}), doc.clone()), json!(6));
        assert_eq!(eval(json!({"$multiply": ["$a", "$b"]}), doc.clone()), json!(40));
        assert_eq!(eval(json!({"$divide": ["$a", "$b"]}), doc), json!(2.5));
    }

    #[test]
    fn divide_by_zero_is_null() {
        assert_eq!(eval(json!({"$divide": [1, 0]}), json!({})), Value::Null);
    }

    #[test]
    fn arity_errors() {
        assert!(matches!(
            Expression::parse(&json!({"$lt": [1]})),
            Err(Error::QuerySyntax(_))
        ));
        assert!(matches!(
            Expression::parse(&json!({"$bogus": 1})),
            Err(Error::QuerySyntax(_))
        ));
    }

    #[test]
    fn set_and_remove_nested() {
        let mut doc = json!({"a": {"b": 1}});
        set_field(&mut doc, "a.c.d", json!(2));
        assert_eq!(doc, json!({"a": {"b": 1, "c": {"d": 2}}}));
        remove_field(&mut doc, "a.b");
        assert_eq!(doc, json!({"a": {"c": {"d": 2}}}));
        remove_field(&mut doc, "x.y");
        assert_eq!(doc, json!({"a": {"c": {"d": 2}}}));
    }

    #[test]
    fn truthiness() {
        assert!(is_truthy(&json!(true)));
        assert!(is_truthy(&json!(1)));
        assert!(!is_truthy(&json!(0)));
        assert!(!is_truthy(&Value::Null));
    }
}
