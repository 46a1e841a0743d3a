use regex::{Regex, RegexBuilder};
use serde_json::{Map, Value as JsonValue};

use crate::error::{Error, Result};
use crate::expression::{self, CompareOp, Expression};
use crate::model::ID_FIELD;
use crate::value::OrderedValue;

// ---------------------------------------------------------------------------
// Query AST
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum QueryOp {
    Cmp(CompareOp, OrderedValue),
    In(Vec<OrderedValue>),
    Nin(Vec<OrderedValue>),
    Exists(bool),
    Regex(Regex),
    Size(usize),
    ElemMatch(Box<Query>),
    /// Negation of the conjunction of the wrapped operators.
    Not(Vec<QueryOp>),
}

#[derive(Debug, Clone)]
pub enum Query {
    Field { field: String, op: QueryOp },
    And(Vec<Query>),
    Or(Vec<Query>),
    Nor(Vec<Query>),
    Expr(Expression),
    All, // match everything
}

// ---------------------------------------------------------------------------
// Parsing: JSON → Query AST
// ---------------------------------------------------------------------------

pub fn parse_query(query: &JsonValue) -> Result<Query> {
    let obj = query
        .as_object()
        .ok_or_else(|| Error::QuerySyntax("query must be a JSON object".into()))?;

    if obj.is_empty() {
        return Ok(Query::All);
    }

    let mut conditions: Vec<Query> = Vec::new();

    for (key, value) in obj {
        match key.as_str() {
            "$and" | "$or" | "$nor" => {
                let arr = value
                    .as_array()
                    .filter(|a| !a.is_empty())
                    .ok_or_else(|| {
                        Error::QuerySyntax(format!("{key} must be a non-empty array"))
                    })?;
                let subs = arr.iter().map(parse_query).collect::<Result<Vec<_>>>()?;
                conditions.push(match key.as_str() {
                    "$and" => Query::And(subs),
                    "$or" => Query::Or(subs),
                    _ => Query::Nor(subs),
                });
            }
            "$expr" => conditions.push(Query::Expr(Expression::parse(value)?)),
            op if op.starts_with('$') => {
                return Err(Error::QuerySyntax(format!(
                    "unknown top level operator: {op}"
                )));
            }
            field => match value {
                JsonValue::Object(ops) if ops.keys().any(|k| k.starts_with('$')) => {
                    for op in parse_ops(ops)? {
                        conditions.push(Query::Field {
                            field: field.to_string(),
                            op,
                        });
                    }
                }
                // Shorthand for $eq, including plain object equality
                _ => conditions.push(Query::Field {
                    field: field.to_string(),
                    op: QueryOp::Cmp(CompareOp::Eq, OrderedValue::from_json(value)),
                }),
            },
        }
    }

    match conditions.len() {
        1 => Ok(conditions.pop().unwrap_or(Query::All)),
        _ => Ok(Query::And(conditions)),
    }
}

fn parse_ops(ops: &Map<String, JsonValue>) -> Result<Vec<QueryOp>> {
    let options = match ops.get("$options") {
        Some(v) => Some(
            v.as_str()
                .ok_or_else(|| Error::QuerySyntax("$options must be a string".into()))?,
        ),
        None => None,
    };
    if options.is_some() && !ops.contains_key("$regex") {
        return Err(Error::QuerySyntax("$options needs a $regex".into()));
    }

    ops.iter()
        .filter(|(k, _)| k.as_str() != "$options")
        .map(|(k, v)| parse_op(k, v, options))
        .collect()
}

fn parse_op(op_key: &str, op_val: &JsonValue, options: Option<&str>) -> Result<QueryOp> {
    let cmp = |op: CompareOp| -> Result<QueryOp> {
        Ok(QueryOp::Cmp(op, OrderedValue::from_json(op_val)))
    };
    match op_key {
        "$eq" => cmp(CompareOp::Eq),
        "$ne" => cmp(CompareOp::Ne),
        "$gt" => cmp(CompareOp::Gt),
        "$gte" => cmp(CompareOp::Gte),
        "$lt" => cmp(CompareOp::Lt),
        "$lte" => cmp(CompareOp::Lte),
        "$in" | "$nin" => {
            let arr = op_val
                .as_array()
                .ok_or_else(|| Error::QuerySyntax(format!("{op_key} must be an array")))?;
            let vals = arr.iter().map(OrderedValue::from_json).collect();
            Ok(if op_key == "$in" {
                QueryOp::In(vals)
            } else {
                QueryOp::Nin(vals)
            })
        }
        "$exists" => {
            let b = op_val
                .as_bool()
                .ok_or_else(|| Error::QuerySyntax("$exists must be a boolean".into()))?;
            Ok(QueryOp::Exists(b))
        }
        "$regex" => {
            let pattern = op_val
                .as_str()
                .ok_or_else(|| Error::QuerySyntax("$regex must be a string".into()))?;
            Ok(QueryOp::Regex(build_regex(pattern, options)?))
        }
        "$size" => {
            let n = op_val.as_u64().ok_or_else(|| {
                Error::QuerySyntax("$size must be a non-negative integer".into())
            })?;
            Ok(QueryOp::Size(n as usize))
        }
        "$elemMatch" => {
            if !op_val.is_object() {
                return Err(Error::QuerySyntax("$elemMatch must be an object".into()));
            }
            Ok(QueryOp::ElemMatch(Box::new(parse_query(op_val)?)))
        }
        "$not" => {
            let inner = op_val
                .as_object()
                .filter(|m| !m.is_empty() && m.keys().all(|k| k.starts_with('$')))
                .ok_or_else(|| {
                    Error::QuerySyntax("$not must be an object of operators".into())
                })?;
            Ok(QueryOp::Not(parse_ops(inner)?))
        }
        _ => Err(Error::QuerySyntax(format!("unknown operator: {op_key}"))),
    }
}

fn build_regex(pattern: &str, options: Option<&str>) -> Result<Regex> {
    let mut builder = RegexBuilder::new(pattern);
    for flag in options.unwrap_or_default().chars() {
        match flag {
            'i' => {
                builder.case_insensitive(true);
            }
            'm' => {
                builder.multi_line(true);
            }
            's' => {
                builder.dot_matches_new_line(true);
            }
            'x' => {
                builder.ignore_whitespace(true);
            }
            other => {
                return Err(Error::QuerySyntax(format!("unsupported $options flag: {other}")));
            }
        }
    }
    builder
        .build()
        .map_err(|e| Error::QuerySyntax(format!("invalid $regex: {e}")))
}

// ---------------------------------------------------------------------------
// Filter: evaluate a query against a single document
// ---------------------------------------------------------------------------

/// Collect every value a dotted path reaches. Arrays met along the way fan
/// out over their object elements; numeric segments index into arrays.
fn reach<'a>(data: &'a JsonValue, path: &str) -> Vec<&'a JsonValue> {
    let mut current = vec![data];
    for part in path.split('.') {
        let mut next = Vec::new();
        for value in current {
            match value {
                JsonValue::Object(map) => {
                    if let Some(child) = map.get(part) {
                        next.push(child);
                    }
                }
                JsonValue::Array(items) => {
                    if let Some(item) = part.parse::<usize>().ok().and_then(|i| items.get(i)) {
                        next.push(item);
                    }
                    next.extend(
                        items
                            .iter()
                            .filter_map(|item| item.as_object().and_then(|m| m.get(part))),
                    );
                }
                _ => {}
            }
        }
        current = next;
    }
    current
}

/// True if any reached value, or any element of a reached array, satisfies
/// `pred`. Whole arrays are offered to `pred` only when `whole` is set.
fn any_scalar(reached: &[&JsonValue], whole: bool, pred: impl Fn(&OrderedValue) -> bool) -> bool {
    reached.iter().any(|value| match value {
        JsonValue::Array(items) => {
            (whole && pred(&OrderedValue::from_json(value)))
                || items.iter().any(|e| pred(&OrderedValue::from_json(e)))
        }
        _ => pred(&OrderedValue::from_json(value)),
    })
}

fn matches_op(op: &QueryOp, reached: &[&JsonValue]) -> bool {
    match op {
        QueryOp::Exists(expected) => !reached.is_empty() == *expected,
        QueryOp::Cmp(CompareOp::Eq, v) => {
            (v.is_null() && reached.is_empty()) || any_scalar(reached, true, |x| x == v)
        }
        QueryOp::Cmp(CompareOp::Ne, v) => {
            !matches_op(&QueryOp::Cmp(CompareOp::Eq, v.clone()), reached)
        }
        QueryOp::Cmp(cmp, v) => any_scalar(reached, false, |x| x.same_bracket(v) && cmp.holds(x, v)),
        QueryOp::In(vals) => {
            (reached.is_empty() && vals.iter().any(OrderedValue::is_null))
                || any_scalar(reached, true, |x| vals.contains(x))
        }
        QueryOp::Nin(vals) => !matches_op(&QueryOp::In(vals.clone()), reached),
        QueryOp::Regex(re) => reached.iter().any(|value| match value {
            JsonValue::String(s) => re.is_match(s),
            JsonValue::Array(items) => items
                .iter()
                .any(|e| e.as_str().is_some_and(|s| re.is_match(s))),
            _ => false,
        }),
        QueryOp::Size(n) => reached
            .iter()
            .any(|value| value.as_array().is_some_and(|a| a.len() == *n)),
        QueryOp::ElemMatch(query) => reached.iter().any(|value| {
            value.as_array().is_some_and(|items| {
                items
                    .iter()
                    .any(|item| item.is_object() && matches_value(query, item))
            })
        }),
        QueryOp::Not(ops) => !ops.iter().all(|op| matches_op(op, reached)),
    }
}

pub fn matches_value(query: &Query, data: &JsonValue) -> bool {
    match query {
        Query::All => true,
        Query::Field { field, op } => matches_op(op, &reach(data, field)),
        Query::And(subs) => subs.iter().all(|s| matches_value(s, data)),
        Query::Or(subs) => subs.iter().any(|s| matches_value(s, data)),
        Query::Nor(subs) => !subs.iter().any(|s| matches_value(s, data)),
        Query::Expr(expr) => expression::is_truthy(&expr.eval(data)),
    }
}

// ---------------------------------------------------------------------------
// Projection
// ---------------------------------------------------------------------------

/// A find projection. The key field is kept unless explicitly excluded.
#[derive(Debug, Clone)]
pub enum Projection {
    Include { fields: Vec<String>, keep_id: bool },
    Exclude(Vec<String>),
}

impl Projection {
    pub fn parse(spec: &JsonValue) -> Result<Self> {
        let obj = spec
            .as_object()
            .ok_or_else(|| Error::QuerySyntax("projection must be a JSON object".into()))?;

        let mut include = Vec::new();
        let mut exclude = Vec::new();
        for (field, flag) in obj {
            let keep = match flag {
                JsonValue::Bool(b) => *b,
                JsonValue::Number(n) if n.as_i64() == Some(1) => true,
                JsonValue::Number(n) if n.as_i64() == Some(0) => false,
                _ => {
                    return Err(Error::QuerySyntax(format!(
                        "projection value for '{field}' must be 0, 1 or a boolean"
                    )));
                }
            };
            if keep {
                include.push(field.clone());
            } else {
                exclude.push(field.clone());
            }
        }

        if include.is_empty() {
            return Ok(Projection::Exclude(exclude));
        }
        let id_excluded = exclude.iter().any(|f| f == ID_FIELD);
        if exclude.len() > usize::from(id_excluded) {
            return Err(Error::QuerySyntax(
                "projection cannot mix inclusion and exclusion".into(),
            ));
        }
        Ok(Projection::Include {
            fields: include,
            keep_id: !id_excluded,
        })
    }

    pub fn apply(&self, doc: &JsonValue) -> JsonValue {
        match self {
            Projection::Include { fields, keep_id } => {
                let mut out = JsonValue::Object(Map::new());
                if *keep_id {
                    if let Some(id) = doc.get(ID_FIELD) {
                        expression::set_field(&mut out, ID_FIELD, id.clone());
                    }
                }
                for field in fields {
                    if let Some(value) = lookup(doc, field) {
                        expression::set_field(&mut out, field, value.clone());
                    }
                }
                out
            }
            Projection::Exclude(fields) => {
                let mut out = doc.clone();
                for field in fields {
                    expression::remove_field(&mut out, field);
                }
                out
            }
        }
    }
}

fn lookup<'a>(data: &'a JsonValue, path: &str) -> Option<&'a JsonValue> {
    let mut current = data;
    for part in path.split('.') {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn matches(query: JsonValue, doc: JsonValue) -> bool {
        matches_value(&parse_query(&query).unwrap(), &doc)
    }

    fn student(marks: JsonValue) -> JsonValue {
        json!({"id": 1, "name": "A", "phone": "050-1234567", "marks": marks})
    }

    #[test]
    fn empty_query_matches_all() {
        assert!(matches(json!({}), json!({"x": 1})));
    }

    #[test]
    fn simple_eq_and_range() {
        let doc = json!({"id": 5, "age": 30});
        assert!(matches(json!({"id": 5}), doc.clone()));
        assert!(matches(json!({"age": {"$gte": 18, "$lt": 65}}), doc.clone()));
        assert!(!matches(json!({"age": {"$gt": 30}}), doc));
    }

    #[test]
    fn dotted_path_fans_out_over_arrays() {
        let doc = student(json!([
            {"subject": "math", "score": 90},
            {"subject": "art", "score": 40}
        ]));
        assert!(matches(json!({"marks.subject": "art"}), doc.clone()));
        assert!(!matches(json!({"marks.subject": "history"}), doc.clone()));
        assert!(matches(json!({"marks.0.score": 90}), doc));
    }

    #[test]
    fn range_bounds_may_match_different_elements() {
        let doc = student(json!([
            {"date": "2024-01-01"},
            {"date": "2024-12-31"}
        ]));
        // No single mark lies in March, but each bound is met by some mark
        assert!(matches(
            json!({"marks.date": {"$gte": "2024-03-01", "$lte": "2024-03-31"}}),
            doc
        ));
    }

    #[test]
    fn elem_match_requires_one_element_satisfying_all() {
        let doc = student(json!([
            {"subject": "math", "score": 50},
            {"subject": "art", "score": 95}
        ]));
        assert!(!matches(
            json!({"marks": {"$elemMatch": {"subject": "math", "score": {"$gte": 90}}}}),
            doc.clone()
        ));
        assert!(matches(
            json!({"marks": {"$elemMatch": {"subject": "art", "score": {"$gte": 90}}}}),
            doc
        ));
    }

    #[test]
    fn not_elem_match_is_vacuous_for_empty_marks() {
        let q = json!({"marks": {"$not": {"$elemMatch": {"score": {"$lte": 75}}}}});
        assert!(matches(q.clone(), student(json!([]))));
        assert!(matches(q.clone(), student(json!([{"score": 90}]))));
        assert!(!matches(q, student(json!([{"score": 90}, {"score": 70}]))));
    }

    #[test]
    fn regex_prefix_with_options() {
        let doc = json!({"phone": "050-1234567", "name": "Anna"});
        assert!(matches(json!({"phone": {"$regex": "^050"}}), doc.clone()));
        assert!(!matches(json!({"phone": {"$regex": "^1234"}}), doc.clone()));
        assert!(matches(json!({"name": {"$regex": "^an", "$options": "i"}}), doc));
    }

    #[test]
    fn expr_with_size() {
        let q = json!({"$expr": {"$lt": [{"$size": "$marks"}, 2]}});
        assert!(matches(q.clone(), student(json!([{"score": 1}]))));
        assert!(!matches(q, student(json!([{"score": 1}, {"score": 2}]))));
    }

    #[test]
    fn in_nin_exists_size() {
        let doc = student(json!([{"score": 1}]));
        assert!(matches(json!({"id": {"$in": [1, 2]}}), doc.clone()));
        assert!(matches(json!({"id": {"$nin": [3]}}), doc.clone()));
        assert!(matches(json!({"email": {"$exists": false}}), doc.clone()));
        assert!(matches(json!({"marks": {"$size": 1}}), doc));
    }

    #[test]
    fn range_ops_do_not_cross_types() {
        let doc = json!({"score": "high"});
        assert!(!matches(json!({"score": {"$gt": 5}}), doc.clone()));
        assert!(!matches(json!({"score": {"$lt": 5}}), doc));
    }

    #[test]
    fn logical_operators() {
        let doc = json!({"a": 1, "b": 2});
        assert!(matches(json!({"$or": [{"a": 5}, {"b": 2}]}), doc.clone()));
        assert!(!matches(json!({"$nor": [{"a": 1}]}), doc.clone()));
        assert!(matches(json!({"$and": [{"a": 1}, {"b": {"$ne": 3}}]}), doc));
    }

    #[test]
    fn eq_null_matches_missing() {
        assert!(matches(json!({"nickname": null}), json!({"id": 1})));
    }

    #[test]
    fn syntax_errors() {
        for bad in [
            json!([1, 2]),
            json!({"$where": "1"}),
            json!({"a": {"$bogus": 1}}),
            json!({"$and": []}),
            json!({"a": {"$regex": "("}}),
            json!({"a": {"$options": "i"}}),
            json!({"a": {"$not": 5}}),
        ] {
            assert!(
                matches!(parse_query(&bad), Err(Error::QuerySyntax(_))),
                "expected syntax error for {bad}"
            );
        }
    }

    #[test]
    fn inclusion_projection_keeps_id() {
        let doc = json!({"id": 1, "name": "A", "phone": "1", "marks": []});
        let p = Projection::parse(&json!({"name": 1, "phone": 1})).unwrap();
        assert_eq!(p.apply(&doc), json!({"id": 1, "name": "A", "phone": "1"}));
        let p = Projection::parse(&json!({"name": 1, "id": 0})).unwrap();
        assert_eq!(p.apply(&doc), json!({"name": "A"}));
    }

    #[test]
    fn exclusion_projection() {
        let doc = json!({"id": 1, "name": "A", "marks": []});
        let p = Projection::parse(&json!({"marks": 0})).unwrap();
        assert_eq!(p.apply(&doc), json!({"id": 1, "name": "A"}));
    }

    #[test]
    fn mixed_projection_rejected() {
        assert!(Projection::parse(&json!({"name": 1, "marks": 0})).is_err());
    }
}
