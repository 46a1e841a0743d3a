use std::collections::HashMap;

use serde_json::{Map, Value, json};

use crate::error::{Error, Result};
use crate::expression::{Expression, number_to_value, resolve_field, set_field};
use crate::query::{self, Query};
use crate::value::OrderedValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

// ---------------------------------------------------------------------------
// Group key and accumulators
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum GroupKey {
    Null,
    Compound(Vec<(String, Expression)>),
}

#[derive(Debug, Clone)]
enum Accumulator {
    Sum(Expression),
    Avg(Expression),
}

enum AccumulatorState {
    Sum(f64),
    Avg { sum: f64, count: u64 },
}

impl Accumulator {
    fn initial(&self) -> AccumulatorState {
        match self {
            Accumulator::Sum(_) => AccumulatorState::Sum(0.0),
            Accumulator::Avg(_) => AccumulatorState::Avg { sum: 0.0, count: 0 },
        }
    }
}

impl AccumulatorState {
    fn fold(&mut self, acc: &Accumulator, doc: &Value) {
        match (acc, self) {
            (Accumulator::Sum(expr), AccumulatorState::Sum(s)) => {
                if let Some(n) = expr.eval(doc).as_f64() {
                    *s += n;
                }
            }
            (Accumulator::Avg(expr), AccumulatorState::Avg { sum, count }) => {
                if let Some(n) = expr.eval(doc).as_f64() {
                    *sum += n;
                    *count += 1;
                }
            }
            _ => {}
        }
    }

    fn finish(self) -> Value {
        match self {
            AccumulatorState::Sum(s) => number_to_value(s),
            AccumulatorState::Avg { count: 0, .. } => Value::Null,
            AccumulatorState::Avg { sum, count } => number_to_value(sum / count as f64),
        }
    }
}

#[derive(Debug, Clone)]
enum ProjectionField {
    Include,
    Exclude,
    Compute(Expression),
}

// ---------------------------------------------------------------------------
// Pipeline stages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Stage {
    Match(Query),
    Group {
        key: GroupKey,
        accumulators: Vec<(String, Accumulator)>,
    },
    Sort(Vec<(String, SortOrder)>),
    Limit(u64),
    Project(Vec<(String, ProjectionField)>),
    Unwind {
        path: String,
        preserve_empty: bool,
    },
    BucketAuto {
        group_by: Expression,
        buckets: usize,
    },
}

/// A parsed native aggregation pipeline, ready to run over a batch of
/// documents.
#[derive(Debug, Clone)]
pub struct Pipeline {
    stages: Vec<Stage>,
}

// ---------------------------------------------------------------------------
// Stage parsing helpers
// ---------------------------------------------------------------------------

fn single_entry<'a>(obj: &'a Map<String, Value>, what: &str) -> Result<(&'a String, &'a Value)> {
    match (obj.len(), obj.iter().next()) {
        (1, Some(entry)) => Ok(entry),
        _ => Err(Error::InvalidPipeline(format!(
            "{what} must have exactly one key"
        ))),
    }
}

fn parse_accumulator(val: &Value) -> Result<Accumulator> {
    let obj = val
        .as_object()
        .ok_or_else(|| Error::InvalidPipeline("accumulator must be an object".into()))?;
    let (op, arg) = single_entry(obj, "accumulator")?;
    match op.as_str() {
        "$sum" => Ok(Accumulator::Sum(Expression::parse(arg)?)),
        "$avg" => Ok(Accumulator::Avg(Expression::parse(arg)?)),
        _ => Err(Error::InvalidPipeline(format!("unknown accumulator: {op}"))),
    }
}

fn parse_group_stage(val: &Value) -> Result<Stage> {
    let obj = val
        .as_object()
        .ok_or_else(|| Error::InvalidPipeline("$group must be an object".into()))?;

    let id_val = obj
        .get("_id")
        .ok_or_else(|| Error::InvalidPipeline("$group requires '_id' field".into()))?;

    let key = match id_val {
        Value::Null => GroupKey::Null,
        Value::Object(map) if !map.keys().any(|k| k.starts_with('$')) => {
            let fields: Result<Vec<_>> = map
                .iter()
                .map(|(k, v)| Ok((k.clone(), Expression::parse(v)?)))
                .collect();
            GroupKey::Compound(fields?)
        }
        _ => {
            return Err(Error::InvalidPipeline(
                "$group '_id' must be null or an object of field expressions".into(),
            ));
        }
    };

    let mut accumulators = Vec::new();
    for (name, spec) in obj {
        if name == "_id" {
            continue;
        }
        accumulators.push((name.clone(), parse_accumulator(spec)?));
    }

    Ok(Stage::Group { key, accumulators })
}

fn parse_sort(val: &Value) -> Result<Vec<(String, SortOrder)>> {
    let obj = val
        .as_object()
        .filter(|m| !m.is_empty())
        .ok_or_else(|| Error::InvalidPipeline("$sort must be a non-empty object".into()))?;
    let mut fields = Vec::new();
    for (field, dir) in obj {
        let order = match dir.as_i64() {
            Some(1) => SortOrder::Asc,
            Some(-1) => SortOrder::Desc,
            _ => {
                return Err(Error::InvalidPipeline(
                    "sort direction must be 1 or -1".into(),
                ));
            }
        };
        fields.push((field.clone(), order));
    }
    Ok(fields)
}

fn parse_project(val: &Value) -> Result<Vec<(String, ProjectionField)>> {
    let obj = val
        .as_object()
        .ok_or_else(|| Error::InvalidPipeline("$project must be an object".into()))?;
    let mut fields = Vec::new();
    for (field, spec) in obj {
        let pf = match spec {
            Value::Number(n) if n.as_i64() == Some(1) => ProjectionField::Include,
            Value::Number(n) if n.as_i64() == Some(0) => ProjectionField::Exclude,
            Value::Bool(true) => ProjectionField::Include,
            Value::Bool(false) => ProjectionField::Exclude,
            _ => ProjectionField::Compute(Expression::parse(spec)?),
        };
        fields.push((field.clone(), pf));
    }
    Ok(fields)
}

fn field_path(s: &str, stage: &str) -> Result<String> {
    s.strip_prefix('$')
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .ok_or_else(|| Error::InvalidPipeline(format!("{stage} path must start with $")))
}

fn parse_unwind(val: &Value) -> Result<(String, bool)> {
    match val {
        Value::String(s) => Ok((field_path(s, "$unwind")?, false)),
        Value::Object(obj) => {
            let path = obj
                .get("path")
                .and_then(|v| v.as_str())
                .ok_or_else(|| Error::InvalidPipeline("$unwind requires 'path' string".into()))?;
            let preserve = obj
                .get("preserveNullAndEmptyArrays")
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            Ok((field_path(path, "$unwind")?, preserve))
        }
        _ => Err(Error::InvalidPipeline(
            "$unwind must be a string or object".into(),
        )),
    }
}

fn parse_bucket_auto(val: &Value) -> Result<Stage> {
    let obj = val
        .as_object()
        .ok_or_else(|| Error::InvalidPipeline("$bucketAuto must be an object".into()))?;
    if let Some(other) = obj.keys().find(|k| !matches!(k.as_str(), "groupBy" | "buckets")) {
        return Err(Error::InvalidPipeline(format!(
            "$bucketAuto option '{other}' is not supported"
        )));
    }
    let group_by = obj
        .get("groupBy")
        .ok_or_else(|| Error::InvalidPipeline("$bucketAuto requires 'groupBy'".into()))?;
    let buckets = obj
        .get("buckets")
        .and_then(|v| v.as_u64())
        .filter(|n| *n > 0)
        .ok_or_else(|| {
            Error::InvalidPipeline("$bucketAuto 'buckets' must be a positive integer".into())
        })?;
    Ok(Stage::BucketAuto {
        group_by: Expression::parse(group_by)?,
        buckets: buckets as usize,
    })
}

// ---------------------------------------------------------------------------
// Stage execution
// ---------------------------------------------------------------------------

fn exec_match(docs: Vec<Value>, query: &Query) -> Vec<Value> {
    docs.into_iter()
        .filter(|doc| query::matches_value(query, doc))
        .collect()
}

fn exec_group(docs: Vec<Value>, key: &GroupKey, accumulators: &[(String, Accumulator)]) -> Vec<Value> {
    let mut groups: HashMap<String, (Value, Vec<AccumulatorState>)> = HashMap::new();
    let mut insertion_order: Vec<String> = Vec::new();

    for doc in &docs {
        let key_val = match key {
            GroupKey::Null => Value::Null,
            GroupKey::Compound(fields) => {
                let mut map = Map::new();
                for (name, expr) in fields {
                    map.insert(name.clone(), expr.eval(doc));
                }
                Value::Object(map)
            }
        };

        let key_str = key_val.to_string();
        let (_, states) = groups.entry(key_str.clone()).or_insert_with(|| {
            insertion_order.push(key_str);
            let initial = accumulators.iter().map(|(_, acc)| acc.initial()).collect();
            (key_val, initial)
        });

        for ((_, acc), state) in accumulators.iter().zip(states.iter_mut()) {
            state.fold(acc, doc);
        }
    }

    let mut results = Vec::with_capacity(insertion_order.len());
    for key_str in &insertion_order {
        let Some((key_val, states)) = groups.remove(key_str) else {
            continue;
        };
        let mut doc = Map::new();
        doc.insert("_id".to_string(), key_val);
        for ((name, _), state) in accumulators.iter().zip(states) {
            doc.insert(name.clone(), state.finish());
        }
        results.push(Value::Object(doc));
    }
    results
}

fn exec_sort(mut docs: Vec<Value>, sort_fields: &[(String, SortOrder)]) -> Vec<Value> {
    // Stable: ties keep their incoming order
    docs.sort_by(|a, b| {
        for (field, order) in sort_fields {
            let av = OrderedValue::from_json(&resolve_field(a, field));
            let bv = OrderedValue::from_json(&resolve_field(b, field));
            let cmp = match order {
                SortOrder::Asc => av.cmp(&bv),
                SortOrder::Desc => bv.cmp(&av),
            };
            if cmp != std::cmp::Ordering::Equal {
                return cmp;
            }
        }
        std::cmp::Ordering::Equal
    });
    docs
}

fn exec_project(docs: Vec<Value>, fields: &[(String, ProjectionField)]) -> Vec<Value> {
    let inclusion_mode = fields.iter().any(|(name, pf)| {
        matches!(pf, ProjectionField::Compute(_))
            || (name != "_id" && matches!(pf, ProjectionField::Include))
    });

    docs.into_iter()
        .map(|doc| {
            if !inclusion_mode {
                let mut result = doc;
                if let Value::Object(map) = &mut result {
                    for (name, _) in fields {
                        map.remove(name.as_str());
                    }
                }
                return result;
            }

            let mut result = Map::new();
            let id_excluded = fields
                .iter()
                .any(|(name, pf)| name == "_id" && matches!(pf, ProjectionField::Exclude));
            if !id_excluded {
                if let Some(id_val) = doc.get("_id") {
                    result.insert("_id".to_string(), id_val.clone());
                }
            }
            for (name, pf) in fields {
                match pf {
                    ProjectionField::Include => {
                        if let Some(val) = doc.get(name.as_str()) {
                            result.insert(name.clone(), val.clone());
                        }
                    }
                    ProjectionField::Compute(expr) => {
                        result.insert(name.clone(), expr.eval(&doc));
                    }
                    ProjectionField::Exclude => {}
                }
            }
            Value::Object(result)
        })
        .collect()
}

fn exec_unwind(docs: Vec<Value>, path: &str, preserve_empty: bool) -> Vec<Value> {
    let mut result = Vec::new();
    for doc in docs {
        match resolve_field(&doc, path) {
            Value::Array(arr) if arr.is_empty() => {
                if preserve_empty {
                    result.push(doc);
                }
            }
            Value::Array(arr) => {
                for item in arr {
                    let mut new_doc = doc.clone();
                    set_field(&mut new_doc, path, item);
                    result.push(new_doc);
                }
            }
            Value::Null => {
                if preserve_empty {
                    result.push(doc);
                }
            }
            // Non-array, non-null: pass through unchanged
            _ => result.push(doc),
        }
    }
    result
}

/// Distribute the `group_by` values into at most `buckets` ranges holding
/// roughly equal numbers of values. Equal values never straddle a boundary;
/// whatever is left when the last bucket opens goes into it. Each bucket's
/// `max` is the next bucket's `min`, and the last bucket's `max` is its
/// largest value.
fn exec_bucket_auto(docs: Vec<Value>, group_by: &Expression, buckets: usize) -> Vec<Value> {
    let mut values: Vec<(OrderedValue, Value)> = docs
        .iter()
        .map(|doc| {
            let v = group_by.eval(doc);
            (OrderedValue::from_json(&v), v)
        })
        .collect();
    values.sort_by(|a, b| a.0.cmp(&b.0));

    let total = values.len();
    if total == 0 {
        return Vec::new();
    }
    let approx = ((total as f64 / buckets as f64).round() as usize).max(1);

    // (first index, one past last index) per bucket
    let mut ranges: Vec<(usize, usize)> = Vec::new();
    let mut start = 0;
    while start < total {
        let end = if ranges.len() + 1 == buckets {
            total
        } else {
            let mut end = (start + approx).min(total);
            while end < total && values[end].0 == values[end - 1].0 {
                end += 1;
            }
            end
        };
        ranges.push((start, end));
        start = end;
    }

    ranges
        .iter()
        .enumerate()
        .map(|(i, &(start, end))| {
            let max = match ranges.get(i + 1) {
                Some(&(next_start, _)) => values[next_start].1.clone(),
                None => values[end - 1].1.clone(),
            };
            json!({
                "_id": {"min": values[start].1.clone(), "max": max},
                "count": end - start,
            })
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Pipeline parsing & execution
// ---------------------------------------------------------------------------

impl Pipeline {
    pub fn parse(pipeline_json: &Value) -> Result<Self> {
        let arr = pipeline_json
            .as_array()
            .ok_or_else(|| Error::InvalidPipeline("pipeline must be an array".into()))?;

        let mut stages = Vec::with_capacity(arr.len());
        for stage_val in arr {
            let obj = stage_val.as_object().ok_or_else(|| {
                Error::InvalidPipeline("each pipeline stage must be an object".into())
            })?;
            let (stage_name, stage_body) = single_entry(obj, "pipeline stage")?;

            let stage = match stage_name.as_str() {
                "$match" => Stage::Match(query::parse_query(stage_body)?),
                "$group" => parse_group_stage(stage_body)?,
                "$sort" => Stage::Sort(parse_sort(stage_body)?),
                "$limit" => Stage::Limit(stage_body.as_u64().ok_or_else(|| {
                    Error::InvalidPipeline("$limit must be a non-negative integer".into())
                })?),
                "$project" => Stage::Project(parse_project(stage_body)?),
                "$unwind" => {
                    let (path, preserve_empty) = parse_unwind(stage_body)?;
                    Stage::Unwind {
                        path,
                        preserve_empty,
                    }
                }
                "$bucketAuto" => parse_bucket_auto(stage_body)?,
                _ => {
                    return Err(Error::InvalidPipeline(format!(
                        "unknown stage: {stage_name}"
                    )));
                }
            };
            stages.push(stage);
        }

        Ok(Pipeline { stages })
    }

    /// If the first stage is `$match`, return its query and the index to
    /// start execution from (1). Otherwise return (None, 0).
    pub fn take_leading_match(&self) -> (Option<&Query>, usize) {
        if let Some(Stage::Match(query)) = self.stages.first() {
            (Some(query), 1)
        } else {
            (None, 0)
        }
    }

    /// Execute pipeline stages starting from `start` index.
    pub fn execute_from(&self, start: usize, docs: Vec<Value>) -> Vec<Value> {
        let mut current = docs;
        for stage in self.stages.iter().skip(start) {
            current = match stage {
                Stage::Match(query) => exec_match(current, query),
                Stage::Group { key, accumulators } => exec_group(current, key, accumulators),
                Stage::Sort(fields) => exec_sort(current, fields),
                Stage::Limit(n) => current.into_iter().take(*n as usize).collect(),
                Stage::Project(fields) => exec_project(current, fields),
                Stage::Unwind {
                    path,
                    preserve_empty,
                } => exec_unwind(current, path, *preserve_empty),
                Stage::BucketAuto { group_by, buckets } => {
                    exec_bucket_auto(current, group_by, *buckets)
                }
            };
        }
        current
    }

    pub fn execute(&self, docs: Vec<Value>) -> Vec<Value> {
        self.execute_from(0, docs)
    }
}
