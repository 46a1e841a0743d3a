use serde::de::DeserializeOwned;
use serde_json::{Map, Value, json};

use crate::error::{Error, Result};
use crate::model::{ID_FIELD, IdName, MarksBucket, StudentId, StudentRecord, SubjectMark};
use crate::pipeline::SortOrder;
use crate::store::Store;

// ---------------------------------------------------------------------------
// Typed stages
// ---------------------------------------------------------------------------

/// How `$group` forms its groups.
#[derive(Debug, Clone, PartialEq)]
pub enum GroupKey {
    /// One group over every incoming row.
    All,
    /// A compound key `{field: "$field", ...}` over the named fields.
    Fields(Vec<String>),
}

/// A per-group accumulator over a numeric field path.
#[derive(Debug, Clone, PartialEq)]
pub enum Accumulator {
    Sum(String),
    Avg(String),
}

/// One aggregation stage. Paths are plain dotted field paths; the `$`
/// prefix is added when rendering.
#[derive(Debug, Clone, PartialEq)]
pub enum Stage {
    /// A filter in the store's native syntax.
    Match(Value),
    Unwind {
        path: String,
        preserve_empty: bool,
    },
    Group {
        key: GroupKey,
        accumulators: Vec<(String, Accumulator)>,
    },
    Sort(Vec<(String, SortOrder)>),
    Limit(u64),
    Project {
        exclude: Vec<String>,
    },
    BucketAuto {
        group_by: String,
        buckets: u64,
    },
}

fn field_ref(path: &str) -> Value {
    Value::String(format!("${path}"))
}

impl Accumulator {
    fn to_native(&self) -> Value {
        match self {
            Accumulator::Sum(path) => json!({ "$sum": field_ref(path) }),
            Accumulator::Avg(path) => json!({ "$avg": field_ref(path) }),
        }
    }
}

impl Stage {
    /// Render the stage in the store's native pipeline syntax.
    pub fn to_native(&self) -> Value {
        match self {
            Stage::Match(filter) => json!({ "$match": filter }),
            Stage::Unwind {
                path,
                preserve_empty: false,
            } => json!({ "$unwind": field_ref(path) }),
            Stage::Unwind {
                path,
                preserve_empty: true,
            } => json!({
                "$unwind": {"path": field_ref(path), "preserveNullAndEmptyArrays": true}
            }),
            Stage::Group { key, accumulators } => {
                let mut body = Map::new();
                let id = match key {
                    GroupKey::All => Value::Null,
                    GroupKey::Fields(fields) => Value::Object(
                        fields
                            .iter()
                            .map(|f| (f.clone(), field_ref(f)))
                            .collect(),
                    ),
                };
                body.insert("_id".to_string(), id);
                for (name, acc) in accumulators {
                    body.insert(name.clone(), acc.to_native());
                }
                json!({ "$group": body })
            }
            Stage::Sort(fields) => {
                let body: Map<String, Value> = fields
                    .iter()
                    .map(|(f, order)| {
                        let dir = match order {
                            SortOrder::Asc => 1,
                            SortOrder::Desc => -1,
                        };
                        (f.clone(), json!(dir))
                    })
                    .collect();
                json!({ "$sort": body })
            }
            Stage::Limit(n) => json!({ "$limit": n }),
            Stage::Project { exclude } => {
                let body: Map<String, Value> =
                    exclude.iter().map(|f| (f.clone(), json!(0))).collect();
                json!({ "$project": body })
            }
            Stage::BucketAuto { group_by, buckets } => json!({
                "$bucketAuto": {"groupBy": field_ref(group_by), "buckets": buckets}
            }),
        }
    }
}

/// An ordered list of stages, built per query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Aggregation {
    stages: Vec<Stage>,
}

impl Aggregation {
    pub fn new(stages: Vec<Stage>) -> Self {
        Self { stages }
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn to_native(&self) -> Value {
        Value::Array(self.stages.iter().map(Stage::to_native).collect())
    }

    /// Execute through `store` and return the raw result rows.
    pub fn run<S: Store + ?Sized>(&self, store: &S) -> Result<Vec<Value>> {
        store.aggregate(&self.to_native())
    }
}

// ---------------------------------------------------------------------------
// Decoding result rows
// ---------------------------------------------------------------------------

fn from_row<T: DeserializeOwned>(value: &Value, what: &str) -> Result<T> {
    serde_json::from_value(value.clone())
        .map_err(|e| Error::Decode(format!("{what}: {e} in {value}")))
}

fn group_id(row: &Value) -> Result<&Value> {
    row.get("_id")
        .ok_or_else(|| Error::Decode(format!("row without _id: {row}")))
}

/// `{_id: {id, name}, ...}` to `IdName`.
pub fn decode_id_name(row: &Value) -> Result<IdName> {
    from_row(group_id(row)?, "IdName")
}

/// `{_id: {id, ...}, ...}` to the student id.
pub fn decode_id(row: &Value) -> Result<StudentId> {
    group_id(row)?
        .get(ID_FIELD)
        .and_then(Value::as_i64)
        .ok_or_else(|| Error::Decode(format!("row without integer _id.{ID_FIELD}: {row}")))
}

/// `{_id: null, <field>: number|null}` to the average, `None` when the
/// group had nothing to average.
pub fn decode_average(row: &Value, field: &str) -> Result<Option<f64>> {
    match row.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_f64()
            .map(Some)
            .ok_or_else(|| Error::Decode(format!("non-numeric {field}: {row}"))),
    }
}

/// `{_id: {min, max}, count}` to `MarksBucket`.
pub fn decode_marks_bucket(row: &Value) -> Result<MarksBucket> {
    let id = group_id(row)?;
    let bound = |name: &str| {
        id.get(name)
            .and_then(Value::as_i64)
            .ok_or_else(|| Error::Decode(format!("bucket without integer {name}: {row}")))
    };
    let count = row
        .get("count")
        .and_then(Value::as_u64)
        .ok_or_else(|| Error::Decode(format!("bucket without count: {row}")))?;
    Ok(MarksBucket {
        min: bound("min")?,
        max: bound("max")?,
        count,
    })
}

pub fn decode_record(doc: &Value) -> Result<StudentRecord> {
    from_row(doc, "StudentRecord")
}

pub fn decode_subject_marks(doc: &Value) -> Result<SubjectMark> {
    from_row(doc, "SubjectMark")
}

pub fn decode_projection<T: DeserializeOwned>(doc: &Value) -> Result<T> {
    from_row(doc, std::any::type_name::<T>())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_native_pipeline() {
        let agg = Aggregation::new(vec![
            Stage::Unwind {
                path: "marks".into(),
                preserve_empty: false,
            },
            Stage::Group {
                key: GroupKey::Fields(vec!["id".into(), "name".into()]),
                accumulators: vec![("avgScore".into(), Accumulator::Avg("marks.score".into()))],
            },
            Stage::Match(json!({"avgScore": {"$gt": 80}})),
            Stage::Sort(vec![("avgScore".into(), SortOrder::Desc)]),
            Stage::Limit(3),
            Stage::Project {
                exclude: vec!["avgScore".into()],
            },
        ]);
        assert_eq!(
            agg.to_native(),
            json!([
                {"$unwind": "$marks"},
                {"$group": {"_id": {"id": "$id", "name": "$name"},
                            "avgScore": {"$avg": "$marks.score"}}},
                {"$match": {"avgScore": {"$gt": 80}}},
                {"$sort": {"avgScore": -1}},
                {"$limit": 3},
                {"$project": {"avgScore": 0}}
            ])
        );
    }

    #[test]
    fn renders_preserving_unwind_and_buckets() {
        let unwind = Stage::Unwind {
            path: "marks".into(),
            preserve_empty: true,
        };
        assert_eq!(
            unwind.to_native(),
            json!({"$unwind": {"path": "$marks", "preserveNullAndEmptyArrays": true}})
        );
        let buckets = Stage::BucketAuto {
            group_by: "marks.score".into(),
            buckets: 4,
        };
        assert_eq!(
            buckets.to_native(),
            json!({"$bucketAuto": {"groupBy": "$marks.score", "buckets": 4}})
        );
        let all = Stage::Group {
            key: GroupKey::All,
            accumulators: vec![("total".into(), Accumulator::Sum("marks.score".into()))],
        };
        assert_eq!(
            all.to_native(),
            json!({"$group": {"_id": null, "total": {"$sum": "$marks.score"}}})
        );
    }

    #[test]
    fn decodes_group_rows() {
        let row = json!({"_id": {"id": 7, "name": "Z"}});
        assert_eq!(
            decode_id_name(&row).unwrap(),
            IdName {
                id: 7,
                name: "Z".into()
            }
        );
        assert_eq!(decode_id(&row).unwrap(), 7);
        assert!(matches!(decode_id(&json!({"x": 1})), Err(Error::Decode(_))));
    }

    #[test]
    fn decodes_average() {
        let row = json!({"_id": null, "avgScore": 85});
        assert_eq!(decode_average(&row, "avgScore").unwrap(), Some(85.0));
        let row = json!({"_id": null, "avgScore": null});
        assert_eq!(decode_average(&row, "avgScore").unwrap(), None);
        let row = json!({"_id": null, "avgScore": "high"});
        assert!(decode_average(&row, "avgScore").is_err());
    }

    #[test]
    fn decodes_bucket() {
        let row = json!({"_id": {"min": 10, "max": 30}, "count": 2});
        assert_eq!(
            decode_marks_bucket(&row).unwrap(),
            MarksBucket {
                min: 10,
                max: 30,
                count: 2
            }
        );
        assert!(decode_marks_bucket(&json!({"_id": {"min": 1}, "count": 1})).is_err());
    }

    #[test]
    fn record_without_marks_decodes_empty() {
        let rec = decode_record(&json!({"id": 1, "name": "A", "phone": "1"})).unwrap();
        assert!(rec.marks.is_empty());
        assert!(matches!(
            decode_record(&json!({"id": "x"})),
            Err(Error::Decode(_))
        ));
    }
}
