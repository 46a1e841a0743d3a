//! Builders mapping each business question to a native filter, projection
//! or typed aggregation.

use chrono::NaiveDate;
use serde_json::{Value, json};

use crate::aggregation::{Accumulator, Aggregation, GroupKey, Stage};
use crate::error::Result;
use crate::model::{ID_FIELD, Mark, StudentId};
use crate::pipeline::SortOrder;

pub const MARKS: &str = "marks";
pub const AVG_SCORE: &str = "avgScore";
pub const SUM_SCORE: &str = "sumScore";

const SCORE_PATH: &str = "marks.score";
const DATE_FORMAT: &str = "%Y-%m-%d";

fn day(date: NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

// ---------------------------------------------------------------------------
// Filters and projections
// ---------------------------------------------------------------------------

pub fn by_id(id: StudentId) -> Value {
    json!({ ID_FIELD: id })
}

pub fn ids_in(ids: &[StudentId]) -> Value {
    json!({ ID_FIELD: { "$in": ids } })
}

pub fn push_mark(mark: &Mark) -> Result<Value> {
    Ok(json!({ "$push": { MARKS: serde_json::to_value(mark)? } }))
}

/// Matches the student when any mark has `subject`. The whole marks array
/// comes back, so callers re-filter.
pub fn marks_with_subject(id: StudentId, subject: &str) -> Value {
    json!({ ID_FIELD: id, "marks.subject": subject })
}

/// Matches the student when some mark is on or after `from` and some mark
/// (possibly another one) is on or before `to`. Callers re-filter.
pub fn marks_between(id: StudentId, from: NaiveDate, to: NaiveDate) -> Value {
    json!({
        ID_FIELD: id,
        "marks.date": { "$gte": day(from), "$lte": day(to) }
    })
}

pub fn phone_prefix(prefix: &str) -> Value {
    json!({ "phone": { "$regex": format!("^{}", regex::escape(prefix)) } })
}

/// Some mark above `score` and none at or below it.
pub fn all_scores_greater(score: i64) -> Value {
    json!({
        "$and": [
            { MARKS: { "$elemMatch": { "score": { "$gt": score } } } },
            { MARKS: { "$not": { "$elemMatch": { "score": { "$lte": score } } } } }
        ]
    })
}

/// Some `subject` mark at or above `score` and no `subject` mark at or
/// below it. A mark exactly at `score` therefore excludes the student.
pub fn subject_scores_greater(score: i64, subject: &str) -> Value {
    json!({
        "$and": [
            { MARKS: { "$elemMatch": {
                "subject": { "$eq": subject },
                "score": { "$gte": score }
            } } },
            { MARKS: { "$not": { "$elemMatch": {
                "score": { "$lte": score },
                "subject": { "$eq": subject }
            } } } }
        ]
    })
}

pub fn fewer_marks_than(n_marks: usize) -> Value {
    json!({ "$expr": { "$lt": [ { "$size": "$marks" }, n_marks ] } })
}

/// No mark at or below `score`; students without marks match too.
pub fn no_marks_at_most(score: i64) -> Value {
    json!({ MARKS: { "$not": { "$elemMatch": { "score": { "$lte": score } } } } })
}

pub fn marks_only() -> Value {
    json!({ MARKS: 1 })
}

pub fn name_phone() -> Value {
    json!({ "name": 1, "phone": 1 })
}

pub fn id_name() -> Value {
    json!({ "name": 1 })
}

pub fn id_name_marks() -> Value {
    json!({ "name": 1, MARKS: 1 })
}

// ---------------------------------------------------------------------------
// Aggregations
// ---------------------------------------------------------------------------

fn unwind_marks(preserve_empty: bool) -> Stage {
    Stage::Unwind {
        path: MARKS.to_string(),
        preserve_empty,
    }
}

fn group_by_student(field: &str, acc: Accumulator) -> Stage {
    Stage::Group {
        key: GroupKey::Fields(vec![ID_FIELD.to_string(), "name".to_string()]),
        accumulators: vec![(field.to_string(), acc)],
    }
}

/// One row `{_id: null, avgScore}` over every mark of every student.
pub fn average_score() -> Aggregation {
    Aggregation::new(vec![
        unwind_marks(false),
        Stage::Group {
            key: GroupKey::All,
            accumulators: vec![(
                AVG_SCORE.to_string(),
                Accumulator::Avg(SCORE_PATH.to_string()),
            )],
        },
    ])
}

/// `{_id: {id, name}}` rows for students averaging above `threshold`,
/// highest average first.
pub fn average_greater(threshold: i64) -> Aggregation {
    Aggregation::new(vec![
        unwind_marks(false),
        group_by_student(AVG_SCORE, Accumulator::Avg(SCORE_PATH.to_string())),
        Stage::Match(json!({ AVG_SCORE: { "$gt": threshold } })),
        Stage::Sort(vec![(AVG_SCORE.to_string(), SortOrder::Desc)]),
        Stage::Project {
            exclude: vec![AVG_SCORE.to_string()],
        },
    ])
}

/// How a ranking by total score is formed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ranking<'a> {
    pub order: SortOrder,
    pub limit: u64,
    /// Only marks of this subject count towards the total.
    pub subject: Option<&'a str>,
    /// Students without marks rank with a total of zero.
    pub keep_unmarked: bool,
}

/// `{_id: {id, name}}` rows for the first `limit` students by total score.
pub fn ranked_by_total(ranking: Ranking<'_>) -> Aggregation {
    let mut stages = vec![unwind_marks(ranking.keep_unmarked)];
    if let Some(subject) = ranking.subject {
        stages.push(Stage::Match(json!({ "marks.subject": subject })));
    }
    stages.extend([
        group_by_student(SUM_SCORE, Accumulator::Sum(SCORE_PATH.to_string())),
        Stage::Sort(vec![(SUM_SCORE.to_string(), ranking.order)]),
        Stage::Limit(ranking.limit),
        Stage::Project {
            exclude: vec![SUM_SCORE.to_string()],
        },
    ]);
    Aggregation::new(stages)
}

/// `{_id: {min, max}, count}` rows over all mark scores.
pub fn score_buckets(n_buckets: u64) -> Aggregation {
    Aggregation::new(vec![
        unwind_marks(false),
        Stage::BucketAuto {
            group_by: SCORE_PATH.to_string(),
            buckets: n_buckets,
        },
    ])
}
