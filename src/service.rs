use std::collections::HashMap;

use chrono::NaiveDate;
use log::{debug, trace, warn};
use serde_json::Value;

use crate::aggregation::{self, Aggregation};
use crate::config::StudentsConfig;
use crate::error::{Error, Result};
use crate::model::{
    IdName, IdNameMarks, Mark, MarksBucket, Student, StudentId, StudentRecord,
};
use crate::pipeline::SortOrder;
use crate::store::Store;
use crate::translate::{self, AVG_SCORE, Ranking};

/// Student records and the analytical queries over them.
///
/// Stateless apart from the store handle and read-only configuration, so a
/// single instance can be shared across threads.
pub struct StudentsService<S: Store> {
    store: S,
    config: StudentsConfig,
}

impl<S: Store> StudentsService<S> {
    pub fn new(store: S, config: StudentsConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &StudentsConfig {
        &self.config
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    pub fn add_student(&self, student: Student) -> Result<Student> {
        if self.store.exists(student.id)? {
            return Err(Error::Conflict(student.id));
        }
        let record = StudentRecord::of(student);
        self.store.insert(serde_json::to_value(&record)?)?;
        trace!("student {} has been saved", record.id);
        Ok(record.student())
    }

    pub fn add_mark(&self, id: StudentId, mark: Mark) -> Result<Mark> {
        let matched = self
            .store
            .update(&translate::by_id(id), &translate::push_mark(&mark)?)?;
        if matched == 0 {
            return Err(Error::NotFound(id));
        }
        trace!("mark {mark:?} added to student {id}");
        Ok(mark)
    }

    pub fn get_student(&self, id: StudentId) -> Result<Student> {
        let doc = self
            .store
            .find_one(&translate::by_id(id), None)?
            .ok_or(Error::NotFound(id))?;
        Ok(aggregation::decode_record(&doc)?.student())
    }

    // -----------------------------------------------------------------------
    // Point queries
    // -----------------------------------------------------------------------

    fn student_marks(&self, filter: &Value) -> Result<Vec<Mark>> {
        match self.store.find_one(filter, Some(&translate::marks_only()))? {
            Some(doc) => Ok(aggregation::decode_subject_marks(&doc)?.marks),
            None => Ok(Vec::new()),
        }
    }

    pub fn get_marks_student_subject(&self, id: StudentId, subject: &str) -> Result<Vec<Mark>> {
        let marks = self.student_marks(&translate::marks_with_subject(id, subject))?;
        Ok(marks.into_iter().filter(|m| m.subject == subject).collect())
    }

    /// Marks dated within `[from, to]`, both ends inclusive.
    pub fn get_marks_student_dates(
        &self,
        id: StudentId,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<Mark>> {
        let marks = self.student_marks(&translate::marks_between(id, from, to))?;
        Ok(marks
            .into_iter()
            .filter(|m| from <= m.date && m.date <= to)
            .collect())
    }

    pub fn get_students_phone_prefix(&self, prefix: &str) -> Result<Vec<Student>> {
        self.find_as(&translate::phone_prefix(prefix), &translate::name_phone())
    }

    // -----------------------------------------------------------------------
    // "All marks" queries
    // -----------------------------------------------------------------------

    pub fn get_students_all_scores_greater(&self, score: i64) -> Result<Vec<IdName>> {
        self.find_as(&translate::all_scores_greater(score), &translate::id_name())
    }

    pub fn get_students_scores_subject_greater(
        &self,
        score: i64,
        subject: &str,
    ) -> Result<Vec<IdName>> {
        self.find_as(
            &translate::subject_scores_greater(score, subject),
            &translate::id_name(),
        )
    }

    // -----------------------------------------------------------------------
    // Bulk deletion
    // -----------------------------------------------------------------------

    /// Delete students with fewer than `n_marks` marks and return their ids.
    pub fn remove_students_with_few_marks(&self, n_marks: usize) -> Result<Vec<StudentId>> {
        let ids = self.delete_ids(&translate::fewer_marks_than(n_marks))?;
        debug!("removed {} students with less than {n_marks} marks", ids.len());
        Ok(ids)
    }

    /// Delete students having no mark at or below `score` and return their
    /// ids. Students without marks are deleted too.
    pub fn remove_students_no_low_marks(&self, score: i64) -> Result<Vec<StudentId>> {
        let ids = self.delete_ids(&translate::no_marks_at_most(score))?;
        debug!("removed {} students with no marks at or below {score}", ids.len());
        Ok(ids)
    }

    fn delete_ids(&self, filter: &Value) -> Result<Vec<StudentId>> {
        self.store
            .find_and_delete(filter)?
            .iter()
            .map(|doc| aggregation::decode_record(doc).map(|r| r.id))
            .collect()
    }

    // -----------------------------------------------------------------------
    // Analytics
    // -----------------------------------------------------------------------

    /// Mean of every mark of every student, `None` when there are no marks.
    pub fn get_students_avg_score(&self) -> Result<Option<f64>> {
        let rows = translate::average_score().run(&self.store)?;
        match rows.first() {
            Some(row) => aggregation::decode_average(row, AVG_SCORE),
            None => Ok(None),
        }
    }

    pub fn get_good_students(&self) -> Result<Vec<IdName>> {
        debug!("good mark threshold is {}", self.config.good_mark);
        self.get_students_avg_mark_greater(self.config.good_mark)
    }

    /// Students whose mean score is above `threshold`, best first.
    pub fn get_students_avg_mark_greater(&self, threshold: i64) -> Result<Vec<IdName>> {
        translate::average_greater(threshold)
            .run(&self.store)?
            .iter()
            .map(aggregation::decode_id_name)
            .collect()
    }

    /// Escape hatch for ad-hoc filters in the store's native JSON syntax.
    pub fn find_students(&self, raw_filter: &str) -> Result<Vec<IdNameMarks>> {
        let filter: Value = serde_json::from_str(raw_filter)
            .map_err(|e| Error::QuerySyntax(format!("malformed filter: {e}")))?;
        self.find_as(&filter, &translate::id_name_marks())
    }

    pub fn get_best_students(&self, n: u64) -> Result<Vec<IdNameMarks>> {
        self.ranked(Ranking {
            order: SortOrder::Desc,
            limit: n,
            subject: None,
            keep_unmarked: false,
        })
    }

    /// Students with the lowest totals first. Students without marks count
    /// as a total of zero.
    pub fn get_worst_students(&self, n: u64) -> Result<Vec<IdNameMarks>> {
        self.ranked(Ranking {
            order: SortOrder::Asc,
            limit: n,
            subject: None,
            keep_unmarked: true,
        })
    }

    /// Best totals counting only marks in `subject`. The returned records
    /// carry all of the student's marks.
    pub fn get_best_students_subject(&self, n: u64, subject: &str) -> Result<Vec<IdNameMarks>> {
        self.ranked(Ranking {
            order: SortOrder::Desc,
            limit: n,
            subject: Some(subject),
            keep_unmarked: false,
        })
    }

    /// Score ranges in ascending order. Fails with `InvalidArgument` when
    /// `n_buckets` is zero; may return fewer buckets than asked for.
    pub fn scores_distribution(&self, n_buckets: u64) -> Result<Vec<MarksBucket>> {
        if n_buckets == 0 {
            return Err(Error::InvalidArgument(
                "number of buckets must be positive".into(),
            ));
        }
        let buckets = translate::score_buckets(n_buckets)
            .run(&self.store)?
            .iter()
            .map(aggregation::decode_marks_bucket)
            .collect::<Result<Vec<_>>>()?;
        debug!("scores distribution: {buckets:?}");
        Ok(buckets)
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn find_as<T: serde::de::DeserializeOwned>(
        &self,
        filter: &Value,
        projection: &Value,
    ) -> Result<Vec<T>> {
        self.store
            .find(filter, Some(projection))?
            .iter()
            .map(aggregation::decode_projection)
            .collect()
    }

    /// Rank by total, then fetch full records for the ranked ids and put
    /// them back in rank order. Ids deleted in between are skipped.
    fn ranked(&self, ranking: Ranking<'_>) -> Result<Vec<IdNameMarks>> {
        let ranked_ids = self.rank_ids(&translate::ranked_by_total(ranking))?;
        if ranked_ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut by_id: HashMap<StudentId, IdNameMarks> = self
            .find_as::<IdNameMarks>(&translate::ids_in(&ranked_ids), &translate::id_name_marks())?
            .into_iter()
            .map(|s| (s.id, s))
            .collect();

        let mut result = Vec::with_capacity(ranked_ids.len());
        for id in ranked_ids {
            match by_id.remove(&id) {
                Some(student) => result.push(student),
                None => warn!("student {id} disappeared between ranking and lookup"),
            }
        }
        Ok(result)
    }

    fn rank_ids(&self, agg: &Aggregation) -> Result<Vec<StudentId>> {
        agg.run(&self.store)?
            .iter()
            .map(aggregation::decode_id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn service() -> StudentsService<MemoryStore> {
        StudentsService::new(MemoryStore::new(), StudentsConfig::default())
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn add_student_then_conflict() {
        let svc = service();
        let s = Student::new(1, "A", "050");
        assert_eq!(svc.add_student(s.clone()).unwrap(), s);
        assert!(matches!(svc.add_student(s), Err(Error::Conflict(1))));
    }

    #[test]
    fn add_mark_to_missing_student() {
        let svc = service();
        let err = svc
            .add_mark(9, Mark::new("math", 90, date(2024, 1, 1)))
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(9)));
        assert!(matches!(svc.get_student(9), Err(Error::NotFound(9))));
    }

    #[test]
    fn subject_marks_are_refiltered() {
        let svc = service();
        svc.add_student(Student::new(1, "A", "050")).unwrap();
        let math = Mark::new("math", 90, date(2024, 1, 1));
        svc.add_mark(1, math.clone()).unwrap();
        svc.add_mark(1, Mark::new("art", 60, date(2024, 1, 2)))
            .unwrap();
        assert_eq!(svc.get_marks_student_subject(1, "math").unwrap(), vec![math]);
        assert!(svc.get_marks_student_subject(1, "bio").unwrap().is_empty());
        assert!(svc.get_marks_student_subject(2, "math").unwrap().is_empty());
    }

    #[test]
    fn unavailable_store_surfaces_unchanged() {
        let svc = service();
        svc.store().poison();
        let err = svc.add_student(Student::new(1, "A", "050")).unwrap_err();
        assert!(matches!(err, Error::StoreUnavailable(_)));
        assert!(matches!(
            svc.get_students_avg_score(),
            Err(Error::StoreUnavailable(_))
        ));
    }

    #[test]
    fn zero_buckets_is_rejected() {
        let svc = service();
        svc.add_student(Student::new(1, "A", "050")).unwrap();
        svc.add_mark(1, Mark::new("math", 70, date(2024, 1, 1)))
            .unwrap();
        assert!(matches!(
            svc.scores_distribution(0),
            Err(Error::InvalidArgument(_))
        ));
        assert_eq!(svc.scores_distribution(1).unwrap().len(), 1);
    }

    #[test]
    fn average_of_nothing_is_none() {
        let svc = service();
        assert_eq!(svc.get_students_avg_score().unwrap(), None);
        svc.add_student(Student::new(1, "A", "050")).unwrap();
        assert_eq!(svc.get_students_avg_score().unwrap(), None);
    }

    #[test]
    fn good_students_use_configured_threshold() {
        let svc = StudentsService::new(MemoryStore::new(), StudentsConfig { good_mark: 60 });
        svc.add_student(Student::new(1, "A", "050")).unwrap();
        svc.add_mark(1, Mark::new("math", 70, date(2024, 1, 1)))
            .unwrap();
        assert_eq!(
            svc.get_good_students().unwrap(),
            vec![IdName {
                id: 1,
                name: "A".into()
            }]
        );
        assert!(service().get_good_students().unwrap().is_empty());
    }
}
