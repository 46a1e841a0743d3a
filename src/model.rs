use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

pub type StudentId = i64;

/// Name of the key field shared by every record and projection.
pub const ID_FIELD: &str = "id";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Student {
    pub id: StudentId,
    #[serde(default)]
    pub name: String,
    pub phone: String,
}

impl Student {
    pub fn new(id: StudentId, name: impl Into<String>, phone: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            phone: phone.into(),
        }
    }
}

/// A single scored evaluation of a student in a subject on a date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mark {
    pub subject: String,
    pub score: i64,
    pub date: NaiveDate,
}

impl Mark {
    pub fn new(subject: impl Into<String>, score: i64, date: NaiveDate) -> Self {
        Self {
            subject: subject.into(),
            score,
            date,
        }
    }
}

/// Persisted form of a student: the student fields plus its marks in
/// insertion order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudentRecord {
    pub id: StudentId,
    #[serde(default)]
    pub name: String,
    pub phone: String,
    #[serde(default)]
    pub marks: Vec<Mark>,
}

impl StudentRecord {
    pub fn of(student: Student) -> Self {
        Self {
            id: student.id,
            name: student.name,
            phone: student.phone,
            marks: Vec::new(),
        }
    }

    pub fn student(&self) -> Student {
        Student::new(self.id, self.name.clone(), self.phone.clone())
    }
}

// ---------------------------------------------------------------------------
// Projections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdName {
    pub id: StudentId,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdNameMarks {
    pub id: StudentId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub marks: Vec<Mark>,
}

/// The marks array of one student, as returned by a marks-only projection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubjectMark {
    #[serde(default)]
    pub marks: Vec<Mark>,
}

/// One range of the score distribution. `max` is exclusive except for the
/// last bucket, where it is the largest score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarksBucket {
    pub min: i64,
    pub max: i64,
    pub count: u64,
}
