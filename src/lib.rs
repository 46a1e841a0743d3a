pub mod aggregation;
pub mod config;
pub mod error;
pub mod expression;
pub mod model;
pub mod pipeline;
pub mod query;
pub mod service;
pub mod store;
pub mod translate;
pub mod update;
pub mod value;

pub use config::StudentsConfig;
pub use error::{Error, Result};
pub use model::{IdName, IdNameMarks, Mark, MarksBucket, Student, StudentId, StudentRecord, SubjectMark};
pub use service::StudentsService;
pub use store::{MemoryStore, Store};
