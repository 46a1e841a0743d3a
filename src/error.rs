use thiserror::Error;

use crate::model::StudentId;

#[derive(Error, Debug)]
pub enum Error {
    #[error("student with id {0} already exists")]
    Conflict(StudentId),

    #[error("student with id {0} doesn't exist")]
    NotFound(StudentId),

    #[error("invalid query: {0}")]
    QuerySyntax(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid pipeline: {0}")]
    InvalidPipeline(String),

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("unexpected result document: {0}")]
    Decode(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("document must be a JSON object")]
    NotAnObject,
}

pub type Result<T> = std::result::Result<T, Error>;
