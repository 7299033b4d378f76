use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("parse error: {0}")]
    Parse(String),

    #[error("invalid filter: {0}")]
    Compile(#[from] regex::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("sql error: {0}")]
    Sql(#[from] rusqlite::Error),

    #[error("corrupt segment {bucket}: {detail}")]
    CorruptSegment { bucket: i64, detail: String },
}

pub type Result<T> = std::result::Result<T, Error>;
