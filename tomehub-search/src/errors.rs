use tomehub_db::DbError;

#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    #[error("store error: {0}")]
    Db(#[from] DbError),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("embedding error: {0}")]
    Embedding(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("expansion error: {0}")]
    Expansion(String),
}

pub type SearchResult<T> = Result<T, SearchError>;
