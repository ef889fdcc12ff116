use tomehub_db::DbError;
use tomehub_search::SearchError;

use crate::providers::ProviderError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("retrieval error: {0}")]
    Search(#[from] SearchError),
    #[error("store error: {0}")]
    Db(#[from] DbError),
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type EngineResult<T> = Result<T, EngineError>;
