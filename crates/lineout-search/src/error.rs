use thiserror::Error;

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("elasticsearch request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("elasticsearch returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("invalid elasticsearch response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("invalid elasticsearch url: {0}")]
    Url(String),
}

pub type SearchResult<T> = std::result::Result<T, SearchError>;
