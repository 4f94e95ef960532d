use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("github token not configured")]
    Unauthorized,
    #[error("github returned http {status}: {body}")]
    Http { status: u16, body: String },
    #[error("graphql errors: {}", .0.join("; "))]
    GraphQl(Vec<String>),
    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("invalid repository identifier: {0}")]
    InvalidRepo(String),
}

impl Error {
    /// Whether the failure is likely to clear up on the next poll.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http { status, .. } => *status == 429 || *status >= 500,
            Self::Request(e) => e.is_timeout() || e.is_connect(),
            _ => false,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Decode(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
