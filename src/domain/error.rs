use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestionError {
    #[error("Store connection error: {0}")]
    Connection(String),

    #[error("Bulk loader initialization error: {0}")]
    BulkLoaderInit(String),

    #[error("Retrieval error: {0}")]
    Retrieval(#[from] RetrievalError),

    #[error("Bulk import error (status {status}): {message}")]
    BulkImport { status: i32, message: String },

    #[error("Configuration error: {0}")]
    Config(String),
}

#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error("object '{0}' not found")]
    NotFound(String),

    #[error("access denied to object '{0}'")]
    AccessDenied(String),

    #[error("object '{name}' truncated: expected {expected} bytes, received {received}")]
    Truncated {
        name: String,
        expected: u64,
        received: u64,
    },

    #[error("failed to stage object '{name}' locally: {source}")]
    LocalWrite {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to fetch object '{name}': {message}")]
    Transport { name: String, message: String },
}

#[derive(Debug, Error)]
pub enum ParseLineError {
    #[error("line {line}: malformed JSON: {source}")]
    Malformed {
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("line {line}: record is not a JSON object")]
    NotAnObject { line: usize },

    #[error("line {line}: partition key '{path}' is missing")]
    MissingPartitionKey { line: usize, path: String },
}

impl ParseLineError {
    pub fn line(&self) -> usize {
        match self {
            Self::Malformed { line, .. }
            | Self::NotAnObject { line }
            | Self::MissingPartitionKey { line, .. } => *line,
        }
    }
}
