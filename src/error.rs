use mongodb::error::Error as MongoError;
use std::result::Result as StdResult;
use thiserror::Error;

/// Errors raised while copying databases or collections.
///
/// Nothing here is retried by the copier, every error aborts the running copy.
#[derive(Error, Debug)]
pub enum CopyError {
    /// mongodb connection, authentication or query failure.
    #[error("Mongodb connection error")]
    MongoError(#[from] MongoError),
    /// the endpoint can't list collections of the given database.
    #[error("Check permission for database {db:?} failed, connection string: {uri:?}, detailed: {detail:?}")]
    PermissionError {
        /// connection string which fails.
        uri: String,
        /// database name.
        db: String,
        /// error reported by mongodb.
        detail: MongoError,
    },
    /// collection metadata can't be read or understood.
    #[error("Invalid metadata for collection {container:?}: {detail}")]
    Metadata {
        /// collection name.
        container: String,
        /// what is wrong with it.
        detail: String,
    },
    /// a source document has no `_id`, so it can't be upserted.
    #[error("Document without `_id` found in collection {container:?}")]
    MissingId {
        /// collection name.
        container: String,
    },
    /// an upsert in the current batch failed.
    #[error("Write to collection {container:?} failed")]
    Write {
        /// destination collection name.
        container: String,
        /// underlying failure.
        #[source]
        source: Box<CopyError>,
    },
    /// concurrency limit must be at least 1.
    #[error("Invalid concurrency limit {0}, it should be at least 1")]
    InvalidConcurrency(usize),
    /// the requested collection doesn't exist.
    #[error("Collection {container:?} not found in database {db:?}")]
    ContainerNotFound {
        /// database name.
        db: String,
        /// collection name.
        container: String,
    },
    /// the store rejects an operation.
    #[error("Store error: {0}")]
    Store(String),
    /// write worker pool can't be started.
    #[error("Build write thread pool failed")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
    /// invalid configuration value.
    #[error("Configuration error: {0}")]
    Config(String),
    /// configuration file can't be read.
    #[error("IO error")]
    Io(#[from] std::io::Error),
    /// configuration file can't be parsed.
    #[error("Parse configuration failed")]
    Toml(#[from] toml::de::Error),
    /// copy stopped by a [CancelToken](crate::CancelToken).
    #[error("Copy cancelled")]
    Cancelled,
}

impl CopyError {
    /// wrap `source` as a write failure for `container`.
    pub fn write(container: impl Into<String>, source: CopyError) -> Self {
        CopyError::Write {
            container: container.into(),
            source: Box::new(source),
        }
    }

    /// create a metadata error for `container`.
    pub fn metadata(container: impl Into<String>, detail: impl Into<String>) -> Self {
        CopyError::Metadata {
            container: container.into(),
            detail: detail.into(),
        }
    }
}

/// Result type used by this crate.
pub type Result<T> = StdResult<T, CopyError>;
