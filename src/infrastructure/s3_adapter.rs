use std::path::{Path, PathBuf};

use async_trait::async_trait;
use aws_sdk_s3::{
    error::{DisplayErrorContext, ProvideErrorMetadata, SdkError},
    operation::get_object::GetObjectError,
    Client,
};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::domain::{
    error::RetrievalError,
    models::{IngestionEvent, RawContent},
    ports::ObjectFetcher,
};

pub struct S3Adapter {
    client: Client,
    staging_dir: Option<PathBuf>,
}

impl S3Adapter {
    pub fn new(client: Client, staging_dir: Option<PathBuf>) -> Self {
        debug!("Initializing S3 adapter, staging dir: {:?}", staging_dir);
        Self {
            client,
            staging_dir,
        }
    }
}

#[async_trait]
impl ObjectFetcher for S3Adapter {
    async fn fetch_object(&self, event: &IngestionEvent) -> Result<RawContent, RetrievalError> {
        debug!("Fetching object s3://{}/{}", event.bucket, event.name);

        let output = self
            .client
            .get_object()
            .bucket(&event.bucket)
            .key(&event.name)
            .send()
            .await
            .map_err(|e| {
                let err = classify_get_error(&event.name, e);
                error!("GetObject failed for {}: {}", event.name, err);
                err
            })?;

        let announced = output.content_length().and_then(|l| u64::try_from(l).ok());
        let body = output.body.collect().await.map_err(|e| {
            error!("Body stream for {} ended early: {}", event.name, e);
            RetrievalError::Transport {
                name: event.name.clone(),
                message: e.to_string(),
            }
        })?;
        let bytes = body.into_bytes().to_vec();

        ensure_complete(&event.name, announced.or(Some(event.size)), bytes.len() as u64)?;
        info!("Downloaded {} bytes for {}", bytes.len(), event.name);

        let staged_path = match &self.staging_dir {
            Some(dir) => Some(stage_locally(dir, &event.name, &bytes).await?),
            None => None,
        };

        Ok(RawContent { bytes, staged_path })
    }
}

fn classify_get_error(name: &str, err: SdkError<GetObjectError>) -> RetrievalError {
    let status = err.raw_response().map(|r| r.status().as_u16());
    let detail = DisplayErrorContext(&err).to_string();
    let service_error = match &err {
        SdkError::ServiceError(e) => Some(e.err()),
        _ => None,
    };
    let no_such_key = service_error.is_some_and(|e| e.is_no_such_key());
    let access_denied = service_error.and_then(|e| e.code()) == Some("AccessDenied");

    match status {
        _ if no_such_key => RetrievalError::NotFound(name.to_string()),
        _ if access_denied => RetrievalError::AccessDenied(name.to_string()),
        Some(404) => RetrievalError::NotFound(name.to_string()),
        Some(401) | Some(403) => RetrievalError::AccessDenied(name.to_string()),
        _ => RetrievalError::Transport {
            name: name.to_string(),
            message: detail,
        },
    }
}

pub(crate) fn ensure_complete(name: &str, expected: Option<u64>, received: u64) -> Result<(), RetrievalError> {
    match expected {
        Some(expected) if received < expected => Err(RetrievalError::Truncated {
            name: name.to_string(),
            expected,
            received,
        }),
        _ => Ok(()),
    }
}

// Each staging gets its own file, so runs of the same key never share one.
pub(crate) async fn stage_locally(dir: &Path, name: &str, bytes: &[u8]) -> Result<PathBuf, RetrievalError> {
    let local_write = |source: std::io::Error| RetrievalError::LocalWrite {
        name: name.to_string(),
        source,
    };

    tokio::fs::create_dir_all(dir).await.map_err(local_write)?;
    let path = dir.join(format!("{}-{}", Uuid::new_v4(), name.replace('/', "_")));
    tokio::fs::write(&path, bytes).await.map_err(|e| {
        error!("Failed to stage {} at {}: {}", name, path.display(), e);
        local_write(e)
    })?;

    debug!("Staged {} at {}", name, path.display());
    Ok(path)
}
