use std::sync::Arc;

use async_trait::async_trait;

use crate::domain::{
    error::{IngestionError, RetrievalError},
    models::{DocumentRecord, ImportResponse, IngestionEvent, PartitionKeyPath, RawContent},
};

#[async_trait]
pub trait ObjectFetcher: Send + Sync {
    async fn fetch_object(&self, event: &IngestionEvent) -> Result<RawContent, RetrievalError>;
}

pub trait RecordExtractor: Send + Sync {
    fn extract(&self, content: &RawContent) -> Vec<DocumentRecord>;
}

#[async_trait]
pub trait BulkImporter: Send + Sync {
    fn partition_key(&self) -> &PartitionKeyPath;

    // No upsert. `Err` means the submission itself failed.
    async fn import_all(&self, documents: Vec<serde_json::Value>) -> Result<ImportResponse, IngestionError>;
}

#[async_trait]
pub trait StoreBootstrap: Send + Sync {
    async fn bulk_importer(&self) -> Result<Arc<dyn BulkImporter>, IngestionError>;
}
