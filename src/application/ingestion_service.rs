use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::{
    application::bulk_import::submit,
    domain::{
        error::IngestionError,
        models::{BulkImportOutcome, IngestionEvent, RawContent, RunReport, Stage},
        ports::{ObjectFetcher, RecordExtractor, StoreBootstrap},
    },
};

// A run always ends in a RunReport; failures never escape to the caller.
pub struct IngestionService {
    object_fetcher: Arc<dyn ObjectFetcher>,
    record_extractor: Arc<dyn RecordExtractor>,
    store: Arc<dyn StoreBootstrap>,
}

impl IngestionService {
    pub fn new(
        object_fetcher: Arc<dyn ObjectFetcher>,
        record_extractor: Arc<dyn RecordExtractor>,
        store: Arc<dyn StoreBootstrap>,
    ) -> Self {
        Self {
            object_fetcher,
            record_extractor,
            store,
        }
    }

    pub async fn process_event(&self, event: IngestionEvent) -> RunReport {
        let run_id = Uuid::new_v4();
        let span = info_span!("ingest", %run_id, object = %event.name);

        async move {
            let started_at = Utc::now();
            let mut stage = Stage::Idle;
            let result = self.execute(&event, &mut stage).await;

            let report = RunReport {
                run_id,
                object: event.name,
                last_stage: stage,
                started_at,
                finished_at: Utc::now(),
                result,
            };
            log_report(&report);
            report
        }
        .instrument(span)
        .await
    }

    async fn execute(
        &self,
        event: &IngestionEvent,
        stage: &mut Stage,
    ) -> Result<BulkImportOutcome, IngestionError> {
        info!(
            "Processing object s3://{}/{} ({} bytes announced)",
            event.bucket, event.name, event.size
        );

        // Step 1: Retrieve content
        *stage = Stage::Retrieving;
        debug!("Step 1: Retrieving {}", event.name);
        let content = self
            .object_fetcher
            .fetch_object(event)
            .await
            .map_err(|e| {
                error!(stage = %Stage::Retrieving, "Failed to retrieve {}: {}", event.name, e);
                IngestionError::from(e)
            })?;

        // Step 2: Extract records
        *stage = Stage::Extracting;
        debug!("Step 2: Extracting records from {} bytes", content.bytes.len());
        let records = self.record_extractor.extract(&content);
        release(content).await;

        // Step 3: Bootstrap store (first run only)
        *stage = Stage::Bootstrapping;
        debug!("Step 3: Acquiring bulk importer");
        let importer = self.store.bulk_importer().await.map_err(|e| {
            error!(stage = %Stage::Bootstrapping, "Store bootstrap failed: {}", e);
            e
        })?;

        // Step 4: Bulk import
        *stage = Stage::Importing;
        debug!("Step 4: Importing {} records", records.len());
        submit(importer.as_ref(), &records).await.map_err(|e| {
            error!(stage = %Stage::Importing, "Bulk import of {} failed: {}", event.name, e);
            e
        })
    }
}

async fn release(content: RawContent) {
    if let Some(path) = content.staged_path {
        if let Err(e) = tokio::fs::remove_file(&path).await {
            warn!("Could not remove staged file {}: {}", path.display(), e);
        } else {
            debug!("Removed staged file {}", path.display());
        }
    }
}

fn log_report(report: &RunReport) {
    let took = report.finished_at - report.started_at;
    match &report.result {
        Ok(outcome) => {
            info!(
                stage = %Stage::Reported,
                "✅ {} done in {}ms: {}",
                report.object,
                took.num_milliseconds(),
                outcome
            );
            for failure in &outcome.failures {
                warn!(
                    "Record at line {} rejected with status {}: {}",
                    failure.line, failure.status, failure.message
                );
            }
        }
        Err(e) => {
            error!(
                stage = %Stage::Reported,
                failed_at = %report.last_stage,
                "❌ {} failed after {}ms: {}",
                report.object,
                took.num_milliseconds(),
                e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{
        error::RetrievalError,
        models::{DocumentRecord, ImportResponse, PartitionKeyPath},
        ports::BulkImporter,
    };
    use async_trait::async_trait;
    use std::sync::Mutex;
    use test_log::test;

    struct FixedObject;

    #[async_trait]
    impl ObjectFetcher for FixedObject {
        async fn fetch_object(&self, _event: &IngestionEvent) -> Result<RawContent, RetrievalError> {
            Ok(RawContent::new(b"id,age\nc-1,40\n".to_vec()))
        }
    }

    // Treats every CSV data row as one document.
    struct CsvRows;

    impl RecordExtractor for CsvRows {
        fn extract(&self, content: &RawContent) -> Vec<DocumentRecord> {
            String::from_utf8_lossy(&content.bytes)
                .lines()
                .enumerate()
                .skip(1)
                .map(|(i, row)| {
                    let mut fields = row.split(',');
                    let id = fields.next().unwrap_or_default();
                    let age = fields.next().unwrap_or_default();
                    DocumentRecord {
                        line: i + 1,
                        body: format!("{{\"id\":\"{id}\",\"age\":{age}}}"),
                    }
                })
                .collect()
        }
    }

    struct Recorder {
        key: PartitionKeyPath,
        received: Mutex<Vec<serde_json::Value>>,
    }

    #[async_trait]
    impl BulkImporter for Recorder {
        fn partition_key(&self) -> &PartitionKeyPath {
            &self.key
        }

        async fn import_all(&self, documents: Vec<serde_json::Value>) -> Result<ImportResponse, IngestionError> {
            let imported = documents.len() as u64;
            self.received.lock().unwrap().extend(documents);
            Ok(ImportResponse {
                imported,
                batches: 1,
                ..ImportResponse::default()
            })
        }
    }

    struct Ready(Arc<Recorder>);

    #[async_trait]
    impl StoreBootstrap for Ready {
        async fn bulk_importer(&self) -> Result<Arc<dyn BulkImporter>, IngestionError> {
            let importer: Arc<dyn BulkImporter> = self.0.clone();
            Ok(importer)
        }
    }

    #[test(tokio::test)]
    async fn records_come_from_the_injected_extractor() {
        let recorder = Arc::new(Recorder {
            key: PartitionKeyPath::parse("/age").unwrap(),
            received: Mutex::new(Vec::new()),
        });
        let service = IngestionService::new(
            Arc::new(FixedObject),
            Arc::new(CsvRows),
            Arc::new(Ready(recorder.clone())),
        );

        let report = service
            .process_event(IngestionEvent {
                bucket: "b".into(),
                name: "people.csv".into(),
                size: 0,
            })
            .await;

        assert_eq!(report.outcome().unwrap().imported, 1);
        assert_eq!(
            *recorder.received.lock().unwrap(),
            vec![serde_json::json!({"id": "c-1", "age": 40})]
        );
    }
}
