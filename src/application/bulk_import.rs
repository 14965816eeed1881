use std::time::Instant;

use tracing::{debug, error, info, warn};

use crate::domain::{
    error::{IngestionError, ParseLineError},
    models::{BulkImportOutcome, DocumentFailure, DocumentRecord, PartitionKeyPath, STATUS_BAD_REQUEST},
    ports::BulkImporter,
};

pub fn prepare_record(
    record: &DocumentRecord,
    partition_key: &PartitionKeyPath,
) -> Result<serde_json::Value, ParseLineError> {
    let value: serde_json::Value =
        serde_json::from_str(&record.body).map_err(|source| ParseLineError::Malformed {
            line: record.line,
            source,
        })?;

    if !value.is_object() {
        return Err(ParseLineError::NotAnObject { line: record.line });
    }
    if partition_key.lookup(&value).is_none() {
        return Err(ParseLineError::MissingPartitionKey {
            line: record.line,
            path: partition_key.to_string(),
        });
    }

    Ok(value)
}

// Only a submission-level error fails the call. Nothing is retried here.
pub async fn submit(
    importer: &dyn BulkImporter,
    records: &[DocumentRecord],
) -> Result<BulkImportOutcome, IngestionError> {
    let started = Instant::now();

    if records.is_empty() {
        info!("No records to import, skipping the store");
        return Ok(BulkImportOutcome::default());
    }

    let partition_key = importer.partition_key();
    let mut failures = Vec::new();
    let mut submitted = Vec::with_capacity(records.len());
    let mut documents = Vec::with_capacity(records.len());

    for (index, record) in records.iter().enumerate() {
        match prepare_record(record, partition_key) {
            Ok(document) => {
                submitted.push(index);
                documents.push(document);
            }
            Err(e) => {
                warn!("Skipping record: {}", e);
                failures.push(DocumentFailure {
                    index,
                    line: e.line(),
                    status: STATUS_BAD_REQUEST,
                    message: e.to_string(),
                });
            }
        }
    }

    debug!(
        "{} of {} records ready for import ({} unparseable)",
        documents.len(),
        records.len(),
        failures.len()
    );

    let response = if documents.is_empty() {
        Default::default()
    } else {
        importer.import_all(documents).await.map_err(|e| {
            error!("Exception encountered when inserting documents in bulk: {}", e);
            e
        })?
    };

    for rejected in response.rejected {
        if let Some(&index) = submitted.get(rejected.position) {
            failures.push(DocumentFailure {
                index,
                line: records[index].line,
                status: rejected.status,
                message: rejected.message,
            });
        }
    }
    failures.sort_by_key(|f| f.index);

    let outcome = BulkImportOutcome {
        imported: response.imported,
        request_units: response.request_units,
        failures,
        batches: response.batches,
        elapsed: started.elapsed(),
    };

    info!("Bulk import finished: {}", outcome);
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{ImportResponse, RejectedDocument, STATUS_CONFLICT};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;
    use test_log::test;

    struct ScriptedImporter {
        key: PartitionKeyPath,
        received: Mutex<Vec<Vec<serde_json::Value>>>,
        response: fn(usize) -> Result<ImportResponse, IngestionError>,
    }

    impl ScriptedImporter {
        fn new(response: fn(usize) -> Result<ImportResponse, IngestionError>) -> Self {
            Self {
                key: PartitionKeyPath::parse("/age").unwrap(),
                received: Mutex::new(Vec::new()),
                response,
            }
        }
    }

    #[async_trait]
    impl BulkImporter for ScriptedImporter {
        fn partition_key(&self) -> &PartitionKeyPath {
            &self.key
        }

        async fn import_all(&self, documents: Vec<serde_json::Value>) -> Result<ImportResponse, IngestionError> {
            let n = documents.len();
            self.received.lock().unwrap().push(documents);
            (self.response)(n)
        }
    }

    fn records(lines: &[&str]) -> Vec<DocumentRecord> {
        lines
            .iter()
            .enumerate()
            .map(|(i, body)| DocumentRecord {
                line: i + 1,
                body: body.to_string(),
            })
            .collect()
    }

    fn all_imported(n: usize) -> Result<ImportResponse, IngestionError> {
        Ok(ImportResponse {
            imported: n as u64,
            request_units: 5.5 * n as f64,
            rejected: Vec::new(),
            batches: 1,
        })
    }

    #[test]
    fn prepare_record_classifies_bad_lines() {
        let key = PartitionKeyPath::parse("/age").unwrap();
        let line = |body: &str| DocumentRecord { line: 7, body: body.into() };

        assert!(prepare_record(&line(r#"{"age": 3}"#), &key).is_ok());
        assert!(matches!(
            prepare_record(&line(r#"{"age": "#), &key),
            Err(ParseLineError::Malformed { line: 7, .. })
        ));
        assert!(matches!(
            prepare_record(&line("[1, 2]"), &key),
            Err(ParseLineError::NotAnObject { line: 7 })
        ));
        assert!(matches!(
            prepare_record(&line(r#"{"name": "x"}"#), &key),
            Err(ParseLineError::MissingPartitionKey { line: 7, .. })
        ));
    }

    #[test(tokio::test)]
    async fn empty_batch_skips_the_store() {
        let importer = ScriptedImporter::new(|_| panic!("store must not be contacted"));
        let outcome = submit(&importer, &[]).await.unwrap();

        assert_eq!(outcome.imported, 0);
        assert_eq!(outcome.request_units, 0.0);
        assert!(outcome.failures.is_empty());
        assert!(importer.received.lock().unwrap().is_empty());
    }

    #[test(tokio::test)]
    async fn whole_batch_goes_in_one_call() {
        let importer = ScriptedImporter::new(all_imported);
        let input = records(&[r#"{"id":"1","age":1}"#, r#"{"id":"2","age":2}"#, r#"{"id":"3","age":3}"#]);

        let outcome = submit(&importer, &input).await.unwrap();

        assert_eq!(outcome.imported, 3);
        assert_eq!(outcome.request_units, 16.5);
        let calls = importer.received.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0][0], json!({"id": "1", "age": 1}));
    }

    #[test(tokio::test)]
    async fn malformed_line_is_a_failure_not_an_error() {
        let importer = ScriptedImporter::new(all_imported);
        let input = records(&[r#"{"age":1}"#, r#"{"age":"#, r#"{"age":3}"#]);

        let outcome = submit(&importer, &input).await.unwrap();

        assert_eq!(outcome.imported, 2);
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].index, 1);
        assert_eq!(outcome.failures[0].line, 2);
        assert_eq!(outcome.failures[0].status, STATUS_BAD_REQUEST);
    }

    #[test(tokio::test)]
    async fn store_rejections_map_back_to_records() {
        let importer = ScriptedImporter::new(|n| {
            Ok(ImportResponse {
                imported: n as u64 - 1,
                request_units: 3.0,
                rejected: vec![RejectedDocument {
                    position: 1,
                    status: STATUS_CONFLICT,
                    message: "duplicate key".into(),
                }],
                batches: 1,
            })
        });
        // Record 0 never reaches the store, so store position 1 is record 2.
        let input = records(&[r#"{"name":"no key"}"#, r#"{"age":1}"#, r#"{"age":2}"#]);

        let outcome = submit(&importer, &input).await.unwrap();

        assert_eq!(outcome.imported, 1);
        let failed: Vec<(usize, i32)> = outcome.failures.iter().map(|f| (f.index, f.status)).collect();
        assert_eq!(failed, vec![(0, STATUS_BAD_REQUEST), (2, STATUS_CONFLICT)]);
    }

    #[test(tokio::test)]
    async fn submission_failure_is_returned() {
        let importer = ScriptedImporter::new(|_| {
            Err(IngestionError::BulkImport {
                status: 429,
                message: "request rate is large".into(),
            })
        });

        let err = submit(&importer, &records(&[r#"{"age":1}"#])).await.unwrap_err();
        assert!(matches!(err, IngestionError::BulkImport { status: 429, .. }));
    }
}
