use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use mongodb::{
    bson::{doc, Bson, Document},
    error::{Error as MongoError, ErrorKind},
    options::InsertManyOptions,
    Collection, Database,
};
use tracing::{debug, error, info, warn};

use crate::{
    config::BulkSettings,
    domain::{
        error::IngestionError,
        models::{
            ImportResponse, PartitionKeyPath, RejectedDocument, STATUS_BAD_REQUEST, STATUS_CONFLICT,
            STATUS_INTERNAL_ERROR, STATUS_TOO_MANY_REQUESTS, STATUS_UNAUTHORIZED, STATUS_UNAVAILABLE,
        },
        ports::BulkImporter,
    },
    infrastructure::mongodb::{connection::StoreConnection, pacer::ThroughputPacer},
};

const DUPLICATE_KEY: i32 = 11000;
const COMMAND_NOT_FOUND: i32 = 59;
const REQUEST_RATE_TOO_LARGE: i32 = 16500;
const UNAUTHORIZED: i32 = 13;
const AUTHENTICATION_FAILED: i32 = 18;

#[derive(Debug)]
pub struct MongoBulkExecutor {
    database: Database,
    collection: Collection<Document>,
    partition_key: PartitionKeyPath,
    max_batch_documents: usize,
    max_in_flight_batches: usize,
    pacer: ThroughputPacer,
    probe_request_charge: AtomicBool,
}

// No network I/O here: a partition key that disagrees with the collection
// only fails at submission.
pub fn prepare_bulk_loader(
    connection: Option<&StoreConnection>,
    settings: &BulkSettings,
) -> Result<MongoBulkExecutor, IngestionError> {
    let connection = connection.ok_or_else(|| {
        error!("Bulk loader requested without a store connection");
        IngestionError::BulkLoaderInit("no store connection is available".to_string())
    })?;

    if settings.database.is_empty() || settings.collection.is_empty() {
        return Err(IngestionError::BulkLoaderInit(
            "database and collection names are required".to_string(),
        ));
    }
    if settings.throughput_budget == 0 {
        return Err(IngestionError::BulkLoaderInit(
            "throughput budget must be positive".to_string(),
        ));
    }
    let partition_key = PartitionKeyPath::parse(&settings.partition_key_path).map_err(|e| {
        error!("Rejected partition key path: {}", e);
        IngestionError::BulkLoaderInit(e)
    })?;

    let database = connection.database(&settings.database);
    let collection = database.collection::<Document>(&settings.collection);

    info!(
        "Bulk executor bound to {}.{} (partition key {}, budget {} RU/s)",
        settings.database, settings.collection, partition_key, settings.throughput_budget
    );

    Ok(MongoBulkExecutor {
        database,
        collection,
        partition_key,
        max_batch_documents: settings.max_batch_documents.max(1),
        max_in_flight_batches: settings.max_in_flight_batches.max(1),
        pacer: ThroughputPacer::new(settings.throughput_budget),
        probe_request_charge: AtomicBool::new(settings.probe_request_charge),
    })
}

#[derive(Debug, Default, PartialEq)]
pub(crate) struct BatchResult {
    imported: u64,
    request_units: f64,
    rejected: Vec<RejectedDocument>,
    submission_error: Option<(i32, String)>,
}

// (batch index, store code, message)
pub(crate) type WriteError = (usize, i32, String);

impl MongoBulkExecutor {
    async fn import_batch(&self, batch: Vec<(usize, Document)>) -> BatchResult {
        let (positions, documents): (Vec<usize>, Vec<Document>) = batch.into_iter().unzip();
        let reserved = self.pacer.acquire(documents.len()).await;
        debug!("Submitting batch of {} documents", documents.len());

        let options = InsertManyOptions::builder().ordered(false).build();
        let result = self.collection.insert_many(documents, options).await;

        let request_units = self.request_charge().await;
        self.pacer.settle(positions.len(), reserved, request_units);

        let mut outcome = match result {
            Ok(inserted) => BatchResult {
                imported: inserted.inserted_ids.len() as u64,
                ..BatchResult::default()
            },
            Err(e) => match e.kind.as_ref() {
                ErrorKind::BulkWrite(failure) => {
                    if let Some(concern) = &failure.write_concern_error {
                        warn!("Write concern not satisfied for batch: {}", concern.message);
                    }
                    let write_errors: Vec<WriteError> = failure
                        .write_errors
                        .as_deref()
                        .unwrap_or_default()
                        .iter()
                        .map(|w| (w.index, w.code, w.message.clone()))
                        .collect();
                    partial_batch(&positions, &write_errors)
                }
                _ => {
                    let status = submission_status(&e);
                    error!("Batch submission failed with status {}: {}", status, e);
                    failed_batch(&positions, status, e.to_string())
                }
            },
        };
        outcome.request_units = request_units;
        outcome
    }

    async fn request_charge(&self) -> f64 {
        if !self.probe_request_charge.load(Ordering::Relaxed) {
            return 0.0;
        }

        match self
            .database
            .run_command(doc! { "getLastRequestStatistics": 1 }, None)
            .await
        {
            Ok(reply) => request_charge_from(&reply),
            Err(e) => {
                if matches!(e.kind.as_ref(), ErrorKind::Command(c) if c.code == COMMAND_NOT_FOUND) {
                    warn!("Store does not report request charges, no longer probing");
                    self.probe_request_charge.store(false, Ordering::Relaxed);
                } else {
                    debug!("Request charge probe failed: {}", e);
                }
                0.0
            }
        }
    }
}

#[async_trait]
impl BulkImporter for MongoBulkExecutor {
    fn partition_key(&self) -> &PartitionKeyPath {
        &self.partition_key
    }

    async fn import_all(&self, documents: Vec<serde_json::Value>) -> Result<ImportResponse, IngestionError> {
        let mut response = ImportResponse::default();
        if documents.is_empty() {
            debug!("Nothing to import");
            return Ok(response);
        }

        debug!("Converting {} JSON documents to BSON", documents.len());
        let mut prepared = Vec::with_capacity(documents.len());
        for (position, value) in documents.into_iter().enumerate() {
            match to_store_document(&value) {
                Ok(document) => prepared.push((position, document)),
                Err(message) => {
                    warn!("Document {} cannot be encoded: {}", position, message);
                    response.rejected.push(RejectedDocument {
                        position,
                        status: STATUS_BAD_REQUEST,
                        message,
                    });
                }
            }
        }

        let batches = into_batches(prepared, self.max_batch_documents);
        response.batches = batches.len();
        info!(
            "Importing in {} batches (up to {} in flight)",
            batches.len(),
            self.max_in_flight_batches
        );

        let results: Vec<BatchResult> = stream::iter(batches)
            .map(|batch| self.import_batch(batch))
            .buffer_unordered(self.max_in_flight_batches)
            .collect()
            .await;

        merge(response, results)
    }
}

pub(crate) fn partial_batch(positions: &[usize], write_errors: &[WriteError]) -> BatchResult {
    let rejected: Vec<RejectedDocument> = write_errors
        .iter()
        .filter_map(|(index, code, message)| {
            positions.get(*index).map(|&position| RejectedDocument {
                position,
                status: write_error_status(*code),
                message: format!("{message} (store code {code})"),
            })
        })
        .collect();

    debug!(
        "Batch partially rejected: {} of {} documents",
        rejected.len(),
        positions.len()
    );
    BatchResult {
        imported: positions.len().saturating_sub(rejected.len()) as u64,
        rejected,
        ..BatchResult::default()
    }
}

pub(crate) fn failed_batch(positions: &[usize], status: i32, message: String) -> BatchResult {
    BatchResult {
        rejected: positions
            .iter()
            .map(|&position| RejectedDocument {
                position,
                status,
                message: message.clone(),
            })
            .collect(),
        submission_error: Some((status, message)),
        ..BatchResult::default()
    }
}

// Fails only when nothing was imported and some batch failed as a whole.
pub(crate) fn merge(
    mut response: ImportResponse,
    results: Vec<BatchResult>,
) -> Result<ImportResponse, IngestionError> {
    let mut submission_error = None;
    for result in results {
        response.imported += result.imported;
        response.request_units += result.request_units;
        response.rejected.extend(result.rejected);
        if result.submission_error.is_some() {
            submission_error = result.submission_error;
        }
    }
    response.rejected.sort_by_key(|r| r.position);

    match submission_error {
        Some((status, message)) if response.imported == 0 => {
            Err(IngestionError::BulkImport { status, message })
        }
        _ => Ok(response),
    }
}

// A JSON `id` doubles as the store key so reruns collide instead of duplicating.
pub(crate) fn to_store_document(value: &serde_json::Value) -> Result<Document, String> {
    let mut document = mongodb::bson::to_document(value).map_err(|e| e.to_string())?;
    if !document.contains_key("_id") {
        if let Some(id) = document.get("id").cloned() {
            document.insert("_id", id);
        }
    }
    Ok(document)
}

fn into_batches<T>(items: Vec<T>, size: usize) -> Vec<Vec<T>> {
    let mut batches = Vec::new();
    let mut items = items.into_iter().peekable();
    while items.peek().is_some() {
        batches.push(items.by_ref().take(size).collect());
    }
    batches
}

pub(crate) fn request_charge_from(reply: &Document) -> f64 {
    match reply.get("RequestCharge") {
        Some(Bson::Double(v)) => *v,
        Some(Bson::Int32(v)) => f64::from(*v),
        Some(Bson::Int64(v)) => *v as f64,
        _ => 0.0,
    }
}

fn known_status(code: i32) -> Option<i32> {
    match code {
        DUPLICATE_KEY => Some(STATUS_CONFLICT),
        REQUEST_RATE_TOO_LARGE => Some(STATUS_TOO_MANY_REQUESTS),
        UNAUTHORIZED | AUTHENTICATION_FAILED => Some(STATUS_UNAUTHORIZED),
        _ => None,
    }
}

fn write_error_status(code: i32) -> i32 {
    known_status(code).unwrap_or(STATUS_BAD_REQUEST)
}

fn submission_status(e: &MongoError) -> i32 {
    match e.kind.as_ref() {
        ErrorKind::Command(c) => known_status(c.code).unwrap_or(STATUS_INTERNAL_ERROR),
        ErrorKind::Authentication { .. } => STATUS_UNAUTHORIZED,
        _ => STATUS_UNAVAILABLE,
    }
}
