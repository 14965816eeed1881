use std::path::PathBuf;

use serde::Deserialize;
use tracing::{debug, info};

use crate::domain::{
    error::IngestionError,
    models::{ConnectionMode, ConsistencyLevel},
};

pub const DEFAULT_ENDPOINT_TEMPLATE: &str =
    "mongodb://{account}.mongo.cosmos.azure.com:10255/?tls=true&retryWrites=false";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub store: StoreSettings,
    pub bulk: BulkSettings,
    pub source: SourceSettings,
    pub queue: QueueSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    pub account_name: String,
    pub account_key: String,
    // `{account}` is replaced with the account name
    pub endpoint_template: String,
    pub connection_mode: ConnectionMode,
    pub max_pool_size: u32,
    pub consistency_level: ConsistencyLevel,
    pub connect_timeout_secs: u64,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            account_name: String::new(),
            account_key: String::new(),
            endpoint_template: DEFAULT_ENDPOINT_TEMPLATE.to_string(),
            connection_mode: ConnectionMode::Direct,
            max_pool_size: 5000,
            consistency_level: ConsistencyLevel::Eventual,
            connect_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BulkSettings {
    pub database: String,
    pub collection: String,
    pub partition_key_path: String,
    pub throughput_budget: u32,
    pub max_batch_documents: usize,
    pub max_in_flight_batches: usize,
    pub probe_request_charge: bool,
}

impl Default for BulkSettings {
    fn default() -> Self {
        Self {
            database: "ingestion_db".to_string(),
            collection: "documents".to_string(),
            partition_key_path: "/age".to_string(),
            throughput_budget: 4000,
            max_batch_documents: 1000,
            max_in_flight_batches: 4,
            probe_request_charge: true,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SourceSettings {
    pub bucket: String,
    pub staging_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    pub url: String,
    pub max_messages: i32,
    pub wait_time_secs: i32,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            url: String::new(),
            max_messages: 10,
            wait_time_secs: 20,
        }
    }
}

impl Settings {
    pub fn load() -> Result<Self, IngestionError> {
        let mut settings = match std::env::var("INGEST_CONFIG") {
            Ok(path) => {
                info!("Loading configuration from {}", path);
                let raw = std::fs::read_to_string(&path)
                    .map_err(|e| IngestionError::Config(format!("cannot read {path}: {e}")))?;
                Self::from_yaml(&raw)?
            }
            Err(_) => {
                debug!("INGEST_CONFIG not set, starting from defaults");
                Self::default()
            }
        };

        settings.apply_overrides(|key| std::env::var(key).ok())?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_yaml(raw: &str) -> Result<Self, IngestionError> {
        serde_yaml::from_str(raw).map_err(|e| IngestionError::Config(e.to_string()))
    }

    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), IngestionError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("COSMOS_ACCOUNT_NAME") {
            self.store.account_name = v;
        }
        if let Some(v) = lookup("COSMOS_ACCOUNT_KEY") {
            self.store.account_key = v;
        }
        if let Some(v) = lookup("COSMOS_ENDPOINT_TEMPLATE") {
            self.store.endpoint_template = v;
        }
        if let Some(v) = lookup("INGEST_DATABASE") {
            self.bulk.database = v;
        }
        if let Some(v) = lookup("INGEST_COLLECTION") {
            self.bulk.collection = v;
        }
        if let Some(v) = lookup("INGEST_PARTITION_KEY") {
            self.bulk.partition_key_path = v;
        }
        if let Some(v) = lookup("INGEST_THROUGHPUT") {
            self.bulk.throughput_budget = v
                .parse()
                .map_err(|_| IngestionError::Config(format!("INGEST_THROUGHPUT '{v}' is not a number")))?;
        }
        if let Some(v) = lookup("SOURCE_BUCKET") {
            self.source.bucket = v;
        }
        if let Some(v) = lookup("STAGING_DIR") {
            self.source.staging_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("SQS_QUEUE_URL") {
            self.queue.url = v;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), IngestionError> {
        if self.store.account_name.is_empty() {
            return Err(IngestionError::Config("store.account_name is required".into()));
        }
        if self.store.account_key.is_empty() {
            return Err(IngestionError::Config("store.account_key is required".into()));
        }
        if !self.store.endpoint_template.contains("{account}") {
            return Err(IngestionError::Config(
                "store.endpoint_template must contain '{account}'".into(),
            ));
        }
        if self.store.max_pool_size == 0 {
            return Err(IngestionError::Config("store.max_pool_size must be positive".into()));
        }
        if self.bulk.max_batch_documents == 0 || self.bulk.max_in_flight_batches == 0 {
            return Err(IngestionError::Config(
                "bulk batch size and in-flight batches must be positive".into(),
            ));
        }
        if self.queue.url.is_empty() {
            return Err(IngestionError::Config("queue.url is required".into()));
        }
        Ok(())
    }
}
