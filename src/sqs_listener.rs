use std::sync::Arc;

use aws_sdk_sqs::Client as SqsClient;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::{
    application::ingestion_service::IngestionService,
    config::{QueueSettings, Settings},
    domain::models::{IngestionEvent, RunReport},
    infrastructure::{
        mongodb::store_bootstrap::MongoStoreBootstrap, parsers::ndjson_parser::NdjsonParser, s3_adapter::S3Adapter,
    },
};

pub struct SqsListener {
    service: IngestionService,
    sqs_client: SqsClient,
    queue: QueueSettings,
    default_bucket: String,
}

impl SqsListener {
    pub async fn new(settings: Settings) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        debug!("Loading AWS configuration");
        let mut aws_config_builder = aws_config::defaults(aws_config::BehaviorVersion::latest());

        // Configure endpoint for LocalStack if AWS_ENDPOINT_URL is set
        let custom_endpoint = std::env::var("AWS_ENDPOINT_URL").ok();
        if let Some(endpoint_url) = &custom_endpoint {
            info!("Using custom AWS endpoint: {}", endpoint_url);
            aws_config_builder = aws_config_builder.endpoint_url(endpoint_url);
        }

        let aws_config = aws_config_builder.load().await;
        debug!("AWS region: {:?}", aws_config.region());

        let mut s3_config = aws_sdk_s3::config::Builder::from(&aws_config);
        if custom_endpoint.is_some() {
            s3_config = s3_config.force_path_style(true);
        }
        let s3_client = aws_sdk_s3::Client::from_conf(s3_config.build());
        let sqs_client = SqsClient::new(&aws_config);
        debug!("AWS clients initialized");

        let object_fetcher = Arc::new(S3Adapter::new(s3_client, settings.source.staging_dir.clone()));
        let store = Arc::new(MongoStoreBootstrap::new(settings.store.clone(), settings.bulk.clone()));
        let service = IngestionService::new(object_fetcher, Arc::new(NdjsonParser), store);

        info!("Using SQS queue: {}", settings.queue.url);
        Ok(Self {
            service,
            sqs_client,
            queue: settings.queue,
            default_bucket: settings.source.bucket,
        })
    }

    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        info!("Starting listener, polling SQS queue: {}", self.queue.url);

        let mut poll_count: u64 = 0;
        loop {
            poll_count += 1;
            debug!("Polling SQS queue (attempt {})", poll_count);

            let response = self
                .sqs_client
                .receive_message()
                .queue_url(&self.queue.url)
                .max_number_of_messages(self.queue.max_messages)
                .wait_time_seconds(self.queue.wait_time_secs)
                .send()
                .await
                .map_err(|e| {
                    error!("Failed to receive messages from SQS: {}", e);
                    e
                })?;

            let Some(messages) = response.messages else {
                debug!("No messages received from SQS");
                continue;
            };
            info!("Received {} messages from SQS", messages.len());

            for (i, message) in messages.iter().enumerate() {
                match &message.body {
                    Some(body) => {
                        let reports = self.process_message(body).await;
                        let failed = reports.iter().filter(|r| !r.is_success()).count();
                        info!(
                            "Message {} handled: {} runs, {} failed",
                            i + 1,
                            reports.len(),
                            failed
                        );
                    }
                    None => warn!("Received message without body"),
                }

                // Failed runs are reported, not redelivered.
                if let Some(receipt_handle) = &message.receipt_handle {
                    self.sqs_client
                        .delete_message()
                        .queue_url(&self.queue.url)
                        .receipt_handle(receipt_handle)
                        .send()
                        .await
                        .map_err(|e| {
                            error!("Failed to delete message from SQS: {}", e);
                            e
                        })?;
                    debug!("Message deleted from queue");
                }
            }
        }
    }

    pub async fn process_message(&self, body: &str) -> Vec<RunReport> {
        let events = match parse_s3_notification(body, &self.default_bucket) {
            Ok(events) => events,
            Err(e) => {
                error!("Failed to parse S3 event JSON: {}", e);
                debug!("Failed message body: {}", body);
                return Vec::new();
            }
        };

        let mut reports = Vec::with_capacity(events.len());
        for event in events {
            reports.push(self.service.process_event(event).await);
        }
        reports
    }
}

pub fn parse_s3_notification(body: &str, default_bucket: &str) -> Result<Vec<IngestionEvent>, serde_json::Error> {
    let notification: Value = serde_json::from_str(body)?;

    let Some(records) = notification["Records"].as_array() else {
        warn!("S3 event contains no Records array");
        return Ok(Vec::new());
    };

    let mut events = Vec::with_capacity(records.len());
    for record in records {
        let Some(key) = record["s3"]["object"]["key"].as_str() else {
            warn!("S3 record missing object key");
            continue;
        };
        let bucket = record["s3"]["bucket"]["name"]
            .as_str()
            .unwrap_or(default_bucket);

        events.push(IngestionEvent {
            bucket: bucket.to_string(),
            name: decode_object_key(key),
            size: record["s3"]["object"]["size"].as_u64().unwrap_or(0),
        });
    }
    Ok(events)
}

// Keys arrive form-encoded; `+` is a space, so it is replaced before `%2B` is decoded.
fn decode_object_key(key: &str) -> String {
    urlencoding::decode(&key.replace('+', " "))
        .map(|decoded| decoded.into_owned())
        .unwrap_or_else(|_| key.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOTIFICATION: &str = r#"{
        "Records": [
            {
                "eventName": "ObjectCreated:Put",
                "s3": {
                    "bucket": { "name": "testcontainer" },
                    "object": { "key": "orders.json", "size": 96 }
                }
            },
            {
                "s3": {
                    "object": { "key": "daily+exports/2024%2F01.json", "size": 10 }
                }
            },
            { "s3": { "bucket": { "name": "testcontainer" } } }
        ]
    }"#;

    #[test]
    fn notification_yields_one_event_per_object() {
        let events = parse_s3_notification(NOTIFICATION, "fallback").unwrap();
        assert_eq!(
            events,
            vec![
                IngestionEvent {
                    bucket: "testcontainer".into(),
                    name: "orders.json".into(),
                    size: 96,
                },
                IngestionEvent {
                    bucket: "fallback".into(),
                    name: "daily exports/2024/01.json".into(),
                    size: 10,
                },
            ]
        );
    }

    #[test]
    fn test_events_without_records_are_empty() {
        let events = parse_s3_notification(r#"{"Event":"s3:TestEvent"}"#, "b").unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn invalid_json_is_an_error() {
        assert!(parse_s3_notification("not json", "b").is_err());
    }

    #[test]
    fn key_decoding_leaves_bad_escapes_alone() {
        assert_eq!(decode_object_key("a%20b"), "a b");
        assert_eq!(decode_object_key("100%"), "100%");
        assert_eq!(decode_object_key("x%zzy"), "x%zzy");
        assert_eq!(decode_object_key("x%+1"), "x% 1");
        assert_eq!(decode_object_key("c%2B%2B+notes.json"), "c++ notes.json");
        assert_eq!(decode_object_key("bad%FF.json"), "bad%FF.json");
        assert_eq!(decode_object_key("plain.json"), "plain.json");
    }
}
