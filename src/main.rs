use blob_bulk_ingest::{config::Settings, sqs_listener::SqsListener};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("blob_bulk_ingest=debug".parse()?)
                .add_directive("aws_sdk=warn".parse()?)
                .add_directive("mongodb=info".parse()?),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    info!("Starting blob bulk ingestion");
    let settings = Settings::load()?;
    debug!(
        "Target {}.{} with partition key {} and budget {} RU/s",
        settings.bulk.database,
        settings.bulk.collection,
        settings.bulk.partition_key_path,
        settings.bulk.throughput_budget
    );

    let listener = SqsListener::new(settings).await?;
    info!("Listener initialized successfully");

    listener.run().await
}
