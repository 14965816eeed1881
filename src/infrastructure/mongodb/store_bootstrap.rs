use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::OnceCell;
use tracing::{debug, error, info};

use crate::{
    config::{BulkSettings, StoreSettings},
    domain::{
        error::IngestionError,
        ports::{BulkImporter, StoreBootstrap},
    },
    infrastructure::mongodb::{
        bulk_executor::{prepare_bulk_loader, MongoBulkExecutor},
        connection::{connect, StoreConnection},
    },
};

// A failed attempt leaves the cell empty so the next run tries again.
pub struct MongoStoreBootstrap {
    store: StoreSettings,
    bulk: BulkSettings,
    connection: OnceCell<StoreConnection>,
    executor: OnceCell<Arc<MongoBulkExecutor>>,
}

impl MongoStoreBootstrap {
    pub fn new(store: StoreSettings, bulk: BulkSettings) -> Self {
        debug!("Store bootstrap configured for {}.{}", bulk.database, bulk.collection);
        Self {
            store,
            bulk,
            connection: OnceCell::new(),
            executor: OnceCell::new(),
        }
    }

    pub fn connection(&self) -> Option<&StoreConnection> {
        self.connection.get()
    }

    async fn executor(&self) -> Result<&Arc<MongoBulkExecutor>, IngestionError> {
        self.executor
            .get_or_try_init(|| async {
                let connection = self
                    .connection
                    .get_or_try_init(|| connect(&self.store))
                    .await
                    .map_err(|e| {
                        error!("Store client bootstrap failed: {}", e);
                        e
                    })?;
                info!("Successfully instantiated the store client");

                let executor = prepare_bulk_loader(Some(connection), &self.bulk).map_err(|e| {
                    error!("Bulk executor bootstrap failed: {}", e);
                    e
                })?;
                info!("Successfully instantiated the bulk executor");
                Ok::<_, IngestionError>(Arc::new(executor))
            })
            .await
    }
}

#[async_trait]
impl StoreBootstrap for MongoStoreBootstrap {
    async fn bulk_importer(&self) -> Result<Arc<dyn BulkImporter>, IngestionError> {
        let importer: Arc<dyn BulkImporter> = self.executor().await?.clone();
        Ok(importer)
    }
}
