pub mod bulk_import;
pub mod ingestion_service;
