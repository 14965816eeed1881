pub mod bulk_executor;
pub mod connection;
pub mod pacer;
pub mod store_bootstrap;
