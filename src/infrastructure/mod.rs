pub mod mongodb;
pub mod parsers;
pub mod s3_adapter;
