pub mod ndjson_parser;
