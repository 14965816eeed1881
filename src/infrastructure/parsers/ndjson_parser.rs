use tracing::{debug, info, warn};

use crate::domain::{
    models::{DocumentRecord, RawContent},
    ports::RecordExtractor,
};

pub struct NdjsonParser;

impl RecordExtractor for NdjsonParser {
    fn extract(&self, content: &RawContent) -> Vec<DocumentRecord> {
        extract_records(content)
    }
}

// One record per non-blank line, in input order.
fn extract_records(content: &RawContent) -> Vec<DocumentRecord> {
    let text = match std::str::from_utf8(&content.bytes) {
        Ok(text) => std::borrow::Cow::Borrowed(text),
        Err(e) => {
            warn!("Content is not valid UTF-8 ({}), decoding lossily", e);
            String::from_utf8_lossy(&content.bytes)
        }
    };

    let mut records = Vec::new();
    let mut blank = 0;

    for (i, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            blank += 1;
            continue;
        }
        records.push(DocumentRecord {
            line: i + 1,
            body: line.to_string(),
        });
    }

    debug!("Skipped {} blank lines", blank);
    info!("Extracted {} records from {} bytes", records.len(), content.bytes.len());
    records
}
