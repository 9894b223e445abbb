// Replay recording: collects match messages and compresses them for storage.

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{Read, Write};
use std::path::Path;

/// Collects raw JSON match messages and compresses them on finish.
#[derive(Debug, Default)]
pub struct ReplayRecorder {
    messages: Vec<String>,
}

impl ReplayRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a raw JSON message string.
    pub fn record_message(&mut self, msg: &str) {
        self.messages.push(msg.to_string());
    }

    /// Record any serializable message. Serialization failures are logged and skipped.
    pub fn record<T: serde::Serialize>(&mut self, msg: &T) {
        match serde_json::to_string(msg) {
            Ok(json) => self.messages.push(json),
            Err(e) => tracing::warn!("Failed to serialize replay message: {e}"),
        }
    }

    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    /// Compress all recorded messages into a gzipped JSON array.
    pub fn finish(&self) -> Result<Vec<u8>, std::io::Error> {
        // every message is already valid JSON
        let mut json = String::from("[");
        for (i, msg) in self.messages.iter().enumerate() {
            if i > 0 {
                json.push(',');
            }
            json.push_str(msg);
        }
        json.push(']');

        let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
        encoder.write_all(json.as_bytes())?;
        encoder.finish()
    }

    /// Compress and write to `path`.
    pub fn save(&self, path: &Path) -> Result<(), std::io::Error> {
        std::fs::write(path, self.finish()?)
    }
}

/// Decompress gzipped replay data back to the JSON string.
pub fn decompress_replay(data: &[u8]) -> Result<String, std::io::Error> {
    let mut decoder = GzDecoder::new(data);
    let mut result = String::new();
    decoder.read_to_string(&mut result)?;
    Ok(result)
}
