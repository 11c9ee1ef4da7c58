use serde::{Deserialize, Serialize};

/// Bulk request sizing for both dumps and change streams.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct BatchConfig {
    /// Number of documents per bulk request.
    ///
    /// A request is sent once the buffered bulk lines reach twice this value, since an index
    /// operation takes an action line plus a document line.
    pub bulk_size: usize,
    /// Milliseconds after the first buffered operation before a partial buffer is sent.
    #[serde(default = "default_idle_flush_ms")]
    pub idle_flush_ms: u64,
}

fn default_idle_flush_ms() -> u64 {
    500
}

impl BatchConfig {
    /// Bulk lines that trigger a size based flush.
    pub fn max_buffered_lines(&self) -> usize {
        self.bulk_size.saturating_mul(2)
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            bulk_size: 500,
            idle_flush_ms: default_idle_flush_ms(),
        }
    }
}
