use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// A photo known to the index.
///
/// The `uri` is the stable identifier used as the embedding cache key; it
/// must not change across runs or the cached vector becomes unreachable.
/// The embedding is attached opportunistically: a photo without one is
/// still valid for listing, it just never appears in similarity results.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Photo {
    pub uri: String,

    pub name: String,
    /// File size in bytes, 0 when unknown.
    pub size: u64,
    /// Capture or modification time as epoch milliseconds, 0 when unknown.
    pub date: i64,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

impl Photo {
    /// Case-insensitive substring match over name and metadata values.
    /// Presentation-level filtering only; similarity search does not use it.
    pub fn matches_text(&self, query: &str) -> bool {
        let query = query.trim().to_lowercase();
        if query.is_empty() {
            return true;
        }

        if self.name.to_lowercase().contains(&query) {
            return true;
        }

        self.metadata
            .values()
            .any(|value| value.to_lowercase().contains(&query))
    }
}
