use serde::{Deserialize, Serialize};

/// Coarse progress feed a front end consumes while an exchange runs.
/// Every variant carries the request id so interleaved feeds (a chat
/// stream and a model pull, say) stay attributable.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    // Lifecycle events
    Started {
        request_id: String,
        timestamp: i64,
    },

    // Content events
    TextChunk {
        request_id: String,
        chunk: String,
    },

    // Model-pull progress
    PullProgress {
        request_id: String,
        status: String,
        completed: Option<u64>,
        total: Option<u64>,
    },

    // Completion events
    Completed {
        request_id: String,
        final_result: String,
        timestamp: i64,
    },

    // Error events
    Error {
        request_id: String,
        error: String,
        recoverable: bool,
    },

    // Cancelled events
    Cancelled {
        request_id: String,
        reason: String,
    },
}

impl StreamEvent {
    /// True for the event that ends a feed; nothing follows it.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed { .. } | Self::Error { .. } | Self::Cancelled { .. }
        )
    }

    pub fn request_id(&self) -> &str {
        match self {
            Self::Started { request_id, .. }
            | Self::TextChunk { request_id, .. }
            | Self::PullProgress { request_id, .. }
            | Self::Completed { request_id, .. }
            | Self::Error { request_id, .. }
            | Self::Cancelled { request_id, .. } => request_id,
        }
    }
}
