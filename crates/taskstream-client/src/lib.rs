mod sse;
mod store;
mod sync;

pub use sse::{frames, parse_sse_frame, SseDecoder, SseFrame};
pub use store::{TaskPatch, TaskStore};
pub use sync::{ClientSynchronizer, SyncEvent};

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("invalid response body: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("task {0} is not tracked by this client")]
    UnknownTask(String),
}
