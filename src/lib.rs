pub mod api;
pub mod config;
pub mod error;
pub mod events;
pub mod models;
pub mod poll;
pub mod session;
pub mod stream;
pub mod transcript;

pub use crate::api::ApiClient;
pub use crate::config::ChatConfig;
pub use crate::error::{AppError, ErrorCode, Result};
pub use crate::events::StreamEvent;
pub use crate::poll::StatusPoller;
pub use crate::session::{CancellationToken, ChatSession, RequestManager, SubmitOptions};
pub use crate::transcript::{EntryHandle, EntryStatus, MessageEntry, Role, Transcript};
