// Request/response collaborators the sync engine consumes
// History paging and file upload are plain REST calls owned elsewhere; the
// engine only needs these two shapes.

use anyhow::Result;
use async_trait::async_trait;
use std::path::Path;

use crate::models::{Attachment, Message};

/// Which page of history to fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryQuery {
    pub conversation_id: String,
    /// Fetch messages older than this id; `None` for the newest page.
    pub before: Option<String>,
    pub limit: usize,
}

impl HistoryQuery {
    pub fn latest(conversation_id: &str) -> Self {
        HistoryQuery {
            conversation_id: conversation_id.to_string(),
            before: None,
            limit: 50,
        }
    }

    /// The page just older than `message_id`.
    pub fn before(conversation_id: &str, message_id: &str) -> Self {
        HistoryQuery {
            before: Some(message_id.to_string()),
            ..HistoryQuery::latest(conversation_id)
        }
    }
}

#[async_trait]
pub trait HistoryProvider: Send + Sync {
    /// Messages in ascending time order.
    async fn fetch_history(&self, query: &HistoryQuery) -> Result<Vec<Message>>;
}

#[async_trait]
pub trait Uploader: Send + Sync {
    /// Upload a local file; the returned descriptor is sent verbatim.
    async fn upload(&self, path: &Path) -> Result<Attachment>;
}
