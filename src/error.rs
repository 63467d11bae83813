use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("failed to decode frame: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("frame is missing field '{0}'")]
    MissingField(&'static str),

    #[error("transport is not connected")]
    NotConnected,

    #[error("no message with id '{0}' in the timeline")]
    UnknownMessage(String),

    #[error("message '{0}' can no longer be deleted")]
    DeleteNotAllowed(String),

    #[error("no active conversation")]
    NoConversation,

    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type ChatResult<T> = std::result::Result<T, ChatError>;
