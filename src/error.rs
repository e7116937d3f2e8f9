use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Storage error: {0}")]
    Storage(#[from] crate::storage::StorageError),

    #[error("API error: {0}")]
    Api(#[from] crate::http::ApiError),

    #[error("Conversation error: {0}")]
    Conversation(#[from] crate::conversation::ConversationError),

    #[error("Chat error: {0}")]
    Chat(#[from] crate::chat::ChatError),

    #[error("Server error: {0}")]
    Server(#[from] crate::server::ServerError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
