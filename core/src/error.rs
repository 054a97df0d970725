/// Error types for the chat session core
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChatError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Handshake rejected: {0}")]
    Handshake(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("HTTP {status} from {path}")]
    HttpStatus { status: u16, path: String },

    #[error("Invalid token: {0}")]
    InvalidToken(String),

    /// Transport connect attempted without a valid credential. Callers must
    /// only connect while the session is authenticated.
    #[error("No credential available, cannot open transport")]
    NoCredential,

    #[error("Transport is not connected")]
    NotConnected,

    #[error("No conversation is open")]
    NoConversation,

    #[error("Not found: {0}")]
    NotFound(String),
}

impl ChatError {
    /// Whether repeating the failed call may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            ChatError::Io(_) | ChatError::Connection(_) | ChatError::Http(_) => true,
            ChatError::HttpStatus { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, ChatError>;
