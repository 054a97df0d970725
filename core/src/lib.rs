/// ChatLink - real-time messaging session core
///
/// Session state, a persistent server transport, per-conversation message
/// windows and notification routing, wired together by `ChatContext`.

pub mod chat_types;
pub mod cli_app;
pub mod collaborators;
pub mod config;
pub mod context;
pub mod credential;
pub mod error;
pub mod history;
pub mod local_backend;
pub mod media;
pub mod multiplexer;
pub mod nav_stack;
pub mod notification;
pub mod rest_client;
pub mod session;
pub mod transport;
pub mod utils;

pub use config::Config;
pub use context::{ChatContext, Services};
pub use error::{ChatError, Result};
