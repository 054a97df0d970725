/// Interfaces to the services the session core depends on
///
/// `RestClient` implements these against the HTTP API, `LocalBackend`
/// implements them in memory.
use crate::chat_types::{Conversation, ConversationId, Identity, Message, UserId};
use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;

/// Credential exchange and identity resolution
#[async_trait]
pub trait AuthApi: Send + Sync {
    /// Exchange username/password for a raw bearer token.
    /// `Ok(None)` means the credentials were rejected.
    async fn login(&self, username: &str, password: &str) -> Result<Option<String>>;

    /// Identity behind a token
    async fn current_user(&self, token: &str) -> Result<Identity>;

    /// Invalidate a token server-side
    async fn revoke(&self, token: &str) -> Result<()>;
}

/// Paged message history, page 0 is the most recent
#[async_trait]
pub trait HistoryFetcher: Send + Sync {
    /// Messages of one page in ascending time order; empty means no more history
    async fn fetch(&self, conversation_id: ConversationId, page: u32) -> Result<Vec<Message>>;
}

#[async_trait]
pub trait ConversationDirectory: Send + Sync {
    async fn conversation(&self, id: ConversationId) -> Result<Conversation>;
}

#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn user(&self, id: UserId) -> Result<Identity>;

    async fn users(&self, ids: &[UserId]) -> Result<Vec<Identity>> {
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            out.push(self.user(*id).await?);
        }
        Ok(out)
    }
}

/// Binary blobs addressed by opaque string ids
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// `Ok(None)` when no resource exists under `id`
    async fn download(&self, id: &str) -> Result<Option<Bytes>>;

    async fn upload(&self, data: Bytes, file_name: &str) -> Result<String>;
}
