/// Shared types for the chat session core
use crate::error::{ChatError, Result};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Numeric id of a user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub i64);

/// Numeric id of a conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(pub i64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The authenticated user as seen by the session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: UserId,
    pub display_name: String,
    pub roles: BTreeSet<String>,
}

impl Identity {
    pub fn new(id: i64, display_name: impl Into<String>) -> Self {
        Self {
            id: UserId(id),
            display_name: display_name.into(),
            roles: BTreeSet::new(),
        }
    }

    pub fn with_roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.roles = roles.into_iter().map(Into::into).collect();
        self
    }
}

/// A chat thread
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub title: String,
    pub owner_id: UserId,
    pub member_ids: BTreeSet<UserId>,
}

impl Conversation {
    /// Exactly two members
    pub fn is_direct(&self) -> bool {
        self.member_ids.len() == 2
    }

    /// More than two members
    pub fn is_group(&self) -> bool {
        self.member_ids.len() > 2
    }
}

/// Kind tag as it appears on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MessageKind {
    Text,
    Image,
}

/// Reference to an uploaded image
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    pub resource_id: String,
    pub width: u32,
    pub height: u32,
}

/// Message body, decided once at construction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageContent {
    Text(String),
    Image(ImageRef),
}

impl MessageContent {
    pub fn kind(&self) -> MessageKind {
        match self {
            MessageContent::Text(_) => MessageKind::Text,
            MessageContent::Image(_) => MessageKind::Image,
        }
    }

    /// Text payload as sent on the wire
    pub fn to_payload(&self) -> String {
        match self {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Image(image) => serde_json::json!({
                "id": image.resource_id,
                "dimensions": { "width": image.width, "height": image.height },
            })
            .to_string(),
        }
    }

    /// Rebuild content from a wire payload and its kind tag
    pub fn from_payload(kind: MessageKind, payload: String) -> Result<Self> {
        match kind {
            MessageKind::Text => Ok(MessageContent::Text(payload)),
            MessageKind::Image => {
                let raw: ImagePayload = serde_json::from_str(&payload)?;
                Ok(MessageContent::Image(ImageRef {
                    resource_id: raw.id,
                    width: raw.dimensions.width,
                    height: raw.dimensions.height,
                }))
            }
        }
    }
}

#[derive(Deserialize)]
struct ImagePayload {
    id: String,
    dimensions: Dimensions,
}

#[derive(Deserialize)]
struct Dimensions {
    width: u32,
    height: u32,
}

/// One chat message. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub conversation_id: ConversationId,
    pub author_id: UserId,
    /// Assigned by the server; outbound messages have none
    pub timestamp: Option<DateTime<Utc>>,
    pub content: MessageContent,
}

/// Identity of a message inside a conversation window
pub type MessageKey = (ConversationId, Option<i64>, UserId);

impl Message {
    pub fn text(conversation_id: ConversationId, author_id: UserId, text: impl Into<String>) -> Self {
        Self {
            conversation_id,
            author_id,
            timestamp: None,
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn kind(&self) -> MessageKind {
        self.content.kind()
    }

    pub fn key(&self) -> MessageKey {
        (
            self.conversation_id,
            self.timestamp.map(|t| t.timestamp_millis()),
            self.author_id,
        )
    }

    /// Parse a JSON wire message
    pub fn from_json(raw: &str) -> Result<Self> {
        let wire: WireMessage = serde_json::from_str(raw)?;
        wire.into_message()
    }

    pub fn to_wire(&self) -> WireMessage {
        WireMessage {
            chat_id: Some(self.conversation_id),
            author_id: self.author_id,
            timestamp: self.timestamp.map(|t| t.timestamp_millis()),
            content: self.content.to_payload(),
            kind: self.kind(),
        }
    }
}

/// Message as serialized by the backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<ConversationId>,
    pub author_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    pub content: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
}

impl WireMessage {
    /// Validate and convert; fails for a missing chat id or a bad image payload
    pub fn into_message(self) -> Result<Message> {
        let conversation_id = self
            .chat_id
            .ok_or_else(|| ChatError::Protocol("message without chatId".to_string()))?;
        let timestamp = match self.timestamp {
            Some(ms) => Some(Utc.timestamp_millis_opt(ms).single().ok_or_else(|| {
                ChatError::Protocol(format!("timestamp out of range: {}", ms))
            })?),
            None => None,
        };
        Ok(Message {
            conversation_id,
            author_id: self.author_id,
            timestamp,
            content: MessageContent::from_payload(self.kind, self.content)?,
        })
    }
}

/// User record as returned by the REST API
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRecord {
    pub id: i64,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub roles: Vec<RoleRecord>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RoleRecord {
    #[serde(default)]
    pub name: Option<String>,
}

impl From<UserRecord> for Identity {
    fn from(user: UserRecord) -> Self {
        let display_name = format!("{} {}", user.first_name, user.last_name)
            .trim()
            .to_string();
        Identity {
            id: UserId(user.id),
            display_name,
            roles: user.roles.into_iter().filter_map(|r| r.name).collect(),
        }
    }
}

/// Chat record as returned by the REST API
#[derive(Debug, Clone, Deserialize)]
pub struct ChatRecord {
    pub id: i64,
    #[serde(default)]
    pub name: String,
    pub owner: UserRecord,
    #[serde(default)]
    pub members: Vec<UserRecord>,
}

impl From<ChatRecord> for Conversation {
    fn from(chat: ChatRecord) -> Self {
        Conversation {
            id: ConversationId(chat.id),
            title: chat.name,
            owner_id: UserId(chat.owner.id),
            member_ids: chat.members.iter().map(|m| UserId(m.id)).collect(),
        }
    }
}
