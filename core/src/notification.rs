/// Notification router: decides which inbound messages interrupt the user
///
/// A message produces a notification only when someone is logged in, the
/// author is somebody else, and its conversation is not the one on screen.
/// Every qualifying message yields exactly one notification; nothing is
/// batched.
use crate::chat_types::{ConversationId, Message, MessageContent};
use crate::config::Config;
use crate::session::SessionState;
use crate::utils::{Subscription, Topic};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

/// Label of the navigation action
pub const ACTION_LABEL: &str = "To chat";

/// Shown instead of the payload of image messages
pub const IMAGE_PHRASE: &str = "An image message has been received!";

const TRUNCATION_MARKER: &str = " [...]";

/// Which conversation is on screen, if any
#[derive(Clone)]
pub struct ActiveView {
    current: Arc<watch::Sender<Option<ConversationId>>>,
}

impl ActiveView {
    pub fn new() -> Self {
        let (current, _) = watch::channel(None);
        Self {
            current: Arc::new(current),
        }
    }

    pub fn set_viewing(&self, conversation_id: Option<ConversationId>) {
        self.current.send_replace(conversation_id);
    }

    pub fn current(&self) -> Option<ConversationId> {
        *self.current.borrow()
    }

    pub fn watch(&self) -> watch::Receiver<Option<ConversationId>> {
        self.current.subscribe()
    }
}

impl Default for ActiveView {
    fn default() -> Self {
        Self::new()
    }
}

/// One auto-expiring, actionable notice
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub id: Uuid,
    pub conversation_id: ConversationId,
    pub text: String,
    pub action_label: &'static str,
    pub duration: Duration,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    /// Conversation to navigate to when the action is taken
    pub fn target(&self) -> ConversationId {
        self.conversation_id
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        match chrono::Duration::from_std(self.duration) {
            Ok(duration) => now >= self.created_at + duration,
            Err(_) => false,
        }
    }
}

pub struct NotificationRouter {
    session: Arc<SessionState>,
    view: ActiveView,
    preview_chars: usize,
    duration: Duration,
    sink: Topic<Notification>,
}

impl NotificationRouter {
    pub fn new(config: &Config, session: Arc<SessionState>, view: ActiveView) -> Self {
        Self {
            session,
            view,
            preview_chars: config.notification_preview_chars,
            duration: config.notification_duration,
            sink: Topic::new(),
        }
    }

    /// Notification for `message`, or `None` when it must not interrupt
    pub fn evaluate(&self, conversation_id: ConversationId, message: &Message) -> Option<Notification> {
        let identity = self.session.identity()?;
        if message.author_id == identity.id {
            return None;
        }
        if self.view.current() == Some(conversation_id) {
            return None;
        }
        Some(Notification {
            id: Uuid::new_v4(),
            conversation_id,
            text: self.shape_text(&message.content),
            action_label: ACTION_LABEL,
            duration: self.duration,
            created_at: Utc::now(),
        })
    }

    /// Evaluate and publish. Returns whether a notification was emitted.
    pub fn route(&self, conversation_id: ConversationId, message: &Message) -> bool {
        match self.evaluate(conversation_id, message) {
            Some(notification) => {
                info!("Notifying about message in conversation {}", conversation_id);
                self.sink.publish(notification);
                true
            }
            None => {
                debug!("No notification for message in conversation {}", conversation_id);
                false
            }
        }
    }

    /// Route every message of `feed` until it ends
    pub fn spawn(self: &Arc<Self>, mut feed: Subscription<(ConversationId, Message)>) -> JoinHandle<()> {
        let router = self.clone();
        tokio::spawn(async move {
            while let Some((conversation_id, message)) = feed.recv().await {
                router.route(conversation_id, &message);
            }
        })
    }

    pub fn notifications(&self) -> Subscription<Notification> {
        self.sink.subscribe()
    }

    fn shape_text(&self, content: &MessageContent) -> String {
        match content {
            MessageContent::Text(text) => {
                format!("New chat message: \"{}\"", shape_preview(text, self.preview_chars))
            }
            MessageContent::Image(_) => IMAGE_PHRASE.to_string(),
        }
    }
}

/// First `max_chars` characters plus a marker when the text is longer
pub fn shape_preview(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}{}", &text[..cut], TRUNCATION_MARKER),
        None => text.to_string(),
    }
}
