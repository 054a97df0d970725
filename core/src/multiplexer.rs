/// Stream multiplexer: one inbound feed, many views
///
/// Inbound payloads are dispatched one at a time by the transport reader
/// task. Each message goes to its conversation's topic (if anyone ever asked
/// for it) and always to the cross-conversation topic.
///
/// The per-conversation registry only grows while a connection lives; it is
/// cleared as a whole when the transport disconnects. A long-lived process
/// hopping across many conversations in one session keeps one entry per
/// conversation visited.
use crate::chat_types::{ConversationId, Message};
use crate::utils::{Subscription, Topic};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

pub struct StreamMultiplexer {
    conversations: Mutex<HashMap<ConversationId, Arc<Topic<Message>>>>,
    all: Topic<(ConversationId, Message)>,
    dropped: AtomicU64,
}

impl StreamMultiplexer {
    pub fn new() -> Self {
        Self {
            conversations: Mutex::new(HashMap::new()),
            all: Topic::new(),
            dropped: AtomicU64::new(0),
        }
    }

    /// The live topic of a conversation. Repeated calls return the same topic.
    pub fn topic_for(&self, conversation_id: ConversationId) -> Arc<Topic<Message>> {
        self.registry()
            .entry(conversation_id)
            .or_insert_with(|| {
                debug!("Registered live stream for conversation {}", conversation_id);
                Arc::new(Topic::new())
            })
            .clone()
    }

    /// Subscribe to a conversation's live messages. Hot: nothing is replayed.
    pub fn stream_for(&self, conversation_id: ConversationId) -> Subscription<Message> {
        self.topic_for(conversation_id).subscribe()
    }

    /// Every inbound message, in arrival order
    pub fn all_stream(&self) -> Subscription<(ConversationId, Message)> {
        self.all.subscribe()
    }

    /// Parse and dispatch one raw inbound payload. Malformed payloads are
    /// counted and dropped.
    pub fn dispatch_raw(&self, body: &str) -> bool {
        match Message::from_json(body) {
            Ok(message) => {
                self.dispatch(message);
                true
            }
            Err(e) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!("Dropping malformed inbound message: {}", e);
                false
            }
        }
    }

    pub fn dispatch(&self, message: Message) {
        let conversation_id = message.conversation_id;
        let topic = self.registry().get(&conversation_id).cloned();
        if let Some(topic) = topic {
            topic.publish(message.clone());
        }
        self.all.publish((conversation_id, message));
    }

    /// Forget every per-conversation stream. Open subscriptions end.
    pub fn reset(&self) {
        let mut registry = self.registry();
        for topic in registry.values() {
            topic.close();
        }
        let count = registry.len();
        registry.clear();
        debug!("Cleared {} conversation streams", count);
    }

    pub fn registered_count(&self) -> usize {
        self.registry().len()
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn registry(&self) -> MutexGuard<'_, HashMap<ConversationId, Arc<Topic<Message>>>> {
        self.conversations.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for StreamMultiplexer {
    fn default() -> Self {
        Self::new()
    }
}
