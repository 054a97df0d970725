/// History manager: the loaded message window of one open conversation
///
/// The window combines paged backfill (prepended) with live arrivals
/// (appended). Live messages are assumed to be newer than anything a page can
/// return, because pages only extend backward from the moment the
/// conversation was opened. The window is therefore kept in time order
/// without sorting; a live message older than the current tail is appended
/// anyway and logged.
///
/// Every `open` starts a new epoch. Results of fetches and live messages that
/// belong to an older epoch are discarded, so nothing from a previously open
/// conversation leaks into the new window.
use crate::chat_types::{Conversation, ConversationId, Identity, Message, MessageKey, UserId};
use crate::collaborators::{ConversationDirectory, HistoryFetcher, UserDirectory};
use crate::error::{ChatError, Result};
use crate::multiplexer::StreamMultiplexer;
use crate::utils::{Subscription, Topic};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Change to the loaded window
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HistoryEvent {
    /// Window cleared for a newly opened conversation
    Reset(ConversationId),
    /// First page is in
    Loaded {
        conversation_id: ConversationId,
        count: usize,
    },
    /// Older messages were put in front
    Prepended { count: usize },
    Appended(Message),
}

/// Outcome of `load_older_page`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageLoad {
    pub appended: Vec<Message>,
    pub reached_start: bool,
}

#[derive(Default)]
struct Window {
    epoch: u64,
    conversation: Option<Conversation>,
    messages: Vec<Message>,
    authors: HashMap<UserId, Identity>,
    page: u32,
    reached_start: bool,
}

pub struct HistoryManager {
    fetcher: Arc<dyn HistoryFetcher>,
    conversations: Arc<dyn ConversationDirectory>,
    users: Arc<dyn UserDirectory>,
    multiplexer: Arc<StreamMultiplexer>,
    window: RwLock<Window>,
    page_lock: tokio::sync::Mutex<()>,
    forwarder: Mutex<Option<JoinHandle<()>>>,
    events: Topic<HistoryEvent>,
}

impl HistoryManager {
    pub fn new(
        fetcher: Arc<dyn HistoryFetcher>,
        conversations: Arc<dyn ConversationDirectory>,
        users: Arc<dyn UserDirectory>,
        multiplexer: Arc<StreamMultiplexer>,
    ) -> Arc<Self> {
        Arc::new(Self {
            fetcher,
            conversations,
            users,
            multiplexer,
            window: RwLock::new(Window::default()),
            page_lock: tokio::sync::Mutex::new(()),
            forwarder: Mutex::new(None),
            events: Topic::new(),
        })
    }

    /// Switch to a conversation: clear the window, load its newest page and
    /// follow its live stream.
    pub async fn open(self: &Arc<Self>, conversation_id: ConversationId) -> Result<()> {
        self.stop_forwarding();
        let epoch = {
            let mut window = self.write();
            let epoch = window.epoch + 1;
            *window = Window {
                epoch,
                ..Window::default()
            };
            epoch
        };
        self.events.publish(HistoryEvent::Reset(conversation_id));
        debug!("Opening conversation {} (epoch {})", conversation_id, epoch);

        let conversation = self.conversations.conversation(conversation_id).await?;
        let members: Vec<UserId> = conversation.member_ids.iter().copied().collect();
        let mut authors: HashMap<UserId, Identity> = self
            .users
            .users(&members)
            .await?
            .into_iter()
            .map(|identity| (identity.id, identity))
            .collect();

        // Subscribe before fetching so nothing falls between page 0 and the
        // live stream; arrivals that raced the fetch are merged below
        let mut live = self.multiplexer.stream_for(conversation_id);
        let mut page = self.fetcher.fetch(conversation_id, 0).await?;
        let loaded: HashSet<MessageKey> = page.iter().map(Message::key).collect();
        page.extend(live.drain().into_iter().filter(|m| !loaded.contains(&m.key())));

        let known: HashSet<UserId> = authors.keys().copied().collect();
        authors.extend(self.resolve_unseen(&page, &known).await?);

        let count = page.len();
        {
            let mut window = self.write();
            if window.epoch != epoch {
                debug!("Open of conversation {} superseded", conversation_id);
                return Ok(());
            }
            window.conversation = Some(conversation);
            window.messages = page;
            window.authors = authors;
        }
        self.start_forwarding(epoch, live);

        info!("Opened conversation {} with {} messages", conversation_id, count);
        self.events.publish(HistoryEvent::Loaded {
            conversation_id,
            count,
        });
        Ok(())
    }

    /// Fetch the next older page and prepend it. Once the start of history
    /// was reached this returns immediately without fetching. A failed fetch
    /// leaves the page counter untouched so the call can be retried.
    pub async fn load_older_page(&self) -> Result<PageLoad> {
        let _serial = self.page_lock.lock().await;

        let (conversation_id, epoch, page, known) = {
            let mut window = self.write();
            let conversation_id = window
                .conversation
                .as_ref()
                .map(|c| c.id)
                .ok_or(ChatError::NoConversation)?;
            if window.reached_start {
                return Ok(PageLoad {
                    appended: Vec::new(),
                    reached_start: true,
                });
            }
            window.page += 1;
            let known: HashSet<UserId> = window.authors.keys().copied().collect();
            (conversation_id, window.epoch, window.page, known)
        };

        let fetched = match self.fetcher.fetch(conversation_id, page).await {
            Ok(messages) => messages,
            Err(e) => {
                warn!("Fetching page {} of conversation {} failed: {}", page, conversation_id, e);
                self.rewind_page(epoch);
                return Err(e);
            }
        };

        if fetched.is_empty() {
            let mut window = self.write();
            if window.epoch == epoch {
                window.page -= 1;
                window.reached_start = true;
                debug!("Reached start of conversation {}", conversation_id);
            }
            return Ok(PageLoad {
                appended: Vec::new(),
                reached_start: true,
            });
        }

        let resolved = match self.resolve_unseen(&fetched, &known).await {
            Ok(resolved) => resolved,
            Err(e) => {
                self.rewind_page(epoch);
                return Err(e);
            }
        };

        let fresh = {
            let mut window = self.write();
            if window.epoch != epoch {
                debug!("Dropping page {} of conversation {}, window moved on", page, conversation_id);
                return Ok(PageLoad {
                    appended: Vec::new(),
                    reached_start: false,
                });
            }
            // Page offsets shift when messages arrive after opening
            let loaded: HashSet<MessageKey> = window.messages.iter().map(Message::key).collect();
            let fresh: Vec<Message> = fetched
                .into_iter()
                .filter(|m| !loaded.contains(&m.key()))
                .collect();
            window.authors.extend(resolved);
            window.messages.splice(0..0, fresh.iter().cloned());
            fresh
        };

        debug!("Prepended {} messages to conversation {}", fresh.len(), conversation_id);
        self.events.publish(HistoryEvent::Prepended { count: fresh.len() });
        Ok(PageLoad {
            appended: fresh,
            reached_start: false,
        })
    }

    /// Append a live message to the tail of the window. Returns false when it
    /// belongs to a conversation that is not open.
    pub async fn on_live_message(&self, message: Message) -> bool {
        let epoch = self.read().epoch;
        self.append_live(epoch, message).await
    }

    pub fn messages(&self) -> Vec<Message> {
        self.read().messages.clone()
    }

    pub fn author(&self, id: UserId) -> Option<Identity> {
        self.read().authors.get(&id).cloned()
    }

    pub fn conversation(&self) -> Option<Conversation> {
        self.read().conversation.clone()
    }

    pub fn reached_start(&self) -> bool {
        self.read().reached_start
    }

    /// Index of the oldest page loaded so far
    pub fn current_page(&self) -> u32 {
        self.read().page
    }

    pub fn updates(&self) -> Subscription<HistoryEvent> {
        self.events.subscribe()
    }

    /// Stop following the open conversation and clear the window
    pub fn close(&self) {
        self.stop_forwarding();
        let mut window = self.write();
        let epoch = window.epoch + 1;
        *window = Window {
            epoch,
            ..Window::default()
        };
    }

    async fn append_live(&self, epoch: u64, message: Message) -> bool {
        let known_author = {
            let window = self.read();
            if window.epoch != epoch {
                return false;
            }
            match &window.conversation {
                Some(c) if c.id == message.conversation_id => {}
                _ => return false,
            }
            window.authors.contains_key(&message.author_id)
        };

        let mut resolved = None;
        if !known_author {
            match self.users.user(message.author_id).await {
                Ok(identity) => resolved = Some(identity),
                Err(e) => warn!("Could not resolve author {}: {}", message.author_id, e),
            }
        }

        {
            let mut window = self.write();
            if window.epoch != epoch {
                return false;
            }
            if let Some(identity) = resolved {
                window.authors.insert(identity.id, identity);
            }
            let tail = window.messages.last().and_then(|m| m.timestamp);
            if let (Some(tail), Some(ts)) = (tail, message.timestamp) {
                if ts < tail {
                    debug!(
                        "Live message in conversation {} is older than the window tail",
                        message.conversation_id
                    );
                }
            }
            window.messages.push(message.clone());
        }

        self.events.publish(HistoryEvent::Appended(message));
        true
    }

    /// Look up authors that are not part of `known`, such as former members
    async fn resolve_unseen(
        &self,
        messages: &[Message],
        known: &HashSet<UserId>,
    ) -> Result<HashMap<UserId, Identity>> {
        let unseen: BTreeSet<UserId> = messages
            .iter()
            .map(|m| m.author_id)
            .filter(|id| !known.contains(id))
            .collect();
        let mut resolved = HashMap::new();
        for id in unseen {
            debug!("Resolving author {} outside the member list", id);
            let identity = self.users.user(id).await?;
            resolved.insert(id, identity);
        }
        Ok(resolved)
    }

    fn rewind_page(&self, epoch: u64) {
        let mut window = self.write();
        if window.epoch == epoch && window.page > 0 {
            window.page -= 1;
        }
    }

    fn start_forwarding(self: &Arc<Self>, epoch: u64, mut live: Subscription<Message>) {
        let manager: Weak<Self> = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            while let Some(message) = live.recv().await {
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                if !manager.append_live(epoch, message).await && manager.read().epoch != epoch {
                    break;
                }
            }
        });
        if let Some(previous) = self.forwarder_slot().replace(handle) {
            previous.abort();
        }
    }

    fn stop_forwarding(&self) {
        if let Some(handle) = self.forwarder_slot().take() {
            handle.abort();
        }
    }

    fn forwarder_slot(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.forwarder.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn read(&self) -> RwLockReadGuard<'_, Window> {
        self.window.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Window> {
        self.window.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for HistoryManager {
    fn drop(&mut self) {
        self.stop_forwarding();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local_backend::LocalBackend;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    /// Counts fetches and can be told to fail the next one
    struct CountingFetcher {
        inner: Arc<LocalBackend>,
        fetches: AtomicUsize,
        fail_next: AtomicBool,
    }

    #[async_trait]
    impl HistoryFetcher for CountingFetcher {
        async fn fetch(&self, conversation_id: ConversationId, page: u32) -> Result<Vec<Message>> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if self.fail_next.swap(false, Ordering::SeqCst) {
                return Err(ChatError::Connection("reset by peer".into()));
            }
            self.inner.fetch(conversation_id, page).await
        }
    }

    struct Fixture {
        backend: Arc<LocalBackend>,
        fetcher: Arc<CountingFetcher>,
        multiplexer: Arc<StreamMultiplexer>,
        history: Arc<HistoryManager>,
    }

    fn fixture(page_size: usize) -> Fixture {
        let backend = Arc::new(LocalBackend::with_page_size(page_size));
        backend.add_user(Identity::new(1, "Ada"));
        backend.add_user(Identity::new(2, "Bob"));
        backend.add_user(Identity::new(3, "Cy"));
        backend.add_conversation(ConversationId(1), "one", UserId(1), &[UserId(1), UserId(2)]);
        backend.add_conversation(ConversationId(2), "two", UserId(1), &[UserId(1), UserId(2)]);

        let fetcher = Arc::new(CountingFetcher {
            inner: backend.clone(),
            fetches: AtomicUsize::new(0),
            fail_next: AtomicBool::new(false),
        });
        let multiplexer = Arc::new(StreamMultiplexer::new());
        let history = HistoryManager::new(
            fetcher.clone(),
            backend.clone(),
            backend.clone(),
            multiplexer.clone(),
        );
        Fixture {
            backend,
            fetcher,
            multiplexer,
            history,
        }
    }

    fn texts(messages: &[Message]) -> Vec<String> {
        messages.iter().map(|m| m.content.to_payload()).collect()
    }

    async fn next_appended(updates: &mut Subscription<HistoryEvent>) -> Message {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(2), updates.recv())
                .await
                .expect("timed out waiting for history event")
                .expect("history events closed");
            if let HistoryEvent::Appended(message) = event {
                return message;
            }
        }
    }

    #[tokio::test]
    async fn test_open_loads_newest_page() {
        let f = fixture(2);
        for i in 0..3 {
            f.backend.post(Message::text(ConversationId(1), UserId(2), format!("m{}", i)));
        }

        f.history.open(ConversationId(1)).await.unwrap();

        assert_eq!(texts(&f.history.messages()), vec!["m1", "m2"]);
        assert_eq!(f.history.current_page(), 0);
        assert_eq!(f.history.author(UserId(2)).map(|i| i.display_name), Some("Bob".into()));
    }

    #[tokio::test]
    async fn test_older_pages_prepend_until_exhausted() {
        let f = fixture(2);
        for i in 0..3 {
            f.backend.post(Message::text(ConversationId(1), UserId(2), format!("m{}", i)));
        }
        f.history.open(ConversationId(1)).await.unwrap();

        let load = f.history.load_older_page().await.unwrap();
        assert_eq!(texts(&load.appended), vec!["m0"]);
        assert!(!load.reached_start);
        assert_eq!(texts(&f.history.messages()), vec!["m0", "m1", "m2"]);

        let load = f.history.load_older_page().await.unwrap();
        assert!(load.reached_start);
        assert!(f.history.reached_start());
        assert_eq!(f.history.current_page(), 1);

        let before = f.fetcher.fetches.load(Ordering::SeqCst);
        let load = f.history.load_older_page().await.unwrap();
        assert!(load.reached_start);
        assert_eq!(f.fetcher.fetches.load(Ordering::SeqCst), before);
    }

    #[tokio::test]
    async fn test_failed_fetch_is_retryable() {
        let f = fixture(1);
        f.backend.post(Message::text(ConversationId(1), UserId(2), "old"));
        f.backend.post(Message::text(ConversationId(1), UserId(2), "new"));
        f.history.open(ConversationId(1)).await.unwrap();

        f.fetcher.fail_next.store(true, Ordering::SeqCst);
        let err = f.history.load_older_page().await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(f.history.current_page(), 0);
        assert!(!f.history.reached_start());

        let load = f.history.load_older_page().await.unwrap();
        assert_eq!(texts(&load.appended), vec!["old"]);
    }

    #[tokio::test]
    async fn test_load_older_without_open_conversation() {
        let f = fixture(2);
        assert!(matches!(
            f.history.load_older_page().await,
            Err(ChatError::NoConversation)
        ));
    }

    #[tokio::test]
    async fn test_former_member_is_resolved() {
        let f = fixture(5);
        f.backend.post(Message::text(ConversationId(1), UserId(3), "I left"));
        f.history.open(ConversationId(1)).await.unwrap();
        assert_eq!(f.history.author(UserId(3)).map(|i| i.display_name), Some("Cy".into()));
    }

    #[tokio::test]
    async fn test_live_messages_append_to_tail() {
        let f = fixture(5);
        f.backend.post(Message::text(ConversationId(1), UserId(2), "paged"));
        f.history.open(ConversationId(1)).await.unwrap();
        let mut updates = f.history.updates();

        let live = f.backend.post(Message::text(ConversationId(1), UserId(3), "live"));
        f.multiplexer.dispatch(live);

        let appended = next_appended(&mut updates).await;
        assert_eq!(appended.content.to_payload(), "live");
        assert_eq!(texts(&f.history.messages()), vec!["paged", "live"]);
        assert!(f.history.author(UserId(3)).is_some());
    }

    #[tokio::test]
    async fn test_switching_conversation_drops_old_stream() {
        let f = fixture(5);
        f.history.open(ConversationId(1)).await.unwrap();
        f.history.open(ConversationId(2)).await.unwrap();
        let mut updates = f.history.updates();

        f.multiplexer
            .dispatch(f.backend.post(Message::text(ConversationId(1), UserId(2), "stale")));
        f.multiplexer
            .dispatch(f.backend.post(Message::text(ConversationId(2), UserId(2), "fresh")));

        let appended = next_appended(&mut updates).await;
        assert_eq!(appended.conversation_id, ConversationId(2));
        assert_eq!(texts(&f.history.messages()), vec!["fresh"]);
    }

    #[tokio::test]
    async fn test_on_live_message_rejects_other_conversation() {
        let f = fixture(5);
        f.history.open(ConversationId(1)).await.unwrap();
        assert!(!f.history.on_live_message(Message::text(ConversationId(2), UserId(2), "x")).await);
        assert!(f.history.on_live_message(Message::text(ConversationId(1), UserId(2), "y")).await);
        assert_eq!(texts(&f.history.messages()), vec!["y"]);
    }

    #[tokio::test]
    async fn test_backfill_skips_messages_already_loaded() {
        let f = fixture(2);
        f.backend.post(Message::text(ConversationId(1), UserId(2), "a"));
        f.backend.post(Message::text(ConversationId(1), UserId(2), "b"));
        f.history.open(ConversationId(1)).await.unwrap();

        // Two newer messages shift page 1 onto what page 0 returned
        for text in ["c", "d"] {
            let message = f.backend.post(Message::text(ConversationId(1), UserId(2), text));
            assert!(f.history.on_live_message(message).await);
        }

        let load = f.history.load_older_page().await.unwrap();
        assert!(load.appended.is_empty());
        assert_eq!(texts(&f.history.messages()), vec!["a", "b", "c", "d"]);
    }

    #[tokio::test]
    async fn test_unresolvable_live_author_is_still_appended() {
        let f = fixture(5);
        f.history.open(ConversationId(1)).await.unwrap();

        // User 9 is unknown to the directory
        let message = f.backend.post(Message::text(ConversationId(1), UserId(9), "ghost"));
        assert!(f.history.on_live_message(message).await);

        assert_eq!(texts(&f.history.messages()), vec!["ghost"]);
        assert!(f.history.author(UserId(9)).is_none());
    }

    #[tokio::test]
    async fn test_unresolvable_backfill_author_fails_the_page() {
        let f = fixture(1);
        f.backend.post(Message::text(ConversationId(1), UserId(9), "ghost"));
        f.backend.post(Message::text(ConversationId(1), UserId(2), "known"));
        f.history.open(ConversationId(1)).await.unwrap();

        let err = f.history.load_older_page().await.unwrap_err();
        assert!(matches!(err, ChatError::NotFound(_)));
        assert_eq!(f.history.current_page(), 0);
        assert!(!f.history.reached_start());
        assert_eq!(texts(&f.history.messages()), vec!["known"]);

        // Once the author is known the same page loads
        f.backend.add_user(Identity::new(9, "Gone"));
        let load = f.history.load_older_page().await.unwrap();
        assert_eq!(texts(&load.appended), vec!["ghost"]);
        assert_eq!(f.history.current_page(), 1);
    }

    #[tokio::test]
    async fn test_open_emits_reset_then_loaded() {
        let f = fixture(5);
        let mut updates = f.history.updates();
        f.history.open(ConversationId(2)).await.unwrap();
        assert_eq!(
            updates.drain(),
            vec![
                HistoryEvent::Reset(ConversationId(2)),
                HistoryEvent::Loaded {
                    conversation_id: ConversationId(2),
                    count: 0
                }
            ]
        );
    }
}
