/// Chat context: the one place where the session core is wired together
///
/// A process builds exactly one `ChatContext` at startup and hands it (or the
/// parts it exposes) to everything else. The transport is only ever connected
/// and disconnected by the binder started in `start`.
use crate::chat_types::{ConversationId, MessageContent};
use crate::collaborators::{AuthApi, ConversationDirectory, HistoryFetcher, ResourceStore, UserDirectory};
use crate::config::Config;
use crate::credential::CredentialStore;
use crate::error::{ChatError, Result};
use crate::history::HistoryManager;
use crate::media::MediaResolver;
use crate::multiplexer::StreamMultiplexer;
use crate::nav_stack::NavigationStack;
use crate::notification::{ActiveView, NotificationRouter};
use crate::session::SessionState;
use crate::transport::{self, TransportChannel};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// External services the core talks to
#[derive(Clone)]
pub struct Services {
    pub auth: Arc<dyn AuthApi>,
    pub history: Arc<dyn HistoryFetcher>,
    pub conversations: Arc<dyn ConversationDirectory>,
    pub users: Arc<dyn UserDirectory>,
    pub resources: Arc<dyn ResourceStore>,
    pub credentials: Arc<dyn CredentialStore>,
}

impl Services {
    /// All interfaces served by one backend object
    pub fn from_backend<B>(backend: Arc<B>, credentials: Arc<dyn CredentialStore>) -> Self
    where
        B: AuthApi + HistoryFetcher + ConversationDirectory + UserDirectory + ResourceStore + 'static,
    {
        Self {
            auth: backend.clone(),
            history: backend.clone(),
            conversations: backend.clone(),
            users: backend.clone(),
            resources: backend,
            credentials,
        }
    }
}

pub struct ChatContext {
    config: Config,
    services: Services,
    session: Arc<SessionState>,
    multiplexer: Arc<StreamMultiplexer>,
    transport: Arc<TransportChannel>,
    router: Arc<NotificationRouter>,
    active_view: ActiveView,
    media: Arc<MediaResolver>,
    navigation: NavigationStack,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ChatContext {
    pub fn new(config: Config, services: Services) -> Self {
        let session = Arc::new(SessionState::new(
            services.auth.clone(),
            services.credentials.clone(),
        ));
        let multiplexer = Arc::new(StreamMultiplexer::new());
        let transport = Arc::new(TransportChannel::new(
            &config,
            session.clone(),
            multiplexer.clone(),
        ));
        let active_view = ActiveView::new();
        let router = Arc::new(NotificationRouter::new(
            &config,
            session.clone(),
            active_view.clone(),
        ));
        let media = Arc::new(MediaResolver::new(services.resources.clone()));

        Self {
            config,
            services,
            session,
            multiplexer,
            transport,
            router,
            active_view,
            media,
            navigation: NavigationStack::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Start routing notifications, bind the transport to the session and
    /// resolve the stored credential. Both consumers subscribe before the
    /// first session change, so nothing the initial connection delivers is
    /// missed.
    pub async fn start(&self) {
        let router = self.router.spawn(self.multiplexer.all_stream());
        let binder = transport::bind(&self.session, self.transport.clone());
        self.tasks().extend([router, binder]);
        self.session.initialize().await;
        info!("Chat context started");
    }

    /// A fresh history window for one view
    pub fn history(&self) -> Arc<HistoryManager> {
        HistoryManager::new(
            self.services.history.clone(),
            self.services.conversations.clone(),
            self.services.users.clone(),
            self.multiplexer.clone(),
        )
    }

    /// Send as the logged-in user. Fails with `NoCredential` when signed out.
    pub async fn send(&self, conversation_id: ConversationId, content: MessageContent) -> Result<()> {
        let identity = self.session.identity().ok_or(ChatError::NoCredential)?;
        self.transport.send(conversation_id, identity.id, content).await
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn session(&self) -> &Arc<SessionState> {
        &self.session
    }

    pub fn multiplexer(&self) -> &Arc<StreamMultiplexer> {
        &self.multiplexer
    }

    pub fn transport(&self) -> &Arc<TransportChannel> {
        &self.transport
    }

    pub fn router(&self) -> &Arc<NotificationRouter> {
        &self.router
    }

    pub fn active_view(&self) -> &ActiveView {
        &self.active_view
    }

    pub fn media(&self) -> &Arc<MediaResolver> {
        &self.media
    }

    pub fn navigation(&self) -> &NavigationStack {
        &self.navigation
    }

    /// Stop background tasks and close the transport
    pub async fn shutdown(&self) {
        let tasks: Vec<_> = self.tasks().drain(..).collect();
        for task in tasks {
            task.abort();
        }
        self.transport.disconnect().await;
        debug!("Chat context shut down");
    }

    fn tasks(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }
}
