/// In-memory messaging backend
///
/// Implements every collaborator interface without a network and can serve
/// the transport protocol on a local listener, so the whole client stack runs
/// offline. Used by the `--offline` mode of the binary and by tests.
use crate::chat_types::{Conversation, ConversationId, Identity, Message, UserId};
use crate::collaborators::{AuthApi, ConversationDirectory, HistoryFetcher, ResourceStore, UserDirectory};
use crate::credential::encode_unsigned_token;
use crate::error::{ChatError, Result};
use crate::transport::protocol::{
    read_command, read_frame, write_command, Command, INBOUND_DESTINATION, OUTBOUND_DESTINATION,
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{TimeZone, Utc};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Messages per history page
pub const PAGE_SIZE: usize = 20;

/// Lifetime of issued tokens
const TOKEN_TTL_SECS: i64 = 24 * 60 * 60;

const MAX_FRAME_LEN: usize = 1024 * 1024;

struct Account {
    password: String,
    user_id: UserId,
}

/// A connected transport client
struct Client {
    user_id: UserId,
    subscription: Option<String>,
    outbound: mpsc::UnboundedSender<Command>,
}

#[derive(Default)]
struct State {
    accounts: HashMap<String, Account>,
    users: HashMap<UserId, Identity>,
    conversations: HashMap<ConversationId, Conversation>,
    messages: HashMap<ConversationId, Vec<Message>>,
    resources: HashMap<String, Bytes>,
    tokens: HashMap<String, UserId>,
    clients: HashMap<u64, Client>,
    last_timestamp_ms: i64,
}

pub struct LocalBackend {
    state: RwLock<State>,
    page_size: usize,
    next_client: AtomicU64,
}

impl LocalBackend {
    pub fn new() -> Self {
        Self::with_page_size(PAGE_SIZE)
    }

    pub fn with_page_size(page_size: usize) -> Self {
        Self {
            state: RwLock::new(State::default()),
            page_size: page_size.max(1),
            next_client: AtomicU64::new(1),
        }
    }

    /// Three accounts (admin/admin, user/user, guest/guest), one direct and
    /// one group conversation
    pub fn with_demo_data() -> Self {
        let backend = Self::new();
        backend.add_account(
            "admin",
            "admin",
            Identity::new(1, "Ada Admin").with_roles(["ROLE_ADMIN", "ROLE_USER"]),
        );
        backend.add_account("user", "user", Identity::new(2, "Uma User").with_roles(["ROLE_USER"]));
        backend.add_account("guest", "guest", Identity::new(3, "Gus Guest").with_roles(["ROLE_USER"]));
        backend.add_conversation(ConversationId(1), "Ada & Uma", UserId(1), &[UserId(1), UserId(2)]);
        backend.add_conversation(
            ConversationId(2),
            "Everyone",
            UserId(1),
            &[UserId(1), UserId(2), UserId(3)],
        );
        backend.post(Message::text(ConversationId(1), UserId(2), "Welcome back!"));
        backend.post(Message::text(ConversationId(2), UserId(3), "Hello everyone"));
        backend
    }

    pub fn add_account(&self, username: &str, password: &str, identity: Identity) {
        let mut state = self.write();
        state.accounts.insert(
            username.to_string(),
            Account {
                password: password.to_string(),
                user_id: identity.id,
            },
        );
        state.users.insert(identity.id, identity);
    }

    /// Known to the user directory but unable to log in
    pub fn add_user(&self, identity: Identity) {
        self.write().users.insert(identity.id, identity);
    }

    pub fn add_conversation(&self, id: ConversationId, title: &str, owner_id: UserId, members: &[UserId]) {
        self.write().conversations.insert(
            id,
            Conversation {
                id,
                title: title.to_string(),
                owner_id,
                member_ids: members.iter().copied().collect(),
            },
        );
    }

    pub fn remove_member(&self, id: ConversationId, member: UserId) {
        if let Some(conversation) = self.write().conversations.get_mut(&id) {
            conversation.member_ids.remove(&member);
        }
    }

    /// Store a message, stamping it with a strictly increasing timestamp,
    /// and deliver it to every subscribed member. Returns the stored message.
    pub fn post(&self, mut message: Message) -> Message {
        let mut state = self.write();
        let now = Utc::now().timestamp_millis();
        let ms = now.max(state.last_timestamp_ms + 1);
        state.last_timestamp_ms = ms;
        message.timestamp = Utc.timestamp_millis_opt(ms).single();

        state
            .messages
            .entry(message.conversation_id)
            .or_default()
            .push(message.clone());

        let recipients = state
            .conversations
            .get(&message.conversation_id)
            .map(|c| c.member_ids.clone())
            .unwrap_or_default();
        match serde_json::to_string(&message.to_wire()) {
            Ok(body) => {
                let mut delivered = 0;
                for client in state.clients.values() {
                    let Some(subscription) = &client.subscription else {
                        continue;
                    };
                    if !recipients.contains(&client.user_id) {
                        continue;
                    }
                    let command = Command::Message {
                        subscription: subscription.clone(),
                        destination: INBOUND_DESTINATION.to_string(),
                        body: body.clone(),
                    };
                    if client.outbound.send(command).is_ok() {
                        delivered += 1;
                    }
                }
                debug!(
                    "Stored message in conversation {}, delivered to {} clients",
                    message.conversation_id, delivered
                );
            }
            Err(e) => error!("Failed to encode message for delivery: {}", e),
        }
        message
    }

    pub fn message_count(&self, id: ConversationId) -> usize {
        self.read().messages.get(&id).map(Vec::len).unwrap_or(0)
    }

    pub fn connected_clients(&self) -> usize {
        self.read().clients.len()
    }

    /// Serve the transport protocol until the listener fails
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        info!("Local transport listening on {}", listener.local_addr()?);
        loop {
            let (stream, addr) = listener.accept().await?;
            let backend = self.clone();
            tokio::spawn(async move {
                if let Err(e) = backend.handle_client(stream, addr).await {
                    warn!("Local transport client {} failed: {}", addr, e);
                }
            });
        }
    }

    async fn handle_client(&self, stream: TcpStream, addr: SocketAddr) -> Result<()> {
        let (mut reader, mut writer) = stream.into_split();

        let token = match read_command(&mut reader, MAX_FRAME_LEN).await? {
            Command::Connect { authorization } => authorization,
            other => {
                return Err(ChatError::Protocol(format!(
                    "expected connect, got {}",
                    other.command_type()
                )))
            }
        };
        let Some(identity) = self.identity_for_token(&token) else {
            write_command(
                &mut writer,
                &Command::Error {
                    message: "invalid credential".to_string(),
                },
            )
            .await?;
            return Ok(());
        };
        write_command(
            &mut writer,
            &Command::Connected {
                user_name: identity.display_name.clone(),
            },
        )
        .await?;

        let client_id = self.next_client.fetch_add(1, Ordering::Relaxed);
        let (outbound, mut queue) = mpsc::unbounded_channel::<Command>();
        self.write().clients.insert(
            client_id,
            Client {
                user_id: identity.id,
                subscription: None,
                outbound,
            },
        );
        debug!("Client {} connected from {} as {}", client_id, addr, identity.id);

        let writer_task = tokio::spawn(async move {
            while let Some(command) = queue.recv().await {
                if write_command(&mut writer, &command).await.is_err() {
                    break;
                }
            }
        });

        let result = self.client_loop(client_id, &mut reader).await;

        self.write().clients.remove(&client_id);
        writer_task.abort();
        debug!("Client {} disconnected", client_id);
        result
    }

    async fn client_loop(&self, client_id: u64, reader: &mut OwnedReadHalf) -> Result<()> {
        while let Some(payload) = read_frame(reader, MAX_FRAME_LEN).await? {
            match Command::from_bytes(&payload) {
                Ok(Command::Subscribe { id, destination }) if destination == INBOUND_DESTINATION => {
                    if let Some(client) = self.write().clients.get_mut(&client_id) {
                        client.subscription = Some(id);
                    }
                }
                Ok(Command::Send { destination, body }) if destination == OUTBOUND_DESTINATION => {
                    match Message::from_json(&body) {
                        Ok(message) => {
                            self.post(message);
                        }
                        Err(e) => warn!("Rejecting malformed message from client {}: {}", client_id, e),
                    }
                }
                Ok(Command::Disconnect) => break,
                Ok(other) => debug!("Client {} sent unexpected {}", client_id, other),
                Err(e) => warn!("Undecodable frame from client {}: {}", client_id, e),
            }
        }
        Ok(())
    }

    fn identity_for_token(&self, token: &str) -> Option<Identity> {
        let state = self.read();
        let user_id = state.tokens.get(token)?;
        state.users.get(user_id).cloned()
    }

    fn read(&self) -> RwLockReadGuard<'_, State> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, State> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for LocalBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AuthApi for LocalBackend {
    async fn login(&self, username: &str, password: &str) -> Result<Option<String>> {
        let mut state = self.write();
        let Some(account) = state.accounts.get(username) else {
            return Ok(None);
        };
        if account.password != password {
            return Ok(None);
        }
        let user_id = account.user_id;
        let roles: Vec<String> = state
            .users
            .get(&user_id)
            .map(|u| u.roles.iter().cloned().collect())
            .unwrap_or_default();
        let roles: Vec<&str> = roles.iter().map(String::as_str).collect();
        let exp = Utc::now().timestamp() + TOKEN_TTL_SECS;
        let token = encode_unsigned_token(username, Some(exp), &roles);
        state.tokens.insert(token.clone(), user_id);
        Ok(Some(token))
    }

    async fn current_user(&self, token: &str) -> Result<Identity> {
        self.identity_for_token(token).ok_or(ChatError::HttpStatus {
            status: 401,
            path: "/api/user/me".to_string(),
        })
    }

    async fn revoke(&self, token: &str) -> Result<()> {
        self.write().tokens.remove(token);
        Ok(())
    }
}

#[async_trait]
impl HistoryFetcher for LocalBackend {
    async fn fetch(&self, conversation_id: ConversationId, page: u32) -> Result<Vec<Message>> {
        let state = self.read();
        if !state.conversations.contains_key(&conversation_id) {
            return Err(ChatError::NotFound(format!("conversation {}", conversation_id)));
        }
        let all = state
            .messages
            .get(&conversation_id)
            .map(Vec::as_slice)
            .unwrap_or_default();
        let skip = (page as usize).saturating_mul(self.page_size);
        if skip >= all.len() {
            return Ok(Vec::new());
        }
        let end = all.len() - skip;
        let start = end.saturating_sub(self.page_size);
        Ok(all[start..end].to_vec())
    }
}

#[async_trait]
impl ConversationDirectory for LocalBackend {
    async fn conversation(&self, id: ConversationId) -> Result<Conversation> {
        self.read()
            .conversations
            .get(&id)
            .cloned()
            .ok_or_else(|| ChatError::NotFound(format!("conversation {}", id)))
    }
}

#[async_trait]
impl UserDirectory for LocalBackend {
    async fn user(&self, id: UserId) -> Result<Identity> {
        self.read()
            .users
            .get(&id)
            .cloned()
            .ok_or_else(|| ChatError::NotFound(format!("user {}", id)))
    }
}

#[async_trait]
impl ResourceStore for LocalBackend {
    async fn download(&self, id: &str) -> Result<Option<Bytes>> {
        Ok(self.read().resources.get(id).cloned())
    }

    async fn upload(&self, data: Bytes, file_name: &str) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        debug!("Stored resource {} ({}, {} bytes)", id, file_name, data.len());
        self.write().resources.insert(id.clone(), data);
        Ok(id)
    }
}
