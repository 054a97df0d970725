/// Persistent bidirectional connection to the messaging server
///
/// At most one connection is live at a time. After the handshake the channel
/// subscribes to the user's inbound destination and hands every delivered
/// body to the multiplexer from a single reader task, so dispatch is
/// sequential. Outbound commands go through a queue drained by a writer task.
use crate::chat_types::{ConversationId, Message, MessageContent, UserId};
use crate::config::Config;
use crate::error::{ChatError, Result};
use crate::multiplexer::StreamMultiplexer;
use crate::session::SessionState;
use crate::transport::protocol::{
    read_command, read_frame, write_command, Command, INBOUND_DESTINATION, OUTBOUND_DESTINATION,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Id of the single inbound subscription
const SUBSCRIPTION_ID: &str = "sub-0";

/// How long teardown waits for queued commands to be flushed
const TEARDOWN_GRACE: Duration = Duration::from_secs(2);

/// Connection state of the channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
    /// The server went away; a new `connect` is needed
    Closed,
}

struct Connection {
    user_name: String,
    outbound: mpsc::UnboundedSender<Command>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

pub struct TransportChannel {
    addr: String,
    max_frame_len: usize,
    session: Arc<SessionState>,
    multiplexer: Arc<StreamMultiplexer>,
    connection: Mutex<Option<Connection>>,
    /// Bumped by every connect and disconnect
    generation: watch::Sender<u64>,
}

impl TransportChannel {
    pub fn new(
        config: &Config,
        session: Arc<SessionState>,
        multiplexer: Arc<StreamMultiplexer>,
    ) -> Self {
        Self {
            addr: config.transport_addr.clone(),
            max_frame_len: config.max_frame_len,
            session,
            multiplexer,
            connection: Mutex::new(None),
            generation: watch::channel(0).0,
        }
    }

    /// Open a connection authenticated with the current credential.
    /// An existing connection is torn down first. A `disconnect` or newer
    /// `connect` issued while the handshake is pending cancels this one.
    pub async fn connect(&self) -> Result<()> {
        let token = self.session.bearer_token().ok_or(ChatError::NoCredential)?;

        let generation = self.next_generation();
        let superseded = self.generation.subscribe();
        let existing = self.connection.lock().await.take();
        if let Some(existing) = existing {
            debug!("Replacing existing transport connection");
            self.teardown(existing).await;
        }

        info!("Connecting transport to {}", self.addr);
        let (stream, user_name) = tokio::select! {
            result = self.handshake(token) => result?,
            _ = wait_superseded(superseded, generation) => {
                info!("Transport connect to {} cancelled", self.addr);
                return Err(ChatError::Connection("connect cancelled".to_string()));
            }
        };

        let mut guard = self.connection.lock().await;
        if *self.generation.borrow() != generation {
            debug!("Dropping superseded transport connection");
            return Err(ChatError::Connection("connect cancelled".to_string()));
        }

        let (read_half, write_half) = stream.into_split();
        let (outbound, queue) = mpsc::unbounded_channel();
        let writer = tokio::spawn(run_writer(write_half, queue));
        let reader = tokio::spawn(run_reader(
            read_half,
            self.multiplexer.clone(),
            self.max_frame_len,
        ));

        info!("Transport connected as {}", user_name);
        *guard = Some(Connection {
            user_name,
            outbound,
            reader,
            writer,
        });
        Ok(())
    }

    /// Close the live connection and cancel a pending connect. No-op
    /// without either.
    pub async fn disconnect(&self) {
        self.next_generation();
        let existing = self.connection.lock().await.take();
        match existing {
            Some(connection) => self.teardown(connection).await,
            None => debug!("Transport already disconnected"),
        }
    }

    /// Fire-and-forget send of one chat message
    pub async fn send(
        &self,
        conversation_id: ConversationId,
        author_id: UserId,
        content: MessageContent,
    ) -> Result<()> {
        let message = Message {
            conversation_id,
            author_id,
            timestamp: None,
            content,
        };
        let body = serde_json::to_string(&message.to_wire())?;

        let guard = self.connection.lock().await;
        let connection = guard.as_ref().ok_or(ChatError::NotConnected)?;
        connection
            .outbound
            .send(Command::Send {
                destination: OUTBOUND_DESTINATION.to_string(),
                body,
            })
            .map_err(|_| ChatError::NotConnected)?;
        debug!("Queued {:?} message for conversation {}", message.kind(), conversation_id);
        Ok(())
    }

    pub async fn state(&self) -> ConnectionState {
        match self.connection.lock().await.as_ref() {
            None => ConnectionState::Disconnected,
            Some(c) if c.reader.is_finished() || c.writer.is_finished() => ConnectionState::Closed,
            Some(_) => ConnectionState::Connected,
        }
    }

    pub async fn is_connected(&self) -> bool {
        self.state().await == ConnectionState::Connected
    }

    /// User name the server reported during the handshake
    pub async fn user_name(&self) -> Option<String> {
        self.connection
            .lock()
            .await
            .as_ref()
            .map(|c| c.user_name.clone())
    }

    /// TCP connect, `connect`/`connected` exchange and the inbound subscribe
    async fn handshake(&self, token: String) -> Result<(TcpStream, String)> {
        let mut stream = TcpStream::connect(&self.addr)
            .await
            .map_err(|e| ChatError::Connection(format!("{}: {}", self.addr, e)))?;

        write_command(&mut stream, &Command::Connect { authorization: token }).await?;
        let user_name = match read_command(&mut stream, self.max_frame_len).await? {
            Command::Connected { user_name } => user_name,
            Command::Error { message } => return Err(ChatError::Handshake(message)),
            other => {
                return Err(ChatError::Protocol(format!(
                    "expected connected, got {}",
                    other.command_type()
                )))
            }
        };

        write_command(
            &mut stream,
            &Command::Subscribe {
                id: SUBSCRIPTION_ID.to_string(),
                destination: INBOUND_DESTINATION.to_string(),
            },
        )
        .await?;
        Ok((stream, user_name))
    }

    fn next_generation(&self) -> u64 {
        let mut next = 0;
        self.generation.send_modify(|generation| {
            *generation += 1;
            next = *generation;
        });
        next
    }

    async fn teardown(&self, connection: Connection) {
        let Connection {
            user_name,
            outbound,
            reader,
            writer,
        } = connection;

        // The writer flushes what is queued, including the goodbye, then exits
        let _ = outbound.send(Command::Disconnect);
        drop(outbound);
        let mut writer = writer;
        match timeout(TEARDOWN_GRACE, &mut writer).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Transport writer ended abnormally: {}", e),
            Err(_) => {
                warn!("Transport writer did not finish within {:?}", TEARDOWN_GRACE);
                writer.abort();
            }
        }
        reader.abort();

        self.multiplexer.reset();
        info!("Transport disconnected ({})", user_name);
    }
}

/// Resolves once the generation moves past `generation`
async fn wait_superseded(mut superseded: watch::Receiver<u64>, generation: u64) {
    while superseded.changed().await.is_ok() {
        if *superseded.borrow_and_update() != generation {
            return;
        }
    }
    std::future::pending::<()>().await
}

async fn run_writer(mut writer: OwnedWriteHalf, mut queue: mpsc::UnboundedReceiver<Command>) {
    while let Some(command) = queue.recv().await {
        if let Err(e) = write_command(&mut writer, &command).await {
            error!("Transport write failed: {}", e);
            return;
        }
    }
    let _ = writer.shutdown().await;
}

async fn run_reader(
    mut reader: OwnedReadHalf,
    multiplexer: Arc<StreamMultiplexer>,
    max_frame_len: usize,
) {
    loop {
        let payload = match read_frame(&mut reader, max_frame_len).await {
            Ok(Some(payload)) => payload,
            Ok(None) => {
                info!("Transport closed by server");
                return;
            }
            Err(e) => {
                error!("Transport read failed: {}", e);
                return;
            }
        };

        match Command::from_bytes(&payload) {
            Ok(Command::Message {
                destination, body, ..
            }) if destination == INBOUND_DESTINATION => {
                multiplexer.dispatch_raw(&body);
            }
            Ok(Command::Message { destination, .. }) => {
                debug!("Ignoring delivery on {}", destination);
            }
            Ok(Command::Error { message }) => warn!("Server reported error: {}", message),
            Ok(Command::Disconnect) => {
                info!("Server ended the transport session");
                return;
            }
            Ok(other) => debug!("Ignoring {}", other),
            Err(e) => warn!("Dropping undecodable frame: {}", e),
        }
    }
}
