/// Wire protocol of the messaging transport
///
/// Frames are a 4-byte big-endian length followed by one JSON command.
use crate::error::{ChatError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Destination carrying all messages addressed to the connected user
pub const INBOUND_DESTINATION: &str = "/user/queue/specific-user";

/// Sink accepting outbound chat messages
pub const OUTBOUND_DESTINATION: &str = "/message/sink";

/// Commands exchanged over the transport
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum Command {
    /// Opens the session; `authorization` is the raw token without prefix
    #[serde(rename = "connect")]
    Connect { authorization: String },

    /// Handshake accepted
    #[serde(rename = "connected")]
    Connected { user_name: String },

    #[serde(rename = "subscribe")]
    Subscribe { id: String, destination: String },

    #[serde(rename = "send")]
    Send { destination: String, body: String },

    /// Delivery on a subscription
    #[serde(rename = "message")]
    Message {
        subscription: String,
        destination: String,
        body: String,
    },

    #[serde(rename = "error")]
    Error { message: String },

    #[serde(rename = "disconnect")]
    Disconnect,
}

impl Command {
    /// Serialize command to JSON bytes
    pub fn to_bytes(&self) -> std::result::Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Deserialize command from JSON bytes
    pub fn from_bytes(data: &[u8]) -> std::result::Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }

    pub fn command_type(&self) -> &'static str {
        match self {
            Command::Connect { .. } => "connect",
            Command::Connected { .. } => "connected",
            Command::Subscribe { .. } => "subscribe",
            Command::Send { .. } => "send",
            Command::Message { .. } => "message",
            Command::Error { .. } => "error",
            Command::Disconnect => "disconnect",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Command({})", self.command_type())
    }
}

/// Protocol frame with length prefix
#[derive(Debug)]
pub struct Frame {
    pub length: u32,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn from_command(command: &Command) -> std::result::Result<Self, serde_json::Error> {
        let payload = command.to_bytes()?;
        Ok(Self {
            length: payload.len() as u32,
            payload,
        })
    }

    /// Serialize frame to bytes (length prefix + payload)
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(4 + self.payload.len());
        buf.extend_from_slice(&self.length.to_be_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Parse frame from bytes
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < 4 {
            return None;
        }

        let length = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;

        if data.len() < 4 + length {
            return None;
        }

        Some(Self {
            length: length as u32,
            payload: data[4..4 + length].to_vec(),
        })
    }
}

/// Read one frame payload. `Ok(None)` on clean end of stream.
pub async fn read_frame<R>(reader: &mut R, max_len: usize) -> Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(ChatError::Io(e)),
    }

    let length = u32::from_be_bytes(len_buf) as usize;
    if length > max_len {
        return Err(ChatError::Protocol(format!(
            "frame of {} bytes exceeds limit of {}",
            length, max_len
        )));
    }

    let mut payload = vec![0u8; length];
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

/// Encode and write one command
pub async fn write_command<W>(writer: &mut W, command: &Command) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let frame = Frame::from_command(command)?;
    writer.write_all(&frame.to_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Read the next command, failing on end of stream or an undecodable frame.
/// Used during the handshake where every frame matters.
pub async fn read_command<R>(reader: &mut R, max_len: usize) -> Result<Command>
where
    R: AsyncRead + Unpin,
{
    let payload = read_frame(reader, max_len)
        .await?
        .ok_or_else(|| ChatError::Connection("connection closed".to_string()))?;
    Command::from_bytes(&payload)
        .map_err(|e| ChatError::Protocol(format!("invalid command: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_tagging() {
        let command = Command::Connect {
            authorization: "tok".to_string(),
        };
        let value: serde_json::Value = serde_json::from_slice(&command.to_bytes().unwrap()).unwrap();
        assert_eq!(value["type"], "connect");
        assert_eq!(value["authorization"], "tok");
    }

    #[test]
    fn test_frame_length_prefix() {
        let frame = Frame::from_command(&Command::Disconnect).unwrap();
        let bytes = frame.to_bytes();
        assert_eq!(&bytes[..4], &(frame.payload.len() as u32).to_be_bytes());
        let parsed = Frame::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.payload, frame.payload);
        assert!(Frame::from_bytes(&bytes[..bytes.len() - 1]).is_none());
    }

    #[tokio::test]
    async fn test_read_frame_respects_limit() {
        let frame = Frame::from_command(&Command::Send {
            destination: OUTBOUND_DESTINATION.to_string(),
            body: "x".repeat(64),
        })
        .unwrap()
        .to_bytes();

        let mut reader = &frame[..];
        let err = read_frame(&mut reader, 16).await.unwrap_err();
        assert!(matches!(err, ChatError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_read_frame_end_of_stream() {
        let mut reader: &[u8] = &[];
        assert!(read_frame(&mut reader, 1024).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_write_then_read_command() {
        let mut buf: Vec<u8> = Vec::new();
        write_command(&mut buf, &Command::Connected { user_name: "ada".into() })
            .await
            .unwrap();
        let mut reader = &buf[..];
        let command = read_command(&mut reader, 1024).await.unwrap();
        assert_eq!(command, Command::Connected { user_name: "ada".into() });
    }
}
