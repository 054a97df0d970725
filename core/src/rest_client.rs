/// HTTP client for the messaging REST API
///
/// Each request opens its own HTTP/1.1 connection. Authenticated requests
/// carry `Authorization: Bearer <token>` with the token from the credential
/// store.
use crate::chat_types::{
    ChatRecord, Conversation, ConversationId, Identity, Message, UserId, UserRecord, WireMessage,
};
use crate::collaborators::{AuthApi, ConversationDirectory, HistoryFetcher, ResourceStore, UserDirectory};
use crate::credential::CredentialStore;
use crate::error::{ChatError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use http::header::{AUTHORIZATION, CONTENT_TYPE, HOST, LOCATION};
use http::{Method, Request, Response, StatusCode, Uri};
use http_body_util::{BodyExt, Full};
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tokio::net::TcpStream;
use tracing::{debug, warn};

const BEARER_PREFIX: &str = "Bearer ";

pub struct RestClient {
    /// `host:port` to connect to
    addr: String,
    host: String,
    base_path: String,
    credentials: Arc<dyn CredentialStore>,
}

impl RestClient {
    pub fn new(api_url: &str, credentials: Arc<dyn CredentialStore>) -> Result<Self> {
        let uri: Uri = api_url
            .parse()
            .map_err(|e| ChatError::Config(format!("invalid API URL {}: {}", api_url, e)))?;
        if uri.scheme_str() != Some("http") {
            return Err(ChatError::Config(format!("API URL must use http://, got {}", api_url)));
        }
        let host = uri
            .host()
            .ok_or_else(|| ChatError::Config(format!("API URL has no host: {}", api_url)))?;
        let port = uri.port_u16().unwrap_or(80);

        Ok(Self {
            addr: format!("{}:{}", host, port),
            host: uri.authority().map(|a| a.to_string()).unwrap_or_else(|| host.to_string()),
            base_path: uri.path().trim_end_matches('/').to_string(),
            credentials,
        })
    }

    fn request(&self, method: Method, path: &str, token: Option<&str>) -> http::request::Builder {
        let mut builder = Request::builder()
            .method(method)
            .uri(format!("{}{}", self.base_path, path))
            .header(HOST, &self.host);
        if let Some(token) = token {
            builder = builder.header(AUTHORIZATION, format!("{}{}", BEARER_PREFIX, token));
        }
        builder
    }

    /// Token from the credential store, if any
    fn stored_token(&self) -> Option<String> {
        match self.credentials.load() {
            Ok(token) => token,
            Err(e) => {
                warn!("Could not read credential for request: {}", e);
                None
            }
        }
    }

    async fn execute(&self, request: Request<Full<Bytes>>) -> Result<Response<Bytes>> {
        let method = request.method().clone();
        let path = request.uri().path().to_string();

        let stream = TcpStream::connect(&self.addr)
            .await
            .map_err(|e| ChatError::Connection(format!("{}: {}", self.addr, e)))?;
        let (mut sender, connection) = http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|e| ChatError::Http(e.to_string()))?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!("HTTP connection ended: {}", e);
            }
        });

        let response = sender
            .send_request(request)
            .await
            .map_err(|e| ChatError::Http(format!("{} {}: {}", method, path, e)))?;
        let (parts, body) = response.into_parts();
        let body = body
            .collect()
            .await
            .map_err(|e| ChatError::Http(format!("{} {}: {}", method, path, e)))?
            .to_bytes();
        debug!("{} {} -> {}", method, path, parts.status);
        Ok(Response::from_parts(parts, body))
    }

    /// Send and require a 2xx status
    async fn execute_ok(&self, request: Request<Full<Bytes>>) -> Result<Response<Bytes>> {
        let path = request.uri().path().to_string();
        let response = self.execute(request).await?;
        if !response.status().is_success() {
            return Err(ChatError::HttpStatus {
                status: response.status().as_u16(),
                path,
            });
        }
        Ok(response)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str, token: Option<&str>) -> Result<T> {
        let response = self
            .execute_ok(empty_body(self.request(Method::GET, path, token))?)
            .await?;
        Ok(serde_json::from_slice(response.body())?)
    }
}

fn empty_body(builder: http::request::Builder) -> Result<Request<Full<Bytes>>> {
    builder
        .body(Full::new(Bytes::new()))
        .map_err(|e| ChatError::Http(e.to_string()))
}

/// Last path segment of a `Location` header
fn id_from_location(location: &str) -> Option<String> {
    location
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
}

/// Decode one page, skipping entries that fail validation
fn parse_page(conversation_id: ConversationId, body: &[u8]) -> Result<Vec<Message>> {
    let raw: Vec<serde_json::Value> = serde_json::from_slice(body)?;
    let mut messages = Vec::with_capacity(raw.len());
    for value in raw {
        let parsed = serde_json::from_value::<WireMessage>(value)
            .map_err(ChatError::from)
            .and_then(|mut wire| {
                wire.chat_id.get_or_insert(conversation_id);
                wire.into_message()
            });
        match parsed {
            Ok(message) => messages.push(message),
            Err(e) => warn!("Skipping malformed message in conversation {}: {}", conversation_id, e),
        }
    }
    Ok(messages)
}

#[async_trait]
impl AuthApi for RestClient {
    async fn login(&self, username: &str, password: &str) -> Result<Option<String>> {
        let path = format!(
            "/api/authenticate?username={}&password={}",
            urlencoding::encode(username),
            urlencoding::encode(password)
        );
        let response = self.execute(empty_body(self.request(Method::GET, &path, None))?).await?;

        match response.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => return Ok(None),
            status if !status.is_success() => {
                return Err(ChatError::HttpStatus {
                    status: status.as_u16(),
                    path: "/api/authenticate".to_string(),
                })
            }
            _ => {}
        }

        let header = response
            .headers()
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| ChatError::Protocol("login response without Authorization header".into()))?;
        let token = header.strip_prefix(BEARER_PREFIX).unwrap_or(header).trim();
        Ok(Some(token.to_string()))
    }

    async fn current_user(&self, token: &str) -> Result<Identity> {
        let user: UserRecord = self.get_json("/api/user/me", Some(token)).await?;
        Ok(user.into())
    }

    async fn revoke(&self, token: &str) -> Result<()> {
        self.execute_ok(empty_body(self.request(Method::POST, "/api/auth/logout", Some(token)))?)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl HistoryFetcher for RestClient {
    async fn fetch(&self, conversation_id: ConversationId, page: u32) -> Result<Vec<Message>> {
        let token = self.stored_token();
        let path = format!("/api/chats/{}/messages?page={}", conversation_id, page);
        let request = empty_body(self.request(Method::GET, &path, token.as_deref()))?;
        let response = self.execute_ok(request).await?;
        parse_page(conversation_id, response.body())
    }
}

#[async_trait]
impl ConversationDirectory for RestClient {
    async fn conversation(&self, id: ConversationId) -> Result<Conversation> {
        let token = self.stored_token();
        let chat: ChatRecord = self
            .get_json(&format!("/api/chats/{}", id), token.as_deref())
            .await?;
        Ok(chat.into())
    }
}

#[async_trait]
impl UserDirectory for RestClient {
    async fn user(&self, id: UserId) -> Result<Identity> {
        let token = self.stored_token();
        let user: UserRecord = self
            .get_json(&format!("/api/user/{}", id), token.as_deref())
            .await?;
        Ok(user.into())
    }

    async fn users(&self, ids: &[UserId]) -> Result<Vec<Identity>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let token = self.stored_token();
        let request = self
            .request(Method::POST, "/api/user/batch", token.as_deref())
            .header(CONTENT_TYPE, "application/json")
            .body(Full::new(Bytes::from(serde_json::to_vec(ids)?)))
            .map_err(|e| ChatError::Http(e.to_string()))?;
        let response = self.execute_ok(request).await?;
        let users: Vec<UserRecord> = serde_json::from_slice(response.body())?;
        Ok(users.into_iter().map(Identity::from).collect())
    }
}

#[async_trait]
impl ResourceStore for RestClient {
    async fn download(&self, id: &str) -> Result<Option<Bytes>> {
        let token = self.stored_token();
        let path = format!("/api/resource/{}", urlencoding::encode(id));
        let response = self
            .execute(empty_body(self.request(Method::GET, &path, token.as_deref()))?)
            .await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => Ok(Some(response.into_body())),
            status => Err(ChatError::HttpStatus {
                status: status.as_u16(),
                path,
            }),
        }
    }

    async fn upload(&self, data: Bytes, file_name: &str) -> Result<String> {
        let token = self.stored_token();
        let boundary = format!("chatlink-{}", uuid::Uuid::new_v4().simple());

        let mut body = Vec::with_capacity(data.len() + 256);
        body.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
        body.extend_from_slice(
            format!(
                "Content-Disposition: form-data; name=\"file\"; filename=\"{}\"\r\n",
                file_name.replace('"', "")
            )
            .as_bytes(),
        );
        body.extend_from_slice(b"Content-Type: application/octet-stream\r\n\r\n");
        body.extend_from_slice(&data);
        body.extend_from_slice(format!("\r\n--{}--\r\n", boundary).as_bytes());

        let request = self
            .request(Method::POST, "/api/resource/upload", token.as_deref())
            .header(CONTENT_TYPE, format!("multipart/form-data; boundary={}", boundary))
            .body(Full::new(Bytes::from(body)))
            .map_err(|e| ChatError::Http(e.to_string()))?;
        let response = self.execute(request).await?;
        if response.status() != StatusCode::CREATED {
            return Err(ChatError::HttpStatus {
                status: response.status().as_u16(),
                path: "/api/resource/upload".to_string(),
            });
        }

        response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .and_then(id_from_location)
            .ok_or_else(|| ChatError::Protocol("upload response without resource location".into()))
    }
}
