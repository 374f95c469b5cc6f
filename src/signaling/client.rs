//! HTTP Client für den Matrix Homeserver
//!
//! Verwaltet die Kommunikation mit dem Homeserver:
//! - Login (Passwort) und Access Token
//! - Senden von `m.call.*` Events mit frischer Transaction-ID
//! - `/sync` Loop mit festem Backoff bei Fehlern
//! - Event-basierte Weitergabe empfangener Nachrichten

use super::messages::*;
use crate::config::SignalingConfig;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use url::Url;

const LOGIN_PATH: [&str; 4] = ["_matrix", "client", "r0", "login"];
const SYNC_PATH: [&str; 4] = ["_matrix", "client", "r0", "sync"];

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum SignalingError {
    #[error("Invalid homeserver URL: {0}")]
    InvalidUrl(String),

    #[error("HTTP request failed: {0}")]
    Request(String),

    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Login failed: {0}")]
    LoginFailed(String),

    #[error("Failed to encode or decode payload: {0}")]
    Payload(String),
}

impl From<reqwest::Error> for SignalingError {
    fn from(e: reqwest::Error) -> Self {
        Self::Request(e.to_string())
    }
}

// ============================================================================
// SIGNALING CHANNEL
// ============================================================================

/// Sende-Primitive, die die Call-Session benutzt
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    async fn send(&self, message: &SignalingMessage) -> Result<(), SignalingError>;
}

// ============================================================================
// SIGNALING EVENTS
// ============================================================================

/// Events die vom SignalingClient ausgelöst werden
#[derive(Debug, Clone)]
pub enum SignalingEvent {
    /// Erster Sync abgeschlossen, ab jetzt kommen Live-Events
    Synced,

    /// Call-Nachricht aus dem Raum
    Message {
        sender: String,
        message: SignalingMessage,
    },

    /// Sync fehlgeschlagen, wird nach Backoff wiederholt
    SyncFailed(SignalingError),
}

// ============================================================================
// SIGNALING CLIENT
// ============================================================================

/// Eingeloggter Matrix Client für genau einen Raum
pub struct SignalingClient {
    config: SignalingConfig,
    base_url: Url,
    http: reqwest::Client,
    user_id: String,
    access_token: String,
    since: RwLock<Option<String>>,
    event_tx: broadcast::Sender<SignalingEvent>,
}

impl SignalingClient {
    /// Loggt sich beim Homeserver ein
    pub async fn login(config: SignalingConfig) -> Result<Self, SignalingError> {
        let base_url =
            Url::parse(&config.homeserver).map_err(|e| SignalingError::InvalidUrl(e.to_string()))?;
        let http = reqwest::Client::new();

        let url = Self::endpoint(&base_url, &LOGIN_PATH)?;
        tracing::info!("Logging in to {} as '{}'", base_url, config.username);

        let request = LoginRequest::password(config.username.clone(), config.password.clone());
        let response = http.post(url).json(&request).send().await?;
        let response: LoginResponse = Self::read_json(response)
            .await
            .map_err(|e| SignalingError::LoginFailed(e.to_string()))?;

        tracing::info!("Logged in as {}", response.user_id);

        let (event_tx, _) = broadcast::channel(100);

        Ok(Self {
            config,
            base_url,
            http,
            user_id: response.user_id,
            access_token: response.access_token,
            since: RwLock::new(None),
            event_tx,
        })
    }

    /// Gibt einen Event-Receiver zurück
    pub fn subscribe(&self) -> broadcast::Receiver<SignalingEvent> {
        self.event_tx.subscribe()
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn access_token(&self) -> &str {
        &self.access_token
    }

    pub fn room_id(&self) -> &str {
        &self.config.room_id
    }

    /// Sendet ein Event und gibt die Event-ID zurück (falls geliefert)
    pub async fn send_message(
        &self,
        message: &SignalingMessage,
    ) -> Result<Option<String>, SignalingError> {
        let txn_id = uuid::Uuid::new_v4().to_string();
        let url = Self::endpoint(
            &self.base_url,
            &[
                "_matrix",
                "client",
                "r0",
                "rooms",
                &self.config.room_id,
                "send",
                message.event_type(),
                &txn_id,
            ],
        )?;

        let content = message
            .to_content()
            .map_err(|e| SignalingError::Payload(e.to_string()))?;

        tracing::debug!(
            "Sending {} for call {} (txn {})",
            message.event_type(),
            message.call_id(),
            txn_id
        );

        let response = self
            .http
            .post(url)
            .bearer_auth(&self.access_token)
            .json(&content)
            .send()
            .await?;

        let response: SendEventResponse = Self::read_json(response).await?;
        Ok(response.event_id)
    }

    /// Ein einzelner `/sync` Request
    pub async fn sync_once(&self, since: Option<&str>) -> Result<SyncResponse, SignalingError> {
        let mut url = Self::endpoint(&self.base_url, &SYNC_PATH)?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("timeout", &self.config.sync_timeout_ms.to_string());
            if let Some(since) = since {
                query.append_pair("since", since);
            }
        }

        let response = self
            .http
            .get(url)
            .bearer_auth(&self.access_token)
            .timeout(Duration::from_millis(self.config.sync_timeout_ms) + Duration::from_secs(10))
            .send()
            .await?;

        Self::read_json(response).await
    }

    /// Startet den Sync-Loop im Hintergrund
    ///
    /// Der erste Sync setzt nur den `since` Token, historische Events werden
    /// übersprungen. Fehler werden nach festem Backoff wiederholt.
    pub fn start_sync(self: &Arc<Self>) -> JoinHandle<()> {
        let client = Arc::clone(self);
        tokio::spawn(async move {
            let backoff = Duration::from_millis(client.config.retry_backoff_ms);
            loop {
                let since = client.since.read().clone();
                match client.sync_once(since.as_deref()).await {
                    Ok(response) => {
                        if since.is_some() {
                            for (sender, message) in response.call_messages(&client.config.room_id) {
                                tracing::debug!(
                                    "Received {} from {} (call {})",
                                    message.event_type(),
                                    sender,
                                    message.call_id()
                                );
                                let _ = client
                                    .event_tx
                                    .send(SignalingEvent::Message { sender, message });
                            }
                        } else {
                            tracing::info!("Initial sync complete");
                            let _ = client.event_tx.send(SignalingEvent::Synced);
                        }
                        *client.since.write() = Some(response.next_batch);
                    }
                    Err(e) => {
                        tracing::warn!("Sync failed, retrying in {:?}: {}", backoff, e);
                        let _ = client.event_tx.send(SignalingEvent::SyncFailed(e));
                        tokio::time::sleep(backoff).await;
                    }
                }
            }
        })
    }

    fn endpoint(base: &Url, segments: &[&str]) -> Result<Url, SignalingError> {
        let mut url = base.clone();
        url.path_segments_mut()
            .map_err(|_| SignalingError::InvalidUrl(base.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// Prüft den Status und dekodiert den Body
    async fn read_json<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, SignalingError> {
        let status = response.status();
        if status.as_u16() >= 300 {
            let body = response.text().await.unwrap_or_default();
            return Err(SignalingError::Http {
                status: status.as_u16(),
                body,
            });
        }

        response
            .json::<T>()
            .await
            .map_err(|e| SignalingError::Payload(e.to_string()))
    }
}

#[async_trait]
impl SignalingChannel for SignalingClient {
    async fn send(&self, message: &SignalingMessage) -> Result<(), SignalingError> {
        self.send_message(message).await.map(|_| ())
    }
}

impl std::fmt::Debug for SignalingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalingClient")
            .field("homeserver", &self.base_url.as_str())
            .field("user_id", &self.user_id)
            .field("room_id", &self.config.room_id)
            .finish()
    }
}
