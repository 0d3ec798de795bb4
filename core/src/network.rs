//! Network layer for DuoCall - HTTP API and signaling WebSocket client

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use url::Url;

use crate::error::{Error, Result};
use crate::models::*;
use crate::peer::{CallStatusReporter, SignalingSink};
use crate::ClientConfig;

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

// ============================================================================
// HTTP API Client
// ============================================================================

pub struct ApiClient {
    client: Client,
    base_url: Url,
    token: Mutex<Option<String>>,
}

impl ApiClient {
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let client = Client::builder().timeout(config.request_timeout).build()?;
        let base_url = Url::parse(&config.http_url()).map_err(|e| Error::Network(e.to_string()))?;

        Ok(Self {
            client,
            base_url,
            token: Mutex::new(None),
        })
    }

    pub fn set_token(&self, token: &str) {
        *self.token.lock() = Some(token.to_string());
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url.join(path).map_err(|e| Error::Network(e.to_string()))
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match self.token.lock().as_ref() {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// Send and decode, mapping error bodies to `Error::Server`.
    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
        let resp = self.authorized(request).send().await?;
        let status = resp.status();

        if status.is_success() {
            return Ok(resp.json().await?);
        }

        let body: serde_json::Value = resp.json().await.unwrap_or_default();
        Err(Error::Server {
            status: status.as_u16(),
            code: body["error"]["code"].as_str().unwrap_or("UNKNOWN").to_string(),
            message: body["error"]["message"]
                .as_str()
                .unwrap_or_else(|| status.canonical_reason().unwrap_or("request failed"))
                .to_string(),
        })
    }

    /// Obtain an anonymous identity; later requests carry its token.
    pub async fn guest_login(&self) -> Result<GuestIdentity> {
        let identity: GuestIdentity = self
            .send(self.client.post(self.endpoint("api/v1/auth/guest")?))
            .await?;
        self.set_token(&identity.token);
        Ok(identity)
    }

    pub async fn start_matching(&self, request: &StartMatchingRequest) -> Result<MatchOutcome> {
        self.send(self.client.post(self.endpoint("api/v1/matching")?).json(request))
            .await
            .map_err(|e| match e {
                Error::Server { status: 503, message, .. } => Error::MatchingFailed(message),
                other => other,
            })
    }

    pub async fn get_request(&self, request_id: &str) -> Result<MatchingRequest> {
        let url = self.endpoint(&format!("api/v1/matching/{}", request_id))?;
        self.send(self.client.get(url)).await
    }

    pub async fn cancel_matching(&self, request_id: &str) -> Result<MatchingRequest> {
        let url = self.endpoint(&format!("api/v1/matching/{}", request_id))?;
        self.send(self.client.delete(url)).await
    }

    pub async fn get_session(&self, session_id: &str) -> Result<CallSession> {
        let url = self.endpoint(&format!("api/v1/calls/{}", session_id))?;
        self.send(self.client.get(url)).await
    }

    pub async fn update_call_status(
        &self,
        session_id: &str,
        status: CallStatus,
        end_reason: Option<EndReason>,
    ) -> Result<CallSession> {
        let url = self.endpoint(&format!("api/v1/calls/{}/status", session_id))?;
        let body = UpdateCallStatusRequest { status, end_reason };
        self.send(self.client.post(url).json(&body)).await
    }

    pub async fn get_ice_servers(&self) -> Result<IceServersResponse> {
        self.send(self.client.get(self.endpoint("api/v1/ice/servers")?)).await
    }

    pub async fn check_health(&self) -> Result<HealthResponse> {
        self.send(self.client.get(self.endpoint("health")?)).await
    }
}

#[async_trait]
impl CallStatusReporter for ApiClient {
    async fn report_status(&self, session_id: &str, status: CallStatus, end_reason: Option<EndReason>) -> Result<()> {
        self.update_call_status(session_id, status, end_reason).await?;
        Ok(())
    }
}

// ============================================================================
// Signaling WebSocket Client
// ============================================================================

pub struct SignalingClient {
    sender: Mutex<Option<mpsc::UnboundedSender<WsClientMessage>>>,
    connected: Arc<AtomicBool>,
    user_id: String,
}

impl SignalingClient {
    /// Connect and authenticate. Server messages other than pongs arrive on
    /// the returned receiver, which closes when the socket does.
    pub async fn connect(
        config: &ClientConfig,
        token: &str,
    ) -> Result<(Self, mpsc::UnboundedReceiver<WsServerMessage>)> {
        let (ws_stream, _) = connect_async(config.ws_url().as_str()).await?;
        let (mut write, mut read) = ws_stream.split();

        let auth_msg = json!({
            "type": "authenticate",
            "payload": { "token": token }
        });
        write.send(WsMessage::Text(auth_msg.to_string())).await?;

        let user_id = loop {
            match read.next().await {
                Some(Ok(WsMessage::Text(text))) => match serde_json::from_str::<WsServerMessage>(&text)? {
                    WsServerMessage::Authenticated { user_id } => break user_id,
                    WsServerMessage::Error { code, message } => {
                        return Err(Error::Server {
                            status: 401,
                            code,
                            message,
                        })
                    }
                    other => log::debug!("Ignoring {:?} before authentication", other),
                },
                Some(Ok(WsMessage::Close(_))) | None => return Err(Error::NotConnected),
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
            }
        };
        log::info!("Signaling connected as {}", user_id);

        let (tx, mut rx) = mpsc::unbounded_channel::<WsClientMessage>();
        let (incoming_tx, incoming) = mpsc::unbounded_channel();
        let connected = Arc::new(AtomicBool::new(true));

        // Receive task
        let connected_clone = connected.clone();
        tokio::spawn(async move {
            while let Some(msg) = read.next().await {
                match msg {
                    Ok(WsMessage::Text(text)) => match serde_json::from_str::<WsServerMessage>(&text) {
                        Ok(WsServerMessage::Pong) => {}
                        Ok(message) => {
                            if incoming_tx.send(message).is_err() {
                                break;
                            }
                        }
                        Err(e) => log::warn!("Unparseable server message: {}", e),
                    },
                    Ok(WsMessage::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }
            connected_clone.store(false, Ordering::SeqCst);
            log::info!("Signaling connection closed");
        });

        // Send task
        let connected_clone = connected.clone();
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let text = match serde_json::to_string(&msg) {
                    Ok(text) => text,
                    Err(e) => {
                        log::warn!("Failed to encode client message: {}", e);
                        continue;
                    }
                };
                if write.send(WsMessage::Text(text)).await.is_err() {
                    break;
                }
            }
            connected_clone.store(false, Ordering::SeqCst);
            let _ = write.close().await;
        });

        // Keepalive
        let keepalive = tx.downgrade();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(KEEPALIVE_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(tx) = keepalive.upgrade() else {
                    break;
                };
                if tx.send(WsClientMessage::Ping).is_err() {
                    break;
                }
            }
        });

        Ok((
            Self {
                sender: Mutex::new(Some(tx)),
                connected,
                user_id,
            },
            incoming,
        ))
    }

    fn send(&self, message: WsClientMessage) -> Result<()> {
        match self.sender.lock().as_ref() {
            Some(sender) => sender.send(message).map_err(|_| Error::NotConnected),
            None => Err(Error::NotConnected),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Start receiving signals for `call_session_id`.
    pub fn join_call(&self, call_session_id: &str) -> Result<()> {
        self.send(WsClientMessage::JoinCall {
            call_session_id: call_session_id.to_string(),
        })
    }

    pub fn leave_call(&self, call_session_id: &str) -> Result<()> {
        self.send(WsClientMessage::LeaveCall {
            call_session_id: call_session_id.to_string(),
        })
    }

    pub fn ping(&self) -> Result<()> {
        self.send(WsClientMessage::Ping)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && self.sender.lock().is_some()
    }

    pub fn disconnect(&self) {
        self.sender.lock().take();
        self.connected.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl SignalingSink for SignalingClient {
    async fn send_signal(&self, message: SignalingMessage) -> Result<()> {
        self.send(WsClientMessage::Signal(message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoints_join_base_url() {
        let config = ClientConfig::new("calls.example.com", 443, true);
        let api = ApiClient::new(&config).unwrap();
        assert_eq!(
            api.endpoint("api/v1/matching/abc").unwrap().as_str(),
            "https://calls.example.com/api/v1/matching/abc"
        );
        assert_eq!(config.ws_url(), "wss://calls.example.com:443/ws");
    }

    #[test]
    fn test_client_messages_encode() {
        let msg = WsClientMessage::JoinCall {
            call_session_id: "s1".to_string(),
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "join_call");
        assert_eq!(value["payload"]["call_session_id"], "s1");

        let value = serde_json::to_value(&WsClientMessage::Ping).unwrap();
        assert_eq!(value["type"], "ping");
    }
}
