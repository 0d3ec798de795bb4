//! DuoCall Core Library
//!
//! Client side of DuoCall: preflight diagnostics, peer connection
//! management with reconnection, and clients for the coordination service.
//! [`CallClient`] ties them together for a UI layer.

pub mod diagnostics;
pub mod error;
pub mod media;
pub mod models;
pub mod network;
pub mod peer;
pub mod reconnect;
pub mod rtc;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

pub use diagnostics::{DiagnosticReport, DiagnosticTest, PreflightDiagnostics, QuickDiagnostic};
pub use error::{Error, Result};
pub use media::{MediaAccessError, MediaDevices};
pub use models::*;
pub use network::{ApiClient, SignalingClient};
pub use peer::{CallConfig, CallEvent, PeerConnectionManager};

use diagnostics::{DiagnosticsConfig, DIAGNOSTIC_TIMEOUT};
use peer::PeerServices;
use rtc::{RtcNetworkProbe, RtcTransportFactory};

const EVENT_CAPACITY: usize = 64;
const MATCH_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Client configuration
#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub server_host: String,
    pub server_port: u16,
    pub use_tls: bool,
    pub request_timeout: Duration,
    /// How often a queued request is checked in case its match
    /// notification was missed.
    pub match_poll_interval: Duration,
    /// Used when the service cannot provide ICE servers.
    pub ice_servers: Vec<IceServer>,
    pub call: CallConfig,
}

impl ClientConfig {
    pub fn new(host: &str, port: u16, use_tls: bool) -> Self {
        Self {
            server_host: host.to_string(),
            server_port: port,
            use_tls,
            ..Self::default()
        }
    }

    pub fn http_url(&self) -> String {
        let scheme = if self.use_tls { "https" } else { "http" };
        format!("{}://{}:{}", scheme, self.server_host, self.server_port)
    }

    pub fn ws_url(&self) -> String {
        let scheme = if self.use_tls { "wss" } else { "ws" };
        format!("{}://{}:{}/ws", scheme, self.server_host, self.server_port)
    }

    /// TLS, or a loopback host where plaintext is acceptable.
    pub fn is_secure(&self) -> bool {
        if self.use_tls {
            return true;
        }
        let host = self.server_host.trim_start_matches('[').trim_end_matches(']');
        host.eq_ignore_ascii_case("localhost")
            || host
                .parse::<std::net::IpAddr>()
                .map(|ip| ip.is_loopback())
                .unwrap_or(false)
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_host: "localhost".to_string(),
            server_port: 9443,
            use_tls: false,
            request_timeout: Duration::from_secs(10),
            match_poll_interval: MATCH_POLL_INTERVAL,
            ice_servers: vec![IceServer::stun("stun:stun.l.google.com:19302")],
            call: CallConfig::default(),
        }
    }
}

/// What a UI layer observes.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    MatchFound { session_id: String, partner_id: String },
    ConnectionEstablished,
    CallEnded { reason: EndReason },
    Error { message: String },
}

fn client_event(event: CallEvent) -> Option<ClientEvent> {
    match event {
        CallEvent::ConnectionEstablished => Some(ClientEvent::ConnectionEstablished),
        CallEvent::CallEnded { reason } => Some(ClientEvent::CallEnded { reason }),
        CallEvent::Error { message } => Some(ClientEvent::Error { message }),
        CallEvent::StateChanged(_) | CallEvent::Reconnecting { .. } | CallEvent::RemoteTrack(_) => None,
    }
}

/// Main client instance
pub struct CallClient {
    identity: GuestIdentity,
    api: Arc<ApiClient>,
    signaling: Arc<SignalingClient>,
    diagnostics: Arc<PreflightDiagnostics>,
    peer: Arc<PeerConnectionManager>,
    events: broadcast::Sender<ClientEvent>,
    current: Arc<Mutex<Option<String>>>,
    pending: Arc<Mutex<Option<String>>>,
    tasks: Vec<JoinHandle<()>>,
}

impl CallClient {
    /// Obtain a guest identity, open the signaling socket and start routing
    /// server messages. Calls begin when the service reports a match.
    pub async fn connect(config: ClientConfig, media: Arc<dyn MediaDevices>) -> Result<Self> {
        let api = Arc::new(ApiClient::new(&config)?);
        let identity = api.guest_login().await?;
        let (signaling, incoming) = SignalingClient::connect(&config, &identity.token).await?;
        let signaling = Arc::new(signaling);

        let diagnostics = Arc::new(PreflightDiagnostics::new(
            DiagnosticsConfig {
                secure_transport: config.is_secure(),
                ice_servers: config.ice_servers.clone(),
                test_timeout: DIAGNOSTIC_TIMEOUT,
            },
            media.clone(),
            Arc::new(RtcNetworkProbe::new(api.clone())),
        ));

        let peer = Arc::new(PeerConnectionManager::new(
            config.call.clone(),
            PeerServices {
                diagnostics: diagnostics.clone(),
                media,
                transports: Arc::new(RtcTransportFactory),
                signaling: signaling.clone(),
                reporter: api.clone(),
            },
        ));

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let current = Arc::new(Mutex::new(None));
        let pending = Arc::new(Mutex::new(None));

        let router = Router {
            user_id: identity.user_id.clone(),
            fallback_ice_servers: config.ice_servers.clone(),
            poll_interval: config.match_poll_interval,
            api: api.clone(),
            signaling: signaling.clone(),
            peer: peer.clone(),
            events: events.clone(),
            current: current.clone(),
            pending: pending.clone(),
        };
        let tasks = vec![
            tokio::spawn(forward_call_events(
                peer.subscribe(),
                signaling.clone(),
                events.clone(),
                current.clone(),
            )),
            tokio::spawn(router.run(incoming)),
        ];

        log::info!("DuoCall client connected as {}", identity.user_id);

        Ok(Self {
            identity,
            api,
            signaling,
            diagnostics,
            peer,
            events,
            current,
            pending,
            tasks,
        })
    }

    pub fn user_id(&self) -> &str {
        &self.identity.user_id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub async fn quick_diagnostic(&self) -> QuickDiagnostic {
        self.diagnostics.quick_diagnostic().await
    }

    pub async fn run_full_diagnostics(&self) -> DiagnosticReport {
        self.diagnostics.run_full_diagnostics().await
    }

    /// Enter the queue. A blocked preflight fails before anything is queued.
    pub async fn start_matching(&self, request: StartMatchingRequest) -> Result<MatchOutcome> {
        if self.current.lock().is_some() {
            return Err(Error::CallInProgress);
        }

        let quick = self.diagnostics.quick_diagnostic_for(request.call_type).await;
        if !quick.can_proceed {
            return Err(Error::InitializationBlocked { blockers: quick.blockers });
        }

        // The call itself starts from the match_found notification, or from
        // the periodic request check if that notification is lost
        let outcome = self.api.start_matching(&request).await?;
        *self.pending.lock() = Some(outcome.request_id().to_string());
        Ok(outcome)
    }

    /// Leave the queue. Never ends a call that has already been matched.
    pub async fn cancel_matching(&self, request_id: &str) -> Result<MatchingRequest> {
        let request = self.api.cancel_matching(request_id).await?;
        let mut pending = self.pending.lock();
        if pending.as_deref() == Some(request_id) {
            pending.take();
        }
        Ok(request)
    }

    pub async fn end_call(&self, reason: Option<EndReason>) -> Result<()> {
        self.peer.end_call(reason).await
    }

    pub async fn toggle_audio(&self) -> bool {
        self.peer.toggle_audio().await
    }

    pub async fn toggle_video(&self) -> bool {
        self.peer.toggle_video().await
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.peer.state()
    }

    pub fn current_session(&self) -> Option<String> {
        self.current.lock().clone()
    }

    pub async fn disconnect(&self) {
        if self.current.lock().is_some() {
            if let Err(e) = self.peer.end_call(None).await {
                log::debug!("No call to end on disconnect: {}", e);
            }
        }
        self.signaling.disconnect();
    }
}

impl Drop for CallClient {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

// ============================================================================
// Background Tasks
// ============================================================================

/// Where a queued request stands, judged from the service's records.
#[derive(Debug, Clone, PartialEq)]
enum PendingMatch {
    Waiting,
    Matched(MatchFound),
    /// Cancelled, ended, or not ours; stop checking.
    Gone,
}

fn pending_match(user_id: &str, request: &MatchingRequest, session: Option<&CallSession>) -> PendingMatch {
    match request.status {
        MatchingStatus::Waiting => return PendingMatch::Waiting,
        MatchingStatus::Cancelled => return PendingMatch::Gone,
        MatchingStatus::Matched => {}
    }

    let Some(session) = session else {
        return PendingMatch::Gone;
    };
    if session.status == CallStatus::Ended || request.call_session_id.as_deref() != Some(session.id.as_str()) {
        return PendingMatch::Gone;
    }

    let (partner_id, role) = if session.initiator_id == user_id {
        (session.receiver_id.clone(), CallRole::Initiator)
    } else if session.receiver_id.as_deref() == Some(user_id) {
        (Some(session.initiator_id.clone()), CallRole::Joiner)
    } else {
        (None, CallRole::Joiner)
    };

    match partner_id {
        Some(partner_id) => PendingMatch::Matched(MatchFound {
            request_id: request.id.clone(),
            session_id: session.id.clone(),
            partner_id,
            call_type: session.call_type,
            role,
        }),
        None => PendingMatch::Gone,
    }
}

struct Router {
    user_id: String,
    fallback_ice_servers: Vec<IceServer>,
    poll_interval: Duration,
    api: Arc<ApiClient>,
    signaling: Arc<SignalingClient>,
    peer: Arc<PeerConnectionManager>,
    events: broadcast::Sender<ClientEvent>,
    current: Arc<Mutex<Option<String>>>,
    /// Request queued by this client and not yet turned into a call.
    pending: Arc<Mutex<Option<String>>>,
}

impl Router {
    async fn run(self, mut incoming: mpsc::UnboundedReceiver<WsServerMessage>) {
        let mut poll = tokio::time::interval(self.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        poll.tick().await;

        loop {
            tokio::select! {
                message = incoming.recv() => match message {
                    Some(message) => self.route(message).await,
                    None => break,
                },
                _ = poll.tick() => self.check_pending().await,
            }
        }

        log::warn!("Signaling channel closed");
        // Without signaling a match could never connect
        let pending = self.pending.lock().take();
        if let Some(request_id) = pending {
            if let Err(e) = self.api.cancel_matching(&request_id).await {
                log::warn!("Failed to cancel request {}: {}", request_id, e);
            }
        }
        let _ = self.events.send(ClientEvent::Error {
            message: Error::NotConnected.user_message(),
        });
    }

    async fn route(&self, message: WsServerMessage) {
        match message {
            WsServerMessage::MatchFound(found) => self.match_found(found).await,
            WsServerMessage::Signal(signal) => self.peer.handle_signal(signal).await,
            WsServerMessage::CallStatus(session) => {
                let is_current = self.current.lock().as_deref() == Some(session.id.as_str());
                if is_current && session.status == CallStatus::Ended {
                    let reason = session.end_reason.unwrap_or(EndReason::PeerDisconnected);
                    if let Err(e) = self.peer.end_call(Some(reason)).await {
                        log::debug!("Remote end for call already torn down: {}", e);
                    }
                }
            }
            WsServerMessage::Error { code, message } => {
                log::warn!("Service error {}: {}", code, message);
                let _ = self.events.send(ClientEvent::Error { message });
            }
            other => log::debug!("Server message: {:?}", other),
        }
    }

    fn clear_pending(&self, request_id: &str) {
        let mut pending = self.pending.lock();
        if pending.as_deref() == Some(request_id) {
            pending.take();
        }
    }

    async fn match_found(&self, found: MatchFound) {
        self.clear_pending(&found.request_id);
        if self.current.lock().as_deref() == Some(found.session_id.as_str()) {
            log::debug!("Call {} already started", found.session_id);
            return;
        }

        let _ = self.events.send(ClientEvent::MatchFound {
            session_id: found.session_id.clone(),
            partner_id: found.partner_id.clone(),
        });
        if let Err(e) = self.begin_call(found).await {
            log::warn!("Could not start call: {}", e);
            let _ = self.events.send(ClientEvent::Error {
                message: e.user_message(),
            });
        }
    }

    /// Catch a match whose notification never arrived.
    async fn check_pending(&self) {
        if self.current.lock().is_some() {
            return;
        }
        let Some(request_id) = self.pending.lock().clone() else {
            return;
        };

        let request = match self.api.get_request(&request_id).await {
            Ok(request) => request,
            Err(e) => {
                log::debug!("Could not check request {}: {}", request_id, e);
                return;
            }
        };
        let session = match request.call_session_id.as_deref() {
            Some(session_id) => match self.api.get_session(session_id).await {
                Ok(session) => Some(session),
                Err(e) => {
                    log::debug!("Could not read session {}: {}", session_id, e);
                    return;
                }
            },
            None => None,
        };

        match pending_match(&self.user_id, &request, session.as_ref()) {
            PendingMatch::Waiting => {}
            PendingMatch::Matched(found) => {
                log::info!("Request {} was matched without a notification", request_id);
                self.match_found(found).await;
            }
            PendingMatch::Gone => self.clear_pending(&request_id),
        }
    }

    async fn begin_call(&self, found: MatchFound) -> Result<()> {
        self.signaling.join_call(&found.session_id)?;

        let ice_servers = match self.api.get_ice_servers().await {
            Ok(response) => response.ice_servers,
            Err(e) => {
                log::warn!("Falling back to configured ICE servers: {}", e);
                self.fallback_ice_servers.clone()
            }
        };

        *self.current.lock() = Some(found.session_id.clone());

        let context = CallContext {
            session_id: found.session_id.clone(),
            local_user_id: self.user_id.clone(),
            remote_user_id: found.partner_id,
            call_type: found.call_type,
            role: found.role,
            ice_servers,
        };

        if let Err(e) = self.peer.initialize(context).await {
            self.current.lock().take();
            let _ = self.signaling.leave_call(&found.session_id);
            if !matches!(e, Error::CallInProgress) {
                if let Err(report_err) = self
                    .api
                    .update_call_status(&found.session_id, CallStatus::Ended, Some(EndReason::Error))
                    .await
                {
                    log::warn!("Failed to end unstartable call: {}", report_err);
                }
            }
            return Err(e);
        }

        Ok(())
    }
}

async fn forward_call_events(
    mut calls: broadcast::Receiver<CallEvent>,
    signaling: Arc<SignalingClient>,
    events: broadcast::Sender<ClientEvent>,
    current: Arc<Mutex<Option<String>>>,
) {
    loop {
        let event = match calls.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                log::warn!("Dropped {} call events", skipped);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        if matches!(event, CallEvent::CallEnded { .. }) {
            if let Some(session_id) = current.lock().take() {
                let _ = signaling.leave_call(&session_id);
            }
        }

        if let Some(event) = client_event(event) {
            let _ = events.send(event);
        }
    }
}
