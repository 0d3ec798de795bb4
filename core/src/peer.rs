//! Peer connection management
//!
//! One driver task owns the active call: local media, the transport and the
//! reconnection machine. The public handle talks to it over a command
//! channel and observes it through a broadcast of [`CallEvent`]s.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;

use crate::diagnostics::PreflightDiagnostics;
use crate::error::{Error, Result};
use crate::media::{LocalMedia, LocalTrack, MediaConstraints, MediaDevices, TrackKind};
use crate::models::{
    CallContext, CallRole, CallStatus, ConnectionState, EndReason, IceServer, SignalType, SignalingMessage,
};
use crate::reconnect::{
    Action, ConnectionMachine, Input, TransportState, MAX_RECONNECT_ATTEMPTS, NEGOTIATION_TIMEOUT, RECOVERY_TIMEOUT,
};

/// How often an unanswered offer is sent again.
pub const OFFER_RESEND_INTERVAL: Duration = Duration::from_secs(2);

const EVENT_CAPACITY: usize = 64;

// ============================================================================
// Seams
// ============================================================================

/// One peer connection. SDP and candidates travel as opaque strings.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn add_local_track(&self, track: &LocalTrack) -> Result<()>;

    /// Create an offer, apply it locally and return its SDP.
    async fn create_offer(&self, ice_restart: bool) -> Result<String>;

    /// Current local description, including candidates gathered so far.
    async fn local_description(&self) -> Option<String>;

    async fn set_remote_offer(&self, sdp: &str) -> Result<()>;

    /// Answer the applied remote offer, apply the answer locally and return it.
    async fn create_answer(&self) -> Result<String>;

    async fn set_remote_answer(&self, sdp: &str) -> Result<()>;

    /// Discard a pending local offer.
    async fn rollback(&self) -> Result<()>;

    async fn add_remote_candidate(&self, candidate: &str) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    LocalCandidate(String),
    StateChanged(TransportState),
    RemoteTrack(TrackKind),
}

#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(
        &self,
        ice_servers: &[IceServer],
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Box<dyn PeerTransport>>;
}

/// Outbound half of the signaling channel.
#[async_trait]
pub trait SignalingSink: Send + Sync {
    async fn send_signal(&self, message: SignalingMessage) -> Result<()>;
}

/// Reports call lifecycle changes to the session registry.
#[async_trait]
pub trait CallStatusReporter: Send + Sync {
    async fn report_status(&self, session_id: &str, status: CallStatus, end_reason: Option<EndReason>) -> Result<()>;
}

// ============================================================================
// Configuration & Events
// ============================================================================

#[derive(Debug, Clone)]
pub struct CallConfig {
    pub max_reconnect_attempts: u32,
    pub recovery_timeout: Duration,
    pub negotiation_timeout: Duration,
    pub offer_resend_interval: Duration,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: MAX_RECONNECT_ATTEMPTS,
            recovery_timeout: RECOVERY_TIMEOUT,
            negotiation_timeout: NEGOTIATION_TIMEOUT,
            offer_resend_interval: OFFER_RESEND_INTERVAL,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CallEvent {
    StateChanged(ConnectionState),
    ConnectionEstablished,
    Reconnecting { attempt: u32 },
    RemoteTrack(TrackKind),
    CallEnded { reason: EndReason },
    Error { message: String },
}

#[derive(Clone)]
pub struct PeerServices {
    pub diagnostics: Arc<PreflightDiagnostics>,
    pub media: Arc<dyn MediaDevices>,
    pub transports: Arc<dyn TransportFactory>,
    pub signaling: Arc<dyn SignalingSink>,
    pub reporter: Arc<dyn CallStatusReporter>,
}

// ============================================================================
// Handle
// ============================================================================

enum Command {
    Initialize {
        context: CallContext,
        reply: oneshot::Sender<Result<()>>,
    },
    Signal {
        message: SignalingMessage,
        reply: oneshot::Sender<()>,
    },
    Toggle {
        kind: TrackKind,
        reply: oneshot::Sender<bool>,
    },
    EndCall {
        reason: EndReason,
        reply: oneshot::Sender<Result<()>>,
    },
}

pub struct PeerConnectionManager {
    commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<CallEvent>,
    state: Arc<RwLock<ConnectionState>>,
}

impl PeerConnectionManager {
    /// Spawn the driver task. Must be called within a Tokio runtime.
    pub fn new(config: CallConfig, services: PeerServices) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let state = Arc::new(RwLock::new(ConnectionState::New));

        let driver = Driver {
            config,
            services,
            events: events.clone(),
            state: state.clone(),
            call: None,
        };
        tokio::spawn(driver.run(command_rx));

        Self { commands, events, state }
    }

    /// Start a call. Fails with `InitializationBlocked` when preflight finds a
    /// blocker and with `CallInProgress` while another call is live.
    pub async fn initialize(&self, context: CallContext) -> Result<()> {
        self.request(|reply| Command::Initialize { context, reply }).await?
    }

    /// Apply a signal from the remote peer. Returns once it has been handled.
    pub async fn handle_signal(&self, message: SignalingMessage) {
        if let Err(e) = self.request(|reply| Command::Signal { message, reply }).await {
            log::debug!("Signal not delivered to driver: {}", e);
        }
    }

    pub async fn toggle_audio(&self) -> bool {
        self.request(|reply| Command::Toggle {
            kind: TrackKind::Audio,
            reply,
        })
        .await
        .unwrap_or(false)
    }

    pub async fn toggle_video(&self) -> bool {
        self.request(|reply| Command::Toggle {
            kind: TrackKind::Video,
            reply,
        })
        .await
        .unwrap_or(false)
    }

    /// Tear the call down; `None` means the local user hung up.
    pub async fn end_call(&self, reason: Option<EndReason>) -> Result<()> {
        let reason = reason.unwrap_or(EndReason::UserEnded);
        self.request(|reply| Command::EndCall { reason, reply }).await?
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.events.subscribe()
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.commands.send(command(reply)).map_err(|_| driver_stopped())?;
        response.await.map_err(|_| driver_stopped())
    }
}

fn driver_stopped() -> Error {
    Error::ConnectionFailed("peer connection driver stopped".to_string())
}

// ============================================================================
// Driver
// ============================================================================

struct ActiveCall {
    context: CallContext,
    media: LocalMedia,
    transport: Box<dyn PeerTransport>,
    transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    machine: ConnectionMachine,
    /// A local offer is awaiting its answer.
    making_offer: bool,
    has_remote_description: bool,
    pending_candidates: Vec<String>,
    remote_tracks: Vec<TrackKind>,
    negotiation_deadline: Option<Instant>,
    recovery: Option<(Instant, u64)>,
    resend_at: Option<Instant>,
}

impl ActiveCall {
    fn signal(&self, signal_type: SignalType, data: String) -> SignalingMessage {
        SignalingMessage {
            signal_type,
            data,
            from_user_id: self.context.local_user_id.clone(),
            to_user_id: self.context.remote_user_id.clone(),
            call_session_id: self.context.session_id.clone(),
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        [
            self.negotiation_deadline,
            self.recovery.map(|(at, _)| at),
            self.resend_at,
        ]
        .into_iter()
        .flatten()
        .min()
    }

    async fn flush_candidates(&mut self) {
        for candidate in std::mem::take(&mut self.pending_candidates) {
            if let Err(e) = self.transport.add_remote_candidate(&candidate).await {
                log::debug!("Dropping buffered candidate: {}", e);
            }
        }
    }
}

struct Driver {
    config: CallConfig,
    services: PeerServices,
    events: broadcast::Sender<CallEvent>,
    state: Arc<RwLock<ConnectionState>>,
    call: Option<ActiveCall>,
}

async fn next_transport_event(call: &mut Option<ActiveCall>) -> Option<TransportEvent> {
    match call {
        Some(call) => call.transport_events.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

fn emit(events: &broadcast::Sender<CallEvent>, event: CallEvent) {
    // No receivers is fine
    let _ = events.send(event);
}

impl Driver {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        loop {
            let deadline = self.call.as_ref().and_then(ActiveCall::next_deadline);

            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => {
                        self.teardown(EndReason::UserEnded).await;
                        break;
                    }
                },
                Some(event) = next_transport_event(&mut self.call) => self.handle_transport_event(event).await,
                _ = sleep_until_deadline(deadline) => self.handle_timers().await,
            }
        }
        log::debug!("Peer connection driver stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Initialize { context, reply } => {
                let result = self.initialize(context).await;
                let _ = reply.send(result);
            }
            Command::Signal { message, reply } => {
                self.handle_signal(message).await;
                let _ = reply.send(());
            }
            Command::Toggle { kind, reply } => {
                let enabled = self.call.as_ref().map(|call| call.media.toggle(kind)).unwrap_or(false);
                let _ = reply.send(enabled);
            }
            Command::EndCall { reason, reply } => {
                let result = if self.call.is_some() {
                    self.teardown(reason).await;
                    Ok(())
                } else {
                    Err(Error::NoActiveCall)
                };
                let _ = reply.send(result);
            }
        }
    }

    async fn initialize(&mut self, context: CallContext) -> Result<()> {
        if self.call.is_some() {
            return Err(Error::CallInProgress);
        }

        let quick = self.services.diagnostics.quick_diagnostic_for(context.call_type).await;
        if !quick.can_proceed {
            return Err(Error::InitializationBlocked { blockers: quick.blockers });
        }

        let media = self
            .services
            .media
            .acquire(MediaConstraints::for_call(context.call_type))
            .await?;

        let (events_tx, transport_events) = mpsc::unbounded_channel();
        let transport = match self.services.transports.create(&context.ice_servers, events_tx).await {
            Ok(transport) => transport,
            Err(e) => {
                media.stop_all();
                return Err(e);
            }
        };

        for track in &media.tracks {
            if let Err(e) = transport.add_local_track(track).await {
                media.stop_all();
                if let Err(close_err) = transport.close().await {
                    log::debug!("Error closing abandoned transport: {}", close_err);
                }
                return Err(e);
            }
        }

        let mut machine = ConnectionMachine::new(self.config.max_reconnect_attempts);
        machine.start();

        log::info!(
            "Starting {:?} call {} as {:?}",
            context.call_type,
            context.session_id,
            context.role
        );

        let role = context.role;
        self.call = Some(ActiveCall {
            context,
            media,
            transport,
            transport_events,
            machine,
            making_offer: false,
            has_remote_description: false,
            pending_candidates: Vec::new(),
            remote_tracks: Vec::new(),
            negotiation_deadline: Some(Instant::now() + self.config.negotiation_timeout),
            recovery: None,
            resend_at: None,
        });
        self.publish_state();

        if role == CallRole::Initiator {
            if let Err(e) = self.send_offer(false).await {
                self.teardown(EndReason::Error).await;
                return Err(e);
            }
        }

        Ok(())
    }

    // ------------------------------------------------------------------------
    // Negotiation
    // ------------------------------------------------------------------------

    async fn send_offer(&mut self, ice_restart: bool) -> Result<()> {
        let Some(call) = self.call.as_mut() else {
            return Err(Error::NoActiveCall);
        };

        call.making_offer = true;
        let sdp = match call.transport.create_offer(ice_restart).await {
            Ok(sdp) => sdp,
            Err(e) => {
                call.making_offer = false;
                return Err(e);
            }
        };
        call.resend_at = Some(Instant::now() + self.config.offer_resend_interval);

        self.services
            .signaling
            .send_signal(call.signal(SignalType::Offer, sdp))
            .await
    }

    /// The relay drops signals for a peer that has not joined yet.
    async fn resend_offer(&mut self) {
        let Some(call) = self.call.as_mut() else {
            return;
        };
        if !call.making_offer {
            return;
        }
        call.resend_at = Some(Instant::now() + self.config.offer_resend_interval);

        let Some(sdp) = call.transport.local_description().await else {
            return;
        };
        log::debug!("Resending unanswered offer for call {}", call.context.session_id);
        if let Err(e) = self
            .services
            .signaling
            .send_signal(call.signal(SignalType::Offer, sdp))
            .await
        {
            log::warn!("Failed to resend offer: {}", e);
        }
    }

    async fn handle_signal(&mut self, message: SignalingMessage) {
        let Some(call) = self.call.as_ref() else {
            log::debug!("Dropping {:?} signal with no active call", message.signal_type);
            return;
        };
        if message.call_session_id != call.context.session_id || message.from_user_id != call.context.remote_user_id {
            log::debug!(
                "Dropping {:?} signal for call {} from {}",
                message.signal_type,
                message.call_session_id,
                message.from_user_id
            );
            return;
        }

        let signal_type = message.signal_type;
        let result = match signal_type {
            SignalType::Offer => self.apply_offer(message.data).await,
            SignalType::Answer => self.apply_answer(message.data).await,
            SignalType::IceCandidate => self.apply_candidate(message.data).await,
        };
        if let Err(e) = result {
            log::warn!("Failed to apply remote {:?}: {}", signal_type, e);
        }
    }

    async fn apply_offer(&mut self, sdp: String) -> Result<()> {
        let Some(call) = self.call.as_mut() else {
            return Ok(());
        };

        if call.making_offer {
            // Glare: the initiator keeps its own offer, the joiner yields
            if call.context.role == CallRole::Initiator {
                log::debug!("Ignoring colliding offer on call {}", call.context.session_id);
                return Ok(());
            }
            call.transport.rollback().await?;
            call.making_offer = false;
            call.resend_at = None;
        }

        call.transport.set_remote_offer(&sdp).await?;
        call.has_remote_description = true;
        call.flush_candidates().await;

        let answer = call.transport.create_answer().await?;
        self.services
            .signaling
            .send_signal(call.signal(SignalType::Answer, answer))
            .await
    }

    async fn apply_answer(&mut self, sdp: String) -> Result<()> {
        let Some(call) = self.call.as_mut() else {
            return Ok(());
        };
        if !call.making_offer {
            log::debug!("Ignoring answer with no pending offer on call {}", call.context.session_id);
            return Ok(());
        }

        call.transport.set_remote_answer(&sdp).await?;
        call.making_offer = false;
        call.resend_at = None;
        call.has_remote_description = true;
        call.flush_candidates().await;
        Ok(())
    }

    async fn apply_candidate(&mut self, candidate: String) -> Result<()> {
        let Some(call) = self.call.as_mut() else {
            return Ok(());
        };
        if call.has_remote_description {
            call.transport.add_remote_candidate(&candidate).await
        } else {
            call.pending_candidates.push(candidate);
            Ok(())
        }
    }

    // ------------------------------------------------------------------------
    // Monitoring
    // ------------------------------------------------------------------------

    async fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::LocalCandidate(candidate) => {
                let Some(call) = self.call.as_ref() else {
                    return;
                };
                if let Err(e) = self
                    .services
                    .signaling
                    .send_signal(call.signal(SignalType::IceCandidate, candidate))
                    .await
                {
                    log::debug!("Failed to forward local candidate: {}", e);
                }
            }
            TransportEvent::StateChanged(state) => self.drive(Input::Transport(state)).await,
            TransportEvent::RemoteTrack(kind) => {
                if let Some(call) = self.call.as_mut() {
                    call.remote_tracks.push(kind);
                }
                emit(&self.events, CallEvent::RemoteTrack(kind));
            }
        }
    }

    async fn handle_timers(&mut self) {
        let now = Instant::now();
        let mut inputs = Vec::new();
        let mut resend = false;

        if let Some(call) = self.call.as_mut() {
            if call.negotiation_deadline.is_some_and(|at| at <= now) {
                call.negotiation_deadline = None;
                inputs.push(Input::NegotiationTimeout);
            }
            if let Some((at, generation)) = call.recovery {
                if at <= now {
                    call.recovery = None;
                    inputs.push(Input::RecoveryTimeout { generation });
                }
            }
            if call.resend_at.is_some_and(|at| at <= now) {
                call.resend_at = None;
                resend = true;
            }
        }

        if resend {
            self.resend_offer().await;
        }
        for input in inputs {
            self.drive(input).await;
        }
    }

    /// Feed the reconnection machine and carry out what it decides.
    async fn drive(&mut self, input: Input) {
        let Some(call) = self.call.as_mut() else {
            return;
        };
        let actions = call.machine.handle(input);
        self.publish_state();

        for action in actions {
            match action {
                Action::Established => {
                    if let Some(call) = self.call.as_mut() {
                        call.negotiation_deadline = None;
                        call.recovery = None;
                        log::info!("Call {} connected", call.context.session_id);
                    }
                    self.report(CallStatus::Connected, None).await;
                    emit(&self.events, CallEvent::ConnectionEstablished);
                }
                Action::IceRestart { attempt, generation } => {
                    emit(&self.events, CallEvent::Reconnecting { attempt });
                    if let Some(call) = self.call.as_mut() {
                        call.negotiation_deadline = None;
                        call.recovery = Some((Instant::now() + self.config.recovery_timeout, generation));
                    }
                    if let Err(e) = self.send_offer(true).await {
                        log::warn!("ICE restart attempt {} failed: {}", attempt, e);
                    }
                }
                Action::Fail { reason, message } => {
                    emit(&self.events, CallEvent::Error { message });
                    self.teardown(reason).await;
                    return;
                }
                Action::Release => {
                    self.teardown(EndReason::PeerDisconnected).await;
                    return;
                }
            }
        }
    }

    async fn report(&self, status: CallStatus, end_reason: Option<EndReason>) {
        let Some(call) = self.call.as_ref() else {
            return;
        };
        if let Err(e) = self
            .services
            .reporter
            .report_status(&call.context.session_id, status, end_reason)
            .await
        {
            log::warn!("Failed to report {:?} for call {}: {}", status, call.context.session_id, e);
        }
    }

    // ------------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------------

    async fn teardown(&mut self, reason: EndReason) {
        let Some(mut call) = self.call.take() else {
            return;
        };

        call.machine.handle(Input::Close);
        call.media.stop_all();
        call.remote_tracks.clear();
        if let Err(e) = call.transport.close().await {
            log::debug!("Error closing transport: {}", e);
        }
        self.set_state(ConnectionState::Closed);

        if let Err(e) = self
            .services
            .reporter
            .report_status(&call.context.session_id, CallStatus::Ended, Some(reason))
            .await
        {
            log::warn!("Failed to report end of call {}: {}", call.context.session_id, e);
        }

        log::info!("Call {} ended: {:?}", call.context.session_id, reason);
        emit(&self.events, CallEvent::CallEnded { reason });
    }

    fn publish_state(&self) {
        if let Some(call) = self.call.as_ref() {
            self.set_state(call.machine.state());
        }
    }

    fn set_state(&self, next: ConnectionState) {
        let changed = {
            let mut state = self.state.write();
            let changed = *state != next;
            *state = next;
            changed
        };
        if changed {
            emit(&self.events, CallEvent::StateChanged(next));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::tests::{FakeMedia, FakeNetwork};
    use crate::diagnostics::DiagnosticsConfig;
    use crate::models::CallType;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Recorder {
        log: Mutex<Vec<String>>,
        offers: AtomicUsize,
    }

    impl Recorder {
        fn push(&self, entry: impl Into<String>) {
            self.log.lock().push(entry.into());
        }
    }

    struct FakeTransport {
        recorder: Arc<Recorder>,
        local: Mutex<Option<String>>,
    }

    #[async_trait]
    impl PeerTransport for FakeTransport {
        async fn add_local_track(&self, track: &LocalTrack) -> Result<()> {
            self.recorder.push(format!("track:{:?}", track.kind()));
            Ok(())
        }

        async fn create_offer(&self, ice_restart: bool) -> Result<String> {
            let n = self.recorder.offers.fetch_add(1, Ordering::SeqCst) + 1;
            let sdp = format!("offer-{}", n);
            self.recorder.push(if ice_restart { "restart-offer" } else { "offer" });
            *self.local.lock() = Some(sdp.clone());
            Ok(sdp)
        }

        async fn local_description(&self) -> Option<String> {
            self.local.lock().clone()
        }

        async fn set_remote_offer(&self, sdp: &str) -> Result<()> {
            self.recorder.push(format!("remote-offer:{}", sdp));
            Ok(())
        }

        async fn create_answer(&self) -> Result<String> {
            self.recorder.push("answer");
            Ok("answer-sdp".to_string())
        }

        async fn set_remote_answer(&self, sdp: &str) -> Result<()> {
            self.recorder.push(format!("remote-answer:{}", sdp));
            Ok(())
        }

        async fn rollback(&self) -> Result<()> {
            self.recorder.push("rollback");
            *self.local.lock() = None;
            Ok(())
        }

        async fn add_remote_candidate(&self, candidate: &str) -> Result<()> {
            self.recorder.push(format!("candidate:{}", candidate));
            Ok(())
        }

        async fn close(&self) -> Result<()> {
            self.recorder.push("close");
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeFactory {
        recorder: Arc<Recorder>,
        events: Mutex<Option<mpsc::UnboundedSender<TransportEvent>>>,
    }

    #[async_trait]
    impl TransportFactory for FakeFactory {
        async fn create(
            &self,
            _ice_servers: &[IceServer],
            events: mpsc::UnboundedSender<TransportEvent>,
        ) -> Result<Box<dyn PeerTransport>> {
            *self.events.lock() = Some(events);
            Ok(Box::new(FakeTransport {
                recorder: self.recorder.clone(),
                local: Mutex::new(None),
            }))
        }
    }

    struct FakeSignaling {
        tx: mpsc::UnboundedSender<SignalingMessage>,
    }

    #[async_trait]
    impl SignalingSink for FakeSignaling {
        async fn send_signal(&self, message: SignalingMessage) -> Result<()> {
            self.tx.send(message).map_err(|e| Error::WebSocket(e.to_string()))
        }
    }

    #[derive(Default)]
    struct FakeReporter {
        reports: Mutex<Vec<(CallStatus, Option<EndReason>)>>,
    }

    #[async_trait]
    impl CallStatusReporter for FakeReporter {
        async fn report_status(&self, _session_id: &str, status: CallStatus, end_reason: Option<EndReason>) -> Result<()> {
            self.reports.lock().push((status, end_reason));
            Ok(())
        }
    }

    struct Harness {
        manager: PeerConnectionManager,
        factory: Arc<FakeFactory>,
        reporter: Arc<FakeReporter>,
        signals: mpsc::UnboundedReceiver<SignalingMessage>,
        events: broadcast::Receiver<CallEvent>,
    }

    impl Harness {
        fn new(network: FakeNetwork) -> Self {
            let media: Arc<dyn MediaDevices> = Arc::new(FakeMedia::granted());
            let diagnostics = Arc::new(PreflightDiagnostics::new(
                DiagnosticsConfig::default(),
                media.clone(),
                Arc::new(network),
            ));
            let factory = Arc::new(FakeFactory::default());
            let reporter = Arc::new(FakeReporter::default());
            let (tx, signals) = mpsc::unbounded_channel();

            let manager = PeerConnectionManager::new(
                CallConfig::default(),
                PeerServices {
                    diagnostics,
                    media,
                    transports: factory.clone(),
                    signaling: Arc::new(FakeSignaling { tx }),
                    reporter: reporter.clone(),
                },
            );
            let events = manager.subscribe();

            Self {
                manager,
                factory,
                reporter,
                signals,
                events,
            }
        }

        fn transport_event(&self, event: TransportEvent) {
            self.factory.events.lock().as_ref().unwrap().send(event).unwrap();
        }

        /// Next event other than a state change.
        async fn next_event(&mut self) -> CallEvent {
            loop {
                match self.events.recv().await.unwrap() {
                    CallEvent::StateChanged(_) => continue,
                    event => return event,
                }
            }
        }

        /// Transport calls other than track setup.
        fn log(&self) -> Vec<String> {
            self.factory
                .recorder
                .log
                .lock()
                .iter()
                .filter(|entry| !entry.starts_with("track:"))
                .cloned()
                .collect()
        }

        fn reports(&self) -> Vec<(CallStatus, Option<EndReason>)> {
            self.reporter.reports.lock().clone()
        }

        async fn connect_as_initiator(&mut self) {
            self.manager.initialize(context(CallRole::Initiator)).await.unwrap();
            self.signals.recv().await.unwrap();
            self.manager.handle_signal(from_partner(SignalType::Answer, "answer-sdp")).await;
            self.transport_event(TransportEvent::StateChanged(TransportState::Connected));
            assert_eq!(self.next_event().await, CallEvent::ConnectionEstablished);
        }
    }

    fn context(role: CallRole) -> CallContext {
        CallContext {
            session_id: "call-1".to_string(),
            local_user_id: "me".to_string(),
            remote_user_id: "partner".to_string(),
            call_type: CallType::Video,
            role,
            ice_servers: vec![],
        }
    }

    fn from_partner(signal_type: SignalType, data: &str) -> SignalingMessage {
        SignalingMessage {
            signal_type,
            data: data.to_string(),
            from_user_id: "partner".to_string(),
            to_user_id: "me".to_string(),
            call_session_id: "call-1".to_string(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_initiator_resends_offer_until_answered() {
        let mut h = Harness::new(FakeNetwork::healthy());
        h.manager.initialize(context(CallRole::Initiator)).await.unwrap();
        assert_eq!(h.manager.state(), ConnectionState::Connecting);

        let offer = h.signals.recv().await.unwrap();
        assert_eq!(offer.signal_type, SignalType::Offer);
        assert_eq!(offer.to_user_id, "partner");
        assert_eq!(offer.call_session_id, "call-1");

        // Nobody answered yet
        let resent = h.signals.recv().await.unwrap();
        assert_eq!(resent.signal_type, SignalType::Offer);
        assert_eq!(resent.data, offer.data);

        h.manager.handle_signal(from_partner(SignalType::Answer, "answer-sdp")).await;
        h.manager.handle_signal(from_partner(SignalType::Answer, "answer-sdp")).await;
        let answers = h.log().iter().filter(|e| e.starts_with("remote-answer")).count();
        assert_eq!(answers, 1);

        h.transport_event(TransportEvent::StateChanged(TransportState::Connected));
        assert_eq!(h.next_event().await, CallEvent::ConnectionEstablished);
        assert_eq!(h.manager.state(), ConnectionState::Connected);
        assert_eq!(h.reports(), vec![(CallStatus::Connected, None)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_joiner_buffers_candidates_until_offer() {
        let mut h = Harness::new(FakeNetwork::healthy());
        h.manager.initialize(context(CallRole::Joiner)).await.unwrap();
        assert!(h.signals.try_recv().is_err());

        h.manager.handle_signal(from_partner(SignalType::IceCandidate, "c1")).await;
        assert!(h.log().is_empty());

        let mut foreign = from_partner(SignalType::Offer, "offer-x");
        foreign.call_session_id = "call-2".to_string();
        h.manager.handle_signal(foreign).await;
        assert!(h.log().is_empty());

        h.manager.handle_signal(from_partner(SignalType::Offer, "offer-1")).await;
        let answer = h.signals.recv().await.unwrap();
        assert_eq!(answer.signal_type, SignalType::Answer);
        assert_eq!(answer.data, "answer-sdp");

        h.manager.handle_signal(from_partner(SignalType::IceCandidate, "c2")).await;
        assert_eq!(
            h.log(),
            vec!["remote-offer:offer-1", "candidate:c1", "answer", "candidate:c2"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_candidates_are_forwarded() {
        let mut h = Harness::new(FakeNetwork::healthy());
        h.manager.initialize(context(CallRole::Joiner)).await.unwrap();

        h.transport_event(TransportEvent::LocalCandidate("host-1".to_string()));
        let signal = h.signals.recv().await.unwrap();
        assert_eq!(signal.signal_type, SignalType::IceCandidate);
        assert_eq!(signal.data, "host-1");
        assert_eq!(signal.from_user_id, "me");

        h.transport_event(TransportEvent::RemoteTrack(TrackKind::Video));
        assert_eq!(h.next_event().await, CallEvent::RemoteTrack(TrackKind::Video));
    }

    #[tokio::test(start_paused = true)]
    async fn test_glare_initiator_ignores_joiner_yields() {
        let mut initiator = Harness::new(FakeNetwork::healthy());
        initiator.manager.initialize(context(CallRole::Initiator)).await.unwrap();
        initiator.manager.handle_signal(from_partner(SignalType::Offer, "offer-x")).await;
        assert_eq!(initiator.log(), vec!["offer"]);

        let mut joiner = Harness::new(FakeNetwork::healthy());
        joiner.manager.initialize(context(CallRole::Joiner)).await.unwrap();
        joiner.transport_event(TransportEvent::StateChanged(TransportState::Disconnected));
        assert_eq!(joiner.next_event().await, CallEvent::Reconnecting { attempt: 1 });
        assert_eq!(joiner.signals.recv().await.unwrap().signal_type, SignalType::Offer);

        joiner.manager.handle_signal(from_partner(SignalType::Offer, "offer-x")).await;
        assert_eq!(
            joiner.log(),
            vec!["restart-offer", "rollback", "remote-offer:offer-x", "answer"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_three_restarts_then_peer_disconnected() {
        let mut h = Harness::new(FakeNetwork::healthy());
        h.connect_as_initiator().await;

        for attempt in 1..=3 {
            h.transport_event(TransportEvent::StateChanged(TransportState::Disconnected));
            assert_eq!(h.next_event().await, CallEvent::Reconnecting { attempt });
        }

        h.transport_event(TransportEvent::StateChanged(TransportState::Disconnected));
        assert_eq!(
            h.next_event().await,
            CallEvent::Error {
                message: "Your partner disconnected.".to_string()
            }
        );
        assert_eq!(
            h.next_event().await,
            CallEvent::CallEnded {
                reason: EndReason::PeerDisconnected
            }
        );

        let log = h.log();
        assert_eq!(log.iter().filter(|e| *e == "restart-offer").count(), 3);
        assert_eq!(log.last().map(String::as_str), Some("close"));
        assert_eq!(
            h.reports().last(),
            Some(&(CallStatus::Ended, Some(EndReason::PeerDisconnected)))
        );
        assert_eq!(h.manager.state(), ConnectionState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_timers_escalate_to_timeout() {
        let mut h = Harness::new(FakeNetwork::healthy());
        h.connect_as_initiator().await;

        h.transport_event(TransportEvent::StateChanged(TransportState::Disconnected));
        for attempt in 1..=3 {
            assert_eq!(h.next_event().await, CallEvent::Reconnecting { attempt });
        }
        assert_eq!(
            h.next_event().await,
            CallEvent::Error {
                message: "Reconnecting to your partner timed out.".to_string()
            }
        );
        assert_eq!(
            h.next_event().await,
            CallEvent::CallEnded {
                reason: EndReason::Timeout
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_resets_attempts() {
        let mut h = Harness::new(FakeNetwork::healthy());
        h.connect_as_initiator().await;

        h.transport_event(TransportEvent::StateChanged(TransportState::Disconnected));
        assert_eq!(h.next_event().await, CallEvent::Reconnecting { attempt: 1 });
        h.manager.handle_signal(from_partner(SignalType::Answer, "answer-sdp")).await;
        h.transport_event(TransportEvent::StateChanged(TransportState::Connected));
        assert_eq!(h.next_event().await, CallEvent::ConnectionEstablished);

        h.transport_event(TransportEvent::StateChanged(TransportState::Disconnected));
        assert_eq!(h.next_event().await, CallEvent::Reconnecting { attempt: 1 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_initialize_rejections() {
        let blocked = Harness::new(FakeNetwork {
            supported: false,
            ..FakeNetwork::healthy()
        });
        match blocked.manager.initialize(context(CallRole::Initiator)).await {
            Err(Error::InitializationBlocked { blockers }) => assert_eq!(blockers.len(), 1),
            other => panic!("expected blocked, got {:?}", other),
        }
        assert!(blocked.factory.events.lock().is_none());
        assert_eq!(blocked.manager.state(), ConnectionState::New);

        let h = Harness::new(FakeNetwork::healthy());
        h.manager.initialize(context(CallRole::Joiner)).await.unwrap();
        assert!(matches!(
            h.manager.initialize(context(CallRole::Joiner)).await,
            Err(Error::CallInProgress)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_toggles_and_end_call() {
        let mut h = Harness::new(FakeNetwork::healthy());
        assert!(!h.manager.toggle_audio().await);

        h.manager.initialize(context(CallRole::Joiner)).await.unwrap();
        assert!(!h.manager.toggle_audio().await);
        assert!(h.manager.toggle_audio().await);
        assert!(!h.manager.toggle_video().await);

        h.manager.end_call(None).await.unwrap();
        assert_eq!(
            h.next_event().await,
            CallEvent::CallEnded {
                reason: EndReason::UserEnded
            }
        );
        assert_eq!(h.reports(), vec![(CallStatus::Ended, Some(EndReason::UserEnded))]);
        assert_eq!(h.log(), vec!["close"]);

        assert!(matches!(h.manager.end_call(None).await, Err(Error::NoActiveCall)));
        assert!(!h.manager.toggle_video().await);

        // A fresh initialize starts over
        h.manager.initialize(context(CallRole::Joiner)).await.unwrap();
        assert_eq!(h.manager.state(), ConnectionState::Connecting);
    }
}
