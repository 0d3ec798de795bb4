//! WebRTC transport backed by the `webrtc` crate

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_candidate_type::RTCIceCandidateType;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::diagnostics::{CandidateStats, NetworkProbe};
use crate::error::{Error, Result};
use crate::media::{LocalTrack, TrackKind};
use crate::models::IceServer;
use crate::network::ApiClient;
use crate::peer::{PeerTransport, TransportEvent, TransportFactory};
use crate::reconnect::TransportState;

const STREAM_ID: &str = "duocall";
/// Bound on candidate gathering and loopback connection in the probe.
const PROBE_TIMEOUT: Duration = Duration::from_secs(8);

fn build_api() -> Result<API> {
    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs()?;

    let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;

    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

fn rtc_configuration(ice_servers: &[IceServer]) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: ice_servers
            .iter()
            .map(|server| RTCIceServer {
                urls: server.urls.clone(),
                username: server.username.clone().unwrap_or_default(),
                credential: server.credential.clone().unwrap_or_default(),
                ..Default::default()
            })
            .collect(),
        ..Default::default()
    }
}

async fn new_peer_connection(ice_servers: &[IceServer]) -> Result<Arc<RTCPeerConnection>> {
    let api = build_api()?;
    Ok(Arc::new(api.new_peer_connection(rtc_configuration(ice_servers)).await?))
}

fn transport_state(state: RTCPeerConnectionState) -> Option<TransportState> {
    match state {
        RTCPeerConnectionState::New => Some(TransportState::New),
        RTCPeerConnectionState::Connecting => Some(TransportState::Connecting),
        RTCPeerConnectionState::Connected => Some(TransportState::Connected),
        RTCPeerConnectionState::Disconnected => Some(TransportState::Disconnected),
        RTCPeerConnectionState::Failed => Some(TransportState::Failed),
        RTCPeerConnectionState::Closed => Some(TransportState::Closed),
        _ => None,
    }
}

// ============================================================================
// Transport
// ============================================================================

pub struct RtcTransportFactory;

#[async_trait]
impl TransportFactory for RtcTransportFactory {
    async fn create(
        &self,
        ice_servers: &[IceServer],
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Box<dyn PeerTransport>> {
        let pc = new_peer_connection(ice_servers).await?;

        let tx = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            log::debug!("Peer connection state: {}", state);
            if let Some(state) = transport_state(state) {
                let _ = tx.send(TransportEvent::StateChanged(state));
            }
            Box::pin(async {})
        }));

        let tx = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let tx = tx.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                let encoded = candidate
                    .to_json()
                    .map_err(Error::from)
                    .and_then(|init| serde_json::to_string(&init).map_err(Error::from));
                match encoded {
                    Ok(json) => {
                        let _ = tx.send(TransportEvent::LocalCandidate(json));
                    }
                    Err(e) => log::warn!("Failed to encode local candidate: {}", e),
                }
            })
        }));

        let tx = events;
        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>, _receiver: Arc<RTCRtpReceiver>, _transceiver: Arc<RTCRtpTransceiver>| {
                let kind = match track.kind() {
                    RTPCodecType::Audio => Some(TrackKind::Audio),
                    RTPCodecType::Video => Some(TrackKind::Video),
                    _ => None,
                };
                if let Some(kind) = kind {
                    let _ = tx.send(TransportEvent::RemoteTrack(kind));
                }
                Box::pin(async {})
            },
        ));

        Ok(Box::new(RtcTransport { pc }))
    }
}

pub struct RtcTransport {
    pc: Arc<RTCPeerConnection>,
}

impl RtcTransport {
    async fn local_sdp(&self) -> Result<String> {
        self.pc
            .local_description()
            .await
            .map(|description| description.sdp)
            .ok_or_else(|| Error::WebRtc("no local description".to_string()))
    }
}

#[async_trait]
impl PeerTransport for RtcTransport {
    async fn add_local_track(&self, track: &LocalTrack) -> Result<()> {
        let mime_type = match track.kind() {
            TrackKind::Audio => MIME_TYPE_OPUS,
            TrackKind::Video => MIME_TYPE_VP8,
        };
        let sample_track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: mime_type.to_owned(),
                ..Default::default()
            },
            track.id().to_string(),
            STREAM_ID.to_string(),
        ));

        self.pc
            .add_track(sample_track as Arc<dyn TrackLocal + Send + Sync>)
            .await?;
        Ok(())
    }

    async fn create_offer(&self, ice_restart: bool) -> Result<String> {
        let options = RTCOfferOptions {
            ice_restart,
            ..Default::default()
        };
        let offer = self.pc.create_offer(Some(options)).await?;
        self.pc.set_local_description(offer).await?;
        self.local_sdp().await
    }

    async fn local_description(&self) -> Option<String> {
        self.pc.local_description().await.map(|description| description.sdp)
    }

    async fn set_remote_offer(&self, sdp: &str) -> Result<()> {
        let offer = RTCSessionDescription::offer(sdp.to_string())?;
        self.pc.set_remote_description(offer).await?;
        Ok(())
    }

    async fn create_answer(&self) -> Result<String> {
        let answer = self.pc.create_answer(None).await?;
        self.pc.set_local_description(answer).await?;
        self.local_sdp().await
    }

    async fn set_remote_answer(&self, sdp: &str) -> Result<()> {
        let answer = RTCSessionDescription::answer(sdp.to_string())?;
        self.pc.set_remote_description(answer).await?;
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        let mut rollback = RTCSessionDescription::default();
        rollback.sdp_type = RTCSdpType::Rollback;
        self.pc.set_local_description(rollback).await?;
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: &str) -> Result<()> {
        let init: RTCIceCandidateInit = serde_json::from_str(candidate)?;
        self.pc.add_ice_candidate(init).await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.pc.close().await?;
        Ok(())
    }
}

// ============================================================================
// Diagnostics Probe
// ============================================================================

pub struct RtcNetworkProbe {
    api: Arc<ApiClient>,
    timeout: Duration,
}

impl RtcNetworkProbe {
    pub fn new(api: Arc<ApiClient>) -> Self {
        Self {
            api,
            timeout: PROBE_TIMEOUT,
        }
    }

    /// Probe peer connections are closed once this elapses, whatever state
    /// gathering or the loopback call is in.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

async fn close_quietly(pc: &RTCPeerConnection) {
    if let Err(e) = pc.close().await {
        log::debug!("Error closing probe connection: {}", e);
    }
}

/// Offer with full candidate set, waiting for gathering to finish.
async fn gathered_offer(pc: &RTCPeerConnection) -> Result<RTCSessionDescription> {
    let offer = pc.create_offer(None).await?;
    let mut gathering = pc.gathering_complete_promise().await;
    pc.set_local_description(offer).await?;
    let _ = gathering.recv().await;
    pc.local_description()
        .await
        .ok_or_else(|| Error::WebRtc("no local offer".to_string()))
}

async fn gathered_answer(pc: &RTCPeerConnection) -> Result<RTCSessionDescription> {
    let answer = pc.create_answer(None).await?;
    let mut gathering = pc.gathering_complete_promise().await;
    pc.set_local_description(answer).await?;
    let _ = gathering.recv().await;
    pc.local_description()
        .await
        .ok_or_else(|| Error::WebRtc("no local answer".to_string()))
}

/// Gathering needs at least one m-line, so the probe offers a data channel.
async fn probe_offer(pc: &RTCPeerConnection) -> Result<RTCSessionDescription> {
    pc.create_data_channel("probe", None).await?;
    gathered_offer(pc).await
}

async fn loopback(
    offerer: &RTCPeerConnection,
    answerer: &RTCPeerConnection,
    states: &mut mpsc::UnboundedReceiver<RTCPeerConnectionState>,
) -> Result<()> {
    offerer.create_data_channel("loopback", None).await?;
    let offer = gathered_offer(offerer).await?;
    answerer.set_remote_description(offer).await?;
    let answer = gathered_answer(answerer).await?;
    offerer.set_remote_description(answer).await?;

    while let Some(state) = states.recv().await {
        match state {
            RTCPeerConnectionState::Connected => return Ok(()),
            RTCPeerConnectionState::Failed => {
                return Err(Error::ConnectionFailed("loopback connection failed".to_string()))
            }
            _ => {}
        }
    }
    Err(Error::ConnectionFailed("loopback connection closed".to_string()))
}

#[async_trait]
impl NetworkProbe for RtcNetworkProbe {
    fn peer_connection_supported(&self) -> bool {
        MediaEngine::default().register_default_codecs().is_ok()
    }

    async fn gather_candidates(&self, ice_servers: &[IceServer]) -> Result<CandidateStats> {
        let pc = new_peer_connection(ice_servers).await?;
        let stats = Arc::new(Mutex::new(CandidateStats::default()));

        let counter = stats.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            if let Some(candidate) = candidate {
                let mut stats = counter.lock();
                match candidate.typ {
                    RTCIceCandidateType::Host => stats.host += 1,
                    RTCIceCandidateType::Srflx => stats.srflx += 1,
                    RTCIceCandidateType::Prflx => stats.prflx += 1,
                    RTCIceCandidateType::Relay => stats.relay += 1,
                    _ => {}
                }
            }
            Box::pin(async {})
        }));

        let gathering = tokio::time::timeout(self.timeout, probe_offer(&pc)).await;
        close_quietly(&pc).await;

        match gathering {
            Ok(result) => {
                result?;
            }
            // Slow or unreachable servers show up as missing candidate types
            Err(_) => log::debug!("Candidate gathering incomplete after {:?}", self.timeout),
        }

        let stats = *stats.lock();
        log::debug!("Gathered candidates: {:?}", stats);
        Ok(stats)
    }

    async fn offer_answer_roundtrip(&self) -> Result<()> {
        let offerer = new_peer_connection(&[]).await?;
        let answerer = match new_peer_connection(&[]).await {
            Ok(answerer) => answerer,
            Err(e) => {
                close_quietly(&offerer).await;
                return Err(e);
            }
        };

        let (connected_tx, mut connected_rx) = mpsc::unbounded_channel();
        answerer.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let _ = connected_tx.send(state);
            Box::pin(async {})
        }));

        let result = tokio::time::timeout(self.timeout, loopback(&offerer, &answerer, &mut connected_rx))
            .await
            .unwrap_or_else(|_| {
                Err(Error::ConnectionFailed(format!(
                    "loopback did not connect within {:?}",
                    self.timeout
                )))
            });

        close_quietly(&offerer).await;
        close_quietly(&answerer).await;
        result
    }

    async fn service_reachable(&self) -> Result<()> {
        let health = self.api.check_health().await?;
        log::debug!("Service healthy: version {}", health.version);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::tests::FakeMedia;
    use crate::diagnostics::{DiagnosticTest, DiagnosticsConfig, PreflightDiagnostics, DIAGNOSTIC_TIMEOUT};

    #[test]
    fn test_ice_server_mapping() {
        let config = rtc_configuration(&[
            IceServer::stun("stun:stun.example.com:3478"),
            IceServer {
                urls: vec!["turn:turn.example.com:3478".to_string()],
                username: Some("1700000000-guest".to_string()),
                credential: Some("secret".to_string()),
            },
        ]);

        assert_eq!(config.ice_servers.len(), 2);
        assert!(config.ice_servers[0].username.is_empty());
        assert_eq!(config.ice_servers[1].username, "1700000000-guest");
        assert_eq!(config.ice_servers[1].credential, "secret");
    }

    #[test]
    fn test_state_mapping() {
        assert_eq!(
            transport_state(RTCPeerConnectionState::Disconnected),
            Some(TransportState::Disconnected)
        );
        assert_eq!(transport_state(RTCPeerConnectionState::Unspecified), None);
    }

    fn probe(timeout: Duration) -> RtcNetworkProbe {
        RtcNetworkProbe::new(Arc::new(ApiClient::new(&Default::default()).unwrap())).with_timeout(timeout)
    }

    // TEST-NET-1 address; nothing answers there
    const UNREACHABLE_STUN: &str = "stun:192.0.2.1:3478";

    #[tokio::test]
    async fn test_unreachable_stun_gathering_is_bounded() {
        let probe = probe(Duration::from_millis(500));

        let started = std::time::Instant::now();
        let stats = probe
            .gather_candidates(&[IceServer::stun(UNREACHABLE_STUN)])
            .await
            .unwrap();

        assert_eq!(stats.srflx, 0);
        assert!(started.elapsed() < DIAGNOSTIC_TIMEOUT);
    }

    #[tokio::test]
    async fn test_unreachable_stun_fails_diagnostics() {
        let diagnostics = PreflightDiagnostics::new(
            DiagnosticsConfig {
                secure_transport: true,
                ice_servers: vec![IceServer::stun(UNREACHABLE_STUN)],
                test_timeout: DIAGNOSTIC_TIMEOUT,
            },
            Arc::new(FakeMedia::granted()),
            Arc::new(probe(Duration::from_millis(500))),
        );

        let started = std::time::Instant::now();
        let report = diagnostics.run_full_diagnostics().await;

        let stun = report.result(DiagnosticTest::StunReachability).unwrap();
        assert!(!stun.success);
        assert!(stun.duration < DIAGNOSTIC_TIMEOUT);
        assert!(started.elapsed() < DIAGNOSTIC_TIMEOUT * 2);
    }

    #[test]
    fn test_codecs_register() {
        assert!(RtcNetworkProbe::new(Arc::new(ApiClient::new(&Default::default()).unwrap()))
            .peer_connection_supported());
    }
}
