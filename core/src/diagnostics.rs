//! Preflight diagnostics
//!
//! Checks whether this device can place a call before any connection is
//! attempted. The quick check covers only the blocking conditions
//! (capability, secure transport, media access); the full battery adds
//! network checks and produces an itemized report.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use crate::error::Result;
use crate::media::{MediaConstraints, MediaDevices};
use crate::models::{CallType, IceServer};

/// Upper bound for any single network-bound check.
pub const DIAGNOSTIC_TIMEOUT: Duration = Duration::from_secs(10);

const CAPABILITY_BLOCKER: &str = "This device does not support peer-to-peer calls.";
const CAPTURE_BLOCKER: &str = "This device cannot capture audio or video.";
const SECURE_TRANSPORT_BLOCKER: &str = "Calls require a secure (TLS) connection to the service.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiagnosticTest {
    PeerConnectionSupport,
    SecureTransport,
    VideoAccess,
    AudioAccess,
    CombinedAccess,
    StunReachability,
    IceCandidates,
    OfferAnswer,
    NetworkReachability,
}

impl DiagnosticTest {
    pub fn name(&self) -> &'static str {
        match self {
            DiagnosticTest::PeerConnectionSupport => "peer_connection_support",
            DiagnosticTest::SecureTransport => "secure_transport",
            DiagnosticTest::VideoAccess => "video_access",
            DiagnosticTest::AudioAccess => "audio_access",
            DiagnosticTest::CombinedAccess => "combined_access",
            DiagnosticTest::StunReachability => "stun_reachability",
            DiagnosticTest::IceCandidates => "ice_candidates",
            DiagnosticTest::OfferAnswer => "offer_answer",
            DiagnosticTest::NetworkReachability => "network_reachability",
        }
    }

    /// Failures of these block any call attempt.
    pub fn is_critical(&self) -> bool {
        matches!(
            self,
            DiagnosticTest::PeerConnectionSupport
                | DiagnosticTest::SecureTransport
                | DiagnosticTest::VideoAccess
                | DiagnosticTest::AudioAccess
                | DiagnosticTest::CombinedAccess
        )
    }
}

#[derive(Debug, Clone)]
pub struct DiagnosticResult {
    pub test: DiagnosticTest,
    pub success: bool,
    pub error: Option<String>,
    pub details: Option<Value>,
    pub duration: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiagnosticSummary {
    pub total_tests: usize,
    pub passed: usize,
    pub failed: usize,
    pub critical_failures: Vec<DiagnosticTest>,
}

#[derive(Debug, Clone)]
pub struct DiagnosticReport {
    pub timestamp: DateTime<Utc>,
    pub results: Vec<DiagnosticResult>,
    pub summary: DiagnosticSummary,
}

impl DiagnosticReport {
    fn new(results: Vec<DiagnosticResult>) -> Self {
        let passed = results.iter().filter(|r| r.success).count();
        let critical_failures = results
            .iter()
            .filter(|r| !r.success && r.test.is_critical())
            .map(|r| r.test)
            .collect();

        Self {
            timestamp: Utc::now(),
            summary: DiagnosticSummary {
                total_tests: results.len(),
                passed,
                failed: results.len() - passed,
                critical_failures,
            },
            results,
        }
    }

    pub fn result(&self, test: DiagnosticTest) -> Option<&DiagnosticResult> {
        self.results.iter().find(|r| r.test == test)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuickDiagnostic {
    pub can_proceed: bool,
    pub blockers: Vec<String>,
}

/// Gathered ICE candidates by type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CandidateStats {
    pub host: usize,
    pub srflx: usize,
    pub prflx: usize,
    pub relay: usize,
}

impl CandidateStats {
    pub fn total(&self) -> usize {
        self.host + self.srflx + self.prflx + self.relay
    }

    pub fn distinct_types(&self) -> usize {
        [self.host, self.srflx, self.prflx, self.relay]
            .iter()
            .filter(|n| **n > 0)
            .count()
    }
}

/// Network side of the battery.
#[async_trait]
pub trait NetworkProbe: Send + Sync {
    fn peer_connection_supported(&self) -> bool;

    async fn gather_candidates(&self, ice_servers: &[IceServer]) -> Result<CandidateStats>;

    /// Negotiate between two local peers.
    async fn offer_answer_roundtrip(&self) -> Result<()>;

    async fn service_reachable(&self) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct DiagnosticsConfig {
    /// Whether the service connection is TLS or loopback.
    pub secure_transport: bool,
    pub ice_servers: Vec<IceServer>,
    pub test_timeout: Duration,
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            secure_transport: true,
            ice_servers: vec![IceServer::stun("stun:stun.l.google.com:19302")],
            test_timeout: DIAGNOSTIC_TIMEOUT,
        }
    }
}

pub struct PreflightDiagnostics {
    config: DiagnosticsConfig,
    media: Arc<dyn MediaDevices>,
    network: Arc<dyn NetworkProbe>,
}

impl PreflightDiagnostics {
    pub fn new(config: DiagnosticsConfig, media: Arc<dyn MediaDevices>, network: Arc<dyn NetworkProbe>) -> Self {
        Self { config, media, network }
    }

    pub async fn quick_diagnostic(&self) -> QuickDiagnostic {
        self.quick_diagnostic_for(CallType::Video).await
    }

    /// Re-check only the blocking conditions, with media access scoped to
    /// what `call_type` needs.
    pub async fn quick_diagnostic_for(&self, call_type: CallType) -> QuickDiagnostic {
        let mut blockers = Vec::new();

        if !self.network.peer_connection_supported() {
            blockers.push(CAPABILITY_BLOCKER.to_string());
        }
        if !self.media.capture_supported() {
            blockers.push(CAPTURE_BLOCKER.to_string());
        }
        if !self.config.secure_transport {
            blockers.push(SECURE_TRANSPORT_BLOCKER.to_string());
        }

        // Never prompt for devices on a platform that cannot call anyway
        if blockers.is_empty() {
            if let Err(e) = self.probe_media(MediaConstraints::for_call(call_type)).await {
                blockers.push(e);
            }
        }

        if !blockers.is_empty() {
            log::warn!("Preflight blocked: {:?}", blockers);
        }

        QuickDiagnostic {
            can_proceed: blockers.is_empty(),
            blockers,
        }
    }

    pub async fn run_full_diagnostics(&self) -> DiagnosticReport {
        let mut results = Vec::with_capacity(9);

        let peer_connection = self.network.peer_connection_supported();
        let capture = self.media.capture_supported();
        results.push(
            self.run_test(DiagnosticTest::PeerConnectionSupport, async {
                let details = json!({ "peer_connection": peer_connection, "media_capture": capture });
                if peer_connection && capture {
                    Ok(Some(details))
                } else if !peer_connection {
                    Err(CAPABILITY_BLOCKER.to_string())
                } else {
                    Err(CAPTURE_BLOCKER.to_string())
                }
            })
            .await,
        );

        let secure = self.config.secure_transport;
        results.push(
            self.run_test(DiagnosticTest::SecureTransport, async {
                if secure {
                    Ok(None)
                } else {
                    Err(SECURE_TRANSPORT_BLOCKER.to_string())
                }
            })
            .await,
        );

        for (test, constraints) in [
            (DiagnosticTest::VideoAccess, MediaConstraints { audio: false, video: true }),
            (DiagnosticTest::AudioAccess, MediaConstraints { audio: true, video: false }),
            (DiagnosticTest::CombinedAccess, MediaConstraints { audio: true, video: true }),
        ] {
            results.push(
                self.run_test(test, async { self.probe_media(constraints).await.map(|_| None) })
                    .await,
            );
        }

        let mut gathered: Option<std::result::Result<CandidateStats, String>> = None;
        let stun = self
            .run_test(DiagnosticTest::StunReachability, async {
                let stats = self
                    .network
                    .gather_candidates(&self.config.ice_servers)
                    .await
                    .map_err(|e| e.to_string());
                gathered = Some(stats.clone());
                let stats = stats?;
                let details = json!({ "srflx": stats.srflx, "relay": stats.relay });
                if stats.srflx > 0 {
                    Ok(Some(details))
                } else {
                    Err("No server-reflexive candidates; STUN servers are unreachable.".to_string())
                }
            })
            .await;
        results.push(stun);

        let candidates = gathered.unwrap_or_else(|| Err("Candidate gathering timed out.".to_string()));
        results.push(
            self.run_test(DiagnosticTest::IceCandidates, async {
                let stats = candidates?;
                let details = json!({
                    "host": stats.host,
                    "srflx": stats.srflx,
                    "prflx": stats.prflx,
                    "relay": stats.relay,
                    "types": stats.distinct_types(),
                });
                if stats.host > 0 {
                    Ok(Some(details))
                } else {
                    Err("No local network candidates were gathered.".to_string())
                }
            })
            .await,
        );

        results.push(
            self.run_test(DiagnosticTest::OfferAnswer, async {
                self.network
                    .offer_answer_roundtrip()
                    .await
                    .map(|_| None)
                    .map_err(|e| e.to_string())
            })
            .await,
        );

        results.push(
            self.run_test(DiagnosticTest::NetworkReachability, async {
                self.network
                    .service_reachable()
                    .await
                    .map(|_| None)
                    .map_err(|e| e.to_string())
            })
            .await,
        );

        let report = DiagnosticReport::new(results);
        log::info!(
            "Diagnostics: {}/{} passed, critical failures: {:?}",
            report.summary.passed,
            report.summary.total_tests,
            report.summary.critical_failures
        );
        report
    }

    async fn probe_media(&self, constraints: MediaConstraints) -> std::result::Result<(), String> {
        match tokio::time::timeout(self.config.test_timeout, self.media.acquire(constraints)).await {
            Ok(Ok(media)) => {
                media.stop_all();
                Ok(())
            }
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err("Timed out waiting for camera or microphone access.".to_string()),
        }
    }

    async fn run_test<F>(&self, test: DiagnosticTest, check: F) -> DiagnosticResult
    where
        F: Future<Output = std::result::Result<Option<Value>, String>>,
    {
        let started = Instant::now();
        let outcome = match tokio::time::timeout(self.config.test_timeout, check).await {
            Ok(outcome) => outcome,
            Err(_) => Err(format!("Timed out after {}s", self.config.test_timeout.as_secs())),
        };
        let duration = started.elapsed();

        match outcome {
            Ok(details) => DiagnosticResult {
                test,
                success: true,
                error: None,
                details,
                duration,
            },
            Err(error) => {
                log::debug!("Diagnostic {} failed: {}", test.name(), error);
                DiagnosticResult {
                    test,
                    success: false,
                    error: Some(error),
                    details: None,
                    duration,
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::Error;
    use crate::media::{LocalMedia, LocalTrack, MediaAccessError, TrackKind};

    pub(crate) struct FakeMedia {
        pub supported: bool,
        pub result: std::result::Result<(), MediaAccessError>,
    }

    impl FakeMedia {
        pub fn granted() -> Self {
            Self {
                supported: true,
                result: Ok(()),
            }
        }
    }

    #[async_trait]
    impl MediaDevices for FakeMedia {
        fn capture_supported(&self) -> bool {
            self.supported
        }

        async fn acquire(&self, constraints: MediaConstraints) -> std::result::Result<LocalMedia, MediaAccessError> {
            self.result.clone()?;
            let mut tracks = Vec::new();
            if constraints.audio {
                tracks.push(LocalTrack::new(TrackKind::Audio));
            }
            if constraints.video {
                tracks.push(LocalTrack::new(TrackKind::Video));
            }
            Ok(LocalMedia { tracks })
        }
    }

    pub(crate) struct FakeNetwork {
        pub supported: bool,
        pub stats: CandidateStats,
    }

    impl FakeNetwork {
        pub fn healthy() -> Self {
            Self {
                supported: true,
                stats: CandidateStats {
                    host: 2,
                    srflx: 1,
                    prflx: 0,
                    relay: 0,
                },
            }
        }
    }

    #[async_trait]
    impl NetworkProbe for FakeNetwork {
        fn peer_connection_supported(&self) -> bool {
            self.supported
        }

        async fn gather_candidates(&self, _ice_servers: &[IceServer]) -> Result<CandidateStats> {
            Ok(self.stats)
        }

        async fn offer_answer_roundtrip(&self) -> Result<()> {
            Ok(())
        }

        async fn service_reachable(&self) -> Result<()> {
            Err(Error::Network("connection refused".to_string()))
        }
    }

    fn diagnostics(media: FakeMedia, network: FakeNetwork) -> PreflightDiagnostics {
        PreflightDiagnostics::new(DiagnosticsConfig::default(), Arc::new(media), Arc::new(network))
    }

    #[tokio::test]
    async fn test_missing_peer_connection_blocks_regardless_of_media() {
        for media in [FakeMedia::granted(), FakeMedia { supported: true, result: Err(MediaAccessError::PermissionDenied) }] {
            let network = FakeNetwork {
                supported: false,
                ..FakeNetwork::healthy()
            };
            let quick = diagnostics(media, network).quick_diagnostic().await;
            assert!(!quick.can_proceed);
            assert_eq!(quick.blockers, vec![CAPABILITY_BLOCKER.to_string()]);
        }
    }

    #[tokio::test]
    async fn test_denied_media_is_explained() {
        let media = FakeMedia {
            supported: true,
            result: Err(MediaAccessError::DeviceInUse),
        };
        let quick = diagnostics(media, FakeNetwork::healthy()).quick_diagnostic().await;
        assert!(!quick.can_proceed);
        assert_eq!(quick.blockers, vec![MediaAccessError::DeviceInUse.to_string()]);
    }

    #[tokio::test]
    async fn test_quick_diagnostic_passes() {
        let quick = diagnostics(FakeMedia::granted(), FakeNetwork::healthy())
            .quick_diagnostic_for(CallType::Voice)
            .await;
        assert_eq!(
            quick,
            QuickDiagnostic {
                can_proceed: true,
                blockers: vec![]
            }
        );
    }

    #[tokio::test]
    async fn test_insecure_transport_blocks() {
        let config = DiagnosticsConfig {
            secure_transport: false,
            ..DiagnosticsConfig::default()
        };
        let diagnostics = PreflightDiagnostics::new(
            config,
            Arc::new(FakeMedia::granted()),
            Arc::new(FakeNetwork::healthy()),
        );
        let quick = diagnostics.quick_diagnostic().await;
        assert_eq!(quick.blockers, vec![SECURE_TRANSPORT_BLOCKER.to_string()]);
    }

    #[tokio::test]
    async fn test_full_report_summary() {
        let media = FakeMedia {
            supported: true,
            result: Err(MediaAccessError::PermissionDenied),
        };
        let report = diagnostics(media, FakeNetwork::healthy()).run_full_diagnostics().await;

        assert_eq!(report.summary.total_tests, 9);
        // Three media tests plus the unreachable service
        assert_eq!(report.summary.failed, 4);
        assert_eq!(report.summary.passed, 5);
        assert_eq!(
            report.summary.critical_failures,
            vec![
                DiagnosticTest::VideoAccess,
                DiagnosticTest::AudioAccess,
                DiagnosticTest::CombinedAccess
            ]
        );

        let ice = report.result(DiagnosticTest::IceCandidates).unwrap();
        assert!(ice.success);
        assert_eq!(ice.details.as_ref().unwrap()["types"], 2);
        assert!(!report.result(DiagnosticTest::NetworkReachability).unwrap().success);
    }

    #[tokio::test]
    async fn test_no_srflx_fails_stun_only() {
        let network = FakeNetwork {
            supported: true,
            stats: CandidateStats {
                host: 1,
                ..CandidateStats::default()
            },
        };
        let report = diagnostics(FakeMedia::granted(), network).run_full_diagnostics().await;
        assert!(!report.result(DiagnosticTest::StunReachability).unwrap().success);
        assert!(report.result(DiagnosticTest::IceCandidates).unwrap().success);
        assert!(report.summary.critical_failures.is_empty());
    }
}
