//! Production [`MediaSession`] backed by the `webrtc` crate.
//!
//! One session owns one peer connection and the microphone capture for
//! its lifetime. Remote candidates that arrive before the remote
//! description are queued and drained once it is set; candidate delivery
//! order is not guaranteed by the relay.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, warn};

use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use beacon_shared::{CandidatePayload, SdpKind, SessionDescription};

use crate::capture::{AudioCapture, AudioPlayback};
use crate::error::MediaError;
use crate::session::{MediaBackend, MediaConfig, MediaSession};

/// Factory for [`WebRtcSession`]s.
pub struct WebRtcBackend {
    config: MediaConfig,
}

impl WebRtcBackend {
    pub fn new(config: MediaConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl MediaBackend for WebRtcBackend {
    async fn open(&self) -> Result<Box<dyn MediaSession>, MediaError> {
        let session = WebRtcSession::open(&self.config).await?;
        Ok(Box::new(session))
    }
}

#[derive(Default)]
struct Negotiation {
    have_remote: bool,
    queued: Vec<CandidatePayload>,
    applied: HashSet<String>,
}

pub struct WebRtcSession {
    pc: Arc<RTCPeerConnection>,
    capture: AudioCapture,
    playback: Arc<std::sync::Mutex<Option<AudioPlayback>>>,
    negotiation: Mutex<Negotiation>,
    local_candidates: std::sync::Mutex<Option<mpsc::Receiver<CandidatePayload>>>,
    shutdown_tx: watch::Sender<bool>,
    closed: AtomicBool,
}

impl WebRtcSession {
    async fn open(config: &MediaConfig) -> Result<Self, MediaError> {
        // Microphone first: a denied device aborts setup before any
        // transport state exists.
        let mut capture = AudioCapture::open(&config.capture)?;
        let frames = capture.take_frames().ok_or(MediaError::Closed)?;

        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| MediaError::WebRtc(e.to_string()))?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|e| MediaError::WebRtc(e.to_string()))?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: config.stun_servers.clone(),
                ..Default::default()
            }],
            ..Default::default()
        };

        let pc = Arc::new(
            api.new_peer_connection(rtc_config)
                .await
                .map_err(|e| MediaError::WebRtc(e.to_string()))?,
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        // Local audio track, fed from the capture device.
        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: config.capture.sample_rate,
                channels: config.capture.channels,
                ..Default::default()
            },
            "audio".to_owned(),
            "beacon".to_owned(),
        ));
        pc.add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| MediaError::WebRtc(e.to_string()))?;
        spawn_sample_writer(
            track,
            frames,
            Duration::from_millis(config.capture.frame_size_ms as u64),
            shutdown_rx.clone(),
        );

        // Forward locally discovered candidates to whoever drives the
        // negotiation. Registered for the session's whole lifetime:
        // candidates keep trickling after the offer/answer.
        let (candidate_tx, candidate_rx) = mpsc::channel::<CandidatePayload>(32);
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let candidate_tx = candidate_tx.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                match candidate.to_json() {
                    Ok(init) => {
                        let payload = CandidatePayload {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        };
                        if candidate_tx.send(payload).await.is_err() {
                            debug!("Local candidate receiver gone");
                        }
                    }
                    Err(e) => warn!(error = %e, "Failed to serialize local candidate"),
                }
            })
        }));

        // Remote audio goes straight to the playback sink.
        let playback: Arc<std::sync::Mutex<Option<AudioPlayback>>> =
            Arc::new(std::sync::Mutex::new(None));
        let playback_slot = playback.clone();
        let playback_config = config.capture.clone();
        pc.on_track(Box::new(move |track: Arc<TrackRemote>, _receiver, _transceiver| {
            info!(kind = %track.kind(), "Remote track arrived");
            let playback_slot = playback_slot.clone();
            let playback_config = playback_config.clone();
            let shutdown_rx = shutdown_rx.clone();
            Box::pin(async move {
                let (frame_tx, frame_rx) = mpsc::channel::<Vec<f32>>(32);
                match AudioPlayback::open(&playback_config, frame_rx) {
                    Ok(sink) => {
                        let Ok(mut slot) = playback_slot.lock() else {
                            warn!("Playback slot lock poisoned");
                            return;
                        };
                        if let Some(previous) = slot.replace(sink) {
                            previous.stop();
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "Could not open playback sink");
                        return;
                    }
                }
                spawn_remote_reader(track, frame_tx, shutdown_rx);
            })
        }));

        Ok(Self {
            pc,
            capture,
            playback,
            negotiation: Mutex::new(Negotiation::default()),
            local_candidates: std::sync::Mutex::new(Some(candidate_rx)),
            shutdown_tx,
            closed: AtomicBool::new(false),
        })
    }

    async fn apply_candidate(&self, candidate: &CandidatePayload) -> Result<(), MediaError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate.clone(),
            sdp_mid: candidate.sdp_mid.clone(),
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment.clone(),
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| MediaError::WebRtc(e.to_string()))
    }
}

#[async_trait]
impl MediaSession for WebRtcSession {
    fn take_local_candidates(&self) -> Option<mpsc::Receiver<CandidatePayload>> {
        self.local_candidates.lock().ok()?.take()
    }

    async fn create_offer(&self) -> Result<SessionDescription, MediaError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| MediaError::WebRtc(e.to_string()))?;
        let sdp = offer.sdp.clone();
        self.pc
            .set_local_description(offer)
            .await
            .map_err(|e| MediaError::WebRtc(e.to_string()))?;
        debug!("Created offer and set local description");
        Ok(SessionDescription::offer(sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, MediaError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| MediaError::WebRtc(e.to_string()))?;
        let sdp = answer.sdp.clone();
        self.pc
            .set_local_description(answer)
            .await
            .map_err(|e| MediaError::WebRtc(e.to_string()))?;
        debug!("Created answer and set local description");
        Ok(SessionDescription::answer(sdp))
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), MediaError> {
        let remote = match description.kind {
            SdpKind::Offer => RTCSessionDescription::offer(description.sdp),
            SdpKind::Answer => RTCSessionDescription::answer(description.sdp),
        }
        .map_err(|e| MediaError::WebRtc(e.to_string()))?;

        self.pc
            .set_remote_description(remote)
            .await
            .map_err(|e| MediaError::WebRtc(e.to_string()))?;

        // Drain candidates that arrived ahead of the description.
        let mut negotiation = self.negotiation.lock().await;
        negotiation.have_remote = true;
        let queued = std::mem::take(&mut negotiation.queued);
        for candidate in queued {
            if negotiation.applied.insert(candidate.candidate.clone()) {
                debug!("Applying queued candidate");
                self.apply_candidate(&candidate).await?;
            }
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: CandidatePayload) -> Result<(), MediaError> {
        let mut negotiation = self.negotiation.lock().await;
        if !negotiation.have_remote {
            debug!("Queueing candidate until remote description is set");
            negotiation.queued.push(candidate);
            return Ok(());
        }
        if !negotiation.applied.insert(candidate.candidate.clone()) {
            debug!("Ignoring duplicate candidate");
            return Ok(());
        }
        self.apply_candidate(&candidate).await
    }

    fn set_muted(&self, muted: bool) {
        self.capture.set_muted(muted);
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown_tx.send(true);
        self.capture.stop();
        if let Ok(mut slot) = self.playback.lock() {
            if let Some(sink) = slot.take() {
                sink.stop();
            }
        }
        if let Err(e) = self.pc.close().await {
            warn!(error = %e, "Error closing peer connection");
        }
        debug!("Media session closed");
    }
}

/// Pump captured frames into the local track as raw PCM samples. Codec
/// negotiation and quality adaptation are out of scope.
fn spawn_sample_writer(
    track: Arc<TrackLocalStaticSample>,
    mut frames: mpsc::Receiver<Vec<f32>>,
    frame_duration: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                frame = frames.recv() => {
                    let Some(frame) = frame else { break };
                    let mut data = Vec::with_capacity(frame.len() * 2);
                    for sample in frame {
                        let s = (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
                        data.extend_from_slice(&s.to_le_bytes());
                    }
                    let sample = Sample {
                        data: Bytes::from(data),
                        duration: frame_duration,
                        ..Default::default()
                    };
                    if let Err(e) = track.write_sample(&sample).await {
                        debug!(error = %e, "Stopping sample writer");
                        break;
                    }
                }
            }
        }
    });
}

/// Read remote RTP payloads and hand them to the playback sink.
fn spawn_remote_reader(
    track: Arc<TrackRemote>,
    frame_tx: mpsc::Sender<Vec<f32>>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                result = track.read_rtp() => {
                    let Ok((packet, _attrs)) = result else { break };
                    let frame: Vec<f32> = packet
                        .payload
                        .chunks_exact(2)
                        .map(|b| i16::from_le_bytes([b[0], b[1]]) as f32 / i16::MAX as f32)
                        .collect();
                    if frame_tx.send(frame).await.is_err() {
                        break;
                    }
                }
            }
        }
        debug!("Remote reader finished");
    });
}
