//! One media/negotiation session: local media, offer/answer exchange,
//! connectivity fragments (through the candidate buffer), the in-call chat
//! data channel, and the connection watchdog. Events flow out through a typed
//! [`PeerEvent`] channel; the call engine forwards what needs to travel over
//! the signaling relay.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Duration, sleep};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;

use crate::config::{BundlePolicy, CallConfig, IceSettings, WatchdogPolicy};
use crate::media::{LocalMedia, MediaConstraints, MediaDevices, MediaError};
use crate::protocol::{CandidatePayload, SdpPayload};

pub mod candidates;

use candidates::{CandidateBuffer, CandidateSink};

const CHAT_CHANNEL_LABEL: &str = "chat";

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("peer session setup failed: {0}")]
    Setup(String),
    #[error("negotiation failed: {0}")]
    Negotiation(String),
    #[error("candidate rejected: {0}")]
    Candidate(String),
    #[error("peer session already torn down")]
    TornDown,
}

/// Typed session events, consumed by the call engine.
pub enum PeerEvent {
    /// A locally discovered connectivity fragment to forward over signaling.
    LocalCandidate(CandidatePayload),
    ConnectionState(RTCPeerConnectionState),
    RemoteTrack(Arc<TrackRemote>),
    ChatChannelOpen,
    ChatMessage(String),
    /// First watchdog window elapsed without connectivity; informational.
    ConnectivityDegraded,
    /// The watchdog regenerated an offer with an ICE restart; forward it.
    RestartOffer(SdpPayload),
    /// Restart did not converge either; the call must end.
    ConnectivityFailed,
}

pub struct PeerSession {
    pc: Arc<RTCPeerConnection>,
    candidates: Arc<CandidateBuffer>,
    devices: Arc<dyn MediaDevices>,
    events: mpsc::UnboundedSender<PeerEvent>,
    watchdog_policy: WatchdogPolicy,
    local_media: AsyncMutex<Option<Arc<LocalMedia>>>,
    video_sender: AsyncMutex<Option<Arc<RTCRtpSender>>>,
    camera_track: AsyncMutex<Option<Arc<TrackLocalStaticSample>>>,
    chat: AsyncMutex<Option<Arc<RTCDataChannel>>>,
    watchdog_timers: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    aux_tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    tracks_attached: AtomicBool,
    restarted: AtomicBool,
    torn_down: AtomicBool,
}

impl PeerSession {
    pub async fn new(
        config: &CallConfig,
        devices: Arc<dyn MediaDevices>,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<Self>, SessionError> {
        let api = build_api()?;
        let pc = Arc::new(
            api.new_peer_connection(rtc_configuration(&config.ice))
                .await
                .map_err(to_setup)?,
        );
        let sink = Arc::new(PcSink {
            pc: Arc::clone(&pc),
        });
        let candidates = Arc::new(CandidateBuffer::new(
            sink,
            config.candidate_retry_attempts,
            config.candidate_retry_delay,
        ));
        let session = Arc::new(Self {
            pc,
            candidates,
            devices,
            events,
            watchdog_policy: config.watchdog,
            local_media: AsyncMutex::new(None),
            video_sender: AsyncMutex::new(None),
            camera_track: AsyncMutex::new(None),
            chat: AsyncMutex::new(None),
            watchdog_timers: parking_lot::Mutex::new(Vec::new()),
            aux_tasks: parking_lot::Mutex::new(Vec::new()),
            tracks_attached: AtomicBool::new(false),
            restarted: AtomicBool::new(false),
            torn_down: AtomicBool::new(false),
        });
        session.wire_callbacks();
        Ok(session)
    }

    fn wire_callbacks(self: &Arc<Self>) {
        let events = self.events.clone();
        self.pc.on_ice_candidate(Box::new(move |candidate| {
            let events = events.clone();
            Box::pin(async move {
                if let Some(candidate) = candidate {
                    match candidate.to_json() {
                        Ok(json) => {
                            let payload = CandidatePayload {
                                candidate: json.candidate,
                                sdp_mid: json.sdp_mid,
                                sdp_mline_index: json.sdp_mline_index,
                            };
                            let _ = events.send(PeerEvent::LocalCandidate(payload));
                        }
                        Err(err) => {
                            tracing::warn!(target = "webrtc", error = %err, "local candidate serialization failed");
                        }
                    }
                }
            })
        }));

        let events = self.events.clone();
        self.pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let events = events.clone();
            Box::pin(async move {
                tracing::debug!(target = "webrtc", kind = %track.kind(), "remote track arrived");
                let _ = events.send(PeerEvent::RemoteTrack(track));
            })
        }));

        let weak = Arc::downgrade(self);
        self.pc.on_peer_connection_state_change(Box::new(move |state| {
            let weak = weak.clone();
            Box::pin(async move {
                tracing::debug!(target = "webrtc", ?state, "peer connection state changed");
                if let Some(session) = weak.upgrade() {
                    if state == RTCPeerConnectionState::Connected {
                        session.cancel_watchdog();
                    }
                    let _ = session.events.send(PeerEvent::ConnectionState(state));
                }
            })
        }));

        // The responder receives the chat channel the initiator opened.
        let weak = Arc::downgrade(self);
        self.pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let weak = weak.clone();
            Box::pin(async move {
                let Some(session) = weak.upgrade() else { return };
                if dc.label() != CHAT_CHANNEL_LABEL {
                    tracing::debug!(target = "webrtc", label = dc.label(), "ignoring unknown data channel");
                    return;
                }
                session.wire_chat_channel(&dc);
                *session.chat.lock().await = Some(dc);
            })
        }));
    }

    fn wire_chat_channel(&self, dc: &Arc<RTCDataChannel>) {
        let events = self.events.clone();
        dc.on_open(Box::new(move || {
            let events = events.clone();
            Box::pin(async move {
                tracing::debug!(target = "webrtc", "chat channel open");
                let _ = events.send(PeerEvent::ChatChannelOpen);
            })
        }));
        let events = self.events.clone();
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let events = events.clone();
            Box::pin(async move {
                match String::from_utf8(msg.data.to_vec()) {
                    Ok(text) => {
                        let _ = events.send(PeerEvent::ChatMessage(text));
                    }
                    Err(_) => {
                        tracing::warn!(target = "webrtc", "dropping non-utf8 chat frame");
                    }
                }
            })
        }));
        dc.on_close(Box::new(|| {
            Box::pin(async {
                tracing::debug!(target = "webrtc", "chat channel closed");
            })
        }));
    }

    /// Request camera/microphone. Busy or missing devices degrade to
    /// audio-only; permission denial is terminal. Repeated calls return the
    /// cached stream while it is live.
    pub async fn acquire_local_media(
        &self,
        constraints: MediaConstraints,
    ) -> Result<Arc<LocalMedia>, MediaError> {
        let mut guard = self.local_media.lock().await;
        if let Some(media) = guard.as_ref() {
            if media.is_live() {
                return Ok(Arc::clone(media));
            }
        }
        let media = match self.devices.open_capture(constraints).await {
            Ok(media) => media,
            Err(MediaError::NotFound | MediaError::Busy) if constraints.video => {
                tracing::warn!(target = "webrtc", "camera unavailable, retrying audio-only");
                self.devices.open_capture(MediaConstraints::audio_only()).await?
            }
            Err(err) => return Err(err),
        };
        let media = Arc::new(media);
        *guard = Some(Arc::clone(&media));
        Ok(media)
    }

    async fn attach_local_tracks(&self) -> Result<(), SessionError> {
        if self.tracks_attached.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let media = self.local_media.lock().await.clone();
        let Some(media) = media else {
            return Ok(());
        };
        if let Some(audio) = &media.audio {
            self.pc
                .add_track(Arc::clone(audio) as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map_err(to_setup)?;
        }
        if let Some(video) = &media.video {
            let sender = self
                .pc
                .add_track(Arc::clone(video) as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map_err(to_setup)?;
            *self.video_sender.lock().await = Some(sender);
            *self.camera_track.lock().await = Some(Arc::clone(video));
        }
        Ok(())
    }

    /// Initiator side: attach tracks, open the chat channel, produce the
    /// negotiation document and set it locally.
    pub async fn create_offer(&self) -> Result<SdpPayload, SessionError> {
        self.ensure_live()?;
        self.attach_local_tracks().await?;
        let dc = self
            .pc
            .create_data_channel(
                CHAT_CHANNEL_LABEL,
                Some(RTCDataChannelInit {
                    ordered: Some(true),
                    ..Default::default()
                }),
            )
            .await
            .map_err(to_setup)?;
        self.wire_chat_channel(&dc);
        *self.chat.lock().await = Some(dc);
        self.offer_internal(None).await
    }

    async fn offer_internal(&self, options: Option<RTCOfferOptions>) -> Result<SdpPayload, SessionError> {
        let offer = self.pc.create_offer(options).await.map_err(to_negotiation)?;
        self.pc.set_local_description(offer).await.map_err(to_negotiation)?;
        self.local_payload().await
    }

    /// Responder side; the inbound chat channel arrives via `on_data_channel`.
    pub async fn create_answer(&self) -> Result<SdpPayload, SessionError> {
        self.ensure_live()?;
        self.attach_local_tracks().await?;
        let answer = self.pc.create_answer(None).await.map_err(to_negotiation)?;
        self.pc.set_local_description(answer).await.map_err(to_negotiation)?;
        self.local_payload().await
    }

    /// Apply the remote negotiation document and replay buffered candidates.
    pub async fn apply_remote_description(&self, payload: &SdpPayload) -> Result<(), SessionError> {
        self.ensure_live()?;
        let description = session_description_from_payload(payload)?;
        self.pc
            .set_remote_description(description)
            .await
            .map_err(to_negotiation)?;
        self.candidates.remote_description_applied().await;
        Ok(())
    }

    pub async fn add_remote_candidate(&self, payload: CandidatePayload) {
        if self.is_torn_down() {
            return;
        }
        self.candidates
            .push(RTCIceCandidateInit {
                candidate: payload.candidate,
                sdp_mid: payload.sdp_mid,
                sdp_mline_index: payload.sdp_mline_index,
                username_fragment: None,
            })
            .await;
    }

    /// Two-stage watchdog: warn after the first window, try one ICE restart
    /// after the second, give up if that does not converge either. Reaching
    /// `Connected` cancels everything.
    pub fn start_watchdog(self: &Arc<Self>) {
        self.cancel_watchdog();
        let policy = self.watchdog_policy;

        let degraded = tokio::spawn({
            let session = Arc::clone(self);
            async move {
                sleep(policy.degraded_after).await;
                if session.is_connected() || session.is_torn_down() {
                    return;
                }
                tracing::warn!(target = "webrtc", "peer connectivity degraded");
                let _ = session.events.send(PeerEvent::ConnectivityDegraded);
            }
        });

        let restart = tokio::spawn({
            let session = Arc::clone(self);
            async move {
                sleep(policy.restart_after).await;
                if session.is_connected() || session.is_torn_down() {
                    return;
                }
                if session.restarted.swap(true, Ordering::SeqCst) {
                    let _ = session.events.send(PeerEvent::ConnectivityFailed);
                    return;
                }
                match session
                    .offer_internal(Some(RTCOfferOptions {
                        ice_restart: true,
                        ..Default::default()
                    }))
                    .await
                {
                    Ok(payload) => {
                        tracing::warn!(target = "webrtc", "watchdog triggered ice restart");
                        let _ = session.events.send(PeerEvent::RestartOffer(payload));
                        let failure = tokio::spawn({
                            let session = Arc::clone(&session);
                            async move {
                                sleep(policy.restart_after).await;
                                if !session.is_connected() && !session.is_torn_down() {
                                    let _ = session.events.send(PeerEvent::ConnectivityFailed);
                                }
                            }
                        });
                        session.watchdog_timers.lock().push(failure);
                    }
                    Err(err) => {
                        tracing::warn!(target = "webrtc", error = %err, "ice restart failed");
                        let _ = session.events.send(PeerEvent::ConnectivityFailed);
                    }
                }
            }
        });

        let mut timers = self.watchdog_timers.lock();
        timers.push(degraded);
        timers.push(restart);
    }

    fn cancel_watchdog(&self) {
        for timer in self.watchdog_timers.lock().drain(..) {
            timer.abort();
        }
    }

    /// Replace the outgoing video track with a display source; no
    /// renegotiation. Reverts automatically when the shared source ends.
    pub async fn switch_to_screen_share(self: &Arc<Self>) -> Result<(), SessionError> {
        self.ensure_live()?;
        let sender = self
            .video_sender
            .lock()
            .await
            .clone()
            .ok_or_else(|| SessionError::Setup("no outgoing video track".into()))?;
        let display = self
            .devices
            .open_display()
            .await
            .map_err(|err| SessionError::Setup(err.to_string()))?;
        sender
            .replace_track(Some(
                Arc::clone(&display.video) as Arc<dyn TrackLocal + Send + Sync>
            ))
            .await
            .map_err(to_setup)?;

        let mut ended = display.ended();
        let session = Arc::clone(self);
        let watcher = tokio::spawn(async move {
            while ended.changed().await.is_ok() {
                if *ended.borrow() {
                    if let Err(err) = session.revert_to_camera().await {
                        tracing::warn!(target = "webrtc", error = %err, "auto-revert to camera failed");
                    }
                    break;
                }
            }
        });
        self.aux_tasks.lock().push(watcher);
        Ok(())
    }

    pub async fn revert_to_camera(&self) -> Result<(), SessionError> {
        self.ensure_live()?;
        let sender = self
            .video_sender
            .lock()
            .await
            .clone()
            .ok_or_else(|| SessionError::Setup("no outgoing video track".into()))?;
        let camera = self.camera_track.lock().await.clone();
        sender
            .replace_track(camera.map(|track| track as Arc<dyn TrackLocal + Send + Sync>))
            .await
            .map_err(to_setup)
    }

    pub async fn send_chat(&self, text: &str) -> Result<(), SessionError> {
        self.ensure_live()?;
        let dc = self
            .chat
            .lock()
            .await
            .clone()
            .ok_or_else(|| SessionError::Setup("chat channel not open".into()))?;
        if dc.ready_state() != RTCDataChannelState::Open {
            return Err(SessionError::Setup("chat channel not open".into()));
        }
        dc.send_text(text.to_string()).await.map_err(to_setup)?;
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.pc.connection_state() == RTCPeerConnectionState::Connected
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::SeqCst)
    }

    fn ensure_live(&self) -> Result<(), SessionError> {
        if self.is_torn_down() {
            Err(SessionError::TornDown)
        } else {
            Ok(())
        }
    }

    /// Idempotent: stops local media, cancels every timer, closes the chat
    /// channel and the peer connection, clears the candidate buffer.
    pub async fn teardown(&self) {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel_watchdog();
        for task in self.aux_tasks.lock().drain(..) {
            task.abort();
        }
        if let Some(media) = self.local_media.lock().await.take() {
            media.stop();
        }
        if let Some(dc) = self.chat.lock().await.take() {
            if let Err(err) = dc.close().await {
                tracing::debug!(target = "webrtc", error = %err, "chat channel close");
            }
        }
        self.candidates.clear().await;
        if let Err(err) = self.pc.close().await {
            tracing::debug!(target = "webrtc", error = %err, "peer connection close");
        }
        tracing::debug!(target = "webrtc", "peer session torn down");
    }
}

struct PcSink {
    pc: Arc<RTCPeerConnection>,
}

#[async_trait::async_trait]
impl CandidateSink for PcSink {
    async fn apply(&self, candidate: RTCIceCandidateInit) -> Result<(), SessionError> {
        self.pc
            .add_ice_candidate(candidate)
            .await
            .map_err(|err| SessionError::Candidate(err.to_string()))
    }
}

fn build_api() -> Result<API, SessionError> {
    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs().map_err(to_setup)?;

    let mut registry = webrtc::interceptor::registry::Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine).map_err(to_setup)?;

    let mut setting = SettingEngine::default();
    setting.set_ice_timeouts(
        Some(Duration::from_secs(3)),
        Some(Duration::from_secs(10)),
        Some(Duration::from_millis(500)),
    );

    Ok(APIBuilder::new()
        .with_setting_engine(setting)
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

fn rtc_configuration(ice: &IceSettings) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: ice
            .servers
            .iter()
            .map(|server| RTCIceServer {
                urls: server.urls.clone(),
                username: server.username.clone(),
                credential: server.credential.clone(),
                ..Default::default()
            })
            .collect(),
        bundle_policy: match ice.bundle_policy {
            BundlePolicy::Balanced => RTCBundlePolicy::Balanced,
            BundlePolicy::MaxCompat => RTCBundlePolicy::MaxCompat,
            BundlePolicy::MaxBundle => RTCBundlePolicy::MaxBundle,
        },
        ice_candidate_pool_size: ice.candidate_pool_size,
        ..Default::default()
    }
}

fn session_description_from_payload(payload: &SdpPayload) -> Result<RTCSessionDescription, SessionError> {
    match RTCSdpType::from(payload.typ.as_str()) {
        RTCSdpType::Offer => RTCSessionDescription::offer(payload.sdp.clone()).map_err(to_negotiation),
        RTCSdpType::Answer => RTCSessionDescription::answer(payload.sdp.clone()).map_err(to_negotiation),
        RTCSdpType::Pranswer => {
            RTCSessionDescription::pranswer(payload.sdp.clone()).map_err(to_negotiation)
        }
        RTCSdpType::Rollback | RTCSdpType::Unspecified => Err(SessionError::Negotiation(format!(
            "unsupported sdp type {}",
            payload.typ
        ))),
    }
}

impl PeerSession {
    async fn local_payload(&self) -> Result<SdpPayload, SessionError> {
        let description = self
            .pc
            .local_description()
            .await
            .ok_or_else(|| SessionError::Setup("missing local description".into()))?;
        Ok(SdpPayload {
            sdp: description.sdp,
            typ: description.sdp_type.to_string(),
        })
    }
}

fn to_setup<E: std::fmt::Display>(err: E) -> SessionError {
    SessionError::Setup(err.to_string())
}

fn to_negotiation<E: std::fmt::Display>(err: E) -> SessionError {
    SessionError::Negotiation(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{NoMediaDevices, opus_audio_track};
    use async_trait::async_trait;
    use std::collections::VecDeque;

    struct ScriptedDevices {
        responses: parking_lot::Mutex<VecDeque<Result<LocalMedia, MediaError>>>,
        calls: parking_lot::Mutex<Vec<MediaConstraints>>,
    }

    impl ScriptedDevices {
        fn new(responses: Vec<Result<LocalMedia, MediaError>>) -> Arc<Self> {
            Arc::new(Self {
                responses: parking_lot::Mutex::new(responses.into()),
                calls: parking_lot::Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl MediaDevices for ScriptedDevices {
        async fn open_capture(&self, constraints: MediaConstraints) -> Result<LocalMedia, MediaError> {
            self.calls.lock().push(constraints);
            self.responses
                .lock()
                .pop_front()
                .unwrap_or(Err(MediaError::NotFound))
        }

        async fn open_display(&self) -> Result<crate::media::DisplayMedia, MediaError> {
            Err(MediaError::NotFound)
        }
    }

    async fn session_with(devices: Arc<dyn MediaDevices>) -> Arc<PeerSession> {
        let (events, _rx) = mpsc::unbounded_channel();
        PeerSession::new(&CallConfig::default(), devices, events)
            .await
            .expect("session")
    }

    #[tokio::test]
    async fn missing_camera_falls_back_to_audio_only() {
        let devices = ScriptedDevices::new(vec![
            Err(MediaError::NotFound),
            Ok(LocalMedia::new(Some(opus_audio_track("audio")), None)),
        ]);
        let session = session_with(devices.clone()).await;
        let media = session
            .acquire_local_media(MediaConstraints::audio_video())
            .await
            .expect("fallback succeeds");
        assert!(media.audio.is_some());
        assert!(media.video.is_none());
        assert_eq!(
            *devices.calls.lock(),
            vec![MediaConstraints::audio_video(), MediaConstraints::audio_only()]
        );
    }

    #[tokio::test]
    async fn permission_denied_is_terminal() {
        let devices = ScriptedDevices::new(vec![Err(MediaError::PermissionDenied)]);
        let session = session_with(devices.clone()).await;
        let err = session
            .acquire_local_media(MediaConstraints::audio_video())
            .await
            .unwrap_err();
        assert!(matches!(err, MediaError::PermissionDenied));
        assert_eq!(devices.calls.lock().len(), 1);
    }

    #[tokio::test]
    async fn repeated_acquisition_reuses_the_live_stream() {
        let devices = ScriptedDevices::new(vec![Ok(LocalMedia::new(
            Some(opus_audio_track("audio")),
            None,
        ))]);
        let session = session_with(devices.clone()).await;
        let first = session
            .acquire_local_media(MediaConstraints::audio_video())
            .await
            .unwrap();
        let second = session
            .acquire_local_media(MediaConstraints::audio_video())
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(devices.calls.lock().len(), 1);
    }

    #[tokio::test]
    async fn offer_sets_local_description_and_opens_chat() {
        let session = session_with(Arc::new(NoMediaDevices)).await;
        let payload = session.create_offer().await.expect("offer");
        assert_eq!(payload.typ, "offer");
        assert!(session.chat.lock().await.is_some());
        session.teardown().await;
    }

    async fn expect_peer_event<F>(
        rx: &mut mpsc::UnboundedReceiver<PeerEvent>,
        mut want: F,
    ) -> PeerEvent
    where
        F: FnMut(&PeerEvent) -> bool,
    {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let event = rx.recv().await.expect("event stream alive");
                if want(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("expected event in time")
    }

    #[tokio::test]
    async fn watchdog_escalates_to_restart_then_failure() {
        let (events, mut rx) = mpsc::unbounded_channel();
        let config = CallConfig {
            watchdog: WatchdogPolicy {
                degraded_after: Duration::from_millis(20),
                restart_after: Duration::from_millis(60),
            },
            ..CallConfig::default()
        };
        let session = PeerSession::new(&config, Arc::new(NoMediaDevices), events)
            .await
            .expect("session");
        session.create_offer().await.expect("offer");
        session.start_watchdog();

        // Never connects: degraded warning, then one restart offer, then
        // terminal failure when the restart does not converge either.
        expect_peer_event(&mut rx, |e| matches!(e, PeerEvent::ConnectivityDegraded)).await;
        let restart =
            expect_peer_event(&mut rx, |e| matches!(e, PeerEvent::RestartOffer(_))).await;
        let PeerEvent::RestartOffer(payload) = restart else {
            unreachable!()
        };
        assert_eq!(payload.typ, "offer");
        expect_peer_event(&mut rx, |e| matches!(e, PeerEvent::ConnectivityFailed)).await;

        // The restart budget is one: a later escalation skips the restart
        // and goes straight to failure.
        session.start_watchdog();
        let next = expect_peer_event(&mut rx, |e| {
            matches!(e, PeerEvent::RestartOffer(_) | PeerEvent::ConnectivityFailed)
        })
        .await;
        assert!(matches!(next, PeerEvent::ConnectivityFailed));
        session.teardown().await;
    }

    #[tokio::test]
    async fn teardown_is_idempotent() {
        let session = session_with(Arc::new(NoMediaDevices)).await;
        session.teardown().await;
        session.teardown().await;
        let err = session.create_offer().await.unwrap_err();
        assert!(matches!(err, SessionError::TornDown));
    }
}
