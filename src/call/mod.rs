//! Call lifecycle engine. All transitions run on one driver task fed by a
//! single input queue, so signaling frames, peer session events, timers and
//! user commands are applied strictly in arrival order. The rest of the
//! application observes the engine through a state watch and a typed event
//! stream.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::track::track_remote::TrackRemote;

use crate::config::CallConfig;
use crate::media::{MediaConstraints, MediaDevices, MediaError};
use crate::peer::{PeerEvent, PeerSession, SessionError};
use crate::protocol::{
    CallerInfo, CandidatePayload, MessageKind, ParticipantId, SdpPayload, SignalingMessage,
};
use crate::signaling::socket::SignalingDialer;
use crate::signaling::{LinkState, SignalError, SignalingChannel};

pub mod guard;

use guard::EndCallGuard;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallPhase {
    Idle,
    /// We sent `call-request` and are waiting for accept/reject.
    Outgoing,
    /// A `call-request` arrived and is ringing locally.
    Incoming,
    Active,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallState {
    pub phase: CallPhase,
    pub peer: Option<ParticipantId>,
    pub peer_name: Option<String>,
    pub session_id: Option<String>,
}

impl CallState {
    fn idle() -> Self {
        Self {
            phase: CallPhase::Idle,
            peer: None,
            peer_name: None,
            session_id: None,
        }
    }
}

/// Events surfaced to the embedding application.
pub enum CallEvent {
    StateChanged(CallState),
    IncomingCall {
        from: ParticipantId,
        caller_name: String,
        session_id: String,
    },
    RemoteTrack(Arc<TrackRemote>),
    ChatReceived {
        from: ParticipantId,
        text: String,
    },
    LinkStateChanged(LinkState),
    /// The callee declined; `reason` carries their payload when present.
    CallRejected {
        reason: Option<String>,
    },
    CallEnded {
        session_id: String,
    },
    /// The call was torn down for a non-user reason (relay error, lost
    /// connectivity, permanent signaling failure).
    CallFailed(String),
}

#[derive(Debug, Error)]
pub enum CallError {
    #[error("a call is already in progress")]
    Busy,
    #[error("no call in progress")]
    NoCall,
    #[error(transparent)]
    Signal(#[from] SignalError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Media(#[from] MediaError),
    #[error("call engine stopped")]
    Stopped,
}

type Reply = oneshot::Sender<Result<(), CallError>>;

enum CallInput {
    Initiate {
        peer: ParticipantId,
        peer_name: String,
        reply: Reply,
    },
    Accept { reply: Reply },
    Reject { reply: Reply },
    End { reply: Reply },
    Chat { text: String, reply: Reply },
    ScreenShare { enable: bool, reply: Reply },
    Inbound(SignalingMessage),
    Peer(PeerEvent),
    Link(LinkState),
    RingTimeout { session_id: String },
}

pub struct CallEngine {
    input: mpsc::UnboundedSender<CallInput>,
    state: watch::Receiver<CallState>,
    channel: Arc<SignalingChannel>,
    tasks: Vec<JoinHandle<()>>,
}

impl CallEngine {
    /// Wires the engine onto `channel`: registers one handler per call-related
    /// message type and spawns the driver. Returns the engine plus the event
    /// stream. Call [`start`](Self::start) afterwards to bring the link up.
    pub fn new(
        participant: ParticipantId,
        display_name: impl Into<String>,
        channel: Arc<SignalingChannel>,
        devices: Arc<dyn MediaDevices>,
        config: CallConfig,
    ) -> (Self, mpsc::UnboundedReceiver<CallEvent>) {
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(CallState::idle());

        for kind in [
            MessageKind::CallRequest,
            MessageKind::CallAccept,
            MessageKind::CallReject,
            MessageKind::CallEnd,
            MessageKind::Offer,
            MessageKind::Answer,
            MessageKind::IceCandidate,
            MessageKind::ChatMessage,
            MessageKind::Error,
        ] {
            let tx = input_tx.clone();
            channel.on(kind, move |msg| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(CallInput::Inbound(msg));
                }
            });
        }

        let link_watcher = {
            let mut link = channel.link_state();
            let tx = input_tx.clone();
            tokio::spawn(async move {
                while link.changed().await.is_ok() {
                    let state = *link.borrow();
                    if tx.send(CallInput::Link(state)).is_err() {
                        break;
                    }
                }
            })
        };

        let driver = Driver {
            participant,
            display_name: display_name.into(),
            channel: Arc::clone(&channel),
            devices,
            guard: EndCallGuard::new(config.end_guard_window),
            config,
            state: state_tx,
            events: event_tx,
            input: input_tx.clone(),
            session: None,
            peer_pump: None,
            ring_timer: None,
            chat_open: false,
        };
        let driver_task = tokio::spawn(driver.run(input_rx));

        (
            Self {
                input: input_tx,
                state: state_rx,
                channel,
                tasks: vec![link_watcher, driver_task],
            },
            event_rx,
        )
    }

    /// Build the signaling channel from `config` (including its
    /// [`ReconnectPolicy`](crate::config::ReconnectPolicy)) and wire the
    /// engine onto it. Use [`new`](Self::new) to share an existing channel.
    pub fn with_dialer(
        participant: ParticipantId,
        display_name: impl Into<String>,
        dialer: Arc<dyn SignalingDialer>,
        devices: Arc<dyn MediaDevices>,
        config: CallConfig,
    ) -> (Self, mpsc::UnboundedReceiver<CallEvent>) {
        let channel = Arc::new(SignalingChannel::new(participant, dialer, config.reconnect));
        Self::new(participant, display_name, channel, devices, config)
    }

    /// Connect the signaling link (idempotent, shared single-flight).
    pub async fn start(&self) -> Result<(), CallError> {
        self.channel.start().await.map_err(CallError::from)
    }

    pub async fn initiate(
        &self,
        peer: ParticipantId,
        peer_name: impl Into<String>,
    ) -> Result<(), CallError> {
        let peer_name = peer_name.into();
        self.request(|reply| CallInput::Initiate {
            peer,
            peer_name,
            reply,
        })
        .await
    }

    pub async fn accept(&self) -> Result<(), CallError> {
        self.request(|reply| CallInput::Accept { reply }).await
    }

    pub async fn reject(&self) -> Result<(), CallError> {
        self.request(|reply| CallInput::Reject { reply }).await
    }

    /// Hang up. A no-op when idle, so racing hang-ups are safe.
    pub async fn end(&self) -> Result<(), CallError> {
        self.request(|reply| CallInput::End { reply }).await
    }

    pub async fn send_chat(&self, text: impl Into<String>) -> Result<(), CallError> {
        let text = text.into();
        self.request(|reply| CallInput::Chat { text, reply }).await
    }

    pub async fn set_screen_share(&self, enable: bool) -> Result<(), CallError> {
        self.request(|reply| CallInput::ScreenShare { enable, reply })
            .await
    }

    pub fn call_state(&self) -> watch::Receiver<CallState> {
        self.state.clone()
    }

    pub fn current_state(&self) -> CallState {
        self.state.borrow().clone()
    }

    /// End any in-flight call (notifying the peer and stopping local media),
    /// then tear down the driver and close the signaling link.
    pub async fn shutdown(&self) {
        let _ = self.end().await;
        for task in &self.tasks {
            task.abort();
        }
        self.channel.stop(true);
    }

    async fn request(
        &self,
        make: impl FnOnce(Reply) -> CallInput,
    ) -> Result<(), CallError> {
        let (tx, rx) = oneshot::channel();
        self.input.send(make(tx)).map_err(|_| CallError::Stopped)?;
        rx.await.map_err(|_| CallError::Stopped)?
    }
}

impl Drop for CallEngine {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

struct Driver {
    participant: ParticipantId,
    display_name: String,
    channel: Arc<SignalingChannel>,
    devices: Arc<dyn MediaDevices>,
    guard: EndCallGuard,
    config: CallConfig,
    state: watch::Sender<CallState>,
    events: mpsc::UnboundedSender<CallEvent>,
    input: mpsc::UnboundedSender<CallInput>,
    session: Option<Arc<PeerSession>>,
    peer_pump: Option<JoinHandle<()>>,
    ring_timer: Option<JoinHandle<()>>,
    chat_open: bool,
}

impl Driver {
    // The driver keeps its own sender for timers and session pumps, so the
    // queue never closes on its own; shutdown aborts the task instead.
    async fn run(mut self, mut input: mpsc::UnboundedReceiver<CallInput>) {
        while let Some(item) = input.recv().await {
            match item {
                CallInput::Initiate {
                    peer,
                    peer_name,
                    reply,
                } => {
                    let _ = reply.send(self.initiate(peer, peer_name));
                }
                CallInput::Accept { reply } => {
                    let _ = reply.send(self.accept().await);
                }
                CallInput::Reject { reply } => {
                    let _ = reply.send(self.reject().await);
                }
                CallInput::End { reply } => {
                    let _ = reply.send(self.end_by_user().await);
                }
                CallInput::Chat { text, reply } => {
                    let _ = reply.send(self.send_chat(&text).await);
                }
                CallInput::ScreenShare { enable, reply } => {
                    let _ = reply.send(self.set_screen_share(enable).await);
                }
                CallInput::Inbound(message) => self.handle_inbound(message).await,
                CallInput::Peer(event) => self.handle_peer_event(event).await,
                CallInput::Link(state) => self.handle_link(state).await,
                CallInput::RingTimeout { session_id } => self.handle_ring_timeout(&session_id).await,
            }
        }
    }

    fn snapshot(&self) -> CallState {
        self.state.borrow().clone()
    }

    fn set_state(&self, next: CallState) {
        self.state.send_replace(next.clone());
        let _ = self.events.send(CallEvent::StateChanged(next));
    }

    fn initiate(&mut self, peer: ParticipantId, peer_name: String) -> Result<(), CallError> {
        if self.snapshot().phase != CallPhase::Idle {
            return Err(CallError::Busy);
        }
        let session_id = uuid::Uuid::new_v4().to_string();
        let request = SignalingMessage::new(
            MessageKind::CallRequest,
            self.participant,
            peer,
            session_id.clone(),
        )
        .with_payload(&CallerInfo {
            caller_name: self.display_name.clone(),
        })
        .map_err(SignalError::from)?;
        self.channel.send(&request)?;
        tracing::info!(target = "call", peer, session_id, "call requested");
        self.set_state(CallState {
            phase: CallPhase::Outgoing,
            peer: Some(peer),
            peer_name: Some(peer_name),
            session_id: Some(session_id.clone()),
        });
        self.arm_ring_timer(session_id);
        Ok(())
    }

    async fn accept(&mut self) -> Result<(), CallError> {
        let current = self.snapshot();
        if current.phase != CallPhase::Incoming {
            return Err(CallError::NoCall);
        }
        let (peer, session_id) = match (current.peer, current.session_id.clone()) {
            (Some(peer), Some(session_id)) => (peer, session_id),
            _ => return Err(CallError::NoCall),
        };
        self.cancel_ring_timer();
        if let Err(err) = self.setup_session().await {
            // Let the caller know instead of leaving them ringing forever.
            let reject = SignalingMessage::new(
                MessageKind::CallReject,
                self.participant,
                peer,
                session_id,
            )
            .with_data(serde_json::Value::String("media-unavailable".into()));
            let _ = self.channel.send(&reject);
            self.clear_call().await;
            self.set_state(CallState::idle());
            return Err(err);
        }
        let accept = SignalingMessage::new(
            MessageKind::CallAccept,
            self.participant,
            peer,
            session_id.clone(),
        );
        if let Err(err) = self.channel.send(&accept) {
            // Without the relay the handshake cannot complete; leaving the
            // session behind would strand the engine in `incoming`.
            tracing::warn!(target = "call", peer, error = %err, "call-accept not delivered");
            self.clear_call().await;
            self.set_state(CallState::idle());
            return Err(err.into());
        }
        tracing::info!(target = "call", peer, session_id, "call accepted");
        self.set_state(CallState {
            phase: CallPhase::Active,
            ..current
        });
        if let Some(session) = &self.session {
            session.start_watchdog();
        }
        Ok(())
    }

    async fn reject(&mut self) -> Result<(), CallError> {
        let current = self.snapshot();
        if current.phase != CallPhase::Incoming {
            return Err(CallError::NoCall);
        }
        if let (Some(peer), Some(session_id)) = (current.peer, current.session_id) {
            let reject = SignalingMessage::new(
                MessageKind::CallReject,
                self.participant,
                peer,
                session_id,
            )
            .with_data(serde_json::Value::String("declined".into()));
            // A failed send is tolerated: the caller's own ring timer covers
            // them, and the local decline must still take effect.
            match self.channel.send(&reject) {
                Ok(()) => tracing::info!(target = "call", peer, "call rejected"),
                Err(err) => {
                    tracing::warn!(target = "call", peer, error = %err, "call-reject not delivered");
                }
            }
        }
        self.clear_call().await;
        self.set_state(CallState::idle());
        Ok(())
    }

    async fn end_by_user(&mut self) -> Result<(), CallError> {
        let current = self.snapshot();
        if current.phase == CallPhase::Idle {
            return Ok(());
        }
        self.end_call(&current, true).await;
        Ok(())
    }

    /// Shared teardown path. `notify_peer` routes the wire signal through the
    /// duplicate-suppression guard; the local cleanup always happens.
    async fn end_call(&mut self, current: &CallState, notify_peer: bool) {
        if let (Some(peer), Some(session_id)) = (current.peer, current.session_id.as_deref()) {
            if notify_peer && self.guard.try_send(peer, session_id) {
                let end = SignalingMessage::new(
                    MessageKind::CallEnd,
                    self.participant,
                    peer,
                    session_id,
                );
                if let Err(err) = self.channel.send(&end) {
                    tracing::warn!(target = "call", peer, error = %err, "call-end not delivered");
                }
            }
            let _ = self.events.send(CallEvent::CallEnded {
                session_id: session_id.to_string(),
            });
            tracing::info!(target = "call", peer, session_id, "call ended");
        }
        self.clear_call().await;
        self.set_state(CallState::idle());
    }

    async fn fail_call(&mut self, reason: &str, notify_peer: bool) {
        let current = self.snapshot();
        if current.phase == CallPhase::Idle {
            return;
        }
        tracing::warn!(target = "call", reason, "call failed");
        let _ = self.events.send(CallEvent::CallFailed(reason.to_string()));
        self.end_call(&current, notify_peer).await;
    }

    async fn clear_call(&mut self) {
        self.cancel_ring_timer();
        if let Some(pump) = self.peer_pump.take() {
            pump.abort();
        }
        if let Some(session) = self.session.take() {
            session.teardown().await;
        }
        self.chat_open = false;
    }

    async fn setup_session(&mut self) -> Result<(), CallError> {
        // One session per client: anything left from an earlier attempt is
        // torn down before it can leak.
        if let Some(pump) = self.peer_pump.take() {
            pump.abort();
        }
        if let Some(old) = self.session.take() {
            old.teardown().await;
        }
        let (peer_tx, mut peer_rx) = mpsc::unbounded_channel();
        let session = PeerSession::new(&self.config, Arc::clone(&self.devices), peer_tx).await?;
        match session
            .acquire_local_media(MediaConstraints::audio_video())
            .await
        {
            Ok(_) => {}
            Err(err) => {
                session.teardown().await;
                return Err(err.into());
            }
        }
        let input = self.input.clone();
        self.peer_pump = Some(tokio::spawn(async move {
            while let Some(event) = peer_rx.recv().await {
                if input.send(CallInput::Peer(event)).is_err() {
                    break;
                }
            }
        }));
        self.session = Some(session);
        Ok(())
    }

    async fn handle_inbound(&mut self, message: SignalingMessage) {
        match message.kind {
            MessageKind::CallRequest => self.on_call_request(message).await,
            MessageKind::CallAccept => self.on_call_accept(message).await,
            MessageKind::CallReject => self.on_call_reject(message).await,
            MessageKind::CallEnd => self.on_call_end(message).await,
            MessageKind::Offer => self.on_offer(message).await,
            MessageKind::Answer => self.on_answer(message).await,
            MessageKind::IceCandidate => self.on_candidate(message).await,
            MessageKind::ChatMessage => {
                let current = self.snapshot();
                if current.phase != CallPhase::Active || !self.matches_session(&current, &message) {
                    tracing::debug!(target = "call", from = message.from, "dropping stale chat frame");
                    return;
                }
                let _ = self.events.send(CallEvent::ChatReceived {
                    from: message.from,
                    text: message.text().unwrap_or_default().to_string(),
                });
            }
            MessageKind::Error => {
                let reason = message.text().unwrap_or("relay error").to_string();
                // The peer is unreachable, so there is nobody to notify.
                self.fail_call(&reason, false).await;
            }
            MessageKind::ConnectionConfirmed | MessageKind::ConnectionTest => {}
        }
    }

    async fn on_call_request(&mut self, message: SignalingMessage) {
        let caller_name = message
            .decode::<CallerInfo>()
            .map(|info| info.caller_name)
            .unwrap_or_default();
        if self.snapshot().phase != CallPhase::Idle {
            tracing::info!(target = "call", from = message.from, "busy, auto-rejecting");
            let reject = SignalingMessage::new(
                MessageKind::CallReject,
                self.participant,
                message.from,
                message.session_id,
            )
            .with_data(serde_json::Value::String("busy".into()));
            if let Err(err) = self.channel.send(&reject) {
                tracing::warn!(target = "call", error = %err, "busy reject not delivered");
            }
            return;
        }
        tracing::info!(
            target = "call",
            from = message.from,
            session_id = message.session_id,
            "incoming call"
        );
        self.set_state(CallState {
            phase: CallPhase::Incoming,
            peer: Some(message.from),
            peer_name: Some(caller_name.clone()),
            session_id: Some(message.session_id.clone()),
        });
        let _ = self.events.send(CallEvent::IncomingCall {
            from: message.from,
            caller_name,
            session_id: message.session_id.clone(),
        });
        self.arm_ring_timer(message.session_id);
    }

    async fn on_call_accept(&mut self, message: SignalingMessage) {
        let current = self.snapshot();
        if current.phase != CallPhase::Outgoing || !self.matches_session(&current, &message) {
            tracing::debug!(target = "call", from = message.from, "dropping stale call-accept");
            return;
        }
        self.cancel_ring_timer();
        if let Err(err) = self.setup_session().await {
            tracing::warn!(target = "call", error = %err, "session setup failed after accept");
            self.fail_call("local session setup failed", true).await;
            return;
        }
        let offer = match self.session.as_ref() {
            Some(session) => match session.create_offer().await {
                Ok(payload) => payload,
                Err(err) => {
                    tracing::warn!(target = "call", error = %err, "offer creation failed");
                    self.fail_call("negotiation failed", true).await;
                    return;
                }
            },
            None => return,
        };
        if let Err(err) = self.send_payload(MessageKind::Offer, &current, &offer) {
            tracing::warn!(target = "call", error = %err, "offer not delivered");
            self.fail_call("signaling unavailable", false).await;
            return;
        }
        self.set_state(CallState {
            phase: CallPhase::Active,
            ..current
        });
        if let Some(session) = &self.session {
            session.start_watchdog();
        }
    }

    async fn on_call_reject(&mut self, message: SignalingMessage) {
        let current = self.snapshot();
        if current.phase != CallPhase::Outgoing || !self.matches_session(&current, &message) {
            tracing::debug!(target = "call", from = message.from, "dropping stale call-reject");
            return;
        }
        tracing::info!(target = "call", from = message.from, "call was rejected");
        let _ = self.events.send(CallEvent::CallRejected {
            reason: message.text().map(str::to_string),
        });
        self.clear_call().await;
        self.set_state(CallState::idle());
    }

    async fn on_call_end(&mut self, message: SignalingMessage) {
        let current = self.snapshot();
        if current.phase == CallPhase::Idle || !self.matches_session(&current, &message) {
            tracing::debug!(target = "call", from = message.from, "dropping stale call-end");
            return;
        }
        // Mark the guard so a racing local hang-up stays silent.
        if let (Some(peer), Some(session_id)) = (current.peer, current.session_id.as_deref()) {
            self.guard.try_send(peer, session_id);
        }
        self.end_call(&current, false).await;
    }

    async fn on_offer(&mut self, message: SignalingMessage) {
        let current = self.snapshot();
        if current.phase != CallPhase::Active || !self.matches_session(&current, &message) {
            tracing::debug!(target = "call", from = message.from, "dropping stale offer");
            return;
        }
        let Some(session) = self.session.clone() else {
            return;
        };
        let payload = match message.decode::<SdpPayload>() {
            Ok(payload) => payload,
            Err(err) => {
                tracing::warn!(target = "call", error = %err, "malformed offer payload");
                return;
            }
        };
        // Mid-call offers are ICE restarts; the answer path is identical.
        if let Err(err) = session.apply_remote_description(&payload).await {
            tracing::warn!(target = "call", error = %err, "remote offer rejected");
            self.fail_call("negotiation failed", true).await;
            return;
        }
        let answer = match session.create_answer().await {
            Ok(answer) => answer,
            Err(err) => {
                tracing::warn!(target = "call", error = %err, "answer creation failed");
                self.fail_call("negotiation failed", true).await;
                return;
            }
        };
        if let Err(err) = self.send_payload(MessageKind::Answer, &current, &answer) {
            tracing::warn!(target = "call", error = %err, "answer not delivered");
        }
    }

    async fn on_answer(&mut self, message: SignalingMessage) {
        let current = self.snapshot();
        if current.phase != CallPhase::Active || !self.matches_session(&current, &message) {
            tracing::debug!(target = "call", from = message.from, "dropping stale answer");
            return;
        }
        let Some(session) = self.session.clone() else {
            return;
        };
        let payload = match message.decode::<SdpPayload>() {
            Ok(payload) => payload,
            Err(err) => {
                tracing::warn!(target = "call", error = %err, "malformed answer payload");
                return;
            }
        };
        if let Err(err) = session.apply_remote_description(&payload).await {
            tracing::warn!(target = "call", error = %err, "remote answer rejected");
            self.fail_call("negotiation failed", true).await;
        }
    }

    async fn on_candidate(&mut self, message: SignalingMessage) {
        let current = self.snapshot();
        if !self.matches_session(&current, &message) {
            tracing::debug!(target = "call", from = message.from, "dropping stale candidate");
            return;
        }
        let Some(session) = self.session.clone() else {
            return;
        };
        match message.decode::<CandidatePayload>() {
            Ok(payload) => session.add_remote_candidate(payload).await,
            Err(err) => {
                tracing::warn!(target = "call", error = %err, "malformed candidate payload");
            }
        }
    }

    async fn handle_peer_event(&mut self, event: PeerEvent) {
        let current = self.snapshot();
        match event {
            PeerEvent::LocalCandidate(payload) => {
                if let Err(err) = self.send_payload(MessageKind::IceCandidate, &current, &payload) {
                    tracing::debug!(target = "call", error = %err, "local candidate not delivered");
                }
            }
            PeerEvent::ConnectionState(state) => {
                tracing::debug!(target = "call", ?state, "peer connection state");
                if matches!(
                    state,
                    RTCPeerConnectionState::Disconnected | RTCPeerConnectionState::Failed
                ) {
                    if let Some(session) = &self.session {
                        session.start_watchdog();
                    }
                }
            }
            PeerEvent::RemoteTrack(track) => {
                let _ = self.events.send(CallEvent::RemoteTrack(track));
            }
            PeerEvent::ChatChannelOpen => {
                self.chat_open = true;
            }
            PeerEvent::ChatMessage(text) => {
                let _ = self.events.send(CallEvent::ChatReceived {
                    from: current.peer.unwrap_or_default(),
                    text,
                });
            }
            PeerEvent::ConnectivityDegraded => {
                tracing::warn!(target = "call", "call quality degraded");
            }
            PeerEvent::RestartOffer(payload) => {
                if let Err(err) = self.send_payload(MessageKind::Offer, &current, &payload) {
                    tracing::warn!(target = "call", error = %err, "restart offer not delivered");
                }
            }
            PeerEvent::ConnectivityFailed => {
                self.fail_call("peer connectivity lost", true).await;
            }
        }
    }

    async fn handle_link(&mut self, state: LinkState) {
        let _ = self.events.send(CallEvent::LinkStateChanged(state));
        if state == LinkState::Failed {
            self.fail_call("signaling link failed", false).await;
        }
    }

    async fn handle_ring_timeout(&mut self, session_id: &str) {
        let current = self.snapshot();
        if current.session_id.as_deref() != Some(session_id) {
            return;
        }
        match current.phase {
            CallPhase::Outgoing => {
                tracing::info!(target = "call", session_id, "outgoing call timed out");
                self.end_call(&current, true).await;
            }
            CallPhase::Incoming => {
                // Missed call; the caller's own timer notifies them.
                tracing::info!(target = "call", session_id, "incoming call timed out");
                self.end_call(&current, false).await;
            }
            _ => {}
        }
    }

    async fn send_chat(&mut self, text: &str) -> Result<(), CallError> {
        let current = self.snapshot();
        if current.phase != CallPhase::Active {
            return Err(CallError::NoCall);
        }
        if self.chat_open {
            if let Some(session) = &self.session {
                match session.send_chat(text).await {
                    Ok(()) => return Ok(()),
                    Err(err) => {
                        tracing::debug!(target = "call", error = %err, "chat channel send failed, using signaling");
                    }
                }
            }
        }
        // Fallback path while the data channel is not (or no longer) open.
        let (peer, session_id) = match (current.peer, current.session_id) {
            (Some(peer), Some(session_id)) => (peer, session_id),
            _ => return Err(CallError::NoCall),
        };
        let message =
            SignalingMessage::new(MessageKind::ChatMessage, self.participant, peer, session_id)
                .with_data(serde_json::Value::String(text.to_string()));
        self.channel.send(&message)?;
        Ok(())
    }

    async fn set_screen_share(&mut self, enable: bool) -> Result<(), CallError> {
        if self.snapshot().phase != CallPhase::Active {
            return Err(CallError::NoCall);
        }
        let session = self.session.clone().ok_or(CallError::NoCall)?;
        if enable {
            session.switch_to_screen_share().await?;
        } else {
            session.revert_to_camera().await?;
        }
        Ok(())
    }

    fn send_payload<T: serde::Serialize>(
        &self,
        kind: MessageKind,
        current: &CallState,
        payload: &T,
    ) -> Result<(), SignalError> {
        let (peer, session_id) = match (current.peer, current.session_id.as_deref()) {
            (Some(peer), Some(session_id)) => (peer, session_id),
            _ => return Err(SignalError::NotConnected),
        };
        let message = SignalingMessage::new(kind, self.participant, peer, session_id)
            .with_payload(payload)?;
        self.channel.send(&message)
    }

    fn matches_session(&self, current: &CallState, message: &SignalingMessage) -> bool {
        current.peer == Some(message.from)
            && current.session_id.as_deref() == Some(message.session_id.as_str())
    }

    fn arm_ring_timer(&mut self, session_id: String) {
        self.cancel_ring_timer();
        let input = self.input.clone();
        let timeout = self.config.ring_timeout;
        self.ring_timer = Some(tokio::spawn(async move {
            sleep(timeout).await;
            let _ = input.send(CallInput::RingTimeout { session_id });
        }));
    }

    fn cancel_ring_timer(&mut self) {
        if let Some(timer) = self.ring_timer.take() {
            timer.abort();
        }
    }
}
