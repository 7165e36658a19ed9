//! Production transport: signaling over a websocket to the rendezvous relay,
//! peer-to-peer channels over WebRTC. Control and media run on independent
//! peer connections per remote participant, so the two negotiations can
//! complete out of order or fail independently.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use awc::ws::Codec;
use awc::{ws, BoxedSocket};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use secrecy::{ExposeSecret, Secret};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tokio::time;
use tracing::{debug, info, warn};
use uuid::Uuid;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::error::SessionError;
use crate::message::{ChannelKind, Envelope, SignalMessage};
use crate::session::{ChannelCmd, ControlChannel, MediaHandle, Session, SessionEvent};

const CONTROL_CHANNEL_LABEL: &str = "control";
const RECONNECT_ATTEMPTS: u32 = 5;
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Local capture tracks offered on outgoing and answered media negotiations.
/// Wrap in a [`MediaHandle`] with [`LocalMedia::into_handle`].
pub struct LocalMedia {
    tracks: Vec<Arc<dyn TrackLocal + Send + Sync>>,
}

impl LocalMedia {
    pub fn new(tracks: Vec<Arc<dyn TrackLocal + Send + Sync>>) -> Self {
        Self { tracks }
    }

    pub fn tracks(&self) -> &[Arc<dyn TrackLocal + Send + Sync>] {
        &self.tracks
    }

    pub fn into_handle(self) -> MediaHandle {
        MediaHandle::new(self)
    }
}

/// A remote participant's incoming tracks. Handed out once per media
/// negotiation; tracks arriving later land in the same handle.
#[derive(Default)]
pub struct RemoteMedia {
    tracks: Mutex<Vec<Arc<TrackRemote>>>,
}

impl RemoteMedia {
    fn push(&self, track: Arc<TrackRemote>) {
        self.tracks.lock().push(track);
    }

    pub fn tracks(&self) -> Vec<Arc<TrackRemote>> {
        self.tracks.lock().clone()
    }
}

pub struct RtcSessionConfig {
    pub host: String,
    pub port: u16,
    pub api_key: Secret<Option<String>>,
    pub ice_servers: Vec<RTCIceServer>,
}

impl fmt::Debug for RtcSessionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RtcSessionConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("ice_servers", &self.ice_servers)
            .finish()
    }
}

impl Default for RtcSessionConfig {
    fn default() -> Self {
        let ice_servers = vec![RTCIceServer {
            urls: vec!["stun:stun.stunprotocol.org:3478".to_owned()],
            ..Default::default()
        }];
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
            api_key: Secret::new(None),
            ice_servers,
        }
    }
}

impl RtcSessionConfig {
    fn url(&self, resume: Option<Uuid>) -> String {
        match resume {
            Some(id) => format!("ws://{}:{}/session?id={}", self.host, self.port, id),
            None => format!("ws://{}:{}/session", self.host, self.port),
        }
    }
}

#[derive(Default)]
pub struct RtcSessionConfigBuilder {
    config: RtcSessionConfig,
}

impl RtcSessionConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn build(self) -> RtcSessionConfig {
        self.config
    }

    pub fn host<S: AsRef<str>>(mut self, host: S) -> Self {
        self.config.host = host.as_ref().to_string();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    pub fn api_key<S: AsRef<str>>(mut self, key: S) -> Self {
        self.config.api_key = Secret::new(Some(key.as_ref().to_string()));
        self
    }

    pub fn ice_servers(mut self, ice_servers: Vec<RTCIceServer>) -> Self {
        self.config.ice_servers = ice_servers;
        self
    }
}

#[derive(Default)]
struct RtcPeer {
    control: Option<Arc<RTCPeerConnection>>,
    media: Option<Arc<RTCPeerConnection>>,
    // media offer sdp waiting for the manager to answer
    pending_call: Option<String>,
}

/// Per-peer negotiation state, split from the websocket so signal handling
/// and frame pumping borrow disjoint halves of the session.
struct Negotiator {
    local_id: Option<Uuid>,
    ice_servers: Vec<RTCIceServer>,
    peers: HashMap<Uuid, RtcPeer>,
    events_tx: UnboundedSender<SessionEvent>,
    signals_tx: UnboundedSender<Envelope>,
    // candidates that arrived before their peer connection existed
    pending_candidates: HashMap<(Uuid, ChannelKind), Vec<String>>,
}

// Reconnect progress. Deadlines are absolute so a cancelled wait resumes
// where it left off when `event` is polled again.
struct Recovery {
    attempts: u32,
    next_attempt: time::Instant,
}

pub struct WebRtcSession {
    config: RtcSessionConfig,
    ws: Option<actix_codec::Framed<BoxedSocket, Codec>>,
    negotiator: Negotiator,
    events_rx: UnboundedReceiver<SessionEvent>,
    signals_rx: UnboundedReceiver<Envelope>,
    recovery: Option<Recovery>,
    closed: bool,
}

impl WebRtcSession {
    pub fn new(config: RtcSessionConfig) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (signals_tx, signals_rx) = mpsc::unbounded_channel();
        let negotiator = Negotiator {
            local_id: None,
            ice_servers: config.ice_servers.clone(),
            peers: HashMap::new(),
            events_tx,
            signals_tx,
            pending_candidates: HashMap::new(),
        };
        Self {
            config,
            ws: None,
            negotiator,
            events_rx,
            signals_rx,
            recovery: None,
            closed: false,
        }
    }

    async fn connect(
        config: &RtcSessionConfig,
        resume: Option<Uuid>,
    ) -> Result<(actix_codec::Framed<BoxedSocket, Codec>, Uuid), SessionError> {
        let mut request = awc::Client::new().ws(config.url(resume));
        if let Some(key) = config.api_key.expose_secret() {
            request = request.basic_auth("participant", Some(key));
        }
        let (_res, mut ws) = request
            .connect()
            .await
            .map_err(|e| SessionError::Unreachable(anyhow!("websocket connect failed: {e}")))?;
        match ws.next().await {
            Some(Ok(ws::Frame::Text(msg))) => {
                let msg: SignalMessage = serde_json::from_slice(&msg)
                    .map_err(|e| SessionError::Protocol(e.to_string()))?;
                match msg {
                    SignalMessage::Id(id) => Ok((ws, id)),
                    other => Err(SessionError::Protocol(format!(
                        "expected the assigned id, got {other:?}"
                    ))),
                }
            }
            Some(Ok(_)) => Err(SessionError::Protocol(
                "expected a text frame with the assigned id".to_string(),
            )),
            Some(Err(e)) => Err(SessionError::Transport(anyhow!("websocket error: {e}"))),
            None => Err(SessionError::Refused(
                "rendezvous closed the session during the handshake".to_string(),
            )),
        }
    }

    /// Transient signaling loss: one reconnect attempt toward re-dialing the
    /// relay with the previously assigned id, leaving peer transports
    /// untouched. Called repeatedly from `event` until the session is back
    /// or the attempt budget runs out.
    async fn try_recover(&mut self) -> Result<(), SessionError> {
        let next_attempt = match &self.recovery {
            Some(recovery) => recovery.next_attempt,
            None => {
                let _ = self.negotiator.events_tx.send(SessionEvent::Recovering);
                let next_attempt = time::Instant::now() + RECONNECT_DELAY;
                self.recovery = Some(Recovery {
                    attempts: 0,
                    next_attempt,
                });
                next_attempt
            }
        };
        time::sleep_until(next_attempt).await;

        match Self::connect(&self.config, self.negotiator.local_id).await {
            Ok((ws, id)) => {
                if self.negotiator.local_id.is_some_and(|requested| requested != id) {
                    return Err(SessionError::Refused(
                        "rendezvous reassigned a different id".to_string(),
                    ));
                }
                info!("rendezvous session recovered");
                self.ws = Some(ws);
                self.recovery = None;
                let _ = self.negotiator.events_tx.send(SessionEvent::Recovered);
                Ok(())
            }
            Err(e) => {
                if let Some(recovery) = self.recovery.as_mut() {
                    recovery.attempts += 1;
                    if recovery.attempts >= RECONNECT_ATTEMPTS {
                        return Err(SessionError::Unreachable(anyhow!(
                            "rendezvous reconnect attempts exhausted: {e}"
                        )));
                    }
                    warn!(attempt = recovery.attempts, "rendezvous reconnect failed: {e}");
                    recovery.next_attempt = time::Instant::now() + RECONNECT_DELAY;
                }
                Ok(())
            }
        }
    }
}

#[async_trait(?Send)]
impl Session for WebRtcSession {
    async fn open(&mut self) -> Result<Uuid, SessionError> {
        let (ws, id) = Self::connect(&self.config, None).await?;
        self.ws = Some(ws);
        self.negotiator.local_id = Some(id);
        Ok(id)
    }

    async fn event(&mut self) -> Result<SessionEvent, SessionError> {
        loop {
            if self.closed {
                return Err(SessionError::Closed);
            }
            if self.ws.is_none() {
                self.try_recover().await?;
                continue;
            }
            let Some(ws) = self.ws.as_mut() else {
                continue;
            };
            tokio::select! {
                Some(event) = self.events_rx.recv() => return Ok(event),
                Some(envelope) = self.signals_rx.recv() => {
                    let text = serde_json::to_string(&envelope)
                        .map_err(|e| SessionError::Protocol(e.to_string()))?;
                    if let Err(e) = ws.send(ws::Message::Text(text.into())).await {
                        warn!("failed to forward signal to the rendezvous: {e}");
                    }
                }
                frame = ws.next() => match frame {
                    Some(Ok(ws::Frame::Text(msg))) => {
                        match serde_json::from_slice::<SignalMessage>(&msg) {
                            Ok(signal) => self.negotiator.handle_signal(signal).await,
                            Err(e) => warn!("ignoring malformed signal: {e}"),
                        }
                    }
                    Some(Ok(ws::Frame::Ping(msg))) => {
                        let _ = ws.send(ws::Message::Pong(msg)).await;
                    }
                    Some(Ok(ws::Frame::Pong(_))) => {}
                    Some(Ok(ws::Frame::Close(reason))) => {
                        debug!(?reason, "rendezvous closed the websocket");
                        self.ws = None;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("websocket protocol error: {e}");
                        self.ws = None;
                    }
                    None => {
                        self.ws = None;
                    }
                }
            }
        }
    }

    async fn dial(&mut self, to: Uuid) -> Result<ControlChannel, SessionError> {
        self.negotiator.dial(to).await
    }

    async fn call(&mut self, to: Uuid, media: MediaHandle) -> Result<(), SessionError> {
        self.negotiator.call(to, media).await
    }

    async fn answer(
        &mut self,
        from: Uuid,
        media: Option<MediaHandle>,
    ) -> Result<(), SessionError> {
        self.negotiator.answer(from, media).await
    }

    async fn hang_up(&mut self, to: Uuid) {
        self.negotiator.hang_up(to).await;
    }

    async fn close(&mut self) {
        self.closed = true;
        self.recovery = None;
        let ids: Vec<Uuid> = self.negotiator.peers.keys().copied().collect();
        for id in ids {
            self.negotiator.hang_up(id).await;
        }
        if let Some(mut ws) = self.ws.take() {
            let _ = ws.close().await;
        }
    }
}

impl Negotiator {
    fn require_id(&self) -> Result<Uuid, SessionError> {
        self.local_id.ok_or(SessionError::Closed)
    }

    fn send_signal(&self, to: Uuid, content: SignalMessage) {
        let _ = self.signals_tx.send(Envelope { to, content });
    }

    async fn new_peer_connection(&self) -> Result<Arc<RTCPeerConnection>, SessionError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| SessionError::Transport(e.into()))?;
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| SessionError::Transport(e.into()))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();
        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };
        let connection = api
            .new_peer_connection(config)
            .await
            .map_err(|e| SessionError::Transport(e.into()))?;
        Ok(Arc::new(connection))
    }

    /// Trickles ICE candidates through the relay and maps terminal connection
    /// states onto channel-closed events.
    async fn wire_connection(&self, peer: Uuid, kind: ChannelKind, pc: &Arc<RTCPeerConnection>) {
        let events = self.events_tx.clone();
        pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            debug!(%peer, ?kind, "peer connection state: {s}");
            if s == RTCPeerConnectionState::Failed {
                let event = match kind {
                    ChannelKind::Control => SessionEvent::ControlClosed { from: peer },
                    ChannelKind::Media => SessionEvent::MediaClosed { from: peer },
                };
                let _ = events.send(event);
            }
            Box::pin(async {})
        }))
        .await;

        let signals = self.signals_tx.clone();
        let local_id = self.local_id.unwrap_or_default();
        pc.on_ice_candidate(Box::new(move |candidate| {
            let signals = signals.clone();
            Box::pin(async move {
                if let Some(candidate) = candidate {
                    match candidate.to_json().await {
                        Ok(json) => {
                            let _ = signals.send(Envelope {
                                to: peer,
                                content: SignalMessage::IceCandidate {
                                    from: local_id,
                                    kind,
                                    candidate: json.candidate,
                                },
                            });
                        }
                        Err(e) => warn!("failed to serialize ice candidate: {e}"),
                    }
                }
            })
        }))
        .await;
    }

    async fn dial(&mut self, to: Uuid) -> Result<ControlChannel, SessionError> {
        let local_id = self.require_id()?;
        let pc = self.new_peer_connection().await?;
        self.wire_connection(to, ChannelKind::Control, &pc).await;

        let init = RTCDataChannelInit {
            ordered: Some(true),
            ..Default::default()
        };
        let dc = pc
            .create_data_channel(CONTROL_CHANNEL_LABEL, Some(init))
            .await
            .map_err(|e| SessionError::Transport(e.into()))?;
        register_control_handlers(self.events_tx.clone(), to, &dc).await;

        let (handle, commands) = ControlChannel::pair();
        let (dc_tx, dc_rx) = oneshot::channel();
        let _ = dc_tx.send(dc);
        spawn_pump(dc_rx, commands);

        let offer = pc
            .create_offer(None)
            .await
            .map_err(|e| SessionError::Transport(e.into()))?;
        pc.set_local_description(offer)
            .await
            .map_err(|e| SessionError::Transport(e.into()))?;
        let offer = pc
            .local_description()
            .await
            .ok_or_else(|| SessionError::Transport(anyhow!("local description missing")))?;
        let description =
            serde_json::to_string(&offer).map_err(|e| SessionError::Transport(e.into()))?;
        self.send_signal(
            to,
            SignalMessage::Offer {
                from: local_id,
                kind: ChannelKind::Control,
                description,
            },
        );

        self.peers.entry(to).or_default().control = Some(pc);
        self.drain_candidates(to, ChannelKind::Control).await;
        Ok(handle)
    }

    async fn call(&mut self, to: Uuid, media: MediaHandle) -> Result<(), SessionError> {
        let local_id = self.require_id()?;
        if self
            .peers
            .get(&to)
            .is_some_and(|peer| peer.media.is_some())
        {
            debug!(peer = %to, "media negotiation already running");
            return Ok(());
        }
        let pc = self.new_peer_connection().await?;
        self.wire_connection(to, ChannelKind::Media, &pc).await;
        register_track_handler(self.events_tx.clone(), to, &pc).await;
        add_local_tracks(&pc, &media).await;

        let offer = pc
            .create_offer(None)
            .await
            .map_err(|e| SessionError::Transport(e.into()))?;
        pc.set_local_description(offer)
            .await
            .map_err(|e| SessionError::Transport(e.into()))?;
        let offer = pc
            .local_description()
            .await
            .ok_or_else(|| SessionError::Transport(anyhow!("local description missing")))?;
        let description =
            serde_json::to_string(&offer).map_err(|e| SessionError::Transport(e.into()))?;
        self.send_signal(
            to,
            SignalMessage::Offer {
                from: local_id,
                kind: ChannelKind::Media,
                description,
            },
        );

        self.peers.entry(to).or_default().media = Some(pc);
        self.drain_candidates(to, ChannelKind::Media).await;
        Ok(())
    }

    async fn answer(
        &mut self,
        from: Uuid,
        media: Option<MediaHandle>,
    ) -> Result<(), SessionError> {
        let local_id = self.require_id()?;
        let Some(description) = self
            .peers
            .get_mut(&from)
            .and_then(|peer| peer.pending_call.take())
        else {
            debug!(peer = %from, "no pending call to answer");
            return Ok(());
        };

        let pc = self.new_peer_connection().await?;
        self.wire_connection(from, ChannelKind::Media, &pc).await;
        register_track_handler(self.events_tx.clone(), from, &pc).await;
        if let Some(media) = &media {
            add_local_tracks(&pc, media).await;
        }

        let offer = serde_json::from_str::<RTCSessionDescription>(&description)
            .map_err(|e| SessionError::Transport(e.into()))?;
        pc.set_remote_description(offer)
            .await
            .map_err(|e| SessionError::Transport(e.into()))?;
        let answer = pc
            .create_answer(None)
            .await
            .map_err(|e| SessionError::Transport(e.into()))?;
        pc.set_local_description(answer.clone())
            .await
            .map_err(|e| SessionError::Transport(e.into()))?;
        let description =
            serde_json::to_string(&answer).map_err(|e| SessionError::Transport(e.into()))?;
        self.send_signal(
            from,
            SignalMessage::Answer {
                from: local_id,
                kind: ChannelKind::Media,
                description,
            },
        );

        self.peers.entry(from).or_default().media = Some(pc);
        self.drain_candidates(from, ChannelKind::Media).await;
        Ok(())
    }

    async fn hang_up(&mut self, to: Uuid) {
        self.pending_candidates.remove(&(to, ChannelKind::Control));
        self.pending_candidates.remove(&(to, ChannelKind::Media));
        let Some(peer) = self.peers.remove(&to) else {
            return;
        };
        if let Some(pc) = peer.control {
            if let Err(e) = pc.close().await {
                debug!(peer = %to, "error closing control connection: {e}");
            }
        }
        if let Some(pc) = peer.media {
            if let Err(e) = pc.close().await {
                debug!(peer = %to, "error closing media connection: {e}");
            }
        }
    }

    async fn handle_signal(&mut self, signal: SignalMessage) {
        match signal {
            SignalMessage::Id(id) => debug!(%id, "unexpected id message mid-session"),
            SignalMessage::Offer {
                from,
                kind: ChannelKind::Control,
                description,
            } => {
                if let Err(e) = self.accept_control(from, description).await {
                    warn!(peer = %from, "failed to accept control offer: {e}");
                }
            }
            SignalMessage::Offer {
                from,
                kind: ChannelKind::Media,
                description,
            } => {
                let peer = self.peers.entry(from).or_default();
                if peer.media.is_some() {
                    debug!(peer = %from, "media negotiation already running, ignoring offer");
                    return;
                }
                peer.pending_call = Some(description);
                let _ = self.events_tx.send(SessionEvent::IncomingCall { from });
            }
            SignalMessage::Answer {
                from,
                kind,
                description,
            } => {
                let pc = match (kind, self.peers.get(&from)) {
                    (ChannelKind::Control, Some(peer)) => peer.control.clone(),
                    (ChannelKind::Media, Some(peer)) => peer.media.clone(),
                    _ => None,
                };
                let Some(pc) = pc else {
                    debug!(peer = %from, ?kind, "answer without a matching negotiation");
                    return;
                };
                let answer = match serde_json::from_str::<RTCSessionDescription>(&description) {
                    Ok(answer) => answer,
                    Err(e) => {
                        warn!(peer = %from, "malformed answer: {e}");
                        return;
                    }
                };
                if let Err(e) = pc.set_remote_description(answer).await {
                    warn!(peer = %from, ?kind, "failed to apply answer: {e}");
                }
            }
            SignalMessage::IceCandidate {
                from,
                kind,
                candidate,
            } => {
                let pc = match (kind, self.peers.get(&from)) {
                    (ChannelKind::Control, Some(peer)) => peer.control.clone(),
                    (ChannelKind::Media, Some(peer)) => peer.media.clone(),
                    _ => None,
                };
                match pc {
                    Some(pc) => add_candidate(&pc, candidate).await,
                    None => {
                        // Negotiation not created yet; replayed once it is.
                        self.pending_candidates
                            .entry((from, kind))
                            .or_default()
                            .push(candidate);
                    }
                }
            }
        }
    }

    /// Answer side of a control negotiation: the remote created the data
    /// channel, we hand its handle to the manager and answer the offer.
    async fn accept_control(
        &mut self,
        from: Uuid,
        description: String,
    ) -> Result<(), SessionError> {
        let local_id = self.require_id()?;
        if self
            .peers
            .get(&from)
            .is_some_and(|peer| peer.control.is_some())
        {
            info!(peer = %from, "control negotiation glare, keeping the existing attempt");
            return Ok(());
        }

        let pc = self.new_peer_connection().await?;
        self.wire_connection(from, ChannelKind::Control, &pc).await;

        let (handle, commands) = ControlChannel::pair();
        let (dc_tx, dc_rx) = oneshot::channel();
        spawn_pump(dc_rx, commands);

        let events = self.events_tx.clone();
        let dc_slot = Arc::new(Mutex::new(Some(dc_tx)));
        pc.on_data_channel(Box::new(move |dc| {
            let events = events.clone();
            let dc_slot = dc_slot.clone();
            Box::pin(async move {
                register_control_handlers(events, from, &dc).await;
                if let Some(dc_tx) = dc_slot.lock().take() {
                    let _ = dc_tx.send(dc);
                }
            })
        }))
        .await;

        let offer = serde_json::from_str::<RTCSessionDescription>(&description)
            .map_err(|e| SessionError::Transport(e.into()))?;
        pc.set_remote_description(offer)
            .await
            .map_err(|e| SessionError::Transport(e.into()))?;
        let answer = pc
            .create_answer(None)
            .await
            .map_err(|e| SessionError::Transport(e.into()))?;
        pc.set_local_description(answer.clone())
            .await
            .map_err(|e| SessionError::Transport(e.into()))?;
        let description =
            serde_json::to_string(&answer).map_err(|e| SessionError::Transport(e.into()))?;
        self.send_signal(
            from,
            SignalMessage::Answer {
                from: local_id,
                kind: ChannelKind::Control,
                description,
            },
        );

        self.peers.entry(from).or_default().control = Some(pc);
        let _ = self.events_tx.send(SessionEvent::IncomingControl {
            from,
            channel: handle,
        });
        self.drain_candidates(from, ChannelKind::Control).await;
        Ok(())
    }

    async fn drain_candidates(&mut self, peer: Uuid, kind: ChannelKind) {
        let Some(candidates) = self.pending_candidates.remove(&(peer, kind)) else {
            return;
        };
        let pc = match (kind, self.peers.get(&peer)) {
            (ChannelKind::Control, Some(entry)) => entry.control.clone(),
            (ChannelKind::Media, Some(entry)) => entry.media.clone(),
            _ => None,
        };
        if let Some(pc) = pc {
            for candidate in candidates {
                add_candidate(&pc, candidate).await;
            }
        }
    }
}

async fn add_candidate(pc: &Arc<RTCPeerConnection>, candidate: String) {
    let candidate = RTCIceCandidateInit {
        candidate,
        ..Default::default()
    };
    if let Err(e) = pc.add_ice_candidate(candidate).await {
        warn!("failed to add ice candidate: {e}");
    }
}

async fn add_local_tracks(pc: &Arc<RTCPeerConnection>, media: &MediaHandle) {
    let Some(local) = media.downcast_ref::<LocalMedia>() else {
        warn!("media handle does not carry local tracks, offering none");
        return;
    };
    for track in local.tracks() {
        if let Err(e) = pc.add_track(track.clone()).await {
            warn!("failed to add local track: {e}");
        }
    }
}

async fn register_control_handlers(
    events: UnboundedSender<SessionEvent>,
    peer: Uuid,
    dc: &Arc<RTCDataChannel>,
) {
    let open_events = events.clone();
    dc.on_open(Box::new(move || {
        let _ = open_events.send(SessionEvent::ControlOpen { from: peer });
        Box::pin(async {})
    }))
    .await;

    let message_events = events.clone();
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let _ = message_events.send(SessionEvent::Frame {
            from: peer,
            payload: msg.data,
        });
        Box::pin(async {})
    }))
    .await;

    let close_events = events.clone();
    dc.on_close(Box::new(move || {
        let _ = close_events.send(SessionEvent::ControlClosed { from: peer });
        Box::pin(async {})
    }))
    .await;

    dc.on_error(Box::new(move |e| {
        warn!("control channel error: {e}");
        let _ = events.send(SessionEvent::ControlClosed { from: peer });
        Box::pin(async {})
    }))
    .await;
}

/// Announces the peer's media once, on the first remote track; further tracks
/// accumulate in the same handle.
async fn register_track_handler(
    events: UnboundedSender<SessionEvent>,
    peer: Uuid,
    pc: &Arc<RTCPeerConnection>,
) {
    let remote = Arc::new(RemoteMedia::default());
    let announced = Arc::new(AtomicBool::new(false));
    pc.on_track(Box::new(move |track, _receiver| {
        let events = events.clone();
        let remote = remote.clone();
        let announced = announced.clone();
        Box::pin(async move {
            if let Some(track) = track {
                remote.push(track);
                if !announced.swap(true, Ordering::SeqCst) {
                    let _ = events.send(SessionEvent::MediaOpen {
                        from: peer,
                        media: MediaHandle::from_arc(remote),
                    });
                }
            }
        })
    }))
    .await;
}

/// Forwards channel commands into the data channel once it exists. Dropping
/// the handle tears the channel down.
fn spawn_pump(
    dc_rx: oneshot::Receiver<Arc<RTCDataChannel>>,
    mut commands: UnboundedReceiver<ChannelCmd>,
) {
    tokio::spawn(async move {
        let Ok(dc) = dc_rx.await else {
            return;
        };
        while let Some(command) = commands.recv().await {
            match command {
                ChannelCmd::Send(payload) => {
                    if let Err(e) = dc.send(&payload).await {
                        warn!("control channel send failed: {e}");
                    }
                }
                ChannelCmd::Close => break,
            }
        }
        let _ = dc.close().await;
    });
}
