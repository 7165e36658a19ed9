//! Peer mesh manager for a spatial presence application.
//!
//! Each participant negotiates point-to-point transports with every other
//! participant it learns about, mirrors a small piece of per-peer shared
//! state, and keeps the mesh self-healing via gossip discovery and an
//! adaptive heartbeat.

use std::collections::HashMap;

use bytes::Bytes;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tokio::time::{self, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub mod config;
pub mod error;
mod heartbeat;
pub mod link;
pub mod message;
pub mod session;
pub mod state;

pub use config::{MeshConfig, MeshConfigBuilder};
pub use error::{MeshError, SessionError};
pub use link::{LinkRole, StateObserver};
pub use session::{ChannelState, ControlChannel, MediaHandle, Session, SessionEvent};
pub use state::{reduce, Action, Location, ParticipantState, StateSync};

use heartbeat::HeartbeatScheduler;
use link::PeerLink;
use message::WireAction;

enum Command {
    Connect {
        id: Uuid,
        reply: oneshot::Sender<Result<(), MeshError>>,
    },
    Dispatch {
        action: Action,
        reply: oneshot::Sender<ParticipantState>,
    },
    LocalState {
        reply: oneshot::Sender<ParticipantState>,
    },
    Attach {
        id: Uuid,
        observer: Box<dyn StateObserver>,
    },
    Detach {
        id: Uuid,
    },
    Stop,
}

/// Mesh topology changes, consumed by the rendering layer.
#[derive(Debug)]
pub enum MeshEvent {
    PeerConnected { id: Uuid, link: LinkHandle },
    PeerDisconnected { id: Uuid },
}

/// Handle to one connected peer's link, good for subscribing to its state
/// snapshots. Channel internals stay with the manager.
#[derive(Clone)]
pub struct LinkHandle {
    id: Uuid,
    commands: UnboundedSender<Command>,
}

impl std::fmt::Debug for LinkHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkHandle").field("id", &self.id).finish()
    }
}

impl LinkHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Registers the link's single observer. The current cached snapshot is
    /// replayed immediately, so attaching late never misses the latest state.
    pub fn attach(&self, observer: impl StateObserver + 'static) {
        let _ = self.commands.send(Command::Attach {
            id: self.id,
            observer: Box::new(observer),
        });
    }

    pub fn detach(&self) {
        let _ = self.commands.send(Command::Detach { id: self.id });
    }
}

/// Cloneable front door to a running [`MeshManager`]. All calls are routed to
/// the manager's event loop; they fail with [`MeshError::Stopped`] once the
/// loop is gone.
#[derive(Clone)]
pub struct MeshHandle {
    commands: UnboundedSender<Command>,
}

impl MeshHandle {
    /// Connects to a remote participant. Resolves once the control channel
    /// opens; succeeds immediately for the local id or an existing link.
    /// Duplicate calls never create a second link.
    pub async fn connect(&self, id: Uuid) -> Result<(), MeshError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Connect { id, reply })
            .map_err(|_| MeshError::Stopped)?;
        rx.await.map_err(|_| MeshError::Stopped)?
    }

    /// Applies an action to the local state and broadcasts it to every linked
    /// peer (media-handle updates stay local). Returns the new local state.
    pub async fn dispatch(&self, action: Action) -> Result<ParticipantState, MeshError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Dispatch { action, reply })
            .map_err(|_| MeshError::Stopped)?;
        rx.await.map_err(|_| MeshError::Stopped)
    }

    pub async fn local_state(&self) -> Result<ParticipantState, MeshError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::LocalState { reply })
            .map_err(|_| MeshError::Stopped)?;
        rx.await.map_err(|_| MeshError::Stopped)
    }

    /// Tears down every link and the rendezvous session. Safe to call at any
    /// point; in-flight connection attempts settle with an error.
    pub fn stop(&self) {
        let _ = self.commands.send(Command::Stop);
    }
}

/// Owns the rendezvous session, the per-peer links, the local state, and the
/// heartbeat rotation. Collaborators talk to it through [`MeshHandle`] and
/// consume [`MeshEvent`]s; all state mutation happens on the single task
/// driving [`MeshManager::run`].
pub struct MeshManager<S: Session> {
    config: MeshConfig,
    session: S,
    local_id: Uuid,
    local_state: ParticipantState,
    links: HashMap<Uuid, PeerLink>,
    heartbeat: HeartbeatScheduler,
    commands: UnboundedReceiver<Command>,
    command_tx: UnboundedSender<Command>,
    events: UnboundedSender<MeshEvent>,
    events_rx: Option<UnboundedReceiver<MeshEvent>>,
}

impl<S: Session> MeshManager<S> {
    /// Opens the rendezvous session and resolves once the local id is
    /// assigned. The heartbeat starts with [`MeshManager::run`].
    pub async fn start(config: MeshConfig, mut session: S) -> Result<Self, MeshError> {
        let local_id = session.open().await?;
        info!(%local_id, "rendezvous session open");
        let (command_tx, commands) = mpsc::unbounded_channel();
        let (events, events_rx) = mpsc::unbounded_channel();
        let local_state = ParticipantState {
            location: config.initial_location,
            ..Default::default()
        };
        let heartbeat = HeartbeatScheduler::new(config.heartbeat_budget);
        Ok(Self {
            config,
            session,
            local_id,
            local_state,
            links: HashMap::new(),
            heartbeat,
            commands,
            command_tx,
            events,
            events_rx,
        })
    }

    pub fn local_id(&self) -> Uuid {
        self.local_id
    }

    pub fn local_state(&self) -> &ParticipantState {
        &self.local_state
    }

    pub fn handle(&self) -> MeshHandle {
        MeshHandle {
            commands: self.command_tx.clone(),
        }
    }

    /// Takes the mesh event stream. Yields `None` after the first call.
    pub fn events(&mut self) -> Option<UnboundedReceiver<MeshEvent>> {
        self.events_rx.take()
    }

    /// Drives the mesh until [`MeshHandle::stop`] or a fatal session error.
    /// Event arrival order is the only ordering between mutations.
    pub async fn run(&mut self) -> Result<(), MeshError> {
        loop {
            let deadline = self.heartbeat.deadline();
            tokio::select! {
                Some(command) = self.commands.recv() => {
                    if !self.handle_command(command).await {
                        break;
                    }
                }
                event = self.session.event() => match event {
                    Ok(event) => self.handle_session_event(event).await,
                    Err(e) => {
                        error!("fatal session error: {e}");
                        self.teardown().await;
                        return Err(e.into());
                    }
                },
                _ = time::sleep_until(deadline) => self.heartbeat_turn().await,
            }
        }
        self.teardown().await;
        Ok(())
    }

    async fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::Connect { id, reply } => self.connect_peer(id, Some(reply)).await,
            Command::Dispatch { action, reply } => {
                self.local_state = reduce(&self.local_state, &action);
                if let Some(wire) = action.wire() {
                    let now = Instant::now();
                    for link in self.links.values_mut() {
                        link.send(&wire, now);
                    }
                }
                let _ = reply.send(self.local_state.clone());
            }
            Command::LocalState { reply } => {
                let _ = reply.send(self.local_state.clone());
            }
            Command::Attach { id, observer } => match self.links.get_mut(&id) {
                Some(link) => link.attach(observer),
                None => debug!(peer = %id, "attach for unknown link"),
            },
            Command::Detach { id } => {
                if let Some(link) = self.links.get_mut(&id) {
                    link.detach();
                }
            }
            Command::Stop => return false,
        }
        true
    }

    async fn handle_session_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::IncomingControl { from, channel } => {
                if from == self.local_id {
                    warn!("ignoring self-referential control channel");
                    return;
                }
                let link = self.links.entry(from).or_insert_with(|| {
                    info!(peer = %from, "incoming control channel");
                    PeerLink::new(from, LinkRole::Accept)
                });
                link.set_control(channel);
            }
            SessionEvent::ControlOpen { from } => self.control_open(from),
            SessionEvent::Frame { from, payload } => self.frame(from, payload).await,
            SessionEvent::ControlClosed { from } => self.drop_link(from).await,
            SessionEvent::IncomingCall { from } => {
                self.links
                    .entry(from)
                    .or_insert_with(|| PeerLink::new(from, LinkRole::Accept));
                let media = self.local_state.media.clone();
                if let Err(e) = self.session.answer(from, media).await {
                    warn!(peer = %from, "failed to answer call: {e}");
                }
            }
            SessionEvent::MediaOpen { from, media } => {
                let link = self
                    .links
                    .entry(from)
                    .or_insert_with(|| PeerLink::new(from, LinkRole::Accept));
                link.set_media_state(ChannelState::Open);
                // Media arrival flows through the same observer path as
                // control state.
                link.apply(&Action::SetMedia(Some(media)));
            }
            SessionEvent::MediaClosed { from } => {
                // Losing media degrades the session; only losing control
                // ends it.
                debug!(peer = %from, "media channel closed");
                if let Some(link) = self.links.get_mut(&from) {
                    link.set_media_state(ChannelState::Closed);
                }
            }
            SessionEvent::Recovering => {
                info!("rendezvous connection lost, session reconnecting");
            }
            SessionEvent::Recovered => info!("rendezvous connection recovered"),
        }
    }

    async fn connect_peer(
        &mut self,
        id: Uuid,
        reply: Option<oneshot::Sender<Result<(), MeshError>>>,
    ) {
        if id == self.local_id {
            debug!("skipping connect to self");
            if let Some(reply) = reply {
                let _ = reply.send(Ok(()));
            }
            return;
        }
        if self.links.contains_key(&id) {
            debug!(peer = %id, "already linked");
            if let Some(reply) = reply {
                let _ = reply.send(Ok(()));
            }
            return;
        }
        info!(peer = %id, "connecting");
        // The link is registered before the first suspension point so a
        // concurrent connect for the same id cannot start a second
        // negotiation.
        let mut link = PeerLink::new(id, LinkRole::Initiate);
        if let Some(reply) = reply {
            link.set_pending(reply);
        }
        self.links.insert(id, link);

        match self.session.dial(id).await {
            Ok(channel) => {
                if let Some(link) = self.links.get_mut(&id) {
                    link.set_control(channel);
                }
                if let Some(media) = self.local_state.media.clone() {
                    if let Err(e) = self.session.call(id, media).await {
                        warn!(peer = %id, "media negotiation failed to start: {e}");
                    }
                }
            }
            Err(e) => {
                warn!(peer = %id, "control negotiation failed to start: {e}");
                if let Some(mut link) = self.links.remove(&id) {
                    if let Some(pending) = link.take_pending() {
                        let _ = pending.send(Err(MeshError::NegotiationFailed { id }));
                    }
                    link.close();
                }
            }
        }
    }

    fn control_open(&mut self, from: Uuid) {
        let known: Vec<Uuid> = self.links.keys().copied().collect();
        let sync = WireAction::Sync(StateSync::of(&self.local_state));
        let Some(link) = self.links.get_mut(&from) else {
            debug!(peer = %from, "control open for unknown link");
            return;
        };
        if link.control_state() == ChannelState::Open {
            return;
        }
        let now = Instant::now();
        link.mark_control_open(now);
        // Seed the new peer with the current world state and the known
        // topology in one round trip.
        link.send(&sync, now);
        link.send(&WireAction::Discover(known), now);
        if let Some(pending) = link.take_pending() {
            let _ = pending.send(Ok(()));
        }
        self.heartbeat.enqueue(from);
        info!(peer = %from, "peer connected");
        let _ = self.events.send(MeshEvent::PeerConnected {
            id: from,
            link: LinkHandle {
                id: from,
                commands: self.command_tx.clone(),
            },
        });
    }

    async fn frame(&mut self, from: Uuid, payload: Bytes) {
        let wire = {
            let Some(link) = self.links.get_mut(&from) else {
                debug!(peer = %from, "frame from unknown link");
                return;
            };
            link.record_receipt(Instant::now());
            match serde_json::from_slice::<WireAction>(&payload) {
                Ok(wire) => wire,
                Err(e) => {
                    warn!(peer = %from, "ignoring malformed frame: {e}");
                    return;
                }
            }
        };
        match wire {
            WireAction::Discover(ids) => self.discover(ids).await,
            other => {
                if let Some(link) = self.links.get_mut(&from) {
                    link.apply(&Action::from(other));
                }
            }
        }
    }

    /// Flood-and-converge: attempt a connection to every advertised id we do
    /// not already know. The self and existing-link guards make repeated
    /// announcements idempotent.
    async fn discover(&mut self, ids: Vec<Uuid>) {
        for id in ids {
            if id == self.local_id || self.links.contains_key(&id) {
                continue;
            }
            debug!(peer = %id, "discovered new peer");
            self.connect_peer(id, None).await;
        }
    }

    async fn drop_link(&mut self, id: Uuid) {
        let Some(mut link) = self.links.remove(&id) else {
            return;
        };
        self.heartbeat.remove(id);
        let was_open = link.control_state() == ChannelState::Open;
        if let Some(pending) = link.take_pending() {
            // Negotiation failure belongs to the initiating caller alone.
            let _ = pending.send(Err(MeshError::NegotiationFailed { id }));
        }
        link.close();
        self.session.hang_up(id).await;
        if was_open {
            info!(peer = %id, "peer disconnected");
            let _ = self.events.send(MeshEvent::PeerDisconnected { id });
        } else {
            debug!(peer = %id, "link discarded before reaching open");
        }
    }

    async fn heartbeat_turn(&mut self) {
        let Some(id) = self.heartbeat.tick() else {
            return;
        };
        let now = Instant::now();
        let dormant = match self.links.get_mut(&id) {
            Some(link) => link.is_dormant(now, self.config.dormancy_threshold),
            None => return,
        };
        if dormant {
            info!(peer = %id, "link dormant, evicting");
            self.drop_link(id).await;
        } else {
            // The periodic full-state sync doubles as the recovery path for
            // frames dropped while a channel was transiently unavailable.
            let sync = WireAction::Sync(StateSync::of(&self.local_state));
            if let Some(link) = self.links.get_mut(&id) {
                link.send(&sync, now);
            }
            self.heartbeat.requeue(id);
        }
    }

    async fn teardown(&mut self) {
        info!("stopping mesh manager");
        for (_, mut link) in self.links.drain() {
            link.close();
        }
        self.heartbeat.clear();
        self.session.close().await;
        self.local_state = ParticipantState {
            location: self.config.initial_location,
            ..Default::default()
        };
    }
}
