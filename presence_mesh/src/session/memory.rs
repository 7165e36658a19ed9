//! In-process loopback transport: sessions exchange frames through a shared
//! hub instead of a network. Used by the integration tests and handy for
//! demos. Must run inside a `LocalSet` (or actix-rt) context.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use anyhow::anyhow;
use async_trait::async_trait;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::debug;
use uuid::Uuid;

use crate::error::SessionError;
use crate::session::{ChannelCmd, ControlChannel, MediaHandle, Session, SessionEvent};

#[derive(Default)]
struct HubInner {
    sessions: HashMap<Uuid, UnboundedSender<SessionEvent>>,
    // (caller, callee) -> media offered with the call
    calls: HashMap<(Uuid, Uuid), MediaHandle>,
    // event streams of silent participants, parked so their channels stay up
    parked: Vec<UnboundedReceiver<SessionEvent>>,
}

/// Rendezvous point for [`MemorySession`]s. Clones share the same mesh.
#[derive(Clone, Default)]
pub struct MemoryHub {
    inner: Rc<RefCell<HubInner>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session(&self) -> MemorySession {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        MemorySession {
            hub: self.inner.clone(),
            local_id: None,
            events_tx,
            events_rx,
        }
    }

    /// Registers a participant that accepts connections but never speaks:
    /// its channels open normally and all traffic to it disappears. Lets
    /// tests exercise dormancy eviction without a network.
    pub fn register_silent(&self) -> Uuid {
        let id = Uuid::new_v4();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let mut hub = self.inner.borrow_mut();
        hub.sessions.insert(id, events_tx);
        hub.parked.push(events_rx);
        id
    }
}

pub struct MemorySession {
    hub: Rc<RefCell<HubInner>>,
    local_id: Option<Uuid>,
    events_tx: UnboundedSender<SessionEvent>,
    events_rx: UnboundedReceiver<SessionEvent>,
}

impl MemorySession {
    fn require_id(&self) -> Result<Uuid, SessionError> {
        self.local_id.ok_or(SessionError::Closed)
    }

    fn peer_events(&self, to: Uuid) -> Result<UnboundedSender<SessionEvent>, SessionError> {
        self.hub
            .borrow()
            .sessions
            .get(&to)
            .cloned()
            .ok_or_else(|| SessionError::Transport(anyhow!("no participant {to} at the rendezvous")))
    }
}

/// Drains one side's outgoing channel commands into the other side's event
/// stream. Closing (or dropping) either handle closes the link for both.
async fn route(
    mut commands: UnboundedReceiver<ChannelCmd>,
    to_peer: UnboundedSender<SessionEvent>,
    to_local: UnboundedSender<SessionEvent>,
    local_id: Uuid,
    peer_id: Uuid,
) {
    while let Some(command) = commands.recv().await {
        match command {
            ChannelCmd::Send(payload) => {
                let _ = to_peer.send(SessionEvent::Frame {
                    from: local_id,
                    payload,
                });
            }
            ChannelCmd::Close => break,
        }
    }
    let _ = to_peer.send(SessionEvent::ControlClosed { from: local_id });
    let _ = to_local.send(SessionEvent::ControlClosed { from: peer_id });
}

#[async_trait(?Send)]
impl Session for MemorySession {
    async fn open(&mut self) -> Result<Uuid, SessionError> {
        let id = Uuid::new_v4();
        self.hub
            .borrow_mut()
            .sessions
            .insert(id, self.events_tx.clone());
        self.local_id = Some(id);
        Ok(id)
    }

    async fn event(&mut self) -> Result<SessionEvent, SessionError> {
        match self.events_rx.recv().await {
            Some(event) => Ok(event),
            None => Err(SessionError::Closed),
        }
    }

    async fn dial(&mut self, to: Uuid) -> Result<ControlChannel, SessionError> {
        let local_id = self.require_id()?;
        let peer = self.peer_events(to)?;

        let (local_handle, local_commands) = ControlChannel::pair();
        let (peer_handle, peer_commands) = ControlChannel::pair();
        let _ = tokio::task::spawn_local(route(
            local_commands,
            peer.clone(),
            self.events_tx.clone(),
            local_id,
            to,
        ));
        let _ = tokio::task::spawn_local(route(
            peer_commands,
            self.events_tx.clone(),
            peer.clone(),
            to,
            local_id,
        ));

        let _ = peer.send(SessionEvent::IncomingControl {
            from: local_id,
            channel: peer_handle,
        });
        let _ = peer.send(SessionEvent::ControlOpen { from: local_id });
        let _ = self.events_tx.send(SessionEvent::ControlOpen { from: to });
        Ok(local_handle)
    }

    async fn call(&mut self, to: Uuid, media: MediaHandle) -> Result<(), SessionError> {
        let local_id = self.require_id()?;
        let peer = self.peer_events(to)?;
        self.hub.borrow_mut().calls.insert((local_id, to), media);
        let _ = peer.send(SessionEvent::IncomingCall { from: local_id });
        Ok(())
    }

    async fn answer(
        &mut self,
        from: Uuid,
        media: Option<MediaHandle>,
    ) -> Result<(), SessionError> {
        let local_id = self.require_id()?;
        let offered = self.hub.borrow_mut().calls.remove(&(from, local_id));
        match offered {
            Some(offered) => {
                let _ = self.events_tx.send(SessionEvent::MediaOpen {
                    from,
                    media: offered,
                });
            }
            None => debug!(peer = %from, "answer without a pending call"),
        }
        if let Some(media) = media {
            let caller = self.peer_events(from)?;
            let _ = caller.send(SessionEvent::MediaOpen {
                from: local_id,
                media,
            });
        }
        Ok(())
    }

    async fn hang_up(&mut self, to: Uuid) {
        let Ok(local_id) = self.require_id() else {
            return;
        };
        let mut hub = self.hub.borrow_mut();
        hub.calls.remove(&(local_id, to));
        hub.calls.remove(&(to, local_id));
        if let Some(peer) = hub.sessions.get(&to) {
            let _ = peer.send(SessionEvent::MediaClosed { from: local_id });
        }
    }

    async fn close(&mut self) {
        if let Some(id) = self.local_id.take() {
            self.hub.borrow_mut().sessions.remove(&id);
        }
    }
}
