use std::time::Duration;

use bytes::Bytes;
use getset::{CopyGetters, Getters};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::MeshError;
use crate::message::WireAction;
use crate::session::{ChannelState, ControlChannel};
use crate::state::{reduce, Action, ParticipantState};

/// Single-subscriber sink for one peer's state snapshots. Attaching replays
/// the latest cached snapshot immediately, so a late subscriber never misses
/// the current picture.
pub trait StateObserver {
    fn notify(&mut self, snapshot: &ParticipantState);

    /// Called once when the observer is detached or the link dies.
    fn clear(&mut self) {}
}

impl<F> StateObserver for F
where
    F: FnMut(&ParticipantState),
{
    fn notify(&mut self, snapshot: &ParticipantState) {
        self(snapshot)
    }
}

/// Which side started the control-channel negotiation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkRole {
    Initiate,
    Accept,
}

/// Liveness bookkeeping for one link. `received_at` is monotonically
/// non-decreasing while the link is open.
#[derive(Clone, Copy, Debug, Default)]
pub struct LastContact {
    pub sent_at: Option<Instant>,
    pub received_at: Option<Instant>,
}

/// One remote participant's connection: the control-channel handle, mirrors
/// of both channel states, the cached view of that peer's state, and liveness
/// timestamps. Owned exclusively by the manager; the `remote_id` never
/// changes after construction.
#[derive(Getters, CopyGetters)]
pub(crate) struct PeerLink {
    #[getset(get_copy = "pub")]
    remote_id: Uuid,
    #[getset(get_copy = "pub")]
    role: LinkRole,
    control: Option<ControlChannel>,
    #[getset(get_copy = "pub")]
    control_state: ChannelState,
    #[getset(get_copy = "pub")]
    media_state: ChannelState,
    #[getset(get = "pub")]
    peer_state: ParticipantState,
    #[getset(get_copy = "pub")]
    last_contact: LastContact,
    observer: Option<Box<dyn StateObserver>>,
    pending: Option<oneshot::Sender<Result<(), MeshError>>>,
}

impl std::fmt::Debug for PeerLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerLink")
            .field("remote_id", &self.remote_id)
            .field("role", &self.role)
            .field("control_state", &self.control_state)
            .field("media_state", &self.media_state)
            .finish()
    }
}

impl PeerLink {
    pub fn new(remote_id: Uuid, role: LinkRole) -> Self {
        Self {
            remote_id,
            role,
            control: None,
            control_state: ChannelState::Connecting,
            media_state: ChannelState::Connecting,
            peer_state: ParticipantState::default(),
            last_contact: LastContact::default(),
            observer: None,
            pending: None,
        }
    }

    pub fn set_control(&mut self, channel: ControlChannel) {
        self.control = Some(channel);
    }

    /// Parks the initiating `connect()` caller's completion until this link's
    /// negotiation settles one way or the other.
    pub fn set_pending(&mut self, reply: oneshot::Sender<Result<(), MeshError>>) {
        self.pending = Some(reply);
    }

    pub fn take_pending(&mut self) -> Option<oneshot::Sender<Result<(), MeshError>>> {
        self.pending.take()
    }

    pub fn mark_control_open(&mut self, now: Instant) {
        self.control_state = ChannelState::Open;
        self.record_receipt(now);
    }

    pub fn set_media_state(&mut self, state: ChannelState) {
        self.media_state = state;
    }

    pub fn record_receipt(&mut self, now: Instant) {
        self.last_contact.received_at = Some(match self.last_contact.received_at {
            Some(previous) => previous.max(now),
            None => now,
        });
    }

    /// Serializes and transmits over the control channel if it is open;
    /// silently drops otherwise. A dropped frame is re-synchronized by the
    /// next heartbeat turn.
    pub fn send(&mut self, wire: &WireAction, now: Instant) -> bool {
        if self.control_state != ChannelState::Open {
            debug!(peer = %self.remote_id, "control channel not open, dropping frame");
            return false;
        }
        let Some(channel) = &self.control else {
            debug!(peer = %self.remote_id, "no control channel, dropping frame");
            return false;
        };
        let payload = match serde_json::to_vec(wire) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(peer = %self.remote_id, "failed to encode frame: {e}");
                return false;
            }
        };
        if channel.send(Bytes::from(payload)) {
            self.last_contact.sent_at = Some(now);
            true
        } else {
            false
        }
    }

    /// Applies an action to the cached peer state and notifies the observer.
    pub fn apply(&mut self, action: &Action) {
        self.peer_state = reduce(&self.peer_state, action);
        if let Some(observer) = &mut self.observer {
            observer.notify(&self.peer_state);
        }
    }

    pub fn attach(&mut self, mut observer: Box<dyn StateObserver>) {
        observer.notify(&self.peer_state);
        self.observer = Some(observer);
    }

    pub fn detach(&mut self) {
        if let Some(mut observer) = self.observer.take() {
            observer.clear();
        }
    }

    pub fn is_dormant(&self, now: Instant, threshold: Duration) -> bool {
        match self.last_contact.received_at {
            Some(received_at) => now.duration_since(received_at) > threshold,
            None => true,
        }
    }

    /// Closes both channels. Idempotent; removal from the manager's
    /// collections is the manager's job.
    pub fn close(&mut self) {
        if self.control_state != ChannelState::Closed {
            if let Some(channel) = &self.control {
                channel.close();
            }
        }
        self.control_state = ChannelState::Closed;
        self.media_state = ChannelState::Closed;
        self.detach();
    }
}
