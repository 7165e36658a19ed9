//! The rendezvous-session seam: everything the mesh manager needs from the
//! outside world, with the negotiation protocol and wire format left to the
//! implementation.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use uuid::Uuid;

use crate::error::SessionError;

pub mod memory;
pub mod webrtc;

/// Opaque, cheaply-cloneable reference to a live media capability (a local
/// capture source on the way out, a remote stream on the way in). The mesh
/// layer only passes it around; it never crosses the control channel.
#[derive(Clone)]
pub struct MediaHandle(Arc<dyn Any + Send + Sync>);

impl MediaHandle {
    pub fn new<T: Any + Send + Sync>(inner: T) -> Self {
        Self(Arc::new(inner))
    }

    /// Wraps an already-shared capability without another allocation.
    pub fn from_arc<T: Any + Send + Sync>(inner: Arc<T>) -> Self {
        Self(inner)
    }

    pub fn downcast_ref<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.0.downcast_ref()
    }

    /// Identity comparison: two handles are the same capability, not merely
    /// equal-looking ones.
    pub fn same(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl PartialEq for MediaHandle {
    fn eq(&self, other: &Self) -> bool {
        self.same(other)
    }
}

impl fmt::Debug for MediaHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("MediaHandle").finish()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Open,
    Closed,
}

#[derive(Debug)]
pub enum ChannelCmd {
    Send(Bytes),
    Close,
}

/// Sending half of one peer's control channel. Openness is reported through
/// [`SessionEvent`]s; pushing into a channel that never opens is harmless and
/// the bytes are discarded by the transport.
#[derive(Clone, Debug)]
pub struct ControlChannel {
    tx: UnboundedSender<ChannelCmd>,
}

impl ControlChannel {
    /// Creates a handle plus the command stream a session implementation
    /// drains into its transport.
    pub fn pair() -> (Self, UnboundedReceiver<ChannelCmd>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn send(&self, payload: Bytes) -> bool {
        self.tx.send(ChannelCmd::Send(payload)).is_ok()
    }

    pub fn close(&self) {
        let _ = self.tx.send(ChannelCmd::Close);
    }
}

/// Everything a session reports back to the manager. Events are keyed by the
/// remote participant; the manager routes them to the matching peer link.
#[derive(Debug)]
pub enum SessionEvent {
    /// A remote participant started a control-channel negotiation with us.
    IncomingControl { from: Uuid, channel: ControlChannel },
    /// A control channel (either role) finished negotiating and is usable.
    ControlOpen { from: Uuid },
    /// A control frame arrived.
    Frame { from: Uuid, payload: Bytes },
    /// A control channel closed or failed; the link is dead.
    ControlClosed { from: Uuid },
    /// A remote participant started a media negotiation; answer with
    /// [`Session::answer`].
    IncomingCall { from: Uuid },
    /// Remote media arrived (on either side of a media negotiation).
    MediaOpen { from: Uuid, media: MediaHandle },
    /// A media channel closed or failed. Non-fatal for the link.
    MediaClosed { from: Uuid },
    /// The rendezvous connection dropped; the session is reconnecting on its
    /// own. Existing peer transports are untouched.
    Recovering,
    /// The rendezvous connection is back.
    Recovered,
}

/// A session with the rendezvous service plus the point-to-point transports
/// negotiated through it.
///
/// Implementations own all per-peer transport resources; the manager only
/// holds [`ControlChannel`] handles. All methods are driven from the
/// manager's single event-processing task. `event` must be cancel-safe: it is
/// raced against the manager's command queue and heartbeat timer.
#[async_trait(?Send)]
pub trait Session {
    /// Connects to the rendezvous service and returns the assigned
    /// participant id.
    async fn open(&mut self) -> Result<Uuid, SessionError>;

    /// Next session event. An `Err` is fatal: the session is unusable and the
    /// manager tears down.
    async fn event(&mut self) -> Result<SessionEvent, SessionError>;

    /// Starts a control-channel negotiation toward `to` (initiate role).
    async fn dial(&mut self, to: Uuid) -> Result<ControlChannel, SessionError>;

    /// Starts a best-effort media negotiation toward `to`, offering `media`.
    async fn call(&mut self, to: Uuid, media: MediaHandle) -> Result<(), SessionError>;

    /// Answers an incoming media negotiation, optionally offering local media
    /// back.
    async fn answer(&mut self, from: Uuid, media: Option<MediaHandle>)
        -> Result<(), SessionError>;

    /// Drops all transport resources held for `to`.
    async fn hang_up(&mut self, to: Uuid);

    /// Tears the whole session down.
    async fn close(&mut self);
}
