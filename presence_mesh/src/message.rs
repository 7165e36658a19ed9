use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::state::{Action, Location, StateSync};

/// Control-channel payload. Everything a peer may legitimately put on the
/// wire; media handles have no variant here, which makes the dispatch filter
/// an exhaustive match instead of a runtime convention.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum WireAction {
    Location(Location),
    Name(String),
    Group(Option<String>),
    Sync(StateSync),
    Discover(Vec<Uuid>),
}

impl Action {
    /// The on-wire form of this action, or `None` for actions that must stay
    /// local (media handle updates).
    pub fn wire(&self) -> Option<WireAction> {
        match self {
            Action::SetLocation(location) => Some(WireAction::Location(*location)),
            Action::SetName(name) => Some(WireAction::Name(name.clone())),
            Action::SetGroup(group) => Some(WireAction::Group(group.clone())),
            Action::SetMedia(_) => None,
            Action::Sync(sync) => Some(WireAction::Sync(sync.clone())),
            Action::Discover(ids) => Some(WireAction::Discover(ids.clone())),
        }
    }
}

impl From<WireAction> for Action {
    fn from(wire: WireAction) -> Self {
        match wire {
            WireAction::Location(location) => Action::SetLocation(location),
            WireAction::Name(name) => Action::SetName(name),
            WireAction::Group(group) => Action::SetGroup(group),
            WireAction::Sync(sync) => Action::Sync(sync),
            WireAction::Discover(ids) => Action::Discover(ids),
        }
    }
}

/// Which of the two per-peer negotiations a signal belongs to. Control and
/// media run on independent transport connections and may complete out of
/// order or fail independently.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelKind {
    Control,
    Media,
}

/// Messages exchanged with the rendezvous service over its websocket.
///
/// `Id` is the first message the service sends on every session. The rest are
/// negotiation signals relayed verbatim between participants; `from` is the
/// originating participant and `description` is the transport's own encoding
/// of its offer or answer, opaque to the relay.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum SignalMessage {
    Id(Uuid),
    Offer {
        from: Uuid,
        kind: ChannelKind,
        description: String,
    },
    Answer {
        from: Uuid,
        kind: ChannelKind,
        description: String,
    },
    IceCandidate {
        from: Uuid,
        kind: ChannelKind,
        candidate: String,
    },
}

/// Client-to-service wrapper naming the participant a signal is for.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Envelope {
    pub to: Uuid,
    pub content: SignalMessage,
}
