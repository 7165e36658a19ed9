use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::session::MediaHandle;

/// A position in the shared presence plane.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub x: f64,
    pub y: f64,
}

impl Location {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// One participant's continuously-updated shared state.
///
/// Every participant owns a local copy and mirrors one copy per remote peer.
/// Copies are never shared by reference; all mutation goes through [`reduce`],
/// so a snapshot handed to an observer can never alias a live copy.
#[derive(Clone, Debug, Default)]
pub struct ParticipantState {
    pub name: String,
    pub location: Location,
    pub media: Option<MediaHandle>,
    pub group: Option<String>,
}

impl PartialEq for ParticipantState {
    fn eq(&self, other: &Self) -> bool {
        let media = match (&self.media, &other.media) {
            (None, None) => true,
            (Some(a), Some(b)) => a.same(b),
            _ => false,
        };
        self.name == other.name
            && self.location == other.location
            && self.group == other.group
            && media
    }
}

/// Partial-state payload of [`Action::Sync`].
///
/// Only fields that are present are merged. `group` is doubly optional so a
/// cleared group can still be asserted by a resync (`"group": null` on the
/// wire) while an absent field leaves the target untouched.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StateSync {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<Option<String>>,
}

impl StateSync {
    /// Full snapshot of `state`, minus the media handle. The media handle is
    /// a local capability reference and never crosses the control channel.
    pub fn of(state: &ParticipantState) -> Self {
        Self {
            name: Some(state.name.clone()),
            location: Some(state.location),
            group: Some(state.group.clone()),
        }
    }
}

/// The shared action vocabulary between local and remote state.
///
/// `Sync` and `Discover` are control actions: `Sync` shallow-merges a partial
/// snapshot, `Discover` is consumed by the manager's discovery logic and is a
/// no-op for the reducer.
#[derive(Clone, Debug)]
pub enum Action {
    SetLocation(Location),
    SetName(String),
    SetGroup(Option<String>),
    SetMedia(Option<MediaHandle>),
    Sync(StateSync),
    Discover(Vec<Uuid>),
}

/// Applies `action` to `state` and returns the next state.
///
/// Pure and total: no action is rejected, control actions leave the state
/// unchanged, and re-applying the same `Sync` is idempotent.
pub fn reduce(state: &ParticipantState, action: &Action) -> ParticipantState {
    let mut next = state.clone();
    match action {
        Action::SetLocation(location) => next.location = *location,
        Action::SetName(name) => next.name = name.clone(),
        Action::SetGroup(group) => next.group = group.clone(),
        Action::SetMedia(media) => next.media = media.clone(),
        Action::Sync(sync) => {
            if let Some(name) = &sync.name {
                next.name = name.clone();
            }
            if let Some(location) = sync.location {
                next.location = location;
            }
            if let Some(group) = &sync.group {
                next.group = group.clone();
            }
        }
        Action::Discover(_) => {}
    }
    next
}
