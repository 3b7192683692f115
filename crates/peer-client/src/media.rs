//! Media session abstraction.
//!
//! A [`MediaSession`] is one peer connection as seen by the negotiator: it
//! produces and consumes session descriptions and candidates, and reports
//! path state changes as [`LinkEvent`]s. The session actor never touches
//! codecs or devices; those live behind this trait.
//!
//! Events carry the [`LinkId`] of the link that produced them. A link that
//! has been discarded may still have events in flight; the session actor
//! drops anything whose id does not match its current link.

use crate::errors::MediaError;
use async_trait::async_trait;
use common::protocol::IceServer;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::mpsc;

/// Identifies one peer link for the lifetime of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkId(pub u64);

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

/// A trickled ICE candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default)]
    pub sdp_mline_index: Option<u16>,
}

/// Payload of a relayed `signal`, tagged by `type`.
///
/// ```json
/// {"type": "offer", "sdp": "v=0..."}
/// {"type": "candidate", "candidate": "candidate:1 1 udp ...", "sdp_mid": "0", "sdp_mline_index": 0}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SignalData {
    Offer { sdp: String },
    Answer { sdp: String },
    Candidate(IceCandidate),
}

impl SignalData {
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            SignalData::Offer { .. } => "offer",
            SignalData::Answer { .. } => "answer",
            SignalData::Candidate(_) => "candidate",
        }
    }
}

impl From<SessionDescription> for SignalData {
    fn from(description: SessionDescription) -> Self {
        match description.kind {
            SdpKind::Offer => SignalData::Offer {
                sdp: description.sdp,
            },
            SdpKind::Answer => SignalData::Answer {
                sdp: description.sdp,
            },
        }
    }
}

/// Transport path state of a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PathState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl PathState {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            PathState::New => "new",
            PathState::Connecting => "connecting",
            PathState::Connected => "connected",
            PathState::Disconnected => "disconnected",
            PathState::Failed => "failed",
            PathState::Closed => "closed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        }
    }
}

/// Effect of a local media change on the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackChange {
    /// A source was added; the remote side must learn about it.
    Added,
    /// A source was removed.
    Removed,
    /// An existing source was swapped in place.
    Replaced,
    Unchanged,
}

impl TrackChange {
    #[must_use]
    pub const fn needs_renegotiation(self) -> bool {
        matches!(self, TrackChange::Added | TrackChange::Removed)
    }
}

/// Local media selection carried across links.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalMedia {
    pub audio: Option<String>,
    pub video: Option<String>,
}

impl LocalMedia {
    /// Record a selection, returning the previous one.
    pub fn set(&mut self, kind: MediaKind, source: Option<String>) -> Option<String> {
        match kind {
            MediaKind::Audio => std::mem::replace(&mut self.audio, source),
            MediaKind::Video => std::mem::replace(&mut self.video, source),
        }
    }

    /// Selected sources, audio first.
    pub fn sources(&self) -> impl Iterator<Item = (MediaKind, &str)> {
        self.audio
            .as_deref()
            .map(|s| (MediaKind::Audio, s))
            .into_iter()
            .chain(self.video.as_deref().map(|s| (MediaKind::Video, s)))
    }
}

/// Something a media session observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaEvent {
    /// A local candidate to trickle to the peer.
    LocalCandidate(IceCandidate),
    PathState(PathState),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkEvent {
    pub link: LinkId,
    pub event: MediaEvent,
}

/// One peer connection.
///
/// Every method is awaited to completion by the session actor before the
/// next one is called.
#[async_trait]
pub trait MediaSession: Send {
    async fn create_offer(&mut self, ice_restart: bool) -> Result<SessionDescription, MediaError>;

    async fn create_answer(&mut self) -> Result<SessionDescription, MediaError>;

    async fn set_local_description(
        &mut self,
        description: &SessionDescription,
    ) -> Result<(), MediaError>;

    async fn set_remote_description(
        &mut self,
        description: &SessionDescription,
    ) -> Result<(), MediaError>;

    /// Discard an unanswered local offer.
    async fn rollback(&mut self) -> Result<(), MediaError>;

    async fn add_ice_candidate(&mut self, candidate: &IceCandidate) -> Result<(), MediaError>;

    /// Attach, replace or (with `None`) detach the local source for `kind`.
    async fn set_source(
        &mut self,
        kind: MediaKind,
        source: Option<&str>,
    ) -> Result<TrackChange, MediaError>;

    async fn close(&mut self);
}

/// Creates media sessions for new links.
#[async_trait]
pub trait MediaSessionFactory: Send + Sync {
    /// `events` must receive every [`MediaEvent`] of the new session tagged
    /// with `link`.
    async fn create(
        &self,
        link: LinkId,
        ice_servers: Vec<IceServer>,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Result<Box<dyn MediaSession>, MediaError>;
}
