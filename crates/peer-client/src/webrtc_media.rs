//! webrtc-rs implementation of the media traits.
//!
//! One `RTCPeerConnection` per link. Local sources become
//! `TrackLocalStaticSample` tracks; the application feeds samples through
//! [`WebRtcMediaSession::local_track`]. Device capture is out of scope here.

use crate::errors::MediaError;
use crate::media::{
    IceCandidate, LinkEvent, LinkId, MediaEvent, MediaKind, MediaSession, MediaSessionFactory,
    PathState, SdpKind, SessionDescription, TrackChange,
};
use async_trait::async_trait;
use common::protocol::IceServer;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

const STREAM_ID: &str = "peer-client";

fn backend(e: &webrtc::Error) -> MediaError {
    MediaError::Backend(e.to_string())
}

/// Builds one peer connection per link from a shared webrtc API.
pub struct WebRtcMediaFactory {
    api: API,
}

impl WebRtcMediaFactory {
    /// Default codecs and interceptors.
    ///
    /// # Errors
    ///
    /// Returns `MediaError::Backend` if codec registration fails.
    pub fn new() -> Result<Self, MediaError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| backend(&e))?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|e| backend(&e))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();
        Ok(Self { api })
    }
}

fn rtc_ice_servers(servers: Vec<IceServer>) -> Vec<RTCIceServer> {
    servers
        .into_iter()
        .map(|server| RTCIceServer {
            urls: server.urls,
            username: server.username.unwrap_or_default(),
            credential: server.credential.unwrap_or_default(),
            ..Default::default()
        })
        .collect()
}

fn path_state(state: RTCPeerConnectionState) -> Option<PathState> {
    match state {
        RTCPeerConnectionState::New => Some(PathState::New),
        RTCPeerConnectionState::Connecting => Some(PathState::Connecting),
        RTCPeerConnectionState::Connected => Some(PathState::Connected),
        RTCPeerConnectionState::Disconnected => Some(PathState::Disconnected),
        RTCPeerConnectionState::Failed => Some(PathState::Failed),
        RTCPeerConnectionState::Closed => Some(PathState::Closed),
        RTCPeerConnectionState::Unspecified => None,
    }
}

#[async_trait]
impl MediaSessionFactory for WebRtcMediaFactory {
    async fn create(
        &self,
        link: LinkId,
        ice_servers: Vec<IceServer>,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Result<Box<dyn MediaSession>, MediaError> {
        let config = RTCConfiguration {
            ice_servers: rtc_ice_servers(ice_servers),
            ..Default::default()
        };
        let pc = Arc::new(
            self.api
                .new_peer_connection(config)
                .await
                .map_err(|e| backend(&e))?,
        );

        let candidate_events = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let events = candidate_events.clone();
            Box::pin(async move {
                // None marks the end of gathering
                let Some(candidate) = candidate else { return };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = events.send(LinkEvent {
                            link,
                            event: MediaEvent::LocalCandidate(IceCandidate {
                                candidate: init.candidate,
                                sdp_mid: init.sdp_mid,
                                sdp_mline_index: init.sdp_mline_index,
                            }),
                        });
                    }
                    Err(e) => {
                        debug!(target: "pc.media", link = %link, error = %e, "Candidate not serializable");
                    }
                }
            })
        }));

        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let events = events.clone();
            Box::pin(async move {
                if let Some(path) = path_state(state) {
                    let _ = events.send(LinkEvent {
                        link,
                        event: MediaEvent::PathState(path),
                    });
                }
            })
        }));

        Ok(Box::new(WebRtcMediaSession {
            link,
            pc,
            tracks: HashMap::new(),
        }))
    }
}

struct LocalTrack {
    source: String,
    track: Arc<TrackLocalStaticSample>,
    sender: Arc<RTCRtpSender>,
}

pub struct WebRtcMediaSession {
    link: LinkId,
    pc: Arc<RTCPeerConnection>,
    tracks: HashMap<MediaKind, LocalTrack>,
}

impl WebRtcMediaSession {
    /// Track to write samples into for `kind`, if a source is selected.
    #[must_use]
    pub fn local_track(&self, kind: MediaKind) -> Option<Arc<TrackLocalStaticSample>> {
        self.tracks.get(&kind).map(|t| Arc::clone(&t.track))
    }

    fn new_track(kind: MediaKind, source: &str) -> Arc<TrackLocalStaticSample> {
        let mime_type = match kind {
            MediaKind::Audio => MIME_TYPE_OPUS,
            MediaKind::Video => MIME_TYPE_VP8,
        };
        Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: mime_type.to_owned(),
                ..Default::default()
            },
            source.to_owned(),
            STREAM_ID.to_owned(),
        ))
    }

    fn rtc_description(description: &SessionDescription) -> Result<RTCSessionDescription, MediaError> {
        let result = match description.kind {
            SdpKind::Offer => RTCSessionDescription::offer(description.sdp.clone()),
            SdpKind::Answer => RTCSessionDescription::answer(description.sdp.clone()),
        };
        result.map_err(|e| MediaError::Description(e.to_string()))
    }
}

#[async_trait]
impl MediaSession for WebRtcMediaSession {
    async fn create_offer(&mut self, ice_restart: bool) -> Result<SessionDescription, MediaError> {
        let options = RTCOfferOptions {
            ice_restart,
            ..Default::default()
        };
        let offer = self
            .pc
            .create_offer(Some(options))
            .await
            .map_err(|e| MediaError::Description(e.to_string()))?;
        Ok(SessionDescription {
            kind: SdpKind::Offer,
            sdp: offer.sdp,
        })
    }

    async fn create_answer(&mut self) -> Result<SessionDescription, MediaError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| MediaError::Description(e.to_string()))?;
        Ok(SessionDescription {
            kind: SdpKind::Answer,
            sdp: answer.sdp,
        })
    }

    async fn set_local_description(
        &mut self,
        description: &SessionDescription,
    ) -> Result<(), MediaError> {
        let description = Self::rtc_description(description)?;
        self.pc
            .set_local_description(description)
            .await
            .map_err(|e| MediaError::Description(e.to_string()))
    }

    async fn set_remote_description(
        &mut self,
        description: &SessionDescription,
    ) -> Result<(), MediaError> {
        let description = Self::rtc_description(description)?;
        self.pc
            .set_remote_description(description)
            .await
            .map_err(|e| MediaError::Description(e.to_string()))
    }

    async fn rollback(&mut self) -> Result<(), MediaError> {
        let mut description = RTCSessionDescription::default();
        description.sdp_type = RTCSdpType::Rollback;
        self.pc
            .set_local_description(description)
            .await
            .map_err(|e| MediaError::Description(e.to_string()))
    }

    async fn add_ice_candidate(&mut self, candidate: &IceCandidate) -> Result<(), MediaError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate.clone(),
            sdp_mid: candidate.sdp_mid.clone(),
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: None,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| MediaError::Candidate(e.to_string()))
    }

    async fn set_source(
        &mut self,
        kind: MediaKind,
        source: Option<&str>,
    ) -> Result<TrackChange, MediaError> {
        let track_error = |e: webrtc::Error| MediaError::Track(e.to_string());

        let current = self.tracks.get(&kind).map(|t| t.source.clone());

        match (current.as_deref(), source) {
            (None, None) => Ok(TrackChange::Unchanged),
            (Some(current), Some(source)) if current == source => Ok(TrackChange::Unchanged),
            (Some(_), Some(source)) => {
                let Some(local) = self.tracks.get_mut(&kind) else {
                    return Ok(TrackChange::Unchanged);
                };
                // Same transceiver, new track: no renegotiation
                let track = Self::new_track(kind, source);
                local
                    .sender
                    .replace_track(Some(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>))
                    .await
                    .map_err(track_error)?;
                local.track = track;
                local.source = source.to_owned();
                Ok(TrackChange::Replaced)
            }
            (None, Some(source)) => {
                let track = Self::new_track(kind, source);
                let sender = self
                    .pc
                    .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
                    .await
                    .map_err(track_error)?;
                debug!(target: "pc.media", link = %self.link, kind = kind.as_str(), "Track added");
                self.tracks.insert(
                    kind,
                    LocalTrack {
                        source: source.to_owned(),
                        track,
                        sender,
                    },
                );
                Ok(TrackChange::Added)
            }
            (Some(_), None) => {
                if let Some(removed) = self.tracks.remove(&kind) {
                    self.pc
                        .remove_track(&removed.sender)
                        .await
                        .map_err(track_error)?;
                }
                Ok(TrackChange::Removed)
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.pc.close().await {
            debug!(target: "pc.media", link = %self.link, error = %e, "Peer connection close failed");
        }
        self.tracks.clear();
    }
}
