//! One negotiated connection to the peer.
//!
//! A `PeerLink` owns its media session, its [`NegotiationState`] and its
//! [`RecoveryState`]. Its methods perform the media calls a negotiation
//! step needs, in order and awaited, and return the signals the session
//! actor must relay. They never talk to the channel themselves.
//!
//! Dropping a link (after [`PeerLink::close`]) drops its queued candidates,
//! its deferred offer and its pending disconnected check with it.

use crate::errors::ClientError;
use crate::media::{
    IceCandidate, LinkId, MediaKind, MediaSession, PathState, SdpKind, SessionDescription,
    SignalData,
};
use crate::negotiation::{NegotiationPhase, NegotiationState, NegotiationStep, Role, Transition};
use crate::resilience::{RecoveryAction, RecoveryState};
use common::types::ConnectionId;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// Why an offer is being made.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferReason {
    /// First offer on a fresh link.
    Initial,
    /// Local media added or removed a source.
    Renegotiate,
    /// Recovery restart; sets the ICE restart flag.
    IceRestart,
}

impl OfferReason {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            OfferReason::Initial => "initial",
            OfferReason::Renegotiate => "renegotiate",
            OfferReason::IceRestart => "ice_restart",
        }
    }
}

pub struct PeerLink {
    id: LinkId,
    peer: ConnectionId,
    session: Box<dyn MediaSession>,
    negotiation: NegotiationState,
    recovery: RecoveryState,
    path: PathState,
}

impl PeerLink {
    #[must_use]
    pub fn new(
        id: LinkId,
        peer: ConnectionId,
        role: Role,
        session: Box<dyn MediaSession>,
        max_restart_attempts: u32,
        check_delay: Duration,
    ) -> Self {
        Self {
            id,
            peer,
            session,
            negotiation: NegotiationState::new(role),
            recovery: RecoveryState::new(max_restart_attempts, check_delay),
            path: PathState::New,
        }
    }

    #[must_use]
    pub fn id(&self) -> LinkId {
        self.id
    }

    #[must_use]
    pub fn peer(&self) -> ConnectionId {
        self.peer
    }

    #[must_use]
    pub fn path(&self) -> PathState {
        self.path
    }

    #[must_use]
    pub fn negotiation(&self) -> &NegotiationState {
        &self.negotiation
    }

    #[must_use]
    pub fn recovery(&self) -> &RecoveryState {
        &self.recovery
    }

    /// Make an offer, or defer it if a round is in flight.
    ///
    /// A restart is deferred only while answering; a renegotiation waits for
    /// any round to finish. Returns `None` when deferred.
    ///
    /// # Errors
    ///
    /// Returns `NegotiationFailure` or `Media` if a step fails. The round is
    /// abandoned so a later offer can proceed.
    pub async fn offer(&mut self, reason: OfferReason) -> Result<Option<SignalData>, ClientError> {
        let ice_restart = reason == OfferReason::IceRestart;
        let must_wait = match reason {
            OfferReason::IceRestart => {
                self.negotiation.phase() == NegotiationPhase::Answering
            }
            OfferReason::Initial | OfferReason::Renegotiate => self.negotiation.round_in_flight(),
        };
        if must_wait {
            debug!(
                target: "pc.link",
                link = %self.id,
                reason = reason.as_str(),
                "Round in flight, offer deferred"
            );
            self.negotiation.defer_offer(ice_restart);
            return Ok(None);
        }

        self.negotiation
            .begin_offer(ice_restart)
            .map_err(|e| ClientError::NegotiationFailure(e.to_string()))?;

        let result = async {
            let offer = self.session.create_offer(ice_restart).await?;
            self.session.set_local_description(&offer).await?;
            Ok::<_, ClientError>(offer)
        }
        .await;

        match result {
            Ok(offer) => {
                debug!(target: "pc.link", link = %self.id, reason = reason.as_str(), "Offer created");
                Ok(Some(offer.into()))
            }
            Err(e) => {
                self.negotiation.abandon_round();
                Err(e)
            }
        }
    }

    /// Apply a relayed signal from the peer; returns signals to relay back.
    ///
    /// # Errors
    ///
    /// Returns `NegotiationFailure` for an out-of-order description and
    /// `Media` if the backend rejects a step.
    pub async fn handle_signal(&mut self, data: SignalData) -> Result<Vec<SignalData>, ClientError> {
        match data {
            SignalData::Offer { sdp } => self.handle_offer(sdp).await,
            SignalData::Answer { sdp } => self.handle_answer(sdp).await,
            SignalData::Candidate(candidate) => {
                self.handle_candidate(candidate).await?;
                Ok(Vec::new())
            }
        }
    }

    async fn handle_offer(&mut self, sdp: String) -> Result<Vec<SignalData>, ClientError> {
        let transition = self
            .negotiation
            .apply(NegotiationStep::ReceiveOffer)
            .map_err(|e| ClientError::NegotiationFailure(e.to_string()))?;

        match transition {
            Transition::IgnoreOffer => {
                info!(target: "pc.link", link = %self.id, "Colliding offer ignored (impolite)");
                return Ok(Vec::new());
            }
            Transition::RollbackThenAnswer => {
                info!(target: "pc.link", link = %self.id, "Colliding offer, rolling back (polite)");
                if let Err(e) = self.session.rollback().await {
                    self.negotiation.abandon_round();
                    return Err(e.into());
                }
            }
            Transition::To(_) => {}
        }

        let result = async {
            let offer = SessionDescription {
                kind: SdpKind::Offer,
                sdp,
            };
            self.session.set_remote_description(&offer).await?;
            self.drain_candidates().await?;

            let answer = self.session.create_answer().await?;
            self.session.set_local_description(&answer).await?;
            Ok::<_, ClientError>(answer)
        }
        .await;

        let answer = match result {
            Ok(answer) => answer,
            Err(e) => {
                self.negotiation.abandon_round();
                return Err(e);
            }
        };

        self.negotiation
            .apply(NegotiationStep::SendAnswer)
            .map_err(|e| ClientError::NegotiationFailure(e.to_string()))?;

        let mut outgoing = vec![answer.into()];
        outgoing.extend(self.release_deferred_offer().await?);
        Ok(outgoing)
    }

    async fn handle_answer(&mut self, sdp: String) -> Result<Vec<SignalData>, ClientError> {
        self.negotiation
            .apply(NegotiationStep::ReceiveAnswer)
            .map_err(|e| ClientError::NegotiationFailure(e.to_string()))?;

        let answer = SessionDescription {
            kind: SdpKind::Answer,
            sdp,
        };
        let applied = async {
            self.session.set_remote_description(&answer).await?;
            self.drain_candidates().await
        }
        .await;

        if let Err(e) = applied {
            self.negotiation.abandon_round();
            return Err(e);
        }

        Ok(self.release_deferred_offer().await?.into_iter().collect())
    }

    async fn handle_candidate(&mut self, candidate: IceCandidate) -> Result<(), ClientError> {
        match self.negotiation.accept_candidate(candidate) {
            Some(candidate) => Ok(self.session.add_ice_candidate(&candidate).await?),
            None => {
                debug!(
                    target: "pc.link",
                    link = %self.id,
                    queued = self.negotiation.pending_candidates(),
                    "Candidate queued until remote description"
                );
                Ok(())
            }
        }
    }

    /// Apply queued candidates in arrival order. Each is applied at most
    /// once even if a later one fails.
    async fn drain_candidates(&mut self) -> Result<(), ClientError> {
        let queued = self.negotiation.remote_description_applied();
        let mut first_error = None;
        for candidate in &queued {
            if let Err(e) = self.session.add_ice_candidate(candidate).await {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    async fn release_deferred_offer(&mut self) -> Result<Option<SignalData>, ClientError> {
        match self.negotiation.take_deferred_offer() {
            Some(ice_restart) => {
                let reason = if ice_restart {
                    OfferReason::IceRestart
                } else {
                    OfferReason::Renegotiate
                };
                self.offer(reason).await
            }
            None => Ok(None),
        }
    }

    /// Apply a local media selection; returns an offer if the change needs
    /// renegotiation and no round is in flight.
    ///
    /// # Errors
    ///
    /// Returns `Media` if the backend rejects the track change.
    pub async fn set_source(
        &mut self,
        kind: MediaKind,
        source: Option<&str>,
    ) -> Result<Option<SignalData>, ClientError> {
        let change = self.session.set_source(kind, source).await?;
        debug!(
            target: "pc.link",
            link = %self.id,
            kind = kind.as_str(),
            change = ?change,
            "Local media changed"
        );
        if !change.needs_renegotiation() {
            return Ok(None);
        }
        if self.negotiation.phase() == NegotiationPhase::Idle {
            // Nothing negotiated yet; offer once the first round completes
            self.negotiation.defer_offer(false);
            return Ok(None);
        }
        self.offer(OfferReason::Renegotiate).await
    }

    pub async fn add_local_source(&mut self, kind: MediaKind, source: &str) -> Result<(), ClientError> {
        self.session.set_source(kind, Some(source)).await?;
        Ok(())
    }

    /// Record a path state change and decide on recovery.
    pub fn on_path_state(&mut self, state: PathState, now: Instant) -> RecoveryAction {
        self.path = state;
        self.recovery.on_path_state(state, now)
    }

    /// The disconnected check fired.
    pub fn on_check_due(&mut self) -> RecoveryAction {
        self.recovery.on_check_due(self.path)
    }

    pub fn on_negotiation_failure(&mut self, reason: &str) -> RecoveryAction {
        self.recovery.on_negotiation_failure(reason)
    }

    /// Close the media session. The link must be dropped afterwards.
    pub async fn close(&mut self) {
        self.path = PathState::Closed;
        self.session.close().await;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::testing::{MediaCall, MockMediaSession};

    fn link(role: Role) -> (PeerLink, MockMediaSession) {
        let session = MockMediaSession::new(LinkId(1));
        let handle = session.clone();
        let link = PeerLink::new(
            LinkId(1),
            ConnectionId::new(),
            role,
            Box::new(session),
            3,
            Duration::from_millis(1500),
        );
        (link, handle)
    }

    fn candidate(n: u32) -> IceCandidate {
        IceCandidate {
            candidate: format!("candidate:{n}"),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        }
    }

    fn offer(sdp: &str) -> SignalData {
        SignalData::Offer {
            sdp: sdp.to_string(),
        }
    }

    fn answer(sdp: &str) -> SignalData {
        SignalData::Answer {
            sdp: sdp.to_string(),
        }
    }

    #[tokio::test]
    async fn test_offer_awaits_local_description_before_returning() {
        let (mut link, media) = link(Role::Impolite);

        let signal = link.offer(OfferReason::Initial).await.unwrap();
        assert!(matches!(signal, Some(SignalData::Offer { .. })));
        assert_eq!(
            media.calls(),
            vec![
                MediaCall::CreateOffer { ice_restart: false },
                MediaCall::SetLocal(SdpKind::Offer),
            ]
        );
        assert_eq!(link.negotiation().phase(), NegotiationPhase::Offering);
    }

    #[tokio::test]
    async fn test_answerer_drains_queued_candidates_in_order() {
        let (mut link, media) = link(Role::Polite);

        for n in 1..=3 {
            assert!(link
                .handle_signal(SignalData::Candidate(candidate(n)))
                .await
                .unwrap()
                .is_empty());
        }
        assert!(media.calls().is_empty());

        let out = link.handle_signal(offer("remote-offer")).await.unwrap();
        assert!(matches!(out.as_slice(), [SignalData::Answer { .. }]));

        assert_eq!(
            media.calls(),
            vec![
                MediaCall::SetRemote(SdpKind::Offer),
                MediaCall::AddCandidate("candidate:1".to_string()),
                MediaCall::AddCandidate("candidate:2".to_string()),
                MediaCall::AddCandidate("candidate:3".to_string()),
                MediaCall::CreateAnswer,
                MediaCall::SetLocal(SdpKind::Answer),
            ]
        );
        assert_eq!(link.negotiation().phase(), NegotiationPhase::Negotiated);

        // Late candidate applies directly
        link.handle_signal(SignalData::Candidate(candidate(4)))
            .await
            .unwrap();
        assert_eq!(
            media.calls().last(),
            Some(&MediaCall::AddCandidate("candidate:4".to_string()))
        );
    }

    #[tokio::test]
    async fn test_offerer_drains_candidates_after_answer() {
        let (mut link, media) = link(Role::Impolite);
        link.offer(OfferReason::Initial).await.unwrap();
        link.handle_signal(SignalData::Candidate(candidate(1)))
            .await
            .unwrap();

        let out = link.handle_signal(answer("remote-answer")).await.unwrap();
        assert!(out.is_empty());

        let after_offer: Vec<_> = media.calls().into_iter().skip(2).collect();
        assert_eq!(
            after_offer,
            vec![
                MediaCall::SetRemote(SdpKind::Answer),
                MediaCall::AddCandidate("candidate:1".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_unexpected_answer_is_negotiation_failure() {
        let (mut link, _media) = link(Role::Polite);
        let err = link.handle_signal(answer("stray")).await.unwrap_err();
        assert!(matches!(err, ClientError::NegotiationFailure(_)));
        assert_eq!(link.negotiation().phase(), NegotiationPhase::Idle);
    }

    #[tokio::test]
    async fn test_polite_link_rolls_back_on_glare() {
        let (mut link, media) = link(Role::Polite);
        link.handle_signal(offer("o1")).await.unwrap();

        media.set_next_change(crate::media::TrackChange::Added);
        let out = link
            .set_source(MediaKind::Video, Some("cam-1"))
            .await
            .unwrap();
        assert!(matches!(out, Some(SignalData::Offer { .. })));

        // Colliding remote offer: roll back, answer, then re-offer the new source
        let out = link.handle_signal(offer("o2")).await.unwrap();
        assert!(matches!(
            out.as_slice(),
            [SignalData::Answer { .. }, SignalData::Offer { .. }]
        ));
        assert!(media.calls().contains(&MediaCall::Rollback));
        assert_eq!(link.negotiation().phase(), NegotiationPhase::Offering);
        assert!(!link.negotiation().has_deferred_offer());
    }

    #[tokio::test]
    async fn test_rolled_back_restart_keeps_ice_restart_flag() {
        let (mut link, media) = link(Role::Polite);
        link.handle_signal(offer("o1")).await.unwrap();
        link.offer(OfferReason::IceRestart).await.unwrap();

        let out = link.handle_signal(offer("o2")).await.unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(
            media.calls().last(),
            Some(&MediaCall::SetLocal(SdpKind::Offer))
        );
        let restarts = media
            .calls()
            .iter()
            .filter(|c| **c == MediaCall::CreateOffer { ice_restart: true })
            .count();
        assert_eq!(restarts, 2);
    }

    #[tokio::test]
    async fn test_impolite_link_ignores_glare() {
        let (mut link, media) = link(Role::Impolite);
        link.offer(OfferReason::Initial).await.unwrap();
        let before = media.calls().len();

        let out = link.handle_signal(offer("their-offer")).await.unwrap();
        assert!(out.is_empty());
        assert_eq!(media.calls().len(), before);
        assert_eq!(link.negotiation().phase(), NegotiationPhase::Offering);
    }

    #[tokio::test]
    async fn test_renegotiation_deferred_until_answer() {
        let (mut link, media) = link(Role::Impolite);
        link.offer(OfferReason::Initial).await.unwrap();

        media.set_next_change(crate::media::TrackChange::Added);
        let out = link
            .set_source(MediaKind::Video, Some("cam-1"))
            .await
            .unwrap();
        assert!(out.is_none());
        assert!(link.negotiation().has_deferred_offer());

        // Answer completes the round and releases the deferred offer
        let out = link.handle_signal(answer("a1")).await.unwrap();
        assert!(matches!(out.as_slice(), [SignalData::Offer { .. }]));
        assert_eq!(link.negotiation().phase(), NegotiationPhase::Offering);
    }

    #[tokio::test]
    async fn test_replacing_source_does_not_renegotiate() {
        let (mut link, media) = link(Role::Impolite);
        link.offer(OfferReason::Initial).await.unwrap();
        link.handle_signal(answer("a1")).await.unwrap();

        media.set_next_change(crate::media::TrackChange::Replaced);
        let out = link
            .set_source(MediaKind::Audio, Some("mic-2"))
            .await
            .unwrap();
        assert!(out.is_none());
        assert!(!link.negotiation().has_deferred_offer());
    }

    #[tokio::test]
    async fn test_ice_restart_sets_flag() {
        let (mut link, media) = link(Role::Impolite);
        link.offer(OfferReason::Initial).await.unwrap();
        link.handle_signal(answer("a1")).await.unwrap();

        link.offer(OfferReason::IceRestart).await.unwrap();
        assert!(media
            .calls()
            .contains(&MediaCall::CreateOffer { ice_restart: true }));
    }

    #[tokio::test]
    async fn test_failed_offer_abandons_round() {
        let (mut link, media) = link(Role::Impolite);
        media.fail_next("create_offer");

        let err = link.offer(OfferReason::Initial).await.unwrap_err();
        assert!(matches!(err, ClientError::Media(_)));
        assert_eq!(link.negotiation().phase(), NegotiationPhase::Idle);

        // A retry can proceed
        assert!(link.offer(OfferReason::IceRestart).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_close_marks_path_closed() {
        let (mut link, media) = link(Role::Impolite);
        link.close().await;
        assert_eq!(link.path(), PathState::Closed);
        assert!(media.calls().contains(&MediaCall::Close));
    }
}
