//! Offer/answer state for one link.
//!
//! The transition table is a pure function so every legal and illegal move
//! can be tested without a media backend:
//!
//! | From                        | Step          | To                          |
//! |-----------------------------|---------------|-----------------------------|
//! | Idle, Offering, Negotiated  | SendOffer     | Offering                    |
//! | Idle, Negotiated            | ReceiveOffer  | Answering                   |
//! | Offering (polite)           | ReceiveOffer  | Answering, after rollback   |
//! | Offering (impolite)         | ReceiveOffer  | Offering, offer ignored     |
//! | Answering                   | SendAnswer    | Negotiated                  |
//! | Offering                    | ReceiveAnswer | Negotiated                  |
//!
//! Anything else is an [`InvalidTransition`].
//!
//! Candidates that arrive before the first remote description are queued
//! and handed back exactly once, in arrival order, when it is applied.
//!
//! A local offer rolled back on the polite side is not lost: it becomes a
//! deferred offer, released once the remote round reaches `Negotiated`.

use crate::media::IceCandidate;
use std::collections::VecDeque;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationPhase {
    Idle,
    /// Local offer sent, waiting for the answer.
    Offering,
    /// Remote offer applied, answer not yet sent.
    Answering,
    Negotiated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationStep {
    SendOffer,
    ReceiveOffer,
    SendAnswer,
    ReceiveAnswer,
}

/// Which side yields when both offer at once.
///
/// The side that creates the link on `peer-joined` is impolite; the side
/// that opens a link for an unsolicited offer is polite.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Polite,
    Impolite,
}

impl Role {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Role::Polite => "polite",
            Role::Impolite => "impolite",
        }
    }
}

/// Result of a legal step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    To(NegotiationPhase),
    /// Roll back the local offer, then continue in `Answering`.
    RollbackThenAnswer,
    /// Colliding offer on the impolite side; drop it.
    IgnoreOffer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid negotiation step {step:?} in phase {phase:?}")]
pub struct InvalidTransition {
    pub phase: NegotiationPhase,
    pub step: NegotiationStep,
}

/// Look up a step in the transition table.
///
/// # Errors
///
/// Returns `InvalidTransition` for any pair not in the table.
pub fn transition(
    phase: NegotiationPhase,
    step: NegotiationStep,
    role: Role,
) -> Result<Transition, InvalidTransition> {
    use NegotiationPhase::{Answering, Idle, Negotiated, Offering};
    use NegotiationStep::{ReceiveAnswer, ReceiveOffer, SendAnswer, SendOffer};

    match (phase, step) {
        (Idle | Offering | Negotiated, SendOffer) => Ok(Transition::To(Offering)),
        (Idle | Negotiated, ReceiveOffer) => Ok(Transition::To(Answering)),
        (Offering, ReceiveOffer) => match role {
            Role::Polite => Ok(Transition::RollbackThenAnswer),
            Role::Impolite => Ok(Transition::IgnoreOffer),
        },
        (Answering, SendAnswer) | (Offering, ReceiveAnswer) => Ok(Transition::To(Negotiated)),
        _ => Err(InvalidTransition { phase, step }),
    }
}

/// Negotiation bookkeeping for one link.
#[derive(Debug)]
pub struct NegotiationState {
    phase: NegotiationPhase,
    role: Role,
    remote_description_set: bool,
    pending_candidates: VecDeque<IceCandidate>,
    /// Offer requested while a round was in flight.
    deferred_offer: Option<bool>,
    /// ICE-restart flag of the local offer awaiting an answer.
    offer_in_flight: Option<bool>,
    negotiated_once: bool,
}

impl NegotiationState {
    #[must_use]
    pub fn new(role: Role) -> Self {
        Self {
            phase: NegotiationPhase::Idle,
            role,
            remote_description_set: false,
            pending_candidates: VecDeque::new(),
            deferred_offer: None,
            offer_in_flight: None,
            negotiated_once: false,
        }
    }

    #[must_use]
    pub fn phase(&self) -> NegotiationPhase {
        self.phase
    }

    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    #[must_use]
    pub fn remote_description_set(&self) -> bool {
        self.remote_description_set
    }

    #[must_use]
    pub fn pending_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    /// An offer/answer round is in flight.
    #[must_use]
    pub fn round_in_flight(&self) -> bool {
        matches!(
            self.phase,
            NegotiationPhase::Offering | NegotiationPhase::Answering
        )
    }

    /// Apply a step, moving to the phase the table names.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransition` and leaves the phase unchanged if the step
    /// is not legal here.
    pub fn apply(&mut self, step: NegotiationStep) -> Result<Transition, InvalidTransition> {
        let outcome = transition(self.phase, step, self.role)?;
        match outcome {
            Transition::To(next) => {
                self.phase = next;
                if next == NegotiationPhase::Negotiated {
                    self.offer_in_flight = None;
                }
            }
            Transition::RollbackThenAnswer => {
                self.phase = NegotiationPhase::Answering;
                if let Some(ice_restart) = self.offer_in_flight.take() {
                    self.defer_offer(ice_restart);
                }
            }
            Transition::IgnoreOffer => {}
        }
        if self.phase == NegotiationPhase::Negotiated {
            self.negotiated_once = true;
        }
        Ok(outcome)
    }

    /// Apply `SendOffer` and remember why the offer was made, so a polite
    /// rollback can re-offer after answering.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransition` if an offer cannot be sent here.
    pub fn begin_offer(&mut self, ice_restart: bool) -> Result<Transition, InvalidTransition> {
        let outcome = self.apply(NegotiationStep::SendOffer)?;
        self.offer_in_flight = Some(ice_restart);
        Ok(outcome)
    }

    /// Queue a remote candidate, or hand it back if it can be applied now.
    pub fn accept_candidate(&mut self, candidate: IceCandidate) -> Option<IceCandidate> {
        if self.remote_description_set {
            Some(candidate)
        } else {
            self.pending_candidates.push_back(candidate);
            None
        }
    }

    /// Record that a remote description was applied; returns the queued
    /// candidates in arrival order. The queue is empty afterwards.
    pub fn remote_description_applied(&mut self) -> Vec<IceCandidate> {
        self.remote_description_set = true;
        self.pending_candidates.drain(..).collect()
    }

    /// Remember that an offer is wanted once the current round completes.
    /// An ICE restart request is sticky across merges.
    pub fn defer_offer(&mut self, ice_restart: bool) {
        let sticky = self.deferred_offer.unwrap_or(false);
        self.deferred_offer = Some(sticky || ice_restart);
    }

    /// Take the deferred offer if the link is back in `Negotiated`.
    pub fn take_deferred_offer(&mut self) -> Option<bool> {
        if self.phase == NegotiationPhase::Negotiated {
            self.deferred_offer.take()
        } else {
            None
        }
    }

    #[must_use]
    pub fn has_deferred_offer(&self) -> bool {
        self.deferred_offer.is_some()
    }

    /// Abandon a failed round so the link can offer again.
    ///
    /// Returns to `Negotiated` if a round ever completed, otherwise `Idle`.
    pub fn abandon_round(&mut self) {
        self.offer_in_flight = None;
        self.phase = if self.negotiated_once {
            NegotiationPhase::Negotiated
        } else {
            NegotiationPhase::Idle
        };
    }
}
