//! Proof Acquisition Flow
//!
//! Drives one participant from "authorised with the fitness platform" to "proof
//! accepted on-chain":
//!
//! ```text
//! Loading ──► Selecting ──► Generating ──► Submitted
//!    │            │              │
//!    │            │              └──► Failed ──restart──► Loading
//!    ├──► NoQualifyingActivities
//!    └──► AlreadySubmitted
//! ```
//!
//! Failures from the fitness platform, prover or chain collapse into one
//! generic message; details go to the log.

use std::sync::Arc;

use alloy_primitives::TxHash;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{error, info, instrument, warn};

use crate::core::time::UnixSeconds;
use crate::network::escrow::WagerClient;
use crate::network::prover::{generate_proof, ProofService};
use crate::network::strava::{AccessToken, FitnessApi};
use crate::wager::activity::{lookback_start, ActivityRecord, ActivitySelection, INTERACTIVE_LOOKBACK_DAYS};
use crate::wager::events::{FlowStage, WagerEvent};
use crate::wager::state::{Participant, ParticipantError, Wager, WagerId};

/// Shown when activities cannot be listed.
pub const LOAD_FAILED_MESSAGE: &str = "Failed to load Strava activities";

/// Shown for any generation or submission failure.
pub const PROOF_FAILED_MESSAGE: &str = "Failed to generate or submit proof";

/// Shown when the participant has no stake.
pub const NOT_STAKED_MESSAGE: &str = "Place a stake before proving a workout";

/// Shown once the wager no longer accepts proofs.
pub const CLOSED_MESSAGE: &str = "This wager is no longer accepting proofs";

/// Flow state.
#[derive(Clone, Debug, PartialEq)]
pub enum FlowState {
    /// Reading the wager and listing activities.
    Loading,
    /// Qualifying activities awaiting a choice.
    Selecting(Vec<ActivityRecord>),
    /// Nothing in the window meets the target. Terminal.
    NoQualifyingActivities,
    /// Proof generation and submission running.
    Generating {
        /// Selected activity.
        activity_id: u64,
    },
    /// Proof accepted on-chain. Terminal.
    Submitted {
        /// Submission transaction.
        tx: TxHash,
        /// Whole meters submitted.
        claimed_distance: u64,
    },
    /// A proof was already recorded for this participant. Terminal.
    AlreadySubmitted,
    /// Failed; `restart` returns to `Loading`.
    Failed {
        /// User-facing message.
        message: String,
    },
}

impl FlowState {
    /// Broadcast form, without activity data.
    pub fn stage(&self) -> FlowStage {
        match self {
            FlowState::Loading => FlowStage::Loading,
            FlowState::Selecting(list) => FlowStage::Selecting { count: list.len() },
            FlowState::NoQualifyingActivities => FlowStage::NoQualifyingActivities,
            FlowState::Generating { activity_id } => FlowStage::Generating {
                activity_id: *activity_id,
            },
            FlowState::Submitted { tx, claimed_distance } => FlowStage::Submitted {
                tx: *tx,
                claimed_distance: *claimed_distance,
            },
            FlowState::AlreadySubmitted => FlowStage::AlreadySubmitted,
            FlowState::Failed { message } => FlowStage::Failed {
                message: message.clone(),
            },
        }
    }

    /// No further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            FlowState::NoQualifyingActivities | FlowState::Submitted { .. } | FlowState::AlreadySubmitted
        )
    }
}

/// Flow errors. These are caller mistakes; remote failures become `Failed`.
#[derive(Debug, Error)]
pub enum FlowError {
    /// `select_activity` outside `Selecting`.
    #[error("no activity selection in progress")]
    NotSelecting,
    /// Activity is not in the qualifying list.
    #[error("activity {0} is not a qualifying choice")]
    UnknownActivity(u64),
    /// Participant transition refused (deadline, inactive wager).
    #[error(transparent)]
    Participant(#[from] ParticipantError),
    /// `restart` outside `Failed`.
    #[error("flow can only restart after a failure")]
    NotFailed,
}

/// Collaborators shared by every flow.
#[derive(Clone)]
pub struct FlowContext {
    /// Fitness platform.
    pub fitness: Arc<dyn FitnessApi>,
    /// Remote prover.
    pub prover: Arc<dyn ProofService>,
    /// Escrow client.
    pub wagers: Arc<WagerClient>,
}

/// One participant's proof flow for one wager.
pub struct ProofFlow {
    ctx: FlowContext,
    wager_id: WagerId,
    token: AccessToken,
    participant: Participant,
    wager: Option<Wager>,
    state: FlowState,
    lookback_days: u64,
    events: Option<broadcast::Sender<WagerEvent>>,
}

impl ProofFlow {
    /// Create a flow in `Loading`.
    pub fn new(ctx: FlowContext, wager_id: WagerId, participant: Participant, token: AccessToken) -> Self {
        Self {
            ctx,
            wager_id,
            token,
            participant,
            wager: None,
            state: FlowState::Loading,
            lookback_days: INTERACTIVE_LOOKBACK_DAYS,
            events: None,
        }
    }

    /// Override the listing window.
    pub fn with_lookback_days(mut self, days: u64) -> Self {
        self.lookback_days = days;
        self
    }

    /// Publish stage changes to `events`.
    pub fn with_events(mut self, events: broadcast::Sender<WagerEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Current state.
    pub fn state(&self) -> &FlowState {
        &self.state
    }

    /// Participant as last observed.
    pub fn participant(&self) -> &Participant {
        &self.participant
    }

    /// Wager as last read.
    pub fn wager(&self) -> Option<&Wager> {
        self.wager.as_ref()
    }

    /// Wager this flow targets.
    pub fn wager_id(&self) -> WagerId {
        self.wager_id
    }

    fn transition(&mut self, state: FlowState) {
        self.state = state;
        if let Some(events) = &self.events {
            let _ = events.send(WagerEvent::FlowChanged {
                wager_id: self.wager_id,
                address: self.participant.address,
                stage: self.state.stage(),
            });
        }
    }

    fn fail(&mut self, message: &str) {
        self.transition(FlowState::Failed {
            message: message.to_string(),
        });
    }

    /// Read the wager, derive the participant state, list and filter activities.
    #[instrument(skip(self), fields(wager_id = %self.wager_id, address = %self.participant.address))]
    pub async fn load_activities(&mut self, now: UnixSeconds) -> &FlowState {
        self.transition(FlowState::Loading);

        let wager = match self.ctx.wagers.wager_details(self.wager_id).await {
            Ok(wager) => wager,
            Err(e) => {
                error!("Failed to read wager: {}", e);
                self.fail(LOAD_FAILED_MESSAGE);
                return &self.state;
            }
        };

        let has_proof = match self.ctx.wagers.has_proof(self.wager_id, self.participant.address).await {
            Ok(has_proof) => has_proof,
            Err(e) => {
                error!("Failed to read proof status: {}", e);
                self.fail(LOAD_FAILED_MESSAGE);
                return &self.state;
            }
        };

        self.participant = Participant::from_chain(
            self.participant.address,
            self.participant.handle.take(),
            &wager,
            has_proof,
        );
        let min_distance = wager.target_distance();
        let accepts_proofs = wager.accepts_proofs(now);
        self.wager = Some(wager);

        if self.participant.has_proved() {
            self.transition(FlowState::AlreadySubmitted);
            return &self.state;
        }
        if !self.participant.has_staked() {
            self.fail(NOT_STAKED_MESSAGE);
            return &self.state;
        }
        if !accepts_proofs {
            self.fail(CLOSED_MESSAGE);
            return &self.state;
        }

        let after = lookback_start(now, self.lookback_days);
        let activities = match self.ctx.fitness.list_activities(&self.token, Some(after)).await {
            Ok(activities) => activities,
            Err(e) => {
                error!("Error fetching Strava activities: {}", e);
                self.fail(LOAD_FAILED_MESSAGE);
                return &self.state;
            }
        };

        match ActivitySelection::from_activities(&activities, min_distance) {
            ActivitySelection::Empty => {
                info!(fetched = activities.len(), "No qualifying activities");
                self.transition(FlowState::NoQualifyingActivities);
            }
            ActivitySelection::Choices(choices) => {
                info!(fetched = activities.len(), qualifying = choices.len(), "Activities loaded");
                self.transition(FlowState::Selecting(choices));
            }
        }
        &self.state
    }

    /// Prove and submit the chosen activity.
    ///
    /// Only valid from `Selecting` with an activity from the list. The deadline
    /// is checked before any prover call.
    #[instrument(skip(self), fields(wager_id = %self.wager_id, address = %self.participant.address))]
    pub async fn select_activity(&mut self, activity_id: u64, now: UnixSeconds) -> Result<&FlowState, FlowError> {
        let FlowState::Selecting(choices) = &self.state else {
            return Err(FlowError::NotSelecting);
        };
        if !choices.iter().any(|a| a.id == activity_id) {
            return Err(FlowError::UnknownActivity(activity_id));
        }
        let wager = self.wager.clone().ok_or(FlowError::NotSelecting)?;

        if let Err(e) = self.participant.begin_proof(&wager, now) {
            warn!("Proof refused: {}", e);
            let message = match e {
                ParticipantError::DeadlinePassed { .. } | ParticipantError::WagerInactive => CLOSED_MESSAGE,
                ParticipantError::InvalidTransition { .. } => PROOF_FAILED_MESSAGE,
            };
            self.fail(message);
            return Err(e.into());
        }
        self.transition(FlowState::Generating { activity_id });

        let outcome = async {
            let artifact = generate_proof(
                self.ctx.fitness.as_ref(),
                self.ctx.prover.as_ref(),
                &self.token,
                activity_id,
            )
            .await
            .map_err(|e| e.to_string())?;
            let tx = self
                .ctx
                .wagers
                .submit_proof(self.participant.address, self.wager_id, &artifact)
                .await
                .map_err(|e| e.to_string())?;
            Ok::<_, String>((tx, artifact.claimed_distance()))
        }
        .await;

        match outcome {
            Ok((tx, claimed_distance)) => {
                self.participant.confirm_proof(tx)?;
                info!(tx = %tx, claimed_distance, "Proof accepted");
                self.transition(FlowState::Submitted { tx, claimed_distance });
            }
            Err(e) => {
                error!("Error generating ZK proof: {}", e);
                self.participant.abort_proof()?;
                self.fail(PROOF_FAILED_MESSAGE);
            }
        }
        Ok(&self.state)
    }

    /// `Failed -> Loading`; call [`Self::load_activities`] next.
    pub fn restart(&mut self) -> Result<&FlowState, FlowError> {
        if !matches!(self.state, FlowState::Failed { .. }) {
            return Err(FlowError::NotFailed);
        }
        self.transition(FlowState::Loading);
        Ok(&self.state)
    }
}
