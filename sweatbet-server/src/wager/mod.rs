//! Wager domain.
//!
//! Participant state, activity qualification and the proof flow. Nothing in
//! here talks to the network directly. The flow receives its collaborators
//! in a [`FlowContext`]: the fitness and prover traits from
//! [`crate::network`], plus the shared escrow client, which reaches the chain
//! through `ChainRpc`.

pub mod activity;
pub mod events;
pub mod flow;
pub mod state;

pub use activity::{
    filter_qualifying, find_qualifying_activity, ActivityRecord, ActivitySelection, FINDER_WINDOW_DAYS,
    INTERACTIVE_LOOKBACK_DAYS,
};
pub use events::{FlowStage, WagerEvent};
pub use flow::{FlowContext, FlowError, FlowState, ProofFlow};
pub use state::{Participant, ParticipantError, ParticipantState, Wager, WagerId};
