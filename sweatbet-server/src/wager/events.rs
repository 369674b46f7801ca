//! Wager Events
//!
//! Events emitted as participants move through staking and the proof flow.
//! Fanned out to WebSocket subscribers of the wager; nothing consumes them for
//! correctness.

use alloy_primitives::{Address, TxHash};
use serde::{Deserialize, Serialize};

use crate::core::time::UnixSeconds;
use crate::wager::state::{ParticipantState, WagerId};

/// Coarse proof-flow stage, safe to broadcast (no activity data).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum FlowStage {
    /// Fetching wager and activities.
    Loading,
    /// Waiting for the user to pick one of `count` activities.
    Selecting {
        /// Number of qualifying activities.
        count: usize,
    },
    /// No activity qualifies.
    NoQualifyingActivities,
    /// Proof generation and submission running.
    Generating {
        /// Selected activity.
        activity_id: u64,
    },
    /// Proof accepted on-chain.
    Submitted {
        /// Submission transaction.
        tx: TxHash,
        /// Distance encoded on-chain (meters).
        claimed_distance: u64,
    },
    /// A proof was already on-chain when the flow started.
    AlreadySubmitted,
    /// Generic failure; restart from activity selection.
    Failed {
        /// User-facing message.
        message: String,
    },
}

/// An event on one wager.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WagerEvent {
    /// Participant state changed.
    ParticipantChanged {
        /// Wager.
        wager_id: WagerId,
        /// Participant address.
        address: Address,
        /// New state.
        state: ParticipantState,
    },
    /// Proof flow moved to a new stage.
    FlowChanged {
        /// Wager.
        wager_id: WagerId,
        /// Participant address.
        address: Address,
        /// New stage.
        stage: FlowStage,
    },
    /// Chat message posted.
    ChatPosted {
        /// Wager.
        wager_id: WagerId,
        /// Sender handle or address.
        sender: String,
        /// Message body.
        text: String,
        /// Unix time.
        sent_at: UnixSeconds,
    },
}

impl WagerEvent {
    /// Wager this event belongs to.
    pub fn wager_id(&self) -> WagerId {
        match self {
            WagerEvent::ParticipantChanged { wager_id, .. }
            | WagerEvent::FlowChanged { wager_id, .. }
            | WagerEvent::ChatPosted { wager_id, .. } => *wager_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_wager_id() {
        let event = WagerEvent::ChatPosted {
            wager_id: WagerId(3),
            sender: "alice".into(),
            text: "gm".into(),
            sent_at: 0,
        };
        assert_eq!(event.wager_id(), WagerId(3));
    }

    #[test]
    fn test_event_json_shape() {
        let event = WagerEvent::FlowChanged {
            wager_id: WagerId(1),
            address: Address::ZERO,
            stage: FlowStage::Selecting { count: 2 },
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"event\":\"flow_changed\""));
        assert!(json.contains("\"stage\":\"selecting\""));

        let parsed: WagerEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, event);
    }
}
