//! Wager and Participant State
//!
//! `Wager` mirrors the escrow's `getBetDetails` read. `ParticipantState` is the
//! client-side state machine for one participant in one wager; it only moves
//! forward on confirmed external events (receipts, chain reads), never on a timer.

use std::fmt;
use std::str::FromStr;

use alloy_primitives::{Address, TxHash, U256};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::time::UnixSeconds;

/// On-chain bet identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WagerId(pub u64);

impl WagerId {
    /// ABI representation.
    pub fn to_u256(self) -> U256 {
        U256::from(self.0)
    }
}

impl fmt::Display for WagerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for WagerId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse::<u64>().map(WagerId)
    }
}

/// Snapshot of a wager as read from the escrow contract.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Wager {
    /// Bet identifier.
    pub id: WagerId,
    /// Stake per participant (token base units).
    pub amount: U256,
    /// Minimum qualifying distance in meters.
    pub target_distance_m: u64,
    /// Unix deadline.
    pub deadline: UnixSeconds,
    /// Activity type tag. Only known at creation; the details read omits it.
    pub activity_type: Option<String>,
    /// Addresses that have staked.
    pub participants: Vec<Address>,
    /// Total tokens locked.
    pub total_pool: U256,
    /// False once settled or cancelled.
    pub is_active: bool,
    /// Number of winners recorded by the contract.
    pub winner_count: u64,
}

impl Wager {
    /// Deadline has passed.
    pub fn is_expired(&self, now: UnixSeconds) -> bool {
        now > self.deadline
    }

    /// Proofs can still be submitted.
    pub fn accepts_proofs(&self, now: UnixSeconds) -> bool {
        self.is_active && !self.is_expired(now)
    }

    /// `address` has staked.
    pub fn is_participant(&self, address: &Address) -> bool {
        self.participants.contains(address)
    }

    /// Target distance as a float for comparing against activity records.
    pub fn target_distance(&self) -> f64 {
        self.target_distance_m as f64
    }
}

/// Client-observed participant state.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ParticipantState {
    /// No stake placed.
    Unstaked,
    /// Approval (if any) sent; stake not yet confirmed.
    StakePending {
        /// Approval transaction, `None` when the allowance already covered the stake.
        approval_tx: Option<TxHash>,
    },
    /// Stake confirmed on-chain.
    Staked,
    /// Proof generation or submission in flight.
    ProofPending,
    /// Proof accepted on-chain.
    ProofSubmitted {
        /// Submission transaction, `None` when derived from a chain read.
        tx: Option<TxHash>,
    },
}

impl ParticipantState {
    /// Short name for logs and errors.
    pub fn name(&self) -> &'static str {
        match self {
            ParticipantState::Unstaked => "unstaked",
            ParticipantState::StakePending { .. } => "stake_pending",
            ParticipantState::Staked => "staked",
            ParticipantState::ProofPending => "proof_pending",
            ParticipantState::ProofSubmitted { .. } => "proof_submitted",
        }
    }
}

/// Participant state machine errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParticipantError {
    /// Action not allowed from the current state.
    #[error("cannot {action} while {from}")]
    InvalidTransition {
        /// Current state name.
        from: &'static str,
        /// Attempted action.
        action: &'static str,
    },
    /// Wager deadline has passed.
    #[error("wager deadline {deadline} has passed")]
    DeadlinePassed {
        /// Unix deadline.
        deadline: UnixSeconds,
    },
    /// Wager is no longer active.
    #[error("wager is not active")]
    WagerInactive,
}

/// A participant in one wager.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    /// Wallet address.
    pub address: Address,
    /// Social handle, if resolved.
    pub handle: Option<String>,
    /// Current state.
    pub state: ParticipantState,
}

impl Participant {
    /// Fresh, unstaked participant.
    pub fn new(address: Address, handle: Option<String>) -> Self {
        Self {
            address,
            handle,
            state: ParticipantState::Unstaked,
        }
    }

    /// Derive state from chain reads: proof flag first, then membership.
    pub fn from_chain(
        address: Address,
        handle: Option<String>,
        wager: &Wager,
        has_proof: bool,
    ) -> Self {
        let state = if has_proof {
            ParticipantState::ProofSubmitted { tx: None }
        } else if wager.is_participant(&address) {
            ParticipantState::Staked
        } else {
            ParticipantState::Unstaked
        };
        Self { address, handle, state }
    }

    /// Stake has been confirmed.
    pub fn has_staked(&self) -> bool {
        matches!(
            self.state,
            ParticipantState::Staked
                | ParticipantState::ProofPending
                | ParticipantState::ProofSubmitted { .. }
        )
    }

    /// Proof has been accepted.
    pub fn has_proved(&self) -> bool {
        matches!(self.state, ParticipantState::ProofSubmitted { .. })
    }

    /// `Unstaked -> StakePending`.
    pub fn begin_stake(&mut self, approval_tx: Option<TxHash>) -> Result<(), ParticipantError> {
        match self.state {
            ParticipantState::Unstaked => {
                self.state = ParticipantState::StakePending { approval_tx };
                Ok(())
            }
            _ => Err(self.invalid("stake")),
        }
    }

    /// `StakePending -> Staked`, after the stake receipt is confirmed.
    pub fn confirm_stake(&mut self) -> Result<(), ParticipantError> {
        match self.state {
            ParticipantState::StakePending { .. } => {
                self.state = ParticipantState::Staked;
                Ok(())
            }
            _ => Err(self.invalid("confirm stake")),
        }
    }

    /// `StakePending -> Unstaked`, when approval or stake failed.
    pub fn abort_stake(&mut self) -> Result<(), ParticipantError> {
        match self.state {
            ParticipantState::StakePending { .. } => {
                self.state = ParticipantState::Unstaked;
                Ok(())
            }
            _ => Err(self.invalid("abort stake")),
        }
    }

    /// `Staked -> ProofPending`. Refused once the deadline has passed.
    pub fn begin_proof(&mut self, wager: &Wager, now: UnixSeconds) -> Result<(), ParticipantError> {
        if self.state != ParticipantState::Staked {
            return Err(self.invalid("submit proof"));
        }
        if !wager.is_active {
            return Err(ParticipantError::WagerInactive);
        }
        if wager.is_expired(now) {
            return Err(ParticipantError::DeadlinePassed {
                deadline: wager.deadline,
            });
        }
        self.state = ParticipantState::ProofPending;
        Ok(())
    }

    /// `ProofPending -> ProofSubmitted`, after the submission receipt is confirmed.
    pub fn confirm_proof(&mut self, tx: TxHash) -> Result<(), ParticipantError> {
        match self.state {
            ParticipantState::ProofPending => {
                self.state = ParticipantState::ProofSubmitted { tx: Some(tx) };
                Ok(())
            }
            _ => Err(self.invalid("confirm proof")),
        }
    }

    /// `ProofPending -> Staked`; the user restarts from activity selection.
    pub fn abort_proof(&mut self) -> Result<(), ParticipantError> {
        match self.state {
            ParticipantState::ProofPending => {
                self.state = ParticipantState::Staked;
                Ok(())
            }
            _ => Err(self.invalid("abort proof")),
        }
    }

    fn invalid(&self, action: &'static str) -> ParticipantError {
        ParticipantError::InvalidTransition {
            from: self.state.name(),
            action,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::{address, B256};

    const ALICE: Address = address!("00000000000000000000000000000000000a11ce");
    const BOB: Address = address!("0000000000000000000000000000000000000b0b");

    fn test_wager() -> Wager {
        Wager {
            id: WagerId(7),
            amount: U256::from(1_000u64),
            target_distance_m: 5000,
            deadline: 1_000_000,
            activity_type: Some("Run".into()),
            participants: vec![ALICE],
            total_pool: U256::from(1_000u64),
            is_active: true,
            winner_count: 0,
        }
    }

    fn staked(address: Address) -> Participant {
        let mut p = Participant::new(address, None);
        p.begin_stake(None).unwrap();
        p.confirm_stake().unwrap();
        p
    }

    #[test]
    fn test_wager_id_parse_and_display() {
        let id: WagerId = " 42 ".parse().unwrap();
        assert_eq!(id, WagerId(42));
        assert_eq!(id.to_string(), "42");
        assert_eq!(id.to_u256(), U256::from(42u64));
        assert!("abc".parse::<WagerId>().is_err());
    }

    #[test]
    fn test_wager_deadline() {
        let wager = test_wager();
        assert!(!wager.is_expired(1_000_000));
        assert!(wager.is_expired(1_000_001));
        assert!(wager.accepts_proofs(999_999));

        let closed = Wager {
            is_active: false,
            ..test_wager()
        };
        assert!(!closed.accepts_proofs(0));
    }

    #[test]
    fn test_full_lifecycle() {
        let wager = test_wager();
        let mut p = Participant::new(ALICE, Some("alice".into()));
        assert_eq!(p.state, ParticipantState::Unstaked);

        let approval = B256::repeat_byte(1);
        p.begin_stake(Some(approval)).unwrap();
        assert_eq!(
            p.state,
            ParticipantState::StakePending {
                approval_tx: Some(approval)
            }
        );
        assert!(!p.has_staked());

        p.confirm_stake().unwrap();
        assert!(p.has_staked());

        p.begin_proof(&wager, 500).unwrap();
        assert_eq!(p.state, ParticipantState::ProofPending);

        let tx = B256::repeat_byte(2);
        p.confirm_proof(tx).unwrap();
        assert!(p.has_proved());
        assert_eq!(p.state, ParticipantState::ProofSubmitted { tx: Some(tx) });
    }

    #[test]
    fn test_cannot_prove_before_stake_confirmed() {
        let wager = test_wager();
        let mut p = Participant::new(ALICE, None);
        p.begin_stake(None).unwrap();

        let result = p.begin_proof(&wager, 500);
        assert!(matches!(result, Err(ParticipantError::InvalidTransition { .. })));
    }

    #[test]
    fn test_deadline_blocks_proof() {
        let wager = test_wager();
        let mut p = staked(ALICE);

        let result = p.begin_proof(&wager, wager.deadline + 1);
        assert_eq!(
            result,
            Err(ParticipantError::DeadlinePassed {
                deadline: wager.deadline
            })
        );
        assert_eq!(p.state, ParticipantState::Staked);
    }

    #[test]
    fn test_inactive_wager_blocks_proof() {
        let wager = Wager {
            is_active: false,
            ..test_wager()
        };
        let mut p = staked(ALICE);
        assert_eq!(p.begin_proof(&wager, 0), Err(ParticipantError::WagerInactive));
    }

    #[test]
    fn test_abort_paths() {
        let wager = test_wager();

        let mut p = Participant::new(ALICE, None);
        p.begin_stake(None).unwrap();
        p.abort_stake().unwrap();
        assert_eq!(p.state, ParticipantState::Unstaked);

        let mut p = staked(ALICE);
        p.begin_proof(&wager, 0).unwrap();
        p.abort_proof().unwrap();
        assert_eq!(p.state, ParticipantState::Staked);
    }

    #[test]
    fn test_double_stake_rejected() {
        let mut p = staked(ALICE);
        assert!(matches!(
            p.begin_stake(None),
            Err(ParticipantError::InvalidTransition { from: "staked", .. })
        ));
    }

    #[test]
    fn test_state_from_chain_reads() {
        let wager = test_wager();

        let alice = Participant::from_chain(ALICE, None, &wager, false);
        assert_eq!(alice.state, ParticipantState::Staked);

        let bob = Participant::from_chain(BOB, None, &wager, false);
        assert_eq!(bob.state, ParticipantState::Unstaked);

        let proved = Participant::from_chain(ALICE, None, &wager, true);
        assert!(proved.has_proved());
    }

    #[test]
    fn test_state_serialization() {
        let json = serde_json::to_string(&ParticipantState::StakePending { approval_tx: None }).unwrap();
        assert!(json.contains("stake_pending"));
    }
}
