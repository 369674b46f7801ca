//! Wager Client
//!
//! Typed access to the betting escrow and its stake token. Writes are always
//! followed by [`wait_for_receipt`]; participant state only advances once the
//! corresponding receipt is confirmed.

use std::sync::Arc;

use alloy_primitives::{Address, Bytes, TxHash, U256};
use alloy_sol_types::SolCall;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{info, instrument, warn};

use crate::core::config::ContractAddresses;
use crate::core::time::UnixSeconds;
use crate::network::chain::abi::{IBettingEscrow, IERC20};
use crate::network::chain::{wait_for_receipt, ChainError, ChainRpc, ConfirmationPolicy, TxReceipt};
use crate::network::prover::ProofArtifact;
use crate::wager::events::WagerEvent;
use crate::wager::state::{Participant, ParticipantError, ParticipantState, Wager, WagerId};

/// Escrow client errors.
#[derive(Debug, Error)]
pub enum EscrowError {
    /// Escrow address is not configured.
    #[error("escrow contract address is not configured")]
    NotConfigured,
    /// Chain transport or confirmation failure.
    #[error(transparent)]
    Chain(#[from] ChainError),
    /// Return data did not decode.
    #[error("abi decode failed: {0}")]
    Abi(#[from] alloy_sol_types::Error),
    /// Participant transition refused.
    #[error(transparent)]
    Participant(#[from] ParticipantError),
    /// Wager does not exist on-chain.
    #[error("wager {0} not found")]
    NotFound(WagerId),
    /// Token balance below the stake.
    #[error("insufficient balance: need {required}, have {available}")]
    InsufficientBalance {
        /// Stake amount.
        required: U256,
        /// Current balance.
        available: U256,
    },
    /// Creation receipt carried no escrow log.
    #[error("creation receipt {0} has no escrow log")]
    MissingWagerId(TxHash),
    /// Wager id in the log does not fit in 64 bits.
    #[error("wager id out of range: {0}")]
    WagerIdOverflow(U256),
}

/// Parameters of a new wager.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewWager {
    /// Stake per participant (token base units).
    pub amount: U256,
    /// Minimum distance in meters.
    pub target_distance_m: u64,
    /// Unix deadline.
    pub deadline: UnixSeconds,
    /// Activity type tag.
    pub activity_type: String,
}

/// A confirmed wager creation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CreatedWager {
    /// Assigned id.
    pub id: WagerId,
    /// Creation transaction.
    pub tx: TxHash,
}

/// A confirmed stake.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StakeReceipt {
    /// Approval transaction, if one was needed.
    pub approval_tx: Option<TxHash>,
    /// `placeBet` transaction.
    pub stake_tx: TxHash,
}

/// Escrow + token client.
pub struct WagerClient {
    rpc: Arc<dyn ChainRpc>,
    contracts: ContractAddresses,
    confirmations: ConfirmationPolicy,
    events: Option<broadcast::Sender<WagerEvent>>,
}

impl WagerClient {
    /// Create a client.
    pub fn new(rpc: Arc<dyn ChainRpc>, contracts: ContractAddresses, confirmations: ConfirmationPolicy) -> Self {
        Self {
            rpc,
            contracts,
            confirmations,
            events: None,
        }
    }

    /// Publish participant transitions to `events`.
    pub fn with_events(mut self, events: broadcast::Sender<WagerEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Configured addresses.
    pub fn contracts(&self) -> &ContractAddresses {
        &self.contracts
    }

    fn escrow(&self) -> Result<Address, EscrowError> {
        if self.contracts.escrow == Address::ZERO {
            return Err(EscrowError::NotConfigured);
        }
        Ok(self.contracts.escrow)
    }

    async fn read<C: SolCall>(&self, to: Address, call: &C) -> Result<C::Return, EscrowError> {
        let data = self.rpc.call(to, Bytes::from(call.abi_encode())).await?;
        Ok(C::abi_decode_returns(&data, true)?)
    }

    async fn write<C: SolCall>(&self, from: Address, to: Address, call: &C) -> Result<TxReceipt, EscrowError> {
        let tx = self
            .rpc
            .send_transaction(from, to, Bytes::from(call.abi_encode()))
            .await?;
        Ok(wait_for_receipt(self.rpc.as_ref(), tx, &self.confirmations).await?)
    }

    fn publish(&self, wager_id: WagerId, participant: &Participant) {
        if let Some(events) = &self.events {
            let _ = events.send(WagerEvent::ParticipantChanged {
                wager_id,
                address: participant.address,
                state: participant.state.clone(),
            });
        }
    }

    // =========================================================================
    // READS
    // =========================================================================

    /// `getBetDetails`. The activity type is not part of the read.
    #[instrument(skip(self))]
    pub async fn wager_details(&self, id: WagerId) -> Result<Wager, EscrowError> {
        let details = self
            .read(self.escrow()?, &IBettingEscrow::getBetDetailsCall { betId: id.to_u256() })
            .await?;

        if details.betAmount.is_zero() && details.deadline.is_zero() {
            return Err(EscrowError::NotFound(id));
        }

        Ok(Wager {
            id,
            amount: details.betAmount,
            target_distance_m: saturating_u64(details.targetDistance),
            deadline: saturating_u64(details.deadline),
            activity_type: None,
            participants: details.participants,
            total_pool: details.totalPool,
            is_active: details.isActive,
            winner_count: saturating_u64(details.winnerCount),
        })
    }

    /// `hasProof`.
    pub async fn has_proof(&self, id: WagerId, participant: Address) -> Result<bool, EscrowError> {
        let result = self
            .read(
                self.escrow()?,
                &IBettingEscrow::hasProofCall {
                    betId: id.to_u256(),
                    participant,
                },
            )
            .await?;
        Ok(result._0)
    }

    /// Token allowance granted by `owner` to the escrow.
    pub async fn allowance(&self, owner: Address) -> Result<U256, EscrowError> {
        let spender = self.escrow()?;
        let result = self
            .read(self.contracts.token, &IERC20::allowanceCall { owner, spender })
            .await?;
        Ok(result._0)
    }

    /// Token balance of `account`.
    pub async fn balance_of(&self, account: Address) -> Result<U256, EscrowError> {
        let result = self
            .read(self.contracts.token, &IERC20::balanceOfCall { account })
            .await?;
        Ok(result._0)
    }

    // =========================================================================
    // WRITES
    // =========================================================================

    /// `createBet`, confirmed. The id comes from the escrow's log in the receipt.
    #[instrument(skip(self, wager), fields(amount = %wager.amount, target = wager.target_distance_m))]
    pub async fn create_wager(&self, from: Address, wager: &NewWager) -> Result<CreatedWager, EscrowError> {
        let escrow = self.escrow()?;
        let receipt = self
            .write(
                from,
                escrow,
                &IBettingEscrow::createBetCall {
                    betAmount: wager.amount,
                    targetDistance: U256::from(wager.target_distance_m),
                    deadline: U256::from(wager.deadline),
                    activityType: wager.activity_type.clone(),
                },
            )
            .await?;

        let id = wager_id_from_receipt(&receipt, escrow)?;
        info!(wager_id = %id, tx = %receipt.transaction_hash, "Wager created");
        Ok(CreatedWager {
            id,
            tx: receipt.transaction_hash,
        })
    }

    /// Approve (when the allowance is short) and `placeBet`, confirming each.
    ///
    /// Drives `participant` through `Unstaked -> StakePending -> Staked`, or
    /// back to `Unstaked` on failure.
    #[instrument(skip(self, participant, wager), fields(wager_id = %wager.id, address = %participant.address))]
    pub async fn place_stake(
        &self,
        participant: &mut Participant,
        wager: &Wager,
    ) -> Result<StakeReceipt, EscrowError> {
        let escrow = self.escrow()?;
        if !wager.is_active {
            return Err(ParticipantError::WagerInactive.into());
        }
        if participant.state != ParticipantState::Unstaked {
            return Err(ParticipantError::InvalidTransition {
                from: participant.state.name(),
                action: "stake",
            }
            .into());
        }

        let from = participant.address;
        let balance = self.balance_of(from).await?;
        if balance < wager.amount {
            return Err(EscrowError::InsufficientBalance {
                required: wager.amount,
                available: balance,
            });
        }

        let allowance = self.allowance(from).await?;
        let approval_tx = if allowance < wager.amount {
            let call = IERC20::approveCall {
                spender: escrow,
                amount: wager.amount,
            };
            let tx = self
                .rpc
                .send_transaction(from, self.contracts.token, Bytes::from(call.abi_encode()))
                .await?;
            participant.begin_stake(Some(tx))?;
            self.publish(wager.id, participant);

            if let Err(e) = wait_for_receipt(self.rpc.as_ref(), tx, &self.confirmations).await {
                warn!("Approval failed: {}", e);
                self.rollback_stake(wager.id, participant);
                return Err(e.into());
            }
            info!(tx = %tx, "Approval confirmed");
            Some(tx)
        } else {
            participant.begin_stake(None)?;
            self.publish(wager.id, participant);
            None
        };

        let stake = self
            .write(from, escrow, &IBettingEscrow::placeBetCall { betId: wager.id.to_u256() })
            .await;
        let receipt = match stake {
            Ok(receipt) => receipt,
            Err(e) => {
                warn!("Stake failed: {}", e);
                self.rollback_stake(wager.id, participant);
                return Err(e);
            }
        };

        participant.confirm_stake()?;
        self.publish(wager.id, participant);
        info!(tx = %receipt.transaction_hash, "Stake confirmed");

        Ok(StakeReceipt {
            approval_tx,
            stake_tx: receipt.transaction_hash,
        })
    }

    fn rollback_stake(&self, wager_id: WagerId, participant: &mut Participant) {
        if participant.abort_stake().is_ok() {
            self.publish(wager_id, participant);
        }
    }

    /// `submitZKProof` with the floored distance, confirmed.
    #[instrument(skip(self, artifact), fields(fingerprint = %artifact.fingerprint()))]
    pub async fn submit_proof(
        &self,
        from: Address,
        id: WagerId,
        artifact: &ProofArtifact,
    ) -> Result<TxHash, EscrowError> {
        let receipt = self
            .write(
                from,
                self.escrow()?,
                &IBettingEscrow::submitZKProofCall {
                    betId: id.to_u256(),
                    zkProof: artifact.proof.clone(),
                    claimedDistance: artifact.claimed_distance_u256(),
                },
            )
            .await?;
        info!(tx = %receipt.transaction_hash, "Proof submitted");
        Ok(receipt.transaction_hash)
    }

    /// `claimWinnings`, confirmed.
    #[instrument(skip(self))]
    pub async fn claim_winnings(&self, from: Address, id: WagerId) -> Result<TxHash, EscrowError> {
        let receipt = self
            .write(from, self.escrow()?, &IBettingEscrow::claimWinningsCall { betId: id.to_u256() })
            .await?;
        info!(tx = %receipt.transaction_hash, "Winnings claimed");
        Ok(receipt.transaction_hash)
    }
}

/// First escrow log: first indexed argument, else first data word.
pub fn wager_id_from_receipt(receipt: &TxReceipt, escrow: Address) -> Result<WagerId, EscrowError> {
    let log = receipt
        .logs_from(escrow)
        .next()
        .ok_or(EscrowError::MissingWagerId(receipt.transaction_hash))?;

    let raw = if let Some(topic) = log.topics.get(1) {
        U256::from_be_bytes(topic.0)
    } else if log.data.len() >= 32 {
        U256::from_be_slice(&log.data[..32])
    } else {
        return Err(EscrowError::MissingWagerId(receipt.transaction_hash));
    };

    u64::try_from(raw)
        .map(WagerId)
        .map_err(|_| EscrowError::WagerIdOverflow(raw))
}

fn saturating_u64(value: U256) -> u64 {
    u64::try_from(value).unwrap_or(u64::MAX)
}
