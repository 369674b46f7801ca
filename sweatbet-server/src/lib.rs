//! # SweatBet Server
//!
//! Wager orchestration for SweatBet: friends stake cUSD on a distance goal,
//! prove a Strava workout with a vlayer web proof, and settle through a
//! betting escrow on Celo.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    SWEATBET SERVER                           │
//! ├─────────────────────────────────────────────────────────────┤
//! │  core/           - Shared primitives                         │
//! │  ├── config.rs   - Environment config, chain table           │
//! │  ├── units.rs    - 18-decimal token amounts                  │
//! │  └── time.rs     - Unix-second deadlines                     │
//! │                                                              │
//! │  wager/          - Wager rules (no I/O of their own)         │
//! │  ├── state.rs    - Wager, participant state machine          │
//! │  ├── activity.rs - Qualifying-activity filter and finder     │
//! │  ├── events.rs   - Events fanned out to subscribers          │
//! │  └── flow.rs     - Selection -> proof -> submission          │
//! │                                                              │
//! │  network/        - Remotes and the front door                │
//! │  ├── oauth.rs    - Strava handoff, session tickets           │
//! │  ├── strava.rs   - Fitness API client                        │
//! │  ├── prover.rs   - vlayer prover client, redaction policy    │
//! │  ├── identity.rs - Farcaster (Neynar) resolution             │
//! │  ├── chain.rs    - JSON-RPC, escrow/token ABI, receipts      │
//! │  ├── escrow.rs   - Create, stake, submit proof, claim        │
//! │  ├── chat.rs     - Pluggable chat keyed by wager             │
//! │  ├── session.rs  - Server-side flow sessions                 │
//! │  ├── protocol.rs - WebSocket and HTTP message types          │
//! │  └── server.rs   - axum HTTP + WebSocket event stream        │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Participant Lifecycle
//!
//! `Unstaked -> StakePending -> Staked -> ProofPending -> ProofSubmitted`.
//! Every forward step waits for a confirmed receipt or a chain read; a failed
//! step rolls back to the last confirmed state. Proof generation is refused
//! once the wager deadline has passed.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod core;
pub mod network;
pub mod wager;

// Re-export commonly used types
pub use core::config::{AppConfig, ChainId};
pub use core::units::{format_token_amount, parse_token_amount};
pub use wager::flow::{FlowState, ProofFlow};
pub use wager::state::{Participant, ParticipantState, Wager, WagerId};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
