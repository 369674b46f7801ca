//! Network Layer
//!
//! Clients for every remote the wager flow touches (Strava, the vlayer prover,
//! Neynar, the Celo JSON-RPC node) behind traits, plus the HTTP/WebSocket
//! front door. Nothing here owns wager rules; those live in `wager/`.

pub mod chain;
pub mod chat;
pub mod escrow;
pub mod identity;
pub mod oauth;
pub mod protocol;
pub mod prover;
pub mod server;
pub mod session;
pub mod strava;

pub use chain::{ChainError, ChainRpc, ConfirmationPolicy, JsonRpcClient, TxReceipt};
pub use chat::{ChatChannel, ChatError, ChatMessage, DisabledChat, InMemoryChat};
pub use escrow::{CreatedWager, EscrowError, NewWager, StakeReceipt, WagerClient};
pub use identity::{FarcasterUser, IdentityApi, IdentityError, NeynarClient, ResolvedParticipant};
pub use oauth::{
    authorize_url, handle_callback, CallbackOutcome, HandoffState, OAuthError, TicketClaims, TicketError,
};
pub use protocol::{ClientMessage, ServerMessage};
pub use prover::{ProofArtifact, ProofService, ProverError, VlayerClient};
pub use server::{AppContext, ServerConfig, ServerError, WagerServer};
pub use session::{FlowSession, FlowSessionManager, SessionError};
pub use strava::{AccessToken, FitnessApi, StravaClient, StravaError};
