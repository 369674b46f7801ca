//! Flow Session Management
//!
//! Server-side store for OAuth handoffs. Each session holds one participant's
//! access token and, once started, their proof flow. Sessions are addressed
//! by uuid and reached from the browser only through a signed ticket.
//!
//! The manager also owns the wager event channel that flows, stakes and chat
//! publish into and WebSocket connections subscribe to.

use std::collections::BTreeMap;
use std::sync::Arc;

use alloy_primitives::Address;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

use crate::core::config::TicketConfig;
use crate::core::time::UnixSeconds;
use crate::network::oauth::{issue_ticket, validate_ticket, HandoffState, TicketClaims, TicketError};
use crate::network::strava::AccessToken;
use crate::wager::events::WagerEvent;
use crate::wager::flow::ProofFlow;
use crate::wager::state::WagerId;

/// Capacity of the wager event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Session errors.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Ticket did not verify.
    #[error(transparent)]
    Ticket(#[from] TicketError),
    /// Session was closed or never existed.
    #[error("session not found")]
    NotFound,
    /// Session outlived its ttl.
    #[error("session expired")]
    Expired,
    /// Ticket names a different wager than the session.
    #[error("ticket is for wager {ticket}, session is for wager {session}")]
    WagerMismatch {
        /// Wager in the ticket.
        ticket: WagerId,
        /// Wager of the session.
        session: WagerId,
    },
    /// Ticket names a different participant than the session.
    #[error("ticket is for {ticket}, session is for {session}")]
    ParticipantMismatch {
        /// Participant in the ticket.
        ticket: Address,
        /// Participant of the session.
        session: Address,
    },
}

/// One OAuth handoff.
pub struct FlowSession {
    /// Session id (ticket `sub`).
    pub id: Uuid,
    /// Wager the user authorised for.
    pub wager_id: WagerId,
    /// Account every write in this session is made from.
    pub participant: Address,
    /// Strava access token.
    pub access_token: AccessToken,
    /// Creation time.
    pub created_at: UnixSeconds,
    /// Expiry time.
    pub expires_at: UnixSeconds,
    /// Proof flow, created on first use.
    pub flow: Mutex<Option<ProofFlow>>,
}

impl FlowSession {
    /// Wager and participant the session was opened for.
    pub fn handoff(&self) -> HandoffState {
        HandoffState::new(self.wager_id, self.participant)
    }

    /// Session has expired at `now`.
    pub fn is_expired(&self, now: UnixSeconds) -> bool {
        now >= self.expires_at
    }
}

/// Store of flow sessions plus the wager event fan-out.
pub struct FlowSessionManager {
    /// Active sessions.
    sessions: RwLock<BTreeMap<Uuid, Arc<FlowSession>>>,
    /// Ticket signing.
    tickets: TicketConfig,
    /// Wager event channel.
    events: broadcast::Sender<WagerEvent>,
}

impl FlowSessionManager {
    /// Create a manager.
    pub fn new(tickets: TicketConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            sessions: RwLock::new(BTreeMap::new()),
            tickets,
            events,
        }
    }

    /// Store a new session.
    pub async fn insert(&self, handoff: HandoffState, access_token: AccessToken, now: UnixSeconds) -> Arc<FlowSession> {
        let ttl = self.tickets.ttl.as_secs();
        let session = Arc::new(FlowSession {
            id: Uuid::new_v4(),
            wager_id: handoff.wager_id,
            participant: handoff.participant,
            access_token,
            created_at: now,
            expires_at: now.saturating_add(ttl),
            flow: Mutex::new(None),
        });

        let mut sessions = self.sessions.write().await;
        sessions.insert(session.id, session.clone());
        debug!(session = %session.id, wager_id = %session.wager_id, "Flow session stored");
        session
    }

    /// Get a live session.
    pub async fn get(&self, id: &Uuid, now: UnixSeconds) -> Result<Arc<FlowSession>, SessionError> {
        let sessions = self.sessions.read().await;
        let session = sessions.get(id).cloned().ok_or(SessionError::NotFound)?;
        if session.is_expired(now) {
            return Err(SessionError::Expired);
        }
        Ok(session)
    }

    /// Remove a session.
    pub async fn remove(&self, id: &Uuid) -> bool {
        let mut sessions = self.sessions.write().await;
        sessions.remove(id).is_some()
    }

    /// Active session count.
    pub async fn session_count(&self) -> usize {
        let sessions = self.sessions.read().await;
        sessions.len()
    }

    /// Drop expired sessions. Returns how many were removed.
    pub async fn cleanup(&self, now: UnixSeconds) -> usize {
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, s| !s.is_expired(now));
        let removed = before - sessions.len();
        if removed > 0 {
            info!(removed, "Cleaned up expired flow sessions");
        }
        removed
    }

    /// Ticket for `session`, expiring with it.
    pub fn issue_ticket(&self, session: &FlowSession) -> Result<String, SessionError> {
        let claims = TicketClaims::new(session.id, session.handoff(), session.created_at, session.expires_at);
        Ok(issue_ticket(&claims, &self.tickets)?)
    }

    /// Store a session and issue its ticket.
    pub async fn open(
        &self,
        handoff: HandoffState,
        access_token: AccessToken,
        now: UnixSeconds,
    ) -> Result<(Uuid, String), SessionError> {
        if !self.tickets.is_configured() {
            return Err(TicketError::NotConfigured.into());
        }
        let session = self.insert(handoff, access_token, now).await;
        let ticket = self.issue_ticket(&session)?;
        info!(
            session = %session.id,
            wager_id = %session.wager_id,
            participant = %session.participant,
            "Flow session opened"
        );
        Ok((session.id, ticket))
    }

    /// Verify a ticket and return its live session.
    pub async fn redeem_ticket(&self, ticket: &str, now: UnixSeconds) -> Result<Arc<FlowSession>, SessionError> {
        let claims = validate_ticket(ticket, &self.tickets)?;
        let session = self.get(&claims.session_id()?, now).await?;
        if session.wager_id != claims.wager_id() {
            return Err(SessionError::WagerMismatch {
                ticket: claims.wager_id(),
                session: session.wager_id,
            });
        }
        if session.participant != claims.addr {
            return Err(SessionError::ParticipantMismatch {
                ticket: claims.addr,
                session: session.participant,
            });
        }
        Ok(session)
    }

    /// Sender side of the event channel.
    pub fn events(&self) -> broadcast::Sender<WagerEvent> {
        self.events.clone()
    }

    /// New receiver on the event channel.
    pub fn subscribe(&self) -> broadcast::Receiver<WagerEvent> {
        self.events.subscribe()
    }

    /// Publish an event. Dropped when nobody is listening.
    pub fn publish(&self, event: WagerEvent) {
        let _ = self.events.send(event);
    }
}
