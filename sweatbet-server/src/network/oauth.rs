//! OAuth Handoff
//!
//! Builds the Strava authorization URL, handles the redirect callback and
//! issues session tickets.
//!
//! The access token never leaves the server. The callback stores it in a
//! flow session and redirects the browser with a short-lived HS256 ticket
//! that names that session.
//!
//! The participant address is fixed when the link is built. It travels in
//! `state` next to the wager id, lands on the session, and is signed into
//! the ticket, so a ticket can only act for the account it was issued to.

use alloy_primitives::Address;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, TokenData, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, instrument, warn};
use url::Url;
use uuid::Uuid;

use crate::core::config::{StravaConfig, TicketConfig};
use crate::core::time::UnixSeconds;
use crate::network::session::FlowSessionManager;
use crate::network::strava::{preview, FitnessApi};
use crate::wager::state::WagerId;

/// Scope needed to read private activities.
pub const STRAVA_SCOPE: &str = "activity:read_all";

/// Path of the callback route, appended to the app URL.
pub const CALLBACK_PATH: &str = "/api/strava/callback";

/// OAuth errors.
#[derive(Debug, Error)]
pub enum OAuthError {
    /// Client id is not configured.
    #[error("STRAVA_CLIENT_ID is not configured")]
    NotConfigured,
    /// Authorize or redirect URL does not parse.
    #[error("invalid url: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

/// OAuth `state`: `{bet}:{address}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandoffState {
    /// Wager being proven.
    pub wager_id: WagerId,
    /// Account the proof is for.
    pub participant: Address,
}

impl HandoffState {
    /// Create a state value.
    pub fn new(wager_id: WagerId, participant: Address) -> Self {
        Self { wager_id, participant }
    }

    /// Wire form.
    pub fn encode(&self) -> String {
        format!("{}:{}", self.wager_id.0, self.participant)
    }

    /// Parse the wire form. `None` when either half is missing or malformed.
    pub fn parse(raw: &str) -> Option<Self> {
        let (bet, address) = raw.split_once(':')?;
        Some(Self {
            wager_id: bet.trim().parse().ok()?,
            participant: address.trim().parse().ok()?,
        })
    }
}

/// Strava authorization URL for `handoff`.
pub fn authorize_url(config: &StravaConfig, app_url: &str, handoff: &HandoffState) -> Result<Url, OAuthError> {
    if config.client_id.is_empty() {
        return Err(OAuthError::NotConfigured);
    }
    let redirect = Url::parse(app_url)?.join(CALLBACK_PATH)?;

    let mut url = Url::parse(&config.authorize_url)?;
    url.query_pairs_mut()
        .append_pair("client_id", &config.client_id)
        .append_pair("redirect_uri", redirect.as_str())
        .append_pair("response_type", "code")
        .append_pair("scope", STRAVA_SCOPE)
        .append_pair("state", &handoff.encode());
    Ok(url)
}

// =============================================================================
// SESSION TICKETS
// =============================================================================

/// Ticket claims.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketClaims {
    /// Flow session id.
    pub sub: String,
    /// Wager the session was opened for.
    pub bet: u64,
    /// Participant the session acts for.
    pub addr: Address,
    /// Expiry (unix seconds).
    pub exp: u64,
    /// Issued at (unix seconds).
    pub iat: u64,
}

impl TicketClaims {
    /// Claims for `session` expiring at `expires_at`.
    pub fn new(session: Uuid, handoff: HandoffState, issued_at: UnixSeconds, expires_at: UnixSeconds) -> Self {
        Self {
            sub: session.to_string(),
            bet: handoff.wager_id.0,
            addr: handoff.participant,
            exp: expires_at,
            iat: issued_at,
        }
    }

    /// Session id from `sub`.
    pub fn session_id(&self) -> Result<Uuid, TicketError> {
        Uuid::parse_str(&self.sub).map_err(|_| TicketError::MissingClaim("sub".into()))
    }

    /// Wager from `bet`.
    pub fn wager_id(&self) -> WagerId {
        WagerId(self.bet)
    }

    /// Wager and participant.
    pub fn handoff(&self) -> HandoffState {
        HandoffState::new(self.wager_id(), self.addr)
    }
}

/// Ticket errors.
#[derive(Debug, Error)]
pub enum TicketError {
    /// No signing secret configured.
    #[error("session tickets not configured")]
    NotConfigured,
    /// Ticket format is invalid.
    #[error("invalid ticket format")]
    InvalidFormat,
    /// Signature verification failed.
    #[error("invalid signature")]
    InvalidSignature,
    /// Ticket has expired.
    #[error("ticket expired")]
    Expired,
    /// Required claim is missing or malformed.
    #[error("missing required claim: {0}")]
    MissingClaim(String),
    /// Encoding or decoding failure.
    #[error("jwt error: {0}")]
    Jwt(String),
}

fn secret(config: &TicketConfig) -> Result<&[u8], TicketError> {
    match config.secret.as_deref() {
        Some(s) if !s.is_empty() => Ok(s.as_bytes()),
        _ => Err(TicketError::NotConfigured),
    }
}

/// Sign `claims`.
pub fn issue_ticket(claims: &TicketClaims, config: &TicketConfig) -> Result<String, TicketError> {
    let key = EncodingKey::from_secret(secret(config)?);
    encode(&Header::new(Algorithm::HS256), claims, &key).map_err(|e| TicketError::Jwt(e.to_string()))
}

/// Verify a ticket and return its claims.
pub fn validate_ticket(ticket: &str, config: &TicketConfig) -> Result<TicketClaims, TicketError> {
    let key = DecodingKey::from_secret(secret(config)?);

    let mut validation = Validation::new(Algorithm::HS256);
    validation.leeway = 0;
    validation.validate_aud = false;
    validation.set_required_spec_claims(&["exp", "sub"]);

    let data: TokenData<TicketClaims> = decode(ticket, &key, &validation).map_err(map_jwt_error)?;
    let claims = data.claims;
    if claims.sub.is_empty() {
        return Err(TicketError::MissingClaim("sub".into()));
    }
    Ok(claims)
}

fn map_jwt_error(err: jsonwebtoken::errors::Error) -> TicketError {
    use jsonwebtoken::errors::ErrorKind;
    match err.kind() {
        ErrorKind::ExpiredSignature => TicketError::Expired,
        ErrorKind::InvalidSignature => TicketError::InvalidSignature,
        ErrorKind::MissingRequiredClaim(claim) => TicketError::MissingClaim(claim.clone()),
        ErrorKind::InvalidToken | ErrorKind::Base64(_) | ErrorKind::Json(_) | ErrorKind::Utf8(_) => {
            TicketError::InvalidFormat
        }
        _ => TicketError::Jwt(err.to_string()),
    }
}

// =============================================================================
// CALLBACK
// =============================================================================

/// Query parameters of the OAuth redirect.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CallbackParams {
    /// Authorization code.
    pub code: Option<String>,
    /// `{bet}:{address}` passed through Strava.
    pub state: Option<String>,
    /// Provider error (e.g. `access_denied`).
    pub error: Option<String>,
}

/// Where the callback sends the browser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackOutcome {
    /// Continue to the proof page.
    Proceed {
        /// Wager from `state`.
        wager_id: WagerId,
        /// Session ticket.
        ticket: String,
    },
    /// `code` or `state` absent or malformed.
    MissingParams,
    /// Token exchange (or session setup) failed.
    AuthFailed,
}

impl CallbackOutcome {
    /// Redirect target, relative to the app origin.
    pub fn location(&self) -> String {
        match self {
            CallbackOutcome::Proceed { wager_id, ticket } => {
                let query = url::form_urlencoded::Serializer::new(String::new())
                    .append_pair("betId", &wager_id.to_string())
                    .append_pair("token", ticket)
                    .finish();
                format!("/prove?{}", query)
            }
            CallbackOutcome::MissingParams => "/?error=missing_params".into(),
            CallbackOutcome::AuthFailed => "/?error=strava_auth_failed".into(),
        }
    }
}

/// Handle the OAuth redirect. No exchange is attempted when parameters are missing.
#[instrument(skip_all)]
pub async fn handle_callback(
    params: &CallbackParams,
    fitness: &dyn FitnessApi,
    sessions: &FlowSessionManager,
    now: UnixSeconds,
) -> CallbackOutcome {
    if let Some(err) = &params.error {
        warn!(error = %err, "Strava returned an authorization error");
    }

    let (Some(code), Some(state)) = (params.code.as_deref(), params.state.as_deref()) else {
        return CallbackOutcome::MissingParams;
    };
    let Some(handoff) = HandoffState::parse(state) else {
        warn!(state = %state, "Callback state is not a wager and address");
        return CallbackOutcome::MissingParams;
    };
    let wager_id = handoff.wager_id;

    info!(wager_id = %wager_id, participant = %handoff.participant, code = %preview(code), "Handling Strava callback");

    let token = match fitness.exchange_code(code).await {
        Ok(token) => token,
        Err(e) => {
            error!("Strava OAuth error: {}", e);
            return CallbackOutcome::AuthFailed;
        }
    };

    match sessions.open(handoff, token, now).await {
        Ok((_, ticket)) => CallbackOutcome::Proceed { wager_id, ticket },
        Err(e) => {
            error!("Failed to open flow session: {}", e);
            CallbackOutcome::AuthFailed
        }
    }
}
