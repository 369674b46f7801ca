//! HTTP and WebSocket Server
//!
//! The HTTP side (axum) carries the OAuth handoff, wager reads and writes and
//! the proof flow. The WebSocket side streams wager events and chat to
//! subscribed clients. Both share one [`AppContext`] and stop on the same
//! shutdown signal.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use alloy_primitives::{Address, TxHash};
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::time::interval;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, instrument, warn};

use crate::core::config::{AppConfig, ConfigError};
use crate::core::time::{days_after, unix_now, UnixSeconds};
use crate::core::units::{parse_token_amount, UnitsError};
use crate::network::chain::{ConfirmationPolicy, JsonRpcClient};
use crate::network::chat::{ChatChannel, InMemoryChat, DEFAULT_HISTORY};
use crate::network::escrow::{EscrowError, NewWager, WagerClient};
use crate::network::identity::{parse_handle_list, resolve_usernames, IdentityApi, IdentityError, NeynarClient};
use crate::network::oauth::{authorize_url, handle_callback, CallbackParams, HandoffState, OAuthError};
use crate::network::protocol::{
    share_url, ActivitiesResponse, ChatFrame, ClaimRequest, ClientMessage, CreateWagerRequest,
    CreateWagerResponse, ErrorCode, ErrorPayload, ProofStatusResponse, ResolveResponse,
    SelectActivityRequest, ServerMessage, StakeRequest, StakeResponse, SuggestionResponse, TxResponse, WagerView,
};
use crate::network::prover::{ProofService, VlayerClient};
use crate::network::session::{FlowSession, FlowSessionManager, SessionError};
use crate::network::strava::{fetch_qualifying_activity, FitnessApi, StravaClient, StravaError};
use crate::wager::events::WagerEvent;
use crate::wager::flow::{FlowContext, FlowError, FlowState, ProofFlow};
use crate::wager::state::{Participant, WagerId};

// =============================================================================
// CONFIG
// =============================================================================

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP bind address.
    pub http_addr: SocketAddr,
    /// WebSocket bind address.
    pub ws_addr: SocketAddr,
    /// Maximum concurrent WebSocket connections.
    pub max_connections: usize,
    /// Expired flow sessions are swept this often.
    pub cleanup_interval: Duration,
    /// Chat messages replayed on subscribe.
    pub chat_history: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: SocketAddr::from(([0, 0, 0, 0], 3000)),
            ws_addr: SocketAddr::from(([0, 0, 0, 0], 3001)),
            max_connections: 1000,
            cleanup_interval: Duration::from_secs(60),
            chat_history: DEFAULT_HISTORY,
        }
    }
}

impl ServerConfig {
    /// Create config from `HTTP_BIND` / `WS_BIND`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            http_addr: bind_from_env("HTTP_BIND", defaults.http_addr)?,
            ws_addr: bind_from_env("WS_BIND", defaults.ws_addr)?,
            ..defaults
        })
    }
}

fn bind_from_env(name: &'static str, default: SocketAddr) -> Result<SocketAddr, ConfigError> {
    match std::env::var(name) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { name, value }),
        _ => Ok(default),
    }
}

// =============================================================================
// ERRORS
// =============================================================================

/// Server errors.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Failed to bind to address.
    #[error("Failed to bind: {0}")]
    BindFailed(#[from] std::io::Error),

    /// Malformed request.
    #[error("{0}")]
    BadRequest(String),

    /// Ticket or session rejected.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// OAuth setup failed.
    #[error(transparent)]
    OAuth(#[from] OAuthError),

    /// Escrow read or write failed.
    #[error(transparent)]
    Escrow(#[from] EscrowError),

    /// Identity lookup failed.
    #[error(transparent)]
    Identity(#[from] IdentityError),

    /// Proof flow refused the request.
    #[error(transparent)]
    Flow(#[from] FlowError),

    /// Fitness platform request failed.
    #[error(transparent)]
    Fitness(#[from] StravaError),

    /// Token amount did not parse.
    #[error("invalid amount: {0}")]
    Amount(#[from] UnitsError),
}

impl ServerError {
    /// HTTP status for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            ServerError::BindFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ServerError::BadRequest(_) | ServerError::Amount(_) => StatusCode::BAD_REQUEST,
            ServerError::Session(_) => StatusCode::UNAUTHORIZED,
            ServerError::OAuth(OAuthError::NotConfigured) => StatusCode::SERVICE_UNAVAILABLE,
            ServerError::OAuth(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ServerError::Escrow(e) => match e {
                EscrowError::NotFound(_) => StatusCode::NOT_FOUND,
                EscrowError::Participant(_) => StatusCode::CONFLICT,
                EscrowError::InsufficientBalance { .. } => StatusCode::BAD_REQUEST,
                EscrowError::NotConfigured => StatusCode::SERVICE_UNAVAILABLE,
                _ => StatusCode::BAD_GATEWAY,
            },
            ServerError::Identity(IdentityError::NotConfigured) => StatusCode::SERVICE_UNAVAILABLE,
            ServerError::Identity(_) => StatusCode::BAD_GATEWAY,
            ServerError::Flow(FlowError::UnknownActivity(_)) => StatusCode::BAD_REQUEST,
            ServerError::Flow(_) => StatusCode::CONFLICT,
            ServerError::Fitness(StravaError::NotConfigured(_)) => StatusCode::SERVICE_UNAVAILABLE,
            ServerError::Fitness(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("Request failed: {}", self);
        } else {
            debug!("Request rejected: {}", self);
        }
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

// =============================================================================
// CONTEXT
// =============================================================================

/// Every collaborator the server needs. Built once at startup.
pub struct AppContext {
    /// Application configuration.
    pub config: AppConfig,
    /// Fitness platform.
    pub fitness: Arc<dyn FitnessApi>,
    /// Remote prover.
    pub prover: Arc<dyn ProofService>,
    /// Social identity.
    pub identity: Arc<dyn IdentityApi>,
    /// Escrow client.
    pub wagers: Arc<WagerClient>,
    /// Flow sessions and the event channel.
    pub sessions: Arc<FlowSessionManager>,
    /// Wager chat.
    pub chat: Arc<dyn ChatChannel>,
}

impl AppContext {
    /// Production wiring: REST clients for every remote, in-memory chat.
    pub fn from_config(config: AppConfig) -> Self {
        let sessions = Arc::new(FlowSessionManager::new(config.tickets.clone()));
        let rpc = Arc::new(JsonRpcClient::new(config.chain.rpc_url.clone()));
        let wagers = WagerClient::new(rpc, config.chain.contracts, ConfirmationPolicy::from_config(&config.chain))
            .with_events(sessions.events());

        Self {
            fitness: Arc::new(StravaClient::new(config.strava.clone())),
            prover: Arc::new(VlayerClient::new(config.prover.clone())),
            identity: Arc::new(NeynarClient::new(config.neynar.clone())),
            wagers: Arc::new(wagers),
            chat: Arc::new(InMemoryChat::new(sessions.events())),
            sessions,
            config,
        }
    }

    /// Collaborators for a new proof flow.
    pub fn flow_context(&self) -> FlowContext {
        FlowContext {
            fitness: self.fitness.clone(),
            prover: self.prover.clone(),
            wagers: self.wagers.clone(),
        }
    }

    /// Block-explorer link for `tx`.
    pub fn explorer_url(&self, tx: &TxHash) -> String {
        self.config.chain.chain.explorer_tx_url(&tx.to_string())
    }
}

// =============================================================================
// HTTP
// =============================================================================

type ApiResult<T> = Result<Json<T>, ServerError>;

/// HTTP routes.
pub fn router(ctx: Arc<AppContext>) -> Router {
    Router::new()
        .route("/api/strava/authorize", get(strava_authorize))
        .route("/api/strava/callback", get(strava_callback))
        .route("/api/bets", post(create_bet))
        .route("/api/bets/:id", get(get_bet))
        .route("/api/bets/:id/proof/:address", get(proof_status))
        .route("/api/bets/:id/stake", post(stake))
        .route("/api/bets/:id/claim", post(claim))
        .route("/api/prove/activities", get(prove_activities))
        .route("/api/prove/select", post(prove_select))
        .route("/api/prove/suggest", get(prove_suggest))
        .route("/api/identity/resolve", get(resolve))
        .with_state(ctx)
}

fn found(location: String) -> Response {
    (StatusCode::FOUND, [(header::LOCATION, location)]).into_response()
}

fn parse_bet_id(raw: Option<&str>) -> Result<WagerId, ServerError> {
    raw.and_then(|s| s.parse().ok())
        .ok_or_else(|| ServerError::BadRequest("betId must be a bet number".into()))
}

fn parse_address(raw: &str) -> Result<Address, ServerError> {
    raw.trim()
        .parse()
        .map_err(|_| ServerError::BadRequest(format!("invalid address: {}", raw)))
}

#[derive(Debug, Default, Deserialize)]
struct AuthorizeQuery {
    #[serde(rename = "betId")]
    bet_id: Option<String>,
    address: Option<String>,
}

async fn strava_authorize(
    State(ctx): State<Arc<AppContext>>,
    Query(query): Query<AuthorizeQuery>,
) -> Result<Response, ServerError> {
    let wager_id = parse_bet_id(query.bet_id.as_deref())?;
    let participant = query
        .address
        .as_deref()
        .ok_or_else(|| ServerError::BadRequest("missing participant address".into()))
        .and_then(parse_address)?;
    let url = authorize_url(&ctx.config.strava, &ctx.config.app_url, &HandoffState::new(wager_id, participant))?;
    info!(wager_id = %wager_id, participant = %participant, "Redirecting to Strava");
    Ok(found(url.to_string()))
}

async fn strava_callback(State(ctx): State<Arc<AppContext>>, Query(params): Query<CallbackParams>) -> Response {
    let outcome = handle_callback(&params, ctx.fitness.as_ref(), &ctx.sessions, unix_now()).await;
    found(format!("{}{}", ctx.config.app_url, outcome.location()))
}

async fn get_bet(State(ctx): State<Arc<AppContext>>, Path(id): Path<u64>) -> ApiResult<WagerView> {
    let wager = ctx.wagers.wager_details(WagerId(id)).await?;
    Ok(Json(WagerView::new(&wager, unix_now())))
}

async fn proof_status(
    State(ctx): State<Arc<AppContext>>,
    Path((id, address)): Path<(u64, String)>,
) -> ApiResult<ProofStatusResponse> {
    let address = parse_address(&address)?;
    let has_proof = ctx.wagers.has_proof(WagerId(id), address).await?;
    Ok(Json(ProofStatusResponse {
        bet_id: WagerId(id),
        address,
        has_proof,
    }))
}

async fn create_bet(
    State(ctx): State<Arc<AppContext>>,
    Json(request): Json<CreateWagerRequest>,
) -> ApiResult<CreateWagerResponse> {
    let from = ctx
        .config
        .chain
        .sender
        .ok_or_else(|| ServerError::BadRequest("no sending account configured".into()))?;
    if request.days == 0 || request.target_distance_m == 0 {
        return Err(ServerError::BadRequest("days and target distance must be positive".into()));
    }

    let wager = NewWager {
        amount: parse_token_amount(&request.amount)?,
        target_distance_m: request.target_distance_m,
        deadline: days_after(unix_now(), request.days),
        activity_type: request.activity_type,
    };
    let created = ctx.wagers.create_wager(from, &wager).await?;
    info!(wager_id = %created.id, tx = %created.tx, "Bet created");

    let usernames: Vec<String> = parse_handle_list(&request.usernames.join(","));
    Ok(Json(CreateWagerResponse {
        bet_id: created.id,
        tx: created.tx,
        explorer_url: ctx.explorer_url(&created.tx),
        share_url: share_url(&ctx.config.app_url, &usernames, created.id),
    }))
}

async fn stake(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<u64>,
    Json(request): Json<StakeRequest>,
) -> ApiResult<StakeResponse> {
    let session = redeem(&ctx, WagerId(id), &request.token, unix_now()).await?;
    let wager = ctx.wagers.wager_details(session.wager_id).await?;
    let has_proof = ctx.wagers.has_proof(wager.id, session.participant).await?;
    let mut participant = Participant::from_chain(session.participant, request.handle, &wager, has_proof);

    let receipt = ctx.wagers.place_stake(&mut participant, &wager).await?;
    Ok(Json(StakeResponse {
        approval_tx: receipt.approval_tx,
        stake_tx: receipt.stake_tx,
        explorer_url: ctx.explorer_url(&receipt.stake_tx),
    }))
}

async fn claim(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<u64>,
    Json(request): Json<ClaimRequest>,
) -> ApiResult<TxResponse> {
    let session = redeem(&ctx, WagerId(id), &request.token, unix_now()).await?;
    let tx = ctx.wagers.claim_winnings(session.participant, session.wager_id).await?;
    Ok(Json(TxResponse {
        tx,
        explorer_url: ctx.explorer_url(&tx),
    }))
}

#[derive(Debug, Default, Deserialize)]
struct ActivitiesQuery {
    #[serde(rename = "betId")]
    bet_id: Option<String>,
    token: Option<String>,
}

async fn redeem(
    ctx: &AppContext,
    bet_id: WagerId,
    ticket: &str,
    now: UnixSeconds,
) -> Result<Arc<FlowSession>, ServerError> {
    let session = ctx.sessions.redeem_ticket(ticket, now).await?;
    if session.wager_id != bet_id {
        return Err(ServerError::BadRequest(format!("session is for bet {}", session.wager_id)));
    }
    Ok(session)
}

/// Start (or resume) the session's proof flow and report its state.
///
/// The flow proves for the session's participant. A flow left in `Failed`
/// is restarted and reloaded.
async fn prove_activities(
    State(ctx): State<Arc<AppContext>>,
    Query(query): Query<ActivitiesQuery>,
) -> ApiResult<ActivitiesResponse> {
    let bet_id = parse_bet_id(query.bet_id.as_deref())?;
    let ticket = query
        .token
        .ok_or_else(|| ServerError::BadRequest("missing session token".into()))?;
    let now = unix_now();
    let session = redeem(&ctx, bet_id, &ticket, now).await?;

    let mut slot = session.flow.lock().await;
    if slot.is_none() {
        let flow = ProofFlow::new(
            ctx.flow_context(),
            bet_id,
            Participant::new(session.participant, None),
            session.access_token.clone(),
        )
        .with_events(ctx.sessions.events());
        *slot = Some(flow);
    }

    let Some(flow) = slot.as_mut() else {
        return Err(FlowError::NotSelecting.into());
    };

    if matches!(flow.state(), FlowState::Failed { .. }) {
        flow.restart()?;
    }
    if matches!(flow.state(), FlowState::Loading) {
        flow.load_activities(now).await;
    }
    Ok(Json(ActivitiesResponse::from_state(bet_id, flow.state(), |tx| ctx.explorer_url(tx))))
}

async fn prove_select(
    State(ctx): State<Arc<AppContext>>,
    Json(request): Json<SelectActivityRequest>,
) -> ApiResult<ActivitiesResponse> {
    let now = unix_now();
    let session = redeem(&ctx, request.bet_id, &request.token, now).await?;

    let mut slot = session.flow.lock().await;
    let flow = slot.as_mut().ok_or(FlowError::NotSelecting)?;
    let state = flow.select_activity(request.activity_id, now).await?;
    Ok(Json(ActivitiesResponse::from_state(request.bet_id, state, |tx| {
        ctx.explorer_url(tx)
    })))
}

/// Earliest activity in the week before the deadline that meets the target.
async fn prove_suggest(
    State(ctx): State<Arc<AppContext>>,
    Query(query): Query<ActivitiesQuery>,
) -> ApiResult<SuggestionResponse> {
    let bet_id = parse_bet_id(query.bet_id.as_deref())?;
    let ticket = query
        .token
        .ok_or_else(|| ServerError::BadRequest("missing session token".into()))?;
    let session = redeem(&ctx, bet_id, &ticket, unix_now()).await?;

    let wager = ctx.wagers.wager_details(bet_id).await?;
    let found = fetch_qualifying_activity(
        ctx.fitness.as_ref(),
        &session.access_token,
        wager.target_distance_m as f64,
        wager.deadline,
        wager.activity_type.as_deref(),
    )
    .await?;
    Ok(Json(SuggestionResponse {
        bet_id,
        activity: found.as_ref().map(Into::into),
    }))
}

#[derive(Debug, Default, Deserialize)]
struct ResolveQuery {
    usernames: Option<String>,
}

async fn resolve(State(ctx): State<Arc<AppContext>>, Query(query): Query<ResolveQuery>) -> ApiResult<ResolveResponse> {
    let handles = parse_handle_list(query.usernames.as_deref().unwrap_or_default());
    if handles.is_empty() {
        return Err(ServerError::BadRequest("usernames parameter is required".into()));
    }
    let participants = resolve_usernames(ctx.identity.as_ref(), &handles).await?;
    Ok(Json(ResolveResponse { participants }))
}

// =============================================================================
// WEBSOCKET
// =============================================================================

/// Connected client state.
struct ConnectedClient {
    /// Wager followed.
    subscription: Option<WagerId>,
    /// Connection time.
    connected_at: Instant,
}

/// HTTP front door plus the wager event stream.
pub struct WagerServer {
    /// Server configuration.
    config: ServerConfig,
    /// Shared collaborators.
    ctx: Arc<AppContext>,
    /// Connected WebSocket clients.
    clients: Arc<RwLock<BTreeMap<SocketAddr, ConnectedClient>>>,
    /// Shutdown signal.
    shutdown_tx: broadcast::Sender<()>,
}

impl WagerServer {
    /// Create a new server.
    pub fn new(config: ServerConfig, ctx: Arc<AppContext>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            ctx,
            clients: Arc::new(RwLock::new(BTreeMap::new())),
            shutdown_tx,
        }
    }

    /// Run both listeners until shutdown.
    #[instrument(skip(self))]
    pub async fn run(&self) -> Result<(), ServerError> {
        let http_listener = TcpListener::bind(&self.config.http_addr).await?;
        let ws_listener = TcpListener::bind(&self.config.ws_addr).await?;
        info!("HTTP listening on {}", self.config.http_addr);
        info!("WebSocket listening on {}", self.config.ws_addr);

        let app = router(self.ctx.clone());
        let mut http_shutdown = self.shutdown_tx.subscribe();
        let http_handle = tokio::spawn(async move {
            let result = axum::serve(http_listener, app)
                .with_graceful_shutdown(async move {
                    let _ = http_shutdown.recv().await;
                })
                .await;
            if let Err(e) = result {
                error!("HTTP server error: {}", e);
            }
        });

        let cleanup_sessions = self.ctx.sessions.clone();
        let cleanup_every = self.config.cleanup_interval;
        let cleanup_handle = tokio::spawn(async move {
            Self::run_cleanup_loop(cleanup_sessions, cleanup_every).await;
        });

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = ws_listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let clients_count = self.clients.read().await.len();
                            if clients_count >= self.config.max_connections {
                                warn!("Connection limit reached, rejecting {}", addr);
                                continue;
                            }

                            info!("New connection from {}", addr);
                            self.handle_connection(stream, addr);
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        cleanup_handle.abort();
        let _ = http_handle.await;

        Ok(())
    }

    /// Handle a new WebSocket connection.
    fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let clients = self.clients.clone();
        let ctx = self.ctx.clone();
        let history = self.config.chat_history;
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let ws_stream = match accept_async(stream).await {
                Ok(ws) => ws,
                Err(e) => {
                    error!("WebSocket handshake failed for {}: {}", addr, e);
                    return;
                }
            };

            let (mut ws_sender, mut ws_receiver) = ws_stream.split();
            let (msg_tx, mut msg_rx) = mpsc::channel::<ServerMessage>(64);
            let mut events = ctx.sessions.subscribe();
            let mut subscription: Option<WagerId> = None;

            {
                let mut clients = clients.write().await;
                clients.insert(
                    addr,
                    ConnectedClient {
                        subscription: None,
                        connected_at: Instant::now(),
                    },
                );
            }

            // Spawn message sender task
            let sender_task = tokio::spawn(async move {
                while let Some(msg) = msg_rx.recv().await {
                    let text = match msg.to_json() {
                        Ok(t) => t,
                        Err(e) => {
                            error!("Failed to serialize message: {}", e);
                            continue;
                        }
                    };
                    if ws_sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
            });

            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        let client_msg = match msg {
                            Some(Ok(Message::Text(text))) => match ClientMessage::from_json(&text) {
                                Ok(m) => m,
                                Err(e) => {
                                    debug!("Invalid message from {}: {}", addr, e);
                                    let _ = msg_tx.send(ServerMessage::Error(ErrorPayload::new(
                                        ErrorCode::InvalidMessage,
                                        "Invalid message format",
                                    ))).await;
                                    continue;
                                }
                            },
                            Some(Ok(Message::Binary(data))) => match ChatFrame::from_bytes(&data) {
                                Ok(frame) => frame.into_message(),
                                Err(e) => {
                                    debug!("Invalid binary frame from {}: {}", addr, e);
                                    continue;
                                }
                            },
                            Some(Ok(Message::Close(_))) | None => {
                                debug!("Client {} disconnected", addr);
                                break;
                            }
                            Some(Err(e)) => {
                                error!("WebSocket error for {}: {}", addr, e);
                                break;
                            }
                            _ => continue,
                        };

                        handle_client_message(client_msg, &mut subscription, &ctx, history, &msg_tx).await;

                        let mut clients = clients.write().await;
                        if let Some(client) = clients.get_mut(&addr) {
                            client.subscription = subscription;
                        }
                    }
                    event = events.recv() => {
                        match event {
                            Ok(event) => {
                                if let Some(msg) = forward_event(event, subscription) {
                                    let _ = msg_tx.send(msg).await;
                                }
                            }
                            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                                warn!("Client {} lagged, {} events dropped", addr, skipped);
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        let _ = msg_tx.send(ServerMessage::Shutdown {
                            reason: "Server shutting down".to_string(),
                        }).await;
                        break;
                    }
                }
            }

            // Let queued messages (including Shutdown) drain before closing.
            drop(msg_tx);
            let _ = sender_task.await;

            let mut clients = clients.write().await;
            if let Some(client) = clients.remove(&addr) {
                info!(
                    "Client {} cleaned up after {:?} (wager {:?})",
                    addr,
                    client.connected_at.elapsed(),
                    client.subscription.map(|id| id.0)
                );
            }
        });
    }

    /// Sweep expired flow sessions.
    async fn run_cleanup_loop(sessions: Arc<FlowSessionManager>, every: Duration) {
        let mut interval = interval(every);

        loop {
            interval.tick().await;
            sessions.cleanup(unix_now()).await;
        }
    }

    /// Shutdown the server.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Get active connection count.
    pub async fn connection_count(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Get active flow session count.
    pub async fn session_count(&self) -> usize {
        self.ctx.sessions.session_count().await
    }
}

/// Message for a subscriber of `subscription`, if `event` concerns it.
fn forward_event(event: WagerEvent, subscription: Option<WagerId>) -> Option<ServerMessage> {
    (subscription == Some(event.wager_id())).then(|| ServerMessage::from(event))
}

/// Handle a client message.
async fn handle_client_message(
    msg: ClientMessage,
    subscription: &mut Option<WagerId>,
    ctx: &AppContext,
    history: usize,
    sender: &mpsc::Sender<ServerMessage>,
) {
    match msg {
        ClientMessage::Subscribe { bet_id } => {
            *subscription = Some(bet_id);
            let history = ctx.chat.recent(bet_id, history).await;
            debug!(wager_id = %bet_id, replay = history.len(), "Subscribed");
            let _ = sender.send(ServerMessage::Subscribed { bet_id, history }).await;
        }
        ClientMessage::Unsubscribe => {
            *subscription = None;
        }
        ClientMessage::Chat { bet_id, sender: from, text } => {
            if *subscription != Some(bet_id) {
                let _ = sender
                    .send(ServerMessage::Error(ErrorPayload::new(
                        ErrorCode::NotSubscribed,
                        "Subscribe to the bet before chatting",
                    )))
                    .await;
                return;
            }
            // Delivered back to every subscriber, this one included, via the event channel.
            if let Err(e) = ctx.chat.send(bet_id, &from, &text).await {
                let _ = sender
                    .send(ServerMessage::Error(ErrorPayload::new(ErrorCode::InvalidChat, e.to_string())))
                    .await;
            }
        }
        ClientMessage::Ping { timestamp } => {
            let _ = sender
                .send(ServerMessage::Pong {
                    timestamp,
                    server_time: std::time::SystemTime::now()
                        .duration_since(std::time::UNIX_EPOCH)
                        .unwrap_or_default()
                        .as_millis() as u64,
                })
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::TicketConfig;
    use crate::network::chat::ChatMessage;
    use crate::network::escrow::tests::{client, open_bet, FakeEscrowChain, ALICE, BOB};
    use crate::network::identity::tests::{user, FakeIdentity};
    use crate::network::prover::tests::FakeProver;
    use crate::network::strava::tests::FakeFitness;
    use crate::network::strava::AccessToken;
    use crate::wager::activity::tests::activity;
    use crate::wager::events::FlowStage;
    use alloy_primitives::U256;

    const SECRET: &str = "test-secret-key-256-bits-long!!";

    struct Fixture {
        ctx: Arc<AppContext>,
        chain: Arc<FakeEscrowChain>,
    }

    fn fixture(chain: FakeEscrowChain, fitness: FakeFitness) -> Fixture {
        let chain = Arc::new(chain);
        let mut config = AppConfig::default();
        config.app_url = "https://sweatbet.test".into();
        config.strava.client_id = "12345".into();
        config.chain.sender = Some(ALICE);
        config.tickets = TicketConfig {
            secret: Some(SECRET.into()),
            ttl: Duration::from_secs(600),
        };

        let sessions = Arc::new(FlowSessionManager::new(config.tickets.clone()));
        let ctx = AppContext {
            fitness: Arc::new(fitness),
            prover: Arc::new(FakeProver::default()),
            identity: Arc::new(FakeIdentity {
                users: vec![user(7, "alice", ALICE, vec![]), user(8, "bob", BOB, vec![])],
                fail: false,
            }),
            wagers: Arc::new(client(chain.clone()).with_events(sessions.events())),
            chat: Arc::new(InMemoryChat::new(sessions.events())),
            sessions,
            config,
        };
        Fixture {
            ctx: Arc::new(ctx),
            chain,
        }
    }

    fn live_bet(participants: Vec<Address>) -> FakeEscrowChain {
        let mut bet = open_bet(participants);
        bet.deadline = U256::from(unix_now() + 86_400);
        FakeEscrowChain::with_bet(1, bet)
    }

    fn recent_activities() -> FakeFitness {
        let start = unix_now() as i64 - 3_600;
        FakeFitness::with_activities(vec![
            activity(11, 4_200.0, "Run", start),
            activity(12, 6_300.7, "Run", start),
        ])
    }

    fn location(response: &Response) -> String {
        response.headers()[header::LOCATION].to_str().unwrap().to_string()
    }

    async fn ticket_for(f: &Fixture, bet: u64, participant: Address) -> String {
        let (_, ticket) = f
            .ctx
            .sessions
            .open(HandoffState::new(WagerId(bet), participant), AccessToken::new("strava-token"), unix_now())
            .await
            .unwrap();
        ticket
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.http_addr.port(), 3000);
        assert_eq!(config.ws_addr.port(), 3001);
        assert_eq!(config.chat_history, DEFAULT_HISTORY);
    }

    #[test]
    fn test_error_status() {
        assert_eq!(
            ServerError::Escrow(EscrowError::NotFound(WagerId(1))).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(ServerError::Session(SessionError::Expired).status(), StatusCode::UNAUTHORIZED);
        assert_eq!(ServerError::Flow(FlowError::NotSelecting).status(), StatusCode::CONFLICT);
        assert_eq!(ServerError::Amount(UnitsError::Empty).status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_authorize_redirects() {
        let f = fixture(FakeEscrowChain::default(), FakeFitness::default());
        let response = strava_authorize(
            State(f.ctx.clone()),
            Query(AuthorizeQuery {
                bet_id: Some("5".into()),
                address: Some(BOB.to_string()),
            }),
        )
        .await
        .unwrap();

        assert_eq!(response.status(), StatusCode::FOUND);
        let location = url::Url::parse(&location(&response)).unwrap();
        assert_eq!(location.path(), "/oauth/authorize");
        let state = location
            .query_pairs()
            .find(|(k, _)| k == "state")
            .map(|(_, v)| v.into_owned())
            .unwrap();
        assert_eq!(HandoffState::parse(&state), Some(HandoffState::new(WagerId(5), BOB)));

        let missing = strava_authorize(State(f.ctx.clone()), Query(AuthorizeQuery::default())).await;
        assert!(matches!(missing, Err(ServerError::BadRequest(_))));

        let no_address = strava_authorize(
            State(f.ctx),
            Query(AuthorizeQuery {
                bet_id: Some("5".into()),
                address: None,
            }),
        )
        .await;
        assert!(matches!(no_address, Err(ServerError::BadRequest(_))));
    }

    #[tokio::test]
    async fn test_callback_redirects_to_prove_page() {
        let f = fixture(FakeEscrowChain::default(), FakeFitness::default());
        let params = CallbackParams {
            code: Some("abc".into()),
            state: Some(HandoffState::new(WagerId(3), BOB).encode()),
            error: None,
        };
        let response = strava_callback(State(f.ctx.clone()), Query(params)).await;

        assert_eq!(response.status(), StatusCode::FOUND);
        assert!(location(&response).starts_with("https://sweatbet.test/prove?betId=3&token="));
        assert_eq!(f.ctx.sessions.session_count().await, 1);

        let response = strava_callback(State(f.ctx), Query(CallbackParams::default())).await;
        assert_eq!(location(&response), "https://sweatbet.test/?error=missing_params");
    }

    #[tokio::test]
    async fn test_get_bet_and_proof_status() {
        let f = fixture(live_bet(vec![ALICE]), FakeFitness::default());

        let Json(view) = get_bet(State(f.ctx.clone()), Path(1)).await.unwrap();
        assert_eq!(view.participants, vec![ALICE]);
        assert_eq!(view.target_distance_m, 5_000);
        assert!(!view.expired);

        let missing = get_bet(State(f.ctx.clone()), Path(9)).await.unwrap_err();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        let Json(status) = proof_status(State(f.ctx.clone()), Path((1, ALICE.to_string())))
            .await
            .unwrap();
        assert!(!status.has_proof);

        let bad = proof_status(State(f.ctx), Path((1, "nope".into()))).await;
        assert!(matches!(bad, Err(ServerError::BadRequest(_))));
    }

    #[tokio::test]
    async fn test_create_bet_returns_share_url() {
        let f = fixture(live_bet(vec![]), FakeFitness::default());
        let request = CreateWagerRequest {
            amount: "2.5".into(),
            target_distance_m: 10_000,
            days: 7,
            activity_type: "Run".into(),
            usernames: vec!["@Alice".into(), "bob".into()],
        };

        let Json(created) = create_bet(State(f.ctx.clone()), Json(request)).await.unwrap();
        assert_eq!(created.bet_id, WagerId(2));
        assert_eq!(created.share_url, "https://sweatbet.test/?usernames=alice,bob&betId=2");
        assert!(created.explorer_url.contains("alfajores"));
        assert_eq!(f.chain.sent(), vec!["createBet"]);
    }

    #[tokio::test]
    async fn test_create_bet_rejects_bad_amount() {
        let f = fixture(live_bet(vec![]), FakeFitness::default());
        let request = CreateWagerRequest {
            amount: "ten".into(),
            target_distance_m: 5_000,
            days: 7,
            activity_type: "Run".into(),
            usernames: vec![],
        };
        let err = create_bet(State(f.ctx.clone()), Json(request)).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert!(f.chain.sent().is_empty());
    }

    #[tokio::test]
    async fn test_stake_and_claim() {
        let f = fixture(live_bet(vec![]), FakeFitness::default());
        f.chain.fund(BOB, U256::from(5_000u64));
        let ticket = ticket_for(&f, 1, BOB).await;

        let Json(staked) = stake(
            State(f.ctx.clone()),
            Path(1),
            Json(StakeRequest {
                token: ticket.clone(),
                handle: Some("bob".into()),
            }),
        )
        .await
        .unwrap();
        assert!(staked.approval_tx.is_some());
        assert_eq!(f.chain.sent(), vec!["approve", "placeBet"]);
        assert_eq!(f.chain.state.lock().unwrap().bets[&1u64].participants, vec![BOB]);

        let again = stake(
            State(f.ctx.clone()),
            Path(1),
            Json(StakeRequest {
                token: ticket.clone(),
                handle: None,
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(again.status(), StatusCode::CONFLICT);

        let Json(claimed) = claim(State(f.ctx.clone()), Path(1), Json(ClaimRequest { token: ticket }))
            .await
            .unwrap();
        assert_eq!(f.chain.state.lock().unwrap().claims, vec![(1, BOB)]);
        assert!(claimed.explorer_url.ends_with(&claimed.tx.to_string()));
    }

    #[tokio::test]
    async fn test_writes_need_a_ticket_for_the_bet() {
        let f = fixture(live_bet(vec![]), FakeFitness::default());
        f.chain.fund(BOB, U256::from(5_000u64));

        let unsigned = stake(
            State(f.ctx.clone()),
            Path(1),
            Json(StakeRequest {
                token: "not-a-ticket".into(),
                handle: None,
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(unsigned.status(), StatusCode::UNAUTHORIZED);

        let other_bet = ticket_for(&f, 2, BOB).await;
        let misused = claim(State(f.ctx.clone()), Path(1), Json(ClaimRequest { token: other_bet }))
            .await
            .unwrap_err();
        assert_eq!(misused.status(), StatusCode::BAD_REQUEST);

        assert!(f.chain.sent().is_empty());
    }

    #[tokio::test]
    async fn test_prove_activities_then_select() {
        let f = fixture(live_bet(vec![ALICE]), recent_activities());
        let ticket = ticket_for(&f, 1, ALICE).await;

        let Json(listed) = prove_activities(
            State(f.ctx.clone()),
            Query(ActivitiesQuery {
                bet_id: Some("1".into()),
                token: Some(ticket.clone()),
            }),
        )
        .await
        .unwrap();
        assert_eq!(listed.stage, FlowStage::Selecting { count: 1 });
        assert_eq!(listed.activities[0].id, 12);

        let Json(done) = prove_select(
            State(f.ctx.clone()),
            Json(SelectActivityRequest {
                bet_id: WagerId(1),
                token: ticket.clone(),
                activity_id: 12,
            }),
        )
        .await
        .unwrap();
        assert!(matches!(done.stage, FlowStage::Submitted { claimed_distance: 6_300, .. }));
        assert!(done.explorer_url.is_some());

        // Resuming reports the terminal state without reloading.
        let Json(resumed) = prove_activities(
            State(f.ctx.clone()),
            Query(ActivitiesQuery {
                bet_id: Some("1".into()),
                token: Some(ticket),
            }),
        )
        .await
        .unwrap();
        assert!(matches!(resumed.stage, FlowStage::Submitted { .. }));
        assert_eq!(f.chain.sent(), vec!["submitZKProof"]);
        assert!(f.chain.state.lock().unwrap().proofs.contains(&(1, ALICE)));
    }

    #[tokio::test]
    async fn test_ticket_for_other_bet_rejected() {
        let f = fixture(live_bet(vec![ALICE]), recent_activities());
        let ticket = ticket_for(&f, 1, ALICE).await;

        let err = prove_activities(
            State(f.ctx.clone()),
            Query(ActivitiesQuery {
                bet_id: Some("2".into()),
                token: Some(ticket),
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);

        let err = prove_select(
            State(f.ctx),
            Json(SelectActivityRequest {
                bet_id: WagerId(1),
                token: "not-a-ticket".into(),
                activity_id: 12,
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_suggest_earliest_qualifying() {
        let deadline = unix_now() + 3_600;
        let mut bet = open_bet(vec![ALICE]);
        bet.deadline = U256::from(deadline);
        let start = deadline as i64 - 2 * 86_400;
        let fitness = FakeFitness::with_activities(vec![
            activity(21, 4_000.0, "Run", start - 3_600),
            activity(22, 5_500.0, "Run", start),
            activity(23, 8_000.0, "Run", start + 3_600),
        ]);
        let f = fixture(FakeEscrowChain::with_bet(1, bet), fitness);
        let ticket = ticket_for(&f, 1, ALICE).await;

        let Json(suggested) = prove_suggest(
            State(f.ctx.clone()),
            Query(ActivitiesQuery {
                bet_id: Some("1".into()),
                token: Some(ticket),
            }),
        )
        .await
        .unwrap();
        assert_eq!(suggested.activity.map(|a| a.id), Some(22));

        let err = prove_suggest(
            State(f.ctx),
            Query(ActivitiesQuery {
                bet_id: Some("1".into()),
                token: None,
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_select_before_loading() {
        let f = fixture(live_bet(vec![ALICE]), recent_activities());
        let ticket = ticket_for(&f, 1, ALICE).await;

        let err = prove_select(
            State(f.ctx),
            Json(SelectActivityRequest {
                bet_id: WagerId(1),
                token: ticket,
                activity_id: 12,
            }),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ServerError::Flow(FlowError::NotSelecting)));
    }

    #[tokio::test]
    async fn test_resolve_handles() {
        let f = fixture(FakeEscrowChain::default(), FakeFitness::default());
        let Json(resolved) = resolve(
            State(f.ctx.clone()),
            Query(ResolveQuery {
                usernames: Some("bob, @alice, carol".into()),
            }),
        )
        .await
        .unwrap();

        let handles: Vec<&str> = resolved.participants.iter().map(|p| p.handle.as_str()).collect();
        assert_eq!(handles, vec!["bob", "alice"]);
        assert_eq!(resolved.participants[0].address, BOB);

        let empty = resolve(State(f.ctx), Query(ResolveQuery::default())).await;
        assert!(matches!(empty, Err(ServerError::BadRequest(_))));
    }

    #[tokio::test]
    async fn test_ws_subscribe_replays_history() {
        let f = fixture(FakeEscrowChain::default(), FakeFitness::default());
        f.ctx.chat.send(WagerId(4), "alice", "first").await.unwrap();

        let (tx, mut rx) = mpsc::channel(8);
        let mut subscription = None;
        handle_client_message(
            ClientMessage::Subscribe { bet_id: WagerId(4) },
            &mut subscription,
            &f.ctx,
            10,
            &tx,
        )
        .await;

        assert_eq!(subscription, Some(WagerId(4)));
        match rx.recv().await.unwrap() {
            ServerMessage::Subscribed { bet_id, history } => {
                assert_eq!(bet_id, WagerId(4));
                assert_eq!(history.len(), 1);
                assert_eq!(history[0].text, "first");
            }
            other => panic!("Wrong message type: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_ws_chat_requires_subscription() {
        let f = fixture(FakeEscrowChain::default(), FakeFitness::default());
        let mut events = f.ctx.sessions.subscribe();
        let (tx, mut rx) = mpsc::channel(8);
        let mut subscription = None;

        let chat = ClientMessage::Chat {
            bet_id: WagerId(2),
            sender: "bob".into(),
            text: "anyone up?".into(),
        };
        handle_client_message(chat.clone(), &mut subscription, &f.ctx, 10, &tx).await;
        assert!(matches!(
            rx.recv().await.unwrap(),
            ServerMessage::Error(ErrorPayload { code: ErrorCode::NotSubscribed, .. })
        ));

        subscription = Some(WagerId(2));
        handle_client_message(chat, &mut subscription, &f.ctx, 10, &tx).await;
        let event = events.recv().await.unwrap();
        assert!(matches!(
            forward_event(event, subscription),
            Some(ServerMessage::Chat(ChatMessage { ref text, .. })) if text == "anyone up?"
        ));
    }

    #[tokio::test]
    async fn test_ws_ping() {
        let f = fixture(FakeEscrowChain::default(), FakeFitness::default());
        let (tx, mut rx) = mpsc::channel(8);
        handle_client_message(ClientMessage::Ping { timestamp: 77 }, &mut None, &f.ctx, 10, &tx).await;
        assert!(matches!(rx.recv().await.unwrap(), ServerMessage::Pong { timestamp: 77, .. }));
    }

    #[test]
    fn test_forward_event_filters_by_wager() {
        let event = WagerEvent::FlowChanged {
            wager_id: WagerId(1),
            address: ALICE,
            stage: FlowStage::Loading,
        };
        assert!(forward_event(event.clone(), Some(WagerId(2))).is_none());
        assert!(forward_event(event.clone(), None).is_none());
        assert!(matches!(forward_event(event, Some(WagerId(1))), Some(ServerMessage::Flow { .. })));
    }

    #[tokio::test]
    async fn test_server_creation_and_shutdown() {
        let f = fixture(FakeEscrowChain::default(), FakeFitness::default());
        let server = WagerServer::new(ServerConfig::default(), f.ctx);
        assert_eq!(server.connection_count().await, 0);
        assert_eq!(server.session_count().await, 0);
        server.shutdown();
    }
}
