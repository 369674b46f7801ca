//! Wire Protocol
//!
//! Message types for the WebSocket event stream and the JSON bodies of the
//! HTTP surface. WebSocket messages are JSON text frames; chat may also be
//! sent as a binary [`ChatFrame`].

use alloy_primitives::{Address, TxHash};
use serde::{Deserialize, Serialize};

use crate::core::time::{to_rfc3339, UnixSeconds};
use crate::core::units::format_token_amount;
use crate::network::chat::ChatMessage;
use crate::network::identity::ResolvedParticipant;
use crate::wager::activity::ActivityRecord;
use crate::wager::events::{FlowStage, WagerEvent};
use crate::wager::flow::FlowState;
use crate::wager::state::{ParticipantState, Wager, WagerId};

// =============================================================================
// CLIENT -> SERVER
// =============================================================================

/// Messages sent from client to server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Follow one wager. Replaces any previous subscription.
    Subscribe {
        /// Wager to follow.
        bet_id: WagerId,
    },

    /// Stop following.
    Unsubscribe,

    /// Post to the wager chat.
    Chat {
        /// Wager conversation.
        bet_id: WagerId,
        /// Sender handle or address.
        sender: String,
        /// Body.
        text: String,
    },

    /// Ping for latency measurement.
    Ping {
        /// Client timestamp.
        timestamp: u64,
    },
}

// =============================================================================
// SERVER -> CLIENT
// =============================================================================

/// Messages sent from server to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Subscription accepted, with recent chat.
    Subscribed {
        /// Wager followed.
        bet_id: WagerId,
        /// Recent chat, oldest first.
        history: Vec<ChatMessage>,
    },

    /// A participant's proof flow changed stage.
    Flow {
        /// Wager.
        bet_id: WagerId,
        /// Participant.
        address: Address,
        /// New stage.
        #[serde(flatten)]
        stage: FlowStage,
    },

    /// A participant's stake or proof state changed.
    Participant {
        /// Wager.
        bet_id: WagerId,
        /// Participant.
        address: Address,
        /// New state.
        #[serde(flatten)]
        state: ParticipantState,
    },

    /// Chat message.
    Chat(ChatMessage),

    /// Pong response.
    Pong {
        /// Echoed client timestamp.
        timestamp: u64,
        /// Server time (unix millis).
        server_time: u64,
    },

    /// Error message.
    Error(ErrorPayload),

    /// Server is shutting down.
    Shutdown {
        /// Reason.
        reason: String,
    },
}

impl From<WagerEvent> for ServerMessage {
    fn from(event: WagerEvent) -> Self {
        match event {
            WagerEvent::ParticipantChanged { wager_id, address, state } => ServerMessage::Participant {
                bet_id: wager_id,
                address,
                state,
            },
            WagerEvent::FlowChanged { wager_id, address, stage } => ServerMessage::Flow {
                bet_id: wager_id,
                address,
                stage,
            },
            WagerEvent::ChatPosted {
                wager_id,
                sender,
                text,
                sent_at,
            } => ServerMessage::Chat(ChatMessage {
                wager_id,
                sender,
                text,
                sent_at,
            }),
        }
    }
}

/// Error payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Error code.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
}

impl ErrorPayload {
    /// Build a payload.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Malformed message.
    InvalidMessage,
    /// Chat rejected (empty or too long).
    InvalidChat,
    /// Chat for a wager the connection does not follow.
    NotSubscribed,
    /// Server error.
    InternalError,
}

// =============================================================================
// SERIALIZATION
// =============================================================================

impl ClientMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

impl ServerMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// Chat message in binary form. Flat so that bincode can carry it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatFrame {
    /// Wager conversation.
    pub bet_id: u64,
    /// Sender handle or address.
    pub sender: String,
    /// Body.
    pub text: String,
}

impl ChatFrame {
    /// Serialize to binary.
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize from binary.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }

    /// Equivalent JSON message.
    pub fn into_message(self) -> ClientMessage {
        ClientMessage::Chat {
            bet_id: WagerId(self.bet_id),
            sender: self.sender,
            text: self.text,
        }
    }
}

// =============================================================================
// HTTP BODIES
// =============================================================================

/// Wager as shown to the front end.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WagerView {
    /// Bet id.
    pub bet_id: WagerId,
    /// Stake per participant, decimal token units.
    pub amount: String,
    /// Minimum distance in meters.
    pub target_distance_m: u64,
    /// Unix deadline.
    pub deadline: UnixSeconds,
    /// Deadline as RFC 3339.
    pub deadline_iso: String,
    /// Staked addresses.
    pub participants: Vec<Address>,
    /// Pool, decimal token units.
    pub total_pool: String,
    /// Escrow still open.
    pub is_active: bool,
    /// Winners recorded.
    pub winner_count: u64,
    /// Deadline has passed.
    pub expired: bool,
}

impl WagerView {
    /// View of `wager` at `now`.
    pub fn new(wager: &Wager, now: UnixSeconds) -> Self {
        Self {
            bet_id: wager.id,
            amount: format_token_amount(wager.amount),
            target_distance_m: wager.target_distance_m,
            deadline: wager.deadline,
            deadline_iso: to_rfc3339(wager.deadline),
            participants: wager.participants.clone(),
            total_pool: format_token_amount(wager.total_pool),
            is_active: wager.is_active,
            winner_count: wager.winner_count,
            expired: wager.is_expired(now),
        }
    }
}

/// One selectable activity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivitySummary {
    /// Activity id.
    pub id: u64,
    /// Title.
    pub name: String,
    /// Sport type.
    pub activity_type: String,
    /// Distance in meters.
    pub distance_m: f64,
    /// Distance in kilometers.
    pub distance_km: f64,
    /// Moving time in whole minutes.
    pub moving_minutes: u64,
    /// Start time.
    pub start_date: String,
}

/// `GET /api/prove/suggest`: earliest qualifying activity, if any.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuggestionResponse {
    /// Wager.
    pub bet_id: WagerId,
    /// Suggested activity.
    pub activity: Option<ActivitySummary>,
}

impl From<&ActivityRecord> for ActivitySummary {
    fn from(record: &ActivityRecord) -> Self {
        Self {
            id: record.id,
            name: record.name.clone(),
            activity_type: record.activity_type.clone(),
            distance_m: record.distance,
            distance_km: record.distance_km(),
            moving_minutes: record.moving_minutes(),
            start_date: record.start_date.to_rfc3339(),
        }
    }
}

/// Proof-flow snapshot: qualifying list, empty state or outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivitiesResponse {
    /// Bet id.
    pub bet_id: WagerId,
    /// Current stage.
    pub stage: FlowStage,
    /// Qualifying activities while selecting, else empty.
    pub activities: Vec<ActivitySummary>,
    /// Explorer link once submitted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub explorer_url: Option<String>,
}

impl ActivitiesResponse {
    /// Snapshot of `state`. `explorer` maps a tx hash to a link.
    pub fn from_state(bet_id: WagerId, state: &FlowState, explorer: impl Fn(&TxHash) -> String) -> Self {
        let activities = match state {
            FlowState::Selecting(list) => list.iter().map(ActivitySummary::from).collect(),
            _ => Vec::new(),
        };
        let explorer_url = match state {
            FlowState::Submitted { tx, .. } => Some(explorer(tx)),
            _ => None,
        };
        Self {
            bet_id,
            stage: state.stage(),
            activities,
            explorer_url,
        }
    }
}

/// `POST /api/prove/select`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectActivityRequest {
    /// Bet id.
    pub bet_id: WagerId,
    /// Session ticket.
    pub token: String,
    /// Chosen activity.
    pub activity_id: u64,
}

/// `POST /api/bets/{id}/stake`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StakeRequest {
    /// Session ticket. The stake is placed from the session's participant.
    pub token: String,
    /// Social handle, if known.
    #[serde(default)]
    pub handle: Option<String>,
}

/// Confirmed stake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StakeResponse {
    /// Approval transaction, when one was needed.
    pub approval_tx: Option<TxHash>,
    /// `placeBet` transaction.
    pub stake_tx: TxHash,
    /// Explorer link for the stake.
    pub explorer_url: String,
}

/// `POST /api/bets`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateWagerRequest {
    /// Stake per participant, decimal token units ("10", "2.5").
    pub amount: String,
    /// Minimum distance in meters.
    pub target_distance_m: u64,
    /// Days until the deadline.
    pub days: u64,
    /// Activity type tag.
    pub activity_type: String,
    /// Handles to invite.
    #[serde(default)]
    pub usernames: Vec<String>,
}

/// Created wager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateWagerResponse {
    /// Assigned id.
    pub bet_id: WagerId,
    /// Creation transaction.
    pub tx: TxHash,
    /// Explorer link.
    pub explorer_url: String,
    /// Link to send to the invitees.
    pub share_url: String,
}

/// `POST /api/bets/{id}/claim`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimRequest {
    /// Session ticket. Winnings are claimed for the session's participant.
    pub token: String,
}

/// A confirmed transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TxResponse {
    /// Transaction hash.
    pub tx: TxHash,
    /// Explorer link.
    pub explorer_url: String,
}

/// `GET /api/bets/{id}/proof/{address}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProofStatusResponse {
    /// Bet id.
    pub bet_id: WagerId,
    /// Participant.
    pub address: Address,
    /// Proof recorded on-chain.
    pub has_proof: bool,
}

/// `GET /api/identity/resolve`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolveResponse {
    /// Resolved handles, in request order.
    pub participants: Vec<ResolvedParticipant>,
}

/// Invitation link: `{app_url}/?usernames=a,b&betId=N`.
pub fn share_url(app_url: &str, usernames: &[String], bet_id: WagerId) -> String {
    let handles: Vec<String> = usernames
        .iter()
        .map(|u| url::form_urlencoded::byte_serialize(u.as_bytes()).collect())
        .collect();
    format!(
        "{}/?usernames={}&betId={}",
        app_url.trim_end_matches('/'),
        handles.join(","),
        bet_id
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wager::activity::tests::activity;
    use alloy_primitives::U256;

    #[test]
    fn test_client_message_json() {
        let msg = ClientMessage::from_json(r#"{"type":"subscribe","bet_id":7}"#).unwrap();
        assert_eq!(msg, ClientMessage::Subscribe { bet_id: WagerId(7) });

        let chat = ClientMessage::Chat {
            bet_id: WagerId(7),
            sender: "alice".into(),
            text: "gm".into(),
        };
        let json = chat.to_json().unwrap();
        assert!(json.contains(r#""type":"chat""#));
        assert_eq!(ClientMessage::from_json(&json).unwrap(), chat);
    }

    #[test]
    fn test_flow_message_flattens_stage() {
        let msg = ServerMessage::from(WagerEvent::FlowChanged {
            wager_id: WagerId(3),
            address: Address::repeat_byte(0x11),
            stage: FlowStage::Selecting { count: 2 },
        });

        let value: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(value["type"], "flow");
        assert_eq!(value["stage"], "selecting");
        assert_eq!(value["count"], 2);
        assert_eq!(value["bet_id"], 3);
    }

    #[test]
    fn test_chat_event_becomes_chat_message() {
        let msg = ServerMessage::from(WagerEvent::ChatPosted {
            wager_id: WagerId(1),
            sender: "bob".into(),
            text: "see you at the start".into(),
            sent_at: 42,
        });
        let json = msg.to_json().unwrap();
        match ServerMessage::from_json(&json).unwrap() {
            ServerMessage::Chat(message) => {
                assert_eq!(message.sender, "bob");
                assert_eq!(message.sent_at, 42);
            }
            other => panic!("Wrong message type: {:?}", other),
        }
    }

    #[test]
    fn test_error_code_is_snake_case() {
        let msg = ServerMessage::Error(ErrorPayload::new(ErrorCode::NotSubscribed, "subscribe first"));
        assert!(msg.to_json().unwrap().contains("not_subscribed"));
    }

    #[test]
    fn test_binary_chat_frame() {
        // Tagged enums (#[serde(tag = "type")]) are not supported by bincode,
        // so binary chat uses the flat frame.
        let frame = ChatFrame {
            bet_id: 9,
            sender: "carol".into(),
            text: "done".into(),
        };
        let bytes = frame.to_bytes().unwrap();
        let parsed = ChatFrame::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, frame);
        assert!(matches!(parsed.into_message(), ClientMessage::Chat { bet_id: WagerId(9), .. }));
    }

    #[test]
    fn test_wager_view_formats_amounts() {
        let wager = Wager {
            id: WagerId(4),
            amount: U256::from(2_500_000_000_000_000_000u128),
            target_distance_m: 5000,
            deadline: 86_400,
            activity_type: None,
            participants: vec![Address::repeat_byte(1)],
            total_pool: U256::from(5_000_000_000_000_000_000u128),
            is_active: true,
            winner_count: 0,
        };

        let view = WagerView::new(&wager, 90_000);
        assert_eq!(view.amount, "2.5");
        assert_eq!(view.total_pool, "5");
        assert!(view.expired);
        assert_eq!(view.deadline_iso, "1970-01-02T00:00:00+00:00");

        let json = serde_json::to_value(&view).unwrap();
        assert_eq!(json["betId"], 4);
        assert_eq!(json["targetDistanceM"], 5000);
    }

    #[test]
    fn test_activities_response_from_state() {
        let state = FlowState::Selecting(vec![activity(1, 6200.0, "Run", 1_000)]);
        let response = ActivitiesResponse::from_state(WagerId(2), &state, |tx| tx.to_string());
        assert_eq!(response.activities.len(), 1);
        assert_eq!(response.activities[0].distance_km, 6.2);
        assert!(response.explorer_url.is_none());

        let tx = TxHash::repeat_byte(0xab);
        let state = FlowState::Submitted { tx, claimed_distance: 6200 };
        let response = ActivitiesResponse::from_state(WagerId(2), &state, |tx| format!("x/{}", tx));
        assert!(response.activities.is_empty());
        assert_eq!(response.explorer_url, Some(format!("x/{}", tx)));
    }

    #[test]
    fn test_share_url() {
        let url = share_url(
            "https://sweatbet.app/",
            &["alice".to_string(), "bob".to_string()],
            WagerId(12),
        );
        assert_eq!(url, "https://sweatbet.app/?usernames=alice,bob&betId=12");
    }
}
