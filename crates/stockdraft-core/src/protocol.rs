// Wire protocol: the `{type, data}` envelope, the closed tag catalogue, and
// the typed payloads the draft subsystem decodes.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

pub type LeagueId = u64;
pub type PlayerId = u64;
pub type StockId = u64;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(#[source] serde_json::Error),

    #[error("failed to encode envelope: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("payload for {tag} does not match the expected shape: {source}")]
    PayloadShape {
        tag: &'static str,
        source: serde_json::Error,
    },
}

// ---------------------------------------------------------------------------
// Tag catalogue
// ---------------------------------------------------------------------------

/// The domain a message type belongs to. The router publishes one stream per
/// domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Domain {
    Portfolio,
    Stock,
    User,
    Trade,
    LeaguePortfolio,
    League,
    Error,
}

impl Domain {
    pub const ALL: [Domain; 7] = [
        Domain::Portfolio,
        Domain::Stock,
        Domain::User,
        Domain::Trade,
        Domain::LeaguePortfolio,
        Domain::League,
        Domain::Error,
    ];
}

macro_rules! message_catalog {
    ($( $domain:ident { $( $variant:ident => $tag:literal ),+ $(,)? } )+) => {
        /// Every message tag the server understands. Unknown tags never decode
        /// into this type; see [`MessageType::from_tag`].
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum MessageType {
            $( $( $variant, )+ )+
        }

        impl MessageType {
            pub const ALL: &'static [MessageType] = &[ $( $( MessageType::$variant, )+ )+ ];

            /// The literal tag carried in the envelope's `type` field.
            pub fn as_str(self) -> &'static str {
                match self {
                    $( $( MessageType::$variant => $tag, )+ )+
                }
            }

            pub fn domain(self) -> Domain {
                match self {
                    $( $( MessageType::$variant => Domain::$domain, )+ )+
                }
            }
        }
    };
}

message_catalog! {
    Portfolio {
        CreatePortfolio => "MessageType_Portfolio_CreatePortfolio",
        PortfolioWithId => "MessageType_Portfolio_PortfolioWithID",
        UserLeaguePortfolio => "MessageType_Portfolio_LeaguePortfolio",
        AddStock => "MessageType_Portfolio_AddStock",
        RemoveStock => "MessageType_Portfolio_RemoveStock",
        PortfolioPointsHistory => "MessageType_Portfolio_GetPortfolioPointsHistory",
        StocksValueChange => "MessageType_Portfolio_GetStocksValueChange",
    }
    Stock {
        CreateStock => "MessageType_Stock_CreateStock",
        CreateMultipleStocks => "MessageType_Stock_CreateMultipleStocks",
        StockInformation => "MessageType_Stock_GetStockInformation",
        UpdateCurrentStockPrice => "MessageType_Stock_UpdateCurrentStockPrice",
        AllStocks => "MessageType_Stock_GetAllStocks",
    }
    User {
        UserInfo => "MessageType_User_UserInfo",
        UserLeagues => "MessageType_User_UserLeagues",
        UserTrades => "MessageType_User_UserTrades",
        UserPortfolios => "MessageType_User_UserPortfolios",
    }
    Trade {
        CreateTrade => "MessageType_Trade_CreateTrade",
        ConfirmTrade => "MessageType_Trade_ConfirmTrade",
        Trades => "MessageType_Trade_GetTrades",
    }
    LeaguePortfolio {
        DraftStock => "MessageType_LeaguePortfolio_DraftStock",
        LeaguePortfolioInfo => "MessageType_LeaguePortfolio_GetLeaguePortfolioInfo",
    }
    League {
        CreateLeague => "MessageType_League_CreateLeague",
        RemoveLeague => "MessageType_League_RemoveLeague",
        AddUserToLeague => "MessageType_League_AddUserToLeague",
        LeagueDetails => "MessageType_League_GetDetails",
        Leaderboard => "MessageType_League_GetLeaderboard",
        QueueUp => "MessageType_League_QueueUp",
        LeaguePortfolios => "MessageType_League_Portfolios",
        DraftTurnUpdate => "MessageType_League_DraftUpdate",
        DraftPick => "MessageType_League_DraftPick",
        AllLeagues => "MessageType_League_GetAllLeagues",
    }
    Error {
        Error => "MessageType_Error",
    }
}

impl MessageType {
    /// Look up a tag in the catalogue. Returns `None` for tags this client
    /// does not know about.
    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|t| t.as_str() == tag)
    }
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// One wire message. Never mutated after construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
}

impl Envelope {
    pub fn new(kind: MessageType, data: Value) -> Self {
        Envelope {
            kind: kind.as_str().to_string(),
            data,
        }
    }

    pub fn message_type(&self) -> Option<MessageType> {
        MessageType::from_tag(&self.kind)
    }

    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(ProtocolError::MalformedEnvelope)
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Encode)
    }

    /// Whether the payload carries the server's nested error marker
    /// (`{"type": "MessageType_Error", "message": ...}`).
    pub fn is_error_payload(&self) -> bool {
        self.data.get("type").and_then(Value::as_str) == Some(MessageType::Error.as_str())
    }
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

/// A failure reported by the server for a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerError {
    #[serde(default)]
    pub message: String,
}

/// The server's answer to a request: either the expected payload or an
/// application error.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply<T> {
    Success(T),
    Failed(ServerError),
}

impl<T> Reply<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, Reply::Success(_))
    }
}

/// The authoritative "who is on the clock" announcement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DraftTurn {
    #[serde(rename = "leagueID", default)]
    pub league_id: LeagueId,
    #[serde(rename = "playerID")]
    pub player_id: PlayerId,
    #[serde(rename = "remainingTime")]
    pub remaining_seconds: u32,
}

/// A completed pick, broadcast to every participant of the league.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PickBroadcast {
    pub league_id: LeagueId,
    pub player_id: PlayerId,
    pub stock_id: StockId,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Acknowledgement body for draft-stock and queue-up requests.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StatusMessage {
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stock {
    pub id: StockId,
    #[serde(default)]
    pub ticker_symbol: String,
    #[serde(default)]
    pub company_name: String,
    #[serde(default)]
    pub current_price: f64,
}

/// The pool of stocks still available in a league's draft.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LeaguePortfolio {
    #[serde(default)]
    pub id: u64,
    #[serde(default)]
    pub league_id: LeagueId,
    #[serde(default)]
    pub name: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub stocks: Vec<Stock>,
}

/// One participant's holdings in a league.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Portfolio {
    #[serde(default, alias = "ID")]
    pub id: u64,
    #[serde(default)]
    pub user_id: PlayerId,
    #[serde(default)]
    pub league_id: LeagueId,
    #[serde(default, alias = "Stocks", deserialize_with = "null_as_empty")]
    pub stocks: Vec<Stock>,
    #[serde(default)]
    pub points: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeagueState {
    PreDraft,
    #[serde(rename = "draft")]
    InDraft,
    PostDraft,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DraftStatus {
    Ready,
    NotReady,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaguePlayer {
    #[serde(default)]
    pub league_id: LeagueId,
    pub player_id: PlayerId,
    #[serde(default = "default_draft_status")]
    pub draft_status: DraftStatus,
}

fn default_draft_status() -> DraftStatus {
    DraftStatus::NotReady
}

/// Snapshot of a league as pushed by the server (also the shape persisted
/// under the `selectedLeague` key).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeagueDetails {
    pub id: LeagueId,
    #[serde(default)]
    pub league_name: String,
    #[serde(default)]
    pub start_date: Option<String>,
    #[serde(default)]
    pub end_date: Option<String>,
    pub league_state: LeagueState,
    #[serde(default)]
    pub max_players: Option<u32>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub league_players: Vec<LeaguePlayer>,
}

/// One leaderboard row before ranking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredMember {
    pub username: String,
    #[serde(default)]
    pub total_value: f64,
}

fn null_as_empty<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(Option::<Vec<T>>::deserialize(deserializer)?.unwrap_or_default())
}

// ---------------------------------------------------------------------------
// Inbound decoding
// ---------------------------------------------------------------------------

/// A decoded inbound message, one variant per tag the draft subsystem
/// consumes. Catalogued tags outside that set are carried as `Other`.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    DraftTurnUpdate(DraftTurn),
    DraftPick(PickBroadcast),
    DraftStock(Reply<StatusMessage>),
    QueueUp(Reply<StatusMessage>),
    LeaguePortfolioInfo(Reply<LeaguePortfolio>),
    LeaguePortfolios(Reply<Vec<Portfolio>>),
    LeagueDetails(Reply<LeagueDetails>),
    Leaderboard(Reply<Vec<ScoredMember>>),
    ServerError(ServerError),
    Other { kind: MessageType, data: Value },
}

impl Inbound {
    /// Decode an envelope whose tag is `kind`.
    pub fn decode(kind: MessageType, envelope: &Envelope) -> Result<Self, ProtocolError> {
        let inbound = match kind {
            MessageType::DraftTurnUpdate => Inbound::DraftTurnUpdate(payload(kind, &envelope.data)?),
            MessageType::DraftPick => Inbound::DraftPick(payload(kind, &envelope.data)?),
            MessageType::DraftStock => Inbound::DraftStock(reply(kind, envelope)?),
            MessageType::QueueUp => Inbound::QueueUp(reply(kind, envelope)?),
            MessageType::LeaguePortfolioInfo => Inbound::LeaguePortfolioInfo(reply(kind, envelope)?),
            MessageType::LeaguePortfolios => Inbound::LeaguePortfolios(reply(kind, envelope)?),
            MessageType::LeagueDetails => Inbound::LeagueDetails(reply(kind, envelope)?),
            MessageType::Leaderboard => Inbound::Leaderboard(reply(kind, envelope)?),
            MessageType::Error => Inbound::ServerError(payload(kind, &envelope.data)?),
            other => Inbound::Other {
                kind: other,
                data: envelope.data.clone(),
            },
        };
        Ok(inbound)
    }
}

fn payload<T: DeserializeOwned>(kind: MessageType, data: &Value) -> Result<T, ProtocolError> {
    T::deserialize(data).map_err(|source| ProtocolError::PayloadShape {
        tag: kind.as_str(),
        source,
    })
}

fn reply<T: DeserializeOwned>(kind: MessageType, envelope: &Envelope) -> Result<Reply<T>, ProtocolError> {
    if envelope.is_error_payload() {
        return Ok(Reply::Failed(payload(kind, &envelope.data)?));
    }
    Ok(Reply::Success(payload(kind, &envelope.data)?))
}

// ---------------------------------------------------------------------------
// Outbound requests
// ---------------------------------------------------------------------------

pub fn league_portfolio_info_request(league_id: LeagueId) -> Envelope {
    Envelope::new(MessageType::LeaguePortfolioInfo, json!({ "league_id": league_id }))
}

pub fn draft_stock_request(league_id: LeagueId, user_id: PlayerId, stock_id: StockId) -> Envelope {
    Envelope::new(
        MessageType::DraftStock,
        json!({ "league_id": league_id, "user_id": user_id, "stock_id": stock_id }),
    )
}

pub fn queue_up_request(league_id: LeagueId, player_id: PlayerId) -> Envelope {
    Envelope::new(
        MessageType::QueueUp,
        json!({ "league_id": league_id, "player_id": player_id }),
    )
}

pub fn league_portfolios_request(league_id: LeagueId) -> Envelope {
    Envelope::new(MessageType::LeaguePortfolios, json!({ "league_id": league_id }))
}

pub fn league_details_request(league_id: LeagueId) -> Envelope {
    Envelope::new(MessageType::LeagueDetails, json!({ "league_id": league_id }))
}

pub fn leaderboard_request(league_id: LeagueId) -> Envelope {
    Envelope::new(MessageType::Leaderboard, json!({ "league_id": league_id }))
}
