// Draft session: wires the transport, router, cache and turn tracker into one
// service and runs the event loop that keeps them in step.
//
// User actions go out through the transport queue and return immediately.
// Their outcome arrives later as an inbound message and is reported on the
// session's event stream, never as a return value.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use stockdraft_core::cache::{DraftCache, DraftPick};
use stockdraft_core::config::Config;
use stockdraft_core::db::Database;
use stockdraft_core::protocol::{
    self, DraftTurn, Inbound, LeagueDetails, LeagueId, LeaguePortfolio, LeagueState, MessageType,
    Portfolio, Reply, Stock, StockId,
};
use stockdraft_core::ranking::{rank_members, LeaderboardEntry};
use stockdraft_core::router::Router;
use stockdraft_core::session_store::{CurrentUser, SessionStore};
use stockdraft_core::transport::{ConnectionState, Connector, TransportChannel, TransportError};
use stockdraft_core::turn::{TurnState, TurnTracker};

const EVENT_CAPACITY: usize = 256;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("no league is selected")]
    NoLeagueSelected,

    #[error("no user is signed in")]
    NoCurrentUser,

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("failed to persist session state: {0}")]
    Store(String),
}

/// Result of a draft attempt. A pick made out of turn is not an error; it is
/// simply not sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DraftAttempt {
    Sent,
    NotYourTurn,
}

/// What the session observed, in the order it observed it.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Connection(ConnectionState),
    /// A turn announcement, or its rebroadcast after a reconnect.
    TurnChanged(DraftTurn),
    PickRecorded {
        league_id: LeagueId,
        pick: DraftPick,
    },
    LeaguePortfolio(LeaguePortfolio),
    Portfolios(Vec<Portfolio>),
    LeagueUpdated(LeagueDetails),
    DraftCompleted {
        league_id: LeagueId,
    },
    Leaderboard(Vec<LeaderboardEntry>),
    Acknowledged {
        action: MessageType,
        message: String,
    },
    /// The server rejected a request.
    ActionFailed {
        action: MessageType,
        message: String,
    },
}

// ---------------------------------------------------------------------------
// DraftSession
// ---------------------------------------------------------------------------

pub struct DraftSession {
    transport: TransportChannel,
    cache: Arc<DraftCache>,
    store: Arc<SessionStore>,
    tracker: Arc<TurnTracker>,
    events: broadcast::Sender<SessionEvent>,
    tasks: Vec<JoinHandle<()>>,
}

impl DraftSession {
    /// Build every service over `db`, start the event loop and open the
    /// connection. Must be called from within a tokio runtime.
    pub fn start<C: Connector>(config: &Config, connector: C, db: Arc<Database>) -> Self {
        let transport = TransportChannel::spawn(connector, config.server.endpoint(), &config.reconnect);
        let cache = Arc::new(DraftCache::new(Arc::clone(&db), config.cache.staleness()));
        let store = Arc::new(SessionStore::new(db));
        let tracker = Arc::new(TurnTracker::new(config.draft.rebroadcast_delay()));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let router = Router::new();
        let inbound = router.subscribe_all();
        let turns = tracker.subscribe();
        let transitions = transport.transitions();
        tracker.watch_reconnects(&transport);

        let event_loop = EventLoop {
            transport: transport.clone(),
            cache: Arc::clone(&cache),
            store: Arc::clone(&store),
            tracker: Arc::clone(&tracker),
            events: events.clone(),
            was_open: false,
        };
        let tasks = vec![
            router.spawn(transport.messages()),
            tokio::spawn(event_loop.run(inbound, turns, transitions)),
        ];

        info!("Draft session starting against {}", config.server.endpoint());
        if let Err(e) = transport.connect() {
            warn!("Failed to start connection: {e}");
        }

        DraftSession {
            transport,
            cache,
            store,
            tracker,
            events,
            tasks,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.transport.state()
    }

    pub fn turn_state(&self) -> TurnState {
        self.tracker.state()
    }

    pub fn tracker(&self) -> &TurnTracker {
        &self.tracker
    }

    pub fn is_my_turn(&self) -> bool {
        self.store
            .current_user()
            .is_some_and(|user| self.tracker.is_current_turn(user.id))
    }

    // ------------------------------------------------------------------
    // Session context
    // ------------------------------------------------------------------

    pub fn set_current_user(&self, user: &CurrentUser) -> Result<(), SessionError> {
        self.store.save_current_user(user).map_err(store_error)?;
        info!("Signed in as {} ({})", user.username, user.id);
        Ok(())
    }

    pub fn current_user(&self) -> Option<CurrentUser> {
        self.store.current_user()
    }

    /// Make `league` the active league and ask the server for its current
    /// draft pool. Switching leagues drops the previous league's turn.
    pub fn select_league(&self, league: &LeagueDetails) -> Result<(), SessionError> {
        let previous = self.store.selected_league().map(|l| l.id);
        self.store.save_selected_league(league).map_err(store_error)?;
        if previous != Some(league.id) {
            self.tracker.reset();
        }
        info!("Selected league {} ({})", league.league_name, league.id);
        self.transport
            .send(protocol::league_portfolio_info_request(league.id))?;
        Ok(())
    }

    pub fn selected_league(&self) -> Option<LeagueDetails> {
        self.store.selected_league()
    }

    // ------------------------------------------------------------------
    // Actions
    // ------------------------------------------------------------------

    /// Draft `stock_id` for the current user. Nothing is sent unless the
    /// user is on the clock.
    pub fn draft_stock(&self, stock_id: StockId) -> Result<DraftAttempt, SessionError> {
        let league = self.require_league()?;
        let user = self.require_user()?;
        if !self.tracker.is_current_turn(user.id) {
            info!("Ignoring draft of stock {stock_id}: not {}'s turn", user.username);
            return Ok(DraftAttempt::NotYourTurn);
        }
        debug!("Drafting stock {stock_id} in league {}", league.id);
        self.transport
            .send(protocol::draft_stock_request(league.id, user.id, stock_id))?;
        Ok(DraftAttempt::Sent)
    }

    pub fn queue_up(&self) -> Result<(), SessionError> {
        let league = self.require_league()?;
        let user = self.require_user()?;
        self.transport
            .send(protocol::queue_up_request(league.id, user.id))?;
        Ok(())
    }

    pub fn request_league_portfolio_info(&self) -> Result<(), SessionError> {
        let league = self.require_league()?;
        self.transport
            .send(protocol::league_portfolio_info_request(league.id))?;
        Ok(())
    }

    pub fn request_league_portfolios(&self) -> Result<(), SessionError> {
        let league = self.require_league()?;
        self.transport
            .send(protocol::league_portfolios_request(league.id))?;
        Ok(())
    }

    pub fn request_league_details(&self) -> Result<(), SessionError> {
        let league = self.require_league()?;
        self.transport
            .send(protocol::league_details_request(league.id))?;
        Ok(())
    }

    pub fn request_leaderboard(&self) -> Result<(), SessionError> {
        let league = self.require_league()?;
        self.transport.send(protocol::leaderboard_request(league.id))?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Cache access
    // ------------------------------------------------------------------

    /// Pick history of the selected league, with stale history discarded.
    pub fn cached_picks(&self) -> Result<Vec<DraftPick>, SessionError> {
        let league = self.require_league()?;
        Ok(self.cache.load_draft_state(league.id))
    }

    pub fn cached_stock(&self, stock_id: StockId) -> Result<Option<Stock>, SessionError> {
        let league = self.require_league()?;
        Ok(self.cache.stock(league.id, stock_id))
    }

    /// Forget all cached draft history and stock tables.
    pub fn reset_cache(&self) -> Result<(), SessionError> {
        self.cache.reset_all_draft_states().map_err(store_error)
    }

    /// Stop the event loop, the turn tracker and the transport.
    pub fn shutdown(self) {
        info!("Draft session shutting down");
        self.tracker.stop();
        for task in &self.tasks {
            task.abort();
        }
        self.transport.shutdown();
    }

    fn require_league(&self) -> Result<LeagueDetails, SessionError> {
        self.store
            .selected_league()
            .ok_or(SessionError::NoLeagueSelected)
    }

    fn require_user(&self) -> Result<CurrentUser, SessionError> {
        self.store.current_user().ok_or(SessionError::NoCurrentUser)
    }
}

fn store_error(e: anyhow::Error) -> SessionError {
    SessionError::Store(format!("{e:#}"))
}

// ---------------------------------------------------------------------------
// Event loop
// ---------------------------------------------------------------------------

struct EventLoop {
    transport: TransportChannel,
    cache: Arc<DraftCache>,
    store: Arc<SessionStore>,
    tracker: Arc<TurnTracker>,
    events: broadcast::Sender<SessionEvent>,
    was_open: bool,
}

impl EventLoop {
    async fn run(
        mut self,
        mut inbound: broadcast::Receiver<Inbound>,
        mut turns: broadcast::Receiver<DraftTurn>,
        mut transitions: broadcast::Receiver<ConnectionState>,
    ) {
        info!("Session event loop started");
        loop {
            tokio::select! {
                message = inbound.recv() => match message {
                    Ok(message) => self.handle_inbound(message),
                    Err(RecvError::Lagged(n)) => warn!("Session fell behind; {n} message(s) skipped"),
                    Err(RecvError::Closed) => break,
                },
                turn = turns.recv() => match turn {
                    Ok(turn) => self.emit(SessionEvent::TurnChanged(turn)),
                    Err(RecvError::Lagged(n)) => warn!("Session fell behind; {n} turn update(s) skipped"),
                    Err(RecvError::Closed) => break,
                },
                state = transitions.recv() => match state {
                    Ok(state) => self.handle_transition(state),
                    Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => break,
                },
            }
        }
        info!("Session event loop exiting");
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn handle_transition(&mut self, state: ConnectionState) {
        self.emit(SessionEvent::Connection(state));
        let is_open = state == ConnectionState::Open;
        if is_open && !self.was_open {
            self.refresh_league();
        }
        self.was_open = is_open;
    }

    /// Ask the server for canonical league state after (re)connecting. The
    /// pick history shown meanwhile comes from the staleness-checked cache.
    fn refresh_league(&self) {
        let Some(league) = self.store.selected_league() else {
            return;
        };
        info!("Connected; refreshing league {}", league.id);
        for request in [
            protocol::league_details_request(league.id),
            protocol::league_portfolio_info_request(league.id),
        ] {
            if let Err(e) = self.transport.send(request) {
                warn!("Failed to request league refresh: {e}");
            }
        }
    }

    fn handle_inbound(&self, message: Inbound) {
        match message {
            Inbound::DraftTurnUpdate(turn) => self.on_turn(turn),
            Inbound::DraftPick(pick) => {
                let league_id = pick.league_id;
                match self.cache.add_draft_pick(league_id, pick.into()) {
                    Ok(pick) => self.emit(SessionEvent::PickRecorded { league_id, pick }),
                    Err(e) => warn!("Failed to cache pick for league {league_id}: {e:#}"),
                }
            }
            Inbound::LeaguePortfolioInfo(reply) => {
                if let Some(portfolio) = self.success(MessageType::LeaguePortfolioInfo, reply) {
                    self.on_league_portfolio(portfolio);
                }
            }
            Inbound::LeaguePortfolios(reply) => {
                if let Some(portfolios) = self.success(MessageType::LeaguePortfolios, reply) {
                    self.emit(SessionEvent::Portfolios(portfolios));
                }
            }
            Inbound::LeagueDetails(reply) => {
                if let Some(details) = self.success(MessageType::LeagueDetails, reply) {
                    self.on_league_details(details);
                }
            }
            Inbound::Leaderboard(reply) => {
                if let Some(members) = self.success(MessageType::Leaderboard, reply) {
                    self.emit(SessionEvent::Leaderboard(rank_members(members)));
                }
            }
            Inbound::DraftStock(reply) => self.acknowledge(MessageType::DraftStock, reply),
            Inbound::QueueUp(reply) => self.acknowledge(MessageType::QueueUp, reply),
            Inbound::ServerError(error) => {
                warn!("Server error: {}", error.message);
                self.emit(SessionEvent::ActionFailed {
                    action: MessageType::Error,
                    message: error.message,
                });
            }
            Inbound::Other { kind, .. } => trace!("No session handler for {}", kind.as_str()),
        }
    }

    fn on_turn(&self, turn: DraftTurn) {
        let selected = self.store.selected_league().map(|league| league.id);
        if let Some(selected) = selected {
            if turn.league_id != 0 && turn.league_id != selected {
                debug!("Ignoring turn update for league {}", turn.league_id);
                return;
            }
        }
        self.tracker.apply_turn_update(turn);
    }

    fn on_league_portfolio(&self, portfolio: LeaguePortfolio) {
        let league_id = if portfolio.league_id != 0 {
            Some(portfolio.league_id)
        } else {
            self.store.selected_league().map(|league| league.id)
        };
        match league_id {
            Some(league_id) => {
                if let Err(e) = self.cache.cache_stocks(league_id, portfolio.stocks.iter().cloned()) {
                    warn!("Failed to cache stocks for league {league_id}: {e:#}");
                }
            }
            None => debug!("League portfolio received with no league to file it under"),
        }
        self.emit(SessionEvent::LeaguePortfolio(portfolio));
    }

    fn on_league_details(&self, details: LeagueDetails) {
        let is_selected = self
            .store
            .selected_league()
            .is_some_and(|league| league.id == details.id);
        if is_selected {
            if let Err(e) = self.store.save_selected_league(&details) {
                warn!("Failed to refresh selected league: {e:#}");
            }
            if details.league_state == LeagueState::PostDraft {
                self.tracker.complete();
                self.emit(SessionEvent::DraftCompleted {
                    league_id: details.id,
                });
            }
        }
        self.emit(SessionEvent::LeagueUpdated(details));
    }

    fn success<T>(&self, action: MessageType, reply: Reply<T>) -> Option<T> {
        match reply {
            Reply::Success(value) => Some(value),
            Reply::Failed(error) => {
                warn!("{} failed: {}", action.as_str(), error.message);
                self.emit(SessionEvent::ActionFailed {
                    action,
                    message: error.message,
                });
                None
            }
        }
    }

    fn acknowledge(&self, action: MessageType, reply: Reply<protocol::StatusMessage>) {
        if let Some(status) = self.success(action, reply) {
            debug!("{} acknowledged: {}", action.as_str(), status.message);
            self.emit(SessionEvent::Acknowledged {
                action,
                message: status.message,
            });
        }
    }
}
