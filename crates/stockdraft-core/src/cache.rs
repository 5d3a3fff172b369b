// Per-league resilient cache of draft pick history and drafted-stock lookups.
//
// Every read goes to the in-memory mirror first and falls back to the
// durable store. The cache is a display aid: the server stays authoritative,
// so anything unreadable is treated as absent rather than reported.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::db::Database;
use crate::protocol::{LeagueId, PickBroadcast, PlayerId, Stock, StockId};

pub const PICKS_KEY_PREFIX: &str = "draftPicks_";
pub const STOCKS_KEY_PREFIX: &str = "stocksMapCache_";

pub fn picks_key(league_id: LeagueId) -> String {
    format!("{PICKS_KEY_PREFIX}{league_id}")
}

pub fn stocks_key(league_id: LeagueId) -> String {
    format!("{STOCKS_KEY_PREFIX}{league_id}")
}

/// One completed pick in a league's history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DraftPick {
    pub player_id: PlayerId,
    pub stock_id: StockId,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

impl From<PickBroadcast> for DraftPick {
    fn from(pick: PickBroadcast) -> Self {
        DraftPick {
            player_id: pick.player_id,
            stock_id: pick.stock_id,
            timestamp: pick.timestamp,
        }
    }
}

pub struct DraftCache {
    db: Arc<Database>,
    staleness: chrono::Duration,
    picks: Mutex<HashMap<LeagueId, Vec<DraftPick>>>,
    stocks: Mutex<HashMap<LeagueId, BTreeMap<StockId, Stock>>>,
}

impl DraftCache {
    pub fn new(db: Arc<Database>, staleness: chrono::Duration) -> Self {
        DraftCache {
            db,
            staleness,
            picks: Mutex::new(HashMap::new()),
            stocks: Mutex::new(HashMap::new()),
        }
    }

    fn picks_mirror(&self) -> MutexGuard<'_, HashMap<LeagueId, Vec<DraftPick>>> {
        self.picks.lock().expect("pick cache mutex poisoned")
    }

    fn stocks_mirror(&self) -> MutexGuard<'_, HashMap<LeagueId, BTreeMap<StockId, Stock>>> {
        self.stocks.lock().expect("stock cache mutex poisoned")
    }

    // ------------------------------------------------------------------
    // Pick history
    // ------------------------------------------------------------------

    /// Replace the full pick list for `league_id` in memory and on disk.
    pub fn save_draft_state(&self, league_id: LeagueId, picks: &[DraftPick]) -> Result<()> {
        self.picks_mirror().insert(league_id, picks.to_vec());
        let json = serde_json::to_string(picks).context("failed to serialize draft picks")?;
        self.db
            .put(&picks_key(league_id), &json)
            .with_context(|| format!("failed to persist draft picks for league {league_id}"))
    }

    /// Load the pick history for `league_id`, discarding it if stale.
    pub fn load_draft_state(&self, league_id: LeagueId) -> Vec<DraftPick> {
        self.load_draft_state_at(league_id, Utc::now())
    }

    /// Same as [`load_draft_state`](Self::load_draft_state) with an explicit
    /// notion of "now".
    pub fn load_draft_state_at(&self, league_id: LeagueId, now: DateTime<Utc>) -> Vec<DraftPick> {
        let cached = self.picks_mirror().get(&league_id).cloned();
        let picks = match cached {
            Some(picks) => picks,
            None => {
                let picks = self.read_durable_picks(league_id);
                if !picks.is_empty() {
                    self.picks_mirror().insert(league_id, picks.clone());
                }
                picks
            }
        };

        if picks.is_empty() || !self.is_stale(&picks, now) {
            return picks;
        }

        info!(
            "Cached draft history for league {league_id} is stale ({} picks); discarding",
            picks.len()
        );
        if let Err(e) = self.clear_draft_state(league_id) {
            warn!("Failed to clear stale draft history for league {league_id}: {e:#}");
        }
        Vec::new()
    }

    /// Append one pick to the league's history. A pick without a server
    /// timestamp is stamped with the local clock. Returns the stored pick.
    pub fn add_draft_pick(&self, league_id: LeagueId, pick: DraftPick) -> Result<DraftPick> {
        let pick = DraftPick {
            timestamp: pick.timestamp.or_else(|| Some(Utc::now())),
            ..pick
        };
        let mut picks = self.load_draft_state(league_id);
        picks.push(pick.clone());
        self.save_draft_state(league_id, &picks)?;
        debug!(
            "Cached pick for league {league_id}: player {} took stock {} ({} total)",
            pick.player_id,
            pick.stock_id,
            picks.len()
        );
        Ok(pick)
    }

    /// Wipe the pick history of one league.
    pub fn clear_draft_state(&self, league_id: LeagueId) -> Result<()> {
        self.picks_mirror().remove(&league_id);
        self.db
            .remove(&picks_key(league_id))
            .with_context(|| format!("failed to clear draft picks for league {league_id}"))?;
        Ok(())
    }

    /// Wipe every league's pick history and stock lookups.
    pub fn reset_all_draft_states(&self) -> Result<()> {
        self.picks_mirror().clear();
        self.stocks_mirror().clear();
        let picks = self.db.remove_prefix(PICKS_KEY_PREFIX)?;
        let stocks = self.db.remove_prefix(STOCKS_KEY_PREFIX)?;
        info!("Reset draft cache: removed {picks} pick lists and {stocks} stock tables");
        Ok(())
    }

    /// A history is stale when its most recent pick is older than the
    /// threshold. A missing timestamp counts as stale.
    fn is_stale(&self, picks: &[DraftPick], now: DateTime<Utc>) -> bool {
        match picks.last().and_then(|p| p.timestamp) {
            Some(ts) => now.signed_duration_since(ts) > self.staleness,
            None => true,
        }
    }

    fn read_durable_picks(&self, league_id: LeagueId) -> Vec<DraftPick> {
        let key = picks_key(league_id);
        let text = match self.db.get(&key) {
            Ok(Some(text)) => text,
            Ok(None) => return Vec::new(),
            Err(e) => {
                warn!("Failed to read {key}: {e:#}");
                return Vec::new();
            }
        };
        serde_json::from_str(&text).unwrap_or_else(|e| {
            warn!("Ignoring malformed cache entry {key}: {e}");
            Vec::new()
        })
    }

    // ------------------------------------------------------------------
    // Stock lookup
    // ------------------------------------------------------------------

    /// Merge stock records into the league's lookup table. Records are never
    /// removed by this path.
    pub fn cache_stocks<I>(&self, league_id: LeagueId, stocks: I) -> Result<()>
    where
        I: IntoIterator<Item = Stock>,
    {
        let table = {
            let mut mirror = self.stocks_mirror();
            if !mirror.contains_key(&league_id) {
                let loaded = self.read_durable_stocks(league_id);
                mirror.insert(league_id, loaded);
            }
            let table = mirror.entry(league_id).or_default();
            for stock in stocks {
                table.insert(stock.id, stock);
            }
            table.values().cloned().collect::<Vec<_>>()
        };
        let json = serde_json::to_string(&table).context("failed to serialize stock table")?;
        self.db
            .put(&stocks_key(league_id), &json)
            .with_context(|| format!("failed to persist stock table for league {league_id}"))
    }

    /// Resolve a stock by id within one league.
    pub fn stock(&self, league_id: LeagueId, stock_id: StockId) -> Option<Stock> {
        self.with_stock_table(league_id, |table| table.get(&stock_id).cloned())
    }

    /// Every cached stock of a league, ordered by id.
    pub fn stocks(&self, league_id: LeagueId) -> Vec<Stock> {
        self.with_stock_table(league_id, |table| table.values().cloned().collect())
    }

    fn with_stock_table<T>(
        &self,
        league_id: LeagueId,
        f: impl FnOnce(&BTreeMap<StockId, Stock>) -> T,
    ) -> T {
        let mut mirror = self.stocks_mirror();
        if !mirror.contains_key(&league_id) {
            let loaded = self.read_durable_stocks(league_id);
            if loaded.is_empty() {
                return f(&BTreeMap::new());
            }
            mirror.insert(league_id, loaded);
        }
        f(mirror.entry(league_id).or_default())
    }

    fn read_durable_stocks(&self, league_id: LeagueId) -> BTreeMap<StockId, Stock> {
        let key = stocks_key(league_id);
        let text = match self.db.get(&key) {
            Ok(Some(text)) => text,
            Ok(None) => return BTreeMap::new(),
            Err(e) => {
                warn!("Failed to read {key}: {e:#}");
                return BTreeMap::new();
            }
        };
        match serde_json::from_str::<Vec<Stock>>(&text) {
            Ok(stocks) => stocks.into_iter().map(|s| (s.id, s)).collect(),
            Err(e) => {
                warn!("Ignoring malformed cache entry {key}: {e}");
                BTreeMap::new()
            }
        }
    }
}
