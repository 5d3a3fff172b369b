// Durable session keys: selected league snapshot, current user, auth token.

use std::sync::Arc;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::db::Database;
use crate::protocol::{LeagueDetails, PlayerId};

pub const SELECTED_LEAGUE_KEY: &str = "selectedLeague";
pub const CURRENT_USER_KEY: &str = "currentUser";
pub const TOKEN_KEY: &str = "token";

/// The signed-in user as known to the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrentUser {
    pub id: PlayerId,
    pub username: String,
    #[serde(default)]
    pub email: String,
}

pub struct SessionStore {
    db: Arc<Database>,
}

impl SessionStore {
    pub fn new(db: Arc<Database>) -> Self {
        SessionStore { db }
    }

    pub fn save_selected_league(&self, league: &LeagueDetails) -> Result<()> {
        self.save(SELECTED_LEAGUE_KEY, league)
    }

    pub fn selected_league(&self) -> Option<LeagueDetails> {
        self.load(SELECTED_LEAGUE_KEY)
    }

    pub fn clear_selected_league(&self) -> Result<()> {
        self.db.remove(SELECTED_LEAGUE_KEY)?;
        Ok(())
    }

    pub fn save_current_user(&self, user: &CurrentUser) -> Result<()> {
        self.save(CURRENT_USER_KEY, user)
    }

    pub fn current_user(&self) -> Option<CurrentUser> {
        self.load(CURRENT_USER_KEY)
    }

    /// The token is issued elsewhere and stored verbatim.
    pub fn save_token(&self, token: &str) -> Result<()> {
        self.db.put(TOKEN_KEY, token)
    }

    pub fn token(&self) -> Option<String> {
        self.db.get(TOKEN_KEY).unwrap_or_else(|e| {
            warn!("Failed to read {TOKEN_KEY}: {e:#}");
            None
        })
    }

    /// Forget the user, the token and the selected league (sign-out).
    pub fn clear(&self) -> Result<()> {
        for key in [SELECTED_LEAGUE_KEY, CURRENT_USER_KEY, TOKEN_KEY] {
            self.db.remove(key)?;
        }
        Ok(())
    }

    fn save<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let json = serde_json::to_string(value)
            .with_context(|| format!("failed to serialize {key}"))?;
        self.db.put(key, &json)
    }

    fn load<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let text = match self.db.get(key) {
            Ok(text) => text?,
            Err(e) => {
                warn!("Failed to read {key}: {e:#}");
                return None;
            }
        };
        match serde_json::from_str(&text) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("Ignoring malformed session entry {key}: {e}");
                None
            }
        }
    }
}
