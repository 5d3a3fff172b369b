// Draft turn tracking: whose pick it is, a display countdown, and the
// reconnect rebroadcast of the last turn announcement.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::protocol::{DraftTurn, PlayerId};
use crate::transport::{ConnectionState, TransportChannel};

const TICK: Duration = Duration::from_secs(1);
const UPDATE_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnState {
    /// No draft is running.
    NoTurn,
    InTurn {
        player_id: PlayerId,
        remaining_seconds: u32,
    },
    /// The league left the draft phase.
    Completed,
}

pub struct TurnTracker {
    state: Arc<watch::Sender<TurnState>>,
    updates: broadcast::Sender<DraftTurn>,
    last_turn: Arc<Mutex<Option<DraftTurn>>>,
    /// Bumped whenever the running countdown is superseded.
    epoch: Arc<AtomicU64>,
    countdown: Mutex<Option<JoinHandle<()>>>,
    reconnect_watcher: Mutex<Option<JoinHandle<()>>>,
    rebroadcast_delay: Duration,
}

impl TurnTracker {
    pub fn new(rebroadcast_delay: Duration) -> Self {
        TurnTracker {
            state: Arc::new(watch::channel(TurnState::NoTurn).0),
            updates: broadcast::channel(UPDATE_CAPACITY).0,
            last_turn: Arc::new(Mutex::new(None)),
            epoch: Arc::new(AtomicU64::new(0)),
            countdown: Mutex::new(None),
            reconnect_watcher: Mutex::new(None),
            rebroadcast_delay,
        }
    }

    pub fn state(&self) -> TurnState {
        self.state.borrow().clone()
    }

    /// Observe the turn state, including countdown ticks.
    pub fn watch(&self) -> watch::Receiver<TurnState> {
        self.state.subscribe()
    }

    /// Turn announcements as received, plus reconnect rebroadcasts.
    pub fn subscribe(&self) -> broadcast::Receiver<DraftTurn> {
        self.updates.subscribe()
    }

    pub fn last_turn(&self) -> Option<DraftTurn> {
        self.lock_last_turn().clone()
    }

    pub fn is_current_turn(&self, self_id: PlayerId) -> bool {
        matches!(*self.state.borrow(), TurnState::InTurn { player_id, .. } if player_id == self_id)
    }

    /// Replace the whole turn state with `turn` and restart the countdown
    /// from the server's remaining time.
    pub fn apply_turn_update(&self, turn: DraftTurn) {
        debug!(
            "Turn update: player {} with {}s remaining",
            turn.player_id, turn.remaining_seconds
        );
        *self.lock_last_turn() = Some(turn.clone());

        let epoch = self.supersede_countdown();
        self.state.send_replace(TurnState::InTurn {
            player_id: turn.player_id,
            remaining_seconds: turn.remaining_seconds,
        });
        if turn.remaining_seconds > 0 {
            let handle = spawn_countdown(Arc::clone(&self.state), Arc::clone(&self.epoch), epoch);
            *self.lock_countdown() = Some(handle);
        }

        let _ = self.updates.send(turn);
    }

    /// The draft is over; stop counting. The last announcement is
    /// forgotten so a reconnect cannot revive it.
    pub fn complete(&self) {
        self.supersede_countdown();
        *self.lock_last_turn() = None;
        if self.state.send_replace(TurnState::Completed) != TurnState::Completed {
            info!("Draft completed");
        }
    }

    /// Forget everything about the current draft, e.g. when another league
    /// is selected.
    pub fn reset(&self) {
        self.supersede_countdown();
        *self.lock_last_turn() = None;
        if self.state.send_replace(TurnState::NoTurn) != TurnState::NoTurn {
            debug!("Turn state reset");
        }
    }

    /// Rebroadcast the last turn announcement each time `transport` reopens
    /// after a loss, once `rebroadcast_delay` has passed.
    pub fn watch_reconnects(&self, transport: &TransportChannel) {
        let mut transitions = transport.transitions();
        let mut was_open = transport.state() == ConnectionState::Open;
        let mut opened_before = was_open;
        let updates = self.updates.clone();
        let turn_state = Arc::clone(&self.state);
        let last_turn = Arc::clone(&self.last_turn);
        let delay = self.rebroadcast_delay;

        let handle = tokio::spawn(async move {
            loop {
                let state = match transitions.recv().await {
                    Ok(state) => state,
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break,
                };
                let is_open = state == ConnectionState::Open;
                // The first open is a connect, not a reconnect.
                let reconnected = is_open && !was_open && opened_before;
                opened_before |= is_open;
                if reconnected {
                    tokio::time::sleep(delay).await;
                    // Only a running turn is announced again.
                    let in_turn = matches!(*turn_state.borrow(), TurnState::InTurn { .. });
                    let turn = last_turn.lock().expect("turn tracker mutex poisoned").clone();
                    if let Some(turn) = turn.filter(|_| in_turn) {
                        debug!("Rebroadcasting turn of player {} after reconnect", turn.player_id);
                        let _ = updates.send(turn);
                    }
                }
                was_open = is_open;
            }
        });

        if let Some(previous) = self.lock_watcher().replace(handle) {
            previous.abort();
        }
    }

    /// Tear down the countdown and the reconnect watcher.
    pub fn stop(&self) {
        self.supersede_countdown();
        if let Some(watcher) = self.lock_watcher().take() {
            watcher.abort();
        }
    }

    fn supersede_countdown(&self) -> u64 {
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(previous) = self.lock_countdown().take() {
            previous.abort();
        }
        epoch
    }

    fn lock_last_turn(&self) -> std::sync::MutexGuard<'_, Option<DraftTurn>> {
        self.last_turn.lock().expect("turn tracker mutex poisoned")
    }

    fn lock_countdown(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.countdown.lock().expect("turn tracker mutex poisoned")
    }

    fn lock_watcher(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.reconnect_watcher.lock().expect("turn tracker mutex poisoned")
    }
}

impl Drop for TurnTracker {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Decrement the remaining time once per second until it reaches zero. At
/// zero nothing happens; the server announces the next turn.
fn spawn_countdown(
    state: Arc<watch::Sender<TurnState>>,
    current_epoch: Arc<AtomicU64>,
    epoch: u64,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + TICK, TICK);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            if current_epoch.load(Ordering::SeqCst) != epoch {
                break;
            }
            let mut finished = false;
            state.send_if_modified(|state| match state {
                TurnState::InTurn {
                    remaining_seconds, ..
                } if *remaining_seconds > 0 => {
                    *remaining_seconds -= 1;
                    finished = *remaining_seconds == 0;
                    true
                }
                _ => {
                    finished = true;
                    false
                }
            });
            if finished {
                debug!("Turn clock reached zero; waiting for the server");
                break;
            }
        }
    })
}
