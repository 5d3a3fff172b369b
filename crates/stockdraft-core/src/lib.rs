// Library root: the draft synchronization subsystem. Transport, routing,
// caching, turn tracking and ranking, each usable on its own.

pub mod cache;
pub mod config;
pub mod db;
pub mod protocol;
pub mod ranking;
pub mod router;
pub mod session_store;
pub mod transport;
pub mod turn;
