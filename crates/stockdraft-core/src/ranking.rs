// Leaderboard ranking with carried ties.

use serde::{Deserialize, Serialize};

use crate::protocol::ScoredMember;

/// One ranked leaderboard row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaderboardEntry {
    pub username: String,
    pub total_value: f64,
    pub rank: usize,
}

/// Rank members by descending total value.
///
/// The first member is rank 1. A member whose value equals its predecessor's
/// inherits the predecessor's rank; any other member takes its 1-based
/// position in the sorted order. Members with equal values keep their input
/// order.
pub fn rank_members(mut members: Vec<ScoredMember>) -> Vec<LeaderboardEntry> {
    members.sort_by(|a, b| b.total_value.total_cmp(&a.total_value));

    let mut ranked: Vec<LeaderboardEntry> = Vec::with_capacity(members.len());
    for (idx, member) in members.into_iter().enumerate() {
        let rank = match ranked.last() {
            Some(prev) if prev.total_value == member.total_value => prev.rank,
            _ => idx + 1,
        };
        ranked.push(LeaderboardEntry {
            username: member.username,
            total_value: member.total_value,
            rank,
        });
    }
    ranked
}
