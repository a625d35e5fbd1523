//! Slot schedule arithmetic and the per-block consensus state.
//!
//! Every bookkeeper computes the same leader for the same slot with no
//! coordination: the leader is a deterministic function of the slot index
//! and the ordered bookkeeper list, nothing else.

use crate::hash::ValidatorId;
use serde::{Deserialize, Serialize};

/// Errors from slot-schedule computation
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SlotError {
    /// The elapsed time does not land on a slot boundary
    #[error("current time is not a block production slot")]
    NotForgeTime,

    /// No leader can be derived for the slot (empty or inconsistent
    /// bookkeeper list)
    #[error("no leader found for slot")]
    NoLeaderFound,
}

/// Slot schedule parameters.
///
/// Defaults follow the network's standard cadence: one block every 15
/// seconds, four bookkeepers rotating over a 40-slot generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotConfig {
    /// Length of one production slot, seconds
    pub slot_secs: i64,

    /// Number of bookkeepers in a generation
    pub generation_size: u64,

    /// Generation length, in multiples of `generation_size` slots
    pub generation_stride: u64,

    /// Minimum remaining slot time worth starting a build for, milliseconds
    pub min_produce_ms: i64,

    /// Hard cap on time spent building one block, milliseconds
    pub max_produce_ms: i64,
}

impl Default for SlotConfig {
    fn default() -> Self {
        Self {
            slot_secs: 15,
            generation_size: 4,
            generation_stride: 10,
            min_produce_ms: 2250,
            max_produce_ms: 5250,
        }
    }
}

impl SlotConfig {
    /// Slot length in milliseconds.
    pub fn slot_ms(&self) -> i64 {
        self.slot_secs * 1000
    }

    /// Generation length in slots.
    pub fn generation_slots(&self) -> i64 {
        (self.generation_size * self.generation_stride) as i64
    }

    /// The latest slot boundary at or before `now_ms` that a block could
    /// have been produced in.
    pub fn last_chance(&self, now_ms: i64) -> i64 {
        ((now_ms - 1000) / self.slot_ms()) * self.slot_ms()
    }

    /// The next slot boundary at or after `now_ms`.
    pub fn next_chance(&self, now_ms: i64) -> i64 {
        ((now_ms + self.slot_ms() - 1000) / self.slot_ms()) * self.slot_ms()
    }

    /// Deadline for a build starting at `now_ms`: the next slot boundary,
    /// capped at `max_produce_ms` from now.
    pub fn produce_deadline(&self, now_ms: i64) -> i64 {
        let next_point = self.next_chance(now_ms);
        let remain = next_point - now_ms;
        if self.max_produce_ms > remain {
            next_point
        } else {
            now_ms + self.max_produce_ms
        }
    }
}

/// Consensus state snapshot attached to every block.
///
/// `leader` is always derived from `(timestamp, bookkeepers)` - it is never
/// set independently, and states are never mutated in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusState {
    /// Slot-aligned timestamp of the block, unix seconds
    pub timestamp: i64,

    /// Leader for the slot at `timestamp`
    pub leader: ValidatorId,

    /// Ordered bookkeeper identities
    pub bookkeepers: Vec<ValidatorId>,
}

impl ConsensusState {
    /// State at a given timestamp - used to seed the chain at genesis.
    pub fn at(
        timestamp: i64,
        bookkeepers: Vec<ValidatorId>,
        config: &SlotConfig,
    ) -> Result<Self, SlotError> {
        let leader = leader_at(timestamp, &bookkeepers, config)?;
        Ok(Self {
            timestamp,
            leader,
            bookkeepers,
        })
    }

    /// Advance the state by `elapsed_secs` and recompute the leader.
    ///
    /// Fails with [`SlotError::NotForgeTime`] unless the elapsed time lands
    /// exactly on a slot boundary.
    pub fn next_consensus_state(
        &self,
        elapsed_secs: i64,
        config: &SlotConfig,
    ) -> Result<Self, SlotError> {
        if elapsed_secs % config.slot_secs != 0 {
            return Err(SlotError::NotForgeTime);
        }

        let timestamp = self.timestamp + elapsed_secs;
        let leader = leader_at(timestamp, &self.bookkeepers, config)?;
        Ok(Self {
            timestamp,
            leader,
            bookkeepers: self.bookkeepers.clone(),
        })
    }
}

/// Derive the leader for the slot containing `timestamp`.
///
/// The slot index is reduced modulo the generation length, then modulo the
/// bookkeeper count, so the schedule repeats every generation.
fn leader_at(
    timestamp: i64,
    bookkeepers: &[ValidatorId],
    config: &SlotConfig,
) -> Result<ValidatorId, SlotError> {
    if bookkeepers.is_empty() {
        return Err(SlotError::NoLeaderFound);
    }

    let slot = timestamp.div_euclid(config.slot_secs);
    let index = slot.rem_euclid(config.generation_slots()).rem_euclid(bookkeepers.len() as i64);
    bookkeepers.get(index as usize).copied().ok_or(SlotError::NoLeaderFound)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(n: u8) -> Vec<ValidatorId> {
        (0..n)
            .map(|i| {
                let mut bytes = [0u8; 32];
                bytes[0] = i + 1;
                ValidatorId::new(bytes)
            })
            .collect()
    }

    #[test]
    fn leader_is_deterministic() {
        let config = SlotConfig::default();
        let a = ConsensusState::at(150, ids(4), &config).unwrap();
        let b = ConsensusState::at(150, ids(4), &config).unwrap();
        assert_eq!(a.leader, b.leader);
    }

    #[test]
    fn leaders_rotate_across_slots() {
        let config = SlotConfig::default();
        let bookkeepers = ids(4);
        let state = ConsensusState::at(0, bookkeepers.clone(), &config).unwrap();

        let mut seen = Vec::new();
        let mut current = state;
        for _ in 0..4 {
            seen.push(current.leader);
            current = current.next_consensus_state(config.slot_secs, &config).unwrap();
        }
        // One full rotation covers every bookkeeper exactly once
        let mut sorted = seen.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(sorted.len(), bookkeepers.len());
    }

    #[test]
    fn misaligned_elapsed_time_is_rejected() {
        let config = SlotConfig::default();
        let state = ConsensusState::at(0, ids(4), &config).unwrap();
        assert_eq!(
            state.next_consensus_state(7, &config),
            Err(SlotError::NotForgeTime)
        );
        assert!(state.next_consensus_state(30, &config).is_ok());
    }

    #[test]
    fn empty_bookkeepers_has_no_leader() {
        let config = SlotConfig::default();
        assert_eq!(
            ConsensusState::at(0, Vec::new(), &config),
            Err(SlotError::NoLeaderFound)
        );
    }

    #[test]
    fn advancing_preserves_schedule() {
        let config = SlotConfig::default();
        let state = ConsensusState::at(0, ids(4), &config).unwrap();
        // Two single-slot steps equal one double-slot step
        let stepped = state
            .next_consensus_state(15, &config)
            .unwrap()
            .next_consensus_state(15, &config)
            .unwrap();
        let jumped = state.next_consensus_state(30, &config).unwrap();
        assert_eq!(stepped, jumped);
    }

    #[test]
    fn chance_windows() {
        let config = SlotConfig::default();
        // Just after a boundary: last chance is the previous boundary
        assert_eq!(config.last_chance(16_000), 15_000);
        assert_eq!(config.next_chance(16_000), 30_000);
        // On the boundary itself (minus the one-second tick grace)
        assert_eq!(config.next_chance(15_000), 15_000);
    }

    #[test]
    fn deadline_is_capped() {
        let config = SlotConfig::default();
        // 14s remain to the next boundary - cap at max_produce_ms
        assert_eq!(config.produce_deadline(16_000), 16_000 + config.max_produce_ms);
        // 2s remain - the boundary wins
        assert_eq!(config.produce_deadline(28_000), 30_000);
    }
}
