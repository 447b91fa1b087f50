//! HTP-within-highest-priority merge across the sources of one universe.
//!
//! The merger keeps three 512-wide output arrays (level, winning
//! priority, winner identity) and per-source input state. Updates are
//! incremental: only slots whose effective level or priority actually
//! changed are re-merged, and a slot is only rescanned across all
//! sources when its current winner backed off.
//!
//! Priority semantics: a slot's effective priority of 0 means "not
//! sourced". A source without a per-address-priority stream contributes
//! `max(1, universe_priority)` on every slot, so a universe priority of
//! 0 still sources every slot at the floor priority of 1.

use std::collections::HashMap;

use thiserror::Error;
use uuid::Uuid;

use crate::priority::{Priority, PRIORITY_MAX};
use crate::UNIVERSE_SIZE;

/// Owner-index sentinel for an unsourced slot.
const NO_OWNER: u16 = u16::MAX;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MergeError {
    #[error("source already exists in merger")]
    SourceExists,
    #[error("source does not exist in merger")]
    UnknownSource,
    #[error("incorrect levels count: {count}")]
    InvalidLevelCount { count: usize },
    #[error("incorrect priorities count: {count}")]
    InvalidPriorityCount { count: usize },
}

#[derive(Debug, Clone)]
struct MergerSource {
    cid: Uuid,
    levels: [u8; UNIVERSE_SIZE],
    level_count: usize,
    universe_priority: Priority,
    /// Effective per-slot priorities, already translated: either the
    /// broadcast universe priority or the live PAP stream. 0 = unsourced.
    address_priorities: [u8; UNIVERSE_SIZE],
    pap_count: usize,
    using_universe_priority: bool,
    /// True until the first levels/universe-priority update. A source
    /// whose first packet was PAP sits here sourcing nothing.
    universe_priority_uninitialized: bool,
}

impl MergerSource {
    fn new(cid: Uuid) -> Self {
        MergerSource {
            cid,
            levels: [0; UNIVERSE_SIZE],
            level_count: 0,
            universe_priority: Priority::default(),
            address_priorities: [0; UNIVERSE_SIZE],
            pap_count: 0,
            using_universe_priority: true,
            universe_priority_uninitialized: true,
        }
    }

    fn level(&self, slot: usize) -> u8 {
        if slot < self.level_count {
            self.levels[slot]
        } else {
            0
        }
    }

    fn priority(&self, slot: usize) -> u8 {
        self.address_priorities[slot]
    }

    /// The broadcast value every slot gets while no PAP stream is live.
    fn universe_slot_priority(&self) -> u8 {
        if self.universe_priority_uninitialized {
            0
        } else {
            self.universe_priority.get().max(1)
        }
    }
}

/// Point-in-time copy of one source's inputs, used to migrate a source
/// between mergers when a receiver's sampling period ends.
#[derive(Debug, Clone)]
pub struct SourceSnapshot {
    pub levels: Vec<u8>,
    pub universe_priority: Option<Priority>,
    pub per_address_priorities: Option<Vec<u8>>,
}

/// Merged view of one universe.
pub struct Merger {
    levels: [u8; UNIVERSE_SIZE],
    winning_priorities: [u8; UNIVERSE_SIZE],
    owners: [u16; UNIVERSE_SIZE],
    sources: Vec<Option<MergerSource>>,
    index: HashMap<Uuid, usize>,
}

impl Default for Merger {
    fn default() -> Self {
        Self::new()
    }
}

impl Merger {
    pub fn new() -> Self {
        Merger {
            levels: [0; UNIVERSE_SIZE],
            winning_priorities: [0; UNIVERSE_SIZE],
            owners: [NO_OWNER; UNIVERSE_SIZE],
            sources: Vec::new(),
            index: HashMap::new(),
        }
    }

    // -- Read side --

    pub fn levels(&self) -> &[u8; UNIVERSE_SIZE] {
        &self.levels
    }

    pub fn winning_priorities(&self) -> &[u8; UNIVERSE_SIZE] {
        &self.winning_priorities
    }

    pub fn winner(&self, slot: usize) -> Option<Uuid> {
        let owner = self.owners[slot];
        if owner == NO_OWNER {
            None
        } else {
            self.sources[owner as usize].as_ref().map(|s| s.cid)
        }
    }

    pub fn winners(&self) -> Box<[Option<Uuid>; UNIVERSE_SIZE]> {
        let mut out = Box::new([None; UNIVERSE_SIZE]);
        for slot in 0..UNIVERSE_SIZE {
            out[slot] = self.winner(slot);
        }
        out
    }

    pub fn active_sources(&self) -> Vec<Uuid> {
        self.sources
            .iter()
            .flatten()
            .map(|source| source.cid)
            .collect()
    }

    pub fn source_count(&self) -> usize {
        self.index.len()
    }

    pub fn contains_source(&self, cid: &Uuid) -> bool {
        self.index.contains_key(cid)
    }

    pub fn source_snapshot(&self, cid: &Uuid) -> Option<SourceSnapshot> {
        let source = self.source(cid)?;
        Some(SourceSnapshot {
            levels: source.levels[..source.level_count].to_vec(),
            universe_priority: if source.universe_priority_uninitialized {
                None
            } else {
                Some(source.universe_priority)
            },
            per_address_priorities: if source.using_universe_priority {
                None
            } else {
                Some(source.address_priorities[..source.pap_count].to_vec())
            },
        })
    }

    // -- Source lifecycle --

    pub fn add_source(&mut self, cid: Uuid) -> Result<(), MergeError> {
        if self.index.contains_key(&cid) {
            return Err(MergeError::SourceExists);
        }
        let slot = self
            .sources
            .iter()
            .position(Option::is_none)
            .unwrap_or_else(|| {
                self.sources.push(None);
                self.sources.len() - 1
            });
        self.sources[slot] = Some(MergerSource::new(cid));
        self.index.insert(cid, slot);
        Ok(())
    }

    pub fn remove_source(&mut self, cid: &Uuid) -> Result<(), MergeError> {
        let idx = self.index.remove(cid).ok_or(MergeError::UnknownSource)?;
        self.sources[idx] = None;
        for slot in 0..UNIVERSE_SIZE {
            if self.owners[slot] == idx as u16 {
                self.rescan_slot(slot);
            }
        }
        Ok(())
    }

    // -- Input updates --

    /// Replace a source's level data. Shorter inputs leave the tail
    /// slots at level 0; they stay sourced at the slot priority.
    pub fn update_levels(&mut self, cid: &Uuid, levels: &[u8]) -> Result<(), MergeError> {
        if levels.len() > UNIVERSE_SIZE {
            return Err(MergeError::InvalidLevelCount {
                count: levels.len(),
            });
        }
        let idx = self.source_index(cid)?;

        // Commit the source's new state before touching the outputs so
        // any rescan observes a consistent view.
        let old_levels: [u8; UNIVERSE_SIZE] = {
            let source = self.source_at(idx);
            std::array::from_fn(|slot| source.level(slot))
        };
        {
            let source = self.source_mut_at(idx);
            source.levels[..levels.len()].copy_from_slice(levels);
            source.levels[levels.len()..].fill(0);
            source.level_count = levels.len();
        }

        if self.is_sole_source(idx) {
            self.rewrite_sole_source(idx);
            return Ok(());
        }

        for slot in 0..UNIVERSE_SIZE {
            let source = self.source_at(idx);
            let new = source.level(slot);
            let old = old_levels[slot];
            if old == new {
                continue;
            }
            let priority = source.priority(slot);
            self.merge_slot(slot, idx, priority, new, old);
        }
        Ok(())
    }

    /// Change a source's universe priority. Only affects the merge while
    /// the source has no live PAP stream.
    pub fn update_universe_priority(
        &mut self,
        cid: &Uuid,
        priority: Priority,
    ) -> Result<(), MergeError> {
        let idx = self.source_index(cid)?;
        {
            let source = self.source_mut_at(idx);
            source.universe_priority = priority;
            source.universe_priority_uninitialized = false;
        }
        if self.source_at(idx).using_universe_priority {
            self.rebroadcast_universe_priority(idx);
        }
        Ok(())
    }

    /// Install or replace a source's per-address-priority stream.
    /// Values above 200 are capped; slots beyond the stream length are
    /// unsourced.
    pub fn update_pap(&mut self, cid: &Uuid, priorities: &[u8]) -> Result<(), MergeError> {
        if priorities.len() > UNIVERSE_SIZE {
            return Err(MergeError::InvalidPriorityCount {
                count: priorities.len(),
            });
        }
        let idx = self.source_index(cid)?;
        {
            let source = self.source_mut_at(idx);
            source.using_universe_priority = false;
            source.pap_count = priorities.len();
        }
        let mut effective = [0u8; UNIVERSE_SIZE];
        for (slot, &p) in priorities.iter().enumerate() {
            effective[slot] = p.min(PRIORITY_MAX);
        }
        self.apply_priorities(idx, &effective);
        Ok(())
    }

    /// Drop a source's PAP stream, falling back to its universe
    /// priority on every slot. Used when the 0xDD stream times out.
    pub fn remove_pap(&mut self, cid: &Uuid) -> Result<(), MergeError> {
        let idx = self.source_index(cid)?;
        {
            let source = self.source_mut_at(idx);
            source.using_universe_priority = true;
            source.pap_count = 0;
        }
        self.rebroadcast_universe_priority(idx);
        Ok(())
    }

    // -- Merge core --

    fn rebroadcast_universe_priority(&mut self, idx: usize) {
        let value = self.source_at(idx).universe_slot_priority();
        self.apply_priorities(idx, &[value; UNIVERSE_SIZE]);
    }

    /// Swap in a full effective-priority array for a source, re-merging
    /// every slot whose value changed.
    fn apply_priorities(&mut self, idx: usize, effective: &[u8; UNIVERSE_SIZE]) {
        let old = std::mem::replace(&mut self.source_mut_at(idx).address_priorities, *effective);
        if self.is_sole_source(idx) {
            self.rewrite_sole_source(idx);
            return;
        }
        for slot in 0..UNIVERSE_SIZE {
            let new = effective[slot];
            if old[slot] == new {
                continue;
            }
            let level = self.source_at(idx).level(slot);
            self.merge_slot_priority_change(slot, idx, new, level);
        }
    }

    /// Re-merge one slot after source `idx` changed its level on it.
    /// The source's priority on the slot is unchanged.
    fn merge_slot(&mut self, slot: usize, idx: usize, priority: u8, new_level: u8, old_level: u8) {
        let owner = self.owners[slot];
        if owner == idx as u16 {
            if new_level >= old_level {
                self.levels[slot] = new_level;
            } else {
                // The winner dimmed; someone tied on priority may now be
                // brighter.
                self.rescan_slot(slot);
            }
            return;
        }
        if priority == 0 {
            return;
        }
        let winning = self.winning_priorities[slot];
        if priority > winning || (priority == winning && new_level > self.levels[slot]) {
            self.take_slot(slot, idx, priority, new_level);
        }
    }

    /// Re-merge one slot after source `idx` changed its priority on it.
    fn merge_slot_priority_change(&mut self, slot: usize, idx: usize, priority: u8, level: u8) {
        let owner = self.owners[slot];
        let winning = self.winning_priorities[slot];
        if owner == idx as u16 {
            if priority > winning {
                self.winning_priorities[slot] = priority;
                self.levels[slot] = level;
            } else {
                // Owner backed off (or left the slot entirely).
                self.rescan_slot(slot);
            }
            return;
        }
        if priority > winning || (priority == winning && priority > 0 && level > self.levels[slot])
        {
            self.take_slot(slot, idx, priority, level);
        }
    }

    fn take_slot(&mut self, slot: usize, idx: usize, priority: u8, level: u8) {
        self.winning_priorities[slot] = priority;
        self.levels[slot] = level;
        self.owners[slot] = idx as u16;
    }

    /// Full per-slot recompute across all sources. Only reached when the
    /// current winner lowered itself or disappeared.
    fn rescan_slot(&mut self, slot: usize) {
        let mut best_priority = 0u8;
        let mut best_level = 0u8;
        let mut best_owner = NO_OWNER;
        for (idx, source) in self.sources.iter().enumerate() {
            let Some(source) = source else { continue };
            let priority = source.priority(slot);
            if priority == 0 {
                continue;
            }
            let level = source.level(slot);
            if priority > best_priority || (priority == best_priority && level > best_level) {
                best_priority = priority;
                best_level = level;
                best_owner = idx as u16;
            }
        }
        self.winning_priorities[slot] = best_priority;
        self.levels[slot] = best_level;
        self.owners[slot] = best_owner;
    }

    /// Fast path: with one source the outputs mirror its inputs.
    fn rewrite_sole_source(&mut self, idx: usize) {
        let source = self.sources[idx].as_ref().expect("source exists");
        for slot in 0..UNIVERSE_SIZE {
            let priority = source.address_priorities[slot];
            if priority == 0 {
                self.winning_priorities[slot] = 0;
                self.levels[slot] = 0;
                self.owners[slot] = NO_OWNER;
            } else {
                self.winning_priorities[slot] = priority;
                self.levels[slot] = if slot < source.level_count {
                    source.levels[slot]
                } else {
                    0
                };
                self.owners[slot] = idx as u16;
            }
        }
    }

    // -- Plumbing --

    fn source_index(&self, cid: &Uuid) -> Result<usize, MergeError> {
        self.index.get(cid).copied().ok_or(MergeError::UnknownSource)
    }

    fn source(&self, cid: &Uuid) -> Option<&MergerSource> {
        let idx = *self.index.get(cid)?;
        self.sources[idx].as_ref()
    }

    fn source_at(&self, idx: usize) -> &MergerSource {
        self.sources[idx].as_ref().expect("source index is live")
    }

    fn source_mut_at(&mut self, idx: usize) -> &mut MergerSource {
        self.sources[idx].as_mut().expect("source index is live")
    }

    fn is_sole_source(&self, idx: usize) -> bool {
        self.index.len() == 1 && self.sources[idx].is_some()
    }
}
