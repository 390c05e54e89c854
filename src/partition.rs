//! Weight-bounded splitting of an ordered work source into task chunks.
//!
//! Chunks are contiguous and emitted in source order. A group of items sharing
//! a key (all GMF rows of one event) is never split: a chunk is closed before a
//! group that would push it over the bound, and a single group heavier than the
//! bound becomes a chunk of its own.

use std::collections::HashSet;
use std::fmt::Debug;
use std::hash::Hash;
use std::iter::Peekable;
use std::ops::Range;

use thiserror::Error;

use crate::types::EventId;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PartitionError {
    #[error("max weight per task must be positive, got 0")]
    ZeroMaxWeight,
    /// A group key showed up again after its run had ended; the source is not
    /// grouped and splitting it would double-count the group across tasks.
    #[error("rows for {key} are not contiguous: the group reappears at position {position}")]
    NonContiguousGroup { key: String, position: usize },
}

/// Running weight of the chunk being filled.
#[derive(Debug, Clone)]
struct BlockCursor {
    max_weight: u64,
    weight: u64,
    empty: bool,
}

impl BlockCursor {
    fn new(max_weight: u64) -> Result<Self, PartitionError> {
        if max_weight == 0 {
            return Err(PartitionError::ZeroMaxWeight);
        }
        Ok(BlockCursor { max_weight, weight: 0, empty: true })
    }

    /// A non-empty chunk must be closed before taking a group of `weight`.
    fn must_close_before(&self, weight: u64) -> bool {
        !self.empty && self.weight.saturating_add(weight) > self.max_weight
    }

    fn add(&mut self, weight: u64) {
        self.weight = self.weight.saturating_add(weight);
        self.empty = false;
    }

    fn is_full(&self) -> bool {
        !self.empty && self.weight >= self.max_weight
    }

    fn reset(&mut self) {
        self.weight = 0;
        self.empty = true;
    }
}

/// Lazy, deterministic chunking of an ordered item stream.
///
/// `key` identifies the atomic group an item belongs to and `weight` its cost.
/// Yields `Err` once (then stops) if a group key reappears after its run ended.
pub struct WeightedBlocks<I, K, FK, FW>
where
    I: Iterator,
{
    items: Peekable<I>,
    key: FK,
    weight: FW,
    cursor: BlockCursor,
    block: Vec<I::Item>,
    closed: HashSet<K>,
    position: usize,
    failed: bool,
}

impl<I, K, FK, FW> WeightedBlocks<I, K, FK, FW>
where
    I: Iterator,
    K: Eq + Hash + Debug,
    FK: Fn(&I::Item) -> K,
    FW: Fn(&I::Item) -> u64,
{
    pub fn new(items: I, max_weight: u64, key: FK, weight: FW) -> Result<Self, PartitionError> {
        Ok(WeightedBlocks {
            items: items.peekable(),
            key,
            weight,
            cursor: BlockCursor::new(max_weight)?,
            block: Vec::new(),
            closed: HashSet::new(),
            position: 0,
            failed: false,
        })
    }

    /// Pull the next full run of items sharing one key.
    fn next_group(&mut self) -> Option<Result<(Vec<I::Item>, u64), PartitionError>> {
        let first = self.items.next()?;
        let key = (self.key)(&first);
        if self.closed.contains(&key) {
            return Some(Err(PartitionError::NonContiguousGroup {
                key: format!("{key:?}"),
                position: self.position,
            }));
        }
        let mut weight = (self.weight)(&first);
        let mut group = vec![first];
        self.position += 1;

        let key_fn = &self.key;
        while let Some(item) = self.items.next_if(|it| key_fn(it) == key) {
            weight = weight.saturating_add((self.weight)(&item));
            group.push(item);
            self.position += 1;
        }
        self.closed.insert(key);
        Some(Ok((group, weight)))
    }
}

impl<I, K, FK, FW> Iterator for WeightedBlocks<I, K, FK, FW>
where
    I: Iterator,
    K: Eq + Hash + Debug,
    FK: Fn(&I::Item) -> K,
    FW: Fn(&I::Item) -> u64,
{
    type Item = Result<Vec<I::Item>, PartitionError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        loop {
            match self.next_group() {
                Some(Ok((group, weight))) => {
                    if self.cursor.must_close_before(weight) {
                        let out = std::mem::replace(&mut self.block, group);
                        self.cursor.reset();
                        self.cursor.add(weight);
                        return Some(Ok(out));
                    }
                    self.block.extend(group);
                    self.cursor.add(weight);
                    if self.cursor.is_full() {
                        self.cursor.reset();
                        return Some(Ok(std::mem::take(&mut self.block)));
                    }
                }
                Some(Err(e)) => {
                    self.failed = true;
                    return Some(Err(e));
                }
                None => {
                    if self.block.is_empty() {
                        return None;
                    }
                    self.cursor.reset();
                    return Some(Ok(std::mem::take(&mut self.block)));
                }
            }
        }
    }
}

/// Row ranges over a GMF table whose event ids are stored in runs.
///
/// Every row weighs 1. Validates that no event id reappears after its run.
pub fn gmf_slices(eids: &[EventId], max_weight: u64) -> Result<Vec<Range<usize>>, PartitionError> {
    WeightedBlocks::new(eids.iter().copied().enumerate(), max_weight, |&(_, eid)| eid, |_| 1)?
        .map(|block| {
            block.map(|rows| {
                let start = rows.first().map_or(0, |&(row, _)| row);
                start..start + rows.len()
            })
        })
        .collect()
}

/// Chunk items that have no grouping constraint (each item is its own group).
pub fn split_in_blocks<T>(
    items: Vec<T>,
    max_weight: u64,
    weight: impl Fn(&T) -> u64,
) -> Result<Vec<Vec<T>>, PartitionError> {
    WeightedBlocks::new(items.into_iter().enumerate(), max_weight, |&(i, _)| i, |(_, item)| weight(item))?
        .map(|block| block.map(|items| items.into_iter().map(|(_, item)| item).collect()))
        .collect()
}

/// Per-task weight bound that spreads `total_weight` over `concurrent_tasks`.
pub fn max_weight_for(total_weight: u64, concurrent_tasks: u32) -> u64 {
    let tasks = u64::from(concurrent_tasks.max(1));
    total_weight.div_ceil(tasks).max(1)
}
