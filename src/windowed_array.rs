use std::collections::VecDeque;
use anyhow::bail;
use tokio::time::{Duration, Instant};
use tracing::warn;
use crate::safe_converter::PrecheckedCast;

const MAX_CAPACITY: usize = 1 << 24;
const SIZE_WARNING_INTERVAL: Duration = Duration::from_secs(30);

enum Slot<V> {
    /// never filled
    Empty,
    Occupied(V),
    /// filled and removed again
    Removed,
}

/// A growable window of values keyed by a monotonically increasing `u64` index, e.g. messages
///  by their id.
///
/// Values can be set and removed in any order, but the window's lower bound (`first_index`)
///  only advances when the value at the lower bound is removed, and then past all contiguously
///  removed slots. An empty slot (i.e. a value that never arrived) keeps the window in place.
pub struct WindowedArray<V> {
    first_index: u64,
    slots: VecDeque<Slot<V>>,
    last_size_warning: Option<Instant>,
}

impl<V> WindowedArray<V> {
    pub fn new(first_index: u64) -> WindowedArray<V> {
        WindowedArray {
            first_index,
            slots: VecDeque::new(),
            last_size_warning: None,
        }
    }

    pub fn first_index(&self) -> u64 {
        self.first_index
    }

    /// the index after the highest slot, i.e. the index that `add()` will use next
    pub fn next_index(&self) -> u64 {
        self.first_index + self.slots.len() as u64
    }

    /// the number of slots between the lower and upper bounds of the window, including
    ///  slots that are empty or removed
    pub fn window_size(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn offset(&self, index: u64) -> Option<usize> {
        if index < self.first_index || index >= self.next_index() {
            return None;
        }
        Some((index - self.first_index).prechecked_cast())
    }

    pub fn get(&self, index: u64) -> Option<&V> {
        match self.slots.get(self.offset(index)?)? {
            Slot::Occupied(v) => Some(v),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, index: u64) -> Option<&mut V> {
        let offset = self.offset(index)?;
        match self.slots.get_mut(offset)? {
            Slot::Occupied(v) => Some(v),
            _ => None,
        }
    }

    /// Appends a value at the upper end of the window, returning its index
    pub fn add(&mut self, value: V) -> anyhow::Result<u64> {
        self.check_capacity(1)?;
        let index = self.next_index();
        self.slots.push_back(Slot::Occupied(value));
        Ok(index)
    }

    /// Stores a value at a given index, growing the window if necessary. Returns the previous
    ///  value at that index.
    pub fn set(&mut self, index: u64, value: V) -> anyhow::Result<Option<V>> {
        if index < self.first_index {
            bail!("index {} is below the window's first index {}", index, self.first_index);
        }

        let offset: usize = (index - self.first_index).prechecked_cast();
        if offset >= self.slots.len() {
            self.check_capacity(offset + 1 - self.slots.len())?;
            self.slots.resize_with(offset + 1, || Slot::Empty);
        }

        match std::mem::replace(&mut self.slots[offset], Slot::Occupied(value)) {
            Slot::Occupied(prev) => Ok(Some(prev)),
            _ => Ok(None),
        }
    }

    /// Removes the value at the given index. If this is the window's lower bound, the window
    ///  moves up to the next slot that was never removed.
    pub fn remove(&mut self, index: u64) -> Option<V> {
        let offset = self.offset(index)?;
        let removed = match std::mem::replace(&mut self.slots[offset], Slot::Removed) {
            Slot::Occupied(v) => Some(v),
            Slot::Empty => {
                self.slots[offset] = Slot::Empty;
                None
            }
            Slot::Removed => None,
        };

        while let Some(Slot::Removed) = self.slots.front() {
            self.slots.pop_front();
            self.first_index += 1;
        }
        removed
    }

    /// Looks up several indexes at once, e.g. all messages referenced by an ack
    pub fn get_all(&self, indexes: &[u64]) -> Vec<Option<&V>> {
        indexes.iter()
            .map(|&i| self.get(i))
            .collect()
    }

    /// all stored values in index order, skipping empty and removed slots
    pub fn iter(&self) -> impl Iterator<Item = (u64, &V)> + '_ {
        self.slots.iter()
            .enumerate()
            .filter_map(|(offset, slot)| match slot {
                Slot::Occupied(v) => Some((self.first_index + offset as u64, v)),
                _ => None,
            })
    }

    fn check_capacity(&mut self, additional: usize) -> anyhow::Result<()> {
        let new_len = self.slots.len() + additional;
        if new_len > MAX_CAPACITY {
            bail!("windowed array would exceed its maximum capacity of {} slots (first index {})", MAX_CAPACITY, self.first_index);
        }

        if new_len > MAX_CAPACITY / 16 {
            let now = Instant::now();
            if self.last_size_warning.map_or(true, |t| now.duration_since(t) >= SIZE_WARNING_INTERVAL) {
                warn!("windowed array has grown to {} slots without advancing past index {}", new_len, self.first_index);
                self.last_size_warning = Some(now);
            }
        }
        Ok(())
    }
}
