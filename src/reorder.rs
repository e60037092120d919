use crate::fragment::Fragment;
use std::collections::VecDeque;

/// Restores input order from out-of-order completions.
///
/// Slot `i` holds the fragment with index `first_index + i`. Only the
/// contiguous filled prefix is released, so the buffer never holds more than
/// the skew between the slowest and fastest fragment in flight.
#[derive(Debug, Default)]
pub(crate) struct ReorderBuffer {
    slots: VecDeque<Option<Fragment>>,
    first_index: usize,
}

impl ReorderBuffer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Stores a completed fragment.
    ///
    /// Indices below the cursor were already released; such a fragment is
    /// dropped and `false` is returned.
    pub(crate) fn insert(&mut self, fragment: Fragment) -> bool {
        let Some(offset) = fragment.sequence_index.checked_sub(self.first_index) else {
            return false;
        };

        if offset >= self.slots.len() {
            self.slots.resize_with(offset + 1, || None);
        }
        self.slots[offset] = Some(fragment);
        true
    }

    /// Releases the fragment at the cursor, if it has arrived.
    pub(crate) fn pop_ready(&mut self) -> Option<Fragment> {
        if !matches!(self.slots.front(), Some(Some(_))) {
            return None;
        }

        self.first_index += 1;
        self.slots.pop_front().flatten()
    }

    /// Index of the next fragment to release.
    pub(crate) const fn next_index(&self) -> usize {
        self.first_index
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
