//! Ordered release of asynchronously completed work.
//!
//! Work items are registered in creation order and may finish in any order.
//! An item is released only after every item registered before it has
//! finished, so consumers observe completions in creation order.

use std::collections::VecDeque;

/// Token returned for a registered item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChangeToken(u64);

impl ChangeToken {
    /// Raw value, increasing in registration order.
    pub fn get(self) -> u64 {
        self.0
    }
}

/// Releases finished items in registration order.
#[derive(Debug)]
pub struct ChangesProcessor<T> {
    offset: u64,
    pending: VecDeque<(T, bool)>,
}

impl<T> Default for ChangesProcessor<T> {
    fn default() -> Self {
        Self {
            offset: 0,
            pending: VecDeque::new(),
        }
    }
}

impl<T> ChangesProcessor<T> {
    /// Creates an empty processor.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an item and returns its token.
    pub fn add(&mut self, item: T) -> ChangeToken {
        let token = ChangeToken(self.offset + self.pending.len() as u64);
        self.pending.push_back((item, false));
        token
    }

    /// Number of items not yet released.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether every registered item was released.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Marks an item finished and releases the finished prefix in order.
    ///
    /// Unknown or already released tokens are ignored.
    pub fn finish<F>(&mut self, token: ChangeToken, mut release: F)
    where
        F: FnMut(T),
    {
        let Some(index) = token.0.checked_sub(self.offset) else {
            return;
        };
        let Ok(index) = usize::try_from(index) else {
            return;
        };
        match self.pending.get_mut(index) {
            Some((_, finished)) => *finished = true,
            None => return,
        }

        while matches!(self.pending.front(), Some((_, true))) {
            if let Some((item, _)) = self.pending.pop_front() {
                self.offset += 1;
                release(item);
            }
        }
    }

    /// Drops every pending item.
    pub fn clear(&mut self) {
        self.offset += self.pending.len() as u64;
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_order_release() {
        let mut processor = ChangesProcessor::new();
        let a = processor.add("a");
        let b = processor.add("b");
        let c = processor.add("c");
        let mut released = Vec::new();

        processor.finish(c, |item| released.push(item));
        assert!(released.is_empty());

        processor.finish(a, |item| released.push(item));
        assert_eq!(released, vec!["a"]);

        processor.finish(b, |item| released.push(item));
        assert_eq!(released, vec!["a", "b", "c"]);
        assert!(processor.is_empty());
    }

    #[test]
    fn test_tokens_keep_increasing() {
        let mut processor = ChangesProcessor::new();
        let first = processor.add(1);
        processor.finish(first, |_| {});
        let second = processor.add(2);
        assert!(second > first);

        let mut released = Vec::new();
        processor.finish(first, |item| released.push(item));
        assert!(released.is_empty());
        processor.finish(second, |item| released.push(item));
        assert_eq!(released, vec![2]);
    }

    #[test]
    fn test_clear_drops_pending() {
        let mut processor = ChangesProcessor::new();
        let stale = processor.add(1);
        processor.clear();
        let fresh = processor.add(2);

        let mut released = Vec::new();
        processor.finish(stale, |item| released.push(item));
        processor.finish(fresh, |item| released.push(item));
        assert_eq!(released, vec![2]);
        assert_eq!(processor.len(), 0);
    }
}
