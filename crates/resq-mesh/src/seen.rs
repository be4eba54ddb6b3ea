//! Per-node memory of processed envelope ids

use crate::envelope::MessageId;
use std::collections::HashSet;

/// Tracks seen envelope ids to prevent duplicate delivery and relay
///
/// Exact membership: an id, once inserted, is reported as seen for the rest
/// of the session. The set is never evicted, including across stop/start.
#[derive(Debug, Default)]
pub struct SeenMessageSet {
    ids: HashSet<MessageId>,
}

impl SeenMessageSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if a message has been seen before
    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    /// Mark a message as seen
    ///
    /// Returns true when the id was not present before.
    pub fn mark_seen(&mut self, id: &str) -> bool {
        if self.ids.contains(id) {
            return false;
        }
        self.ids.insert(id.to_string())
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_mark_seen_once() {
        let mut seen = SeenMessageSet::new();
        assert!(!seen.contains("m1"));
        assert!(seen.mark_seen("m1"));
        assert!(seen.contains("m1"));
        assert!(!seen.mark_seen("m1"));
        assert_eq!(seen.len(), 1);
    }

    proptest! {
        #[test]
        fn prop_first_insert_wins(ids in proptest::collection::vec("[a-f0-9]{1,4}", 0..64)) {
            let mut seen = SeenMessageSet::new();
            let mut reference = HashSet::new();
            for id in &ids {
                prop_assert_eq!(seen.mark_seen(id), reference.insert(id.clone()));
                prop_assert!(seen.contains(id));
            }
            prop_assert_eq!(seen.len(), reference.len());
        }
    }
}
