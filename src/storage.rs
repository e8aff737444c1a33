//! Per-agent keyed share store.
//!
//! Entries are partitioned into *sticky* shares (bootstrap secrets such as
//! the multiplication mask and topology indicators, kept until the iteration
//! ends) and *tagged* shares (scoped to a round and purged after every
//! barrier). The store is owned by a single agent and only ever touched from
//! that agent's execution context, so it is deliberately not thread-safe.

use crate::share::Share;
use std::collections::HashMap;

/// Metadata attached to a stored share.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EntryInfo {
    /// Cleanup tag; `None` for sticky entries.
    pub tag: Option<String>,
    /// Sticky entries survive every clear short of [ShareStorage::clear_all].
    pub sticky: bool,
}

#[derive(Clone, Debug)]
struct Entry {
    share: Share,
    info: EntryInfo,
}

/// Keyed share store with sticky/tagged lifecycle.
#[derive(Default)]
pub struct ShareStorage {
    entries: HashMap<String, Entry>,
}

impl ShareStorage {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a tagged share; storing under an existing key overwrites.
    pub fn store(&mut self, key: &str, share: Share, tag: &str) {
        self.entries.insert(
            key.to_string(),
            Entry {
                share,
                info: EntryInfo {
                    tag: Some(tag.to_string()),
                    sticky: false,
                },
            },
        );
    }

    /// Store a sticky share, kept until [ShareStorage::clear_all].
    pub fn store_sticky(&mut self, key: &str, share: Share) {
        self.entries.insert(
            key.to_string(),
            Entry {
                share,
                info: EntryInfo {
                    tag: None,
                    sticky: true,
                },
            },
        );
    }

    /// Look up a share by key.
    pub fn get(&self, key: &str) -> Option<Share> {
        self.entries.get(key).map(|e| e.share)
    }

    /// Whether `key` is present.
    pub fn has(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Metadata of `key`, if present.
    pub fn info(&self, key: &str) -> Option<EntryInfo> {
        self.entries.get(key).map(|e| e.info.clone())
    }

    /// Remove all tagged entries with the given tag. Sticky entries are
    /// untouched. Returns the number of removed entries.
    pub fn clear_by_tag(&mut self, tag: &str) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, e| e.info.sticky || e.info.tag.as_deref() != Some(tag));
        before - self.entries.len()
    }

    /// Remove all non-sticky entries whose key contains `pattern`.
    pub fn clear_by_pattern(&mut self, pattern: &str) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|k, e| e.info.sticky || !k.contains(pattern));
        before - self.entries.len()
    }

    /// Remove every tagged entry regardless of tag.
    pub fn clear_non_sticky(&mut self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| e.info.sticky);
        before - self.entries.len()
    }

    /// Empty the store, sticky entries included.
    pub fn clear_all(&mut self) {
        self.entries.clear();
    }

    /// Number of stored entries.
    pub fn count(&self) -> usize {
        self.entries.len()
    }

    /// Number of sticky entries.
    pub fn sticky_count(&self) -> usize {
        self.entries.values().filter(|e| e.info.sticky).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn share(v: u64) -> Share {
        Share::new(1, v, v)
    }

    #[test]
    fn test_store_get_overwrite() {
        let mut st = ShareStorage::new();
        st.store("a", share(1), "round-0");
        assert_eq!(st.get("a").unwrap().value, 1);
        st.store("a", share(2), "round-0");
        assert_eq!(st.get("a").unwrap().value, 2);
        assert_eq!(st.count(), 1);
        assert!(!st.has("b"));
        assert_eq!(st.get("b"), None);
    }

    #[test]
    fn test_info() {
        let mut st = ShareStorage::new();
        st.store("a", share(1), "round-3");
        st.store_sticky("r", share(9));
        assert_eq!(
            st.info("a").unwrap(),
            EntryInfo {
                tag: Some("round-3".into()),
                sticky: false
            }
        );
        assert_eq!(
            st.info("r").unwrap(),
            EntryInfo {
                tag: None,
                sticky: true
            }
        );
        assert_eq!(st.info("missing"), None);
    }

    #[test]
    fn test_clear_by_tag_spares_sticky_and_other_tags() {
        let mut st = ShareStorage::new();
        st.store("a", share(1), "round-0");
        st.store("b", share(2), "round-0");
        st.store("c", share(3), "round-1");
        st.store_sticky("r", share(9));
        assert_eq!(st.clear_by_tag("round-0"), 2);
        assert!(!st.has("a"));
        assert!(st.has("c"));
        assert!(st.has("r"));
    }

    #[test]
    fn test_clear_by_pattern() {
        let mut st = ShareStorage::new();
        st.store("Wb_1[0]", share(1), "round-0");
        st.store("Wb_1[1]", share(2), "round-0");
        st.store("gain_1", share(3), "round-0");
        st.store_sticky("Wb_sticky", share(4));
        assert_eq!(st.clear_by_pattern("Wb_"), 2);
        assert!(st.has("gain_1"));
        assert!(st.has("Wb_sticky"));
    }

    #[test]
    fn test_clear_non_sticky_and_all() {
        let mut st = ShareStorage::new();
        st.store("a", share(1), "round-0");
        st.store("b", share(2), "round-7");
        st.store_sticky("r", share(9));
        assert_eq!(st.clear_non_sticky(), 2);
        assert_eq!(st.count(), 1);
        assert_eq!(st.sticky_count(), 1);
        st.clear_all();
        assert_eq!(st.count(), 0);
    }
}
