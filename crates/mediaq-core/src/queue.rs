//! Play queue: the ordered tracks of the category the user is playing in.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::address::{self, BY_SEARCH};
use crate::catalog::CatalogView;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub position: usize,
    pub track_id: String,
    /// Full address (category prefix + track id) the entry was built from.
    pub address: String,
}

pub struct QueueCoordinator<C> {
    catalog: C,
    entries: Vec<QueueEntry>,
    current_index: Option<usize>,
    /// Category prefix the queue was built from.
    context: Option<String>,
}

impl<C: CatalogView> QueueCoordinator<C> {
    pub fn new(catalog: C) -> Self {
        Self {
            catalog,
            entries: Vec::new(),
            current_index: None,
            context: None,
        }
    }

    pub fn entries(&self) -> &[QueueEntry] {
        &self.entries
    }

    pub fn current_index(&self) -> Option<usize> {
        self.current_index
    }

    pub fn context(&self) -> Option<&str> {
        self.context.as_deref()
    }

    pub fn is_index_playable(&self, index: usize) -> bool {
        index < self.entries.len()
    }

    pub fn current_entry(&self) -> Option<&QueueEntry> {
        let idx = self.current_index?;
        if self.is_index_playable(idx) {
            self.entries.get(idx)
        } else {
            None
        }
    }

    /// Point the queue at `address`, rebuilding it only when the category
    /// changed or the track isn't part of the current queue.
    pub fn select_address(&mut self, address: &str) -> Option<QueueEntry> {
        let prefix = address::category_prefix(address);
        let wanted = address::track_id(address);

        if self.context.as_deref() == Some(prefix) {
            if let Some(pos) = wanted.and_then(|id| self.position_of(id)) {
                debug!("queue: same context {}, jumping to {}", prefix, pos);
                self.current_index = Some(pos);
                return self.current_entry().cloned();
            }
        }

        self.rebuild(prefix, wanted);
        self.current_entry().cloned()
    }

    /// Build a queue from a free-text search.
    pub fn select_search(&mut self, query: &str) -> Option<QueueEntry> {
        match address::encode(&[BY_SEARCH, query], None) {
            Ok(addr) => self.select_address(&addr),
            Err(e) => {
                warn!("queue: search query not addressable: {}", e);
                self.clear();
                None
            }
        }
    }

    /// Move by `amount`.  Negative results clamp to the first entry, results
    /// past the end wrap around.
    pub fn skip(&mut self, amount: i64) -> Option<QueueEntry> {
        if self.entries.is_empty() {
            return None;
        }
        let len = self.entries.len() as i64;
        let target = self.current_index.unwrap_or(0) as i64 + amount;
        let idx = if target < 0 { 0 } else { target % len };
        self.current_index = Some(idx as usize);
        self.current_entry().cloned()
    }

    /// Step to the next entry.  `None` at the end of the queue, which leaves
    /// the index where it was.
    pub fn advance(&mut self) -> Option<QueueEntry> {
        let next = self.current_index? + 1;
        if !self.is_index_playable(next) {
            return None;
        }
        self.current_index = Some(next);
        self.current_entry().cloned()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.current_index = None;
        self.context = None;
    }

    fn position_of(&self, track_id: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.track_id == track_id)
    }

    fn rebuild(&mut self, prefix: &str, wanted: Option<&str>) {
        self.entries = self
            .catalog
            .get_children(prefix)
            .into_iter()
            .filter(|node| node.playable)
            .filter_map(|node| {
                let track_id = address::track_id(&node.address)?.to_string();
                Some((track_id, node.address))
            })
            .enumerate()
            .map(|(position, (track_id, address))| QueueEntry {
                position,
                track_id,
                address,
            })
            .collect();
        self.context = Some(prefix.to_string());

        self.current_index = match wanted.and_then(|id| self.position_of(id)) {
            Some(pos) => Some(pos),
            None if !self.entries.is_empty() => Some(0),
            None => None,
        };
        debug!(
            "queue: rebuilt {} ({} entries, index {:?})",
            prefix,
            self.entries.len(),
            self.current_index
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{BrowseNode, Track};
    use std::sync::Arc;

    /// Fixed two-category tree.
    struct Tree;

    impl CatalogView for Tree {
        fn get_children(&self, address: &str) -> Vec<BrowseNode> {
            let ids: &[&str] = match address {
                "__BY_GENRE__/Rock" => &["a", "b", "c"],
                "__BY_GENRE__/Jazz" => &["d"],
                _ => &[],
            };
            ids.iter()
                .map(|id| BrowseNode {
                    address: format!("{}|{}", address, id),
                    title: id.to_string(),
                    subtitle: String::new(),
                    playable: true,
                    browsable: false,
                })
                .collect()
        }

        fn get_track(&self, _id: &str) -> Option<Arc<Track>> {
            None
        }
    }

    #[test]
    fn test_rebuild_points_at_requested_track() {
        let mut q = QueueCoordinator::new(Tree);
        let entry = q.select_address("__BY_GENRE__/Rock|b").unwrap();
        assert_eq!(entry.position, 1);
        assert_eq!(entry.track_id, "b");
        assert_eq!(q.entries().len(), 3);
        assert_eq!(q.context(), Some("__BY_GENRE__/Rock"));
    }

    #[test]
    fn test_rebuild_defaults_to_first_entry() {
        let mut q = QueueCoordinator::new(Tree);
        let entry = q.select_address("__BY_GENRE__/Rock|missing").unwrap();
        assert_eq!(entry.track_id, "a");
        let entry = q.select_address("__BY_GENRE__/Jazz").unwrap();
        assert_eq!(entry.track_id, "d");
    }

    #[test]
    fn test_unknown_category_empties_queue() {
        let mut q = QueueCoordinator::new(Tree);
        q.select_address("__BY_GENRE__/Rock|a");
        assert!(q.select_address("__BY_GENRE__/Polka|x").is_none());
        assert!(q.entries().is_empty());
        assert!(q.current_entry().is_none());
    }

    #[test]
    fn test_skip_clamps_and_wraps() {
        let mut q = QueueCoordinator::new(Tree);
        q.select_address("__BY_GENRE__/Rock|b");
        assert_eq!(q.skip(-5).unwrap().track_id, "a");
        assert_eq!(q.skip(4).unwrap().track_id, "b");
        assert_eq!(q.skip(1).unwrap().track_id, "c");
    }

    #[test]
    fn test_advance_stops_at_end() {
        let mut q = QueueCoordinator::new(Tree);
        q.select_address("__BY_GENRE__/Rock|b");
        assert_eq!(q.advance().unwrap().track_id, "c");
        assert!(q.advance().is_none());
        assert_eq!(q.current_entry().unwrap().track_id, "c");
    }

    #[test]
    fn test_skip_on_empty_queue() {
        let mut q = QueueCoordinator::new(Tree);
        assert!(q.skip(1).is_none());
        assert!(q.advance().is_none());
    }

    #[test]
    fn test_search_with_separator_clears_queue() {
        let mut q = QueueCoordinator::new(Tree);
        q.select_address("__BY_GENRE__/Rock|a");
        assert!(q.select_search("AC/DC").is_none());
        assert!(q.entries().is_empty());
    }
}
