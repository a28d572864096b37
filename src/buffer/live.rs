//! Live merge map and size accounting.
//!
//! Everything here runs under the buffer's single lock. Nothing in this
//! module performs I/O.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{BufferError, Result};
use crate::models::{Annotations, EntryRef, PageFact, TermPageEntry, POSITION_COST};

/// Snapshot of buffered entries detached for one flush attempt.
///
/// Iterates in the natural (subject, relevance, target) order.
#[derive(Debug)]
pub struct Generation {
    id: u64,
    entries: BTreeMap<Arc<PageFact>, Annotations>,
    size_estimate: usize,
}

impl Generation {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Running estimate at the moment the generation was captured
    pub fn size_estimate(&self) -> usize {
        self.size_estimate
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PageFact, &Annotations)> {
        self.entries.iter().map(|(fact, annotations)| (fact.as_ref(), annotations))
    }
}

/// State guarded by the buffer lock.
#[derive(Debug)]
pub(crate) struct LiveState {
    entries: BTreeMap<Arc<PageFact>, Annotations>,
    size_estimate: usize,
    capacity: usize,
    shutdown: bool,
    next_generation: u64,
}

impl LiveState {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: BTreeMap::new(),
            size_estimate: 0,
            capacity,
            shutdown: false,
            next_generation: 1,
        }
    }

    /// Return the buffered entry equal to `entry`, or buffer `entry` itself.
    ///
    /// A new entry is charged its full size estimate. When an equal entry is
    /// already buffered the annotations carried by `entry` are not merged.
    pub fn get_or_insert(&mut self, entry: TermPageEntry) -> (EntryRef, bool) {
        if let Some((fact, _)) = self.entries.get_key_value(entry.fact()) {
            return (EntryRef(fact.clone()), false);
        }

        self.size_estimate += entry.size_estimate();
        let (fact, annotations) = entry.into_parts();
        self.entries.insert(fact.clone(), annotations);
        (EntryRef(fact), true)
    }

    /// Annotations of a referenced entry, re-creating it if its generation
    /// has already been flushed.
    fn annotations_mut(&mut self, entry: &EntryRef) -> (&mut Annotations, bool) {
        match self.entries.entry(entry.0.clone()) {
            Entry::Occupied(occupied) => (occupied.into_mut(), false),
            Entry::Vacant(vacant) => {
                self.size_estimate += entry.fact().size_estimate();
                (vacant.insert(Annotations::default()), true)
            }
        }
    }

    /// Merge a position and charge a fixed cost, even for an offset that is
    /// already present.
    pub fn add_position(&mut self, entry: &EntryRef, offset: u32, fragment: Option<String>) -> bool {
        let (annotations, created) = self.annotations_mut(entry);
        annotations.put_position(offset, fragment);
        self.size_estimate += POSITION_COST;
        created
    }

    /// Overwrite the title. The running estimate is not adjusted for it.
    pub fn set_title(&mut self, entry: &EntryRef, title: String) -> bool {
        let (annotations, created) = self.annotations_mut(entry);
        annotations.set_title(Some(title));
        created
    }

    pub fn get(&self, fact: &PageFact) -> Option<TermPageEntry> {
        self.entries
            .get_key_value(fact)
            .map(|(fact, annotations)| TermPageEntry::from_shared(fact.clone(), annotations.clone()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn size_estimate(&self) -> usize {
        self.size_estimate
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_enabled(&self) -> bool {
        self.capacity != 0
    }

    /// Change the threshold. Buffering can neither be enabled nor disabled here.
    pub fn set_capacity(&mut self, capacity: usize) -> Result<()> {
        if self.capacity == 0 || capacity == 0 {
            return Err(BufferError::InvalidCapacity {
                current: self.capacity,
                requested: capacity,
            });
        }
        self.capacity = capacity;
        Ok(())
    }

    pub fn should_flush(&self) -> bool {
        self.is_enabled() && self.size_estimate > self.capacity
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown
    }

    /// Swap the live map for an empty one and reset the running estimate.
    pub fn take_generation(&mut self) -> Generation {
        let id = self.next_generation;
        self.next_generation += 1;
        let size_estimate = std::mem::take(&mut self.size_estimate);
        Generation {
            id,
            entries: std::mem::take(&mut self.entries),
            size_estimate,
        }
    }

    /// Set the shutdown flag and detach everything still live.
    pub fn begin_shutdown(&mut self) -> Generation {
        self.shutdown = true;
        self.take_generation()
    }

    /// Put a generation that could not be dispatched back into the live map.
    pub fn restore(&mut self, generation: Generation) {
        for (fact, annotations) in generation.entries {
            match self.entries.entry(fact) {
                Entry::Vacant(vacant) => {
                    self.size_estimate += vacant.key().size_estimate() + annotations.size_estimate();
                    vacant.insert(annotations);
                }
                Entry::Occupied(mut occupied) => {
                    let merged = occupied.get_mut();
                    for (offset, fragment) in annotations.positions() {
                        if merged.put_position(*offset, fragment.clone()) {
                            self.size_estimate += POSITION_COST;
                        }
                    }
                    if merged.title().is_none() {
                        merged.set_title(annotations.title().map(str::to_string));
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(subject: &str, target: &str) -> TermPageEntry {
        TermPageEntry::new(subject, 1.0, target).unwrap()
    }

    #[test]
    fn test_get_or_insert_merges_same_fact() {
        let mut live = LiveState::new(1000);

        let (first, created) = live.get_or_insert(entry("rust", "CHK@a"));
        assert!(created);
        let (second, created) = live.get_or_insert(entry("rust", "CHK@a"));
        assert!(!created);
        assert_eq!(first, second);
        assert_eq!(live.len(), 1);
        // 5 (target) + 4 (subject), charged once
        assert_eq!(live.size_estimate(), 9);
    }

    #[test]
    fn test_position_charge_includes_duplicates() {
        let mut live = LiveState::new(1000);
        let (r, _) = live.get_or_insert(entry("rust", "CHK@a"));

        live.add_position(&r, 7, None);
        live.add_position(&r, 7, None);
        live.add_position(&r, 8, None);

        assert_eq!(live.get(r.fact()).unwrap().positions().len(), 2);
        assert_eq!(live.size_estimate(), 9 + 3 * POSITION_COST);
    }

    #[test]
    fn test_title_not_charged() {
        let mut live = LiveState::new(1000);
        let (r, _) = live.get_or_insert(entry("rust", "CHK@a"));

        live.set_title(&r, "A rather long page title".to_string());

        assert_eq!(live.size_estimate(), 9);
        assert_eq!(
            live.get(r.fact()).unwrap().title(),
            Some("A rather long page title")
        );
    }

    #[test]
    fn test_take_generation_resets() {
        let mut live = LiveState::new(10);
        let (r, _) = live.get_or_insert(entry("rust", "CHK@a"));
        live.add_position(&r, 1, None);
        assert!(live.should_flush());

        let generation = live.take_generation();
        assert_eq!(generation.id(), 1);
        assert_eq!(generation.len(), 1);
        assert_eq!(generation.size_estimate(), 13);
        assert_eq!(live.len(), 0);
        assert_eq!(live.size_estimate(), 0);
        assert!(!live.should_flush());

        assert_eq!(live.take_generation().id(), 2);
    }

    #[test]
    fn test_stale_ref_recreates_entry() {
        let mut live = LiveState::new(1000);
        let (r, _) = live.get_or_insert(entry("rust", "CHK@a").with_position(1, None));
        let _ = live.take_generation();

        let created = live.add_position(&r, 2, None);
        assert!(created);

        let recreated = live.get(r.fact()).unwrap();
        assert_eq!(recreated.positions().len(), 1);
        assert!(recreated.positions().contains_key(&2));
        assert_eq!(live.size_estimate(), 9 + POSITION_COST);
    }

    #[test]
    fn test_disabled_never_flushes() {
        let mut live = LiveState::new(0);
        let (r, _) = live.get_or_insert(entry("rust", "CHK@a"));
        for offset in 0..100 {
            live.add_position(&r, offset, None);
        }
        assert!(!live.is_enabled());
        assert!(!live.should_flush());
    }

    #[test]
    fn test_set_capacity_rules() {
        let mut disabled = LiveState::new(0);
        assert!(matches!(
            disabled.set_capacity(100),
            Err(BufferError::InvalidCapacity { current: 0, requested: 100 })
        ));

        let mut live = LiveState::new(100);
        assert!(live.set_capacity(0).is_err());
        live.set_capacity(500).unwrap();
        assert_eq!(live.capacity(), 500);
    }

    #[test]
    fn test_restore_merges_back() {
        let mut live = LiveState::new(1000);
        let (r, _) = live.get_or_insert(entry("rust", "CHK@a"));
        live.add_position(&r, 1, None);
        let generation = live.take_generation();

        live.add_position(&r, 2, None);
        live.restore(generation);

        let merged = live.get(r.fact()).unwrap();
        assert_eq!(merged.positions().len(), 2);
        assert_eq!(live.len(), 1);
    }

    #[test]
    fn test_generation_iterates_in_natural_order() {
        let mut live = LiveState::new(1000);
        live.get_or_insert(entry("b", "CHK@1"));
        live.get_or_insert(entry("a", "CHK@2"));
        live.get_or_insert(entry("a", "CHK@1"));

        let generation = live.take_generation();
        let order: Vec<(String, String)> = generation
            .iter()
            .map(|(fact, _)| (fact.subject().to_string(), fact.target().to_string()))
            .collect();
        assert_eq!(
            order,
            vec![
                ("a".to_string(), "CHK@1".to_string()),
                ("a".to_string(), "CHK@2".to_string()),
                ("b".to_string(), "CHK@1".to_string()),
            ]
        );
    }
}
