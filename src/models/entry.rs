//! Term occurrence facts.
//!
//! A fact is split into an immutable identity ([`PageFact`]) and a mutable
//! annotation cell ([`Annotations`]). Ordering, equality and hashing only ever
//! look at the identity, so late title updates and merged positions can never
//! move an entry inside an ordered map.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use ordered_float::OrderedFloat;

use super::page::PageRef;
use crate::error::{BufferError, Result};

/// Estimated cost of one recorded position, in bytes
pub const POSITION_COST: usize = 4;

/// Immutable identity of a term-page fact.
///
/// Field order is the natural ordering: subject, then relevance, then target.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PageFact {
    subject: String,
    relevance: OrderedFloat<f32>,
    target: PageRef,
}

impl PageFact {
    pub fn new(subject: impl Into<String>, relevance: f32, target: PageRef) -> Result<Self> {
        if !relevance.is_finite() {
            return Err(BufferError::InvalidFact(format!(
                "relevance must be finite, got {}",
                relevance
            )));
        }
        Ok(Self {
            subject: subject.into(),
            relevance: OrderedFloat(relevance),
            target,
        })
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn relevance(&self) -> f32 {
        self.relevance.into_inner()
    }

    pub fn target(&self) -> &PageRef {
        &self.target
    }

    /// Size estimate of the identity alone (no title, no positions)
    pub fn size_estimate(&self) -> usize {
        self.target.len() + self.subject.len()
    }
}

/// Mutable part of a fact: late-bound title and collected positions.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Annotations {
    title: Option<String>,
    positions: BTreeMap<u32, Option<String>>,
}

impl Annotations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn title(&self) -> Option<&str> {
        self.title.as_deref()
    }

    pub fn set_title(&mut self, title: Option<String>) {
        self.title = title;
    }

    /// Positions in the document mapped to an optional surrounding fragment
    pub fn positions(&self) -> &BTreeMap<u32, Option<String>> {
        &self.positions
    }

    /// Merge an offset into the position map.
    ///
    /// Returns `true` if the offset was not present before. A fragment supplied
    /// for an offset that has none yet is attached; an existing fragment is kept.
    pub fn put_position(&mut self, offset: u32, fragment: Option<String>) -> bool {
        match self.positions.get_mut(&offset) {
            Some(existing) => {
                if existing.is_none() && fragment.is_some() {
                    *existing = fragment;
                }
                false
            }
            None => {
                self.positions.insert(offset, fragment);
                true
            }
        }
    }

    pub fn size_estimate(&self) -> usize {
        self.title.as_ref().map_or(0, |t| t.len()) + self.positions.len() * POSITION_COST
    }
}

/// A fact asserting that a subject term occurs at positions within a target page.
#[derive(Clone, Debug)]
pub struct TermPageEntry {
    fact: Arc<PageFact>,
    annotations: Annotations,
}

impl TermPageEntry {
    /// Create an entry with no title and no positions.
    ///
    /// Fails with [`BufferError::InvalidFact`] if the target is blank.
    pub fn new(subject: impl Into<String>, relevance: f32, target: &str) -> Result<Self> {
        let target = PageRef::parse(target)?;
        Ok(Self::from_fact(PageFact::new(subject, relevance, target)?))
    }

    /// Build an entry where the target may be missing (e.g. decoded from a record).
    pub fn from_parts(
        subject: impl Into<String>,
        relevance: f32,
        target: Option<PageRef>,
        annotations: Annotations,
    ) -> Result<Self> {
        let target = target
            .ok_or_else(|| BufferError::InvalidFact("can't have a null page".to_string()))?;
        Ok(Self {
            fact: Arc::new(PageFact::new(subject, relevance, target)?),
            annotations,
        })
    }

    pub fn from_fact(fact: PageFact) -> Self {
        Self {
            fact: Arc::new(fact),
            annotations: Annotations::default(),
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.annotations.set_title(Some(title.into()));
        self
    }

    pub fn with_position(mut self, offset: u32, fragment: Option<String>) -> Self {
        self.annotations.put_position(offset, fragment);
        self
    }

    pub fn fact(&self) -> &PageFact {
        &self.fact
    }

    pub fn subject(&self) -> &str {
        self.fact.subject()
    }

    pub fn relevance(&self) -> f32 {
        self.fact.relevance()
    }

    pub fn target(&self) -> &PageRef {
        self.fact.target()
    }

    pub fn title(&self) -> Option<&str> {
        self.annotations.title()
    }

    pub fn set_title(&mut self, title: Option<String>) {
        self.annotations.set_title(title);
    }

    pub fn positions(&self) -> &BTreeMap<u32, Option<String>> {
        self.annotations.positions()
    }

    pub fn put_position(&mut self, offset: u32, fragment: Option<String>) -> bool {
        self.annotations.put_position(offset, fragment)
    }

    pub fn annotations(&self) -> &Annotations {
        &self.annotations
    }

    /// Approximate serialized cost: target + title + subject + 4 bytes per position
    pub fn size_estimate(&self) -> usize {
        self.fact.size_estimate() + self.annotations.size_estimate()
    }

    /// A handle that producers use to mutate this entry once it is buffered
    pub fn entry_ref(&self) -> EntryRef {
        EntryRef(self.fact.clone())
    }

    pub fn into_parts(self) -> (Arc<PageFact>, Annotations) {
        (self.fact, self.annotations)
    }

    pub(crate) fn from_shared(fact: Arc<PageFact>, annotations: Annotations) -> Self {
        Self { fact, annotations }
    }
}

impl PartialEq for TermPageEntry {
    fn eq(&self, other: &Self) -> bool {
        self.fact == other.fact
    }
}

impl Eq for TermPageEntry {}

impl Hash for TermPageEntry {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.fact.hash(state);
    }
}

impl PartialOrd for TermPageEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TermPageEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.fact.cmp(&other.fact)
    }
}

/// Reference to a buffered fact, returned by the get-or-create step.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct EntryRef(pub(crate) Arc<PageFact>);

impl EntryRef {
    pub fn fact(&self) -> &PageFact {
        &self.0
    }
}
