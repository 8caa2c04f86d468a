//! Operation contexts built on the chain.
//!
//! These hold only the cursor bookkeeping an operation keeps between calls
//! into the store. Walking segments and decoding entries belongs to the
//! table implementation.

use crate::chain::ChainEntry;
use crate::context::{Context, ContextKind, KindTag};
use std::rc::Rc;

/// State of a keyed lookup or update.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct QueryContext {
    key_hash: Option<u64>,
    segment: Option<usize>,
    entry_offset: Option<u64>,
}

impl QueryContext {
    pub fn set_key_hash(&mut self, hash: u64) {
        self.key_hash = Some(hash);
    }

    pub fn key_hash(&self) -> Option<u64> {
        self.key_hash
    }

    /// Record where the entry for the current key was found.
    pub fn locate(&mut self, segment: usize, entry_offset: u64) {
        self.segment = Some(segment);
        self.entry_offset = Some(entry_offset);
    }

    pub fn segment(&self) -> Option<usize> {
        self.segment
    }

    pub fn entry_offset(&self) -> Option<u64> {
        self.entry_offset
    }
}

impl ContextKind for QueryContext {
    const KIND: KindTag = KindTag::Query;

    fn create() -> Self {
        Self::default()
    }

    fn reset(&mut self) {
        *self = Self::default();
    }

    fn into_entry(context: Rc<Context<Self>>) -> ChainEntry {
        ChainEntry::Query(context)
    }

    fn from_entry(entry: &ChainEntry) -> Option<&Rc<Context<Self>>> {
        match entry {
            ChainEntry::Query(c) => Some(c),
            _ => None,
        }
    }
}

/// State of a pass over the store's segments.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IterationContext {
    segment: usize,
    entries_visited: u64,
    current_offset: Option<u64>,
}

impl IterationContext {
    pub fn segment(&self) -> usize {
        self.segment
    }

    pub fn entries_visited(&self) -> u64 {
        self.entries_visited
    }

    pub fn current_offset(&self) -> Option<u64> {
        self.current_offset
    }

    /// Move the cursor to the next entry of the current segment.
    pub fn advance(&mut self, entry_offset: u64) {
        self.current_offset = Some(entry_offset);
        self.entries_visited += 1;
    }

    pub fn next_segment(&mut self) {
        self.segment += 1;
        self.current_offset = None;
    }

    /// Continue from where a query located its entry, so an iteration can
    /// start at the segment a lookup already touched.
    pub fn resume_from(&mut self, query: &QueryContext) {
        if let Some(segment) = query.segment() {
            self.segment = segment;
            self.current_offset = query.entry_offset();
        }
    }
}

impl ContextKind for IterationContext {
    const KIND: KindTag = KindTag::Iteration;

    fn create() -> Self {
        Self::default()
    }

    fn reset(&mut self) {
        *self = Self::default();
    }

    fn into_entry(context: Rc<Context<Self>>) -> ChainEntry {
        ChainEntry::Iteration(context)
    }

    fn from_entry(entry: &ChainEntry) -> Option<&Rc<Context<Self>>> {
        match entry {
            ChainEntry::Iteration(c) => Some(c),
            _ => None,
        }
    }
}
