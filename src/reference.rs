//! Reference sequence walker (§4.J, ambient plumbing supporting §4.H).
//!
//! A thin caching decorator around the external reference-byte-source collaborator. The actual
//! byte source (FASTA indexing/loading) is out of scope (Non-goals) — callers supply one.

use std::io;

/// External collaborator supplying reference bases by index, e.g. backed by an indexed FASTA.
pub trait ReferenceSource {
    fn get(&mut self, reference_index: usize) -> io::Result<Vec<u8>>;
}

/// Remembers the most recently fetched `(reference_index, bytes)` pair and only calls the
/// underlying source when the index changes. Callers must access references in non-decreasing
/// order (the contract the coordinate-sorted pass in §4.H relies on); violating it trips a debug
/// assertion rather than silently refetching out of order.
pub struct CachingReferenceWalker<S> {
    source: S,
    cached: Option<(usize, Vec<u8>)>,
}

impl<S: ReferenceSource> CachingReferenceWalker<S> {
    pub fn new(source: S) -> Self {
        Self { source, cached: None }
    }

    pub fn get(&mut self, reference_index: usize) -> io::Result<&[u8]> {
        if let Some((cached_index, _)) = &self.cached {
            debug_assert!(
                reference_index >= *cached_index,
                "reference walker accessed out of order: index {reference_index} requested after {cached_index}"
            );
        }

        if self.cached.as_ref().map(|(i, _)| *i) != Some(reference_index) {
            let bytes = self.source.get(reference_index)?;
            self.cached = Some((reference_index, bytes));
        }

        Ok(&self.cached.as_ref().unwrap().1)
    }
}
