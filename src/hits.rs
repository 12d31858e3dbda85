//! Hit grouper (§4.C).
//!
//! Groups a query-name sorted stream of aligned records into one [`HitsForRead`] per distinct
//! read name, routing supplementary records to their own per-end lists and applying a primary
//! selection policy to the rest. Grounded on the teacher's `reader.records(&header)`
//! iterator-adapter style: a struct wrapping an inner iterator, pulling ahead by one record to
//! know where a group ends.

use bstr::BString;
use noodles::sam::alignment::{record::Flags, record_buf::RecordBuf};

use crate::error::{MergeError, Result};

/// All alignment records the aligner produced for one read name.
///
/// `end1`/`end2` hold the non-supplementary hits for each segment (for an unpaired read, only
/// `end1_hits` is ever populated); `end{1,2}_supplementary` hold the supplementary records for
/// that segment, each already carrying the `SUPPLEMENTARY` flag and therefore never touched by
/// the primary selection policy.
#[derive(Debug, Default, Clone)]
pub struct HitsForRead {
    pub name: BString,
    pub end1_hits: Vec<RecordBuf>,
    pub end2_hits: Vec<RecordBuf>,
    pub end1_supplementary: Vec<RecordBuf>,
    pub end2_supplementary: Vec<RecordBuf>,
}

impl HitsForRead {
    fn new(name: BString) -> Self {
        Self {
            name,
            ..Self::default()
        }
    }

    /// True once every list is empty, i.e. the skip predicate filtered out the whole group.
    pub fn is_empty(&self) -> bool {
        self.end1_hits.is_empty()
            && self.end2_hits.is_empty()
            && self.end1_supplementary.is_empty()
            && self.end2_supplementary.is_empty()
    }
}

/// Picks exactly one hit per end to be primary, clearing `SECONDARY` on it and setting it on
/// every other hit in the slice. Applied once per non-supplementary hit list, per read end.
pub trait PrimarySelectionPolicy {
    fn select_primary(&self, hits: &mut [RecordBuf]);
}

/// Always promotes the first hit in encounter order; every later policy (e.g. "best alignment
/// score") is a drop-in replacement behind the same trait.
#[derive(Debug, Default, Clone, Copy)]
pub struct FirstHitWins;

impl PrimarySelectionPolicy for FirstHitWins {
    fn select_primary(&self, hits: &mut [RecordBuf]) {
        for (i, rec) in hits.iter_mut().enumerate() {
            let flags = rec.flags_mut();
            if i == 0 {
                flags.remove(Flags::SECONDARY);
            } else {
                flags.insert(Flags::SECONDARY);
            }
        }
    }
}

/// Groups a query-name sorted aligned record stream into [`HitsForRead`].
///
/// `skip` is applied per record before routing; a record for which it returns `true` is dropped
/// before it ever reaches a hit list (and so never participates in primary selection). Groups
/// whose every record was skipped are dropped silently, per §4.C.
pub struct HitGrouper<I, P> {
    inner: I,
    policy: P,
    skip: Box<dyn FnMut(&RecordBuf) -> bool>,
    pending: Option<RecordBuf>,
    previous_name: Option<BString>,
}

impl<I, P> HitGrouper<I, P>
where
    I: Iterator<Item = RecordBuf>,
    P: PrimarySelectionPolicy,
{
    /// `skip` is an arbitrary per-record predicate (e.g. "reference is not in the target set").
    ///
    /// The input must already be non-decreasing under SAM query-name collation; a regression is
    /// reported as [`MergeError::OutOfOrderAligned`] rather than silently re-sorted (§9).
    pub fn new(inner: I, policy: P, skip: Box<dyn FnMut(&RecordBuf) -> bool>) -> Self {
        Self {
            inner,
            policy,
            skip,
            pending: None,
            previous_name: None,
        }
    }

    fn read_name(rec: &RecordBuf) -> BString {
        rec.name()
            .map(|n| BString::from(n.as_bytes().to_vec()))
            .unwrap_or_default()
    }

    fn fill_pending(&mut self) -> Result<()> {
        if self.pending.is_some() {
            return Ok(());
        }
        loop {
            match self.inner.next() {
                None => return Ok(()),
                Some(rec) => {
                    if (self.skip)(&rec) {
                        continue;
                    }
                    let name = Self::read_name(&rec);
                    if let Some(previous) = &self.previous_name {
                        if crate::collate::compare_names(previous, &name) == std::cmp::Ordering::Greater
                        {
                            return Err(MergeError::OutOfOrderAligned {
                                name,
                                previous: previous.clone(),
                            });
                        }
                    }
                    self.previous_name = Some(name.clone());
                    self.pending = Some(rec);
                    return Ok(());
                }
            }
        }
    }

    /// Pulls the next group, or `None` at end of stream.
    pub fn next_group(&mut self) -> Result<Option<HitsForRead>> {
        loop {
            self.fill_pending()?;
            let Some(first) = self.pending.take() else {
                return Ok(None);
            };
            let name = Self::read_name(&first);
            let mut group = HitsForRead::new(name.clone());
            self.route(first, &mut group);

            loop {
                self.fill_pending()?;
                match &self.pending {
                    Some(rec) if Self::read_name(rec) == name => {
                        let rec = self.pending.take().unwrap();
                        self.route(rec, &mut group);
                    }
                    _ => break,
                }
            }

            self.policy.select_primary(&mut group.end1_hits);
            self.policy.select_primary(&mut group.end2_hits);

            if group.is_empty() {
                continue;
            }
            return Ok(Some(group));
        }
    }

    fn route(&self, rec: RecordBuf, group: &mut HitsForRead) {
        let flags = rec.flags();
        if flags.is_supplementary() {
            if flags.is_paired() && flags.is_last_in_template() {
                group.end2_supplementary.push(rec);
            } else {
                group.end1_supplementary.push(rec);
            }
        } else if flags.is_paired() && flags.is_last_in_template() {
            group.end2_hits.push(rec);
        } else {
            group.end1_hits.push(rec);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use noodles::sam::alignment::record_buf::Name;

    fn named(name: &str, flags: Flags) -> RecordBuf {
        RecordBuf::builder()
            .set_name(Name::from(name.as_bytes().to_vec()))
            .set_flags(flags)
            .build()
    }

    fn grouper(
        records: Vec<RecordBuf>,
    ) -> HitGrouper<std::vec::IntoIter<RecordBuf>, FirstHitWins> {
        HitGrouper::new(records.into_iter(), FirstHitWins, Box::new(|_| false))
    }

    #[test]
    fn test_single_end_single_hit_is_primary() {
        let mut g = grouper(vec![named("r1", Flags::empty())]);
        let group = g.next_group().unwrap().unwrap();
        assert_eq!(group.end1_hits.len(), 1);
        assert!(!group.end1_hits[0].flags().is_secondary());
    }

    #[test]
    fn test_multiple_hits_first_wins_rest_secondary() {
        let mut g = grouper(vec![named("r1", Flags::empty()), named("r1", Flags::empty())]);
        let group = g.next_group().unwrap().unwrap();
        assert_eq!(group.end1_hits.len(), 2);
        assert!(!group.end1_hits[0].flags().is_secondary());
        assert!(group.end1_hits[1].flags().is_secondary());
    }

    #[test]
    fn test_routes_by_segment_and_supplementary() {
        let mut g = grouper(vec![
            named("r1", Flags::SEGMENTED | Flags::FIRST_SEGMENT),
            named("r1", Flags::SEGMENTED | Flags::LAST_SEGMENT),
            named(
                "r1",
                Flags::SEGMENTED | Flags::FIRST_SEGMENT | Flags::SUPPLEMENTARY,
            ),
        ]);
        let group = g.next_group().unwrap().unwrap();
        assert_eq!(group.end1_hits.len(), 1);
        assert_eq!(group.end2_hits.len(), 1);
        assert_eq!(group.end1_supplementary.len(), 1);
        assert!(group.end2_supplementary.is_empty());
    }

    #[test]
    fn test_distinct_names_form_separate_groups() {
        let mut g = grouper(vec![named("a", Flags::empty()), named("b", Flags::empty())]);
        let first = g.next_group().unwrap().unwrap();
        let second = g.next_group().unwrap().unwrap();
        assert_eq!(first.name, BString::from(b"a".to_vec()));
        assert_eq!(second.name, BString::from(b"b".to_vec()));
        assert!(g.next_group().unwrap().is_none());
    }

    #[test]
    fn test_out_of_order_names_error() {
        let mut g = grouper(vec![named("b", Flags::empty()), named("a", Flags::empty())]);
        assert!(g.next_group().unwrap().is_some());
        let err = g.next_group().unwrap_err();
        assert!(matches!(err, MergeError::OutOfOrderAligned { .. }));
    }

    #[test]
    fn test_fully_skipped_group_is_dropped() {
        let mut inner = HitGrouper::new(
            vec![named("a", Flags::empty()), named("b", Flags::empty())].into_iter(),
            FirstHitWins,
            Box::new(|rec: &RecordBuf| {
                rec.name().map(|n| n.as_bytes() == b"a").unwrap_or(false)
            }),
        );
        let group = inner.next_group().unwrap().unwrap();
        assert_eq!(group.name, BString::from(b"b".to_vec()));
        assert!(inner.next_group().unwrap().is_none());
    }
}
