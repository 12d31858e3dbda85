//! Merge driver (§4.F): the outer join between the unaligned stream (original order) and the
//! hit-grouped aligned stream (query-name order). Grounded on the teacher's `main` outer loop
//! shape (pull a record, match on what it is, write) generalized to a two-iterator join keyed
//! by read name.

use std::cmp::Ordering;
use std::collections::VecDeque;

use bstr::BString;
use noodles::sam::alignment::record::data::field::Value;
use noodles::sam::alignment::record_buf::RecordBuf;

use crate::collate;
use crate::config::Config;
use crate::error::{MergeError, Result};
use crate::hits::{HitGrouper, HitsForRead, PrimarySelectionPolicy};
use crate::pairing;
use crate::tags;
use crate::transfer::{transfer_fragment, ReferenceResolver};

fn name_of(rec: &RecordBuf) -> BString {
    rec.name()
        .map(|n| BString::from(n.as_bytes().to_vec()))
        .unwrap_or_default()
}

/// A read's position came mostly from clipped bases, the signature the glossary describes for
/// cross-species contamination: an alignment where most of the read never actually matched.
fn is_contaminant_signature(rec: &RecordBuf) -> bool {
    let read_length = rec.sequence().len();
    if read_length == 0 {
        return false;
    }
    let aligned_bases = crate::cigar::reference_span(rec).min(read_length);
    let clipped_fraction = 1.0 - (aligned_bases as f64 / read_length as f64);
    clipped_fraction > 0.5
}

struct Template {
    end1: RecordBuf,
    end2: Option<RecordBuf>,
}

/// Joins an unaligned record stream with a grouped aligned-hit stream into one coherent output
/// stream (§4.F). Implements `Iterator<Item = Result<RecordBuf>>`; each call to `next()` may run
/// several steps of the inner loop before a record is ready to yield.
pub struct MergeDriver<U, I, P, R> {
    unaligned: U,
    hits: HitGrouper<I, P>,
    next_hits: Option<HitsForRead>,
    resolver: R,
    config: Config,
    pending: VecDeque<RecordBuf>,
    unaligned_exhausted: bool,
    done: bool,
}

impl<U, I, P, R> MergeDriver<U, I, P, R>
where
    U: Iterator<Item = RecordBuf>,
    I: Iterator<Item = RecordBuf>,
    P: PrimarySelectionPolicy,
    R: ReferenceResolver,
{
    pub fn new(unaligned: U, hits: HitGrouper<I, P>, resolver: R, config: Config) -> Self {
        Self {
            unaligned,
            hits,
            next_hits: None,
            resolver,
            config,
            pending: VecDeque::new(),
            unaligned_exhausted: false,
            done: false,
        }
    }

    fn next_template(&mut self) -> Option<Result<Template>> {
        let first = self.unaligned.next()?;
        if !first.flags().is_paired() {
            return Some(Ok(Template { end1: first, end2: None }));
        }

        let Some(second) = self.unaligned.next() else {
            return Some(Err(MergeError::PairingViolation {
                name: name_of(&first),
                reason: "paired read is missing its mate at end of stream".into(),
            }));
        };

        if name_of(&first) != name_of(&second) {
            return Some(Err(MergeError::PairingViolation {
                name: name_of(&first),
                reason: format!("mate name mismatch ({:?} vs {:?})", name_of(&first), name_of(&second)),
            }));
        }
        if !first.flags().is_first_in_template() || !second.flags().is_last_in_template() {
            return Some(Err(MergeError::PairingViolation {
                name: name_of(&first),
                reason: "expected first-of-pair followed by last-of-pair".into(),
            }));
        }

        Some(Ok(Template { end1: first, end2: Some(second) }))
    }

    fn advance(&mut self) -> Result<bool> {
        let Some(template) = self.next_template() else {
            self.unaligned_exhausted = true;
            if self.next_hits.is_some() || self.hits.next_group()?.is_some() {
                return Err(MergeError::UnalignedExhaustedEarly);
            }
            return Ok(false);
        };
        let template = template?;
        let name = name_of(&template.end1);

        if self.next_hits.is_none() {
            self.next_hits = self.hits.next_group()?;
        }

        match &self.next_hits {
            Some(hits) if hits.name == name => {
                let hits = self.next_hits.take().unwrap();
                self.process_match(template, hits)?;
            }
            Some(hits) if collate::compare_names(&name, &hits.name) == Ordering::Greater => {
                return Err(MergeError::AlignedAhead { name: hits.name.clone() });
            }
            _ => {
                if !self.config.aligned_only {
                    self.emit(template.end1);
                    if let Some(end2) = template.end2 {
                        self.emit(end2);
                    }
                }
            }
        }

        Ok(true)
    }

    fn process_match(&mut self, template: Template, hits: HitsForRead) -> Result<()> {
        let HitsForRead {
            end1_hits,
            end2_hits,
            end1_supplementary,
            end2_supplementary,
            ..
        } = hits;

        match template.end2 {
            None => self.process_fragment(template.end1, &end1_hits, &end1_supplementary)?,
            Some(end2) => self.process_pair(
                template.end1,
                end2,
                &end1_hits,
                &end2_hits,
                &end1_supplementary,
                &end2_supplementary,
            )?,
        }

        Ok(())
    }

    fn process_fragment(
        &mut self,
        template: RecordBuf,
        hits: &[RecordBuf],
        supplementary: &[RecordBuf],
    ) -> Result<()> {
        if hits.is_empty() {
            self.emit(template);
            return Ok(());
        }

        let primary_idx = hits.iter().position(|r| !r.flags().is_secondary());
        let contaminant = self.config.unmap_contaminants
            && primary_idx.map(|i| is_contaminant_signature(&hits[i])).unwrap_or(false);

        for (i, hit) in hits.iter().enumerate() {
            let is_primary = Some(i) == primary_idx;
            if !is_primary && !self.config.include_secondary {
                continue;
            }
            let mut rec = tags::clone_record(&template);
            transfer_fragment(
                &mut rec,
                hit,
                &self.resolver,
                &self.config,
                self.config.read1_trim,
                contaminant && is_primary,
                false,
            )?;
            if !rec.flags().is_unmapped() || is_primary {
                self.emit(rec);
            }
        }

        for sup in supplementary {
            let mut rec = tags::clone_record(&template);
            transfer_fragment(&mut rec, sup, &self.resolver, &self.config, self.config.read1_trim, false, false)?;
            self.emit(rec);
        }

        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn process_pair(
        &mut self,
        t1: RecordBuf,
        t2: RecordBuf,
        end1_hits: &[RecordBuf],
        end2_hits: &[RecordBuf],
        end1_supplementary: &[RecordBuf],
        end2_supplementary: &[RecordBuf],
    ) -> Result<()> {
        let primary1 = end1_hits.iter().position(|r| !r.flags().is_secondary());
        let primary2 = end2_hits.iter().position(|r| !r.flags().is_secondary());

        let contaminant = self.config.unmap_contaminants
            && (primary1.map(|i| is_contaminant_signature(&end1_hits[i])).unwrap_or(false)
                || primary2.map(|i| is_contaminant_signature(&end2_hits[i])).unwrap_or(false));

        let n = end1_hits.len().max(end2_hits.len()).max(1);
        let mut primary_pair: Option<(RecordBuf, RecordBuf)> = None;

        for i in 0..n {
            let is_primary = i == 0;
            if !is_primary && !self.config.include_secondary {
                continue;
            }
            let mut r1 = tags::clone_record(&t1);
            let mut r2 = tags::clone_record(&t2);

            if let Some(hit1) = end1_hits.get(i) {
                transfer_fragment(
                    &mut r1,
                    hit1,
                    &self.resolver,
                    &self.config,
                    self.config.read1_trim,
                    contaminant && is_primary,
                    false,
                )?;
            }
            if let Some(hit2) = end2_hits.get(i) {
                transfer_fragment(
                    &mut r2,
                    hit2,
                    &self.resolver,
                    &self.config,
                    self.config.read2_trim,
                    contaminant && is_primary,
                    false,
                )?;
            }

            pairing::clip_overlap_both(&mut r1, &mut r2, self.config.clip_overlapping, self.config.hard_clip_overlapping)?;
            pairing::link_mates(&mut r1, &mut r2, self.config.add_mate_cigar);
            pairing::set_proper_pair(&mut r1, &mut r2, &self.config);

            if is_primary {
                primary_pair = Some((tags::clone_record(&r1), tags::clone_record(&r2)));
            }

            let emit1 = !r1.flags().is_unmapped() || is_primary;
            let emit2 = !r2.flags().is_unmapped() || is_primary;
            if emit1 {
                self.emit(r1);
            }
            if emit2 {
                self.emit(r2);
            }
        }

        let (primary1_rec, primary2_rec) = primary_pair.unwrap();

        for sup in end1_supplementary {
            let rec = pairing::transfer_supplementary(
                &t1,
                sup,
                Some(&primary2_rec),
                &self.resolver,
                &self.config,
                self.config.read1_trim,
                false,
            )?;
            self.emit(rec);
        }
        for sup in end2_supplementary {
            let rec = pairing::transfer_supplementary(
                &t2,
                sup,
                Some(&primary1_rec),
                &self.resolver,
                &self.config,
                self.config.read2_trim,
                false,
            )?;
            self.emit(rec);
        }

        Ok(())
    }

    /// Chains tag `PG` onto `rec` when configured, then queues it for output (§6).
    fn emit(&mut self, mut rec: RecordBuf) {
        if self.config.add_program_tag {
            if let Some(id) = &self.config.program_id {
                rec.data_mut().insert(tags::well_known::PROGRAM, Value::from(id.clone()));
            }
        }
        self.pending.push_back(rec);
    }
}

impl<U, I, P, R> Iterator for MergeDriver<U, I, P, R>
where
    U: Iterator<Item = RecordBuf>,
    I: Iterator<Item = RecordBuf>,
    P: PrimarySelectionPolicy,
    R: ReferenceResolver,
{
    type Item = Result<RecordBuf>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            if let Some(rec) = self.pending.pop_front() {
                return Some(Ok(rec));
            }
            if self.unaligned_exhausted {
                self.done = true;
                return None;
            }
            match self.advance() {
                Ok(true) => continue,
                Ok(false) => {
                    self.done = true;
                    return None;
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
    }
}
