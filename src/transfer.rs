//! Transfer engine (§4.D).
//!
//! Pushes one aligner hit onto an unaligned template record, turning it from a bare
//! name+sequence+metadata row into a fully mapped (or deliberately unmapped) output record.
//! Grounded on the teacher's field-mutator style (`*read.alignment_start_mut() = ...`,
//! `*read.cigar_mut() = ...`) generalized from a single doubled-reference rewrite to a general
//! aligner-hit transfer.

use bstr::BString;
use noodles::sam::alignment::{
    record::{data::field::Value, Flags, MappingQuality},
    record_buf::RecordBuf,
};

use crate::cigar::{self, ClipKind};
use crate::config::Config;
use crate::error::{MergeError, Result};
use crate::tags::{self, well_known};

fn set_flag(flags: &mut Flags, bit: Flags, on: bool) {
    if on {
        flags.insert(bit);
    } else {
        flags.remove(bit);
    }
}

fn name_of(rec: &RecordBuf) -> BString {
    rec.name()
        .map(|n| BString::from(n.as_bytes().to_vec()))
        .unwrap_or_else(|| BString::from("*"))
}

/// Resolves an aligned hit's reference name to an index in the output header's reference
/// dictionary (the spec requires copying the reference *by name*, not index, so that the
/// aligned stream and the output can use differently ordered dictionaries).
pub trait ReferenceResolver {
    /// Name of the reference the aligned hit's `reference_sequence_id` refers to, if mapped.
    fn aligned_reference_name<'a>(&'a self, aligned: &RecordBuf) -> Option<&'a [u8]>;
    /// Index of `name` in the output dictionary.
    fn output_index_for(&self, name: &[u8]) -> Option<usize>;
    /// Length of the reference at `output_index`, for overhang clipping.
    fn output_length_at(&self, output_index: usize) -> Option<usize>;
    /// Name of the reference at `output_index`, the inverse of [`Self::output_index_for`], used
    /// to encode the real contig name into tag `OA` (§4.D step 9) rather than a synthetic one.
    fn output_name_at(&self, output_index: usize) -> Option<Vec<u8>>;
}

/// Transfers one aligner hit onto `template` (§4.D). `trim` is the number of 5'-end bases that
/// were removed from this end before the aligner ever saw it (`Config::read{1,2}_trim`).
/// `unmap_for_contam` drives step 9; `needs_safe_rc` is the fast path for reverse-complementing
/// a read known not to contain non-IUPAC bases.
pub fn transfer_fragment(
    template: &mut RecordBuf,
    aligned: &RecordBuf,
    resolver: &dyn ReferenceResolver,
    config: &Config,
    trim: Option<usize>,
    unmap_for_contam: bool,
    needs_safe_rc: bool,
) -> Result<()> {
    if !template.flags().is_unmapped() {
        return Err(MergeError::UnalignedBamContainsMapped { name: name_of(template) });
    }

    tags::copy_nonreserved_tags(
        template,
        aligned,
        &config.attributes_retain,
        &config.attributes_remove,
    );

    let aligned_flags = aligned.flags();
    let is_mapped = !aligned_flags.is_unmapped();

    let mut out_flags = *template.flags();
    set_flag(&mut out_flags, Flags::UNMAPPED, !is_mapped);
    set_flag(&mut out_flags, Flags::REVERSE_COMPLEMENTED, aligned_flags.is_reverse());
    set_flag(&mut out_flags, Flags::SECONDARY, aligned_flags.is_secondary());
    set_flag(&mut out_flags, Flags::SUPPLEMENTARY, aligned_flags.is_supplementary());
    if out_flags.is_paired() {
        set_flag(&mut out_flags, Flags::PROPERLY_ALIGNED, aligned_flags.is_proper_pair());
    }
    *template.flags_mut() = out_flags;

    if is_mapped {
        let ref_name = resolver
            .aligned_reference_name(aligned)
            .map(|n| n.to_vec());
        let ref_index = ref_name.as_deref().and_then(|n| resolver.output_index_for(n));
        *template.reference_sequence_id_mut() = ref_index;
        *template.alignment_start_mut() = aligned.alignment_start();
        *template.cigar_mut() = aligned.cigar().clone();
        *template.mapping_quality_mut() = aligned.mapping_quality();
    } else {
        *template.reference_sequence_id_mut() = None;
        *template.alignment_start_mut() = None;
        *template.cigar_mut() = Default::default();
        *template.mapping_quality_mut() = None;
    }

    if template.flags().is_reverse() {
        tags::reverse_complement_in_place(
            template,
            &config.attributes_reverse_complement,
            &config.attributes_reverse,
            needs_safe_rc,
        );
    }

    if is_mapped {
        apply_trim_and_unwritten_clips(template, trim)?;

        if let Some(out_index) = template.reference_sequence_id() {
            if let Some(len) = resolver.output_length_at(out_index) {
                cigar::soft_clip_overhang_end(template, len)?;
            }
        }

        if config.clip_adapters {
            if let Some(Value::Int32(start)) =
                template.data().get(&well_known::ADAPTER_CLIP_START).cloned()
            {
                cigar::clip_3prime_end(template, start as usize, ClipKind::Soft)?;
            }
        }

        if cigar::reference_span(template) == 0 {
            log::warn!("record {:?}: zero reference-consuming CIGAR bases, unmapping", name_of(template).as_ref());
            unmap_fully(template);
        } else if let Some(out_index) = template.reference_sequence_id() {
            if let Some(len) = resolver.output_length_at(out_index) {
                if let Some(end) = cigar::alignment_end(template) {
                    if usize::from(template.alignment_start().unwrap()) > len || end < usize::from(template.alignment_start().unwrap())
                    {
                        log::warn!("record {:?}: alignment falls past end of reference, unmapping", name_of(template).as_ref());
                        unmap_fully(template);
                    }
                }
            }
        }
    }

    if unmap_for_contam {
        apply_contamination_unmap(template, resolver, config);
    }

    Ok(())
}

/// Re-adds soft clips at the 5' end (bases trimmed before alignment) and/or 3' end (bases the
/// aligner never saw) so the CIGAR's query length matches the template's actual sequence length
/// (§4.D step 5).
fn apply_trim_and_unwritten_clips(rec: &mut RecordBuf, trim: Option<usize>) -> Result<()> {
    let template_len = rec.sequence().len();
    let cigar_query_len: usize = rec
        .cigar()
        .iter()
        .filter(|o| o.kind().consumes_read())
        .map(|o| o.len())
        .sum();

    let unwritten = template_len.saturating_sub(cigar_query_len + trim.unwrap_or(0));

    if unwritten > 0 {
        let clip_from = cigar_query_len + trim.unwrap_or(0) + 1;
        cigar::clip_3prime_end(rec, clip_from, ClipKind::Soft)?;
    }

    if let Some(trim) = trim {
        if trim > 0 {
            let ops: Vec<_> = rec.cigar().iter().copied().collect();
            let mut new_ops = Vec::with_capacity(ops.len() + 1);
            new_ops.push(noodles::sam::alignment::record::cigar::Op::new(
                noodles::sam::alignment::record::cigar::op::Kind::SoftClip,
                trim,
            ));
            new_ops.extend(ops);
            *rec.cigar_mut() = new_ops.into_iter().collect();
        }
    }

    Ok(())
}

fn unmap_fully(rec: &mut RecordBuf) {
    let mut flags = *rec.flags();
    flags.insert(Flags::UNMAPPED);
    *rec.flags_mut() = flags;
    *rec.reference_sequence_id_mut() = None;
    *rec.alignment_start_mut() = None;
    *rec.cigar_mut() = Default::default();
    *rec.mapping_quality_mut() = None;
}

/// Encodes `contig,start,cigar,mapq,nm;` for tag `OA` (missing NM as an empty field), per
/// §4.D step 9 / §6.
fn encode_original_alignment(rec: &RecordBuf, contig: &str) -> String {
    let start = rec.alignment_start().map(usize::from).unwrap_or(0);
    let cigar = cigar::format_cigar(rec);
    let mapq = rec
        .mapping_quality()
        .map(|mq| mq.get().to_string())
        .unwrap_or_default();
    let nm = match rec.data().get(&well_known::EDIT_DISTANCE) {
        Some(Value::Int32(n)) => n.to_string(),
        _ => String::new(),
    };
    format!("{contig},{start},{cigar},{mapq},{nm};")
}

fn apply_contamination_unmap(rec: &mut RecordBuf, resolver: &dyn ReferenceResolver, config: &Config) {
    let strategy = config.unmap_strategy;

    if strategy.populates_oa() {
        if let Some(index) = rec.reference_sequence_id() {
            if let Some(name) = resolver.output_name_at(index) {
                let contig = String::from_utf8_lossy(&name).into_owned();
                let oa = encode_original_alignment(rec, &contig);
                rec.data_mut().insert(well_known::ORIGINAL_ALIGNMENT, Value::from(oa));
            }
        }
    }

    if strategy.resets_mapping_info() {
        *rec.reference_sequence_id_mut() = None;
        *rec.alignment_start_mut() = None;
        rec.data_mut().remove(&well_known::EDIT_DISTANCE);
    }

    let mut flags = *rec.flags();
    flags.insert(Flags::UNMAPPED);
    *rec.flags_mut() = flags;

    if strategy.requires_valid_unmapped() {
        *rec.mapping_quality_mut() = None;
        *rec.cigar_mut() = Default::default();
    }

    let note = "Cross-species contamination";
    let existing = match rec.data().get(&well_known::COMMENT) {
        Some(Value::String(s)) => Some(s.to_string()),
        _ => None,
    };
    let combined = match existing {
        Some(s) if !s.is_empty() => format!("{s} | {note}"),
        _ => note.to_string(),
    };
    rec.data_mut().insert(well_known::COMMENT, Value::from(combined));
}

/// Transfers both ends of a pair. Either side may be `None` (single-end fragment within a run
/// that otherwise processes pairs). Overlap clipping and mate linkage are applied by the pair
/// fixer (§4.E) after both transfers land.
pub fn transfer_pair(
    t1: Option<&mut RecordBuf>,
    a1: Option<&RecordBuf>,
    t2: Option<&mut RecordBuf>,
    a2: Option<&RecordBuf>,
    resolver: &dyn ReferenceResolver,
    config: &Config,
    contam: (bool, bool),
    safe_rc: bool,
) -> Result<()> {
    if let (Some(t1), Some(a1)) = (t1, a1) {
        transfer_fragment(t1, a1, resolver, config, config.read1_trim, contam.0, safe_rc)?;
    }
    if let (Some(t2), Some(a2)) = (t2, a2) {
        transfer_fragment(t2, a2, resolver, config, config.read2_trim, contam.1, safe_rc)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use noodles::core::Position;
    use noodles::sam::alignment::record::cigar::{op::Kind, Op};
    use noodles::sam::alignment::record_buf::{
        Cigar as RecordBufCigar, Name, QualityScores as RecordBufQS, Sequence as RecordBufSequence,
    };

    struct FixedResolver {
        index: Option<usize>,
        length: usize,
    }

    impl ReferenceResolver for FixedResolver {
        fn aligned_reference_name<'a>(&'a self, _aligned: &RecordBuf) -> Option<&'a [u8]> {
            self.index.map(|_| b"chr1".as_slice())
        }
        fn output_index_for(&self, _name: &[u8]) -> Option<usize> {
            self.index
        }
        fn output_length_at(&self, _output_index: usize) -> Option<usize> {
            Some(self.length)
        }
        fn output_name_at(&self, output_index: usize) -> Option<Vec<u8>> {
            if self.index == Some(output_index) {
                Some(b"chr1".to_vec())
            } else {
                None
            }
        }
    }

    fn unaligned_template(len: usize) -> RecordBuf {
        let seq: Vec<u8> = b"A".iter().cycle().take(len).copied().collect();
        RecordBuf::builder()
            .set_name(Name::from(b"r1".to_vec()))
            .set_flags(Flags::UNMAPPED)
            .set_sequence(RecordBufSequence::from(seq))
            .set_quality_scores(RecordBufQS::from(vec![30u8; len]))
            .build()
    }

    fn aligned_hit(start: usize, cigar: Vec<Op>, mapq: u8) -> RecordBuf {
        let mut rec = RecordBuf::builder()
            .set_reference_sequence_id(0)
            .set_alignment_start(Position::new(start).unwrap())
            .set_cigar(RecordBufCigar::from(cigar))
            .set_mapping_quality(MappingQuality::try_from(mapq).unwrap())
            .build();
        rec.data_mut().insert(well_known::EDIT_DISTANCE, Value::from(0i32));
        rec
    }

    #[test]
    fn test_transfer_simple_single_hit() {
        let mut template = unaligned_template(50);
        let aligned = aligned_hit(1000, vec![Op::new(Kind::Match, 50)], 60);
        let resolver = FixedResolver { index: Some(0), length: 10_000 };
        let config = Config::default();

        transfer_fragment(&mut template, &aligned, &resolver, &config, None, false, false).unwrap();

        assert!(!template.flags().is_unmapped());
        assert_eq!(template.reference_sequence_id(), Some(0));
        assert_eq!(usize::from(template.alignment_start().unwrap()), 1000);
        let ops: Vec<Op> = template.cigar().iter().copied().collect();
        assert_eq!(ops, vec![Op::new(Kind::Match, 50)]);
    }

    #[test]
    fn test_transfer_trim_front_five_bases() {
        let mut template = unaligned_template(50);
        let aligned = aligned_hit(2000, vec![Op::new(Kind::Match, 45)], 60);
        let resolver = FixedResolver { index: Some(0), length: 10_000 };
        let config = Config::default();

        transfer_fragment(&mut template, &aligned, &resolver, &config, Some(5), false, false).unwrap();

        let ops: Vec<Op> = template.cigar().iter().copied().collect();
        assert_eq!(ops, vec![Op::new(Kind::SoftClip, 5), Op::new(Kind::Match, 45)]);
        assert_eq!(template.sequence().len(), 50);
    }

    #[test]
    fn test_transfer_contamination_move_to_tag() {
        let mut template = unaligned_template(50);
        let aligned = aligned_hit(1000, vec![Op::new(Kind::Match, 50)], 60);
        let resolver = FixedResolver { index: Some(0), length: 10_000 };
        let config = Config::default();

        transfer_fragment(&mut template, &aligned, &resolver, &config, None, true, false).unwrap();

        assert!(template.flags().is_unmapped());
        assert_eq!(template.reference_sequence_id(), None);
        assert!(template.cigar().is_empty());
        let oa = template.data().get(&well_known::ORIGINAL_ALIGNMENT).unwrap();
        assert!(matches!(oa, Value::String(s) if s.as_ref() == b"chr1,1000,50M,60,0;"));
        let co = template.data().get(&well_known::COMMENT).unwrap();
        assert!(matches!(co, Value::String(s) if s.as_ref() == b"Cross-species contamination"));
    }

    #[test]
    fn test_transfer_unmapped_hit_leaves_template_unmapped() {
        let mut template = unaligned_template(50);
        let aligned = RecordBuf::builder().set_flags(Flags::UNMAPPED).build();
        let resolver = FixedResolver { index: None, length: 0 };
        let config = Config::default();

        transfer_fragment(&mut template, &aligned, &resolver, &config, None, false, false).unwrap();
        assert!(template.flags().is_unmapped());
    }

    #[test]
    fn test_transfer_already_mapped_template_errors() {
        let mut template = aligned_hit(1, vec![Op::new(Kind::Match, 10)], 10);
        let aligned = aligned_hit(1, vec![Op::new(Kind::Match, 10)], 10);
        let resolver = FixedResolver { index: Some(0), length: 100 };
        let config = Config::default();

        let err = transfer_fragment(&mut template, &aligned, &resolver, &config, None, false, false)
            .unwrap_err();
        assert!(matches!(err, MergeError::UnalignedBamContainsMapped { .. }));
    }
}
