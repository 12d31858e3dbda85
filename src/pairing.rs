//! Pair fixer (§4.E): overlap clipping, mate linkage, proper-pair determination and
//! supplementary-hit linkage. Built on [`crate::cigar`]'s softclip-ignoring lookup, applied
//! symmetrically to both mates as the spec describes.

use noodles::sam::alignment::record::{data::field::Value, Flags};
use noodles::sam::alignment::record_buf::RecordBuf;

use crate::cigar::{self, ClipKind};
use crate::config::{Config, PairOrientation};
use crate::error::Result;
use crate::tags::{self, well_known};
use crate::transfer::{transfer_fragment, ReferenceResolver};

fn set_flag(flags: &mut Flags, bit: Flags, on: bool) {
    if on {
        flags.insert(bit);
    } else {
        flags.remove(bit);
    }
}

/// Soft- (and optionally hard-) clips the overlapping portion of two mapped, opposite-strand
/// mates whose reference intervals overlap (§4.E "Overlap clipping").
///
/// No-op unless both ends are mapped, on the same reference, on opposite strands, with
/// overlapping `[start, end]` intervals.
pub fn clip_overlap(end1: &mut RecordBuf, end2: &mut RecordBuf, hard_clip: bool) -> Result<()> {
    let kind = if hard_clip { ClipKind::Hard } else { ClipKind::Soft };
    clip_overlap_kind(end1, end2, kind)
}

/// Runs overlap clipping twice when both soft and hard overlap clipping are requested: a soft
/// pass first, then a hard pass using the *pre-clip* ("unclipped") mate bounds, per §4.E's
/// "repeat using unclipped start/end of mate, with hard clips instead of soft".
pub fn clip_overlap_both(end1: &mut RecordBuf, end2: &mut RecordBuf, soft: bool, hard: bool) -> Result<()> {
    let original_bounds = |r: &RecordBuf| -> Option<(usize, usize)> {
        Some((r.alignment_start().map(usize::from)?, cigar::alignment_end(r)?))
    };
    let pre_bounds = if hard {
        Some((original_bounds(end1), original_bounds(end2)))
    } else {
        None
    };

    if soft {
        clip_overlap_kind(end1, end2, ClipKind::Soft)?;
    }
    if hard {
        if let Some((Some(b1), Some(b2))) = pre_bounds {
            clip_overlap_with_bounds(end1, end2, b1, b2, ClipKind::Hard)?;
        }
    }
    Ok(())
}

fn clip_overlap_kind(end1: &mut RecordBuf, end2: &mut RecordBuf, kind: ClipKind) -> Result<()> {
    let Some(bounds) = overlap_bounds(end1, end2) else {
        return Ok(());
    };
    let (b1, b2) = bounds;
    clip_overlap_with_bounds(end1, end2, b1, b2, kind)
}

fn overlap_bounds(end1: &RecordBuf, end2: &RecordBuf) -> Option<((usize, usize), (usize, usize))> {
    let (r1, r2) = (end1.reference_sequence_id()?, end2.reference_sequence_id()?);
    if r1 != r2 || end1.flags().is_unmapped() || end2.flags().is_unmapped() {
        return None;
    }
    if end1.flags().is_reverse() == end2.flags().is_reverse() {
        return None;
    }
    let b1 = (end1.alignment_start().map(usize::from)?, cigar::alignment_end(end1)?);
    let b2 = (end2.alignment_start().map(usize::from)?, cigar::alignment_end(end2)?);
    if b1.0 > b2.1 || b2.0 > b1.1 {
        return None;
    }
    Some((b1, b2))
}

fn clip_overlap_with_bounds(
    end1: &mut RecordBuf,
    end2: &mut RecordBuf,
    bounds1: (usize, usize),
    bounds2: (usize, usize),
    kind: ClipKind,
) -> Result<()> {
    let end1_is_reverse = end1.flags().is_reverse();
    let (pos, pos_bounds, neg, neg_bounds) = if end1_is_reverse {
        (&mut *end2, bounds2, &mut *end1, bounds1)
    } else {
        (&mut *end1, bounds1, &mut *end2, bounds2)
    };

    // `pos` loses its high-coordinate (3') overlap: storage order runs reference-left-to-right
    // for every record regardless of strand, so the boundary is `neg`'s start.
    let pos_clip_from = cigar::read_position_at_ref_ignoring_softclip(pos, neg_bounds.0);
    if pos_clip_from > 0 {
        cigar::clip_3prime_end(pos, pos_clip_from, kind)?;
    }

    // `neg` loses its low-coordinate (5') overlap, which is a prefix clip and advances its
    // alignment start rather than its end.
    let neg_clip_to = cigar::read_position_at_ref_ignoring_softclip(neg, pos_bounds.1);
    if neg_clip_to > 0 {
        cigar::clip_5prime_end(neg, neg_clip_to, kind)?;
    }

    Ok(())
}

/// Sets mate-reference, mate-start, mate-strand, mate-unmapped, template length, and (if
/// requested) tag `MC` on each record from the other (§4.E "Mate linkage").
pub fn link_mates(end1: &mut RecordBuf, end2: &mut RecordBuf, add_mate_cigar: bool) {
    link_one_way(end1, end2, add_mate_cigar);
    link_one_way(end2, end1, add_mate_cigar);
    set_template_length(end1, end2);
}

fn link_one_way(this: &mut RecordBuf, mate: &RecordBuf, add_mate_cigar: bool) {
    *this.mate_reference_sequence_id_mut() = mate.reference_sequence_id();
    *this.mate_alignment_start_mut() = mate.alignment_start();

    let mut flags = *this.flags();
    set_flag(&mut flags, Flags::MATE_UNMAPPED, mate.flags().is_unmapped());
    set_flag(&mut flags, Flags::MATE_REVERSE_COMPLEMENTED, mate.flags().is_reverse());
    *this.flags_mut() = flags;

    if add_mate_cigar && !mate.flags().is_unmapped() {
        let mc = cigar::format_cigar(mate);
        this.data_mut().insert(well_known::MATE_CIGAR, Value::from(mc));
    } else {
        this.data_mut().remove(&well_known::MATE_CIGAR);
    }
}

fn set_template_length(end1: &mut RecordBuf, end2: &mut RecordBuf) {
    let lengths = (|| {
        let r1 = end1.reference_sequence_id()?;
        let r2 = end2.reference_sequence_id()?;
        if r1 != r2 {
            return None;
        }
        let s1 = usize::from(end1.alignment_start()?);
        let s2 = usize::from(end2.alignment_start()?);
        let e1 = cigar::alignment_end(end1)?;
        let e2 = cigar::alignment_end(end2)?;
        let leftmost = s1.min(s2);
        let rightmost = e1.max(e2);
        Some((rightmost - leftmost + 1) as i32)
    })();

    let Some(len) = lengths else {
        *end1.template_length_mut() = 0;
        *end2.template_length_mut() = 0;
        return;
    };

    let s1 = usize::from(end1.alignment_start().unwrap());
    let s2 = usize::from(end2.alignment_start().unwrap());
    if s1 <= s2 {
        *end1.template_length_mut() = len;
        *end2.template_length_mut() = -len;
    } else {
        *end1.template_length_mut() = -len;
        *end2.template_length_mut() = len;
    }
}

fn classify_orientation(end1: &RecordBuf, end2: &RecordBuf) -> Option<PairOrientation> {
    let s1 = usize::from(end1.alignment_start()?);
    let s2 = usize::from(end2.alignment_start()?);
    let (left_rev, right_rev) = if s1 <= s2 {
        (end1.flags().is_reverse(), end2.flags().is_reverse())
    } else {
        (end2.flags().is_reverse(), end1.flags().is_reverse())
    };

    Some(match (left_rev, right_rev) {
        (false, true) => PairOrientation::FR,
        (true, false) => PairOrientation::RF,
        _ => PairOrientation::Tandem,
    })
}

/// Clears or sets the proper-pair flag on both ends (§4.E "Proper-pair"), unless
/// `config.keep_aligner_proper_pair` asks to leave the aligner's own decision in place.
pub fn set_proper_pair(end1: &mut RecordBuf, end2: &mut RecordBuf, config: &Config) {
    if config.keep_aligner_proper_pair {
        return;
    }

    let proper = !end1.flags().is_unmapped()
        && !end2.flags().is_unmapped()
        && end1.reference_sequence_id() == end2.reference_sequence_id()
        && end1.reference_sequence_id().is_some()
        && classify_orientation(end1, end2)
            .map(|o| config.expected_orientations.contains(&o))
            .unwrap_or(false)
        && insert_size(end1, end2)
            .map(|len| len <= config.max_insert_size)
            .unwrap_or(false);

    let mut f1 = *end1.flags();
    let mut f2 = *end2.flags();
    set_flag(&mut f1, Flags::PROPERLY_ALIGNED, proper);
    set_flag(&mut f2, Flags::PROPERLY_ALIGNED, proper);
    *end1.flags_mut() = f1;
    *end2.flags_mut() = f2;
}

fn insert_size(end1: &RecordBuf, end2: &RecordBuf) -> Option<i32> {
    let s1 = usize::from(end1.alignment_start()?);
    let s2 = usize::from(end2.alignment_start()?);
    let e1 = cigar::alignment_end(end1)?;
    let e2 = cigar::alignment_end(end2)?;
    Some((e1.max(e2) - s1.min(s2) + 1) as i32)
}

/// Clones `template`, transfers `supplementary_hit` onto the clone, and links it to the
/// *primary* hit of the opposite end (§4.E "Supplementary linkage").
pub fn transfer_supplementary(
    template: &RecordBuf,
    supplementary_hit: &RecordBuf,
    opposite_end_primary: Option<&RecordBuf>,
    resolver: &dyn ReferenceResolver,
    config: &Config,
    trim: Option<usize>,
    safe_rc: bool,
) -> Result<RecordBuf> {
    let mut clone = tags::clone_record(template);
    transfer_fragment(&mut clone, supplementary_hit, resolver, config, trim, false, safe_rc)?;

    if let Some(mate) = opposite_end_primary {
        link_one_way(&mut clone, mate, config.add_mate_cigar);
    }

    Ok(clone)
}

#[cfg(test)]
mod tests {
    use super::*;
    use noodles::core::Position;
    use noodles::sam::alignment::record::cigar::{op::Kind, Op};
    use noodles::sam::alignment::record_buf::{
        Cigar as RecordBufCigar, QualityScores as RecordBufQS, Sequence as RecordBufSequence,
    };

    fn mapped(start: usize, len: usize, reverse: bool) -> RecordBuf {
        let mut flags = Flags::empty();
        if reverse {
            flags.insert(Flags::REVERSE_COMPLEMENTED);
        }
        RecordBuf::builder()
            .set_reference_sequence_id(0)
            .set_alignment_start(Position::new(start).unwrap())
            .set_cigar(RecordBufCigar::from(vec![Op::new(Kind::Match, len)]))
            .set_flags(flags)
            .set_sequence(RecordBufSequence::from(vec![b'A'; len]))
            .set_quality_scores(RecordBufQS::from(vec![30u8; len]))
            .build()
    }

    #[test]
    fn test_clip_overlap_soft_only() {
        // chr1:100-200 forward (101bp incl.), chr1:150-250 reverse (101bp), overlap [150,200].
        let mut r1 = mapped(100, 101, false);
        let mut r2 = mapped(150, 101, true);

        clip_overlap(&mut r1, &mut r2, false).unwrap();

        assert_eq!(cigar::alignment_end(&r1).unwrap(), 149);
        assert_eq!(usize::from(r2.alignment_start().unwrap()), 201);
        let r2_ops: Vec<Op> = r2.cigar().iter().copied().collect();
        assert_eq!(r2_ops, vec![Op::new(Kind::SoftClip, 51), Op::new(Kind::Match, 50)]);
        assert_eq!(r1.sequence().len(), 101);
        assert_eq!(r2.sequence().len(), 101);
    }

    #[test]
    fn test_clip_overlap_noop_same_strand() {
        let mut r1 = mapped(100, 50, false);
        let mut r2 = mapped(120, 50, false);
        let before1 = r1.cigar().clone();
        let before2 = r2.cigar().clone();
        clip_overlap(&mut r1, &mut r2, false).unwrap();
        assert_eq!(r1.cigar(), &before1);
        assert_eq!(r2.cigar(), &before2);
    }

    #[test]
    fn test_link_mates_sets_reciprocal_fields() {
        let mut r1 = mapped(100, 50, false);
        let mut r2 = mapped(200, 50, true);
        link_mates(&mut r1, &mut r2, true);

        assert_eq!(r1.mate_alignment_start(), r2.alignment_start());
        assert_eq!(r2.mate_alignment_start(), r1.alignment_start());
        assert!(r1.flags().is_mate_reverse());
        assert!(!r1.flags().is_mate_unmapped());
        assert!(r1.data().get(&well_known::MATE_CIGAR).is_some());
        assert_eq!(r1.template_length(), -r2.template_length());
    }

    #[test]
    fn test_proper_pair_fr_within_insert_size() {
        let mut r1 = mapped(100, 50, false);
        let mut r2 = mapped(200, 50, true);
        let config = Config::default();
        set_proper_pair(&mut r1, &mut r2, &config);
        assert!(r1.flags().is_proper_pair());
        assert!(r2.flags().is_proper_pair());
    }

    #[test]
    fn test_proper_pair_tandem_not_proper() {
        let mut r1 = mapped(100, 50, false);
        let mut r2 = mapped(200, 50, false);
        let config = Config::default();
        set_proper_pair(&mut r1, &mut r2, &config);
        assert!(!r1.flags().is_proper_pair());
    }
}
