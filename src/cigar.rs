//! CIGAR utilities (§4.B).
//!
//! The splitting loop in [`clip_3prime_end`] is the same shape as the doubled-reference CIGAR
//! splitter this crate's teacher used to cut a read's CIGAR at a reference boundary: walk the
//! ops, track a cursor, and when the cursor crosses the target position, truncate the op that
//! straddles it and stop. Here the cursor is the *read* position instead of the *reference*
//! position, since a 3' clip is defined in read space.

use bstr::BString;
use noodles::sam::alignment::{
    record::cigar::{op::Kind, Op},
    record_buf::RecordBuf,
};

use crate::error::{MergeError, Result};
use crate::tags::{complement_base, well_known};

/// Which clip operation to apply (§4.B).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClipKind {
    Soft,
    Hard,
}

impl ClipKind {
    fn op_kind(self) -> Kind {
        match self {
            Self::Soft => Kind::SoftClip,
            Self::Hard => Kind::HardClip,
        }
    }
}

fn name_of(rec: &RecordBuf) -> BString {
    rec.name()
        .map(|n| BString::from(n.as_bytes().to_vec()))
        .unwrap_or_else(|| BString::from("*"))
}

/// Sum of reference-consuming CIGAR op lengths (M/D/N/=/X).
pub fn reference_span(rec: &RecordBuf) -> usize {
    rec.cigar()
        .iter()
        .filter(|o| o.kind().consumes_reference())
        .map(|o| o.len())
        .sum()
}

fn op_char(kind: Kind) -> char {
    match kind {
        Kind::Match => 'M',
        Kind::Insertion => 'I',
        Kind::Deletion => 'D',
        Kind::Skip => 'N',
        Kind::SoftClip => 'S',
        Kind::HardClip => 'H',
        Kind::Pad => 'P',
        Kind::SequenceMatch => '=',
        Kind::SequenceMismatch => 'X',
    }
}

/// Renders a CIGAR the way SAM text does (`50M`, `5S45M`, ...), for tags like `OA`/`MC` that
/// carry it as a plain string rather than the typed field.
pub fn format_cigar(rec: &RecordBuf) -> String {
    use std::fmt::Write;
    let mut s = String::new();
    for op in rec.cigar().iter() {
        write!(s, "{}{}", op.len(), op_char(op.kind())).ok();
    }
    if s.is_empty() {
        s.push('*');
    }
    s
}

/// 1-based inclusive alignment end on the reference, or `None` if unmapped / empty CIGAR.
pub fn alignment_end(rec: &RecordBuf) -> Option<usize> {
    let start = usize::from(rec.alignment_start()?);
    let span = reference_span(rec);
    if span == 0 {
        None
    } else {
        Some(start + span - 1)
    }
}

/// Rewrites the CIGAR so that read positions `[clip_from, read_length]` (1-based, inclusive)
/// become a single clip op of the requested kind (§4.B).
///
/// `clip_from` outside `[1, read_length]` is a no-op. Hard-clipping stashes the removed bases
/// and qualities into tags `XB`/`XQ` (sequencer order) and fails with `HardClipTagCollision` if
/// either tag is already present.
pub fn clip_3prime_end(rec: &mut RecordBuf, clip_from: usize, kind: ClipKind) -> Result<()> {
    let read_length = rec.sequence().len();
    if clip_from == 0 || clip_from > read_length {
        return Ok(());
    }

    let clipped_len = read_length - clip_from + 1;
    let ops: Vec<Op> = rec.cigar().iter().copied().collect();
    let mut kept = Vec::with_capacity(ops.len() + 1);
    let mut read_pos = 1usize;

    for o in ops {
        if !o.kind().consumes_read() {
            if read_pos < clip_from {
                kept.push(o);
            }
            continue;
        }

        let len = o.len();
        if read_pos + len - 1 < clip_from {
            kept.push(o);
            read_pos += len;
        } else {
            let keep_len = clip_from.saturating_sub(read_pos);
            if keep_len > 0 {
                kept.push(Op::new(o.kind(), keep_len));
            }
            break;
        }
    }

    kept.push(Op::new(kind.op_kind(), clipped_len));

    if kind == ClipKind::Hard {
        stash_and_remove_hard_clip(rec, clip_from - 1..read_length, 0..clip_from - 1)?;
    }

    *rec.cigar_mut() = kept.into_iter().collect();
    Ok(())
}

/// Rewrites the CIGAR so that storage-order (reference-order) read positions `[1, clip_to]`
/// (1-based, inclusive) become a single leading clip op, advancing `alignment_start` by however
/// many reference bases that prefix consumed.
///
/// This is the mirror of [`clip_3prime_end`] needed for the *low*-coordinate side of a
/// negative-strand mate (§4.E overlap clipping): storage order always runs left-to-right on the
/// reference regardless of strand, so removing the low-coordinate portion of a read is a prefix
/// clip, not a suffix one, and — unlike a 3' clip — it moves `alignment_start` forward.
///
/// `clip_to` outside `[1, read_length]` is a no-op. Hard-clipping stashes bases/qualities into
/// tags `XB`/`XQ` in sequencer order and fails with `HardClipTagCollision` if either is already
/// present, exactly as `clip_3prime_end` does.
pub fn clip_5prime_end(rec: &mut RecordBuf, clip_to: usize, kind: ClipKind) -> Result<()> {
    let read_length = rec.sequence().len();
    if clip_to == 0 || clip_to > read_length {
        return Ok(());
    }

    let ops: Vec<Op> = rec.cigar().iter().copied().collect();
    let mut kept = Vec::with_capacity(ops.len() + 1);
    let mut read_pos = 1usize;
    let mut ref_advance = 0usize;
    let mut done = false;

    for o in ops {
        if done {
            kept.push(o);
            continue;
        }

        let len = o.len();
        if !o.kind().consumes_read() {
            if o.kind().consumes_reference() {
                ref_advance += len;
            }
            continue;
        }

        let op_end = read_pos + len - 1;
        if op_end <= clip_to {
            if o.kind().consumes_reference() {
                ref_advance += len;
            }
            read_pos += len;
        } else {
            let clipped_len = clip_to + 1 - read_pos;
            let remainder_len = len - clipped_len;
            if o.kind().consumes_reference() {
                ref_advance += clipped_len;
            }
            if remainder_len > 0 {
                kept.push(Op::new(o.kind(), remainder_len));
            }
            done = true;
            read_pos += len;
        }
    }

    if kind == ClipKind::Hard {
        stash_and_remove_hard_clip(rec, 0..clip_to, clip_to..read_length)?;
    }

    let mut result = Vec::with_capacity(kept.len() + 1);
    result.push(Op::new(kind.op_kind(), clip_to));
    result.extend(kept);
    *rec.cigar_mut() = result.into_iter().collect();

    if ref_advance > 0 {
        if let Some(start) = rec.alignment_start() {
            *rec.alignment_start_mut() = noodles::core::Position::new(usize::from(start) + ref_advance);
        }
    }

    Ok(())
}

/// Stashes `rec`'s bases/qualities at `clipped_range` into tags `XB`/`XQ` (sequencer order) and
/// replaces `rec`'s sequence/qualities with `keep_range`. Shared by the suffix (§4.B) and prefix
/// (§4.E) hard-clip primitives; reverse-complementing a contiguous slice of storage-order bases
/// always yields the corresponding sequencer-order slice, regardless of which end was clipped,
/// since storage order is the full reverse-complement of sequencer order on the negative strand.
fn stash_and_remove_hard_clip(
    rec: &mut RecordBuf,
    clipped_range: std::ops::Range<usize>,
    keep_range: std::ops::Range<usize>,
) -> Result<()> {
    if rec.data().get(&well_known::HARD_CLIPPED_BASES).is_some()
        || rec.data().get(&well_known::HARD_CLIPPED_QUALITIES).is_some()
    {
        return Err(MergeError::HardClipTagCollision {
            name: name_of(rec),
            tag: "XB/XQ",
        });
    }

    let seq: Vec<u8> = rec.sequence().as_ref().to_vec();
    let quals: Vec<u8> = rec.quality_scores().as_ref().to_vec();

    let clipped_bases = seq[clipped_range.clone()].to_vec();
    let clipped_quals = quals[clipped_range].to_vec();

    let reverse = rec.flags().is_reverse();
    let (xb, xq) = if reverse {
        let rc: Vec<u8> = clipped_bases.iter().rev().map(|&b| complement_base(b, true)).collect();
        let rq: Vec<u8> = clipped_quals.iter().rev().copied().collect();
        (rc, rq)
    } else {
        (clipped_bases, clipped_quals)
    };

    let xb_str = String::from_utf8_lossy(&xb).into_owned();
    let xq_str: String = xq.iter().map(|&q| (q.saturating_add(33)) as char).collect();

    rec.data_mut()
        .insert(well_known::HARD_CLIPPED_BASES, noodles::sam::alignment::record::data::field::Value::from(xb_str));
    rec.data_mut()
        .insert(well_known::HARD_CLIPPED_QUALITIES, noodles::sam::alignment::record::data::field::Value::from(xq_str));

    *rec.sequence_mut() = seq[keep_range.clone()].to_vec().into();
    *rec.quality_scores_mut() = quals[keep_range].to_vec().into();

    Ok(())
}

/// 1-based read position aligned to `ref_pos`, treating soft clips as if they consumed
/// reference (§4.B). Returns 0 when `ref_pos` falls outside the read's effective span. When
/// `ref_pos` lies in a deletion, returns the position of the last read base before it.
pub fn read_position_at_ref_ignoring_softclip(rec: &RecordBuf, ref_pos: usize) -> usize {
    let Some(start) = rec.alignment_start() else {
        return 0;
    };
    let mut cur_ref = usize::from(start);
    let mut read_pos = 1usize;

    for op in rec.cigar().iter() {
        let kind = op.kind();
        let len = op.len();
        let consumes_ref = kind.consumes_reference() || kind == Kind::SoftClip;
        let consumes_read = kind.consumes_read();

        if consumes_ref && consumes_read {
            if ref_pos >= cur_ref && ref_pos < cur_ref + len {
                return read_pos + (ref_pos - cur_ref);
            }
            cur_ref += len;
            read_pos += len;
        } else if consumes_ref {
            if ref_pos >= cur_ref && ref_pos < cur_ref + len {
                return read_pos.saturating_sub(1);
            }
            cur_ref += len;
        } else if consumes_read {
            read_pos += len;
        }
    }

    0
}

/// Soft-clips the 3' overhang past the end of the reference, if any (§4.B). If the CIGAR
/// already ends in a soft clip (possibly followed by a trailing hard clip), the overhang is
/// absorbed into it rather than appended as a second soft-clip element.
pub fn soft_clip_overhang_end(rec: &mut RecordBuf, ref_seq_length: usize) -> Result<()> {
    let Some(end) = alignment_end(rec) else {
        return Ok(());
    };
    if end <= ref_seq_length {
        return Ok(());
    }
    let overhang = end - ref_seq_length;
    let read_length = rec.sequence().len();

    let ops: Vec<Op> = rec.cigar().iter().copied().collect();
    let trailing_hard = matches!(ops.last(), Some(o) if o.kind() == Kind::HardClip).then(|| *ops.last().unwrap());
    let existing_soft = ops
        .iter()
        .rev()
        .find(|o| o.kind() != Kind::HardClip)
        .filter(|o| o.kind() == Kind::SoftClip)
        .map(|o| o.len())
        .unwrap_or(0);

    let clip_from = read_length.saturating_sub(overhang + existing_soft) + 1;
    clip_3prime_end(rec, clip_from, ClipKind::Soft)?;

    if let Some(h) = trailing_hard {
        let mut new_ops: Vec<Op> = rec.cigar().iter().copied().collect();
        if new_ops.last().map(|o| o.kind()) != Some(Kind::HardClip) {
            new_ops.push(h);
            *rec.cigar_mut() = new_ops.into_iter().collect();
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use noodles::core::Position;
    use noodles::sam::alignment::record_buf::{
        Cigar as RecordBufCigar, QualityScores as RecordBufQS, Sequence as RecordBufSequence,
    };
    use rstest::rstest;

    fn make_record(cigar_ops: Vec<Op>, seq_len: usize, start: usize) -> RecordBuf {
        let sequence: Vec<u8> = b"A".iter().cycle().take(seq_len).copied().collect();
        let quals: Vec<u8> = vec![30u8; seq_len];

        RecordBuf::builder()
            .set_reference_sequence_id(0)
            .set_alignment_start(Position::new(start).unwrap())
            .set_cigar(RecordBufCigar::from(cigar_ops))
            .set_sequence(RecordBufSequence::from(sequence))
            .set_quality_scores(RecordBufQS::from(quals))
            .build()
    }

    #[rstest]
    #[case(vec![Op::new(Kind::Match, 50)], "50M", 1000, 1049)]
    #[case(vec![Op::new(Kind::SoftClip, 5), Op::new(Kind::Match, 45)], "5S45M", 1000, 1044)]
    #[case(
        vec![Op::new(Kind::Match, 20), Op::new(Kind::Deletion, 5), Op::new(Kind::Match, 25)],
        "20M5D25M",
        1000,
        1049
    )]
    #[case(vec![Op::new(Kind::Match, 10), Op::new(Kind::HardClip, 5)], "10M5H", 1000, 1009)]
    fn test_format_cigar_and_alignment_end(
        #[case] ops: Vec<Op>,
        #[case] expected_text: &str,
        #[case] start: usize,
        #[case] expected_end: usize,
    ) {
        let rec = make_record(ops, 50, start);
        assert_eq!(format_cigar(&rec), expected_text);
        assert_eq!(alignment_end(&rec).unwrap(), expected_end);
    }

    #[test]
    fn test_clip_3prime_end_simple() {
        let mut rec = make_record(vec![Op::new(Kind::Match, 50)], 50, 1000);
        clip_3prime_end(&mut rec, 46, ClipKind::Soft).unwrap();
        let ops: Vec<Op> = rec.cigar().iter().copied().collect();
        assert_eq!(ops, vec![Op::new(Kind::Match, 45), Op::new(Kind::SoftClip, 5)]);
    }

    #[test]
    fn test_clip_3prime_end_with_intervening_deletion_dropped() {
        // 20M 5D 30M, clip starting inside the final M at read position 40 (1-based).
        let mut rec = make_record(
            vec![Op::new(Kind::Match, 20), Op::new(Kind::Deletion, 5), Op::new(Kind::Match, 30)],
            50,
            1000,
        );
        clip_3prime_end(&mut rec, 40, ClipKind::Soft).unwrap();
        let ops: Vec<Op> = rec.cigar().iter().copied().collect();
        assert_eq!(
            ops,
            vec![
                Op::new(Kind::Match, 20),
                Op::new(Kind::Deletion, 5),
                Op::new(Kind::Match, 19),
                Op::new(Kind::SoftClip, 11),
            ]
        );
    }

    #[test]
    fn test_clip_3prime_end_whole_read() {
        let mut rec = make_record(vec![Op::new(Kind::Match, 50)], 50, 1000);
        clip_3prime_end(&mut rec, 1, ClipKind::Soft).unwrap();
        let ops: Vec<Op> = rec.cigar().iter().copied().collect();
        assert_eq!(ops, vec![Op::new(Kind::SoftClip, 50)]);
    }

    #[test]
    fn test_clip_5prime_end_simple() {
        let mut rec = make_record(vec![Op::new(Kind::Match, 50)], 50, 1000);
        clip_5prime_end(&mut rec, 5, ClipKind::Soft).unwrap();
        let ops: Vec<Op> = rec.cigar().iter().copied().collect();
        assert_eq!(ops, vec![Op::new(Kind::SoftClip, 5), Op::new(Kind::Match, 45)]);
        assert_eq!(usize::from(rec.alignment_start().unwrap()), 1005);
    }

    #[test]
    fn test_clip_5prime_end_with_intervening_deletion_advances_start() {
        // 30M 5D 20M, clip the first 40 read positions (all within the leading 30M/20M span).
        let mut rec = make_record(
            vec![Op::new(Kind::Match, 30), Op::new(Kind::Deletion, 5), Op::new(Kind::Match, 20)],
            50,
            1000,
        );
        clip_5prime_end(&mut rec, 40, ClipKind::Soft).unwrap();
        let ops: Vec<Op> = rec.cigar().iter().copied().collect();
        assert_eq!(ops, vec![Op::new(Kind::SoftClip, 40), Op::new(Kind::Match, 10)]);
        // 30 (first M) + 5 (D) + 10 (bases of the second M folded into the clip) = 45.
        assert_eq!(usize::from(rec.alignment_start().unwrap()), 1045);
    }

    #[test]
    fn test_clip_5prime_end_whole_read() {
        let mut rec = make_record(vec![Op::new(Kind::Match, 50)], 50, 1000);
        clip_5prime_end(&mut rec, 50, ClipKind::Soft).unwrap();
        let ops: Vec<Op> = rec.cigar().iter().copied().collect();
        assert_eq!(ops, vec![Op::new(Kind::SoftClip, 50)]);
        assert_eq!(usize::from(rec.alignment_start().unwrap()), 1050);
    }

    #[test]
    fn test_clip_5prime_end_hard_stashes_tags_in_sequencer_order() {
        let mut rec = make_record(vec![Op::new(Kind::Match, 10)], 10, 1000);
        clip_5prime_end(&mut rec, 4, ClipKind::Hard).unwrap();
        assert_eq!(rec.sequence().len(), 6);
        let xb = rec.data().get(&well_known::HARD_CLIPPED_BASES).unwrap();
        assert!(matches!(xb, noodles::sam::alignment::record::data::field::Value::String(_)));
    }

    #[test]
    fn test_clip_5prime_end_hard_collision() {
        let mut rec = make_record(vec![Op::new(Kind::Match, 10)], 10, 1000);
        clip_5prime_end(&mut rec, 4, ClipKind::Hard).unwrap();
        let err = clip_5prime_end(&mut rec, 2, ClipKind::Hard).unwrap_err();
        assert!(matches!(err, MergeError::HardClipTagCollision { .. }));
    }

    #[test]
    fn test_hard_clip_stashes_tags() {
        let mut rec = make_record(vec![Op::new(Kind::Match, 10)], 10, 1000);
        clip_3prime_end(&mut rec, 8, ClipKind::Hard).unwrap();
        assert_eq!(rec.sequence().len(), 7);
        let xb = rec.data().get(&well_known::HARD_CLIPPED_BASES).unwrap();
        assert!(matches!(xb, noodles::sam::alignment::record::data::field::Value::String(_)));
    }

    #[test]
    fn test_hard_clip_collision() {
        let mut rec = make_record(vec![Op::new(Kind::Match, 10)], 10, 1000);
        clip_3prime_end(&mut rec, 8, ClipKind::Hard).unwrap();
        let err = clip_3prime_end(&mut rec, 2, ClipKind::Hard).unwrap_err();
        assert!(matches!(err, MergeError::HardClipTagCollision { .. }));
    }

    #[test]
    fn test_read_position_at_ref_ignoring_softclip() {
        // 5S 10M 3D 10M starting at ref 100: read pos 1..5 clipped, 6..15 match ref 100..109,
        // ref 110..112 deleted, 16..25 match ref 113..122.
        let rec = make_record(
            vec![
                Op::new(Kind::SoftClip, 5),
                Op::new(Kind::Match, 10),
                Op::new(Kind::Deletion, 3),
                Op::new(Kind::Match, 10),
            ],
            25,
            100,
        );
        // Soft clip extends the effective reference span: ref 95..99 map into the clip.
        assert_eq!(read_position_at_ref_ignoring_softclip(&rec, 95), 1);
        assert_eq!(read_position_at_ref_ignoring_softclip(&rec, 100), 6);
        assert_eq!(read_position_at_ref_ignoring_softclip(&rec, 109), 15);
        // Inside the deletion: last read base before it.
        assert_eq!(read_position_at_ref_ignoring_softclip(&rec, 110), 15);
        assert_eq!(read_position_at_ref_ignoring_softclip(&rec, 113), 16);
        assert_eq!(read_position_at_ref_ignoring_softclip(&rec, 10_000), 0);
    }

    #[test]
    fn test_soft_clip_overhang_end_basic() {
        // chr1 length 1000, read 50bp aligning 961..1010 (50M) -> end overhangs by 10.
        let mut rec = make_record(vec![Op::new(Kind::Match, 50)], 50, 961);
        soft_clip_overhang_end(&mut rec, 1000).unwrap();
        let ops: Vec<Op> = rec.cigar().iter().copied().collect();
        assert_eq!(ops, vec![Op::new(Kind::Match, 40), Op::new(Kind::SoftClip, 10)]);
    }

    #[test]
    fn test_soft_clip_overhang_end_absorbs_existing_softclip() {
        // 47M 3S starting at 961 -> alignment end = 961+47-1 = 1007, overhang = 7.
        let mut rec = make_record(
            vec![Op::new(Kind::Match, 47), Op::new(Kind::SoftClip, 3)],
            50,
            961,
        );
        soft_clip_overhang_end(&mut rec, 1000).unwrap();
        let ops: Vec<Op> = rec.cigar().iter().copied().collect();
        assert_eq!(ops, vec![Op::new(Kind::Match, 40), Op::new(Kind::SoftClip, 10)]);
    }

    #[test]
    fn test_soft_clip_overhang_end_noop_within_reference() {
        let mut rec = make_record(vec![Op::new(Kind::Match, 50)], 50, 100);
        soft_clip_overhang_end(&mut rec, 1000).unwrap();
        let ops: Vec<Op> = rec.cigar().iter().copied().collect();
        assert_eq!(ops, vec![Op::new(Kind::Match, 50)]);
    }
}
