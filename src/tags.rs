//! Record model & tag policy (§4.A).
//!
//! Classifies tags as "reserved" (carried verbatim from the unaligned template unless the
//! caller explicitly asks to retain the aligner's value) and provides the single fan-out clone
//! point plus strand-aware tag reversal used by the transfer engine (§4.D) and pair fixer (§4.E).

use std::collections::HashSet;

use noodles::sam::alignment::{
    record::data::field::{Tag, Value},
    record_buf::RecordBuf,
};

/// Well-known tags this crate writes or reads by name, constructed the same way a caller would
/// construct any non-builtin two-letter tag.
pub mod well_known {
    use noodles::sam::alignment::record::data::field::Tag;

    /// Adapter clip start, 1-based (read by the transfer engine, §4.D step 7).
    pub const ADAPTER_CLIP_START: Tag = Tag::new(b'X', b'T');
    /// Stashed hard-clipped bases, sequencer order (§4.B).
    pub const HARD_CLIPPED_BASES: Tag = Tag::new(b'X', b'B');
    /// Stashed hard-clipped qualities, sequencer order (§4.B).
    pub const HARD_CLIPPED_QUALITIES: Tag = Tag::new(b'X', b'Q');
    /// Original alignment, recorded when a record is unmapped for contamination (§4.D step 9).
    pub const ORIGINAL_ALIGNMENT: Tag = Tag::new(b'O', b'A');
    /// Free-text comment, `" | "`-separated when appended to (§4.D step 9, §6).
    pub const COMMENT: Tag = Tag::new(b'C', b'O');
    /// Mate CIGAR (§4.E mate linkage).
    pub const MATE_CIGAR: Tag = Tag::new(b'M', b'C');
    /// Program record chain id (§6).
    pub const PROGRAM: Tag = Tag::new(b'P', b'G');
    /// Mismatch quality sum (§4.H).
    pub const MISMATCH_QUALITY_SUM: Tag = Tag::new(b'U', b'Q');
    /// Edit distance (§4.H). Noodles exposes this as a builtin constant; re-exported here so
    /// every tag this crate touches is reachable from one place.
    pub const EDIT_DISTANCE: Tag = Tag::EDIT_DISTANCE;
    /// Mismatched positions string (§4.H).
    pub const MISMATCHED_POSITIONS: Tag = Tag::MISMATCHED_POSITIONS;
}

/// A tag is reserved iff its first byte is ASCII lowercase or one of `X`/`Y`/`Z` (§3, §4.A).
pub fn is_reserved_tag(tag: Tag) -> bool {
    let first = tag.as_ref()[0];
    first.is_ascii_lowercase() || matches!(first, b'X' | b'Y' | b'Z')
}

/// The single fan-out clone point (§3 "Lifecycles"): produces an independent owner of the same
/// data, used whenever a read needs more than one downstream record (multiple hits,
/// supplementary alignments).
pub fn clone_record(rec: &RecordBuf) -> RecordBuf {
    rec.clone()
}

/// Copies non-reserved tags from `aligned` onto `template`, per the rule in §4.A:
/// a tag `T` is copied iff `(!is_reserved(T) || retain.contains(T)) && !remove.contains(T)`.
///
/// `remove` wins over `retain`. Tags present in both sets are dropped from the retain set here
/// (construction-time dedup belongs to the caller building the `Config`; this function just
/// enforces the precedence rule on every copy).
pub fn copy_nonreserved_tags(
    template: &mut RecordBuf,
    aligned: &RecordBuf,
    retain: &HashSet<Tag>,
    remove: &HashSet<Tag>,
) {
    for (tag, value) in aligned.data().iter() {
        let tag = *tag;

        if remove.contains(&tag) {
            if retain.contains(&tag) {
                log::info!("tag {:?} is in both retain and remove; remove wins", tag.as_ref());
            }
            continue;
        }

        if is_reserved_tag(tag) && !retain.contains(&tag) {
            continue;
        }

        template.data_mut().insert(tag, value.clone());
    }
}

/// Reverse-complements a record's sequence in place (qualities are reversed, not complemented).
/// IUPAC ambiguity codes are complemented per the standard table; `N` maps to `N`.
///
/// `rc_tags` are byte-array tags that represent strand-oriented sequence and are
/// reverse-complemented along with the read; `rev_tags` are reversed only (e.g. per-base
/// annotation arrays that aren't themselves sequence). When `fast` is true, the IUPAC safety
/// check (that every base has a known complement) is skipped, matching §4.D step 4's "caller
/// guarantees safety" fast path.
pub fn reverse_complement_in_place(
    rec: &mut RecordBuf,
    rc_tags: &HashSet<Tag>,
    rev_tags: &HashSet<Tag>,
    fast: bool,
) {
    let bases: Vec<u8> = rec.sequence().as_ref().to_vec();
    let rc_bases: Vec<u8> = bases
        .iter()
        .rev()
        .map(|&b| complement_base(b, fast))
        .collect();
    *rec.sequence_mut() = rc_bases.into();

    let quals: Vec<u8> = rec.quality_scores().as_ref().to_vec();
    let rev_quals: Vec<u8> = quals.into_iter().rev().collect();
    *rec.quality_scores_mut() = rev_quals.into();

    let tags_to_rc: Vec<Tag> = rec
        .data()
        .iter()
        .map(|(tag, _)| *tag)
        .filter(|tag| rc_tags.contains(tag))
        .collect();
    for tag in tags_to_rc {
        if let Some(value) = rec.data().get(&tag).cloned() {
            if let Some(new_value) = reverse_complement_value(&value, fast) {
                rec.data_mut().insert(tag, new_value);
            }
        }
    }

    let tags_to_rev: Vec<Tag> = rec
        .data()
        .iter()
        .map(|(tag, _)| *tag)
        .filter(|tag| rev_tags.contains(tag))
        .collect();
    for tag in tags_to_rev {
        if let Some(value) = rec.data().get(&tag).cloned() {
            if let Some(new_value) = reverse_value(&value) {
                rec.data_mut().insert(tag, new_value);
            }
        }
    }
}

pub(crate) fn complement_base(base: u8, fast: bool) -> u8 {
    match base.to_ascii_uppercase() {
        b'A' => b'T',
        b'C' => b'G',
        b'G' => b'C',
        b'T' => b'A',
        b'U' => b'A',
        b'N' => b'N',
        b'M' => b'K',
        b'R' => b'Y',
        b'W' => b'W',
        b'S' => b'S',
        b'Y' => b'R',
        b'K' => b'M',
        b'V' => b'B',
        b'H' => b'D',
        b'D' => b'H',
        b'B' => b'V',
        other => {
            if fast {
                other
            } else {
                log::warn!("non-IUPAC base {:?} encountered during reverse complement", other as char);
                other
            }
        }
    }
}

fn reverse_complement_value(value: &Value, fast: bool) -> Option<Value> {
    match value {
        Value::String(s) => {
            let rc: Vec<u8> = s.as_ref().iter().rev().map(|&b| complement_base(b, fast)).collect();
            Some(Value::from(String::from_utf8_lossy(&rc).into_owned()))
        }
        _ => None,
    }
}

fn reverse_value(value: &Value) -> Option<Value> {
    match value {
        Value::String(s) => {
            let rev: Vec<u8> = s.as_ref().iter().rev().copied().collect();
            Some(Value::from(String::from_utf8_lossy(&rev).into_owned()))
        }
        _ => None,
    }
}
