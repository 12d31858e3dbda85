//! NM/MD/UQ recomputation (§4.H).
//!
//! Grounded on `noodles-cram`'s `compute_md_nm` feature walk (same match-run accounting, `^`
//! prefix for deletions, `N`-for-missing-reference fallback), adapted from a CRAM feature list
//! to a plain CIGAR walk over a `RecordBuf`.

use std::fmt::Write as _;

use noodles::sam::alignment::record::cigar::op::Kind;
use noodles::sam::alignment::record::data::field::Value;
use noodles::sam::alignment::record_buf::RecordBuf;

use crate::config::Config;
use crate::error::Result;
use crate::tags::well_known;

/// BAM's encoding of a missing quality string: every base quality set to this sentinel.
const NO_QUALITIES_SENTINEL: u8 = 0xff;

pub struct MdNm {
    pub md: String,
    pub nm: u32,
    pub uq: u32,
}

fn is_bisulfite_non_mismatch(ref_base: u8, read_base: u8, reverse: bool) -> bool {
    let r = ref_base.to_ascii_uppercase();
    let q = read_base.to_ascii_uppercase();
    if reverse {
        r == b'G' && q == b'A'
    } else {
        r == b'C' && q == b'T'
    }
}

/// Walks `rec`'s CIGAR against `reference_bases` (indexed from the record's own alignment
/// start) to produce the MD string, NM edit distance, and UQ mismatch-quality sum.
///
/// `reference_bases` must cover at least `[alignment_start, alignment_end]`; positions beyond
/// its end are treated as `N` (never equal, so always a mismatch) rather than panicking, mirroring
/// the CRAM walker's fallback.
pub fn compute_md_nm_uq(rec: &RecordBuf, reference_bases: &[u8], bisulfite: bool) -> MdNm {
    let start = usize::from(rec.alignment_start().expect("mapped record has an alignment start"));
    let read: Vec<u8> = rec.sequence().as_ref().to_vec();
    let quals: Vec<u8> = rec.quality_scores().as_ref().to_vec();
    let reverse = rec.flags().is_reverse();

    let mut md = String::new();
    let mut nm: u32 = 0;
    let mut uq: u32 = 0;
    let mut match_count: usize = 0;
    let mut read_pos = 0usize;
    let mut ref_pos = start - 1;

    for op in rec.cigar().iter() {
        let kind = op.kind();
        let len = op.len();

        match kind {
            Kind::Match | Kind::SequenceMatch | Kind::SequenceMismatch => {
                for i in 0..len {
                    let read_base = read[read_pos + i];
                    let ref_base = reference_bases.get(ref_pos + i).copied().unwrap_or(b'N');

                    if read_base.eq_ignore_ascii_case(&ref_base) {
                        match_count += 1;
                    } else if bisulfite && is_bisulfite_non_mismatch(ref_base, read_base, reverse) {
                        match_count += 1;
                    } else {
                        write!(md, "{match_count}").unwrap();
                        match_count = 0;
                        md.push(ref_base.to_ascii_uppercase() as char);
                        nm += 1;
                        uq += quals.get(read_pos + i).copied().unwrap_or(0) as u32;
                    }
                }
                read_pos += len;
                ref_pos += len;
            }
            Kind::Insertion => {
                nm += len as u32;
                read_pos += len;
            }
            Kind::Deletion => {
                write!(md, "{match_count}").unwrap();
                match_count = 0;
                md.push('^');
                for i in 0..len {
                    let ref_base = reference_bases.get(ref_pos + i).copied().unwrap_or(b'N');
                    md.push(ref_base.to_ascii_uppercase() as char);
                }
                nm += len as u32;
                ref_pos += len;
            }
            Kind::Skip => {
                ref_pos += len;
            }
            Kind::SoftClip => {
                read_pos += len;
            }
            Kind::HardClip | Kind::Pad => {}
        }
    }

    write!(md, "{match_count}").unwrap();
    MdNm { md, nm, uq }
}

/// True when a record's qualities are the BAM "no qualities" sentinel, or simply absent.
pub fn has_no_qualities(rec: &RecordBuf) -> bool {
    let quals = rec.quality_scores().as_ref();
    quals.is_empty() || quals.iter().all(|&q| q == NO_QUALITIES_SENTINEL)
}

/// Recomputes and writes tags `NM`/`MD`/`UQ` on `rec`, skipping unmapped records and records
/// whose qualities are the "no qualities" sentinel (§4.H).
pub fn recompute_tags(rec: &mut RecordBuf, reference_bases: &[u8], config: &Config) -> Result<()> {
    if rec.flags().is_unmapped() || has_no_qualities(rec) {
        return Ok(());
    }

    let result = compute_md_nm_uq(rec, reference_bases, config.bisulfite);
    rec.data_mut().insert(well_known::EDIT_DISTANCE, Value::from(result.nm as i32));
    rec.data_mut().insert(well_known::MISMATCHED_POSITIONS, Value::from(result.md));
    rec.data_mut().insert(well_known::MISMATCH_QUALITY_SUM, Value::from(result.uq as i32));
    Ok(())
}
