//! Typed configuration (§6).

use std::collections::HashSet;

use noodles::sam::alignment::record::data::field::Tag;

/// How a contaminant-flagged alignment's original mapping information is disposed of.
///
/// Each strategy is a small facet table rather than a class hierarchy (§9): whether the
/// original mapping is copied into tag `OA`, whether reference/start/`NM` are cleared, and
/// whether the resulting unmapped record must additionally satisfy the strict "valid unmapped
/// record" invariant (mapping quality and CIGAR cleared too).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnmapStrategy {
    /// Leave the record's mapping information untouched even though it is flagged unmapped.
    DoNotChange,
    /// Same as `DoNotChange`, but the record is allowed to remain in the "invalid unmapped"
    /// shape long-term (reference/start/CIGAR/mapq are never normalized back to the unmapped
    /// defaults, by any component, not just this strategy).
    DoNotChangeInvalid,
    /// Copy the original mapping into tag `OA`, but leave reference/start/`NM` as-is.
    CopyToTag,
    /// Move the original mapping into tag `OA` and clear reference/start/`NM`/mapq/CIGAR so the
    /// record becomes a fully valid unmapped record.
    #[default]
    MoveToTag,
}

impl UnmapStrategy {
    /// Whether this strategy records the original mapping into tag `OA`.
    pub fn populates_oa(self) -> bool {
        matches!(self, Self::CopyToTag | Self::MoveToTag)
    }

    /// Whether this strategy clears reference/start/`NM` on the record.
    pub fn resets_mapping_info(self) -> bool {
        matches!(self, Self::MoveToTag)
    }

    /// Whether this strategy requires a fully valid unmapped record (mapq and CIGAR cleared).
    pub fn requires_valid_unmapped(self) -> bool {
        matches!(self, Self::MoveToTag)
    }
}

/// Output record ordering (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    Coordinate,
    #[default]
    Queryname,
    Unsorted,
}

/// Expected mate orientation, used by the proper-pair determination in §4.E.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PairOrientation {
    /// Both mates point inward (`FR`): the norm for short-insert paired-end sequencing.
    FR,
    /// Both mates point outward (`RF`): mate-pair / jumping libraries.
    RF,
    /// Both mates point the same direction (`TANDEM`).
    Tandem,
}

/// All tunables the merge core accepts (§6).
#[derive(Debug, Clone)]
pub struct Config {
    /// Soft-clip from tag `XT` (adapter start) to the end of the read.
    pub clip_adapters: bool,
    /// Treat C→T (forward strand) / G→A (reverse strand) as non-mismatches in §4.H.
    pub bisulfite: bool,
    /// Only emit records that also appear in the aligned stream; unaligned-only reads that the
    /// aligner never saw are dropped instead of passed through unchanged.
    pub aligned_only: bool,
    /// Tags that are reserved (§4.A) but should still be overridden by the aligner's value.
    pub attributes_retain: HashSet<Tag>,
    /// Tags that should never be copied from the aligner, overriding `attributes_retain`.
    pub attributes_remove: HashSet<Tag>,
    /// Tags reverse-complemented (not just reversed) when a record's strand flips (§4.A).
    pub attributes_reverse_complement: HashSet<Tag>,
    /// Tags reversed (not reverse-complemented) when a record's strand flips (§4.A).
    pub attributes_reverse: HashSet<Tag>,
    /// Bases trimmed from the 5' end of read 1 before alignment, if any.
    pub read1_trim: Option<usize>,
    /// Bases trimmed from the 5' end of read 2 before alignment, if any.
    pub read2_trim: Option<usize>,
    /// Orientations considered "properly paired" by §4.E.
    pub expected_orientations: HashSet<PairOrientation>,
    /// Maximum allowed insert size for a pair to be considered properly paired.
    pub max_insert_size: i32,
    pub sort_order: SortOrder,
    /// Write a mate-CIGAR tag (`MC`) on each record once mate linkage is resolved.
    pub add_mate_cigar: bool,
    /// Run contamination detection/unmapping (§4.D step 9).
    pub unmap_contaminants: bool,
    pub unmap_strategy: UnmapStrategy,
    /// Soft-clip overlapping mate alignments (§4.E).
    pub clip_overlapping: bool,
    /// Additionally hard-clip overlapping mate alignments using unclipped mate bounds.
    pub hard_clip_overlapping: bool,
    /// Include secondary alignments in the output at all.
    pub include_secondary: bool,
    /// Keep the aligner's own proper-pair flag instead of recomputing it (§4.E).
    pub keep_aligner_proper_pair: bool,
    /// Register a `PG` program record in the header and chain it onto every record.
    pub add_program_tag: bool,
    /// Program record id to chain via tag `PG`, when `add_program_tag` is set.
    pub program_id: Option<String>,
    /// Bounded-RAM threshold for the external sort (§4.I).
    pub max_records_in_ram: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            clip_adapters: false,
            bisulfite: false,
            aligned_only: false,
            attributes_retain: HashSet::new(),
            attributes_remove: HashSet::new(),
            attributes_reverse_complement: HashSet::new(),
            attributes_reverse: HashSet::new(),
            read1_trim: None,
            read2_trim: None,
            expected_orientations: [PairOrientation::FR].into_iter().collect(),
            max_insert_size: 1_000,
            sort_order: SortOrder::default(),
            add_mate_cigar: false,
            unmap_contaminants: false,
            unmap_strategy: UnmapStrategy::default(),
            clip_overlapping: false,
            hard_clip_overlapping: false,
            include_secondary: true,
            keep_aligner_proper_pair: false,
            add_program_tag: false,
            program_id: None,
            max_records_in_ram: 500_000,
        }
    }
}
