//! Typed errors for the merge core (§7).

use std::io;

use bstr::BString;

/// Errors produced while merging an unaligned stream with an aligned-hits stream.
///
/// The fatal variants abort the merge outright; `CigarZeroRefBases` and
/// `AlignmentOffReferenceEnd` are recovered locally by the transfer engine (the record is
/// unmapped and a warning is logged) and are only ever surfaced here if a caller wants to
/// inspect the decision after the fact.
#[derive(Debug, thiserror::Error)]
pub enum MergeError {
    #[error("unaligned record {name} is already mapped")]
    UnalignedBamContainsMapped { name: BString },

    #[error("pairing violation for read {name}: {reason}")]
    PairingViolation { name: BString, reason: String },

    #[error("aligned stream is ahead of unaligned stream at read {name}")]
    AlignedAhead { name: BString },

    #[error("unaligned stream exhausted while aligned stream still had records")]
    UnalignedExhaustedEarly,

    #[error("program record id {id} already present in header")]
    ProgramRecordCollision { id: String },

    #[error("aligned stream is out of order at read {name} (previous was {previous})")]
    OutOfOrderAligned { name: BString, previous: BString },

    #[error("hard clip tag collision on read {name}: {tag} already present")]
    HardClipTagCollision { name: BString, tag: &'static str },

    #[error("record {name} has zero reference-consuming CIGAR bases")]
    CigarZeroRefBases { name: BString },

    #[error("record {name} alignment falls entirely past the end of the reference")]
    AlignmentOffReferenceEnd { name: BString },

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, MergeError>;
