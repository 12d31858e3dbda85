//! Bounded-RAM external sort (§4.I).
//!
//! Accumulates records in memory up to `max_records_in_ram`, spills a sorted batch to a
//! `tempfile`-backed SAM file when the threshold is hit, and k-way merges the spills (plus any
//! remaining in-memory tail) on `finish`. Spill I/O reuses the teacher's own
//! `noodles::sam::io::{Reader, Writer}` pair rather than inventing a binary format.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::io::{BufReader, BufWriter};

use noodles::sam::alignment::io::Write as AlignmentWrite;
use noodles::sam::alignment::record_buf::RecordBuf;
use noodles::sam::io::{Reader, Writer};
use noodles::sam::Header;
use tempfile::NamedTempFile;

use crate::error::Result;

type CoordinateKey = (bool, usize, usize, u16);

fn coordinate_key(rec: &RecordBuf) -> CoordinateKey {
    let unmapped = rec.flags().is_unmapped();
    let ref_id = rec.reference_sequence_id().unwrap_or(usize::MAX);
    let start = rec.alignment_start().map(usize::from).unwrap_or(usize::MAX);
    let flag_bits: u16 = rec.flags().bits();
    (unmapped, ref_id, start, flag_bits)
}

/// Reference-index ascending, unmapped last, ties by start then flag bits (§4.I).
pub fn compare_coordinate(a: &RecordBuf, b: &RecordBuf) -> Ordering {
    coordinate_key(a).cmp(&coordinate_key(b))
}

/// Accumulates records and spills sorted batches once `max_records_in_ram` is reached.
pub struct ExternalSort {
    header: Header,
    max_in_ram: usize,
    buffer: Vec<RecordBuf>,
    spills: Vec<NamedTempFile>,
}

impl ExternalSort {
    pub fn new(header: Header, max_records_in_ram: usize) -> Self {
        Self {
            header,
            max_in_ram: max_records_in_ram.max(1),
            buffer: Vec::new(),
            spills: Vec::new(),
        }
    }

    pub fn add(&mut self, rec: RecordBuf) -> Result<()> {
        self.buffer.push(rec);
        if self.buffer.len() >= self.max_in_ram {
            self.spill()?;
        }
        Ok(())
    }

    fn spill(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        self.buffer.sort_by(compare_coordinate);

        let file = NamedTempFile::new()?;
        {
            let mut writer = Writer::new(BufWriter::new(file.reopen()?));
            writer.write_header(&self.header)?;
            for rec in &self.buffer {
                writer.write_alignment_record(&self.header, rec)?;
            }
            writer.finish(&self.header)?;
        }

        self.spills.push(file);
        self.buffer.clear();
        Ok(())
    }

    /// Consumes the accumulator and returns every record in coordinate order, merging all
    /// spills (if any) with the in-memory tail. Temp files are removed once this value (and
    /// the iterators it handed out) are dropped.
    pub fn finish(mut self) -> Result<Vec<RecordBuf>> {
        if self.spills.is_empty() {
            self.buffer.sort_by(compare_coordinate);
            return Ok(self.buffer);
        }

        self.spill()?;

        let mut sources: Vec<Box<dyn Iterator<Item = Result<RecordBuf>>>> = Vec::new();
        for file in &self.spills {
            let mut reader = Reader::new(BufReader::new(file.reopen()?));
            let spill_header = reader.read_header()?;
            let iter = reader_into_records(reader, spill_header);
            sources.push(Box::new(iter));
        }

        k_way_merge(sources)
    }
}

fn reader_into_records<R: std::io::BufRead + 'static>(
    mut reader: Reader<R>,
    header: Header,
) -> impl Iterator<Item = Result<RecordBuf>> {
    let mut records = reader.records(&header).collect::<Vec<_>>().into_iter();
    std::iter::from_fn(move || {
        let record = records.next()?;
        Some(
            record
                .map_err(Into::into)
                .and_then(|r| RecordBuf::try_from_alignment_record(&header, &r).map_err(Into::into)),
        )
    })
}

fn k_way_merge(mut sources: Vec<Box<dyn Iterator<Item = Result<RecordBuf>>>>) -> Result<Vec<RecordBuf>> {
    struct Entry {
        key: CoordinateKey,
        record: RecordBuf,
        source: usize,
    }
    impl PartialEq for Entry {
        fn eq(&self, other: &Self) -> bool {
            self.key == other.key
        }
    }
    impl Eq for Entry {}
    impl PartialOrd for Entry {
        fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
            Some(self.cmp(other))
        }
    }
    impl Ord for Entry {
        fn cmp(&self, other: &Self) -> Ordering {
            self.key.cmp(&other.key)
        }
    }

    let mut heap: BinaryHeap<Reverse<Entry>> = BinaryHeap::new();
    for (i, source) in sources.iter_mut().enumerate() {
        if let Some(rec) = source.next() {
            let rec = rec?;
            heap.push(Reverse(Entry { key: coordinate_key(&rec), record: rec, source: i }));
        }
    }

    let mut out = Vec::new();
    while let Some(Reverse(entry)) = heap.pop() {
        out.push(entry.record);
        if let Some(rec) = sources[entry.source].next() {
            let rec = rec?;
            heap.push(Reverse(Entry { key: coordinate_key(&rec), record: rec, source: entry.source }));
        }
    }

    Ok(out)
}
