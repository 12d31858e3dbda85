//! Output sink (§4.G).
//!
//! One `add`/`close` abstraction backed by either a direct writer (query-name or unsorted
//! output) or an external sorting collection (coordinate output). Grounded on the teacher's
//! `Writer`/`finish` lifecycle (`writer.write_header`, `write_alignment_record`, `finish`).

use noodles::sam::alignment::io::Write as AlignmentWrite;
use noodles::sam::alignment::record_buf::RecordBuf;
use noodles::sam::header::record::value::{map::Program, Map};
use noodles::sam::io::Writer;
use noodles::sam::Header;

use crate::error::{MergeError, Result};
use crate::sort::ExternalSort;

/// Registers program record `id` in `header` (§6), failing if it is already present — a second
/// merge run chained onto output that already carries this id is a configuration mistake, not
/// something to silently clobber.
pub fn register_program_record(header: &mut Header, id: &str) -> Result<()> {
    if header.programs().contains_key(id) {
        return Err(MergeError::ProgramRecordCollision { id: id.to_string() });
    }
    header.programs_mut().insert(id.into(), Map::<Program>::default());
    Ok(())
}

/// `Sorted` routes every record through an [`ExternalSort`] before it ever reaches the writer;
/// `Direct` writes records as they arrive, in whatever order the driver produced them.
pub enum OutputSink<W> {
    Direct { writer: Writer<W>, header: Header },
    Sorted { writer: Writer<W>, header: Header, collection: ExternalSort },
}

impl<W: std::io::Write> OutputSink<W> {
    pub fn direct(inner: W, mut header: Header, program_id: Option<&str>) -> Result<Self> {
        if let Some(id) = program_id {
            register_program_record(&mut header, id)?;
        }
        let mut writer = Writer::new(inner);
        writer.write_header(&header)?;
        Ok(Self::Direct { writer, header })
    }

    pub fn sorted(
        inner: W,
        mut header: Header,
        max_records_in_ram: usize,
        program_id: Option<&str>,
    ) -> Result<Self> {
        if let Some(id) = program_id {
            register_program_record(&mut header, id)?;
        }
        let mut writer = Writer::new(inner);
        writer.write_header(&header)?;
        let collection = ExternalSort::new(header.clone(), max_records_in_ram);
        Ok(Self::Sorted { writer, header, collection })
    }

    pub fn add(&mut self, rec: RecordBuf) -> Result<()> {
        match self {
            Self::Direct { writer, header } => {
                writer.write_alignment_record(header, &rec)?;
                Ok(())
            }
            Self::Sorted { collection, .. } => collection.add(rec),
        }
    }

    /// Flushes the sort collection (if any) in coordinate order and finishes the writer.
    pub fn close(self) -> Result<()> {
        match self {
            Self::Direct { mut writer, header } => {
                writer.finish(&header)?;
                Ok(())
            }
            Self::Sorted { mut writer, header, collection } => {
                for rec in collection.finish()? {
                    writer.write_alignment_record(&header, &rec)?;
                }
                writer.finish(&header)?;
                Ok(())
            }
        }
    }
}
