//! Read-side journal operations backing the `draft journal` subcommand.

use std::io::Write;

use crate::error::Result;

use super::{diff_journals, Journal};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    Standard,
    Csv,
}

pub fn dump_birthdate(journal: &Journal, format: OutputFormat, out: &mut impl Write) -> Result<()> {
    let nsec = journal.creation_date_nsec()?;

    match format {
        OutputFormat::Standard => writeln!(out, "journal creation date: {nsec}")?,
        OutputFormat::Csv => {
            writeln!(out, "# journal creation date")?;
            writeln!(out, "{nsec}")?;
        }
    }

    Ok(())
}

pub fn dump_file_info(journal: &Journal, format: OutputFormat, out: &mut impl Write) -> Result<()> {
    let info = journal.file_info()?;

    if format == OutputFormat::Csv {
        writeln!(out, "# file_id, mode, uid, gid, size, path")?;
    }

    for item in info {
        match format {
            OutputFormat::Standard => writeln!(
                out,
                "{}: {:o}\t{}\t{}\t{}\t{}",
                item.id,
                item.status.mode,
                item.status.uid,
                item.status.gid,
                item.status.size,
                item.path
            )?,
            OutputFormat::Csv => writeln!(
                out,
                "{}, {}, {}, {}, {}, {}",
                item.id,
                item.status.mode,
                item.status.uid,
                item.status.gid,
                item.status.size,
                item.path
            )?,
        }
    }

    Ok(())
}

pub fn dump_hashes(journal: &Journal, format: OutputFormat, out: &mut impl Write) -> Result<()> {
    for record in journal.records()? {
        let record = record?;

        match format {
            OutputFormat::Standard => writeln!(
                out,
                "{} @ {} for {}: {:#018x}",
                record.file_id, record.offset, record.size, record.hash
            )?,
            OutputFormat::Csv => writeln!(
                out,
                "{}, {}, {}, {}",
                record.file_id, record.offset, record.size, record.hash
            )?,
        }
    }

    Ok(())
}

/// Diff two journals and print each disagreeing range.
///
/// Returns the number of differences, so callers can turn mismatches into an
/// exit status.
pub fn dump_diff(
    journal_a: &Journal,
    journal_b: &Journal,
    format: OutputFormat,
    out: &mut impl Write,
) -> Result<usize> {
    let diffs = diff_journals(journal_a, journal_b)?;

    if format == OutputFormat::Csv {
        writeln!(out, "# file_id, offset, size, hash_a, hash_b")?;
    }

    for d in &diffs {
        match format {
            OutputFormat::Standard => writeln!(
                out,
                "file {} @ {} for {}: {:#018x} != {:#018x}",
                d.file_id, d.offset, d.size, d.hash_a, d.hash_b
            )?,
            OutputFormat::Csv => writeln!(
                out,
                "{}, {}, {}, {}, {}",
                d.file_id, d.offset, d.size, d.hash_a, d.hash_b
            )?,
        }
    }

    Ok(diffs.len())
}
