use anyhow::{Context, Result};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;
use tomosim::history::{HistoryKind, HistoryReader, HistoryWriter};

pub use crate::{GlobalConfiguration, Subcommand};

/// Open a history file and decode its header.
pub fn open_history(path: &Path) -> Result<HistoryReader<BufReader<File>>> {
    let file =
        File::open(path).with_context(|| format!("unable to open history file '{}'", path.display()))?;
    HistoryReader::open(BufReader::new(file))
        .with_context(|| format!("unable to read history file header '{}'", path.display()))
}

/// Check that a history file was written by the expected stage.
pub fn require_kind(
    reader: &HistoryReader<BufReader<File>>,
    expected: HistoryKind,
    path: &Path,
) -> Result<()> {
    let found = reader.header().kind;
    if found == expected {
        Ok(())
    } else {
        Err(tomosim::Error::FileFormatMismatch(format!(
            "'{}' is a {} history file, but a {} history file was requested",
            path.display(),
            found.name(),
            expected.name()
        ))
        .into())
    }
}

/// Create a history file for writing, carrying `header`.
pub fn create_history(
    path: &Path,
    header: tomosim::history::HistoryHeader,
) -> Result<HistoryWriter<BufWriter<File>>> {
    let file = File::create(path)
        .with_context(|| format!("unable to create output file '{}'", path.display()))?;
    Ok(HistoryWriter::create(BufWriter::new(file), header)?)
}

/// Delete the input file after a successful pass; failure to delete is
/// reported but not fatal.
pub fn remove_input(path: &Path) {
    if let Err(err) = std::fs::remove_file(path) {
        eprintln!("unable to delete history file '{}': {err}", path.display());
    }
}
