//! Two-phase external sort of a history file by decay time.
//!
//! Phase I reads the input under a byte budget and emits increasing-time
//! runs by replacement selection: the in-memory set is keyed on decay time,
//! the minimum is extracted repeatedly, and decays arriving earlier than the
//! last emitted key are withheld for the next run. A run closes when no
//! admissible decay remains. Phase II merges up to [`MERGE_FAN_IN`] run
//! files at a time, each behind its own bounded sub-buffer, until one file
//! remains; that file gets the `isTimeSorted` header element and the
//! requested name. Every intermediate file carries the full header, so each
//! is a valid history file on its own.

use crate::clock::ProgressTimer;
use crate::error::{Error, Result};
use crate::history::{
    decay_record_size, photon_record_size, Event, HistoryHeader, HistoryReader, HistoryWriter,
};
use crate::photon::{Decay, DetectedPhoton};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read};
use std::path::{Path, PathBuf};

/// Smallest accepted sort buffer, bytes.
pub const MIN_BUFFER_BYTES: usize = 200_000;

/// Maximum number of run files merged concurrently.
pub const MERGE_FAN_IN: usize = 33;

/// Counters reported after a sort.
#[derive(Clone, Copy, Debug, Default)]
pub struct SortCounters {
    /// Decays read from the input.
    pub num_decays_read: u64,
    /// Decays written to the final output.
    pub num_decays_written: u64,
    /// Phase-I run files produced.
    pub num_runs: u64,
    /// Phase-II merge batches performed.
    pub num_merge_batches: u64,
}

/// A decay and its photon records, kept together through the sort.
#[derive(Clone, Debug)]
struct DecayBundle {
    decay: Decay,
    photons: Vec<DetectedPhoton>,
    /// Input order, to keep the sort stable for equal decay times.
    sequence: u64,
}

impl DecayBundle {
    fn byte_size(&self) -> usize {
        decay_record_size() + self.photons.len() * photon_record_size()
    }
}

impl PartialEq for DecayBundle {
    fn eq(&self, other: &Self) -> bool {
        self.decay.time == other.decay.time && self.sequence == other.sequence
    }
}

impl Eq for DecayBundle {}

impl PartialOrd for DecayBundle {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DecayBundle {
    fn cmp(&self, other: &Self) -> Ordering {
        // reversed: BinaryHeap is a max-heap and we always want the minimum
        other
            .decay
            .time
            .partial_cmp(&self.decay.time)
            .unwrap_or(Ordering::Equal)
            .then(other.sequence.cmp(&self.sequence))
    }
}

/// Streams (decay, photons) bundles off a history reader.
struct BundleStream<R> {
    reader: HistoryReader<R>,
    pending_decay: Option<Decay>,
    next_sequence: u64,
}

impl<R: Read> BundleStream<R> {
    fn new(mut reader: HistoryReader<R>) -> Result<Self> {
        let pending_decay = match reader.read_event()? {
            None => None,
            Some(Event::Decay(decay)) => Some(decay),
            Some(Event::Photon(_)) => {
                return Err(Error::FileFormatMismatch(
                    "expected first event to be a decay, and it wasn't".to_string(),
                ))
            }
        };
        Ok(Self {
            reader,
            pending_decay,
            next_sequence: 0,
        })
    }

    fn header(&self) -> &HistoryHeader {
        self.reader.header()
    }

    fn next_bundle(&mut self) -> Result<Option<DecayBundle>> {
        let Some(decay) = self.pending_decay.take() else {
            return Ok(None);
        };

        let mut photons = Vec::new();
        loop {
            match self.reader.read_event()? {
                None => break,
                Some(Event::Photon(photon)) => photons.push(photon),
                Some(Event::Decay(next)) => {
                    self.pending_decay = Some(next);
                    break;
                }
            }
        }

        let sequence = self.next_sequence;
        self.next_sequence += 1;
        Ok(Some(DecayBundle {
            decay,
            photons,
            sequence,
        }))
    }
}

fn write_bundle(writer: &mut HistoryWriter<BufWriter<File>>, bundle: &DecayBundle) -> Result<()> {
    writer.write_decay(&bundle.decay)?;
    for photon in &bundle.photons {
        writer.write_photon(photon)?;
    }
    Ok(())
}

/// The external time-sort engine.
pub struct TimeSorter {
    buffer_bytes: usize,
    progress: ProgressTimer,
    messages: Vec<String>,
}

impl TimeSorter {
    /// A sorter with a main buffer of `buffer_mbytes` MiB.
    ///
    /// # Errors
    ///
    /// [`Error::ResourceExhausted`] when the buffer is below
    /// [`MIN_BUFFER_BYTES`].
    pub fn new(buffer_mbytes: usize) -> Result<Self> {
        let buffer_bytes = buffer_mbytes.saturating_mul(1_048_576);
        if buffer_bytes < MIN_BUFFER_BYTES {
            return Err(Error::ResourceExhausted(format!(
                "supplied buffer memory size ({buffer_mbytes} MB) is too small"
            )));
        }
        Ok(Self {
            buffer_bytes,
            progress: ProgressTimer::default(),
            messages: Vec::new(),
        })
    }

    /// Progress messages accumulated during the sort, for the caller to
    /// display.
    #[must_use]
    pub fn messages(&self) -> &[String] {
        &self.messages
    }

    /// Sort `input` into `output`. Intermediate files are created next to
    /// the output and removed as they are merged; on error they are left
    /// for postmortem.
    ///
    /// # Errors
    ///
    /// Any I/O failure is fatal, as are malformed input events.
    pub fn sort(&mut self, input: &Path, output: &Path) -> Result<SortCounters> {
        let mut counters = SortCounters::default();

        let reader = HistoryReader::open(BufReader::new(File::open(input)?))?;
        let mut header = reader.header().clone();
        let mut stream = BundleStream::new(reader)?;

        let run_paths = self.phase_one(&mut stream, &header, output, &mut counters)?;
        counters.num_runs = run_paths.len() as u64;
        drop(stream);

        header.is_time_sorted = true;
        let final_path = self.phase_two(run_paths, &header, output, &mut counters)?;

        if final_path != *output {
            let _ = std::fs::remove_file(output);
            std::fs::rename(&final_path, output)?;
        }

        Ok(counters)
    }

    /// Phase I: replacement selection into numbered run files.
    fn phase_one<R: Read>(
        &mut self,
        stream: &mut BundleStream<R>,
        header: &HistoryHeader,
        output: &Path,
        counters: &mut SortCounters,
    ) -> Result<Vec<PathBuf>> {
        let mut current: BinaryHeap<DecayBundle> = BinaryHeap::new();
        let mut withheld: BinaryHeap<DecayBundle> = BinaryHeap::new();
        let mut bytes_used = 0usize;

        // initial fill up to the byte budget
        while bytes_used < self.buffer_bytes {
            match stream.next_bundle()? {
                None => break,
                Some(bundle) => {
                    counters.num_decays_read += 1;
                    bytes_used += bundle.byte_size();
                    current.push(bundle);
                }
            }
        }

        let mut run_paths = Vec::new();
        let mut exhausted = false;

        while !current.is_empty() {
            let run_path = numbered_path(output, run_paths.len() + 1);
            let mut run_writer = HistoryWriter::create(
                BufWriter::new(File::create(&run_path)?),
                header.clone(),
            )?;

            let mut last_emitted = f64::NEG_INFINITY;
            while let Some(bundle) = current.pop() {
                last_emitted = bundle.decay.time;
                bytes_used = bytes_used.saturating_sub(bundle.byte_size());
                write_bundle(&mut run_writer, &bundle)?;
                counters.num_decays_written += 1;

                // replace the emitted decay with fresh input, routing
                // too-early arrivals to the next run
                while !exhausted && bytes_used < self.buffer_bytes {
                    match stream.next_bundle()? {
                        None => {
                            exhausted = true;
                        }
                        Some(bundle) => {
                            counters.num_decays_read += 1;
                            bytes_used += bundle.byte_size();
                            if bundle.decay.time >= last_emitted {
                                current.push(bundle);
                            } else {
                                withheld.push(bundle);
                            }
                            break;
                        }
                    }
                }
            }

            run_writer.into_inner()?.into_inner().map_err(|err| {
                Error::Io(std::io::Error::new(std::io::ErrorKind::Other, err.to_string()))
            })?;
            run_paths.push(run_path);
            self.progress.file_done();
            if self.progress.due() {
                self.messages.push(format!(
                    "created {} sorted subfiles, {} decays read so far",
                    run_paths.len(),
                    counters.num_decays_read
                ));
            }

            std::mem::swap(&mut current, &mut withheld);
        }

        Ok(run_paths)
    }

    /// Phase II: batched k-way merge until a single file remains.
    fn phase_two(
        &mut self,
        mut run_paths: Vec<PathBuf>,
        header: &HistoryHeader,
        output: &Path,
        counters: &mut SortCounters,
    ) -> Result<PathBuf> {
        if run_paths.is_empty() {
            // no events at all: write just the header
            let writer =
                HistoryWriter::create(BufWriter::new(File::create(output)?), header.clone())?;
            writer.into_inner()?;
            return Ok(output.to_path_buf());
        }

        if run_paths.len() == 1 {
            // single run: only the header flag needs fixing
            let path = run_paths.pop().expect("one run");
            let mut file = std::fs::OpenOptions::new().write(true).open(&path)?;
            use std::io::{Seek, SeekFrom, Write};
            file.seek(SeekFrom::Start(0))?;
            file.write_all(&header.to_block()?)?;
            return Ok(path);
        }

        let mut next_file_number = run_paths.len() + 1;

        while run_paths.len() > 1 {
            let batch: Vec<PathBuf> = run_paths
                .drain(..run_paths.len().min(MERGE_FAN_IN))
                .collect();
            let merged_path = numbered_path(output, next_file_number);
            next_file_number += 1;
            counters.num_merge_batches += 1;

            self.merge_batch(&batch, header, &merged_path, counters)?;

            for path in &batch {
                let _ = std::fs::remove_file(path);
            }
            run_paths.push(merged_path);

            self.progress.file_done();
            if self.progress.due() {
                self.messages
                    .push(format!("{} merge files remaining", run_paths.len()));
            }
        }

        Ok(run_paths.pop().expect("one merged file"))
    }

    fn merge_batch(
        &mut self,
        batch: &[PathBuf],
        header: &HistoryHeader,
        merged_path: &Path,
        counters: &mut SortCounters,
    ) -> Result<()> {
        // each input gets an equal share of the buffer
        let sub_buffer = (self.buffer_bytes / batch.len()).max(8_192);

        let mut streams = Vec::with_capacity(batch.len());
        for path in batch {
            let reader = HistoryReader::open(BufReader::with_capacity(
                sub_buffer,
                File::open(path)?,
            ))?;
            streams.push(BundleStream::new(reader)?);
        }

        // min-heap over (head decay time, stream index)
        let mut heap: BinaryHeap<HeapEntry> = BinaryHeap::new();
        for (index, stream) in streams.iter_mut().enumerate() {
            if let Some(bundle) = stream.next_bundle()? {
                heap.push(HeapEntry { bundle, index });
            }
        }

        let mut writer =
            HistoryWriter::create(BufWriter::new(File::create(merged_path)?), header.clone())?;

        let mut written = 0;
        while let Some(entry) = heap.pop() {
            write_bundle(&mut writer, &entry.bundle)?;
            written += 1;
            if let Some(bundle) = streams[entry.index].next_bundle()? {
                heap.push(HeapEntry {
                    bundle,
                    index: entry.index,
                });
            }
        }
        // the last batch is the final file; its count is the written total
        counters.num_decays_written = written;

        writer.into_inner()?.into_inner().map_err(|err| {
            Error::Io(std::io::Error::new(std::io::ErrorKind::Other, err.to_string()))
        })?;
        Ok(())
    }
}

struct HeapEntry {
    bundle: DecayBundle,
    index: usize,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.bundle == other.bundle
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // DecayBundle already orders reversed; ties break on run number so
        // earlier runs (earlier input) come out first
        self.bundle
            .cmp(&other.bundle)
            .then(other.index.cmp(&self.index))
    }
}

fn numbered_path(base: &Path, number: usize) -> PathBuf {
    let mut name = base.as_os_str().to_os_string();
    name.push(format!(".{number}"));
    PathBuf::from(name)
}

/// Scan a history file and report whether its decays are in time order;
/// returns the first out-of-order pair of times otherwise.
///
/// # Errors
///
/// Propagates I/O and format errors.
pub fn verify_sorted(input: &Path) -> Result<std::result::Result<(), (f64, f64)>> {
    let mut reader = HistoryReader::open(BufReader::new(File::open(input)?))?;
    let mut last: Option<f64> = None;

    while let Some(event) = reader.read_event()? {
        if let Event::Decay(decay) = event {
            if let Some(last) = last {
                if decay.time < last {
                    return Ok(Err((last, decay.time)));
                }
            }
            last = Some(decay.time);
        }
    }

    Ok(Ok(()))
}
