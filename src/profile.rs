//! # Per-Chunk Profiling
//!
//! When profiling is enabled the engine records one timing row per
//! completed chunk and writes them to `time_write.csv` or
//! `time_read.csv` in the working directory after the batch. Profiling
//! output is best-effort: a failed write is logged, never an error.

use std::fs::File;
use std::io::{self, Write as IoWrite};
use std::path::Path;

use log::warn;

/// Timing record for one completed chunk
#[derive(Debug, Clone, Copy)]
pub struct ChunkTiming {
    /// Batch item the chunk came from
    pub item_index: usize,
    /// Staging buffer that carried the chunk
    pub buffer_index: usize,
    /// Microseconds spent in the accelerator copy
    pub copy_micros: u64,
    /// Microseconds between NVMe submission and completion
    pub storage_micros: u64,
}

/// Accumulated timings for one batch
#[derive(Debug, Default)]
pub struct BatchProfile {
    records: Vec<ChunkTiming>,
}

impl BatchProfile {
    /// Empty profile
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one chunk record
    pub fn record(&mut self, timing: ChunkTiming) {
        self.records.push(timing);
    }

    /// Recorded rows in completion order
    pub fn records(&self) -> &[ChunkTiming] {
        &self.records
    }

    /// Write the rows as CSV to `path`
    pub fn write_csv(&self, path: &Path) -> io::Result<()> {
        let mut file = File::create(path)?;
        writeln!(file, "item,buffer,copy_us,storage_us")?;
        for row in &self.records {
            writeln!(
                file,
                "{},{},{},{}",
                row.item_index, row.buffer_index, row.copy_micros, row.storage_micros
            )?;
        }
        Ok(())
    }

    /// Write the CSV into the working directory under the conventional
    /// name for `file_name`, logging instead of failing on I/O errors
    pub fn emit(&self, file_name: &str) {
        if let Err(err) = self.write_csv(Path::new(file_name)) {
            warn!("profiling: could not write {}: {}", file_name, err);
        }
    }
}
