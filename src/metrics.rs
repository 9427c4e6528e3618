//! Per-image metrics log.
//!
//! One CSV row is appended for every image written, with host resource usage
//! sampled just before the generation request and the request's wall time.
//! The samples are informational only; nothing in the driver branches on them.
//!
//! ```text
//! item_id,filename,cpu_percent,ram_mb,elapsed_secs
//! Italy/family/a.png,a_upscaled_1.png,12.5,10342.1,41.27
//! ```
//!
//! The header row is written only when the file is new or empty, so the log
//! accumulates across resumed runs.

use serde::Serialize;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use sysinfo::System;
use thiserror::Error;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

#[derive(Error, Debug)]
pub enum MetricsError {
    #[error("IO error on metrics log {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

/// One row of the metrics log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsRecord {
    pub item_id: String,
    pub filename: String,
    pub cpu_percent: f32,
    pub ram_mb: f64,
    pub elapsed_secs: f64,
}

/// Append-only CSV metrics log.
#[derive(Debug, Clone)]
pub struct MetricsLog {
    path: PathBuf,
}

impl MetricsLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one row, writing the header first if the file is new or empty.
    pub fn append(&self, record: &MetricsRecord) -> Result<(), MetricsError> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(|source| self.io_error(source))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|source| self.io_error(source))?;
        let needs_header = file
            .metadata()
            .map_err(|source| self.io_error(source))?
            .len()
            == 0;

        let mut writer = csv::WriterBuilder::new()
            .has_headers(needs_header)
            .from_writer(file);
        writer.serialize(record)?;
        writer.flush().map_err(|source| self.io_error(source))?;
        Ok(())
    }

    fn io_error(&self, source: std::io::Error) -> MetricsError {
        MetricsError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

/// Host resource usage at one point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ResourceSample {
    pub cpu_percent: f32,
    pub ram_mb: f64,
}

/// Source of [`ResourceSample`]s.
pub trait ResourceSampler {
    fn sample(&mut self) -> ResourceSample;
}

impl<T: ResourceSampler + ?Sized> ResourceSampler for Box<T> {
    fn sample(&mut self) -> ResourceSample {
        (**self).sample()
    }
}

/// Samples global CPU usage and used memory via `sysinfo`.
///
/// CPU usage is measured between consecutive refreshes, so the first sample
/// after construction reads as zero.
pub struct SystemSampler {
    sys: System,
}

impl SystemSampler {
    pub fn new() -> Self {
        let mut sys = System::new();
        sys.refresh_cpu_usage();
        sys.refresh_memory();
        Self { sys }
    }
}

impl Default for SystemSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceSampler for SystemSampler {
    fn sample(&mut self) -> ResourceSample {
        self.sys.refresh_cpu_usage();
        self.sys.refresh_memory();
        ResourceSample {
            cpu_percent: self.sys.global_cpu_usage(),
            ram_mb: self.sys.used_memory() as f64 / BYTES_PER_MB,
        }
    }
}

/// Always returns the same sample. Used when sampling is disabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedSampler(pub ResourceSample);

impl ResourceSampler for FixedSampler {
    fn sample(&mut self) -> ResourceSample {
        self.0
    }
}
