//! Host metric sources.

pub mod procfs;

use std::io;

use thiserror::Error;

use crate::sample::RawMetricsSample;

pub use procfs::ProcSource;

/// The metric source could not produce a sample this tick.
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("parsing {path}: {detail}")]
    Parse { path: String, detail: String },

    #[error("metric source unavailable: {0}")]
    Unavailable(String),
}

impl SourceError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Io { .. } => "io",
            Self::Parse { .. } => "parse",
            Self::Unavailable(_) => "unavailable",
        }
    }
}

/// Produces one raw reading per collection tick.
pub trait SampleSource: Send {
    fn name(&self) -> &str;

    fn sample(&mut self) -> Result<RawMetricsSample, SourceError>;
}

/// Replays a fixed list of samples in a loop.
///
/// `fail_next(n)` makes the next `n` calls fail, for exercising the error
/// path.
pub struct StaticSource {
    samples: Vec<RawMetricsSample>,
    pos: usize,
    failures: u32,
}

impl StaticSource {
    pub fn new(sample: RawMetricsSample) -> Self {
        Self::sequence(vec![sample])
    }

    /// An empty sequence yields all-zero samples.
    pub fn sequence(samples: Vec<RawMetricsSample>) -> Self {
        Self {
            samples,
            pos: 0,
            failures: 0,
        }
    }

    pub fn fail_next(&mut self, n: u32) {
        self.failures = n;
    }
}

impl SampleSource for StaticSource {
    fn name(&self) -> &str {
        "static"
    }

    fn sample(&mut self) -> Result<RawMetricsSample, SourceError> {
        if self.failures > 0 {
            self.failures -= 1;
            return Err(SourceError::Unavailable("scripted failure".to_string()));
        }
        if self.samples.is_empty() {
            return Ok(RawMetricsSample::default());
        }
        let sample = self.samples[self.pos % self.samples.len()];
        self.pos = self.pos.wrapping_add(1);
        Ok(sample)
    }
}
