use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufRead, BufReader, Lines};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use super::{IngestError, RawRecord, ReadingSource};
use crate::gesture::StreamId;

/// Recorded session played back as one stream, for rehearsal without a broker
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReplaySourceConfig {
    pub name: String,
    pub stream: StreamId,
    pub path: PathBuf,
    /// Delay between records; 0 replays as fast as the adapter pulls
    #[serde(default)]
    pub interval_ms: u64,
}

/// Reads one reading per line. Blank lines and lines starting with `#` are
/// skipped.
#[derive(Debug)]
pub struct ReplaySource {
    name: String,
    stream: StreamId,
    lines: Lines<BufReader<File>>,
    interval: Duration,
    next_due: Instant,
    line_number: usize,
}

impl ReplaySource {
    pub fn open(config: &ReplaySourceConfig) -> Result<Self, IngestError> {
        let file = File::open(&config.path).map_err(|e| IngestError::TransportUnavailable {
            source_name: config.name.clone(),
            reason: format!("cannot open {}: {}", config.path.display(), e),
        })?;
        info!(
            "Replaying {} as stream {}",
            config.path.display(),
            config.stream
        );

        Ok(Self {
            name: config.name.clone(),
            stream: config.stream.clone(),
            lines: BufReader::new(file).lines(),
            interval: Duration::from_millis(config.interval_ms),
            next_due: Instant::now(),
            line_number: 0,
        })
    }
}

impl ReadingSource for ReplaySource {
    fn name(&self) -> &str {
        &self.name
    }

    fn streams(&self) -> Vec<StreamId> {
        vec![self.stream.clone()]
    }

    fn next_record(&mut self, timeout: Duration) -> Result<Option<RawRecord>, IngestError> {
        let wait = self.next_due.saturating_duration_since(Instant::now());
        if !wait.is_zero() {
            std::thread::sleep(wait.min(timeout));
            if Instant::now() < self.next_due {
                return Ok(None);
            }
        }

        loop {
            let Some(line) = self.lines.next() else {
                info!("Replay {} finished after {} lines", self.name, self.line_number);
                return Err(IngestError::Exhausted);
            };
            self.line_number += 1;
            let line = line.map_err(|e| IngestError::Transport(e.to_string()))?;
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                debug!("Replay {}: skipping line {}", self.name, self.line_number);
                continue;
            }

            self.next_due = Instant::now() + self.interval;
            return Ok(Some(RawRecord::new(self.stream.clone(), trimmed)));
        }
    }

    fn acknowledge(&mut self, _record: RawRecord) -> Result<(), IngestError> {
        Ok(())
    }

    fn close(&mut self) {
        debug!("Closing replay {}", self.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn config_for(file: &tempfile::NamedTempFile, interval_ms: u64) -> ReplaySourceConfig {
        ReplaySourceConfig {
            name: "rehearsal".into(),
            stream: StreamId::from("controller-3"),
            path: file.path().to_path_buf(),
            interval_ms,
        }
    }

    #[test]
    fn yields_records_then_exhausts() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# recorded session").unwrap();
        writeln!(file, "8 0 0").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "  -8 0 0  ").unwrap();

        let mut source = ReplaySource::open(&config_for(&file, 0)).unwrap();
        let timeout = Duration::from_millis(10);

        let first = source.next_record(timeout).unwrap().unwrap();
        assert_eq!(first.payload, "8 0 0");
        assert_eq!(first.stream, StreamId::from("controller-3"));
        let second = source.next_record(timeout).unwrap().unwrap();
        assert_eq!(second.payload, "-8 0 0");
        assert!(matches!(source.next_record(timeout), Err(IngestError::Exhausted)));
    }

    #[test]
    fn interval_paces_records() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "1 0 0").unwrap();
        writeln!(file, "2 0 0").unwrap();

        let mut source = ReplaySource::open(&config_for(&file, 500)).unwrap();
        assert!(source.next_record(Duration::from_millis(10)).unwrap().is_some());
        // Second record is not due yet, the short poll comes back empty
        assert!(source.next_record(Duration::from_millis(10)).unwrap().is_none());
    }

    #[test]
    fn missing_file_is_transport_unavailable() {
        let config = ReplaySourceConfig {
            name: "missing".into(),
            stream: StreamId::from("controller-3"),
            path: PathBuf::from("/definitely/not/here.txt"),
            interval_ms: 0,
        };
        assert!(matches!(
            ReplaySource::open(&config),
            Err(IngestError::TransportUnavailable { .. })
        ));
    }
}
