use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// One direction of a transaction, hex-encoded for the log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferRecord {
    pub command: String,
    pub payload: String,
}

/// One benchmarked transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchmarkRecord {
    pub input: TransferRecord,
    pub output: TransferRecord,
    pub last_algo: i64,
    pub time: f64,
}

/// Per-transaction benchmark sink: a JSON array on disk, rewritten in full
/// on every append. Volume is a handful of records per session, so the
/// rewrite is cheaper than it looks.
pub struct BenchmarkLog {
    path: PathBuf,
    records: Vec<BenchmarkRecord>,
}

impl BenchmarkLog {
    /// Create a log under `dir`, named with a wall-clock suffix so each
    /// session gets its own file.
    pub fn create(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create benchmark directory {}", dir.display()))?;
        let stamp = chrono::Local::now().format("%Y-%m-%d-%H-%M-%S");
        let path = dir.join(format!("benchmark-{}.json", stamp));
        log::info!("benchmarking to {}", path.display());
        Ok(Self {
            path,
            records: Vec::new(),
        })
    }

    /// Append one record and rewrite the file.
    pub fn append(
        &mut self,
        input_cmd: u8,
        input_payload: &[u8],
        output_cmd: u8,
        output_payload: &[u8],
        last_algo: i64,
        elapsed: Duration,
    ) -> Result<()> {
        // Seconds rounded to microsecond precision.
        let time = (elapsed.as_secs_f64() * 1e6).round() / 1e6;
        self.records.push(BenchmarkRecord {
            input: TransferRecord {
                command: hex::encode([input_cmd]),
                payload: hex::encode(input_payload),
            },
            output: TransferRecord {
                command: hex::encode([output_cmd]),
                payload: hex::encode(output_payload),
            },
            last_algo,
            time,
        });

        let json = serde_json::to_string_pretty(&self.records)
            .context("failed to serialize benchmark records")?;
        fs::write(&self.path, json)
            .with_context(|| format!("failed to write {}", self.path.display()))?;
        log::debug!("benchmark record #{} written", self.records.len());
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_rewrites_full_array() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = BenchmarkLog::create(dir.path()).unwrap();

        log.append(0x10, &[0x04], 0x10, &[0x00, 0xA0], -7, Duration::from_micros(1500))
            .unwrap();
        log.append(0x01, b"ab", 0x01, b"ab", -49, Duration::from_millis(2))
            .unwrap();

        let raw = fs::read_to_string(log.path()).unwrap();
        let records: Vec<BenchmarkRecord> = serde_json::from_str(&raw).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].input.command, "10");
        assert_eq!(records[0].input.payload, "04");
        assert_eq!(records[0].output.payload, "00a0");
        assert_eq!(records[0].last_algo, -7);
        assert!((records[0].time - 0.0015).abs() < 1e-9);
        assert_eq!(records[1].input.payload, hex::encode(b"ab"));
        assert_eq!(records[1].last_algo, -49);
    }

    #[test]
    fn file_name_carries_timestamp_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let log = BenchmarkLog::create(dir.path()).unwrap();
        let name = log.path().file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("benchmark-"));
        assert!(name.ends_with(".json"));
        // benchmark-YYYY-MM-DD-HH-MM-SS.json
        assert_eq!(name.len(), "benchmark-0000-00-00-00-00-00.json".len());
    }
}
