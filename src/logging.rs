/* ------------------------------------------------------------------ */
/* Tracing setup and the per-epoch JSON log                           */
/* ------------------------------------------------------------------ */

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing_subscriber::{fmt, EnvFilter};

use crate::error::Result;

pub const EPOCH_LOG: &str = "epochs.jsonl";

/// Install the global subscriber. `RUST_LOG` wins; otherwise `info`,
/// or `warn` when progress output is suppressed.
pub fn init(quiet: bool) {
    let default = if quiet { "warn" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    // Already installed (tests, repeated init) is not an error.
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Append-only JSON-lines file, one record per epoch.
pub struct EpochLog {
    path: PathBuf,
}

impl EpochLog {
    /// Clear `dir` and start an empty log inside it.
    pub fn create(dir: &Path) -> Result<Self> {
        if dir.exists() {
            fs::remove_dir_all(dir)?;
        }
        fs::create_dir_all(dir)?;
        let path = dir.join(EPOCH_LOG);
        File::create(&path)?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append<T: Serialize>(&self, record: &T) -> Result<()> {
        let mut f = OpenOptions::new().append(true).open(&self.path)?;
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        f.write_all(&line)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_clears_previous_runs() {
        let dir = tempfile::tempdir().unwrap();
        let logs = dir.path().join("logs");
        fs::create_dir_all(&logs).unwrap();
        fs::write(logs.join("stale.txt"), "old").unwrap();

        let log = EpochLog::create(&logs).unwrap();
        assert!(!logs.join("stale.txt").exists());
        assert_eq!(fs::read_to_string(log.path()).unwrap(), "");
    }

    #[test]
    fn records_are_appended_one_per_line() {
        let dir = tempfile::tempdir().unwrap();
        let log = EpochLog::create(dir.path()).unwrap();
        log.append(&serde_json::json!({"epoch": 1, "loss": 0.5})).unwrap();
        log.append(&serde_json::json!({"epoch": 2, "loss": 0.25})).unwrap();

        let text = fs::read_to_string(log.path()).unwrap();
        let epochs: Vec<u64> = text
            .lines()
            .map(|l| {
                let record: serde_json::Value = serde_json::from_str(l).unwrap();
                record["epoch"].as_u64().unwrap()
            })
            .collect();
        assert_eq!(epochs, vec![1, 2]);
    }

    #[test]
    fn init_twice_is_harmless() {
        init(true);
        init(false);
    }
}
