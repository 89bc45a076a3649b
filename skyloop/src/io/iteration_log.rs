//! Per-iteration records written to `<scratch>/iterations/`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;

use crate::core::overlay::Phase;

#[derive(Debug, Clone, Serialize)]
pub struct IterationRecord {
    pub iter: u32,
    pub phase: Phase,
    pub config: PathBuf,
    pub input: PathBuf,
    pub sky_estimate: Option<PathBuf>,
    pub output: PathBuf,
    pub is_final: bool,
    pub started_at: String,
    pub ended_at: String,
    pub duration_ms: u64,
}

pub fn record_path(dir: &Path, iter: u32) -> PathBuf {
    dir.join(format!("{iter:04}.json"))
}

pub fn write_record(dir: &Path, record: &IterationRecord) -> Result<PathBuf> {
    fs::create_dir_all(dir).with_context(|| format!("create iteration dir {}", dir.display()))?;
    let path = record_path(dir, record.iter);
    let mut buf = serde_json::to_string_pretty(record).context("serialize iteration record")?;
    buf.push('\n');
    fs::write(&path, buf).with_context(|| format!("write {}", path.display()))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn record_paths_are_stable() {
        let dir = Path::new("/tmp/skyloop-x/iterations");
        assert!(record_path(dir, 3).ends_with("0003.json"));
    }

    #[test]
    fn writes_record_as_json() {
        let temp = tempfile::tempdir().expect("tempdir");
        let record = IterationRecord {
            iter: 2,
            phase: Phase::Recurring,
            config: PathBuf::from("conf1"),
            input: PathBuf::from("groups/cleaned.lis"),
            sky_estimate: Some(PathBuf::from("map_0001")),
            output: PathBuf::from("map_0002"),
            is_final: false,
            started_at: "2026-01-01T00:00:00+00:00".to_string(),
            ended_at: "2026-01-01T00:00:05+00:00".to_string(),
            duration_ms: 5000,
        };

        let path = write_record(&temp.path().join("iterations"), &record).expect("write");
        let value: Value =
            serde_json::from_str(&fs::read_to_string(path).expect("read")).expect("json");
        assert_eq!(value["phase"], "recurring");
        assert_eq!(value["sky_estimate"], "map_0001");
        assert_eq!(value["duration_ms"], 5000);
    }
}
