use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};

pub fn now_utc_string() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub fn utc_compact_string(ts: DateTime<Utc>) -> String {
    ts.format("%Y%m%dT%H%M%SZ").to_string()
}

pub fn ensure_directory(path: &Path) -> Result<()> {
    fs::create_dir_all(path)
        .with_context(|| format!("failed to create directory: {}", path.display()))
}

pub fn sha256_text(payload: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Cache keys double as path-like partitions, so separators in ids are flattened.
pub fn sanitize_cache_key(value: &str) -> String {
    value.replace(['/', '\\'], "_")
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_slice(&raw).with_context(|| format!("failed to parse {}", path.display()))
}

pub fn write_json_pretty<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_directory(parent)?;
    }

    let data = serde_json::to_vec_pretty(value)
        .with_context(|| format!("failed to serialize json: {}", path.display()))?;

    let mut file = File::create(path)
        .with_context(|| format!("failed to create json file: {}", path.display()))?;
    file.write_all(&data)
        .with_context(|| format!("failed to write json file: {}", path.display()))?;
    file.write_all(b"\n")
        .with_context(|| format!("failed to finalize json file: {}", path.display()))?;

    Ok(())
}

#[cfg(test)]
pub fn scratch_dir(label: &str) -> std::path::PathBuf {
    let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
    let path = std::env::temp_dir().join(format!(
        "reteval-{label}-{}-{nanos}",
        std::process::id()
    ));
    fs::create_dir_all(&path).expect("scratch dir should be creatable");
    path
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_cache_key_flattens_path_separators() {
        assert_eq!(sanitize_cache_key("leetcode/two-sum"), "leetcode_two-sum");
        assert_eq!(sanitize_cache_key("a\\b/c"), "a_b_c");
        assert_eq!(sanitize_cache_key("plain-17"), "plain-17");
    }

    #[test]
    fn json_helpers_round_trip_through_disk() {
        let dir = scratch_dir("util-json");
        let path = dir.join("nested").join("value.json");
        write_json_pretty(&path, &vec!["b", "a"]).expect("write should succeed");

        let raw = fs::read_to_string(&path).expect("file should exist");
        assert!(raw.ends_with("]\n"));

        let parsed: Vec<String> = read_json(&path).expect("read should succeed");
        assert_eq!(parsed, vec!["b".to_string(), "a".to_string()]);
    }
}
