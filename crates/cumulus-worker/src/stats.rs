// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Stats file format.
//!
//! The job runner reports its outcome as a line-oriented file, one
//! `<key> <value>` pair per line. Values of [`WELL_KNOWN_KEYS`] are JSON
//! documents; any other value is a number when it parses as one and raw
//! text otherwise.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use serde_json::{Number, Value};
use tracing::warn;

/// Keys whose values are self-describing JSON literals.
pub const WELL_KNOWN_KEYS: [&str; 3] = ["exception", "exc_pickle_fail", "result"];

/// Parse a single stats value.
///
/// Never fails: a well-known value that is not valid JSON falls back to the
/// raw string, so one bad field cannot discard the rest of the record.
pub fn parse_value(key: &str, raw: &str) -> Value {
    if WELL_KNOWN_KEYS.contains(&key) {
        return match serde_json::from_str(raw) {
            Ok(value) => value,
            Err(e) => {
                warn!(key = %key, error = %e, "Stats value is not valid JSON, keeping raw text");
                Value::String(raw.to_string())
            }
        };
    }

    if let Ok(int) = raw.parse::<i64>() {
        return Value::Number(int.into());
    }
    raw.parse::<f64>()
        .ok()
        .and_then(Number::from_f64)
        .map(Value::Number)
        .unwrap_or_else(|| Value::String(raw.to_string()))
}

/// Parse the content of a stats file into ordered `(key, value)` pairs.
///
/// Blank lines are skipped. A line without a value yields an empty string.
pub fn parse_stats(content: &str) -> Vec<(String, Value)> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| match line.split_once(' ') {
            Some((key, raw)) => (key.to_string(), parse_value(key, raw)),
            None => (line.to_string(), Value::String(String::new())),
        })
        .collect()
}

/// Read and parse a stats file. A missing file yields no fields.
pub async fn read_stats_file(path: &Path) -> std::io::Result<Vec<(String, Value)>> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => Ok(parse_stats(&content)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e),
    }
}

/// Writer for the stats file, used on the job runner side.
pub struct StatsWriter {
    out: BufWriter<File>,
}

impl StatsWriter {
    /// Create (or truncate) the stats file.
    pub fn create(path: &Path) -> std::io::Result<Self> {
        Ok(Self {
            out: BufWriter::new(File::create(path)?),
        })
    }

    /// Write a JSON value. Used for the well-known keys.
    pub fn write_json(&mut self, key: &str, value: &Value) -> std::io::Result<()> {
        let encoded = serde_json::to_string(value)?;
        writeln!(self.out, "{} {}", key, encoded)
    }

    /// Write a numeric stat.
    pub fn write_number(&mut self, key: &str, value: f64) -> std::io::Result<()> {
        writeln!(self.out, "{} {}", key, value)
    }

    /// Write a plain text stat. Newlines are folded into spaces.
    pub fn write_text(&mut self, key: &str, value: &str) -> std::io::Result<()> {
        writeln!(self.out, "{} {}", key, value.replace(['\r', '\n'], " "))
    }

    /// Flush buffered lines to disk.
    pub fn finish(mut self) -> std::io::Result<()> {
        self.out.flush()?;
        self.out.get_ref().sync_all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_numeric_and_raw_values() {
        let fields = parse_stats("function_exec_time 0.25\nattempts 3\nhost worker-7\n");

        assert_eq!(fields[0], ("function_exec_time".to_string(), json!(0.25)));
        assert_eq!(fields[1], ("attempts".to_string(), json!(3)));
        assert_eq!(fields[2], ("host".to_string(), json!("worker-7")));
    }

    #[test]
    fn test_well_known_keys_are_decoded() {
        let content = concat!(
            "result {\"rows\": [1, 2], \"ok\": true}\n",
            "exception false\n",
            "exc_pickle_fail {\"kind\":\"encode\",\"message\":\"bad\"}\n",
        );
        let fields = parse_stats(content);

        assert_eq!(fields[0].1, json!({"rows": [1, 2], "ok": true}));
        assert_eq!(fields[1].1, json!(false));
        assert_eq!(fields[2].1["kind"], "encode");
    }

    #[test]
    fn test_well_known_numeric_stays_json() {
        // "42" is valid JSON, so the result is the number, not a float parse
        let fields = parse_stats("result 42");
        assert_eq!(fields[0].1, json!(42));
    }

    #[test]
    fn test_bad_json_falls_back_to_raw() {
        let fields = parse_stats("result {not json\nother 1.5");

        assert_eq!(fields[0].1, json!("{not json"));
        assert_eq!(fields[1].1, json!(1.5));
    }

    #[test]
    fn test_value_with_spaces_and_missing_value() {
        let fields = parse_stats("message hello big world\nlonely\n\n");

        assert_eq!(fields.len(), 2);
        assert_eq!(fields[0].1, json!("hello big world"));
        assert_eq!(fields[1], ("lonely".to_string(), json!("")));
    }

    #[test]
    fn test_nan_is_kept_as_text() {
        let fields = parse_stats("ratio NaN");
        assert_eq!(fields[0].1, json!("NaN"));
    }

    #[tokio::test]
    async fn test_writer_output_reads_back() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("job_stats.txt");

        let mut writer = StatsWriter::create(&path).unwrap();
        writer
            .write_json("result", &json!({"text": "multi\nline"}))
            .unwrap();
        writer.write_number("function_exec_time", 1.5).unwrap();
        writer.write_text("note", "a\nb").unwrap();
        writer.finish().unwrap();

        let fields = read_stats_file(&path).await.unwrap();
        assert_eq!(fields[0].1, json!({"text": "multi\nline"}));
        assert_eq!(fields[1].1, json!(1.5));
        assert_eq!(fields[2].1, json!("a b"));
    }

    #[tokio::test]
    async fn test_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let fields = read_stats_file(&dir.path().join("absent")).await.unwrap();
        assert!(fields.is_empty());
    }
}
