//! Dataset attachment. Files are never copied or parsed in full here; the
//! worker loads them read-only. The provider checks they exist and builds a
//! compact summary for prompt context.

use crate::errors::{Result, SandboxError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tracing::debug;

const SAMPLE_ROWS: usize = 3;
const TYPE_SCAN_ROWS: usize = 200;
const JSON_SUMMARY_MAX_BYTES: u64 = 8 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasetFormat {
    Csv,
    Tsv,
    Json,
    Parquet,
    Excel,
    /// Loaded as an empty frame
    Unknown,
}

impl DatasetFormat {
    pub fn from_path(path: &Path) -> Self {
        let ext = path
            .extension()
            .map(|e| e.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "csv" => DatasetFormat::Csv,
            "tsv" | "tab" => DatasetFormat::Tsv,
            "json" | "jsonl" | "ndjson" => DatasetFormat::Json,
            "parquet" | "pq" => DatasetFormat::Parquet,
            "xlsx" | "xls" => DatasetFormat::Excel,
            _ => DatasetFormat::Unknown,
        }
    }

    fn delimiter(&self) -> Option<char> {
        match self {
            DatasetFormat::Csv => Some(','),
            DatasetFormat::Tsv => Some('\t'),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Integer,
    Float,
    Boolean,
    Text,
    Empty,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSummary {
    pub name: String,
    pub inferred: ColumnType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct DatasetSummary {
    pub columns: Vec<ColumnSummary>,
    pub sample_rows: Vec<Vec<String>>,
}

/// A dataset ready to be bound into a worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetHandle {
    /// Canonical path; the worker is granted read access to exactly this file
    pub path: PathBuf,
    pub format: DatasetFormat,
    pub size_bytes: u64,
    pub summary: Option<DatasetSummary>,
}

impl DatasetHandle {
    /// Plain-text description for a prompt.
    pub fn context_block(&self, alias: &str) -> String {
        let label = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut block = format!("File: {label} (alias: {alias})\n");
        match &self.summary {
            Some(summary) => {
                let columns: Vec<String> = summary
                    .columns
                    .iter()
                    .map(|c| format!("{} ({})", c.name, format!("{:?}", c.inferred).to_lowercase()))
                    .collect();
                block.push_str(&format!("Columns: {}\n", columns.join(", ")));
                if !summary.sample_rows.is_empty() {
                    block.push_str("First rows:\n");
                    for row in &summary.sample_rows {
                        block.push_str(&row.join(" | "));
                        block.push('\n');
                    }
                }
            }
            None => block.push_str("No preview available.\n"),
        }
        block
    }
}

/// Source of datasets for the orchestrator
#[async_trait]
pub trait DatasetProvider: Send + Sync {
    async fn load(&self, path: &Path) -> Result<DatasetHandle>;
}

/// Datasets read from the local filesystem
#[derive(Debug, Clone, Default)]
pub struct FileDatasetProvider {
    /// Skip building summaries
    skip_summary: bool,
}

impl FileDatasetProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn without_summary(mut self) -> Self {
        self.skip_summary = true;
        self
    }
}

#[async_trait]
impl DatasetProvider for FileDatasetProvider {
    async fn load(&self, path: &Path) -> Result<DatasetHandle> {
        let canonical = tokio::fs::canonicalize(path)
            .await
            .map_err(|e| SandboxError::DatasetUnavailable(format!("{}: {}", path.display(), e)))?;
        let metadata = tokio::fs::metadata(&canonical).await?;
        if !metadata.is_file() {
            return Err(SandboxError::DatasetUnavailable(format!(
                "{} is not a regular file",
                path.display()
            )));
        }

        let format = DatasetFormat::from_path(&canonical);
        let summary = if self.skip_summary {
            None
        } else {
            match format {
                DatasetFormat::Csv | DatasetFormat::Tsv => summarize_delimited(&canonical, format).await.ok(),
                DatasetFormat::Json if metadata.len() <= JSON_SUMMARY_MAX_BYTES => {
                    summarize_json(&canonical).await
                }
                _ => None,
            }
        };

        debug!("[SANDBOX] Attached dataset {:?} ({:?}, {} bytes)", canonical, format, metadata.len());

        Ok(DatasetHandle {
            path: canonical,
            format,
            size_bytes: metadata.len(),
            summary,
        })
    }
}

async fn summarize_delimited(path: &Path, format: DatasetFormat) -> Result<DatasetSummary> {
    let delimiter = format.delimiter().unwrap_or(',');
    let file = tokio::fs::File::open(path).await?;
    let mut lines = BufReader::new(file).lines();

    let header = match lines.next_line().await? {
        Some(line) => split_record(line.trim_start_matches('\u{feff}'), delimiter),
        None => return Ok(DatasetSummary::default()),
    };

    let mut rows = Vec::new();
    while rows.len() < TYPE_SCAN_ROWS {
        match lines.next_line().await? {
            Some(line) if line.trim().is_empty() => continue,
            Some(line) => rows.push(split_record(&line, delimiter)),
            None => break,
        }
    }

    let columns = header
        .iter()
        .enumerate()
        .map(|(i, name)| ColumnSummary {
            name: name.clone(),
            inferred: infer_column(rows.iter().filter_map(|r| r.get(i)).map(String::as_str)),
        })
        .collect();

    Ok(DatasetSummary {
        columns,
        sample_rows: rows.into_iter().take(SAMPLE_ROWS).collect(),
    })
}

async fn summarize_json(path: &Path) -> Option<DatasetSummary> {
    let mut raw = String::new();
    let mut file = tokio::fs::File::open(path).await.ok()?;
    file.read_to_string(&mut raw).await.ok()?;
    let value: serde_json::Value = serde_json::from_str(&raw).ok()?;
    let records = value.as_array()?;
    let first = records.first()?.as_object()?;

    let names: Vec<String> = first.keys().cloned().collect();
    let columns = names
        .iter()
        .map(|name| {
            let cells: Vec<String> = records
                .iter()
                .take(TYPE_SCAN_ROWS)
                .filter_map(|r| r.get(name))
                .map(json_cell)
                .collect();
            ColumnSummary {
                name: name.clone(),
                inferred: infer_column(cells.iter().map(String::as_str)),
            }
        })
        .collect();
    let sample_rows = records
        .iter()
        .take(SAMPLE_ROWS)
        .map(|r| {
            names
                .iter()
                .map(|n| r.get(n).map(json_cell).unwrap_or_default())
                .collect()
        })
        .collect();

    Some(DatasetSummary { columns, sample_rows })
}

fn json_cell(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Split one delimited record, honouring double-quoted fields.
fn split_record(line: &str, delimiter: char) -> Vec<String> {
    let mut fields = Vec::new();
    let mut field = String::new();
    let mut quoted = false;
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '"' if quoted && chars.peek() == Some(&'"') => {
                field.push('"');
                chars.next();
            }
            '"' => quoted = !quoted,
            c if c == delimiter && !quoted => fields.push(std::mem::take(&mut field)),
            c => field.push(c),
        }
    }
    fields.push(field);
    fields.into_iter().map(|f| f.trim().to_string()).collect()
}

fn infer_column<'a>(cells: impl Iterator<Item = &'a str>) -> ColumnType {
    let mut seen = false;
    let mut all_int = true;
    let mut all_float = true;
    let mut all_bool = true;
    for cell in cells.filter(|c| !c.is_empty()) {
        seen = true;
        all_int &= cell.parse::<i64>().is_ok();
        all_float &= cell.parse::<f64>().is_ok();
        all_bool &= matches!(cell.to_ascii_lowercase().as_str(), "true" | "false");
    }
    match (seen, all_int, all_float, all_bool) {
        (false, ..) => ColumnType::Empty,
        (true, true, _, _) => ColumnType::Integer,
        (true, _, true, _) => ColumnType::Float,
        (true, _, _, true) => ColumnType::Boolean,
        _ => ColumnType::Text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_detection() {
        assert_eq!(DatasetFormat::from_path(Path::new("a/b/Sales.CSV")), DatasetFormat::Csv);
        assert_eq!(DatasetFormat::from_path(Path::new("x.tsv")), DatasetFormat::Tsv);
        assert_eq!(DatasetFormat::from_path(Path::new("x.ndjson")), DatasetFormat::Json);
        assert_eq!(DatasetFormat::from_path(Path::new("notes.txt")), DatasetFormat::Unknown);
    }

    #[test]
    fn test_split_record_with_quotes() {
        assert_eq!(
            split_record(r#"1,"Smith, Jane","said ""hi""",x"#, ','),
            vec!["1", "Smith, Jane", r#"said "hi""#, "x"]
        );
    }

    #[test]
    fn test_infer_column() {
        assert_eq!(infer_column(["1", "2", ""].into_iter()), ColumnType::Integer);
        assert_eq!(infer_column(["1", "2.5"].into_iter()), ColumnType::Float);
        assert_eq!(infer_column(["True", "false"].into_iter()), ColumnType::Boolean);
        assert_eq!(infer_column(["a", "1"].into_iter()), ColumnType::Text);
        assert_eq!(infer_column(["", ""].into_iter()), ColumnType::Empty);
    }

    #[tokio::test]
    async fn test_load_csv_summary() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sales.csv");
        std::fs::write(&path, "month,revenue,region\nJan,10.5,north\nFeb,12,south\nMar,9,north\nApr,11,east\n").unwrap();

        let handle = FileDatasetProvider::new().load(&path).await.unwrap();
        assert_eq!(handle.format, DatasetFormat::Csv);
        assert!(handle.path.is_absolute());

        let summary = handle.summary.clone().unwrap();
        assert_eq!(summary.columns.len(), 3);
        assert_eq!(summary.columns[1].inferred, ColumnType::Float);
        assert_eq!(summary.sample_rows.len(), 3);

        let block = handle.context_block("df_sales");
        assert!(block.contains("alias: df_sales"));
        assert!(block.contains("revenue (float)"));
    }

    #[tokio::test]
    async fn test_load_json_summary() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("points.json");
        std::fs::write(&path, r#"[{"x": 1, "y": 2.5}, {"x": 2, "y": null}]"#).unwrap();

        let handle = FileDatasetProvider::new().load(&path).await.unwrap();
        let summary = handle.summary.unwrap();
        assert_eq!(summary.columns[0].inferred, ColumnType::Integer);
        assert_eq!(summary.columns[1].inferred, ColumnType::Float);
    }

    #[tokio::test]
    async fn test_missing_file() {
        let result = FileDatasetProvider::new().load(Path::new("/definitely/not/here.csv")).await;
        assert!(matches!(result, Err(SandboxError::DatasetUnavailable(_))));
    }

    #[tokio::test]
    async fn test_directory_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let result = FileDatasetProvider::new().load(dir.path()).await;
        assert!(matches!(result, Err(SandboxError::DatasetUnavailable(_))));
    }
}
