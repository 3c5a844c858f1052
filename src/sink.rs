use std::fs::File;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

pub const OUTPUT_HEADER: &str = "Description";

/// One output row. Its position, not its content, links it to the input row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputRow {
    pub text: String,
}

/// Append-only destination for output rows.
///
/// `append` must not return until the row is on the medium, and must treat an
/// empty row exactly like any other.
pub trait RowSink {
    fn append(&mut self, row: &OutputRow) -> Result<()>;
}

/// Single-column CSV file, flushed and synced after every row.
pub struct CsvSink {
    writer: csv::Writer<File>,
    path: PathBuf,
    rows: u64,
}

impl CsvSink {
    /// Create (or truncate) `path` and write the header.
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::create(path)
            .with_context(|| format!("Failed to create output CSV {}", path.display()))?;
        // Quoting every field keeps an empty row distinguishable from a blank line
        let writer = csv::WriterBuilder::new()
            .quote_style(csv::QuoteStyle::Always)
            .from_writer(file);
        let mut sink = Self {
            writer,
            path: path.to_path_buf(),
            rows: 0,
        };
        sink.write_line(OUTPUT_HEADER)?;
        Ok(sink)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn rows(&self) -> u64 {
        self.rows
    }

    fn write_line(&mut self, field: &str) -> Result<()> {
        self.writer.write_record([field])?;
        self.writer.flush()?;
        self.writer
            .get_ref()
            .sync_data()
            .with_context(|| format!("Failed to sync {}", self.path.display()))?;
        Ok(())
    }
}

impl RowSink for CsvSink {
    fn append(&mut self, row: &OutputRow) -> Result<()> {
        self.write_line(&row.text)
            .with_context(|| format!("Failed to write output row {}", self.rows + 1))?;
        self.rows += 1;
        Ok(())
    }
}

impl RowSink for Vec<OutputRow> {
    fn append(&mut self, row: &OutputRow) -> Result<()> {
        self.push(row.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(text: &str) -> OutputRow {
        OutputRow {
            text: text.to_string(),
        }
    }

    #[test]
    fn test_rows_visible_after_each_append() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv");
        let mut sink = CsvSink::create(&path).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "\"Description\"\n");

        sink.append(&row("A photograph, circa 1950.")).unwrap();
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "\"Description\"\n\"A photograph, circa 1950.\"\n"
        );
        assert_eq!(sink.rows(), 1);
    }

    #[test]
    fn test_empty_rows_keep_alignment() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv");
        let mut sink = CsvSink::create(&path).unwrap();
        for text in ["first", "", "Error: 500 Overloaded", "", "last"] {
            sink.append(&row(text)).unwrap();
        }
        assert_eq!(sink.path(), path.as_path());

        let mut reader = csv::Reader::from_path(&path).unwrap();
        assert_eq!(reader.headers().unwrap(), vec![OUTPUT_HEADER]);
        let texts: Vec<String> = reader
            .records()
            .map(|r| r.unwrap()[0].to_string())
            .collect();
        assert_eq!(texts, vec!["first", "", "Error: 500 Overloaded", "", "last"]);
    }

    #[test]
    fn test_create_in_missing_dir_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(CsvSink::create(&dir.path().join("nope").join("out.csv")).is_err());
    }
}
