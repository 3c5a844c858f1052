use std::fs::File;
use std::io::Read;
use std::path::Path;

use anyhow::{Context, Result};
use futures::Stream;
use tokio::sync::mpsc;
use tracing::debug;

use crate::record::Record;

/// Open a headered CSV and stream its rows lazily.
///
/// Rows are decoded on a dedicated reader thread and handed over through a
/// channel of `capacity` slots, so memory stays bounded however long the file is.
/// Fields and headers are trimmed and blank lines are skipped.
pub fn csv_records(path: &Path, capacity: usize) -> Result<impl Stream<Item = Result<Record>>> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open input CSV {}", path.display()))?;
    let reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(file);
    Ok(records_from_reader(reader, capacity))
}

pub fn records_from_reader<R>(
    mut reader: csv::Reader<R>,
    capacity: usize,
) -> impl Stream<Item = Result<Record>>
where
    R: Read + Send + 'static,
{
    let (tx, rx) = mpsc::channel::<Result<Record>>(capacity.max(1));

    std::thread::spawn(move || {
        let headers = match reader.headers() {
            Ok(headers) => headers.clone(),
            Err(e) => {
                let _ = tx.blocking_send(Err(e).context("Failed to read CSV header"));
                return;
            }
        };

        let mut index = 0u64;
        for row in reader.records() {
            let row = match row {
                Ok(row) if is_blank_line(&row) => continue,
                Ok(row) => row
                    .deserialize::<Record>(Some(&headers))
                    .map_err(anyhow::Error::from),
                Err(e) => Err(anyhow::Error::from(e)),
            };
            index += 1;
            let row = row.with_context(|| format!("Failed to decode CSV record {}", index));
            let failed = row.is_err();
            // Plain OS-level blocking send: this thread never enters the runtime
            if tx.blocking_send(row).is_err() {
                debug!("Record consumer dropped, stopping reader");
                return;
            }
            if failed {
                return;
            }
        }
        debug!(records = index, "CSV reader reached end of input");
    });

    futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|row| (row, rx))
    })
}

/// A whitespace-only line trims down to a single empty field.
fn is_blank_line(row: &csv::StringRecord) -> bool {
    row.len() == 1 && row[0].trim().is_empty()
}
