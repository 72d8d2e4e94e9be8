use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use listen_stats_core::{is_history_file, parse_history_document, PlaybackEvent, StatsError};
use listen_stats_store_sqlite::SqliteStreamStore;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct IngestReport {
    pub files: Vec<String>,
    pub events: usize,
    /// Events that satisfy the stream condition.
    pub streams: usize,
    /// Qualifying plays per calendar year, as the yearly aggregates count them.
    pub streams_by_year: BTreeMap<String, usize>,
}

/// Loads every `Streaming_History_Audio_*.json` file directly inside
/// `data_dir` and inserts all events with a single commit.
///
/// # Errors
/// Returns [`StatsError::InputNotFound`] when `data_dir` is not a directory,
/// [`StatsError::MalformedRecord`] when a matching file cannot be parsed, and
/// a storage error when the batch insert fails.
pub fn ingest(store: &mut SqliteStreamStore, data_dir: &Path) -> Result<IngestReport> {
    if !data_dir.is_dir() {
        return Err(anyhow!(StatsError::InputNotFound(format!(
            "data directory {} does not exist",
            data_dir.display()
        ))));
    }

    let files = history_files(data_dir)?;
    let mut report = IngestReport::default();
    let mut events: Vec<PlaybackEvent> = Vec::new();

    for file_name in files {
        let path = data_dir.join(&file_name);
        let raw = fs::read(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let parsed = parse_history_document(&raw).map_err(|err| match err {
            StatsError::MalformedRecord(message) => {
                anyhow!(StatsError::MalformedRecord(format!("{file_name}: {message}")))
            }
            other => anyhow!(other),
        })?;

        info!(file = %file_name, events = parsed.len(), "loaded streaming history file");
        events.extend(parsed);
        report.files.push(file_name);
    }

    report.streams = events.iter().filter(|event| event.is_stream()).count();

    store.insert_batch(&events)?;
    report.events = store.count_events()?;
    report.streams_by_year = store.streams_by_year()?;
    info!(
        files = report.files.len(),
        events = report.events,
        streams = report.streams,
        "ingested streaming history"
    );

    Ok(report)
}

// Non-recursive; returned in file-name order.
fn history_files(data_dir: &Path) -> Result<Vec<String>> {
    let entries = fs::read_dir(data_dir)
        .with_context(|| format!("failed to list {}", data_dir.display()))?;

    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.with_context(|| format!("failed to list {}", data_dir.display()))?;
        let Some(file_name) = entry.file_name().to_str().map(str::to_string) else {
            debug!(entry = ?entry.file_name(), "skipping non UTF-8 entry");
            continue;
        };

        if is_history_file(&file_name) {
            files.push(file_name);
        } else {
            debug!(entry = %file_name, "skipping entry");
        }
    }

    files.sort();
    Ok(files)
}
