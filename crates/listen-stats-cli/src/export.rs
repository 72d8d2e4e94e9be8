use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use csv::{Terminator, WriterBuilder};
use listen_stats_core::{AggregateKind, StatsError};
use serde::Serialize;
use tracing::info;

/// Writes `rows` to `<output_dir>/<name>.csv` behind a header line,
/// replacing any existing file. Records end with CRLF.
///
/// # Errors
/// Returns [`StatsError::OutputWriteFailure`] when the output directory is
/// missing or the file cannot be written.
pub fn export<T: Serialize>(
    output_dir: &Path,
    name: &str,
    header: &[&str],
    rows: &[T],
) -> Result<PathBuf> {
    if !output_dir.is_dir() {
        return Err(anyhow!(StatsError::OutputWriteFailure(format!(
            "output directory {} does not exist",
            output_dir.display()
        ))));
    }

    let path = output_dir.join(format!("{name}.csv"));
    let write_failure =
        |err: csv::Error| anyhow!(StatsError::OutputWriteFailure(format!("{}: {err}", path.display())));

    let mut writer = WriterBuilder::new()
        .has_headers(false)
        .terminator(Terminator::CRLF)
        .from_path(&path)
        .map_err(write_failure)?;
    writer.write_record(header).map_err(write_failure)?;
    for row in rows {
        writer.serialize(row).map_err(write_failure)?;
    }
    writer.flush().map_err(|err| {
        anyhow!(StatsError::OutputWriteFailure(format!(
            "{}: {err}",
            path.display()
        )))
    })?;

    info!(path = %path.display(), rows = rows.len(), "exported aggregate");
    Ok(path)
}

pub fn export_aggregate<T: Serialize>(
    output_dir: &Path,
    kind: AggregateKind,
    rows: &[T],
) -> Result<PathBuf> {
    export(output_dir, kind.output_name(), kind.header(), rows)
}
