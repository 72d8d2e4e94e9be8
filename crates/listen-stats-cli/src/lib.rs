//! Listening statistics pipeline for streaming history exports.
//!
//! A run creates a fresh record store, loads every
//! `Streaming_History_Audio_*.json` document from the data directory, computes
//! the four play-count aggregates, and writes each one as a CSV file:
//! - [`run_cli`] for full parsed CLI execution.
//! - [`run_pipeline`] for execution against an explicit [`PipelineConfig`].

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use clap::Parser;
use listen_stats_core::{format_rfc3339, now_utc, AggregateKind, StatsError};
use listen_stats_store_sqlite::SqliteStreamStore;
use serde::{Deserialize, Serialize};
use tracing::info;

pub mod export;
pub mod ingest;

pub use ingest::IngestReport;

pub const DB_FILENAME: &str = "stream_data.db";
pub const DATA_DIR_NAME: &str = "data";
pub const OUTPUT_DIR_NAME: &str = "output";

#[derive(Debug, Parser)]
#[command(name = "listen-stats")]
#[command(about = "Aggregate listening statistics from streaming history exports")]
pub struct Cli {
    /// Base directory holding `data/`, `output/` and the database file.
    #[arg(long, default_value = ".")]
    root: PathBuf,

    #[arg(long)]
    data_dir: Option<PathBuf>,

    #[arg(long)]
    output_dir: Option<PathBuf>,

    #[arg(long)]
    db: Option<PathBuf>,

    /// Create the output directory when it does not exist.
    #[arg(long)]
    create_output_dir: bool,

    #[arg(long)]
    json: bool,

    #[arg(long)]
    quiet: bool,
}

impl Cli {
    #[must_use]
    pub fn quiet(&self) -> bool {
        self.quiet
    }
}

/// Resolved locations and switches for one pipeline run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    pub data_dir: PathBuf,
    pub output_dir: PathBuf,
    pub db_path: PathBuf,
    pub create_output_dir: bool,
}

impl PipelineConfig {
    #[must_use]
    pub fn from_root(root: &Path) -> Self {
        Self {
            data_dir: root.join(DATA_DIR_NAME),
            output_dir: root.join(OUTPUT_DIR_NAME),
            db_path: root.join(DB_FILENAME),
            create_output_dir: false,
        }
    }
}

impl From<&Cli> for PipelineConfig {
    fn from(cli: &Cli) -> Self {
        let defaults = Self::from_root(&cli.root);
        Self {
            data_dir: cli.data_dir.clone().unwrap_or(defaults.data_dir),
            output_dir: cli.output_dir.clone().unwrap_or(defaults.output_dir),
            db_path: cli.db.clone().unwrap_or(defaults.db_path),
            create_output_dir: cli.create_output_dir,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutputSummary {
    pub name: String,
    pub path: String,
    pub rows: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunReport {
    pub generated_at: String,
    pub db_path: String,
    pub ingest: IngestReport,
    pub outputs: Vec<OutputSummary>,
}

/// Executes the parsed CLI and prints the run report.
///
/// # Errors
/// Returns an error when any pipeline stage fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    let config = PipelineConfig::from(&cli);
    let report = run_pipeline(&config)?;

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_run_report(&report);
    }
    Ok(())
}

/// Runs store setup, ingestion, aggregation and export once, in that order.
///
/// # Errors
/// Returns the first fatal error: missing input, malformed records, storage
/// setup failure, or output write failure.
pub fn run_pipeline(config: &PipelineConfig) -> Result<RunReport> {
    if config.create_output_dir {
        fs::create_dir_all(&config.output_dir).map_err(|err| {
            anyhow!(StatsError::OutputWriteFailure(format!(
                "failed to create {}: {err}",
                config.output_dir.display()
            )))
        })?;
    }

    let mut store = SqliteStreamStore::open(&config.db_path)?;
    store.initialize()?;

    let ingest = ingest::ingest(&mut store, &config.data_dir)?;

    let track_counts = store.track_counts()?;
    let track_counts_by_year = store.track_counts_by_year()?;
    let artist_counts = store.artist_counts()?;
    let artist_counts_by_year = store.artist_counts_by_year()?;

    let outputs = vec![
        summarize(
            AggregateKind::TrackCounts,
            export::export_aggregate(&config.output_dir, AggregateKind::TrackCounts, &track_counts)?,
            track_counts.len(),
        ),
        summarize(
            AggregateKind::TrackCountsByYear,
            export::export_aggregate(
                &config.output_dir,
                AggregateKind::TrackCountsByYear,
                &track_counts_by_year,
            )?,
            track_counts_by_year.len(),
        ),
        summarize(
            AggregateKind::ArtistCounts,
            export::export_aggregate(
                &config.output_dir,
                AggregateKind::ArtistCounts,
                &artist_counts,
            )?,
            artist_counts.len(),
        ),
        summarize(
            AggregateKind::ArtistCountsByYear,
            export::export_aggregate(
                &config.output_dir,
                AggregateKind::ArtistCountsByYear,
                &artist_counts_by_year,
            )?,
            artist_counts_by_year.len(),
        ),
    ];

    info!(outputs = outputs.len(), "pipeline complete");

    Ok(RunReport {
        generated_at: format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?,
        db_path: config.db_path.display().to_string(),
        ingest,
        outputs,
    })
}

fn summarize(kind: AggregateKind, path: PathBuf, rows: usize) -> OutputSummary {
    OutputSummary {
        name: kind.output_name().to_string(),
        path: path.display().to_string(),
        rows,
    }
}

fn print_run_report(report: &RunReport) {
    println!(
        "files={} events={} streams={} db={}",
        report.ingest.files.len(),
        report.ingest.events,
        report.ingest.streams,
        report.db_path
    );
    println!("{:<24} {:<8} path", "output", "rows");
    println!("{}", "-".repeat(72));
    for item in &report.outputs {
        println!("{:<24} {:<8} {}", item.name, item.rows, item.path);
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::too_many_lines)]

    use super::*;
    use serde_json::{json, Value};
    use tempfile::TempDir;

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err:#}"),
        }
    }

    fn workspace() -> TempDir {
        let dir = must(tempfile::tempdir().map_err(Into::into));
        must(fs::create_dir(dir.path().join(DATA_DIR_NAME)).map_err(Into::into));
        must(fs::create_dir(dir.path().join(OUTPUT_DIR_NAME)).map_err(Into::into));
        dir
    }

    fn record(track: &str, artist: &str, ms_played: u64, uri: &str, ts: &str) -> Value {
        json!({
            "ts": ts,
            "username": "listener",
            "platform": "ios",
            "ms_played": ms_played,
            "conn_country": "SE",
            "ip_addr_decrypted": null,
            "user_agent_decrypted": null,
            "master_metadata_track_name": track,
            "master_metadata_album_artist_name": artist,
            "master_metadata_album_album_name": format!("{track} (single)"),
            "spotify_track_uri": uri,
            "episode_name": null,
            "episode_show_name": null,
            "spotify_episode_uri": null,
            "reason_start": "fwdbtn",
            "reason_end": "trackdone",
            "shuffle": true,
            "skipped": false,
            "offline": false,
            "offline_timestamp": 0,
            "incognito_mode": false
        })
    }

    fn write_history(root: &Path, file_name: &str, records: &[Value]) {
        let body = Value::Array(records.to_vec()).to_string();
        must(fs::write(root.join(DATA_DIR_NAME).join(file_name), body).map_err(Into::into));
    }

    fn read_output(root: &Path, name: &str) -> String {
        must(
            fs::read_to_string(root.join(OUTPUT_DIR_NAME).join(format!("{name}.csv")))
                .map_err(Into::into),
        )
    }

    fn stats_error(err: &anyhow::Error) -> StatsError {
        match err.downcast_ref::<StatsError>() {
            Some(value) => value.clone(),
            None => panic!("expected StatsError, got: {err:#}"),
        }
    }

    #[test]
    fn cli_defaults_resolve_under_root() {
        let cli = match Cli::try_parse_from(["listen-stats"]) {
            Ok(value) => value,
            Err(err) => panic!("failed to parse default cli: {err}"),
        };
        let config = PipelineConfig::from(&cli);
        assert_eq!(config, PipelineConfig::from_root(Path::new(".")));
        assert_eq!(config.db_path, Path::new(".").join("stream_data.db"));

        let cli = match Cli::try_parse_from([
            "listen-stats",
            "--root",
            "/srv/history",
            "--output-dir",
            "/tmp/out",
            "--create-output-dir",
        ]) {
            Ok(value) => value,
            Err(err) => panic!("failed to parse cli overrides: {err}"),
        };
        let config = PipelineConfig::from(&cli);
        assert_eq!(config.data_dir, Path::new("/srv/history/data"));
        assert_eq!(config.output_dir, Path::new("/tmp/out"));
        assert!(config.create_output_dir);
    }

    #[test]
    fn thirty_second_threshold_applies_end_to_end() {
        let dir = workspace();
        write_history(
            dir.path(),
            "Streaming_History_Audio_2022.json",
            &[
                record("A", "X", 40_000, "spotify:track:1", "2022-01-01T00:00:00Z"),
                record("A", "X", 10_000, "spotify:track:1", "2022-06-01T00:00:00Z"),
            ],
        );

        let report = must(run_pipeline(&PipelineConfig::from_root(dir.path())));
        assert_eq!(report.ingest.events, 2);
        assert_eq!(report.ingest.streams, 1);
        assert_eq!(report.ingest.streams_by_year.get("2022"), Some(&1));

        assert_eq!(
            read_output(dir.path(), "track_counts"),
            "track_name,artist_name,album_name,play_count,total_ms\r\nA,X,A (single),1,40000\r\n"
        );
        assert_eq!(
            read_output(dir.path(), "track_counts_yearly"),
            "year,track_name,artist_name,album_name,play_count,total_ms\r\n2022,A,X,A (single),1,40000\r\n"
        );
        assert_eq!(
            read_output(dir.path(), "artist_counts"),
            "artist_name,play_count,total_ms\r\nX,1,40000\r\n"
        );
        assert_eq!(
            read_output(dir.path(), "artist_counts_yearly"),
            "year,artist_name,play_count,total_ms\r\n2022,X,1,40000\r\n"
        );
    }

    #[test]
    fn empty_data_directory_writes_header_only_files() {
        let dir = workspace();
        let report = must(run_pipeline(&PipelineConfig::from_root(dir.path())));

        assert!(report.ingest.files.is_empty());
        assert_eq!(report.outputs.len(), 4);
        for kind in AggregateKind::ALL {
            let body = read_output(dir.path(), kind.output_name());
            assert_eq!(body, format!("{}\r\n", kind.header().join(",")));
        }
    }

    #[test]
    fn non_matching_entries_are_ignored() {
        let dir = workspace();
        write_history(
            dir.path(),
            "Streaming_History_Audio_2021_0.json",
            &[record("A", "X", 40_000, "spotify:track:1", "2021-01-01T00:00:00Z")],
        );
        let data = dir.path().join(DATA_DIR_NAME);
        must(fs::write(data.join("Streaming_History_Video_2021.json"), "not json").map_err(Into::into));
        must(fs::write(data.join("ReadMeFirst.txt"), "{").map_err(Into::into));
        must(fs::create_dir(data.join("nested")).map_err(Into::into));

        let report = must(run_pipeline(&PipelineConfig::from_root(dir.path())));
        assert_eq!(report.ingest.files, vec!["Streaming_History_Audio_2021_0.json"]);
        assert_eq!(report.ingest.events, 1);
    }

    #[test]
    fn events_from_all_files_are_combined() {
        let dir = workspace();
        write_history(
            dir.path(),
            "Streaming_History_Audio_2020-2021_0.json",
            &[
                record("A", "X", 40_000, "spotify:track:1", "2020-03-01T00:00:00Z"),
                record("B", "Y", 40_000, "spotify:track:2", "2021-03-01T00:00:00Z"),
            ],
        );
        write_history(
            dir.path(),
            "Streaming_History_Audio_2021-2022_1.json",
            &[
                record("A", "X", 50_000, "spotify:track:1", "2021-04-01T00:00:00Z"),
                record("A", "X", 60_000, "spotify:track:1", "2022-04-01T00:00:00Z"),
            ],
        );

        let report = must(run_pipeline(&PipelineConfig::from_root(dir.path())));
        assert_eq!(report.ingest.files.len(), 2);
        assert_eq!(report.ingest.events, 4);
        assert_eq!(report.ingest.streams, 4);

        let artist_counts = read_output(dir.path(), "artist_counts");
        let mut lines = artist_counts.lines();
        assert_eq!(lines.next(), Some("artist_name,play_count,total_ms"));
        assert_eq!(lines.next(), Some("X,3,150000"));
        assert_eq!(lines.next(), Some("Y,1,40000"));
        assert_eq!(lines.next(), None);

        let track_rows = report
            .outputs
            .iter()
            .find(|item| item.name == "track_counts_yearly")
            .map(|item| item.rows);
        assert_eq!(track_rows, Some(4));
    }

    #[test]
    fn numeric_flags_and_whole_number_durations_are_accepted() {
        let dir = workspace();
        let mut play = record("A", "X", 0, "spotify:track:1", "2022-03-01T00:00:00Z");
        if let Value::Object(fields) = &mut play {
            fields.insert("ms_played".to_string(), json!(40_000.0));
            fields.insert("shuffle".to_string(), json!(1));
            fields.insert("skipped".to_string(), json!(0));
            fields.insert("offline".to_string(), json!(0));
            fields.insert("incognito_mode".to_string(), json!(0));
        }
        write_history(dir.path(), "Streaming_History_Audio_2022.json", &[play]);

        let report = must(run_pipeline(&PipelineConfig::from_root(dir.path())));
        assert_eq!(report.ingest.streams, 1);
        assert_eq!(
            read_output(dir.path(), "artist_counts"),
            "artist_name,play_count,total_ms\r\nX,1,40000\r\n"
        );
    }

    #[test]
    fn invalid_utf8_history_is_malformed_and_names_the_file() {
        let dir = workspace();
        must(
            fs::write(
                dir.path()
                    .join(DATA_DIR_NAME)
                    .join("Streaming_History_Audio_2016.json"),
                [0xff, 0xfe, b'[', b']'],
            )
            .map_err(Into::into),
        );

        let err = match run_pipeline(&PipelineConfig::from_root(dir.path())) {
            Ok(_) => panic!("invalid UTF-8 must fail"),
            Err(err) => err,
        };
        match stats_error(&err) {
            StatsError::MalformedRecord(message) => {
                assert!(message.starts_with("Streaming_History_Audio_2016.json: invalid JSON"));
            }
            other => panic!("unexpected error kind: {other}"),
        }
    }

    #[test]
    fn yearly_summary_matches_the_exported_year() {
        let dir = workspace();
        write_history(
            dir.path(),
            "Streaming_History_Audio_2023.json",
            &[record("A", "X", 40_000, "spotify:track:1", "2023-01-01T00:30:00+14:00")],
        );

        let report = must(run_pipeline(&PipelineConfig::from_root(dir.path())));
        assert_eq!(
            read_output(dir.path(), "artist_counts_yearly"),
            "year,artist_name,play_count,total_ms\r\n2022,X,1,40000\r\n"
        );
        assert_eq!(
            report.ingest.streams_by_year,
            std::collections::BTreeMap::from([("2022".to_string(), 1)])
        );
    }

    #[test]
    fn podcast_episodes_are_not_counted() {
        let dir = workspace();
        let mut episode = record("", "", 1_800_000, "", "2023-02-02T07:00:00Z");
        if let Value::Object(fields) = &mut episode {
            fields.insert("episode_name".to_string(), json!("Pilot"));
            fields.insert("episode_show_name".to_string(), json!("Talk Show"));
            fields.insert("spotify_episode_uri".to_string(), json!("spotify:episode:9"));
        }
        write_history(dir.path(), "Streaming_History_Audio_2023.json", &[episode]);

        let report = must(run_pipeline(&PipelineConfig::from_root(dir.path())));
        assert_eq!(report.ingest.events, 1);
        assert_eq!(report.ingest.streams, 0);
        assert!(report.outputs.iter().all(|item| item.rows == 0));
    }

    #[test]
    fn text_fields_are_quoted_when_needed() {
        let dir = workspace();
        write_history(
            dir.path(),
            "Streaming_History_Audio_2019.json",
            &[record(
                "Hello, \"World\"",
                "Line\nBreak",
                45_000,
                "spotify:track:q",
                "2019-09-09T09:09:09Z",
            )],
        );

        must(run_pipeline(&PipelineConfig::from_root(dir.path())));
        assert_eq!(
            read_output(dir.path(), "artist_counts"),
            "artist_name,play_count,total_ms\r\n\"Line\nBreak\",1,45000\r\n"
        );
        let tracks = read_output(dir.path(), "track_counts");
        assert!(tracks.contains("\"Hello, \"\"World\"\"\""));
    }

    #[test]
    fn reruns_produce_identical_outputs() {
        let dir = workspace();
        write_history(
            dir.path(),
            "Streaming_History_Audio_2018.json",
            &[
                record("A", "X", 40_000, "spotify:track:1", "2018-01-01T00:00:00Z"),
                record("A", "X", 41_000, "spotify:track:1", "2018-01-02T00:00:00Z"),
                record("B", "Y", 42_000, "spotify:track:2", "2019-01-03T00:00:00Z"),
            ],
        );
        let config = PipelineConfig::from_root(dir.path());

        must(run_pipeline(&config));
        let first = AggregateKind::ALL.map(|kind| read_output(dir.path(), kind.output_name()));
        let second_report = must(run_pipeline(&config));
        let second = AggregateKind::ALL.map(|kind| read_output(dir.path(), kind.output_name()));

        assert_eq!(first, second);
        assert_eq!(second_report.ingest.events, 3);
    }

    #[test]
    fn missing_data_directory_is_input_not_found() {
        let dir = must(tempfile::tempdir().map_err(Into::into));
        must(fs::create_dir(dir.path().join(OUTPUT_DIR_NAME)).map_err(Into::into));

        let err = match run_pipeline(&PipelineConfig::from_root(dir.path())) {
            Ok(_) => panic!("missing data directory must fail"),
            Err(err) => err,
        };
        assert!(matches!(stats_error(&err), StatsError::InputNotFound(_)));
    }

    #[test]
    fn missing_output_directory_fails_unless_creation_requested() {
        let dir = must(tempfile::tempdir().map_err(Into::into));
        must(fs::create_dir(dir.path().join(DATA_DIR_NAME)).map_err(Into::into));
        let mut config = PipelineConfig::from_root(dir.path());

        let err = match run_pipeline(&config) {
            Ok(_) => panic!("missing output directory must fail"),
            Err(err) => err,
        };
        assert!(matches!(stats_error(&err), StatsError::OutputWriteFailure(_)));

        config.create_output_dir = true;
        let report = must(run_pipeline(&config));
        assert_eq!(report.outputs.len(), 4);
        assert!(dir.path().join(OUTPUT_DIR_NAME).join("track_counts.csv").is_file());
    }

    #[test]
    fn malformed_file_aborts_the_run_and_names_the_file() {
        let dir = workspace();
        write_history(
            dir.path(),
            "Streaming_History_Audio_2017_0.json",
            &[record("A", "X", 40_000, "spotify:track:1", "2017-01-01T00:00:00Z")],
        );
        must(
            fs::write(
                dir.path()
                    .join(DATA_DIR_NAME)
                    .join("Streaming_History_Audio_2017_1.json"),
                "[{\"ts\": \"2017-01-02T00:00:00Z\"}]",
            )
            .map_err(Into::into),
        );

        let err = match run_pipeline(&PipelineConfig::from_root(dir.path())) {
            Ok(_) => panic!("malformed file must fail"),
            Err(err) => err,
        };
        match stats_error(&err) {
            StatsError::MalformedRecord(message) => {
                assert!(message.starts_with("Streaming_History_Audio_2017_1.json: element 0"));
            }
            other => panic!("unexpected error kind: {other}"),
        }
        assert!(!dir.path().join(OUTPUT_DIR_NAME).join("track_counts.csv").exists());
    }

    #[test]
    fn run_report_serializes_with_expected_shape() {
        let dir = workspace();
        write_history(
            dir.path(),
            "Streaming_History_Audio_2024.json",
            &[record("A", "X", 40_000, "spotify:track:1", "2024-01-01T00:00:00Z")],
        );

        let report = must(run_pipeline(&PipelineConfig::from_root(dir.path())));
        let value = must(serde_json::to_value(&report).map_err(Into::into));
        assert_eq!(
            value["ingest"],
            json!({
                "files": ["Streaming_History_Audio_2024.json"],
                "events": 1,
                "streams": 1,
                "streams_by_year": {"2024": 1}
            })
        );
        assert_eq!(value["outputs"][0]["name"], json!("track_counts"));
        assert_eq!(value["outputs"][3]["name"], json!("artist_counts_yearly"));
        assert!(value["generated_at"].as_str().is_some_and(|raw| raw.ends_with('Z')));
    }
}
