#![allow(clippy::missing_errors_doc)]

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use listen_stats_core::{
    ArtistCount, ArtistCountByYear, PlaybackEvent, StatsError, TrackCount, TrackCountByYear,
    MIN_STREAM_MS,
};
use rusqlite::{params, Connection};
use tracing::{debug, info};

pub const TABLE_NAME: &str = "stream_data";

const SCHEMA_STREAM_DATA: &str = r"
DROP TABLE IF EXISTS stream_data;

CREATE TABLE stream_data (
  timestamp TEXT,
  username TEXT,
  platform TEXT,
  ms_played INTEGER,
  conn_country TEXT,
  ip_addr_decrypted TEXT,
  user_agent_decrypted TEXT,
  track_name TEXT,
  artist_name TEXT,
  album_name TEXT,
  spotify_track_uri TEXT,
  episode_name TEXT,
  episode_show_name TEXT,
  spotify_episode_uri TEXT,
  reason_start TEXT,
  reason_end TEXT,
  shuffle INTEGER,
  skipped INTEGER,
  offline INTEGER,
  offline_timestamp TEXT,
  incognito_mode INTEGER
);
";

const INSERT_EVENT: &str = "INSERT INTO stream_data VALUES (
    ?1, ?2, ?3, ?4, ?5, ?6, ?7,
    ?8, ?9, ?10, ?11, ?12, ?13, ?14,
    ?15, ?16, ?17, ?18, ?19, ?20, ?21
 )";

// Every aggregate binds the play threshold as ?1.
const TRACK_COUNTS: &str = "SELECT
    track_name,
    artist_name,
    album_name,
    COUNT(*) AS play_count,
    SUM(ms_played) AS total_ms
 FROM stream_data
 WHERE spotify_track_uri <> '' AND ms_played >= ?1
 GROUP BY track_name, artist_name
 ORDER BY play_count DESC";

const TRACK_COUNTS_BY_YEAR: &str = "SELECT
    STRFTIME('%Y', \"timestamp\") AS \"year\",
    track_name,
    artist_name,
    album_name,
    COUNT(*) AS play_count,
    SUM(ms_played) AS total_ms
 FROM stream_data
 WHERE spotify_track_uri <> '' AND ms_played >= ?1
 GROUP BY track_name, artist_name, \"year\"
 ORDER BY play_count DESC";

const ARTIST_COUNTS: &str = "SELECT
    artist_name,
    COUNT(*) AS play_count,
    SUM(ms_played) AS total_ms
 FROM stream_data
 WHERE spotify_track_uri <> '' AND ms_played >= ?1
 GROUP BY artist_name
 ORDER BY play_count DESC";

const ARTIST_COUNTS_BY_YEAR: &str = "SELECT
    STRFTIME('%Y', \"timestamp\") AS \"year\",
    artist_name,
    COUNT(*) AS play_count,
    SUM(ms_played) AS total_ms
 FROM stream_data
 WHERE spotify_track_uri <> '' AND ms_played >= ?1
 GROUP BY artist_name, \"year\"
 ORDER BY play_count DESC";

const STREAMS_BY_YEAR: &str = "SELECT
    STRFTIME('%Y', \"timestamp\") AS \"year\",
    COUNT(*) AS play_count
 FROM stream_data
 WHERE spotify_track_uri <> '' AND ms_played >= ?1
 GROUP BY \"year\"
 ORDER BY \"year\"";

/// Relational store for playback events, exclusively owned by one run.
pub struct SqliteStreamStore {
    conn: Connection,
}

impl SqliteStreamStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).map_err(|err| {
            anyhow!(StatsError::StorageInitFailure(format!(
                "failed to open sqlite database at {}: {err}",
                path.display()
            )))
        })?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;",
        )
        .map_err(|err| {
            anyhow!(StatsError::StorageInitFailure(format!(
                "failed to configure sqlite database at {}: {err}",
                path.display()
            )))
        })?;

        Ok(Self { conn })
    }

    /// Drops any previous `stream_data` table and recreates it empty.
    pub fn initialize(&self) -> Result<()> {
        self.conn.execute_batch(SCHEMA_STREAM_DATA).map_err(|err| {
            anyhow!(StatsError::StorageInitFailure(format!(
                "failed to create {TABLE_NAME}: {err}"
            )))
        })?;

        info!(table = TABLE_NAME, "initialized record store");
        Ok(())
    }

    /// Appends events in declared column order inside one transaction that
    /// commits only after every row is queued.
    pub fn insert_batch(&mut self, events: &[PlaybackEvent]) -> Result<usize> {
        let tx = self
            .conn
            .transaction()
            .context("failed to start insert transaction")?;

        {
            let mut stmt = tx
                .prepare_cached(INSERT_EVENT)
                .context("failed to prepare insert statement")?;

            for (index, event) in events.iter().enumerate() {
                stmt.execute(params![
                    event.timestamp,
                    event.username,
                    event.platform,
                    event.ms_played,
                    event.conn_country,
                    event.ip_addr_decrypted,
                    event.user_agent_decrypted,
                    event.track_name,
                    event.artist_name,
                    event.album_name,
                    event.spotify_track_uri,
                    event.episode_name,
                    event.episode_show_name,
                    event.spotify_episode_uri,
                    event.reason_start,
                    event.reason_end,
                    event.shuffle,
                    event.skipped,
                    event.offline,
                    event.offline_timestamp,
                    event.incognito_mode,
                ])
                .with_context(|| format!("failed to insert event {index}"))?;
            }
        }

        tx.commit().context("failed to commit insert transaction")?;
        debug!(rows = events.len(), "committed playback events");
        Ok(events.len())
    }

    pub fn count_events(&self) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM stream_data", [], |row| row.get(0))
            .context("failed to count stored events")?;
        usize::try_from(count).with_context(|| format!("invalid event count: {count}"))
    }

    pub fn track_counts(&self) -> Result<Vec<TrackCount>> {
        let mut stmt = self.conn.prepare(TRACK_COUNTS)?;
        let rows = stmt.query_map(params![MIN_STREAM_MS], |row| {
            Ok(TrackCount {
                track_name: row.get(0)?,
                artist_name: row.get(1)?,
                album_name: row.get(2)?,
                play_count: row.get(3)?,
                total_ms: row.get(4)?,
            })
        })?;

        collect_rows(rows).context("failed to query track counts")
    }

    pub fn track_counts_by_year(&self) -> Result<Vec<TrackCountByYear>> {
        let mut stmt = self.conn.prepare(TRACK_COUNTS_BY_YEAR)?;
        let rows = stmt.query_map(params![MIN_STREAM_MS], |row| {
            Ok(TrackCountByYear {
                year: row.get(0)?,
                track_name: row.get(1)?,
                artist_name: row.get(2)?,
                album_name: row.get(3)?,
                play_count: row.get(4)?,
                total_ms: row.get(5)?,
            })
        })?;

        collect_rows(rows).context("failed to query yearly track counts")
    }

    pub fn artist_counts(&self) -> Result<Vec<ArtistCount>> {
        let mut stmt = self.conn.prepare(ARTIST_COUNTS)?;
        let rows = stmt.query_map(params![MIN_STREAM_MS], |row| {
            Ok(ArtistCount {
                artist_name: row.get(0)?,
                play_count: row.get(1)?,
                total_ms: row.get(2)?,
            })
        })?;

        collect_rows(rows).context("failed to query artist counts")
    }

    pub fn artist_counts_by_year(&self) -> Result<Vec<ArtistCountByYear>> {
        let mut stmt = self.conn.prepare(ARTIST_COUNTS_BY_YEAR)?;
        let rows = stmt.query_map(params![MIN_STREAM_MS], |row| {
            Ok(ArtistCountByYear {
                year: row.get(0)?,
                artist_name: row.get(1)?,
                play_count: row.get(2)?,
                total_ms: row.get(3)?,
            })
        })?;

        collect_rows(rows).context("failed to query yearly artist counts")
    }

    /// Counts qualifying plays per calendar year, using the same year
    /// extraction as the yearly aggregates. Plays without a parseable
    /// timestamp are left out.
    pub fn streams_by_year(&self) -> Result<BTreeMap<String, usize>> {
        let mut stmt = self.conn.prepare(STREAMS_BY_YEAR)?;
        let rows = stmt.query_map(params![MIN_STREAM_MS], |row| {
            Ok((row.get::<_, Option<String>>(0)?, row.get::<_, i64>(1)?))
        })?;

        let mut by_year = BTreeMap::new();
        for (year, count) in collect_rows(rows).context("failed to query streams by year")? {
            let Some(year) = year else {
                continue;
            };
            let count = usize::try_from(count)
                .with_context(|| format!("invalid stream count for {year}: {count}"))?;
            by_year.insert(year, count);
        }
        Ok(by_year)
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}
