use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Number, Value};
use time::format_description::well_known::Rfc3339;
use time::{OffsetDateTime, UtcOffset};

/// File-name prefix of streaming history documents inside the data directory.
pub const HISTORY_FILE_PREFIX: &str = "Streaming_History_Audio_";
pub const HISTORY_FILE_SUFFIX: &str = ".json";

/// A play only counts once it has been listened to for at least this long.
pub const MIN_STREAM_MS: i64 = 30_000;

/// Store columns in declared order. Rows are always bound positionally in
/// this order.
pub const COLUMNS: [&str; 21] = [
    "timestamp",
    "username",
    "platform",
    "ms_played",
    "conn_country",
    "ip_addr_decrypted",
    "user_agent_decrypted",
    "track_name",
    "artist_name",
    "album_name",
    "spotify_track_uri",
    "episode_name",
    "episode_show_name",
    "spotify_episode_uri",
    "reason_start",
    "reason_end",
    "shuffle",
    "skipped",
    "offline",
    "offline_timestamp",
    "incognito_mode",
];

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum StatsError {
    #[error("input not found: {0}")]
    InputNotFound(String),
    #[error("malformed record: {0}")]
    MalformedRecord(String),
    #[error("storage initialization failed: {0}")]
    StorageInitFailure(String),
    #[error("output write failed: {0}")]
    OutputWriteFailure(String),
}

/// One playback event as it appears in a streaming history document.
///
/// Keys are matched by name. Each column also accepts the native key used by
/// the streaming export (`ts`, `master_metadata_track_name`, ...). Values are
/// coerced the way the store's column types would coerce them; flags are
/// kept as 0/1 integers.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct PlaybackEvent {
    #[serde(alias = "ts", deserialize_with = "scalar_text")]
    pub timestamp: Option<String>,
    #[serde(deserialize_with = "scalar_text")]
    pub username: Option<String>,
    #[serde(deserialize_with = "scalar_text")]
    pub platform: Option<String>,
    #[serde(deserialize_with = "scalar_integer")]
    pub ms_played: Option<i64>,
    #[serde(deserialize_with = "scalar_text")]
    pub conn_country: Option<String>,
    #[serde(alias = "ip_addr", deserialize_with = "scalar_text")]
    pub ip_addr_decrypted: Option<String>,
    #[serde(alias = "user_agent", deserialize_with = "scalar_text")]
    pub user_agent_decrypted: Option<String>,
    #[serde(alias = "master_metadata_track_name", deserialize_with = "scalar_text")]
    pub track_name: Option<String>,
    #[serde(
        alias = "master_metadata_album_artist_name",
        deserialize_with = "scalar_text"
    )]
    pub artist_name: Option<String>,
    #[serde(
        alias = "master_metadata_album_album_name",
        deserialize_with = "scalar_text"
    )]
    pub album_name: Option<String>,
    #[serde(deserialize_with = "scalar_text")]
    pub spotify_track_uri: Option<String>,
    #[serde(deserialize_with = "scalar_text")]
    pub episode_name: Option<String>,
    #[serde(deserialize_with = "scalar_text")]
    pub episode_show_name: Option<String>,
    #[serde(deserialize_with = "scalar_text")]
    pub spotify_episode_uri: Option<String>,
    #[serde(deserialize_with = "scalar_text")]
    pub reason_start: Option<String>,
    #[serde(deserialize_with = "scalar_text")]
    pub reason_end: Option<String>,
    #[serde(deserialize_with = "scalar_integer")]
    pub shuffle: Option<i64>,
    #[serde(deserialize_with = "scalar_integer")]
    pub skipped: Option<i64>,
    #[serde(deserialize_with = "scalar_integer")]
    pub offline: Option<i64>,
    #[serde(deserialize_with = "scalar_text")]
    pub offline_timestamp: Option<String>,
    #[serde(deserialize_with = "scalar_integer")]
    pub incognito_mode: Option<i64>,
}

impl PlaybackEvent {
    /// Whether this event counts as a real music play: it has a track URI and
    /// was listened to for at least [`MIN_STREAM_MS`].
    #[must_use]
    pub fn is_stream(&self) -> bool {
        self.spotify_track_uri
            .as_deref()
            .is_some_and(|uri| !uri.is_empty())
            && self.ms_played.is_some_and(|ms| ms >= MIN_STREAM_MS)
    }
}

// Text columns take any JSON scalar; numbers and booleans are stored in their
// textual form the way a TEXT column would coerce them.
fn scalar_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(None),
        Value::String(text) => Ok(Some(text)),
        Value::Number(number) => Ok(Some(number.to_string())),
        Value::Bool(flag) => Ok(Some(if flag { "1" } else { "0" }.to_string())),
        Value::Array(_) | Value::Object(_) => Err(serde::de::Error::custom(
            "expected a scalar value for a text column",
        )),
    }
}

// Integer columns take booleans (as 0/1), integer-valued numbers and integer
// strings. Fractional or non-numeric values are rejected: totals are summed
// as integer milliseconds.
fn scalar_integer<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(None),
        Value::Bool(flag) => Ok(Some(i64::from(flag))),
        Value::Number(number) => integer_from_number(&number).map(Some).ok_or_else(|| {
            serde::de::Error::custom(format!("expected an integer value, got {number}"))
        }),
        Value::String(text) => text.trim().parse::<i64>().map(Some).map_err(|_| {
            serde::de::Error::custom(format!("expected an integer value, got {text:?}"))
        }),
        Value::Array(_) | Value::Object(_) => Err(serde::de::Error::custom(
            "expected a scalar value for an integer column",
        )),
    }
}

#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::float_cmp
)]
fn integer_from_number(number: &Number) -> Option<i64> {
    if let Some(value) = number.as_i64() {
        return Some(value);
    }

    // i64::MAX as f64 rounds up to 2^63, so the upper bound is exclusive.
    let value = number.as_f64()?;
    if value.fract() == 0.0 && value >= i64::MIN as f64 && value < i64::MAX as f64 {
        Some(value as i64)
    } else {
        None
    }
}

/// Aggregation shapes computed over the stored events.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AggregateKind {
    TrackCounts,
    TrackCountsByYear,
    ArtistCounts,
    ArtistCountsByYear,
}

impl AggregateKind {
    pub const ALL: [Self; 4] = [
        Self::TrackCounts,
        Self::TrackCountsByYear,
        Self::ArtistCounts,
        Self::ArtistCountsByYear,
    ];

    /// Base name of the exported file for this aggregate.
    #[must_use]
    pub fn output_name(self) -> &'static str {
        match self {
            Self::TrackCounts => "track_counts",
            Self::TrackCountsByYear => "track_counts_yearly",
            Self::ArtistCounts => "artist_counts",
            Self::ArtistCountsByYear => "artist_counts_yearly",
        }
    }

    #[must_use]
    pub fn header(self) -> &'static [&'static str] {
        match self {
            Self::TrackCounts => &[
                "track_name",
                "artist_name",
                "album_name",
                "play_count",
                "total_ms",
            ],
            Self::TrackCountsByYear => &[
                "year",
                "track_name",
                "artist_name",
                "album_name",
                "play_count",
                "total_ms",
            ],
            Self::ArtistCounts => &["artist_name", "play_count", "total_ms"],
            Self::ArtistCountsByYear => &["year", "artist_name", "play_count", "total_ms"],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TrackCount {
    pub track_name: Option<String>,
    pub artist_name: Option<String>,
    /// Taken from an arbitrary row of the group; album is not part of the key.
    pub album_name: Option<String>,
    pub play_count: i64,
    pub total_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TrackCountByYear {
    pub year: Option<String>,
    pub track_name: Option<String>,
    pub artist_name: Option<String>,
    pub album_name: Option<String>,
    pub play_count: i64,
    pub total_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArtistCount {
    pub artist_name: Option<String>,
    pub play_count: i64,
    pub total_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArtistCountByYear {
    pub year: Option<String>,
    pub artist_name: Option<String>,
    pub play_count: i64,
    pub total_ms: i64,
}

#[must_use]
pub fn is_history_file(file_name: &str) -> bool {
    file_name.starts_with(HISTORY_FILE_PREFIX) && file_name.ends_with(HISTORY_FILE_SUFFIX)
}

/// Parses one streaming history document: a JSON array of 21-key objects.
///
/// # Errors
/// Returns [`StatsError::MalformedRecord`] when the document is not valid
/// UTF-8 JSON, is not an array, or any element is not an object with exactly
/// the expected keys and scalar values.
pub fn parse_history_document(raw: &[u8]) -> Result<Vec<PlaybackEvent>, StatsError> {
    let document: Value = serde_json::from_slice(raw)
        .map_err(|err| StatsError::MalformedRecord(format!("invalid JSON: {err}")))?;

    let Value::Array(elements) = document else {
        return Err(StatsError::MalformedRecord(
            "document MUST be a JSON array of objects".to_string(),
        ));
    };

    let mut events = Vec::with_capacity(elements.len());
    for (index, element) in elements.into_iter().enumerate() {
        let Value::Object(fields) = element else {
            return Err(StatsError::MalformedRecord(format!(
                "element {index} is not an object"
            )));
        };

        if fields.len() != COLUMNS.len() {
            return Err(StatsError::MalformedRecord(format!(
                "element {index} has {} fields, expected {}",
                fields.len(),
                COLUMNS.len()
            )));
        }

        let event = serde_json::from_value::<PlaybackEvent>(Value::Object(fields))
            .map_err(|err| StatsError::MalformedRecord(format!("element {index}: {err}")))?;
        events.push(event);
    }

    Ok(events)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`time::error::Format`] when the value cannot be rendered.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, time::error::Format> {
    value.to_offset(UtcOffset::UTC).format(&Rfc3339)
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}
