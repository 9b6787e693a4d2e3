//! Persisted corpus for the season mirror: the CSV table codec, the keyed
//! merge-upsert, and the season/gameweek/tournament path layout.
//!
//! Files are rewritten whole via a temp-file rename; the upsert is the only
//! mutation primitive, so every write is idempotent under identical input.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use fplm_core::{value_key, Row, TableData};
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

pub const CRATE_NAME: &str = "fplm-store";

pub const MATCHES_FILE: &str = "matches.csv";
pub const FIXTURES_FILE: &str = "fixtures.csv";
pub const PLAYER_MATCH_STATS_FILE: &str = "playermatchstats.csv";
pub const PLAYER_STATS_FILE: &str = "playerstats.csv";
pub const PLAYERS_FILE: &str = "players.csv";
pub const TEAMS_FILE: &str = "teams.csv";
pub const GAMEWEEK_DELTAS_FILE: &str = "player_gameweek_stats.csv";
pub const GAMEWEEK_SUMMARIES_FILE: &str = "gameweek_summaries.csv";

const BY_GAMEWEEK_DIR: &str = "By Gameweek";
const BY_TOURNAMENT_DIR: &str = "By Tournament";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("csv codec on {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("table at {path} has no '{column}' column to key on")]
    MissingKeyColumn { path: PathBuf, column: String },
    #[error("duplicate key {key:?} at {path} under error-on-conflict policy")]
    DuplicateKey { path: PathBuf, key: Vec<String> },
}

/// How the upsert resolves two rows sharing a key tuple. Last-write-wins is
/// the pipeline default; error-on-conflict is for tables where a collision
/// means a caller bug.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictPolicy {
    LastWriteWins,
    ErrorOnConflict,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub written: bool,
    pub inserted: usize,
    pub replaced: usize,
    pub total: usize,
}

/// Read a persisted table. `Ok(None)` when the file does not exist yet.
pub fn read_table(path: &Path) -> Result<Option<TableData>, StoreError> {
    if !path.exists() {
        return Ok(None);
    }
    let mut reader = csv::Reader::from_path(path).map_err(|source| StoreError::Csv {
        path: path.to_path_buf(),
        source,
    })?;
    let columns: Vec<String> = reader
        .headers()
        .map_err(|source| StoreError::Csv {
            path: path.to_path_buf(),
            source,
        })?
        .iter()
        .map(|h| h.to_string())
        .collect();

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|source| StoreError::Csv {
            path: path.to_path_buf(),
            source,
        })?;
        let mut row = Row::new();
        for (column, cell) in columns.iter().zip(record.iter()) {
            row.insert(column.clone(), parse_cell(cell));
        }
        rows.push(row);
    }
    Ok(Some(TableData {
        columns,
        rows,
    }))
}

/// Write a whole table, creating parent directories, via temp file + rename.
pub fn write_table(path: &Path, data: &TableData) -> Result<(), StoreError> {
    let io_err = |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_err)?;
    }

    let temp_path = path.with_extension("csv.tmp");
    {
        let mut writer = csv::Writer::from_path(&temp_path).map_err(|source| StoreError::Csv {
            path: temp_path.clone(),
            source,
        })?;
        let csv_err = |source| StoreError::Csv {
            path: temp_path.clone(),
            source,
        };
        writer.write_record(&data.columns).map_err(csv_err)?;
        for row in &data.rows {
            let record: Vec<String> = data
                .columns
                .iter()
                .map(|column| row.get(column).map(render_cell).unwrap_or_default())
                .collect();
            writer.write_record(&record).map_err(csv_err)?;
        }
        writer.flush().map_err(io_err)?;
    }
    fs::rename(&temp_path, path).map_err(io_err)
}

/// Merge `incoming` into the table at `path`, keyed by `unique_key`.
///
/// Existing rows keep their position and are overwritten in place on key
/// collision (incoming wins); rows with new keys are appended in arrival
/// order. An empty `incoming` leaves the file strictly untouched.
pub fn upsert(
    path: &Path,
    incoming: &TableData,
    unique_key: &[&str],
    policy: ConflictPolicy,
) -> Result<UpsertOutcome, StoreError> {
    if incoming.rows.is_empty() {
        return Ok(UpsertOutcome::default());
    }

    let existing = read_table(path)?.unwrap_or_default();

    let mut columns = existing.columns.clone();
    for column in &incoming.columns {
        if !columns.iter().any(|c| c == column) {
            columns.push(column.clone());
        }
    }
    for key_column in unique_key {
        if !columns.iter().any(|c| c == key_column) {
            return Err(StoreError::MissingKeyColumn {
                path: path.to_path_buf(),
                column: key_column.to_string(),
            });
        }
    }

    let mut index: HashMap<Vec<String>, usize> = HashMap::new();
    let mut merged: Vec<Row> = Vec::new();
    let mut inserted = 0;
    let mut replaced = 0;

    for (row, is_incoming) in existing
        .rows
        .iter()
        .map(|r| (r, false))
        .chain(incoming.rows.iter().map(|r| (r, true)))
    {
        let key = key_tuple(row, unique_key);
        match index.get(&key) {
            Some(&slot) => {
                if policy == ConflictPolicy::ErrorOnConflict {
                    return Err(StoreError::DuplicateKey {
                        path: path.to_path_buf(),
                        key,
                    });
                }
                merged[slot] = row.clone();
                if is_incoming {
                    replaced += 1;
                }
            }
            None => {
                index.insert(key, merged.len());
                merged.push(row.clone());
                if is_incoming {
                    inserted += 1;
                }
            }
        }
    }

    let total = merged.len();
    write_table(
        path,
        &TableData {
            columns,
            rows: merged,
        },
    )?;
    Ok(UpsertOutcome {
        written: true,
        inserted,
        replaced,
        total,
    })
}

fn key_tuple(row: &Row, unique_key: &[&str]) -> Vec<String> {
    unique_key
        .iter()
        .map(|column| row.get(*column).map(value_key).unwrap_or_default())
        .collect()
}

/// Re-type a CSV cell, but only when the canonical rendering round-trips to
/// the original text; anything else stays a string so rewrites are
/// byte-stable.
fn parse_cell(cell: &str) -> Value {
    if cell.is_empty() {
        return Value::Null;
    }
    if let Ok(i) = cell.parse::<i64>() {
        if i.to_string() == cell {
            return Value::from(i);
        }
    }
    if let Ok(f) = cell.parse::<f64>() {
        if f.is_finite() {
            if let Some(n) = serde_json::Number::from_f64(f) {
                if n.to_string() == cell {
                    return Value::Number(n);
                }
            }
        }
    }
    match cell {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        _ => Value::String(cell.to_string()),
    }
}

fn render_cell(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Output locations for one season of the corpus.
#[derive(Debug, Clone)]
pub struct SeasonLayout {
    root: PathBuf,
}

impl SeasonLayout {
    pub fn new(data_dir: impl Into<PathBuf>, season: &str) -> Self {
        Self {
            root: data_dir.into().join(season),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Season-root master file.
    pub fn master(&self, file_name: &str) -> PathBuf {
        self.root.join(file_name)
    }

    pub fn by_gameweek_root(&self) -> PathBuf {
        self.root.join(BY_GAMEWEEK_DIR)
    }

    pub fn by_tournament_root(&self) -> PathBuf {
        self.root.join(BY_TOURNAMENT_DIR)
    }

    pub fn gameweek_dir(&self, gameweek: u32) -> PathBuf {
        self.by_gameweek_root().join(gameweek_dir_name(gameweek))
    }

    pub fn tournament_dir(&self, tournament: &str) -> PathBuf {
        self.by_tournament_root().join(tournament)
    }

    pub fn tournament_gameweek_dir(&self, tournament: &str, gameweek: u32) -> PathBuf {
        self.tournament_dir(tournament).join(gameweek_dir_name(gameweek))
    }
}

pub fn gameweek_dir_name(gameweek: u32) -> String {
    format!("GW{gameweek}")
}

pub fn parse_gameweek_dir(name: &str) -> Option<u32> {
    name.strip_prefix("GW")?.parse().ok()
}

/// Gameweek subdirectories of `dir`, sorted by gameweek id. Directories that
/// do not encode a gameweek number are skipped with a warning.
pub fn list_gameweek_dirs(dir: &Path) -> Result<Vec<(u32, PathBuf)>, StoreError> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let entries = fs::read_dir(dir).map_err(|source| StoreError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    let mut found = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| StoreError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        if !entry.path().is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        match parse_gameweek_dir(&name) {
            Some(gameweek) => found.push((gameweek, entry.path())),
            None => warn!(dir = %dir.display(), %name, "skipping non-gameweek directory"),
        }
    }
    found.sort_by_key(|(gameweek, _)| *gameweek);
    Ok(found)
}

/// Tournament subdirectories of the By Tournament root.
pub fn list_tournament_dirs(dir: &Path) -> Result<Vec<(String, PathBuf)>, StoreError> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let entries = fs::read_dir(dir).map_err(|source| StoreError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    let mut found = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| StoreError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        if entry.path().is_dir() {
            let name = entry.file_name().to_string_lossy().to_string();
            found.push((name, entry.path()));
        }
    }
    found.sort();
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn row(pairs: &[(&str, Value)]) -> Row {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn table(columns: &[&str], rows: Vec<Row>) -> TableData {
        TableData {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            rows,
        }
    }

    #[test]
    fn round_trip_is_byte_stable() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("t.csv");
        let data = table(
            &["id", "name", "pct", "cost", "flag", "blank"],
            vec![row(&[
                ("id", json!(7)),
                ("name", json!("Saka")),
                ("pct", json!("3.50")),
                ("cost", json!(5.5)),
                ("flag", json!(true)),
                ("blank", Value::Null),
            ])],
        );
        write_table(&path, &data).expect("write");
        let first = fs::read(&path).expect("read bytes");
        let reread = read_table(&path).expect("read").expect("exists");
        // "3.50" must survive as a string; 3.5 would change the bytes.
        assert_eq!(reread.rows[0]["pct"], json!("3.50"));
        assert_eq!(reread.rows[0]["id"], json!(7));
        assert_eq!(reread.rows[0]["cost"], json!(5.5));
        assert_eq!(reread.rows[0]["flag"], json!(true));
        assert_eq!(reread.rows[0]["blank"], Value::Null);
        write_table(&path, &reread).expect("rewrite");
        let second = fs::read(&path).expect("read bytes");
        assert_eq!(first, second);
    }

    #[test]
    fn upsert_is_idempotent_on_repeated_identical_input() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("matches.csv");
        let incoming = table(
            &["match_id", "score"],
            vec![
                row(&[("match_id", json!("a")), ("score", json!("1-0"))]),
                row(&[("match_id", json!("b")), ("score", json!("2-2"))]),
            ],
        );
        let first = upsert(&path, &incoming, &["match_id"], ConflictPolicy::LastWriteWins)
            .expect("first upsert");
        assert_eq!((first.inserted, first.replaced, first.total), (2, 0, 2));
        let bytes_first = fs::read(&path).expect("bytes");

        let second = upsert(&path, &incoming, &["match_id"], ConflictPolicy::LastWriteWins)
            .expect("second upsert");
        assert_eq!((second.inserted, second.replaced, second.total), (0, 2, 2));
        assert_eq!(bytes_first, fs::read(&path).expect("bytes"));
    }

    #[test]
    fn incoming_wins_on_key_collision_and_keeps_row_position() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("t.csv");
        let v1 = table(
            &["id", "gw", "pts"],
            vec![
                row(&[("id", json!(1)), ("gw", json!(3)), ("pts", json!(10))]),
                row(&[("id", json!(2)), ("gw", json!(3)), ("pts", json!(4))]),
            ],
        );
        upsert(&path, &v1, &["id", "gw"], ConflictPolicy::LastWriteWins).expect("seed");

        let v2 = table(
            &["id", "gw", "pts"],
            vec![
                row(&[("id", json!(1)), ("gw", json!(3)), ("pts", json!(12))]),
                row(&[("id", json!(3)), ("gw", json!(3)), ("pts", json!(1))]),
            ],
        );
        upsert(&path, &v2, &["id", "gw"], ConflictPolicy::LastWriteWins).expect("update");

        let merged = read_table(&path).expect("read").expect("exists");
        assert_eq!(merged.len(), 3);
        assert_eq!(merged.rows[0]["pts"], json!(12));
        assert_eq!(merged.rows[1]["pts"], json!(4));
        assert_eq!(merged.rows[2]["id"], json!(3));
    }

    #[test]
    fn empty_incoming_is_a_strict_no_op() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("t.csv");
        let seed = table(&["id"], vec![row(&[("id", json!(1))])]);
        upsert(&path, &seed, &["id"], ConflictPolicy::LastWriteWins).expect("seed");
        let before = fs::metadata(&path).expect("meta").modified().expect("mtime");

        let outcome = upsert(
            &path,
            &TableData::default(),
            &["id"],
            ConflictPolicy::LastWriteWins,
        )
        .expect("empty upsert");
        assert!(!outcome.written);
        let after = fs::metadata(&path).expect("meta").modified().expect("mtime");
        assert_eq!(before, after);

        // And no file materializes where none existed.
        let absent = dir.path().join("absent.csv");
        upsert(
            &absent,
            &TableData::default(),
            &["id"],
            ConflictPolicy::LastWriteWins,
        )
        .expect("empty upsert on absent file");
        assert!(!absent.exists());
    }

    #[test]
    fn error_on_conflict_rejects_duplicate_keys() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("t.csv");
        let incoming = table(
            &["id"],
            vec![row(&[("id", json!(1))]), row(&[("id", json!(1))])],
        );
        let err = upsert(&path, &incoming, &["id"], ConflictPolicy::ErrorOnConflict)
            .expect_err("duplicate must error");
        assert!(matches!(err, StoreError::DuplicateKey { .. }));
    }

    #[test]
    fn upsert_rejects_missing_key_column() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("t.csv");
        let incoming = table(&["name"], vec![row(&[("name", json!("x"))])]);
        let err = upsert(&path, &incoming, &["id"], ConflictPolicy::LastWriteWins)
            .expect_err("missing key column must error");
        assert!(matches!(err, StoreError::MissingKeyColumn { .. }));
    }

    #[test]
    fn gameweek_dir_names_parse_back() {
        assert_eq!(parse_gameweek_dir("GW7"), Some(7));
        assert_eq!(parse_gameweek_dir(&gameweek_dir_name(38)), Some(38));
        assert_eq!(parse_gameweek_dir("GWx"), None);
        assert_eq!(parse_gameweek_dir("week7"), None);
    }

    #[test]
    fn listing_skips_unparseable_directories_and_sorts() {
        let dir = tempdir().expect("tempdir");
        for name in ["GW10", "GW2", "notes", "GWabc"] {
            fs::create_dir(dir.path().join(name)).expect("mkdir");
        }
        let found = list_gameweek_dirs(dir.path()).expect("list");
        let ids: Vec<u32> = found.iter().map(|(gw, _)| *gw).collect();
        assert_eq!(ids, vec![2, 10]);
    }

    #[test]
    fn layout_paths_follow_the_corpus_convention() {
        let layout = SeasonLayout::new("/data", "2025-2026");
        assert_eq!(
            layout.gameweek_dir(4),
            PathBuf::from("/data/2025-2026/By Gameweek/GW4")
        );
        assert_eq!(
            layout.tournament_gameweek_dir("Premier League", 4),
            PathBuf::from("/data/2025-2026/By Tournament/Premier League/GW4")
        );
        assert_eq!(
            layout.master(GAMEWEEK_SUMMARIES_FILE),
            PathBuf::from("/data/2025-2026/gameweek_summaries.csv")
        );
    }
}
