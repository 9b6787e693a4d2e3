//! Core domain model for the FPL season mirror: table identities, the
//! per-table schema registry, stat column families, and tournament slug
//! classification.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub const CRATE_NAME: &str = "fplm-core";

/// One fetched or persisted row. JSON-valued so the same representation works
/// for remote responses and re-typed CSV cells.
pub type Row = serde_json::Map<String, Value>;

/// An in-memory table: explicit column order plus rows. Rows may omit columns
/// (rendered as empty cells on write).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableData {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
}

impl TableData {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    /// Build a table from rows, deriving the column list from key order of the
    /// first row and appending any columns that only later rows introduce.
    pub fn from_rows(rows: Vec<Row>) -> Self {
        let mut columns: Vec<String> = Vec::new();
        for row in &rows {
            for key in row.keys() {
                if !columns.iter().any(|c| c == key) {
                    columns.push(key.clone());
                }
            }
        }
        Self { columns, rows }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c == name)
    }
}

/// The six remote tables the mirror knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SourceTable {
    Gameweeks,
    Players,
    PlayerStats,
    Teams,
    Matches,
    PlayerMatchStats,
}

impl SourceTable {
    pub const ALL: [SourceTable; 6] = [
        SourceTable::Gameweeks,
        SourceTable::Players,
        SourceTable::PlayerStats,
        SourceTable::Teams,
        SourceTable::Matches,
        SourceTable::PlayerMatchStats,
    ];

    pub fn remote_name(self) -> &'static str {
        match self {
            SourceTable::Gameweeks => "gameweeks",
            SourceTable::Players => "players",
            SourceTable::PlayerStats => "playerstats",
            SourceTable::Teams => "teams",
            SourceTable::Matches => "matches",
            SourceTable::PlayerMatchStats => "playermatchstats",
        }
    }

    pub fn schema(self) -> &'static TableSchema {
        match self {
            SourceTable::Gameweeks => &TableSchema {
                required: &["id", "finished", "is_current"],
                unique_key: &["id"],
            },
            SourceTable::Players => &TableSchema {
                required: &["id"],
                unique_key: &["id"],
            },
            SourceTable::PlayerStats => &TableSchema {
                required: &["id", "gw"],
                unique_key: &["id", "gw"],
            },
            SourceTable::Teams => &TableSchema {
                required: &["id"],
                unique_key: &["id"],
            },
            SourceTable::Matches => &TableSchema {
                required: &["match_id", "gameweek", "finished"],
                unique_key: &["match_id"],
            },
            SourceTable::PlayerMatchStats => &TableSchema {
                required: &["player_id", "match_id"],
                unique_key: &["player_id", "match_id"],
            },
        }
    }
}

/// Declared shape of a persisted table: columns that must be present when the
/// table is admitted, and the key tuple the store dedups on.
#[derive(Debug, Clone, Copy)]
pub struct TableSchema {
    pub required: &'static [&'static str],
    pub unique_key: &'static [&'static str],
}

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("table '{table}' is missing required columns: {missing:?}")]
    Mismatch {
        table: &'static str,
        missing: Vec<String>,
    },
}

/// Consulted once when a fetched table is admitted. Empty tables pass; the
/// pipeline decides separately whether an empty essential table is fatal.
pub fn check_schema(table: SourceTable, data: &TableData) -> Result<(), SchemaError> {
    if data.rows.is_empty() {
        return Ok(());
    }
    let missing: Vec<String> = table
        .schema()
        .required
        .iter()
        .filter(|col| !data.has_column(**col))
        .map(|col| col.to_string())
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(SchemaError::Mismatch {
            table: table.remote_name(),
            missing,
        })
    }
}

/// Identifying columns carried through every derived stats file.
pub const ID_COLS: &[&str] = &["id", "first_name", "second_name", "web_name"];

/// Point-in-time columns: copied verbatim from the current snapshot, never
/// diffed.
pub const SNAPSHOT_COLS: &[&str] = &[
    "status",
    "news",
    "now_cost",
    "selected_by_percent",
    "form",
    "event_points",
    "cost_change_event",
    "transfers_in_event",
    "transfers_out_event",
    "value_form",
    "value_season",
    "ep_next",
    "ep_this",
];

/// Season-to-date running totals: the delta of consecutive snapshots is the
/// gameweek's discrete contribution.
pub const CUMULATIVE_COLS: &[&str] = &[
    "total_points",
    "minutes",
    "goals_scored",
    "assists",
    "clean_sheets",
    "goals_conceded",
    "own_goals",
    "penalties_saved",
    "penalties_missed",
    "yellow_cards",
    "red_cards",
    "saves",
    "starts",
    "bonus",
    "bps",
    "transfers_in",
    "transfers_out",
    "dreamteam_count",
    "expected_goals",
    "expected_assists",
    "expected_goal_involvements",
    "expected_goals_conceded",
    "influence",
    "creativity",
    "threat",
    "ict_index",
];

/// Maps tournament slugs embedded in match ids to display names. Lookup is
/// longest-slug-first so "prem" never matches inside "premier-league".
#[derive(Debug, Clone)]
pub struct SlugTable {
    entries: Vec<(String, String)>,
}

impl SlugTable {
    pub fn new(map: impl IntoIterator<Item = (String, String)>) -> Self {
        let mut entries: Vec<(String, String)> = map.into_iter().collect();
        entries.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then_with(|| a.0.cmp(&b.0)));
        Self { entries }
    }

    /// The known 2025-2026 competition set.
    pub fn default_premier_league() -> Self {
        Self::new([
            ("friendly".to_string(), "Friendlies".to_string()),
            ("premier-league".to_string(), "Premier League".to_string()),
            ("champions-league".to_string(), "Champions League".to_string()),
            ("prem".to_string(), "Premier League".to_string()),
            ("community-shield".to_string(), "Community Shield".to_string()),
            ("uefa-super-cup".to_string(), "Uefa Super Cup".to_string()),
            ("efl-cup".to_string(), "EFL Cup".to_string()),
        ])
    }

    pub fn classify(&self, match_id: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(slug, _)| match_id.contains(slug.as_str()))
            .map(|(slug, _)| slug.as_str())
    }

    pub fn display_name(&self, slug: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(s, _)| s == slug)
            .map(|(_, name)| name.as_str())
    }
}

/// What to do with a match whose id matches no known slug.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnknownSlugPolicy {
    Drop,
    Bucket(String),
}

/// Render a value as a join/dedup key fragment. Null renders empty, which a
/// caller requiring the column should reject before keying on it.
pub fn value_key(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub fn value_as_u32(value: &Value) -> Option<u32> {
    match value {
        Value::Number(n) => n.as_u64().and_then(|v| u32::try_from(v).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub fn value_as_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_i64().map(|v| v != 0),
        Value::String(s) => match s.trim() {
            "true" | "True" | "TRUE" | "1" => Some(true),
            "false" | "False" | "FALSE" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

pub fn value_as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
