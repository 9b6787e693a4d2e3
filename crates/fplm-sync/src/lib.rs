//! The incremental synchronization engine: resume-floor tracking, per-period
//! lifecycle gating, discrete stat derivation, and the orchestrating
//! [`SyncPipeline`] that drives one run against the remote season database.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use fplm_core::{
    value_as_bool, value_as_f64, value_as_u32, value_key, Row, SlugTable, SourceTable, TableData,
    UnknownSlugPolicy, CUMULATIVE_COLS, ID_COLS, SNAPSHOT_COLS,
};
use fplm_source::{Filter, RestSource, SourceClientConfig, TableSource, DEFAULT_BATCH_SIZE};
use fplm_store::{self as store, ConflictPolicy, SeasonLayout};
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "fplm-sync";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub source_url: String,
    pub source_key: String,
    pub season: String,
    pub data_dir: PathBuf,
    pub batch_size: usize,
    pub slug_table: SlugTable,
    pub unknown_slug_policy: UnknownSlugPolicy,
    pub excluded_slugs: Vec<String>,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            source_url: std::env::var("SUPABASE_URL").unwrap_or_default(),
            source_key: std::env::var("SUPABASE_KEY").unwrap_or_default(),
            season: std::env::var("FPLM_SEASON").unwrap_or_else(|_| "2025-2026".to_string()),
            data_dir: std::env::var("FPLM_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data")),
            batch_size: std::env::var("FPLM_BATCH_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_BATCH_SIZE),
            slug_table: SlugTable::default_premier_league(),
            unknown_slug_policy: match std::env::var("FPLM_UNKNOWN_SLUG_BUCKET") {
                Ok(name) if !name.is_empty() => UnknownSlugPolicy::Bucket(name),
                _ => UnknownSlugPolicy::Drop,
            },
            excluded_slugs: vec!["friendly".to_string()],
        }
    }
}

/// Lowest gameweek that must be (re-)fetched this run: one past the highest
/// gameweek the *local* summary file records as finished, or 1 for a fresh
/// season. The local file is the checkpoint; the remote is never consulted
/// for this, so reruns stay idempotent under partial remote updates.
pub fn resume_point(local_summary: Option<&TableData>) -> u32 {
    let highest_finished = local_summary
        .map(|summary| {
            summary
                .rows
                .iter()
                .filter(|row| {
                    row.get("finished")
                        .and_then(value_as_bool)
                        .unwrap_or(false)
                })
                .filter_map(|row| row.get("id").and_then(value_as_u32))
                .max()
                .unwrap_or(0)
        })
        .unwrap_or(0);
    highest_finished + 1
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeriodState {
    Active,
    Frozen,
}

/// Output classes with different freeze behavior. Volatile snapshots capture
/// "the world as of this period" and must not change once the period is
/// final; final outputs are already-discrete facts and stay upsertable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    Volatile,
    Final,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WritePolicy {
    Overwrite,
    CreateOnly,
}

/// Per-gameweek lifecycle state, built once per run from the remote gameweek
/// table. `finished` is monotonic upstream, so Active -> Frozen is one-way.
#[derive(Debug, Clone)]
pub struct LifecycleGate {
    states: BTreeMap<u32, PeriodState>,
}

impl LifecycleGate {
    pub fn from_gameweeks(gameweeks: &TableData) -> Self {
        let mut states = BTreeMap::new();
        for row in &gameweeks.rows {
            let Some(id) = row.get("id").and_then(value_as_u32) else {
                warn!("gameweek row with unparseable id skipped");
                continue;
            };
            let finished = row
                .get("finished")
                .and_then(value_as_bool)
                .unwrap_or(false);
            states.insert(
                id,
                if finished {
                    PeriodState::Frozen
                } else {
                    PeriodState::Active
                },
            );
        }
        Self { states }
    }

    /// `None` means the gameweek is unknown to the remote summary; callers
    /// must skip it, never assume a state.
    pub fn state(&self, gameweek: u32) -> Option<PeriodState> {
        self.states.get(&gameweek).copied()
    }

    pub fn write_policy(&self, gameweek: u32, kind: OutputKind) -> Option<WritePolicy> {
        Some(match (self.state(gameweek)?, kind) {
            (PeriodState::Active, _) => WritePolicy::Overwrite,
            (PeriodState::Frozen, OutputKind::Volatile) => WritePolicy::CreateOnly,
            (PeriodState::Frozen, OutputKind::Final) => WritePolicy::Overwrite,
        })
    }

    pub fn latest(&self) -> Option<u32> {
        self.states.keys().max().copied()
    }
}

/// Discrete per-gameweek stats from two consecutive cumulative snapshots.
///
/// Left-joins `previous` on `id` with a zero baseline for absent rows.
/// Cumulative columns are diffed (negative results pass through as upstream
/// corrections); id and snapshot columns are copied verbatim from `current`.
/// Output rows are exactly the ids present in `current`.
pub fn derive_deltas(current: &TableData, previous: Option<&TableData>) -> TableData {
    let columns: Vec<String> = ID_COLS
        .iter()
        .chain(SNAPSHOT_COLS)
        .chain(CUMULATIVE_COLS)
        .filter(|c| current.has_column(**c))
        .map(|c| c.to_string())
        .collect();

    let previous_by_id: HashMap<String, &Row> = previous
        .map(|p| {
            p.rows
                .iter()
                .filter_map(|row| row.get("id").map(|v| (value_key(v), row)))
                .collect()
        })
        .unwrap_or_default();

    let rows = current
        .rows
        .iter()
        .map(|row| {
            let prev = row
                .get("id")
                .and_then(|v| previous_by_id.get(&value_key(v)))
                .copied();
            let mut out = Row::new();
            for column in &columns {
                let value = if CUMULATIVE_COLS.contains(&column.as_str()) {
                    diff_values(row.get(column), prev.and_then(|p| p.get(column)))
                } else {
                    row.get(column).cloned().unwrap_or(Value::Null)
                };
                out.insert(column.clone(), value);
            }
            out
        })
        .collect();

    TableData { columns, rows }
}

fn diff_values(current: Option<&Value>, previous: Option<&Value>) -> Value {
    if let (Some(c), Some(p)) = (as_integer(current), as_integer(previous)) {
        return Value::from(c - p);
    }
    let c = current.and_then(value_as_f64).unwrap_or(0.0);
    let p = previous.and_then(value_as_f64).unwrap_or(0.0);
    // Source stats carry at most a few decimal places; rounding keeps the
    // difference free of binary float dust in the persisted file.
    let delta = ((c - p) * 1e6).round() / 1e6;
    serde_json::Number::from_f64(delta)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

fn as_integer(value: Option<&Value>) -> Option<i64> {
    match value {
        None | Some(Value::Null) => Some(0),
        Some(Value::Number(n)) => n.as_i64(),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    }
}

#[derive(Debug, Clone)]
struct MatchRecord {
    row: Row,
    match_id: String,
    gameweek: u32,
    tournament: String,
}

/// Classify fetched matches into (gameweek, tournament) coordinates, applying
/// the exclusion and unknown-slug policies. Gameweek-0 matches and excluded
/// competitions are dropped; unparseable rows are skipped with a warning.
fn classify_matches(config: &SyncConfig, matches: &TableData) -> (Vec<MatchRecord>, usize) {
    let mut records = Vec::new();
    let mut dropped = 0;
    for row in &matches.rows {
        let match_id = row.get("match_id").map(value_key).unwrap_or_default();
        if match_id.is_empty() {
            warn!("match row without a match_id skipped");
            dropped += 1;
            continue;
        }
        let Some(gameweek) = row.get("gameweek").and_then(value_as_u32) else {
            warn!(%match_id, "match with unparseable gameweek skipped");
            dropped += 1;
            continue;
        };
        // GW0 is pre-season; it has no row in the gameweeks table.
        if gameweek == 0 {
            dropped += 1;
            continue;
        }
        let tournament = match config.slug_table.classify(&match_id) {
            Some(slug) if config.excluded_slugs.iter().any(|e| e == slug) => {
                dropped += 1;
                continue;
            }
            Some(slug) => config
                .slug_table
                .display_name(slug)
                .unwrap_or(slug)
                .to_string(),
            None => match &config.unknown_slug_policy {
                UnknownSlugPolicy::Drop => {
                    dropped += 1;
                    continue;
                }
                UnknownSlugPolicy::Bucket(name) => name.clone(),
            },
        };
        let mut row = row.clone();
        row.insert(
            "tournament".to_string(),
            Value::String(tournament.clone()),
        );
        records.push(MatchRecord {
            row,
            match_id,
            gameweek,
            tournament,
        });
    }
    (records, dropped)
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub resume_from: u32,
    pub latest_gameweek: u32,
    pub rows_fetched: BTreeMap<&'static str, usize>,
    pub matches_dropped: usize,
    pub gameweeks_processed: usize,
    pub gameweeks_skipped: usize,
    pub files_written: usize,
}

pub struct SyncPipeline<S> {
    config: SyncConfig,
    source: S,
    layout: SeasonLayout,
}

impl<S: TableSource> SyncPipeline<S> {
    pub fn new(config: SyncConfig, source: S) -> Self {
        let layout = SeasonLayout::new(&config.data_dir, &config.season);
        Self {
            config,
            source,
            layout,
        }
    }

    pub fn layout(&self) -> &SeasonLayout {
        &self.layout
    }

    /// One linear pass: fetch, classify, gate, persist, derive. Essential
    /// table failures abort before any master write; per-gameweek problems
    /// are logged and skipped.
    pub async fn run_once(&self) -> Result<RunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        info!(%run_id, season = %self.config.season, "starting sync run");

        let local_summary = store::read_table(&self.layout.master(store::GAMEWEEK_SUMMARIES_FILE))
            .context("reading local gameweek summary checkpoint")?;
        let resume_from = resume_point(local_summary.as_ref());
        info!(resume_from, "resume floor from local checkpoint");

        let gameweeks = self
            .fetch_essential(SourceTable::Gameweeks, &Filter::All)
            .await?;
        let players = self
            .fetch_essential(SourceTable::Players, &Filter::All)
            .await?;
        let teams = self.fetch_essential(SourceTable::Teams, &Filter::All).await?;
        let playerstats = self
            .source
            .fetch(
                SourceTable::PlayerStats,
                &Filter::gte("gw", i64::from(resume_from)),
            )
            .await
            .context("fetching 'playerstats'")?;
        let matches = self
            .source
            .fetch(
                SourceTable::Matches,
                &Filter::gte("gameweek", i64::from(resume_from)),
            )
            .await
            .context("fetching 'matches'")?;

        let (records, matches_dropped) = classify_matches(&self.config, &matches);
        info!(
            retained = records.len(),
            dropped = matches_dropped,
            "classified matches"
        );

        let match_ids: Vec<String> = records
            .iter()
            .map(|r| r.match_id.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let playermatchstats = if match_ids.is_empty() {
            TableData::default()
        } else {
            match self
                .source
                .fetch(
                    SourceTable::PlayerMatchStats,
                    &Filter::within("match_id", match_ids),
                )
                .await
            {
                Ok(data) => data,
                Err(err) => {
                    warn!(error = %err, "playermatchstats fetch failed; continuing with empty table");
                    TableData::default()
                }
            }
        };

        let mut rows_fetched = BTreeMap::new();
        rows_fetched.insert("gameweeks", gameweeks.len());
        rows_fetched.insert("players", players.len());
        rows_fetched.insert("teams", teams.len());
        rows_fetched.insert("playerstats", playerstats.len());
        rows_fetched.insert("matches", matches.len());
        rows_fetched.insert("playermatchstats", playermatchstats.len());

        // Master reference tables are upserted unconditionally every run,
        // independent of any gameweek's lifecycle state.
        let mut files_written = 0;
        files_written += self.master_upsert(store::PLAYERS_FILE, &players, SourceTable::Players)?;
        files_written += self.master_upsert(store::TEAMS_FILE, &teams, SourceTable::Teams)?;
        files_written +=
            self.master_upsert(store::PLAYER_STATS_FILE, &playerstats, SourceTable::PlayerStats)?;
        files_written += self.master_upsert(
            store::GAMEWEEK_SUMMARIES_FILE,
            &gameweeks,
            SourceTable::Gameweeks,
        )?;

        let gate = LifecycleGate::from_gameweeks(&gameweeks);
        let latest_gameweek = gate.latest().unwrap_or(0);

        let mut gameweeks_processed = 0;
        let mut gameweeks_skipped = 0;
        for gameweek in resume_from..=latest_gameweek {
            if gate.state(gameweek).is_none() {
                warn!(gameweek, "gameweek absent from remote summary; skipping");
                gameweeks_skipped += 1;
                continue;
            }

            let gw_records: Vec<&MatchRecord> =
                records.iter().filter(|r| r.gameweek == gameweek).collect();
            let gw_matches =
                TableData::from_rows(gw_records.iter().map(|r| r.row.clone()).collect());
            let gw_stats = filter_rows(&playerstats, |row| {
                row.get("gw").and_then(value_as_u32) == Some(gameweek)
            });
            let gw_ids: BTreeSet<&str> = gw_records.iter().map(|r| r.match_id.as_str()).collect();
            let gw_pms = filter_rows(&playermatchstats, |row| {
                row.get("match_id")
                    .map(value_key)
                    .is_some_and(|id| gw_ids.contains(id.as_str()))
            });

            files_written += self.write_period_tables(
                &self.layout.gameweek_dir(gameweek),
                gameweek,
                &gate,
                &gw_matches,
                &gw_pms,
                &gw_stats,
                &players,
                &teams,
            )?;

            let mut by_tournament: BTreeMap<&str, Vec<&MatchRecord>> = BTreeMap::new();
            for record in &gw_records {
                by_tournament
                    .entry(record.tournament.as_str())
                    .or_default()
                    .push(*record);
            }
            for (tournament, t_records) in by_tournament {
                let t_matches =
                    TableData::from_rows(t_records.iter().map(|r| r.row.clone()).collect());
                let t_ids: BTreeSet<&str> =
                    t_records.iter().map(|r| r.match_id.as_str()).collect();
                let t_pms = filter_rows(&playermatchstats, |row| {
                    row.get("match_id")
                        .map(value_key)
                        .is_some_and(|id| t_ids.contains(id.as_str()))
                });
                files_written += self.write_period_tables(
                    &self.layout.tournament_gameweek_dir(tournament, gameweek),
                    gameweek,
                    &gate,
                    &t_matches,
                    &t_pms,
                    &gw_stats,
                    &players,
                    &teams,
                )?;
            }
            gameweeks_processed += 1;
        }

        files_written += self.derive_and_write_deltas(&gate, resume_from)?;

        let finished_at = Utc::now();
        let summary = RunSummary {
            run_id,
            started_at,
            finished_at,
            resume_from,
            latest_gameweek,
            rows_fetched,
            matches_dropped,
            gameweeks_processed,
            gameweeks_skipped,
            files_written,
        };
        info!(
            gameweeks = summary.gameweeks_processed,
            skipped = summary.gameweeks_skipped,
            files = summary.files_written,
            "sync run complete"
        );
        Ok(summary)
    }

    async fn fetch_essential(&self, table: SourceTable, filter: &Filter) -> Result<TableData> {
        let data = self
            .source
            .fetch(table, filter)
            .await
            .with_context(|| format!("fetching '{}'", table.remote_name()))?;
        anyhow::ensure!(
            !data.is_empty(),
            "essential table '{}' returned no rows",
            table.remote_name()
        );
        Ok(data)
    }

    fn master_upsert(
        &self,
        file_name: &str,
        data: &TableData,
        table: SourceTable,
    ) -> Result<usize> {
        let path = self.layout.master(file_name);
        let outcome = store::upsert(
            &path,
            data,
            table.schema().unique_key,
            ConflictPolicy::LastWriteWins,
        )
        .with_context(|| format!("upserting master file {}", path.display()))?;
        Ok(usize::from(outcome.written))
    }

    #[allow(clippy::too_many_arguments)]
    fn write_period_tables(
        &self,
        dir: &std::path::Path,
        gameweek: u32,
        gate: &LifecycleGate,
        matches: &TableData,
        playermatchstats: &TableData,
        playerstats: &TableData,
        players: &TableData,
        teams: &TableData,
    ) -> Result<usize> {
        let mut written = 0;
        written += self.write_gated(
            gate,
            gameweek,
            OutputKind::Final,
            &dir.join(store::MATCHES_FILE),
            matches,
            SourceTable::Matches.schema().unique_key,
        )?;
        written += self.write_gated(
            gate,
            gameweek,
            OutputKind::Final,
            &dir.join(store::PLAYER_MATCH_STATS_FILE),
            playermatchstats,
            SourceTable::PlayerMatchStats.schema().unique_key,
        )?;
        written += self.write_gated(
            gate,
            gameweek,
            OutputKind::Volatile,
            &dir.join(store::FIXTURES_FILE),
            matches,
            SourceTable::Matches.schema().unique_key,
        )?;
        written += self.write_gated(
            gate,
            gameweek,
            OutputKind::Volatile,
            &dir.join(store::PLAYERS_FILE),
            players,
            SourceTable::Players.schema().unique_key,
        )?;
        written += self.write_gated(
            gate,
            gameweek,
            OutputKind::Volatile,
            &dir.join(store::TEAMS_FILE),
            teams,
            SourceTable::Teams.schema().unique_key,
        )?;
        written += self.write_gated(
            gate,
            gameweek,
            OutputKind::Volatile,
            &dir.join(store::PLAYER_STATS_FILE),
            playerstats,
            SourceTable::PlayerStats.schema().unique_key,
        )?;
        Ok(written)
    }

    fn write_gated(
        &self,
        gate: &LifecycleGate,
        gameweek: u32,
        kind: OutputKind,
        path: &std::path::Path,
        data: &TableData,
        unique_key: &[&str],
    ) -> Result<usize> {
        let Some(policy) = gate.write_policy(gameweek, kind) else {
            return Ok(0);
        };
        if policy == WritePolicy::CreateOnly && path.exists() {
            return Ok(0);
        }
        let outcome = store::upsert(path, data, unique_key, ConflictPolicy::LastWriteWins)
            .with_context(|| format!("upserting {}", path.display()))?;
        Ok(usize::from(outcome.written))
    }

    /// Walk the persisted cumulative snapshots and write the discrete
    /// per-gameweek stats file into every gameweek directory at or above the
    /// resume floor. A missing previous snapshot skips that directory only.
    fn derive_and_write_deltas(&self, gate: &LifecycleGate, resume_from: u32) -> Result<usize> {
        let mut written = 0;

        let gw_dirs = store::list_gameweek_dirs(&self.layout.by_gameweek_root())?;
        for (i, (gameweek, dir)) in gw_dirs.iter().enumerate() {
            if *gameweek < resume_from {
                continue;
            }
            if gate.state(*gameweek).is_none() {
                warn!(gameweek = *gameweek, "gameweek absent from remote summary; skipping delta");
                continue;
            }
            let Some(current) = store::read_table(&dir.join(store::PLAYER_STATS_FILE))? else {
                warn!(gameweek = *gameweek, "cumulative snapshot missing; skipping delta");
                continue;
            };
            let previous = if i == 0 {
                None
            } else {
                let (_, prev_dir) = &gw_dirs[i - 1];
                match store::read_table(&prev_dir.join(store::PLAYER_STATS_FILE))? {
                    Some(prev) => Some(prev),
                    None => {
                        warn!(gameweek = *gameweek, "previous cumulative snapshot missing; skipping delta");
                        continue;
                    }
                }
            };
            let deltas = derive_deltas(&current, previous.as_ref());
            written += self.write_gated(
                gate,
                *gameweek,
                OutputKind::Final,
                &dir.join(store::GAMEWEEK_DELTAS_FILE),
                &deltas,
                &["id"],
            )?;
        }

        // Tournament trees baseline against the main By Gameweek snapshots,
        // since a competition's first gameweek is rarely GW1.
        for (tournament, t_dir) in store::list_tournament_dirs(&self.layout.by_tournament_root())? {
            for (gameweek, dir) in store::list_gameweek_dirs(&t_dir)? {
                if gameweek < resume_from {
                    continue;
                }
                if gate.state(gameweek).is_none() {
                    warn!(
                        %tournament,
                        gameweek, "gameweek absent from remote summary; skipping delta"
                    );
                    continue;
                }
                let Some(current) = store::read_table(&dir.join(store::PLAYER_STATS_FILE))? else {
                    warn!(%tournament, gameweek, "cumulative snapshot missing; skipping delta");
                    continue;
                };
                let previous = if gameweek == 1 {
                    None
                } else {
                    let prev_path = self
                        .layout
                        .gameweek_dir(gameweek - 1)
                        .join(store::PLAYER_STATS_FILE);
                    match store::read_table(&prev_path)? {
                        Some(prev) => Some(prev),
                        None => {
                            warn!(
                                %tournament,
                                gameweek, "baseline snapshot missing; skipping delta"
                            );
                            continue;
                        }
                    }
                };
                let deltas = derive_deltas(&current, previous.as_ref());
                written += self.write_gated(
                    gate,
                    gameweek,
                    OutputKind::Final,
                    &dir.join(store::GAMEWEEK_DELTAS_FILE),
                    &deltas,
                    &["id"],
                )?;
            }
        }
        Ok(written)
    }
}

fn filter_rows(data: &TableData, keep: impl Fn(&Row) -> bool) -> TableData {
    TableData {
        columns: data.columns.clone(),
        rows: data.rows.iter().filter(|row| keep(row)).cloned().collect(),
    }
}

/// Entry point used by the CLI: env config, real REST source, one run.
pub async fn run_sync_once_from_env() -> Result<RunSummary> {
    let config = SyncConfig::from_env();
    anyhow::ensure!(!config.source_url.is_empty(), "SUPABASE_URL must be set");
    anyhow::ensure!(!config.source_key.is_empty(), "SUPABASE_KEY must be set");

    let mut source_config = SourceClientConfig::new(&config.source_url, &config.source_key);
    source_config.batch_size = config.batch_size;
    let source = RestSource::new(source_config)?;
    SyncPipeline::new(config, source).run_once().await
}
