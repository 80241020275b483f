#![allow(clippy::missing_errors_doc)]
#![allow(clippy::uninlined_format_args)]

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use ppc_impact_core::{
    build_summary, evaluate_account, format_date, format_rfc3339, now_utc, parse_date,
    parse_rfc3339_utc, window_for, Action, ActionId, ActionInput, ActionType, Baseline, Horizon,
    ImpactRecord, ImpactRuleset, ImpactSummary, MeasurementWindow, PerformanceRow, Quadrant,
    ValidationOutcome, ValidationResult,
};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use time::Date;

const IMPACT_MIGRATION_VERSION: i64 = 1;

const SCHEMA_IMPACT_V1: &str = r"
CREATE TABLE IF NOT EXISTS impact_rulesets (
  ruleset_version INTEGER PRIMARY KEY,
  ruleset_json TEXT NOT NULL,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS performance_rows (
  row_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  account_id TEXT NOT NULL,
  campaign_name TEXT NOT NULL,
  ad_group_name TEXT NOT NULL,
  target_text TEXT NOT NULL,
  match_type TEXT NOT NULL,
  report_date TEXT NOT NULL,
  impressions INTEGER NOT NULL CHECK (impressions >= 0),
  clicks INTEGER NOT NULL CHECK (clicks >= 0),
  spend REAL NOT NULL CHECK (spend >= 0.0),
  sales REAL NOT NULL CHECK (sales >= 0.0),
  orders INTEGER NOT NULL CHECK (orders >= 0),
  ingested_at TEXT NOT NULL,
  UNIQUE (account_id, campaign_name, ad_group_name, target_text, match_type, report_date)
);

CREATE TRIGGER IF NOT EXISTS trg_performance_rows_no_update
BEFORE UPDATE ON performance_rows
BEGIN
  SELECT RAISE(FAIL, 'performance_rows are immutable');
END;

CREATE INDEX IF NOT EXISTS idx_performance_rows_account_date
  ON performance_rows(account_id, report_date);

CREATE TABLE IF NOT EXISTS action_ledger (
  action_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  action_id TEXT NOT NULL UNIQUE,
  account_id TEXT NOT NULL,
  action_type TEXT NOT NULL CHECK (
    action_type IN (
      'BID_INCREASE',
      'BID_DECREASE',
      'VISIBILITY_BOOST',
      'NEGATIVE_ISOLATION',
      'NEGATIVE_PERFORMANCE',
      'HARVEST_NEW',
      'PAUSE'
    )
  ),
  campaign_name TEXT NOT NULL,
  ad_group_name TEXT NOT NULL,
  target_text TEXT NOT NULL,
  match_type TEXT NOT NULL,
  old_value REAL CHECK (old_value >= 0.0 OR old_value IS NULL),
  new_value REAL CHECK (new_value >= 0.0 OR new_value IS NULL),
  action_date TEXT NOT NULL,
  reason TEXT NOT NULL,
  recorded_at TEXT NOT NULL
);

CREATE TRIGGER IF NOT EXISTS trg_action_ledger_no_update
BEFORE UPDATE ON action_ledger
BEGIN
  SELECT RAISE(FAIL, 'action_ledger is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_action_ledger_no_delete
BEFORE DELETE ON action_ledger
BEGIN
  SELECT RAISE(FAIL, 'action_ledger is append-only');
END;

CREATE INDEX IF NOT EXISTS idx_action_ledger_account_date
  ON action_ledger(account_id, action_date, action_seq);

CREATE TABLE IF NOT EXISTS validation_results (
  action_id TEXT NOT NULL,
  horizon TEXT NOT NULL CHECK (horizon IN ('14D', '30D', '60D')),
  account_id TEXT NOT NULL,
  ruleset_version INTEGER NOT NULL,
  status TEXT NOT NULL,
  outcome TEXT NOT NULL CHECK (outcome IN ('confirmed', 'not_validated', 'inconclusive')),
  market_tag TEXT NOT NULL CHECK (market_tag IN ('normal', 'market_downshift', 'low_data')),
  result_json TEXT NOT NULL,
  computed_at TEXT NOT NULL,
  PRIMARY KEY (action_id, horizon),
  FOREIGN KEY (action_id) REFERENCES action_ledger(action_id),
  FOREIGN KEY (ruleset_version) REFERENCES impact_rulesets(ruleset_version)
);

CREATE INDEX IF NOT EXISTS idx_validation_results_account_horizon
  ON validation_results(account_id, horizon, outcome);

CREATE TABLE IF NOT EXISTS impact_records (
  action_id TEXT NOT NULL,
  horizon TEXT NOT NULL CHECK (horizon IN ('14D', '30D', '60D')),
  account_id TEXT NOT NULL,
  ruleset_version INTEGER NOT NULL,
  quadrant TEXT,
  tier TEXT NOT NULL,
  is_mature INTEGER NOT NULL CHECK (is_mature IN (0, 1)),
  final_decision_impact REAL NOT NULL,
  capital_protected REAL NOT NULL,
  duplicate_of TEXT,
  record_json TEXT NOT NULL,
  baseline_json TEXT NOT NULL,
  computed_at TEXT NOT NULL,
  PRIMARY KEY (action_id, horizon),
  FOREIGN KEY (action_id) REFERENCES action_ledger(action_id),
  FOREIGN KEY (ruleset_version) REFERENCES impact_rulesets(ruleset_version)
);

CREATE INDEX IF NOT EXISTS idx_impact_records_account_horizon
  ON impact_records(account_id, horizon);

CREATE TABLE IF NOT EXISTS impact_projection_state (
  account_id TEXT NOT NULL,
  horizon TEXT NOT NULL CHECK (horizon IN ('14D', '30D', '60D')),
  ruleset_version INTEGER NOT NULL,
  last_action_seq INTEGER NOT NULL,
  last_row_seq INTEGER NOT NULL,
  latest_data_date TEXT,
  universal_median_roas REAL,
  updated_at TEXT NOT NULL,
  PRIMARY KEY (account_id, horizon)
);
";

const ACTION_COLUMNS: &str = "action_seq, action_id, account_id, action_type, campaign_name,
    ad_group_name, target_text, match_type, old_value, new_value, action_date, reason, recorded_at";

pub const CACHE_STATUS_CONTRACT_VERSION: &str = "cache_status.v1";
pub const CACHE_CHECK_CONTRACT_VERSION: &str = "cache_check.v1";
pub const ACTION_DETAIL_CONTRACT_VERSION: &str = "action_detail.v1";

pub struct SqliteImpactStore {
    conn: Connection,
}

/// Inclusive `[start, end]` calendar filter for list queries.
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct DateRange {
    pub start: Date,
    pub end: Date,
}

impl DateRange {
    pub fn new(start: Date, end: Date) -> Result<Self> {
        if end < start {
            return Err(anyhow!("date range end {end} is before start {start}"));
        }
        Ok(Self { start, end })
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct IngestReport {
    pub inserted: usize,
    pub skipped_existing: usize,
    pub last_row_seq: i64,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct RecomputeReport {
    pub account_id: String,
    pub horizon: Horizon,
    pub ruleset_version: u32,
    pub evaluated_actions: usize,
    pub confirmed_count: usize,
    pub pending_count: usize,
    pub duplicate_count: usize,
    pub last_action_seq: i64,
    pub last_row_seq: i64,
    pub latest_data_date: Option<Date>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct CachePartitionStatus {
    pub account_id: String,
    pub horizon: Horizon,
    pub ruleset_version: u32,
    pub cached_action_seq: i64,
    pub latest_action_seq: i64,
    pub lag_actions: i64,
    pub cached_row_seq: i64,
    pub latest_row_seq: i64,
    pub lag_rows: i64,
    pub ledger_actions: usize,
    pub cached_records: usize,
    pub latest_data_date: Option<Date>,
    pub updated_at: String,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct CacheStatus {
    pub contract_version: String,
    pub active_ruleset_version: u32,
    pub ledger_actions: usize,
    pub performance_rows: usize,
    pub partitions: Vec<CachePartitionStatus>,
    pub uncached_accounts: Vec<String>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CacheIssueSeverity {
    Warning,
    Error,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct CacheIssue {
    pub code: String,
    pub severity: CacheIssueSeverity,
    pub account_id: String,
    pub horizon: Option<Horizon>,
    pub message: String,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct CacheCheck {
    pub contract_version: String,
    pub healthy: bool,
    pub status: CacheStatus,
    pub issues: Vec<CacheIssue>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct ActionDetail {
    pub contract_version: String,
    pub action: Action,
    pub horizon: Horizon,
    pub window: MeasurementWindow,
    pub ruleset_version: u32,
    pub baseline: Option<Baseline>,
    pub validation: Option<ValidationResult>,
    pub impact: Option<ImpactRecord>,
}

struct ProjectionState {
    ruleset_version: u32,
    last_action_seq: i64,
    last_row_seq: i64,
    latest_data_date: Option<Date>,
    universal_median_roas: Option<f64>,
}

impl SqliteImpactStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_IMPACT_V1)
            .context("failed to apply impact schema")?;

        let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![IMPACT_MIGRATION_VERSION, now],
            )
            .context("failed to register impact schema migration")?;

        let seeded = self
            .conn
            .query_row(
                "SELECT 1 FROM impact_rulesets WHERE ruleset_version = 1",
                [],
                |_| Ok(()),
            )
            .optional()
            .context("failed to look up seeded ruleset")?
            .is_some();
        if !seeded {
            self.upsert_ruleset(&ImpactRuleset::v1())?;
        }

        Ok(())
    }

    pub fn upsert_ruleset(&self, ruleset: &ImpactRuleset) -> Result<()> {
        ruleset
            .validate()
            .map_err(|err| anyhow!("invalid ruleset configuration: {err}"))?;

        let payload = serde_json::to_string(ruleset).context("failed to serialize ruleset")?;
        let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;

        self.conn
            .execute(
                "INSERT INTO impact_rulesets(ruleset_version, ruleset_json, created_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(ruleset_version) DO UPDATE SET
                   ruleset_json = excluded.ruleset_json,
                   created_at = excluded.created_at",
                params![i64::from(ruleset.ruleset_version), payload, now],
            )
            .context("failed to upsert ruleset")?;

        tracing::info!(
            ruleset_version = ruleset.ruleset_version,
            "ruleset stored"
        );
        Ok(())
    }

    pub fn get_rulesets(&self) -> Result<BTreeMap<u32, ImpactRuleset>> {
        let mut stmt = self.conn.prepare(
            "SELECT ruleset_version, ruleset_json FROM impact_rulesets ORDER BY ruleset_version ASC",
        )?;

        let mut rows = stmt.query([])?;
        let mut map = BTreeMap::new();

        while let Some(row) = rows.next()? {
            let version_i64: i64 = row.get(0)?;
            let version = u32::try_from(version_i64)
                .with_context(|| format!("invalid ruleset_version: {version_i64}"))?;
            let json: String = row.get(1)?;
            let value: Value =
                serde_json::from_str(&json).context("invalid stored ruleset JSON")?;
            let ruleset = ImpactRuleset::from_json(&value)
                .map_err(|err| anyhow!("failed to parse ruleset {version}: {err}"))?;
            map.insert(version, ruleset);
        }

        Ok(map)
    }

    /// Highest stored ruleset version; used when a caller does not pin one.
    pub fn active_ruleset(&self) -> Result<ImpactRuleset> {
        self.get_rulesets()?
            .into_values()
            .next_back()
            .ok_or_else(|| anyhow!("no ruleset stored; run migrate first"))
    }

    fn ruleset_for(&self, ruleset_version: Option<u32>) -> Result<ImpactRuleset> {
        let Some(version) = ruleset_version else {
            return self.active_ruleset();
        };
        self.get_rulesets()?
            .remove(&version)
            .ok_or_else(|| anyhow!("missing ruleset_version {version} in impact_rulesets"))
    }

    /// Inserts performance rows. Rows whose natural key already exists are
    /// left untouched and counted as skipped.
    pub fn import_rows(&mut self, rows: &[PerformanceRow]) -> Result<IngestReport> {
        for (index, row) in rows.iter().enumerate() {
            row.validate()
                .map_err(|err| anyhow!("performance row {index} rejected: {err}"))?;
        }

        let ingested_at = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;
        let tx = self
            .conn
            .transaction()
            .context("failed to start row import transaction")?;

        let mut inserted = 0_usize;
        {
            let mut stmt = tx
                .prepare(
                    "INSERT INTO performance_rows(
                        account_id, campaign_name, ad_group_name, target_text, match_type,
                        report_date, impressions, clicks, spend, sales, orders, ingested_at
                     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                     ON CONFLICT(account_id, campaign_name, ad_group_name, target_text, match_type, report_date)
                     DO NOTHING",
                )
                .context("failed to prepare row insert")?;

            for row in rows {
                inserted += stmt
                    .execute(params![
                        row.account_id,
                        row.campaign_name,
                        row.ad_group_name,
                        row.target_text,
                        row.match_type,
                        sql_date(row.report_date)?,
                        count_to_sql(row.impressions)?,
                        count_to_sql(row.clicks)?,
                        row.spend,
                        row.sales,
                        count_to_sql(row.orders)?,
                        ingested_at,
                    ])
                    .context("failed to insert performance row")?;
            }
        }

        let last_row_seq: i64 = tx
            .query_row(
                "SELECT COALESCE(MAX(row_seq), 0) FROM performance_rows",
                [],
                |row| row.get(0),
            )
            .context("failed to read latest row_seq")?;
        tx.commit().context("failed to commit row import")?;

        let report = IngestReport {
            inserted,
            skipped_existing: rows.len() - inserted,
            last_row_seq,
        };
        tracing::info!(
            inserted = report.inserted,
            skipped = report.skipped_existing,
            "performance rows imported"
        );
        Ok(report)
    }

    /// Appends one optimizer decision to the ledger.
    pub fn log_action(&mut self, input: &ActionInput) -> Result<Action> {
        input
            .validate()
            .map_err(|err| anyhow!("action validation failed: {err}"))?;

        let action_id = input.action_id.unwrap_or_default();
        let recorded_at = now_utc();

        let tx = self
            .conn
            .transaction()
            .context("failed to start action transaction")?;

        tx.execute(
            "INSERT INTO action_ledger(
                action_id, account_id, action_type, campaign_name, ad_group_name,
                target_text, match_type, old_value, new_value, action_date,
                reason, recorded_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                action_id.to_string(),
                input.account_id,
                input.action_type.as_str(),
                input.campaign_name,
                input.ad_group_name,
                input.target_text,
                input.match_type,
                input.old_value,
                input.new_value,
                sql_date(input.action_date)?,
                input.reason,
                format_rfc3339(recorded_at).map_err(|err| anyhow!(err.to_string()))?,
            ],
        )
        .with_context(|| format!("failed to append action {action_id}"))?;

        let action_seq = tx.last_insert_rowid();
        tx.commit().context("failed to commit action transaction")?;

        tracing::info!(
            %action_id,
            action_seq,
            action_type = %input.action_type,
            account_id = %input.account_id,
            "action logged"
        );

        Ok(Action {
            action_seq,
            action_id,
            account_id: input.account_id.clone(),
            action_type: input.action_type,
            campaign_name: input.campaign_name.clone(),
            ad_group_name: input.ad_group_name.clone(),
            target_text: input.target_text.clone(),
            match_type: input.match_type.clone(),
            old_value: input.old_value,
            new_value: input.new_value,
            action_date: input.action_date,
            reason: input.reason.clone(),
            recorded_at,
        })
    }

    pub fn list_performance_rows(
        &self,
        account_id: &str,
        date_range: Option<DateRange>,
    ) -> Result<Vec<PerformanceRow>> {
        let (from, to) = range_bounds(date_range)?;
        let mut stmt = self.conn.prepare(
            "SELECT
                account_id, campaign_name, ad_group_name, target_text, match_type,
                report_date, impressions, clicks, spend, sales, orders
             FROM performance_rows
             WHERE account_id = ?1
               AND (?2 IS NULL OR report_date >= ?2)
               AND (?3 IS NULL OR report_date <= ?3)
             ORDER BY report_date ASC, row_seq ASC",
        )?;

        let rows = stmt.query_map(params![account_id, from, to], parse_performance_row)?;
        collect_rows(rows)
    }

    pub fn list_actions(
        &self,
        account_id: &str,
        date_range: Option<DateRange>,
        action_type: Option<ActionType>,
    ) -> Result<Vec<Action>> {
        let (from, to) = range_bounds(date_range)?;
        let query = format!(
            "SELECT {ACTION_COLUMNS}
             FROM action_ledger
             WHERE account_id = ?1
               AND (?2 IS NULL OR action_date >= ?2)
               AND (?3 IS NULL OR action_date <= ?3)
               AND (?4 IS NULL OR action_type = ?4)
             ORDER BY action_seq ASC"
        );

        let mut stmt = self.conn.prepare(&query)?;
        let rows = stmt.query_map(
            params![account_id, from, to, action_type.map(ActionType::as_str)],
            parse_action_row,
        )?;
        collect_rows(rows)
    }

    pub fn get_action(&self, action_id: ActionId) -> Result<Option<Action>> {
        let query = format!("SELECT {ACTION_COLUMNS} FROM action_ledger WHERE action_id = ?1");
        self.conn
            .query_row(&query, params![action_id.to_string()], parse_action_row)
            .optional()
            .with_context(|| format!("failed to load action {action_id}"))
    }

    /// Rebuilds the validation and impact caches of one account and horizon
    /// from the ledger and performance rows. Existing cache entries for the
    /// partition are replaced wholesale.
    pub fn recompute(
        &mut self,
        account_id: &str,
        horizon: Horizon,
        ruleset_version: Option<u32>,
    ) -> Result<RecomputeReport> {
        let ruleset = self.ruleset_for(ruleset_version)?;
        let last_action_seq = self.latest_action_seq(account_id)?;
        let last_row_seq = self.latest_row_seq(account_id)?;
        let rows = self.list_performance_rows(account_id, None)?;
        let actions = self.list_actions(account_id, None, None)?;

        let evaluation = evaluate_account(account_id, horizon, &rows, &actions, &ruleset)
            .map_err(|err| anyhow!("failed evaluating account {account_id}: {err}"))?;

        let computed_at = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;
        let ruleset_sql = i64::from(ruleset.ruleset_version);
        let latest_data_date = evaluation.latest_data_date.map(sql_date).transpose()?;

        let tx = self
            .conn
            .transaction()
            .context("failed to start recompute transaction")?;

        tx.execute(
            "DELETE FROM validation_results WHERE account_id = ?1 AND horizon = ?2",
            params![account_id, horizon.as_str()],
        )
        .context("failed to clear validation cache")?;
        tx.execute(
            "DELETE FROM impact_records WHERE account_id = ?1 AND horizon = ?2",
            params![account_id, horizon.as_str()],
        )
        .context("failed to clear impact cache")?;

        {
            let mut validation_stmt = tx
                .prepare(
                    "INSERT INTO validation_results(
                        action_id, horizon, account_id, ruleset_version, status,
                        outcome, market_tag, result_json, computed_at
                     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                )
                .context("failed to prepare validation insert")?;
            let mut impact_stmt = tx
                .prepare(
                    "INSERT INTO impact_records(
                        action_id, horizon, account_id, ruleset_version, quadrant,
                        tier, is_mature, final_decision_impact, capital_protected,
                        duplicate_of, record_json, baseline_json, computed_at
                     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                )
                .context("failed to prepare impact insert")?;

            for entry in &evaluation.evaluations {
                let action_id = entry.action_id.to_string();
                let validation = &entry.validation;
                let impact = &entry.impact;

                validation_stmt
                    .execute(params![
                        action_id,
                        horizon.as_str(),
                        account_id,
                        ruleset_sql,
                        validation.status.as_str(),
                        validation.outcome.as_str(),
                        validation.market_tag.as_str(),
                        serde_json::to_string(validation)
                            .context("failed to serialize validation result")?,
                        computed_at,
                    ])
                    .with_context(|| format!("failed to cache validation for {action_id}"))?;

                impact_stmt
                    .execute(params![
                        action_id,
                        horizon.as_str(),
                        account_id,
                        ruleset_sql,
                        impact.quadrant.map(Quadrant::as_str),
                        impact.tier.as_str(),
                        bool_to_sql(impact.is_mature),
                        impact.final_decision_impact,
                        impact.capital_protected,
                        impact.duplicate_of.as_ref().map(ToString::to_string),
                        serde_json::to_string(impact)
                            .context("failed to serialize impact record")?,
                        serde_json::to_string(&entry.baseline)
                            .context("failed to serialize baseline")?,
                        computed_at,
                    ])
                    .with_context(|| format!("failed to cache impact for {action_id}"))?;
            }
        }

        tx.execute(
            "INSERT INTO impact_projection_state(
                account_id, horizon, ruleset_version, last_action_seq, last_row_seq,
                latest_data_date, universal_median_roas, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(account_id, horizon) DO UPDATE SET
               ruleset_version = excluded.ruleset_version,
               last_action_seq = excluded.last_action_seq,
               last_row_seq = excluded.last_row_seq,
               latest_data_date = excluded.latest_data_date,
               universal_median_roas = excluded.universal_median_roas,
               updated_at = excluded.updated_at",
            params![
                account_id,
                horizon.as_str(),
                ruleset_sql,
                last_action_seq,
                last_row_seq,
                latest_data_date,
                evaluation.universal_median_roas,
                computed_at,
            ],
        )
        .context("failed to update projection state")?;

        tx.commit().context("failed to commit recompute")?;

        let report = RecomputeReport {
            account_id: account_id.to_string(),
            horizon,
            ruleset_version: ruleset.ruleset_version,
            evaluated_actions: evaluation.evaluations.len(),
            confirmed_count: evaluation.summary.confirmed_count,
            pending_count: evaluation.summary.pending_count,
            duplicate_count: evaluation.summary.duplicate_count,
            last_action_seq,
            last_row_seq,
            latest_data_date: evaluation.latest_data_date,
        };
        tracing::info!(
            account_id,
            %horizon,
            ruleset_version = report.ruleset_version,
            evaluated = report.evaluated_actions,
            "impact cache rebuilt"
        );
        Ok(report)
    }

    pub fn cache_status(&self) -> Result<CacheStatus> {
        let active_ruleset_version = self.active_ruleset()?.ruleset_version;
        let ledger_actions = self.count("SELECT COUNT(*) FROM action_ledger")?;
        let performance_rows = self.count("SELECT COUNT(*) FROM performance_rows")?;

        let mut stmt = self.conn.prepare(
            "SELECT
                s.account_id,
                s.horizon,
                s.ruleset_version,
                s.last_action_seq,
                s.last_row_seq,
                s.latest_data_date,
                s.updated_at,
                (SELECT COALESCE(MAX(a.action_seq), 0) FROM action_ledger a
                  WHERE a.account_id = s.account_id),
                (SELECT COALESCE(MAX(p.row_seq), 0) FROM performance_rows p
                  WHERE p.account_id = s.account_id),
                (SELECT COUNT(*) FROM action_ledger a
                  WHERE a.account_id = s.account_id),
                (SELECT COUNT(*) FROM impact_records r
                  WHERE r.account_id = s.account_id AND r.horizon = s.horizon)
             FROM impact_projection_state s
             ORDER BY s.account_id ASC, s.horizon ASC",
        )?;

        let rows = stmt.query_map([], |row| {
            let cached_action_seq: i64 = row.get(3)?;
            let cached_row_seq: i64 = row.get(4)?;
            let latest_action_seq: i64 = row.get(7)?;
            let latest_row_seq: i64 = row.get(8)?;
            Ok(CachePartitionStatus {
                account_id: row.get(0)?,
                horizon: parse_horizon(1, &row.get::<_, String>(1)?)?,
                ruleset_version: parse_ruleset_version(2, row.get(2)?)?,
                cached_action_seq,
                latest_action_seq,
                lag_actions: (latest_action_seq - cached_action_seq).max(0),
                cached_row_seq,
                latest_row_seq,
                lag_rows: (latest_row_seq - cached_row_seq).max(0),
                ledger_actions: parse_count(9, row.get(9)?)?,
                cached_records: parse_count(10, row.get(10)?)?,
                latest_data_date: row
                    .get::<_, Option<String>>(5)?
                    .as_deref()
                    .map(|raw| parse_sql_date(5, raw))
                    .transpose()?,
                updated_at: row.get(6)?,
            })
        })?;
        let partitions = collect_rows(rows)?;

        let mut stmt = self.conn.prepare(
            "SELECT DISTINCT a.account_id
             FROM action_ledger a
             WHERE NOT EXISTS (
               SELECT 1 FROM impact_projection_state s WHERE s.account_id = a.account_id
             )
             ORDER BY a.account_id ASC",
        )?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let uncached_accounts = collect_rows(rows)?;

        Ok(CacheStatus {
            contract_version: CACHE_STATUS_CONTRACT_VERSION.to_string(),
            active_ruleset_version,
            ledger_actions,
            performance_rows,
            partitions,
            uncached_accounts,
        })
    }

    pub fn cache_check(&self) -> Result<CacheCheck> {
        let status = self.cache_status()?;
        let mut issues = Vec::new();

        for account_id in &status.uncached_accounts {
            issues.push(CacheIssue {
                code: "missing_cache".to_string(),
                severity: CacheIssueSeverity::Error,
                account_id: account_id.clone(),
                horizon: None,
                message: format!("account {account_id} has ledger actions but no impact cache"),
            });
        }

        for partition in &status.partitions {
            let issue = |code: &str, severity: CacheIssueSeverity, message: String| CacheIssue {
                code: code.to_string(),
                severity,
                account_id: partition.account_id.clone(),
                horizon: Some(partition.horizon),
                message,
            };

            if partition.lag_actions > 0 {
                issues.push(issue(
                    "action_lag",
                    CacheIssueSeverity::Error,
                    format!(
                        "cache is {} ledger actions behind",
                        partition.lag_actions
                    ),
                ));
            }

            if partition.lag_rows > 0 {
                issues.push(issue(
                    "row_lag",
                    CacheIssueSeverity::Error,
                    format!(
                        "performance rows newer than the cache: latest row_seq {} vs cached {}",
                        partition.latest_row_seq, partition.cached_row_seq
                    ),
                ));
            }

            if partition.cached_records != partition.ledger_actions {
                issues.push(issue(
                    "record_count_mismatch",
                    CacheIssueSeverity::Error,
                    format!(
                        "record/ledger mismatch: cached_records={} ledger_actions={}",
                        partition.cached_records, partition.ledger_actions
                    ),
                ));
            }

            if partition.ruleset_version != status.active_ruleset_version {
                issues.push(issue(
                    "ruleset_outdated",
                    CacheIssueSeverity::Warning,
                    format!(
                        "cache built with ruleset {} while ruleset {} is active",
                        partition.ruleset_version, status.active_ruleset_version
                    ),
                ));
            }
        }

        let healthy = !issues
            .iter()
            .any(|item| item.severity == CacheIssueSeverity::Error);

        Ok(CacheCheck {
            contract_version: CACHE_CHECK_CONTRACT_VERSION.to_string(),
            healthy,
            status,
            issues,
        })
    }

    /// Summary for one account and horizon, built from the cached records.
    pub fn get_impact_summary(&self, account_id: &str, horizon: Horizon) -> Result<ImpactSummary> {
        let Some(state) = self.projection_state(account_id, horizon)? else {
            if self.latest_action_seq(account_id)? > 0 {
                return Err(anyhow!(
                    "impact cache missing for account {account_id} horizon {horizon}; run recompute"
                ));
            }
            let ruleset = self.active_ruleset()?;
            let latest_data_date = self
                .list_performance_rows(account_id, None)?
                .iter()
                .map(|row| row.report_date)
                .max();
            return Ok(build_summary(
                account_id,
                horizon,
                latest_data_date,
                None,
                &[],
                &ruleset,
            ));
        };

        let latest_action_seq = self.latest_action_seq(account_id)?;
        let latest_row_seq = self.latest_row_seq(account_id)?;
        let stale =
            latest_action_seq > state.last_action_seq || latest_row_seq > state.last_row_seq;
        if stale {
            tracing::warn!(
                account_id,
                %horizon,
                cached_action_seq = state.last_action_seq,
                latest_action_seq,
                cached_row_seq = state.last_row_seq,
                latest_row_seq,
                "impact cache is stale; run recompute"
            );
        }

        let ruleset = self.ruleset_for(Some(state.ruleset_version))?;
        let records = self.cached_impact_records(account_id, horizon)?;
        let mut summary = build_summary(
            account_id,
            horizon,
            state.latest_data_date,
            state.universal_median_roas,
            &records,
            &ruleset,
        );
        summary.stale = stale;
        Ok(summary)
    }

    pub fn get_action_detail(
        &self,
        action_id: ActionId,
        horizon: Horizon,
    ) -> Result<Option<ActionDetail>> {
        let Some(action) = self.get_action(action_id)? else {
            return Ok(None);
        };

        let validation = self
            .conn
            .query_row(
                "SELECT result_json FROM validation_results WHERE action_id = ?1 AND horizon = ?2",
                params![action_id.to_string(), horizon.as_str()],
                |row| parse_json_column::<ValidationResult>(row, 0),
            )
            .optional()
            .with_context(|| format!("failed to load validation for {action_id}"))?;

        let cached = self
            .conn
            .query_row(
                "SELECT record_json, baseline_json, ruleset_version
                 FROM impact_records
                 WHERE action_id = ?1 AND horizon = ?2",
                params![action_id.to_string(), horizon.as_str()],
                |row| {
                    Ok((
                        parse_json_column::<ImpactRecord>(row, 0)?,
                        parse_json_column::<Baseline>(row, 1)?,
                        parse_ruleset_version(2, row.get(2)?)?,
                    ))
                },
            )
            .optional()
            .with_context(|| format!("failed to load impact record for {action_id}"))?;

        let ruleset = self.ruleset_for(cached.as_ref().map(|(_, _, version)| *version))?;
        let window = window_for(action.action_date, horizon, &ruleset)
            .map_err(|err| anyhow!("failed to derive window for {action_id}: {err}"))?;
        let (impact, baseline) = match cached {
            Some((impact, baseline, _)) => (Some(impact), Some(baseline)),
            None => (None, None),
        };

        Ok(Some(ActionDetail {
            contract_version: ACTION_DETAIL_CONTRACT_VERSION.to_string(),
            action,
            horizon,
            window,
            ruleset_version: ruleset.ruleset_version,
            baseline,
            validation,
            impact,
        }))
    }

    /// Ledger actions of an account with a cached result for `horizon`,
    /// restricted to confirmed outcomes when `validated_only` is set.
    pub fn get_validated_actions(
        &self,
        account_id: &str,
        horizon: Horizon,
        validated_only: bool,
    ) -> Result<Vec<Action>> {
        let query = format!(
            "SELECT {}
             FROM action_ledger a
             JOIN validation_results v
               ON v.action_id = a.action_id
              AND v.horizon = ?2
             WHERE a.account_id = ?1
               AND (?3 = 0 OR v.outcome = ?4)
             ORDER BY a.action_seq ASC",
            ACTION_COLUMNS
                .split(',')
                .map(|column| format!("a.{}", column.trim()))
                .collect::<Vec<_>>()
                .join(", ")
        );

        let mut stmt = self.conn.prepare(&query)?;
        let rows = stmt.query_map(
            params![
                account_id,
                horizon.as_str(),
                bool_to_sql(validated_only),
                ValidationOutcome::Confirmed.as_str()
            ],
            parse_action_row,
        )?;
        collect_rows(rows)
    }

    /// Cached impact records of one partition in ledger order.
    pub fn cached_impact_records(
        &self,
        account_id: &str,
        horizon: Horizon,
    ) -> Result<Vec<ImpactRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT r.record_json
             FROM impact_records r
             JOIN action_ledger a ON a.action_id = r.action_id
             WHERE r.account_id = ?1 AND r.horizon = ?2
             ORDER BY a.action_seq ASC",
        )?;
        let rows = stmt.query_map(params![account_id, horizon.as_str()], |row| {
            parse_json_column::<ImpactRecord>(row, 0)
        })?;
        collect_rows(rows)
    }

    fn projection_state(&self, account_id: &str, horizon: Horizon) -> Result<Option<ProjectionState>> {
        self.conn
            .query_row(
                "SELECT ruleset_version, last_action_seq, last_row_seq, latest_data_date, universal_median_roas
                 FROM impact_projection_state
                 WHERE account_id = ?1 AND horizon = ?2",
                params![account_id, horizon.as_str()],
                |row| {
                    Ok(ProjectionState {
                        ruleset_version: parse_ruleset_version(0, row.get(0)?)?,
                        last_action_seq: row.get(1)?,
                        last_row_seq: row.get(2)?,
                        latest_data_date: row
                            .get::<_, Option<String>>(3)?
                            .as_deref()
                            .map(|raw| parse_sql_date(3, raw))
                            .transpose()?,
                        universal_median_roas: row.get(4)?,
                    })
                },
            )
            .optional()
            .context("failed to query projection state")
    }

    fn latest_action_seq(&self, account_id: &str) -> Result<i64> {
        self.conn
            .query_row(
                "SELECT COALESCE(MAX(action_seq), 0) FROM action_ledger WHERE account_id = ?1",
                params![account_id],
                |row| row.get(0),
            )
            .context("failed to query latest action_seq")
    }

    fn latest_row_seq(&self, account_id: &str) -> Result<i64> {
        self.conn
            .query_row(
                "SELECT COALESCE(MAX(row_seq), 0) FROM performance_rows WHERE account_id = ?1",
                params![account_id],
                |row| row.get(0),
            )
            .context("failed to query latest row_seq")
    }

    fn count(&self, query: &str) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row(query, [], |row| row.get(0))
            .with_context(|| format!("failed to run count query: {query}"))?;
        usize::try_from(count).with_context(|| format!("invalid count value: {count}"))
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

fn parse_performance_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<PerformanceRow> {
    Ok(PerformanceRow {
        account_id: row.get(0)?,
        campaign_name: row.get(1)?,
        ad_group_name: row.get(2)?,
        target_text: row.get(3)?,
        match_type: row.get(4)?,
        report_date: parse_sql_date(5, &row.get::<_, String>(5)?)?,
        impressions: parse_sql_count(6, row.get(6)?)?,
        clicks: parse_sql_count(7, row.get(7)?)?,
        spend: row.get(8)?,
        sales: row.get(9)?,
        orders: parse_sql_count(10, row.get(10)?)?,
    })
}

fn parse_action_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Action> {
    let action_id_raw: String = row.get(1)?;
    let action_type_raw: String = row.get(3)?;

    let action_id = ActionId::parse(&action_id_raw)
        .map_err(|err| conversion_error(1, Type::Text, err.to_string()))?;
    let action_type = ActionType::parse(&action_type_raw).ok_or_else(|| {
        conversion_error(3, Type::Text, format!("invalid action_type: {action_type_raw}"))
    })?;
    let recorded_at = parse_rfc3339_utc(&row.get::<_, String>(12)?)
        .map_err(|err| conversion_error(12, Type::Text, err.to_string()))?;

    Ok(Action {
        action_seq: row.get(0)?,
        action_id,
        account_id: row.get(2)?,
        action_type,
        campaign_name: row.get(4)?,
        ad_group_name: row.get(5)?,
        target_text: row.get(6)?,
        match_type: row.get(7)?,
        old_value: row.get(8)?,
        new_value: row.get(9)?,
        action_date: parse_sql_date(10, &row.get::<_, String>(10)?)?,
        reason: row.get(11)?,
        recorded_at,
    })
}

fn parse_json_column<T: serde::de::DeserializeOwned>(
    row: &rusqlite::Row<'_>,
    index: usize,
) -> rusqlite::Result<T> {
    let raw: String = row.get(index)?;
    serde_json::from_str(&raw)
        .map_err(|err| conversion_error(index, Type::Text, format!("invalid cached JSON: {err}")))
}

fn parse_horizon(index: usize, raw: &str) -> rusqlite::Result<Horizon> {
    Horizon::parse(raw)
        .ok_or_else(|| conversion_error(index, Type::Text, format!("invalid horizon: {raw}")))
}

fn parse_ruleset_version(index: usize, raw: i64) -> rusqlite::Result<u32> {
    u32::try_from(raw).map_err(|_| {
        conversion_error(index, Type::Integer, format!("invalid ruleset version: {raw}"))
    })
}

fn parse_count(index: usize, raw: i64) -> rusqlite::Result<usize> {
    usize::try_from(raw)
        .map_err(|_| conversion_error(index, Type::Integer, format!("invalid count: {raw}")))
}

fn parse_sql_count(index: usize, raw: i64) -> rusqlite::Result<u64> {
    u64::try_from(raw)
        .map_err(|_| conversion_error(index, Type::Integer, format!("negative counter: {raw}")))
}

fn parse_sql_date(index: usize, raw: &str) -> rusqlite::Result<Date> {
    parse_date(raw).map_err(|err| conversion_error(index, Type::Text, err.to_string()))
}

fn conversion_error(index: usize, kind: Type, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        kind,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

fn sql_date(value: Date) -> Result<String> {
    format_date(value).map_err(|err| anyhow!(err.to_string()))
}

fn range_bounds(date_range: Option<DateRange>) -> Result<(Option<String>, Option<String>)> {
    match date_range {
        Some(range) => Ok((Some(sql_date(range.start)?), Some(sql_date(range.end)?))),
        None => Ok((None, None)),
    }
}

fn count_to_sql(value: u64) -> Result<i64> {
    i64::try_from(value).with_context(|| format!("counter out of range: {value}"))
}

fn bool_to_sql(value: bool) -> i64 {
    i64::from(value)
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
