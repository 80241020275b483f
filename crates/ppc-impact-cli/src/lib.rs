//! Stable embedded impact command surface for host runtimes.
//!
//! Hosts embed the engine through:
//! - [`run_cli`] for full parsed CLI execution.
//! - [`run_impact_with_db`] for direct `ImpactCommand` execution against a DB path.
//! - [`run_impact`] for execution against an existing [`SqliteImpactStore`].

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use ppc_impact_core::{
    parse_date, Action, ActionId, ActionInput, ActionType, Horizon, ImpactRuleset, ImpactSummary,
    PerformanceRow, Quadrant,
};
use ppc_impact_store_sqlite::{
    ActionDetail, CacheCheck, CacheIssueSeverity, CacheStatus, DateRange, SqliteImpactStore,
};
use serde_json::Value;

#[derive(Debug, Parser)]
#[command(name = "ppc")]
#[command(about = "PPC decision impact and validation CLI")]
pub struct Cli {
    #[arg(long, default_value = "./ppc_impact.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Impact {
        #[command(subcommand)]
        command: Box<ImpactCommand>,
    },
}

#[derive(Debug, Subcommand)]
pub enum ImpactCommand {
    Rows {
        #[command(subcommand)]
        command: Box<RowsCommand>,
    },
    Action {
        #[command(subcommand)]
        command: Box<ActionCommand>,
    },
    Actions {
        #[command(subcommand)]
        command: Box<ActionsCommand>,
    },
    Recompute(RecomputeArgs),
    Summary(SummaryArgs),
    Detail(DetailArgs),
    Validated(ValidatedArgs),
    Cache {
        #[command(subcommand)]
        command: Box<CacheCommand>,
    },
    Ruleset {
        #[command(subcommand)]
        command: Box<RulesetCommand>,
    },
}

#[derive(Debug, Subcommand)]
pub enum RowsCommand {
    Import(RowsImportArgs),
    List(RowsListArgs),
}

#[derive(Debug, Args)]
pub struct RowsImportArgs {
    /// JSON array of performance rows.
    #[arg(long)]
    file: PathBuf,
}

#[derive(Debug, Args)]
pub struct RowsListArgs {
    #[arg(long)]
    account_id: String,
    #[arg(long)]
    from: Option<String>,
    #[arg(long)]
    to: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum ActionCommand {
    Log(ActionLogArgs),
}

#[derive(Debug, Args)]
pub struct ActionLogArgs {
    #[arg(long)]
    account_id: String,
    #[arg(long = "type", value_enum)]
    action_type: ActionTypeArg,
    #[arg(long)]
    campaign: String,
    #[arg(long, default_value = "")]
    ad_group: String,
    #[arg(long)]
    target: String,
    #[arg(long, default_value = "EXACT")]
    match_type: String,
    #[arg(long)]
    old_value: Option<f64>,
    #[arg(long)]
    new_value: Option<f64>,
    /// `YYYY-MM-DD`
    #[arg(long)]
    action_date: String,
    #[arg(long, default_value = "")]
    reason: String,
    #[arg(long)]
    action_id: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum ActionsCommand {
    List(ActionsListArgs),
}

#[derive(Debug, Args)]
pub struct ActionsListArgs {
    #[arg(long)]
    account_id: String,
    #[arg(long)]
    from: Option<String>,
    #[arg(long)]
    to: Option<String>,
    #[arg(long = "type", value_enum)]
    action_type: Option<ActionTypeArg>,
}

#[derive(Debug, Args)]
pub struct RecomputeArgs {
    #[arg(long)]
    account_id: String,
    /// Rebuild every horizon when omitted.
    #[arg(long, value_enum)]
    horizon: Option<HorizonArg>,
    #[arg(long)]
    ruleset_version: Option<u32>,
}

#[derive(Debug, Args)]
pub struct SummaryArgs {
    #[arg(long)]
    account_id: String,
    #[arg(long, value_enum, default_value_t = HorizonArg::D14)]
    horizon: HorizonArg,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct DetailArgs {
    #[arg(long)]
    action_id: String,
    #[arg(long, value_enum, default_value_t = HorizonArg::D14)]
    horizon: HorizonArg,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct ValidatedArgs {
    #[arg(long)]
    account_id: String,
    #[arg(long, value_enum, default_value_t = HorizonArg::D14)]
    horizon: HorizonArg,
    /// Include every evaluated action, not only confirmed ones.
    #[arg(long)]
    all: bool,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Subcommand)]
pub enum CacheCommand {
    Status(CacheStatusArgs),
    Check(CacheCheckArgs),
}

#[derive(Debug, Args)]
pub struct CacheStatusArgs {
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct CacheCheckArgs {
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Subcommand)]
pub enum RulesetCommand {
    Put(RulesetPutArgs),
    Show(RulesetShowArgs),
}

#[derive(Debug, Args)]
pub struct RulesetPutArgs {
    /// JSON ruleset document.
    #[arg(long)]
    file: PathBuf,
}

#[derive(Debug, Args)]
pub struct RulesetShowArgs {
    /// Defaults to the active (highest) version.
    #[arg(long)]
    version: Option<u32>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ActionTypeArg {
    BidIncrease,
    BidDecrease,
    VisibilityBoost,
    NegativeIsolation,
    NegativePerformance,
    HarvestNew,
    Pause,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum HorizonArg {
    #[value(name = "14d")]
    D14,
    #[value(name = "30d")]
    D30,
    #[value(name = "60d")]
    D60,
}

/// Executes the parsed top-level CLI command graph.
///
/// # Errors
/// Returns an error when store open/migrate fails or command execution fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Impact { command } => run_impact_with_db(&cli.db, *command),
    }
}

/// Executes a parsed impact command using the provided `SQLite` DB path.
///
/// # Errors
/// Returns an error when store open/migrate fails or the requested command fails.
pub fn run_impact_with_db(db_path: &Path, command: ImpactCommand) -> Result<()> {
    let mut store = SqliteImpactStore::open(db_path)?;
    store.migrate()?;
    tracing::debug!(db = %db_path.display(), "impact store ready");
    run_impact(command, &mut store)
}

/// Executes a parsed impact command against an existing store handle.
///
/// # Errors
/// Returns an error when input validation, persistence, recompute, or
/// retrieval operations fail.
pub fn run_impact(command: ImpactCommand, store: &mut SqliteImpactStore) -> Result<()> {
    match command {
        ImpactCommand::Rows { command } => run_rows(*command, store),
        ImpactCommand::Action { command } => run_action(*command, store),
        ImpactCommand::Actions { command } => run_actions(*command, store),
        ImpactCommand::Recompute(args) => {
            let horizons = match args.horizon {
                Some(horizon) => vec![map_horizon(horizon)],
                None => Horizon::ALL.to_vec(),
            };
            let reports = horizons
                .into_iter()
                .map(|horizon| store.recompute(&args.account_id, horizon, args.ruleset_version))
                .collect::<Result<Vec<_>>>()?;
            println!("{}", serde_json::to_string_pretty(&reports)?);
            Ok(())
        }
        ImpactCommand::Summary(args) => {
            let summary = store.get_impact_summary(&args.account_id, map_horizon(args.horizon))?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                print_summary(&summary);
            }
            Ok(())
        }
        ImpactCommand::Detail(args) => {
            let action_id =
                ActionId::parse(&args.action_id).map_err(|err| anyhow!(err.to_string()))?;
            let Some(detail) = store.get_action_detail(action_id, map_horizon(args.horizon))?
            else {
                return Err(anyhow!("action not found: {}", args.action_id));
            };
            if args.json {
                println!("{}", serde_json::to_string_pretty(&detail)?);
            } else {
                print_detail(&detail);
            }
            Ok(())
        }
        ImpactCommand::Validated(args) => {
            let actions = store.get_validated_actions(
                &args.account_id,
                map_horizon(args.horizon),
                !args.all,
            )?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&actions)?);
            } else {
                print_actions_table(&actions);
            }
            Ok(())
        }
        ImpactCommand::Cache { command } => run_cache(*command, store),
        ImpactCommand::Ruleset { command } => run_ruleset(*command, store),
    }
}

fn run_rows(command: RowsCommand, store: &mut SqliteImpactStore) -> Result<()> {
    match command {
        RowsCommand::Import(args) => {
            let text = std::fs::read_to_string(&args.file)
                .with_context(|| format!("failed reading rows file {}", args.file.display()))?;
            let rows: Vec<PerformanceRow> = serde_json::from_str(&text).with_context(|| {
                format!(
                    "rows file must be a JSON array of performance rows: {}",
                    args.file.display()
                )
            })?;
            let report = store.import_rows(&rows)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        RowsCommand::List(args) => {
            let range = parse_date_range(args.from.as_deref(), args.to.as_deref())?;
            let rows = store.list_performance_rows(&args.account_id, range)?;
            println!("{}", serde_json::to_string_pretty(&rows)?);
            Ok(())
        }
    }
}

fn run_action(command: ActionCommand, store: &mut SqliteImpactStore) -> Result<()> {
    match command {
        ActionCommand::Log(args) => {
            let action_id = args
                .action_id
                .as_deref()
                .map(ActionId::parse)
                .transpose()
                .map_err(|err| anyhow!(err.to_string()))?;
            let input = ActionInput {
                action_id,
                account_id: args.account_id,
                action_type: map_action_type(args.action_type),
                campaign_name: args.campaign,
                ad_group_name: args.ad_group,
                target_text: args.target,
                match_type: args.match_type,
                old_value: args.old_value,
                new_value: args.new_value,
                action_date: parse_cli_date("--action-date", &args.action_date)?,
                reason: args.reason,
            };

            let action = store.log_action(&input)?;
            println!("{}", serde_json::to_string_pretty(&action)?);
            Ok(())
        }
    }
}

fn run_actions(command: ActionsCommand, store: &SqliteImpactStore) -> Result<()> {
    match command {
        ActionsCommand::List(args) => {
            let range = parse_date_range(args.from.as_deref(), args.to.as_deref())?;
            let actions = store.list_actions(
                &args.account_id,
                range,
                args.action_type.map(map_action_type),
            )?;
            println!("{}", serde_json::to_string_pretty(&actions)?);
            Ok(())
        }
    }
}

fn run_cache(command: CacheCommand, store: &SqliteImpactStore) -> Result<()> {
    match command {
        CacheCommand::Status(args) => {
            let status = store.cache_status()?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                print_cache_status(&status);
            }
            Ok(())
        }
        CacheCommand::Check(args) => {
            let check = store.cache_check()?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&check)?);
            } else {
                print_cache_check(&check);
            }

            if !check.healthy {
                return Err(anyhow!(
                    "impact cache check failed: {}",
                    check
                        .issues
                        .iter()
                        .filter(|item| item.severity == CacheIssueSeverity::Error)
                        .map(|item| format!("{}:{}", item.code, item.message))
                        .collect::<Vec<_>>()
                        .join("; ")
                ));
            }

            Ok(())
        }
    }
}

fn run_ruleset(command: RulesetCommand, store: &SqliteImpactStore) -> Result<()> {
    match command {
        RulesetCommand::Put(args) => {
            let text = std::fs::read_to_string(&args.file)
                .with_context(|| format!("failed reading ruleset file {}", args.file.display()))?;
            let value: Value = serde_json::from_str(&text)
                .with_context(|| format!("ruleset file must be valid JSON: {}", args.file.display()))?;
            let ruleset =
                ImpactRuleset::from_json(&value).map_err(|err| anyhow!(err.to_string()))?;
            store.upsert_ruleset(&ruleset)?;
            println!("{}", serde_json::to_string_pretty(&ruleset)?);
            Ok(())
        }
        RulesetCommand::Show(args) => {
            let ruleset = match args.version {
                Some(version) => store
                    .get_rulesets()?
                    .remove(&version)
                    .ok_or_else(|| anyhow!("ruleset not found: {version}"))?,
                None => store.active_ruleset()?,
            };
            println!("{}", serde_json::to_string_pretty(&ruleset)?);
            Ok(())
        }
    }
}

fn parse_cli_date(flag: &str, raw: &str) -> Result<time::Date> {
    parse_date(raw).map_err(|err| anyhow!("invalid {flag} value: {err}"))
}

fn parse_date_range(from: Option<&str>, to: Option<&str>) -> Result<Option<DateRange>> {
    match (from, to) {
        (Some(start), Some(end)) => Ok(Some(DateRange::new(
            parse_cli_date("--from", start)?,
            parse_cli_date("--to", end)?,
        )?)),
        (None, None) => Ok(None),
        _ => Err(anyhow!("date filters require both --from and --to")),
    }
}

fn map_horizon(value: HorizonArg) -> Horizon {
    match value {
        HorizonArg::D14 => Horizon::D14,
        HorizonArg::D30 => Horizon::D30,
        HorizonArg::D60 => Horizon::D60,
    }
}

fn map_action_type(value: ActionTypeArg) -> ActionType {
    match value {
        ActionTypeArg::BidIncrease => ActionType::BidIncrease,
        ActionTypeArg::BidDecrease => ActionType::BidDecrease,
        ActionTypeArg::VisibilityBoost => ActionType::VisibilityBoost,
        ActionTypeArg::NegativeIsolation => ActionType::NegativeIsolation,
        ActionTypeArg::NegativePerformance => ActionType::NegativePerformance,
        ActionTypeArg::HarvestNew => ActionType::HarvestNew,
        ActionTypeArg::Pause => ActionType::Pause,
    }
}

fn yes_no(value: bool) -> &'static str {
    if value {
        "yes"
    } else {
        "no"
    }
}

fn print_summary(summary: &ImpactSummary) {
    println!(
        "contract={} account={} horizon={} ruleset={} latest_data_date={}",
        summary.contract_version,
        summary.account_id,
        summary.horizon,
        summary.ruleset_version,
        summary
            .latest_data_date
            .map_or_else(|| "n/a".to_string(), |date| date.to_string())
    );
    if summary.stale {
        println!("stale=true cache predates the latest ledger entry or row import; run recompute");
    }
    println!(
        "decision_attributed_impact={:.2} win_rate={:.1}% capital_protected={:.2} confidence={:?} pending={}",
        summary.decision_attributed_impact,
        summary.win_rate,
        summary.capital_protected,
        summary.confidence_label,
        summary.pending_count
    );
    println!(
        "actions={} confirmed={} not_validated={} inconclusive={} counted={} duplicates={}",
        summary.total_actions,
        summary.confirmed_count,
        summary.not_validated_count,
        summary.inconclusive_count,
        summary.counted_count,
        summary.duplicate_count
    );
    println!(
        "offensive_wins={} defensive_wins={} decision_gaps={} market_drag={} market_drag_excluded={:.2}",
        summary.offensive_win_count,
        summary.defensive_win_count,
        summary.decision_gap_count,
        summary.market_drag_count,
        summary.market_drag_excluded_impact
    );

    println!(
        "{:<22} {:<6} {:<10} {:<8} {:<14} capital_protected",
        "action_type", "total", "confirmed", "counted", "attributed"
    );
    println!("{}", "-".repeat(80));
    for item in &summary.by_action_type {
        println!(
            "{:<22} {:<6} {:<10} {:<8} {:<14.2} {:.2}",
            item.action_type.as_str(),
            item.total,
            item.confirmed,
            item.counted,
            item.attributed_impact,
            item.capital_protected
        );
    }
}

fn print_detail(detail: &ActionDetail) {
    let action = &detail.action;
    println!(
        "action_id={} seq={} type={} campaign={:?} target={:?} action_date={}",
        action.action_id,
        action.action_seq,
        action.action_type,
        action.campaign_name,
        action.target_text,
        action.action_date
    );
    println!(
        "horizon={} before=[{}, {}) after=[{}, {}) ruleset={}",
        detail.horizon,
        detail.window.before_start,
        detail.window.before_end,
        detail.window.after_start,
        detail.window.after_end,
        detail.ruleset_version
    );

    match (&detail.validation, &detail.impact) {
        (Some(validation), Some(impact)) => {
            println!(
                "status={} outcome={} market={} baseline_beat={} maturity={}",
                validation.status.label(),
                validation.outcome.as_str(),
                validation.market_tag.as_str(),
                yes_no(validation.baseline_beat),
                impact.maturity.label()
            );
            println!(
                "decision_impact={:.2} weight={:.3} final={:.2} tier={} quadrant={} capital_protected={:.2}",
                impact.decision_impact,
                impact.confidence_weight,
                impact.final_decision_impact,
                impact.tier.as_str(),
                impact.quadrant.map_or("n/a", Quadrant::as_str),
                impact.capital_protected
            );
        }
        _ => println!("no cached result; run `ppc impact recompute`"),
    }
}

fn print_actions_table(actions: &[Action]) {
    println!(
        "{:<26} {:<6} {:<22} {:<12} target",
        "action_id", "seq", "action_type", "action_date"
    );
    println!("{}", "-".repeat(100));
    for action in actions {
        println!(
            "{:<26} {:<6} {:<22} {:<12} {}",
            action.action_id.to_string(),
            action.action_seq,
            action.action_type.as_str(),
            action.action_date.to_string(),
            action.target_text
        );
    }
}

fn print_cache_status(status: &CacheStatus) {
    println!(
        "contract={} active_ruleset={} ledger_actions={} performance_rows={} uncached_accounts={}",
        status.contract_version,
        status.active_ruleset_version,
        status.ledger_actions,
        status.performance_rows,
        if status.uncached_accounts.is_empty() {
            "none".to_string()
        } else {
            status.uncached_accounts.join(",")
        }
    );
    println!(
        "{:<16} {:<7} {:<8} {:<11} {:<8} {:<8} updated_at",
        "account", "horizon", "ruleset", "lag_actions", "lag_rows", "records"
    );
    println!("{}", "-".repeat(90));
    for item in &status.partitions {
        println!(
            "{:<16} {:<7} {:<8} {:<11} {:<8} {:<8} {}",
            item.account_id,
            item.horizon.as_str(),
            item.ruleset_version,
            item.lag_actions,
            item.lag_rows,
            item.cached_records,
            item.updated_at
        );
    }
}

fn print_cache_check(check: &CacheCheck) {
    println!("contract={}", check.contract_version);
    print_cache_status(&check.status);
    println!("healthy={}", yes_no(check.healthy));
    if !check.issues.is_empty() {
        let formatted = check
            .issues
            .iter()
            .map(|item| {
                let severity = match item.severity {
                    CacheIssueSeverity::Warning => "warning",
                    CacheIssueSeverity::Error => "error",
                };
                format!("{severity}:{}:{}:{}", item.code, item.account_id, item.message)
            })
            .collect::<Vec<_>>()
            .join(" | ");
        println!("issues={formatted}");
        println!("hint=run `ppc impact recompute --account-id <id>` for affected accounts");
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::too_many_lines)]

    use super::*;
    use ppc_impact_core::ValidationStatus;
    use serde_json::json;
    use std::fs;

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn execute_cli(args: &[&str]) -> Result<()> {
        let cli = Cli::try_parse_from(args)?;
        run_cli(cli)
    }

    fn temp_path(prefix: &str, extension: &str) -> PathBuf {
        std::env::temp_dir().join(format!("{prefix}-{}.{extension}", ulid::Ulid::new()))
    }

    fn fixture_rows_json() -> Value {
        let row = |target: &str, date: &str, clicks: u64, spend: f64, sales: f64| {
            json!({
                "account_id": "acct-1",
                "campaign_name": "Brand - Exact",
                "ad_group_name": "Core",
                "target_text": target,
                "match_type": "EXACT",
                "report_date": date,
                "impressions": clicks * 40,
                "clicks": clicks,
                "spend": spend,
                "sales": sales,
                "orders": clicks / 10
            })
        };
        json!([
            row("trail running shoes", "2026-02-16", 50, 100.0, 150.0),
            row("trail running shoes", "2026-02-23", 50, 100.0, 150.0),
            row("running socks", "2026-02-16", 25, 50.0, 150.0),
            row("running socks", "2026-02-23", 25, 50.0, 150.0),
            row("running socks", "2026-03-02", 25, 50.0, 150.0),
            row("running socks", "2026-03-09", 25, 50.0, 150.0),
            row("running socks", "2026-03-16", 25, 50.0, 150.0),
            row("running socks", "2026-03-23", 25, 50.0, 150.0)
        ])
    }

    #[test]
    fn parse_date_range_requires_both_bounds() {
        assert!(must(parse_date_range(None, None)).is_none());
        assert!(parse_date_range(Some("2026-03-01"), None).is_err());
        assert!(parse_date_range(Some("2026-03-09"), Some("2026-03-01")).is_err());
        let range = must(parse_date_range(Some("2026-03-01"), Some("2026-03-09")));
        assert!(range.is_some());
    }

    #[test]
    fn horizon_and_action_type_args_map_to_core_values() {
        assert_eq!(map_horizon(HorizonArg::D30), Horizon::D30);
        assert_eq!(
            map_action_type(ActionTypeArg::NegativeIsolation),
            ActionType::NegativeIsolation
        );
        let cli = Cli::try_parse_from([
            "ppc", "impact", "summary", "--account-id", "acct-1", "--horizon", "60d",
        ]);
        assert!(cli.is_ok());
        let bad = Cli::try_parse_from([
            "ppc", "impact", "summary", "--account-id", "acct-1", "--horizon", "7d",
        ]);
        assert!(bad.is_err());
    }

    #[test]
    fn stable_embed_api_host_path_stays_operational() {
        let db_path = temp_path("ppc-embed-host", "sqlite3");

        must(run_impact_with_db(
            &db_path,
            ImpactCommand::Action {
                command: Box::new(ActionCommand::Log(ActionLogArgs {
                    account_id: "acct-1".to_string(),
                    action_type: ActionTypeArg::Pause,
                    campaign: "Brand - Exact".to_string(),
                    ad_group: "Core".to_string(),
                    target: "running socks".to_string(),
                    match_type: "EXACT".to_string(),
                    old_value: None,
                    new_value: None,
                    action_date: "2026-03-02".to_string(),
                    reason: "embed api regression".to_string(),
                    action_id: None,
                })),
            },
        ));

        let mut store = must(SqliteImpactStore::open(&db_path));
        must(store.migrate());
        must(run_impact(
            ImpactCommand::Recompute(RecomputeArgs {
                account_id: "acct-1".to_string(),
                horizon: Some(HorizonArg::D14),
                ruleset_version: None,
            }),
            &mut store,
        ));

        let db_path_str = db_path.to_string_lossy().to_string();
        must(execute_cli(&[
            "ppc",
            "--db",
            &db_path_str,
            "impact",
            "cache",
            "status",
            "--json",
        ]));

        let _ = fs::remove_file(&db_path);
    }

    #[test]
    fn cli_end_to_end_import_log_recompute_and_report() {
        let db_path = temp_path("ppc-cli-e2e", "sqlite3");
        let rows_path = temp_path("ppc-cli-e2e-rows", "json");
        let db = db_path.to_string_lossy().to_string();
        let rows_file = rows_path.to_string_lossy().to_string();

        must(fs::write(&rows_path, fixture_rows_json().to_string()).map_err(Into::into));
        must(execute_cli(&[
            "ppc", "--db", &db, "impact", "rows", "import", "--file", &rows_file,
        ]));

        let negative_id = ActionId::new().to_string();
        must(execute_cli(&[
            "ppc",
            "--db",
            &db,
            "impact",
            "action",
            "log",
            "--account-id",
            "acct-1",
            "--type",
            "negative-performance",
            "--campaign",
            "Brand - Exact",
            "--target",
            "trail running shoes",
            "--action-date",
            "2026-03-02",
            "--action-id",
            &negative_id,
        ]));
        must(execute_cli(&[
            "ppc",
            "--db",
            &db,
            "impact",
            "action",
            "log",
            "--account-id",
            "acct-1",
            "--type",
            "bid-increase",
            "--campaign",
            "Brand - Exact",
            "--target",
            "running socks",
            "--old-value",
            "1.00",
            "--new-value",
            "1.20",
            "--action-date",
            "2026-03-02",
        ]));

        let check_before = execute_cli(&["ppc", "--db", &db, "impact", "cache", "check", "--json"]);
        assert!(check_before.is_err());

        must(execute_cli(&[
            "ppc", "--db", &db, "impact", "recompute", "--account-id", "acct-1",
        ]));
        must(execute_cli(&["ppc", "--db", &db, "impact", "cache", "check"]));
        must(execute_cli(&[
            "ppc", "--db", &db, "impact", "summary", "--account-id", "acct-1",
        ]));
        must(execute_cli(&[
            "ppc", "--db", &db, "impact", "detail", "--action-id", &negative_id,
        ]));
        must(execute_cli(&[
            "ppc", "--db", &db, "impact", "validated", "--account-id", "acct-1", "--all",
        ]));

        let store = must(SqliteImpactStore::open(&db_path));
        let summary = must(store.get_impact_summary("acct-1", Horizon::D14));
        assert_eq!(summary.capital_protected, 200.0);
        assert_eq!(summary.total_actions, 2);

        let detail = match must(store.get_action_detail(
            must(ActionId::parse(&negative_id).map_err(|err| anyhow!(err.to_string()))),
            Horizon::D14,
        )) {
            Some(value) => value,
            None => panic!("missing detail for logged action"),
        };
        assert_eq!(
            detail.validation.map(|validation| validation.status),
            Some(ValidationStatus::SpendEliminated)
        );

        for horizon in Horizon::ALL {
            assert_eq!(must(store.cached_impact_records("acct-1", horizon)).len(), 2);
        }

        let _ = fs::remove_file(&db_path);
        let _ = fs::remove_file(&rows_path);
    }

    #[test]
    fn ruleset_put_registers_a_new_version() {
        let db_path = temp_path("ppc-cli-ruleset", "sqlite3");
        let ruleset_path = temp_path("ppc-cli-ruleset", "json");
        let db = db_path.to_string_lossy().to_string();
        let ruleset_file = ruleset_path.to_string_lossy().to_string();

        let mut ruleset = ImpactRuleset::v1();
        ruleset.ruleset_version = 2;
        ruleset.cpc_match_tolerance = 0.10;
        must(
            fs::write(&ruleset_path, must(serde_json::to_string(&ruleset).map_err(Into::into)))
                .map_err(Into::into),
        );

        must(execute_cli(&[
            "ppc", "--db", &db, "impact", "ruleset", "put", "--file", &ruleset_file,
        ]));

        let store = must(SqliteImpactStore::open(&db_path));
        assert_eq!(must(store.active_ruleset()), ruleset);

        must(fs::write(&ruleset_path, r#"{"ruleset_version": 3}"#).map_err(Into::into));
        assert!(execute_cli(&[
            "ppc", "--db", &db, "impact", "ruleset", "put", "--file", &ruleset_file,
        ])
        .is_err());

        let _ = fs::remove_file(&db_path);
        let _ = fs::remove_file(&ruleset_path);
    }
}
