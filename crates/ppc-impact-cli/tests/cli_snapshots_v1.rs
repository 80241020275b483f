#![allow(clippy::single_match_else, clippy::uninlined_format_args)]

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use serde_json::{json, Value};
use ulid::Ulid;

fn ppc_binary_path() -> PathBuf {
    match std::env::var("CARGO_BIN_EXE_ppc") {
        Ok(value) => PathBuf::from(value),
        Err(_) => {
            let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../target/debug/ppc");
            if !path.exists() {
                let status = Command::new("cargo")
                    .args(["build", "-p", "ppc-impact-cli", "--bin", "ppc"])
                    .status();
                match status {
                    Ok(value) if value.success() => {}
                    Ok(value) => panic!("failed to build ppc binary (status={value})"),
                    Err(err) => panic!("failed to invoke cargo build: {err}"),
                }
            }
            path
        }
    }
}

fn ppc_output(db_path: &Path, args: &[&str]) -> Output {
    let mut command = Command::new(ppc_binary_path());
    command.env_remove("RUST_LOG");
    command.arg("--db").arg(db_path);
    for arg in args {
        command.arg(arg);
    }

    match command.output() {
        Ok(output) => output,
        Err(err) => panic!("failed to run ppc command {:?}: {err}", args),
    }
}

fn parse_json(output: &Output) -> Value {
    match serde_json::from_slice::<Value>(&output.stdout) {
        Ok(value) => value,
        Err(err) => panic!(
            "failed to parse stdout json: {err}; stdout={}",
            String::from_utf8_lossy(&output.stdout)
        ),
    }
}

fn log_negative(db_path: &Path, target: &str) {
    let output = ppc_output(
        db_path,
        &[
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
            target,
            "--action-date",
            "2026-03-02",
        ],
    );
    assert!(
        output.status.success(),
        "action log failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
}

#[test]
fn snapshot_cache_status_json_v1() {
    let db_path =
        std::env::temp_dir().join(format!("ppc-snapshot-status-{}.sqlite3", Ulid::new()));

    let output = ppc_output(&db_path, &["impact", "cache", "status", "--json"]);
    assert!(output.status.success());

    let snapshot = match serde_json::to_string_pretty(&parse_json(&output)) {
        Ok(value) => value,
        Err(err) => panic!("failed to serialize status payload: {err}"),
    };

    let expected = r#"{
  "contract_version": "cache_status.v1",
  "active_ruleset_version": 1,
  "ledger_actions": 0,
  "performance_rows": 0,
  "partitions": [],
  "uncached_accounts": []
}"#;

    assert_eq!(snapshot, expected);
    let _ = std::fs::remove_file(&db_path);
}

#[test]
fn snapshot_cache_check_error_stderr_v1() {
    let db_path =
        std::env::temp_dir().join(format!("ppc-snapshot-check-{}.sqlite3", Ulid::new()));

    log_negative(&db_path, "trail running shoes");

    let check_output = ppc_output(&db_path, &["impact", "cache", "check"]);
    assert!(!check_output.status.success());

    assert_eq!(
        String::from_utf8_lossy(&check_output.stderr),
        "Error: impact cache check failed: missing_cache:account acct-1 has ledger actions but no impact cache\n"
    );

    let _ = std::fs::remove_file(&db_path);
}

#[test]
fn snapshot_recompute_report_json_v1() {
    let db_path =
        std::env::temp_dir().join(format!("ppc-snapshot-recompute-{}.sqlite3", Ulid::new()));
    let rows_path = std::env::temp_dir().join(format!("ppc-snapshot-rows-{}.json", Ulid::new()));

    let rows = ["2026-02-16", "2026-02-23", "2026-03-23"]
        .into_iter()
        .map(|date| {
            json!({
                "account_id": "acct-1",
                "campaign_name": "Brand - Exact",
                "ad_group_name": "Core",
                "target_text": "trail running shoes",
                "match_type": "EXACT",
                "report_date": date,
                "impressions": if date == "2026-03-23" { 0 } else { 2000 },
                "clicks": if date == "2026-03-23" { 0 } else { 50 },
                "spend": if date == "2026-03-23" { 0.0 } else { 100.0 },
                "sales": if date == "2026-03-23" { 0.0 } else { 150.0 },
                "orders": if date == "2026-03-23" { 0 } else { 5 }
            })
        })
        .collect::<Vec<_>>();
    if let Err(err) = std::fs::write(&rows_path, Value::Array(rows).to_string()) {
        panic!("failed writing rows fixture: {err}");
    }

    let import_output = ppc_output(
        &db_path,
        &[
            "impact",
            "rows",
            "import",
            "--file",
            &rows_path.to_string_lossy(),
        ],
    );
    assert!(import_output.status.success());

    log_negative(&db_path, "trail running shoes");

    let recompute_output = ppc_output(
        &db_path,
        &[
            "impact",
            "recompute",
            "--account-id",
            "acct-1",
            "--horizon",
            "14d",
        ],
    );
    assert!(
        recompute_output.status.success(),
        "recompute failed: {}",
        String::from_utf8_lossy(&recompute_output.stderr)
    );

    let snapshot = match serde_json::to_string_pretty(&parse_json(&recompute_output)) {
        Ok(value) => value,
        Err(err) => panic!("failed to serialize recompute payload: {err}"),
    };

    let expected = r#"[
  {
    "account_id": "acct-1",
    "horizon": "14D",
    "ruleset_version": 1,
    "evaluated_actions": 1,
    "confirmed_count": 1,
    "pending_count": 0,
    "duplicate_count": 0,
    "last_action_seq": 1,
    "last_row_seq": 3,
    "latest_data_date": "2026-03-23"
  }
]"#;

    assert_eq!(snapshot, expected);
    let _ = std::fs::remove_file(&db_path);
    let _ = std::fs::remove_file(&rows_path);
}
