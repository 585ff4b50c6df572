//! Per-run report directories: markdown summary, full JSON, parquet snapshots.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{Int64Array, RecordBatch, StringArray, UInt32Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use finops_storage::sha256_hex;
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use tokio::fs;
use uuid::Uuid;

use crate::clearing::{ClearingOutcome, ReconciliationReport};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotManifest {
    pub schema_version: u32,
    pub files: Vec<SnapshotFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

pub fn run_dir(reports_root: &Path, run_id: Uuid) -> PathBuf {
    reports_root.join(run_id.to_string())
}

/// Write `reconciliation.md`, `reconciliation.json` and the parquet snapshots.
pub async fn write_clearing_report(reports_root: &Path, outcome: &ClearingOutcome) -> Result<PathBuf> {
    let dir = run_dir(reports_root, outcome.run_id);
    let snapshots = dir.join("snapshots");
    fs::create_dir_all(&snapshots)
        .await
        .with_context(|| format!("creating {}", snapshots.display()))?;

    fs::write(dir.join("reconciliation.md"), render_markdown(outcome))
        .await
        .context("writing reconciliation.md")?;
    let json = serde_json::to_vec_pretty(outcome).context("serializing reconciliation outcome")?;
    fs::write(dir.join("reconciliation.json"), json)
        .await
        .context("writing reconciliation.json")?;

    let matches_path = snapshots.join("matches.parquet");
    let unmatched_path = snapshots.join("unmatched.parquet");
    write_matches_parquet(&matches_path, &outcome.report)?;
    write_unmatched_parquet(&unmatched_path, &outcome.report)?;

    let manifest = SnapshotManifest {
        schema_version: 1,
        files: vec![
            manifest_entry("matches", &dir, &matches_path)?,
            manifest_entry("unmatched", &dir, &unmatched_path)?,
        ],
    };
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing snapshot manifest")?;
    fs::write(snapshots.join("manifest.json"), bytes)
        .await
        .context("writing snapshot manifest")?;
    Ok(dir)
}

/// `reports/<run_id>/<operation>.json` for bulk, purge and restore runs.
pub async fn write_run_json<T: Serialize>(
    reports_root: &Path,
    run_id: Uuid,
    operation: &str,
    outcome: &T,
) -> Result<PathBuf> {
    let dir = run_dir(reports_root, run_id);
    fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;
    let path = dir.join(format!("{operation}.json"));
    let json = serde_json::to_vec_pretty(outcome).with_context(|| format!("serializing {operation} outcome"))?;
    fs::write(&path, json)
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(path)
}

pub fn render_markdown(outcome: &ClearingOutcome) -> String {
    let totals = &outcome.report.totals;
    let mode = if outcome.dry_run { "dry run" } else { "applied" };
    let mut lines = vec![
        "# Clearing Reconciliation".to_string(),
        String::new(),
        format!("- Run ID: `{}` ({mode})", outcome.run_id),
        format!("- Window: {} to {}", outcome.from, outcome.to),
        format!(
            "- Accounts: clearing `{}` -> bank `{}`",
            outcome.accounts.clearing_account_id, outcome.accounts.bank_account_id
        ),
        format!("- Deposits matched: {} of {}", totals.matched_deposits, totals.deposits),
        format!("- Matched deposits: {}", totals.matched_deposit_total),
        format!("- Gross settled: {}", totals.matched_gross_total),
        format!("- Implied fees: {}", totals.fee_total),
        format!("- Invoices linked: {}", totals.linked_invoices),
        format!("- Unmatched deposits: {}", totals.unmatched_deposit_total),
        format!("- Unmatched clearing entries: {}", totals.unmatched_entry_total),
        format!("- Already swept by an earlier run: {}", totals.previously_swept),
    ];
    if outcome.stopped_early {
        lines.push("- **Posting stopped at the first failure.**".to_string());
    }

    lines.push(String::new());
    lines.push("## Matches".to_string());
    lines.push(String::new());
    if outcome.report.matches.is_empty() {
        lines.push("_none_".to_string());
    } else {
        lines.push("| deposit | date | amount | gross | fee | bps | strategy | entries |".to_string());
        lines.push("|---|---|---|---|---|---|---|---|".to_string());
        for m in &outcome.report.matches {
            lines.push(format!(
                "| {} | {} | {} | {} | {} | {} | {} | {} |",
                m.deposit.id,
                m.deposit.date,
                m.deposit.amount,
                m.gross,
                m.fee,
                m.fee_bps,
                m.strategy.as_str(),
                m.entries.len()
            ));
        }
    }

    if !outcome.report.unmatched_deposits.is_empty() {
        lines.push(String::new());
        lines.push("## Unmatched deposits".to_string());
        lines.push(String::new());
        for d in &outcome.report.unmatched_deposits {
            lines.push(format!("- {} {} {}", d.date, d.id, d.amount));
        }
    }
    lines.push(String::new());
    lines.join("\n")
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn write_matches_parquet(path: &Path, report: &ReconciliationReport) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("deposit_id", DataType::Utf8, false),
        ArrowField::new("deposit_date", DataType::Utf8, false),
        ArrowField::new("deposit_cents", DataType::Int64, false),
        ArrowField::new("gross_cents", DataType::Int64, false),
        ArrowField::new("fee_cents", DataType::Int64, false),
        ArrowField::new("fee_bps", DataType::Int64, false),
        ArrowField::new("strategy", DataType::Utf8, false),
        ArrowField::new("entry_count", DataType::UInt32, false),
        ArrowField::new("entry_ids", DataType::Utf8, false),
        ArrowField::new("invoice_ids", DataType::Utf8, true),
    ]));
    let matches = &report.matches;

    let deposit_ids = StringArray::from(matches.iter().map(|m| Some(m.deposit.id.as_str())).collect::<Vec<_>>());
    let deposit_dates = StringArray::from(
        matches
            .iter()
            .map(|m| Some(m.deposit.date.to_string()))
            .collect::<Vec<_>>(),
    );
    let deposit_cents = Int64Array::from(matches.iter().map(|m| m.deposit.amount.0).collect::<Vec<_>>());
    let gross_cents = Int64Array::from(matches.iter().map(|m| m.gross.0).collect::<Vec<_>>());
    let fee_cents = Int64Array::from(matches.iter().map(|m| m.fee.0).collect::<Vec<_>>());
    let fee_bps = Int64Array::from(matches.iter().map(|m| m.fee_bps).collect::<Vec<_>>());
    let strategies = StringArray::from(matches.iter().map(|m| Some(m.strategy.as_str())).collect::<Vec<_>>());
    let entry_counts = UInt32Array::from(matches.iter().map(|m| m.entries.len() as u32).collect::<Vec<_>>());
    let entry_ids = StringArray::from(
        matches
            .iter()
            .map(|m| Some(m.entries.iter().map(|e| e.id.as_str()).collect::<Vec<_>>().join(",")))
            .collect::<Vec<_>>(),
    );
    let invoice_ids = StringArray::from(
        matches
            .iter()
            .map(|m| {
                (!m.links.is_empty()).then(|| {
                    m.links
                        .iter()
                        .map(|l| l.invoice_id.as_str())
                        .collect::<Vec<_>>()
                        .join(",")
                })
            })
            .collect::<Vec<_>>(),
    );

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(deposit_ids),
            Arc::new(deposit_dates),
            Arc::new(deposit_cents),
            Arc::new(gross_cents),
            Arc::new(fee_cents),
            Arc::new(fee_bps),
            Arc::new(strategies),
            Arc::new(entry_counts),
            Arc::new(entry_ids),
            Arc::new(invoice_ids),
        ],
    )
    .context("building matches record batch")?;
    write_parquet(path, batch)
}

fn write_unmatched_parquet(path: &Path, report: &ReconciliationReport) -> Result<()> {
    let mut rows: Vec<(&str, &str, String, i64, Option<&str>)> = report
        .unmatched_deposits
        .iter()
        .map(|d| ("deposit", d.id.as_str(), d.date.to_string(), d.amount.0, d.description.as_deref()))
        .collect();
    rows.extend(report.unmatched_entries.iter().map(|e| {
        (
            "clearing_entry",
            e.id.as_str(),
            e.date.to_string(),
            e.gross.0,
            e.contact_name.as_deref().or(e.reference.as_deref()),
        )
    }));

    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("kind", DataType::Utf8, false),
        ArrowField::new("id", DataType::Utf8, false),
        ArrowField::new("date", DataType::Utf8, false),
        ArrowField::new("amount_cents", DataType::Int64, false),
        ArrowField::new("label", DataType::Utf8, true),
    ]));
    let kinds = StringArray::from(rows.iter().map(|r| Some(r.0)).collect::<Vec<_>>());
    let ids = StringArray::from(rows.iter().map(|r| Some(r.1)).collect::<Vec<_>>());
    let dates = StringArray::from(rows.iter().map(|r| Some(r.2.as_str())).collect::<Vec<_>>());
    let amounts = Int64Array::from(rows.iter().map(|r| r.3).collect::<Vec<_>>());
    let labels = StringArray::from(rows.iter().map(|r| r.4).collect::<Vec<_>>());

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(kinds),
            Arc::new(ids),
            Arc::new(dates),
            Arc::new(amounts),
            Arc::new(labels),
        ],
    )
    .context("building unmatched record batch")?;
    write_parquet(path, batch)
}

fn manifest_entry(name: &str, run_dir: &Path, path: &Path) -> Result<SnapshotFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let rel = path.strip_prefix(run_dir).unwrap_or(path).display().to_string();
    Ok(SnapshotFile {
        name: name.to_string(),
        path: rel,
        sha256: sha256_hex(&bytes),
        bytes: bytes.len() as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clearing::{ClearingAccounts, ClearingMatcher};
    use chrono::NaiveDate;
    use finops_core::{Cents, ClearingEntry, ClearingOrigin, Deposit};
    use tempfile::tempdir;

    fn outcome() -> ClearingOutcome {
        let day = |d| NaiveDate::from_ymd_opt(2026, 9, d).unwrap();
        let report = ClearingMatcher::default().reconcile(
            &[
                Deposit {
                    id: "dep-1".into(),
                    date: day(10),
                    amount: Cents(9_700),
                    description: None,
                },
                Deposit {
                    id: "dep-2".into(),
                    date: day(11),
                    amount: Cents(123_456),
                    description: Some("mystery".into()),
                },
            ],
            &[ClearingEntry {
                id: "e1".into(),
                date: day(9),
                gross: Cents(10_000),
                contact_name: Some("Jo Client".into()),
                reference: None,
                invoice_id: Some("inv-9".into()),
                origin: ClearingOrigin::Payment,
            }],
            &[],
        );
        ClearingOutcome {
            run_id: Uuid::new_v4(),
            dry_run: true,
            accounts: ClearingAccounts {
                bank_account_id: "bank".into(),
                clearing_account_id: "clearing".into(),
                fee_account_code: "404".into(),
                fee_contact_name: "Fees".into(),
            },
            from: day(1),
            to: day(30),
            report,
            postings: vec![],
            stopped_early: false,
            report_dir: None,
        }
    }

    #[tokio::test]
    async fn writes_report_files_and_manifest() {
        let dir = tempdir().expect("tempdir");
        let outcome = outcome();
        let run = write_clearing_report(dir.path(), &outcome).await.expect("report");

        assert!(run.join("reconciliation.md").exists());
        assert!(run.join("reconciliation.json").exists());
        let manifest: SnapshotManifest =
            serde_json::from_slice(&std::fs::read(run.join("snapshots/manifest.json")).unwrap()).unwrap();
        assert_eq!(manifest.files.len(), 2);
        for file in &manifest.files {
            let bytes = std::fs::read(run.join(&file.path)).unwrap();
            assert_eq!(file.sha256, sha256_hex(&bytes));
            assert_eq!(file.bytes, bytes.len() as u64);
        }
    }

    #[test]
    fn markdown_summarises_totals_and_unmatched() {
        let md = render_markdown(&outcome());
        assert!(md.contains("Deposits matched: 1 of 2"));
        assert!(md.contains("Implied fees: 3.00"));
        assert!(md.contains("| dep-1 |"));
        assert!(md.contains("## Unmatched deposits"));
        assert!(md.contains("1234.56"));
    }

    #[tokio::test]
    async fn run_json_lands_under_run_dir() {
        let dir = tempdir().expect("tempdir");
        let run_id = Uuid::new_v4();
        let path = write_run_json(dir.path(), run_id, "bulk_void", &serde_json::json!({"ok": true}))
            .await
            .expect("write");
        assert_eq!(path, dir.path().join(run_id.to_string()).join("bulk_void.json"));
    }
}
