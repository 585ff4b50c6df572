use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use finops_integrations::NewPayment;
use finops_recon::{BudgetMonth, BulkOperation, BulkRequest, ClearingRequest, FinopsConfig, FinopsService, PurgeRequest};
use serde_json::Value;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "finops")]
#[command(about = "Xero remediation and budget tracking")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Match bank deposits against clearing-account entries and post the sweeps.
    Reconcile {
        #[arg(long)]
        bank: String,
        #[arg(long)]
        clearing: String,
        #[arg(long)]
        fee_account: Option<String>,
        #[arg(long)]
        from: NaiveDate,
        #[arg(long)]
        to: NaiveDate,
        /// Write to the ledger. Without this flag the run is a dry run.
        #[arg(long)]
        apply: bool,
    },
    /// Delete, void or un-pay a list of invoices.
    Bulk {
        #[arg(long, value_parser = parse_operation)]
        op: BulkOperation,
        #[arg(long = "invoice", required = true)]
        invoices: Vec<String>,
        #[arg(long)]
        apply: bool,
    },
    /// Remove every payment and bank transaction on an account, then archive it.
    Purge {
        /// Account id or code.
        #[arg(long)]
        account: String,
        #[arg(long)]
        apply: bool,
    },
    /// Re-create payments from a saved reversal plan.
    RestorePayments {
        #[arg(long)]
        plan: PathBuf,
    },
    BudgetSync,
    BudgetSummary {
        /// YYYY-MM, defaults to the current month.
        #[arg(long)]
        month: Option<BudgetMonth>,
    },
    Serve,
}

fn parse_operation(value: &str) -> Result<BulkOperation, String> {
    value.parse()
}

const DEFAULT_LOG_FILTER: &str =
    "finops=info,finops_recon=info,finops_integrations=info,finops_storage=info,finops_web=info,tower_http=info";

fn init_tracing() {
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_LOG_FILTER.into());
    let registry = tracing_subscriber::registry().with(env_filter);
    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr)).init();
    }
}

/// Accepts a bare payment array, `{"payments": [...]}`, or a saved bulk/purge
/// outcome carrying `reversal_plan`.
fn parse_plan(raw: &str) -> Result<Vec<NewPayment>> {
    let value: Value = serde_json::from_str(raw).context("plan is not valid JSON")?;
    let payments = match value {
        Value::Array(items) => Value::Array(items),
        Value::Object(mut map) => match map.remove("payments").or_else(|| map.remove("reversal_plan")) {
            Some(payments) => payments,
            None => bail!("plan object has neither `payments` nor `reversal_plan`"),
        },
        _ => bail!("plan must be a JSON array or object"),
    };
    serde_json::from_value(payments).context("plan entries are not payments")
}

async fn read_plan(path: &Path) -> Result<Vec<NewPayment>> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading plan {}", path.display()))?;
    parse_plan(&raw)
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let service = || FinopsService::from_config(FinopsConfig::from_env()).map(Arc::new);
    match cli.command {
        Commands::Serve => finops_web::serve_from_env().await?,
        Commands::Reconcile {
            bank,
            clearing,
            fee_account,
            from,
            to,
            apply,
        } => {
            let outcome = service()?
                .reconcile_clearing(ClearingRequest {
                    bank_account_id: bank,
                    clearing_account_id: clearing,
                    fee_account_code: fee_account,
                    fee_contact_name: None,
                    from,
                    to,
                    dry_run: !apply,
                })
                .await?;
            let totals = &outcome.report.totals;
            println!(
                "reconcile complete: run_id={} dry_run={} matched={}/{} fees={} unmatched_entries={} report={}",
                outcome.run_id,
                outcome.dry_run,
                totals.matched_deposits,
                totals.deposits,
                totals.fee_total,
                outcome.report.unmatched_entries.len(),
                outcome.report_dir.as_deref().unwrap_or("-"),
            );
            if outcome.stopped_early {
                bail!("posting stopped early; see audit run {}", outcome.run_id);
            }
        }
        Commands::Bulk { op, invoices, apply } => {
            let outcome = service()?
                .bulk(BulkRequest {
                    operation: op,
                    invoice_ids: invoices,
                    dry_run: !apply,
                })
                .await?;
            print_json(&outcome)?;
            if outcome.stopped_early {
                bail!("bulk {} stopped early; see audit run {}", outcome.operation, outcome.run_id);
            }
        }
        Commands::Purge { account, apply } => {
            let outcome = service()?.purge(PurgeRequest { account, dry_run: !apply }).await?;
            print_json(&outcome)?;
            if outcome.stopped_early {
                bail!("purge stopped early; see audit run {}", outcome.run_id);
            }
        }
        Commands::RestorePayments { plan } => {
            let payments = read_plan(&plan).await?;
            info!(count = payments.len(), plan = %plan.display(), "restoring payments");
            let outcome = service()?.restore_payments(&payments).await?;
            print_json(&outcome)?;
            if outcome.stopped_early {
                bail!("restore stopped early; see audit run {}", outcome.run_id);
            }
        }
        Commands::BudgetSync => {
            let summary = service()?.budget_sync().await?;
            println!(
                "budget sync complete: run_id={} source={} fetched={} upserted={}",
                summary.run_id, summary.source, summary.fetched, summary.upserted
            );
        }
        Commands::BudgetSummary { month } => {
            let summary = service()?.budget_summary(month.unwrap_or_else(BudgetMonth::current)).await?;
            print_json(&summary)?;
        }
    }

    Ok(())
}
