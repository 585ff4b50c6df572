//! Reconciliation, remediation and budget pipelines over the ledger integrations.

pub mod budget;
pub mod bulk;
pub mod clearing;
pub mod purge;
pub mod report;
pub mod steps;
pub mod tools;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use finops_core::{Cents, Invoice};
use finops_integrations::{
    InvoiceFilter, Ledger, LedgerError, NewPayment, UpBankClient, UpBankConfig, XeroClient, XeroConfig,
};
use finops_storage::{ApiClient, ApiClientConfig, AuditLog, TokenBucketConfig};
use thiserror::Error;
use tracing::info;

pub use budget::{BudgetMonth, BudgetRules, BudgetStore, BudgetSummary, BudgetSync, BudgetSyncSummary};
pub use bulk::{BulkOperation, BulkOutcome, BulkRequest};
pub use clearing::{ClearingAccounts, ClearingMatcher, ClearingOutcome, ClearingRequest, MatchConfig};
pub use purge::{PurgeOutcome, PurgeRequest};
pub use steps::RestoreOutcome;
pub use tools::{ToolError, ToolRegistry};

pub const CRATE_NAME: &str = "finops-recon";

#[derive(Debug, Clone)]
pub struct FinopsConfig {
    pub database_url: Option<String>,
    pub audit_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub rules_dir: PathBuf,
    pub xero_client_id: Option<String>,
    pub xero_client_secret: Option<String>,
    pub xero_refresh_token: Option<String>,
    pub xero_tenant_id: Option<String>,
    pub up_api_token: Option<String>,
    pub admin_token: Option<String>,
    pub web_port: u16,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub budget_scheduler_enabled: bool,
    pub budget_sync_cron: String,
    pub clearing_fee_bps: i64,
    pub clearing_fee_fixed_cents: i64,
    pub clearing_lookback_days: i64,
    pub clearing_max_group: usize,
    pub fee_account_code: String,
    pub fee_contact_name: String,
}

fn env_opt(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl Default for FinopsConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            audit_dir: PathBuf::from("./audit"),
            reports_dir: PathBuf::from("./reports"),
            rules_dir: PathBuf::from("./rules"),
            xero_client_id: None,
            xero_client_secret: None,
            xero_refresh_token: None,
            xero_tenant_id: None,
            up_api_token: None,
            admin_token: None,
            web_port: 8000,
            user_agent: "finops/0.1".to_string(),
            http_timeout_secs: 30,
            budget_scheduler_enabled: false,
            budget_sync_cron: "0 0 */6 * * *".to_string(),
            clearing_fee_bps: 300,
            clearing_fee_fixed_cents: 30,
            clearing_lookback_days: 7,
            clearing_max_group: 8,
            fee_account_code: "404".to_string(),
            fee_contact_name: "Payment processor fees".to_string(),
        }
    }
}

impl FinopsConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_url: env_opt("DATABASE_URL"),
            audit_dir: env_opt("AUDIT_DIR").map(PathBuf::from).unwrap_or(defaults.audit_dir),
            reports_dir: env_opt("REPORTS_DIR").map(PathBuf::from).unwrap_or(defaults.reports_dir),
            rules_dir: env_opt("RULES_DIR").map(PathBuf::from).unwrap_or(defaults.rules_dir),
            xero_client_id: env_opt("XERO_CLIENT_ID"),
            xero_client_secret: env_opt("XERO_CLIENT_SECRET"),
            xero_refresh_token: env_opt("XERO_REFRESH_TOKEN"),
            xero_tenant_id: env_opt("XERO_TENANT_ID"),
            up_api_token: env_opt("UP_API_TOKEN"),
            admin_token: env_opt("FINOPS_ADMIN_TOKEN"),
            web_port: env_parse("FINOPS_WEB_PORT", defaults.web_port),
            user_agent: env_opt("FINOPS_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: env_parse("FINOPS_HTTP_TIMEOUT_SECS", defaults.http_timeout_secs),
            budget_scheduler_enabled: std::env::var("BUDGET_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            budget_sync_cron: env_opt("BUDGET_SYNC_CRON").unwrap_or(defaults.budget_sync_cron),
            clearing_fee_bps: env_parse("CLEARING_FEE_BPS", defaults.clearing_fee_bps),
            clearing_fee_fixed_cents: env_parse("CLEARING_FEE_FIXED_CENTS", defaults.clearing_fee_fixed_cents),
            clearing_lookback_days: env_parse("CLEARING_LOOKBACK_DAYS", defaults.clearing_lookback_days),
            clearing_max_group: env_parse("CLEARING_MAX_GROUP", defaults.clearing_max_group),
            fee_account_code: env_opt("FEE_ACCOUNT_CODE").unwrap_or(defaults.fee_account_code),
            fee_contact_name: env_opt("FEE_CONTACT_NAME").unwrap_or(defaults.fee_contact_name),
        }
    }

    pub fn match_config(&self) -> MatchConfig {
        MatchConfig {
            fee_bps: self.clearing_fee_bps,
            fee_fixed: Cents(self.clearing_fee_fixed_cents),
            lookback_days: self.clearing_lookback_days,
            max_group_size: self.clearing_max_group,
            ..MatchConfig::default()
        }
    }

    pub fn xero_config(&self) -> Option<XeroConfig> {
        Some(XeroConfig::new(
            self.xero_client_id.clone()?,
            self.xero_client_secret.clone()?,
            self.xero_refresh_token.clone()?,
            self.xero_tenant_id.clone()?,
        ))
    }

    fn api_client_config(&self, token_bucket: Option<TokenBucketConfig>) -> ApiClientConfig {
        ApiClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            token_bucket,
            ..Default::default()
        }
    }
}

pub fn build_ledger(config: &FinopsConfig) -> Result<Arc<dyn Ledger>> {
    let xero = config
        .xero_config()
        .context("XERO_CLIENT_ID, XERO_CLIENT_SECRET, XERO_REFRESH_TOKEN and XERO_TENANT_ID must be set")?;
    let http = ApiClient::new(config.api_client_config(Some(TokenBucketConfig::xero_minute_limit())))?;
    Ok(Arc::new(XeroClient::new(http, xero)))
}

/// `None` unless both `UP_API_TOKEN` and `DATABASE_URL` are set.
pub fn build_budget_sync(config: &FinopsConfig) -> Result<Option<BudgetSync>> {
    let (Some(token), Some(database_url)) = (&config.up_api_token, &config.database_url) else {
        return Ok(None);
    };
    let rules = BudgetRules::from_rules_dir(&config.rules_dir)?;
    let http = ApiClient::new(config.api_client_config(None))?;
    let source = UpBankClient::new(http, UpBankConfig::new(token.clone()));
    let store = budget::PgBudgetStore::connect_lazy(database_url)?;
    Ok(Some(BudgetSync::new(Arc::new(source), Arc::new(store), rules)))
}

#[derive(Debug, Error)]
pub enum OpsError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("{0} is not configured")]
    NotConfigured(&'static str),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error("{0:#}")]
    Other(anyhow::Error),
}

impl From<anyhow::Error> for OpsError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<LedgerError>() {
            Ok(ledger) => OpsError::Ledger(ledger),
            Err(other) => OpsError::Other(other),
        }
    }
}

/// Entry point shared by the admin API, the CLI and the AI tools.
pub struct FinopsService {
    config: FinopsConfig,
    ledger: Arc<dyn Ledger>,
    audit: Arc<AuditLog>,
    matcher: ClearingMatcher,
    budget: Option<Arc<BudgetSync>>,
}

impl FinopsService {
    pub fn new(config: FinopsConfig, ledger: Arc<dyn Ledger>, budget: Option<Arc<BudgetSync>>) -> Self {
        let audit = Arc::new(AuditLog::new(config.audit_dir.clone()));
        let matcher = ClearingMatcher::new(config.match_config());
        Self {
            config,
            ledger,
            audit,
            matcher,
            budget,
        }
    }

    pub fn from_config(config: FinopsConfig) -> Result<Self> {
        let ledger = build_ledger(&config)?;
        let budget = build_budget_sync(&config)?.map(Arc::new);
        Ok(Self::new(config, ledger, budget))
    }

    pub fn config(&self) -> &FinopsConfig {
        &self.config
    }

    pub fn ledger(&self) -> &dyn Ledger {
        self.ledger.as_ref()
    }

    pub fn audit(&self) -> Arc<AuditLog> {
        self.audit.clone()
    }

    pub fn budget(&self) -> Option<Arc<BudgetSync>> {
        self.budget.clone()
    }

    pub async fn list_invoices(&self, filter: &InvoiceFilter) -> Result<Vec<Invoice>, OpsError> {
        Ok(self.ledger.list_invoices(filter).await?)
    }

    pub async fn reconcile_clearing(&self, request: ClearingRequest) -> Result<ClearingOutcome, OpsError> {
        if request.from > request.to {
            return Err(OpsError::InvalidInput(format!(
                "window start {} is after end {}",
                request.from, request.to
            )));
        }
        if request.bank_account_id == request.clearing_account_id {
            return Err(OpsError::InvalidInput(
                "bank and clearing accounts must differ".into(),
            ));
        }
        let accounts = ClearingAccounts {
            bank_account_id: request.bank_account_id,
            clearing_account_id: request.clearing_account_id,
            fee_account_code: request
                .fee_account_code
                .unwrap_or_else(|| self.config.fee_account_code.clone()),
            fee_contact_name: request
                .fee_contact_name
                .unwrap_or_else(|| self.config.fee_contact_name.clone()),
        };
        let mut outcome = clearing::run_clearing(
            self.ledger.as_ref(),
            self.audit(),
            &self.matcher,
            accounts,
            request.from,
            request.to,
            request.dry_run,
        )
        .await?;
        let dir = report::write_clearing_report(&self.config.reports_dir, &outcome).await?;
        outcome.report_dir = Some(dir.display().to_string());
        info!(run_id = %outcome.run_id, report_dir = %dir.display(), "clearing reconciliation written");
        Ok(outcome)
    }

    pub async fn bulk(&self, request: BulkRequest) -> Result<BulkOutcome, OpsError> {
        if request.invoice_ids.is_empty() {
            return Err(OpsError::InvalidInput("no invoice ids given".into()));
        }
        if request.invoice_ids.iter().any(|id| id.trim().is_empty()) {
            return Err(OpsError::InvalidInput("invoice ids must not be blank".into()));
        }
        let outcome = bulk::run_bulk(self.ledger.as_ref(), self.audit(), &request).await?;
        let operation = format!("bulk_{}", outcome.operation);
        report::write_run_json(&self.config.reports_dir, outcome.run_id, &operation, &outcome).await?;
        Ok(outcome)
    }

    pub async fn purge(&self, request: PurgeRequest) -> Result<PurgeOutcome, OpsError> {
        if request.account.trim().is_empty() {
            return Err(OpsError::InvalidInput("account is required".into()));
        }
        let outcome = purge::run_purge(self.ledger.as_ref(), self.audit(), &request).await?;
        report::write_run_json(&self.config.reports_dir, outcome.run_id, "account_purge", &outcome).await?;
        Ok(outcome)
    }

    pub async fn restore_payments(&self, plan: &[NewPayment]) -> Result<RestoreOutcome, OpsError> {
        if plan.is_empty() {
            return Err(OpsError::InvalidInput("reversal plan is empty".into()));
        }
        let outcome = steps::restore_payments(self.ledger.as_ref(), self.audit(), plan).await?;
        report::write_run_json(&self.config.reports_dir, outcome.run_id, "restore_payments", &outcome).await?;
        Ok(outcome)
    }

    pub async fn budget_sync(&self) -> Result<BudgetSyncSummary, OpsError> {
        let sync = self.budget.as_ref().ok_or(OpsError::NotConfigured("budget sync"))?;
        Ok(sync.run_once().await?)
    }

    pub async fn budget_summary(&self, month: BudgetMonth) -> Result<BudgetSummary, OpsError> {
        let sync = self.budget.as_ref().ok_or(OpsError::NotConfigured("budget tracker"))?;
        Ok(sync.summary(month).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use finops_integrations::MemoryLedger;
    use tempfile::tempdir;

    fn service(root: &std::path::Path) -> FinopsService {
        let config = FinopsConfig {
            audit_dir: root.join("audit"),
            reports_dir: root.join("reports"),
            ..FinopsConfig::default()
        };
        FinopsService::new(config, Arc::new(MemoryLedger::new()), None)
    }

    #[test]
    fn match_config_follows_settings() {
        let config = FinopsConfig {
            clearing_fee_bps: 175,
            clearing_max_group: 4,
            ..FinopsConfig::default()
        };
        let m = config.match_config();
        assert_eq!(m.fee_bps, 175);
        assert_eq!(m.max_group_size, 4);
        assert_eq!(m.fee_fixed, Cents(30));
        assert!(config.xero_config().is_none());
    }

    #[test]
    fn ledger_errors_survive_anyhow_context() {
        let err: OpsError = anyhow::Error::new(LedgerError::transport("inv-1", "timeout"))
            .context("voiding")
            .into();
        assert!(matches!(err, OpsError::Ledger(LedgerError::Transport { .. })));
        let other: OpsError = anyhow::anyhow!("disk full").into();
        assert!(matches!(other, OpsError::Other(_)));
    }

    #[tokio::test]
    async fn rejects_bad_input_before_touching_the_ledger() {
        let dir = tempdir().expect("tempdir");
        let service = service(dir.path());
        let day = |d| NaiveDate::from_ymd_opt(2026, 9, d).unwrap();
        let err = service
            .reconcile_clearing(ClearingRequest {
                bank_account_id: "bank".into(),
                clearing_account_id: "clearing".into(),
                fee_account_code: None,
                fee_contact_name: None,
                from: day(20),
                to: day(1),
                dry_run: true,
            })
            .await
            .expect_err("inverted window");
        assert!(matches!(err, OpsError::InvalidInput(_)));

        let err = service
            .bulk(BulkRequest {
                operation: BulkOperation::Void,
                invoice_ids: vec![],
                dry_run: true,
            })
            .await
            .expect_err("no ids");
        assert!(matches!(err, OpsError::InvalidInput(_)));

        let err = service
            .bulk(BulkRequest {
                operation: BulkOperation::Void,
                invoice_ids: vec!["inv-1".into(), "  ".into()],
                dry_run: true,
            })
            .await
            .expect_err("blank id mixed in");
        assert!(matches!(err, OpsError::InvalidInput(ref msg) if msg.contains("blank")));
        assert!(matches!(service.budget_sync().await, Err(OpsError::NotConfigured(_))));
    }

    #[tokio::test]
    async fn clearing_dry_run_writes_a_report() {
        let dir = tempdir().expect("tempdir");
        let service = service(dir.path());
        let day = |d| NaiveDate::from_ymd_opt(2026, 9, d).unwrap();
        let outcome = service
            .reconcile_clearing(ClearingRequest {
                bank_account_id: "bank".into(),
                clearing_account_id: "clearing".into(),
                fee_account_code: None,
                fee_contact_name: None,
                from: day(1),
                to: day(30),
                dry_run: true,
            })
            .await
            .expect("empty reconciliation");
        assert_eq!(outcome.accounts.fee_account_code, "404");
        let report_dir = PathBuf::from(outcome.report_dir.expect("report dir"));
        assert!(report_dir.join("snapshots/manifest.json").exists());
    }
}
