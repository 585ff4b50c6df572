//! Audited, fail-fast execution of individual ledger mutations.

use std::sync::Arc;

use anyhow::Result;
use finops_core::{AuditEvent, AuditOutcome};
use finops_integrations::{Ledger, LedgerError, NewPayment, NewSpend, NewTransfer};
use finops_storage::AuditLog;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

/// One state-changing call against the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum LedgerStep {
    DeleteInvoice {
        invoice_id: String,
    },
    VoidInvoice {
        invoice_id: String,
    },
    DeletePayment {
        payment_id: String,
        #[serde(default)]
        restore: Option<NewPayment>,
    },
    CreatePayment {
        payment: NewPayment,
    },
    DeleteBankTransaction {
        bank_transaction_id: String,
    },
    ArchiveAccount {
        account_id: String,
    },
    CreateTransfer {
        transfer: NewTransfer,
    },
    CreateSpend {
        spend: NewSpend,
    },
}

impl LedgerStep {
    pub fn name(&self) -> &'static str {
        match self {
            LedgerStep::DeleteInvoice { .. } => "delete_invoice",
            LedgerStep::VoidInvoice { .. } => "void_invoice",
            LedgerStep::DeletePayment { .. } => "delete_payment",
            LedgerStep::CreatePayment { .. } => "create_payment",
            LedgerStep::DeleteBankTransaction { .. } => "delete_bank_transaction",
            LedgerStep::ArchiveAccount { .. } => "archive_account",
            LedgerStep::CreateTransfer { .. } => "create_transfer",
            LedgerStep::CreateSpend { .. } => "create_spend",
        }
    }

    pub fn target(&self) -> String {
        match self {
            LedgerStep::DeleteInvoice { invoice_id } | LedgerStep::VoidInvoice { invoice_id } => invoice_id.clone(),
            LedgerStep::DeletePayment { payment_id, .. } => payment_id.clone(),
            LedgerStep::CreatePayment { payment } => payment.invoice_id.clone(),
            LedgerStep::DeleteBankTransaction { bank_transaction_id } => bank_transaction_id.clone(),
            LedgerStep::ArchiveAccount { account_id } => account_id.clone(),
            LedgerStep::CreateTransfer { transfer } => {
                format!("{}->{}", transfer.from_account_id, transfer.to_account_id)
            }
            LedgerStep::CreateSpend { spend } => spend.account_id.clone(),
        }
    }

    /// Whether a reversal plan can undo this step. A deleted payment only counts
    /// when its restore payload was captured; a created payment can be deleted again.
    pub fn is_reversible(&self) -> bool {
        match self {
            LedgerStep::DeletePayment { restore, .. } => restore.is_some(),
            LedgerStep::CreatePayment { .. } => true,
            LedgerStep::DeleteInvoice { .. }
            | LedgerStep::VoidInvoice { .. }
            | LedgerStep::DeleteBankTransaction { .. }
            | LedgerStep::ArchiveAccount { .. }
            | LedgerStep::CreateTransfer { .. }
            | LedgerStep::CreateSpend { .. } => false,
        }
    }

    pub async fn execute(&self, ledger: &dyn Ledger) -> Result<(), LedgerError> {
        match self {
            LedgerStep::DeleteInvoice { invoice_id } => ledger.delete_invoice(invoice_id).await,
            LedgerStep::VoidInvoice { invoice_id } => ledger.void_invoice(invoice_id).await,
            LedgerStep::DeletePayment { payment_id, .. } => ledger.delete_payment(payment_id).await,
            LedgerStep::CreatePayment { payment } => ledger.create_payment(payment).await,
            LedgerStep::DeleteBankTransaction { bank_transaction_id } => {
                ledger.delete_bank_transaction(bank_transaction_id).await
            }
            LedgerStep::ArchiveAccount { account_id } => ledger.archive_account(account_id).await,
            LedgerStep::CreateTransfer { transfer } => ledger.create_bank_transfer(transfer).await,
            LedgerStep::CreateSpend { spend } => ledger.create_spend(spend).await,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StepStatus {
    Planned,
    Succeeded,
    Failed { error: String },
    NotAttempted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRecord {
    pub step: LedgerStep,
    #[serde(flatten)]
    pub status: StepStatus,
}

impl StepRecord {
    pub fn not_attempted(step: LedgerStep) -> Self {
        Self {
            step,
            status: StepStatus::NotAttempted,
        }
    }
}

/// Writes audit events for one run of one operation.
#[derive(Debug, Clone)]
pub struct Auditor {
    log: Arc<AuditLog>,
    run_id: Uuid,
    operation: String,
    dry_run: bool,
}

impl Auditor {
    pub fn new(log: Arc<AuditLog>, operation: impl Into<String>, dry_run: bool) -> Self {
        Self {
            log,
            run_id: Uuid::new_v4(),
            operation: operation.into(),
            dry_run,
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn dry_run(&self) -> bool {
        self.dry_run
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    pub async fn record(
        &self,
        target: &str,
        step: &str,
        outcome: AuditOutcome,
        detail: serde_json::Value,
    ) -> Result<()> {
        let event = AuditEvent::new(self.run_id, &self.operation, target, step, self.dry_run, outcome)
            .with_detail(detail);
        self.log.append(event).await?;
        Ok(())
    }
}

/// Runs steps one at a time; the caller stops at the first `Failed`.
pub struct StepExecutor<'a> {
    ledger: &'a dyn Ledger,
    auditor: &'a Auditor,
}

impl<'a> StepExecutor<'a> {
    pub fn new(ledger: &'a dyn Ledger, auditor: &'a Auditor) -> Self {
        Self { ledger, auditor }
    }

    pub fn auditor(&self) -> &Auditor {
        self.auditor
    }

    /// Audit the step as planned without calling the ledger.
    pub async fn plan(&self, step: LedgerStep) -> Result<StepRecord> {
        self.auditor
            .record(&step.target(), step.name(), AuditOutcome::Planned, serde_json::to_value(&step)?)
            .await?;
        Ok(StepRecord {
            step,
            status: StepStatus::Planned,
        })
    }

    /// Ledger failures come back as `StepStatus::Failed`; `Err` is reserved for audit I/O.
    pub async fn run(&self, step: LedgerStep) -> Result<StepRecord> {
        let target = step.target();
        match step.execute(self.ledger).await {
            Ok(()) => {
                info!(run_id = %self.auditor.run_id(), step = step.name(), %target, "ledger step succeeded");
                self.auditor
                    .record(&target, step.name(), AuditOutcome::Succeeded, serde_json::to_value(&step)?)
                    .await?;
                Ok(StepRecord {
                    step,
                    status: StepStatus::Succeeded,
                })
            }
            Err(err) => {
                warn!(run_id = %self.auditor.run_id(), step = step.name(), %target, error = %err, "ledger step failed");
                self.auditor
                    .record(
                        &target,
                        step.name(),
                        AuditOutcome::Failed,
                        serde_json::json!({"step": step, "error": err.to_string()}),
                    )
                    .await?;
                Ok(StepRecord {
                    step,
                    status: StepStatus::Failed {
                        error: err.to_string(),
                    },
                })
            }
        }
    }

    /// Plan or run `steps` in order, marking everything after the first failure `NotAttempted`.
    pub async fn run_all(&self, steps: Vec<LedgerStep>) -> Result<(Vec<StepRecord>, bool)> {
        let mut records = Vec::with_capacity(steps.len());
        let mut failed = false;
        for step in steps {
            if failed {
                records.push(StepRecord::not_attempted(step));
                continue;
            }
            let record = if self.auditor.dry_run() {
                self.plan(step).await?
            } else {
                self.run(step).await?
            };
            failed = matches!(record.status, StepStatus::Failed { .. });
            records.push(record);
        }
        Ok((records, failed))
    }
}

/// Planned or applied steps nothing can undo, as `step:target`.
pub fn irreversible_steps(records: &[StepRecord]) -> Vec<String> {
    records
        .iter()
        .filter(|r| matches!(r.status, StepStatus::Succeeded | StepStatus::Planned) && !r.step.is_reversible())
        .map(|r| format!("{}:{}", r.step.name(), r.step.target()))
        .collect()
}

/// Payments deleted by succeeded steps, in the order they can be re-created.
pub fn reversal_plan(records: &[StepRecord]) -> Vec<NewPayment> {
    records
        .iter()
        .filter(|r| r.status == StepStatus::Succeeded)
        .filter_map(|r| match &r.step {
            LedgerStep::DeletePayment {
                restore: Some(payment), ..
            } => Some(payment.clone()),
            _ => None,
        })
        .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreOutcome {
    pub run_id: Uuid,
    pub steps: Vec<StepRecord>,
    pub stopped_early: bool,
}

/// Re-create payments from a reversal plan, sequentially and fail-fast.
pub async fn restore_payments(
    ledger: &dyn Ledger,
    audit: Arc<AuditLog>,
    plan: &[NewPayment],
) -> Result<RestoreOutcome> {
    let auditor = Auditor::new(audit, "restore_payments", false);
    let executor = StepExecutor::new(ledger, &auditor);
    let steps = plan
        .iter()
        .cloned()
        .map(|payment| LedgerStep::CreatePayment { payment })
        .collect();
    let (steps, stopped_early) = executor.run_all(steps).await?;
    Ok(RestoreOutcome {
        run_id: auditor.run_id(),
        steps,
        stopped_early,
    })
}
