//! Clear out an account's staged payments and bank transactions, then archive it.

use std::sync::Arc;

use anyhow::Result;
use finops_core::{Account, AccountStatus, AuditOutcome, PaymentStatus, RecordStatus};
use finops_integrations::{Ledger, LedgerError, NewPayment};
use finops_storage::AuditLog;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::steps::{irreversible_steps, reversal_plan, Auditor, LedgerStep, StepExecutor, StepRecord};

fn default_dry_run() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PurgeRequest {
    /// Account id or code.
    pub account: String,
    #[serde(default = "default_dry_run")]
    pub dry_run: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockedRecord {
    pub kind: String,
    pub id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PurgeOutcome {
    pub run_id: Uuid,
    pub dry_run: bool,
    pub account: Account,
    pub steps: Vec<StepRecord>,
    pub blocked: Vec<BlockedRecord>,
    pub archive_planned: bool,
    pub stopped_early: bool,
    pub reversal_plan: Vec<NewPayment>,
    /// Steps no reversal plan covers (`step:target`).
    #[serde(default)]
    pub irreversible_steps: Vec<String>,
}

pub async fn find_account(ledger: &dyn Ledger, account: &str) -> Result<Account, LedgerError> {
    let accounts = ledger.list_accounts().await?;
    accounts
        .into_iter()
        .find(|a| a.id == account || a.code.as_deref() == Some(account))
        .ok_or_else(|| LedgerError::NotFound {
            kind: "account",
            id: account.to_string(),
        })
}

pub async fn run_purge(ledger: &dyn Ledger, audit: Arc<AuditLog>, request: &PurgeRequest) -> Result<PurgeOutcome> {
    let account = find_account(ledger, &request.account).await?;
    let auditor = Auditor::new(audit, "account_purge", request.dry_run);
    let executor = StepExecutor::new(ledger, &auditor);

    let mut steps = Vec::new();
    let mut blocked = Vec::new();

    for payment in ledger.list_payments(Some(&account.id)).await? {
        if payment.status != PaymentStatus::Authorised {
            continue;
        }
        if payment.is_reconciled {
            blocked.push(BlockedRecord {
                kind: "payment".into(),
                id: payment.id,
                reason: "reconciled".into(),
            });
            continue;
        }
        let restore = payment.invoice_id.clone().map(|invoice_id| NewPayment {
            invoice_id,
            account_id: account.id.clone(),
            amount: payment.amount,
            date: payment.date,
            reference: payment.reference.clone(),
        });
        steps.push(LedgerStep::DeletePayment {
            payment_id: payment.id,
            restore,
        });
    }

    for txn in ledger.list_bank_transactions(&account.id, None, None).await? {
        if txn.status != RecordStatus::Authorised {
            continue;
        }
        if txn.is_reconciled {
            blocked.push(BlockedRecord {
                kind: "bank_transaction".into(),
                id: txn.id,
                reason: "reconciled".into(),
            });
            continue;
        }
        steps.push(LedgerStep::DeleteBankTransaction {
            bank_transaction_id: txn.id,
        });
    }

    for record in &blocked {
        auditor
            .record(
                &record.id,
                "plan",
                AuditOutcome::Skipped,
                serde_json::json!({"kind": record.kind, "reason": record.reason}),
            )
            .await?;
    }

    let archive_planned = blocked.is_empty() && account.status == AccountStatus::Active;
    if archive_planned {
        steps.push(LedgerStep::ArchiveAccount {
            account_id: account.id.clone(),
        });
    } else {
        let reason = if blocked.is_empty() {
            "account is not active"
        } else {
            "reconciled records remain"
        };
        auditor
            .record(&account.id, "archive_account", AuditOutcome::Skipped, serde_json::json!({"reason": reason}))
            .await?;
    }

    info!(
        run_id = %auditor.run_id(),
        account = %account.id,
        steps = steps.len(),
        blocked = blocked.len(),
        dry_run = request.dry_run,
        "purging account"
    );
    let (steps, stopped_early) = executor.run_all(steps).await?;
    Ok(PurgeOutcome {
        run_id: auditor.run_id(),
        dry_run: request.dry_run,
        account,
        reversal_plan: reversal_plan(&steps),
        irreversible_steps: irreversible_steps(&steps),
        steps,
        blocked,
        archive_planned,
        stopped_early,
    })
}
