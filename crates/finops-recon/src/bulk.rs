//! Bulk delete / void / un-pay of invoices.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::Result;
use finops_core::{AuditOutcome, Invoice, InvoiceStatus, Payment, PaymentStatus};
use finops_integrations::{Ledger, LedgerError, NewPayment};
use finops_storage::AuditLog;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::steps::{irreversible_steps, reversal_plan, Auditor, LedgerStep, StepExecutor, StepRecord, StepStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BulkOperation {
    Delete,
    Void,
    Unpay,
    UnpayAndVoid,
}

impl BulkOperation {
    pub fn as_str(self) -> &'static str {
        match self {
            BulkOperation::Delete => "delete",
            BulkOperation::Void => "void",
            BulkOperation::Unpay => "unpay",
            BulkOperation::UnpayAndVoid => "unpay_and_void",
        }
    }
}

impl fmt::Display for BulkOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BulkOperation {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "delete" => Ok(BulkOperation::Delete),
            "void" => Ok(BulkOperation::Void),
            "unpay" => Ok(BulkOperation::Unpay),
            "unpay_and_void" => Ok(BulkOperation::UnpayAndVoid),
            other => Err(format!("unknown bulk operation `{other}`")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemPlan {
    Steps(Vec<LedgerStep>),
    Skip(String),
}

/// Map an invoice's status and live payments to the steps `op` needs.
pub fn plan_item(op: BulkOperation, invoice: &Invoice, payments: &[Payment]) -> ItemPlan {
    use BulkOperation::*;
    use InvoiceStatus::*;

    let live: Vec<&Payment> = payments.iter().filter(|p| p.status == PaymentStatus::Authorised).collect();

    match invoice.status {
        InvoiceStatus::Deleted => return ItemPlan::Skip("already deleted".into()),
        Voided => return ItemPlan::Skip("already voided".into()),
        Draft | Submitted => {
            return match op {
                Delete | Void | UnpayAndVoid => ItemPlan::Steps(vec![LedgerStep::DeleteInvoice {
                    invoice_id: invoice.id.clone(),
                }]),
                Unpay => ItemPlan::Skip("nothing to unpay".into()),
            };
        }
        Authorised | Paid => {}
    }

    if live.is_empty() {
        if invoice.status == Paid || invoice.amount_paid.is_positive() {
            return ItemPlan::Skip("paid by allocation or credit note; no payments to remove".into());
        }
        return match op {
            Void | UnpayAndVoid => ItemPlan::Steps(vec![LedgerStep::VoidInvoice {
                invoice_id: invoice.id.clone(),
            }]),
            Delete => ItemPlan::Skip("authorised invoices must be voided, not deleted".into()),
            Unpay => ItemPlan::Skip("nothing to unpay".into()),
        };
    }

    if matches!(op, Delete | Void) {
        return ItemPlan::Skip("has payments; un-pay first".into());
    }
    if let Some(reconciled) = live.iter().find(|p| p.is_reconciled) {
        return ItemPlan::Skip(format!("payment {} is reconciled", reconciled.id));
    }
    if let Some(orphan) = live.iter().find(|p| p.account_id.is_none()) {
        return ItemPlan::Skip(format!("payment {} has no account to restore it to", orphan.id));
    }

    let mut steps: Vec<LedgerStep> = live
        .iter()
        .map(|p| LedgerStep::DeletePayment {
            payment_id: p.id.clone(),
            restore: restore_for(invoice, p),
        })
        .collect();
    if op == UnpayAndVoid {
        steps.push(LedgerStep::VoidInvoice {
            invoice_id: invoice.id.clone(),
        });
    }
    ItemPlan::Steps(steps)
}

pub(crate) fn restore_for(invoice: &Invoice, payment: &Payment) -> Option<NewPayment> {
    Some(NewPayment {
        invoice_id: invoice.id.clone(),
        account_id: payment.account_id.clone()?,
        amount: payment.amount,
        date: payment.date,
        reference: payment.reference.clone(),
    })
}

fn default_dry_run() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkRequest {
    pub operation: BulkOperation,
    pub invoice_ids: Vec<String>,
    #[serde(default = "default_dry_run")]
    pub dry_run: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ItemStatus {
    Planned,
    Succeeded,
    Skipped { reason: String },
    Failed { error: String, completed_steps: usize },
    NotAttempted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkItem {
    pub invoice_id: String,
    pub invoice_number: Option<String>,
    pub status_before: Option<InvoiceStatus>,
    #[serde(flatten)]
    pub status: ItemStatus,
    pub steps: Vec<StepRecord>,
}

impl BulkItem {
    fn new(invoice_id: &str, status: ItemStatus) -> Self {
        Self {
            invoice_id: invoice_id.to_string(),
            invoice_number: None,
            status_before: None,
            status,
            steps: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkCounts {
    pub planned: usize,
    pub succeeded: usize,
    pub skipped: usize,
    pub failed: usize,
    pub not_attempted: usize,
}

impl BulkCounts {
    fn tally(items: &[BulkItem]) -> Self {
        let mut counts = Self::default();
        for item in items {
            match item.status {
                ItemStatus::Planned => counts.planned += 1,
                ItemStatus::Succeeded => counts.succeeded += 1,
                ItemStatus::Skipped { .. } => counts.skipped += 1,
                ItemStatus::Failed { .. } => counts.failed += 1,
                ItemStatus::NotAttempted => counts.not_attempted += 1,
            }
        }
        counts
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkOutcome {
    pub run_id: Uuid,
    pub operation: BulkOperation,
    pub dry_run: bool,
    pub items: Vec<BulkItem>,
    pub counts: BulkCounts,
    pub stopped_early: bool,
    /// Payments to re-create with `restore_payments` to undo the un-pay steps.
    pub reversal_plan: Vec<NewPayment>,
    /// Steps with no inverse (`step:target`).
    pub irreversible_steps: Vec<String>,
}

pub async fn run_bulk(ledger: &dyn Ledger, audit: Arc<AuditLog>, request: &BulkRequest) -> Result<BulkOutcome> {
    let auditor = Auditor::new(audit, format!("bulk_{}", request.operation), request.dry_run);
    let executor = StepExecutor::new(ledger, &auditor);
    info!(
        run_id = %auditor.run_id(),
        operation = %request.operation,
        items = request.invoice_ids.len(),
        dry_run = request.dry_run,
        "starting bulk invoice operation"
    );

    let mut seen = HashSet::new();
    let ids: Vec<&String> = request.invoice_ids.iter().filter(|id| seen.insert(id.as_str())).collect();

    let mut items = Vec::with_capacity(ids.len());
    let mut stopped = false;
    for id in ids {
        if stopped {
            items.push(BulkItem::new(id, ItemStatus::NotAttempted));
            continue;
        }
        let item = process_item(ledger, &executor, request.operation, id).await?;
        stopped = matches!(item.status, ItemStatus::Failed { .. });
        items.push(item);
    }

    let records: Vec<StepRecord> = items.iter().flat_map(|i| i.steps.iter().cloned()).collect();
    let irreversible_steps = irreversible_steps(&records);
    let outcome = BulkOutcome {
        run_id: auditor.run_id(),
        operation: request.operation,
        dry_run: request.dry_run,
        counts: BulkCounts::tally(&items),
        stopped_early: stopped,
        reversal_plan: reversal_plan(&records),
        irreversible_steps,
        items,
    };
    info!(run_id = %outcome.run_id, counts = ?outcome.counts, stopped_early = outcome.stopped_early, "bulk invoice operation finished");
    Ok(outcome)
}

async fn process_item(
    ledger: &dyn Ledger,
    executor: &StepExecutor<'_>,
    op: BulkOperation,
    id: &str,
) -> Result<BulkItem> {
    let auditor = executor.auditor();
    let invoice = match ledger.get_invoice(id).await {
        Ok(invoice) => invoice,
        Err(LedgerError::NotFound { .. }) => {
            auditor
                .record(id, "plan", AuditOutcome::Skipped, serde_json::json!({"reason": "invoice not found"}))
                .await?;
            return Ok(BulkItem::new(
                id,
                ItemStatus::Skipped {
                    reason: "invoice not found".into(),
                },
            ));
        }
        Err(err) => return failed_lookup(auditor, id, err).await,
    };

    let mut payments = Vec::with_capacity(invoice.payments.len());
    for payment in &invoice.payments {
        match ledger.get_payment(&payment.id).await {
            Ok(p) => payments.push(p),
            Err(err) => return failed_lookup(auditor, id, err).await,
        }
    }

    let mut item = BulkItem::new(id, ItemStatus::Planned);
    item.invoice_number = invoice.number.clone();
    item.status_before = Some(invoice.status);

    let steps = match plan_item(op, &invoice, &payments) {
        ItemPlan::Skip(reason) => {
            auditor
                .record(
                    id,
                    "plan",
                    AuditOutcome::Skipped,
                    serde_json::json!({"reason": reason, "status": invoice.status}),
                )
                .await?;
            item.status = ItemStatus::Skipped { reason };
            return Ok(item);
        }
        ItemPlan::Steps(steps) => steps,
    };

    let (records, failed) = executor.run_all(steps).await?;
    item.status = if failed {
        let error = records
            .iter()
            .find_map(|r| match &r.status {
                StepStatus::Failed { error } => Some(error.clone()),
                _ => None,
            })
            .unwrap_or_default();
        let completed_steps = records.iter().filter(|r| r.status == StepStatus::Succeeded).count();
        warn!(invoice = id, %error, completed_steps, "bulk item failed; stopping run");
        ItemStatus::Failed { error, completed_steps }
    } else if auditor.dry_run() {
        ItemStatus::Planned
    } else {
        ItemStatus::Succeeded
    };
    item.steps = records;
    Ok(item)
}

async fn failed_lookup(auditor: &Auditor, id: &str, err: LedgerError) -> Result<BulkItem> {
    warn!(invoice = id, error = %err, "invoice lookup failed; stopping run");
    auditor
        .record(id, "lookup", AuditOutcome::Failed, serde_json::json!({"error": err.to_string()}))
        .await?;
    Ok(BulkItem::new(
        id,
        ItemStatus::Failed {
            error: err.to_string(),
            completed_steps: 0,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use finops_core::{Cents, InvoiceKind};
    use finops_integrations::MemoryLedger;
    use finops_storage::read_audit_file;
    use tempfile::tempdir;

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 8, 3).unwrap()
    }

    fn invoice(id: &str, status: InvoiceStatus, paid: i64) -> Invoice {
        Invoice {
            id: id.to_string(),
            number: Some(format!("INV-{id}")),
            kind: InvoiceKind::Receivable,
            contact_name: Some("Northside Rehab".into()),
            status,
            date: day(),
            total: Cents(20_000),
            amount_due: Cents(20_000 - paid),
            amount_paid: Cents(paid),
            payments: vec![],
            reference: None,
        }
    }

    fn payment(id: &str, invoice_id: &str, amount: i64, reconciled: bool) -> Payment {
        Payment {
            id: id.to_string(),
            invoice_id: Some(invoice_id.to_string()),
            account_id: Some("acc-clearing".into()),
            contact_name: None,
            amount: Cents(amount),
            date: day(),
            status: PaymentStatus::Authorised,
            is_reconciled: reconciled,
            reference: Some("card".into()),
        }
    }

    fn request(op: BulkOperation, ids: &[&str], dry_run: bool) -> BulkRequest {
        BulkRequest {
            operation: op,
            invoice_ids: ids.iter().map(|s| s.to_string()).collect(),
            dry_run,
        }
    }

    #[test]
    fn status_table() {
        let draft = invoice("d", InvoiceStatus::Draft, 0);
        let open = invoice("a", InvoiceStatus::Authorised, 0);
        let voided = invoice("v", InvoiceStatus::Voided, 0);

        assert!(matches!(plan_item(BulkOperation::Void, &draft, &[]), ItemPlan::Steps(s) if s == vec![LedgerStep::DeleteInvoice { invoice_id: "d".into() }]));
        assert_eq!(plan_item(BulkOperation::Unpay, &draft, &[]), ItemPlan::Skip("nothing to unpay".into()));
        assert!(matches!(plan_item(BulkOperation::Delete, &open, &[]), ItemPlan::Skip(_)));
        assert!(matches!(plan_item(BulkOperation::UnpayAndVoid, &open, &[]), ItemPlan::Steps(s) if s.len() == 1));
        assert_eq!(plan_item(BulkOperation::Delete, &voided, &[]), ItemPlan::Skip("already voided".into()));

        let mut paid = invoice("p", InvoiceStatus::Paid, 20_000);
        let p = payment("pay-1", "p", 20_000, false);
        paid.payments.push(finops_core::PaymentRef {
            id: p.id.clone(),
            amount: p.amount,
            date: p.date,
        });
        assert_eq!(
            plan_item(BulkOperation::Void, &paid, &[p.clone()]),
            ItemPlan::Skip("has payments; un-pay first".into())
        );
        match plan_item(BulkOperation::UnpayAndVoid, &paid, &[p.clone()]) {
            ItemPlan::Steps(steps) => {
                assert_eq!(steps.len(), 2);
                assert_eq!(steps[0].name(), "delete_payment");
                assert_eq!(steps[1].name(), "void_invoice");
            }
            other => panic!("unexpected plan {other:?}"),
        }

        let reconciled = payment("pay-2", "p", 20_000, true);
        assert_eq!(
            plan_item(BulkOperation::Unpay, &paid, &[reconciled]),
            ItemPlan::Skip("payment pay-2 is reconciled".into())
        );

        let mut accountless = payment("pay-3", "p", 20_000, false);
        accountless.account_id = None;
        assert_eq!(
            plan_item(BulkOperation::Unpay, &paid, &[accountless]),
            ItemPlan::Skip("payment pay-3 has no account to restore it to".into())
        );
    }

    #[test]
    fn operation_parses_cli_spellings() {
        assert_eq!("unpay-and-void".parse::<BulkOperation>().unwrap(), BulkOperation::UnpayAndVoid);
        assert_eq!("VOID".parse::<BulkOperation>().unwrap(), BulkOperation::Void);
        assert!("archive".parse::<BulkOperation>().is_err());
    }

    #[tokio::test]
    async fn unpay_and_void_executes_and_records_reversal_plan() {
        let dir = tempdir().expect("tempdir");
        let audit = Arc::new(AuditLog::new(dir.path()));
        let ledger = MemoryLedger::new()
            .with_invoice(invoice("a", InvoiceStatus::Paid, 20_000))
            .with_payment(payment("pay-1", "a", 20_000, false))
            .with_invoice(invoice("b", InvoiceStatus::Draft, 0));

        let outcome = run_bulk(&ledger, audit.clone(), &request(BulkOperation::UnpayAndVoid, &["a", "b", "a", "zzz"], false))
            .await
            .expect("bulk run");

        assert_eq!(outcome.items.len(), 3);
        assert_eq!(outcome.counts.succeeded, 2);
        assert_eq!(outcome.counts.skipped, 1);
        assert!(!outcome.stopped_early);
        assert_eq!(ledger.invoice("a").await.unwrap().status, InvoiceStatus::Voided);
        assert_eq!(ledger.invoice("b").await.unwrap().status, InvoiceStatus::Deleted);
        assert_eq!(outcome.reversal_plan.len(), 1);
        assert_eq!(outcome.reversal_plan[0].amount, Cents(20_000));
        assert_eq!(outcome.irreversible_steps, vec!["void_invoice:a", "delete_invoice:b"]);

        let path = audit.path_for_run(outcome.run_id).await.expect("audit file");
        let records = read_audit_file(path).await.expect("audit");
        assert_eq!(records.len(), 4);
        finops_storage::verify_chain(&records).expect("chain intact");
    }

    #[tokio::test]
    async fn failure_stops_the_run_and_marks_the_rest_not_attempted() {
        let dir = tempdir().expect("tempdir");
        let audit = Arc::new(AuditLog::new(dir.path()));
        let ledger = MemoryLedger::new()
            .with_invoice(invoice("a", InvoiceStatus::Authorised, 0))
            .with_invoice(invoice("b", InvoiceStatus::Authorised, 0))
            .with_invoice(invoice("c", InvoiceStatus::Authorised, 0))
            .fail_on_mutation(2);

        let outcome = run_bulk(&ledger, audit, &request(BulkOperation::Void, &["a", "b", "c"], false))
            .await
            .expect("bulk run");

        assert!(outcome.stopped_early);
        assert_eq!(outcome.items[0].status, ItemStatus::Succeeded);
        assert!(matches!(
            outcome.items[1].status,
            ItemStatus::Failed { completed_steps: 0, .. }
        ));
        assert_eq!(outcome.items[2].status, ItemStatus::NotAttempted);
        assert_eq!(ledger.calls().await, vec!["void_invoice:a", "void_invoice:b"]);
        assert_eq!(ledger.invoice("c").await.unwrap().status, InvoiceStatus::Authorised);
    }

    #[tokio::test]
    async fn dry_run_plans_every_item_without_mutating() {
        let dir = tempdir().expect("tempdir");
        let audit = Arc::new(AuditLog::new(dir.path()));
        let ledger = MemoryLedger::new()
            .with_invoice(invoice("a", InvoiceStatus::Paid, 20_000))
            .with_payment(payment("pay-1", "a", 20_000, false));

        let outcome = run_bulk(&ledger, audit, &request(BulkOperation::Unpay, &["a"], true))
            .await
            .expect("dry run");

        assert_eq!(outcome.counts.planned, 1);
        assert_eq!(outcome.items[0].steps[0].status, StepStatus::Planned);
        assert!(ledger.calls().await.is_empty());
        assert!(outcome.reversal_plan.is_empty());
    }

    #[tokio::test]
    async fn restore_recreates_deleted_payments() {
        let dir = tempdir().expect("tempdir");
        let audit = Arc::new(AuditLog::new(dir.path()));
        let ledger = MemoryLedger::new()
            .with_invoice(invoice("a", InvoiceStatus::Paid, 20_000))
            .with_payment(payment("pay-1", "a", 20_000, false));

        let outcome = run_bulk(&ledger, audit.clone(), &request(BulkOperation::Unpay, &["a"], false))
            .await
            .expect("unpay");
        assert_eq!(ledger.invoice("a").await.unwrap().status, InvoiceStatus::Authorised);

        let restored = crate::steps::restore_payments(&ledger, audit, &outcome.reversal_plan)
            .await
            .expect("restore");
        assert!(!restored.stopped_early);
        let invoice = ledger.invoice("a").await.unwrap();
        assert_eq!(invoice.status, InvoiceStatus::Paid);
        assert_eq!(invoice.amount_due, Cents::ZERO);
    }
}
