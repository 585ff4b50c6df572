//! Ledger and banking integration contracts + vendor clients (Xero, Up Bank).

pub mod memory;
pub mod up;
pub mod xero;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use finops_core::{
    Account, BankTransaction, BudgetTransaction, Cents, Invoice, InvoiceKind, InvoiceStatus, Payment,
};
use finops_storage::ApiError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use memory::MemoryLedger;
pub use up::{UpBankClient, UpBankConfig};
pub use xero::{XeroClient, XeroConfig};

pub const CRATE_NAME: &str = "finops-integrations";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("ledger rejected {target}: {message}")]
    Rejected { target: String, message: String },
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },
    #[error("ledger transport error on {target}: {message}")]
    Transport { target: String, message: String },
}

impl LedgerError {
    pub fn rejected(target: impl Into<String>, message: impl Into<String>) -> Self {
        LedgerError::Rejected {
            target: target.into(),
            message: message.into(),
        }
    }

    pub fn transport(target: impl Into<String>, message: impl Into<String>) -> Self {
        LedgerError::Transport {
            target: target.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceFilter {
    #[serde(default)]
    pub ids: Vec<String>,
    #[serde(default)]
    pub statuses: Vec<InvoiceStatus>,
    #[serde(default)]
    pub kind: Option<InvoiceKind>,
    #[serde(default)]
    pub contact: Option<String>,
    #[serde(default)]
    pub from: Option<NaiveDate>,
    #[serde(default)]
    pub to: Option<NaiveDate>,
}

impl InvoiceFilter {
    pub fn by_ids(ids: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            ids: ids.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn matches(&self, invoice: &Invoice) -> bool {
        if !self.ids.is_empty() && !self.ids.iter().any(|id| id == &invoice.id) {
            return false;
        }
        if !self.statuses.is_empty() && !self.statuses.contains(&invoice.status) {
            return false;
        }
        if self.kind.is_some_and(|kind| kind != invoice.kind) {
            return false;
        }
        if let Some(needle) = self.contact.as_deref().map(str::to_ascii_lowercase) {
            let name = invoice.contact_name.as_deref().unwrap_or_default().to_ascii_lowercase();
            if !name.contains(&needle) {
                return false;
            }
        }
        if self.from.is_some_and(|from| invoice.date < from) {
            return false;
        }
        if self.to.is_some_and(|to| invoice.date > to) {
            return false;
        }
        true
    }
}

/// Enough to re-create a deleted payment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewPayment {
    pub invoice_id: String,
    pub account_id: String,
    pub amount: Cents,
    pub date: NaiveDate,
    #[serde(default)]
    pub reference: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTransfer {
    pub from_account_id: String,
    pub to_account_id: String,
    pub amount: Cents,
    pub date: NaiveDate,
    #[serde(default)]
    pub reference: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewSpend {
    pub account_id: String,
    pub contact_name: String,
    pub expense_account_code: String,
    pub amount: Cents,
    pub date: NaiveDate,
    pub description: String,
    #[serde(default)]
    pub reference: Option<String>,
}

/// Accounting ledger operations the reconciliation and remediation tooling needs.
#[async_trait]
pub trait Ledger: Send + Sync {
    fn name(&self) -> &'static str;

    async fn list_invoices(&self, filter: &InvoiceFilter) -> Result<Vec<Invoice>, LedgerError>;

    async fn get_invoice(&self, id: &str) -> Result<Invoice, LedgerError>;

    async fn get_payment(&self, id: &str) -> Result<Payment, LedgerError>;

    /// Authorised and deleted payments, optionally restricted to one account.
    async fn list_payments(&self, account_id: Option<&str>) -> Result<Vec<Payment>, LedgerError>;

    async fn list_bank_transactions(
        &self,
        account_id: &str,
        from: Option<NaiveDate>,
        to: Option<NaiveDate>,
    ) -> Result<Vec<BankTransaction>, LedgerError>;

    async fn list_accounts(&self) -> Result<Vec<Account>, LedgerError>;

    async fn delete_invoice(&self, id: &str) -> Result<(), LedgerError>;

    async fn void_invoice(&self, id: &str) -> Result<(), LedgerError>;

    async fn delete_payment(&self, id: &str) -> Result<(), LedgerError>;

    async fn create_payment(&self, payment: &NewPayment) -> Result<(), LedgerError>;

    async fn delete_bank_transaction(&self, id: &str) -> Result<(), LedgerError>;

    async fn archive_account(&self, id: &str) -> Result<(), LedgerError>;

    async fn create_bank_transfer(&self, transfer: &NewTransfer) -> Result<(), LedgerError>;

    async fn create_spend(&self, spend: &NewSpend) -> Result<(), LedgerError>;
}

/// A feed of personal banking transactions for the budget tracker.
#[async_trait]
pub trait TransactionSource: Send + Sync {
    fn source_id(&self) -> &'static str;

    async fn transactions_since(&self, since: Option<DateTime<Utc>>) -> anyhow::Result<Vec<BudgetTransaction>>;
}

pub(crate) fn ledger_error_from_api(target: &str, err: ApiError) -> LedgerError {
    match &err {
        ApiError::HttpStatus { status: 400, body, .. } => {
            LedgerError::rejected(target, xero::validation_message(body).unwrap_or_else(|| body.clone()))
        }
        ApiError::HttpStatus { status: 404, .. } => LedgerError::NotFound {
            kind: "record",
            id: target.to_string(),
        },
        _ => LedgerError::transport(target, err.to_string()),
    }
}
