//! Core ledger, banking, and audit domain types for finops.

use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign, Neg, Sub, SubAssign};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "finops-core";

/// Signed money amount in minor units (cents).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cents(pub i64);

impl Cents {
    pub const ZERO: Cents = Cents(0);

    /// Convert a decimal major-unit amount (as Xero sends it) into cents.
    pub fn from_decimal(value: f64) -> Self {
        Cents((value * 100.0).round() as i64)
    }

    /// Parse a decimal string such as `"-12.34"` or `"7"`.
    pub fn parse_decimal(input: &str) -> Option<Self> {
        let trimmed = input.trim();
        let (negative, digits) = match trimmed.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, trimmed.strip_prefix('+').unwrap_or(trimmed)),
        };
        let (whole, frac) = match digits.split_once('.') {
            Some((w, f)) => (w, f),
            None => (digits, ""),
        };
        if whole.is_empty() && frac.is_empty() {
            return None;
        }
        if frac.len() > 2 || !whole.chars().chain(frac.chars()).all(|c| c.is_ascii_digit()) {
            return None;
        }
        let whole: i64 = if whole.is_empty() { 0 } else { whole.parse().ok()? };
        let frac: i64 = match frac.len() {
            0 => 0,
            1 => frac.parse::<i64>().ok()? * 10,
            _ => frac.parse().ok()?,
        };
        let value = whole.checked_mul(100)?.checked_add(frac)?;
        Some(Cents(if negative { -value } else { value }))
    }

    pub fn to_decimal(self) -> f64 {
        self.0 as f64 / 100.0
    }

    pub fn abs(self) -> Self {
        Cents(self.0.abs())
    }

    pub fn is_positive(self) -> bool {
        self.0 > 0
    }

    pub fn is_negative(self) -> bool {
        self.0 < 0
    }

    /// `self * bps / 10_000`, rounded half away from zero.
    pub fn basis_points(self, bps: i64) -> Self {
        let scaled = self.0 as i128 * bps as i128;
        let half = if scaled < 0 { -5_000 } else { 5_000 };
        Cents(((scaled + half) / 10_000) as i64)
    }

    /// Ratio `self / of` in basis points; zero when `of` is zero.
    pub fn ratio_bps(self, of: Cents) -> i64 {
        if of.0 == 0 {
            return 0;
        }
        ((self.0 as i128 * 10_000) / of.0 as i128) as i64
    }
}

impl fmt::Display for Cents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{sign}{}.{:02}", abs / 100, abs % 100)
    }
}

impl Add for Cents {
    type Output = Cents;

    fn add(self, rhs: Cents) -> Cents {
        Cents(self.0 + rhs.0)
    }
}

impl AddAssign for Cents {
    fn add_assign(&mut self, rhs: Cents) {
        self.0 += rhs.0;
    }
}

impl Sub for Cents {
    type Output = Cents;

    fn sub(self, rhs: Cents) -> Cents {
        Cents(self.0 - rhs.0)
    }
}

impl SubAssign for Cents {
    fn sub_assign(&mut self, rhs: Cents) {
        self.0 -= rhs.0;
    }
}

impl Neg for Cents {
    type Output = Cents;

    fn neg(self) -> Cents {
        Cents(-self.0)
    }
}

impl Sum for Cents {
    fn sum<I: Iterator<Item = Cents>>(iter: I) -> Cents {
        iter.fold(Cents::ZERO, Add::add)
    }
}

impl<'a> Sum<&'a Cents> for Cents {
    fn sum<I: Iterator<Item = &'a Cents>>(iter: I) -> Cents {
        iter.copied().sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InvoiceStatus {
    Draft,
    Submitted,
    Authorised,
    Paid,
    Voided,
    Deleted,
}

impl InvoiceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            InvoiceStatus::Draft => "DRAFT",
            InvoiceStatus::Submitted => "SUBMITTED",
            InvoiceStatus::Authorised => "AUTHORISED",
            InvoiceStatus::Paid => "PAID",
            InvoiceStatus::Voided => "VOIDED",
            InvoiceStatus::Deleted => "DELETED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "DRAFT" => Some(InvoiceStatus::Draft),
            "SUBMITTED" => Some(InvoiceStatus::Submitted),
            "AUTHORISED" | "AUTHORIZED" => Some(InvoiceStatus::Authorised),
            "PAID" => Some(InvoiceStatus::Paid),
            "VOIDED" => Some(InvoiceStatus::Voided),
            "DELETED" => Some(InvoiceStatus::Deleted),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, InvoiceStatus::Voided | InvoiceStatus::Deleted)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InvoiceKind {
    #[serde(rename = "ACCREC")]
    Receivable,
    #[serde(rename = "ACCPAY")]
    Payable,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentRef {
    pub id: String,
    pub amount: Cents,
    pub date: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invoice {
    pub id: String,
    pub number: Option<String>,
    pub kind: InvoiceKind,
    pub contact_name: Option<String>,
    pub status: InvoiceStatus,
    pub date: NaiveDate,
    pub total: Cents,
    pub amount_due: Cents,
    pub amount_paid: Cents,
    #[serde(default)]
    pub payments: Vec<PaymentRef>,
    pub reference: Option<String>,
}

impl Invoice {
    pub fn has_payments(&self) -> bool {
        !self.payments.is_empty() || self.amount_paid.is_positive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    Authorised,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payment {
    pub id: String,
    pub invoice_id: Option<String>,
    pub account_id: Option<String>,
    /// Contact on the paid invoice.
    #[serde(default)]
    pub contact_name: Option<String>,
    pub amount: Cents,
    pub date: NaiveDate,
    pub status: PaymentStatus,
    pub is_reconciled: bool,
    pub reference: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING-KEBAB-CASE")]
pub enum BankTransactionKind {
    Receive,
    Spend,
    ReceiveTransfer,
    SpendTransfer,
    #[serde(untagged)]
    Other(String),
}

impl BankTransactionKind {
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_uppercase().as_str() {
            "RECEIVE" => BankTransactionKind::Receive,
            "SPEND" => BankTransactionKind::Spend,
            "RECEIVE-TRANSFER" => BankTransactionKind::ReceiveTransfer,
            "SPEND-TRANSFER" => BankTransactionKind::SpendTransfer,
            other => BankTransactionKind::Other(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordStatus {
    Authorised,
    Deleted,
    Voided,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BankTransaction {
    pub id: String,
    pub kind: BankTransactionKind,
    pub account_id: String,
    pub contact_name: Option<String>,
    pub date: NaiveDate,
    pub total: Cents,
    pub reference: Option<String>,
    pub is_reconciled: bool,
    pub status: RecordStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccountStatus {
    Active,
    Archived,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub code: Option<String>,
    pub name: String,
    pub account_type: String,
    pub status: AccountStatus,
}

/// A credit landing in the real bank account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deposit {
    pub id: String,
    pub date: NaiveDate,
    pub amount: Cents,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClearingOrigin {
    BankTransaction,
    Payment,
}

/// A gross amount staged in the clearing account, waiting to be swept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClearingEntry {
    pub id: String,
    pub date: NaiveDate,
    pub gross: Cents,
    pub contact_name: Option<String>,
    pub reference: Option<String>,
    pub invoice_id: Option<String>,
    pub origin: ClearingOrigin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BudgetTransactionStatus {
    Held,
    Settled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetTransaction {
    pub id: String,
    pub status: BudgetTransactionStatus,
    pub description: String,
    pub raw_text: Option<String>,
    pub amount: Cents,
    pub upstream_category: Option<String>,
    pub category: Option<String>,
    pub created_at: DateTime<Utc>,
    pub settled_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Planned,
    Succeeded,
    Skipped,
    Failed,
}

/// One line in the append-only audit trail of a mutating run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: Uuid,
    pub run_id: Uuid,
    pub at: DateTime<Utc>,
    pub operation: String,
    pub target: String,
    pub step: String,
    pub dry_run: bool,
    pub outcome: AuditOutcome,
    #[serde(default)]
    pub detail: serde_json::Value,
}

impl AuditEvent {
    pub fn new(
        run_id: Uuid,
        operation: impl Into<String>,
        target: impl Into<String>,
        step: impl Into<String>,
        dry_run: bool,
        outcome: AuditOutcome,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            run_id,
            at: Utc::now(),
            operation: operation.into(),
            target: target.into(),
            step: step.into(),
            dry_run,
            outcome,
            detail: serde_json::Value::Null,
        }
    }

    pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = detail;
        self
    }
}
