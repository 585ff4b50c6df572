//! In-memory ledger enforcing Xero's status-transition rules, with fault injection.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::NaiveDate;
use finops_core::{
    Account, AccountStatus, BankTransaction, BankTransactionKind, Cents, Invoice, InvoiceStatus, Payment,
    PaymentRef, PaymentStatus, RecordStatus,
};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{InvoiceFilter, Ledger, LedgerError, NewPayment, NewSpend, NewTransfer};

#[derive(Debug, Default)]
struct MemoryState {
    invoices: BTreeMap<String, Invoice>,
    payments: BTreeMap<String, Payment>,
    bank_transactions: BTreeMap<String, BankTransaction>,
    accounts: BTreeMap<String, Account>,
    calls: Vec<String>,
    mutations: usize,
    fail_on_mutation: Option<usize>,
}

impl MemoryState {
    fn mutate(&mut self, call: String) -> Result<(), LedgerError> {
        self.mutations += 1;
        self.calls.push(call.clone());
        if self.fail_on_mutation == Some(self.mutations) {
            return Err(LedgerError::transport(call, "injected failure"));
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryLedger {
    state: Mutex<MemoryState>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_invoice(mut self, invoice: Invoice) -> Self {
        self.state.get_mut().invoices.insert(invoice.id.clone(), invoice);
        self
    }

    /// Registers the payment and keeps its invoice's payment list in step.
    pub fn with_payment(mut self, payment: Payment) -> Self {
        let state = self.state.get_mut();
        if let Some(invoice) = payment
            .invoice_id
            .as_ref()
            .and_then(|id| state.invoices.get_mut(id))
        {
            if !invoice.payments.iter().any(|p| p.id == payment.id) {
                invoice.payments.push(PaymentRef {
                    id: payment.id.clone(),
                    amount: payment.amount,
                    date: payment.date,
                });
            }
        }
        state.payments.insert(payment.id.clone(), payment);
        self
    }

    pub fn with_bank_transaction(mut self, txn: BankTransaction) -> Self {
        self.state.get_mut().bank_transactions.insert(txn.id.clone(), txn);
        self
    }

    pub fn with_account(mut self, account: Account) -> Self {
        self.state.get_mut().accounts.insert(account.id.clone(), account);
        self
    }

    /// The `n`-th mutating call (1-based) fails with a transport error.
    pub fn fail_on_mutation(mut self, n: usize) -> Self {
        self.state.get_mut().fail_on_mutation = Some(n);
        self
    }

    pub async fn calls(&self) -> Vec<String> {
        self.state.lock().await.calls.clone()
    }

    pub async fn invoice(&self, id: &str) -> Option<Invoice> {
        self.state.lock().await.invoices.get(id).cloned()
    }

    pub async fn payment(&self, id: &str) -> Option<Payment> {
        self.state.lock().await.payments.get(id).cloned()
    }

    pub async fn account(&self, id: &str) -> Option<Account> {
        self.state.lock().await.accounts.get(id).cloned()
    }

    pub async fn bank_transactions(&self) -> Vec<BankTransaction> {
        self.state.lock().await.bank_transactions.values().cloned().collect()
    }
}

fn not_found(kind: &'static str, id: &str) -> LedgerError {
    LedgerError::NotFound {
        kind,
        id: id.to_string(),
    }
}

fn in_range(date: NaiveDate, from: Option<NaiveDate>, to: Option<NaiveDate>) -> bool {
    from.map_or(true, |f| date >= f) && to.map_or(true, |t| date <= t)
}

fn push_bank_transaction(
    state: &mut MemoryState,
    kind: BankTransactionKind,
    account_id: &str,
    contact_name: Option<String>,
    date: NaiveDate,
    total: Cents,
    reference: Option<String>,
) {
    let id = Uuid::new_v4().to_string();
    state.bank_transactions.insert(
        id.clone(),
        BankTransaction {
            id,
            kind,
            account_id: account_id.to_string(),
            contact_name,
            date,
            total,
            reference,
            is_reconciled: false,
            status: RecordStatus::Authorised,
        },
    );
}

#[async_trait]
impl Ledger for MemoryLedger {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn list_invoices(&self, filter: &InvoiceFilter) -> Result<Vec<Invoice>, LedgerError> {
        let state = self.state.lock().await;
        Ok(state.invoices.values().filter(|inv| filter.matches(inv)).cloned().collect())
    }

    async fn get_invoice(&self, id: &str) -> Result<Invoice, LedgerError> {
        let state = self.state.lock().await;
        state.invoices.get(id).cloned().ok_or_else(|| not_found("invoice", id))
    }

    async fn get_payment(&self, id: &str) -> Result<Payment, LedgerError> {
        let state = self.state.lock().await;
        state.payments.get(id).cloned().ok_or_else(|| not_found("payment", id))
    }

    async fn list_payments(&self, account_id: Option<&str>) -> Result<Vec<Payment>, LedgerError> {
        let state = self.state.lock().await;
        Ok(state
            .payments
            .values()
            .filter(|p| account_id.is_none() || p.account_id.as_deref() == account_id)
            .cloned()
            .collect())
    }

    async fn list_bank_transactions(
        &self,
        account_id: &str,
        from: Option<NaiveDate>,
        to: Option<NaiveDate>,
    ) -> Result<Vec<BankTransaction>, LedgerError> {
        let state = self.state.lock().await;
        Ok(state
            .bank_transactions
            .values()
            .filter(|t| t.account_id == account_id && in_range(t.date, from, to))
            .cloned()
            .collect())
    }

    async fn list_accounts(&self) -> Result<Vec<Account>, LedgerError> {
        Ok(self.state.lock().await.accounts.values().cloned().collect())
    }

    async fn delete_invoice(&self, id: &str) -> Result<(), LedgerError> {
        let mut state = self.state.lock().await;
        state.mutate(format!("delete_invoice:{id}"))?;
        let invoice = state.invoices.get_mut(id).ok_or_else(|| not_found("invoice", id))?;
        match invoice.status {
            InvoiceStatus::Draft | InvoiceStatus::Submitted => {
                invoice.status = InvoiceStatus::Deleted;
                Ok(())
            }
            other => Err(LedgerError::rejected(
                id,
                format!("Only DRAFT or SUBMITTED invoices can be deleted (status {})", other.as_str()),
            )),
        }
    }

    async fn void_invoice(&self, id: &str) -> Result<(), LedgerError> {
        let mut state = self.state.lock().await;
        state.mutate(format!("void_invoice:{id}"))?;
        let invoice = state.invoices.get_mut(id).ok_or_else(|| not_found("invoice", id))?;
        if invoice.has_payments() {
            return Err(LedgerError::rejected(
                id,
                "Invoice has payments applied; remove them before voiding",
            ));
        }
        match invoice.status {
            InvoiceStatus::Authorised => {
                invoice.status = InvoiceStatus::Voided;
                invoice.amount_due = Cents::ZERO;
                Ok(())
            }
            other => Err(LedgerError::rejected(
                id,
                format!("Only AUTHORISED invoices can be voided (status {})", other.as_str()),
            )),
        }
    }

    async fn delete_payment(&self, id: &str) -> Result<(), LedgerError> {
        let mut state = self.state.lock().await;
        state.mutate(format!("delete_payment:{id}"))?;
        let payment = state.payments.get_mut(id).ok_or_else(|| not_found("payment", id))?;
        if payment.status == PaymentStatus::Deleted {
            return Err(LedgerError::rejected(id, "Payment is already deleted"));
        }
        if payment.is_reconciled {
            return Err(LedgerError::rejected(id, "Payment is reconciled and cannot be deleted"));
        }
        payment.status = PaymentStatus::Deleted;
        let amount = payment.amount;
        let invoice_id = payment.invoice_id.clone();

        if let Some(invoice) = invoice_id.and_then(|inv| state.invoices.get_mut(&inv)) {
            invoice.payments.retain(|p| p.id != id);
            invoice.amount_paid -= amount;
            invoice.amount_due += amount;
            if invoice.status == InvoiceStatus::Paid {
                invoice.status = InvoiceStatus::Authorised;
            }
        }
        Ok(())
    }

    async fn create_payment(&self, payment: &NewPayment) -> Result<(), LedgerError> {
        let mut state = self.state.lock().await;
        state.mutate(format!("create_payment:{}", payment.invoice_id))?;
        let invoice = state
            .invoices
            .get_mut(&payment.invoice_id)
            .ok_or_else(|| not_found("invoice", &payment.invoice_id))?;
        if invoice.status != InvoiceStatus::Authorised {
            return Err(LedgerError::rejected(
                &payment.invoice_id,
                "Payments can only be applied to AUTHORISED invoices",
            ));
        }
        if payment.amount > invoice.amount_due {
            return Err(LedgerError::rejected(
                &payment.invoice_id,
                "Payment amount exceeds the amount outstanding",
            ));
        }
        let id = Uuid::new_v4().to_string();
        invoice.payments.push(PaymentRef {
            id: id.clone(),
            amount: payment.amount,
            date: payment.date,
        });
        invoice.amount_paid += payment.amount;
        invoice.amount_due -= payment.amount;
        if invoice.amount_due == Cents::ZERO {
            invoice.status = InvoiceStatus::Paid;
        }
        let contact_name = invoice.contact_name.clone();
        state.payments.insert(
            id.clone(),
            Payment {
                id,
                invoice_id: Some(payment.invoice_id.clone()),
                account_id: Some(payment.account_id.clone()),
                contact_name,
                amount: payment.amount,
                date: payment.date,
                status: PaymentStatus::Authorised,
                is_reconciled: false,
                reference: payment.reference.clone(),
            },
        );
        Ok(())
    }

    async fn delete_bank_transaction(&self, id: &str) -> Result<(), LedgerError> {
        let mut state = self.state.lock().await;
        state.mutate(format!("delete_bank_transaction:{id}"))?;
        let txn = state
            .bank_transactions
            .get_mut(id)
            .ok_or_else(|| not_found("bank transaction", id))?;
        if txn.is_reconciled {
            return Err(LedgerError::rejected(id, "Bank transaction is reconciled"));
        }
        if txn.status != RecordStatus::Authorised {
            return Err(LedgerError::rejected(id, "Bank transaction is not authorised"));
        }
        txn.status = RecordStatus::Deleted;
        Ok(())
    }

    async fn archive_account(&self, id: &str) -> Result<(), LedgerError> {
        let mut state = self.state.lock().await;
        state.mutate(format!("archive_account:{id}"))?;
        let account = state.accounts.get_mut(id).ok_or_else(|| not_found("account", id))?;
        if account.status != AccountStatus::Active {
            return Err(LedgerError::rejected(id, "Only ACTIVE accounts can be archived"));
        }
        account.status = AccountStatus::Archived;
        Ok(())
    }

    async fn create_bank_transfer(&self, transfer: &NewTransfer) -> Result<(), LedgerError> {
        let mut state = self.state.lock().await;
        state.mutate(format!(
            "create_bank_transfer:{}->{}:{}",
            transfer.from_account_id, transfer.to_account_id, transfer.amount
        ))?;
        for account_id in [&transfer.from_account_id, &transfer.to_account_id] {
            if !state.accounts.contains_key(account_id) {
                return Err(not_found("account", account_id));
            }
        }
        push_bank_transaction(
            &mut state,
            BankTransactionKind::SpendTransfer,
            &transfer.from_account_id,
            None,
            transfer.date,
            transfer.amount,
            transfer.reference.clone(),
        );
        push_bank_transaction(
            &mut state,
            BankTransactionKind::ReceiveTransfer,
            &transfer.to_account_id,
            None,
            transfer.date,
            transfer.amount,
            transfer.reference.clone(),
        );
        Ok(())
    }

    async fn create_spend(&self, spend: &NewSpend) -> Result<(), LedgerError> {
        let mut state = self.state.lock().await;
        state.mutate(format!("create_spend:{}:{}", spend.account_id, spend.amount))?;
        if !state.accounts.contains_key(&spend.account_id) {
            return Err(not_found("account", &spend.account_id));
        }
        push_bank_transaction(
            &mut state,
            BankTransactionKind::Spend,
            &spend.account_id,
            Some(spend.contact_name.clone()),
            spend.date,
            spend.amount,
            spend.reference.clone(),
        );
        Ok(())
    }
}
