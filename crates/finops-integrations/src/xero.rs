//! Xero accounting API client.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate};
use finops_core::{
    Account, AccountStatus, BankTransaction, BankTransactionKind, Cents, Invoice, InvoiceKind, InvoiceStatus,
    Payment, PaymentRef, PaymentStatus, RecordStatus,
};
use finops_storage::{ApiClient, ApiRequest, Method};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{ledger_error_from_api, InvoiceFilter, Ledger, LedgerError, NewPayment, NewSpend, NewTransfer};

pub const XERO_API_BASE: &str = "https://api.xero.com/api.xro/2.0";
pub const XERO_TOKEN_URL: &str = "https://identity.xero.com/connect/token";
const PAGE_SIZE: usize = 100;
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct XeroConfig {
    pub client_id: String,
    pub client_secret: String,
    pub refresh_token: String,
    pub tenant_id: String,
    pub api_base: String,
    pub token_url: String,
}

impl XeroConfig {
    pub fn new(
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        refresh_token: impl Into<String>,
        tenant_id: impl Into<String>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            refresh_token: refresh_token.into(),
            tenant_id: tenant_id.into(),
            api_base: XERO_API_BASE.to_string(),
            token_url: XERO_TOKEN_URL.to_string(),
        }
    }
}

#[derive(Debug)]
struct TokenState {
    access_token: Option<String>,
    expires_at: Option<Instant>,
    refresh_token: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
    refresh_token: Option<String>,
}

pub struct XeroClient {
    http: ApiClient,
    config: XeroConfig,
    token: Mutex<TokenState>,
}

impl XeroClient {
    pub fn new(http: ApiClient, config: XeroConfig) -> Self {
        let token = Mutex::new(TokenState {
            access_token: None,
            expires_at: None,
            refresh_token: config.refresh_token.clone(),
        });
        Self { http, config, token }
    }

    async fn access_token(&self) -> Result<String, LedgerError> {
        let mut state = self.token.lock().await;
        if let (Some(token), Some(expires_at)) = (&state.access_token, state.expires_at) {
            if Instant::now() + TOKEN_REFRESH_MARGIN < expires_at {
                return Ok(token.clone());
            }
        }

        let request = ApiRequest::new(Method::POST, &self.config.token_url)
            .basic_auth(&self.config.client_id, &self.config.client_secret)
            .form(vec![
                ("grant_type".to_string(), "refresh_token".to_string()),
                ("refresh_token".to_string(), state.refresh_token.clone()),
            ]);
        let response: TokenResponse = self
            .http
            .send_json(request)
            .await
            .map_err(|err| LedgerError::transport("xero token refresh", err.to_string()))?;

        info!(expires_in = response.expires_in, "refreshed xero access token");
        if let Some(rotated) = response.refresh_token {
            state.refresh_token = rotated;
        }
        state.expires_at = Some(Instant::now() + Duration::from_secs(response.expires_in));
        state.access_token = Some(response.access_token.clone());
        Ok(response.access_token)
    }

    async fn request(&self, method: Method, path: &str) -> Result<ApiRequest, LedgerError> {
        let token = self.access_token().await?;
        Ok(ApiRequest::new(method, format!("{}/{}", self.config.api_base, path))
            .bearer(token)
            .header("Xero-tenant-id", &self.config.tenant_id))
    }

    async fn fetch_pages<W, T>(
        &self,
        path: &str,
        query: &[(String, String)],
        target: &str,
        extract: impl Fn(W) -> Vec<T>,
    ) -> Result<Vec<T>, LedgerError>
    where
        W: DeserializeOwned,
    {
        let mut out = Vec::new();
        let mut page = 1usize;
        loop {
            let mut request = self.request(Method::GET, path).await?;
            for (name, value) in query {
                request = request.query(name, value);
            }
            request = request.query("page", page.to_string());
            let envelope: W = self
                .http
                .get_json(request)
                .await
                .map_err(|err| ledger_error_from_api(target, err))?;
            let rows = extract(envelope);
            let count = rows.len();
            out.extend(rows);
            debug!(path, page, count, "fetched xero page");
            if count < PAGE_SIZE {
                return Ok(out);
            }
            page += 1;
        }
    }

    async fn post_status(&self, path: &str, target: &str, body: serde_json::Value) -> Result<(), LedgerError> {
        let request = self.request(Method::POST, path).await?.json(body);
        self.http
            .send(request)
            .await
            .map_err(|err| ledger_error_from_api(target, err))?;
        Ok(())
    }

    async fn put(&self, path: &str, target: &str, body: serde_json::Value) -> Result<(), LedgerError> {
        let request = self.request(Method::PUT, path).await?.json(body);
        self.http
            .send(request)
            .await
            .map_err(|err| ledger_error_from_api(target, err))?;
        Ok(())
    }
}

/// Extract the first human-readable validation message from a Xero error body.
pub fn validation_message(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    let from_elements = value
        .get("Elements")
        .and_then(|e| e.as_array())
        .into_iter()
        .flatten()
        .filter_map(|el| el.get("ValidationErrors").and_then(|v| v.as_array()))
        .flatten()
        .filter_map(|v| v.get("Message").and_then(|m| m.as_str()))
        .next()
        .map(ToString::to_string);
    from_elements.or_else(|| value.get("Message").and_then(|m| m.as_str()).map(ToString::to_string))
}

/// Parse `/Date(1518685950940+0000)/`, falling back to an ISO `DateString`.
pub fn parse_xero_date(date: Option<&str>, date_string: Option<&str>) -> Option<NaiveDate> {
    if let Some(raw) = date {
        if let Some(inner) = raw.strip_prefix("/Date(").and_then(|r| r.strip_suffix(")/")) {
            let end = inner
                .char_indices()
                .skip(1)
                .find(|(_, c)| *c == '+' || *c == '-')
                .map(|(idx, _)| idx)
                .unwrap_or(inner.len());
            if let Some(dt) = inner[..end].parse::<i64>().ok().and_then(DateTime::from_timestamp_millis) {
                return Some(dt.date_naive());
            }
        } else if let Some(d) = parse_iso_day(raw) {
            return Some(d);
        }
    }
    date_string.and_then(parse_iso_day)
}

fn parse_iso_day(raw: &str) -> Option<NaiveDate> {
    raw.get(..10)
        .and_then(|day| NaiveDate::parse_from_str(day, "%Y-%m-%d").ok())
}

fn where_date(field: &str, op: &str, day: NaiveDate) -> String {
    format!("{field}{op}DateTime({})", day.format("%Y,%m,%d"))
}

fn quote(value: &str) -> String {
    value.replace('"', "\\\"")
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct XeroContact {
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct XeroIdRef {
    #[serde(rename = "InvoiceID", alias = "AccountID")]
    id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct XeroPaymentInvoice {
    #[serde(rename = "InvoiceID")]
    invoice_id: Option<String>,
    contact: Option<XeroContact>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct XeroPaymentRef {
    #[serde(rename = "PaymentID")]
    payment_id: String,
    #[serde(default)]
    amount: f64,
    date: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct XeroInvoice {
    #[serde(rename = "InvoiceID")]
    invoice_id: String,
    invoice_number: Option<String>,
    #[serde(rename = "Type")]
    kind: String,
    contact: Option<XeroContact>,
    status: String,
    date: Option<String>,
    date_string: Option<String>,
    #[serde(default)]
    total: f64,
    #[serde(default)]
    amount_due: f64,
    #[serde(default)]
    amount_paid: f64,
    #[serde(default)]
    payments: Vec<XeroPaymentRef>,
    reference: Option<String>,
}

impl XeroInvoice {
    pub(crate) fn into_core(self) -> Option<Invoice> {
        let Some(date) = parse_xero_date(self.date.as_deref(), self.date_string.as_deref()) else {
            warn!(invoice_id = %self.invoice_id, date = ?self.date, "skipping xero invoice with unparseable date");
            return None;
        };
        let Some(status) = InvoiceStatus::parse(&self.status) else {
            warn!(invoice_id = %self.invoice_id, status = %self.status, "skipping xero invoice with unknown status");
            return None;
        };
        let kind = match self.kind.as_str() {
            "ACCPAY" => InvoiceKind::Payable,
            _ => InvoiceKind::Receivable,
        };
        Some(Invoice {
            id: self.invoice_id,
            number: self.invoice_number.filter(|n| !n.is_empty()),
            kind,
            contact_name: self.contact.and_then(|c| c.name),
            status,
            date,
            total: Cents::from_decimal(self.total),
            amount_due: Cents::from_decimal(self.amount_due),
            amount_paid: Cents::from_decimal(self.amount_paid),
            payments: self
                .payments
                .into_iter()
                .map(|p| PaymentRef {
                    date: parse_xero_date(p.date.as_deref(), None).unwrap_or(date),
                    id: p.payment_id,
                    amount: Cents::from_decimal(p.amount),
                })
                .collect(),
            reference: self.reference.filter(|r| !r.is_empty()),
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct XeroPayment {
    #[serde(rename = "PaymentID")]
    payment_id: String,
    invoice: Option<XeroPaymentInvoice>,
    account: Option<XeroIdRef>,
    #[serde(default)]
    amount: f64,
    date: Option<String>,
    status: Option<String>,
    #[serde(default)]
    is_reconciled: bool,
    reference: Option<String>,
}

impl XeroPayment {
    pub(crate) fn into_core(self) -> Option<Payment> {
        let Some(date) = parse_xero_date(self.date.as_deref(), None) else {
            warn!(payment_id = %self.payment_id, date = ?self.date, "skipping xero payment with unparseable date");
            return None;
        };
        let (invoice_id, contact_name) = match self.invoice {
            Some(invoice) => (invoice.invoice_id, invoice.contact.and_then(|c| c.name)),
            None => (None, None),
        };
        Some(Payment {
            id: self.payment_id,
            invoice_id,
            account_id: self.account.and_then(|r| r.id),
            contact_name,
            amount: Cents::from_decimal(self.amount),
            date,
            status: match self.status.as_deref() {
                Some("DELETED") => PaymentStatus::Deleted,
                _ => PaymentStatus::Authorised,
            },
            is_reconciled: self.is_reconciled,
            reference: self.reference.filter(|r| !r.is_empty()),
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct XeroBankTransaction {
    #[serde(rename = "BankTransactionID")]
    bank_transaction_id: String,
    #[serde(rename = "Type")]
    kind: String,
    bank_account: XeroIdRef,
    contact: Option<XeroContact>,
    date: Option<String>,
    date_string: Option<String>,
    #[serde(default)]
    total: f64,
    reference: Option<String>,
    #[serde(default)]
    is_reconciled: bool,
    status: Option<String>,
}

impl XeroBankTransaction {
    pub(crate) fn into_core(self) -> Option<BankTransaction> {
        let Some(account_id) = self.bank_account.id else {
            warn!(bank_transaction_id = %self.bank_transaction_id, "skipping xero bank transaction without a bank account");
            return None;
        };
        let Some(date) = parse_xero_date(self.date.as_deref(), self.date_string.as_deref()) else {
            warn!(bank_transaction_id = %self.bank_transaction_id, date = ?self.date, "skipping xero bank transaction with unparseable date");
            return None;
        };
        Some(BankTransaction {
            id: self.bank_transaction_id,
            kind: BankTransactionKind::parse(&self.kind),
            account_id,
            contact_name: self.contact.and_then(|c| c.name),
            date,
            total: Cents::from_decimal(self.total),
            reference: self.reference.filter(|r| !r.is_empty()),
            is_reconciled: self.is_reconciled,
            status: match self.status.as_deref() {
                Some("DELETED") => RecordStatus::Deleted,
                Some("VOIDED") => RecordStatus::Voided,
                _ => RecordStatus::Authorised,
            },
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct XeroAccount {
    #[serde(rename = "AccountID")]
    account_id: String,
    code: Option<String>,
    name: String,
    #[serde(rename = "Type")]
    account_type: String,
    status: Option<String>,
}

impl XeroAccount {
    pub(crate) fn into_core(self) -> Account {
        Account {
            id: self.account_id,
            code: self.code.filter(|c| !c.is_empty()),
            name: self.name,
            account_type: self.account_type,
            status: match self.status.as_deref() {
                Some("ARCHIVED") => AccountStatus::Archived,
                Some("DELETED") => AccountStatus::Deleted,
                _ => AccountStatus::Active,
            },
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct InvoicesEnvelope {
    #[serde(rename = "Invoices", default)]
    pub(crate) invoices: Vec<XeroInvoice>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct PaymentsEnvelope {
    #[serde(rename = "Payments", default)]
    pub(crate) payments: Vec<XeroPayment>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct BankTransactionsEnvelope {
    #[serde(rename = "BankTransactions", default)]
    pub(crate) bank_transactions: Vec<XeroBankTransaction>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct AccountsEnvelope {
    #[serde(rename = "Accounts", default)]
    pub(crate) accounts: Vec<XeroAccount>,
}

pub fn parse_invoices(body: &str) -> serde_json::Result<Vec<Invoice>> {
    let envelope: InvoicesEnvelope = serde_json::from_str(body)?;
    Ok(envelope.invoices.into_iter().filter_map(XeroInvoice::into_core).collect())
}

pub fn parse_payments(body: &str) -> serde_json::Result<Vec<Payment>> {
    let envelope: PaymentsEnvelope = serde_json::from_str(body)?;
    Ok(envelope.payments.into_iter().filter_map(XeroPayment::into_core).collect())
}

pub fn parse_bank_transactions(body: &str) -> serde_json::Result<Vec<BankTransaction>> {
    let envelope: BankTransactionsEnvelope = serde_json::from_str(body)?;
    Ok(envelope
        .bank_transactions
        .into_iter()
        .filter_map(XeroBankTransaction::into_core)
        .collect())
}

fn invoice_query(filter: &InvoiceFilter) -> Vec<(String, String)> {
    let mut query = Vec::new();
    if !filter.ids.is_empty() {
        query.push(("IDs".to_string(), filter.ids.join(",")));
    }
    if !filter.statuses.is_empty() {
        let statuses = filter.statuses.iter().map(|s| s.as_str()).collect::<Vec<_>>();
        query.push(("Statuses".to_string(), statuses.join(",")));
    }
    let mut clauses = Vec::new();
    match filter.kind {
        Some(InvoiceKind::Receivable) => clauses.push("Type==\"ACCREC\"".to_string()),
        Some(InvoiceKind::Payable) => clauses.push("Type==\"ACCPAY\"".to_string()),
        None => {}
    }
    if let Some(contact) = &filter.contact {
        clauses.push(format!("Contact.Name.Contains(\"{}\")", quote(contact)));
    }
    if let Some(from) = filter.from {
        clauses.push(where_date("Date", ">=", from));
    }
    if let Some(to) = filter.to {
        clauses.push(where_date("Date", "<=", to));
    }
    if !clauses.is_empty() {
        query.push(("where".to_string(), clauses.join(" AND ")));
    }
    query
}

fn money(amount: Cents) -> serde_json::Value {
    json!(amount.to_decimal())
}

#[async_trait]
impl Ledger for XeroClient {
    fn name(&self) -> &'static str {
        "xero"
    }

    async fn list_invoices(&self, filter: &InvoiceFilter) -> Result<Vec<Invoice>, LedgerError> {
        let query = invoice_query(filter);
        let invoices = self
            .fetch_pages("Invoices", &query, "invoices", |env: InvoicesEnvelope| {
                env.invoices.into_iter().filter_map(XeroInvoice::into_core).collect()
            })
            .await?;
        // Contains() in the where clause is case-sensitive upstream; re-apply locally.
        Ok(invoices.into_iter().filter(|inv| filter.matches(inv)).collect())
    }

    /// `id` may be an InvoiceID or an InvoiceNumber; the returned row must match it.
    async fn get_invoice(&self, id: &str) -> Result<Invoice, LedgerError> {
        let id = id.trim();
        if id.is_empty() {
            return Err(LedgerError::rejected("invoice", "invoice id is blank"));
        }
        let request = self.request(Method::GET, &format!("Invoices/{id}")).await?;
        let envelope: InvoicesEnvelope = self
            .http
            .get_json(request)
            .await
            .map_err(|err| ledger_error_from_api(id, err))?;
        envelope
            .invoices
            .into_iter()
            .filter_map(XeroInvoice::into_core)
            .find(|inv| inv.id.eq_ignore_ascii_case(id) || inv.number.as_deref() == Some(id))
            .ok_or_else(|| LedgerError::NotFound {
                kind: "invoice",
                id: id.to_string(),
            })
    }

    async fn get_payment(&self, id: &str) -> Result<Payment, LedgerError> {
        let id = id.trim();
        if id.is_empty() {
            return Err(LedgerError::rejected("payment", "payment id is blank"));
        }
        let request = self.request(Method::GET, &format!("Payments/{id}")).await?;
        let envelope: PaymentsEnvelope = self
            .http
            .get_json(request)
            .await
            .map_err(|err| ledger_error_from_api(id, err))?;
        envelope
            .payments
            .into_iter()
            .filter_map(XeroPayment::into_core)
            .find(|p| p.id.eq_ignore_ascii_case(id))
            .ok_or_else(|| LedgerError::NotFound {
                kind: "payment",
                id: id.to_string(),
            })
    }

    async fn list_payments(&self, account_id: Option<&str>) -> Result<Vec<Payment>, LedgerError> {
        let mut query = Vec::new();
        if let Some(account_id) = account_id {
            query.push((
                "where".to_string(),
                format!("Account.AccountID=guid(\"{}\")", quote(account_id)),
            ));
        }
        self.fetch_pages("Payments", &query, "payments", |env: PaymentsEnvelope| {
            env.payments.into_iter().filter_map(XeroPayment::into_core).collect()
        })
        .await
    }

    async fn list_bank_transactions(
        &self,
        account_id: &str,
        from: Option<NaiveDate>,
        to: Option<NaiveDate>,
    ) -> Result<Vec<BankTransaction>, LedgerError> {
        let mut clauses = vec![format!("BankAccount.AccountID=guid(\"{}\")", quote(account_id))];
        if let Some(from) = from {
            clauses.push(where_date("Date", ">=", from));
        }
        if let Some(to) = to {
            clauses.push(where_date("Date", "<=", to));
        }
        let query = vec![("where".to_string(), clauses.join(" AND "))];
        self.fetch_pages(
            "BankTransactions",
            &query,
            "bank transactions",
            |env: BankTransactionsEnvelope| {
                env.bank_transactions
                    .into_iter()
                    .filter_map(XeroBankTransaction::into_core)
                    .collect()
            },
        )
        .await
    }

    async fn list_accounts(&self) -> Result<Vec<Account>, LedgerError> {
        let request = self.request(Method::GET, "Accounts").await?;
        let envelope: AccountsEnvelope = self
            .http
            .get_json(request)
            .await
            .map_err(|err| ledger_error_from_api("accounts", err))?;
        Ok(envelope.accounts.into_iter().map(XeroAccount::into_core).collect())
    }

    async fn delete_invoice(&self, id: &str) -> Result<(), LedgerError> {
        self.post_status(
            &format!("Invoices/{id}"),
            id,
            json!({"InvoiceID": id, "Status": "DELETED"}),
        )
        .await
    }

    async fn void_invoice(&self, id: &str) -> Result<(), LedgerError> {
        self.post_status(
            &format!("Invoices/{id}"),
            id,
            json!({"InvoiceID": id, "Status": "VOIDED"}),
        )
        .await
    }

    async fn delete_payment(&self, id: &str) -> Result<(), LedgerError> {
        self.post_status(&format!("Payments/{id}"), id, json!({"Status": "DELETED"}))
            .await
    }

    async fn create_payment(&self, payment: &NewPayment) -> Result<(), LedgerError> {
        let body = json!({
            "Invoice": {"InvoiceID": payment.invoice_id},
            "Account": {"AccountID": payment.account_id},
            "Amount": money(payment.amount),
            "Date": payment.date.format("%Y-%m-%d").to_string(),
            "Reference": payment.reference,
        });
        self.put("Payments", &payment.invoice_id, body).await
    }

    async fn delete_bank_transaction(&self, id: &str) -> Result<(), LedgerError> {
        self.post_status(
            &format!("BankTransactions/{id}"),
            id,
            json!({"BankTransactionID": id, "Status": "DELETED"}),
        )
        .await
    }

    async fn archive_account(&self, id: &str) -> Result<(), LedgerError> {
        self.post_status(
            &format!("Accounts/{id}"),
            id,
            json!({"AccountID": id, "Status": "ARCHIVED"}),
        )
        .await
    }

    async fn create_bank_transfer(&self, transfer: &NewTransfer) -> Result<(), LedgerError> {
        let body = json!({
            "BankTransfers": [{
                "FromBankAccount": {"AccountID": transfer.from_account_id},
                "ToBankAccount": {"AccountID": transfer.to_account_id},
                "Amount": money(transfer.amount),
                "Date": transfer.date.format("%Y-%m-%d").to_string(),
                "Reference": transfer.reference,
            }]
        });
        self.put("BankTransfers", "bank transfer", body).await
    }

    async fn create_spend(&self, spend: &NewSpend) -> Result<(), LedgerError> {
        let body = json!({
            "BankTransactions": [{
                "Type": "SPEND",
                "BankAccount": {"AccountID": spend.account_id},
                "Contact": {"Name": spend.contact_name},
                "Date": spend.date.format("%Y-%m-%d").to_string(),
                "LineAmountTypes": "NoTax",
                "Reference": spend.reference,
                "LineItems": [{
                    "Description": spend.description,
                    "Quantity": 1,
                    "UnitAmount": money(spend.amount),
                    "AccountCode": spend.expense_account_code,
                }],
            }]
        });
        self.put("BankTransactions", "spend money", body).await
    }
}
