//! JSON-schema tool definitions for an LLM assistant, restricted to reads and previews.

use std::sync::Arc;

use chrono::NaiveDate;
use finops_core::{InvoiceKind, InvoiceStatus};
use finops_integrations::InvoiceFilter;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::info;

use crate::budget::BudgetMonth;
use crate::bulk::{BulkOperation, BulkRequest};
use crate::clearing::ClearingRequest;
use crate::purge::PurgeRequest;
use crate::{FinopsService, OpsError};

const DEFAULT_INVOICE_LIMIT: usize = 50;

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("unknown tool `{0}`")]
    UnknownTool(String),
    #[error("invalid arguments for {tool}: {source}")]
    InvalidArguments {
        tool: String,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Failed(#[from] OpsError),
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolDefinition {
    pub name: &'static str,
    pub description: &'static str,
    pub parameters: Value,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ListInvoicesArgs {
    #[serde(default)]
    statuses: Vec<InvoiceStatus>,
    #[serde(default)]
    kind: Option<InvoiceKind>,
    #[serde(default)]
    contact: Option<String>,
    #[serde(default)]
    from: Option<NaiveDate>,
    #[serde(default)]
    to: Option<NaiveDate>,
    #[serde(default)]
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PreviewBulkArgs {
    operation: BulkOperation,
    invoice_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PreviewClearingArgs {
    bank_account_id: String,
    clearing_account_id: String,
    from: NaiveDate,
    to: NaiveDate,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PreviewPurgeArgs {
    account: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct BudgetSummaryArgs {
    #[serde(default)]
    month: Option<BudgetMonth>,
}

pub struct ToolRegistry {
    service: Arc<FinopsService>,
}

impl ToolRegistry {
    pub fn new(service: Arc<FinopsService>) -> Self {
        Self { service }
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        vec![
            ToolDefinition {
                name: "list_invoices",
                description: "List invoices from the accounting ledger, optionally filtered by status, type, contact and date.",
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "statuses": {
                            "type": "array",
                            "items": {"type": "string", "enum": ["DRAFT", "SUBMITTED", "AUTHORISED", "PAID", "VOIDED", "DELETED"]}
                        },
                        "kind": {"type": "string", "enum": ["ACCREC", "ACCPAY"]},
                        "contact": {"type": "string", "description": "Case-insensitive substring of the contact name"},
                        "from": {"type": "string", "format": "date"},
                        "to": {"type": "string", "format": "date"},
                        "limit": {"type": "integer", "minimum": 1}
                    },
                    "additionalProperties": false
                }),
            },
            ToolDefinition {
                name: "preview_bulk_operation",
                description: "Preview a bulk delete, void or un-pay of invoices. Never changes the ledger.",
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "operation": {"type": "string", "enum": ["delete", "void", "unpay", "unpay_and_void"]},
                        "invoice_ids": {"type": "array", "items": {"type": "string"}, "minItems": 1}
                    },
                    "required": ["operation", "invoice_ids"],
                    "additionalProperties": false
                }),
            },
            ToolDefinition {
                name: "preview_clearing_reconciliation",
                description: "Match bank deposits against clearing-account entries and invoices for a date window, showing implied fees. Never posts.",
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "bank_account_id": {"type": "string"},
                        "clearing_account_id": {"type": "string"},
                        "from": {"type": "string", "format": "date"},
                        "to": {"type": "string", "format": "date"}
                    },
                    "required": ["bank_account_id", "clearing_account_id", "from", "to"],
                    "additionalProperties": false
                }),
            },
            ToolDefinition {
                name: "preview_account_purge",
                description: "Show which payments and bank transactions purging an account would delete and whether it can be archived.",
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "account": {"type": "string", "description": "Account id or code"}
                    },
                    "required": ["account"],
                    "additionalProperties": false
                }),
            },
            ToolDefinition {
                name: "budget_summary",
                description: "Spending per category against monthly budget limits.",
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "month": {"type": "string", "pattern": "^[0-9]{4}-[0-9]{2}$"}
                    },
                    "additionalProperties": false
                }),
            },
        ]
    }

    /// Definitions in the chat-completions `tools` shape.
    pub fn function_specs(&self) -> Value {
        Value::Array(
            self.definitions()
                .into_iter()
                .map(|d| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": d.name,
                            "description": d.description,
                            "parameters": d.parameters,
                        }
                    })
                })
                .collect(),
        )
    }

    pub async fn dispatch(&self, name: &str, args: Value) -> Result<Value, ToolError> {
        info!(tool = name, "dispatching tool call");
        let value = match name {
            "list_invoices" => {
                let args: ListInvoicesArgs = parse_args(name, args)?;
                let filter = InvoiceFilter {
                    statuses: args.statuses,
                    kind: args.kind,
                    contact: args.contact,
                    from: args.from,
                    to: args.to,
                    ..Default::default()
                };
                let mut invoices = self.service.list_invoices(&filter).await?;
                invoices.truncate(args.limit.unwrap_or(DEFAULT_INVOICE_LIMIT));
                to_value(&invoices)?
            }
            "preview_bulk_operation" => {
                let args: PreviewBulkArgs = parse_args(name, args)?;
                let outcome = self
                    .service
                    .bulk(BulkRequest {
                        operation: args.operation,
                        invoice_ids: args.invoice_ids,
                        dry_run: true,
                    })
                    .await?;
                to_value(&outcome)?
            }
            "preview_clearing_reconciliation" => {
                let args: PreviewClearingArgs = parse_args(name, args)?;
                let outcome = self
                    .service
                    .reconcile_clearing(ClearingRequest {
                        bank_account_id: args.bank_account_id,
                        clearing_account_id: args.clearing_account_id,
                        fee_account_code: None,
                        fee_contact_name: None,
                        from: args.from,
                        to: args.to,
                        dry_run: true,
                    })
                    .await?;
                to_value(&outcome)?
            }
            "preview_account_purge" => {
                let args: PreviewPurgeArgs = parse_args(name, args)?;
                let outcome = self
                    .service
                    .purge(PurgeRequest {
                        account: args.account,
                        dry_run: true,
                    })
                    .await?;
                to_value(&outcome)?
            }
            "budget_summary" => {
                let args: BudgetSummaryArgs = parse_args(name, args)?;
                let month = args.month.unwrap_or_else(BudgetMonth::current);
                to_value(&self.service.budget_summary(month).await?)?
            }
            other => return Err(ToolError::UnknownTool(other.to_string())),
        };
        Ok(value)
    }
}

fn parse_args<T: DeserializeOwned>(tool: &str, args: Value) -> Result<T, ToolError> {
    let args = if args.is_null() { json!({}) } else { args };
    serde_json::from_value(args).map_err(|source| ToolError::InvalidArguments {
        tool: tool.to_string(),
        source,
    })
}

fn to_value<T: Serialize>(value: &T) -> Result<Value, ToolError> {
    serde_json::to_value(value).map_err(|err| ToolError::Failed(OpsError::Other(err.into())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::{BudgetRules, BudgetStore, BudgetSync, MemoryBudgetStore};
    use crate::FinopsConfig;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use finops_core::{BudgetTransaction, BudgetTransactionStatus, Cents, Invoice};
    use finops_integrations::{MemoryLedger, TransactionSource};
    use tempfile::tempdir;

    struct NoTransactions;

    #[async_trait]
    impl TransactionSource for NoTransactions {
        fn source_id(&self) -> &'static str {
            "none"
        }

        async fn transactions_since(&self, _since: Option<DateTime<Utc>>) -> anyhow::Result<Vec<BudgetTransaction>> {
            Ok(vec![])
        }
    }

    fn invoice(id: &str, status: InvoiceStatus, contact: &str) -> Invoice {
        Invoice {
            id: id.to_string(),
            number: Some(format!("INV-{id}")),
            kind: InvoiceKind::Receivable,
            contact_name: Some(contact.to_string()),
            status,
            date: NaiveDate::from_ymd_opt(2026, 10, 2).unwrap(),
            total: Cents(11_000),
            amount_due: Cents(11_000),
            amount_paid: Cents::ZERO,
            payments: vec![],
            reference: None,
        }
    }

    async fn registry(root: &std::path::Path) -> (ToolRegistry, Arc<MemoryLedger>) {
        let ledger = Arc::new(
            MemoryLedger::new()
                .with_invoice(invoice("a", InvoiceStatus::Authorised, "Harbour Physio"))
                .with_invoice(invoice("b", InvoiceStatus::Draft, "Lakeside Dental")),
        );
        let store = Arc::new(MemoryBudgetStore::new());
        store
            .upsert(&[BudgetTransaction {
                id: "t1".into(),
                status: BudgetTransactionStatus::Settled,
                description: "Coles".into(),
                raw_text: None,
                amount: Cents(-4_200),
                upstream_category: None,
                category: Some("groceries".into()),
                created_at: "2026-10-05T02:00:00Z".parse().unwrap(),
                settled_at: None,
            }])
            .await
            .unwrap();
        let budget = BudgetSync::new(Arc::new(NoTransactions), store, BudgetRules::default());
        let config = FinopsConfig {
            audit_dir: root.join("audit"),
            reports_dir: root.join("reports"),
            ..FinopsConfig::default()
        };
        let service = FinopsService::new(config, ledger.clone(), Some(Arc::new(budget)));
        (ToolRegistry::new(Arc::new(service)), ledger)
    }

    #[tokio::test]
    async fn exposes_only_reads_and_previews() {
        let dir = tempdir().unwrap();
        let (tools, _) = registry(dir.path()).await;
        let names: Vec<_> = tools.definitions().iter().map(|d| d.name).collect();
        assert_eq!(
            names,
            vec![
                "list_invoices",
                "preview_bulk_operation",
                "preview_clearing_reconciliation",
                "preview_account_purge",
                "budget_summary"
            ]
        );
        assert_eq!(tools.function_specs()[0]["function"]["name"], "list_invoices");
    }

    #[tokio::test]
    async fn list_invoices_filters_by_status() {
        let dir = tempdir().unwrap();
        let (tools, _) = registry(dir.path()).await;
        let value = tools
            .dispatch("list_invoices", json!({"statuses": ["DRAFT"]}))
            .await
            .expect("list");
        let rows = value.as_array().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["id"], "b");
    }

    #[tokio::test]
    async fn bulk_preview_is_always_a_dry_run() {
        let dir = tempdir().unwrap();
        let (tools, ledger) = registry(dir.path()).await;
        let value = tools
            .dispatch(
                "preview_bulk_operation",
                json!({"operation": "void", "invoice_ids": ["a"]}),
            )
            .await
            .expect("preview");
        assert_eq!(value["dry_run"], true);
        assert_eq!(value["counts"]["planned"], 1);
        assert!(ledger.calls().await.is_empty());
        assert_eq!(ledger.invoice("a").await.unwrap().status, InvoiceStatus::Authorised);
    }

    #[tokio::test]
    async fn rejects_unknown_tools_and_bad_arguments() {
        let dir = tempdir().unwrap();
        let (tools, _) = registry(dir.path()).await;
        assert!(matches!(
            tools.dispatch("void_invoices", json!({})).await,
            Err(ToolError::UnknownTool(_))
        ));
        assert!(matches!(
            tools
                .dispatch("preview_bulk_operation", json!({"operation": "void", "invoice_ids": ["a"], "dry_run": false}))
                .await,
            Err(ToolError::InvalidArguments { .. })
        ));
        assert!(matches!(
            tools.dispatch("budget_summary", json!({"month": "October"})).await,
            Err(ToolError::InvalidArguments { .. })
        ));
    }

    #[tokio::test]
    async fn budget_summary_reads_the_store() {
        let dir = tempdir().unwrap();
        let (tools, _) = registry(dir.path()).await;
        let value = tools
            .dispatch("budget_summary", json!({"month": "2026-10"}))
            .await
            .expect("summary");
        assert_eq!(value["month"], "2026-10");
        assert_eq!(value["spending"], 4_200);
        assert_eq!(value["categories"][0]["category"], "groceries");
    }
}
