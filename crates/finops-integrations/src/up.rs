//! Up Bank transactions API client.

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use finops_core::{BudgetTransaction, BudgetTransactionStatus, Cents};
use finops_storage::{ApiClient, ApiRequest};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::TransactionSource;

pub const UP_API_BASE: &str = "https://api.up.com.au/api/v1";
const PAGE_SIZE: &str = "100";

#[derive(Debug, Clone)]
pub struct UpBankConfig {
    pub token: String,
    pub api_base: String,
}

impl UpBankConfig {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            api_base: UP_API_BASE.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct UpPage {
    data: Vec<UpTransaction>,
    links: UpLinks,
}

#[derive(Debug, Deserialize)]
struct UpLinks {
    next: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UpTransaction {
    id: String,
    attributes: UpAttributes,
    #[serde(default)]
    relationships: UpRelationships,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpAttributes {
    status: String,
    raw_text: Option<String>,
    description: String,
    amount: UpMoney,
    created_at: DateTime<Utc>,
    settled_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpMoney {
    value: String,
    value_in_base_units: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
struct UpRelationships {
    category: Option<UpRelationship>,
}

#[derive(Debug, Deserialize)]
struct UpRelationship {
    data: Option<UpResourceId>,
}

#[derive(Debug, Deserialize)]
struct UpResourceId {
    id: String,
}

impl UpTransaction {
    fn into_core(self) -> Option<BudgetTransaction> {
        let amount = match self.attributes.amount.value_in_base_units {
            Some(units) => Cents(units),
            None => match Cents::parse_decimal(&self.attributes.amount.value) {
                Some(amount) => amount,
                None => {
                    warn!(transaction_id = %self.id, value = %self.attributes.amount.value, "skipping up transaction with unparseable amount");
                    return None;
                }
            },
        };
        Some(BudgetTransaction {
            id: self.id,
            status: if self.attributes.status.eq_ignore_ascii_case("HELD") {
                BudgetTransactionStatus::Held
            } else {
                BudgetTransactionStatus::Settled
            },
            description: self.attributes.description,
            raw_text: self.attributes.raw_text,
            amount,
            upstream_category: self.relationships.category.and_then(|c| c.data).map(|d| d.id),
            category: None,
            created_at: self.attributes.created_at,
            settled_at: self.attributes.settled_at,
        })
    }
}

/// Parse one page of `/transactions`, returning the rows and the next-page link.
pub fn parse_transactions_page(body: &str) -> serde_json::Result<(Vec<BudgetTransaction>, Option<String>)> {
    let page: UpPage = serde_json::from_str(body)?;
    Ok(split_page(page))
}

fn split_page(page: UpPage) -> (Vec<BudgetTransaction>, Option<String>) {
    let rows = page.data.into_iter().filter_map(UpTransaction::into_core).collect();
    (rows, page.links.next)
}

pub struct UpBankClient {
    http: ApiClient,
    config: UpBankConfig,
}

impl UpBankClient {
    pub fn new(http: ApiClient, config: UpBankConfig) -> Self {
        Self { http, config }
    }

    pub async fn ping(&self) -> anyhow::Result<()> {
        let request = ApiRequest::get(format!("{}/util/ping", self.config.api_base)).bearer(&self.config.token);
        self.http.send(request).await.context("pinging up bank")?;
        Ok(())
    }

    /// Follows `links.next` until the feed is exhausted.
    pub async fn list_transactions(&self, since: Option<DateTime<Utc>>) -> anyhow::Result<Vec<BudgetTransaction>> {
        let mut request = ApiRequest::get(format!("{}/transactions", self.config.api_base))
            .bearer(&self.config.token)
            .query("page[size]", PAGE_SIZE);
        if let Some(since) = since {
            request = request.query("filter[since]", since.to_rfc3339_opts(SecondsFormat::Secs, true));
        }

        let mut out = Vec::new();
        loop {
            let page: UpPage = self
                .http
                .get_json(request)
                .await
                .context("fetching up bank transactions")?;
            let (rows, next) = split_page(page);
            debug!(count = rows.len(), has_next = next.is_some(), "fetched up bank page");
            out.extend(rows);
            match next {
                Some(next) => request = ApiRequest::get(next).bearer(&self.config.token),
                None => return Ok(out),
            }
        }
    }
}

#[async_trait]
impl TransactionSource for UpBankClient {
    fn source_id(&self) -> &'static str {
        "up-bank"
    }

    async fn transactions_since(&self, since: Option<DateTime<Utc>>) -> anyhow::Result<Vec<BudgetTransaction>> {
        self.list_transactions(since).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"{
      "data": [
        {
          "type": "transactions",
          "id": "txn-1",
          "attributes": {
            "status": "SETTLED",
            "rawText": "WOOLWORTHS 1234 SYDNEY",
            "description": "Woolworths",
            "message": null,
            "amount": {"currencyCode": "AUD", "value": "-54.20", "valueInBaseUnits": -5420},
            "settledAt": "2026-10-02T09:00:00+11:00",
            "createdAt": "2026-10-01T18:30:00+10:00"
          },
          "relationships": {"category": {"data": {"type": "categories", "id": "groceries"}}}
        },
        {
          "type": "transactions",
          "id": "txn-2",
          "attributes": {
            "status": "HELD",
            "rawText": null,
            "description": "Salary",
            "amount": {"currencyCode": "AUD", "value": "3100.00"},
            "settledAt": null,
            "createdAt": "2026-10-03T08:00:00+10:00"
          },
          "relationships": {"category": {"data": null}}
        }
      ],
      "links": {"prev": null, "next": "https://api.up.com.au/api/v1/transactions?page%5Bafter%5D=abc"}
    }"#;

    #[test]
    fn parses_page_and_next_link() {
        let (rows, next) = parse_transactions_page(PAGE).expect("parse");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].amount, Cents(-5420));
        assert_eq!(rows[0].upstream_category.as_deref(), Some("groceries"));
        assert_eq!(rows[0].created_at.to_rfc3339(), "2026-10-01T08:30:00+00:00");
        assert_eq!(rows[1].status, BudgetTransactionStatus::Held);
        assert_eq!(rows[1].amount, Cents(310_000));
        assert_eq!(rows[1].upstream_category, None);
        assert!(next.unwrap().contains("page%5Bafter%5D"));
    }

    #[test]
    fn rows_with_unreadable_amounts_are_dropped() {
        let page = PAGE.replace(r#""value": "3100.00""#, r#""value": "3,100.00 AUD""#);
        let (rows, _) = parse_transactions_page(&page).expect("parse");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, "txn-1");
    }
}
