//! Personal budget tracker: sync bank transactions, categorise, summarise by month.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Utc};
use finops_core::{BudgetTransaction, BudgetTransactionStatus, Cents};
use finops_integrations::TransactionSource;
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};
use uuid::Uuid;

/// Re-fetch this far behind the newest stored row so held transactions settle.
pub const SYNC_OVERLAP_DAYS: i64 = 3;
pub const UNCATEGORISED: &str = "uncategorised";

#[derive(Debug, Clone, Deserialize)]
struct BudgetRulesFile {
    #[allow(dead_code)]
    version: u32,
    #[serde(default)]
    categories: Vec<CategoryRuleRow>,
}

#[derive(Debug, Clone, Deserialize)]
struct CategoryRuleRow {
    name: String,
    #[serde(default)]
    monthly_limit: Option<f64>,
    #[serde(default)]
    contains_any: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CategoryRule {
    pub name: String,
    pub monthly_limit: Option<Cents>,
    pub contains_any: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BudgetRules {
    pub categories: Vec<CategoryRule>,
}

impl BudgetRules {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let file: BudgetRulesFile = serde_yaml::from_str(yaml).context("parsing budget rules")?;
        Ok(Self {
            categories: file
                .categories
                .into_iter()
                .map(|row| CategoryRule {
                    name: row.name,
                    monthly_limit: row.monthly_limit.map(Cents::from_decimal),
                    contains_any: row.contains_any.iter().map(|n| n.to_ascii_lowercase()).collect(),
                })
                .collect(),
        })
    }

    pub fn from_rules_dir(rules_dir: &Path) -> Result<Self> {
        let path = rules_dir.join("budget.yaml");
        let yaml = std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&yaml).with_context(|| format!("loading {}", path.display()))
    }

    /// First rule with a needle in the description or raw text, else the bank's own category.
    pub fn categorize(&self, txn: &BudgetTransaction) -> String {
        let haystack = format!(
            "{} {}",
            txn.description.to_ascii_lowercase(),
            txn.raw_text.as_deref().unwrap_or_default().to_ascii_lowercase()
        );
        self.categories
            .iter()
            .find(|rule| rule.contains_any.iter().any(|needle| haystack.contains(needle.as_str())))
            .map(|rule| rule.name.clone())
            .or_else(|| txn.upstream_category.clone())
            .unwrap_or_else(|| UNCATEGORISED.to_string())
    }

    pub fn limit_for(&self, category: &str) -> Option<Cents> {
        self.categories
            .iter()
            .find(|rule| rule.name == category)
            .and_then(|rule| rule.monthly_limit)
    }
}

#[async_trait]
pub trait BudgetStore: Send + Sync {
    async fn latest_created_at(&self) -> Result<Option<DateTime<Utc>>>;

    /// Insert or replace rows keyed by transaction id; returns rows written.
    async fn upsert(&self, rows: &[BudgetTransaction]) -> Result<usize>;

    async fn transactions_between(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Vec<BudgetTransaction>>;
}

#[derive(Debug, Default)]
pub struct MemoryBudgetStore {
    rows: Mutex<BTreeMap<String, BudgetTransaction>>,
}

impl MemoryBudgetStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.rows.lock().await.len()
    }

    pub async fn get(&self, id: &str) -> Option<BudgetTransaction> {
        self.rows.lock().await.get(id).cloned()
    }
}

#[async_trait]
impl BudgetStore for MemoryBudgetStore {
    async fn latest_created_at(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(self.rows.lock().await.values().map(|r| r.created_at).max())
    }

    async fn upsert(&self, rows: &[BudgetTransaction]) -> Result<usize> {
        let mut stored = self.rows.lock().await;
        for row in rows {
            stored.insert(row.id.clone(), row.clone());
        }
        Ok(rows.len())
    }

    async fn transactions_between(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Vec<BudgetTransaction>> {
        let stored = self.rows.lock().await;
        let mut out: Vec<_> = stored
            .values()
            .filter(|r| r.created_at >= start && r.created_at < end)
            .cloned()
            .collect();
        out.sort_by_key(|r| r.created_at);
        Ok(out)
    }
}

/// Postgres-backed store over the `budget_transactions` table.
#[derive(Debug, Clone)]
pub struct PgBudgetStore {
    pool: PgPool,
}

impl PgBudgetStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connections open on first use.
    pub fn connect_lazy(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect_lazy(database_url)
            .context("configuring budget database pool")?;
        Ok(Self::new(pool))
    }
}

fn status_str(status: BudgetTransactionStatus) -> &'static str {
    match status {
        BudgetTransactionStatus::Held => "HELD",
        BudgetTransactionStatus::Settled => "SETTLED",
    }
}

#[async_trait]
impl BudgetStore for PgBudgetStore {
    async fn latest_created_at(&self) -> Result<Option<DateTime<Utc>>> {
        let row = sqlx::query("SELECT MAX(created_at) AS latest FROM budget_transactions")
            .fetch_one(&self.pool)
            .await
            .context("querying latest budget transaction")?;
        Ok(row.try_get("latest")?)
    }

    async fn upsert(&self, rows: &[BudgetTransaction]) -> Result<usize> {
        let mut tx = self.pool.begin().await.context("starting budget upsert")?;
        for row in rows {
            sqlx::query(
                r#"
                INSERT INTO budget_transactions
                    (id, status, description, raw_text, amount_cents, upstream_category, category,
                     created_at, settled_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, NOW())
                ON CONFLICT (id) DO UPDATE
                   SET status = EXCLUDED.status,
                       description = EXCLUDED.description,
                       raw_text = EXCLUDED.raw_text,
                       amount_cents = EXCLUDED.amount_cents,
                       upstream_category = EXCLUDED.upstream_category,
                       category = EXCLUDED.category,
                       settled_at = EXCLUDED.settled_at,
                       updated_at = NOW()
                "#,
            )
            .bind(&row.id)
            .bind(status_str(row.status))
            .bind(&row.description)
            .bind(&row.raw_text)
            .bind(row.amount.0)
            .bind(&row.upstream_category)
            .bind(&row.category)
            .bind(row.created_at)
            .bind(row.settled_at)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("upserting budget transaction {}", row.id))?;
        }
        tx.commit().await.context("committing budget upsert")?;
        Ok(rows.len())
    }

    async fn transactions_between(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Vec<BudgetTransaction>> {
        let rows = sqlx::query(
            r#"
            SELECT id, status, description, raw_text, amount_cents, upstream_category, category,
                   created_at, settled_at
              FROM budget_transactions
             WHERE created_at >= $1 AND created_at < $2
             ORDER BY created_at
            "#,
        )
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await
        .context("querying budget transactions")?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let status: String = row.try_get("status")?;
            out.push(BudgetTransaction {
                id: row.try_get("id")?,
                status: if status == "HELD" {
                    BudgetTransactionStatus::Held
                } else {
                    BudgetTransactionStatus::Settled
                },
                description: row.try_get("description")?,
                raw_text: row.try_get("raw_text")?,
                amount: Cents(row.try_get("amount_cents")?),
                upstream_category: row.try_get("upstream_category")?,
                category: row.try_get("category")?,
                created_at: row.try_get("created_at")?,
                settled_at: row.try_get("settled_at")?,
            });
        }
        Ok(out)
    }
}

/// A calendar month in UTC, written `YYYY-MM`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BudgetMonth {
    pub year: i32,
    pub month: u32,
}

impl BudgetMonth {
    pub fn new(year: i32, month: u32) -> Option<Self> {
        (1..=12).contains(&month).then_some(Self { year, month })
    }

    pub fn containing(at: DateTime<Utc>) -> Self {
        Self {
            year: at.year(),
            month: at.month(),
        }
    }

    pub fn current() -> Self {
        Self::containing(Utc::now())
    }

    fn first_day(self) -> Option<NaiveDate> {
        NaiveDate::from_ymd_opt(self.year, self.month, 1)
    }

    /// Half-open `[start, end)` bounds of the month.
    pub fn bounds(self) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        let (next_year, next_month) = if self.month == 12 {
            (self.year + 1, 1)
        } else {
            (self.year, self.month + 1)
        };
        let start = self.first_day()?.and_hms_opt(0, 0, 0)?;
        let end = NaiveDate::from_ymd_opt(next_year, next_month, 1)?.and_hms_opt(0, 0, 0)?;
        Some((Utc.from_utc_datetime(&start), Utc.from_utc_datetime(&end)))
    }
}

impl fmt::Display for BudgetMonth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

impl FromStr for BudgetMonth {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let invalid = || format!("invalid month `{value}`; expected YYYY-MM");
        let (year, month) = value.trim().split_once('-').ok_or_else(invalid)?;
        if year.len() != 4 || month.len() != 2 {
            return Err(invalid());
        }
        let year = year.parse().map_err(|_| invalid())?;
        let month = month.parse().map_err(|_| invalid())?;
        BudgetMonth::new(year, month).ok_or_else(invalid)
    }
}

impl TryFrom<String> for BudgetMonth {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<BudgetMonth> for String {
    fn from(month: BudgetMonth) -> Self {
        month.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategorySummary {
    pub category: String,
    pub spent: Cents,
    pub transactions: usize,
    pub limit: Option<Cents>,
    pub remaining: Option<Cents>,
    pub over_budget: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetSummary {
    pub month: BudgetMonth,
    pub income: Cents,
    pub spending: Cents,
    pub net: Cents,
    pub categories: Vec<CategorySummary>,
}

/// Spending is reported as a positive amount per category, sorted largest first.
pub fn summarize(month: BudgetMonth, rules: &BudgetRules, rows: &[BudgetTransaction]) -> BudgetSummary {
    let mut income = Cents::ZERO;
    let mut per_category: BTreeMap<String, (Cents, usize)> = rules
        .categories
        .iter()
        .filter(|rule| rule.monthly_limit.is_some())
        .map(|rule| (rule.name.clone(), (Cents::ZERO, 0)))
        .collect();

    for row in rows {
        if row.amount.is_positive() {
            income += row.amount;
            continue;
        }
        if !row.amount.is_negative() {
            continue;
        }
        let category = row.category.clone().unwrap_or_else(|| rules.categorize(row));
        let slot = per_category.entry(category).or_insert((Cents::ZERO, 0));
        slot.0 += -row.amount;
        slot.1 += 1;
    }

    let spending: Cents = per_category.values().map(|(spent, _)| *spent).sum();
    let mut categories: Vec<CategorySummary> = per_category
        .into_iter()
        .map(|(category, (spent, transactions))| {
            let limit = rules.limit_for(&category);
            let remaining = limit.map(|limit| limit - spent);
            CategorySummary {
                over_budget: remaining.is_some_and(Cents::is_negative),
                category,
                spent,
                transactions,
                limit,
                remaining,
            }
        })
        .collect();
    categories.sort_by(|a, b| b.spent.cmp(&a.spent).then_with(|| a.category.cmp(&b.category)));

    BudgetSummary {
        month,
        income,
        spending,
        net: income - spending,
        categories,
    }
}

pub async fn budget_summary(store: &dyn BudgetStore, rules: &BudgetRules, month: BudgetMonth) -> Result<BudgetSummary> {
    let (start, end) = month
        .bounds()
        .with_context(|| format!("month {month} is out of range"))?;
    let rows = store.transactions_between(start, end).await?;
    Ok(summarize(month, rules, &rows))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetSyncSummary {
    pub run_id: Uuid,
    pub source: String,
    pub since: Option<DateTime<Utc>>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub fetched: usize,
    pub upserted: usize,
}

pub struct BudgetSync {
    source: Arc<dyn TransactionSource>,
    store: Arc<dyn BudgetStore>,
    rules: BudgetRules,
}

impl BudgetSync {
    pub fn new(source: Arc<dyn TransactionSource>, store: Arc<dyn BudgetStore>, rules: BudgetRules) -> Self {
        Self { source, store, rules }
    }

    pub fn rules(&self) -> &BudgetRules {
        &self.rules
    }

    pub fn store(&self) -> &dyn BudgetStore {
        self.store.as_ref()
    }

    pub async fn run_once(&self) -> Result<BudgetSyncSummary> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let since = self
            .store
            .latest_created_at()
            .await?
            .map(|latest| latest - Duration::days(SYNC_OVERLAP_DAYS));

        let mut rows = self
            .source
            .transactions_since(since)
            .await
            .with_context(|| format!("fetching transactions from {}", self.source.source_id()))?;
        for row in &mut rows {
            row.category = Some(self.rules.categorize(row));
        }
        let upserted = self.store.upsert(&rows).await.context("storing budget transactions")?;

        let summary = BudgetSyncSummary {
            run_id,
            source: self.source.source_id().to_string(),
            since,
            started_at,
            finished_at: Utc::now(),
            fetched: rows.len(),
            upserted,
        };
        info!(
            run_id = %summary.run_id,
            source = %summary.source,
            fetched = summary.fetched,
            upserted = summary.upserted,
            "budget sync finished"
        );
        Ok(summary)
    }

    pub async fn summary(&self, month: BudgetMonth) -> Result<BudgetSummary> {
        budget_summary(self.store.as_ref(), &self.rules, month).await
    }
}

/// A scheduler running `sync` on `cron`, or `None` when scheduling is disabled.
pub async fn maybe_build_scheduler(sync: Arc<BudgetSync>, enabled: bool, cron: &str) -> Result<Option<JobScheduler>> {
    if !enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(cron, move |_uuid, _l| {
        let sync = sync.clone();
        Box::pin(async move {
            if let Err(err) = sync.run_once().await {
                error!(error = %format!("{err:#}"), "scheduled budget sync failed");
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    const RULES: &str = r#"
version: 1
categories:
  - name: groceries
    monthly_limit: 500.00
    contains_any: ["Woolworths", "coles"]
  - name: transport
    monthly_limit: 120
    contains_any: ["opal"]
  - name: fun
    contains_any: ["cinema"]
"#;

    fn txn(id: &str, description: &str, cents: i64, at: &str) -> BudgetTransaction {
        BudgetTransaction {
            id: id.to_string(),
            status: BudgetTransactionStatus::Settled,
            description: description.to_string(),
            raw_text: None,
            amount: Cents(cents),
            upstream_category: None,
            category: None,
            created_at: DateTime::parse_from_rfc3339(at).unwrap().with_timezone(&Utc),
            settled_at: None,
        }
    }

    struct FixedSource {
        rows: Vec<BudgetTransaction>,
        seen_since: StdMutex<Vec<Option<DateTime<Utc>>>>,
    }

    #[async_trait]
    impl TransactionSource for FixedSource {
        fn source_id(&self) -> &'static str {
            "fixed"
        }

        async fn transactions_since(&self, since: Option<DateTime<Utc>>) -> Result<Vec<BudgetTransaction>> {
            self.seen_since.lock().unwrap().push(since);
            Ok(self.rows.clone())
        }
    }

    #[test]
    fn categorises_by_rule_then_upstream() {
        let rules = BudgetRules::from_yaml_str(RULES).expect("rules");
        assert_eq!(rules.limit_for("groceries"), Some(Cents(50_000)));

        let mut t = txn("1", "WOOLWORTHS METRO", -1_250, "2026-10-01T00:00:00Z");
        assert_eq!(rules.categorize(&t), "groceries");
        t.description = "Unknown".into();
        t.raw_text = Some("OPAL TOPUP".into());
        assert_eq!(rules.categorize(&t), "transport");
        t.raw_text = None;
        t.upstream_category = Some("takeaway".into());
        assert_eq!(rules.categorize(&t), "takeaway");
        t.upstream_category = None;
        assert_eq!(rules.categorize(&t), UNCATEGORISED);
    }

    #[test]
    fn month_parses_and_bounds_are_half_open() {
        let month: BudgetMonth = "2026-12".parse().expect("month");
        let (start, end) = month.bounds().unwrap();
        assert_eq!(start.to_rfc3339(), "2026-12-01T00:00:00+00:00");
        assert_eq!(end.to_rfc3339(), "2027-01-01T00:00:00+00:00");
        assert!("2026-13".parse::<BudgetMonth>().is_err());
        assert!("26-01".parse::<BudgetMonth>().is_err());
        assert_eq!(serde_json::to_value(month).unwrap(), "2026-12");
    }

    #[test]
    fn summary_flags_over_budget_categories() {
        let rules = BudgetRules::from_yaml_str(RULES).expect("rules");
        let rows = vec![
            txn("1", "Coles", -30_000, "2026-10-02T01:00:00Z"),
            txn("2", "Woolworths", -25_000, "2026-10-03T01:00:00Z"),
            txn("3", "Opal", -4_000, "2026-10-04T01:00:00Z"),
            txn("4", "Cinema", -2_500, "2026-10-05T01:00:00Z"),
            txn("5", "Salary", 400_000, "2026-10-06T01:00:00Z"),
        ];
        let summary = summarize(BudgetMonth::new(2026, 10).unwrap(), &rules, &rows);

        assert_eq!(summary.income, Cents(400_000));
        assert_eq!(summary.spending, Cents(61_500));
        assert_eq!(summary.net, Cents(338_500));
        let names: Vec<_> = summary.categories.iter().map(|c| c.category.as_str()).collect();
        assert_eq!(names, vec!["groceries", "transport", "fun"]);
        assert!(summary.categories[0].over_budget);
        assert_eq!(summary.categories[0].remaining, Some(Cents(-5_000)));
        assert_eq!(summary.categories[1].remaining, Some(Cents(8_000)));
        assert_eq!(summary.categories[2].limit, None);
        assert!(!summary.categories[2].over_budget);
    }

    #[tokio::test]
    async fn sync_overlaps_three_days_and_upserts() {
        let store = Arc::new(MemoryBudgetStore::new());
        let mut held = txn("t1", "Coles", -1_000, "2026-10-10T09:00:00Z");
        held.status = BudgetTransactionStatus::Held;
        store.upsert(&[held]).await.expect("seed");

        let source = Arc::new(FixedSource {
            rows: vec![
                txn("t1", "Coles", -1_000, "2026-10-10T09:00:00Z"),
                txn("t2", "Opal", -500, "2026-10-11T09:00:00Z"),
            ],
            seen_since: StdMutex::new(vec![]),
        });
        let sync = BudgetSync::new(
            source.clone(),
            store.clone(),
            BudgetRules::from_yaml_str(RULES).expect("rules"),
        );

        let summary = sync.run_once().await.expect("sync");
        assert_eq!(summary.fetched, 2);
        assert_eq!(summary.upserted, 2);
        assert_eq!(
            source.seen_since.lock().unwrap()[0].map(|s| s.to_rfc3339()),
            Some("2026-10-07T09:00:00+00:00".to_string())
        );
        assert_eq!(store.len().await, 2);
        let settled = store.get("t1").await.unwrap();
        assert_eq!(settled.status, BudgetTransactionStatus::Settled);
        assert_eq!(settled.category.as_deref(), Some("groceries"));

        let month = sync.summary(BudgetMonth::new(2026, 10).unwrap()).await.expect("summary");
        assert_eq!(month.spending, Cents(1_500));
    }

    #[tokio::test]
    async fn scheduler_is_skipped_when_disabled() {
        let sync = Arc::new(BudgetSync::new(
            Arc::new(FixedSource {
                rows: vec![],
                seen_since: StdMutex::new(vec![]),
            }),
            Arc::new(MemoryBudgetStore::new()),
            BudgetRules::default(),
        ));
        assert!(maybe_build_scheduler(sync, false, "0 0 */6 * * *").await.unwrap().is_none());
    }

    #[test]
    fn shipped_rules_file_loads() {
        let dir = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("../../rules");
        let rules = BudgetRules::from_rules_dir(&dir).expect("rules/budget.yaml");
        assert_eq!(rules.limit_for("groceries"), Some(Cents(65_000)));
        let t = txn("1", "Card purchase", -420, "2026-10-01T00:00:00Z");
        assert_eq!(rules.categorize(&BudgetTransaction { raw_text: Some("OPAL TRAVEL".into()), ..t }), "transport");
    }
}
