//! Three-way match of bank deposits, clearing-account entries and invoices.
//!
//! A deposit in the real bank account is the net of one or more gross amounts
//! staged in the clearing account, less a processor fee. Matching pairs each
//! deposit with the staged entries it settles and, where possible, the
//! invoices those entries paid.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{Duration, NaiveDate};
use finops_core::{
    AuditOutcome, BankTransactionKind, Cents, ClearingEntry, ClearingOrigin, Deposit, Invoice, InvoiceKind, InvoiceStatus,
    PaymentStatus, RecordStatus,
};
use finops_integrations::{InvoiceFilter, Ledger, NewSpend, NewTransfer};
use finops_storage::AuditLog;
use serde::{Deserialize, Serialize};
use strsim::jaro_winkler;
use tracing::{debug, info};
use uuid::Uuid;

use crate::steps::{Auditor, LedgerStep, StepExecutor, StepRecord};

/// Invoices this far before the reconciliation window can still be linked.
const INVOICE_LOOKBACK_DAYS: i64 = 90;
const SWEEP_REFERENCE_PREFIX: &str = "Clearing sweep ";

/// Reference stamped on the transfer and fee spend posted for a deposit.
pub fn sweep_reference(deposit_id: &str) -> String {
    format!("{SWEEP_REFERENCE_PREFIX}{deposit_id}")
}

/// The deposit a posted sweep belongs to, if `reference` is one of ours.
pub fn swept_deposit_id(reference: &str) -> Option<&str> {
    reference.strip_prefix(SWEEP_REFERENCE_PREFIX).filter(|id| !id.is_empty())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchConfig {
    pub fee_bps: i64,
    pub fee_fixed: Cents,
    pub lookback_days: i64,
    pub max_group_size: usize,
    pub max_candidates: usize,
    pub search_budget: usize,
    pub name_threshold: f64,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            fee_bps: 300,
            fee_fixed: Cents(30),
            lookback_days: 7,
            max_group_size: 8,
            max_candidates: 20,
            search_budget: 200_000,
            name_threshold: 0.88,
        }
    }
}

impl MatchConfig {
    pub fn tolerance(&self, gross: Cents) -> Cents {
        gross.basis_points(self.fee_bps) + self.fee_fixed
    }

    /// The implied fee when `gross` staged can settle as `deposit`.
    pub fn accepts(&self, gross: Cents, deposit: Cents) -> Option<Cents> {
        if gross == deposit {
            return Some(Cents::ZERO);
        }
        let fee = gross - deposit;
        (gross > deposit && fee <= self.tolerance(gross)).then_some(fee)
    }

    /// Largest staged sum that could still net down to `deposit`.
    fn max_gross_for(&self, deposit: Cents) -> i64 {
        let keep = 10_000 - self.fee_bps as i128;
        if keep <= 0 {
            return i64::MAX;
        }
        let bound = (deposit.0 as i128 + self.fee_fixed.0 as i128 + 1) * 10_000 / keep;
        bound.min(i64::MAX as i128) as i64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStrategy {
    ExactSingle,
    SingleWithinTolerance,
    SameDayBatch,
    SubsetSearch,
}

impl MatchStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            MatchStrategy::ExactSingle => "exact_single",
            MatchStrategy::SingleWithinTolerance => "single_within_tolerance",
            MatchStrategy::SameDayBatch => "same_day_batch",
            MatchStrategy::SubsetSearch => "subset_search",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkMethod {
    InvoiceId,
    Reference,
    ContactAmount,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvoiceLink {
    pub entry_id: String,
    pub invoice_id: String,
    pub invoice_number: Option<String>,
    pub method: LinkMethod,
    #[serde(default)]
    pub similarity: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClearingMatch {
    pub deposit: Deposit,
    pub entries: Vec<ClearingEntry>,
    pub gross: Cents,
    pub fee: Cents,
    pub fee_bps: i64,
    pub strategy: MatchStrategy,
    pub links: Vec<InvoiceLink>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationTotals {
    pub deposits: usize,
    pub matched_deposits: usize,
    pub matched_deposit_total: Cents,
    pub matched_gross_total: Cents,
    pub fee_total: Cents,
    pub unmatched_deposit_total: Cents,
    pub unmatched_entry_total: Cents,
    pub linked_invoices: usize,
    #[serde(default)]
    pub previously_swept: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationReport {
    pub matches: Vec<ClearingMatch>,
    pub unmatched_deposits: Vec<Deposit>,
    pub unmatched_entries: Vec<ClearingEntry>,
    /// Deposits an earlier run already swept. Their entries stay consumed.
    #[serde(default)]
    pub previously_swept: Vec<ClearingMatch>,
    pub totals: ReconciliationTotals,
}

#[derive(Debug, Clone, Default)]
pub struct ClearingMatcher {
    config: MatchConfig,
}

impl ClearingMatcher {
    pub fn new(config: MatchConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &MatchConfig {
        &self.config
    }

    pub fn reconcile(
        &self,
        deposits: &[Deposit],
        entries: &[ClearingEntry],
        invoices: &[Invoice],
    ) -> ReconciliationReport {
        self.reconcile_excluding(deposits, entries, invoices, &HashSet::new())
    }

    /// Like [`reconcile`](Self::reconcile), but deposits in `swept` are replayed
    /// without linking so they claim the same entries an earlier run posted.
    pub fn reconcile_excluding(
        &self,
        deposits: &[Deposit],
        entries: &[ClearingEntry],
        invoices: &[Invoice],
        swept: &HashSet<String>,
    ) -> ReconciliationReport {
        let mut ordered: Vec<&Deposit> = deposits.iter().collect();
        ordered.sort_by(|a, b| a.date.cmp(&b.date).then_with(|| a.id.cmp(&b.id)));

        let mut used = vec![false; entries.len()];
        let mut linked: HashSet<String> = HashSet::new();
        let mut report = ReconciliationReport::default();

        for deposit in ordered {
            let candidates = self.candidates(deposit, entries, &used);
            let was_swept = swept.contains(&deposit.id);
            let Some((picked, strategy)) = self.find_group(deposit, entries, &candidates) else {
                if was_swept {
                    debug!(deposit = %deposit.id, "swept deposit no longer matches staged entries");
                } else {
                    debug!(deposit = %deposit.id, candidates = candidates.len(), "deposit left unmatched");
                    report.unmatched_deposits.push(deposit.clone());
                }
                continue;
            };

            let group: Vec<ClearingEntry> = picked.iter().map(|&i| entries[i].clone()).collect();
            for &i in &picked {
                used[i] = true;
            }
            let gross: Cents = group.iter().map(|e| e.gross).sum();
            let fee = gross - deposit.amount;
            let links = if was_swept {
                Vec::new()
            } else {
                group
                    .iter()
                    .filter_map(|entry| self.link_invoice(entry, invoices, &mut linked))
                    .collect()
            };
            let matched = ClearingMatch {
                deposit: deposit.clone(),
                entries: group,
                gross,
                fee,
                fee_bps: fee.ratio_bps(gross),
                strategy,
                links,
            };
            if was_swept {
                report.previously_swept.push(matched);
            } else {
                report.matches.push(matched);
            }
        }

        report.unmatched_entries = entries
            .iter()
            .zip(&used)
            .filter(|(_, used)| !**used)
            .map(|(entry, _)| entry.clone())
            .collect();
        let open_deposits = deposits.iter().filter(|d| !swept.contains(&d.id)).count();
        report.totals = totals(open_deposits, &report);
        report
    }

    /// Every unused entry inside the lookback window, closest dates first.
    fn candidates(&self, deposit: &Deposit, entries: &[ClearingEntry], used: &[bool]) -> Vec<usize> {
        let earliest = deposit.date - Duration::days(self.config.lookback_days);
        let mut out: Vec<usize> = entries
            .iter()
            .enumerate()
            .filter(|(i, e)| !used[*i] && e.gross.is_positive() && e.date >= earliest && e.date <= deposit.date)
            .map(|(i, _)| i)
            .collect();
        out.sort_by(|&a, &b| {
            entries[b]
                .date
                .cmp(&entries[a].date)
                .then_with(|| entries[a].id.cmp(&entries[b].id))
        });
        out
    }

    fn find_group(
        &self,
        deposit: &Deposit,
        entries: &[ClearingEntry],
        candidates: &[usize],
    ) -> Option<(Vec<usize>, MatchStrategy)> {
        if let Some(&i) = candidates.iter().find(|&&i| entries[i].gross == deposit.amount) {
            return Some((vec![i], MatchStrategy::ExactSingle));
        }

        if let Some((i, _)) = candidates
            .iter()
            .filter_map(|&i| self.config.accepts(entries[i].gross, deposit.amount).map(|fee| (i, fee)))
            .min_by_key(|(_, fee)| *fee)
        {
            return Some((vec![i], MatchStrategy::SingleWithinTolerance));
        }

        let mut by_day: BTreeMap<NaiveDate, Vec<usize>> = BTreeMap::new();
        for &i in candidates {
            by_day.entry(entries[i].date).or_default().push(i);
        }
        for group in by_day.values().rev().filter(|g| g.len() > 1) {
            let gross: Cents = group.iter().map(|&i| entries[i].gross).sum();
            if self.config.accepts(gross, deposit.amount).is_some() {
                return Some((group.clone(), MatchStrategy::SameDayBatch));
            }
        }

        let nearest = &candidates[..candidates.len().min(self.config.max_candidates)];
        self.subset_search(deposit, entries, nearest)
            .map(|group| (group, MatchStrategy::SubsetSearch))
    }

    /// Depth-first search over candidate subsets of size 2..=max_group_size.
    /// Minimises the fee, then the group size, within a fixed node budget.
    fn subset_search(&self, deposit: &Deposit, entries: &[ClearingEntry], candidates: &[usize]) -> Option<Vec<usize>> {
        let mut items: Vec<(usize, i64)> = candidates.iter().map(|&i| (i, entries[i].gross.0)).collect();
        items.sort_by(|a, b| b.1.cmp(&a.1));

        let mut suffix = vec![0i64; items.len() + 1];
        for k in (0..items.len()).rev() {
            suffix[k] = suffix[k + 1] + items[k].1;
        }

        let mut search = SubsetSearch {
            config: &self.config,
            items: &items,
            suffix: &suffix,
            target: deposit.amount.0,
            ceiling: self.config.max_gross_for(deposit.amount),
            nodes: 0,
            stack: Vec::new(),
            best: None,
        };
        search.descend(0, 0);
        if search.nodes >= self.config.search_budget {
            debug!(deposit = %deposit.id, nodes = search.nodes, "subset search budget exhausted");
        }
        search.best.map(|(_, group)| group)
    }

    fn link_invoice(
        &self,
        entry: &ClearingEntry,
        invoices: &[Invoice],
        linked: &mut HashSet<String>,
    ) -> Option<InvoiceLink> {
        if let Some(invoice_id) = &entry.invoice_id {
            let number = invoices
                .iter()
                .find(|inv| &inv.id == invoice_id)
                .and_then(|inv| inv.number.clone());
            linked.insert(invoice_id.clone());
            return Some(InvoiceLink {
                entry_id: entry.id.clone(),
                invoice_id: invoice_id.clone(),
                invoice_number: number,
                method: LinkMethod::InvoiceId,
                similarity: None,
            });
        }

        if let Some(reference) = entry.reference.as_deref().map(str::trim).filter(|r| !r.is_empty()) {
            let found = invoices.iter().filter(|inv| !linked.contains(&inv.id)).find(|inv| {
                inv.number
                    .as_deref()
                    .is_some_and(|number| number.trim().eq_ignore_ascii_case(reference))
            });
            if let Some(invoice) = found {
                let link = InvoiceLink {
                    entry_id: entry.id.clone(),
                    invoice_id: invoice.id.clone(),
                    invoice_number: invoice.number.clone(),
                    method: LinkMethod::Reference,
                    similarity: None,
                };
                linked.insert(invoice.id.clone());
                return Some(link);
            }
        }

        let contact = normalize_name(entry.contact_name.as_deref()?);
        if contact.is_empty() {
            return None;
        }
        let hits: Vec<(&Invoice, f64)> = invoices
            .iter()
            .filter(|inv| !linked.contains(&inv.id))
            .filter(|inv| inv.amount_due == entry.gross || inv.total == entry.gross)
            .filter_map(|inv| {
                let name = normalize_name(inv.contact_name.as_deref()?);
                let score = jaro_winkler(&contact, &name);
                (score >= self.config.name_threshold).then_some((inv, score))
            })
            .collect();
        match hits.as_slice() {
            [(invoice, score)] => {
                let link = InvoiceLink {
                    entry_id: entry.id.clone(),
                    invoice_id: invoice.id.clone(),
                    invoice_number: invoice.number.clone(),
                    method: LinkMethod::ContactAmount,
                    similarity: Some(*score),
                };
                linked.insert(invoice.id.clone());
                Some(link)
            }
            [] => None,
            _ => {
                debug!(entry = %entry.id, hits = hits.len(), "ambiguous invoice link left open");
                None
            }
        }
    }
}

struct SubsetSearch<'a> {
    config: &'a MatchConfig,
    items: &'a [(usize, i64)],
    suffix: &'a [i64],
    target: i64,
    ceiling: i64,
    nodes: usize,
    stack: Vec<usize>,
    best: Option<((i64, usize), Vec<usize>)>,
}

impl SubsetSearch<'_> {
    fn descend(&mut self, from: usize, sum: i64) {
        if self.nodes >= self.config.search_budget {
            return;
        }
        self.nodes += 1;

        if self.stack.len() >= 2 {
            if let Some(fee) = self.config.accepts(Cents(sum), Cents(self.target)) {
                let key = (fee.0, self.stack.len());
                if self.best.as_ref().map_or(true, |(best, _)| key < *best) {
                    let group = self.stack.iter().map(|&k| self.items[k].0).collect();
                    self.best = Some((key, group));
                }
            }
        }
        if self.stack.len() >= self.config.max_group_size || self.is_optimal() {
            return;
        }

        for k in from..self.items.len() {
            let next = sum + self.items[k].1;
            if next > self.ceiling {
                continue;
            }
            if sum + self.suffix[k] < self.target {
                break;
            }
            self.stack.push(k);
            self.descend(k + 1, next);
            self.stack.pop();
            if self.is_optimal() {
                return;
            }
        }
    }

    fn is_optimal(&self) -> bool {
        matches!(self.best, Some(((0, 2), _)))
    }
}

fn normalize_name(name: &str) -> String {
    name.split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

fn totals(deposit_count: usize, report: &ReconciliationReport) -> ReconciliationTotals {
    ReconciliationTotals {
        deposits: deposit_count,
        matched_deposits: report.matches.len(),
        matched_deposit_total: report.matches.iter().map(|m| m.deposit.amount).sum(),
        matched_gross_total: report.matches.iter().map(|m| m.gross).sum(),
        fee_total: report.matches.iter().map(|m| m.fee).sum(),
        unmatched_deposit_total: report.unmatched_deposits.iter().map(|d| d.amount).sum(),
        unmatched_entry_total: report.unmatched_entries.iter().map(|e| e.gross).sum(),
        linked_invoices: report.matches.iter().map(|m| m.links.len()).sum(),
        previously_swept: report.previously_swept.len(),
    }
}

/// Which accounts a reconciliation sweeps between and where fees land.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClearingAccounts {
    pub bank_account_id: String,
    pub clearing_account_id: String,
    pub fee_account_code: String,
    pub fee_contact_name: String,
}

/// Transfer the deposit out of clearing, then book any fee as a spend.
pub fn postings_for(accounts: &ClearingAccounts, matched: &ClearingMatch) -> Vec<LedgerStep> {
    let reference = Some(sweep_reference(&matched.deposit.id));
    let mut steps = vec![LedgerStep::CreateTransfer {
        transfer: NewTransfer {
            from_account_id: accounts.clearing_account_id.clone(),
            to_account_id: accounts.bank_account_id.clone(),
            amount: matched.deposit.amount,
            date: matched.deposit.date,
            reference: reference.clone(),
        },
    }];
    if matched.fee.is_positive() {
        steps.push(LedgerStep::CreateSpend {
            spend: NewSpend {
                account_id: accounts.clearing_account_id.clone(),
                contact_name: accounts.fee_contact_name.clone(),
                expense_account_code: accounts.fee_account_code.clone(),
                amount: matched.fee,
                date: matched.deposit.date,
                description: format!(
                    "Processing fees on {} ({} entries)",
                    matched.gross,
                    matched.entries.len()
                ),
                reference,
            },
        });
    }
    steps
}

#[derive(Debug, Clone, Default)]
pub struct ClearingInputs {
    pub deposits: Vec<Deposit>,
    pub entries: Vec<ClearingEntry>,
    pub invoices: Vec<Invoice>,
    /// Deposits whose sweep transfer is already on the clearing account.
    pub swept: HashSet<String>,
    /// Deposits whose fee spend is already on the clearing account.
    pub fees_booked: HashSet<String>,
}

/// Pull unreconciled bank deposits, staged clearing entries and open receivables.
pub async fn gather_inputs(
    ledger: &dyn Ledger,
    accounts: &ClearingAccounts,
    from: NaiveDate,
    to: NaiveDate,
    lookback_days: i64,
) -> Result<ClearingInputs> {
    let deposits = ledger
        .list_bank_transactions(&accounts.bank_account_id, Some(from), Some(to))
        .await
        .context("listing bank account deposits")?
        .into_iter()
        .filter(|t| {
            t.kind == BankTransactionKind::Receive
                && t.status == RecordStatus::Authorised
                && !t.is_reconciled
                && t.total.is_positive()
        })
        .map(|t| Deposit {
            id: t.id,
            date: t.date,
            amount: t.total,
            description: t.reference.or(t.contact_name),
        })
        .collect::<Vec<_>>();

    let staged_from = from - Duration::days(lookback_days);
    let clearing_txns = ledger
        .list_bank_transactions(&accounts.clearing_account_id, Some(staged_from), Some(to))
        .await
        .context("listing clearing account transactions")?;

    let mut swept = HashSet::new();
    let mut fees_booked = HashSet::new();
    for txn in clearing_txns.iter().filter(|t| t.status == RecordStatus::Authorised) {
        let Some(deposit_id) = txn.reference.as_deref().and_then(swept_deposit_id) else {
            continue;
        };
        match txn.kind {
            BankTransactionKind::SpendTransfer => {
                swept.insert(deposit_id.to_string());
            }
            BankTransactionKind::Spend => {
                fees_booked.insert(deposit_id.to_string());
            }
            _ => {}
        }
    }

    let mut entries: Vec<ClearingEntry> = clearing_txns
        .into_iter()
        .filter(|t| t.kind == BankTransactionKind::Receive && t.status == RecordStatus::Authorised && !t.is_reconciled)
        .map(|t| ClearingEntry {
            id: t.id,
            date: t.date,
            gross: t.total,
            contact_name: t.contact_name,
            reference: t.reference,
            invoice_id: None,
            origin: ClearingOrigin::BankTransaction,
        })
        .collect();

    let payments = ledger
        .list_payments(Some(&accounts.clearing_account_id))
        .await
        .context("listing clearing account payments")?;
    entries.extend(
        payments
            .into_iter()
            .filter(|p| {
                p.status == PaymentStatus::Authorised && !p.is_reconciled && p.date >= staged_from && p.date <= to
            })
            .map(|p| ClearingEntry {
                id: p.id,
                date: p.date,
                gross: p.amount,
                contact_name: p.contact_name,
                reference: p.reference,
                invoice_id: p.invoice_id,
                origin: ClearingOrigin::Payment,
            }),
    );

    let invoices = ledger
        .list_invoices(&InvoiceFilter {
            statuses: vec![InvoiceStatus::Authorised, InvoiceStatus::Paid],
            kind: Some(InvoiceKind::Receivable),
            from: Some(from - Duration::days(INVOICE_LOOKBACK_DAYS)),
            to: Some(to),
            ..Default::default()
        })
        .await
        .context("listing receivable invoices")?;

    info!(
        deposits = deposits.len(),
        entries = entries.len(),
        invoices = invoices.len(),
        swept = swept.len(),
        "gathered clearing inputs"
    );
    Ok(ClearingInputs {
        deposits,
        entries,
        invoices,
        swept,
        fees_booked,
    })
}

fn default_dry_run() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClearingRequest {
    pub bank_account_id: String,
    pub clearing_account_id: String,
    #[serde(default)]
    pub fee_account_code: Option<String>,
    #[serde(default)]
    pub fee_contact_name: Option<String>,
    pub from: NaiveDate,
    pub to: NaiveDate,
    #[serde(default = "default_dry_run")]
    pub dry_run: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClearingOutcome {
    pub run_id: Uuid,
    pub dry_run: bool,
    pub accounts: ClearingAccounts,
    pub from: NaiveDate,
    pub to: NaiveDate,
    pub report: ReconciliationReport,
    pub postings: Vec<StepRecord>,
    pub stopped_early: bool,
    #[serde(default)]
    pub report_dir: Option<String>,
}

/// Match the window and post (or, on a dry run, plan) the sweeps and fees.
pub async fn run_clearing(
    ledger: &dyn Ledger,
    audit: Arc<AuditLog>,
    matcher: &ClearingMatcher,
    accounts: ClearingAccounts,
    from: NaiveDate,
    to: NaiveDate,
    dry_run: bool,
) -> Result<ClearingOutcome> {
    let auditor = Auditor::new(audit, "clearing_reconciliation", dry_run);
    let inputs = gather_inputs(ledger, &accounts, from, to, matcher.config().lookback_days).await?;
    let report = matcher.reconcile_excluding(&inputs.deposits, &inputs.entries, &inputs.invoices, &inputs.swept);
    info!(
        run_id = %auditor.run_id(),
        matched = report.totals.matched_deposits,
        previously_swept = report.totals.previously_swept,
        unmatched_deposits = report.unmatched_deposits.len(),
        fees = %report.totals.fee_total,
        "clearing match complete"
    );
    auditor
        .record(
            &accounts.bank_account_id,
            "match",
            if dry_run { AuditOutcome::Planned } else { AuditOutcome::Succeeded },
            serde_json::to_value(&report.totals)?,
        )
        .await?;

    let mut steps: Vec<LedgerStep> = report.matches.iter().flat_map(|m| postings_for(&accounts, m)).collect();
    // A sweep whose fee spend never landed only needs the fee.
    steps.extend(
        report
            .previously_swept
            .iter()
            .filter(|m| m.fee.is_positive() && !inputs.fees_booked.contains(&m.deposit.id))
            .flat_map(|m| postings_for(&accounts, m))
            .filter(|step| matches!(step, LedgerStep::CreateSpend { .. })),
    );
    let (postings, stopped_early) = StepExecutor::new(ledger, &auditor).run_all(steps).await?;
    Ok(ClearingOutcome {
        run_id: auditor.run_id(),
        dry_run,
        accounts,
        from,
        to,
        report,
        postings,
        stopped_early,
        report_dir: None,
    })
}
