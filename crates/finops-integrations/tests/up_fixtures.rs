use std::path::PathBuf;

use finops_core::{BudgetTransactionStatus, Cents};
use finops_integrations::up::parse_transactions_page;

fn fixture(name: &str) -> String {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/up").join(name);
    std::fs::read_to_string(&path).unwrap_or_else(|e| panic!("reading {}: {e}", path.display()))
}

#[test]
fn transactions_page_maps_amounts_status_and_next_link() {
    let (rows, next) = parse_transactions_page(&fixture("transactions_page.json")).expect("parse page");
    assert_eq!(rows.len(), 3);
    assert!(next.unwrap().contains("page%5Bafter%5D"));

    let groceries = &rows[0];
    assert_eq!(groceries.amount, Cents(-8_435));
    assert_eq!(groceries.status, BudgetTransactionStatus::Settled);
    assert_eq!(groceries.upstream_category.as_deref(), Some("groceries"));
    assert_eq!(groceries.raw_text.as_deref(), Some("WOOLWORTHS 1234 SYDNEY"));

    let held = &rows[1];
    assert_eq!(held.status, BudgetTransactionStatus::Held);
    assert_eq!(held.amount, Cents(-420));
    assert_eq!(held.upstream_category, None);
    assert!(held.settled_at.is_none());

    assert_eq!(rows[2].amount, Cents(325_000));
}
