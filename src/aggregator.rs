// ➕ Aggregator - per-entity sales / purchase totals
//
// Each entity's numbers come from its own file only. A purchase recorded in
// B's file is never inferred from A's sales file, so nothing is counted twice.

use crate::error::AnalysisError;
use crate::graph::{EntityGraph, Ratio, SaleDetail};
use crate::parser::{Direction, TransactionRecord};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, warn};

/// Aggregates for one entity, computed in a single pass over its records
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntityTotals {
    pub total_sales: Decimal,
    pub total_purchases: Decimal,
    pub transaction_count: u64,
    pub avg_transaction_size: Decimal,
    pub purchase_to_sales_ratio: Ratio,
    pub purchases_by_supplier: BTreeMap<String, Decimal>,
    pub sales_by_buyer: BTreeMap<String, Decimal>,
    pub sales_records: Vec<SaleDetail>,
    /// Source rows left out because adding them would overflow a total
    pub overflowed_rows: Vec<usize>,
}

/// Add `amount` to both the running total and the per-counterparty bucket,
/// or to neither when either sum would overflow.
fn accumulate(total: &mut Decimal, buckets: &mut BTreeMap<String, Decimal>, key: &str, amount: Decimal) -> bool {
    let bucket = buckets.get(key).copied().unwrap_or(Decimal::ZERO);
    match (total.checked_add(amount), bucket.checked_add(amount)) {
        (Some(new_total), Some(new_bucket)) => {
            *total = new_total;
            buckets.insert(key.to_string(), new_bucket);
            true
        }
        _ => false,
    }
}

/// Pure aggregation over one entity's records
pub fn aggregate_records(records: &[TransactionRecord]) -> EntityTotals {
    let mut totals = EntityTotals::default();

    for record in records {
        let added = match record.direction {
            Direction::Sale => accumulate(
                &mut totals.total_sales,
                &mut totals.sales_by_buyer,
                &record.counterparty_id,
                record.amount,
            ),
            Direction::Purchase => accumulate(
                &mut totals.total_purchases,
                &mut totals.purchases_by_supplier,
                &record.counterparty_id,
                record.amount,
            ),
        };
        if !added {
            totals.overflowed_rows.push(record.row_number);
            continue;
        }

        if record.direction == Direction::Sale {
            totals.sales_records.push(SaleDetail {
                buyer_pan: record.counterparty_id.clone(),
                buyer_name: record
                    .counterparty_name
                    .clone()
                    .unwrap_or_else(|| record.counterparty_id.clone()),
                amount: record.amount,
                taxpayer_type: record.taxpayer_type.clone().unwrap_or_default(),
                business_nature: record.business_nature.clone().unwrap_or_default(),
            });
        }
        totals.transaction_count += 1;
    }

    if totals.transaction_count > 0 {
        totals.avg_transaction_size = totals.total_purchases / Decimal::from(totals.transaction_count);
    }
    totals.purchase_to_sales_ratio = Ratio::compute(totals.total_purchases, totals.total_sales);

    totals
}

/// Fill aggregate fields of every node that has records.
///
/// Nodes without data keep zero aggregates. Rows dropped on overflow come
/// back as `MalformedRow` errors labelled with the entity's PAN.
pub fn apply_aggregates(
    graph: &mut EntityGraph,
    records: &HashMap<String, Vec<TransactionRecord>>,
) -> Vec<AnalysisError> {
    let mut errors = Vec::new();
    for node in graph.nodes_mut() {
        if !node.data_available {
            continue;
        }
        let Some(entity_records) = records.get(&node.id) else {
            continue;
        };

        let totals = aggregate_records(entity_records);
        for &row in &totals.overflowed_rows {
            warn!(pan = %node.id, row, "amount overflows entity totals, row skipped");
            errors.push(AnalysisError::malformed(&node.id, row, "amount overflows entity totals"));
        }
        debug!(
            pan = %node.id,
            sales = %totals.total_sales,
            purchases = %totals.total_purchases,
            count = totals.transaction_count,
            "aggregated entity"
        );

        node.total_sales = totals.total_sales;
        node.total_purchases = totals.total_purchases;
        node.transaction_count = totals.transaction_count;
        node.avg_transaction_size = totals.avg_transaction_size;
        node.purchase_to_sales_ratio = totals.purchase_to_sales_ratio;
        node.purchases_by_supplier = totals.purchases_by_supplier;
        node.sales_by_buyer = totals.sales_by_buyer;
        node.sales_records = totals.sales_records;
    }
    errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::EntityNode;

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn sale(pan: &str, amount: &str) -> TransactionRecord {
        TransactionRecord::new(Direction::Sale, pan, dec(amount)).with_name("Buyer")
    }

    fn purchase(pan: &str, amount: &str) -> TransactionRecord {
        TransactionRecord::new(Direction::Purchase, pan, dec(amount))
    }

    #[test]
    fn test_totals_and_ratio() {
        let records = vec![
            sale("BBBBB2222B", "600000"),
            sale("CCCCC3333C", "400000"),
            purchase("DDDDD4444D", "350000.50"),
            purchase("DDDDD4444D", "249999.50"),
        ];
        let totals = aggregate_records(&records);

        assert_eq!(totals.total_sales, dec("1000000"));
        assert_eq!(totals.total_purchases, dec("600000.00"));
        assert_eq!(totals.transaction_count, 4);
        assert_eq!(totals.avg_transaction_size, dec("150000"));
        assert_eq!(totals.purchase_to_sales_ratio, Ratio::Finite(dec("0.6")));
        assert_eq!(totals.purchases_by_supplier["DDDDD4444D"], dec("600000.00"));
        assert_eq!(totals.sales_records.len(), 2);
        assert_eq!(totals.sales_records[0].buyer_name, "Buyer");
        println!("✅ Test passed: {} transactions aggregated", totals.transaction_count);
    }

    #[test]
    fn test_purchases_without_sales_is_infinite() {
        let totals = aggregate_records(&[purchase("DDDDD4444D", "500")]);
        assert_eq!(totals.total_sales, Decimal::ZERO);
        assert!(totals.purchase_to_sales_ratio.is_infinite());
        assert_eq!(totals.avg_transaction_size, dec("500"));
    }

    #[test]
    fn test_empty_records() {
        let totals = aggregate_records(&[]);
        assert_eq!(totals.transaction_count, 0);
        assert_eq!(totals.avg_transaction_size, Decimal::ZERO);
        assert_eq!(totals.purchase_to_sales_ratio, Ratio::Finite(Decimal::ZERO));
    }

    #[test]
    fn test_apply_skips_missing_nodes() {
        let mut graph = EntityGraph::new();
        graph.add_node(EntityNode::new("AAAAA1111A", true));
        graph.add_node(EntityNode::new("X123456789", false));

        let mut records = HashMap::new();
        records.insert("AAAAA1111A".to_string(), vec![sale("X123456789", "10")]);
        records.insert("X123456789".to_string(), vec![sale("AAAAA1111A", "99")]);

        assert!(apply_aggregates(&mut graph, &records).is_empty());
        assert_eq!(graph.get("AAAAA1111A").unwrap().total_sales, dec("10"));
        assert_eq!(graph.get("X123456789").unwrap().total_sales, Decimal::ZERO);
    }

    #[test]
    fn test_overflowing_row_is_skipped_not_fatal() {
        let max = Decimal::MAX.to_string();
        let mut first = sale("BBBBB2222B", &max);
        first.row_number = 20;
        let mut second = sale("CCCCC3333C", &max);
        second.row_number = 21;
        let mut third = sale("CCCCC3333C", "5");
        third.row_number = 22;

        let totals = aggregate_records(&[first.clone(), second.clone(), third.clone()]);
        assert_eq!(totals.total_sales, Decimal::MAX);
        assert_eq!(totals.overflowed_rows, vec![21, 22]);
        assert_eq!(totals.transaction_count, 1);
        assert!(!totals.sales_by_buyer.contains_key("CCCCC3333C"));

        let mut graph = EntityGraph::new();
        graph.add_node(EntityNode::new("AAAAA1111A", true));
        let mut records = HashMap::new();
        records.insert("AAAAA1111A".to_string(), vec![first, second, third]);

        let errors = apply_aggregates(&mut graph, &records);
        assert_eq!(errors.len(), 2);
        assert!(matches!(&errors[0], AnalysisError::MalformedRow { row: 21, .. }));
        assert!(errors.iter().all(|e| e.is_recoverable()));
        assert_eq!(graph.get("AAAAA1111A").unwrap().total_sales, Decimal::MAX);
        println!("✅ Test passed: {} overflowing rows reported", errors.len());
    }
}
